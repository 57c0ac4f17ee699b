use std::time::Duration;

use anyhow::{Context, Result};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use lapin::{BasicProperties, Channel, options::BasicPublishOptions};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    db::DbPool,
    models::{CreateOutboxEntity, OutboxEntity},
    schema::outbox,
};

const BATCH_SIZE: i64 = 100;

/// Stages an event in the outbox. Call it inside the transaction that
/// produced the state change so both commit or neither does.
pub async fn publish<T: Serialize>(
    conn: &mut AsyncPgConnection,
    event_type: String,
    payload: T,
) -> Result<()> {
    let payload = serde_json::to_string(&payload).context("Failed to serialize event")?;

    diesel::insert_into(outbox::table)
        .values(CreateOutboxEntity {
            event_type,
            payload,
            status: "PENDING".into(),
        })
        .execute(conn)
        .await
        .context("Failed to insert outbox event")?;

    Ok(())
}

/// Forwards pending outbox rows to the queue named by their event type.
pub async fn relay(pool: DbPool, channel: Channel, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match relay_batch(&pool, &channel).await {
            Ok(0) => {}
            Ok(sent) => info!(sent, "Relayed outbox events"),
            Err(err) => warn!(error = ?err, "Outbox relay failed"),
        }
    }
}

async fn relay_batch(pool: &DbPool, channel: &Channel) -> Result<usize> {
    let conn = &mut pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    // Rows stay locked until they are marked SENT, so a second relay skips them.
    conn.transaction(|conn| {
        Box::pin(async move {
            let pending: Vec<OutboxEntity> = outbox::table
                .filter(outbox::status.eq("PENDING"))
                .order_by(outbox::id.asc())
                .limit(BATCH_SIZE)
                .for_update()
                .skip_locked()
                .select(OutboxEntity::as_select())
                .get_results(conn)
                .await
                .context("Failed to get pending outbox events")?;

            let mut sent = 0;
            for event in pending {
                channel
                    .basic_publish(
                        "",
                        &event.event_type,
                        BasicPublishOptions::default(),
                        event.payload.as_bytes(),
                        BasicProperties::default().with_delivery_mode(2),
                    )
                    .await
                    .context("Failed to publish outbox event")?
                    .await
                    .context("Broker did not confirm outbox event")?;

                diesel::update(outbox::table.find(event.id))
                    .set(outbox::status.eq("SENT"))
                    .execute(conn)
                    .await
                    .context("Failed to mark outbox event as sent")?;

                sent += 1;
            }

            Ok::<usize, anyhow::Error>(sent)
        })
    })
    .await
}
