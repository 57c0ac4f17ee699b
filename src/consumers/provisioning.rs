use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use lapin::{message::Delivery, options::BasicAckOptions};
use tracing::{error, info};

use crate::{app_state::AppState, events::OrderPaidEvent, provisioning};

/// Provisions the order behind a `provisioning.order_paid` event. A failure
/// of the dispatch as a whole escalates the order instead of redelivering.
pub fn order_paid(delivery: Delivery, state: Arc<AppState>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let conn = &mut state.db_pool.get().await?;
        let payload: OrderPaidEvent = serde_json::from_str(str::from_utf8(&delivery.data)?)?;
        info!("Received event: {:?}", payload);

        let converter = state.converter();
        match state.provisioner(&converter).provision_order(conn, payload.order_id).await {
            Ok(Some(report)) => info!(
                order_id = payload.order_id,
                successful = report.successful.len(),
                failed = report.failed.len(),
                status = report.order_status(),
                "Order #{} has been provisioned",
                payload.order_id
            ),
            Ok(None) => info!(order_id = payload.order_id, "Nothing to provision"),
            Err(err) => {
                error!(order_id = payload.order_id, payment_id = payload.payment_id, error = ?err, "Provisioning dispatch failed");
                provisioning::escalate(conn, payload.order_id, &err.to_string()).await?;
            }
        }

        delivery.ack(BasicAckOptions::default()).await?;

        Ok(())
    })
}
