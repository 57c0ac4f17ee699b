use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::Router;
use futures::future::BoxFuture;
use futures_lite::StreamExt;
use lapin::{
    Channel, Connection, ConnectionProperties, Consumer,
    message::Delivery,
    options::{BasicConsumeOptions, BasicNackOptions, QueueDeclareOptions},
    types::FieldTable,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{app_state::AppState, config, events, outbox, recovery};

pub type ConsumerFn = fn(Delivery, Arc<AppState>) -> BoxFuture<'static, Result<()>>;

const OUTBOX_INTERVAL: Duration = Duration::from_millis(500);

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

pub fn init_env() {
    match dotenvy::dotenv() {
        Ok(path) => debug!(path = %path.display(), "Loaded environment file"),
        Err(err) => debug!(error = %err, "No environment file loaded"),
    }
}

async fn declare_queue(channel: &Channel, queue: &str) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .with_context(|| format!("Failed to declare queue {queue}"))?;
    Ok(())
}

/// Connects to the database and the broker, starts the background workers
/// and serves the app until the listener fails.
pub async fn bootstrap(name: &str, app: Router<AppState>, consumers: &[(&str, ConsumerFn)]) -> Result<()> {
    let config = config::load()?;
    let port = config.server.port;
    let amqp_url = config.amqp.url.clone();
    let recovery_config = config.recovery.clone();

    let state = AppState::new(config).await?;

    let connection = Connection::connect(&amqp_url, ConnectionProperties::default())
        .await
        .context("Failed to connect to RabbitMQ")?;

    let publisher = connection
        .create_channel()
        .await
        .context("Failed to open the outbox channel")?;
    for queue in events::QUEUES {
        declare_queue(&publisher, queue).await?;
    }
    tokio::spawn(outbox::relay(state.db_pool.clone(), publisher, OUTBOX_INTERVAL));

    let shared = Arc::new(state.clone());
    for (queue, handler) in consumers {
        let channel = connection
            .create_channel()
            .await
            .context("Failed to open a consumer channel")?;
        declare_queue(&channel, queue).await?;

        let consumer = channel
            .basic_consume(
                queue,
                &format!("{name}.{queue}"),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to consume {queue}"))?;

        info!(queue, "Consumer started");
        tokio::spawn(consume(queue.to_string(), consumer, *handler, shared.clone()));
    }

    tokio::spawn(recovery::run_scheduler(state.db_pool.clone(), recovery_config));

    let app = app.layer(TraceLayer::new_for_http()).with_state(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    info!("{name} listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}

async fn consume(queue: String, mut consumer: Consumer, handler: ConsumerFn, state: Arc<AppState>) {
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(queue, error = ?err, "Failed to receive delivery");
                continue;
            }
        };

        let acker = delivery.acker.clone();
        if let Err(err) = handler(delivery, state.clone()).await {
            error!(queue, error = ?err, "Consumer failed");
            if let Err(err) = acker.nack(BasicNackOptions::default()).await {
                warn!(queue, error = ?err, "Failed to nack delivery");
            }
        }
    }
    warn!(queue, "Consumer stream ended");
}
