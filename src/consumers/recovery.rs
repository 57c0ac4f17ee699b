use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use lapin::{message::Delivery, options::BasicAckOptions};
use tracing::info;

use crate::{app_state::AppState, events::RetryRegistrationEvent, recovery};

/// One automatic retry of a failed registration.
pub fn retry_registration(delivery: Delivery, state: Arc<AppState>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let conn = &mut state.db_pool.get().await?;
        let payload: RetryRegistrationEvent = serde_json::from_str(str::from_utf8(&delivery.data)?)?;
        info!("Received event: {:?}", payload);

        let outcome = recovery::retry_registration(
            conn,
            &state.registrars,
            &state.config.recovery,
            payload.failed_registration_id,
        )
        .await?;
        info!(
            failed_registration_id = payload.failed_registration_id,
            ?outcome,
            "Registration retry finished"
        );

        delivery.ack(BasicAckOptions::default()).await?;

        Ok(())
    })
}
