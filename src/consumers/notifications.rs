use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;
use lapin::{message::Delivery, options::BasicAckOptions};
use tracing::{error, warn};

use crate::{
    app_state::AppState,
    events::{AdminNotificationEvent, AdminNotificationKind},
};

/// Delivers admin notifications. There is no mail transport; the
/// notification is logged against the configured admin address.
pub fn admin_notification(delivery: Delivery, state: Arc<AppState>) -> BoxFuture<'static, Result<()>> {
    Box::pin(async move {
        let payload: AdminNotificationEvent = serde_json::from_str(str::from_utf8(&delivery.data)?)?;

        let to = state.config.admin_email.as_str();
        match payload.kind {
            AdminNotificationKind::CriticalProvisioningFailure => error!(
                to,
                order_id = payload.order_id,
                subject = payload.subject,
                message = payload.message,
                "Admin notification"
            ),
            AdminNotificationKind::RegistrationFailed | AdminNotificationKind::RegistrationAbandoned => warn!(
                to,
                order_id = payload.order_id,
                subject = payload.subject,
                message = payload.message,
                "Admin notification"
            ),
        }

        delivery.ack(BasicAckOptions::default()).await?;

        Ok(())
    })
}
