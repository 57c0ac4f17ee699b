use serde::{Deserialize, Serialize};

pub const ORDER_PAID: &str = "provisioning.order_paid";
pub const RETRY_REGISTRATION: &str = "recovery.retry_registration";
pub const ADMIN_NOTIFICATION: &str = "notifications.admin";

/// Every queue the outbox relay publishes to.
pub const QUEUES: [&str; 3] = [ORDER_PAID, RETRY_REGISTRATION, ADMIN_NOTIFICATION];

/// Emitted exactly once per order, by whichever reconciliation path flipped it to paid.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OrderPaidEvent {
    pub order_id: i32,
    pub payment_id: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RetryRegistrationEvent {
    pub failed_registration_id: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdminNotificationKind {
    RegistrationFailed,
    RegistrationAbandoned,
    CriticalProvisioningFailure,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AdminNotificationEvent {
    pub kind: AdminNotificationKind,
    pub order_id: i32,
    pub subject: String,
    pub message: String,
}
