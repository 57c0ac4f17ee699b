pub mod notifications;
pub mod provisioning;
pub mod recovery;
