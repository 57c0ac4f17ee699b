pub mod admin;
pub mod customers;
pub mod webhooks;
