pub mod api;
pub mod app_error;
pub mod app_state;
pub mod bootstrap;
pub mod checkout;
pub mod config;
pub mod consumers;
pub mod currency;
pub mod db;
pub mod events;
pub mod middleware;
pub mod models;
pub mod outbox;
pub mod payments;
pub mod pricing;
pub mod provisioning;
pub mod reconciliation;
pub mod recovery;
pub mod routes;
pub mod schema;
pub mod swagger;
