pub mod currencies;
pub mod failed_registrations;
