use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;

use crate::{
    api::{ApiUrls, kpay::KPayClient, registrars::Registrars, stripe::StripeClient},
    config::AppConfig,
    currency::{
        CurrencyConverter, ExchangeRateProvider, PgCurrencyTable, cache::RateCache, client::ExchangeRateClient,
        provider::PgRateStore,
    },
    db::{self, DbPool},
    provisioning::Provisioner,
};

/// Shared handles passed to every route and consumer.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: DbPool,
    pub http_client: Client,
    pub config: Arc<AppConfig>,
    pub rate_cache: Arc<RateCache>,
    pub registrars: Arc<Registrars>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let db_pool = db::create_pool(&config.database.url).await?;
        let http_client = Client::builder()
            .build()
            .context("Failed to build the HTTP client")?;
        let registrars = Registrars::from_urls(http_client.clone(), &ApiUrls::init());

        Ok(Self::from_parts(config, db_pool, http_client, registrars))
    }

    pub fn from_parts(config: AppConfig, db_pool: DbPool, http_client: Client, registrars: Registrars) -> Self {
        Self {
            rate_cache: Arc::new(RateCache::new(config.currency.cache_ttl)),
            config: Arc::new(config),
            db_pool,
            http_client,
            registrars: Arc::new(registrars),
        }
    }

    /// A converter scoped to one request or job. Its request-level rate cache
    /// dies with it; the TTL cache is shared process-wide.
    pub fn converter(&self) -> CurrencyConverter<PgCurrencyTable> {
        let currency = &self.config.currency;
        let client = ExchangeRateClient::new(self.http_client.clone(), currency);
        let provider = ExchangeRateProvider::new(currency.clone(), client, self.rate_cache.clone())
            .with_store(Arc::new(PgRateStore::new(self.db_pool.clone())));

        CurrencyConverter::new(provider, PgCurrencyTable::new(self.db_pool.clone()), currency.staleness)
    }

    pub fn stripe(&self) -> StripeClient {
        StripeClient::new(self.http_client.clone(), self.config.stripe.clone())
    }

    pub fn kpay(&self) -> KPayClient {
        KPayClient::new(self.http_client.clone(), self.config.kpay.clone())
    }

    pub fn provisioner<'a>(&'a self, converter: &'a CurrencyConverter<PgCurrencyTable>) -> Provisioner<'a> {
        Provisioner {
            registrars: &self.registrars,
            converter,
            recovery: &self.config.recovery,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::registrars::{RegistrarKind, tests::ScriptedRegistrar};

    /// State backed by a pool that never connects, for handlers that fail before touching the database.
    pub fn offline_state(config: AppConfig) -> AppState {
        let pool = db::create_lazy_pool(&config.database.url);
        let unavailable = || Err(crate::api::registrars::RegistrarError::Unreachable("test".into()));
        let registrars = Registrars::new(
            Arc::new(ScriptedRegistrar::new(RegistrarKind::Namecheap, unavailable())),
            Arc::new(ScriptedRegistrar::new(RegistrarKind::Epp, unavailable())),
        );
        AppState::from_parts(config, pool, Client::new(), registrars)
    }

    #[tokio::test]
    async fn gateway_clients_use_the_configured_sections() {
        let state = offline_state(AppConfig::sample());
        assert_eq!(state.stripe().config().secret_key.as_deref(), Some("sk_test"));
        assert_eq!(state.kpay().status_codes(), &state.config.kpay.status_codes);
    }
}
