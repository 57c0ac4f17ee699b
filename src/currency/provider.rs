use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::{
    config::CurrencyConfig,
    currency::{
        CurrencyError, RWF, USD,
        cache::{CachedRate, RateCache, RequestRates, cache_key},
        client::ExchangeRateClient,
        normalize_code,
    },
    db::DbPool,
    models::{CachedRateEntity, UpsertCachedRateEntity},
    schema::exchange_rate_cache,
};

/// Persistent layer behind the in-process caches.
#[async_trait]
pub trait RateStore: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Option<CachedRate>>;
    async fn save(&self, key: &str, rate: CachedRate, ttl: std::time::Duration) -> Result<()>;
}

pub struct PgRateStore {
    pool: DbPool,
}

impl PgRateStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateStore for PgRateStore {
    async fn fetch(&self, key: &str) -> Result<Option<CachedRate>> {
        let conn = &mut self
            .pool
            .get()
            .await
            .context("Failed to obtain a DB connection pool")?;

        let cached: Option<CachedRateEntity> = exchange_rate_cache::table
            .find(key)
            .filter(exchange_rate_cache::expires_at.gt(Utc::now()))
            .select(CachedRateEntity::as_select())
            .first(conn)
            .await
            .optional()
            .context("Failed to read exchange rate cache")?;

        Ok(cached.map(|row| CachedRate {
            rate: row.rate,
            is_fallback: row.is_fallback,
        }))
    }

    async fn save(&self, key: &str, rate: CachedRate, ttl: std::time::Duration) -> Result<()> {
        let conn = &mut self
            .pool
            .get()
            .await
            .context("Failed to obtain a DB connection pool")?;

        let row = UpsertCachedRateEntity {
            cache_key: key.to_string(),
            rate: rate.rate,
            is_fallback: rate.is_fallback,
            expires_at: Utc::now() + TimeDelta::from_std(ttl).unwrap_or(TimeDelta::hours(1)),
        };

        diesel::insert_into(exchange_rate_cache::table)
            .values(&row)
            .on_conflict(exchange_rate_cache::cache_key)
            .do_update()
            .set(&row)
            .execute(conn)
            .await
            .context("Failed to write exchange rate cache")?;

        Ok(())
    }
}

/// Where a quoted rate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateSource {
    Identity,
    RequestCache,
    SharedCache,
    PersistentCache,
    Api,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuote {
    pub rate: Decimal,
    pub source: RateSource,
}

impl RateQuote {
    pub fn is_fallback(&self) -> bool {
        self.source == RateSource::Fallback
    }
}

/// Live USD/RWF rates. Lookup order: request layer, shared TTL layer,
/// persistent store, live API, static fallback.
pub struct ExchangeRateProvider {
    config: CurrencyConfig,
    client: ExchangeRateClient,
    shared: Arc<RateCache>,
    store: Option<Arc<dyn RateStore>>,
    request: RequestRates,
}

impl ExchangeRateProvider {
    pub fn new(config: CurrencyConfig, client: ExchangeRateClient, shared: Arc<RateCache>) -> Self {
        Self {
            config,
            client,
            shared,
            store: None,
            request: RequestRates::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn supports(code: &str) -> bool {
        matches!(code, USD | RWF)
    }

    pub async fn get_rate(&self, from: &str, to: &str) -> Result<RateQuote, CurrencyError> {
        let from = normalize_code(from);
        let to = normalize_code(to);

        if from == to {
            return Ok(RateQuote {
                rate: Decimal::ONE,
                source: RateSource::Identity,
            });
        }
        for code in [&from, &to] {
            if !Self::supports(code) {
                return Err(CurrencyError::UnsupportedCode(code.clone()));
            }
        }

        let key = cache_key(&from, &to);

        if let Some(cached) = self.request.get(&key).await {
            return Ok(quote(cached, RateSource::RequestCache));
        }

        if let Some(cached) = self.shared.get(&key).await {
            self.request.put(&key, cached).await;
            return Ok(quote(cached, RateSource::SharedCache));
        }

        if let Some(store) = &self.store {
            match store.fetch(&key).await {
                Ok(Some(cached)) => {
                    self.shared.put(&key, cached).await;
                    self.request.put(&key, cached).await;
                    return Ok(quote(cached, RateSource::PersistentCache));
                }
                Ok(None) => {}
                Err(err) => warn!(error = ?err, key, "Failed to read persistent rate cache"),
            }
        }

        match self.client.fetch_pair(&from, &to).await {
            Ok(rate) => {
                let cached = CachedRate {
                    rate,
                    is_fallback: false,
                };
                self.shared.put(&key, cached).await;
                self.request.put(&key, cached).await;
                if let Some(store) = &self.store {
                    if let Err(err) = store.save(&key, cached, self.config.cache_ttl).await {
                        warn!(error = ?err, key, "Failed to persist exchange rate");
                    }
                }
                info!(from, to, %rate, "Fetched live exchange rate");
                Ok(RateQuote {
                    rate,
                    source: RateSource::Api,
                })
            }
            Err(err) => self.fallback(&from, &to, &key, err).await,
        }
    }

    /// Refreshes the pair from the live API, bypassing every cache and the fallback.
    pub async fn refresh(&self, from: &str, to: &str) -> Result<Decimal, CurrencyError> {
        let from = normalize_code(from);
        let to = normalize_code(to);
        let key = cache_key(&from, &to);
        let rate = self.client.fetch_pair(&from, &to).await?;
        let cached = CachedRate {
            rate,
            is_fallback: false,
        };
        self.shared.put(&key, cached).await;
        self.request.put(&key, cached).await;
        Ok(rate)
    }

    pub fn fallback_rate(&self, from: &str, to: &str) -> Option<Decimal> {
        match (from, to) {
            (USD, RWF) => self.config.usd_to_rwf,
            (RWF, USD) => self.config.rwf_to_usd,
            _ => None,
        }
    }

    /// Ends the current request scope.
    pub async fn flush_request_cache(&self) {
        self.request.flush().await;
    }

    async fn fallback(
        &self,
        from: &str,
        to: &str,
        key: &str,
        cause: CurrencyError,
    ) -> Result<RateQuote, CurrencyError> {
        if !self.config.use_fallback_on_error {
            warn!(from, to, error = %cause, "Exchange rate API failed and fallback is disabled");
            return Err(CurrencyError::FallbackDisabled(cause.to_string()));
        }

        let rate = self
            .fallback_rate(from, to)
            .ok_or_else(|| CurrencyError::MissingFallbackRate(from.to_string(), to.to_string()))?;

        warn!(from, to, %rate, error = %cause, "Using fallback exchange rate");

        // Kept in the request layer only so the next request tries the API again.
        self.request
            .put(
                key,
                CachedRate {
                    rate,
                    is_fallback: true,
                },
            )
            .await;

        Ok(RateQuote {
            rate,
            source: RateSource::Fallback,
        })
    }
}

fn quote(cached: CachedRate, source: RateSource) -> RateQuote {
    RateQuote {
        rate: cached.rate,
        source: if cached.is_fallback {
            RateSource::Fallback
        } else {
            source
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::Client;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers::method};

    use super::*;
    use crate::config::AppConfig;

    fn provider(config: CurrencyConfig) -> ExchangeRateProvider {
        let client = ExchangeRateClient::new(Client::new(), &config);
        ExchangeRateProvider::new(
            config,
            client,
            Arc::new(RateCache::new(Duration::from_secs(3600))),
        )
    }

    fn unreachable_config() -> CurrencyConfig {
        let mut config = AppConfig::sample().currency;
        config.api_key = Some("key".into());
        // Nothing listens on the discard port.
        config.api_base_url = "http://127.0.0.1:9".into();
        config
    }

    #[tokio::test]
    async fn unreachable_api_falls_back_to_static_rate() {
        let provider = provider(unreachable_config());
        let quote = provider.get_rate("USD", "RWF").await.unwrap();
        assert_eq!(quote.rate, dec!(1350));
        assert!(quote.is_fallback());
    }

    #[tokio::test]
    async fn fallback_disabled_fails_loudly() {
        let mut config = unreachable_config();
        config.use_fallback_on_error = false;
        let provider = provider(config);
        assert!(matches!(
            provider.get_rate("USD", "RWF").await,
            Err(CurrencyError::FallbackDisabled(_))
        ));
    }

    #[tokio::test]
    async fn missing_fallback_rate_is_an_error() {
        let mut config = unreachable_config();
        config.rwf_to_usd = None;
        let provider = provider(config);
        assert!(matches!(
            provider.get_rate("FRW", "USD").await,
            Err(CurrencyError::MissingFallbackRate(_, _))
        ));
    }

    #[tokio::test]
    async fn unsupported_codes_are_rejected() {
        let provider = provider(unreachable_config());
        assert_eq!(
            provider.get_rate("USD", "EUR").await,
            Err(CurrencyError::UnsupportedCode("EUR".into()))
        );
    }

    #[tokio::test]
    async fn live_rate_is_served_from_cache_afterwards() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"result": "success", "conversion_rate": 1400})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut config = AppConfig::sample().currency;
        config.api_key = Some("key".into());
        config.api_base_url = server.uri();
        let provider = provider(config);

        let first = provider.get_rate("USD", "RWF").await.unwrap();
        assert_eq!(first, RateQuote { rate: dec!(1400), source: RateSource::Api });

        let second = provider.get_rate("USD", "RWF").await.unwrap();
        assert_eq!(second.source, RateSource::RequestCache);

        provider.flush_request_cache().await;
        let third = provider.get_rate("USD", "RWF").await.unwrap();
        assert_eq!(third.source, RateSource::SharedCache);
    }

    #[derive(Default)]
    struct MemoryStore(tokio::sync::Mutex<std::collections::HashMap<String, CachedRate>>);

    #[async_trait]
    impl RateStore for MemoryStore {
        async fn fetch(&self, key: &str) -> Result<Option<CachedRate>> {
            Ok(self.0.lock().await.get(key).copied())
        }

        async fn save(&self, key: &str, rate: CachedRate, _ttl: Duration) -> Result<()> {
            self.0.lock().await.insert(key.to_string(), rate);
            Ok(())
        }
    }

    #[tokio::test]
    async fn persisted_rates_are_used_before_the_api() {
        let store = Arc::new(MemoryStore::default());
        store
            .save(
                &cache_key("USD", "RWF"),
                CachedRate {
                    rate: dec!(1420),
                    is_fallback: false,
                },
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let provider = provider(unreachable_config()).with_store(store);
        let quote = provider.get_rate("USD", "RWF").await.unwrap();
        assert_eq!(
            quote,
            RateQuote {
                rate: dec!(1420),
                source: RateSource::PersistentCache
            }
        );
    }
}
