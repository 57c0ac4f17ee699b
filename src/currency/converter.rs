use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper, dsl::max};
use diesel_async::RunQueryDsl;
use rust_decimal::Decimal;
use tracing::warn;

use crate::{
    currency::{CurrencyError, ExchangeRateProvider, is_privileged_pair, normalize_code, round_money},
    db::DbPool,
    models::CurrencyEntity,
    schema::currencies,
};

/// Anything that can turn an amount in one currency into another.
#[async_trait]
pub trait CurrencyConversion: Send + Sync {
    async fn convert(&self, amount: Decimal, from: &str, to: &str) -> Result<Decimal, CurrencyError>;
}

/// A row of the rate table, relative to the base currency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrencyRate {
    pub code: String,
    pub exchange_rate: Decimal,
    pub is_base: bool,
    pub is_active: bool,
}

impl From<CurrencyEntity> for CurrencyRate {
    fn from(entity: CurrencyEntity) -> Self {
        Self {
            code: entity.code,
            exchange_rate: entity.exchange_rate,
            is_base: entity.is_base,
            is_active: entity.is_active,
        }
    }
}

impl CurrencyRate {
    /// Converts through the base currency and rounds to cents.
    pub fn convert_to(&self, target: &CurrencyRate, amount: Decimal) -> Result<Decimal, CurrencyError> {
        let mut value = amount;
        if !self.is_base {
            if self.exchange_rate <= Decimal::ZERO {
                return Err(CurrencyError::InvalidRate(self.code.clone()));
            }
            value /= self.exchange_rate;
        }
        if !target.is_base {
            value *= target.exchange_rate;
        }
        Ok(round_money(value))
    }
}

#[async_trait]
pub trait CurrencyTable: Send + Sync {
    async fn find(&self, code: &str) -> Result<Option<CurrencyRate>, CurrencyError>;

    async fn latest_rate_update(&self) -> Result<Option<DateTime<Utc>>, CurrencyError>;
}

#[async_trait]
impl CurrencyTable for HashMap<String, CurrencyRate> {
    async fn find(&self, code: &str) -> Result<Option<CurrencyRate>, CurrencyError> {
        Ok(self.get(code).cloned())
    }

    async fn latest_rate_update(&self) -> Result<Option<DateTime<Utc>>, CurrencyError> {
        Ok(None)
    }
}

pub struct PgCurrencyTable {
    pool: DbPool,
}

impl PgCurrencyTable {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CurrencyTable for PgCurrencyTable {
    async fn find(&self, code: &str) -> Result<Option<CurrencyRate>, CurrencyError> {
        let conn = &mut self
            .pool
            .get()
            .await
            .map_err(|e| CurrencyError::Transport(e.to_string()))?;

        let currency: Option<CurrencyEntity> = currencies::table
            .filter(currencies::code.eq(code))
            .select(CurrencyEntity::as_select())
            .first(conn)
            .await
            .optional()
            .map_err(|e| CurrencyError::Transport(e.to_string()))?;

        Ok(currency.map(CurrencyRate::from))
    }

    async fn latest_rate_update(&self) -> Result<Option<DateTime<Utc>>, CurrencyError> {
        let conn = &mut self
            .pool
            .get()
            .await
            .map_err(|e| CurrencyError::Transport(e.to_string()))?;

        currencies::table
            .filter(currencies::is_active.eq(true))
            .select(max(currencies::rate_updated_at))
            .first(conn)
            .await
            .map_err(|e| CurrencyError::Transport(e.to_string()))
    }
}

/// Stored rates are stale when the latest update is older than the window, or missing.
pub fn rates_are_stale(latest: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::hours(24));
    match latest {
        Some(updated_at) => now - updated_at > window,
        None => true,
    }
}

pub struct CurrencyConverter<T: CurrencyTable> {
    provider: ExchangeRateProvider,
    table: T,
    staleness: Duration,
}

impl<T: CurrencyTable> CurrencyConverter<T> {
    pub fn new(provider: ExchangeRateProvider, table: T, staleness: Duration) -> Self {
        Self {
            provider,
            table,
            staleness,
        }
    }

    pub fn provider(&self) -> &ExchangeRateProvider {
        &self.provider
    }

    async fn convert_via_table(&self, amount: Decimal, from: &str, to: &str) -> Result<Decimal, CurrencyError> {
        let source = self.active_currency(from).await?;
        let target = self.active_currency(to).await?;

        let latest = self.table.latest_rate_update().await?;
        if latest.is_some() && rates_are_stale(latest, Utc::now(), self.staleness) {
            warn!(from, to, "Converting with stale exchange rates");
        }

        source.convert_to(&target, amount)
    }

    async fn active_currency(&self, code: &str) -> Result<CurrencyRate, CurrencyError> {
        let currency = self
            .table
            .find(code)
            .await?
            .ok_or_else(|| CurrencyError::NotFound(code.to_string()))?;
        if !currency.is_active {
            return Err(CurrencyError::Inactive(code.to_string()));
        }
        Ok(currency)
    }
}

#[async_trait]
impl<T: CurrencyTable> CurrencyConversion for CurrencyConverter<T> {
    async fn convert(&self, amount: Decimal, from: &str, to: &str) -> Result<Decimal, CurrencyError> {
        if amount < Decimal::ZERO {
            return Err(CurrencyError::NegativeAmount);
        }

        let from = normalize_code(from);
        let to = normalize_code(to);
        if from == to {
            return Ok(amount);
        }

        if is_privileged_pair(&from, &to) {
            match self.provider.get_rate(&from, &to).await {
                Ok(quote) => return Ok(round_money(amount * quote.rate)),
                Err(err) => {
                    warn!(from, to, error = %err, "Live rate unavailable, converting with stored rates");
                }
            }
        }

        self.convert_via_table(amount, &from, &to).await
    }
}
