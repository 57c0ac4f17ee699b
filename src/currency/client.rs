use std::{str::FromStr, time::Duration};

use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{config::CurrencyConfig, currency::CurrencyError};

/// Thin client for the exchangerate-api.com v6 pair endpoint.
#[derive(Debug, Clone)]
pub struct ExchangeRateClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    passes: [(Duration, u32); 2],
    retry_delay: Duration,
}

impl ExchangeRateClient {
    pub fn new(http: Client, config: &CurrencyConfig) -> Self {
        Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            passes: [
                (config.timeout, config.attempts.max(1)),
                (config.extended_timeout, config.extended_attempts.max(1)),
            ],
            retry_delay: config.retry_delay,
        }
    }

    /// Fetches the conversion rate for a pair. Transport failures are retried with
    /// the standard timeout first, then with the extended one; API-level errors
    /// are returned immediately.
    pub async fn fetch_pair(&self, from: &str, to: &str) -> Result<Decimal, CurrencyError> {
        let api_key = self.api_key.as_deref().ok_or(CurrencyError::MissingApiKey)?;
        let url = format!("{}/{}/pair/{}/{}", self.base_url, api_key, from, to);

        let mut last_error = CurrencyError::Transport("no attempt made".into());
        for (timeout, attempts) in self.passes {
            for attempt in 1..=attempts {
                match self.request(&url, timeout, to).await {
                    Ok(rate) => return Ok(rate),
                    Err(err) if err.is_transient() => {
                        warn!(from, to, attempt, timeout_secs = timeout.as_secs(), error = %err, "Exchange rate request failed");
                        last_error = err;
                        tokio::time::sleep(self.retry_delay).await;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Err(last_error)
    }

    async fn request(&self, url: &str, timeout: Duration, to: &str) -> Result<Decimal, CurrencyError> {
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| CurrencyError::Transport(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| CurrencyError::UnexpectedResponse(e.to_string()))?;
        debug!(%status, "Exchange rate API responded");

        if body.get("result").and_then(Value::as_str) == Some("error") {
            let error_type = body
                .get("error-type")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            return Err(map_api_error(error_type));
        }

        if status.is_server_error() {
            return Err(CurrencyError::Transport(format!("HTTP {status}")));
        }

        parse_rate(&body, to)
    }
}

pub fn map_api_error(error_type: &str) -> CurrencyError {
    match error_type {
        "unsupported-code" => CurrencyError::UnsupportedCode(error_type.to_string()),
        "invalid-key" => CurrencyError::InvalidKey,
        "quota-reached" => CurrencyError::QuotaReached,
        "malformed-request" => CurrencyError::MalformedRequest,
        "inactive-account" => CurrencyError::InactiveAccount,
        other => CurrencyError::Api(other.to_string()),
    }
}

/// Reads `conversion_rate`, or the target entry of a `rates`/`conversion_rates` map.
pub fn parse_rate(body: &Value, to: &str) -> Result<Decimal, CurrencyError> {
    let raw = body
        .get("conversion_rate")
        .or_else(|| body.get("conversion_rates").and_then(|rates| rates.get(to)))
        .or_else(|| body.get("rates").and_then(|rates| rates.get(to)))
        .ok_or_else(|| CurrencyError::UnexpectedResponse("missing conversion_rate".into()))?;

    let rate = decimal_from_json(raw)
        .ok_or_else(|| CurrencyError::UnexpectedResponse(format!("invalid rate {raw}")))?;

    if rate <= Decimal::ZERO {
        return Err(CurrencyError::UnexpectedResponse(format!("non-positive rate {rate}")));
    }
    Ok(rate)
}

pub fn decimal_from_json(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    if text.contains(['e', 'E']) {
        Decimal::from_scientific(&text).ok()
    } else {
        Decimal::from_str(&text).ok()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;
    use crate::config::AppConfig;

    fn client_for(server: &MockServer) -> ExchangeRateClient {
        let mut config = AppConfig::sample().currency;
        config.api_base_url = server.uri();
        config.api_key = Some("key".into());
        ExchangeRateClient::new(Client::new(), &config)
    }

    #[test]
    fn maps_every_documented_error_type() {
        assert_eq!(map_api_error("invalid-key"), CurrencyError::InvalidKey);
        assert_eq!(map_api_error("quota-reached"), CurrencyError::QuotaReached);
        assert_eq!(map_api_error("malformed-request"), CurrencyError::MalformedRequest);
        assert_eq!(map_api_error("inactive-account"), CurrencyError::InactiveAccount);
        assert!(matches!(map_api_error("unsupported-code"), CurrencyError::UnsupportedCode(_)));
        assert_eq!(map_api_error("teapot"), CurrencyError::Api("teapot".into()));
    }

    #[test]
    fn parses_alternative_rate_shapes() {
        assert_eq!(parse_rate(&json!({"conversion_rate": 1350.5}), "RWF"), Ok(dec!(1350.5)));
        assert_eq!(
            parse_rate(&json!({"conversion_rates": {"RWF": 1300}}), "RWF"),
            Ok(dec!(1300))
        );
        assert_eq!(parse_rate(&json!({"rates": {"USD": "0.00074"}}), "USD"), Ok(dec!(0.00074)));
        assert!(matches!(
            parse_rate(&json!({"result": "success"}), "RWF"),
            Err(CurrencyError::UnexpectedResponse(_))
        ));
    }

    #[tokio::test]
    async fn fetches_pair_rate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/key/pair/USD/RWF"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"result": "success", "conversion_rate": 1412.25})),
            )
            .mount(&server)
            .await;

        let rate = client_for(&server).fetch_pair("USD", "RWF").await;
        assert_eq!(rate, Ok(dec!(1412.25)));
    }

    #[tokio::test]
    async fn api_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"result": "error", "error-type": "quota-reached"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let rate = client_for(&server).fetch_pair("USD", "RWF").await;
        assert_eq!(rate, Err(CurrencyError::QuotaReached));
    }

    #[tokio::test]
    async fn missing_key_short_circuits() {
        let mut config = AppConfig::sample().currency;
        config.api_key = None;
        let client = ExchangeRateClient::new(Client::new(), &config);
        assert_eq!(client.fetch_pair("USD", "RWF").await, Err(CurrencyError::MissingApiKey));
    }
}
