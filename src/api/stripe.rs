use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::{error, info};

use crate::{api::GatewayError, config::StripeConfig, currency::format::to_minor_units};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Invalid Stripe-Signature header")]
    MalformedHeader,

    #[error("Invalid signature hex")]
    InvalidHex,

    #[error("Webhook signature mismatch")]
    Mismatch,

    #[error("Webhook timestamp outside tolerance")]
    Expired,
}

/// Verifies a `Stripe-Signature` header (`t=...,v1=...`) over the raw body.
pub fn verify_webhook_signature(
    payload: &[u8],
    sig_header: &str,
    secret: &str,
    tolerance: Duration,
    now: i64,
) -> Result<(), SignatureError> {
    let mut timestamp = "";
    let mut signatures = Vec::new();
    for part in sig_header.split(',') {
        let part = part.trim();
        if let Some(t) = part.strip_prefix("t=") {
            timestamp = t;
        } else if let Some(v) = part.strip_prefix("v1=") {
            signatures.push(v);
        }
    }

    if timestamp.is_empty() || signatures.is_empty() {
        return Err(SignatureError::MalformedHeader);
    }

    let ts: i64 = timestamp.parse().map_err(|_| SignatureError::MalformedHeader)?;
    if (now - ts).unsigned_abs() > tolerance.as_secs() {
        return Err(SignatureError::Expired);
    }

    let mut last = SignatureError::Mismatch;
    for signature in signatures {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map_err(|_| SignatureError::Mismatch)?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);

        match hex::decode(signature) {
            Ok(bytes) if mac.verify_slice(&bytes).is_ok() => return Ok(()),
            Ok(_) => last = SignatureError::Mismatch,
            Err(_) => last = SignatureError::InvalidHex,
        }
    }
    Err(last)
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub order_id: i32,
    pub order_number: String,
    pub user_id: i32,
    pub payment_id: i32,
    pub currency: String,
    pub amount: Decimal,
    pub description: String,
    pub customer_email: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
    pub payment_intent: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StripeClient {
    http: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(http: Client, config: StripeConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Creates a hosted checkout session. The idempotency key makes a
    /// retried request return the session created the first time.
    pub async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, GatewayError> {
        let secret_key = self
            .config
            .secret_key
            .as_deref()
            .ok_or_else(|| GatewayError::NotConfigured("Stripe".into()))?;

        let unit_amount = to_minor_units(request.amount, &request.currency)
            .filter(|amount| *amount > 0)
            .ok_or_else(|| GatewayError::InvalidRequest("Payment amount must be greater than 0".into()))?;

        let order_id = request.order_id.to_string();
        let user_id = request.user_id.to_string();
        let payment_id = request.payment_id.to_string();
        let unit_amount = unit_amount.to_string();
        let currency = request.currency.to_lowercase();

        let form = [
            ("mode", "payment"),
            ("success_url", self.config.success_url.as_str()),
            ("cancel_url", self.config.cancel_url.as_str()),
            ("client_reference_id", request.order_number.as_str()),
            ("customer_email", request.customer_email.as_str()),
            ("line_items[0][quantity]", "1"),
            ("line_items[0][price_data][currency]", currency.as_str()),
            ("line_items[0][price_data][unit_amount]", unit_amount.as_str()),
            ("line_items[0][price_data][product_data][name]", request.description.as_str()),
            ("metadata[order_id]", order_id.as_str()),
            ("metadata[order_number]", request.order_number.as_str()),
            ("metadata[user_id]", user_id.as_str()),
            ("metadata[payment_id]", payment_id.as_str()),
            ("payment_intent_data[metadata][order_id]", order_id.as_str()),
            ("payment_intent_data[metadata][order_number]", request.order_number.as_str()),
            ("payment_intent_data[metadata][user_id]", user_id.as_str()),
            ("payment_intent_data[metadata][payment_id]", payment_id.as_str()),
        ];

        let response = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.config.api_base_url))
            .basic_auth(secret_key, None::<&str>)
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&form)
            .send()
            .await
            .map_err(|_| GatewayError::Unreachable("Stripe".into()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|_| GatewayError::InvalidResponse("Stripe".into()))?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("Stripe rejected the request")
                .to_string();
            error!(order_id = request.order_id, payment_id = request.payment_id, %status, message, "Stripe checkout session failed");
            return Err(GatewayError::Rejected(message));
        }

        let id = body["id"]
            .as_str()
            .ok_or_else(|| GatewayError::InvalidResponse("Stripe".into()))?
            .to_string();
        info!(order_id = request.order_id, session_id = id, "Stripe checkout session created");

        Ok(CheckoutSession {
            id,
            url: body["url"].as_str().map(String::from),
            payment_intent: body["payment_intent"].as_str().map(String::from),
        })
    }
}
