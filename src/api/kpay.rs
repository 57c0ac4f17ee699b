use reqwest::Client;
use rust_decimal::{Decimal, RoundingStrategy, prelude::ToPrimitive};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::{
    api::GatewayError,
    config::{KPayConfig, KPayStatusCodes},
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum KPayStatus {
    Success,
    Failure,
    Pending,
}

/// Decodes a provider status code. Unknown codes stay pending.
pub fn classify_status(code: &Value, codes: &KPayStatusCodes) -> KPayStatus {
    let code = match code {
        Value::String(s) => s.trim().to_uppercase(),
        Value::Number(n) => n.to_string(),
        Value::Bool(true) => "1".to_string(),
        _ => return KPayStatus::Pending,
    };
    if code.is_empty() {
        return KPayStatus::Pending;
    }

    let matches = |list: &[String]| list.iter().any(|c| c.trim().eq_ignore_ascii_case(&code));
    if matches(&codes.success) {
        KPayStatus::Success
    } else if matches(&codes.failure) {
        KPayStatus::Failure
    } else {
        KPayStatus::Pending
    }
}

/// Status code carried by a status response or postback.
pub fn status_code(body: &Value) -> &Value {
    match body.get("statusid") {
        Some(code) if !code.is_null() => code,
        _ => body.get("status").unwrap_or(&Value::Null),
    }
}

pub fn normalize_msisdn(raw: &str) -> String {
    let digits: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '+'))
        .collect();
    if let Some(rest) = digits.strip_prefix('0') {
        format!("250{rest}")
    } else if digits.starts_with("250") {
        digits
    } else {
        format!("250{digits}")
    }
}

fn accepted(body: &Value) -> bool {
    let success = matches!(body.get("success"), Some(Value::Bool(true)))
        || body.get("success").and_then(Value::as_i64) == Some(1);
    let retcode = match body.get("retcode") {
        Some(Value::String(s)) => s == "000",
        Some(Value::Number(n)) => n.as_i64() == Some(0),
        _ => false,
    };
    success || retcode
}

fn error_message(body: &Value) -> String {
    ["reply", "statusdesc", "message"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .filter(|m| !m.is_empty())
        .unwrap_or("Payment initiation failed")
        .to_string()
}

fn string_field(body: &Value, key: &str) -> Option<String> {
    match body.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct KPayInitiateRequest {
    pub order_id: i32,
    pub order_number: String,
    pub attempt_suffix: String,
    pub msisdn: String,
    pub email: String,
    pub details: String,
    pub amount: Decimal,
    pub currency: String,
    pub customer_name: String,
    pub customer_number: String,
    pub payment_method: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KPayInitiation {
    pub tid: Option<String>,
    pub refid: String,
    pub redirect_url: Option<String>,
    pub response: Value,
}

#[derive(Debug, Clone)]
pub struct KPayClient {
    http: Client,
    config: KPayConfig,
}

impl KPayClient {
    pub fn new(http: Client, config: KPayConfig) -> Self {
        Self { http, config }
    }

    pub fn status_codes(&self) -> &KPayStatusCodes {
        &self.config.status_codes
    }

    pub fn classify(&self, body: &Value) -> KPayStatus {
        classify_status(status_code(body), &self.config.status_codes)
    }

    async fn call(&self, payload: &Value) -> Result<Value, GatewayError> {
        let response = self
            .http
            .post(&self.config.base_url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .timeout(self.config.timeout)
            .json(payload)
            .send()
            .await
            .map_err(|_| GatewayError::Unreachable("KPay".into()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|_| GatewayError::InvalidResponse("KPay".into()))?;
        if status.is_server_error() {
            return Err(GatewayError::Unreachable("KPay".into()));
        }
        Ok(body)
    }

    pub async fn initiate(&self, request: &KPayInitiateRequest) -> Result<KPayInitiation, GatewayError> {
        let amount = request
            .amount
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .filter(|amount| *amount > 0)
            .ok_or_else(|| GatewayError::InvalidRequest("Payment amount must be greater than 0".into()))?;

        let refid = format!("{}-{}", request.order_number, request.attempt_suffix);
        let payload = json!({
            "action": "pay",
            "msisdn": normalize_msisdn(&request.msisdn),
            "email": request.email,
            "details": request.details,
            "refid": refid,
            "amount": amount,
            "currency": request.currency,
            "cname": request.customer_name,
            "cnumber": request.customer_number,
            "pmethod": request.payment_method.as_deref().unwrap_or("mobile_money"),
            "retailerid": self.config.retailer_id,
            "returl": self.config.return_url,
            "redirecturl": self.config.redirect_url,
        });

        let body = self.call(&payload).await.inspect_err(|e| {
            error!(order_id = request.order_id, refid, error = %e, "KPay initiation failed");
        })?;

        if !accepted(&body) {
            let message = error_message(&body);
            warn!(order_id = request.order_id, refid, message, "KPay rejected payment");
            return Err(GatewayError::Rejected(message));
        }

        let tid = string_field(&body, "tid");
        info!(order_id = request.order_id, refid, tid = ?tid, "KPay payment initiated");
        Ok(KPayInitiation {
            tid,
            refid,
            redirect_url: string_field(&body, "url"),
            response: body,
        })
    }

    pub async fn check_status(&self, tid: Option<&str>, refid: Option<&str>) -> Result<Value, GatewayError> {
        let payload = json!({
            "action": "checkstatus",
            "tid": tid,
            "refid": refid,
        });
        self.call(&payload).await.inspect_err(|e| {
            error!(tid, refid, error = %e, "KPay status check failed");
        })
    }
}

/// Provider fields merged into the payment metadata.
pub fn callback_metadata(body: &Value) -> Value {
    json!({
        "kpay_callback_data": body,
        "kpay_statusid": status_code(body),
        "kpay_statusdesc": body.get("statusdesc").cloned().unwrap_or(Value::Null),
        "kpay_momtransactionid": body.get("momtransactionid").cloned().unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, method},
    };

    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn classifies_heterogeneous_codes() {
        let codes = KPayStatusCodes::default();
        assert_eq!(classify_status(&json!("01"), &codes), KPayStatus::Success);
        assert_eq!(classify_status(&json!(1), &codes), KPayStatus::Success);
        assert_eq!(classify_status(&json!("successful"), &codes), KPayStatus::Success);
        assert_eq!(classify_status(&json!(0), &codes), KPayStatus::Success);
        assert_eq!(classify_status(&json!("02"), &codes), KPayStatus::Failure);
        assert_eq!(classify_status(&json!("Declined"), &codes), KPayStatus::Failure);
    }

    #[test]
    fn unknown_codes_stay_pending() {
        let codes = KPayStatusCodes::default();
        assert_eq!(classify_status(&json!("03"), &codes), KPayStatus::Pending);
        assert_eq!(classify_status(&json!("PROCESSING"), &codes), KPayStatus::Pending);
        assert_eq!(classify_status(&Value::Null, &codes), KPayStatus::Pending);
        assert_eq!(classify_status(&json!(""), &codes), KPayStatus::Pending);
    }

    #[test]
    fn normalizes_rwandan_numbers() {
        assert_eq!(normalize_msisdn("078 123-4567"), "250781234567");
        assert_eq!(normalize_msisdn("+250781234567"), "250781234567");
        assert_eq!(normalize_msisdn("781234567"), "250781234567");
    }

    #[test]
    fn status_code_prefers_statusid() {
        assert_eq!(status_code(&json!({"statusid": "01", "status": "02"})), &json!("01"));
        assert_eq!(status_code(&json!({"status": "02"})), &json!("02"));
    }

    fn request(amount: Decimal) -> KPayInitiateRequest {
        KPayInitiateRequest {
            order_id: 5,
            order_number: "ORD-ABC".into(),
            attempt_suffix: "2".into(),
            msisdn: "0781234567".into(),
            email: "buyer@example.com".into(),
            details: "Order ORD-ABC".into(),
            amount,
            currency: "RWF".into(),
            customer_name: "Buyer".into(),
            customer_number: "7".into(),
            payment_method: None,
        }
    }

    #[tokio::test]
    async fn initiate_sends_normalized_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({
                "action": "pay",
                "msisdn": "250781234567",
                "refid": "ORD-ABC-2",
                "amount": 13500,
                "pmethod": "mobile_money",
                "retailerid": "RET01",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": 1,
                "retcode": 0,
                "tid": "T-99",
                "url": "https://pay.example/checkout",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = AppConfig::sample().kpay;
        config.base_url = server.uri();
        let client = KPayClient::new(Client::new(), config);

        let initiation = client.initiate(&request(dec!(13499.6))).await.unwrap();
        assert_eq!(initiation.tid.as_deref(), Some("T-99"));
        assert_eq!(initiation.refid, "ORD-ABC-2");
        assert_eq!(initiation.redirect_url.as_deref(), Some("https://pay.example/checkout"));
    }

    #[tokio::test]
    async fn initiate_surfaces_provider_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": 0,
                "retcode": "601",
                "reply": "Insufficient funds",
            })))
            .mount(&server)
            .await;

        let mut config = AppConfig::sample().kpay;
        config.base_url = server.uri();
        let client = KPayClient::new(Client::new(), config);

        assert_eq!(
            client.initiate(&request(dec!(1000))).await,
            Err(GatewayError::Rejected("Insufficient funds".into()))
        );
    }

    #[tokio::test]
    async fn rejects_non_positive_amounts_before_calling() {
        let client = KPayClient::new(Client::new(), AppConfig::sample().kpay);
        assert!(matches!(
            client.initiate(&request(dec!(0.4))).await,
            Err(GatewayError::InvalidRequest(_))
        ));
    }
}
