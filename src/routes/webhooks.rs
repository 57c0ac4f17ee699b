//! Provider callbacks. These are unauthenticated; Stripe requests are
//! verified by signature, KPay postbacks are matched to a known payment.

use anyhow::Context;
use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{error, warn};
use utoipa_axum::router::OpenApiRouter;

use crate::{
    api::stripe::verify_webhook_signature,
    app_error::AppError,
    app_state::AppState,
    payments::{self, PostbackError, postback_id},
};

pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/webhooks",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(stripe_webhook))
            .routes(utoipa_axum::routes!(kpay_postback)),
    )
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

/// Stripe webhook endpoint. Handles `payment_intent.succeeded` and
/// `payment_intent.payment_failed`; other events are acknowledged.
#[utoipa::path(
    post,
    path = "/stripe",
    tags = ["Webhooks"],
    request_body(content = String, description = "Raw Stripe event", content_type = "application/json"),
    responses(
        (status = 200, description = "Event processed"),
        (status = 400, description = "Invalid payload or signature"),
        (status = 500, description = "Webhook not configured or processing failed")
    )
)]
async fn stripe_webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(secret) = state.config.stripe.webhook_secret.as_deref() else {
        error!("Stripe webhook received but no webhook secret is configured");
        return reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "Webhook secret not configured"}),
        );
    };

    let Some(signature) = headers.get(STRIPE_SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        warn!("Stripe webhook without signature header");
        return reply(StatusCode::BAD_REQUEST, json!({"error": "Missing signature"}));
    };

    if let Err(err) = verify_webhook_signature(
        &body,
        signature,
        secret,
        state.config.stripe.signature_tolerance,
        Utc::now().timestamp(),
    ) {
        warn!(error = %err, "Stripe webhook signature verification failed");
        return reply(StatusCode::BAD_REQUEST, json!({"error": "Invalid signature"}));
    }

    let event: Value = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "Stripe webhook payload is not valid JSON");
            return reply(StatusCode::BAD_REQUEST, json!({"error": "Invalid payload"}));
        }
    };

    match process_stripe_event(&state, &event).await {
        Ok(()) => reply(StatusCode::OK, json!({"status": "success"})),
        Err(err) => {
            error!(event_id = ?event["id"], error = ?err, "Stripe webhook processing failed");
            reply(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "Webhook processing failed"}))
        }
    }
}

async fn process_stripe_event(state: &AppState, event: &Value) -> Result<(), AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    payments::handle_stripe_event(conn, event).await?;
    Ok(())
}

/// KPay posts either a form or a JSON document.
pub fn postback_body(headers: &HeaderMap, body: &[u8]) -> Option<Value> {
    let is_form = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));

    if is_form {
        let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(body).ok()?;
        let fields: Map<String, Value> = pairs.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
        return Some(Value::Object(fields));
    }
    serde_json::from_slice(body).ok().filter(Value::is_object)
}

/// KPay postback endpoint.
#[utoipa::path(
    post,
    path = "/kpay",
    tags = ["Webhooks"],
    request_body(content = Object, description = "KPay postback", content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Postback processed"),
        (status = 400, description = "Invalid payload or missing transaction identifiers"),
        (status = 404, description = "Payment not found"),
        (status = 500, description = "Processing failed")
    )
)]
async fn kpay_postback(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(body) = postback_body(&headers, &body) else {
        warn!("KPay postback payload could not be decoded");
        return reply(
            StatusCode::BAD_REQUEST,
            json!({"reply": "ERROR", "message": "Invalid payload"}),
        );
    };

    let tid = postback_id(&body, "tid");
    let refid = postback_id(&body, "refid");
    if tid.is_none() && refid.is_none() {
        warn!("KPay postback missing transaction identifiers");
        return reply(
            StatusCode::BAD_REQUEST,
            json!({"reply": "ERROR", "message": "Missing transaction identifiers"}),
        );
    }

    let result = match state.db_pool.get().await {
        Ok(mut conn) => payments::handle_kpay_postback(&mut conn, &state.config.kpay.status_codes, &body).await,
        Err(err) => Err(PostbackError::Processing(AppError::Other(
            anyhow::Error::new(err).context("Failed to obtain a DB connection pool"),
        ))),
    };

    match result {
        Ok(_) => reply(StatusCode::OK, json!({"tid": tid, "refid": refid, "reply": "OK"})),
        Err(PostbackError::MissingIdentifiers) => reply(
            StatusCode::BAD_REQUEST,
            json!({"reply": "ERROR", "message": "Missing transaction identifiers"}),
        ),
        Err(PostbackError::PaymentNotFound) => reply(
            StatusCode::NOT_FOUND,
            json!({"reply": "ERROR", "message": "Payment not found"}),
        ),
        Err(PostbackError::Processing(err)) => {
            error!(tid, refid, error = ?err, "KPay postback processing failed");
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"tid": tid, "refid": refid, "reply": "ERROR", "message": "Processing failed"}),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{Router, body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;
    use crate::{api::stripe::tests::sign, app_state::tests::offline_state, config::AppConfig};

    fn app(config: AppConfig) -> Router {
        let (router, _) = routes_with_openapi().split_for_parts();
        router.with_state(offline_state(config))
    }

    async fn json_body(res: Response) -> Value {
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn stripe_request(body: &'static str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::post("/webhooks/stripe");
        if let Some(signature) = signature {
            builder = builder.header(STRIPE_SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(body)).unwrap()
    }

    #[tokio::test]
    async fn stripe_webhook_without_secret_is_a_server_error() {
        let mut config = AppConfig::sample();
        config.stripe.webhook_secret = None;

        let res = app(config).oneshot(stripe_request("{}", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn stripe_webhook_rejects_bad_signatures() {
        let res = app(AppConfig::sample()).oneshot(stripe_request("{}", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let forged = sign(b"{}", "whsec_other", Utc::now().timestamp());
        let res = app(AppConfig::sample())
            .oneshot(stripe_request("{}", Some(forged)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["error"], "Invalid signature");
    }

    #[tokio::test]
    async fn signed_but_unparseable_events_are_rejected() {
        let signature = sign(b"not json", "whsec_test", Utc::now().timestamp());
        let res = app(AppConfig::sample())
            .oneshot(stripe_request("not json", Some(signature)))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn form_encoded_postbacks_get_a_json_reply() {
        let req = Request::post("/webhooks/kpay")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("statusid=01"))
            .unwrap();

        let res = app(AppConfig::sample()).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(res).await,
            json!({"reply": "ERROR", "message": "Missing transaction identifiers"})
        );
    }

    #[tokio::test]
    async fn undecodable_postbacks_get_a_json_reply() {
        let req = Request::post("/webhooks/kpay")
            .header("content-type", "text/plain")
            .body(Body::from("tid=1"))
            .unwrap();

        let res = app(AppConfig::sample()).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(res).await["reply"], "ERROR");
    }

    #[test]
    fn postback_body_reads_forms_and_json() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            "application/x-www-form-urlencoded; charset=UTF-8".parse().unwrap(),
        );
        let form = postback_body(&headers, b"tid=T1&refid=ORD-1&statusid=01").unwrap();
        assert_eq!(form, json!({"tid": "T1", "refid": "ORD-1", "statusid": "01"}));

        let json = postback_body(&HeaderMap::new(), br#"{"tid":"T1","statusid":"02"}"#).unwrap();
        assert_eq!(json["statusid"], "02");
        assert!(postback_body(&HeaderMap::new(), b"[1,2]").is_none());
    }

    #[tokio::test]
    async fn kpay_postback_requires_an_identifier() {
        let req = Request::post("/webhooks/kpay")
            .header("content-type", "application/json")
            .body(Body::from(json!({"statusid": "01"}).to_string()))
            .unwrap();

        let res = app(AppConfig::sample()).oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(res).await,
            json!({"reply": "ERROR", "message": "Missing transaction identifiers"})
        );
    }
}
