use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use utoipa_axum::router::OpenApiRouter;

use crate::{
    api::GatewayOutcome,
    app_error::{AppError, StdResponse},
    app_state::AppState,
    middleware,
    payments::{self, KPayPaymentReq},
};

/// Defines customer-facing payment routes.
pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/customers",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(pay_with_stripe))
            .routes(utoipa_axum::routes!(pay_with_kpay))
            .routes(utoipa_axum::routes!(get_payment_status))
            .route_layer(axum::middleware::from_fn(middleware::customers_authorization)),
    )
}

fn respond(outcome: GatewayOutcome) -> StdResponse<GatewayOutcome, String> {
    let message = outcome.message.clone().or_else(|| outcome.error.clone());
    StdResponse {
        data: Some(outcome),
        message,
    }
}

/// Start a Stripe checkout for an order. The outcome carries the hosted
/// checkout URL on success.
#[utoipa::path(
    post,
    path = "/orders/{id}/payments/stripe",
    tags = ["Payments"],
    security(("userId" = [])),
    params(
        ("id" = i32, Path, description = "Order ID to pay")
    ),
    responses(
        (status = 200, description = "Gateway outcome", body = StdResponse<GatewayOutcome, String>),
        (status = 400, description = "Order cannot be paid")
    )
)]
async fn pay_with_stripe(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(user_id): Extension<i32>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = payments::start_stripe_checkout(&state, user_id, id).await?;
    Ok(respond(outcome))
}

/// Start a KPay mobile money or card payment for an order.
#[utoipa::path(
    post,
    path = "/orders/{id}/payments/kpay",
    tags = ["Payments"],
    security(("userId" = [])),
    params(
        ("id" = i32, Path, description = "Order ID to pay")
    ),
    request_body = KPayPaymentReq,
    responses(
        (status = 200, description = "Gateway outcome", body = StdResponse<GatewayOutcome, String>),
        (status = 400, description = "Order cannot be paid")
    )
)]
async fn pay_with_kpay(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(user_id): Extension<i32>,
    Json(req): Json<KPayPaymentReq>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = payments::start_kpay_payment(&state, user_id, id, &req).await?;
    Ok(respond(outcome))
}

/// Current status of a payment. Pending KPay payments are checked with the
/// provider first.
#[utoipa::path(
    get,
    path = "/payments/{id}/status",
    tags = ["Payments"],
    security(("userId" = [])),
    params(
        ("id" = i32, Path, description = "Payment ID to check")
    ),
    responses(
        (status = 200, description = "Gateway outcome", body = StdResponse<GatewayOutcome, String>),
        (status = 404, description = "Payment not found")
    )
)]
async fn get_payment_status(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(user_id): Extension<i32>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = payments::refresh_payment_status(&state, user_id, id).await?;
    Ok(respond(outcome))
}
