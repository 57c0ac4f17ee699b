use axum::{extract::State, response::IntoResponse};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    app_error::{AppError, StdResponse},
    app_state::AppState,
    currency::{CurrencyError, RWF, USD},
    middleware,
};

pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/admin/currencies",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(refresh_rates))
            .route_layer(axum::middleware::from_fn(middleware::admins_authorization)),
    )
}

#[derive(Serialize, ToSchema)]
pub struct RefreshedRates {
    pub usd_to_rwf: Decimal,
    pub rwf_to_usd: Decimal,
}

fn refresh_error(err: CurrencyError) -> AppError {
    match err {
        CurrencyError::Transport(reason) => AppError::ServiceUnreachable(format!("Exchange rate API ({reason})")),
        err => AppError::BadRequest(format!("Failed to refresh exchange rates: {err}")),
    }
}

/// Fetch the live USD/RWF rates, bypassing every cache.
#[utoipa::path(
    post,
    path = "/refresh",
    tags = ["Admin"],
    security(("userRole" = [])),
    responses(
        (status = 200, description = "Rates refreshed", body = StdResponse<RefreshedRates, String>),
        (status = 400, description = "The rate API rejected the request"),
        (status = 502, description = "The rate API is unreachable")
    )
)]
async fn refresh_rates(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let converter = state.converter();
    let provider = converter.provider();

    let usd_to_rwf = provider.refresh(USD, RWF).await.map_err(|err| {
        warn!(error = %err, "Exchange rate refresh failed");
        refresh_error(err)
    })?;
    let rwf_to_usd = provider.refresh(RWF, USD).await.map_err(refresh_error)?;
    info!(%usd_to_rwf, %rwf_to_usd, "Exchange rates refreshed");

    Ok(StdResponse {
        data: Some(RefreshedRates { usd_to_rwf, rwf_to_usd }),
        message: Some("Exchange rates refreshed"),
    })
}
