use anyhow::Context;
use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;

use crate::{
    app_error::{AppError, StdResponse},
    app_state::AppState,
    checkout::{self, CheckoutRequest},
    middleware,
    models::{OrderEntity, OrderItemEntity, PaymentEntity},
    payments, reconciliation,
    schema::{order_items, orders},
};

/// Defines customer-facing order routes.
pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        "/customers/orders",
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_orders, create_order))
            .routes(utoipa_axum::routes!(get_order))
            .routes(utoipa_axum::routes!(cancel_order))
            .route_layer(axum::middleware::from_fn(middleware::customers_authorization)),
    )
}

#[derive(Serialize, ToSchema)]
pub struct OrderRes {
    pub order: OrderEntity,
    pub order_items: Vec<OrderItemEntity>,
    pub latest_payment: Option<PaymentEntity>,
}

/// List the caller's orders, newest first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Orders"],
    security(("userId" = [])),
    responses(
        (status = 200, description = "List orders", body = StdResponse<Vec<OrderEntity>, String>)
    )
)]
async fn get_orders(
    State(state): State<AppState>,
    Extension(user_id): Extension<i32>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let orders: Vec<OrderEntity> = orders::table
        .filter(orders::user_id.eq(user_id))
        .order_by(orders::created_at.desc())
        .select(OrderEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get orders")?;

    Ok(StdResponse {
        data: Some(orders),
        message: Some("Get orders successfully"),
    })
}

/// Create an order from a prepared cart.
///
/// Prices are recomputed server-side and must match the submitted subtotal.
#[utoipa::path(
    post,
    path = "/",
    tags = ["Orders"],
    security(("userId" = [])),
    request_body = CheckoutRequest,
    responses(
        (status = 200, description = "Order created", body = StdResponse<OrderRes, String>),
        (status = 400, description = "Invalid cart")
    )
)]
async fn create_order(
    State(state): State<AppState>,
    Extension(user_id): Extension<i32>,
    Json(req): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let rates = checkout::load_rates(conn).await?;
    let converter = state.converter();
    let prepared =
        checkout::prepare_order(&req, &state.config.currency.default_currency, &converter, &rates).await?;

    let billing_contact_id = req.contact_ids.as_ref().and_then(|ids| ids.billing);
    let billing = checkout::resolve_billing(conn, user_id, billing_contact_id, req.billing.as_ref()).await?;
    let (order, order_items) = checkout::create_order(conn, user_id, prepared, billing).await?;

    Ok(StdResponse {
        data: Some(OrderRes {
            order,
            order_items,
            latest_payment: None,
        }),
        message: Some("Order created successfully"),
    })
}

/// Fetch one of the caller's orders with its items.
#[utoipa::path(
    get,
    path = "/{id}",
    tags = ["Orders"],
    security(("userId" = [])),
    params(
        ("id" = i32, Path, description = "Order ID to fetch")
    ),
    responses(
        (status = 200, description = "Get order successfully", body = StdResponse<OrderRes, String>),
        (status = 404, description = "Order not found")
    )
)]
async fn get_order(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(user_id): Extension<i32>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let order: OrderEntity = orders::table
        .find(id)
        .filter(orders::user_id.eq(user_id))
        .select(OrderEntity::as_select())
        .first(conn)
        .await?;

    let order_items: Vec<OrderItemEntity> = order_items::table
        .filter(order_items::order_id.eq(order.id))
        .order_by(order_items::id.asc())
        .select(OrderItemEntity::as_select())
        .get_results(conn)
        .await
        .context("Failed to get order items")?;

    let latest_payment = payments::latest_attempt(conn, order.id).await?;

    Ok(StdResponse {
        data: Some(OrderRes {
            order,
            order_items,
            latest_payment,
        }),
        message: Some("Get order successfully"),
    })
}

/// Cancel a pending order and its pending payment attempts.
#[utoipa::path(
    post,
    path = "/{id}/cancel",
    tags = ["Orders"],
    security(("userId" = [])),
    params(
        ("id" = i32, Path, description = "Order ID to cancel")
    ),
    responses(
        (status = 200, description = "Order cancelled", body = StdResponse<OrderEntity, String>),
        (status = 400, description = "Order is not pending")
    )
)]
async fn cancel_order(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Extension(user_id): Extension<i32>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let order = reconciliation::cancel_order(conn, user_id, id).await?;

    Ok(StdResponse {
        data: Some(order),
        message: Some("Order cancelled successfully"),
    })
}

#[cfg(test)]
mod tests {
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::{app_state::tests::offline_state, config::AppConfig};

    #[tokio::test]
    async fn order_routes_require_a_customer() {
        let (router, _) = routes_with_openapi().split_for_parts();
        let app: Router = router.with_state(offline_state(AppConfig::sample()));

        let res = app
            .oneshot(Request::get("/customers/orders/1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn order_routes_are_documented() {
        let openapi = routes_with_openapi().into_openapi();
        let paths = &openapi.paths.paths;
        assert!(paths.contains_key("/customers/orders/{id}"));
        assert!(paths.contains_key("/customers/orders/{id}/cancel"));
    }
}
