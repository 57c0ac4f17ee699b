//! Identity is asserted by the upstream gateway through `x-user-id` and
//! `x-user-role`; these layers only read it.

use axum::{extract::Request, middleware::Next, response::Response};

use crate::app_error::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

fn user_id(req: &Request) -> Option<i32> {
    req.headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// Requires a customer identity and exposes it as `Extension<i32>`.
pub async fn customers_authorization(mut req: Request, next: Next) -> Result<Response, AppError> {
    let user_id = user_id(&req).ok_or_else(|| AppError::Unauthorized("Missing or invalid user id".into()))?;
    req.extensions_mut().insert(user_id);
    Ok(next.run(req).await)
}

pub async fn admins_authorization(mut req: Request, next: Next) -> Result<Response, AppError> {
    let is_admin = req
        .headers()
        .get(USER_ROLE_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|role| role.trim().eq_ignore_ascii_case("admin"));

    if !is_admin {
        return Err(AppError::ForbiddenResource("Admin access required".into()));
    }
    if let Some(user_id) = user_id(&req) {
        req.extensions_mut().insert(user_id);
    }
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use axum::{Extension, Router, body::Body, http::StatusCode, routing::get};
    use tower::ServiceExt;

    use super::*;

    fn app() -> Router {
        Router::new()
            .route(
                "/customer",
                get(|Extension(user_id): Extension<i32>| async move { user_id.to_string() })
                    .route_layer(axum::middleware::from_fn(customers_authorization)),
            )
            .route(
                "/admin",
                get(|| async { "ok" }).route_layer(axum::middleware::from_fn(admins_authorization)),
            )
    }

    fn request(uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn customer_identity_is_injected() {
        let res = app().oneshot(request("/customer", &[(USER_ID_HEADER, "42")])).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"42");
    }

    #[tokio::test]
    async fn missing_or_invalid_user_is_unauthorized() {
        let res = app().oneshot(request("/customer", &[])).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app().oneshot(request("/customer", &[(USER_ID_HEADER, "abc")])).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_routes_require_the_admin_role() {
        let res = app().oneshot(request("/admin", &[(USER_ROLE_HEADER, "customer")])).await.unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);

        let res = app().oneshot(request("/admin", &[(USER_ROLE_HEADER, "Admin")])).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
}
