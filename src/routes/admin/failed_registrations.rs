use anyhow::Context;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderValue,
    response::{IntoResponse, Redirect, Response},
};
use diesel::{ExpressionMethods, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;

use crate::{
    app_error::{AppError, StdResponse},
    app_state::AppState,
    checkout::hints::ContactIds,
    middleware,
    models::FailedDomainRegistrationEntity,
    recovery::{self, RetryOutcome},
    schema::failed_domain_registrations,
};

pub const FLASH_HEADER: &str = "x-flash-message";
const LIST_PATH: &str = "/admin/failed-registrations";

/// Defines admin routes for failed domain registrations.
pub fn routes_with_openapi() -> OpenApiRouter<AppState> {
    OpenApiRouter::new().nest(
        LIST_PATH,
        OpenApiRouter::new()
            .routes(utoipa_axum::routes!(get_failed_registrations))
            .routes(utoipa_axum::routes!(retry_failed_registration))
            .routes(utoipa_axum::routes!(manual_register_domain))
            .routes(utoipa_axum::routes!(abandon_failed_registration))
            .routes(utoipa_axum::routes!(retry_due_registrations))
            .route_layer(axum::middleware::from_fn(middleware::admins_authorization)),
    )
}

#[derive(Deserialize, IntoParams)]
pub struct FailedRegistrationsQuery {
    /// `pending`, `retrying`, `resolved` or `abandoned`.
    pub status: Option<String>,
}

/// List failed registrations, newest first.
#[utoipa::path(
    get,
    path = "/",
    tags = ["Admin"],
    security(("userRole" = [])),
    params(FailedRegistrationsQuery),
    responses(
        (status = 200, description = "List failed registrations", body = StdResponse<Vec<FailedDomainRegistrationEntity>, String>)
    )
)]
async fn get_failed_registrations(
    State(state): State<AppState>,
    Query(query): Query<FailedRegistrationsQuery>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let mut records = failed_domain_registrations::table
        .order_by(failed_domain_registrations::created_at.desc())
        .select(FailedDomainRegistrationEntity::as_select())
        .into_boxed();
    if let Some(status) = query.status.as_deref().filter(|s| !s.trim().is_empty()) {
        records = records.filter(failed_domain_registrations::status.eq(status.trim().to_string()));
    }

    let records: Vec<FailedDomainRegistrationEntity> = records
        .get_results(conn)
        .await
        .context("Failed to get failed registrations")?;

    Ok(StdResponse {
        data: Some(records),
        message: Some("Get failed registrations successfully"),
    })
}

/// Flash message shown after a manual retry.
pub fn flash_message(result: &Result<RetryOutcome, AppError>) -> String {
    match result {
        Ok(RetryOutcome::Registered { domain_name }) => {
            format!("Domain {domain_name} has been successfully registered!")
        }
        Ok(RetryOutcome::Failed { reason }) => format!("Registration failed: {reason}"),
        Ok(RetryOutcome::Refused) => "This registration cannot be retried. It has either been resolved or exceeded the maximum retry attempts.".into(),
        Err(err) => format!("An error occurred: {err}"),
    }
}

/// `/admin/failed-registrations?flash=...`
pub fn flash_location(message: &str) -> String {
    match Url::parse_with_params(&format!("http://localhost{LIST_PATH}"), &[("flash", message)]) {
        Ok(url) => format!("{}?{}", url.path(), url.query().unwrap_or_default()),
        Err(_) => LIST_PATH.to_string(),
    }
}

fn flash_redirect(message: &str) -> Response {
    let mut res = Redirect::to(&flash_location(message)).into_response();
    match HeaderValue::from_str(message) {
        Ok(value) => {
            res.headers_mut().insert(FLASH_HEADER, value);
        }
        Err(_) => warn!(message, "Flash message is not a valid header value"),
    }
    res
}

/// Manually retry a failed registration, then redirect back to the list.
#[utoipa::path(
    post,
    path = "/{id}/retry",
    tags = ["Admin"],
    security(("userRole" = [])),
    params(
        ("id" = i32, Path, description = "Failed registration ID to retry")
    ),
    responses(
        (status = 303, description = "Redirect to the list with a flash message")
    )
)]
async fn retry_failed_registration(Path(id): Path<i32>, State(state): State<AppState>) -> Response {
    let result = match state.db_pool.get().await {
        Ok(mut conn) => recovery::retry_registration(&mut conn, &state.registrars, &state.config.recovery, id).await,
        Err(err) => Err(AppError::Other(
            anyhow::Error::new(err).context("Failed to obtain a DB connection pool"),
        )),
    };

    let message = flash_message(&result);
    info!(failed_registration_id = id, message, "Manual registration retry");
    flash_redirect(&message)
}

#[derive(Deserialize, Debug, ToSchema)]
pub struct ManualRegistrationReq {
    pub registrant_contact_id: i32,
    /// Roles left out reuse the registrant.
    pub admin_contact_id: Option<i32>,
    pub technical_contact_id: Option<i32>,
    pub billing_contact_id: Option<i32>,
}

impl From<ManualRegistrationReq> for ContactIds {
    fn from(req: ManualRegistrationReq) -> Self {
        ContactIds {
            registrant: Some(req.registrant_contact_id),
            admin: req.admin_contact_id,
            tech: req.technical_contact_id,
            billing: req.billing_contact_id,
        }
    }
}

pub fn manual_flash_message(result: &Result<RetryOutcome, AppError>) -> String {
    match result {
        Ok(RetryOutcome::Refused) => "This registration has already been resolved.".into(),
        result => flash_message(result),
    }
}

/// Register a failed domain by hand with admin-chosen contacts, ignoring the
/// retry ceiling.
#[utoipa::path(
    post,
    path = "/{id}/manual-register",
    tags = ["Admin"],
    security(("userRole" = [])),
    params(
        ("id" = i32, Path, description = "Failed registration ID to register")
    ),
    request_body = ManualRegistrationReq,
    responses(
        (status = 303, description = "Redirect to the list with a flash message")
    )
)]
async fn manual_register_domain(
    Path(id): Path<i32>,
    State(state): State<AppState>,
    Json(req): Json<ManualRegistrationReq>,
) -> Response {
    let result = match state.db_pool.get().await {
        Ok(mut conn) => recovery::manual_register(&mut conn, &state.registrars, id, req.into()).await,
        Err(err) => Err(AppError::Other(
            anyhow::Error::new(err).context("Failed to obtain a DB connection pool"),
        )),
    };

    let message = manual_flash_message(&result);
    info!(failed_registration_id = id, message, "Manual domain registration");
    flash_redirect(&message)
}

/// Stop retrying a pending registration.
#[utoipa::path(
    post,
    path = "/{id}/abandon",
    tags = ["Admin"],
    security(("userRole" = [])),
    params(
        ("id" = i32, Path, description = "Failed registration ID to abandon")
    ),
    responses(
        (status = 200, description = "Registration abandoned", body = StdResponse<FailedDomainRegistrationEntity, String>),
        (status = 400, description = "Registration is not pending")
    )
)]
async fn abandon_failed_registration(
    Path(id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let record = recovery::abandon(conn, id).await?;

    Ok(StdResponse {
        data: Some(record),
        message: Some("Registration abandoned"),
    })
}

#[derive(Deserialize, IntoParams)]
pub struct RetryDueQuery {
    pub order_id: Option<i32>,
}

#[derive(Serialize, ToSchema)]
pub struct RetryResult {
    pub failed_registration_id: i32,
    pub outcome: RetryOutcome,
}

/// Retry every retryable registration, optionally for one order.
#[utoipa::path(
    post,
    path = "/retry-due",
    tags = ["Admin"],
    security(("userRole" = [])),
    params(RetryDueQuery),
    responses(
        (status = 200, description = "Retry outcomes", body = StdResponse<Vec<RetryResult>, String>)
    )
)]
async fn retry_due_registrations(
    State(state): State<AppState>,
    Query(query): Query<RetryDueQuery>,
) -> Result<impl IntoResponse, AppError> {
    let conn = &mut state
        .db_pool
        .get()
        .await
        .context("Failed to obtain a DB connection pool")?;

    let outcomes = recovery::retry_all(conn, &state.registrars, &state.config.recovery, query.order_id).await?;
    let registered = outcomes
        .iter()
        .filter(|(_, outcome)| matches!(outcome, RetryOutcome::Registered { .. }))
        .count();

    let results: Vec<RetryResult> = outcomes
        .into_iter()
        .map(|(failed_registration_id, outcome)| RetryResult {
            failed_registration_id,
            outcome,
        })
        .collect();

    Ok(StdResponse {
        message: Some(format!("Retried {} registrations, {registered} registered", results.len())),
        data: Some(results),
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

    #[test]
    fn flash_messages_cover_every_outcome() {
        assert_eq!(
            flash_message(&Ok(RetryOutcome::Registered {
                domain_name: "example.rw".into()
            })),
            "Domain example.rw has been successfully registered!"
        );
        assert_eq!(
            flash_message(&Ok(RetryOutcome::Failed {
                reason: "Registrar timeout".into()
            })),
            "Registration failed: Registrar timeout"
        );
        assert!(flash_message(&Ok(RetryOutcome::Refused)).starts_with("This registration cannot be retried."));
        assert_eq!(flash_message(&Err(AppError::NotFound)), "An error occurred: Resource not found");
    }

    #[test]
    fn manual_registration_flash_messages() {
        assert_eq!(
            manual_flash_message(&Ok(RetryOutcome::Refused)),
            "This registration has already been resolved."
        );
        assert_eq!(
            manual_flash_message(&Err(AppError::BadRequest("Contact 9 does not exist".into()))),
            "An error occurred: Contact 9 does not exist"
        );
    }

    #[test]
    fn manual_registration_roles_default_to_the_registrant() {
        let req: ManualRegistrationReq =
            serde_json::from_value(serde_json::json!({"registrant_contact_id": 4, "billing_contact_id": 5})).unwrap();
        let contacts = ContactIds::from(req).resolve().unwrap();
        assert_eq!((contacts.registrant, contacts.admin, contacts.tech, contacts.billing), (4, 4, 4, 5));
    }

    #[test]
    fn flash_is_carried_in_the_query() {
        let location = flash_location("Registration failed: a & b");
        assert!(location.starts_with("/admin/failed-registrations?flash="));
        assert!(!location.contains(' '));
        assert!(!location.contains("a & b"));
    }

    #[test]
    fn failed_registration_routes_are_documented() {
        let openapi = routes_with_openapi().into_openapi();
        let paths = &openapi.paths.paths;
        assert!(paths.contains_key("/admin/failed-registrations/{id}/retry"));
        assert!(paths.contains_key("/admin/failed-registrations/{id}/manual-register"));
        assert!(paths.contains_key("/admin/failed-registrations/{id}/abandon"));
    }

    #[tokio::test]
    async fn admin_routes_require_the_admin_role() {
        let (router, _) = routes_with_openapi().split_for_parts();
        let app: Router = router.with_state(offline_state(AppConfig::sample()));

        let res = app
            .oneshot(
                Request::post("/admin/failed-registrations/1/retry")
                    .header(middleware::USER_ROLE_HEADER, "customer")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }
}
