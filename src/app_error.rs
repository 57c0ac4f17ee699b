use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::db::DieselError;

/// Uniform JSON envelope returned by every endpoint.
#[derive(Serialize, Debug, ToSchema)]
pub struct StdResponse<T, M> {
    pub data: Option<T>,
    pub message: Option<M>,
}

impl<T, M> IntoResponse for StdResponse<T, M>
where
    T: Serialize,
    M: Serialize,
{
    fn into_response(self) -> Response {
        (StatusCode::OK, Json(self)).into_response()
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Resource not found")]
    NotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    ForbiddenResource(String),

    #[error("{0} is unreachable")]
    ServiceUnreachable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<DieselError> for AppError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => AppError::NotFound,
            err => AppError::Other(err.into()),
        }
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::ForbiddenResource(_) => StatusCode::FORBIDDEN,
            AppError::ServiceUnreachable(_) => StatusCode::BAD_GATEWAY,
            AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            AppError::Other(err) => {
                tracing::error!(error = ?err, "Unhandled error");
                "Internal server error".to_string()
            }
            err => err.to_string(),
        };

        (
            status,
            Json(StdResponse::<(), String> {
                data: None,
                message: Some(message),
            }),
        )
            .into_response()
    }
}
