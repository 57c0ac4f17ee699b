use anyhow::{Context, Result};
use utoipa::openapi::{
    OpenApi,
    security::{ApiKey, ApiKeyValue, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::middleware::{USER_ID_HEADER, USER_ROLE_HEADER};

/// Serves the collected OpenAPI document under `/swagger-ui`.
pub fn create_swagger_ui(mut openapi: OpenApi) -> Result<SwaggerUi> {
    let components = openapi.components.get_or_insert_with(Default::default);
    components.add_security_scheme(
        "userId",
        SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(USER_ID_HEADER))),
    );
    components.add_security_scheme(
        "userRole",
        SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(USER_ROLE_HEADER))),
    );

    openapi
        .to_json()
        .context("Failed to serialize the OpenAPI document")?;

    Ok(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi))
}
