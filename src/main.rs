use anyhow::Result;
use axum::Router;
use diesel_migrations::{EmbeddedMigrations, embed_migrations};
use registrar_billing::{
    bootstrap::{self, bootstrap},
    config, consumers, db, events, routes, swagger,
};

/// Migrations embedded into the binary which helps with streamlining image building process
const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::init_tracing();
    bootstrap::init_env();

    let routes = routes::customers::orders::routes_with_openapi()
        .merge(routes::customers::payments::routes_with_openapi())
        .merge(routes::webhooks::routes_with_openapi())
        .merge(routes::admin::failed_registrations::routes_with_openapi())
        .merge(routes::admin::currencies::routes_with_openapi());

    let mut openapi = routes.get_openapi().clone();
    openapi.info = utoipa::openapi::InfoBuilder::new()
        .title("RegistrarBilling API")
        .version("1.0.0")
        .build();
    let swagger_ui = swagger::create_swagger_ui(openapi)?;

    let app = Router::new().merge(routes).merge(swagger_ui);

    tracing::info!("Running migrations...");
    let config = config::load()?;
    let migrations_count = db::run_migrations_blocking(MIGRATIONS, &config.database.url).await?;
    tracing::info!("Run {} new migrations successfully", migrations_count);

    tracing::info!("Bootstrapping...");
    bootstrap(
        "RegistrarBilling",
        app,
        &[
            (events::ORDER_PAID, consumers::provisioning::order_paid),
            (events::RETRY_REGISTRATION, consumers::recovery::retry_registration),
            (events::ADMIN_NOTIFICATION, consumers::notifications::admin_notification),
        ],
    )
    .await?;
    Ok(())
}
