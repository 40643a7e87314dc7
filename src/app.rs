use crate::auth::{
    check_credentials, lookup_user, CredentialStore, MemoryCredentialStore, PgCredentialStore,
    Verifier,
};
use crate::secret;
use crate::settings::{Backend, Settings};
use axum::{
    handler::Handler,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Extension, Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct EnvError {}

/// Installs the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
pub fn init_tracing(settings: &Settings) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .or_else(|_| settings.base.rust_log.clone().ok_or(EnvError {}))
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn open_store(settings: &Settings) -> anyhow::Result<Arc<dyn CredentialStore>> {
    match settings.database.backend {
        Backend::Postgres => {
            let store = PgCredentialStore::connect(&settings.database).await?;
            if settings.database.run_migrations {
                tracing::info!("running database migrations");
                store.migrate().await?;
            }
            Ok(Arc::new(store))
        }
        Backend::Memory => {
            tracing::warn!("Memory backend should not be used in production!");
            let store = MemoryCredentialStore::new();
            for seed in &settings.auth.seed_users {
                store.insert_user(&seed.username, &seed.permissions).await?;
            }
            Ok(Arc::new(store))
        }
    }
}

/// Runs the server. Main entrypoint for the server app.
pub async fn run_server(settings: Settings) -> anyhow::Result<()> {
    let store = open_store(&settings).await?;
    let deriver = secret::from_settings(&settings.secret)?;
    if settings.auth.first_use_provisioning {
        tracing::info!("first-use provisioning enabled, unset passwords bind on first login");
    }
    let verifier = Verifier::new(
        store.clone(),
        deriver,
        settings.auth.first_use_provisioning,
    );

    let addr = settings.base.listen;
    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(router(verifier).into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, closing credential store");
    store.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("cannot listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// The HTTP API the host calls.
pub fn router(verifier: Verifier) -> Router {
    Router::new()
        .route("/users/:username", get(lookup_user))
        .route("/authenticate", post(check_credentials))
        .route("/health", get(|| async { "ok" }))
        .layer(Extension(verifier))
        .fallback(fallback.into_service())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

async fn fallback() -> impl IntoResponse {
    StatusCode::NOT_FOUND
}
