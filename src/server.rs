//! # Server Configuration
//!
//! Application state, router assembly and the HTTP server lifecycle. The
//! dispatch worker can run inside the server process when
//! `LOOM_WORKER_EMBEDDED=true`; it shares the server's shutdown token.

use std::sync::Arc;

use anyhow::{Context, anyhow};
use axum::{
    Router,
    http::{HeaderName, HeaderValue, Method, header},
    middleware,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::crypto::CryptoKey;
use crate::dispatcher::DispatchWorker;
use crate::drafts::{DraftGenerator, OpenAiDraftGenerator};
use crate::handlers::{self, connections, followups};
use crate::providers::ProviderRegistry;
use crate::repositories::connection::ConnectionRepository;
use crate::repositories::followup_job::FollowUpStore;
use crate::telemetry;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub followups: FollowUpStore,
    pub connections: Arc<ConnectionRepository>,
    pub dispatcher: Arc<DispatchWorker>,
    /// `None` when no draft endpoint is configured
    pub drafts: Option<Arc<dyn DraftGenerator>>,
}

impl AppState {
    /// Builds the production state: real provider adapters and, when
    /// configured, the draft generator.
    pub fn from_config(config: Arc<AppConfig>, db: DatabaseConnection) -> anyhow::Result<Self> {
        let key_bytes = config
            .crypto_key
            .clone()
            .ok_or_else(|| anyhow!("LOOM_CRYPTO_KEY is required"))?;
        let crypto_key = CryptoKey::new(key_bytes).context("invalid crypto key")?;

        let connections = Arc::new(ConnectionRepository::new(Arc::new(db.clone()), crypto_key));
        let providers = ProviderRegistry::from_config(
            &config.providers,
            Arc::clone(&connections),
            config.worker.send_timeout(),
        )
        .context("failed to build provider HTTP client")?;

        let drafts = OpenAiDraftGenerator::from_config(&config.drafts)
            .context("failed to build draft HTTP client")?
            .map(|generator| Arc::new(generator) as Arc<dyn DraftGenerator>);

        Ok(Self::assemble(config, db, connections, providers, drafts))
    }

    /// Wires the state from already-built parts.
    pub fn assemble(
        config: Arc<AppConfig>,
        db: DatabaseConnection,
        connections: Arc<ConnectionRepository>,
        providers: ProviderRegistry,
        drafts: Option<Arc<dyn DraftGenerator>>,
    ) -> Self {
        let followups = FollowUpStore::new(db.clone());
        let dispatcher = DispatchWorker::new(
            followups.clone(),
            Arc::clone(&connections),
            providers,
            config.worker.clone(),
        )
        .with_from_name(config.providers.default_from_name.clone());

        Self {
            config,
            db,
            followups,
            connections,
            dispatcher: Arc::new(dispatcher),
            drafts,
        }
    }
}

fn cors_layer(config: &AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("x-user-id"),
        ])
        .expose_headers([telemetry::TRACE_ID_HEADER])
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route(
            "/followups",
            post(followups::create_followup).get(followups::list_followups),
        )
        .route("/followups/{id}", get(followups::get_followup))
        .route("/followups/{id}/cancel", post(followups::cancel_followup))
        .route("/followups/{id}/send-now", post(followups::send_now))
        .route("/followups/{id}/retry", post(followups::retry_followup))
        .route("/followups/{id}/replies", post(followups::record_reply))
        .route("/followups/{id}/draft", post(followups::generate_draft))
        .route("/followups/{id}/attempts", get(followups::list_attempts))
        .route(
            "/replies",
            post(followups::record_inbound_reply).get(followups::list_replies),
        )
        .route("/replies/{id}", get(followups::get_reply))
        .route(
            "/connections",
            post(connections::create_connection).get(connections::list_connections),
        )
        .route(
            "/connections/{id}",
            get(connections::get_connection)
                .patch(connections::update_connection)
                .delete(connections::delete_connection),
        )
        .route(
            "/connections/{id}/validate",
            post(connections::validate_connection),
        )
        .route(
            "/connections/{id}/test-email",
            post(connections::send_test_email),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let cors = cors_layer(&state.config);

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(telemetry::trace_id_middleware))
        .layer(cors)
}

/// Resolves on ctrl-c or SIGTERM and cancels `token`.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = token.cancelled() => {}
    }

    tracing::info!("Shutdown signal received");
    token.cancel();
}

/// Starts the server with the given configuration
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    let state = AppState::from_config(Arc::clone(&config), db)?;
    let shutdown = CancellationToken::new();

    let worker = if config.worker.embedded {
        let dispatcher = Arc::clone(&state.dispatcher);
        let token = shutdown.clone();
        Some(tokio::spawn(async move { dispatcher.run(token).await }))
    } else {
        None
    };

    let app = create_app(state);

    // Resolve the configured bind address
    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        addr = %addr,
        profile = %config.profile,
        embedded_worker = config.worker.embedded,
        "Server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Some(handle) = worker
        && let Err(err) = handle.await
    {
        tracing::error!(error = %err, "Dispatch worker task failed");
    }

    tracing::info!("Server stopped");
    Ok(())
}

struct BearerAuthAddon;

impl Modify for BearerAuthAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::readyz,
        crate::handlers::followups::create_followup,
        crate::handlers::followups::list_followups,
        crate::handlers::followups::get_followup,
        crate::handlers::followups::cancel_followup,
        crate::handlers::followups::send_now,
        crate::handlers::followups::retry_followup,
        crate::handlers::followups::record_reply,
        crate::handlers::followups::record_inbound_reply,
        crate::handlers::followups::generate_draft,
        crate::handlers::followups::list_attempts,
        crate::handlers::followups::list_replies,
        crate::handlers::followups::get_reply,
        crate::handlers::connections::create_connection,
        crate::handlers::connections::list_connections,
        crate::handlers::connections::get_connection,
        crate::handlers::connections::update_connection,
        crate::handlers::connections::send_test_email,
        crate::handlers::connections::delete_connection,
        crate::handlers::connections::validate_connection,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::models::ConnectionStatus,
            crate::models::ProviderKind,
            crate::models::Tone,
            crate::error::ApiError,
            crate::handlers::HealthStatus,
            crate::handlers::followups::CreateFollowUpRequest,
            crate::handlers::followups::FollowUpInfo,
            crate::handlers::followups::FollowUpsResponse,
            crate::handlers::followups::SendNowResponse,
            crate::handlers::followups::RecordReplyRequest,
            crate::handlers::followups::ReplyInfo,
            crate::handlers::followups::ReplyResponse,
            crate::handlers::followups::GenerateDraftRequest,
            crate::handlers::followups::RepliesResponse,
            crate::handlers::followups::AttemptInfo,
            crate::handlers::followups::AttemptsResponse,
            crate::handlers::connections::CreateConnectionRequest,
            crate::handlers::connections::UpdateConnectionRequest,
            crate::handlers::connections::TestEmailRequest,
            crate::handlers::connections::TestEmailResponse,
            crate::handlers::connections::ConnectionInfo,
            crate::handlers::connections::ConnectionsResponse,
            crate::handlers::connections::ValidateConnectionResponse,
            crate::dispatcher::DispatchOutcome,
        )
    ),
    modifiers(&BearerAuthAddon),
    tags(
        (name = "followups", description = "Follow-up scheduling and control"),
        (name = "replies", description = "Inbound replies"),
        (name = "connections", description = "Email provider connections"),
        (name = "health", description = "Liveness and readiness checks")
    ),
    info(
        title = "Follow-up Scheduler API",
        description = "Schedules follow-up emails and dispatches them through per-user provider connections",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
