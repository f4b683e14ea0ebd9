use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conversion_delivery::audit::{AuditLogWriter, PgAuditSink};
use conversion_delivery::claim_store::PgClaimStore;
use conversion_delivery::config::Config;
use conversion_delivery::credentials::{PgCredentialResolver, StaticCredentialResolver};
use conversion_delivery::db::Database;
use conversion_delivery::engine::{DeliveryEngine, ProviderRegistration};
use conversion_delivery::handlers::{self, AppState};
use conversion_delivery::providers::{MetaAdapter, TikTokAdapter};
use conversion_delivery::transport::RetryingTransport;

/// Main entry point for the delivery service.
///
/// Wires the claim store, audit writer, credential resolver and one adapter
/// per provider into a single long-lived engine, then serves the HTTP API.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conversion_delivery=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let db = Database::new(&config.database_url).await?;
    db.ensure_schema().await?;
    tracing::info!("Database connection pool established");

    let claims = Arc::new(PgClaimStore::new(db.pool.clone()));
    let audit = AuditLogWriter::new(Arc::new(PgAuditSink::new(db.pool.clone())));

    let fallback = config
        .default_credentials()
        .into_iter()
        .fold(StaticCredentialResolver::new(), |resolver, (provider, creds)| {
            resolver.with_default(provider, creds)
        });
    let resolver = Arc::new(PgCredentialResolver::new(db.pool.clone()).with_fallback(fallback));

    let transport = RetryingTransport::new(config.retry_policy())?;
    tracing::info!(
        "Provider calls bounded at {:?} ({} attempts)",
        transport.policy().worst_case(),
        transport.policy().max_attempts
    );
    let breaker_config = config.breaker_config();

    let engine = DeliveryEngine::new(transport, claims, audit)
        .with_credential_resolver(resolver)
        .with_provider(ProviderRegistration::new(
            Arc::new(
                MetaAdapter::new(config.meta_channel)
                    .with_test_event_code(config.meta_test_event_code.clone()),
            ),
            config.meta_base_url.clone(),
            breaker_config.clone(),
        ))
        .with_provider(ProviderRegistration::new(
            Arc::new(
                TikTokAdapter::new().with_test_event_code(config.tiktok_test_event_code.clone()),
            ),
            config.tiktok_base_url.clone(),
            breaker_config,
        ));
    tracing::info!(
        "✓ Delivery engine ready (meta channel: {:?})",
        config.meta_channel
    );

    let app_state = Arc::new(AppState {
        engine: Arc::new(engine),
        config: config.clone(),
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limiter configuration"))?,
    );

    let protected_routes = Router::new()
        .route("/api/v1/conversions", post(handlers::send_conversion))
        .route(
            "/api/v1/entities/:entity_id/conversions/:level",
            post(handlers::report_entity_conversion),
        )
        .route("/api/v1/circuit-breakers", get(handlers::circuit_breakers))
        .route("/api/v1/claims/reconcile", post(handlers::reconcile_claims))
        .layer(
            ServiceBuilder::new()
                // Request size limit: 1MB max payload
                .layer(RequestBodyLimitLayer::new(1024 * 1024))
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
