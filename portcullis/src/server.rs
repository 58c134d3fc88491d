//! HTTP server assembly and graceful shutdown
//!
//! Builds the middleware pipeline around the router. Axum applies layers
//! outside-in as they are added, so the pipeline stages appear here in
//! reverse: the last `.layer(...)` call runs first on each request.

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    limit::RequestBodyLimitLayer,
    sensitive_headers::SetSensitiveRequestHeadersLayer,
    timeout::TimeoutLayer,
};

use crate::{
    error::Result,
    handlers, health,
    middleware::{self, security_headers::apply_security_headers, SENSITIVE_HEADERS},
    proxy,
    state::AppState,
};

/// Gateway server
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a server over the prepared state
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Bind and serve until a shutdown signal arrives
    pub async fn serve(self) -> Result<()> {
        let config = self.state.config();
        let addr = SocketAddr::from(([0, 0, 0, 0], config.service.port));

        tracing::info!("starting {} on {}", config.service.name, addr);

        let app = build_router(self.state.clone());

        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("listening on {}", addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        tracing::info!("server shutdown complete");
        Ok(())
    }
}

/// Assemble the router and the ordered pipeline
pub fn build_router(state: AppState) -> Router {
    let config = state.config().clone();
    let body_limit = config.service.body_limit_mb * 1024 * 1024;

    let app = Router::new()
        .route("/health", get(health::health))
        .route("/health/detailed", get(health::health_detailed))
        .route("/auth/signup", post(handlers::auth::signup))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh", post(handlers::auth::refresh))
        .route("/auth/logout", post(handlers::auth::logout))
        // Everything else is a proxy candidate
        .fallback(proxy::handler)
        // Pipeline stages, innermost first (stage 6 up to stage 1)
        .layer(from_fn_with_state(
            state.clone(),
            middleware::metrics::middleware,
        ))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::rate_limit::middleware,
        ))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::authn::middleware,
        ))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::ip_filter::middleware,
        ))
        .layer(from_fn(middleware::logger::middleware))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::context::middleware,
        ))
        .with_state(state);

    let app = apply_security_headers(app, &config.service.name);

    app.layer(sensitive_headers_layer())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.service.timeout_secs,
        )))
        .layer(build_cors_layer(&config.cors.allowed_origins))
        // Panic recovery wraps everything
        .layer(CatchPanicLayer::new())
}

/// Mask credential headers in trace output
fn sensitive_headers_layer() -> SetSensitiveRequestHeadersLayer {
    let headers = SENSITIVE_HEADERS
        .iter()
        .filter_map(|h| h.parse().ok())
        .collect::<Vec<_>>();
    SetSensitiveRequestHeadersLayer::new(headers)
}

/// CORS from the configured origin list; `["*"]` is permissive
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }

    let origins: Vec<axum::http::HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        },
    }

    tracing::info!("shutdown signal received, draining requests...");
}
