//! HTTP API server for the story voice gateway

pub mod auth;
pub mod gateway;
pub mod health;
pub mod protocol;
pub mod rate_limit;
pub mod sessions;
pub mod websocket;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use secrecy::SecretString;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::db::DbPool;
use crate::session::SessionRegistry;

pub use auth::{AuthOutcome, TokenValidator};
pub use gateway::{Inbound, Outbound, ProtocolGateway, close_code};
pub use protocol::{ClientMessage, ServerEvent, parse_client_message};

/// Shared state for API handlers
pub struct ApiState {
    pub db: DbPool,
    pub registry: Arc<SessionRegistry>,
    pub gateway: Arc<ProtocolGateway>,
    pub api_key: Option<SecretString>,
    pub rate_limiter: Option<rate_limit::SharedLimiter>,
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    db: DbPool,
    registry: Arc<SessionRegistry>,
    port: u16,
    api_key: Option<SecretString>,
    jwt_secret: Option<SecretString>,
    rate_limit_per_minute: u32,
    idle_timeout: Duration,
    orphan_ttl: Duration,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub const fn new(db: DbPool, registry: Arc<SessionRegistry>) -> Self {
        Self {
            db,
            registry,
            port: 8090,
            api_key: None,
            jwt_secret: None,
            rate_limit_per_minute: 120,
            idle_timeout: Duration::from_secs(120),
            orphan_ttl: Duration::from_secs(600),
        }
    }

    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Require `Authorization: Bearer <key>` on session routes
    #[must_use]
    pub fn api_key(mut self, key: Option<SecretString>) -> Self {
        self.api_key = key;
        self
    }

    /// Validate connection tokens as HS256 JWTs signed with `secret`
    #[must_use]
    pub fn jwt_secret(mut self, secret: Option<SecretString>) -> Self {
        self.jwt_secret = secret;
        self
    }

    /// Global request budget; zero disables limiting
    #[must_use]
    pub const fn rate_limit_per_minute(mut self, rpm: u32) -> Self {
        self.rate_limit_per_minute = rpm;
        self
    }

    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn orphan_ttl(mut self, ttl: Duration) -> Self {
        self.orphan_ttl = ttl;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        let validator = Arc::new(TokenValidator::new(self.jwt_secret.as_ref()));
        let gateway = Arc::new(ProtocolGateway::new(
            Arc::clone(&self.registry),
            validator,
            self.idle_timeout,
        ));

        let state = Arc::new(ApiState {
            db: self.db,
            registry: self.registry,
            gateway,
            api_key: self.api_key,
            rate_limiter: rate_limit::create_limiter(self.rate_limit_per_minute),
        });

        ApiServer {
            state,
            port: self.port,
            orphan_ttl: self.orphan_ttl,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
    orphan_ttl: Duration,
}

impl ApiServer {
    #[must_use]
    pub fn state(&self) -> &Arc<ApiState> {
        &self.state
    }

    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let router = Router::new()
            .nest("/api/sessions", sessions::router(self.state.clone()))
            .nest("/ws", websocket::router(self.state.clone()))
            .merge(health::router())
            .merge(health::ready_router(self.state.clone()));

        let router = router.layer(axum::middleware::from_fn_with_state(
            self.state.clone(),
            rate_limit::rate_limit_middleware,
        ));

        // CORS layer for cross-origin requests from frontend
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` resolves, then drain sessions
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        let reaper = spawn_orphan_reaper(Arc::clone(&self.state.registry), self.orphan_ttl);
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;
        reaper.abort();

        self.state.registry.shutdown().await;
        served.map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;
        Ok(())
    }
}

/// Periodically end sessions nobody is connected to
pub fn spawn_orphan_reaper(
    registry: Arc<SessionRegistry>,
    ttl: Duration,
) -> tokio::task::JoinHandle<()> {
    let period = (ttl / 4).max(Duration::from_secs(5));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let reaped = registry.reap_orphans(ttl).await;
            if reaped > 0 {
                tracing::info!(count = reaped, "reaped orphaned sessions");
            }
        }
    })
}
