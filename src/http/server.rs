//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the catch-all proxy handler
//! - Wire up middleware (request ID, tracing)
//! - Build the shared pool, upstream and exchange tracker
//! - Bind server to listener
//! - Bounded graceful shutdown: drain, then cancel, then close the pool

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{Request, Response},
    routing::any,
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::ProxyConfig;
use crate::error::ServerError;
use crate::lifecycle::DrainController;
use crate::pool::ConnectionPool;
use crate::proxy::{Dispatcher, ExchangeTracker, ReloadableUpstream};

/// How long cancelled exchanges get to unwind before `run` returns anyway.
const CANCEL_SETTLE: Duration = Duration::from_secs(1);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

/// HTTP server for the reverse proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
    upstream: Arc<ReloadableUpstream>,
    pool: Arc<ConnectionPool>,
    exchanges: ExchangeTracker,
    drain: Arc<DrainController>,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let upstream = Arc::new(
            ReloadableUpstream::from_config(&config.backend).map_err(ServerError::Backend)?,
        );
        let pool = Arc::new(ConnectionPool::new(
            config.pool.clone(),
            Duration::from_secs(config.timeouts.connect_secs),
        ));
        let exchanges = ExchangeTracker::new();
        let drain = Arc::new(DrainController::new());

        let dispatcher = Dispatcher::new(
            &config,
            upstream.clone(),
            pool.clone(),
            exchanges.clone(),
            drain.watcher(),
        );
        let state = AppState {
            dispatcher: Arc::new(dispatcher),
        };

        Ok(Self {
            router: Self::build_router(state),
            config,
            upstream,
            pool,
            exchanges,
            drain,
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        let middleware = ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(
                TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                    let request_id = request
                        .headers()
                        .get("x-request-id")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("unknown");
                    tracing::info_span!(
                        "request",
                        method = %request.method(),
                        uri = %request.uri(),
                        request_id = %request_id,
                    )
                }),
            )
            .layer(PropagateRequestIdLayer::x_request_id());

        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state)
            .layer(middleware)
    }

    /// Run the server until `shutdown` fires and in-flight exchanges settle.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            backend = %self.upstream.current().base_url(),
            "HTTP server starting"
        );

        let HttpServer {
            router,
            config,
            pool,
            exchanges,
            drain,
            ..
        } = self;
        let grace = Duration::from_secs(config.shutdown.grace_period_secs);

        let signal_drain = drain.clone();
        let signal_exchanges = exchanges.clone();
        let signal = async move {
            let _ = shutdown.recv().await;
            tracing::info!(
                in_flight = signal_exchanges.active_count(),
                "Shutdown signal received, draining"
            );
            signal_drain.start_draining();
        };

        let app = router.into_make_service_with_connect_info::<SocketAddr>();
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .into_future();

        let deadline = async {
            drain.watcher().draining().await;
            tokio::time::sleep(grace).await;
        };

        tokio::select! {
            result = serve => result?,
            _ = deadline => {
                tracing::warn!(
                    in_flight = exchanges.active_count(),
                    grace_secs = grace.as_secs(),
                    "Grace period elapsed, cancelling in-flight exchanges"
                );
                drain.cancel();
                if !exchanges.drain(CANCEL_SETTLE).await {
                    tracing::warn!(
                        in_flight = exchanges.active_count(),
                        "Exchanges still unwinding after cancellation"
                    );
                }
            }
        }

        pool.clear();
        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// The hot-reloadable backend target.
    pub fn upstream(&self) -> &Arc<ReloadableUpstream> {
        &self.upstream
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn exchanges(&self) -> &ExchangeTracker {
        &self.exchanges
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

/// Catch-all handler: every method and path goes to the backend.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response<Body> {
    state.dispatcher.dispatch(request).await
}
