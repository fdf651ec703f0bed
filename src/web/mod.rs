//! Web server module: the JSON API consumed by the dashboard gateway.

mod handlers;

pub use handlers::*;

use crate::aggregate::LiveBuckets;
use crate::alert::AlertDispatcher;
use crate::config::EngineConfig;
use crate::db::Store;
use crate::scheduler::Scheduler;
use crate::status::StatusTracker;

use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: EngineConfig,
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
    pub tracker: Arc<StatusTracker>,
    pub live: Arc<LiveBuckets>,
    pub dispatcher: AlertDispatcher,
}

/// API server for uptimed.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(
        config: EngineConfig,
        store: Arc<Store>,
        scheduler: Arc<Scheduler>,
        tracker: Arc<StatusTracker>,
        live: Arc<LiveBuckets>,
        dispatcher: AlertDispatcher,
    ) -> Self {
        Self {
            state: AppState {
                config,
                store,
                scheduler,
                tracker,
                live,
                dispatcher,
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/websites", get(handlers::handle_get_websites))
            .route("/website", post(handlers::handle_create_website))
            .route("/website/{id}", get(handlers::handle_get_website))
            .route("/website/{id}", delete(handlers::handle_delete_website))
            .route("/website/{id}/alert-test", post(handlers::handle_alert_test))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("API server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
