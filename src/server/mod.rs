//! HTTP service boundary.
//!
//! Every request to `/` goes through an [`AdmissionGate`]: throttled subjects
//! get `429`, and limiter failures are handled by the configured policy.

mod gate;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tracing::{error, info};

use crate::config::SubjectSource;
use crate::error::Result;

pub use gate::{Admission, AdmissionGate, Decision};
pub use routes::AppState;

/// HTTP server fronting the rate limiter.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Handler state
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, gate: Arc<AdmissionGate>, subject: SubjectSource) -> Self {
        Self {
            addr,
            state: AppState { gate, subject },
        }
    }

    /// The router serving the rate-limited API.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(routes::index))
            .route("/health", get(routes::health))
            .with_state(self.state.clone())
    }

    /// Serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            subject = ?self.state.subject,
            policy = ?self.state.gate.policy(),
            "HTTP server listening"
        );

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailurePolicy;
    use crate::ratelimit::{KeyedLimiter, WindowConfig, WindowFactory};

    #[tokio::test]
    async fn test_serves_and_shuts_down() {
        let factory = WindowFactory::local(WindowConfig::default());
        let limiters = Arc::new(KeyedLimiter::new(factory, 10).unwrap());
        let gate = Arc::new(AdmissionGate::new(limiters, FailurePolicy::FailOpen));

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(addr, gate, SubjectSource::Global);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_with_shutdown(async move {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
