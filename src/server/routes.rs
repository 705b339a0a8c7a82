//! HTTP handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, instrument};

use super::gate::{Admission, AdmissionGate};
use crate::config::SubjectSource;
use crate::ratelimit::GLOBAL_SUBJECT;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<AdmissionGate>,
    pub subject: SubjectSource,
}

impl AppState {
    /// The rate-limited subject a request from `peer` belongs to.
    pub fn subject_for(&self, peer: SocketAddr) -> String {
        match self.subject {
            SubjectSource::Global => GLOBAL_SUBJECT.to_string(),
            SubjectSource::ClientIp => peer.ip().to_string(),
        }
    }
}

/// The rate-limited endpoint.
#[instrument(skip_all)]
pub async fn index(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let subject = state.subject_for(peer);
    debug!(peer = %peer, subject = %subject, "Handling request");

    match state.gate.admit(&subject).await {
        Admission::Admit => (StatusCode::OK, "Welcome to the api").into_response(),
        Admission::Throttle => (StatusCode::TOO_MANY_REQUESTS, "Ratelimit exceeded").into_response(),
        Admission::Unavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "Rate limiter unavailable").into_response()
        }
    }
}

/// Liveness probe, never rate limited.
pub async fn health() -> &'static str {
    "ok"
}
