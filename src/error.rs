//! The daemon's error taxonomy and its HTTP rendering.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::warn;

use crate::lang::EvalError;
use crate::machine::MachineId;

/// Closed set of failures crossing the core boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The machine's evaluator rejected an expression. Client-recoverable.
    #[error(transparent)]
    InvalidInput(#[from] EvalError),
    /// A storage or pub/sub operation failed. Retriable by the client.
    #[error("ipfs: {0}")]
    Ipfs(String),
    /// No matching acknowledgement arrived in time; the writer may be offline.
    #[error("timed out waiting for the writer to acknowledge")]
    AckTimeout,
    /// An internal invariant did not hold.
    #[error("daemon error: {0}")]
    Daemon(String),
    /// Registry insert hit an existing entry.
    #[error("machine `{0}` already cached")]
    MachineAlreadyCached(MachineId),
    /// Registry operation on an entry that is not there.
    #[error("machine `{0}` not cached")]
    MachineNotCached(MachineId),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::AckTimeout => StatusCode::GATEWAY_TIMEOUT,
            Error::Ipfs(_)
            | Error::Daemon(_)
            | Error::MachineAlreadyCached(_)
            | Error::MachineNotCached(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("request failed: {}", self);
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
