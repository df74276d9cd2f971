//! Error types for gateway-bridge

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Transport failure or unexpected close while calls were outstanding.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The gateway refused the `connect` handshake for a reason other than
    /// a missing device nonce.
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// The gateway answered the application request with `ok: false`.
    #[error("Gateway error: {0}")]
    Application(String),

    #[error("All {attempts} gateway candidates failed, last error: {last}")]
    AllCandidatesExhausted {
        attempts: usize,
        last: Box<GatewayError>,
    },

    #[error("Gateway unavailable for {0}: no candidate endpoints")]
    NoCandidates(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// Unwrap failover wrapping to the error of the last attempt.
    pub fn root(&self) -> &GatewayError {
        match self {
            GatewayError::AllCandidatesExhausted { last, .. } => last.root(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), GatewayError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
