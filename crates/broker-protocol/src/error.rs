// The three error kinds the core surfaces to callers (spec §7). Each is the
// sole outcome of a failed high-level call; nothing here is retried
// automatically by the core itself.

use thiserror::Error;

/// Invalid PIN, invalid second factor, handshake network failure, or the
/// `AuthState != AUTHENTICATED` gate check.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
    #[error("login failed: {message}")]
    LoginFailed {
        message: String,
        /// The broker's error code, when the error envelope carried one.
        code: Option<String>,
    },
    #[error("second factor rejected: {message}")]
    SecondFactorRejected {
        message: String,
        code: Option<String>,
    },
    #[error("handshake request failed: {0}")]
    Network(String),
    #[error("not authenticated")]
    NotAuthenticated,
    #[error("operation not supported by the broker")]
    NotSupported,
}

/// Malformed frame, JSON parse failure, delta against a missing baseline,
/// connect-message send failure, or a dead connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("subscription {id}: delta frame with no baseline")]
    NoBaseline { id: u64 },
    #[error("subscription {id}: JSON parse failure: {message}")]
    Json { id: u64, message: String },
    #[error("subscription {id}: unknown delta instruction '{instruction}'")]
    UnknownDeltaInstruction { id: u64, instruction: String },
    #[error("delta reconstruction produced invalid UTF-16 for subscription {id}")]
    InvalidUtf16 { id: u64 },
    #[error("failed to send connect frame: {0}")]
    ConnectSendFailed(String),
    #[error("connection is dead")]
    ConnectionDead,
}

/// The broker returned an `E` frame for an active subscription.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("subscription {id} failed: {message}")]
pub struct SubscriptionError {
    pub id: u64,
    pub message: String,
}

/// A distinguished signal (not a failure) raised mid-handshake: the caller
/// should prompt for the second-factor code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondFactorRequired {
    pub masked_phone: String,
    pub process_id: String,
}
