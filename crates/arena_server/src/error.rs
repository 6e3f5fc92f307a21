//! Error types for the connection layer.

/// Failures raised by the server itself, as opposed to rejected commands,
/// which are reported to the client and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding, handshake and socket failures
    #[error("Network error: {0}")]
    Network(String),

    /// Encoding failures and other faults inside the server
    #[error("Internal error: {0}")]
    Internal(String),
}
