//! Error types for the Gremlin protocol client

use thiserror::Error;

use crate::protocol::status;

pub type Result<T> = std::result::Result<T, GremlinError>;

/// Failure taxonomy shared by the connection and client layers.
///
/// Errors are cloneable because a single transport failure is broadcast to
/// every pending query.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GremlinError {
    #[error("Unable to decode server message: {0}")]
    Decode(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Script evaluation error: {0}")]
    ScriptEvaluation(String),

    #[error("Server timeout: {0}")]
    ServerTimeout(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Error with status code {code}: {message}")]
    UnknownStatus { code: u16, message: String },

    #[error("Received response for unknown request: {0}")]
    Orphan(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed unexpectedly")]
    UnexpectedClose,

    #[error("Query timed out waiting for a server response")]
    QueryTimeout,

    #[error("Connection closed")]
    ConnectionClosed,
}

impl GremlinError {
    /// Map a terminal failure status code to its error category.
    ///
    /// Codes with no dedicated category map to `UnknownStatus`.
    pub fn from_status(code: u16, message: &str) -> Self {
        let message = message.to_string();
        match code {
            status::UNAUTHORIZED => GremlinError::Unauthorized(message),
            status::MALFORMED_REQUEST => GremlinError::MalformedRequest(message),
            status::SERVER_ERROR => GremlinError::ServerError(message),
            status::SCRIPT_EVALUATION_ERROR => GremlinError::ScriptEvaluation(message),
            status::SERVER_TIMEOUT => GremlinError::ServerTimeout(message),
            status::SERIALIZATION_ERROR => GremlinError::Serialization(message),
            code => GremlinError::UnknownStatus { code, message },
        }
    }
}
