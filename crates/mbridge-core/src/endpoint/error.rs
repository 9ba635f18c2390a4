//! # mbridge Endpoint Errors
use thiserror::Error;

use crate::storage::error::StorageSystemError;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Endpoint '{id}' does not exist")]
    NotFound { id: String },

    #[error("Endpoint '{id}' failed to {operation}: {message}")]
    ServerFailed {
        id: String,
        operation: String,
        message: String,
    },

    #[error("Passcode {0} is not allowed")]
    InvalidPasscode(u32),

    #[error("Discriminator {0} is out of range")]
    InvalidDiscriminator(u16),

    #[error("Endpoint storage error: {0}")]
    Storage(#[from] StorageSystemError),
}

impl EndpointError {
    pub fn server(id: &str, operation: &str, message: impl Into<String>) -> Self {
        EndpointError::ServerFailed {
            id: id.to_string(),
            operation: operation.to_string(),
            message: message.into(),
        }
    }
}
