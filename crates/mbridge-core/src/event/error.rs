//! # mbridge Event System Errors
//!
//! Failures of the request/response side of the bus. Events never fail:
//! a handler that cannot process an event simply ignores it.
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventSystemError {
    #[error("No subscriber answered request '{message_type}' addressed to '{dst}'")]
    NoResponder { message_type: String, dst: String },

    #[error("Request '{id}' ({message_type}) timed out after {timeout:?}")]
    Timeout {
        id: String,
        message_type: String,
        timeout: Duration,
    },

    #[error("Responder for request '{message_type}' failed: {reason}")]
    ResponderFailed { message_type: String, reason: String },

    #[error("A request with id '{id}' is already in flight")]
    DuplicateRequest { id: String },

    #[error("Subscriber {id} is not registered")]
    UnknownSubscriber { id: u64 },
}
