//! Failure values carried through coroutine resume paths

use serde_json::Value;

/// An error surfaced to or out of a coroutine body.
///
/// `ErrorEvent` and `Fatal` wrap payloads that arrived on an error channel,
/// produced by the [`error_exception`](crate::error_exception) and
/// [`error_log`](crate::error_log) policies. `Failure` is the general escape
/// hatch for bodies and pool jobs. Any of these propagating out of a body
/// marks the coroutine `Failed` and reaches the runtime's failure handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EventError {
    /// A failure payload delivered on an error channel, surfaced as a
    /// catchable value
    #[error("error event in {context}: {data}")]
    ErrorEvent {
        /// Description of the wait site that received the payload
        context: String,
        /// The payload as posted
        data: Value,
    },

    /// A failure payload delivered on an error channel, already logged and
    /// escalated as non-recoverable
    #[error("fatal error event in {context}: {data}")]
    Fatal {
        /// Description of the wait site that received the payload
        context: String,
        /// The payload as posted
        data: Value,
    },

    /// Any other failure a body chooses to report
    #[error("{0}")]
    Failure(String),
}

impl EventError {
    /// The error-channel payload, when this error carries one
    pub fn data(&self) -> Option<&Value> {
        match self {
            EventError::ErrorEvent { data, .. } | EventError::Fatal { data, .. } => Some(data),
            EventError::Failure(_) => None,
        }
    }

    /// Whether this error took the log-and-escalate path
    pub fn is_fatal(&self) -> bool {
        matches!(self, EventError::Fatal { .. })
    }
}
