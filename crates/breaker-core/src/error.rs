//! Hub errors.

use crate::transport::TransportError;
use std::any::Any;
use thiserror::Error;

/// Errors produced by the hub.
///
/// Only [`InvalidArgument`](Self::InvalidArgument), [`InvalidConfig`](Self::InvalidConfig)
/// and [`Closed`](Self::Closed) are returned to callers. Transport failures
/// and faults happen on background tasks and go to the configured error
/// handler instead.
#[derive(Debug, Error)]
pub enum HubError {
    /// A caller passed an argument the hub cannot act on.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The hub configuration failed validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The hub has shut down.
    #[error("Hub is closed")]
    Closed,

    /// A transport operation failed.
    #[error("Transport error in {context}: {source}")]
    Transport {
        /// Where the failure was observed.
        context: &'static str,
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },

    /// A panic was caught while processing work.
    #[error("Internal fault in {context}: {message}")]
    Fault {
        /// Where the panic was caught.
        context: &'static str,
        /// Panic message.
        message: String,
    },
}

impl HubError {
    /// Wrap a transport error.
    #[must_use]
    pub fn transport(context: &'static str, source: TransportError) -> Self {
        Self::Transport { context, source }
    }

    /// Build a fault from a caught panic payload.
    #[must_use]
    pub fn panic(context: &'static str, payload: &(dyn Any + Send)) -> Self {
        Self::Fault {
            context,
            message: panic_message(payload),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
