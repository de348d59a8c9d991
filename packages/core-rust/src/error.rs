//! Error taxonomy shared by the pool, the admission queue and the dispatcher.

use std::sync::Arc;

/// Coarse classification of a [`DispatchError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or invalid deployment, operation or scope. Fatal for one task.
    Configuration,
    /// The driver failed to connect. Shared by every waiter of the resource.
    Connection,
    /// The operation itself failed. Affects only the task that issued it.
    Operation,
    /// A bookkeeping check failed. Never expected under correct use.
    InternalInvariant,
}

/// Failure delivered to a consumer through an `Error` outcome.
///
/// `Clone` so one connection failure can be handed to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("missing or invalid deployment configuration: {reason}")]
    Configuration { reason: String },
    #[error("no operation defined")]
    MissingOperation,
    #[error("unknown operation: {name}")]
    UnknownOperation { name: String },
    #[error("no collection defined")]
    MissingCollection,
    #[error("consumer {consumer} is closed")]
    ConsumerClosed { consumer: String },
    #[error("failed to connect to {target}: {cause}")]
    Connection {
        target: String,
        cause: Arc<anyhow::Error>,
    },
    #[error("{0}")]
    Operation(Arc<anyhow::Error>),
    #[error("internal invariant violated: {0}")]
    InternalInvariant(&'static str),
}

impl DispatchError {
    /// Wraps a driver connect failure.
    #[must_use]
    pub fn connection(target: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Connection {
            target: target.into(),
            cause: Arc::new(source),
        }
    }

    /// Wraps a driver operation failure.
    #[must_use]
    pub fn operation(source: anyhow::Error) -> Self {
        Self::Operation(Arc::new(source))
    }

    /// Shorthand for [`DispatchError::Configuration`].
    #[must_use]
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. }
            | Self::MissingOperation
            | Self::UnknownOperation { .. }
            | Self::MissingCollection
            | Self::ConsumerClosed { .. } => ErrorKind::Configuration,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Operation(_) => ErrorKind::Operation,
            Self::InternalInvariant(_) => ErrorKind::InternalInvariant,
        }
    }
}
