//! The uniform outcome protocol.
//!
//! Every task produces zero or more [`Outcome::Iteration`] values followed by
//! exactly one terminal outcome: [`Outcome::End`] or [`Outcome::Error`].

use std::fmt;
use std::sync::Arc;

use crate::driver::{Collection, Database};
use crate::error::DispatchError;
use crate::types::Value;

/// Final payload of a completed task.
#[derive(Clone)]
pub enum Payload {
    /// A document or scalar result.
    Value(Value),
    /// The database scope itself (scope-identity operations).
    Database(Arc<dyn Database>),
    /// A collection scope (scope-identity operations).
    Collection(Arc<dyn Collection>),
}

impl Payload {
    /// Returns the value if this payload carries one.
    #[must_use]
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Database(_) | Self::Collection(_) => None,
        }
    }

    /// Consumes the payload, keeping only a value result.
    #[must_use]
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(v) => Some(v),
            Self::Database(_) | Self::Collection(_) => None,
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Database(db) => f.debug_tuple("Database").field(&db.name()).finish(),
            Self::Collection(c) => f.debug_tuple("Collection").field(&c.name()).finish(),
        }
    }
}

/// One step of a task's result.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// One produced item. More outcomes follow.
    Iteration(Value),
    /// Successful completion. Streaming operations end without a payload.
    End(Option<Payload>),
    /// Failure. Terminal.
    Error(DispatchError),
}

impl Outcome {
    /// `End` and `Error` are terminal; `Iteration` is not.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Iteration(_))
    }

    /// Shorthand for a terminal `End` carrying a value.
    #[must_use]
    pub fn end_with(value: Value) -> Self {
        Self::End(Some(Payload::Value(value)))
    }
}

/// Outcome-delivery channel supplied with each task.
pub trait OutcomeSink: Send + Sync {
    fn deliver(&self, outcome: Outcome);
}

impl<F> OutcomeSink for F
where
    F: Fn(Outcome) + Send + Sync,
{
    fn deliver(&self, outcome: Outcome) {
        self(outcome);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn only_iteration_is_non_terminal() {
        assert!(!Outcome::Iteration(Value::Null).is_terminal());
        assert!(Outcome::End(None).is_terminal());
        assert!(Outcome::Error(DispatchError::MissingOperation).is_terminal());
    }

    #[test]
    fn closures_are_sinks() {
        let terminals = Arc::new(AtomicUsize::new(0));
        let sink = {
            let terminals = terminals.clone();
            move |outcome: Outcome| {
                if outcome.is_terminal() {
                    terminals.fetch_add(1, Ordering::SeqCst);
                }
            }
        };
        sink.deliver(Outcome::Iteration(Value::Int(1)));
        sink.deliver(Outcome::end_with(Value::Int(2)));
        assert_eq!(terminals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn payload_value_accessors() {
        let payload = Payload::Value(Value::Int(7));
        assert_eq!(payload.as_value(), Some(&Value::Int(7)));
        assert_eq!(payload.into_value(), Some(Value::Int(7)));
    }
}
