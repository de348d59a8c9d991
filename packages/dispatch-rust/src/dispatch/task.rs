use std::fmt;
use std::sync::Arc;

use storelane_core::{OutcomeSink, Value};

/// One consumer submission.
///
/// `operation` and `scope` select what runs and where; only `payload` reaches
/// the adapter, as its positional arguments.
#[derive(Clone)]
pub struct Task {
    pub(crate) operation: Option<String>,
    pub(crate) scope: Option<String>,
    pub(crate) payload: Value,
    pub(crate) sink: Arc<dyn OutcomeSink>,
}

impl Task {
    pub fn new(payload: impl Into<Value>, sink: impl OutcomeSink + 'static) -> Self {
        Self::with_sink(payload, Arc::new(sink))
    }

    /// Builds a task around an already shared sink.
    pub fn with_sink(payload: impl Into<Value>, sink: Arc<dyn OutcomeSink>) -> Self {
        Self {
            operation: None,
            scope: None,
            payload: payload.into(),
            sink,
        }
    }

    /// Names the operation. Ignored when the dispatcher has a default one.
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Names the collection. Ignored when the dispatcher has a default one.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    #[must_use]
    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    #[must_use]
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("operation", &self.operation)
            .field("scope", &self.scope)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}
