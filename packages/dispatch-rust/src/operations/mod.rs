//! Operation registry and argument normalization.

mod adapter;

use std::collections::BTreeMap;

use storelane_core::Value;

pub use adapter::{
    AdapterShape, OperationAdapter, OutcomeStream, Scope, ScopeLevel, STANDARD_OPERATIONS,
};

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// Name-keyed table of adapters. Built once, then shared read-only.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    adapters: BTreeMap<&'static str, OperationAdapter>,
}

impl OperationRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding [`STANDARD_OPERATIONS`].
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for adapter in STANDARD_OPERATIONS {
            registry.register(*adapter);
        }
        registry
    }

    /// Adds `adapter`, replacing any adapter with the same name.
    pub fn register(&mut self, adapter: OperationAdapter) {
        self.adapters.insert(adapter.name(), adapter);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&OperationAdapter> {
        self.adapters.get(name)
    }

    /// Operation names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.adapters.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Coerces a task payload into the positional arguments of an adapter.
///
/// An array is taken element by element and any other value becomes a single
/// argument. An empty list gets one `Null` placeholder. For `arity > 0` at
/// most `arity - 1` arguments are kept, the last slot belonging to the
/// callback.
#[must_use]
pub fn normalize_arguments(payload: Value, arity: usize) -> Vec<Value> {
    let mut args = match payload {
        Value::Array(items) => items,
        other => vec![other],
    };
    if args.is_empty() {
        args.push(Value::Null);
    }
    if arity > 0 && args.len() > arity - 1 {
        tracing::debug!(
            supplied = args.len(),
            kept = arity - 1,
            "discarding arguments beyond the declared arity"
        );
        args.truncate(arity - 1);
    }
    args
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use futures_util::StreamExt;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use storelane_core::{Collection, CursorCall, DirectCall, DocumentStream, Outcome};

    use super::*;

    /// Collection that records the arguments of every direct call.
    #[derive(Default)]
    struct RecordingCollection {
        calls: Mutex<Vec<(DirectCall, Vec<Value>)>>,
    }

    #[async_trait]
    impl Collection for RecordingCollection {
        fn name(&self) -> &str {
            "recorded"
        }

        async fn execute(&self, call: DirectCall, args: Vec<Value>) -> anyhow::Result<Value> {
            self.calls.lock().push((call, args));
            Ok(Value::Null)
        }

        fn open_cursor(&self, call: CursorCall, _args: Vec<Value>) -> anyhow::Result<DocumentStream> {
            anyhow::bail!("{} not recorded", call.method())
        }
    }

    #[test]
    fn names_are_sorted_and_cover_the_standard_table() {
        let registry = OperationRegistry::standard();
        let names = registry.names();
        assert_eq!(names.len(), STANDARD_OPERATIONS.len());
        assert!(names.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(names.contains(&"find.forEach"));
        assert!(registry.get("mapReduce").is_none());
    }

    #[test]
    fn register_replaces_by_name() {
        let mut registry = OperationRegistry::standard();
        let before = registry.len();
        registry.register(OperationAdapter::direct("findOne", 2, DirectCall::FindOne));
        assert_eq!(registry.len(), before);
        assert_eq!(registry.get("findOne").map(OperationAdapter::arity), Some(2));
    }

    #[test]
    fn bare_values_and_empty_lists_are_coerced() {
        assert_eq!(normalize_arguments(Value::Int(4), 0), vec![Value::Int(4)]);
        assert_eq!(normalize_arguments(Value::Array(vec![]), 0), vec![Value::Null]);
        assert_eq!(normalize_arguments(Value::Null, 3), vec![Value::Null]);
        assert!(normalize_arguments(Value::Int(1), 1).is_empty());
    }

    #[tokio::test]
    async fn arity_two_adapter_receives_only_the_first_argument() {
        let adapter = OperationAdapter::direct("findOne", 2, DirectCall::FindOne);
        let payload = Value::Array(vec![Value::from("a"), Value::from("b"), Value::from("c")]);
        let args = normalize_arguments(payload, adapter.arity());

        let collection = Arc::new(RecordingCollection::default());
        let outcomes: Vec<Outcome> = adapter
            .invoke(Scope::Collection(collection.clone()), args)
            .unwrap()
            .collect()
            .await;

        assert_eq!(outcomes.len(), 1);
        let calls = collection.calls.lock();
        assert_eq!(calls.as_slice(), &[(DirectCall::FindOne, vec![Value::from("a")])]);
    }

    proptest! {
        #[test]
        fn normalized_length_respects_arity(len in 0usize..8, arity in 0usize..6) {
            let payload = Value::Array((0..len).map(|i| Value::Int(i as i64)).collect());
            let args = normalize_arguments(payload, arity);
            let padded = len.max(1);
            let expected = if arity > 0 { padded.min(arity - 1) } else { padded };
            prop_assert_eq!(args.len(), expected);
            for (i, arg) in args.iter().enumerate().filter(|_| len > 0) {
                prop_assert_eq!(arg, &Value::Int(i as i64));
            }
        }
    }
}
