//! Operation adapters: one descriptor per supported operation name, and the
//! code that turns a driver call into a stream of [`Outcome`]s.

use std::sync::Arc;

use futures_util::future;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use storelane_core::{
    Collection, CursorCall, Database, DirectCall, DispatchError, Outcome, Payload, Value,
};

/// Outcomes of one invocation, ending at the first terminal outcome.
pub type OutcomeStream = BoxStream<'static, Outcome>;

/// Scope an adapter runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeLevel {
    /// The connected database.
    Database,
    /// One named collection of the database.
    Collection,
}

/// How an adapter invokes the driver and shapes the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterShape {
    /// Single-result call; one `End` with the result.
    Direct(DirectCall),
    /// Cursor drained into one `End` carrying every item in order.
    CursorCollect(CursorCall),
    /// One `Iteration` per cursor item, then an empty `End`.
    CursorStream(CursorCall),
    /// No remote call; ends with the scope handle itself.
    ScopeIdentity,
}

/// Resolved target handed to [`OperationAdapter::invoke`].
#[derive(Clone)]
pub enum Scope {
    Database(Arc<dyn Database>),
    Collection(Arc<dyn Collection>),
}

impl Scope {
    #[must_use]
    pub fn level(&self) -> ScopeLevel {
        match self {
            Self::Database(_) => ScopeLevel::Database,
            Self::Collection(_) => ScopeLevel::Collection,
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(db) => f.debug_tuple("Database").field(&db.name()).finish(),
            Self::Collection(c) => f.debug_tuple("Collection").field(&c.name()).finish(),
        }
    }
}

/// Immutable descriptor of one operation.
///
/// `arity` counts the positional arguments of the underlying call including
/// the trailing callback slot, so an adapter receives at most `arity - 1`
/// arguments. Zero means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationAdapter {
    name: &'static str,
    arity: usize,
    scope: ScopeLevel,
    shape: AdapterShape,
}

impl OperationAdapter {
    #[must_use]
    pub const fn new(name: &'static str, arity: usize, scope: ScopeLevel, shape: AdapterShape) -> Self {
        Self {
            name,
            arity,
            scope,
            shape,
        }
    }

    /// A collection-level single-result call.
    #[must_use]
    pub const fn direct(name: &'static str, arity: usize, call: DirectCall) -> Self {
        Self::new(name, arity, ScopeLevel::Collection, AdapterShape::Direct(call))
    }

    const fn collect(name: &'static str, call: CursorCall) -> Self {
        Self::new(name, 0, ScopeLevel::Collection, AdapterShape::CursorCollect(call))
    }

    const fn stream(name: &'static str, call: CursorCall) -> Self {
        Self::new(name, 0, ScopeLevel::Collection, AdapterShape::CursorStream(call))
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.arity
    }

    #[must_use]
    pub fn scope(&self) -> ScopeLevel {
        self.scope
    }

    #[must_use]
    pub fn shape(&self) -> AdapterShape {
        self.shape
    }

    /// Starts the operation against `scope`.
    ///
    /// # Errors
    ///
    /// Fails synchronously when the scope level does not match the adapter or
    /// the driver rejects a cursor before it opens. Failures after that arrive
    /// as an `Error` outcome on the stream.
    pub fn invoke(&self, scope: Scope, args: Vec<Value>) -> Result<OutcomeStream, DispatchError> {
        if scope.level() != self.scope {
            return Err(match self.scope {
                ScopeLevel::Collection => DispatchError::MissingCollection,
                ScopeLevel::Database => {
                    DispatchError::InternalInvariant("database adapter invoked on a collection")
                }
            });
        }
        match (self.shape, scope) {
            (AdapterShape::ScopeIdentity, Scope::Database(db)) => {
                Ok(single(Outcome::End(Some(Payload::Database(db)))))
            }
            (AdapterShape::ScopeIdentity, Scope::Collection(c)) => {
                Ok(single(Outcome::End(Some(Payload::Collection(c)))))
            }
            (AdapterShape::Direct(call), Scope::Collection(collection)) => {
                let call_result = async move {
                    match collection.execute(call, args).await {
                        Ok(value) => Outcome::end_with(value),
                        Err(err) => Outcome::Error(DispatchError::operation(err)),
                    }
                };
                Ok(stream::once(call_result).boxed())
            }
            (AdapterShape::CursorCollect(call), Scope::Collection(collection)) => {
                let cursor = collection
                    .open_cursor(call, args)
                    .map_err(DispatchError::operation)?;
                let drained = async move {
                    match cursor.try_collect::<Vec<_>>().await {
                        Ok(items) => Outcome::end_with(Value::Array(items)),
                        Err(err) => Outcome::Error(DispatchError::operation(err)),
                    }
                };
                Ok(stream::once(drained).boxed())
            }
            (AdapterShape::CursorStream(call), Scope::Collection(collection)) => {
                let cursor = collection
                    .open_cursor(call, args)
                    .map_err(DispatchError::operation)?;
                let items = cursor.map(|item| match item {
                    Ok(value) => Outcome::Iteration(value),
                    Err(err) => Outcome::Error(DispatchError::operation(err)),
                });
                Ok(until_terminal(items.chain(stream::once(future::ready(Outcome::End(None))))))
            }
            (_, Scope::Database(_)) => Err(DispatchError::MissingCollection),
        }
    }
}

fn single(outcome: Outcome) -> OutcomeStream {
    stream::once(future::ready(outcome)).boxed()
}

/// Cuts the stream after its first terminal outcome.
fn until_terminal<S>(outcomes: S) -> OutcomeStream
where
    S: futures_util::Stream<Item = Outcome> + Send + 'static,
{
    outcomes
        .scan(false, |finished, outcome| {
            if *finished {
                return future::ready(None);
            }
            *finished = outcome.is_terminal();
            future::ready(Some(outcome))
        })
        .boxed()
}

/// Operations every registry starts with.
pub static STANDARD_OPERATIONS: &[OperationAdapter] = &[
    OperationAdapter::direct("insertOne", 3, DirectCall::InsertOne),
    OperationAdapter::direct("insertMany", 3, DirectCall::InsertMany),
    OperationAdapter::direct("bulkWrite", 3, DirectCall::BulkWrite),
    OperationAdapter::direct("updateOne", 4, DirectCall::UpdateOne),
    OperationAdapter::direct("updateMany", 4, DirectCall::UpdateMany),
    OperationAdapter::direct("replaceOne", 4, DirectCall::ReplaceOne),
    OperationAdapter::direct("deleteOne", 3, DirectCall::DeleteOne),
    OperationAdapter::direct("deleteMany", 3, DirectCall::DeleteMany),
    OperationAdapter::direct("findOne", 3, DirectCall::FindOne),
    OperationAdapter::direct("findOneAndUpdate", 4, DirectCall::FindOneAndUpdate),
    OperationAdapter::direct("findOneAndReplace", 4, DirectCall::FindOneAndReplace),
    OperationAdapter::direct("findOneAndDelete", 3, DirectCall::FindOneAndDelete),
    OperationAdapter::direct("countDocuments", 3, DirectCall::CountDocuments),
    OperationAdapter::direct("estimatedDocumentCount", 2, DirectCall::EstimatedDocumentCount),
    OperationAdapter::direct("distinct", 4, DirectCall::Distinct),
    OperationAdapter::direct("createIndex", 3, DirectCall::CreateIndex),
    OperationAdapter::direct("dropIndex", 3, DirectCall::DropIndex),
    OperationAdapter::direct("indexExists", 3, DirectCall::IndexExists),
    OperationAdapter::direct("indexes", 2, DirectCall::Indexes),
    OperationAdapter::direct("drop", 2, DirectCall::Drop),
    OperationAdapter::direct("rename", 3, DirectCall::Rename),
    OperationAdapter::direct("stats", 2, DirectCall::Stats),
    OperationAdapter::direct("isCapped", 2, DirectCall::IsCapped),
    OperationAdapter::direct("options", 2, DirectCall::Options),
    OperationAdapter::collect("find.toArray", CursorCall::Find),
    OperationAdapter::stream("find.forEach", CursorCall::Find),
    OperationAdapter::collect("aggregate.toArray", CursorCall::Aggregate),
    OperationAdapter::stream("aggregate.forEach", CursorCall::Aggregate),
    OperationAdapter::collect("listIndexes.toArray", CursorCall::ListIndexes),
    OperationAdapter::stream("listIndexes.forEach", CursorCall::ListIndexes),
    OperationAdapter::new("db", 1, ScopeLevel::Database, AdapterShape::ScopeIdentity),
    OperationAdapter::new("collection", 1, ScopeLevel::Collection, AdapterShape::ScopeIdentity),
];

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use serde_json::json;
    use storelane_core::DocumentStream;

    use super::*;
    use crate::memory::MemoryDatabase;

    async fn seeded_collection() -> Arc<dyn Collection> {
        let db = MemoryDatabase::new("shop");
        let collection = db.collection("orders");
        collection
            .execute(
                DirectCall::InsertMany,
                vec![Value::from(json!([{"n": 1}, {"n": 2}, {"n": 3}]))],
            )
            .await
            .unwrap();
        collection
    }

    fn adapter(name: &str) -> OperationAdapter {
        *STANDARD_OPERATIONS.iter().find(|a| a.name() == name).unwrap()
    }

    #[tokio::test]
    async fn stream_and_collect_agree_on_items_and_order() {
        let collection = seeded_collection().await;

        let streamed: Vec<Outcome> = adapter("find.forEach")
            .invoke(Scope::Collection(collection.clone()), vec![Value::Null])
            .unwrap()
            .collect()
            .await;
        assert_eq!(streamed.len(), 4);
        assert!(matches!(streamed.last(), Some(Outcome::End(None))));
        let iterated: Vec<Value> = streamed
            .into_iter()
            .filter_map(|o| match o {
                Outcome::Iteration(v) => Some(v),
                _ => None,
            })
            .collect();

        let collected: Vec<Outcome> = adapter("find.toArray")
            .invoke(Scope::Collection(collection), vec![Value::Null])
            .unwrap()
            .collect()
            .await;
        assert_eq!(collected.len(), 1);
        let Some(Outcome::End(Some(Payload::Value(Value::Array(items))))) = collected.into_iter().next() else {
            panic!("expected a single End with an array");
        };
        assert_eq!(items, iterated);
    }

    /// Cursor that dies after its first document.
    struct DyingCursorCollection;

    #[async_trait::async_trait]
    impl Collection for DyingCursorCollection {
        fn name(&self) -> &str {
            "dying"
        }

        async fn execute(&self, call: DirectCall, _args: Vec<Value>) -> anyhow::Result<Value> {
            anyhow::bail!("{} is not supported", call.method())
        }

        fn open_cursor(&self, _call: CursorCall, _args: Vec<Value>) -> anyhow::Result<DocumentStream> {
            Ok(futures_util::stream::iter([
                Ok(Value::Int(1)),
                Err(anyhow::anyhow!("cursor died")),
                Ok(Value::Int(3)),
            ])
            .boxed())
        }
    }

    #[tokio::test]
    async fn cursor_failure_midway_ends_both_shapes_with_an_error() {
        let collection: Arc<dyn Collection> = Arc::new(DyingCursorCollection);

        let streamed: Vec<Outcome> = adapter("find.forEach")
            .invoke(Scope::Collection(collection.clone()), vec![Value::Null])
            .unwrap()
            .collect()
            .await;
        match streamed.as_slice() {
            [Outcome::Iteration(Value::Int(1)), Outcome::Error(err)] => {
                assert_eq!(err.kind(), storelane_core::ErrorKind::Operation);
                assert!(err.to_string().contains("cursor died"));
            }
            other => panic!("unexpected outcomes {other:?}"),
        }

        let collected: Vec<Outcome> = adapter("find.toArray")
            .invoke(Scope::Collection(collection), vec![Value::Null])
            .unwrap()
            .collect()
            .await;
        match collected.as_slice() {
            [Outcome::Error(err)] => assert!(err.to_string().contains("cursor died")),
            other => panic!("unexpected outcomes {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_cursor_fails_synchronously() {
        let collection = seeded_collection().await;
        let err = adapter("aggregate.forEach")
            .invoke(
                Scope::Collection(collection),
                vec![Value::from(json!([{"$bucket": {}}]))],
            )
            .err()
            .unwrap();
        assert_eq!(err.kind(), storelane_core::ErrorKind::Operation);
    }

    #[tokio::test]
    async fn direct_failure_is_an_error_outcome() {
        let collection = seeded_collection().await;
        let outcomes: Vec<Outcome> = adapter("rename")
            .invoke(Scope::Collection(collection), vec![Value::from("other")])
            .unwrap()
            .collect()
            .await;
        assert!(matches!(outcomes.as_slice(), [Outcome::Error(_)]));
    }

    #[tokio::test]
    async fn scope_identity_returns_the_scope() {
        let db: Arc<dyn Database> = MemoryDatabase::new("shop");
        let outcomes: Vec<Outcome> = adapter("db")
            .invoke(Scope::Database(db), vec![])
            .unwrap()
            .collect()
            .await;
        match outcomes.as_slice() {
            [Outcome::End(Some(Payload::Database(db)))] => assert_eq!(db.name(), "shop"),
            other => panic!("unexpected outcomes {other:?}"),
        }
    }

    #[test]
    fn collection_adapters_need_a_collection() {
        let db: Arc<dyn Database> = MemoryDatabase::new("shop");
        let err = adapter("findOne")
            .invoke(Scope::Database(db), vec![Value::Null])
            .err()
            .unwrap();
        assert!(matches!(err, DispatchError::MissingCollection));
    }

    #[test]
    fn standard_table_uses_driver_method_names() {
        for adapter in STANDARD_OPERATIONS {
            match adapter.shape() {
                AdapterShape::Direct(call) => assert_eq!(adapter.name(), call.method()),
                AdapterShape::CursorCollect(call) => {
                    assert_eq!(adapter.name(), format!("{}.toArray", call.method()));
                    assert_eq!(adapter.arity(), 0);
                }
                AdapterShape::CursorStream(call) => {
                    assert_eq!(adapter.name(), format!("{}.forEach", call.method()));
                    assert_eq!(adapter.arity(), 0);
                }
                AdapterShape::ScopeIdentity => assert_eq!(adapter.arity(), 1),
            }
        }
    }
}
