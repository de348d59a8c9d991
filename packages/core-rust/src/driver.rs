//! Driver-facing traits.
//!
//! The underlying document-store driver is a collaborator: it connects,
//! hands out database and collection handles, runs single-result calls and
//! opens cursors. Everything above this module only talks to these traits.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::types::Value;

/// Items produced by a driver cursor, in production order.
pub type DocumentStream = BoxStream<'static, anyhow::Result<Value>>;

/// Login for a deployment. Passed through to the driver untouched.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    #[serde(default)]
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything the driver needs to open one connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectTarget {
    /// Connection URI as configured.
    pub uri: String,
    /// Database selected from the URI path (empty for the driver default).
    pub database: String,
    /// Driver-specific options, forwarded verbatim.
    pub options: serde_json::Map<String, serde_json::Value>,
    pub credentials: Option<Credentials>,
}

/// Opens connections. One call per pooled resource.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect and select the target database.
    async fn connect(&self, target: &ConnectTarget) -> anyhow::Result<Arc<dyn Database>>;
}

/// A connected database handle, shared by every task bound to the resource.
#[async_trait]
pub trait Database: Send + Sync {
    fn name(&self) -> &str;

    /// Returns a handle to the named collection. Never touches the network.
    fn collection(&self, name: &str) -> Arc<dyn Collection>;

    /// Closes the underlying client. Called at most once per handle.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Operations on one collection.
#[async_trait]
pub trait Collection: Send + Sync {
    fn name(&self) -> &str;

    /// Runs a single-result call with positional arguments.
    async fn execute(&self, call: DirectCall, args: Vec<Value>) -> anyhow::Result<Value>;

    /// Opens a cursor. Errors returned here are raised before any item is produced.
    ///
    /// # Errors
    ///
    /// Returns an error if the arguments are rejected before the cursor opens.
    fn open_cursor(&self, call: CursorCall, args: Vec<Value>) -> anyhow::Result<DocumentStream>;
}

/// Single-result collection calls known to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectCall {
    InsertOne,
    InsertMany,
    BulkWrite,
    UpdateOne,
    UpdateMany,
    ReplaceOne,
    DeleteOne,
    DeleteMany,
    FindOne,
    FindOneAndUpdate,
    FindOneAndReplace,
    FindOneAndDelete,
    CountDocuments,
    EstimatedDocumentCount,
    Distinct,
    CreateIndex,
    DropIndex,
    IndexExists,
    Indexes,
    Drop,
    Rename,
    Stats,
    IsCapped,
    Options,
}

impl DirectCall {
    /// The driver's method name for this call.
    #[must_use]
    pub fn method(self) -> &'static str {
        match self {
            Self::InsertOne => "insertOne",
            Self::InsertMany => "insertMany",
            Self::BulkWrite => "bulkWrite",
            Self::UpdateOne => "updateOne",
            Self::UpdateMany => "updateMany",
            Self::ReplaceOne => "replaceOne",
            Self::DeleteOne => "deleteOne",
            Self::DeleteMany => "deleteMany",
            Self::FindOne => "findOne",
            Self::FindOneAndUpdate => "findOneAndUpdate",
            Self::FindOneAndReplace => "findOneAndReplace",
            Self::FindOneAndDelete => "findOneAndDelete",
            Self::CountDocuments => "countDocuments",
            Self::EstimatedDocumentCount => "estimatedDocumentCount",
            Self::Distinct => "distinct",
            Self::CreateIndex => "createIndex",
            Self::DropIndex => "dropIndex",
            Self::IndexExists => "indexExists",
            Self::Indexes => "indexes",
            Self::Drop => "drop",
            Self::Rename => "rename",
            Self::Stats => "stats",
            Self::IsCapped => "isCapped",
            Self::Options => "options",
        }
    }
}

/// Cursor-returning collection calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CursorCall {
    Find,
    Aggregate,
    ListIndexes,
}

impl CursorCall {
    #[must_use]
    pub fn method(self) -> &'static str {
        match self {
            Self::Find => "find",
            Self::Aggregate => "aggregate",
            Self::ListIndexes => "listIndexes",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials {
            user: "app".into(),
            password: "s3cret".into(),
        };
        let printed = format!("{creds:?}");
        assert!(printed.contains("app"));
        assert!(!printed.contains("s3cret"));
    }

    #[test]
    fn method_names_match_driver() {
        assert_eq!(DirectCall::FindOneAndUpdate.method(), "findOneAndUpdate");
        assert_eq!(CursorCall::ListIndexes.method(), "listIndexes");
    }
}
