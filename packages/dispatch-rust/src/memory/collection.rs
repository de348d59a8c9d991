use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::RwLock;
use storelane_core::{Collection, CursorCall, DirectCall, DocumentStream, Value};

use super::filter::matches;

/// A vector of documents behind a lock, with driver-shaped results.
pub struct MemoryCollection {
    name: String,
    documents: RwLock<Vec<Value>>,
    indexes: RwLock<Vec<Value>>,
    next_id: AtomicI64,
    latency: Duration,
}

impl MemoryCollection {
    pub(crate) fn new(name: &str, latency: Duration) -> Self {
        Self {
            name: name.to_string(),
            documents: RwLock::new(Vec::new()),
            indexes: RwLock::new(vec![index_entry("_id_", Value::document([("_id", Value::Int(1))]))]),
            next_id: AtomicI64::new(1),
            latency,
        }
    }

    /// Copy of every stored document, in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Value> {
        self.documents.read().clone()
    }

    fn with_id(&self, doc: Value) -> anyhow::Result<(Value, Value)> {
        let Value::Map(mut fields) = doc else {
            bail!("document must be an object");
        };
        let id = fields
            .entry("_id".to_string())
            .or_insert_with(|| Value::Int(self.next_id.fetch_add(1, Ordering::Relaxed)))
            .clone();
        Ok((Value::Map(fields), id))
    }

    fn insert(&self, docs: Vec<Value>) -> anyhow::Result<Vec<Value>> {
        let prepared = docs
            .into_iter()
            .map(|doc| self.with_id(doc))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let mut documents = self.documents.write();
        let mut ids = Vec::with_capacity(prepared.len());
        for (doc, id) in prepared {
            if documents.iter().any(|existing| existing.get("_id") == Some(&id)) {
                bail!("duplicate key error: _id {id:?}");
            }
            documents.push(doc);
            ids.push(id);
        }
        Ok(ids)
    }

    fn find_matching(&self, filter: &Value) -> Vec<Value> {
        self.documents
            .read()
            .iter()
            .filter(|doc| matches(doc, filter))
            .cloned()
            .collect()
    }

    /// Applies `update` to the first match, or to every match when `many`.
    /// Returns the matched documents as they were before the update.
    ///
    /// Nothing is written unless the update applies to every match.
    fn update(&self, filter: &Value, update: &Value, many: bool) -> anyhow::Result<Vec<Value>> {
        let mut documents = self.documents.write();
        let mut staged = Vec::new();
        for (index, doc) in documents.iter().enumerate().filter(|(_, doc)| matches(doc, filter)) {
            let mut updated = doc.clone();
            apply_update(&mut updated, update)?;
            staged.push((index, updated));
            if !many {
                break;
            }
        }
        let originals = staged
            .into_iter()
            .map(|(index, updated)| std::mem::replace(&mut documents[index], updated))
            .collect();
        Ok(originals)
    }

    fn remove(&self, filter: &Value, many: bool) -> Vec<Value> {
        let mut documents = self.documents.write();
        let mut removed = Vec::new();
        let mut i = 0;
        while i < documents.len() {
            if matches(&documents[i], filter) && (many || removed.is_empty()) {
                removed.push(documents.remove(i));
            } else {
                i += 1;
            }
        }
        removed
    }

    fn replace(&self, filter: &Value, replacement: Value) -> anyhow::Result<Option<Value>> {
        let Value::Map(mut fields) = replacement else {
            bail!("replacement must be an object");
        };
        let mut documents = self.documents.write();
        let Some(doc) = documents.iter_mut().find(|doc| matches(doc, filter)) else {
            return Ok(None);
        };
        let original = doc.clone();
        if let Some(id) = original.get("_id") {
            fields.insert("_id".to_string(), id.clone());
        }
        *doc = Value::Map(fields);
        Ok(Some(original))
    }

    fn create_index(&self, key: &Value) -> anyhow::Result<Value> {
        let keys = key.as_map().context("index key must be an object")?;
        let name = keys
            .iter()
            .map(|(field, dir)| format!("{field}_{}", dir.as_i64().unwrap_or(1)))
            .collect::<Vec<_>>()
            .join("_");
        let mut indexes = self.indexes.write();
        if !indexes.iter().any(|index| index.get("name") == Some(&Value::from(name.as_str()))) {
            indexes.push(index_entry(&name, key.clone()));
        }
        Ok(Value::String(name))
    }

    fn aggregate(&self, pipeline: &Value) -> anyhow::Result<Vec<Value>> {
        let stages = match pipeline {
            Value::Null => &[][..],
            Value::Array(stages) => stages.as_slice(),
            _ => bail!("pipeline must be an array of stages"),
        };
        let mut docs = self.snapshot();
        for stage in stages {
            let (op, arg) = stage
                .as_map()
                .filter(|fields| fields.len() == 1)
                .and_then(|fields| fields.iter().next())
                .context("each pipeline stage must have exactly one operator")?;
            docs = match op.as_str() {
                "$match" => docs.into_iter().filter(|doc| matches(doc, arg)).collect(),
                "$skip" => docs.into_iter().skip(count_arg(op, arg)?).collect(),
                "$limit" => docs.into_iter().take(count_arg(op, arg)?).collect(),
                other => bail!("unsupported pipeline stage {other}"),
            };
        }
        Ok(docs)
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, call: DirectCall, args: Vec<Value>) -> anyhow::Result<Value> {
        self.pause().await;
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        let result = match call {
            DirectCall::InsertOne => {
                let ids = self.insert(vec![arg(0)])?;
                Value::document([
                    ("acknowledged", Value::Bool(true)),
                    ("insertedId", ids.into_iter().next().unwrap_or_default()),
                ])
            }
            DirectCall::InsertMany => {
                let Value::Array(docs) = arg(0) else {
                    bail!("insertMany expects an array of documents");
                };
                let ids = self.insert(docs)?;
                Value::document([
                    ("acknowledged", Value::Bool(true)),
                    ("insertedCount", Value::Int(len_i64(ids.len()))),
                    ("insertedIds", Value::Array(ids)),
                ])
            }
            DirectCall::FindOne => self
                .find_matching(&arg(0))
                .into_iter()
                .next()
                .unwrap_or_default(),
            DirectCall::UpdateOne | DirectCall::UpdateMany => {
                let originals =
                    self.update(&arg(0), &arg(1), call == DirectCall::UpdateMany)?;
                let n = Value::Int(len_i64(originals.len()));
                Value::document([("matchedCount", n.clone()), ("modifiedCount", n)])
            }
            DirectCall::ReplaceOne => {
                let n = i64::from(self.replace(&arg(0), arg(1))?.is_some());
                Value::document([("matchedCount", Value::Int(n)), ("modifiedCount", Value::Int(n))])
            }
            DirectCall::DeleteOne | DirectCall::DeleteMany => {
                let removed = self.remove(&arg(0), call == DirectCall::DeleteMany);
                Value::document([("deletedCount", Value::Int(len_i64(removed.len())))])
            }
            DirectCall::FindOneAndUpdate => found_value(self.update(&arg(0), &arg(1), false)?),
            DirectCall::FindOneAndReplace => {
                found_value(self.replace(&arg(0), arg(1))?.into_iter().collect())
            }
            DirectCall::FindOneAndDelete => found_value(self.remove(&arg(0), false)),
            DirectCall::CountDocuments => Value::Int(len_i64(self.find_matching(&arg(0)).len())),
            DirectCall::EstimatedDocumentCount => Value::Int(len_i64(self.documents.read().len())),
            DirectCall::Distinct => {
                let key = arg(0);
                let key = key.as_str().context("distinct expects a field name")?;
                let mut seen: Vec<Value> = Vec::new();
                for doc in self.find_matching(&arg(1)) {
                    if let Some(value) = doc.get(key) {
                        if !seen.contains(value) {
                            seen.push(value.clone());
                        }
                    }
                }
                Value::Array(seen)
            }
            DirectCall::CreateIndex => self.create_index(&arg(0))?,
            DirectCall::Indexes => Value::Array(self.indexes.read().clone()),
            DirectCall::IndexExists => {
                let indexes = self.indexes.read();
                let exists = |name: &Value| indexes.iter().any(|index| index.get("name") == Some(name));
                match arg(0) {
                    Value::Array(names) => Value::Bool(names.iter().all(exists)),
                    name => Value::Bool(exists(&name)),
                }
            }
            DirectCall::Drop => {
                self.documents.write().clear();
                Value::Bool(true)
            }
            other => return Err(anyhow!("{} is not supported by the in-memory driver", other.method())),
        };
        Ok(result)
    }

    fn open_cursor(&self, call: CursorCall, args: Vec<Value>) -> anyhow::Result<DocumentStream> {
        let docs: Vec<Value> = match call {
            CursorCall::Find => {
                let options = args.get(1).cloned().unwrap_or_default();
                let skip = options.get("skip").and_then(Value::as_i64).unwrap_or(0);
                let limit = options.get("limit").and_then(Value::as_i64).unwrap_or(0);
                let docs = self
                    .find_matching(args.first().unwrap_or(&Value::Null))
                    .into_iter()
                    .skip(usize::try_from(skip).unwrap_or(0));
                if limit > 0 {
                    docs.take(usize::try_from(limit).unwrap_or(usize::MAX)).collect()
                } else {
                    docs.collect()
                }
            }
            CursorCall::Aggregate => self.aggregate(args.first().unwrap_or(&Value::Null))?,
            CursorCall::ListIndexes => self.indexes.read().clone(),
        };
        let latency = self.latency;
        let stream = stream::iter(docs).then(move |doc| async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            Ok::<_, anyhow::Error>(doc)
        });
        Ok(stream.boxed())
    }
}

fn index_entry(name: &str, key: Value) -> Value {
    Value::document([("v", Value::Int(2)), ("key", key), ("name", Value::from(name))])
}

/// Applies `$set`, `$unset` and `$inc` to a document.
fn apply_update(doc: &mut Value, update: &Value) -> anyhow::Result<()> {
    let Value::Map(fields) = doc else {
        bail!("stored document is not an object");
    };
    let operators = update.as_map().context("update must be an object")?;
    for (op, arg) in operators {
        let arg: &BTreeMap<String, Value> = arg
            .as_map()
            .with_context(|| format!("{op} expects an object"))?;
        match op.as_str() {
            "$set" => {
                for (k, v) in arg {
                    fields.insert(k.clone(), v.clone());
                }
            }
            "$unset" => {
                for k in arg.keys() {
                    fields.remove(k);
                }
            }
            "$inc" => {
                for (k, by) in arg {
                    let current = fields.get(k).cloned().unwrap_or(Value::Int(0));
                    let next = match (current, by) {
                        (Value::Int(a), Value::Int(b)) => Value::Int(
                            a.checked_add(*b)
                                .with_context(|| format!("$inc overflows field {k}"))?,
                        ),
                        (Value::Float(a), Value::Float(b)) => Value::Float(a + b),
                        #[allow(clippy::cast_precision_loss)]
                        (Value::Int(a), Value::Float(b)) => Value::Float(a as f64 + b),
                        #[allow(clippy::cast_precision_loss)]
                        (Value::Float(a), Value::Int(b)) => Value::Float(a + *b as f64),
                        _ => bail!("cannot apply $inc to non-numeric field {k}"),
                    };
                    fields.insert(k.clone(), next);
                }
            }
            other => bail!("unsupported update operator {other}"),
        }
    }
    Ok(())
}

fn count_arg(op: &str, arg: &Value) -> anyhow::Result<usize> {
    arg.as_i64()
        .and_then(|n| usize::try_from(n).ok())
        .with_context(|| format!("{op} expects a non-negative integer"))
}

fn found_value(mut docs: Vec<Value>) -> Value {
    if docs.is_empty() {
        Value::document([("value", Value::Null)])
    } else {
        Value::document([("value", docs.swap_remove(0))])
    }
}

#[allow(clippy::cast_possible_wrap)]
fn len_i64(n: usize) -> i64 {
    n as i64
}
