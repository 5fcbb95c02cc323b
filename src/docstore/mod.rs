//! Document database backing the `document` storage adapter
//!
//! Two backends implement [`DocumentBackend`]: the in-process
//! [`MemoryServer`] (tests, throwaway runs) and, with the `mongo` feature,
//! [`MongoClient`] for a real MongoDB server.
//!
//! Documents are JSON objects with a string `_id`, grouped in named
//! collections. Reads go through a small aggregation pipeline
//! ([`Stage::Match`], [`Stage::Unwind`], [`Stage::Project`]); writes are
//! inserts, field updates ([`Update::Set`], [`Update::Push`]) and deletes.
//!
//! # Example
//!
//! ```rust
//! use protos_db::docstore::{DocumentBackend, Filter, MemoryServer, Stage, Update};
//! use serde_json::json;
//!
//! # fn example() -> protos_db::Result<()> {
//! let client = MemoryServer::new().connect()?;
//! let id = client.insert("runs", json!({"name": "scan", "bundles": []}))?;
//! client.update("runs", &Filter::by_id(&id), &Update::Push("bundles".into(), json!({"n": 1})))?;
//!
//! let filter = Filter::from_pattern(&json!({"name": "scan"}));
//! let docs = client.aggregate("runs", &[Stage::Match(filter)])?;
//! assert_eq!(docs.len(), 1);
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

mod filter;
mod memory;
#[cfg(feature = "mongo")]
mod mongo;

pub use filter::{Condition, Element, Filter};
pub use memory::{DocumentClient, MemoryServer};
#[cfg(feature = "mongo")]
pub use mongo::MongoClient;

use serde_json::{Map, Value};

use crate::Result;

/// Field holding the document id.
pub const ID_FIELD: &str = "_id";

/// One aggregation pipeline step.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Keep documents satisfying the filter
    Match(Filter),
    /// Emit one document per element of the array field
    Unwind(String),
    /// Keep only `_id` and the listed fields
    Project(Vec<String>),
}

/// Field update applied to every matched document.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// Replace the field
    Set(String, Value),
    /// Append to the array field (created if missing)
    Push(String, Value),
}

/// Operations of a document database connection.
pub trait DocumentBackend: Send {
    /// Round trip to the server.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ConnectionLost`] if the connection is gone.
    fn ping(&self) -> Result<()>;

    /// Insert a document, assigning `_id` if absent. Returns the id.
    ///
    /// # Errors
    ///
    /// Returns error for a non-object document or a duplicate `_id`.
    fn insert(&self, collection: &str, document: Value) -> Result<String>;

    /// Run a pipeline over the collection (documents in insertion order).
    ///
    /// # Errors
    ///
    /// Returns error if the connection is gone.
    fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> Result<Vec<Value>>;

    /// Apply `update` to every matching document. Returns the match count.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is gone or a push targets a non-array.
    fn update(&self, collection: &str, filter: &Filter, update: &Update) -> Result<usize>;

    /// Remove every matching document. Returns the removal count.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is gone.
    fn delete(&self, collection: &str, filter: &Filter) -> Result<usize>;
}

/// Evaluate `pipeline` in process over documents in collection order.
pub(crate) fn run_pipeline(mut docs: Vec<Value>, pipeline: &[Stage]) -> Vec<Value> {
    for stage in pipeline {
        docs = match stage {
            Stage::Match(filter) => docs.into_iter().filter(|d| filter.matches(d)).collect(),
            Stage::Unwind(field) => docs.into_iter().flat_map(|d| unwind(d, field)).collect(),
            Stage::Project(fields) => docs.into_iter().map(|d| project(d, fields)).collect(),
        };
    }
    docs
}

fn unwind(document: Value, field: &str) -> Vec<Value> {
    let Value::Object(mut fields) = document else {
        return Vec::new();
    };
    match fields.remove(field) {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| {
                let mut copy = fields.clone();
                copy.insert(field.to_string(), item);
                Value::Object(copy)
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn project(document: Value, fields: &[String]) -> Value {
    let mut source = match document {
        Value::Object(fields) => fields,
        other => return other,
    };
    let mut projected = Map::new();
    if let Some(id) = source.remove(ID_FIELD) {
        projected.insert(ID_FIELD.to_string(), id);
    }
    for field in fields {
        if let Some(value) = source.remove(field) {
            projected.insert(field.clone(), value);
        }
    }
    Value::Object(projected)
}
