//! In-process document server using `DashMap`.
//!
//! Data lives for the lifetime of the process. Servers are shared by name
//! ([`MemoryServer::shared`]), so every client opened against the same
//! `storage_server` sees the same collections.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use serde_json::Value;

use super::{run_pipeline, DocumentBackend, Filter, Stage, Update, ID_FIELD};
use crate::storage::Reconnect;
use crate::{Error, Result};

type Collection = BTreeMap<String, Value>;

static SERVERS: OnceLock<DashMap<String, Arc<MemoryServer>>> = OnceLock::new();

/// Concurrent in-memory document server.
///
/// Collections are keyed by name; documents within a collection are kept
/// in `_id` order, and generated ids increase monotonically, so scans
/// return documents in insertion order.
#[derive(Debug, Default)]
pub struct MemoryServer {
    collections: DashMap<String, Collection>,
    next_id: AtomicU64,
    // Bumped to invalidate every open connection.
    generation: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryServer {
    /// Create a private server.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-wide server registered under `name`, created on first use.
    #[must_use]
    pub fn shared(name: &str) -> Arc<Self> {
        let servers = SERVERS.get_or_init(DashMap::new);
        Arc::clone(
            servers
                .entry(name.to_string())
                .or_insert_with(Self::new)
                .value(),
        )
    }

    /// Open a client connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionLost`] while the server is unavailable.
    pub fn connect(self: &Arc<Self>) -> Result<DocumentClient> {
        self.check_available()?;
        Ok(DocumentClient {
            server: Arc::clone(self),
            generation: self.generation.load(Ordering::Acquire),
        })
    }

    /// Invalidate every open connection (clients must reconnect).
    pub fn drop_connections(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Refuse (or accept again) connections and operations.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Release);
    }

    /// Names of collections holding at least one document.
    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .collections
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Number of documents in `collection`.
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.len())
    }

    /// Whether `collection` has no documents.
    #[must_use]
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(Error::ConnectionLost("document server unavailable".to_string()));
        }
        Ok(())
    }

    fn generate_id(&self) -> String {
        format!("{:016x}", self.next_id.fetch_add(1, Ordering::AcqRel))
    }
}

/// Connection to a [`MemoryServer`].
#[derive(Debug, Clone)]
pub struct DocumentClient {
    server: Arc<MemoryServer>,
    generation: u64,
}

impl DocumentClient {
    /// The server this client talks to.
    #[must_use]
    pub const fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }

    fn check(&self) -> Result<()> {
        self.server.check_available()?;
        if self.generation != self.server.generation.load(Ordering::Acquire) {
            return Err(Error::ConnectionLost("connection reset by server".to_string()));
        }
        Ok(())
    }
}

impl DocumentBackend for DocumentClient {
    fn ping(&self) -> Result<()> {
        self.check()
    }

    fn insert(&self, collection: &str, document: Value) -> Result<String> {
        self.check()?;
        let mut document = match document {
            Value::Object(fields) => fields,
            other => {
                return Err(Error::Storage(format!(
                    "only documents can be inserted, got {other}"
                )))
            }
        };
        let id = match document.get(ID_FIELD) {
            Some(Value::String(id)) => id.clone(),
            Some(other) => {
                return Err(Error::Storage(format!("document _id must be a string, got {other}")))
            }
            None => {
                let id = self.server.generate_id();
                document.insert(ID_FIELD.to_string(), Value::from(id.clone()));
                id
            }
        };

        let mut docs = self
            .server
            .collections
            .entry(collection.to_string())
            .or_default();
        if docs.contains_key(&id) {
            return Err(Error::Storage(format!("duplicate _id '{id}' in '{collection}'")));
        }
        docs.insert(id.clone(), Value::Object(document));
        Ok(id)
    }

    fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> Result<Vec<Value>> {
        self.check()?;
        let docs: Vec<Value> = self
            .server
            .collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();

        Ok(run_pipeline(docs, pipeline))
    }

    fn update(&self, collection: &str, filter: &Filter, update: &Update) -> Result<usize> {
        self.check()?;
        let Some(mut docs) = self.server.collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut matched = 0;
        for document in docs.values_mut().filter(|d| filter.matches(d)) {
            matched += 1;
            let Some(fields) = document.as_object_mut() else {
                continue;
            };
            match update {
                Update::Set(field, value) => {
                    fields.insert(field.clone(), value.clone());
                }
                Update::Push(field, value) => match fields
                    .entry(field.clone())
                    .or_insert_with(|| Value::Array(Vec::new()))
                {
                    Value::Array(items) => items.push(value.clone()),
                    other => {
                        return Err(Error::Storage(format!(
                            "cannot push onto non-array field '{field}' ({other})"
                        )))
                    }
                },
            }
        }
        Ok(matched)
    }

    fn delete(&self, collection: &str, filter: &Filter) -> Result<usize> {
        self.check()?;
        let Some(mut docs) = self.server.collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|_, d| !filter.matches(d));
        Ok(before - docs.len())
    }
}

impl Reconnect for DocumentClient {
    fn is_alive(&mut self) -> bool {
        self.ping().is_ok()
    }

    fn reconnect(&mut self) -> Result<()> {
        *self = self.server.connect()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> DocumentClient {
        MemoryServer::new().connect().unwrap()
    }

    #[test]
    fn test_insert_assigns_increasing_ids() {
        let client = client();
        let a = client.insert("c", json!({"n": 1})).unwrap();
        let b = client.insert("c", json!({"n": 2})).unwrap();
        assert!(a < b);
        let docs = client.aggregate("c", &[]).unwrap();
        assert_eq!(docs[0]["n"], json!(1));
        assert_eq!(docs[1]["_id"], json!(b));
    }

    #[test]
    fn test_insert_rejects_non_documents() {
        assert!(client().insert("c", json!([1])).is_err());
    }

    #[test]
    fn test_set_and_push() {
        let client = client();
        let id = client.insert("c", json!({"bundles": []})).unwrap();
        let by_id = Filter::by_id(&id);

        let set = Update::Set("metadata".to_string(), json!({"k": 1}));
        assert_eq!(client.update("c", &by_id, &set).unwrap(), 1);
        let push = Update::Push("bundles".to_string(), json!({"x": 1}));
        client.update("c", &by_id, &push).unwrap();
        client.update("c", &by_id, &push).unwrap();

        let doc = &client.aggregate("c", &[Stage::Match(by_id)]).unwrap()[0];
        assert_eq!(doc["metadata"], json!({"k": 1}));
        assert_eq!(doc["bundles"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_update_unknown_matches_nothing() {
        let client = client();
        let set = Update::Set("metadata".to_string(), json!({}));
        assert_eq!(client.update("c", &Filter::by_id("nope"), &set).unwrap(), 0);
    }

    #[test]
    fn test_unwind_and_project() {
        let client = client();
        client
            .insert("c", json!({"name": "x", "bundles": [{"b": 1}, {"b": 2}]}))
            .unwrap();
        let docs = client
            .aggregate(
                "c",
                &[
                    Stage::Unwind("bundles".to_string()),
                    Stage::Project(vec!["bundles".to_string()]),
                ],
            )
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1]["bundles"], json!({"b": 2}));
        assert!(docs[1].get("name").is_none());
        assert!(docs[1].get("_id").is_some());
    }

    #[test]
    fn test_delete() {
        let client = client();
        let id = client.insert("c", json!({})).unwrap();
        client.insert("c", json!({})).unwrap();
        assert_eq!(client.delete("c", &Filter::by_id(&id)).unwrap(), 1);
        assert_eq!(client.server().len("c"), 1);
    }

    #[test]
    fn test_dropped_connection_needs_reconnect() {
        let server = MemoryServer::new();
        let mut client = server.connect().unwrap();
        server.drop_connections();
        assert!(matches!(client.ping(), Err(Error::ConnectionLost(_))));
        assert!(!client.is_alive());
        client.reconnect().unwrap();
        assert!(client.is_alive());
    }

    #[test]
    fn test_unavailable_server_refuses_connections() {
        let server = MemoryServer::new();
        server.set_available(false);
        assert!(server.connect().is_err());
        server.set_available(true);
        assert!(server.connect().is_ok());
    }

    #[test]
    fn test_shared_servers_are_reused() {
        let a = MemoryServer::shared("memory-test-shared");
        let b = MemoryServer::shared("memory-test-shared");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
