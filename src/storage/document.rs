//! Document database adapter
//!
//! One collection per project; one document per experiment:
//!
//! ```text
//! { "_id": <xid>, "name": str, "metadata": {...}, "bundles": [<wire bundle>, ...] }
//! ```
//!
//! Match patterns are translated into native filters instead of being
//! evaluated in process. Each operation probes the connection first and is
//! retried once after a reconnect.
//!
//! `storage_server` picks the backend: a `mongodb://` or `mongodb+srv://`
//! URI connects to MongoDB (`mongo` feature); anything else names a
//! process-local [`MemoryServer`], whose data is gone when the process exits.

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{with_reconnect, Reconnect, StorageAdapter};
#[cfg(feature = "mongo")]
use crate::docstore::MongoClient;
use crate::bundle::{Bundle, Metadata, ID_KEY};
use crate::config::Config;
use crate::docstore::{
    Condition, DocumentBackend, DocumentClient, Filter, MemoryServer, Stage, Update, ID_FIELD,
};
use crate::{Error, Result};

/// Server name used when `storage_server` is unset.
pub const DEFAULT_SERVER: &str = "local";

const METADATA_FIELD: &str = "metadata";
const BUNDLES_FIELD: &str = "bundles";

/// Experiments as documents in a per-project collection.
#[derive(Debug)]
pub struct DocumentStore<B = DocumentClient> {
    client: B,
    collection: String,
}

impl DocumentStore<DocumentClient> {
    /// Connect to the shared server named by `storage_server`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageFatal`] if the server refuses the connection.
    pub fn from_config(config: &Config) -> Result<Self> {
        let server_name = config.storage_server.as_deref().unwrap_or(DEFAULT_SERVER);
        let client = MemoryServer::shared(server_name)
            .connect()
            .map_err(|err| Error::StorageFatal(format!("connect to '{server_name}': {err}")))?;
        debug!(server = server_name, project = %config.project_name, "connected to document server");
        Ok(Self::new(client, &config.project_name))
    }
}

/// Whether `server` is a MongoDB connection string.
#[must_use]
pub fn is_mongo_uri(server: &str) -> bool {
    server.starts_with("mongodb://") || server.starts_with("mongodb+srv://")
}

/// Open the document adapter selected by `storage_server`.
///
/// # Errors
///
/// - [`Error::InvalidConfig`] for a MongoDB URI in a build without the
///   `mongo` feature
/// - [`Error::StorageFatal`] if the server cannot be reached
pub fn open(config: &Config) -> Result<Box<dyn StorageAdapter>> {
    match config.storage_server.as_deref() {
        Some(uri) if is_mongo_uri(uri) => open_mongo(uri, config),
        _ => {
            let store = DocumentStore::<DocumentClient>::from_config(config)?;
            warn!(
                project = %config.project_name,
                "document storage is process-local; point storage_server at a mongodb:// URI to persist"
            );
            Ok(Box::new(store))
        }
    }
}

#[cfg(feature = "mongo")]
fn open_mongo(uri: &str, config: &Config) -> Result<Box<dyn StorageAdapter>> {
    let client = MongoClient::connect(uri)
        .map_err(|err| Error::StorageFatal(format!("connect to mongodb: {err}")))?;
    Ok(Box::new(DocumentStore::new(client, &config.project_name)))
}

#[cfg(not(feature = "mongo"))]
fn open_mongo(_uri: &str, _config: &Config) -> Result<Box<dyn StorageAdapter>> {
    Err(Error::InvalidConfig(
        "storage_server is a MongoDB URI but this build lacks the `mongo` feature".to_string(),
    ))
}

impl<B: DocumentBackend + Reconnect> DocumentStore<B> {
    /// Adapter over an open connection, storing into `project`'s collection.
    pub fn new(client: B, project: &str) -> Self {
        Self {
            client,
            collection: project.to_string(),
        }
    }

    /// The underlying connection.
    pub const fn client(&self) -> &B {
        &self.client
    }

    /// Collection holding this project's experiments.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl<B: DocumentBackend + Reconnect> StorageAdapter for DocumentStore<B> {
    fn name(&self) -> &'static str {
        "document"
    }

    fn create_experiment_id(&mut self, name: &str) -> Result<String> {
        let collection = &self.collection;
        with_reconnect(&mut self.client, "create_experiment_id", |client| {
            client.insert(
                collection,
                json!({ "name": name, "metadata": {}, "bundles": [] }),
            )
        })
    }

    fn write_experiment_metadata(&mut self, metadata: &Metadata, xid: &str) -> Result<()> {
        let collection = &self.collection;
        let update = Update::Set(METADATA_FIELD.to_string(), Value::Object(metadata.clone()));
        let matched = with_reconnect(&mut self.client, "write_experiment_metadata", |client| {
            client.update(collection, &Filter::by_id(xid), &update)
        })?;
        if matched == 0 {
            return Err(Error::NotFound(format!("experiment '{xid}'")));
        }
        Ok(())
    }

    fn read_experiment_metadata(&mut self, xid: &str) -> Result<Metadata> {
        let collection = &self.collection;
        let docs = with_reconnect(&mut self.client, "read_experiment_metadata", |client| {
            client.aggregate(
                collection,
                &[
                    Stage::Match(Filter::by_id(xid)),
                    Stage::Project(vec![METADATA_FIELD.to_string()]),
                ],
            )
        })?;
        let doc = docs
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("experiment '{xid}'")))?;
        match doc.get(METADATA_FIELD) {
            Some(Value::Object(metadata)) => Ok(metadata.clone()),
            _ => Err(Error::Corrupted(format!(
                "experiment '{xid}' has no metadata document"
            ))),
        }
    }

    fn find_experiments(&mut self, pattern: &Value) -> Result<Vec<String>> {
        let Some(filter) = experiment_filter(pattern) else {
            return Ok(Vec::new());
        };
        debug!(query = %filter.to_query(), "find_experiments");
        let collection = &self.collection;
        let docs = with_reconnect(&mut self.client, "find_experiments", |client| {
            client.aggregate(
                collection,
                &[
                    Stage::Match(filter.clone()),
                    Stage::Project(Vec::new()),
                ],
            )
        })?;
        docs.iter()
            .map(|doc| match doc.get(ID_FIELD) {
                Some(Value::String(id)) => Ok(id.clone()),
                _ => Err(Error::Corrupted(format!("document without _id: {doc}"))),
            })
            .collect()
    }

    fn write_bundle(&mut self, bundle: &Bundle, xid: &str) -> Result<()> {
        bundle.validate()?;
        let wire = bundle.to_value()?;
        let collection = &self.collection;
        let duplicate = Filter::by_id(xid).and(Condition::Eq {
            path: vec![
                BUNDLES_FIELD.to_string(),
                METADATA_FIELD.to_string(),
                ID_KEY.to_string(),
            ],
            value: Value::from(bundle.id()),
        });
        let push = Update::Push(BUNDLES_FIELD.to_string(), wire);

        with_reconnect(&mut self.client, "write_bundle", |client| {
            let existing = client.aggregate(
                collection,
                &[
                    Stage::Match(Filter::by_id(xid)),
                    Stage::Unwind(BUNDLES_FIELD.to_string()),
                    Stage::Match(duplicate.clone()),
                ],
            )?;
            if !existing.is_empty() {
                return Err(Error::Storage(format!(
                    "bundle '{}' already written to experiment '{xid}'",
                    bundle.id()
                )));
            }
            match client.update(collection, &Filter::by_id(xid), &push)? {
                0 => Err(Error::NotFound(format!("experiment '{xid}'"))),
                _ => Ok(()),
            }
        })
    }

    fn find_bundles(&mut self, pattern: &Value, xid: &str) -> Result<Vec<Bundle>> {
        let filter = Filter::from_pattern_at(pattern, &[BUNDLES_FIELD]);
        debug!(%xid, query = %filter.to_query(), "find_bundles");
        let collection = &self.collection;
        let docs = with_reconnect(&mut self.client, "find_bundles", |client| {
            let known = client.aggregate(
                collection,
                &[Stage::Match(Filter::by_id(xid)), Stage::Project(Vec::new())],
            )?;
            if known.is_empty() {
                return Err(Error::NotFound(format!("experiment '{xid}'")));
            }
            client.aggregate(
                collection,
                &[
                    Stage::Match(Filter::by_id(xid)),
                    Stage::Unwind(BUNDLES_FIELD.to_string()),
                    Stage::Project(vec![BUNDLES_FIELD.to_string()]),
                    Stage::Match(filter.clone()),
                ],
            )
        })?;
        docs.into_iter()
            .map(|mut doc| {
                let wire = doc
                    .get_mut(BUNDLES_FIELD)
                    .map(Value::take)
                    .ok_or_else(|| Error::Corrupted(format!("unwound bundle missing in '{xid}'")))?;
                Bundle::from_value(wire)
            })
            .collect()
    }

    fn delete_experiment(&mut self, xid: &str) -> Result<()> {
        let collection = &self.collection;
        let removed = with_reconnect(&mut self.client, "delete_experiment", |client| {
            client.delete(collection, &Filter::by_id(xid))
        })?;
        if removed == 0 {
            return Err(Error::NotFound(format!("experiment '{xid}'")));
        }
        Ok(())
    }
}

/// Filter over experiment documents equivalent to matching `pattern`
/// against `{"metadata": ...}`. `None` when no experiment can match.
fn experiment_filter(pattern: &Value) -> Option<Filter> {
    match pattern {
        Value::Object(map) if map.keys().all(|key| key == METADATA_FIELD) => {
            Some(Filter::from_pattern(pattern))
        }
        Value::Array(items) if items.is_empty() => Some(Filter::all()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> (Arc<MemoryServer>, DocumentStore) {
        let server = MemoryServer::new();
        let client = server.connect().unwrap();
        (server, DocumentStore::new(client, "proj"))
    }

    #[test]
    fn test_experiment_filter_scoping() {
        assert!(experiment_filter(&json!({})).unwrap().is_empty());
        assert!(experiment_filter(&json!([])).unwrap().is_empty());
        assert!(experiment_filter(&json!({"name": "x"})).is_none());
        assert!(experiment_filter(&json!(3)).is_none());
        assert_eq!(
            experiment_filter(&json!({"metadata": {"user": "ana"}}))
                .unwrap()
                .to_query(),
            json!({"metadata.user": "ana"})
        );
    }

    #[test]
    fn test_document_fields_outside_metadata_are_invisible() {
        let (_server, mut store) = store();
        let xid = store.create_experiment_id("scan").unwrap();
        let mut md = Metadata::new();
        md.insert("id".to_string(), json!(xid));
        store.write_experiment_metadata(&md, &xid).unwrap();

        assert!(store.find_experiments(&json!({"name": "scan"})).unwrap().is_empty());
        assert_eq!(store.find_experiments(&json!({})).unwrap(), vec![xid]);
    }

    #[test]
    fn test_reconnects_after_dropped_connection() {
        let (server, mut store) = store();
        let xid = store.create_experiment_id("scan").unwrap();
        server.drop_connections();
        store.write_experiment_metadata(&Metadata::new(), &xid).unwrap();
        assert!(store.read_experiment_metadata(&xid).unwrap().is_empty());
    }

    #[test]
    fn test_unavailable_server_is_fatal() {
        let (server, mut store) = store();
        server.set_available(false);
        assert!(matches!(
            store.find_experiments(&json!({})),
            Err(Error::StorageFatal(_))
        ));
    }

    #[test]
    fn test_duplicate_bundle_rejected() {
        let (_server, mut store) = store();
        let xid = store.create_experiment_id("scan").unwrap();
        let bundle = Bundle::with_id("b1", "fit");
        store.write_bundle(&bundle, &xid).unwrap();
        assert!(matches!(
            store.write_bundle(&bundle, &xid),
            Err(Error::Storage(_))
        ));
        assert_eq!(store.find_bundles(&json!({}), &xid).unwrap().len(), 1);
    }

    #[test]
    fn test_mongo_uris_are_recognised() {
        assert!(is_mongo_uri("mongodb://localhost:27017"));
        assert!(is_mongo_uri("mongodb+srv://cluster.example.net"));
        assert!(!is_mongo_uri("local"));
        assert!(!is_mongo_uri("mongo://typo"));
    }

    #[cfg(not(feature = "mongo"))]
    #[test]
    fn test_mongo_uri_without_feature_is_invalid_config() {
        let config = Config::default().with_storage_server("mongodb://localhost:27017");
        assert!(matches!(open(&config), Err(Error::InvalidConfig(_))));
    }

    #[cfg(feature = "mongo")]
    #[test]
    fn test_unreachable_mongo_is_fatal() {
        let config = Config::default()
            .with_storage_server("mongodb://127.0.0.1:1/?serverSelectionTimeoutMS=200");
        assert!(matches!(open(&config), Err(Error::StorageFatal(_))));
    }

    #[test]
    fn test_unknown_xid_is_not_found() {
        let (_server, mut store) = store();
        let bundle = Bundle::with_id("b1", "fit");
        assert!(matches!(store.write_bundle(&bundle, "nope"), Err(Error::NotFound(_))));
        assert!(matches!(store.find_bundles(&json!({}), "nope"), Err(Error::NotFound(_))));
        assert!(matches!(store.read_experiment_metadata("nope"), Err(Error::NotFound(_))));
        assert!(matches!(store.delete_experiment("nope"), Err(Error::NotFound(_))));
    }
}
