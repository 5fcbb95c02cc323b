//! MongoDB backend over the driver's blocking API.
//!
//! The first [`Stage::Match`] of a pipeline is sent to the server as a
//! superset query ([`Filter::to_server_query`]); the whole pipeline is then
//! evaluated in process, so results are exactly those of
//! [`crate::pattern::matches`]. Updates and deletes resolve the exact set
//! of matching `_id`s first and address documents by id.

use mongodb::bson::oid::ObjectId;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::sync::{Client, Collection, Database};
use serde_json::Value;
use tracing::{debug, info};

use super::{run_pipeline, DocumentBackend, Filter, Stage, Update, ID_FIELD};
use crate::storage::Reconnect;
use crate::{Error, Result};

/// Database holding one collection per project.
pub const DEFAULT_DATABASE: &str = "protos";

/// Connection to a MongoDB deployment.
#[derive(Debug)]
pub struct MongoClient {
    uri: String,
    database: Database,
}

impl MongoClient {
    /// Connect to `uri` and verify the server answers a ping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionLost`] if the server cannot be reached
    /// and [`Error::Storage`] for a malformed URI.
    pub fn connect(uri: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri).map_err(from_mongo)?;
        let connection = Self {
            uri: uri.to_string(),
            database: client.database(DEFAULT_DATABASE),
        };
        connection.ping()?;
        info!(database = DEFAULT_DATABASE, "connected to mongodb");
        Ok(connection)
    }

    /// Database name in use.
    #[must_use]
    pub fn database_name(&self) -> &str {
        self.database.name()
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection(name)
    }

    fn find(&self, collection: &str, query: &Value) -> Result<Vec<Value>> {
        let filter = to_document(query)?;
        debug!(collection, query = %query, "mongodb find");
        self.collection(collection)
            .find(filter)
            .sort(doc! { "_id": 1 })
            .run()
            .map_err(from_mongo)?
            .map(|document| document.map(to_json).map_err(from_mongo))
            .collect()
    }

    /// Ids of every document in `collection` satisfying `filter` exactly.
    fn matching_ids(&self, collection: &str, filter: &Filter) -> Result<Vec<String>> {
        let docs = self.aggregate(
            collection,
            &[Stage::Match(filter.clone()), Stage::Project(Vec::new())],
        )?;
        docs.iter()
            .map(|doc| match doc.get(ID_FIELD) {
                Some(Value::String(id)) => Ok(id.clone()),
                _ => Err(Error::Corrupted(format!("document without string _id: {doc}"))),
            })
            .collect()
    }
}

impl DocumentBackend for MongoClient {
    fn ping(&self) -> Result<()> {
        self.database
            .run_command(doc! { "ping": 1 })
            .run()
            .map_err(from_mongo)?;
        Ok(())
    }

    fn insert(&self, collection: &str, document: Value) -> Result<String> {
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
                let id = ObjectId::new().to_hex();
                document.insert(ID_FIELD.to_string(), Value::from(id.clone()));
                id
            }
        };

        self.collection(collection)
            .insert_one(to_document(&Value::Object(document))?)
            .run()
            .map_err(from_mongo)?;
        Ok(id)
    }

    fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> Result<Vec<Value>> {
        let query = match pipeline.first() {
            Some(Stage::Match(filter)) => filter.to_server_query(),
            _ => Filter::all().to_server_query(),
        };
        let docs = self.find(collection, &query)?;
        Ok(run_pipeline(docs, pipeline))
    }

    fn update(&self, collection: &str, filter: &Filter, update: &Update) -> Result<usize> {
        let ids = self.matching_ids(collection, filter)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let (operator, field, value) = match update {
            Update::Set(field, value) => ("$set", field, value),
            Update::Push(field, value) => ("$push", field, value),
        };
        let mut change = Document::new();
        change.insert(field.as_str(), to_bson(value)?);
        let mut modification = Document::new();
        modification.insert(operator, change);

        let result = self
            .collection(collection)
            .update_many(doc! { "_id": { "$in": ids } }, modification)
            .run()
            .map_err(from_mongo)?;
        Ok(usize::try_from(result.matched_count).unwrap_or(usize::MAX))
    }

    fn delete(&self, collection: &str, filter: &Filter) -> Result<usize> {
        let ids = self.matching_ids(collection, filter)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let result = self
            .collection(collection)
            .delete_many(doc! { "_id": { "$in": ids } })
            .run()
            .map_err(from_mongo)?;
        Ok(usize::try_from(result.deleted_count).unwrap_or(usize::MAX))
    }
}

impl Reconnect for MongoClient {
    fn is_alive(&mut self) -> bool {
        self.ping().is_ok()
    }

    fn reconnect(&mut self) -> Result<()> {
        let client = Client::with_uri_str(&self.uri).map_err(from_mongo)?;
        self.database = client.database(DEFAULT_DATABASE);
        self.ping()?;
        info!(database = DEFAULT_DATABASE, "reconnected to mongodb");
        Ok(())
    }
}

fn to_bson(value: &Value) -> Result<Bson> {
    bson::to_bson(value).map_err(|err| Error::Storage(format!("not representable as BSON: {err}")))
}

fn to_document(value: &Value) -> Result<Document> {
    bson::to_document(value)
        .map_err(|err| Error::Storage(format!("not representable as a BSON document: {err}")))
}

fn to_json(document: Document) -> Value {
    Bson::Document(document).into_relaxed_extjson()
}

/// Network-level failures are eligible for reconnect; everything else is a
/// storage error.
fn from_mongo(err: mongodb::error::Error) -> Error {
    match err.kind.as_ref() {
        ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } | ErrorKind::ConnectionPoolCleared { .. } => {
            Error::ConnectionLost(err.to_string())
        }
        _ => Error::Storage(format!("mongodb: {err}")),
    }
}
