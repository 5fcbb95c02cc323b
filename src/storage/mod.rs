//! Storage adapters
//!
//! Every backend implements one contract, [`StorageAdapter`], with the same
//! query semantics: patterns are matched with [`crate::pattern::matches`]
//! against `{"metadata": <experiment metadata>}` for experiments and
//! against the wire form `{data, metadata, files}` for bundles.
//!
//! | Name         | Adapter           | Pattern evaluation                         |
//! |--------------|-------------------|--------------------------------------------|
//! | `none`       | [`NoopStore`]     | stores nothing, logs every call            |
//! | `disk`       | [`DiskStore`]     | brute-force scan of JSON files             |
//! | `document`   | [`DocumentStore`] | translated to native filter operators      |
//! | `relational` | `RelationalStore` | column equality pushdown + in-process scan |
//!
//! Adapters are selected by name through an [`AdapterRegistry`]; an
//! unknown name is a usage error at startup.
//!
//! The `document` adapter talks to MongoDB when `storage_server` is a
//! `mongodb://` URI (`mongo` feature) and to an in-process server otherwise.
//!
//! Persistence is append-only for bundles: `write_bundle` never
//! overwrites an earlier bundle of the same experiment. Experiment
//! metadata has full-overwrite semantics (last write wins).

mod disk;
mod document;
mod noop;
mod reconnect;
#[cfg(feature = "relational")]
mod relational;

use std::collections::BTreeMap;

use serde_json::{json, Value};

pub use disk::DiskStore;
pub use document::DocumentStore;
pub use noop::NoopStore;
pub use reconnect::{with_reconnect, Reconnect};
#[cfg(feature = "relational")]
pub use relational::{sanitize_identifier, RelationalStore};

use crate::bundle::{Bundle, Metadata};
use crate::config::Config;
use crate::{Error, Result};

/// Persistence contract shared by every backend.
///
/// Methods take `&mut self` so connection-backed adapters can reconnect
/// lazily before an operation.
pub trait StorageAdapter: Send {
    /// Registry name of this adapter.
    fn name(&self) -> &'static str;

    /// Allocate a fresh experiment id. Two calls never return the same id,
    /// even for identical names.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot allocate the id.
    fn create_experiment_id(&mut self, name: &str) -> Result<String>;

    /// Replace the experiment's metadata (last write wins, no merging).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown `xid`.
    fn write_experiment_metadata(&mut self, metadata: &Metadata, xid: &str) -> Result<()>;

    /// Read the experiment's metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown `xid`.
    fn read_experiment_metadata(&mut self, xid: &str) -> Result<Metadata>;

    /// Ids of experiments whose `{"metadata": ...}` wrapper matches `pattern`.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be read.
    fn find_experiments(&mut self, pattern: &Value) -> Result<Vec<String>>;

    /// Append a bundle to the experiment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBundle`] for a bundle without identity and
    /// [`Error::NotFound`] for an unknown `xid`.
    fn write_bundle(&mut self, bundle: &Bundle, xid: &str) -> Result<()>;

    /// Bundles of the experiment whose wire form matches `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown `xid`.
    fn find_bundles(&mut self, pattern: &Value, xid: &str) -> Result<Vec<Bundle>>;

    /// Remove the experiment and all its bundles.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown `xid`.
    fn delete_experiment(&mut self, xid: &str) -> Result<()>;
}

/// The value experiment patterns are matched against.
#[must_use]
pub fn experiment_view(metadata: &Metadata) -> Value {
    json!({ "metadata": metadata })
}

/// Constructor registered under an adapter name.
pub type AdapterConstructor = fn(&Config) -> Result<Box<dyn StorageAdapter>>;

/// Named storage adapter constructors.
#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    constructors: BTreeMap<String, AdapterConstructor>,
}

impl AdapterRegistry {
    /// Registry without any adapters.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry with every adapter compiled into this build.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("none", |_| Ok(Box::new(NoopStore::new())));
        registry.register("disk", |config| Ok(Box::new(DiskStore::from_config(config)?)));
        registry.register("document", document::open);
        #[cfg(feature = "relational")]
        registry.register("relational", |config| {
            Ok(Box::new(RelationalStore::from_config(config)?))
        });
        registry
    }

    /// Register (or replace) the constructor for `name`.
    pub fn register(&mut self, name: impl Into<String>, constructor: AdapterConstructor) {
        self.constructors.insert(name.into(), constructor);
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Whether `name` has a constructor.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Construct the adapter selected by `config.storage`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAdapter`] if no constructor is registered
    /// under that name, or the constructor's own error.
    pub fn open(&self, config: &Config) -> Result<Box<dyn StorageAdapter>> {
        config.validate()?;
        let constructor =
            self.constructors
                .get(&config.storage)
                .ok_or_else(|| Error::UnknownAdapter {
                    name: config.storage.clone(),
                    available: self.names().collect::<Vec<_>>().join(", "),
                })?;
        tracing::debug!(adapter = %config.storage, project = %config.project_name, "opening storage adapter");
        constructor(config)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Construct the adapter named in `config` from the default registry.
///
/// # Errors
///
/// See [`AdapterRegistry::open`].
pub fn open(config: &Config) -> Result<Box<dyn StorageAdapter>> {
    AdapterRegistry::with_defaults().open(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_names() {
        let registry = AdapterRegistry::default();
        assert!(registry.contains("none"));
        assert!(registry.contains("disk"));
        assert!(registry.contains("document"));
        #[cfg(feature = "relational")]
        assert!(registry.contains("relational"));
    }

    #[test]
    fn test_unknown_adapter_is_usage_error() {
        let config = Config::default().with_storage("mongo");
        let err = open(&config).err().unwrap();
        assert!(err.is_usage_error());
        assert!(err.to_string().contains("mongo"));
        assert!(err.to_string().contains("disk"));
    }

    #[test]
    fn test_open_noop() {
        let config = Config::default().with_storage("none");
        let adapter = open(&config).unwrap();
        assert_eq!(adapter.name(), "none");
    }

    #[test]
    fn test_custom_constructor() {
        let mut registry = AdapterRegistry::empty();
        registry.register("scratch", |_| Ok(Box::new(NoopStore::new())));
        let config = Config::default().with_storage("scratch");
        assert!(registry.open(&config).is_ok());
        assert!(registry.open(&Config::default()).is_err());
    }

    #[test]
    fn test_experiment_view_wraps_metadata() {
        let mut md = Metadata::new();
        md.insert("id".to_string(), json!("x1"));
        assert_eq!(experiment_view(&md), json!({"metadata": {"id": "x1"}}));
    }
}
