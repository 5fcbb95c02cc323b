//! Adapter that persists nothing

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::StorageAdapter;
use crate::bundle::{Bundle, Metadata};
use crate::{Error, Result};

/// Logs every call and stores nothing.
///
/// Useful for dry runs: experiments execute normally, ids are unique, and
/// queries come back empty. Reading metadata fails because nothing was kept.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

impl NoopStore {
    /// Create the adapter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl StorageAdapter for NoopStore {
    fn name(&self) -> &'static str {
        "none"
    }

    fn create_experiment_id(&mut self, name: &str) -> Result<String> {
        let xid = Uuid::new_v4().to_string();
        debug!(experiment = name, %xid, "create_experiment_id");
        Ok(xid)
    }

    fn write_experiment_metadata(&mut self, metadata: &Metadata, xid: &str) -> Result<()> {
        debug!(%xid, keys = metadata.len(), "write_experiment_metadata");
        Ok(())
    }

    fn read_experiment_metadata(&mut self, xid: &str) -> Result<Metadata> {
        debug!(%xid, "read_experiment_metadata");
        Err(Error::NotFound(format!(
            "experiment '{xid}' (the 'none' adapter keeps no records)"
        )))
    }

    fn find_experiments(&mut self, pattern: &Value) -> Result<Vec<String>> {
        debug!(%pattern, "find_experiments");
        Ok(Vec::new())
    }

    fn write_bundle(&mut self, bundle: &Bundle, xid: &str) -> Result<()> {
        bundle.validate()?;
        debug!(%xid, bundle = bundle.id(), bundle_type = bundle.bundle_type(), "write_bundle");
        Ok(())
    }

    fn find_bundles(&mut self, pattern: &Value, xid: &str) -> Result<Vec<Bundle>> {
        debug!(%xid, %pattern, "find_bundles");
        Ok(Vec::new())
    }

    fn delete_experiment(&mut self, xid: &str) -> Result<()> {
        debug!(%xid, "delete_experiment");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_unique() {
        let mut store = NoopStore::new();
        let a = store.create_experiment_id("same").unwrap();
        let b = store.create_experiment_id("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_queries_are_empty() {
        let mut store = NoopStore::new();
        let xid = store.create_experiment_id("x").unwrap();
        store
            .write_bundle(&Bundle::with_id("b", "fit"), &xid)
            .unwrap();
        assert!(store.find_experiments(&json!({})).unwrap().is_empty());
        assert!(store.find_bundles(&json!({}), &xid).unwrap().is_empty());
        assert!(matches!(
            store.read_experiment_metadata(&xid),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_still_rejects_invalid_bundle() {
        let mut store = NoopStore::new();
        assert!(matches!(
            store.write_bundle(&Bundle::with_id("", "fit"), "x"),
            Err(Error::InvalidBundle(_))
        ));
    }
}
