//! After-the-fact lookup of experiments and bundles
//!
//! ```rust
//! use protos_db::query::{exact_experiment, search_experiments};
//! use protos_db::storage::{DocumentStore, StorageAdapter};
//! use protos_db::docstore::MemoryServer;
//! use serde_json::json;
//!
//! # fn example() -> protos_db::Result<()> {
//! let mut storage = DocumentStore::new(MemoryServer::new().connect()?, "optics");
//! let xid = storage.create_experiment_id("scan")?;
//! let mut md = protos_db::Metadata::new();
//! md.insert("id".into(), json!(xid));
//! storage.write_experiment_metadata(&md, &xid)?;
//!
//! let found = search_experiments(&mut storage, &json!({}))?;
//! assert_eq!(found.len(), 1);
//! assert!(exact_experiment(&mut storage, &xid)?.is_some());
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

use serde_json::{json, Value};
use tracing::debug;

use crate::bundle::{Bundle, Metadata};
use crate::storage::StorageAdapter;
use crate::{Error, Result};

/// Reference to one stored experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentHandle {
    id: String,
}

impl ExperimentHandle {
    /// Handle for a known experiment id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Experiment id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current experiment metadata.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the experiment was deleted.
    pub fn metadata(&self, storage: &mut dyn StorageAdapter) -> Result<Metadata> {
        storage.read_experiment_metadata(&self.id)
    }

    /// Bundles of this experiment matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns the adapter's error.
    pub fn search_bundles(
        &self,
        storage: &mut dyn StorageAdapter,
        pattern: &Value,
    ) -> Result<Vec<Bundle>> {
        storage.find_bundles(pattern, &self.id)
    }

    /// The bundle with id `bid`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NonUniqueId`] if several bundles carry `bid`.
    pub fn exact_bundle(
        &self,
        storage: &mut dyn StorageAdapter,
        bid: &str,
    ) -> Result<Option<Bundle>> {
        let bundles = storage.find_bundles(&json!({ "metadata": { "id": bid } }), &self.id)?;
        single(bundles, bid)
    }
}

/// Handles for every experiment matching `pattern`.
///
/// # Errors
///
/// Returns the adapter's error.
pub fn search_experiments(
    storage: &mut dyn StorageAdapter,
    pattern: &Value,
) -> Result<Vec<ExperimentHandle>> {
    Ok(storage
        .find_experiments(pattern)?
        .into_iter()
        .map(ExperimentHandle::new)
        .collect())
}

/// The experiment whose metadata id is `xid`, if any.
///
/// # Errors
///
/// Returns [`Error::NonUniqueId`] if several experiments carry `xid`.
pub fn exact_experiment(
    storage: &mut dyn StorageAdapter,
    xid: &str,
) -> Result<Option<ExperimentHandle>> {
    let xids = storage.find_experiments(&json!({ "metadata": { "id": xid } }))?;
    Ok(single(xids, xid)?.map(ExperimentHandle::new))
}

fn single<T>(mut hits: Vec<T>, id: &str) -> Result<Option<T>> {
    match hits.len() {
        0 => {
            debug!(%id, "no record matched id");
            Ok(None)
        }
        1 => Ok(hits.pop()),
        _ => {
            tracing::error!(%id, hits = hits.len(), "non-unique id detected");
            Err(Error::NonUniqueId(id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docstore::MemoryServer;
    use crate::storage::DocumentStore;

    fn seeded() -> (DocumentStore, String) {
        let mut storage = DocumentStore::new(MemoryServer::new().connect().unwrap(), "q");
        let xid = storage.create_experiment_id("scan").unwrap();
        let mut md = Metadata::new();
        md.insert("id".to_string(), json!(xid));
        md.insert("user".to_string(), json!("ana"));
        storage.write_experiment_metadata(&md, &xid).unwrap();
        (storage, xid)
    }

    #[test]
    fn test_exact_experiment_zero_and_one() {
        let (mut storage, xid) = seeded();
        let handle = exact_experiment(&mut storage, &xid).unwrap().unwrap();
        assert_eq!(handle.id(), xid);
        assert_eq!(handle.metadata(&mut storage).unwrap()["user"], json!("ana"));
        assert!(exact_experiment(&mut storage, "missing").unwrap().is_none());
    }

    #[test]
    fn test_exact_experiment_non_unique() {
        let (mut storage, xid) = seeded();
        let other = storage.create_experiment_id("copy").unwrap();
        let mut md = Metadata::new();
        md.insert("id".to_string(), json!(xid));
        storage.write_experiment_metadata(&md, &other).unwrap();

        assert!(matches!(
            exact_experiment(&mut storage, &xid),
            Err(Error::NonUniqueId(_))
        ));
    }

    #[test]
    fn test_search_and_exact_bundle() {
        let (mut storage, xid) = seeded();
        storage
            .write_bundle(&Bundle::with_id("b1", "fit").with_data("chi2", 1.5), &xid)
            .unwrap();
        storage
            .write_bundle(&Bundle::with_id("b2", "plot"), &xid)
            .unwrap();

        let handle = ExperimentHandle::new(xid);
        let fits = handle
            .search_bundles(&mut storage, &json!({"metadata": {"bundle_type": "fit"}}))
            .unwrap();
        assert_eq!(fits.len(), 1);
        assert_eq!(fits[0].data()["chi2"], json!(1.5));

        assert_eq!(
            handle.exact_bundle(&mut storage, "b2").unwrap().unwrap().bundle_type(),
            "plot"
        );
        assert!(handle.exact_bundle(&mut storage, "b9").unwrap().is_none());
    }
}
