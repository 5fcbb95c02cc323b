//! Filesystem adapter
//!
//! ## Layout
//!
//! ```text
//! <data_dir>/
//!   <project_name>/
//!     <name>_<timestamp>/          experiment id (xid)
//!       metadata                   experiment metadata, JSON
//!       <bundle id>                one JSON wire bundle per file
//! ```
//!
//! Queries are brute-force: every candidate file is parsed and matched in
//! process. Directories without a `metadata` file are not experiments and
//! are skipped.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use super::{experiment_view, StorageAdapter};
use crate::bundle::{Bundle, Metadata, WireBundle, ID_KEY};
use crate::config::Config;
use crate::pattern::matches;
use crate::time::timestamp;
use crate::{Error, Result};

const METADATA_FILE: &str = "metadata";

/// JSON files under `<data_dir>/<project_name>`.
#[derive(Debug, Clone)]
pub struct DiskStore {
    project_path: PathBuf,
}

impl DiskStore {
    /// Open (creating if needed) the project directory under `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an empty `data_dir` or project,
    /// or an IO error if the directories cannot be created.
    pub fn open(data_dir: impl AsRef<Path>, project_name: &str) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        if data_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "data_dir cannot be empty when using the disk storage adapter".to_string(),
            ));
        }
        let project = path_component(project_name)
            .ok_or_else(|| Error::InvalidConfig(format!("invalid project name '{project_name}'")))?;

        if !data_dir.is_dir() {
            warn!(dir = %data_dir.display(), "data directory not found, creating an empty one");
            fs::create_dir_all(data_dir)?;
        }
        let project_path = data_dir.join(project);
        fs::create_dir_all(&project_path)?;
        // Steps run with a different working directory.
        let project_path = fs::canonicalize(project_path)?;
        Ok(Self { project_path })
    }

    /// Open using `data_dir` and `project_name` from `config`.
    ///
    /// # Errors
    ///
    /// See [`DiskStore::open`].
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::open(&config.data_dir, &config.project_name)
    }

    /// Directory holding this project's experiments.
    #[must_use]
    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    fn experiment_path(&self, xid: &str) -> Result<PathBuf> {
        let xpath = path_component(xid)
            .map(|xid| self.project_path.join(xid))
            .filter(|xpath| xpath.is_dir())
            .ok_or_else(|| Error::NotFound(format!("experiment '{xid}'")))?;
        Ok(xpath)
    }

    fn read_metadata_file(path: &Path) -> Result<Metadata> {
        let raw = fs::read_to_string(path)?;
        let metadata: Metadata = serde_json::from_str(&raw)
            .map_err(|err| Error::Corrupted(format!("{}: {err}", path.display())))?;
        if !metadata.contains_key(ID_KEY) {
            return Err(Error::Corrupted(format!(
                "{}: experiment metadata has no id",
                path.display()
            )));
        }
        Ok(metadata)
    }
}

impl StorageAdapter for DiskStore {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn create_experiment_id(&mut self, name: &str) -> Result<String> {
        let base = format!("{}_{}", sanitize_name(name), timestamp());
        let mut xid = base.clone();
        let mut suffix = 0_u32;
        loop {
            match fs::create_dir(self.project_path.join(&xid)) {
                Ok(()) => break,
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    suffix += 1;
                    xid = format!("{base}_{suffix}");
                }
                Err(err) => return Err(err.into()),
            }
        }
        debug!(%xid, dir = %self.project_path.display(), "created experiment directory");
        Ok(xid)
    }

    fn write_experiment_metadata(&mut self, metadata: &Metadata, xid: &str) -> Result<()> {
        let path = self.experiment_path(xid)?.join(METADATA_FILE);
        debug!(%xid, path = %path.display(), "writing experiment metadata");
        fs::write(&path, serde_json::to_string_pretty(metadata)?)?;
        Ok(())
    }

    fn read_experiment_metadata(&mut self, xid: &str) -> Result<Metadata> {
        let path = self.experiment_path(xid)?.join(METADATA_FILE);
        if !path.is_file() {
            return Err(Error::NotFound(format!("experiment '{xid}' has no metadata")));
        }
        Self::read_metadata_file(&path)
    }

    fn find_experiments(&mut self, pattern: &Value) -> Result<Vec<String>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.project_path)? {
            let path = entry?.path().join(METADATA_FILE);
            if !path.is_file() {
                continue;
            }
            let metadata = Self::read_metadata_file(&path)?;
            if matches(pattern, &experiment_view(&metadata)) {
                match &metadata[ID_KEY] {
                    Value::String(id) => found.push(id.clone()),
                    other => found.push(other.to_string()),
                }
            }
        }
        found.sort();
        Ok(found)
    }

    fn write_bundle(&mut self, bundle: &Bundle, xid: &str) -> Result<()> {
        bundle.validate()?;
        let file_name = path_component(bundle.id())
            .filter(|name| *name != METADATA_FILE)
            .ok_or_else(|| {
                Error::InvalidBundle(format!(
                    "bundle id '{}' cannot be used as a file name",
                    bundle.id()
                ))
            })?;
        let path = self.experiment_path(xid)?.join(file_name);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::Storage(format!(
                    "bundle '{}' already written to experiment '{xid}'",
                    bundle.id()
                )))
            }
            Err(err) => return Err(err.into()),
        };
        debug!(%xid, bundle = bundle.id(), path = %path.display(), "writing bundle");
        file.write_all(serde_json::to_string_pretty(&bundle.externalize())?.as_bytes())?;
        Ok(())
    }

    fn find_bundles(&mut self, pattern: &Value, xid: &str) -> Result<Vec<Bundle>> {
        let xpath = self.experiment_path(xid)?;
        if !xpath.join(METADATA_FILE).is_file() {
            return Err(Error::NotFound(format!(
                "bad experiment id '{xid}' (no metadata)"
            )));
        }

        let mut found = Vec::new();
        for entry in fs::read_dir(&xpath)? {
            let entry = entry?;
            if entry.file_name() == METADATA_FILE || !entry.file_type()?.is_file() {
                continue;
            }
            let raw = fs::read_to_string(entry.path())?;
            let value: Value = serde_json::from_str(&raw)
                .map_err(|err| Error::Corrupted(format!("{}: {err}", entry.path().display())))?;
            if matches(pattern, &value) {
                found.push(Bundle::internalize(WireBundle::from_value(value)?)?);
            }
        }
        found.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(found)
    }

    fn delete_experiment(&mut self, xid: &str) -> Result<()> {
        let xpath = self.experiment_path(xid)?;
        fs::remove_dir_all(&xpath)?;
        debug!(%xid, dir = %xpath.display(), "deleted experiment");
        Ok(())
    }
}

/// `name` if it is usable as exactly one path component.
fn path_component(name: &str) -> Option<&str> {
    let usable = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    usable.then_some(name)
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "experiment".to_string()
    } else {
        cleaned
    }
}
