//! Bundle - the persisted output of one protocol step
//!
//! A bundle carries identity (`id`, `bundle_type`, creation time), an open
//! metadata mapping, structured `data`, and a list of file references.
//!
//! ## Wire Format
//!
//! ```text
//! {
//!   "data":     { ... },
//!   "metadata": { "id": str, "bundle_type": str, "time": str, ... },
//!   "files":    [ str, ... ]
//! }
//! ```
//!
//! `id`, `bundle_type` and `time` are reserved metadata keys: they are
//! written from the bundle's own fields on [`Bundle::externalize`] and
//! lifted back out on [`Bundle::internalize`]. User metadata never holds
//! them, so `internalize(externalize(b)) == b` for every valid bundle.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::experiment::StepContext;
use crate::time::{format_timestamp, now, parse_timestamp};
use crate::{Error, Result};

/// Open JSON mapping used for metadata and data.
pub type Metadata = Map<String, Value>;

/// Reserved metadata key holding the bundle id.
pub const ID_KEY: &str = "id";
/// Reserved metadata key holding the bundle type.
pub const BUNDLE_TYPE_KEY: &str = "bundle_type";
/// Reserved metadata key holding the creation timestamp.
pub const TIME_KEY: &str = "time";

/// Metadata keys owned by the bundle's identity fields.
pub const RESERVED_KEYS: [&str; 3] = [ID_KEY, BUNDLE_TYPE_KEY, TIME_KEY];

/// Plain `{data, metadata, files}` mapping exchanged with storage backends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireBundle {
    /// Structured step output
    #[serde(default)]
    pub data: Metadata,
    /// Metadata including the reserved identity keys
    #[serde(default)]
    pub metadata: Metadata,
    /// File references
    #[serde(default)]
    pub files: Vec<String>,
}

impl WireBundle {
    /// Convert into a JSON value (the form patterns are matched against).
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns error if the value is not a bundle mapping.
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// Typed result of one executed protocol step.
#[derive(Debug, Clone)]
pub struct Bundle {
    id: String,
    bundle_type: String,
    created_at: DateTime<Utc>,
    metadata: Metadata,
    data: Metadata,
    files: Vec<PathBuf>,
    // Where `add_file(.., copy = true)` places copies; never persisted.
    copy_dir: Option<PathBuf>,
}

impl PartialEq for Bundle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.bundle_type == other.bundle_type
            && self.created_at == other.created_at
            && self.metadata == other.metadata
            && self.data == other.data
            && self.files == other.files
    }
}

impl Bundle {
    /// Create an empty bundle for the running step.
    ///
    /// The id combines the step token with a random UUID, so it cannot
    /// collide even across concurrently running experiments.
    #[must_use]
    pub fn create(ctx: &StepContext<'_>, bundle_type: impl Into<String>) -> Self {
        let id = format!("{}-{}", ctx.token().id(), Uuid::new_v4().simple());
        let mut bundle = Self::with_id(id, bundle_type);
        bundle.copy_dir = Some(ctx.experiment_dir().to_path_buf());
        bundle
    }

    /// Create an empty bundle with an explicit id.
    ///
    /// No validation happens here; persistence rejects empty ids or types.
    #[must_use]
    pub fn with_id(id: impl Into<String>, bundle_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bundle_type: bundle_type.into(),
            created_at: now(),
            metadata: Metadata::new(),
            data: Metadata::new(),
            files: Vec::new(),
            copy_dir: None,
        }
    }

    /// Globally unique bundle id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Logical name of the producing step.
    #[must_use]
    pub fn bundle_type(&self) -> &str {
        &self.bundle_type
    }

    /// Creation timestamp (microsecond resolution).
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// User metadata (without the reserved identity keys).
    #[must_use]
    pub const fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Mutable user metadata.
    ///
    /// Reserved keys inserted here make the bundle fail [`Bundle::validate`].
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Structured data.
    #[must_use]
    pub const fn data(&self) -> &Metadata {
        &self.data
    }

    /// Mutable structured data.
    pub fn data_mut(&mut self) -> &mut Metadata {
        &mut self.data
    }

    /// Recorded file references, in insertion order.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Insert one data entry, returning the bundle for chaining.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Insert one metadata entry, returning the bundle for chaining.
    ///
    /// Reserved keys (`id`, `bundle_type`, `time`) are owned by the bundle
    /// identity; an entry under one of them is dropped with a warning.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            tracing::warn!(bundle = %self.id, key = %key, "ignoring reserved metadata key");
            return self;
        }
        self.metadata.insert(key, value.into());
        self
    }

    /// Record a file reference.
    ///
    /// Relative paths resolve against the current working directory, which
    /// during a run is the step scratch directory. With `copy` the file is
    /// duplicated into the experiment scratch directory (so it outlives the
    /// step) and the copy's path is recorded; otherwise the absolute path
    /// of the original is recorded.
    ///
    /// Returns the recorded path.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingFile`] if `path` is not an existing file
    /// - [`Error::InvalidBundle`] if `copy` is requested on a bundle not
    ///   created through a step context
    /// - [`Error::Io`] if the copy fails
    pub fn add_file(&mut self, path: impl AsRef<Path>, copy: bool) -> Result<PathBuf> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::MissingFile(path.to_path_buf()));
        }
        let source = fs::canonicalize(path)?;

        let recorded = if copy {
            let copy_dir = self.copy_dir.as_ref().ok_or_else(|| {
                Error::InvalidBundle(format!(
                    "bundle '{}' has no experiment scratch directory to copy into",
                    self.id
                ))
            })?;
            let target_dir = copy_dir.join(&self.id);
            fs::create_dir_all(&target_dir)?;
            let file_name = source
                .file_name()
                .ok_or_else(|| Error::MissingFile(source.clone()))?;
            let target = target_dir.join(file_name);
            fs::copy(&source, &target)?;
            target
        } else {
            source
        };

        tracing::debug!(bundle = %self.id, file = %recorded.display(), copy, "added file");
        self.files.push(recorded.clone());
        Ok(recorded)
    }

    /// Check the bundle carries a usable identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBundle`] if `id` or `bundle_type` is empty,
    /// or if user metadata holds a reserved key.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidBundle(format!(
                "bundle of type '{}' has an empty id",
                self.bundle_type
            )));
        }
        if self.bundle_type.trim().is_empty() {
            return Err(Error::InvalidBundle(format!(
                "bundle '{}' has an empty bundle_type",
                self.id
            )));
        }
        if let Some(key) = RESERVED_KEYS.iter().find(|key| self.metadata.contains_key(**key)) {
            return Err(Error::InvalidBundle(format!(
                "bundle '{}' sets reserved metadata key '{key}'",
                self.id
            )));
        }
        Ok(())
    }

    /// Convert to the plain wire mapping.
    #[must_use]
    pub fn externalize(&self) -> WireBundle {
        let mut metadata = self.metadata.clone();
        metadata.insert(ID_KEY.to_string(), Value::from(self.id.clone()));
        metadata.insert(
            BUNDLE_TYPE_KEY.to_string(),
            Value::from(self.bundle_type.clone()),
        );
        metadata.insert(
            TIME_KEY.to_string(),
            Value::from(format_timestamp(&self.created_at)),
        );

        WireBundle {
            data: self.data.clone(),
            metadata,
            files: self
                .files
                .iter()
                .map(|path| path.to_string_lossy().into_owned())
                .collect(),
        }
    }

    /// Rebuild a bundle from its wire mapping.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidBundle`] if `id` or `bundle_type` is missing or not a string
    /// - [`Error::Timestamp`] if `time` is present but malformed
    pub fn internalize(wire: WireBundle) -> Result<Self> {
        let WireBundle {
            data,
            mut metadata,
            files,
        } = wire;

        let id = take_string(&mut metadata, ID_KEY)?;
        let bundle_type = take_string(&mut metadata, BUNDLE_TYPE_KEY)?;
        let created_at = match metadata.remove(TIME_KEY) {
            Some(Value::String(stamp)) => parse_timestamp(&stamp)?,
            Some(other) => {
                return Err(Error::InvalidBundle(format!(
                    "bundle '{id}' has a non-string time: {other}"
                )))
            }
            None => now(),
        };

        let bundle = Self {
            id,
            bundle_type,
            created_at,
            metadata,
            data,
            files: files.into_iter().map(PathBuf::from).collect(),
            copy_dir: None,
        };
        bundle.validate()?;
        Ok(bundle)
    }

    /// Externalize straight to a JSON value.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_value(&self) -> Result<Value> {
        self.externalize().to_value()
    }

    /// Internalize straight from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns error if the value is not a valid wire bundle.
    pub fn from_value(value: Value) -> Result<Self> {
        Self::internalize(WireBundle::from_value(value)?)
    }
}

fn take_string(metadata: &mut Metadata, key: &str) -> Result<String> {
    match metadata.remove(key) {
        Some(Value::String(value)) => Ok(value),
        Some(other) => Err(Error::InvalidBundle(format!(
            "metadata.{key} must be a string, got {other}"
        ))),
        None => Err(Error::InvalidBundle(format!("metadata.{key} is missing"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_with_id_starts_empty() {
        let bundle = Bundle::with_id("b-1", "fit");
        assert_eq!(bundle.id(), "b-1");
        assert_eq!(bundle.bundle_type(), "fit");
        assert!(bundle.data().is_empty());
        assert!(bundle.files().is_empty());
    }

    #[test]
    fn test_externalize_writes_reserved_keys() {
        let bundle = Bundle::with_id("b-1", "fit").with_metadata("owner", "lab");
        let wire = bundle.externalize();
        assert_eq!(wire.metadata["id"], json!("b-1"));
        assert_eq!(wire.metadata["bundle_type"], json!("fit"));
        assert_eq!(wire.metadata["owner"], json!("lab"));
        assert!(wire.metadata["time"].as_str().unwrap().ends_with("_UTC"));
    }

    #[test]
    fn test_internalize_restores_bundle_type() {
        let wire = WireBundle::from_value(json!({
            "data": {"x": 1},
            "metadata": {"id": "b-9", "bundle_type": "script", "time": "2015-01-02_03-04-05-000006_UTC"},
            "files": ["/tmp/out"]
        }))
        .unwrap();
        let bundle = Bundle::internalize(wire).unwrap();
        assert_eq!(bundle.bundle_type(), "script");
        assert_eq!(bundle.files(), &[PathBuf::from("/tmp/out")]);
        assert!(bundle.metadata().is_empty());
    }

    #[test]
    fn test_internalize_rejects_missing_identity() {
        let wire = WireBundle::from_value(json!({"data": {}, "metadata": {"id": "b"}})).unwrap();
        assert!(matches!(
            Bundle::internalize(wire),
            Err(Error::InvalidBundle(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_identity() {
        assert!(Bundle::with_id("", "fit").validate().is_err());
        assert!(Bundle::with_id("b", " ").validate().is_err());
        assert!(Bundle::with_id("b", "fit").validate().is_ok());
    }

    #[test]
    fn test_with_metadata_ignores_reserved_keys() {
        let bundle = Bundle::with_id("b-1", "fit")
            .with_metadata("time", "yesterday")
            .with_metadata("id", "other")
            .with_metadata("bundle_type", "raw")
            .with_metadata("owner", "lab");
        assert_eq!(bundle.metadata().len(), 1);
        assert!(bundle.validate().is_ok());

        let back = Bundle::internalize(bundle.externalize()).unwrap();
        assert_eq!(back, bundle);
        assert_eq!(back.id(), "b-1");
        assert_eq!(back.bundle_type(), "fit");
    }

    #[test]
    fn test_validate_rejects_reserved_metadata() {
        let mut bundle = Bundle::with_id("b-1", "fit");
        bundle.metadata_mut().insert("time".to_string(), json!("yesterday"));
        let err = bundle.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidBundle(_)));
        assert!(format!("{err}").contains("'time'"));
    }

    #[test]
    fn test_add_file_missing() {
        let mut bundle = Bundle::with_id("b", "fit");
        let err = bundle.add_file("/definitely/not/here.txt", false).unwrap_err();
        assert!(matches!(err, Error::MissingFile(_)));
    }

    #[test]
    fn test_add_file_copy_requires_step_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        fs::write(&path, "42").unwrap();

        let mut bundle = Bundle::with_id("b", "fit");
        assert!(matches!(
            bundle.add_file(&path, true),
            Err(Error::InvalidBundle(_))
        ));
        let recorded = bundle.add_file(&path, false).unwrap();
        assert_eq!(recorded, fs::canonicalize(&path).unwrap());
    }
}
