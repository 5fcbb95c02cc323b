//! Experiment metadata - the durable record of one experiment run

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::bundle::Metadata;
use crate::time::timestamp;
use crate::Result;

/// Experiment-level metadata, persisted through the storage adapter.
///
/// `progress` is a stringified integer percentage (`"0"` to `"100"`) and
/// `last_error` is empty until a step fails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExperimentMetadata {
    /// Storage-assigned experiment id (xid)
    #[serde(default)]
    pub id: String,
    /// Experiment name
    pub name: String,
    /// Host the run executed on
    #[serde(default)]
    pub host: String,
    /// `<os>-<arch>` of the executing host
    #[serde(default)]
    pub platform: String,
    /// User that started the run
    #[serde(default)]
    pub user: String,
    /// Start time (`YYYY-MM-DD_HH-MM-SS-ffffff_UTC`)
    #[serde(default)]
    pub time: String,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Completed percentage as a string
    #[serde(default = "zero_progress")]
    pub progress: String,
    /// Message of the step failure that aborted the run, if any
    #[serde(default)]
    pub last_error: String,
}

fn zero_progress() -> String {
    "0".to_string()
}

impl ExperimentMetadata {
    /// Metadata for a new run, with host, platform, user and time taken
    /// from the environment.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    /// Builder for metadata with optional fields.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ExperimentMetadataBuilder {
        ExperimentMetadataBuilder::new(name)
    }

    /// Set `progress` to `round(100 * completed / total)`.
    ///
    /// Exact ties round half to even (1 of 8 is `"12"`, 3 of 8 is `"38"`).
    /// An experiment with no steps is complete.
    pub fn set_progress(&mut self, completed: usize, total: usize) {
        let percent = if total == 0 {
            100
        } else {
            let scaled = 100 * completed;
            let (quotient, twice_remainder) = (scaled / total, 2 * (scaled % total));
            match twice_remainder.cmp(&total) {
                Ordering::Greater => quotient + 1,
                Ordering::Equal => quotient + quotient % 2,
                Ordering::Less => quotient,
            }
        };
        self.progress = percent.to_string();
    }

    /// Convert into the open mapping storage adapters persist.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_metadata(&self) -> Result<Metadata> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(crate::Error::Corrupted(format!(
                "experiment metadata serialized to a non-object: {other}"
            ))),
        }
    }

    /// Parse from a persisted mapping. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if required fields are missing or mistyped.
    pub fn from_metadata(metadata: Metadata) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::Value::Object(metadata))?)
    }
}

/// Builder for [`ExperimentMetadata`].
#[derive(Debug)]
pub struct ExperimentMetadataBuilder {
    name: String,
    tags: Vec<String>,
    host: Option<String>,
    user: Option<String>,
}

impl ExperimentMetadataBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            host: None,
            user: None,
        }
    }

    /// Set the tags.
    #[must_use]
    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Override the detected host name.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Override the detected user name.
    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Build the metadata, stamping the current time.
    #[must_use]
    pub fn build(self) -> ExperimentMetadata {
        ExperimentMetadata {
            id: String::new(),
            name: self.name,
            host: self.host.unwrap_or_else(detect_host),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            user: self.user.unwrap_or_else(detect_user),
            time: timestamp(),
            tags: self.tags,
            progress: zero_progress(),
            last_error: String::new(),
        }
    }
}

fn detect_host() -> String {
    hostname::get().map_or_else(
        |_| "unknown".to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}

fn detect_user() -> String {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}
