//! Configuration consumed by the scheduler and the storage adapters
//!
//! A [`Config`] is an explicit value: it is passed to
//! [`crate::experiment::Builder::from_config`] and to every storage adapter
//! constructor. Sources, later ones winning:
//!
//! 1. built-in defaults
//! 2. a TOML file
//! 3. `PROTOS_*` environment variables (`PROTOS_PROJECT_NAME=...`)
//!
//! ```toml
//! storage = "disk"
//! project_name = "optics"
//! data_dir = "/srv/protos/data"
//! preserve = false
//! ```

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "PROTOS_";

/// Scheduler and storage configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage adapter name (`none`, `disk`, `document`, `relational`)
    pub storage: String,
    /// Adapter endpoint (database path for `relational`)
    pub storage_server: Option<String>,
    /// Project the experiments belong to
    pub project_name: String,
    /// Root directory of the `disk` adapter
    pub data_dir: PathBuf,
    /// Parent of scratch directories (system temp dir if unset)
    pub scratch_dir: Option<PathBuf>,
    /// Keep scratch directories after a run
    pub preserve: bool,
    /// Remove leftover preserved scratch directories before a run
    pub reset: bool,
    /// Default log filter for [`crate::logging::init_from_config`]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: "disk".to_string(),
            storage_server: None,
            project_name: "default".to_string(),
            data_dir: PathBuf::from("data"),
            scratch_dir: None,
            preserve: false,
            reset: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Defaults merged with `PROTOS_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns error if an environment value has the wrong type.
    pub fn from_env() -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the TOML file at `path`, then `PROTOS_*` variables.
    ///
    /// # Errors
    ///
    /// Returns error if the file is malformed or the result fails validation.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string on top of the defaults (no environment).
    ///
    /// # Errors
    ///
    /// Returns error if the TOML is malformed or the result fails validation.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an empty project name or storage
    /// name, or an empty `data_dir` with the `disk` adapter.
    pub fn validate(&self) -> Result<()> {
        if self.storage.trim().is_empty() {
            return Err(Error::InvalidConfig("storage cannot be empty".to_string()));
        }
        if self.project_name.trim().is_empty() {
            return Err(Error::InvalidConfig("project_name cannot be empty".to_string()));
        }
        if self.storage == "disk" && self.data_dir.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "data_dir cannot be empty when using the disk storage adapter".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the storage adapter name.
    #[must_use]
    pub fn with_storage(mut self, storage: impl Into<String>) -> Self {
        self.storage = storage.into();
        self
    }

    /// Set the adapter endpoint.
    #[must_use]
    pub fn with_storage_server(mut self, server: impl Into<String>) -> Self {
        self.storage_server = Some(server.into());
        self
    }

    /// Set the project name.
    #[must_use]
    pub fn with_project_name(mut self, project: impl Into<String>) -> Self {
        self.project_name = project.into();
        self
    }

    /// Set the disk adapter root.
    #[must_use]
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the scratch directory parent.
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Keep scratch directories.
    #[must_use]
    pub const fn with_preserve(mut self, preserve: bool) -> Self {
        self.preserve = preserve;
        self
    }

    /// Clear stale scratch directories before a run.
    #[must_use]
    pub const fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }
}
