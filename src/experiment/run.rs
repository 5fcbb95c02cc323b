//! Run pass - executing a frozen schedule
//!
//! Steps run strictly sequentially in registration order. Before each step
//! its tokens are replaced by the bundles already produced, a fresh step
//! scratch directory becomes the working directory, and the protocol
//! function is invoked. The returned bundle is persisted and experiment
//! progress is written before the next step starts.
//!
//! A failing step has its message written to `last_error` before the
//! failure propagates; the run aborts (fail-fast, no retry, no resume).
//! A panic inside a protocol function counts as a failing step.
//!
//! Scratch layout: `<root>/protos-scratch/<encoded name>/run-XXXXXX/stepN-XXXXXX`.
//! Each experiment name owns one directory, so `reset` only ever clears
//! runs of the same experiment.

use std::any::Any;
use std::env;
use std::fmt::Write as _;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;
use tempfile::TempDir;
use tracing::{debug, error, info, warn};

use super::builder::{ScheduleEntry, ScratchSettings};
use super::metadata::ExperimentMetadata;
use crate::bundle::Bundle;
use crate::storage::StorageAdapter;
use crate::token::Token;
use crate::{Error, Result};

/// Everything a protocol function may reach while it runs.
pub struct StepContext<'a> {
    name: &'a str,
    token: Token,
    xid: &'a str,
    storage: &'a mut dyn StorageAdapter,
    experiment_dir: &'a Path,
    step_dir: &'a Path,
}

impl<'a> StepContext<'a> {
    /// Token id of the running step (unique within the experiment).
    #[must_use]
    pub const fn token(&self) -> Token {
        self.token
    }

    /// Protocol name of the running step.
    #[must_use]
    pub const fn step_name(&self) -> &'a str {
        self.name
    }

    /// Persistent experiment id assigned by the storage adapter.
    #[must_use]
    pub const fn xid(&self) -> &'a str {
        self.xid
    }

    /// The bound storage adapter.
    pub fn storage(&mut self) -> &mut dyn StorageAdapter {
        &mut *self.storage
    }

    /// Experiment scratch directory, for files that must outlive the step.
    #[must_use]
    pub const fn experiment_dir(&self) -> &'a Path {
        self.experiment_dir
    }

    /// Step scratch directory (also the working directory while the step runs).
    #[must_use]
    pub const fn step_dir(&self) -> &'a Path {
        self.step_dir
    }
}

/// Outcome of a completed experiment run.
#[derive(Debug, Clone)]
pub struct ExperimentRun {
    xid: String,
    metadata: ExperimentMetadata,
    bundles: Vec<Bundle>,
    experiment_dir: Option<PathBuf>,
}

impl ExperimentRun {
    /// Storage-assigned experiment id.
    #[must_use]
    pub fn xid(&self) -> &str {
        &self.xid
    }

    /// Final experiment metadata as persisted.
    #[must_use]
    pub const fn metadata(&self) -> &ExperimentMetadata {
        &self.metadata
    }

    /// Produced bundles, in step order.
    #[must_use]
    pub fn bundles(&self) -> &[Bundle] {
        &self.bundles
    }

    /// Bundle produced for `token`.
    #[must_use]
    pub fn bundle(&self, token: Token) -> Option<&Bundle> {
        self.bundles.get(token.id())
    }

    /// Experiment scratch directory, if it was preserved.
    #[must_use]
    pub fn experiment_dir(&self) -> Option<&Path> {
        self.experiment_dir.as_deref()
    }
}

/// Restores the previous working directory on drop.
struct WorkingDirectory {
    previous: PathBuf,
}

impl WorkingDirectory {
    fn enter(dir: &Path) -> Result<Self> {
        let previous = env::current_dir()?;
        env::set_current_dir(dir)?;
        Ok(Self { previous })
    }
}

impl Drop for WorkingDirectory {
    fn drop(&mut self) {
        if let Err(err) = env::set_current_dir(&self.previous) {
            warn!(dir = %self.previous.display(), error = %err, "failed to restore working directory");
        }
    }
}

impl super::Experiment {
    /// Execute every scheduled step in order against `storage`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvertedDependency`] if a step consumes a token whose
    ///   producer has not run
    /// - [`Error::StepFailed`] if a protocol function raises
    /// - [`Error::InvalidBundle`] if a step returns a bundle without identity
    /// - storage errors from the adapter
    ///
    /// Except for failures creating the experiment record itself, the
    /// error message is persisted to `last_error` before returning.
    pub fn run(self, storage: &mut dyn StorageAdapter) -> Result<ExperimentRun> {
        let total = self.entries.len();
        let mut metadata = ExperimentMetadata::builder(self.name.clone())
            .tags(self.tags.clone())
            .build();

        let xid = storage.create_experiment_id(&self.name)?;
        metadata.id.clone_from(&xid);
        storage.write_experiment_metadata(&metadata.to_metadata()?, &xid)?;
        info!(experiment = %self.name, %xid, steps = total, adapter = storage.name(), "running experiment");

        let experiment_dir = match create_experiment_dir(&self.name, &self.scratch) {
            Ok(dir) => dir,
            Err(err) => {
                record_failure(storage, &mut metadata, &xid, &err);
                return Err(err);
            }
        };

        let mut produced: FxHashMap<usize, Bundle> = FxHashMap::default();
        let mut bundles = Vec::with_capacity(total);

        for (position, entry) in self.entries.iter().enumerate() {
            let outcome = run_step(
                entry,
                &produced,
                storage,
                &xid,
                experiment_dir.path(),
                &self.scratch,
            )
            .and_then(|bundle| {
                metadata.set_progress(position + 1, total);
                storage.write_experiment_metadata(&metadata.to_metadata()?, &xid)?;
                Ok(bundle)
            });

            match outcome {
                Ok(bundle) => {
                    info!(
                        step = entry.protocol().name(),
                        token = entry.produces().id(),
                        bundle = bundle.id(),
                        progress = %metadata.progress,
                        "step complete"
                    );
                    produced.insert(entry.produces().id(), bundle.clone());
                    bundles.push(bundle);
                }
                Err(err) => {
                    record_failure(storage, &mut metadata, &xid, &err);
                    return Err(err);
                }
            }
        }

        if total == 0 {
            metadata.set_progress(0, 0);
            storage.write_experiment_metadata(&metadata.to_metadata()?, &xid)?;
        }

        let preserved = self.scratch.preserve.then(|| experiment_dir.path().to_path_buf());
        info!(experiment = %self.name, %xid, "experiment complete");
        Ok(ExperimentRun {
            xid,
            metadata,
            bundles,
            experiment_dir: preserved,
        })
    }
}

fn run_step(
    entry: &ScheduleEntry,
    produced: &FxHashMap<usize, Bundle>,
    storage: &mut dyn StorageAdapter,
    xid: &str,
    experiment_dir: &Path,
    scratch: &ScratchSettings,
) -> Result<Bundle> {
    let name = entry.protocol().name();
    let token = entry.produces();

    let inputs = entry.args().resolve(|needed| {
        produced
            .get(&needed.id())
            .cloned()
            .ok_or_else(|| Error::InvertedDependency {
                step: name.to_string(),
                token: needed.id(),
            })
    })?;

    let step_dir = scratch_dir(&format!("step{}-", token.id()), experiment_dir, scratch.preserve)?;
    debug!(step = name, token = token.id(), dir = %step_dir.path().display(), "invoking step");

    let result = {
        let _cwd = WorkingDirectory::enter(step_dir.path())?;
        let mut ctx = StepContext {
            name,
            token,
            xid,
            storage: &mut *storage,
            experiment_dir,
            step_dir: step_dir.path(),
        };
        panic::catch_unwind(AssertUnwindSafe(|| entry.protocol().invoke(&mut ctx, &inputs)))
            .unwrap_or_else(|payload| Err(anyhow::anyhow!("step panicked: {}", panic_message(&*payload))))
    };

    let bundle = result.map_err(|err| Error::StepFailed {
        step: name.to_string(),
        token: token.id(),
        source: err.into(),
    })?;
    bundle.validate()?;
    storage.write_bundle(&bundle, xid)?;
    Ok(bundle)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Directory under the scratch root shared by all protos experiments.
const SCRATCH_DIR: &str = "protos-scratch";

fn create_experiment_dir(name: &str, scratch: &ScratchSettings) -> Result<TempDir> {
    let root = scratch.root.clone().unwrap_or_else(env::temp_dir);
    let parent = root.join(SCRATCH_DIR).join(encode_name(name));
    fs::create_dir_all(&parent)?;
    let parent = fs::canonicalize(parent)?;
    if scratch.reset {
        clear_stale_scratch(&parent)?;
    }
    scratch_dir("run-", &parent, scratch.preserve)
}

fn scratch_dir(prefix: &str, parent: &Path, preserve: bool) -> Result<TempDir> {
    Ok(tempfile::Builder::new()
        .prefix(prefix)
        .disable_cleanup(preserve)
        .tempdir_in(parent)?)
}

/// Injective, filesystem-safe encoding of an experiment name.
///
/// ASCII alphanumerics and `-` pass through; every other byte becomes
/// `_xx` (lowercase hex). The empty name encodes as `_`.
fn encode_name(name: &str) -> String {
    if name.is_empty() {
        return "_".to_string();
    }
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(char::from(byte));
        } else {
            let _ = write!(encoded, "_{byte:02x}");
        }
    }
    encoded
}

/// Remove every run directory left behind in one experiment's scratch dir.
fn clear_stale_scratch(experiment_root: &Path) -> Result<()> {
    for entry in fs::read_dir(experiment_root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            debug!(dir = %entry.path().display(), "removing stale scratch directory");
            fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

fn record_failure(
    storage: &mut dyn StorageAdapter,
    metadata: &mut ExperimentMetadata,
    xid: &str,
    err: &Error,
) {
    metadata.last_error = match err {
        Error::StepFailed { source, .. } => source.to_string(),
        other => other.to_string(),
    };
    error!(%xid, error = %metadata.last_error, "experiment aborted");

    let persisted = metadata
        .to_metadata()
        .and_then(|md| storage.write_experiment_metadata(&md, xid));
    if let Err(write_err) = persisted {
        error!(%xid, error = %write_err, "failed to persist last_error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_name_is_filesystem_safe() {
        assert_eq!(encode_name("a-b"), "a-b");
        assert_eq!(encode_name("my exp/1"), "my_20exp_2f1");
        assert_eq!(encode_name("a_b"), "a_5fb");
        assert_eq!(encode_name(""), "_");
        assert_eq!(encode_name(".."), "_2e_2e");
        assert_eq!(encode_name("é"), "_c3_a9");
    }

    #[test]
    fn test_encode_name_is_injective() {
        let names = ["scan", "scan-2", "scan_2", "scan 2", "scan/2", "scan_202", "", "_"];
        let encoded: std::collections::HashSet<String> = names.iter().map(|n| encode_name(n)).collect();
        assert_eq!(encoded.len(), names.len());
    }

    #[test]
    fn test_clear_stale_scratch_stays_inside_experiment() {
        let root = tempfile::tempdir().unwrap();
        let scan = root.path().join("scan");
        let scan_2 = root.path().join("scan-2");
        fs::create_dir_all(scan.join("run-old1")).unwrap();
        fs::create_dir_all(scan_2.join("run-keep")).unwrap();

        clear_stale_scratch(&scan).unwrap();

        assert!(scan.exists());
        assert!(!scan.join("run-old1").exists());
        assert!(scan_2.join("run-keep").exists());
    }

    #[test]
    fn test_panic_message_from_payload() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&*payload), "boom");
        let payload = panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(&*payload), "code 7");
        let payload = panic::catch_unwind(|| std::panic::panic_any(7_u8)).unwrap_err();
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }
}
