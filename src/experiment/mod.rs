//! Experiment scheduling
//!
//! An experiment is declared in a synchronous *build* pass and executed in
//! a later *run* pass:
//!
//! ```text
//! Builder::schedule(protocol, args) -> Token      (build: bookkeeping only)
//!          │
//!          ▼
//! Builder::finish() -> Experiment                 (schedule frozen)
//!          │
//!          ▼
//! Experiment::run(storage) -> ExperimentRun       (run: in registration order)
//!   for each entry:
//!     resolve tokens -> bundles
//!     enter fresh step scratch directory
//!     invoke protocol(StepContext, Inputs) -> Bundle
//!     write_bundle + write progress
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use protos_db::experiment::Builder;
//! use protos_db::protocol::Protocol;
//! use protos_db::storage::NoopStore;
//! use protos_db::token::Args;
//! use protos_db::Bundle;
//!
//! let measure = Protocol::new("measure", |ctx, _| {
//!     Ok(Bundle::create(ctx, "measure").with_data("counts", 1200))
//! });
//!
//! let mut b = Builder::new("dark-current");
//! b.tag("nightly");
//! b.schedule(&measure, Args::new());
//!
//! let mut storage = NoopStore::new();
//! let run = b.finish().run(&mut storage)?;
//! assert_eq!(run.metadata().progress, "100");
//! # Ok::<(), protos_db::Error>(())
//! ```

mod builder;
mod metadata;
mod run;

pub use builder::{Builder, ScheduleEntry, ScratchSettings};
pub use metadata::{ExperimentMetadata, ExperimentMetadataBuilder};
pub use run::{ExperimentRun, StepContext};

/// A frozen schedule, ready for exactly one run.
#[derive(Debug)]
pub struct Experiment {
    name: String,
    tags: Vec<String>,
    entries: Vec<ScheduleEntry>,
    scratch: ScratchSettings,
}

impl Experiment {
    /// Experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Experiment tags.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Scheduled steps in execution order.
    #[must_use]
    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// Scratch directory policy.
    #[must_use]
    pub const fn scratch(&self) -> &ScratchSettings {
        &self.scratch
    }

    /// Number of scheduled steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the experiment has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
