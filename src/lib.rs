//! # Protos-DB: Experiment Scheduling and Result Storage
//!
//! **Version**: 0.1.0
//!
//! Protos-DB runs *experiments*: ordered compositions of named *protocol*
//! steps, where later steps consume the not-yet-computed outputs of earlier
//! ones. Every step's output ([`Bundle`]) and the experiment's own metadata
//! are persisted through one storage contract, queryable afterwards with
//! structural subset patterns.
//!
//! ## Design Principles
//!
//! - **Two passes**: a build pass records the schedule and hands out
//!   [`token::Token`]s; a run pass executes it. Nothing runs while building.
//! - **One query language**: [`pattern::matches`] defines the semantics
//!   every adapter must reproduce, natively or by scanning.
//! - **Fail fast**: the first failing step aborts the run, after its message
//!   is persisted to `last_error`.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use protos_db::experiment::Builder;
//! use protos_db::protocol::ProtocolRegistry;
//! use protos_db::token::Args;
//! use protos_db::{storage, Bundle, Config};
//!
//! let mut protocols = ProtocolRegistry::new();
//! protocols.register("optics.calibrate", |ctx, _| {
//!     Ok(Bundle::create(ctx, "calibration").with_data("offset", 0.25))
//! })?;
//! protocols.register("optics.measure", |ctx, inputs| {
//!     let offset = inputs
//!         .bundle(0)
//!         .and_then(|b| b.data().get("offset"))
//!         .and_then(|v| v.as_f64())
//!         .unwrap_or(0.0);
//!     Ok(Bundle::create(ctx, "measurement").with_data("value", 10.0 - offset))
//! })?;
//!
//! let config = Config::load_from("protos.toml")?;
//! let experiment = Builder::from_config("nightly-scan", &config).define(|b| {
//!     let cal = b.call(&protocols, "optics.calibrate", Args::new())?;
//!     b.call(&protocols, "optics.measure", Args::new().arg(cal))?;
//!     Ok::<_, protos_db::Error>(())
//! })?;
//!
//! let mut store = storage::open(&config)?;
//! let run = experiment.run(store.as_mut())?;
//! println!("{} finished at {}%", run.xid(), run.metadata().progress);
//! # Ok::<(), protos_db::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod bundle;
pub mod config;
pub mod docstore;
pub mod error;
pub mod experiment;
pub mod logging;
pub mod pattern;
pub mod protocol;
pub mod query;
pub mod storage;
pub mod time;
pub mod token;

pub use bundle::{Bundle, Metadata, WireBundle};
pub use config::Config;
pub use error::{Error, Result};
pub use experiment::{Builder, Experiment, ExperimentMetadata, ExperimentRun, StepContext};
pub use pattern::matches;
pub use protocol::{Protocol, ProtocolRegistry};
pub use storage::StorageAdapter;
pub use token::{Args, Inputs, Token};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
