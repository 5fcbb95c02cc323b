//! Build pass - declaring an experiment without running it

use std::path::PathBuf;

use crate::config::Config;
use crate::protocol::{Protocol, ProtocolRegistry};
use crate::token::{Args, Token};
use crate::Result;

/// One scheduled protocol call.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    protocol: Protocol,
    produces: Token,
    args: Args,
}

impl ScheduleEntry {
    /// The protocol to invoke.
    #[must_use]
    pub const fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Token standing for this entry's bundle.
    #[must_use]
    pub const fn produces(&self) -> Token {
        self.produces
    }

    /// Arguments, possibly containing tokens.
    #[must_use]
    pub const fn args(&self) -> &Args {
        &self.args
    }
}

/// Scratch directory policy for the run pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScratchSettings {
    /// Parent of the experiment scratch directory (system temp dir if unset)
    pub root: Option<PathBuf>,
    /// Keep scratch directories after the run
    pub preserve: bool,
    /// Remove leftover preserved scratch directories of this experiment first
    pub reset: bool,
}

/// Records protocol calls during the build pass.
///
/// Every scheduled call appends one [`ScheduleEntry`] and returns a fresh
/// [`Token`] whose id equals the entry's position. Nothing is executed.
///
/// ```rust
/// use protos_db::experiment::Builder;
/// use protos_db::protocol::Protocol;
/// use protos_db::token::Args;
/// use protos_db::Bundle;
///
/// let acquire = Protocol::new("acquire", |ctx, _| Ok(Bundle::create(ctx, "acquire")));
/// let reduce = Protocol::new("reduce", |ctx, inputs| {
///     let raw = inputs.bundle(0).expect("acquire output");
///     Ok(Bundle::create(ctx, "reduce").with_data("source", raw.id()))
/// });
///
/// let experiment = Builder::new("pipeline")
///     .define(|b| {
///         let raw = b.schedule(&acquire, Args::new());
///         b.schedule(&reduce, Args::new().arg(raw));
///         Ok::<_, std::convert::Infallible>(())
///     })
///     .unwrap();
/// assert_eq!(experiment.len(), 2);
/// ```
#[derive(Debug)]
pub struct Builder {
    name: String,
    tags: Vec<String>,
    entries: Vec<ScheduleEntry>,
    scratch: ScratchSettings,
}

impl Builder {
    /// Start defining an experiment called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            entries: Vec::new(),
            scratch: ScratchSettings::default(),
        }
    }

    /// Start defining an experiment with the scratch policy from `config`.
    #[must_use]
    pub fn from_config(name: impl Into<String>, config: &Config) -> Self {
        let mut builder = Self::new(name);
        builder.scratch = ScratchSettings {
            root: config.scratch_dir.clone(),
            preserve: config.preserve,
            reset: config.reset,
        };
        builder
    }

    /// Run `definition` against this builder and freeze the schedule.
    ///
    /// An error from `definition` aborts before anything runs and is
    /// returned unmodified.
    ///
    /// # Errors
    ///
    /// Whatever `definition` returns.
    pub fn define<F, E>(mut self, definition: F) -> std::result::Result<super::Experiment, E>
    where
        F: FnOnce(&mut Self) -> std::result::Result<(), E>,
    {
        definition(&mut self)?;
        Ok(self.finish())
    }

    /// Add an experiment tag.
    pub fn tag(&mut self, tag: impl Into<String>) -> &mut Self {
        self.tags.push(tag.into());
        self
    }

    /// Parent directory for scratch directories.
    pub fn scratch_root(&mut self, root: impl Into<PathBuf>) -> &mut Self {
        self.scratch.root = Some(root.into());
        self
    }

    /// Keep scratch directories after the run.
    pub fn preserve(&mut self, preserve: bool) -> &mut Self {
        self.scratch.preserve = preserve;
        self
    }

    /// Clear leftover preserved scratch directories before the run.
    pub fn reset(&mut self, reset: bool) -> &mut Self {
        self.scratch.reset = reset;
        self
    }

    /// Schedule `protocol` with `args`; returns the token for its bundle.
    pub fn schedule(&mut self, protocol: &Protocol, args: Args) -> Token {
        let produces = Token::new(self.entries.len());
        tracing::debug!(
            experiment = %self.name,
            protocol = protocol.name(),
            token = produces.id(),
            "scheduled step"
        );
        self.entries.push(ScheduleEntry {
            protocol: protocol.clone(),
            produces,
            args,
        });
        produces
    }

    /// Schedule the protocol registered under the dotted `name`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::UnknownProtocol`] if `name` is not registered.
    pub fn call(&mut self, registry: &ProtocolRegistry, name: &str, args: Args) -> Result<Token> {
        let protocol = registry.get(name)?;
        Ok(self.schedule(protocol, args))
    }

    /// Experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of scheduled steps so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze the schedule.
    #[must_use]
    pub fn finish(self) -> super::Experiment {
        super::Experiment {
            name: self.name,
            tags: self.tags,
            entries: self.entries,
            scratch: self.scratch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Bundle;
    use crate::Error;

    fn step(name: &str) -> Protocol {
        Protocol::new(name, |_, _| -> anyhow::Result<Bundle> {
            panic!("protocols must not run during the build pass")
        })
    }

    #[test]
    fn test_tokens_follow_registration_order() {
        let a = step("a");
        let mut builder = Builder::new("x");
        let t0 = builder.schedule(&a, Args::new());
        let t1 = builder.schedule(&a, Args::new().arg(t0));
        let t2 = builder.schedule(&a, Args::new().arg(t1).kwarg("first", t0));
        assert_eq!((t0.id(), t1.id(), t2.id()), (0, 1, 2));

        let experiment = builder.finish();
        let produced: Vec<usize> = experiment
            .entries()
            .iter()
            .map(|entry| entry.produces().id())
            .collect();
        assert_eq!(produced, vec![0, 1, 2]);
    }

    #[test]
    fn test_call_by_dotted_name() {
        let mut registry = ProtocolRegistry::new();
        registry.insert(step("lab.prep")).unwrap();

        let mut builder = Builder::new("x");
        let token = builder.call(&registry, "lab.prep", Args::new()).unwrap();
        assert_eq!(token.id(), 0);
        assert!(matches!(
            builder.call(&registry, "lab.missing", Args::new()),
            Err(Error::UnknownProtocol(_))
        ));
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn test_define_surfaces_definition_error_unmodified() {
        let result = Builder::new("x").define(|b| {
            b.schedule(&step("a"), Args::new());
            Err("definition exploded")
        });
        assert_eq!(result.unwrap_err(), "definition exploded");
    }

    #[test]
    fn test_from_config_copies_scratch_policy() {
        let config = Config::default().with_preserve(true).with_reset(true);
        let experiment = Builder::from_config("x", &config).finish();
        assert!(experiment.scratch().preserve);
        assert!(experiment.scratch().reset);
    }
}
