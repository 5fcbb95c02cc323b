//! Protocols - named, schedulable units of work
//!
//! A [`Protocol`] wraps a plain function
//! `f(&mut StepContext, &Inputs) -> anyhow::Result<Bundle>`. Protocols are
//! never invoked while an experiment is being defined: the build pass
//! records a schedule entry and hands back a [`crate::token::Token`]
//! instead. Only the run pass calls the function.
//!
//! Protocols can be organised hierarchically in a [`ProtocolRegistry`]
//! under dotted names (`"imaging.calibrate.dark_frame"`).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::bundle::Bundle;
use crate::experiment::StepContext;
use crate::token::Inputs;
use crate::{Error, Result};

/// Signature of a protocol function.
pub type ProtocolFn = dyn Fn(&mut StepContext<'_>, &Inputs) -> anyhow::Result<Bundle> + Send + Sync;

/// A schedulable step implementation.
#[derive(Clone)]
pub struct Protocol {
    name: String,
    function: Arc<ProtocolFn>,
}

impl Protocol {
    /// Wrap `function` under `name`.
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&mut StepContext<'_>, &Inputs) -> anyhow::Result<Bundle> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            function: Arc::new(function),
        }
    }

    /// Fully qualified protocol name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the wrapped function. Only the run pass calls this.
    pub(crate) fn invoke(&self, ctx: &mut StepContext<'_>, inputs: &Inputs) -> anyhow::Result<Bundle> {
        (self.function)(ctx, inputs)
    }
}

impl fmt::Debug for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Protocol").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Dotted-name lookup table of protocols.
#[derive(Debug, Clone, Default)]
pub struct ProtocolRegistry {
    protocols: BTreeMap<String, Protocol>,
}

impl ProtocolRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under the dotted `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateProtocol`] if the name is taken and
    /// [`Error::InvalidConfig`] if it has an empty path segment.
    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> Result<()>
    where
        F: Fn(&mut StepContext<'_>, &Inputs) -> anyhow::Result<Bundle> + Send + Sync + 'static,
    {
        self.insert(Protocol::new(name, function))
    }

    /// Register an already wrapped protocol under its own name.
    ///
    /// # Errors
    ///
    /// See [`ProtocolRegistry::register`].
    pub fn insert(&mut self, protocol: Protocol) -> Result<()> {
        let name = protocol.name().to_string();
        if name.split('.').any(str::is_empty) {
            return Err(Error::InvalidConfig(format!(
                "protocol name '{name}' has an empty segment"
            )));
        }
        if self.protocols.contains_key(&name) {
            return Err(Error::DuplicateProtocol(name));
        }
        self.protocols.insert(name, protocol);
        Ok(())
    }

    /// Look up a protocol by its fully qualified name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownProtocol`] if nothing is registered under `name`.
    pub fn get(&self, name: &str) -> Result<&Protocol> {
        self.protocols
            .get(name)
            .ok_or_else(|| Error::UnknownProtocol(name.to_string()))
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.protocols.contains_key(name)
    }

    /// Prefixed view resolving names relative to `prefix`.
    #[must_use]
    pub fn namespace<'a>(&'a self, prefix: &str) -> Namespace<'a> {
        Namespace {
            registry: self,
            prefix: prefix.trim_end_matches('.').to_string(),
        }
    }

    /// All registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.protocols.keys().map(String::as_str)
    }

    /// Number of registered protocols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.protocols.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }
}

/// View of a [`ProtocolRegistry`] below a dotted prefix.
#[derive(Debug, Clone)]
pub struct Namespace<'a> {
    registry: &'a ProtocolRegistry,
    prefix: String,
}

impl<'a> Namespace<'a> {
    /// Look up `name` relative to this namespace.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownProtocol`] with the fully qualified name.
    pub fn get(&self, name: &str) -> Result<&'a Protocol> {
        self.registry.get(&self.qualify(name))
    }

    /// Nested namespace.
    #[must_use]
    pub fn namespace(&self, prefix: &str) -> Self {
        Self {
            registry: self.registry,
            prefix: self.qualify(prefix.trim_end_matches('.')),
        }
    }

    /// Fully qualified form of `name`.
    #[must_use]
    pub fn qualify(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.prefix)
        }
    }

    /// Names registered directly or transitively below this namespace.
    pub fn names(&self) -> impl Iterator<Item = &'a str> + '_ {
        let prefix = format!("{}.", self.prefix);
        self.registry
            .names()
            .filter(move |name| self.prefix.is_empty() || name.starts_with(&prefix))
    }
}
