//! Tokens and schedule arguments
//!
//! A [`Token`] is a forward reference to the bundle a scheduled step will
//! produce. Tokens are handed out by the build pass and may be passed as
//! arguments to steps registered later; the run pass replaces each token
//! with the real [`Bundle`] just before the consuming step is invoked.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::bundle::Bundle;

/// Forward reference to the bundle produced by one scheduled step.
///
/// Ids are issued in registration order starting at zero and are never
/// reused within one experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token {
    id: usize,
}

impl Token {
    /// Create a token with an explicit id.
    ///
    /// The builder issues tokens itself; this exists for tooling and tests.
    #[must_use]
    pub const fn new(id: usize) -> Self {
        Self { id }
    }

    /// The token id (equal to the producing step's schedule position).
    #[must_use]
    pub const fn id(self) -> usize {
        self.id
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.id)
    }
}

/// One argument of a scheduled step: a plain value or a token.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    /// JSON-representable literal passed through unchanged
    Value(Value),
    /// Placeholder for an earlier step's bundle
    Token(Token),
}

impl Argument {
    /// The token held by this argument, if any.
    #[must_use]
    pub const fn token(&self) -> Option<Token> {
        match self {
            Self::Token(token) => Some(*token),
            Self::Value(_) => None,
        }
    }
}

impl From<Token> for Argument {
    fn from(token: Token) -> Self {
        Self::Token(token)
    }
}

impl From<Value> for Argument {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for Argument {
    fn from(value: &str) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<String> for Argument {
    fn from(value: String) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<i64> for Argument {
    fn from(value: i64) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<f64> for Argument {
    fn from(value: f64) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<bool> for Argument {
    fn from(value: bool) -> Self {
        Self::Value(Value::from(value))
    }
}

/// Positional and keyword arguments of a scheduled step.
///
/// ```rust
/// use protos_db::token::{Args, Token};
///
/// let args = Args::new()
///     .arg(Token::new(0))
///     .kwarg("script", "fit.sh");
/// assert_eq!(args.tokens().count(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    positional: Vec<Argument>,
    keyword: BTreeMap<String, Argument>,
}

impl Args {
    /// Empty argument list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<Argument>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a keyword argument (last write wins).
    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Argument>) -> Self {
        self.keyword.insert(key.into(), value.into());
        self
    }

    /// Positional arguments in order.
    #[must_use]
    pub fn positional(&self) -> &[Argument] {
        &self.positional
    }

    /// Keyword arguments, sorted by key.
    #[must_use]
    pub const fn keyword(&self) -> &BTreeMap<String, Argument> {
        &self.keyword
    }

    /// Every token referenced, positional first.
    pub fn tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.positional
            .iter()
            .chain(self.keyword.values())
            .filter_map(Argument::token)
    }

    /// Replace each token with the bundle returned by `lookup`.
    ///
    /// Stops at the first token `lookup` cannot resolve.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `lookup`.
    pub fn resolve<E>(
        &self,
        mut lookup: impl FnMut(Token) -> Result<Bundle, E>,
    ) -> Result<Inputs, E> {
        let mut resolve_one = |arg: &Argument| -> Result<Input, E> {
            match arg {
                Argument::Value(value) => Ok(Input::Value(value.clone())),
                Argument::Token(token) => lookup(*token).map(Input::Bundle),
            }
        };

        let positional = self
            .positional
            .iter()
            .map(&mut resolve_one)
            .collect::<Result<Vec<_>, E>>()?;
        let keyword = self
            .keyword
            .iter()
            .map(|(key, arg)| resolve_one(arg).map(|input| (key.clone(), input)))
            .collect::<Result<BTreeMap<_, _>, E>>()?;

        Ok(Inputs {
            positional,
            keyword,
        })
    }
}

/// One resolved step argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Literal value
    Value(Value),
    /// Bundle produced by an earlier step
    Bundle(Bundle),
}

impl Input {
    /// The bundle, if this input was a token.
    #[must_use]
    pub const fn as_bundle(&self) -> Option<&Bundle> {
        match self {
            Self::Bundle(bundle) => Some(bundle),
            Self::Value(_) => None,
        }
    }

    /// The literal value, if this input was not a token.
    #[must_use]
    pub const fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Bundle(_) => None,
        }
    }
}

/// Arguments handed to a protocol function, with every token resolved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs {
    positional: Vec<Input>,
    keyword: BTreeMap<String, Input>,
}

impl Inputs {
    /// Positional input at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Input> {
        self.positional.get(index)
    }

    /// Keyword input named `key`.
    #[must_use]
    pub fn kwarg(&self, key: &str) -> Option<&Input> {
        self.keyword.get(key)
    }

    /// Positional bundle at `index`, if that argument was a token.
    #[must_use]
    pub fn bundle(&self, index: usize) -> Option<&Bundle> {
        self.get(index).and_then(Input::as_bundle)
    }

    /// Keyword value named `key`, if it was a literal.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.kwarg(key).and_then(Input::as_value)
    }

    /// All positional inputs.
    #[must_use]
    pub fn positional(&self) -> &[Input] {
        &self.positional
    }

    /// All keyword inputs.
    #[must_use]
    pub const fn keyword(&self) -> &BTreeMap<String, Input> {
        &self.keyword
    }

    /// Number of positional inputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positional.len()
    }

    /// Whether there are no positional or keyword inputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_display() {
        assert_eq!(Token::new(7).to_string(), "Token(7)");
    }

    #[test]
    fn test_args_collect_tokens() {
        let args = Args::new()
            .arg(Token::new(0))
            .arg(json!({"n": 3}))
            .kwarg("prior", Token::new(2))
            .kwarg("label", "x");
        let tokens: Vec<usize> = args.tokens().map(Token::id).collect();
        assert_eq!(tokens, vec![0, 2]);
    }

    #[test]
    fn test_resolve_substitutes_bundles() {
        let bundle = Bundle::with_id("b-0", "source");
        let args = Args::new().arg(Token::new(0)).kwarg("n", 4_i64);

        let inputs = args
            .resolve(|token| {
                assert_eq!(token.id(), 0);
                Ok::<_, ()>(bundle.clone())
            })
            .unwrap();

        assert_eq!(inputs.bundle(0), Some(&bundle));
        assert_eq!(inputs.value("n"), Some(&json!(4)));
    }

    #[test]
    fn test_resolve_stops_on_unknown_token() {
        let args = Args::new().arg(Token::new(5));
        let result = args.resolve(|token| Err::<Bundle, _>(token.id()));
        assert_eq!(result.unwrap_err(), 5);
    }
}
