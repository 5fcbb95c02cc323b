//! Native filter language and its translation from match patterns
//!
//! A [`Filter`] is a conjunction of [`Condition`]s over dotted paths:
//!
//! | Condition | Query form                            | Holds when                               |
//! |-----------|---------------------------------------|------------------------------------------|
//! | `Eq`      | `{"a.b": 3}`                          | the path resolves to an equal scalar     |
//! | `Exists`  | `{"a.b": {"$exists": true}}`          | the path resolves                        |
//! | `All`     | `{"a.b": {"$all": [..]}}`             | the path is an array covering every item |
//!
//! [`Filter::from_pattern`] produces a filter that selects exactly the
//! documents [`crate::pattern::matches`] accepts.
//!
//! [`Filter::to_server_query`] renders the same filter for a real MongoDB
//! server. Server queries traverse arrays on dotted paths and cannot
//! express every element requirement, so they select a superset; callers
//! re-check results with [`Filter::matches`].

use serde_json::{json, Map, Value};

use crate::pattern::values_equal;

/// Conjunction of conditions. The empty filter selects every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

/// One predicate over a dotted path.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Path resolves to a value equal to the scalar
    Eq {
        /// Path segments (empty means the document itself)
        path: Vec<String>,
        /// Expected scalar
        value: Value,
    },
    /// Path resolves to anything
    Exists {
        /// Path segments
        path: Vec<String>,
    },
    /// Path resolves to an array with a matching element for every requirement
    All {
        /// Path segments
        path: Vec<String>,
        /// Per-element requirements
        elements: Vec<Element>,
    },
}

/// Requirement on one array element (`$all` operand).
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    /// Any element at all
    Any,
    /// Element equals the scalar
    Eq(Value),
    /// Element is a document satisfying the filter (`$elemMatch`)
    Match(Filter),
    /// Element is itself an array covering every requirement
    All(Vec<Element>),
}

impl Filter {
    /// Filter selecting every document.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    /// `{"_id": id}`
    #[must_use]
    pub fn by_id(id: &str) -> Self {
        Self::all().and(Condition::Eq {
            path: vec![super::ID_FIELD.to_string()],
            value: Value::from(id),
        })
    }

    /// Add a condition.
    #[must_use]
    pub fn and(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Translate a match pattern into native conditions.
    #[must_use]
    pub fn from_pattern(pattern: &Value) -> Self {
        Self::from_pattern_at(pattern, &[])
    }

    /// Translate a pattern meant for the value found under `prefix`.
    #[must_use]
    pub fn from_pattern_at(pattern: &Value, prefix: &[&str]) -> Self {
        let mut conditions = Vec::new();
        let prefix: Vec<String> = prefix.iter().map(|s| (*s).to_string()).collect();
        translate(pattern, prefix, &mut conditions);
        Self { conditions }
    }

    /// Conditions in evaluation order.
    #[must_use]
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Whether the filter selects every document.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Whether `document` satisfies every condition.
    #[must_use]
    pub fn matches(&self, document: &Value) -> bool {
        self.conditions.iter().all(|c| c.holds(document))
    }

    /// Render in the familiar query-document form, for logging.
    #[must_use]
    pub fn to_query(&self) -> Value {
        let mut query = Map::new();
        for condition in &self.conditions {
            let (path, operand) = match condition {
                Condition::Eq { path, value } => (path, value.clone()),
                Condition::Exists { path } => (path, json!({ "$exists": true })),
                Condition::All { path, elements } => (
                    path,
                    json!({ "$all": elements.iter().map(Element::to_query).collect::<Vec<_>>() }),
                ),
            };
            let key = if path.is_empty() {
                "$root".to_string()
            } else {
                path.join(".")
            };
            query.insert(key, operand);
        }
        Value::Object(query)
    }

    /// Render as a MongoDB query selecting a superset of [`Filter::matches`].
    ///
    /// Conditions the server cannot evaluate faithfully (the document root,
    /// keys containing `.` or starting with `$`, large numbers, nested
    /// array requirements) are widened or dropped.
    #[must_use]
    pub fn to_server_query(&self) -> Value {
        let clauses: Vec<Value> = self.conditions.iter().flat_map(Condition::server_clauses).collect();
        conjunction(clauses)
    }
}

impl Condition {
    fn holds(&self, document: &Value) -> bool {
        match self {
            Self::Eq { path, value } => resolve(document, path).is_some_and(|v| values_equal(v, value)),
            Self::Exists { path } => resolve(document, path).is_some(),
            Self::All { path, elements } => {
                resolve(document, path).is_some_and(|v| covers(v, elements))
            }
        }
    }

    fn server_clauses(&self) -> Vec<Value> {
        let (path, requirement) = match self {
            Self::Eq { path, value } => (path, server_eq(value)),
            Self::Exists { path } => (path, Some(exists())),
            Self::All { path, elements } => {
                let Some(key) = server_path(path) else {
                    return Vec::new();
                };
                return elements
                    .iter()
                    .filter_map(|e| e.server_requirement().map(|req| clause(&key, req)))
                    .collect();
            }
        };
        match (server_path(path), requirement) {
            (Some(key), Some(requirement)) => vec![clause(&key, requirement)],
            _ => Vec::new(),
        }
    }
}

impl Element {
    fn server_requirement(&self) -> Option<Value> {
        match self {
            Self::Eq(value) => server_eq(value),
            Self::Match(filter) => match filter.to_server_query() {
                Value::Object(inner) if inner.is_empty() => Some(exists()),
                inner => Some(json!({ "$elemMatch": inner })),
            },
            Self::Any | Self::All(_) => Some(exists()),
        }
    }

    fn accepts(&self, item: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::Eq(value) => values_equal(item, value),
            Self::Match(filter) => filter.matches(item),
            Self::All(elements) => covers(item, elements),
        }
    }

    fn to_query(&self) -> Value {
        match self {
            Self::Any => json!({}),
            Self::Eq(value) => value.clone(),
            Self::Match(filter) => json!({ "$elemMatch": filter.to_query() }),
            Self::All(elements) => {
                json!({ "$all": elements.iter().map(Self::to_query).collect::<Vec<_>>() })
            }
        }
    }
}

/// Largest magnitude at which integers and doubles compare alike.
const EXACT_NUMBER_LIMIT: f64 = 9_007_199_254_740_992.0;

fn server_eq(value: &Value) -> Option<Value> {
    match value {
        Value::Number(n) if !n.as_f64().is_some_and(|x| x.abs() < EXACT_NUMBER_LIMIT) => None,
        Value::Number(_) | Value::String(_) | Value::Bool(_) | Value::Null => Some(value.clone()),
        _ => None,
    }
}

fn exists() -> Value {
    json!({ "$exists": true })
}

fn server_path(path: &[String]) -> Option<String> {
    let usable = !path.is_empty()
        && path
            .iter()
            .all(|s| !s.is_empty() && !s.contains('.') && !s.starts_with('$'));
    usable.then(|| path.join("."))
}

fn clause(key: &str, requirement: Value) -> Value {
    let mut clause = Map::new();
    clause.insert(key.to_string(), requirement);
    Value::Object(clause)
}

fn conjunction(mut clauses: Vec<Value>) -> Value {
    match clauses.len() {
        0 => Value::Object(Map::new()),
        1 => clauses.remove(0),
        _ => json!({ "$and": clauses }),
    }
}

fn covers(value: &Value, elements: &[Element]) -> bool {
    value
        .as_array()
        .is_some_and(|items| elements.iter().all(|e| items.iter().any(|item| e.accepts(item))))
}

/// Walk `path` through nested objects.
fn resolve<'v>(document: &'v Value, path: &[String]) -> Option<&'v Value> {
    path.iter()
        .try_fold(document, |node, segment| node.as_object()?.get(segment))
}

fn translate(pattern: &Value, path: Vec<String>, out: &mut Vec<Condition>) {
    match pattern {
        Value::Object(map) if map.is_empty() => {
            if !path.is_empty() {
                out.push(Condition::Exists { path });
            }
        }
        Value::Object(map) => {
            for (key, sub) in map {
                let mut child = path.clone();
                child.push(key.clone());
                translate(sub, child, out);
            }
        }
        Value::Array(items) if items.is_empty() => {
            if !path.is_empty() {
                out.push(Condition::Exists { path });
            }
        }
        Value::Array(items) => out.push(Condition::All {
            path,
            elements: items.iter().map(element).collect(),
        }),
        scalar => out.push(Condition::Eq {
            path,
            value: scalar.clone(),
        }),
    }
}

fn element(pattern: &Value) -> Element {
    match pattern {
        Value::Object(map) if map.is_empty() => Element::Any,
        Value::Array(items) if items.is_empty() => Element::Any,
        Value::Object(_) => Element::Match(Filter::from_pattern(pattern)),
        Value::Array(items) => Element::All(items.iter().map(element).collect()),
        scalar => Element::Eq(scalar.clone()),
    }
}
