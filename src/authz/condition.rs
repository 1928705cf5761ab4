//! Attribute conditions attached to permissions.
//!
//! The grammar is closed:
//! - `time_window`: half-open `[from, until)`, either bound optional
//! - `equals` / `not_equals`: compare a context attribute with a literal
//! - `in_set`: attribute is one of a list of literals
//! - `all` / `any` / `not`: boolean combinators
//!
//! Evaluation is total. A predicate over an attribute missing from the context
//! is false, and stays false under `not`, so absent data never grants access.
//! For the same reason absent data never lifts a deny: [`Condition::refuted`]
//! only holds when the context positively contradicts the condition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::authz::errors::AuthzError;
use crate::authz::types::AttributeContext;

const MAX_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    TimeWindow {
        #[serde(default)]
        from: Option<DateTime<Utc>>,
        #[serde(default)]
        until: Option<DateTime<Utc>>,
    },
    Equals {
        attribute: String,
        value: Value,
    },
    NotEquals {
        attribute: String,
        value: Value,
    },
    InSet {
        attribute: String,
        values: Vec<Value>,
    },
    All {
        conditions: Vec<Condition>,
    },
    Any {
        conditions: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
}

/// Three-valued result used internally so that `not` over a missing attribute
/// does not flip into a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Truth {
    True,
    False,
    Missing,
}

impl Truth {
    fn from_bool(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }
}

impl Condition {
    pub fn time_window(from: Option<DateTime<Utc>>, until: Option<DateTime<Utc>>) -> Self {
        Condition::TimeWindow { from, until }
    }

    pub fn equals(attribute: &str, value: impl Into<Value>) -> Self {
        Condition::Equals {
            attribute: attribute.to_string(),
            value: value.into(),
        }
    }

    pub fn not_equals(attribute: &str, value: impl Into<Value>) -> Self {
        Condition::NotEquals {
            attribute: attribute.to_string(),
            value: value.into(),
        }
    }

    pub fn in_set(attribute: &str, values: Vec<Value>) -> Self {
        Condition::InSet {
            attribute: attribute.to_string(),
            values,
        }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::All { conditions }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Condition::Any { conditions }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(condition: Condition) -> Self {
        Condition::Not {
            condition: Box::new(condition),
        }
    }

    /// Evaluate against `context` at instant `at`.
    pub fn evaluate(&self, context: &AttributeContext, at: DateTime<Utc>) -> bool {
        self.truth(context, at) == Truth::True
    }

    /// Whether `context` at `at` definitely fails the condition. Missing
    /// attributes leave it unrefuted.
    pub fn refuted(&self, context: &AttributeContext, at: DateTime<Utc>) -> bool {
        self.truth(context, at) == Truth::False
    }

    fn truth(&self, context: &AttributeContext, at: DateTime<Utc>) -> Truth {
        match self {
            Condition::TimeWindow { from, until } => Truth::from_bool(
                from.is_none_or(|f| f <= at) && until.is_none_or(|u| at < u),
            ),
            Condition::Equals { attribute, value } => match lookup(context, attribute) {
                Some(actual) => Truth::from_bool(values_equal(actual, value)),
                None => Truth::Missing,
            },
            Condition::NotEquals { attribute, value } => match lookup(context, attribute) {
                Some(actual) => Truth::from_bool(!values_equal(actual, value)),
                None => Truth::Missing,
            },
            Condition::InSet { attribute, values } => match lookup(context, attribute) {
                Some(actual) => Truth::from_bool(values.iter().any(|v| values_equal(actual, v))),
                None => Truth::Missing,
            },
            Condition::All { conditions } => {
                let mut result = Truth::True;
                for c in conditions {
                    match c.truth(context, at) {
                        Truth::True => {}
                        Truth::False => return Truth::False,
                        Truth::Missing => result = Truth::Missing,
                    }
                }
                result
            }
            Condition::Any { conditions } => {
                let mut result = Truth::False;
                for c in conditions {
                    match c.truth(context, at) {
                        Truth::True => return Truth::True,
                        Truth::False => {}
                        Truth::Missing => result = Truth::Missing,
                    }
                }
                result
            }
            Condition::Not { condition } => match condition.truth(context, at) {
                Truth::True => Truth::False,
                Truth::False => Truth::True,
                Truth::Missing => Truth::Missing,
            },
        }
    }

    /// Whether the outcome depends on caller-supplied attributes (as opposed to
    /// only the clock).
    pub fn references_attributes(&self) -> bool {
        match self {
            Condition::TimeWindow { .. } => false,
            Condition::Equals { .. } | Condition::NotEquals { .. } | Condition::InSet { .. } => {
                true
            }
            Condition::All { conditions } | Condition::Any { conditions } => {
                conditions.iter().any(Condition::references_attributes)
            }
            Condition::Not { condition } => condition.references_attributes(),
        }
    }

    pub fn references_time(&self) -> bool {
        match self {
            Condition::TimeWindow { .. } => true,
            Condition::Equals { .. } | Condition::NotEquals { .. } | Condition::InSet { .. } => {
                false
            }
            Condition::All { conditions } | Condition::Any { conditions } => {
                conditions.iter().any(Condition::references_time)
            }
            Condition::Not { condition } => condition.references_time(),
        }
    }

    /// Earliest time-window boundary strictly after `after`, i.e. the next
    /// instant at which the result of this condition may change on its own.
    pub fn next_transition(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Condition::TimeWindow { from, until } => [*from, *until]
                .into_iter()
                .flatten()
                .filter(|t| *t > after)
                .min(),
            Condition::Equals { .. } | Condition::NotEquals { .. } | Condition::InSet { .. } => None,
            Condition::All { conditions } | Condition::Any { conditions } => conditions
                .iter()
                .filter_map(|c| c.next_transition(after))
                .min(),
            Condition::Not { condition } => condition.next_transition(after),
        }
    }

    /// Attributes referenced by this tree that are absent from `context`.
    pub fn missing_attributes<'a>(&'a self, context: &AttributeContext) -> Vec<&'a str> {
        let mut out = Vec::new();
        self.collect_missing(context, &mut out);
        out
    }

    fn collect_missing<'a>(&'a self, context: &AttributeContext, out: &mut Vec<&'a str>) {
        match self {
            Condition::TimeWindow { .. } => {}
            Condition::Equals { attribute, .. }
            | Condition::NotEquals { attribute, .. }
            | Condition::InSet { attribute, .. } => {
                if lookup(context, attribute).is_none() {
                    out.push(attribute);
                }
            }
            Condition::All { conditions } | Condition::Any { conditions } => {
                for c in conditions {
                    c.collect_missing(context, out);
                }
            }
            Condition::Not { condition } => condition.collect_missing(context, out),
        }
    }

    /// Structural validation applied when conditions are loaded.
    pub fn validate(&self) -> Result<(), AuthzError> {
        self.validate_at(0)
    }

    fn validate_at(&self, depth: usize) -> Result<(), AuthzError> {
        if depth >= MAX_DEPTH {
            return Err(AuthzError::InvalidCondition(format!(
                "condition nesting exceeds {MAX_DEPTH} levels"
            )));
        }
        match self {
            Condition::TimeWindow { from, until } => match (from, until) {
                (None, None) => Err(AuthzError::InvalidCondition(
                    "time window needs at least one of `from` or `until`".into(),
                )),
                (Some(f), Some(u)) if f >= u => Err(AuthzError::InvalidCondition(format!(
                    "time window is empty: from {f} is not before until {u}"
                ))),
                _ => Ok(()),
            },
            Condition::Equals { attribute, .. } | Condition::NotEquals { attribute, .. } => {
                check_attribute(attribute)
            }
            Condition::InSet { attribute, values } => {
                check_attribute(attribute)?;
                if values.is_empty() {
                    return Err(AuthzError::InvalidCondition(format!(
                        "`in_set` on `{attribute}` has no values"
                    )));
                }
                Ok(())
            }
            Condition::All { conditions } | Condition::Any { conditions } => {
                if conditions.is_empty() {
                    return Err(AuthzError::InvalidCondition(
                        "`all`/`any` requires at least one condition".into(),
                    ));
                }
                conditions.iter().try_for_each(|c| c.validate_at(depth + 1))
            }
            Condition::Not { condition } => condition.validate_at(depth + 1),
        }
    }
}

fn check_attribute(attribute: &str) -> Result<(), AuthzError> {
    if attribute.is_empty() || attribute.split('.').any(str::is_empty) {
        return Err(AuthzError::InvalidCondition(format!(
            "invalid attribute path `{attribute}`"
        )));
    }
    Ok(())
}

fn lookup<'c>(context: &'c AttributeContext, attribute: &str) -> Option<&'c Value> {
    match context.lookup(attribute) {
        Some(Value::Null) | None => None,
        Some(v) => Some(v),
    }
}

/// Numbers compare by value regardless of integer/float representation.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}
