//! HostVariables: a small in-memory variable store and template evaluator.
//!
//! The full expression engine is an external collaborator.  The hub binary
//! still needs something behind [`ExpressionEvaluator`] so output variables
//! work out of the box: custom variables pushed by one Satellite device can
//! be shown on another.
//!
//! Expressions are templates.  Every `$(name)` is replaced by the value of
//! variable `name`.  An expression that is exactly one `$(name)` evaluates to
//! the raw JSON value, anything else to a string.  Variables nobody has set
//! yet read as `null` but still count as referenced, so the binding
//! re-evaluates once they appear.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard};

use crate::application::variable_bridge::{value_to_text, Evaluation, ExpressionError, ExpressionEvaluator};

/// Thread-safe variable table.
#[derive(Debug, Default)]
pub struct HostVariables {
    values: RwLock<HashMap<String, serde_json::Value>>,
}

impl HostVariables {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, serde_json::Value>> {
        self.values.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores `value` under `name`.  Returns `true` if the value changed.
    pub fn set(&self, name: impl Into<String>, value: serde_json::Value) -> bool {
        let name = name.into();
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        if values.get(&name) == Some(&value) {
            return false;
        }
        values.insert(name, value);
        true
    }

    pub fn get(&self, name: &str) -> Option<serde_json::Value> {
        self.read().get(name).cloned()
    }
}

/// Splits a template into literal text and `$(name)` references.
fn references(expression: &str) -> Result<Vec<Segment<'_>>, String> {
    let mut segments = Vec::new();
    let mut rest = expression;
    while let Some(start) = rest.find("$(") {
        if start > 0 {
            segments.push(Segment::Literal(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = after.find(')').ok_or_else(|| "unterminated $(".to_string())?;
        let name = after[..end].trim();
        if name.is_empty() {
            return Err("empty variable name".to_string());
        }
        segments.push(Segment::Variable(name));
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

enum Segment<'a> {
    Literal(&'a str),
    Variable(&'a str),
}

impl ExpressionEvaluator for HostVariables {
    fn evaluate(&self, expression: &str) -> Result<Evaluation, ExpressionError> {
        let fail = |reason: String| ExpressionError::Failed {
            expression: expression.to_string(),
            reason,
        };
        let segments = references(expression).map_err(fail)?;

        let referenced_variables: HashSet<String> = segments
            .iter()
            .filter_map(|s| match s {
                Segment::Variable(name) => Some(name.to_string()),
                Segment::Literal(_) => None,
            })
            .collect();

        let values = self.read();
        let lookup = |name: &str| values.get(name).cloned().unwrap_or(serde_json::Value::Null);

        let value = match segments.as_slice() {
            [Segment::Variable(name)] => lookup(*name),
            _ => {
                let mut text = String::new();
                for segment in &segments {
                    match segment {
                        Segment::Literal(s) => text.push_str(s),
                        Segment::Variable(name) => text.push_str(&value_to_text(&lookup(*name))),
                    }
                }
                serde_json::Value::String(text)
            }
        };

        Ok(Evaluation {
            value,
            referenced_variables,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
