//! Typed workflow state with declared reducers
//!
//! Workflow state is a JSON object whose fields each carry a [`Reducer`]
//! declaring how node deltas combine with the current value:
//!
//! - [`OverwriteReducer`] - last write wins (`current_agent`, status fields)
//! - [`AppendReducer`] - accumulate arrays (`messages`, event logs)
//! - [`MergeByIdReducer`] - merge array elements by an id field, newest
//!   element wins per id (`rag_context`)
//! - [`DedupReducer`] - append while dropping values already present
//!   (`tools_used`)
//!
//! A [`StateSchema`] binds field names to reducers and applies a whole node
//! delta in one call. Reducers are pure and never suspend; state-delta
//! merging happens only at node boundaries.

use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Errors from reducer application or schema validation
#[derive(Debug, Error)]
pub enum StateError {
    /// State root is not a JSON object
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A reducer could not combine the current value with the update
    #[error("reducer error on field '{field}': {message}")]
    ReducerError {
        /// Field whose reducer failed
        field: String,
        /// Failure description
        message: String,
    },
}

/// Result type for state operations
pub type Result<T> = std::result::Result<T, StateError>;

/// How writes to one state field combine
pub trait Reducer: Send + Sync {
    /// Merge `update` into `current` (which may be `Value::Null` when the
    /// field is unset) and return the new value
    fn reduce(&self, current: &Value, update: &Value) -> std::result::Result<Value, String>;

    /// Stable reducer name, used in validation messages
    fn name(&self) -> &'static str;
}

/// Last write wins; the default when a field declares no reducer
#[derive(Debug, Clone, Copy)]
pub struct OverwriteReducer;

impl Reducer for OverwriteReducer {
    fn reduce(&self, _current: &Value, update: &Value) -> std::result::Result<Value, String> {
        Ok(update.clone())
    }

    fn name(&self) -> &'static str {
        "overwrite"
    }
}

/// Append update elements to the current array
///
/// A scalar update is appended as a single element; a null current value
/// initializes a fresh array.
#[derive(Debug, Clone, Copy)]
pub struct AppendReducer;

impl Reducer for AppendReducer {
    fn reduce(&self, current: &Value, update: &Value) -> std::result::Result<Value, String> {
        let mut items = match current {
            Value::Null => Vec::new(),
            Value::Array(existing) => existing.clone(),
            other => return Err(format!("cannot append to non-array {other:?}")),
        };
        match update {
            Value::Array(new_items) => items.extend(new_items.iter().cloned()),
            other => items.push(other.clone()),
        }
        Ok(Value::Array(items))
    }

    fn name(&self) -> &'static str {
        "append"
    }
}

/// Merge array elements keyed by an id field; an updated element replaces
/// the existing one with the same id, order of first appearance is kept
#[derive(Debug, Clone)]
pub struct MergeByIdReducer {
    id_field: String,
}

impl MergeByIdReducer {
    /// Merge on `id_field` (e.g. `"id"` or `"resource_id"`)
    pub fn new(id_field: impl Into<String>) -> Self {
        Self { id_field: id_field.into() }
    }

    fn id_of(&self, item: &Value) -> Option<String> {
        item.get(&self.id_field).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

impl Reducer for MergeByIdReducer {
    fn reduce(&self, current: &Value, update: &Value) -> std::result::Result<Value, String> {
        let existing = match current {
            Value::Null => Vec::new(),
            Value::Array(items) => items.clone(),
            other => return Err(format!("cannot merge into non-array {other:?}")),
        };
        let incoming: Vec<Value> = match update {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };

        let mut merged = existing;
        for item in incoming {
            let id = self.id_of(&item);
            match id.and_then(|id| {
                merged
                    .iter()
                    .position(|m| self.id_of(m).as_deref() == Some(id.as_str()))
            }) {
                Some(pos) => merged[pos] = item,
                None => merged.push(item),
            }
        }
        Ok(Value::Array(merged))
    }

    fn name(&self) -> &'static str {
        "merge_by_id"
    }
}

/// Shallow-merge update keys into the current object
///
/// Existing keys are replaced, other keys are kept. Used for accumulating
/// maps such as approval grants.
#[derive(Debug, Clone, Copy)]
pub struct MergeObjectReducer;

impl Reducer for MergeObjectReducer {
    fn reduce(&self, current: &Value, update: &Value) -> std::result::Result<Value, String> {
        let mut merged = match current {
            Value::Null => Map::new(),
            Value::Object(existing) => existing.clone(),
            other => return Err(format!("cannot merge object into {other:?}")),
        };
        let incoming = update
            .as_object()
            .ok_or_else(|| format!("merge update must be an object, got {update:?}"))?;
        for (key, value) in incoming {
            merged.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(merged))
    }

    fn name(&self) -> &'static str {
        "merge_object"
    }
}

/// Append update elements, dropping values already present
#[derive(Debug, Clone, Copy)]
pub struct DedupReducer;

impl Reducer for DedupReducer {
    fn reduce(&self, current: &Value, update: &Value) -> std::result::Result<Value, String> {
        let mut items = match current {
            Value::Null => Vec::new(),
            Value::Array(existing) => existing.clone(),
            other => return Err(format!("cannot dedup into non-array {other:?}")),
        };
        let incoming: Vec<Value> = match update {
            Value::Array(new_items) => new_items.clone(),
            other => vec![other.clone()],
        };
        for item in incoming {
            if !items.contains(&item) {
                items.push(item);
            }
        }
        Ok(Value::Array(items))
    }

    fn name(&self) -> &'static str {
        "dedup"
    }
}

/// Field-name → reducer binding for one graph's state
pub struct StateSchema {
    fields: HashMap<String, Box<dyn Reducer>>,
    default: Box<dyn Reducer>,
}

impl StateSchema {
    /// Empty schema; unknown fields get [`OverwriteReducer`]
    pub fn new() -> Self {
        Self {
            fields: HashMap::new(),
            default: Box::new(OverwriteReducer),
        }
    }

    /// Declare a field's reducer
    pub fn with_field(mut self, field: impl Into<String>, reducer: Box<dyn Reducer>) -> Self {
        self.fields.insert(field.into(), reducer);
        self
    }

    /// Apply a node delta to `state` in place
    ///
    /// Both `state` and `delta` must be JSON objects; each delta entry is
    /// merged through its field's reducer.
    pub fn apply(&self, state: &mut Value, delta: &Value) -> Result<()> {
        if delta.is_null() {
            return Ok(());
        }
        let delta_map = delta
            .as_object()
            .ok_or_else(|| StateError::InvalidState("delta must be a JSON object".into()))?;
        if state.is_null() {
            *state = Value::Object(Map::new());
        }
        let state_map = state
            .as_object_mut()
            .ok_or_else(|| StateError::InvalidState("state must be a JSON object".into()))?;

        for (field, update) in delta_map {
            let reducer = self.fields.get(field).unwrap_or(&self.default);
            let current = state_map.get(field).cloned().unwrap_or(Value::Null);
            let merged = reducer.reduce(&current, update).map_err(|message| {
                StateError::ReducerError { field: field.clone(), message }
            })?;
            state_map.insert(field.clone(), merged);
        }
        Ok(())
    }
}

impl Default for StateSchema {
    fn default() -> Self {
        Self::new()
    }
}
