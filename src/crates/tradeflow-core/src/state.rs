//! Schema-governed shared state for analysis runs.
//!
//! A run threads a single [`AnalysisState`] through the graph: a mapping
//! from declared field names to JSON values. Nodes never mutate the state in
//! place — each node receives an immutable snapshot and returns a
//! [`StatePatch`], and the driver merges patches at single-threaded merge
//! points according to each field's declared [`MergeStrategy`].
//!
//! # Merge strategies
//!
//! | Strategy | Behavior | Use case |
//! |----------|----------|----------|
//! | [`MergeStrategy::Replace`] | Last writer wins; two writers in one batch is an error | Scalars a single node owns (reports, plans, decisions) |
//! | [`MergeStrategy::Concat`] | String concatenation with `\n` separator | Debate histories (append-only text) |
//! | [`MergeStrategy::Add`] | Numeric addition, commutative | Counters (tool calls, token usage) |
//!
//! Parallel analysts write to *separate keys* (`market_report`, never a
//! shared `report`), so their patches are disjoint by construction and no
//! locking is needed. A batch that writes the same `Replace` field twice is
//! a programming error and fails the run with
//! [`StateError::ConflictingUpdate`].
//!
//! # Typing
//!
//! Every field is declared once, at graph construction, with a
//! [`FieldKind`]. Patch values are validated against the declared kind at
//! merge time, and `initial_state` materializes every field up front — in
//! particular every history field starts as the empty *string*, never null
//! and never a list, so downstream concatenation cannot crash mid-run.
//!
//! # Example
//!
//! ```rust
//! use tradeflow_core::state::{StateSchema, FieldKind, MergeStrategy, StatePatch};
//! use serde_json::json;
//!
//! let mut schema = StateSchema::new();
//! schema.declare_field("market_report", FieldKind::Text, MergeStrategy::Replace);
//! schema.declare_field("llm_token_count", FieldKind::Integer, MergeStrategy::Add);
//!
//! let state = schema.initial_state().unwrap();
//! assert_eq!(state.get_str("market_report"), Some(""));
//!
//! let patch = StatePatch::new()
//!     .with("market_report", json!("RSI oversold, MACD turning"))
//!     .with("llm_token_count", json!(412));
//! let next = schema.apply_batch(&state, vec![patch]).unwrap();
//! assert_eq!(next.get_u64("llm_token_count"), Some(412));
//! ```

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors produced by state declaration and merging.
#[derive(Debug, Error)]
pub enum StateError {
    /// Two patches in the same merge batch wrote the same `Replace` field.
    #[error("conflicting update: field '{0}' written by two patches in one merge batch")]
    ConflictingUpdate(String),

    /// A patch wrote a field that was never declared.
    #[error("undeclared field '{0}' in patch")]
    UndeclaredField(String),

    /// A patch value does not match the field's declared kind.
    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        /// Offending field.
        field: String,
        /// Declared kind.
        expected: &'static str,
        /// JSON type of the rejected value.
        got: &'static str,
    },

    /// The schema itself is inconsistent (e.g. a `Concat` field that is not
    /// text, or an `Add` field that is not numeric).
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}

/// Declared value type of a state field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// UTF-8 string. All report and history fields are `Text`.
    Text,
    /// Non-negative integer counter or enum-as-string companion.
    Integer,
    /// Floating point (quality scores).
    Float,
    /// Boolean flag.
    Bool,
    /// Nested JSON object (debate records).
    Object,
}

impl FieldKind {
    fn name(self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Bool => "bool",
            FieldKind::Object => "object",
        }
    }

    fn default_value(self) -> Value {
        match self {
            FieldKind::Text => Value::String(String::new()),
            FieldKind::Integer => Value::from(0u64),
            FieldKind::Float => Value::from(0.0f64),
            FieldKind::Bool => Value::Bool(false),
            FieldKind::Object => Value::Object(Map::new()),
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldKind::Text => value.is_string(),
            FieldKind::Integer => value.is_u64() || value.is_i64(),
            FieldKind::Float => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// How concurrent writes to a field are combined at a merge point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Last writer wins. A single node owns the field; two writers in one
    /// batch is a [`StateError::ConflictingUpdate`].
    Replace,
    /// Append by string concatenation with a `\n` separator. Empty updates
    /// are no-ops; the field only grows.
    Concat,
    /// Numeric addition. Commutative, so safe under any completion order.
    Add,
}

/// Declared shape of a single state field.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// Value type enforced on every write.
    pub kind: FieldKind,
    /// Merge behavior at batch-application time.
    pub merge: MergeStrategy,
}

/// Field declarations for one run. Built once at graph construction.
#[derive(Debug, Default, Clone)]
pub struct StateSchema {
    fields: BTreeMap<String, FieldSpec>,
}

impl StateSchema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a field. Redeclaration replaces the previous spec.
    pub fn declare_field(
        &mut self,
        name: impl Into<String>,
        kind: FieldKind,
        merge: MergeStrategy,
    ) -> &mut Self {
        self.fields.insert(name.into(), FieldSpec { kind, merge });
        self
    }

    /// Look up a field declaration.
    pub fn field(&self, name: &str) -> Option<FieldSpec> {
        self.fields.get(name).copied()
    }

    /// Declared field names, sorted.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Check schema-internal consistency: `Concat` requires `Text`, `Add`
    /// requires a numeric kind. Called once before the first run.
    pub fn validate(&self) -> Result<(), StateError> {
        for (name, spec) in &self.fields {
            match spec.merge {
                MergeStrategy::Concat if spec.kind != FieldKind::Text => {
                    return Err(StateError::InvalidSchema(format!(
                        "field '{name}' uses Concat merge but is declared {}",
                        spec.kind.name()
                    )));
                }
                MergeStrategy::Add
                    if !matches!(spec.kind, FieldKind::Integer | FieldKind::Float) =>
                {
                    return Err(StateError::InvalidSchema(format!(
                        "field '{name}' uses Add merge but is declared {}",
                        spec.kind.name()
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Materialize a state with every declared field set to its default.
    /// Text fields start as `""`, never null.
    pub fn initial_state(&self) -> Result<AnalysisState, StateError> {
        self.validate()?;
        let mut values = Map::new();
        for (name, spec) in &self.fields {
            values.insert(name.clone(), spec.kind.default_value());
        }
        Ok(AnalysisState {
            values: Arc::new(values),
        })
    }

    /// Merge a batch of concurrently-produced patches into `state`,
    /// producing a new state. Pure: neither input is mutated.
    ///
    /// All patches in one batch are treated as concurrent. Two patches
    /// writing the same `Replace` field is a programming error
    /// ([`StateError::ConflictingUpdate`]); `Concat` and `Add` fields merge
    /// commutatively and may be written by any number of patches.
    pub fn apply_batch(
        &self,
        state: &AnalysisState,
        patches: Vec<StatePatch>,
    ) -> Result<AnalysisState, StateError> {
        let mut next = (*state.values).clone();
        let mut replaced = std::collections::HashSet::new();

        for patch in &patches {
            for (name, update) in patch.entries() {
                let spec = self
                    .field(name)
                    .ok_or_else(|| StateError::UndeclaredField(name.to_string()))?;
                if !spec.kind.accepts(update) {
                    return Err(StateError::TypeMismatch {
                        field: name.to_string(),
                        expected: spec.kind.name(),
                        got: json_type_name(update),
                    });
                }

                let current = next.get(name).cloned().unwrap_or_else(|| spec.kind.default_value());
                let merged = match spec.merge {
                    MergeStrategy::Replace => {
                        if !replaced.insert(name.to_string()) {
                            return Err(StateError::ConflictingUpdate(name.to_string()));
                        }
                        update.clone()
                    }
                    MergeStrategy::Concat => concat_text(&current, update),
                    MergeStrategy::Add => add_numbers(&current, update),
                };
                next.insert(name.to_string(), merged);
            }
        }

        Ok(AnalysisState {
            values: Arc::new(next),
        })
    }
}

fn concat_text(current: &Value, update: &Value) -> Value {
    let cur = current.as_str().unwrap_or_default();
    let upd = update.as_str().unwrap_or_default();
    if upd.is_empty() {
        return Value::String(cur.to_string());
    }
    if cur.is_empty() {
        return Value::String(upd.to_string());
    }
    Value::String(format!("{cur}\n{upd}"))
}

fn add_numbers(current: &Value, update: &Value) -> Value {
    if let (Some(a), Some(b)) = (current.as_u64(), update.as_u64()) {
        return Value::from(a + b);
    }
    if let (Some(a), Some(b)) = (current.as_i64(), update.as_i64()) {
        return Value::from(a + b);
    }
    let a = current.as_f64().unwrap_or(0.0);
    let b = update.as_f64().unwrap_or(0.0);
    serde_json::Number::from_f64(a + b)
        .map(Value::Number)
        .unwrap_or_else(|| Value::from(0.0f64))
}

/// Immutable snapshot of the run state. Cheap to clone (`Arc`-backed);
/// every node receives one and no node can mutate it.
#[derive(Debug, Clone)]
pub struct AnalysisState {
    values: Arc<Map<String, Value>>,
}

impl AnalysisState {
    /// Raw value access.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// String field access.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    /// Unsigned counter access.
    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.values.get(name).and_then(Value::as_u64)
    }

    /// Float access.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(Value::as_f64)
    }

    /// Object field access.
    pub fn get_object(&self, name: &str) -> Option<&Map<String, Value>> {
        self.values.get(name).and_then(Value::as_object)
    }

    /// Number of declared fields in this state.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the state has no fields.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The full underlying map, for report extraction.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.values
    }
}

/// Partial state mapping returned by a node, merged by the driver.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    entries: Map<String, Value>,
}

impl StatePatch {
    /// An empty patch (a legal node result: "nothing to report").
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.entries.insert(name.into(), value);
        self
    }

    /// In-place insert.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.entries.insert(name.into(), value);
    }

    /// Iterate over written fields.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Names of written fields.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Value previously written into this patch.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    /// Whether the patch writes nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of written fields.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl FromIterator<(String, Value)> for StatePatch {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> StateSchema {
        let mut s = StateSchema::new();
        s.declare_field("ticker", FieldKind::Text, MergeStrategy::Replace);
        s.declare_field("market_report", FieldKind::Text, MergeStrategy::Replace);
        s.declare_field("news_report", FieldKind::Text, MergeStrategy::Replace);
        s.declare_field("history", FieldKind::Text, MergeStrategy::Concat);
        s.declare_field("llm_token_count", FieldKind::Integer, MergeStrategy::Add);
        s
    }

    #[test]
    fn initial_state_defaults_text_to_empty_string() {
        let state = schema().initial_state().unwrap();
        assert_eq!(state.get_str("history"), Some(""));
        assert_eq!(state.get_str("market_report"), Some(""));
        assert_eq!(state.get_u64("llm_token_count"), Some(0));
    }

    #[test]
    fn replace_fields_take_last_value_across_batches() {
        let s = schema();
        let state = s.initial_state().unwrap();
        let a = s
            .apply_batch(&state, vec![StatePatch::new().with("ticker", json!("AAPL"))])
            .unwrap();
        let b = s
            .apply_batch(&a, vec![StatePatch::new().with("ticker", json!("MSFT"))])
            .unwrap();
        assert_eq!(b.get_str("ticker"), Some("MSFT"));
    }

    #[test]
    fn conflicting_scalar_writes_in_one_batch_fail() {
        let s = schema();
        let state = s.initial_state().unwrap();
        let err = s
            .apply_batch(
                &state,
                vec![
                    StatePatch::new().with("ticker", json!("AAPL")),
                    StatePatch::new().with("ticker", json!("MSFT")),
                ],
            )
            .unwrap_err();
        assert!(matches!(err, StateError::ConflictingUpdate(f) if f == "ticker"));
    }

    #[test]
    fn disjoint_scalar_writes_in_one_batch_merge() {
        let s = schema();
        let state = s.initial_state().unwrap();
        let next = s
            .apply_batch(
                &state,
                vec![
                    StatePatch::new().with("market_report", json!("up")),
                    StatePatch::new().with("news_report", json!("down")),
                ],
            )
            .unwrap();
        assert_eq!(next.get_str("market_report"), Some("up"));
        assert_eq!(next.get_str("news_report"), Some("down"));
    }

    #[test]
    fn concat_appends_with_newline_and_skips_empty() {
        let s = schema();
        let state = s.initial_state().unwrap();
        let next = s
            .apply_batch(
                &state,
                vec![
                    StatePatch::new().with("history", json!("bull: growth")),
                    StatePatch::new().with("history", json!("")),
                    StatePatch::new().with("history", json!("bear: debt")),
                ],
            )
            .unwrap();
        assert_eq!(next.get_str("history"), Some("bull: growth\nbear: debt"));
    }

    #[test]
    fn add_merge_is_commutative_across_patch_order() {
        let s = schema();
        let state = s.initial_state().unwrap();
        let forward = s
            .apply_batch(
                &state,
                vec![
                    StatePatch::new().with("llm_token_count", json!(100)),
                    StatePatch::new().with("llm_token_count", json!(250)),
                ],
            )
            .unwrap();
        let reverse = s
            .apply_batch(
                &state,
                vec![
                    StatePatch::new().with("llm_token_count", json!(250)),
                    StatePatch::new().with("llm_token_count", json!(100)),
                ],
            )
            .unwrap();
        assert_eq!(forward.get_u64("llm_token_count"), Some(350));
        assert_eq!(reverse.get_u64("llm_token_count"), Some(350));
    }

    #[test]
    fn undeclared_field_is_rejected() {
        let s = schema();
        let state = s.initial_state().unwrap();
        let err = s
            .apply_batch(&state, vec![StatePatch::new().with("bogus", json!(1))])
            .unwrap_err();
        assert!(matches!(err, StateError::UndeclaredField(f) if f == "bogus"));
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let s = schema();
        let state = s.initial_state().unwrap();
        let err = s
            .apply_batch(
                &state,
                vec![StatePatch::new().with("history", json!(["not", "a", "string"]))],
            )
            .unwrap_err();
        assert!(matches!(err, StateError::TypeMismatch { field, .. } if field == "history"));
    }

    #[test]
    fn concat_on_non_text_field_fails_schema_validation() {
        let mut s = StateSchema::new();
        s.declare_field("history", FieldKind::Object, MergeStrategy::Concat);
        assert!(matches!(s.validate(), Err(StateError::InvalidSchema(_))));
    }

    #[test]
    fn apply_batch_does_not_mutate_input_state() {
        let s = schema();
        let state = s.initial_state().unwrap();
        let _ = s
            .apply_batch(&state, vec![StatePatch::new().with("ticker", json!("AAPL"))])
            .unwrap();
        assert_eq!(state.get_str("ticker"), Some(""));
    }
}
