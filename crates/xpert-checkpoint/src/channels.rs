//! Channel abstractions for state management
//!
//! Channels are the typed, mergeable slots that hold the accumulated state
//! of a run. Every channel pairs a reducer with a default value; the
//! [`ChannelStore`] applies a step's writes atomically — either all channel
//! updates from a step land or none do.
//!
//! The default reduction policy is last-writer-wins at field level and
//! append (with id de-duplication) for message lists. Deviations are
//! expressed by picking a different [`ChannelSpec`] for the channel.

use crate::error::{CheckpointError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

/// Marker key used by message removal markers.
///
/// A write of `{"__remove__": "<id>"}` into a messages channel deletes the
/// message with that id; the id `"*"` clears the whole list.
pub const REMOVE_MARKER: &str = "__remove__";

/// Id that removes every message from a messages channel
pub const REMOVE_ALL: &str = "*";

/// Base trait for all channels
///
/// A channel stores one value, knows how to merge a batch of updates into
/// it, and can round-trip itself through a serialized snapshot.
pub trait Channel: Send + Sync + Debug {
    /// Current value of the channel
    fn get(&self) -> Result<Value>;

    /// Merge a batch of updates produced within a single step.
    ///
    /// Returns `true` if the channel changed.
    fn update(&mut self, values: Vec<Value>) -> Result<bool>;

    /// Serializable snapshot of the channel state
    fn checkpoint(&self) -> Result<Value>;

    /// Restore the channel from a snapshot
    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()>;

    /// Whether the channel holds a value
    fn is_available(&self) -> bool {
        self.get().is_ok()
    }

    /// Clone the channel into a Box
    fn clone_box(&self) -> Box<dyn Channel>;
}

impl Clone for Box<dyn Channel> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// LastValue channel — stores only the latest value written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastValueChannel {
    value: Option<Value>,
}

impl LastValueChannel {
    pub fn new() -> Self {
        Self { value: None }
    }

    pub fn with_value(value: Value) -> Self {
        Self { value: Some(value) }
    }
}

impl Default for LastValueChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for LastValueChannel {
    fn get(&self) -> Result<Value> {
        Ok(self.value.clone().unwrap_or(Value::Null))
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        match values.into_iter().last() {
            Some(v) => {
                self.value = Some(v);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn checkpoint(&self) -> Result<Value> {
        self.get()
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        self.value = Some(checkpoint);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Merge one batch of message values into an existing list.
///
/// Semantics shared by [`MessagesChannel`] and the `messages` field of
/// [`AgentChannel`]:
/// - a value with an `id` matching an existing entry replaces it in place
/// - a `{"__remove__": id}` marker deletes the matching entry (`"*"` clears)
/// - everything else is appended, preserving insertion order
fn merge_messages(existing: &mut Vec<Value>, updates: Vec<Value>) -> bool {
    let mut changed = false;
    for update in updates {
        if let Some(remove_id) = update.get(REMOVE_MARKER).and_then(Value::as_str) {
            if remove_id == REMOVE_ALL {
                changed |= !existing.is_empty();
                existing.clear();
            } else {
                let before = existing.len();
                existing.retain(|m| m.get("id").and_then(Value::as_str) != Some(remove_id));
                changed |= existing.len() != before;
            }
            continue;
        }

        let id = update.get("id").and_then(Value::as_str).map(str::to_string);
        let position = id.as_deref().and_then(|id| {
            existing
                .iter()
                .position(|m| m.get("id").and_then(Value::as_str) == Some(id))
        });
        match position {
            Some(idx) => existing[idx] = update,
            None => existing.push(update),
        }
        changed = true;
    }
    changed
}

/// Messages channel — ordered, id-deduplicated list of chat messages
///
/// Updates may be single messages, arrays of messages, or removal markers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessagesChannel {
    values: Vec<Value>,
}

impl MessagesChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Value] {
        &self.values
    }
}

impl Channel for MessagesChannel {
    fn get(&self) -> Result<Value> {
        Ok(Value::Array(self.values.clone()))
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        let mut flat = Vec::new();
        for value in values {
            match value {
                Value::Array(items) => flat.extend(items),
                other => flat.push(other),
            }
        }
        Ok(merge_messages(&mut self.values, flat))
    }

    fn checkpoint(&self) -> Result<Value> {
        self.get()
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        match checkpoint {
            Value::Array(items) => {
                self.values = items;
                Ok(())
            }
            Value::Null => {
                self.values.clear();
                Ok(())
            }
            _ => Err(CheckpointError::Invalid(
                "Messages channel checkpoint must be an array".to_string(),
            )),
        }
    }

    fn is_available(&self) -> bool {
        true
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Agent channel — per-agent `{system, messages, summary, error, output}`
/// structure reduced field-wise.
///
/// `messages` merges with message-list semantics; the remaining fields are
/// last-writer-wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentChannel {
    value: Value,
}

impl AgentChannel {
    pub fn new() -> Self {
        Self {
            value: Self::empty_value(),
        }
    }

    fn empty_value() -> Value {
        serde_json::json!({
            "system": Value::Null,
            "messages": [],
            "summary": Value::Null,
            "error": Value::Null,
            "output": Value::Null,
        })
    }
}

impl Default for AgentChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel for AgentChannel {
    fn get(&self) -> Result<Value> {
        Ok(self.value.clone())
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        let mut changed = false;
        for update in values {
            let Value::Object(fields) = update else {
                return Err(CheckpointError::Invalid(
                    "Agent channel updates must be objects".to_string(),
                ));
            };
            for (key, value) in fields {
                if key == "messages" {
                    let updates = match value {
                        Value::Array(items) => items,
                        other => vec![other],
                    };
                    let slot = self.value["messages"]
                        .as_array_mut()
                        .ok_or_else(|| {
                            CheckpointError::Invalid("Agent channel corrupted".to_string())
                        })?;
                    let mut merged = std::mem::take(slot);
                    changed |= merge_messages(&mut merged, updates);
                    *slot = merged;
                } else {
                    self.value[key] = value;
                    changed = true;
                }
            }
        }
        Ok(changed)
    }

    fn checkpoint(&self) -> Result<Value> {
        self.get()
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        match checkpoint {
            Value::Object(_) => {
                self.value = checkpoint;
                Ok(())
            }
            Value::Null => {
                self.value = Self::empty_value();
                Ok(())
            }
            _ => Err(CheckpointError::Invalid(
                "Agent channel checkpoint must be an object".to_string(),
            )),
        }
    }

    fn is_available(&self) -> bool {
        true
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Reducer function type for [`BinaryOperatorChannel`]
pub type ReducerFn = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;

/// BinaryOperator channel — folds updates into the value with a custom
/// reducer. Used for user-declared workflow channels.
#[derive(Clone)]
pub struct BinaryOperatorChannel {
    value: Option<Value>,
    default: Value,
    reducer: ReducerFn,
}

impl BinaryOperatorChannel {
    pub fn new<F>(default: Value, reducer: F) -> Self
    where
        F: Fn(Value, Value) -> Value + Send + Sync + 'static,
    {
        Self {
            value: None,
            default,
            reducer: Arc::new(reducer),
        }
    }

    /// Append reducer for array-valued channels
    pub fn append() -> Self {
        Self::new(Value::Array(vec![]), |a, b| {
            let mut items = match a {
                Value::Array(items) => items,
                Value::Null => vec![],
                other => vec![other],
            };
            match b {
                Value::Array(more) => items.extend(more),
                other => items.push(other),
            }
            Value::Array(items)
        })
    }

    /// Sum reducer for numeric channels
    pub fn sum() -> Self {
        Self::new(serde_json::json!(0.0), |a, b| {
            let a = a.as_f64().unwrap_or(0.0);
            let b = b.as_f64().unwrap_or(0.0);
            serde_json::json!(a + b)
        })
    }
}

impl Debug for BinaryOperatorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryOperatorChannel")
            .field("value", &self.value)
            .field("default", &self.default)
            .field("reducer", &"<function>")
            .finish()
    }
}

impl Channel for BinaryOperatorChannel {
    fn get(&self) -> Result<Value> {
        Ok(self.value.clone().unwrap_or_else(|| self.default.clone()))
    }

    fn update(&mut self, values: Vec<Value>) -> Result<bool> {
        if values.is_empty() {
            return Ok(false);
        }
        let mut current = self.get()?;
        for value in values {
            current = (self.reducer)(current, value);
        }
        self.value = Some(current);
        Ok(true)
    }

    fn checkpoint(&self) -> Result<Value> {
        self.get()
    }

    fn from_checkpoint(&mut self, checkpoint: Value) -> Result<()> {
        self.value = Some(checkpoint);
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.value.is_some()
    }

    fn clone_box(&self) -> Box<dyn Channel> {
        Box::new(self.clone())
    }
}

/// Declarative channel kind used when building a [`ChannelStore`]
#[derive(Clone)]
pub enum ChannelSpec {
    /// Last-writer-wins with an optional default
    LastValue(Option<Value>),
    /// Ordered, id-deduplicated message list
    Messages,
    /// Per-agent field-wise structure
    Agent,
    /// Custom reducer with a default
    Reducer(Value, ReducerFn),
}

impl Debug for ChannelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelSpec::LastValue(d) => f.debug_tuple("LastValue").field(d).finish(),
            ChannelSpec::Messages => write!(f, "Messages"),
            ChannelSpec::Agent => write!(f, "Agent"),
            ChannelSpec::Reducer(d, _) => f.debug_tuple("Reducer").field(d).finish(),
        }
    }
}

impl ChannelSpec {
    fn build(&self) -> Box<dyn Channel> {
        match self {
            ChannelSpec::LastValue(default) => match default {
                Some(v) => Box::new(LastValueChannel::with_value(v.clone())),
                None => Box::new(LastValueChannel::new()),
            },
            ChannelSpec::Messages => Box::new(MessagesChannel::new()),
            ChannelSpec::Agent => Box::new(AgentChannel::new()),
            ChannelSpec::Reducer(default, reducer) => {
                let reducer = Arc::clone(reducer);
                Box::new(BinaryOperatorChannel {
                    value: None,
                    default: default.clone(),
                    reducer,
                })
            }
        }
    }
}

/// Keyed map of named channels with atomic per-step write application.
///
/// Channels are stored in a `BTreeMap` so snapshots and write application
/// iterate in a deterministic order.
#[derive(Debug, Default)]
pub struct ChannelStore {
    channels: BTreeMap<String, Box<dyn Channel>>,
}

impl Clone for ChannelStore {
    fn clone(&self) -> Self {
        Self {
            channels: self
                .channels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone_box()))
                .collect(),
        }
    }
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from declared channel specs, filling defaults
    pub fn initialize(specs: &BTreeMap<String, ChannelSpec>) -> Self {
        let channels = specs
            .iter()
            .map(|(name, spec)| (name.clone(), spec.build()))
            .collect();
        Self { channels }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Read the current value of a channel
    pub fn read(&self, name: &str) -> Result<Value> {
        self.channels
            .get(name)
            .ok_or_else(|| CheckpointError::UnknownChannel(name.to_string()))?
            .get()
    }

    /// Apply a batch of writes atomically.
    ///
    /// Writes are grouped per channel and applied to a cloned store; the
    /// clone replaces the live channels only once every reducer succeeded,
    /// so a failing update leaves the store untouched. Unknown channels are
    /// rejected.
    pub fn apply(&mut self, writes: Vec<(String, Value)>) -> Result<Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for (name, value) in writes {
            if !self.channels.contains_key(&name) {
                return Err(CheckpointError::UnknownChannel(name));
            }
            grouped.entry(name).or_default().push(value);
        }

        let mut staged = self.clone();
        let mut updated = Vec::new();
        for (name, values) in grouped {
            let channel = staged
                .channels
                .get_mut(&name)
                .ok_or_else(|| CheckpointError::UnknownChannel(name.clone()))?;
            if channel.update(values)? {
                updated.push(name);
            }
        }
        self.channels = staged.channels;
        Ok(updated)
    }

    /// Deep snapshot of every channel
    pub fn snapshot(&self) -> Result<std::collections::HashMap<String, Value>> {
        let mut out = std::collections::HashMap::new();
        for (name, channel) in &self.channels {
            out.insert(name.clone(), channel.checkpoint()?);
        }
        Ok(out)
    }

    /// Restore channel values from a checkpoint snapshot.
    ///
    /// Channels absent from the snapshot keep their defaults; snapshot
    /// entries without a declared channel are rejected.
    pub fn restore(&mut self, values: &std::collections::HashMap<String, Value>) -> Result<()> {
        for (name, value) in values {
            let channel = self
                .channels
                .get_mut(name)
                .ok_or_else(|| CheckpointError::UnknownChannel(name.clone()))?;
            channel.from_checkpoint(value.clone())?;
        }
        Ok(())
    }

    /// Serialize the full store to a JSON object
    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self.snapshot()?)?)
    }

    /// Restore from a JSON object produced by [`ChannelStore::to_json`]
    pub fn from_json(&mut self, json: Value) -> Result<()> {
        let values: std::collections::HashMap<String, Value> = serde_json::from_value(json)?;
        self.restore(&values)
    }
}
