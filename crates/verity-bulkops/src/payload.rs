//! Presence-aware payloads.
//!
//! A [`Payload`] carries only the fields a caller explicitly set. A field that
//! is absent from the map is *unset*; a field present with `null` was
//! explicitly cleared. Merging and serialization both consult presence, so a
//! partial update never resets fields it did not mention.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Presence of a single field in a payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Field<'a> {
    /// The caller did not mention the field.
    Unset,
    /// The caller explicitly set the field to null.
    Null,
    /// The caller set the field to a value (possibly zero or empty).
    Value(&'a Value),
}

impl<'a> Field<'a> {
    /// Returns true if the field was mentioned by the caller.
    pub fn is_set(&self) -> bool {
        !matches!(self, Field::Unset)
    }

    /// Returns the value if one is present.
    pub fn value(&self) -> Option<&'a Value> {
        match self {
            Field::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Field map for one object of one kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload {
    fields: BTreeMap<String, Value>,
}

impl Payload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a payload from a JSON object.
    ///
    /// Returns `None` if `value` is not an object.
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(map.into_iter().collect()),
            _ => None,
        }
    }

    /// Sets a field, builder style.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Explicitly clears a field, builder style.
    pub fn with_null(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into(), Value::Null);
        self
    }

    /// Sets a field.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Forgets a field so that it becomes unset again.
    pub fn unset(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Returns the presence of a field.
    pub fn field(&self, field: &str) -> Field<'_> {
        match self.fields.get(field) {
            None => Field::Unset,
            Some(Value::Null) => Field::Null,
            Some(v) => Field::Value(v),
        }
    }

    /// Returns the raw value of a set field (including explicit null).
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Returns true if the field is set.
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Number of set fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if no field is set.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates over the set fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Overlays `newer` onto this payload.
    ///
    /// Fields set in `newer` win; fields it leaves unset keep their current
    /// value. This is a shallow, field-level merge: nested objects and lists
    /// are replaced as a whole.
    pub fn overlay(&mut self, newer: Payload) {
        for (field, value) in newer.fields {
            self.fields.insert(field, value);
        }
    }

    /// Converts into a JSON object value.
    pub fn into_json(self) -> Value {
        Value::Object(self.fields.into_iter().collect::<Map<String, Value>>())
    }

    /// Returns a JSON object value without consuming the payload.
    pub fn to_json(&self) -> Value {
        self.clone().into_json()
    }
}

impl FromIterator<(String, Value)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Self {
        payload.into_json()
    }
}
