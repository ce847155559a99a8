//! Intents and the merge table.

use crate::error::{BulkError, Result};
use crate::payload::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Operation requested by an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    /// Create the named object
    Create,
    /// Partially update the named object
    Update,
    /// Delete the named object
    Delete,
}

impl Op {
    /// Returns true for create and update.
    pub fn is_upsert(&self) -> bool {
        matches!(self, Op::Create | Op::Update)
    }

    /// Returns true for delete.
    pub fn is_delete(&self) -> bool {
        matches!(self, Op::Delete)
    }

    /// Lowercase name used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Update => "update",
            Op::Delete => "delete",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identifier of a submitted intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntentId(Uuid);

impl IntentId {
    /// Generates a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IntentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A caller's request to create, update or delete one named object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// Requested operation
    pub op: Op,
    /// Resource kind (e.g. "badge", "route_map_clause")
    pub kind: String,
    /// Stable object name within the kind
    pub name: String,
    /// Caller-provided fields; present for create/update only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
}

impl Intent {
    /// Creates a create intent.
    pub fn create(kind: impl Into<String>, name: impl Into<String>, payload: Payload) -> Self {
        Self {
            op: Op::Create,
            kind: kind.into(),
            name: name.into(),
            payload: Some(payload),
        }
    }

    /// Creates an update intent.
    pub fn update(kind: impl Into<String>, name: impl Into<String>, payload: Payload) -> Self {
        Self {
            op: Op::Update,
            kind: kind.into(),
            name: name.into(),
            payload: Some(payload),
        }
    }

    /// Creates a delete intent.
    pub fn delete(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            op: Op::Delete,
            kind: kind.into(),
            name: name.into(),
            payload: None,
        }
    }

    /// Checks the shape of the intent (name present, payload iff upsert).
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(BulkError::invalid_intent(&self.kind, &self.name, "empty name"));
        }
        match (self.op, &self.payload) {
            (Op::Create | Op::Update, None) => Err(BulkError::invalid_intent(
                &self.kind,
                &self.name,
                format!("{} requires a payload", self.op),
            )),
            (Op::Delete, Some(_)) => Err(BulkError::invalid_intent(
                &self.kind,
                &self.name,
                "delete does not take a payload",
            )),
            _ => Ok(()),
        }
    }
}

/// What happens when an intent arrives for a name that is already queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// create + create: the new payload replaces the queued one
    Replace,
    /// create + update, update + update: field-wise overlay, queued op kept
    Overlay,
    /// create + delete: both disappear, nothing is sent (unless the create
    /// had replaced a queued delete, which is then restored)
    Cancel,
    /// update + delete: the queued entry becomes a delete
    BecomeDelete,
    /// delete + create: the queued entry becomes a create with the new payload
    BecomeCreate,
    /// delete + delete: idempotent
    Absorb,
}

/// Looks up the merge table.
///
/// Returns `None` for the illegal combinations (update after a queued create
/// is fine, but create after a queued update and update after a queued delete
/// are rejected).
pub fn merge_action(existing: Op, new: Op) -> Option<MergeAction> {
    use MergeAction::*;
    match (existing, new) {
        (Op::Create, Op::Create) => Some(Replace),
        (Op::Create, Op::Update) => Some(Overlay),
        (Op::Create, Op::Delete) => Some(Cancel),
        (Op::Update, Op::Create) => None,
        (Op::Update, Op::Update) => Some(Overlay),
        (Op::Update, Op::Delete) => Some(BecomeDelete),
        (Op::Delete, Op::Create) => Some(BecomeCreate),
        (Op::Delete, Op::Update) => None,
        (Op::Delete, Op::Delete) => Some(Absorb),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_table() {
        use MergeAction::*;
        let cases = [
            (Op::Create, Op::Create, Some(Replace)),
            (Op::Create, Op::Update, Some(Overlay)),
            (Op::Create, Op::Delete, Some(Cancel)),
            (Op::Update, Op::Create, None),
            (Op::Update, Op::Update, Some(Overlay)),
            (Op::Update, Op::Delete, Some(BecomeDelete)),
            (Op::Delete, Op::Create, Some(BecomeCreate)),
            (Op::Delete, Op::Update, None),
            (Op::Delete, Op::Delete, Some(Absorb)),
        ];
        for (existing, new, expected) in cases {
            assert_eq!(merge_action(existing, new), expected, "{existing} then {new}");
        }
    }

    #[test]
    fn test_validate() {
        assert!(Intent::create("badge", "B1", Payload::new()).validate().is_ok());
        assert!(Intent::delete("badge", "B1").validate().is_ok());

        let mut bad = Intent::delete("badge", "B1");
        bad.payload = Some(Payload::new());
        assert!(matches!(bad.validate(), Err(BulkError::InvalidIntent { .. })));

        let mut bad = Intent::update("badge", "B1", Payload::new());
        bad.payload = None;
        assert!(bad.validate().is_err());

        assert!(Intent::delete("badge", "").validate().is_err());
    }

    #[test]
    fn test_intent_serde() {
        let intent: Intent = serde_json::from_str(
            r#"{"op":"create","kind":"badge","name":"B1","payload":{"enable":true}}"#,
        )
        .unwrap();
        assert_eq!(intent.op, Op::Create);
        assert_eq!(intent.payload.unwrap().len(), 1);

        let intent: Intent =
            serde_json::from_str(r#"{"op":"delete","kind":"badge","name":"B1"}"#).unwrap();
        assert!(intent.payload.is_none());
    }
}
