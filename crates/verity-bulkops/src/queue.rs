//! Per-kind intent queue with merge semantics.
//!
//! The queue is an insertion-ordered map keyed by object name. At most one
//! entry exists per name; an intent arriving for a queued name is merged into
//! that entry according to [`merge_action`] and keeps the entry's original
//! position, so batches are laid out in first-submission order.
//!
//! # Merge behavior
//!
//! - create + create: payload replaced
//! - create/update + update: payload overlaid field-wise, new fields win
//! - create + delete: entry removed, nothing is sent
//! - update + delete: entry becomes a delete
//! - delete + create: entry becomes a create with the new payload
//! - delete + create + delete: entry reverts to the delete, since the object
//!   may exist on the controller
//! - delete + delete: absorbed
//! - update + create, delete + update: rejected with `InvalidMerge`

use crate::error::{BulkError, Result};
use crate::handle::{handle_pair, HandleCompleter, HandleState, IntentHandle};
use crate::intent::{merge_action, Intent, MergeAction, Op};
use crate::payload::Payload;
use std::collections::{BTreeMap, HashMap};
use tokio::time::Instant;

/// One queued (not yet claimed) intent.
#[derive(Debug)]
pub struct QueuedIntent {
    /// Submission sequence of the first intent that created this entry
    pub seq: u64,
    /// Effective operation after merges
    pub op: Op,
    /// Object name
    pub name: String,
    /// Effective payload after merges (None for deletes)
    pub payload: Option<Payload>,
    /// Time the entry was first queued
    pub submitted_at: Instant,
    /// Completers of every handle merged into this entry
    pub waiters: Vec<HandleCompleter>,
    /// The entry was a delete before a create merged into it
    pub replaced_delete: bool,
}

impl QueuedIntent {
    /// Completes every merged handle with the same result.
    pub fn complete(&self, result: &Result<()>) {
        for waiter in &self.waiters {
            waiter.finish(result);
        }
    }

    /// Marks every merged handle as in flight.
    pub fn mark_in_flight(&self) {
        for waiter in &self.waiters {
            waiter.mark_in_flight();
        }
    }
}

/// Result of a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// A new entry was appended
    Queued,
    /// The intent merged into an existing entry
    Merged(MergeAction),
    /// The intent cancelled the queued entry out; nothing remains for the name
    Cancelled,
}

/// Ordered, merging buffer of pending intents for one kind.
#[derive(Debug)]
pub struct IntentQueue {
    kind: String,
    entries: HashMap<String, QueuedIntent>,
    /// Position (first submission sequence) -> name
    order: BTreeMap<u64, String>,
    last_enqueue_seq: Option<u64>,
}

impl IntentQueue {
    /// Creates an empty queue for a kind.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            entries: HashMap::new(),
            order: BTreeMap::new(),
            last_enqueue_seq: None,
        }
    }

    /// Returns the kind this queue buffers.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the queued entry for a name.
    pub fn get(&self, name: &str) -> Option<&QueuedIntent> {
        self.entries.get(name)
    }

    /// Sequence number of the latest submission to this kind, merged or not.
    pub fn last_enqueue_seq(&self) -> Option<u64> {
        self.last_enqueue_seq
    }

    /// Position of the oldest queued entry whose op matches `pred`.
    pub fn oldest_seq_where(&self, pred: impl Fn(&Op) -> bool) -> Option<u64> {
        self.order
            .iter()
            .find(|(_, name)| self.entries.get(*name).is_some_and(|e| pred(&e.op)))
            .map(|(seq, _)| *seq)
    }

    /// Names of queued entries whose op matches `pred`, in queue order.
    pub fn names_where(&self, pred: impl Fn(&Op) -> bool) -> Vec<String> {
        self.order
            .values()
            .filter(|name| self.entries.get(*name).is_some_and(|e| pred(&e.op)))
            .cloned()
            .collect()
    }

    /// Returns true if any queued entry matches `pred`.
    pub fn has_where(&self, pred: impl Fn(&Op) -> bool) -> bool {
        self.entries.values().any(|e| pred(&e.op))
    }

    /// Time at which the oldest entry was queued.
    pub fn oldest_submitted_at(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.submitted_at).min()
    }

    /// Adds an intent, merging with any queued entry for the same name.
    ///
    /// Returns the caller's handle. On an illegal merge nothing changes.
    pub fn push(
        &mut self,
        seq: u64,
        intent: Intent,
        now: Instant,
    ) -> Result<(IntentHandle, PushOutcome)> {
        let Intent {
            op,
            kind,
            name,
            payload,
        } = intent;

        let action = match self.entries.get(&name) {
            None => None,
            Some(existing) => Some(merge_action(existing.op, op).ok_or_else(|| {
                BulkError::InvalidMerge {
                    kind: kind.clone(),
                    name: name.clone(),
                    existing: existing.op,
                    new: op,
                }
            })?),
        };

        let (handle, completer) = handle_pair(&kind, &name, op);
        self.last_enqueue_seq = Some(seq);

        let Some(action) = action else {
            self.order.insert(seq, name.clone());
            self.entries.insert(
                name.clone(),
                QueuedIntent {
                    seq,
                    op,
                    name,
                    payload,
                    submitted_at: now,
                    waiters: vec![completer],
                    replaced_delete: false,
                },
            );
            return Ok((handle, PushOutcome::Queued));
        };

        let reverts = action == MergeAction::Cancel
            && self.entries.get(&name).is_some_and(|e| e.replaced_delete);

        if action == MergeAction::Cancel && !reverts {
            if let Some(entry) = self.entries.remove(&name) {
                self.order.remove(&entry.seq);
                entry.complete(&Ok(()));
            }
            completer.complete(HandleState::Succeeded);
            return Ok((handle, PushOutcome::Cancelled));
        }

        // Present: the lookup above found it.
        if let Some(entry) = self.entries.get_mut(&name) {
            match action {
                MergeAction::Replace => entry.payload = payload,
                MergeAction::Overlay => match (&mut entry.payload, payload) {
                    (Some(queued), Some(newer)) => queued.overlay(newer),
                    (slot, newer) => *slot = newer,
                },
                MergeAction::BecomeDelete => {
                    entry.op = Op::Delete;
                    entry.payload = None;
                }
                MergeAction::BecomeCreate => {
                    entry.op = Op::Create;
                    entry.payload = payload;
                    entry.replaced_delete = true;
                }
                MergeAction::Cancel => {
                    entry.op = Op::Delete;
                    entry.payload = None;
                    entry.replaced_delete = false;
                }
                MergeAction::Absorb => {}
            }
            entry.waiters.push(completer);
        }
        if reverts {
            return Ok((handle, PushOutcome::Merged(MergeAction::BecomeDelete)));
        }
        Ok((handle, PushOutcome::Merged(action)))
    }

    /// Removes and returns the entries selected for a batch, in queue order.
    ///
    /// Upserts and deletes are claimed independently so that a kind can flush
    /// its upserts while its deletes still wait on downstream kinds.
    pub fn claim(&mut self, upserts: bool, deletes: bool) -> Vec<QueuedIntent> {
        let selected: Vec<(u64, String)> = self
            .order
            .iter()
            .filter(|(_, name)| {
                self.entries.get(*name).is_some_and(|e| {
                    (upserts && e.op.is_upsert()) || (deletes && e.op.is_delete())
                })
            })
            .map(|(seq, name)| (*seq, name.clone()))
            .collect();

        let mut claimed = Vec::with_capacity(selected.len());
        for (seq, name) in selected {
            self.order.remove(&seq);
            if let Some(entry) = self.entries.remove(&name) {
                entry.mark_in_flight();
                claimed.push(entry);
            }
        }
        claimed
    }

    /// Cancels every queued entry, completing their handles as cancelled.
    ///
    /// Returns the number of handles completed.
    pub fn cancel_all(&mut self) -> usize {
        self.order.clear();
        let mut cancelled = 0;
        for (_, entry) in self.entries.drain() {
            entry.complete(&Err(BulkError::Cancelled));
            cancelled += entry.waiters.len();
        }
        cancelled
    }

    /// Dumps queued entries for debugging.
    pub fn dump(&self) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|(seq, name)| self.entries.get(name).map(|e| (seq, e)))
            .map(|(seq, e)| {
                let payload = e
                    .payload
                    .as_ref()
                    .map(|p| p.to_json().to_string())
                    .unwrap_or_default();
                format!("{}#{} {} {} {}", self.kind, seq, e.op, e.name, payload)
                    .trim_end()
                    .to_string()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn push(queue: &mut IntentQueue, seq: u64, intent: Intent) -> Result<(IntentHandle, PushOutcome)> {
        queue.push(seq, intent, Instant::now())
    }

    #[tokio::test]
    async fn test_queue_basic() {
        let mut queue = IntentQueue::new("badge");
        assert!(queue.is_empty());

        let (_h, outcome) =
            push(&mut queue, 1, Intent::create("badge", "A", Payload::new().with("color", 1))).unwrap();

        assert_eq!(outcome, PushOutcome::Queued);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.last_enqueue_seq(), Some(1));
        assert_eq!(queue.oldest_seq_where(Op::is_upsert), Some(1));
        assert_eq!(queue.oldest_seq_where(Op::is_delete), None);
    }

    #[tokio::test]
    async fn test_create_then_update_merges() {
        let mut queue = IntentQueue::new("badge");
        push(&mut queue, 1, Intent::create("badge", "A", Payload::new().with("enable", true))).unwrap();
        let (_h, outcome) =
            push(&mut queue, 2, Intent::update("badge", "A", Payload::new().with("color", "red"))).unwrap();

        assert_eq!(outcome, PushOutcome::Merged(MergeAction::Overlay));
        assert_eq!(queue.len(), 1);

        let entry = queue.get("A").unwrap();
        assert_eq!(entry.op, Op::Create);
        assert_eq!(entry.seq, 1);
        assert_eq!(entry.waiters.len(), 2);
        assert_eq!(
            entry.payload.as_ref().unwrap().to_json(),
            json!({"enable": true, "color": "red"})
        );
        // The merge counts as an enqueue for scheduling purposes.
        assert_eq!(queue.last_enqueue_seq(), Some(2));
    }

    #[tokio::test]
    async fn test_create_then_delete_cancels_out() {
        let mut queue = IntentQueue::new("badge");
        let (first, _) = push(&mut queue, 1, Intent::create("badge", "X", Payload::new())).unwrap();
        let (second, outcome) = push(&mut queue, 2, Intent::delete("badge", "X")).unwrap();

        assert_eq!(outcome, PushOutcome::Cancelled);
        assert!(queue.is_empty());
        assert!(queue.claim(true, true).is_empty());
        assert_eq!(first.state(), HandleState::Succeeded);
        assert_eq!(second.state(), HandleState::Succeeded);
    }

    #[tokio::test]
    async fn test_delete_twice_collapses() {
        let mut queue = IntentQueue::new("badge");
        push(&mut queue, 1, Intent::delete("badge", "X")).unwrap();
        let (_h, outcome) = push(&mut queue, 2, Intent::delete("badge", "X")).unwrap();

        assert_eq!(outcome, PushOutcome::Merged(MergeAction::Absorb));
        let claimed = queue.claim(true, true);
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].waiters.len(), 2);
    }

    #[tokio::test]
    async fn test_update_then_delete_becomes_delete() {
        let mut queue = IntentQueue::new("badge");
        push(&mut queue, 1, Intent::update("badge", "X", Payload::new().with("a", 1))).unwrap();
        push(&mut queue, 2, Intent::delete("badge", "X")).unwrap();

        let entry = queue.get("X").unwrap();
        assert_eq!(entry.op, Op::Delete);
        assert!(entry.payload.is_none());
    }

    #[tokio::test]
    async fn test_delete_then_create_becomes_create() {
        let mut queue = IntentQueue::new("badge");
        push(&mut queue, 1, Intent::delete("badge", "X")).unwrap();
        push(&mut queue, 2, Intent::create("badge", "X", Payload::new().with("a", 2))).unwrap();

        let entry = queue.get("X").unwrap();
        assert_eq!(entry.op, Op::Create);
        assert_eq!(entry.payload.as_ref().unwrap().to_json(), json!({"a": 2}));
    }

    #[tokio::test]
    async fn test_delete_create_delete_keeps_the_delete() {
        let mut queue = IntentQueue::new("badge");
        let (first, _) = push(&mut queue, 1, Intent::delete("badge", "X")).unwrap();
        push(&mut queue, 2, Intent::create("badge", "X", Payload::new().with("color", 2))).unwrap();
        let (_h, outcome) = push(&mut queue, 3, Intent::delete("badge", "X")).unwrap();

        assert_eq!(outcome, PushOutcome::Merged(MergeAction::BecomeDelete));
        let entry = queue.get("X").unwrap();
        assert_eq!(entry.op, Op::Delete);
        assert_eq!(entry.seq, 1);
        assert!(entry.payload.is_none());
        assert_eq!(entry.waiters.len(), 3);
        assert_eq!(first.state(), HandleState::Pending);

        // A fresh create/delete pair on top still cancels down to the delete.
        push(&mut queue, 4, Intent::create("badge", "X", Payload::new())).unwrap();
        push(&mut queue, 5, Intent::delete("badge", "X")).unwrap();
        let claimed = queue.claim(true, true);
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].op, Op::Delete);
        assert_eq!(claimed[0].waiters.len(), 5);
    }

    #[tokio::test]
    async fn test_illegal_merges_leave_queue_untouched() {
        let mut queue = IntentQueue::new("badge");
        push(&mut queue, 1, Intent::update("badge", "U", Payload::new().with("a", 1))).unwrap();
        push(&mut queue, 2, Intent::delete("badge", "D")).unwrap();

        let err = push(&mut queue, 3, Intent::create("badge", "U", Payload::new())).unwrap_err();
        assert!(matches!(err, BulkError::InvalidMerge { existing: Op::Update, new: Op::Create, .. }));

        let err = push(&mut queue, 4, Intent::update("badge", "D", Payload::new())).unwrap_err();
        assert!(matches!(err, BulkError::InvalidMerge { existing: Op::Delete, new: Op::Update, .. }));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.last_enqueue_seq(), Some(2));
        assert_eq!(queue.get("U").unwrap().waiters.len(), 1);
    }

    #[tokio::test]
    async fn test_claim_keeps_first_position_and_splits_phases() {
        let mut queue = IntentQueue::new("badge");
        push(&mut queue, 1, Intent::create("badge", "A", Payload::new())).unwrap();
        push(&mut queue, 2, Intent::delete("badge", "B")).unwrap();
        push(&mut queue, 3, Intent::create("badge", "C", Payload::new())).unwrap();
        push(&mut queue, 4, Intent::update("badge", "A", Payload::new().with("x", 1))).unwrap();

        let upserts = queue.claim(true, false);
        let names: Vec<_> = upserts.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["A", "C"]);
        for entry in &upserts {
            for waiter in &entry.waiters {
                assert!(!waiter.is_done());
            }
        }

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.oldest_seq_where(Op::is_delete), Some(2));
        assert_eq!(queue.names_where(Op::is_delete), vec!["B".to_string()]);
        assert!(queue.names_where(Op::is_upsert).is_empty());

        let deletes = queue.claim(false, true);
        assert_eq!(deletes[0].name, "B");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_claim_marks_in_flight() {
        let mut queue = IntentQueue::new("badge");
        let (handle, _) = push(&mut queue, 1, Intent::create("badge", "A", Payload::new())).unwrap();
        let claimed = queue.claim(true, true);
        assert_eq!(handle.state(), HandleState::InFlight);

        claimed[0].complete(&Ok(()));
        assert_eq!(handle.state(), HandleState::Succeeded);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let mut queue = IntentQueue::new("badge");
        let (a, _) = push(&mut queue, 1, Intent::create("badge", "A", Payload::new())).unwrap();
        let (b, _) = push(&mut queue, 2, Intent::update("badge", "A", Payload::new())).unwrap();
        push(&mut queue, 3, Intent::delete("badge", "Z")).unwrap();

        assert_eq!(queue.cancel_all(), 3);
        assert!(queue.is_empty());
        assert_eq!(a.state(), HandleState::Cancelled);
        assert_eq!(b.state(), HandleState::Cancelled);
    }

    #[tokio::test]
    async fn test_dump() {
        let mut queue = IntentQueue::new("badge");
        push(&mut queue, 7, Intent::create("badge", "A", Payload::new().with("enable", true))).unwrap();
        push(&mut queue, 9, Intent::delete("badge", "B")).unwrap();

        assert_eq!(
            queue.dump(),
            vec![
                r#"badge#7 create A {"enable":true}"#.to_string(),
                "badge#9 delete B".to_string(),
            ]
        );
    }
}
