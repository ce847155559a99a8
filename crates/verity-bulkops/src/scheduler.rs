//! Dependency-aware batch selection.
//!
//! The scheduler is a pure function from per-kind state to the set of kinds
//! that may start a batch now. Ordering rules:
//!
//! - Upserts of a kind wait for upserts of its ancestors.
//! - Deletes of a kind wait for any work of its descendants, so referrers are
//!   updated or removed before the object they reference disappears.
//! - A kind with a batch in flight is never selected again until it finishes.
//!
//! In trigger mode an upstream kind only blocks if it holds work queued no
//! later than the downstream kind's last enqueue; work queued afterwards is
//! not something the downstream intents can depend on. Upstream work that is
//! in flight or selected in the same round always blocks. A kind that is
//! triggered but blocked forwards its trigger to the kinds blocking it.
//!
//! In drain mode (reconciliation-end flush) every kind is triggered, any
//! pending upstream work blocks, and deletes start only once no upsert is
//! pending anywhere.

use crate::dag::DependencyDag;

/// Scheduling state of one kind, indexed by topological position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindView {
    /// Position of the oldest queued upsert
    pub oldest_queued_upsert: Option<u64>,
    /// Position of the oldest queued delete
    pub oldest_queued_delete: Option<u64>,
    /// Sequence of the latest submission to the kind
    pub last_enqueue: Option<u64>,
    /// A batch of this kind is running
    pub in_flight: bool,
    /// The running batch carries upserts
    pub in_flight_upserts: bool,
    /// Size or age trigger fired
    pub triggered: bool,
}

impl KindView {
    fn has_queued_upserts(&self) -> bool {
        self.oldest_queued_upsert.is_some()
    }

    fn has_queued_deletes(&self) -> bool {
        self.oldest_queued_delete.is_some()
    }

    fn oldest_queued(&self) -> Option<u64> {
        match (self.oldest_queued_upsert, self.oldest_queued_delete) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn has_upsert_work(&self) -> bool {
        self.has_queued_upserts() || self.in_flight_upserts
    }
}

/// How a scheduling round treats triggers and blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Mid-reconciliation: only triggered kinds, sequence-aware blocking
    Trigger,
    /// Reconciliation-end flush: every kind, strict topological order
    Drain,
}

/// A kind selected to start a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// Topological index of the kind
    pub index: usize,
    pub upserts: bool,
    pub deletes: bool,
}

/// Picks the kinds that may start a batch, ordered by topological index.
pub fn select(dag: &DependencyDag, views: &[KindView], pass: Pass) -> Vec<Selection> {
    debug_assert_eq!(dag.len(), views.len());
    let strict = pass == Pass::Drain;

    let triggered = match pass {
        Pass::Drain => vec![true; views.len()],
        Pass::Trigger => propagate_triggers(dag, views),
    };

    let mut upserts = vec![false; views.len()];
    for k in 0..views.len() {
        let view = &views[k];
        if view.in_flight || !triggered[k] || !view.has_queued_upserts() {
            continue;
        }
        let blocked = dag.ancestor_indices(k).iter().any(|&a| {
            upserts[a]
                || views[a].in_flight_upserts
                || queued_blocks(views[a].oldest_queued_upsert, view.last_enqueue, strict)
        });
        upserts[k] = !blocked;
    }

    let upsert_pending_elsewhere = |k: usize| {
        views.iter().enumerate().any(|(i, v)| {
            if i == k {
                v.has_queued_upserts() && !upserts[k]
            } else {
                v.has_upsert_work() || upserts[i]
            }
        })
    };

    let mut deletes = vec![false; views.len()];
    for k in (0..views.len()).rev() {
        let view = &views[k];
        if view.in_flight || !triggered[k] || !view.has_queued_deletes() {
            continue;
        }
        if strict && upsert_pending_elsewhere(k) {
            continue;
        }
        let blocked = dag.descendant_indices(k).iter().any(|&d| {
            upserts[d]
                || deletes[d]
                || views[d].in_flight
                || queued_blocks(views[d].oldest_queued(), view.last_enqueue, strict)
        });
        deletes[k] = !blocked;
    }

    (0..views.len())
        .filter(|&k| upserts[k] || deletes[k])
        .map(|k| Selection {
            index: k,
            upserts: upserts[k],
            deletes: deletes[k],
        })
        .collect()
}

/// Returns true if queued upstream work at `oldest` blocks a kind whose last
/// enqueue is `last_enqueue`.
fn queued_blocks(oldest: Option<u64>, last_enqueue: Option<u64>, strict: bool) -> bool {
    match (oldest, last_enqueue) {
        (None, _) => false,
        (Some(_), _) if strict => true,
        (Some(seq), Some(last)) => seq <= last,
        (Some(_), None) => false,
    }
}

/// Forwards triggers from blocked kinds to the queued work blocking them,
/// until nothing changes.
fn propagate_triggers(dag: &DependencyDag, views: &[KindView]) -> Vec<bool> {
    let mut triggered: Vec<bool> = views.iter().map(|v| v.triggered).collect();
    let mut changed = true;
    while changed {
        changed = false;
        for k in 0..views.len() {
            if !triggered[k] {
                continue;
            }
            let view = &views[k];
            let mut blockers = Vec::new();
            if view.has_queued_upserts() {
                blockers.extend(dag.ancestor_indices(k).iter().copied().filter(|&a| {
                    queued_blocks(views[a].oldest_queued_upsert, view.last_enqueue, false)
                }));
            }
            if view.has_queued_deletes() {
                blockers.extend(dag.descendant_indices(k).iter().copied().filter(|&d| {
                    queued_blocks(views[d].oldest_queued(), view.last_enqueue, false)
                }));
            }
            for b in blockers {
                if !triggered[b] {
                    triggered[b] = true;
                    changed = true;
                }
            }
        }
    }
    triggered
}
