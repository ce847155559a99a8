//! Caller-visible intent handles.
//!
//! A handle is the receiving half of a `watch` channel whose sending half
//! ([`HandleCompleter`]) travels with the queued intent into a batch. Terminal
//! states are monotonic: once a handle has succeeded, failed or been
//! cancelled, later completions are ignored.

use crate::error::{BulkError, Result};
use crate::intent::{IntentId, Op};
use std::time::Duration;
use tokio::sync::watch;

/// Lifecycle state of one intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleState {
    /// Queued, not yet claimed by a batch
    Pending,
    /// Claimed by a batch that is talking to the controller
    InFlight,
    /// Applied by the controller
    Succeeded,
    /// Rejected or failed
    Failed(BulkError),
    /// Drained by shutdown
    Cancelled,
}

impl HandleState {
    /// Returns true for succeeded, failed and cancelled.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HandleState::Succeeded | HandleState::Failed(_) | HandleState::Cancelled
        )
    }

    fn to_result(&self) -> Result<()> {
        match self {
            HandleState::Succeeded => Ok(()),
            HandleState::Failed(e) => Err(e.clone()),
            HandleState::Cancelled => Err(BulkError::Cancelled),
            HandleState::Pending | HandleState::InFlight => {
                Err(BulkError::deadline("non-terminal intent"))
            }
        }
    }
}

/// The future-like object returned by `submit`.
#[derive(Debug, Clone)]
pub struct IntentHandle {
    id: IntentId,
    kind: String,
    name: String,
    op: Op,
    rx: watch::Receiver<HandleState>,
}

impl IntentHandle {
    /// Identifier of the submitted intent.
    pub fn id(&self) -> IntentId {
        self.id
    }

    /// Resource kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Object name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operation as submitted (before any merge).
    pub fn op(&self) -> Op {
        self.op
    }

    /// Current state.
    pub fn state(&self) -> HandleState {
        self.rx.borrow().clone()
    }

    /// Returns true once a terminal state has been reached.
    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_terminal()
    }

    /// Waits until the intent reaches a terminal state.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.rx.clone();
        let waited = match rx.wait_for(HandleState::is_terminal).await {
            Ok(state) => Some(state.to_result()),
            Err(_) => None,
        };
        if let Some(result) = waited {
            return result;
        }
        // The completer is gone without a terminal state; its Drop normally
        // prevents this, treat it as a cancellation.
        let state = rx.borrow().clone();
        if state.is_terminal() {
            state.to_result()
        } else {
            Err(BulkError::Cancelled)
        }
    }

    /// Waits with an optional deadline.
    ///
    /// Hitting the deadline does not cancel the underlying batch.
    pub async fn wait_timeout(&self, deadline: Option<Duration>) -> Result<()> {
        match deadline {
            None => self.wait().await,
            Some(limit) => match tokio::time::timeout(limit, self.wait()).await {
                Ok(result) => result,
                Err(_) => Err(BulkError::deadline(format!(
                    "{} {}:{}",
                    self.op, self.kind, self.name
                ))),
            },
        }
    }
}

/// Sending half of a handle, owned by the queue entry or batch.
#[derive(Debug)]
pub struct HandleCompleter {
    id: IntentId,
    tx: watch::Sender<HandleState>,
}

impl HandleCompleter {
    /// Identifier of the intent this completer belongs to.
    pub fn id(&self) -> IntentId {
        self.id
    }

    /// Marks the intent as claimed by a batch.
    pub fn mark_in_flight(&self) {
        self.tx.send_if_modified(|state| {
            if *state == HandleState::Pending {
                *state = HandleState::InFlight;
                true
            } else {
                false
            }
        });
    }

    /// Moves the handle to a terminal state.
    ///
    /// Returns false if the handle was already terminal.
    pub fn complete(&self, outcome: HandleState) -> bool {
        debug_assert!(outcome.is_terminal());
        self.tx.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = outcome;
                true
            }
        })
    }

    /// Completes with the given result.
    pub fn finish(&self, result: &Result<()>) -> bool {
        match result {
            Ok(()) => self.complete(HandleState::Succeeded),
            Err(BulkError::Cancelled) => self.complete(HandleState::Cancelled),
            Err(e) => self.complete(HandleState::Failed(e.clone())),
        }
    }

    /// Returns true if the handle is terminal.
    pub fn is_done(&self) -> bool {
        self.tx.borrow().is_terminal()
    }
}

impl Drop for HandleCompleter {
    fn drop(&mut self) {
        // Never leave a caller waiting on an intent nobody will complete.
        self.complete(HandleState::Cancelled);
    }
}

/// Creates a connected handle/completer pair in the pending state.
pub fn handle_pair(kind: &str, name: &str, op: Op) -> (IntentHandle, HandleCompleter) {
    let id = IntentId::new();
    let (tx, rx) = watch::channel(HandleState::Pending);
    (
        IntentHandle {
            id,
            kind: kind.to_string(),
            name: name.to_string(),
            op,
            rx,
        },
        HandleCompleter { id, tx },
    )
}
