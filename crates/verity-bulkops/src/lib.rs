//! Bulk operation manager for the Verity controller.
//!
//! Per-resource reconciliation code submits create/update/delete intents;
//! the manager merges them per `(kind, name)`, schedules them into
//! dependency-ordered bulk requests and reports each intent's outcome through
//! its handle:
//!
//! - [`BulkOperationManager`]: submission, await, flush, read and shutdown
//! - [`IntentQueue`]: per-kind ordered buffer with merge semantics
//! - [`DependencyDag`]: precedence graph over resource kinds, loaded from a
//!   TOML catalog
//! - [`ResponseCache`]: `Get(kind)` snapshots and recent-write markers
//! - [`Transport`]: the bulk capability of the controller ([`HttpTransport`]
//!   with the `http` feature)
//!
//! # Architecture
//!
//! 1. `submit` merges the intent into its kind's queue and returns a handle
//! 2. A size or age trigger (or `flush`) marks kinds eligible
//! 3. The scheduler picks kinds whose upstream work is done: upserts in
//!    topological order, deletes in reverse
//! 4. The executor sends the bulk requests, correlates per-item results and
//!    seeds the cache
//! 5. Handles complete; newly unblocked kinds are scheduled
//! 6. References that run against the dependency order (a clause matching
//!    on a tenant VRF) are written without the reference and patched in once
//!    the referenced object exists
//!
//! # Example
//!
//! ```ignore
//! use verity_bulkops::{BulkConfig, BulkOperationManager, Payload};
//!
//! let manager = BulkOperationManager::new(BulkConfig::default(), transport)?;
//! let handle = manager.create("badge", "Lobby", Payload::new().with("color", 3))?;
//! manager.flush(None).await?;
//! handle.wait().await?;
//! let echoed = manager.get_cached_object("badge", "Lobby");
//! ```

mod cache;
mod clock;
mod config;
mod dag;
mod deferred;
mod error;
mod executor;
mod handle;
#[cfg(feature = "http")]
mod http;
mod intent;
mod manager;
mod payload;
mod queue;
mod retry;
mod scheduler;
mod transport;
mod verify;

pub use cache::{ObjectMap, ResponseCache, Snapshot};
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{BulkConfig, Mode};
pub use dag::{DeferredField, DependencyDag, KindSpec, ListSemantics, WriteMethod, WriteMode};
pub use deferred::{clearing_items, hold_back, Clearing, Deferral};
pub use error::{BulkError, Result};
pub use executor::{BatchReport, Executor};
pub use handle::{HandleState, IntentHandle};
#[cfg(feature = "http")]
pub use http::{ControllerConfig, HttpTransport};
pub use intent::{merge_action, Intent, IntentId, MergeAction, Op};
pub use manager::{BulkOperationManager, CloseSummary, FlushSummary};
pub use payload::{Field, Payload};
pub use queue::{IntentQueue, PushOutcome, QueuedIntent};
pub use retry::{with_retry, RetryPolicy};
pub use scheduler::{select, KindView, Pass, Selection};
pub use transport::{
    error_from_body, objects_from_body, results_from_body, BulkResponse, ErrInfo, ItemResult,
    Transport, TransportError,
};
pub use verify::{find_object, ReadOutcome, SnapshotReader};
