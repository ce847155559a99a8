//! Batch executor.
//!
//! Turns a claimed set of queued intents for one kind into bulk transport
//! calls, correlates per-item results back to the intents, seeds the response
//! cache and completes every handle. Within a batch, creates are sent before
//! updates and deletes go last. Intents whose references were held back are
//! handed back to the caller and completed by a later restore pass.

use crate::cache::ResponseCache;
use crate::dag::{KindSpec, WriteMethod};
use crate::deferred::{self, Clearing, Deferral};
use crate::error::{BulkError, Result};
use crate::intent::Op;
use crate::payload::Payload;
use crate::queue::QueuedIntent;
use crate::retry::{with_retry, RetryPolicy};
use crate::transport::{BulkResponse, ItemResult, Transport, TransportError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counters for one executed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Transport calls issued (chunks), not counting retries
    pub requests: usize,
    /// Queue entries applied
    pub succeeded: usize,
    /// Queue entries that failed
    pub failed: usize,
}

/// Executes batches against a transport.
#[derive(Clone)]
pub struct Executor {
    transport: Arc<dyn Transport>,
    cache: Arc<ResponseCache>,
    policy: RetryPolicy,
    max_batch_size: usize,
    max_delete_batch_size: usize,
}

struct Outcome {
    result: Result<()>,
    object: Option<Value>,
}

impl Executor {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<ResponseCache>,
        policy: RetryPolicy,
        max_batch_size: usize,
        max_delete_batch_size: usize,
    ) -> Self {
        Self {
            transport,
            cache,
            policy,
            max_batch_size: max_batch_size.max(1),
            max_delete_batch_size: max_delete_batch_size.max(1),
        }
    }

    /// Runs one batch to completion and completes every handle in it.
    pub async fn run(&self, kind: &KindSpec, intents: Vec<QueuedIntent>) -> BatchReport {
        self.run_holding(kind, intents, HashMap::new()).await.0
    }

    /// Runs one batch whose listed intents carry held-back references.
    ///
    /// Intents named in `held` that succeed are returned with their deferral
    /// instead of being completed; [`Executor::restore`] finishes them.
    pub async fn run_holding(
        &self,
        kind: &KindSpec,
        intents: Vec<QueuedIntent>,
        mut held: HashMap<String, Deferral>,
    ) -> (BatchReport, Vec<(QueuedIntent, Deferral)>) {
        let mut puts = Vec::new();
        let mut patches = Vec::new();
        let mut deletes = Vec::new();
        for intent in intents {
            match intent.op {
                Op::Delete => deletes.push(intent),
                op => match kind.write_method(op) {
                    WriteMethod::Put => puts.push(intent),
                    WriteMethod::Patch => patches.push(intent),
                },
            }
        }
        // Creates ahead of updates that share a verb.
        puts.sort_by_key(|i| i.op != Op::Create);

        let mut report = BatchReport::default();
        let mut finished: Vec<(QueuedIntent, Outcome)> = Vec::new();
        self.send_group(kind, WriteMethod::Put, puts, &mut report, &mut finished)
            .await;
        self.send_group(kind, WriteMethod::Patch, patches, &mut report, &mut finished)
            .await;

        for chunk in into_chunks(deletes, self.max_delete_batch_size) {
            let names: Vec<String> = chunk.iter().map(|i| i.name.clone()).collect();
            info!(kind = %kind.name, count = names.len(), "Sending bulk delete");

            let transport = self.transport.as_ref();
            let names_ref = names.as_slice();
            let what = format!("DELETE {}", kind.name);
            let result = with_retry(&self.policy, transport, &what, move || {
                transport.delete_bulk(kind, names_ref)
            })
            .await;
            report.requests += 1;
            self.correlate(kind, chunk, &result, &mut finished);
        }

        self.update_cache(kind, &mut finished).await;

        let mut waiting = Vec::new();
        let mut done = Vec::with_capacity(finished.len());
        for (intent, outcome) in finished {
            if outcome.result.is_ok() {
                if let Some(deferral) = held.remove(&intent.name) {
                    waiting.push((intent, deferral));
                    continue;
                }
            }
            done.push((intent, outcome));
        }
        self.complete(kind, &done, &mut report);

        debug!(
            kind = %kind.name,
            requests = report.requests,
            succeeded = report.succeeded,
            failed = report.failed,
            held = waiting.len(),
            "Batch complete"
        );
        (report, waiting)
    }

    /// Patches held-back references in and completes the intents.
    pub async fn restore(&self, kind: &KindSpec, held: Vec<(QueuedIntent, Deferral)>) -> BatchReport {
        let intents: Vec<QueuedIntent> = held
            .into_iter()
            .map(|(mut intent, deferral)| {
                intent.payload = Some(deferral.restore);
                intent
            })
            .collect();
        info!(kind = %kind.name, count = intents.len(), "Restoring deferred references");

        let mut report = BatchReport::default();
        let mut finished = Vec::new();
        self.send_group(kind, WriteMethod::Patch, intents, &mut report, &mut finished)
            .await;
        self.update_cache(kind, &mut finished).await;
        self.complete(kind, &finished, &mut report);
        report
    }

    /// Clears references ahead of deleting their targets.
    ///
    /// Reads the current objects, then PATCHes the field empty on every
    /// listed object still pointing at a target. Failures are logged; the
    /// delete that follows reports the controller's verdict. Returns the
    /// number of write requests sent.
    pub async fn clear_references(&self, clearing: &Clearing) -> usize {
        let kind = clearing.kind.as_ref();
        let transport = self.transport.as_ref();
        let what = format!("GET {}", kind.name);
        let objects =
            match with_retry(&self.policy, transport, &what, move || transport.get(kind)).await {
                Ok(objects) => objects,
                Err(e) => {
                    warn!(kind = %kind.name, error = %e, "Could not read references to clear");
                    return 0;
                }
            };

        let items = deferred::clearing_items(
            &clearing.field,
            &objects,
            &clearing.names,
            &clearing.targets,
        );
        if items.is_empty() {
            return 0;
        }
        info!(
            kind = %kind.name,
            field = %clearing.field.field,
            count = items.len(),
            "Clearing references ahead of delete"
        );
        let items_ref = items.as_slice();
        let what = format!("PATCH {}", kind.name);
        if let Err(e) = with_retry(&self.policy, transport, &what, move || {
            transport.patch_bulk(kind, items_ref)
        })
        .await
        {
            warn!(kind = %kind.name, error = %e, "Clearing references failed");
        }
        self.cache.invalidate(&kind.name);
        1
    }

    async fn send_group(
        &self,
        kind: &KindSpec,
        method: WriteMethod,
        group: Vec<QueuedIntent>,
        report: &mut BatchReport,
        finished: &mut Vec<(QueuedIntent, Outcome)>,
    ) {
        for chunk in into_chunks(group, self.max_batch_size) {
            let items: Vec<(String, Payload)> = chunk
                .iter()
                .map(|i| (i.name.clone(), i.payload.clone().unwrap_or_default()))
                .collect();
            info!(kind = %kind.name, method = method.as_str(), count = items.len(), "Sending bulk upsert");

            let transport = self.transport.as_ref();
            let items_ref = items.as_slice();
            let what = format!("{} {}", method.as_str(), kind.name);
            let result = with_retry(&self.policy, transport, &what, move || {
                send_items(transport, kind, method, items_ref)
            })
            .await;
            report.requests += 1;
            self.correlate(kind, chunk, &result, finished);
        }
    }

    fn complete(&self, kind: &KindSpec, finished: &[(QueuedIntent, Outcome)], report: &mut BatchReport) {
        for (intent, outcome) in finished {
            match &outcome.result {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(kind = %kind.name, name = %intent.name, op = %intent.op, error = %e, "Intent failed");
                }
            }
            intent.complete(&outcome.result);
        }
    }

    fn correlate(
        &self,
        kind: &KindSpec,
        chunk: Vec<QueuedIntent>,
        result: &std::result::Result<BulkResponse, TransportError>,
        finished: &mut Vec<(QueuedIntent, Outcome)>,
    ) {
        if let Err(e) = result {
            warn!(
                kind = %kind.name,
                status = ?e.status,
                per_item = e.per_item.is_some(),
                error = %e,
                "Bulk request failed"
            );
        }
        for intent in chunk {
            let outcome = item_outcome(&kind.name, &intent.name, result);
            finished.push((intent, outcome));
        }
    }

    /// Applies successful outcomes to the cache before any handle completes,
    /// so a caller woken by its handle already sees the written object.
    async fn update_cache(&self, kind: &KindSpec, finished: &mut [(QueuedIntent, Outcome)]) {
        let mut any_success = false;
        let mut any_upsert = false;
        for (intent, outcome) in finished.iter() {
            if outcome.result.is_err() {
                continue;
            }
            any_success = true;
            if intent.op.is_delete() {
                self.cache.record_delete(&kind.name, &intent.name);
            } else {
                any_upsert = true;
                self.cache
                    .record_write(&kind.name, &intent.name, outcome.object.clone());
            }
        }
        if !any_success {
            return;
        }
        self.cache.invalidate(&kind.name);

        if !(kind.refetch_after_write && any_upsert) {
            return;
        }
        let generation = self.cache.generation(&kind.name);
        let transport = self.transport.as_ref();
        let what = format!("GET {}", kind.name);
        match with_retry(&self.policy, transport, &what, move || transport.get(kind)).await {
            Ok(objects) => {
                for (intent, outcome) in finished.iter_mut() {
                    if outcome.result.is_ok() && intent.op.is_upsert() {
                        if let Some(object) = objects.get(&intent.name) {
                            outcome.object = Some(object.clone());
                            self.cache
                                .record_write(&kind.name, &intent.name, Some(object.clone()));
                        }
                    }
                }
                self.cache
                    .install_snapshot(&kind.name, generation, Arc::new(objects));
            }
            Err(e) => {
                warn!(kind = %kind.name, error = %e, "Refetch after write failed; generated fields not cached");
            }
        }
    }
}

async fn send_items(
    transport: &dyn Transport,
    kind: &KindSpec,
    method: WriteMethod,
    items: &[(String, Payload)],
) -> std::result::Result<BulkResponse, TransportError> {
    match method {
        WriteMethod::Put => transport.put_bulk(kind, items).await,
        WriteMethod::Patch => transport.patch_bulk(kind, items).await,
    }
}

fn into_chunks<T>(mut items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    while items.len() > size {
        let rest = items.split_off(size);
        chunks.push(std::mem::replace(&mut items, rest));
    }
    if !items.is_empty() {
        chunks.push(items);
    }
    chunks
}

fn from_item(kind: &str, name: &str, item: &ItemResult) -> Outcome {
    match item {
        ItemResult::Ok(object) => Outcome {
            result: Ok(()),
            object: object.clone(),
        },
        ItemResult::Err(info) => Outcome {
            result: Err(BulkError::validation_rejected(kind, name, info.message.clone())),
            object: None,
        },
    }
}

fn item_outcome(
    kind: &str,
    name: &str,
    result: &std::result::Result<BulkResponse, TransportError>,
) -> Outcome {
    match result {
        Ok(response) => match response.get(name) {
            Some(item) => from_item(kind, name, item),
            // Not mentioned in a successful response: applied, nothing echoed.
            None => Outcome {
                result: Ok(()),
                object: None,
            },
        },
        Err(e) => {
            let result = match &e.per_item {
                Some(per_item) => match per_item.get(name) {
                    Some(item) => return from_item(kind, name, item),
                    None => Err(BulkError::batch_failed(kind, e.status, e.message.clone())),
                },
                None => Err(e.to_bulk_error(kind)),
            };
            Outcome {
                result,
                object: None,
            }
        }
    }
}
