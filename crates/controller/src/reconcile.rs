//! Reconciliation engine. One call handles one queue key end to end:
//! parse, fetch from cache, derive, apply, then ack or requeue.

use std::future::Future;

use metrics::counter;
use tracing::{debug, error, info, instrument, warn};
use xposer_apply::{ApplyError, Created, DependentRef};
use xposer_core::{derive, DerivationError, IdentityError, WorkloadRef};

use crate::context::Context;

pub type ApplyOutcome = Result<Created, ApplyError>;

/// How a processed item leaves the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    /// Handled; backoff state is reset.
    Done,
    /// At least one transient failure; retry with backoff.
    Requeue,
    /// Nothing more can be done for the current state of the workload.
    Drop,
}

/// Both apply results of a pass, kept side by side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub workload: WorkloadRef,
    pub derivation_errors: Vec<DerivationError>,
    pub service: Option<ApplyOutcome>,
    pub ingress: Option<ApplyOutcome>,
}

impl ReconcileReport {
    pub fn applies(&self) -> impl Iterator<Item = &ApplyOutcome> { self.service.iter().chain(self.ingress.iter()) }

    pub fn errors(&self) -> impl Iterator<Item = &ApplyError> {
        self.applies().filter_map(|r| match r {
            Err(ApplyError::AlreadyExists(_)) | Ok(_) => None,
            Err(e) => Some(e),
        })
    }

    pub fn finish(&self) -> Finish {
        if self.errors().any(ApplyError::is_transient) {
            Finish::Requeue
        } else if self.errors().next().is_some() {
            Finish::Drop
        } else {
            Finish::Done
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// The queue key did not name a workload.
    Malformed(IdentityError),
    /// The workload is no longer in the cache.
    Vanished(WorkloadRef),
    Reconciled(ReconcileReport),
}

impl ItemOutcome {
    pub fn finish(&self) -> Finish {
        match self {
            ItemOutcome::Malformed(_) => Finish::Drop,
            ItemOutcome::Vanished(_) => Finish::Done,
            ItemOutcome::Reconciled(r) => r.finish(),
        }
    }
}

/// Take one key off the queue and process it. Returns `false` once the queue
/// is shutting down.
pub async fn process_next(ctx: &Context) -> bool {
    let Some(key) = ctx.queue.get().await else {
        return false;
    };
    counter!("reconcile_total", 1);
    let outcome = reconcile_key(ctx, &key).await;
    settle(ctx, &key, &outcome);
    ctx.queue.done(&key);
    true
}

#[instrument(skip(ctx))]
pub async fn reconcile_key(ctx: &Context, key: &str) -> ItemOutcome {
    let workload = match key.parse::<WorkloadRef>() {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "dropping malformed work item");
            return ItemOutcome::Malformed(e);
        }
    };

    // Always act on what the cache holds now, not on the triggering event.
    let Some(snapshot) = ctx.cache.get(&workload) else {
        debug!("workload no longer cached; nothing to do");
        return ItemOutcome::Vanished(workload);
    };

    let derived = derive(&workload, &snapshot);
    for e in &derived.errors {
        warn!(error = %e, "invalid expose configuration");
    }
    if derived.is_empty() && derived.errors.is_empty() {
        debug!("workload does not request exposure");
    }

    let service = match &derived.service {
        Some(spec) => Some(bounded(ctx, DependentRef::service(spec), ctx.applier.create_service(spec)).await),
        None => None,
    };
    // Attempted even when the Service failed; the backend may already exist.
    let ingress = match &derived.ingress {
        Some(spec) => Some(bounded(ctx, DependentRef::ingress(spec), ctx.applier.create_ingress(spec)).await),
        None => None,
    };

    let report = ReconcileReport { workload, derivation_errors: derived.errors, service, ingress };
    for r in report.applies() {
        match r {
            Ok(created) => info!(dependent = %created.target, "dependent created"),
            Err(ApplyError::AlreadyExists(t)) => debug!(dependent = %t, "dependent already exists"),
            Err(e) => warn!(error = %e, transient = e.is_transient(), "apply failed"),
        }
    }
    ItemOutcome::Reconciled(report)
}

async fn bounded<F>(ctx: &Context, target: DependentRef, fut: F) -> ApplyOutcome
where
    F: Future<Output = ApplyOutcome>,
{
    let limit = ctx.config.apply_timeout;
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(ApplyError::Transient { target, message: format!("no response within {:?}", limit) }),
    }
}

/// Report back to the queue. `done` is the caller's job.
fn settle(ctx: &Context, key: &String, outcome: &ItemOutcome) {
    match outcome.finish() {
        Finish::Done => {
            ctx.queue.forget(key);
            counter!("reconcile_ok", 1);
        }
        Finish::Drop => {
            ctx.queue.forget(key);
            counter!("reconcile_dropped", 1);
            warn!(key = %key, "giving up on work item until the workload changes");
        }
        Finish::Requeue => {
            let attempts = ctx.queue.num_requeues(key);
            if attempts >= ctx.config.max_requeues {
                ctx.queue.forget(key);
                counter!("reconcile_dropped", 1);
                error!(key = %key, attempts, "retry budget exhausted; dropping work item");
            } else {
                ctx.queue.add_rate_limited(key.clone());
                counter!("reconcile_requeued", 1);
                info!(key = %key, attempt = attempts + 1, "requeued after transient failure");
            }
        }
    }
}
