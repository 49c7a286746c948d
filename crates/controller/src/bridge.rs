//! Event bridge: watch notifications in, queue keys out.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use xposer_core::{Identity, Notification};
use xposer_queue::WorkQueue;

use crate::context::Context;

#[derive(Clone)]
pub struct EventBridge {
    queue: Arc<WorkQueue<String>>,
}

impl EventBridge {
    pub fn new(ctx: &Context) -> Self { Self { queue: Arc::clone(&ctx.queue) } }

    pub fn handle(&self, n: Notification) {
        match n {
            Notification::Added(id) => self.on_add(id),
            Notification::Updated { old, new } => self.on_update(old, new),
            Notification::Deleted(id) => self.on_delete(id),
        }
    }

    pub fn on_add(&self, id: Identity) {
        match id {
            Ok(w) => {
                info!(workload = %w, "deployment added");
                self.queue.add(w.key());
            }
            Err(e) => dropped("add", &e),
        }
    }

    /// Only the new object's identity matters; old and new are not diffed.
    pub fn on_update(&self, _old: Option<Identity>, new: Identity) {
        match new {
            Ok(w) => {
                debug!(workload = %w, "deployment updated");
                self.queue.add(w.key());
            }
            Err(e) => dropped("update", &e),
        }
    }

    /// Deletions are logged only. Dependents created earlier stay in place.
    pub fn on_delete(&self, id: Identity) {
        match id {
            Ok(w) => info!(workload = %w, "deployment deleted"),
            Err(e) => dropped("delete", &e),
        }
    }

    /// Feed notifications into the queue until the sender side closes.
    pub async fn pump(self, mut rx: mpsc::Receiver<Notification>) {
        while let Some(n) = rx.recv().await {
            self.handle(n);
        }
        debug!("notification channel closed");
    }
}

fn dropped(event: &'static str, e: &xposer_core::IdentityError) {
    counter!("bridge_identity_errors", 1, "event" => event);
    error!(event, error = %e, "could not identify workload; dropping event");
}
