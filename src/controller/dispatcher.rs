//! Worker pool pulling events from the work queue
//!
//! Each worker loops: take an event, hand it to the [`EventHandler`], then
//! settle the outcome with the queue:
//! - success clears the key's retry bookkeeping and applies the [`Action`]
//! - a retryable error is re-added with rate limiting until `max_retries`
//!   re-adds have been spent, after which the event is dropped and logged
//! - a non-retryable error is dropped and logged immediately
//!
//! Workers stop pulling as soon as shutdown is signalled and exit after
//! finishing the event they hold.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use kube::ResourceExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Action, ControllerConfig};
use crate::event::Event;
use crate::queue::{Keyed, WorkQueue};
use crate::Error;

/// Handles a single event pulled from the queue
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process the event
    async fn handle(&self, event: &Event) -> Result<Action, Error>;
}

/// Fixed-size worker pool over a shared work queue
pub struct Controller {
    queue: WorkQueue<Event>,
    handler: Arc<dyn EventHandler>,
    config: ControllerConfig,
}

impl Controller {
    /// Create a controller dispatching events from `queue` to `handler`
    pub fn new(
        queue: WorkQueue<Event>,
        handler: Arc<dyn EventHandler>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    /// Run the workers until `shutdown` is cancelled, then drain.
    ///
    /// After cancellation the queue is shut down and in-flight events are
    /// given up to `drain_timeout` to finish.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut workers = JoinSet::new();
        info!(workers = self.config.workers, "starting workers");

        for id in 0..self.config.workers {
            let worker = Worker {
                id,
                queue: self.queue.clone(),
                handler: Arc::clone(&self.handler),
                max_retries: self.config.max_retries,
                shutdown: shutdown.clone(),
            };
            workers.spawn(worker.run());
        }

        info!("controller ready");
        shutdown.cancelled().await;
        info!("shutting down controller");
        self.queue.shut_down();

        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "worker task failed");
                }
            }
        })
        .await;

        match drained {
            Ok(()) => info!("all workers stopped"),
            Err(_) => {
                warn!(
                    timeout_secs = self.config.drain_timeout.as_secs(),
                    "workers did not stop in time, abandoning in-flight events"
                );
                workers.abort_all();
            }
        }
    }
}

struct Worker {
    id: usize,
    queue: WorkQueue<Event>,
    handler: Arc<dyn EventHandler>,
    max_retries: u32,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "worker started");
        while self.process_next_item().await {}
        debug!(worker = self.id, "worker stopped");
    }

    /// Returns false once the worker should exit
    async fn process_next_item(&self) -> bool {
        let event = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return false,
            event = self.queue.get() => match event {
                Some(event) => event,
                None => return false,
            },
        };

        let key = event.key();
        let intent = event.intent().name_any();
        let outcome = AssertUnwindSafe(self.handler.handle(&event))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(action)) => {
                self.queue.forget(&event);
                match action {
                    Action::Done => debug!(%key, "successfully processed event"),
                    Action::Enqueue(next) => {
                        debug!(%key, next = %next.key(), "processed event, queueing follow-up");
                        self.queue.add(next);
                    }
                    Action::RequeueAfter(delay) => {
                        debug!(%key, delay_ms = delay.as_millis(), "requeueing event");
                        self.queue.add_after(event.clone(), delay);
                    }
                }
            }
            Ok(Err(e)) if !e.is_retryable() => {
                error!(%key, %intent, error = %e, "event failed permanently, dropping it");
                self.queue.forget(&event);
            }
            Ok(Err(e)) => {
                let attempts = self.queue.num_requeues(&event);
                if attempts < self.max_retries {
                    warn!(%key, %intent, error = %e, attempt = attempts + 1, "failed to process event, requeueing it");
                    self.queue.add_rate_limited(event.clone());
                } else {
                    error!(%key, %intent, error = %e, attempts = attempts + 1, "failed to process event, dropping it");
                    self.queue.forget(&event);
                }
            }
            Err(_) => {
                error!(%key, %intent, "event handler panicked, dropping event");
                self.queue.forget(&event);
            }
        }

        self.queue.done(&event);
        true
    }
}
