//! Reconciliation engine for Intents and their Jobs
//!
//! Events pulled from the work queue are dispatched by kind:
//! - [`Event::IntentAdded`] goes to the Intent reconciler, which ensures the
//!   parent Job exists and schedules a completion check
//! - [`Event::JobCompletionCheck`] goes to the completion watcher, which fans
//!   out dependent Jobs once the parent succeeds
//!
//! All cluster reads go through the [`JobCache`] and [`IntentCache`] (the
//! reflector stores) and all writes through the [`JobClient`]. All three are
//! traits so the engine can be exercised without an API server.

mod completion;
mod dispatcher;
mod intent;

pub use completion::{check_completion, CompletionState};
pub(crate) use completion::jittered;
pub use dispatcher::{Controller, EventHandler};
pub use intent::reconcile_intent;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::crd::Intent;
use crate::event::Event;
use crate::queue::{
    controller_rate_limiter, BackoffConfig, MaxOfRateLimiter, DEFAULT_BUCKET_BURST,
    DEFAULT_BUCKET_QPS,
};
use crate::{Error, FIELD_MANAGER};

/// Trait abstracting Job writes against the API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobClient: Send + Sync {
    /// Create a Job in the namespace set on its metadata
    async fn create(&self, job: &Job) -> Result<Job, Error>;
}

/// Trait abstracting reads from the locally synced Job cache
#[cfg_attr(test, automock)]
pub trait JobCache: Send + Sync {
    /// Look up a Job by namespace and name
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Job>>, Error>;
}

/// Trait abstracting reads from the locally synced Intent cache
///
/// Used to tell whether an event still speaks for a live Intent: an Intent
/// that was deleted, or deleted and recreated under the same name, no longer
/// owns the Jobs an older event refers to.
#[cfg_attr(test, automock)]
pub trait IntentCache: Send + Sync {
    /// Look up an Intent by namespace and name
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Intent>>, Error>;
}

/// Real Job client backed by the Kubernetes API
pub struct KubeJobClient {
    client: Client,
}

impl KubeJobClient {
    /// Create a new KubeJobClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobClient for KubeJobClient {
    async fn create(&self, job: &Job) -> Result<Job, Error> {
        let namespace = job
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::malformed("job has no namespace"))?;
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(api.create(&params, job).await?)
    }
}

/// Tuning knobs for the controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of parallel workers pulling from the queue
    pub workers: usize,
    /// Failed attempts retried before an event is dropped
    pub max_retries: u32,
    /// Base delay between completion checks of a Job that is still running
    pub completion_poll_interval: Duration,
    /// Upper bound on waiting for in-flight items after shutdown
    pub drain_timeout: Duration,
    /// Watch timeout (seconds); must stay below the client read timeout
    pub watch_timeout_secs: u32,
    /// Per-event backoff after failed attempts
    pub backoff: BackoffConfig,
    /// Refill rate of the retry token bucket shared by all events
    pub bucket_qps: f64,
    /// Capacity of the retry token bucket
    pub bucket_burst: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 3,
            completion_poll_interval: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
            watch_timeout_secs: 25,
            backoff: BackoffConfig::default(),
            bucket_qps: DEFAULT_BUCKET_QPS,
            bucket_burst: DEFAULT_BUCKET_BURST,
        }
    }
}

impl ControllerConfig {
    /// Rate limiter for retrying failed queue items
    pub fn rate_limiter<K>(&self) -> MaxOfRateLimiter<K>
    where
        K: Eq + std::hash::Hash + Clone + Send + 'static,
    {
        controller_rate_limiter(self.backoff.clone(), self.bucket_qps, self.bucket_burst)
    }
}

/// What the dispatcher should do after an event was handled successfully
#[derive(Debug)]
pub enum Action {
    /// Nothing further for this event
    Done,
    /// Queue a follow-up event
    Enqueue(Event),
    /// Check the same event again after the delay. Not counted as a failure.
    RequeueAfter(Duration),
}

/// Shared context for event handling
pub struct Context {
    /// Job writes (trait object for testability)
    pub jobs: Arc<dyn JobClient>,
    /// Job reads from the synced cache
    pub cache: Arc<dyn JobCache>,
    /// Intent reads from the synced cache
    pub intents: Arc<dyn IntentCache>,
    /// Controller tuning
    pub config: ControllerConfig,
}

impl Context {
    /// Create a context from a Job client and the two caches
    pub fn new(
        jobs: Arc<dyn JobClient>,
        cache: Arc<dyn JobCache>,
        intents: Arc<dyn IntentCache>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            jobs,
            cache,
            intents,
            config,
        }
    }

    /// Whether `intent` is still the live Intent under its name.
    ///
    /// False when it was deleted, or replaced by a new Intent with the same
    /// name (different uid).
    pub(crate) fn is_current(&self, intent: &Intent) -> Result<bool, Error> {
        let namespace = intent.namespace().unwrap_or_default();
        let current = self.intents.get(&namespace, &intent.name_any())?;
        Ok(current.is_some_and(|c| c.uid().is_some() && c.uid() == intent.uid()))
    }
}

#[async_trait]
impl EventHandler for Context {
    async fn handle(&self, event: &Event) -> Result<Action, Error> {
        match event {
            Event::IntentAdded(intent) => reconcile_intent(intent, self).await,
            Event::JobCompletionCheck { job, intent } => check_completion(job, intent, self).await,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use k8s_openapi::api::batch::v1::JobStatus;
    use kube::runtime::reflector::ObjectRef;
    use crate::queue::RateLimiter;

    #[test]
    fn default_config_matches_controller_contract() {
        let config = ControllerConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_retries, 3);
        assert!(config.watch_timeout_secs < 30);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_follows_config() {
        let config = ControllerConfig {
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(200),
                ..Default::default()
            },
            ..Default::default()
        };
        let limiter = config.rate_limiter::<String>();
        let key = "default/greet".to_string();

        assert_eq!(limiter.when(&key), Duration::from_millis(200));
        assert_eq!(limiter.when(&key), Duration::from_millis(400));
    }

    mod liveness {
        use super::*;

        #[test]
        fn live_intent_with_same_uid_is_current() {
            let ctx = context(MockJobClient::new(), MockJobCache::new());
            assert!(ctx.is_current(&sample_intent("greet", "hi")).unwrap());
        }

        #[test]
        fn deleted_or_recreated_intent_is_not_current() {
            let mut gone = MockIntentCache::new();
            gone.expect_get().returning(|_, _| Ok(None));
            let ctx = context_with_intents(MockJobClient::new(), MockJobCache::new(), gone);
            assert!(!ctx.is_current(&sample_intent("greet", "hi")).unwrap());

            let mut recreated = MockIntentCache::new();
            recreated.expect_get().returning(|_, name| {
                let mut intent = (*sample_intent(name, "hi")).clone();
                intent.metadata.uid = Some("new-uid".to_string());
                Ok(Some(Arc::new(intent)))
            });
            let ctx = context_with_intents(MockJobClient::new(), MockJobCache::new(), recreated);
            assert!(!ctx.is_current(&sample_intent("greet", "hi")).unwrap());
        }
    }

    #[tokio::test]
    async fn intent_events_are_routed_to_the_reconciler() {
        let mut cache = MockJobCache::new();
        cache.expect_get().returning(|_, _| Ok(None));
        let mut jobs = MockJobClient::new();
        jobs.expect_create().times(1).returning(|job| Ok(job.clone()));
        let ctx = context(jobs, cache);

        let action = ctx
            .handle(&Event::IntentAdded(sample_intent("greet", "hi")))
            .await
            .unwrap();
        assert!(matches!(action, Action::Enqueue(Event::JobCompletionCheck { .. })));
    }

    #[tokio::test]
    async fn completion_events_are_routed_to_the_watcher() {
        let mut cache = MockJobCache::new();
        cache.expect_get().returning(|_, _| {
            Ok(Some(parent_job(
                &sample_intent("greet", "hi"),
                Some(JobStatus {
                    failed: Some(1),
                    ..Default::default()
                }),
            )))
        });
        let mut jobs = MockJobClient::new();
        jobs.expect_create().never();
        let ctx = context(jobs, cache);

        let event = Event::completion_check(
            ObjectRef::new("greet").within("default"),
            sample_intent("greet", "hi"),
        );
        let err = ctx.handle(&event).await.unwrap_err();
        assert!(matches!(err, Error::ParentJobFailed { .. }));
    }
}
