//! Job compilation from Intent specs
//!
//! Maps an Intent to the `batch/v1` Jobs the operator creates for it: the
//! parent Job named after the Intent, and the dependent Jobs fanned out once
//! the parent succeeds. Every Job is controller-owned by its Intent so that
//! deleting the Intent garbage-collects the Jobs.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::Intent;
use crate::Error;

/// Container image used by every Job
pub const JOB_IMAGE: &str = "busybox:1.33.1";

/// Number of dependent Jobs created when a parent Job succeeds
pub const FAN_OUT: usize = 5;

/// Label carrying the name of the owning Intent
pub const INTENT_LABEL: &str = "fanout.dev/intent";

/// Label distinguishing parent Jobs from dependents
pub const ROLE_LABEL: &str = "fanout.dev/role";

/// Lifecycle phase of a Job as observed from its status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobPhase {
    /// Created but no pod has started
    Pending,
    /// At least one pod is active
    Running,
    /// The Job completed successfully
    Succeeded,
    /// The Job failed
    Failed,
}

impl JobPhase {
    /// Derive the phase from a Job's status.
    ///
    /// Terminal conditions take precedence over counters; counters cover
    /// status written before the Job controller adds conditions.
    pub fn of(job: &Job) -> Self {
        let Some(status) = job.status.as_ref() else {
            return Self::Pending;
        };

        let condition = |type_: &str| {
            status
                .conditions
                .as_ref()
                .map(|conds| conds.iter().any(|c| c.type_ == type_ && c.status == "True"))
                .unwrap_or(false)
        };

        if condition("Complete") || status.succeeded.unwrap_or(0) >= 1 {
            Self::Succeeded
        } else if condition("Failed") || status.failed.unwrap_or(0) >= 1 {
            Self::Failed
        } else if status.active.unwrap_or(0) >= 1 {
            Self::Running
        } else {
            Self::Pending
        }
    }

    /// Returns true for Succeeded and Failed
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Name of the i-th dependent Job
pub fn dependent_job_name(index: usize) -> String {
    format!("dependent-job-{index}")
}

/// Compile the parent Job for an Intent (named identically to the Intent)
pub fn compile_parent_job(intent: &Intent) -> Result<Job, Error> {
    compile_job(intent, &intent.name_any(), "parent")
}

/// Compile the i-th dependent Job for an Intent
pub fn compile_dependent_job(intent: &Intent, index: usize) -> Result<Job, Error> {
    compile_job(intent, &dependent_job_name(index), "dependent")
}

fn compile_job(intent: &Intent, name: &str, role: &str) -> Result<Job, Error> {
    let intent_name = intent.name_any();
    let namespace = intent
        .namespace()
        .ok_or_else(|| Error::malformed(format!("intent {intent_name} has no namespace")))?;
    let owner = intent.controller_owner_ref(&()).ok_or_else(|| {
        Error::malformed(format!("intent {namespace}/{intent_name} has no uid"))
    })?;

    let labels = BTreeMap::from([
        (
            "app.kubernetes.io/managed-by".to_string(),
            "intent-operator".to_string(),
        ),
        (INTENT_LABEL.to_string(), intent_name.clone()),
        (ROLE_LABEL.to_string(), role.to_string()),
    ]);

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.clone()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    generate_name: Some(format!("{name}-")),
                    namespace: Some(namespace),
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.to_string(),
                        image: Some(JOB_IMAGE.to_string()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        command: Some(command_for(intent)),
                        ..Default::default()
                    }],
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

fn command_for(intent: &Intent) -> Vec<String> {
    if intent.spec.force_failure {
        vec!["sh".to_string(), "-c".to_string(), "exit 1".to_string()]
    } else {
        vec!["echo".to_string(), intent.spec.message.clone()]
    }
}

/// If `job` is the parent Job of an Intent, return the Intent's name.
///
/// A parent Job is controller-owned by an Intent and shares its name.
/// Dependent Jobs are owned by the Intent too but carry their own names.
pub fn parent_intent_name(job: &Job) -> Option<String> {
    let name = job.metadata.name.as_deref()?;
    job.owner_references()
        .iter()
        .find(|o| o.controller == Some(true) && o.kind == "Intent")
        .filter(|o| o.name == name)
        .map(|o| o.name.clone())
}

/// Uid of the Intent that controller-owns `job`, if any
pub fn controller_owner_uid(job: &Job) -> Option<&str> {
    job.owner_references()
        .iter()
        .find(|o| o.controller == Some(true) && o.kind == "Intent")
        .map(|o| o.uid.as_str())
}
