//! Intent Custom Resource Definition
//!
//! An Intent declares a message that should be echoed by a Job. The operator
//! only reads Intents; users or other systems create and update them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for an Intent
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "fanout.dev",
    version = "v1alpha1",
    kind = "Intent",
    plural = "intents",
    shortname = "int",
    namespaced,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".spec.message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IntentSpec {
    /// Message echoed by the Job created for this Intent
    #[serde(default)]
    pub message: String,

    /// Run a command that always exits non-zero instead of echoing.
    /// Used to exercise the failure path end to end.
    #[serde(default)]
    pub force_failure: bool,
}
