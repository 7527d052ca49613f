//! Custom Resource Definitions for the intent operator

mod intent;

pub use intent::{Intent, IntentSpec};
