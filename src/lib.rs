#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use auto_instrumentation_policy_k8s_api as k8s;

mod config_map;
pub mod criteria;
mod diff;
mod error;
mod matcher;
pub mod pod;
mod policy;
mod reconcile;
pub mod restart;

#[cfg(test)]
mod tests;

pub use self::{
    config_map::{ConfigMapLoader, ConfigMapRef},
    criteria::{Criterion, Policy, RegexPattern},
    diff::{diff, Diff},
    error::{ActuationError, ConvergeError, ParseError, ReloadError, ValidationError},
    matcher::matches,
    pod::AttributeSnapshot,
    policy::SharedPolicy,
    reconcile::{run, ChannelConfig, DynamicConfig, PolicyEvent, PolicyEvents, Reconciled, Reconciler},
    restart::{Actuator, KubeOrchestrator, Orchestrator},
};
