use crate::k8s::{ControllerKind, MetadataKey};

/// The policy document could not be read.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("error unmarshaling YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid regular expression {pattern:?} in {key}: {source}")]
    Regex {
        key: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// The policy document is well-formed but describes an invalid policy.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("discovery.services[{index}] should define at least one selection criteria")]
    NoSelector { index: usize },

    #[error("unknown attribute in discovery.services[{index}]: {key}")]
    UnknownAttribute { index: usize, key: String },
}

/// A reload was rejected; the previously committed policy remains in effect.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("error loading policy: {0}")]
    Parse(#[from] ParseError),

    #[error("error validating policy: {0}")]
    Validation(#[from] ValidationError),
}

/// A single criterion could not be converged.
#[derive(Debug, thiserror::Error)]
pub enum ConvergeError {
    #[error("pod labels are not compatible with {key} when restarting workloads")]
    MatchConfiguration { key: MetadataKey },

    #[error("{} restart target(s) failed", .0.len())]
    Targets(Vec<ActuationError>),

    #[error("convergence was cancelled")]
    Cancelled,
}

/// An orchestration API call failed for one target.
#[derive(Debug, thiserror::Error)]
pub enum ActuationError {
    #[error("failed to list {kind}s in {namespace}: {source}")]
    List {
        kind: ControllerKind,
        namespace: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to restart {kind} {namespace}/{name}: {source}")]
    Patch {
        kind: ControllerKind,
        namespace: String,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("request for {kind}s in {namespace} was cancelled")]
    Cancelled {
        kind: ControllerKind,
        namespace: String,
    },
}

// === impl ActuationError ===

impl ActuationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
