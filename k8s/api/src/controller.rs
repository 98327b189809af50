use crate::MetadataKey;
use std::fmt;

/// The workload controller kinds that own pods and carry a pod template that
/// can be patched to trigger a rollout.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControllerKind {
    Deployment,
    ReplicaSet,
    DaemonSet,
    StatefulSet,
    CronJob,
    Job,
}

// === impl ControllerKind ===

impl ControllerKind {
    pub const ALL: [ControllerKind; 6] = [
        ControllerKind::Deployment,
        ControllerKind::ReplicaSet,
        ControllerKind::DaemonSet,
        ControllerKind::StatefulSet,
        ControllerKind::CronJob,
        ControllerKind::Job,
    ];

    /// Resolves an owner reference's `kind` to a recognized controller kind.
    ///
    /// Kinds are compared exactly, as they appear in `ownerReferences`.
    pub fn from_owner_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::ReplicaSet => "ReplicaSet",
            Self::DaemonSet => "DaemonSet",
            Self::StatefulSet => "StatefulSet",
            Self::CronJob => "CronJob",
            Self::Job => "Job",
        }
    }

    /// The metadata key that holds the name of an owner of this kind.
    pub fn name_key(&self) -> MetadataKey {
        match self {
            Self::Deployment => MetadataKey::DeploymentName,
            Self::ReplicaSet => MetadataKey::ReplicaSetName,
            Self::DaemonSet => MetadataKey::DaemonSetName,
            Self::StatefulSet => MetadataKey::StatefulSetName,
            Self::CronJob => MetadataKey::CronJobName,
            Self::Job => MetadataKey::JobName,
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
