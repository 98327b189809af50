//! The instrumentation policy document, as stored in the policy ConfigMap.
//!
//! These types only describe the wire format. Patterns are kept as raw strings
//! here; compiling and validating them is left to consumers.

use serde::{de, Deserialize, Deserializer};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Patterns as written in a service entry.
pub type Patterns = BTreeMap<String, PatternText>;

/// The text of a single pattern.
///
/// Any YAML scalar is read as its text, so `k8s_namespace: 2024` is the
/// pattern `2024`. An explicit null (`k8s_pod_name:` with no value) is `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PatternText(pub Option<String>);

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub discovery: Discovery,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Discovery {
    /// Ordered selection entries. Earlier entries take precedence.
    #[serde(default)]
    pub services: Vec<ServiceSelector>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ServiceSelector {
    #[serde(default)]
    pub name: Option<String>,

    /// Free text; never matched against live workloads.
    #[serde(default)]
    pub namespace: Option<String>,

    #[serde(default, alias = "pod_labels")]
    pub k8s_pod_labels: Option<Patterns>,

    /// Every other key in the entry. Only the keys named by [`MetadataKey`]
    /// are valid.
    #[serde(flatten)]
    pub metadata: Patterns,
}

/// The closed set of metadata attributes a selector may constrain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetadataKey {
    Namespace,
    PodName,
    DeploymentName,
    ReplicaSetName,
    DaemonSetName,
    StatefulSetName,
    CronJobName,
    JobName,
    /// The name of a pod's top-level owner, whatever its kind.
    OwnerName,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown attribute: {0}")]
pub struct UnknownMetadataKey(pub String);

// === impl PolicyDocument ===

impl PolicyDocument {
    /// Parses a YAML policy document. A blank document is an empty policy.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }
}

// === impl PatternText ===

impl From<&str> for PatternText {
    fn from(text: &str) -> Self {
        Self(Some(text.to_string()))
    }
}

impl<'de> Deserialize<'de> for PatternText {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl<'de> de::Visitor<'de> for Visitor {
            type Value = PatternText;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a scalar pattern")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                Ok(PatternText::from(v))
            }

            fn visit_string<E: de::Error>(self, v: String) -> Result<Self::Value, E> {
                Ok(PatternText(Some(v)))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(PatternText(Some(v.to_string())))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(PatternText(Some(v.to_string())))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(PatternText(Some(v.to_string())))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
                Ok(PatternText(Some(v.to_string())))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(PatternText(None))
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(PatternText(None))
            }

            fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Self::Value, D::Error> {
                d.deserialize_any(self)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

// === impl MetadataKey ===

impl MetadataKey {
    pub const ALL: [MetadataKey; 9] = [
        MetadataKey::Namespace,
        MetadataKey::PodName,
        MetadataKey::DeploymentName,
        MetadataKey::ReplicaSetName,
        MetadataKey::DaemonSetName,
        MetadataKey::StatefulSetName,
        MetadataKey::CronJobName,
        MetadataKey::JobName,
        MetadataKey::OwnerName,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Namespace => "k8s_namespace",
            Self::PodName => "k8s_pod_name",
            Self::DeploymentName => "k8s_deployment_name",
            Self::ReplicaSetName => "k8s_replicaset_name",
            Self::DaemonSetName => "k8s_daemonset_name",
            Self::StatefulSetName => "k8s_statefulset_name",
            Self::CronJobName => "k8s_cronjob_name",
            Self::JobName => "k8s_job_name",
            Self::OwnerName => "k8s_owner_name",
        }
    }

    /// Namespace and pod name identify a pod directly rather than through
    /// one of its controllers.
    pub fn is_identity(&self) -> bool {
        matches!(self, Self::Namespace | Self::PodName)
    }
}

impl FromStr for MetadataKey {
    type Err = UnknownMetadataKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownMetadataKey(s.to_string()))
    }
}

impl fmt::Display for MetadataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
