use crate::k8s::{self, ControllerKind, MetadataKey};
use ahash::AHashMap;

/// The attributes of a single workload, as seen by the matcher.
///
/// Built fresh for each query and never stored.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttributeSnapshot {
    pub metadata: AHashMap<MetadataKey, String>,
    /// The workload's labels, copied verbatim.
    pub labels: k8s::Labels,
}

// === impl AttributeSnapshot ===

impl AttributeSnapshot {
    pub fn from_pod(pod: &k8s::Pod) -> Self {
        Self::from_metadata(&pod.metadata)
    }

    /// Derives the attributes of any workload from its object metadata.
    ///
    /// The owner name is the last (outermost) owner reference, or the
    /// workload's own name when it has no owners. Each direct owner of a
    /// recognized controller kind also sets that kind's name key; other
    /// owner kinds are ignored.
    pub fn from_metadata(meta: &k8s::ObjectMeta) -> Self {
        let name = meta.name.clone().unwrap_or_default();
        let owners = meta.owner_references.as_deref().unwrap_or_default();
        let owner_name = owners
            .last()
            .map(|owner| owner.name.clone())
            .unwrap_or_else(|| name.clone());

        let mut metadata = AHashMap::with_capacity(3 + owners.len());
        metadata.insert(
            MetadataKey::Namespace,
            meta.namespace.clone().unwrap_or_default(),
        );
        metadata.insert(MetadataKey::PodName, name);
        metadata.insert(MetadataKey::OwnerName, owner_name);

        // A pod may have several owners, e.g. a ReplicaSet and a Deployment.
        for owner in owners {
            if let Some(kind) = ControllerKind::from_owner_kind(&owner.kind) {
                metadata.insert(kind.name_key(), owner.name.clone());
            }
        }

        Self {
            metadata,
            labels: meta.labels.clone().unwrap_or_default(),
        }
    }

    pub fn get(&self, key: MetadataKey) -> Option<&str> {
        self.metadata.get(&key).map(String::as_str)
    }
}

impl<K, V> FromIterator<(K, V)> for AttributeSnapshot
where
    K: Into<MetadataKey>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            metadata: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            labels: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::{ObjectMeta, OwnerReference};
    use maplit::btreemap;

    fn owner(kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("{name}-uid"),
            ..Default::default()
        }
    }

    fn pod(owners: Option<Vec<OwnerReference>>) -> k8s::Pod {
        k8s::Pod {
            metadata: ObjectMeta {
                namespace: Some("shop".to_string()),
                name: Some("checkout-7d9f-abcde".to_string()),
                labels: Some(btreemap! {
                    "app".to_string() => "checkout".to_string(),
                }),
                owner_references: owners,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn pod_without_owners() {
        let attrs = AttributeSnapshot::from_pod(&pod(None));
        assert_eq!(attrs.get(MetadataKey::Namespace), Some("shop"));
        assert_eq!(attrs.get(MetadataKey::PodName), Some("checkout-7d9f-abcde"));
        assert_eq!(
            attrs.get(MetadataKey::OwnerName),
            Some("checkout-7d9f-abcde")
        );
        assert_eq!(attrs.get(MetadataKey::DeploymentName), None);
        assert_eq!(
            attrs.labels,
            btreemap! { "app".to_string() => "checkout".to_string() }
        );
    }

    #[test]
    fn owner_chain() {
        let attrs = AttributeSnapshot::from_pod(&pod(Some(vec![
            owner("ReplicaSet", "checkout-7d9f"),
            owner("Deployment", "checkout"),
        ])));
        assert_eq!(attrs.get(MetadataKey::OwnerName), Some("checkout"));
        assert_eq!(
            attrs.get(MetadataKey::ReplicaSetName),
            Some("checkout-7d9f")
        );
        assert_eq!(attrs.get(MetadataKey::DeploymentName), Some("checkout"));
    }

    #[test]
    fn unrecognized_owner_kinds() {
        let attrs = AttributeSnapshot::from_pod(&pod(Some(vec![
            owner("StatefulSet", "db"),
            owner("Rollout", "db-rollout"),
        ])));
        // The outermost owner names the pod, whatever its kind.
        assert_eq!(attrs.get(MetadataKey::OwnerName), Some("db-rollout"));
        assert_eq!(attrs.get(MetadataKey::StatefulSetName), Some("db"));
        assert_eq!(attrs.metadata.len(), 4);
    }
}
