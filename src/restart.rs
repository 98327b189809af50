//! Restarts the workloads selected by a criterion.
//!
//! Workloads are restarted by patching a timestamp annotation onto their
//! controller's pod template, the same way `kubectl rollout restart` does.
//! Restarted pods are then admitted under the committed policy.

use crate::{
    criteria::{Criterion, RegexPattern},
    error::{ActuationError, ConvergeError},
    k8s::{self, ControllerKind, MetadataKey, ResourceExt},
};
use chrono::{DateTime, Utc};
use futures::prelude::*;
use serde::de::DeserializeOwned;
use std::{collections::BTreeSet, fmt::Debug};
use tracing::Instrument;

pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_MAX_CONCURRENT_RESTARTS: usize = 8;

const FIELD_MANAGER: &str = "auto-instrumentation-policy";

/// Kinds that roll their pods when the pod template changes. Criteria that
/// select by pod labels alone restart controllers of these kinds.
const ROLLOUT_KINDS: [ControllerKind; 3] = [
    ControllerKind::Deployment,
    ControllerKind::DaemonSet,
    ControllerKind::StatefulSet,
];

/// The orchestration API used to find and restart workload controllers.
#[async_trait::async_trait]
pub trait Orchestrator: Send + Sync {
    /// Lists the controllers of `kind` in `namespace`. When `exact_name` is
    /// set, only the controller with that name is returned.
    async fn list_controllers(
        &self,
        kind: ControllerKind,
        namespace: &str,
        exact_name: Option<&str>,
    ) -> Result<Vec<ControllerResource>, kube::Error>;

    /// Sets the restart annotation on a controller's pod template.
    async fn patch_restart(
        &self,
        kind: ControllerKind,
        namespace: &str,
        name: &str,
        restarted_at: DateTime<Utc>,
    ) -> Result<(), kube::Error>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControllerResource {
    pub kind: ControllerKind,
    pub name: String,
    /// Labels applied to the pods this controller creates.
    pub template_labels: k8s::Labels,
}

/// An [`Orchestrator`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: k8s::Client,
}

/// Converges criteria by restarting the controllers they select.
pub struct Actuator<O> {
    orchestrator: O,
    default_namespace: String,
    max_concurrent: usize,
    shutdown: drain::Watch,
}

/// A controller resource with a pod template.
trait Controller:
    kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static
{
    fn pod_template(&self) -> Option<&k8s::PodTemplateSpec>;
}

// === impl Actuator ===

impl<O: Orchestrator> Actuator<O> {
    pub fn new(orchestrator: O, shutdown: drain::Watch) -> Self {
        Self {
            orchestrator,
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            max_concurrent: DEFAULT_MAX_CONCURRENT_RESTARTS,
            shutdown,
        }
    }

    /// Sets the namespace targeted by criteria that don't constrain
    /// `k8s_namespace`.
    pub fn with_default_namespace(self, default_namespace: impl Into<String>) -> Self {
        Self {
            default_namespace: default_namespace.into(),
            ..self
        }
    }

    pub fn with_max_concurrent(self, max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            ..self
        }
    }

    /// Restarts every controller selected by `criterion`, returning the number
    /// of controllers restarted.
    ///
    /// A failure to list or patch one target does not prevent the others from
    /// being restarted.
    pub async fn converge(&self, criterion: &Criterion) -> Result<usize, ConvergeError> {
        if !criterion.pod_labels.is_empty() {
            // Pod labels are only compatible with constraints that identify
            // pods directly.
            if let Some((key, _)) = criterion.metadata_keys().find(|(k, _)| !k.is_identity()) {
                return Err(ConvergeError::MatchConfiguration { key });
            }
        }

        // An anchored literal like `^prod$` names the namespace `prod`.
        let namespace = criterion
            .get(MetadataKey::Namespace)
            .filter(|ns| ns.is_set())
            .map(|ns| ns.exact_name().unwrap_or_else(|| ns.as_str()))
            .unwrap_or(self.default_namespace.as_str());

        let (targets, mut failures) = self.targets(criterion, namespace).await;
        tracing::debug!(%namespace, targets = targets.len(), "found restart targets");
        if failures.iter().any(ActuationError::is_cancelled) {
            return Err(ConvergeError::Cancelled);
        }

        // Every target restarted by this pass carries the same timestamp.
        let restarted_at = Utc::now();
        let restarts = stream::iter(targets)
            .map(|(kind, name)| self.restart(kind, namespace, name, restarted_at))
            .buffer_unordered(self.max_concurrent)
            .collect::<Vec<_>>()
            .await;

        let mut restarted = 0;
        for result in restarts {
            match result {
                Ok(()) => restarted += 1,
                Err(error) => failures.push(error),
            }
        }

        if failures.iter().any(ActuationError::is_cancelled) {
            return Err(ConvergeError::Cancelled);
        }
        if !failures.is_empty() {
            return Err(ConvergeError::Targets(failures));
        }
        Ok(restarted)
    }

    /// Finds the controllers selected by `criterion` in `namespace`, ordered
    /// and without duplicates.
    async fn targets(
        &self,
        criterion: &Criterion,
        namespace: &str,
    ) -> (BTreeSet<(ControllerKind, String)>, Vec<ActuationError>) {
        let mut lookups = criterion
            .metadata_keys()
            .flat_map(|(key, pattern)| {
                kinds_named_by(key)
                    .iter()
                    .map(move |&kind| (kind, pattern.clone()))
            })
            .collect::<Vec<_>>();

        // Without a typed key, pod labels select controllers by their pod
        // templates.
        let by_labels = lookups.is_empty() && !criterion.pod_labels.is_empty();
        if by_labels {
            lookups = ROLLOUT_KINDS
                .iter()
                .map(|&kind| (kind, RegexPattern::unset()))
                .collect();
        }

        let mut targets = BTreeSet::new();
        let mut failures = Vec::new();
        for (kind, pattern) in lookups {
            match self.list(kind, namespace, &pattern).await {
                Ok(controllers) => targets.extend(
                    controllers
                        .into_iter()
                        .filter(|c| !by_labels || labels_match(criterion, &c.template_labels))
                        .map(|c| (c.kind, c.name)),
                ),
                Err(error) => failures.push(error),
            }
        }
        (targets, failures)
    }

    /// Lists the controllers of `kind` whose names match `pattern`.
    ///
    /// Field selectors can't express regular expressions, so names are always
    /// filtered here; the API server only filters anchored literal names.
    async fn list(
        &self,
        kind: ControllerKind,
        namespace: &str,
        pattern: &RegexPattern,
    ) -> Result<Vec<ControllerResource>, ActuationError> {
        let list = self
            .orchestrator
            .list_controllers(kind, namespace, pattern.exact_name());
        match self.cancelable(list).await {
            None => Err(ActuationError::Cancelled {
                kind,
                namespace: namespace.to_string(),
            }),
            Some(Err(source)) => Err(ActuationError::List {
                kind,
                namespace: namespace.to_string(),
                source,
            }),
            Some(Ok(controllers)) => Ok(controllers
                .into_iter()
                .filter(|c| pattern.is_match(&c.name))
                .collect()),
        }
    }

    async fn restart(
        &self,
        kind: ControllerKind,
        namespace: &str,
        name: String,
        restarted_at: DateTime<Utc>,
    ) -> Result<(), ActuationError> {
        let patch = self
            .orchestrator
            .patch_restart(kind, namespace, &name, restarted_at)
            .instrument(tracing::debug_span!("restart", %kind, %namespace, %name));
        let result = self.cancelable(patch).await;
        match result {
            None => Err(ActuationError::Cancelled {
                kind,
                namespace: namespace.to_string(),
            }),
            Some(Err(source)) => {
                tracing::warn!(%kind, %namespace, %name, error = %source, "failed to restart");
                Err(ActuationError::Patch {
                    kind,
                    namespace: namespace.to_string(),
                    name,
                    source,
                })
            }
            Some(Ok(())) => {
                tracing::info!(%kind, %namespace, %name, "restarted");
                Ok(())
            }
        }
    }

    /// Runs `fut` unless shutdown is signaled first.
    async fn cancelable<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.shutdown.clone().signaled() => None,
            output = fut => Some(output),
        }
    }
}

/// The controller kinds whose names a metadata key constrains.
fn kinds_named_by(key: MetadataKey) -> &'static [ControllerKind] {
    match key {
        MetadataKey::Namespace | MetadataKey::PodName => &[],
        MetadataKey::DeploymentName => &[ControllerKind::Deployment],
        MetadataKey::ReplicaSetName => &[ControllerKind::ReplicaSet],
        MetadataKey::DaemonSetName => &[ControllerKind::DaemonSet],
        MetadataKey::StatefulSetName => &[ControllerKind::StatefulSet],
        MetadataKey::CronJobName => &[ControllerKind::CronJob],
        MetadataKey::JobName => &[ControllerKind::Job],
        MetadataKey::OwnerName => &[
            ControllerKind::Deployment,
            ControllerKind::ReplicaSet,
            ControllerKind::DaemonSet,
            ControllerKind::StatefulSet,
        ],
    }
}

fn labels_match(criterion: &Criterion, labels: &k8s::Labels) -> bool {
    criterion
        .pod_labels
        .iter()
        .all(|(k, re)| labels.get(k).map_or(false, |v| re.is_match(v)))
}

/// Builds the strategic merge patch that restarts a controller's pods.
pub fn restart_patch(kind: ControllerKind, restarted_at: DateTime<Utc>) -> serde_json::Value {
    let mut annotations = serde_json::Map::new();
    annotations.insert(
        RESTARTED_AT_ANNOTATION.to_string(),
        restarted_at.to_rfc3339().into(),
    );
    let template = serde_json::json!({ "metadata": { "annotations": annotations } });
    match kind {
        ControllerKind::CronJob => serde_json::json!({
            "spec": { "jobTemplate": { "spec": { "template": template } } }
        }),
        _ => serde_json::json!({ "spec": { "template": template } }),
    }
}

// === impl KubeOrchestrator ===

impl KubeOrchestrator {
    pub fn new(client: k8s::Client) -> Self {
        Self { client }
    }

    async fn list<K: Controller>(
        &self,
        kind: ControllerKind,
        namespace: &str,
        exact_name: Option<&str>,
    ) -> Result<Vec<ControllerResource>, kube::Error> {
        let mut params = k8s::ListParams::default();
        if let Some(name) = exact_name {
            params = params.fields(&format!("metadata.name={name}"));
        }
        let api = k8s::Api::<K>::namespaced(self.client.clone(), namespace);
        let list = api.list(&params).await?;
        let controllers = list
            .items
            .into_iter()
            .filter_map(|resource| {
                let template_labels = resource
                    .pod_template()
                    .and_then(|t| t.metadata.as_ref())
                    .and_then(|m| m.labels.clone())
                    .unwrap_or_default();
                let name = resource.meta().name.clone()?;
                Some(ControllerResource {
                    kind,
                    name,
                    template_labels,
                })
            })
            .collect();
        Ok(controllers)
    }

    async fn patch<K: Controller>(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), kube::Error> {
        let params = k8s::PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let api = k8s::Api::<K>::namespaced(self.client.clone(), namespace);
        let patched = api
            .patch(name, &params, &k8s::Patch::Strategic(patch))
            .await?;
        tracing::trace!(resource_version = ?patched.resource_version(), "patched");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn list_controllers(
        &self,
        kind: ControllerKind,
        namespace: &str,
        exact_name: Option<&str>,
    ) -> Result<Vec<ControllerResource>, kube::Error> {
        match kind {
            ControllerKind::Deployment => {
                self.list::<k8s::Deployment>(kind, namespace, exact_name)
                    .await
            }
            ControllerKind::ReplicaSet => {
                self.list::<k8s::ReplicaSet>(kind, namespace, exact_name)
                    .await
            }
            ControllerKind::DaemonSet => {
                self.list::<k8s::DaemonSet>(kind, namespace, exact_name)
                    .await
            }
            ControllerKind::StatefulSet => {
                self.list::<k8s::StatefulSet>(kind, namespace, exact_name)
                    .await
            }
            ControllerKind::CronJob => self.list::<k8s::CronJob>(kind, namespace, exact_name).await,
            ControllerKind::Job => self.list::<k8s::Job>(kind, namespace, exact_name).await,
        }
    }

    async fn patch_restart(
        &self,
        kind: ControllerKind,
        namespace: &str,
        name: &str,
        restarted_at: DateTime<Utc>,
    ) -> Result<(), kube::Error> {
        let patch = restart_patch(kind, restarted_at);
        match kind {
            ControllerKind::Deployment => self.patch::<k8s::Deployment>(namespace, name, patch).await,
            ControllerKind::ReplicaSet => self.patch::<k8s::ReplicaSet>(namespace, name, patch).await,
            ControllerKind::DaemonSet => self.patch::<k8s::DaemonSet>(namespace, name, patch).await,
            ControllerKind::StatefulSet => {
                self.patch::<k8s::StatefulSet>(namespace, name, patch)
                    .await
            }
            ControllerKind::CronJob => self.patch::<k8s::CronJob>(namespace, name, patch).await,
            ControllerKind::Job => self.patch::<k8s::Job>(namespace, name, patch).await,
        }
    }
}

// === impl Controller ===

impl Controller for k8s::Deployment {
    fn pod_template(&self) -> Option<&k8s::PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
}

impl Controller for k8s::ReplicaSet {
    fn pod_template(&self) -> Option<&k8s::PodTemplateSpec> {
        self.spec.as_ref()?.template.as_ref()
    }
}

impl Controller for k8s::DaemonSet {
    fn pod_template(&self) -> Option<&k8s::PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
}

impl Controller for k8s::StatefulSet {
    fn pod_template(&self) -> Option<&k8s::PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
}

impl Controller for k8s::CronJob {
    fn pod_template(&self) -> Option<&k8s::PodTemplateSpec> {
        let job = self.spec.as_ref()?.job_template.spec.as_ref()?;
        Some(&job.template)
    }
}

impl Controller for k8s::Job {
    fn pod_template(&self) -> Option<&k8s::PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn patches_pod_template() {
        let at = Utc.ymd(2024, 5, 1).and_hms(12, 30, 0);
        assert_eq!(
            restart_patch(ControllerKind::Deployment, at),
            serde_json::json!({
                "spec": { "template": { "metadata": { "annotations": {
                    "kubectl.kubernetes.io/restartedAt": "2024-05-01T12:30:00+00:00"
                } } } }
            })
        );
    }

    #[test]
    fn patches_cronjob_job_template() {
        let at = Utc.ymd(2024, 5, 1).and_hms(12, 30, 0);
        assert_eq!(
            restart_patch(ControllerKind::CronJob, at),
            serde_json::json!({
                "spec": { "jobTemplate": { "spec": { "template": { "metadata": { "annotations": {
                    "kubectl.kubernetes.io/restartedAt": "2024-05-01T12:30:00+00:00"
                } } } } } }
            })
        );
    }

    #[test]
    fn owner_name_covers_rollout_kinds() {
        let kinds = kinds_named_by(MetadataKey::OwnerName);
        for kind in ROLLOUT_KINDS {
            assert!(kinds.contains(&kind), "{kind}");
        }
        assert!(kinds_named_by(MetadataKey::Namespace).is_empty());
        assert!(kinds_named_by(MetadataKey::PodName).is_empty());
        assert_eq!(
            kinds_named_by(MetadataKey::CronJobName),
            &[ControllerKind::CronJob]
        );
    }
}
