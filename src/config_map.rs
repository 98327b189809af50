use crate::{
    k8s,
    policy::SharedPolicy,
    reconcile::{DynamicConfig, PolicyEvent, PolicyEvents, Reconciler, DEFAULT_CONFIG_KEY},
    restart::{Actuator, KubeOrchestrator},
};
use anyhow::Result;
use futures::prelude::*;
use kube::runtime::watcher::{self, watcher, Event};
use tokio::time;

/// Identifies the ConfigMap holding the policy document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigMapRef {
    pub namespace: String,
    pub name: String,
    /// The data key holding the YAML document.
    pub key: String,
}

/// Loads the policy from a watched ConfigMap.
pub struct ConfigMapLoader {
    client: k8s::Client,
    source: ConfigMapRef,
    reconciler: Reconciler<KubeOrchestrator>,
}

/// Limits the amount of time a watch can be idle before being reset.
///
/// Must be less than 295 or Kubernetes throws an error.
const WATCH_TIMEOUT_SECS: u32 = 290;

// === impl ConfigMapRef ===

impl Default for ConfigMapRef {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            name: "auto-instrumentation-config".to_string(),
            key: DEFAULT_CONFIG_KEY.to_string(),
        }
    }
}

// === impl ConfigMapLoader ===

impl ConfigMapLoader {
    pub fn new(
        client: k8s::Client,
        source: ConfigMapRef,
        actuator: Actuator<KubeOrchestrator>,
    ) -> Self {
        let reconciler = Reconciler::new(actuator).with_key(source.key.clone());
        Self {
            client,
            source,
            reconciler,
        }
    }

    pub fn policy(&self) -> SharedPolicy {
        self.reconciler.policy()
    }
}

#[async_trait::async_trait]
impl DynamicConfig for ConfigMapLoader {
    async fn subscribe(&self) -> Result<PolicyEvents> {
        let ConfigMapRef {
            namespace, name, ..
        } = &self.source;
        tracing::info!(%namespace, %name, "watching policy ConfigMap");

        let params = k8s::ListParams::default()
            .fields(&format!("metadata.name={name}"))
            .timeout(WATCH_TIMEOUT_SECS);
        let api = k8s::Api::<k8s::ConfigMap>::namespaced(self.client.clone(), namespace);
        let events = policy_events(watcher(api, params)).then(|event| async move {
            // The watch restarts on the next poll, so back off after errors.
            if let PolicyEvent::Error(_) = event {
                time::sleep(time::Duration::from_secs(1)).await;
            }
            event
        });
        Ok(events.boxed())
    }

    async fn reconcile(&self, event: PolicyEvent) {
        self.reconciler.reconcile(event).await
    }

    fn is_pod_enabled(&self, pod: &k8s::Pod) -> bool {
        self.reconciler.is_pod_enabled(pod)
    }
}

/// Maps a ConfigMap watch into policy events.
///
/// The first time the ConfigMap is seen it is `Created`; every later apply or
/// re-list is `Modified`.
fn policy_events<S>(watch: S) -> impl Stream<Item = PolicyEvent>
where
    S: Stream<Item = watcher::Result<Event<k8s::ConfigMap>>>,
{
    watch
        .scan(false, |seen, event| {
            let events = match event {
                Ok(Event::Applied(cm)) => vec![sighted(seen, cm)],
                Ok(Event::Deleted(cm)) => {
                    *seen = false;
                    vec![PolicyEvent::Deleted(cm)]
                }
                Ok(Event::Restarted(cms)) => {
                    if cms.is_empty() && *seen {
                        tracing::debug!("policy ConfigMap no longer exists");
                        *seen = false;
                    }
                    cms.into_iter().map(|cm| sighted(seen, cm)).collect()
                }
                Err(error) => vec![PolicyEvent::Error(error.to_string())],
            };
            future::ready(Some(stream::iter(events)))
        })
        .flatten()
}

fn sighted(seen: &mut bool, cm: k8s::ConfigMap) -> PolicyEvent {
    if std::mem::replace(seen, true) {
        PolicyEvent::Modified(cm)
    } else {
        PolicyEvent::Created(cm)
    }
}
