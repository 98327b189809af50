use crate::{
    k8s::{self, ControllerKind},
    restart::{Actuator, ControllerResource, Orchestrator},
};
use chrono::{DateTime, Utc};
use maplit::btreemap;
use parking_lot::Mutex;
use std::{collections::HashSet, sync::Arc};


/// An in-memory orchestrator that records every call.
#[derive(Clone, Default)]
pub struct FakeOrchestrator {
    state: Arc<Mutex<State>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListCall {
    pub kind: ControllerKind,
    pub namespace: String,
    pub exact_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatchCall {
    pub kind: ControllerKind,
    pub namespace: String,
    pub name: String,
    pub restarted_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    controllers: Vec<(String, ControllerResource)>,
    failing_lists: HashSet<ControllerKind>,
    failing_patches: HashSet<String>,
    hang: bool,
    lists: Vec<ListCall>,
    patches: Vec<PatchCall>,
}

// === impl FakeOrchestrator ===

impl FakeOrchestrator {
    pub fn with_controller(self, namespace: &str, kind: ControllerKind, name: &str) -> Self {
        self.with_labeled_controller(namespace, kind, name, &[])
    }

    pub fn with_labeled_controller(
        self,
        namespace: &str,
        kind: ControllerKind,
        name: &str,
        labels: &[(&str, &str)],
    ) -> Self {
        let template_labels = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<k8s::Labels>();
        self.state.lock().controllers.push((
            namespace.to_string(),
            ControllerResource {
                kind,
                name: name.to_string(),
                template_labels,
            },
        ));
        self
    }

    pub fn failing_list(self, kind: ControllerKind) -> Self {
        self.state.lock().failing_lists.insert(kind);
        self
    }

    pub fn failing_patch(self, name: &str) -> Self {
        self.state.lock().failing_patches.insert(name.to_string());
        self
    }

    /// Calls never complete.
    pub fn hanging(self) -> Self {
        self.state.lock().hang = true;
        self
    }

    pub fn lists(&self) -> Vec<ListCall> {
        self.state.lock().lists.clone()
    }

    pub fn patches(&self) -> Vec<PatchCall> {
        self.state.lock().patches.clone()
    }

    /// The names of every patched controller, sorted.
    pub fn patched_names(&self) -> Vec<String> {
        let mut names = self
            .patches()
            .into_iter()
            .map(|p| p.name)
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}

#[async_trait::async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn list_controllers(
        &self,
        kind: ControllerKind,
        namespace: &str,
        exact_name: Option<&str>,
    ) -> Result<Vec<ControllerResource>, kube::Error> {
        let result = {
            let mut state = self.state.lock();
            state.lists.push(ListCall {
                kind,
                namespace: namespace.to_string(),
                exact_name: exact_name.map(str::to_string),
            });
            if state.hang {
                None
            } else if state.failing_lists.contains(&kind) {
                Some(Err(api_error(500, "list failed")))
            } else {
                let controllers = state
                    .controllers
                    .iter()
                    .filter(|(ns, c)| {
                        ns == namespace
                            && c.kind == kind
                            && exact_name.map_or(true, |name| c.name == name)
                    })
                    .map(|(_, c)| c.clone())
                    .collect();
                Some(Ok(controllers))
            }
        };
        match result {
            Some(result) => result,
            None => futures::future::pending().await,
        }
    }

    async fn patch_restart(
        &self,
        kind: ControllerKind,
        namespace: &str,
        name: &str,
        restarted_at: DateTime<Utc>,
    ) -> Result<(), kube::Error> {
        let result = {
            let mut state = self.state.lock();
            state.patches.push(PatchCall {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
                restarted_at,
            });
            if state.hang {
                None
            } else if state.failing_patches.contains(name) {
                Some(Err(api_error(422, "patch rejected")))
            } else {
                Some(Ok(()))
            }
        };
        match result {
            Some(result) => result,
            None => futures::future::pending().await,
        }
    }
}

pub fn api_error(code: u16, message: &str) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "Invalid".to_string(),
        code,
    })
}

/// Builds an actuator over `orchestrator`. The returned signal must be held
/// until the test no longer needs the actuator.
pub fn actuator(orchestrator: FakeOrchestrator) -> (drain::Signal, Actuator<FakeOrchestrator>) {
    let (signal, watch) = drain::channel();
    (signal, Actuator::new(orchestrator, watch))
}

pub fn pod(namespace: &str, name: &str, owners: &[(&str, &str)]) -> k8s::Pod {
    k8s::Pod {
        metadata: k8s::ObjectMeta {
            namespace: Some(namespace.to_string()),
            name: Some(name.to_string()),
            owner_references: Some(
                owners
                    .iter()
                    .map(|(kind, name)| k8s::OwnerReference {
                        api_version: "apps/v1".to_string(),
                        kind: kind.to_string(),
                        name: name.to_string(),
                        uid: format!("{name}-uid"),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn config_map(yaml: &str) -> k8s::ConfigMap {
    k8s::ConfigMap {
        metadata: k8s::ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some("auto-instrumentation-config".to_string()),
            ..Default::default()
        },
        data: Some(btreemap! { "config.yaml".to_string() => yaml.to_string() }),
        ..Default::default()
    }
}
