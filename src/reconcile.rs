use crate::{
    criteria::{Criterion, Policy},
    diff::{diff, Diff},
    error::{ConvergeError, ReloadError},
    k8s,
    pod::AttributeSnapshot,
    policy::SharedPolicy,
    restart::{Actuator, Orchestrator},
};
use anyhow::{bail, Result};
use futures::{prelude::*, stream::BoxStream};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::Instrument;

/// The ConfigMap data key holding the policy document.
pub const DEFAULT_CONFIG_KEY: &str = "config.yaml";

/// A change to the policy ConfigMap.
#[derive(Clone, Debug)]
pub enum PolicyEvent {
    Created(k8s::ConfigMap),
    Modified(k8s::ConfigMap),
    Deleted(k8s::ConfigMap),
    Error(String),
}

pub type PolicyEvents = BoxStream<'static, PolicyEvent>;

/// A source of policy changes that also answers whether pods are in scope.
#[async_trait::async_trait]
pub trait DynamicConfig: Send + Sync {
    /// Opens the stream of policy change events.
    async fn subscribe(&self) -> Result<PolicyEvents>;

    /// Applies a single change event.
    async fn reconcile(&self, event: PolicyEvent);

    fn is_pod_enabled(&self, pod: &k8s::Pod) -> bool;
}

/// Commits policy reloads and converges the workloads they affect.
///
/// Reloads are handled one at a time.
pub struct Reconciler<O> {
    policy: SharedPolicy,
    actuator: Actuator<O>,
    key: String,
    lock: tokio::sync::Mutex<()>,
}

/// The outcome of a committed reload.
#[derive(Debug, Default)]
pub struct Reconciled {
    pub diff: Diff,
    /// The number of controllers restarted.
    pub restarted: usize,
    /// Criteria whose workloads could not all be restarted.
    pub failed: Vec<(Criterion, ConvergeError)>,
}

/// A [`DynamicConfig`] fed by a channel.
pub struct ChannelConfig<O> {
    rx: parking_lot::Mutex<Option<mpsc::Receiver<PolicyEvent>>>,
    reconciler: Reconciler<O>,
}

/// Drives `config`'s subscription until the stream ends or shutdown is
/// signaled.
pub async fn run<C: DynamicConfig>(config: C, shutdown: drain::Watch) -> Result<()> {
    let mut events = config.subscribe().await?;

    let shutdown = shutdown.signaled();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                tracing::debug!("shutdown");
                return Ok(());
            }

            event = events.next() => match event {
                Some(event) => config.reconcile(event).await,
                None => {
                    tracing::debug!("policy events ended");
                    return Ok(());
                }
            },
        }
    }
}

// === impl Reconciler ===

impl<O: Orchestrator> Reconciler<O> {
    pub fn new(actuator: Actuator<O>) -> Self {
        Self {
            policy: SharedPolicy::default(),
            actuator,
            key: DEFAULT_CONFIG_KEY.to_string(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Sets the ConfigMap data key the policy is read from.
    pub fn with_key(self, key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..self
        }
    }

    /// Returns a handle to the committed policy.
    pub fn policy(&self) -> SharedPolicy {
        self.policy.clone()
    }

    /// Handles a change event. Only modifications reload the policy; for every
    /// other event, `None` is returned.
    pub async fn handle(&self, event: PolicyEvent) -> Option<Result<Reconciled, ReloadError>> {
        match event {
            PolicyEvent::Modified(cm) => {
                let text = cm
                    .data
                    .as_ref()
                    .and_then(|data| data.get(&self.key))
                    .map(String::as_str)
                    .unwrap_or_default();
                let span = tracing::info_span!(
                    "reload",
                    namespace = ?cm.metadata.namespace,
                    name = ?cm.metadata.name
                );
                Some(self.reload(text).instrument(span).await)
            }
            PolicyEvent::Created(cm) => {
                tracing::info!(name = ?cm.metadata.name, "policy ConfigMap created");
                None
            }
            PolicyEvent::Deleted(cm) => {
                tracing::info!(name = ?cm.metadata.name, "policy ConfigMap deleted");
                None
            }
            PolicyEvent::Error(error) => {
                tracing::warn!(%error, "policy watch failed");
                None
            }
        }
    }

    /// Handles a change event, logging the outcome.
    pub async fn reconcile(&self, event: PolicyEvent) {
        match self.handle(event).await {
            None => {}
            Some(Ok(reconciled)) => tracing::info!(
                removed = reconciled.diff.removed.len(),
                added = reconciled.diff.added.len(),
                restarted = reconciled.restarted,
                failed = reconciled.failed.len(),
                "policy reloaded"
            ),
            Some(Err(error)) => tracing::warn!(%error, "policy reload rejected"),
        }
    }

    /// Loads, validates, and commits a policy document, then restarts the
    /// workloads of every criterion that was removed or added.
    ///
    /// The policy is committed before any workload restarts. Convergence
    /// failures are reported in the result and never undo the commit.
    pub async fn reload(&self, text: &str) -> Result<Reconciled, ReloadError> {
        let _guard = self.lock.lock().await;

        let policy = Arc::new(Policy::load(text)?);
        let old = self.policy.commit(policy.clone());
        let diff = diff(&old, &policy);
        tracing::debug!(
            removed = diff.removed.len(),
            added = diff.added.len(),
            "committed policy"
        );

        let mut restarted = 0;
        let mut failed = Vec::new();
        for criterion in diff.affected() {
            let span = tracing::info_span!("converge", criterion = %criterion.display_name());
            match self.actuator.converge(criterion).instrument(span).await {
                Ok(n) => restarted += n,
                Err(ConvergeError::Cancelled) => {
                    tracing::debug!("convergence cancelled");
                    failed.push((criterion.clone(), ConvergeError::Cancelled));
                    break;
                }
                Err(error) => {
                    tracing::warn!(criterion = %criterion.display_name(), %error, "failed to converge");
                    failed.push((criterion.clone(), error));
                }
            }
        }

        Ok(Reconciled {
            diff,
            restarted,
            failed,
        })
    }

    pub fn is_pod_enabled(&self, pod: &k8s::Pod) -> bool {
        self.policy.is_in_scope(&AttributeSnapshot::from_pod(pod))
    }
}

// === impl ChannelConfig ===

impl<O: Orchestrator> ChannelConfig<O> {
    pub fn new(reconciler: Reconciler<O>, capacity: usize) -> (mpsc::Sender<PolicyEvent>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        let config = Self {
            rx: parking_lot::Mutex::new(Some(rx)),
            reconciler,
        };
        (tx, config)
    }

    pub fn policy(&self) -> SharedPolicy {
        self.reconciler.policy()
    }
}

#[async_trait::async_trait]
impl<O: Orchestrator> DynamicConfig for ChannelConfig<O> {
    async fn subscribe(&self) -> Result<PolicyEvents> {
        let rx = self.rx.lock().take();
        let rx = match rx {
            Some(rx) => rx,
            None => bail!("policy events may only be subscribed once"),
        };
        Ok(tokio_stream::wrappers::ReceiverStream::new(rx).boxed())
    }

    async fn reconcile(&self, event: PolicyEvent) {
        self.reconciler.reconcile(event).await
    }

    fn is_pod_enabled(&self, pod: &k8s::Pod) -> bool {
        self.reconciler.is_pod_enabled(pod)
    }
}
