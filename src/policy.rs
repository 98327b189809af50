use crate::{criteria::Policy, pod::AttributeSnapshot};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// A handle to the committed policy.
///
/// Readers take a point-in-time snapshot; commits replace the whole policy, so
/// a reader never observes a mix of two policies.
#[derive(Clone, Debug)]
pub struct SharedPolicy {
    state: Arc<RwLock<State>>,
}

#[derive(Debug)]
struct State {
    policy: Arc<Policy>,
    changed: Instant,
}

// === impl SharedPolicy ===

impl Default for SharedPolicy {
    fn default() -> Self {
        Self::new(Policy::default())
    }
}

impl SharedPolicy {
    pub fn new(policy: Policy) -> Self {
        Self {
            state: Arc::new(RwLock::new(State {
                policy: Arc::new(policy),
                changed: Instant::now(),
            })),
        }
    }

    pub fn snapshot(&self) -> Arc<Policy> {
        self.state.read().policy.clone()
    }

    pub fn is_in_scope(&self, attrs: &AttributeSnapshot) -> bool {
        self.snapshot().is_in_scope(attrs)
    }

    /// Replaces the committed policy, returning the previous one.
    pub(crate) fn commit(&self, policy: Arc<Policy>) -> Arc<Policy> {
        let mut state = self.state.write();
        state.changed = Instant::now();
        std::mem::replace(&mut state.policy, policy)
    }

    /// Spawns a task that prints the committed policy every time it changes.
    pub fn dump(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        tracing::debug!(?every, "dumping policy changes");
        let state = self.state.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            let mut last_changed = None;
            loop {
                interval.tick().await;
                let (policy, changed) = {
                    let state = state.read();
                    (state.policy.clone(), state.changed)
                };
                if last_changed != Some(changed) {
                    println!("{}", table(&policy));
                    last_changed = Some(changed);
                }
            }
        })
    }
}

fn table(policy: &Policy) -> comfy_table::Table {
    use comfy_table::{presets::UTF8_FULL, *};

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(Row::from(vec!["NAME", "NAMESPACE", "METADATA", "POD LABELS"]));
    for criterion in &policy.services {
        let metadata = criterion
            .metadata
            .iter()
            .map(|(k, re)| format!("{k}: {re}"))
            .collect::<Vec<_>>()
            .join("\n");
        let labels = criterion
            .pod_labels
            .iter()
            .map(|(k, re)| format!("{k}: {re}"))
            .collect::<Vec<_>>()
            .join("\n");
        table.add_row(Row::from(vec![
            Cell::new(criterion.display_name()),
            Cell::new(criterion.namespace.as_deref().unwrap_or("")),
            Cell::new(metadata),
            Cell::new(labels),
        ]));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::MetadataKey;

    #[test]
    fn commit_swaps_snapshots() {
        let shared = SharedPolicy::default();
        let before = shared.snapshot();
        assert!(before.is_empty());

        let policy = Policy::load(
            r#"
discovery:
  services:
    - k8s_namespace: "^prod$"
"#,
        )
        .unwrap();
        let prior = shared.commit(Arc::new(policy));
        assert!(Arc::ptr_eq(&prior, &before));

        // Snapshots taken before the commit are unaffected.
        let attrs = [(MetadataKey::Namespace, "prod")]
            .into_iter()
            .collect::<AttributeSnapshot>();
        assert!(!before.is_in_scope(&attrs));
        assert!(shared.is_in_scope(&attrs));
        assert!(shared.clone().is_in_scope(&attrs));
    }

    #[test]
    fn renders_table() {
        let policy = Policy::load(
            r#"
discovery:
  services:
    - name: web
      k8s_pod_labels:
        app: "^web$"
"#,
        )
        .unwrap();
        let rendered = table(&policy).to_string();
        assert!(rendered.contains("POD LABELS"), "{rendered}");
        assert!(rendered.contains("app: ^web$"), "{rendered}");
    }
}
