use crate::{
    criteria::{Criterion, Policy},
    k8s::MetadataKey,
    pod::AttributeSnapshot,
};

/// Returns true if `attrs` satisfies `criterion`. An absent criterion selects
/// everything.
pub fn matches(attrs: &AttributeSnapshot, criterion: Option<&Criterion>) -> bool {
    criterion.map_or(true, |c| c.matches(attrs))
}

// === impl Criterion ===

impl Criterion {
    /// Every metadata and pod label constraint must be satisfied. A constraint
    /// on an attribute the workload does not have never matches.
    pub fn matches(&self, attrs: &AttributeSnapshot) -> bool {
        for (key, pattern) in &self.metadata {
            let value = key
                .parse::<MetadataKey>()
                .ok()
                .and_then(|key| attrs.get(key));
            match value {
                Some(value) if pattern.is_match(value) => {}
                _ => return false,
            }
        }

        for (label, pattern) in &self.pod_labels {
            match attrs.labels.get(label) {
                Some(value) if pattern.is_match(value) => {}
                _ => return false,
            }
        }

        true
    }
}

// === impl Policy ===

impl Policy {
    /// Returns true if any criterion selects `attrs`.
    pub fn is_in_scope(&self, attrs: &AttributeSnapshot) -> bool {
        self.matching(attrs).is_some()
    }

    /// Returns the first criterion that selects `attrs`.
    pub fn matching(&self, attrs: &AttributeSnapshot) -> Option<&Criterion> {
        self.services.iter().find(|c| c.matches(attrs))
    }
}
