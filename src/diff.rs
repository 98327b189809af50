use crate::criteria::{Criterion, Policy};

/// The criteria that differ between two policies.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Diff {
    /// Criteria in the old policy with no equal counterpart in the new one.
    pub removed: Vec<Criterion>,
    /// Criteria in the new policy with no equal counterpart in the old one.
    pub added: Vec<Criterion>,
}

/// Computes the set difference between two policies' criteria.
///
/// Order is ignored; reordering criteria yields an empty diff. Criteria are
/// compared structurally, with patterns compared by source text.
pub fn diff(old: &Policy, new: &Policy) -> Diff {
    fn missing_from<'a>(
        from: &'a [Criterion],
        other: &'a [Criterion],
    ) -> impl Iterator<Item = &'a Criterion> {
        from.iter().filter(move |c| !other.contains(c))
    }

    Diff {
        removed: missing_from(&old.services, &new.services)
            .cloned()
            .collect(),
        added: missing_from(&new.services, &old.services)
            .cloned()
            .collect(),
    }
}

// === impl Diff ===

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }

    /// Iterates over every criterion whose workloads must converge: removed
    /// criteria first, then added ones.
    pub fn affected(&self) -> impl Iterator<Item = &Criterion> {
        self.removed.iter().chain(self.added.iter())
    }
}
