//! Attribute name registry with weight maintenance.
//!
//! Weights give attribute ids a total order consistent with the
//! lexicographic order of their names. New names are inserted by binary
//! search and take the midpoint of their neighbors' weights; when the local
//! gap is exhausted a full renumbering pass re-spaces everything.

use std::collections::HashMap;

use shapedb_types::AttributeId;

use crate::UNKNOWN_ATTRIBUTE_WEIGHT;

/// Spacing between weights after a (re)numbering pass. Large enough that
/// midpoint insertion almost never triggers renumbering in practice.
const WEIGHT_GAP: i64 = 1 << 20;

#[derive(Debug, Default)]
pub(crate) struct AttributeRegistry {
    by_name: HashMap<String, AttributeId>,
    by_id: HashMap<AttributeId, String>,
    weights: HashMap<AttributeId, i64>,
    /// All known names sorted lexicographically, the ground truth for
    /// weight assignment.
    ordered: Vec<(String, AttributeId)>,
    next_aid: u64,
}

impl AttributeRegistry {
    pub(crate) fn lookup_id(&self, name: &str) -> Option<AttributeId> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn lookup_name(&self, aid: AttributeId) -> Option<&str> {
        self.by_id.get(&aid).map(String::as_str)
    }

    pub(crate) fn lookup_weight(&self, aid: AttributeId) -> i64 {
        self.weights
            .get(&aid)
            .copied()
            .unwrap_or(UNKNOWN_ATTRIBUTE_WEIGHT)
    }

    pub(crate) fn len(&self) -> usize {
        self.ordered.len()
    }

    /// The aid that would be assigned to the next new attribute.
    pub(crate) fn peek_next_aid(&self) -> AttributeId {
        AttributeId(self.next_aid + 1)
    }

    /// Insert a new name with a freshly assigned aid. The caller has already
    /// checked absence and durably persisted the definition marker.
    pub(crate) fn insert_new(&mut self, name: &str) -> AttributeId {
        self.next_aid += 1;
        let aid = AttributeId(self.next_aid);
        self.insert_entry(name, aid);
        aid
    }

    /// Re-insert a persisted attribute during datafile replay, preserving
    /// its original aid.
    pub(crate) fn insert_replayed(&mut self, aid: AttributeId, name: &str) {
        if aid.get() > self.next_aid {
            self.next_aid = aid.get();
        }
        self.insert_entry(name, aid);
    }

    fn insert_entry(&mut self, name: &str, aid: AttributeId) {
        let pos = match self
            .ordered
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
        {
            Ok(pos) | Err(pos) => pos,
        };
        self.ordered.insert(pos, (name.to_owned(), aid));
        self.by_name.insert(name.to_owned(), aid);
        self.by_id.insert(aid, name.to_owned());
        self.assign_weight(pos, aid);
    }

    /// Give the entry at `pos` a weight between its neighbors, renumbering
    /// everything when no gap is left.
    fn assign_weight(&mut self, pos: usize, aid: AttributeId) {
        let left = pos
            .checked_sub(1)
            .and_then(|p| self.ordered.get(p))
            .map(|(_, a)| self.weights[a]);
        let right = self.ordered.get(pos + 1).map(|(_, a)| self.weights[a]);

        let weight = match (left, right) {
            (None, None) => 0,
            (Some(l), None) => l.saturating_add(WEIGHT_GAP),
            (None, Some(r)) => r.saturating_sub(WEIGHT_GAP),
            (Some(l), Some(r)) => {
                let mid = l + (r - l) / 2;
                if mid == l {
                    self.renumber();
                    return;
                }
                mid
            }
        };
        self.weights.insert(aid, weight);
    }

    /// Full renumbering pass: re-space every weight at `WEIGHT_GAP`
    /// intervals in name order. O(n), amortized by the gap size.
    fn renumber(&mut self) {
        tracing::debug!(count = self.ordered.len(), "renumbering attribute weights");
        for (index, (_, aid)) in self.ordered.iter().enumerate() {
            #[allow(clippy::cast_possible_wrap)]
            self.weights.insert(*aid, index as i64 * WEIGHT_GAP);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn weights_follow_name_order(reg: &AttributeRegistry) -> bool {
        reg.ordered
            .windows(2)
            .all(|w| reg.lookup_weight(w[0].1) < reg.lookup_weight(w[1].1))
    }

    #[test]
    fn weights_track_lexicographic_order() {
        let mut reg = AttributeRegistry::default();
        let m = reg.insert_new("m");
        let a = reg.insert_new("a");
        let z = reg.insert_new("z");
        let b = reg.insert_new("b");

        assert!(reg.lookup_weight(a) < reg.lookup_weight(b));
        assert!(reg.lookup_weight(b) < reg.lookup_weight(m));
        assert!(reg.lookup_weight(m) < reg.lookup_weight(z));
    }

    #[test]
    fn unknown_aid_sorts_first() {
        let reg = AttributeRegistry::default();
        assert_eq!(
            reg.lookup_weight(AttributeId(999)),
            UNKNOWN_ATTRIBUTE_WEIGHT
        );
    }

    #[test]
    fn replay_preserves_aid() {
        let mut reg = AttributeRegistry::default();
        reg.insert_replayed(AttributeId(7), "x");
        assert_eq!(reg.lookup_id("x"), Some(AttributeId(7)));
        // The next fresh aid must skip past the replayed one.
        let fresh = reg.insert_new("y");
        assert_eq!(fresh, AttributeId(8));
    }

    #[test]
    fn adjacent_insertions_force_renumbering() {
        let mut reg = AttributeRegistry::default();
        reg.insert_new("a");
        reg.insert_new("b");
        // Repeatedly bisect the ("a", "b") gap until a renumbering pass has
        // to fire; the order property must survive it.
        let mut name = String::from("a");
        for _ in 0..64 {
            name.push('a');
            reg.insert_new(&name);
            assert!(weights_follow_name_order(&reg));
        }
    }

    proptest! {
        #[test]
        fn weight_totality(names in proptest::collection::hash_set("[a-z]{1,8}", 1..40)) {
            let mut reg = AttributeRegistry::default();
            let mut pairs = Vec::new();
            for name in &names {
                pairs.push((name.clone(), reg.insert_new(name)));
            }
            // name1 < name2 <=> weight(aid1) < weight(aid2)
            for (n1, a1) in &pairs {
                for (n2, a2) in &pairs {
                    prop_assert_eq!(
                        n1 < n2,
                        reg.lookup_weight(*a1) < reg.lookup_weight(*a2)
                    );
                }
            }
        }
    }
}
