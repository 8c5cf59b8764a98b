use fnv::FnvHashMap;
use smol_str::SmolStr;
use std::collections::BTreeSet;

/// Entity ids ordered by a caller-supplied rank, so the lowest ranked id is found in O(log n).
///
/// Used to pick which entity to evict once a per-entity map reaches its cap.
#[derive(Debug)]
pub(crate) struct RecencyIndex<Rank> {
    ranks: FnvHashMap<SmolStr, Rank>,
    order: BTreeSet<(Rank, SmolStr)>,
}

impl<Rank> Default for RecencyIndex<Rank> {
    fn default() -> Self {
        Self {
            ranks: FnvHashMap::default(),
            order: BTreeSet::new(),
        }
    }
}

impl<Rank> RecencyIndex<Rank>
where
    Rank: Ord + Clone,
{
    /// Insert `entity_id`, or move it to `rank`.
    pub(crate) fn touch(&mut self, entity_id: &SmolStr, rank: Rank) {
        match self.ranks.get_mut(entity_id) {
            Some(current) if *current == rank => {}
            Some(current) => {
                let previous = std::mem::replace(current, rank.clone());
                self.order.remove(&(previous, entity_id.clone()));
                self.order.insert((rank, entity_id.clone()));
            }
            None => {
                self.ranks.insert(entity_id.clone(), rank.clone());
                self.order.insert((rank, entity_id.clone()));
            }
        }
    }

    pub(crate) fn remove(&mut self, entity_id: &str) -> bool {
        let Some((entity_id, rank)) = self.ranks.remove_entry(entity_id) else {
            return false;
        };
        self.order.remove(&(rank, entity_id));
        true
    }

    /// Remove and return the lowest ranked entity.
    pub(crate) fn pop_lowest(&mut self) -> Option<SmolStr> {
        let (_, entity_id) = self.order.pop_first()?;
        self.ranks.remove(&entity_id);
        Some(entity_id)
    }

    pub(crate) fn clear(&mut self) {
        self.ranks.clear();
        self.order.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.ranks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_lowest() {
        struct TestCase {
            touches: Vec<(&'static str, u32)>,
            removed: Vec<&'static str>,
            expected: Vec<&'static str>,
        }

        let tests = vec![
            TestCase {
                // TC0: empty index
                touches: vec![],
                removed: vec![],
                expected: vec![],
            },
            TestCase {
                // TC1: ordered by rank, not insertion
                touches: vec![("c", 3), ("a", 1), ("b", 2)],
                removed: vec![],
                expected: vec!["a", "b", "c"],
            },
            TestCase {
                // TC2: touching again moves an entity
                touches: vec![("a", 1), ("b", 2), ("a", 5)],
                removed: vec![],
                expected: vec!["b", "a"],
            },
            TestCase {
                // TC3: equal ranks fall back to the id
                touches: vec![("b", 1), ("a", 1)],
                removed: vec![],
                expected: vec!["a", "b"],
            },
            TestCase {
                // TC4: removed entities are never popped
                touches: vec![("a", 1), ("b", 2), ("c", 3)],
                removed: vec!["a", "missing"],
                expected: vec!["b", "c"],
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let mut recency = RecencyIndex::default();
            for (entity_id, rank) in test.touches {
                recency.touch(&SmolStr::new(entity_id), rank);
            }
            for entity_id in test.removed {
                recency.remove(entity_id);
            }
            assert_eq!(recency.len(), test.expected.len(), "TC{} failed", index);

            let actual: Vec<SmolStr> = std::iter::from_fn(|| recency.pop_lowest()).collect();
            assert_eq!(actual, test.expected, "TC{} failed", index);
            assert_eq!(recency.len(), 0, "TC{} failed", index);
        }
    }

    #[test]
    fn test_clear() {
        let mut recency = RecencyIndex::default();
        recency.touch(&SmolStr::new("a"), 1);
        recency.clear();

        assert_eq!(recency.len(), 0);
        assert!(!recency.remove("a"));
        assert_eq!(recency.pop_lowest(), None);
    }
}
