//! Rule provenance and equivalence-set reduction.
//!
//! Two rules carried by exactly the same filterlists are indistinguishable
//! to an attacker working from filterlist-level signals, so they collapse
//! into one attribute. The reduction typically shrinks the universe by one
//! to two orders of magnitude.

use std::collections::HashMap;

/// Rule → sorted indices of the lists containing it. Duplicates within a
/// single list count once; insertion order of rules is preserved for
/// deterministic downstream grouping.
#[derive(Debug, Default)]
pub struct ProvenanceIndex {
    rules: Vec<String>,
    provenance: Vec<Vec<u32>>,
    by_rule: HashMap<String, usize>,
}

impl ProvenanceIndex {
    /// Builds the index over per-list rule collections.
    pub fn build(lists: &[Vec<String>]) -> Self {
        let mut index = Self::default();
        for (i, list) in lists.iter().enumerate() {
            for rule in list {
                let slot = match index.by_rule.get(rule) {
                    Some(&slot) => slot,
                    None => {
                        index.by_rule.insert(rule.clone(), index.rules.len());
                        index.rules.push(rule.clone());
                        index.provenance.push(Vec::new());
                        index.rules.len() - 1
                    }
                };
                // Lists are visited in ascending order, so a repeat within
                // the same list is always the current tail entry.
                if index.provenance[slot].last() != Some(&(i as u32)) {
                    index.provenance[slot].push(i as u32);
                }
            }
        }
        index
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn provenance(&self, rule: &str) -> Option<&[u32]> {
        self.by_rule.get(rule).map(|&i| self.provenance[i].as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u32])> {
        self.rules
            .iter()
            .zip(&self.provenance)
            .map(|(r, p)| (r.as_str(), p.as_slice()))
    }
}

/// A maximal group of rules with identical provenance. The dense attribute
/// id of a set is its position in the reduction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquivalenceSet {
    /// Sorted ids of the lists carrying every rule in the set.
    pub lists: Vec<u32>,
    /// Member rules, in first-seen order.
    pub rules: Vec<String>,
}

/// Groups rules by provenance key, preserving first-seen order.
pub fn reduce(index: &ProvenanceIndex) -> Vec<EquivalenceSet> {
    let mut sets: Vec<EquivalenceSet> = Vec::new();
    let mut by_key: HashMap<Vec<u32>, usize> = HashMap::new();

    for (rule, provenance) in index.iter() {
        match by_key.get(provenance) {
            Some(&slot) => sets[slot].rules.push(rule.to_string()),
            None => {
                by_key.insert(provenance.to_vec(), sets.len());
                sets.push(EquivalenceSet {
                    lists: provenance.to_vec(),
                    rules: vec![rule.to_string()],
                });
            }
        }
    }
    sets
}

/// Rules appearing in exactly one list, grouped per list.
pub fn unique_rules(index: &ProvenanceIndex, n_lists: usize) -> Vec<Vec<String>> {
    let mut unique = vec![Vec::new(); n_lists];
    for (rule, provenance) in index.iter() {
        if let [only] = provenance {
            unique[*only as usize].push(rule.to_string());
        }
    }
    unique
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lists(raw: &[&[&str]]) -> Vec<Vec<String>> {
        raw.iter()
            .map(|l| l.iter().map(|r| r.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_provenance_basic() {
        let index = ProvenanceIndex::build(&lists(&[&["r0", "r1"], &["r1", "r2"]]));
        assert_eq!(index.provenance("r0"), Some(&[0u32][..]));
        assert_eq!(index.provenance("r1"), Some(&[0u32, 1][..]));
        assert_eq!(index.provenance("r2"), Some(&[1u32][..]));
        assert_eq!(index.provenance("r3"), None);
    }

    #[test]
    fn test_duplicates_within_list_count_once() {
        let index = ProvenanceIndex::build(&lists(&[&["r0", "r0", "r0"]]));
        assert_eq!(index.provenance("r0"), Some(&[0u32][..]));
    }

    #[test]
    fn test_no_empty_provenance() {
        let index = ProvenanceIndex::build(&lists(&[&["r0"], &[], &["r1"]]));
        for (_, provenance) in index.iter() {
            assert!(!provenance.is_empty());
        }
    }

    #[test]
    fn test_reduction_partitions_rule_universe() {
        let input = lists(&[&["r0", "r1", "r2"], &["r1", "r2", "r3"], &["r3"]]);
        let index = ProvenanceIndex::build(&input);
        let sets = reduce(&index);

        // Every rule lands in exactly one set, and the union is the universe.
        let mut seen = std::collections::HashSet::new();
        for set in &sets {
            for rule in &set.rules {
                assert!(seen.insert(rule.clone()), "rule {rule} in two sets");
            }
        }
        assert_eq!(seen.len(), index.len());

        // Same set ⇔ same provenance.
        for set in &sets {
            for rule in &set.rules {
                assert_eq!(index.provenance(rule), Some(set.lists.as_slice()));
            }
        }
    }

    #[test]
    fn test_equivalence_collapse() {
        // Both lists carry r0; only the second carries r1. Two sets, and a
        // subscriber of list 1 alone is separable by the {1}-only attribute.
        let index = ProvenanceIndex::build(&lists(&[&["r0"], &["r0", "r1"]]));
        let sets = reduce(&index);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].lists, vec![0, 1]);
        assert_eq!(sets[0].rules, vec!["r0"]);
        assert_eq!(sets[1].lists, vec![1]);
        assert_eq!(sets[1].rules, vec!["r1"]);
    }

    #[test]
    fn test_first_seen_order_is_deterministic() {
        let input = lists(&[&["b", "a"], &["c"]]);
        let sets = reduce(&ProvenanceIndex::build(&input));
        assert_eq!(sets[0].rules, vec!["b", "a"]);
        assert_eq!(sets[1].rules, vec!["c"]);
    }

    #[test]
    fn test_unique_rules() {
        let index = ProvenanceIndex::build(&lists(&[&["r0", "shared"], &["shared", "r1"]]));
        let unique = unique_rules(&index, 2);
        assert_eq!(unique[0], vec!["r0"]);
        assert_eq!(unique[1], vec!["r1"]);
    }

    #[test]
    fn test_whitespace_variants_stay_distinct() {
        // The reducer does not canonicalize beyond what ingestion provided.
        let index = ProvenanceIndex::build(&lists(&[&["r0", "r0 "]]));
        assert_eq!(index.len(), 2);
    }
}
