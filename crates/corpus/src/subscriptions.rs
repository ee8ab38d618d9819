//! Subscription resolution: user list names → attribute indices.
//!
//! Names resolve through the registry's alias table; unknown names are
//! collected and surfaced, never silently dropped and never fabricated into
//! attributes. Both encodings are supported: equivalence-set ids for the
//! filterlist encoding, compressed rule bitsets for the rule encoding.

use crate::provenance::EquivalenceSet;
use crate::registry::Registry;
use crate::CorpusError;
use common::bitset;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

fn default_valid() -> bool {
    true
}

/// Raw user row: an opaque id and the list names the user reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub user_id: String,
    #[serde(default = "default_valid")]
    pub valid: bool,
    #[serde(default)]
    pub filters: Vec<String>,
}

/// Filterlist-encoding output: the equivalence-set ids the user is flagged
/// for, ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedUser {
    pub user_id: String,
    pub sets: Vec<u32>,
}

/// Rule-encoding output: hex-encoded compressed rule bitset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRules {
    pub user_id: String,
    pub rules: String,
}

/// Per-list rule incidence in the same column form, the input for the
/// filterlist-aware targeted variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRules {
    pub list: String,
    pub rules: String,
}

#[derive(Debug, Default)]
pub struct SetResolution {
    pub users: Vec<ResolvedUser>,
    pub bad_names: BTreeSet<String>,
}

/// Resolves each valid user to equivalence-set ids: a user is flagged for a
/// set iff the set's list ids intersect the user's resolved list ids.
pub fn resolve_to_sets(
    subscriptions: &[SubscriptionRecord],
    registry: &Registry,
    sets: &[EquivalenceSet],
) -> SetResolution {
    let mut resolution = SetResolution::default();

    for record in subscriptions {
        if !record.valid {
            continue;
        }
        let user_lists = resolve_names(record, registry, &mut resolution.bad_names);

        let mut flagged = Vec::new();
        for (i, set) in sets.iter().enumerate() {
            if set.lists.iter().any(|l| user_lists.contains(l)) {
                flagged.push(i as u32);
            }
        }
        resolution.users.push(ResolvedUser {
            user_id: record.user_id.clone(),
            sets: flagged,
        });
    }
    resolution
}

/// Dense rule-id assignment in first-seen order across the allowed rules of
/// every list, plus each list's rules as ids.
#[derive(Debug, Default)]
pub struct RuleIdAssignment {
    pub rule_ids: BTreeMap<String, u32>,
    pub per_list: Vec<Vec<u32>>,
}

impl RuleIdAssignment {
    pub fn n_rules(&self) -> usize {
        self.rule_ids.len()
    }
}

pub fn assign_rule_ids(allowed: &[Vec<String>]) -> RuleIdAssignment {
    let mut next: HashMap<&str, u32> = HashMap::new();
    let mut assignment = RuleIdAssignment::default();

    for list in allowed {
        let mut ids = Vec::with_capacity(list.len());
        for rule in list {
            let id = match next.get(rule.as_str()) {
                Some(&id) => id,
                None => {
                    let id = next.len() as u32;
                    next.insert(rule, id);
                    assignment.rule_ids.insert(rule.clone(), id);
                    id
                }
            };
            ids.push(id);
        }
        assignment.per_list.push(ids);
    }
    assignment
}

#[derive(Debug, Default)]
pub struct RuleResolution {
    pub users: Vec<UserRules>,
    pub bad_names: BTreeSet<String>,
}

/// Expands each valid user to the union of their lists' rule ids, encoded
/// as a compressed bitset. Users with no resolvable list still get a row:
/// an all-false row, so user ids line up across encodings.
pub fn expand_to_rules(
    subscriptions: &[SubscriptionRecord],
    registry: &Registry,
    per_list: &[Vec<u32>],
    n_rules: usize,
) -> Result<RuleResolution, CorpusError> {
    let mut resolution = RuleResolution::default();

    for record in subscriptions {
        if !record.valid {
            continue;
        }
        let user_lists = resolve_names(record, registry, &mut resolution.bad_names);

        let mut rule_set: BTreeSet<u32> = BTreeSet::new();
        for &list in &user_lists {
            rule_set.extend(&per_list[list as usize]);
        }
        let indices: Vec<u32> = rule_set.into_iter().collect();
        resolution.users.push(UserRules {
            user_id: record.user_id.clone(),
            rules: bitset::encode_hex(&indices, n_rules)?,
        });
    }
    Ok(resolution)
}

/// Encodes each list's allowed rules as a compressed bitset column.
pub fn encode_list_rules(
    registry: &Registry,
    per_list: &[Vec<u32>],
    n_rules: usize,
) -> Result<Vec<ListRules>, CorpusError> {
    per_list
        .iter()
        .enumerate()
        .map(|(i, ids)| {
            Ok(ListRules {
                list: registry.name(i).to_string(),
                rules: bitset::encode_hex(ids, n_rules)?,
            })
        })
        .collect()
}

fn resolve_names(
    record: &SubscriptionRecord,
    registry: &Registry,
    bad_names: &mut BTreeSet<String>,
) -> HashSet<u32> {
    let mut lists = HashSet::new();
    for name in &record.filters {
        match registry.resolve(name) {
            Some(index) => {
                lists.insert(index as u32);
            }
            None => {
                bad_names.insert(name.clone());
            }
        }
    }
    lists
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FilterlistDef;

    fn registry() -> Registry {
        Registry::new(vec![
            FilterlistDef {
                name: "F0".into(),
                aliases: vec!["zero".into()],
                version_control: None,
            },
            FilterlistDef {
                name: "F1".into(),
                aliases: vec![],
                version_control: None,
            },
        ])
    }

    fn record(user_id: &str, filters: &[&str]) -> SubscriptionRecord {
        SubscriptionRecord {
            user_id: user_id.into(),
            valid: true,
            filters: filters.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn sets() -> Vec<EquivalenceSet> {
        vec![
            EquivalenceSet {
                lists: vec![0, 1],
                rules: vec!["shared".into()],
            },
            EquivalenceSet {
                lists: vec![1],
                rules: vec!["only-f1".into()],
            },
        ]
    }

    #[test]
    fn test_resolve_intersection_semantics() {
        let resolution = resolve_to_sets(&[record("u0", &["F0"])], &registry(), &sets());
        // F0 intersects set 0 ({0,1}) but not set 1 ({1}).
        assert_eq!(resolution.users[0].sets, vec![0]);

        let resolution = resolve_to_sets(&[record("u1", &["F1"])], &registry(), &sets());
        assert_eq!(resolution.users[0].sets, vec![0, 1]);
    }

    #[test]
    fn test_alias_resolution() {
        let resolution = resolve_to_sets(&[record("u0", &["zero"])], &registry(), &sets());
        assert_eq!(resolution.users[0].sets, vec![0]);
        assert!(resolution.bad_names.is_empty());
    }

    #[test]
    fn test_bad_names_collected_not_fabricated() {
        let resolution = resolve_to_sets(
            &[record("u0", &["F0", "No Such List"])],
            &registry(),
            &sets(),
        );
        assert_eq!(resolution.users[0].sets, vec![0]);
        assert!(resolution.bad_names.contains("No Such List"));
    }

    #[test]
    fn test_invalid_rows_skipped() {
        let mut invalid = record("u0", &["F0"]);
        invalid.valid = false;
        let resolution = resolve_to_sets(&[invalid], &registry(), &sets());
        assert!(resolution.users.is_empty());
    }

    #[test]
    fn test_rule_id_assignment_first_seen() {
        let allowed = vec![
            vec!["a".to_string(), "b".to_string()],
            vec!["b".to_string(), "c".to_string()],
        ];
        let assignment = assign_rule_ids(&allowed);
        assert_eq!(assignment.n_rules(), 3);
        assert_eq!(assignment.per_list, vec![vec![0, 1], vec![1, 2]]);
        assert_eq!(assignment.rule_ids["a"], 0);
        assert_eq!(assignment.rule_ids["c"], 2);
    }

    #[test]
    fn test_expand_to_rules_union() {
        let assignment = assign_rule_ids(&[
            vec!["a".to_string(), "b".to_string()],
            vec!["b".to_string(), "c".to_string()],
        ]);
        let resolution = expand_to_rules(
            &[record("u0", &["F0", "F1"]), record("u1", &["bogus"])],
            &registry(),
            &assignment.per_list,
            assignment.n_rules(),
        )
        .unwrap();

        let decoded = bitset::decode_hex(
            &resolution.users[0].rules,
            3,
            bitset::DecodeMode::Indices,
        )
        .unwrap()
        .into_indices();
        assert_eq!(decoded, vec![0, 1, 2]);

        // The unresolvable user still gets an all-false row.
        let empty = bitset::decode_hex(
            &resolution.users[1].rules,
            3,
            bitset::DecodeMode::Indices,
        )
        .unwrap()
        .into_indices();
        assert!(empty.is_empty());
        assert!(resolution.bad_names.contains("bogus"));
    }
}
