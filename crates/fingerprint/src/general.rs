//! General (population-wide) fingerprinting.
//!
//! Greedily grows an attribute set of size ≤ k that maximizes partitioning
//! of the population into equivalence classes. The seed is the attribute
//! closest to a half-population split; each subsequent pick maximizes the
//! pairwise separation score `Σ_C o·(|C|−o)` — the exact number of
//! still-joined user pairs the attribute would separate.
//!
//! Two forms are kept: the set-based reference over the adjacency lists and
//! the dense form over packed matrices. They must agree; the tests hold
//! them to that.

use crate::prepare::AttrIndex;
use common::bits;
use common::matrix::MatrixView;
use std::collections::HashSet;

/// Result of a general fingerprinting run: the selected attributes in
/// selection order, the induced classes (each ascending), and the last
/// separation score the greedy achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneralOutcome {
    pub mask: Vec<u32>,
    pub classes: Vec<Vec<u32>>,
    pub best_metric: u64,
}

/// Set-based form over the attribute adjacency.
pub fn partition_sets(index: &AttrIndex, k: usize) -> GeneralOutcome {
    let n = index.n_users();
    let m = index.n_attrs();
    if n == 0 {
        return GeneralOutcome::default();
    }
    if m == 0 || k == 0 {
        return GeneralOutcome {
            mask: Vec::new(),
            classes: vec![(0..n as u32).collect()],
            best_metric: 0,
        };
    }
    let k = k.min(m);

    // Seed: attribute with user count closest to n/2.
    let mut seed = 0usize;
    let mut seed_score = f64::NEG_INFINITY;
    for (a, users) in index.attr_users.iter().enumerate() {
        let score = -((n as f64) / 2.0 - users.len() as f64).abs();
        if score > seed_score {
            seed_score = score;
            seed = a;
        }
    }

    let member: HashSet<u32> = index.attr_users[seed].iter().copied().collect();
    let class_has: Vec<u32> = index.attr_users[seed].clone();
    let class_lacks: Vec<u32> = (0..n as u32).filter(|u| !member.contains(u)).collect();
    let mut classes: Vec<Vec<u32>> = [class_has, class_lacks]
        .into_iter()
        .filter(|c| !c.is_empty())
        .collect();

    let mut mask: Vec<u32> = vec![seed as u32];
    let mut sig_set: HashSet<u32> = mask.iter().copied().collect();
    let mut best_metric = 0u64;

    while mask.len() < k && classes.len() < n {
        let mut metric = vec![0u64; m];
        for class in &classes {
            if class.len() < 2 {
                continue;
            }
            let mut occurrence: std::collections::HashMap<u32, u64> =
                std::collections::HashMap::new();
            for &u in class {
                for &a in &index.users[u as usize] {
                    if !sig_set.contains(&a) {
                        *occurrence.entry(a).or_insert(0) += 1;
                    }
                }
            }
            for (a, o) in occurrence {
                metric[a as usize] += o * (class.len() as u64 - o);
            }
        }

        let (best_attr, best) = argmax(&metric);
        best_metric = best;
        if best == 0 {
            break;
        }

        let member: HashSet<u32> = index.attr_users[best_attr].iter().copied().collect();
        classes = split_classes(classes, |u| member.contains(&u));
        mask.push(best_attr as u32);
        sig_set.insert(best_attr as u32);
    }

    GeneralOutcome {
        mask,
        classes,
        best_metric,
    }
}

/// Dense form over packed matrices.
pub fn partition_dense(user_attrs: &MatrixView<'_>, attr_users: &MatrixView<'_>, k: usize) -> GeneralOutcome {
    let n = user_attrs.rows();
    let m = user_attrs.cols();
    if n == 0 {
        return GeneralOutcome::default();
    }
    if m == 0 || k == 0 {
        return GeneralOutcome {
            mask: Vec::new(),
            classes: vec![(0..n as u32).collect()],
            best_metric: 0,
        };
    }
    let k = k.min(m);

    let mut seed = 0usize;
    let mut seed_score = f64::NEG_INFINITY;
    for a in 0..m {
        let score = -((n as f64) / 2.0 - attr_users.row_count_ones(a) as f64).abs();
        if score > seed_score {
            seed_score = score;
            seed = a;
        }
    }

    let seed_row = attr_users.row(seed);
    let class_has = seed_row.to_vec();
    let mut class_lacks = bits::filled(n);
    bits::andnot_in_place(&mut class_lacks, seed_row);
    let mut classes: Vec<Vec<u8>> = [class_has, class_lacks]
        .into_iter()
        .filter(|c| bits::count_ones(c) > 0)
        .collect();

    let mut mask: Vec<u32> = vec![seed as u32];
    let mut in_mask = vec![false; m];
    in_mask[seed] = true;
    let mut best_metric = 0u64;

    while mask.len() < k && classes.len() < n {
        let mut metric = vec![0u64; m];
        for class in &classes {
            let size = bits::count_ones(class);
            if size < 2 {
                continue;
            }
            for (a, slot) in metric.iter_mut().enumerate() {
                if in_mask[a] {
                    continue;
                }
                let o = bits::and_count(attr_users.row(a), class);
                *slot += o * (size - o);
            }
        }

        let (best_attr, best) = argmax(&metric);
        best_metric = best;
        if best == 0 {
            break;
        }

        let best_row = attr_users.row(best_attr);
        let mut next: Vec<Vec<u8>> = Vec::with_capacity(classes.len() * 2);
        for class in classes {
            let mut has = class.clone();
            bits::and_in_place(&mut has, best_row);
            let mut lacks = class;
            bits::andnot_in_place(&mut lacks, best_row);
            if bits::count_ones(&has) > 0 && bits::count_ones(&lacks) > 0 {
                next.push(lacks);
                next.push(has);
            } else if bits::count_ones(&has) > 0 {
                next.push(has);
            } else {
                next.push(lacks);
            }
        }
        classes = next;
        mask.push(best_attr as u32);
        in_mask[best_attr] = true;
    }

    GeneralOutcome {
        mask,
        classes: classes
            .iter()
            .map(|c| bits::iter_ones(c, n).collect())
            .collect(),
        best_metric,
    }
}

/// Lowest index wins ties.
fn argmax(metric: &[u64]) -> (usize, u64) {
    let mut best = 0usize;
    let mut best_value = 0u64;
    for (a, &value) in metric.iter().enumerate() {
        if value > best_value {
            best_value = value;
            best = a;
        }
    }
    (best, best_value)
}

fn split_classes<F: Fn(u32) -> bool>(classes: Vec<Vec<u32>>, has_attr: F) -> Vec<Vec<u32>> {
    let mut next = Vec::with_capacity(classes.len() * 2);
    for class in classes {
        let (has, lacks): (Vec<u32>, Vec<u32>) = class.into_iter().partition(|&u| has_attr(u));
        if !has.is_empty() && !lacks.is_empty() {
            next.push(lacks);
            next.push(has);
        } else if !has.is_empty() {
            next.push(has);
        } else {
            next.push(lacks);
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prepare::{index_attributes, matrix_from_index};
    use common::matrix::MatrixStore;

    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x.wrapping_mul(0x2545_f491_4f6c_dd1d)
        }
    }

    fn sorted_classes(mut classes: Vec<Vec<u32>>) -> Vec<Vec<u32>> {
        for c in &mut classes {
            c.sort_unstable();
        }
        classes.sort();
        classes
    }

    #[test]
    fn test_three_disjoint_users_fully_separate() {
        let index = index_attributes(&[vec![0], vec![1], vec![2]]);
        let outcome = partition_sets(&index, 2);
        assert_eq!(outcome.mask.len(), 2);
        assert_eq!(outcome.classes.len(), 3);
        for class in &outcome.classes {
            assert_eq!(class.len(), 1);
        }
        let stats = crate::stats::anon_stats(outcome.mask.len(), &outcome.classes, 3);
        assert!((stats.anon_set_entropy - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_mask_bound_and_class_bound() {
        let mut rng = XorShift(0xbead);
        let resolved: Vec<Vec<u32>> = (0..25)
            .map(|_| (0..30u32).filter(|_| rng.next() % 3 == 0).collect())
            .collect();
        let index = index_attributes(&resolved);

        for k in 1..8 {
            let outcome = partition_sets(&index, k);
            assert!(outcome.mask.len() <= k);
            assert!(outcome.classes.len() <= 1usize << outcome.mask.len().min(20));
            assert!(outcome.classes.len() <= index.n_users());

            // Classes partition the population.
            let all: Vec<u32> = {
                let mut users: Vec<u32> =
                    outcome.classes.iter().flatten().copied().collect();
                users.sort_unstable();
                users
            };
            assert_eq!(all, (0..index.n_users() as u32).collect::<Vec<u32>>());
        }
    }

    #[test]
    fn test_classes_are_equivalence_classes_under_mask() {
        let mut rng = XorShift(0xdead);
        let resolved: Vec<Vec<u32>> = (0..20)
            .map(|_| (0..15u32).filter(|_| rng.next() % 2 == 0).collect())
            .collect();
        let index = index_attributes(&resolved);
        let outcome = partition_sets(&index, 6);

        let signature = |u: u32| -> Vec<bool> {
            outcome
                .mask
                .iter()
                .map(|a| index.users[u as usize].contains(a))
                .collect()
        };
        for class in &outcome.classes {
            let first = signature(class[0]);
            for &u in class {
                assert_eq!(signature(u), first);
            }
        }
        // Distinct classes have distinct signatures.
        let mut seen = HashSet::new();
        for class in &outcome.classes {
            assert!(seen.insert(signature(class[0])));
        }
    }

    #[test]
    fn test_set_and_dense_forms_agree() {
        let mut rng = XorShift(0xfade);
        let resolved: Vec<Vec<u32>> = (0..24)
            .map(|_| (0..20u32).filter(|_| rng.next() % 3 == 0).collect())
            .collect();
        let index = index_attributes(&resolved);
        let store = MatrixStore::build(matrix_from_index(&index).unwrap(), [0u8; 32]);

        for k in 2..10 {
            let set_outcome = partition_sets(&index, k);
            let dense_outcome =
                partition_dense(&store.user_attrs.view(), &store.attr_users.view(), k);
            assert_eq!(set_outcome.mask, dense_outcome.mask, "k={k}");
            assert_eq!(
                sorted_classes(set_outcome.classes),
                sorted_classes(dense_outcome.classes),
                "k={k}"
            );
            assert_eq!(set_outcome.best_metric, dense_outcome.best_metric, "k={k}");
        }
    }

    #[test]
    fn test_score_monotonicity() {
        // Greedy on a monotone-submodular surrogate: the chosen score can
        // only decline as classes shrink.
        let mut rng = XorShift(0xface);
        let resolved: Vec<Vec<u32>> = (0..30)
            .map(|_| (0..25u32).filter(|_| rng.next() % 3 == 0).collect())
            .collect();
        let index = index_attributes(&resolved);

        let mut previous: Option<u64> = None;
        for k in 2..10 {
            let outcome = partition_sets(&index, k);
            if let Some(prev) = previous {
                assert!(outcome.best_metric <= prev, "k={k}");
            }
            previous = Some(outcome.best_metric);
        }
    }

    #[test]
    fn test_indistinct_population_stops_early() {
        let index = index_attributes(&[vec![0], vec![0], vec![0]]);
        let outcome = partition_sets(&index, 5);
        // One attribute everyone shares: the seed split leaves a single
        // class and no further attribute scores above zero.
        assert_eq!(outcome.classes.len(), 1);
        assert_eq!(outcome.best_metric, 0);
        assert_eq!(outcome.mask, vec![0]);
    }

    #[test]
    fn test_empty_attribute_universe() {
        let index = index_attributes(&[vec![], vec![]]);
        let outcome = partition_sets(&index, 4);
        assert!(outcome.mask.is_empty());
        assert_eq!(outcome.classes, vec![vec![0, 1]]);
        assert_eq!(outcome.best_metric, 0);
    }
}
