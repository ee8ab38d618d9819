//! Set-based targeted fingerprinting.
//!
//! The reference form of the greedy kernel, used for the equivalence-set
//! encoding where the attribute universe is small (hundreds, not hundreds
//! of thousands). Also hosts the fast fallback: a purely local heuristic
//! that trades uniqueness for speed on large populations.

use crate::prepare::AttrIndex;
use crate::TargetedOutcome;
use common::{HistoryEntry, SignedAttr};
use std::collections::HashSet;

/// Shared read-only adjacency for the set-based kernels.
#[derive(Debug)]
pub struct SetPopulation {
    users: Vec<HashSet<u32>>,
    attr_users: Vec<HashSet<u32>>,
}

impl SetPopulation {
    pub fn from_index(index: &AttrIndex) -> Self {
        Self {
            users: index
                .users
                .iter()
                .map(|attrs| attrs.iter().copied().collect())
                .collect(),
            attr_users: index
                .attr_users
                .iter()
                .map(|users| users.iter().copied().collect())
                .collect(),
        }
    }

    pub fn n_users(&self) -> usize {
        self.users.len()
    }

    pub fn n_attrs(&self) -> usize {
        self.attr_users.len()
    }

    fn matching(&self, uid: usize, attr: u32, anon: &HashSet<u32>) -> usize {
        let inter = anon
            .iter()
            .filter(|u| self.attr_users[attr as usize].contains(*u))
            .count();
        if self.users[uid].contains(&attr) {
            inter
        } else {
            anon.len() - inter
        }
    }

    /// Greedy targeted fingerprint: repeatedly commit the sign-matched
    /// attribute with the smallest surviving anonymity set until the user
    /// is unique or nothing makes progress.
    pub fn greedy_mask(&self, uid: usize) -> TargetedOutcome {
        let n = self.n_users();
        let mut anon: HashSet<u32> = (0..n as u32).collect();
        let mut chosen_pos: HashSet<u32> = HashSet::new();
        let mut mask: Vec<SignedAttr> = Vec::new();
        let mut history: Vec<HistoryEntry> = Vec::new();

        while anon.len() > 1 {
            // Ascending scan with strict improvement: lowest id wins ties.
            let mut best: Option<(u32, usize)> = None;
            for a in 0..self.n_attrs() as u32 {
                if self.attr_users[a as usize].is_empty() || chosen_pos.contains(&a) {
                    continue;
                }
                let count = self.matching(uid, a, &anon);
                match best {
                    Some((_, c)) if count >= c => {}
                    _ => best = Some((a, count)),
                }
            }
            let Some((a, count)) = best else { break };
            if count == anon.len() {
                break;
            }

            if self.users[uid].contains(&a) {
                chosen_pos.insert(a);
                mask.push(SignedAttr::has(a));
                anon.retain(|u| self.attr_users[a as usize].contains(u));
            } else {
                mask.push(SignedAttr::lacks(a));
                anon.retain(|u| !self.attr_users[a as usize].contains(u));
            }
            history.push(HistoryEntry {
                len_anon_set: anon.len() as u64,
                len_mask: mask.len() as u64,
            });
        }

        TargetedOutcome { mask, history }
    }

    /// Fast fallback: at each step append either the attribute of the
    /// target with the fewest matches in the remaining population, or the
    /// attribute the target lacks with the most — whichever side carries
    /// the lower match probability. No anonymity set is tracked, so the
    /// history is empty and the mask may be non-unique.
    pub fn fast_mask(&self, uid: usize) -> TargetedOutcome {
        let n = self.n_users();
        let mut mask: Vec<SignedAttr> = Vec::new();
        let mut masked: HashSet<u32> = HashSet::new();

        loop {
            let population: Vec<u32> = if mask.is_empty() {
                (0..n as u32).collect()
            } else {
                (0..n as u32)
                    .filter(|&v| v as usize != uid && self.consistent(v, &mask))
                    .collect()
            };
            if population.is_empty() {
                break;
            }

            let mut counts = vec![0u64; self.n_attrs()];
            for &v in &population {
                for &a in &self.users[v as usize] {
                    counts[a as usize] += 1;
                }
            }

            let mut min_f: Option<(u32, u64)> = None;
            let mut max_f: Option<(u32, u64)> = None;
            for a in 0..self.n_attrs() as u32 {
                let count = counts[a as usize];
                if count == 0 || masked.contains(&a) {
                    continue;
                }
                if self.users[uid].contains(&a) {
                    match min_f {
                        Some((_, c)) if count >= c => {}
                        _ => min_f = Some((a, count)),
                    }
                } else {
                    match max_f {
                        Some((_, c)) if count <= c => {}
                        _ => max_f = Some((a, count)),
                    }
                }
            }
            let (Some((min_a, min_count)), Some((max_a, max_count))) = (min_f, max_f) else {
                break;
            };

            let min_p = min_count as f64 / population.len() as f64;
            let max_p = 1.0 - max_count as f64 / population.len() as f64;
            if min_p <= max_p {
                mask.push(SignedAttr::has(min_a));
                masked.insert(min_a);
            } else {
                mask.push(SignedAttr::lacks(max_a));
                masked.insert(max_a);
            }
        }

        TargetedOutcome {
            mask,
            history: Vec::new(),
        }
    }

    fn consistent(&self, v: u32, mask: &[SignedAttr]) -> bool {
        mask.iter().all(|m| {
            let has = self.users[v as usize].contains(&m.attr);
            if m.is_positive() {
                has
            } else {
                !has
            }
        })
    }
}
