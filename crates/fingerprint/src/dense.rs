//! Dense targeted fingerprinting kernel.
//!
//! Works over the packed user×attribute matrix and its transpose. The greedy
//! loop maintains, for every attribute `a`, the counter `|T_a ∩ S|` — the
//! size of the anonymity set after committing the sign that matches the
//! target on `a`. A naive rescan is `O(users × attrs)` per step; the counter
//! form only subtracts the contribution of the users removed in the previous
//! step, which is what makes six-figure attribute universes tractable.

use crate::TargetedOutcome;
use common::bits;
use common::matrix::MatrixView;
use common::{HistoryEntry, SignedAttr};

/// Read-only state shared by every worker. Matrix views borrow from one
/// mapped store; per-task state is allocated locally.
#[derive(Debug, Clone, Copy)]
pub struct Shared<'a> {
    /// Users × attributes.
    pub user_attrs: MatrixView<'a>,
    /// Attributes × users (transpose of `user_attrs`).
    pub attr_users: MatrixView<'a>,
    /// Bitmap over attributes: set iff some user has the attribute.
    pub non_empty: &'a [u8],
    /// Attributes × filterlists incidence; enables the filterlist-aware
    /// candidate narrowing when present.
    pub attr_lists: Option<MatrixView<'a>>,
}

impl Shared<'_> {
    pub fn n_users(&self) -> usize {
        self.user_attrs.rows()
    }

    pub fn n_attrs(&self) -> usize {
        self.user_attrs.cols()
    }
}

/// Greedy targeted fingerprint for one user.
pub fn greedy_fingerprint(shared: &Shared<'_>, uid: usize) -> TargetedOutcome {
    let n = shared.n_users();
    let m = shared.n_attrs();
    let user_row = shared.user_attrs.row(uid);

    let mut anon = bits::filled(n);
    let mut anon_count = n as u64;

    // |T_a| over the full population; maintained as |T_a ∩ S| from here on.
    let mut sizes: Vec<u64> = (0..m)
        .map(|a| {
            let ones = shared.attr_users.row_count_ones(a);
            if bits::test(user_row, a) {
                ones
            } else {
                n as u64 - ones
            }
        })
        .collect();

    let mut avail: Vec<bool> = (0..m).map(|a| bits::test(shared.non_empty, a)).collect();
    let mut chosen_pos = vec![false; m];
    let mut mask: Vec<SignedAttr> = Vec::new();
    let mut history: Vec<HistoryEntry> = Vec::new();
    let mut removed = vec![0u8; anon.len()];

    while anon_count > 1 {
        // Lowest-id argmin over the candidate pool. Negative selections stay
        // in the pool: re-picking one cannot shrink the set, which the
        // no-progress check below turns into termination.
        let mut best: Option<usize> = None;
        for a in 0..m {
            if !avail[a] || chosen_pos[a] {
                continue;
            }
            match best {
                Some(b) if sizes[a] >= sizes[b] => {}
                _ => best = Some(a),
            }
        }
        let Some(a_star) = best else { break };
        if sizes[a_star] == anon_count {
            break;
        }

        let positive = bits::test(user_row, a_star);
        let attr_row = shared.attr_users.row(a_star);

        removed.copy_from_slice(&anon);
        if positive {
            bits::andnot_in_place(&mut removed, attr_row);
            bits::and_in_place(&mut anon, attr_row);
            chosen_pos[a_star] = true;
            mask.push(SignedAttr::has(a_star as u32));
        } else {
            bits::and_in_place(&mut removed, attr_row);
            bits::andnot_in_place(&mut anon, attr_row);
            mask.push(SignedAttr::lacks(a_star as u32));
        }

        let removed_count = bits::count_ones(&removed);
        anon_count -= removed_count;
        if removed_count > 0 {
            for a in 0..m {
                let overlap = bits::and_count(shared.attr_users.row(a), &removed);
                let contribution = if bits::test(user_row, a) {
                    overlap
                } else {
                    removed_count - overlap
                };
                sizes[a] -= contribution;
            }
        }

        if let Some(attr_lists) = &shared.attr_lists {
            if positive {
                narrow_positive(attr_lists, a_star, &mut avail);
            } else {
                narrow_negative(attr_lists, a_star, &mut avail);
            }
        }

        history.push(HistoryEntry {
            len_anon_set: anon_count,
            len_mask: mask.len() as u64,
        });
    }

    TargetedOutcome { mask, history }
}

/// After committing `+a`: drop every attribute carried by all of `a`'s
/// lists — subscribing to any list that provides `a` provides it too, so
/// observing it adds nothing.
fn narrow_positive(attr_lists: &MatrixView<'_>, a: usize, avail: &mut [bool]) {
    let a_row = attr_lists.row(a);
    let a_count = bits::count_ones(a_row);
    for (b, slot) in avail.iter_mut().enumerate() {
        if !*slot {
            continue;
        }
        if bits::and_count(attr_lists.row(b), a_row) == a_count {
            *slot = false;
        }
    }
}

/// After committing `−a`: keep only attributes some list provides without
/// `a` — anything else is unobservable for a user known to avoid `a`'s
/// lists.
fn narrow_negative(attr_lists: &MatrixView<'_>, a: usize, avail: &mut [bool]) {
    let a_row = attr_lists.row(a);
    for (b, slot) in avail.iter_mut().enumerate() {
        if !*slot {
            continue;
        }
        let b_row = attr_lists.row(b);
        if bits::count_ones(b_row) - bits::and_count(b_row, a_row) == 0 {
            *slot = false;
        }
    }
}
