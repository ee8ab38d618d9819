//! On-disk artifact schemas shared by the pipeline stages.

use crate::{legacy_mask, HistoryEntry, SignedAttr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maps a dense attribute id (as used in masks) back to its source: the
/// equivalence-set id in filterlist encoding, or the rule id in rule
/// encoding. Emitted alongside every fingerprint result.
pub type MarkerMap = BTreeMap<u32, u32>;

/// Equivalence sets over a ruleset snapshot; the three arrays are
/// index-aligned except `list_names`, which is indexed by the list ids
/// inside `equiprobable_list_sets`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquivalenceSetFile {
    pub list_names: Vec<String>,
    pub equivalent_rules: Vec<Vec<String>>,
    pub equiprobable_list_sets: Vec<Vec<u32>>,
}

impl EquivalenceSetFile {
    pub fn len(&self) -> usize {
        self.equiprobable_list_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.equiprobable_list_sets.is_empty()
    }
}

/// Per-user targeted fingerprint checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetedArtifact {
    #[serde(with = "legacy_mask")]
    pub best_mask: Vec<SignedAttr>,
    pub history: Vec<HistoryEntry>,
    pub max_size: usize,
    pub min_anon_set: u64,
    pub unique: bool,
    /// Kernel wall time in seconds.
    pub time: f64,
    /// Hex digest of the ruleset snapshot this checkpoint was derived from;
    /// resume refuses checkpoints from a different snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

/// Size distribution of the induced equivalence classes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnonSetStats {
    pub best_mask_size: usize,
    pub n_anon_sets: usize,
    pub max_anon_set_size: u64,
    pub mean_anon_set_size: f64,
    pub std_anon_set_size: f64,
    pub median_anon_set_size: u64,
    /// Shannon entropy of the class-size distribution over ln(N).
    pub anon_set_entropy: f64,
}

/// Population-wide fingerprint artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralArtifact {
    #[serde(with = "legacy_mask")]
    pub best_mask: Vec<SignedAttr>,
    pub best_metric: u64,
    /// Equivalence classes as user row ids, index-aligned with nothing;
    /// each class sorted ascending.
    pub anon_sets: Vec<Vec<u32>>,
    pub stats: AnonSetStats,
}

/// One round of the attacker/defender loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationSummary {
    pub iteration: u32,
    #[serde(flatten)]
    pub stats: AnonSetStats,
    pub n_unique_users: u64,
    /// Rules newly burned by this iteration's mask.
    pub n_usable_rules: usize,
    pub n_participating_filterlists: usize,
    pub participating_filterlists: Vec<String>,
}
