//! Iterative robustness: the attacker/defender loop.
//!
//! Each round the attacker publishes the best general fingerprint; the
//! defender responds by making the exposed attributes universal (every
//! user "loses" them as distinguishing signals), and the attack re-runs on
//! what is left. The per-iteration artifacts double as checkpoints: a round
//! whose directory already exists is loaded, not recomputed, and the
//! defender update and burned-rule ledger are replayed for it so a resumed
//! run continues from the same state a straight-through run would have.

use common::artifacts::{EquivalenceSetFile, GeneralArtifact, IterationSummary, MarkerMap};
use common::io;
use common::SignedAttr;
use corpus::subscriptions::ResolvedUser;
use fingerprint::{general, prepare, stats};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default)]
pub struct Thresholds {
    /// Stop after this many defender rounds.
    pub max_iter: Option<u32>,
    /// Stop once `unique users / N` drops to this ratio.
    pub uniqueness: Option<f64>,
    /// Stop once normalized entropy drops to this value.
    pub entropy: Option<f64>,
}

impl Thresholds {
    fn is_unbounded(&self) -> bool {
        self.max_iter.is_none() && self.uniqueness.is_none() && self.entropy.is_none()
    }
}

pub struct RobustnessConfig {
    /// Resolved user subscriptions (`users_resolved.jsonl`).
    pub users: PathBuf,
    /// Equivalence-set definitions (`equivalence_sets.json`).
    pub equivalence_sets: PathBuf,
    /// Directory holding the initial general fingerprint artifacts.
    pub fingerprint_dir: PathBuf,
    pub out_dir: PathBuf,
    pub thresholds: Thresholds,
}

#[derive(Debug)]
pub struct RunOutcome {
    /// Index of the last completed iteration.
    pub iterations: u32,
    pub final_summary: IterationSummary,
}

pub fn run(cfg: &RobustnessConfig) -> anyhow::Result<RunOutcome> {
    use anyhow::Context;

    if cfg.thresholds.is_unbounded() {
        anyhow::bail!("no halting predicate configured: set max_iter, uniqueness, or entropy");
    }

    let set_file: EquivalenceSetFile = io::read_json(&cfg.equivalence_sets)
        .with_context(|| format!("loading {}", cfg.equivalence_sets.display()))?;
    let resolved: Vec<ResolvedUser> = io::read_jsonl(&cfg.users)
        .with_context(|| format!("loading {}", cfg.users.display()))?;
    let mut user_sets: Vec<Vec<u32>> = resolved.into_iter().map(|u| u.sets).collect();
    let n_users = user_sets.len();

    // Round 0 is the published attack: load it from the fingerprint stage.
    let mut marker_map: MarkerMap = io::read_json(&cfg.fingerprint_dir.join("attribute_sets.json"))
        .context("loading initial attribute map")?;
    let mut artifact: GeneralArtifact = io::read_json(&cfg.fingerprint_dir.join("fingerprint.json"))
        .context("loading initial fingerprint")?;

    let mut burned: BTreeSet<String> = BTreeSet::new();
    let mut iteration: u32 = 0;

    let mut summary = if iteration_dir(&cfg.out_dir, 0).join("summary.json").exists() {
        let (map, art, summary) = load_iteration(&cfg.out_dir, 0)?;
        accumulate_burned(&mut burned, &map, &art.best_mask, &set_file)?;
        marker_map = map;
        artifact = art;
        info!(iteration = 0, "loaded existing iteration");
        summary
    } else {
        report_iteration(0, &marker_map, &artifact, &set_file, &mut burned, &cfg.out_dir)?
    };

    loop {
        if let Some(max) = cfg.thresholds.max_iter {
            if iteration >= max {
                info!(iteration, "max iterations reached");
                break;
            }
        }
        if let Some(tau) = cfg.thresholds.uniqueness {
            if n_users == 0 || summary.n_unique_users as f64 / n_users as f64 <= tau {
                info!(iteration, "uniqueness threshold reached");
                break;
            }
        }
        if let Some(tau) = cfg.thresholds.entropy {
            if summary.stats.anon_set_entropy <= tau {
                info!(iteration, "entropy threshold reached");
                break;
            }
        }

        iteration += 1;

        // Defender update from the previous round's mask, applied on the
        // resume path as well.
        apply_defense(&mut user_sets, &marker_map, &artifact.best_mask)?;

        if iteration_dir(&cfg.out_dir, iteration)
            .join("summary.json")
            .exists()
        {
            let (map, art, loaded) = load_iteration(&cfg.out_dir, iteration)?;
            accumulate_burned(&mut burned, &map, &art.best_mask, &set_file)?;
            marker_map = map;
            artifact = art;
            summary = loaded;
            info!(iteration, "loaded existing iteration");
            continue;
        }

        let k = summary.stats.best_mask_size;
        let index = prepare::index_attributes(&user_sets);
        if index.n_attrs() == 0 {
            warn!(iteration, "no distinguishing attributes left");
        }
        let outcome = general::partition_sets(&index, k);
        let class_stats = stats::anon_stats(outcome.mask.len(), &outcome.classes, n_users);

        marker_map = index.marker_map.clone();
        artifact = GeneralArtifact {
            best_mask: outcome.mask.iter().map(|&a| SignedAttr::has(a)).collect(),
            best_metric: outcome.best_metric,
            anon_sets: outcome.classes,
            stats: class_stats,
        };
        summary = report_iteration(
            iteration,
            &marker_map,
            &artifact,
            &set_file,
            &mut burned,
            &cfg.out_dir,
        )?;
    }

    Ok(RunOutcome {
        iterations: iteration,
        final_summary: summary,
    })
}

fn iteration_dir(out_dir: &Path, iteration: u32) -> PathBuf {
    out_dir.join(format!("iter_{iteration}"))
}

/// Equivalence sets exposed by a mask: the union of their rules and the
/// names of every list carrying them.
fn mask_footprint(
    marker_map: &MarkerMap,
    mask: &[SignedAttr],
    set_file: &EquivalenceSetFile,
) -> anyhow::Result<(BTreeSet<String>, BTreeSet<String>)> {
    let mut rules = BTreeSet::new();
    let mut lists = BTreeSet::new();
    for decision in mask {
        let set_id = *marker_map.get(&decision.attr).ok_or_else(|| {
            anyhow::anyhow!("attribute {} missing from attribute map", decision.attr)
        })? as usize;
        rules.extend(set_file.equivalent_rules[set_id].iter().cloned());
        for &list in &set_file.equiprobable_list_sets[set_id] {
            lists.insert(set_file.list_names[list as usize].clone());
        }
    }
    Ok((rules, lists))
}

fn accumulate_burned(
    burned: &mut BTreeSet<String>,
    marker_map: &MarkerMap,
    mask: &[SignedAttr],
    set_file: &EquivalenceSetFile,
) -> anyhow::Result<()> {
    let (rules, _) = mask_footprint(marker_map, mask, set_file)?;
    burned.extend(rules);
    Ok(())
}

/// Removes every equivalence set exposed by the mask from every user.
fn apply_defense(
    user_sets: &mut [Vec<u32>],
    marker_map: &MarkerMap,
    mask: &[SignedAttr],
) -> anyhow::Result<()> {
    let mut exposed: HashSet<u32> = HashSet::new();
    for decision in mask {
        let set_id = *marker_map.get(&decision.attr).ok_or_else(|| {
            anyhow::anyhow!("attribute {} missing from attribute map", decision.attr)
        })?;
        exposed.insert(set_id);
    }
    for sets in user_sets.iter_mut() {
        sets.retain(|s| !exposed.contains(s));
    }
    Ok(())
}

/// Writes the round's three artifacts and extends the burned-rule ledger.
fn report_iteration(
    iteration: u32,
    marker_map: &MarkerMap,
    artifact: &GeneralArtifact,
    set_file: &EquivalenceSetFile,
    burned: &mut BTreeSet<String>,
    out_dir: &Path,
) -> anyhow::Result<IterationSummary> {
    let dir = iteration_dir(out_dir, iteration);
    io::write_json_atomic(&dir.join("fingerprint.json"), artifact)?;
    io::write_json_atomic(&dir.join("attribute_sets.json"), marker_map)?;

    let (rules, lists) = mask_footprint(marker_map, &artifact.best_mask, set_file)?;
    let new_rules: BTreeSet<String> = rules.difference(burned).cloned().collect();
    burned.extend(new_rules.iter().cloned());

    let summary = IterationSummary {
        iteration,
        stats: artifact.stats.clone(),
        n_unique_users: artifact.anon_sets.iter().filter(|s| s.len() == 1).count() as u64,
        n_usable_rules: new_rules.len(),
        n_participating_filterlists: lists.len(),
        participating_filterlists: lists.into_iter().collect(),
    };
    io::write_json_atomic(&dir.join("summary.json"), &summary)?;

    info!(
        iteration,
        mask_size = summary.stats.best_mask_size,
        classes = summary.stats.n_anon_sets,
        unique = summary.n_unique_users,
        entropy = summary.stats.anon_set_entropy,
        usable_rules = summary.n_usable_rules,
        "iteration summary"
    );
    Ok(summary)
}

fn load_iteration(
    out_dir: &Path,
    iteration: u32,
) -> anyhow::Result<(MarkerMap, GeneralArtifact, IterationSummary)> {
    let dir = iteration_dir(out_dir, iteration);
    let marker_map = io::read_json(&dir.join("attribute_sets.json"))?;
    let artifact = io::read_json(&dir.join("fingerprint.json"))?;
    let summary = io::read_json(&dir.join("summary.json"))?;
    Ok((marker_map, artifact, summary))
}
