//! The attack-preparation pipeline.
//!
//! Stages:
//! - **Stage 0** — Ingest: registry, per-list rule tables, user rows.
//! - **Stage 1** — Pattern filter: keep the rules the attacker may use.
//! - **Stage 2** — Provenance index + equivalence-set reduction.
//! - **Stage 3** — Rule-id assignment and compressed bitset columns.
//! - **Stage 4** — Subscription resolution for both encodings.
//!
//! Every downstream input artifact is written here; the fingerprinting
//! stages only read.

use crate::provenance::{self, ProvenanceIndex};
use crate::registry::{slug, Registry};
use crate::rules::{allowed_rules, load_rule_table, AttackPattern};
use crate::subscriptions::{
    assign_rule_ids, encode_list_rules, expand_to_rules, resolve_to_sets, SubscriptionRecord,
};
use crate::CorpusError;
use common::artifacts::EquivalenceSetFile;
use common::io;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub struct AttackConfig {
    pub registry: PathBuf,
    pub rules_dir: PathBuf,
    pub users: PathBuf,
    pub patterns: Option<PathBuf>,
    pub out_dir: PathBuf,
}

/// Per-list rule counts emitted as `list_counts.json`.
#[derive(Debug, Serialize)]
pub struct ListCounts {
    pub name: String,
    pub count_unique: usize,
    pub count_allowed: usize,
    pub count_total: usize,
}

/// Results of a full attack-preparation run.
#[derive(Debug, Default)]
pub struct AttackSummary {
    pub n_lists: usize,
    pub n_rules_total: usize,
    pub n_rules_allowed: usize,
    pub n_sets: usize,
    pub n_users: usize,
    pub n_bad_names: usize,
}

/// Runs all stages and writes every artifact under `out_dir`.
pub fn run(cfg: &AttackConfig) -> anyhow::Result<AttackSummary> {
    use anyhow::Context;

    // Stage 0: ingest.
    let registry = Registry::load(&cfg.registry)
        .with_context(|| format!("loading registry {}", cfg.registry.display()))?;
    let subscriptions: Vec<SubscriptionRecord> = io::read_jsonl(&cfg.users)
        .with_context(|| format!("loading user rows {}", cfg.users.display()))?;
    let patterns: Vec<AttackPattern> = match &cfg.patterns {
        Some(path) => io::read_json(path)
            .with_context(|| format!("loading attack patterns {}", path.display()))?,
        None => Vec::new(),
    };

    let mut tables = Vec::with_capacity(registry.len());
    for def in registry.iter() {
        let path = rule_table_path(&cfg.rules_dir, &def.name).ok_or_else(|| {
            CorpusError::MissingRuleTable {
                list: def.name.clone(),
                path: cfg.rules_dir.join(format!("{}.jsonl", slug(&def.name))),
            }
        })?;
        tables.push(load_rule_table(&path)?);
    }

    // Stage 1: pattern filter.
    let allowed: Vec<Vec<String>> = tables.iter().map(|t| allowed_rules(t, &patterns)).collect();
    let n_rules_total: usize = tables.iter().map(Vec::len).sum();
    let n_rules_allowed: usize = allowed.iter().map(Vec::len).sum();
    info!(
        lists = registry.len(),
        total = n_rules_total,
        allowed = n_rules_allowed,
        "rule tables ingested"
    );

    // Stage 2: provenance + reduction.
    let index = ProvenanceIndex::build(&allowed);
    let sets = provenance::reduce(&index);
    if sets.is_empty() {
        warn!("no equivalence sets found; downstream artifacts will be empty");
    }

    let unique = provenance::unique_rules(&index, registry.len());
    let counts: Vec<ListCounts> = registry
        .iter()
        .enumerate()
        .map(|(i, def)| ListCounts {
            name: def.name.clone(),
            count_unique: unique[i].len(),
            count_allowed: allowed[i].len(),
            count_total: tables[i].len(),
        })
        .collect();

    // Stage 3: rule ids + compressed columns.
    let assignment = assign_rule_ids(&allowed);
    let list_rules = encode_list_rules(&registry, &assignment.per_list, assignment.n_rules())?;

    // Stage 4: subscription resolution, both encodings.
    let set_resolution = resolve_to_sets(&subscriptions, &registry, &sets);
    let rule_resolution = expand_to_rules(
        &subscriptions,
        &registry,
        &assignment.per_list,
        assignment.n_rules(),
    )?;

    let mut bad_names: BTreeSet<String> = set_resolution.bad_names;
    bad_names.extend(rule_resolution.bad_names);
    if !bad_names.is_empty() {
        warn!(n = bad_names.len(), "unknown filterlist names recorded");
    }

    let set_file = EquivalenceSetFile {
        list_names: registry.names(),
        equivalent_rules: sets.iter().map(|s| s.rules.clone()).collect(),
        equiprobable_list_sets: sets.iter().map(|s| s.lists.clone()).collect(),
    };

    let out = &cfg.out_dir;
    io::write_json_atomic(&out.join("list_counts.json"), &counts)?;
    io::write_json_atomic(&out.join("rule_id.json"), &assignment.rule_ids)?;
    io::write_jsonl_atomic(&out.join("filterlist_rules.jsonl"), &list_rules)?;
    io::write_jsonl_atomic(&out.join("user_rules.jsonl"), &rule_resolution.users)?;
    io::write_json_atomic(&out.join("equivalence_sets.json"), &set_file)?;
    io::write_jsonl_atomic(&out.join("users_resolved.jsonl"), &set_resolution.users)?;
    io::write_json_atomic(
        &out.join("bad_names.json"),
        &bad_names.iter().collect::<Vec<_>>(),
    )?;

    Ok(AttackSummary {
        n_lists: registry.len(),
        n_rules_total,
        n_rules_allowed,
        n_sets: sets.len(),
        n_users: set_resolution.users.len(),
        n_bad_names: bad_names.len(),
    })
}

fn rule_table_path(rules_dir: &Path, name: &str) -> Option<PathBuf> {
    let base = slug(name);
    for candidate in [format!("{base}.jsonl"), format!("{base}.jsonl.gz")] {
        let path = rules_dir.join(candidate);
        if path.exists() {
            return Some(path);
        }
    }
    None
}
