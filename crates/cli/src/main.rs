use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "listprint")]
#[command(about = "How identifying is a set of ad-blocking filter lists", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Encoding {
    /// Attributes are equivalence-set ids.
    Filterlist,
    /// Attributes are individual rule ids.
    Rule,
}

#[derive(Subcommand)]
enum Commands {
    /// Build provenance, equivalence sets, and per-user attribute artifacts.
    Attack {
        /// Filterlist registry (JSON array of {name, aliases}).
        #[arg(long)]
        registry: PathBuf,
        /// Directory of parsed per-list rule tables (<slug>.jsonl[.gz]).
        #[arg(long)]
        rules_dir: PathBuf,
        /// User subscription rows (JSONL).
        #[arg(long)]
        users: PathBuf,
        /// Attacker rule patterns (JSON array); everything allowed if absent.
        #[arg(long)]
        patterns: Option<PathBuf>,
        #[arg(long)]
        out: PathBuf,
    },
    /// Per-user minimal signed masks.
    Targeted {
        #[arg(long, value_enum)]
        encoding: Encoding,
        /// Directory produced by `attack`.
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Local min/max heuristic instead of the full greedy.
        #[arg(long)]
        fast: bool,
        /// Restrict candidates to attributes observable through coherent
        /// filter lists (rule encoding only).
        #[arg(long)]
        filterlist_aware: bool,
        /// Worker threads (defaults to all cores; lower it when the shared
        /// matrix leaves little RAM headroom).
        #[arg(long)]
        jobs: Option<usize>,
        /// Recompute users whose checkpoint already exists.
        #[arg(long)]
        force: bool,
        /// Only fingerprint the first N users.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Population-wide attribute set and induced equivalence classes.
    General {
        #[arg(long, value_enum)]
        encoding: Encoding,
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Attribute budget k.
        #[arg(long, default_value_t = 100)]
        max_size: usize,
    },
    /// Defender/attacker iteration loop over the general fingerprint.
    Robustness {
        /// Directory produced by `attack`.
        #[arg(long)]
        source: PathBuf,
        /// Directory holding `equivalence_sets.json` (usually = source).
        #[arg(long)]
        filterlist_dir: PathBuf,
        /// Directory holding the initial general fingerprint.
        #[arg(long)]
        fingerprint_dir: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 100)]
        max_iter: u32,
        /// Halt once unique-user ratio drops to this value.
        #[arg(long)]
        uniqueness: Option<f64>,
        /// Halt once normalized entropy drops to this value.
        #[arg(long)]
        entropy: Option<f64>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Attack {
            registry,
            rules_dir,
            users,
            patterns,
            out,
        } => cmd_attack(registry, rules_dir, users, patterns, out),
        Commands::Targeted {
            encoding,
            source,
            out,
            fast,
            filterlist_aware,
            jobs,
            force,
            limit,
        } => cmd_targeted(encoding, &source, &out, fast, filterlist_aware, jobs, force, limit),
        Commands::General {
            encoding,
            source,
            out,
            max_size,
        } => cmd_general(encoding, &source, &out, max_size),
        Commands::Robustness {
            source,
            filterlist_dir,
            fingerprint_dir,
            out,
            max_iter,
            uniqueness,
            entropy,
        } => cmd_robustness(
            &source,
            &filterlist_dir,
            &fingerprint_dir,
            out,
            max_iter,
            uniqueness,
            entropy,
        ),
    }
}

// ---------------------------------------------------------------------------
// attack
// ---------------------------------------------------------------------------

fn cmd_attack(
    registry: PathBuf,
    rules_dir: PathBuf,
    users: PathBuf,
    patterns: Option<PathBuf>,
    out: PathBuf,
) -> anyhow::Result<()> {
    let summary = corpus::attack::run(&corpus::attack::AttackConfig {
        registry,
        rules_dir,
        users,
        patterns,
        out_dir: out.clone(),
    })?;

    println!("+------------------------------------------+");
    println!("| ATTACK PREPARATION                       |");
    println!("+------------------------------------------+");
    println!("| Filter lists   : {:>22} |", summary.n_lists);
    println!("| Rules total    : {:>22} |", summary.n_rules_total);
    println!("| Rules allowed  : {:>22} |", summary.n_rules_allowed);
    println!("| Equiv. sets    : {:>22} |", summary.n_sets);
    println!("| Users          : {:>22} |", summary.n_users);
    println!("| Unknown names  : {:>22} |", summary.n_bad_names);
    println!("+------------------------------------------+");
    println!("Artifacts written to {}", out.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// targeted
// ---------------------------------------------------------------------------

/// Aggregate row: the per-user checkpoint plus its row id.
#[derive(serde::Serialize)]
struct FingerprintRow<'a> {
    user: usize,
    #[serde(flatten)]
    artifact: &'a common::artifacts::TargetedArtifact,
}

#[allow(clippy::too_many_arguments)]
fn cmd_targeted(
    encoding: Encoding,
    source: &Path,
    out: &Path,
    fast: bool,
    filterlist_aware: bool,
    jobs: Option<usize>,
    force: bool,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    if let Some(jobs) = jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(jobs)
            .build_global()?;
    }

    let results = match encoding {
        Encoding::Filterlist => {
            if filterlist_aware {
                anyhow::bail!(
                    "unsupported combination: --filterlist-aware needs the rule encoding"
                );
            }
            targeted_filterlist(source, out, fast, force, limit)?
        }
        Encoding::Rule => {
            if fast {
                anyhow::bail!("unsupported combination: --fast needs the filterlist encoding");
            }
            targeted_rule(source, out, filterlist_aware, force, limit)?
        }
    };

    let rows: Vec<FingerprintRow<'_>> = results
        .iter()
        .map(|(user, artifact)| FingerprintRow {
            user: *user,
            artifact,
        })
        .collect();
    common::io::write_jsonl_atomic(&out.join("fingerprints.jsonl"), &rows)?;

    let unique = results.iter().filter(|(_, a)| a.unique).count();
    println!("+------------------------------------------+");
    println!("| TARGETED FINGERPRINTING                  |");
    println!("+------------------------------------------+");
    println!("| Users          : {:>22} |", results.len());
    println!("| Unique         : {:>22} |", unique);
    println!("+------------------------------------------+");
    Ok(())
}

fn targeted_filterlist(
    source: &Path,
    out: &Path,
    fast: bool,
    force: bool,
    limit: Option<usize>,
) -> anyhow::Result<Vec<(usize, common::artifacts::TargetedArtifact)>> {
    use corpus::subscriptions::ResolvedUser;
    use fingerprint::targeted::SetPopulation;

    let mut resolved: Vec<ResolvedUser> =
        common::io::read_jsonl(&source.join("users_resolved.jsonl"))?;
    if let Some(limit) = limit {
        resolved.truncate(limit);
    }
    let user_sets: Vec<Vec<u32>> = resolved.into_iter().map(|u| u.sets).collect();

    let index = fingerprint::prepare::index_attributes(&user_sets);
    common::io::write_json_atomic(&out.join("attribute_sets.json"), &index.marker_map)?;

    let population = SetPopulation::from_index(&index);
    let n_users = population.n_users();
    let cfg = fingerprint::runner::RunnerConfig {
        out_dir: out.to_path_buf(),
        force,
        snapshot: snapshot_of(&source.join("equivalence_sets.json")),
        cancel: fingerprint::runner::CancelToken::default(),
    };
    let uids: Vec<usize> = (0..n_users).collect();
    if fast {
        fingerprint::runner::run_targeted(&uids, n_users, |uid| population.fast_mask(uid), &cfg)
    } else {
        fingerprint::runner::run_targeted(&uids, n_users, |uid| population.greedy_mask(uid), &cfg)
    }
}

fn targeted_rule(
    source: &Path,
    out: &Path,
    filterlist_aware: bool,
    force: bool,
    limit: Option<usize>,
) -> anyhow::Result<Vec<(usize, common::artifacts::TargetedArtifact)>> {
    use anyhow::Context;
    use corpus::subscriptions::{ListRules, UserRules};

    let rule_ids: BTreeMap<String, u32> = common::io::read_json(&source.join("rule_id.json"))?;
    let n_rules = rule_ids.len();

    let mut user_rules: Vec<UserRules> = common::io::read_jsonl(&source.join("user_rules.jsonl"))?;
    if let Some(limit) = limit {
        user_rules.truncate(limit);
    }
    let columns: Vec<String> = user_rules.into_iter().map(|u| u.rules).collect();

    // Materialize the shared store once; workers attach to the mapped file.
    let matrix = fingerprint::prepare::rehydrate_matrix(&columns, n_rules)?;
    let digest = common::io::digest_file(&source.join("rule_id.json"))?;
    let store = common::matrix::MatrixStore::build(matrix, digest);
    let store_path = out.join("matrix.rkyv");
    store.save(&store_path)?;
    drop(store);
    let mapped = common::matrix::MappedMatrix::open(&store_path)?;

    let incidence = if filterlist_aware {
        let list_rules: Vec<ListRules> =
            common::io::read_jsonl(&source.join("filterlist_rules.jsonl"))
                .context("filterlist-aware mode needs filterlist_rules.jsonl")?;
        let lists: Vec<String> = list_rules.into_iter().map(|l| l.rules).collect();
        let list_matrix = fingerprint::prepare::rehydrate_matrix(&lists, n_rules)?;
        Some(list_matrix.transposed())
    } else {
        None
    };

    let shared = fingerprint::dense::Shared {
        user_attrs: mapped.user_attrs(),
        attr_users: mapped.attr_users(),
        non_empty: mapped.non_empty(),
        attr_lists: incidence.as_ref().map(|m| m.view()),
    };
    let n_users = shared.n_users();
    let cfg = fingerprint::runner::RunnerConfig {
        out_dir: out.to_path_buf(),
        force,
        snapshot: Some(hex::encode(digest)),
        cancel: fingerprint::runner::CancelToken::default(),
    };
    let uids: Vec<usize> = (0..n_users).collect();
    fingerprint::runner::run_targeted(
        &uids,
        n_users,
        |uid| fingerprint::dense::greedy_fingerprint(&shared, uid),
        &cfg,
    )
}

// ---------------------------------------------------------------------------
// general
// ---------------------------------------------------------------------------

fn cmd_general(encoding: Encoding, source: &Path, out: &Path, max_size: usize) -> anyhow::Result<()> {
    use common::artifacts::GeneralArtifact;
    use common::SignedAttr;

    let (outcome, n_users) = match encoding {
        Encoding::Filterlist => {
            let resolved: Vec<corpus::subscriptions::ResolvedUser> =
                common::io::read_jsonl(&source.join("users_resolved.jsonl"))?;
            let user_sets: Vec<Vec<u32>> = resolved.into_iter().map(|u| u.sets).collect();
            let index = fingerprint::prepare::index_attributes(&user_sets);
            common::io::write_json_atomic(&out.join("attribute_sets.json"), &index.marker_map)?;
            let n = index.n_users();
            (fingerprint::general::partition_sets(&index, max_size), n)
        }
        Encoding::Rule => {
            let rule_ids: BTreeMap<String, u32> =
                common::io::read_json(&source.join("rule_id.json"))?;
            let user_rules: Vec<corpus::subscriptions::UserRules> =
                common::io::read_jsonl(&source.join("user_rules.jsonl"))?;
            let columns: Vec<String> = user_rules.into_iter().map(|u| u.rules).collect();
            let matrix = fingerprint::prepare::rehydrate_matrix(&columns, rule_ids.len())?;
            let store = common::matrix::MatrixStore::build(matrix, [0u8; 32]);
            let n = store.user_attrs.rows();
            (
                fingerprint::general::partition_dense(
                    &store.user_attrs.view(),
                    &store.attr_users.view(),
                    max_size,
                ),
                n,
            )
        }
    };

    let stats = fingerprint::stats::anon_stats(outcome.mask.len(), &outcome.classes, n_users);
    let artifact = GeneralArtifact {
        best_mask: outcome.mask.iter().map(|&a| SignedAttr::has(a)).collect(),
        best_metric: outcome.best_metric,
        anon_sets: outcome.classes,
        stats,
    };
    common::io::write_json_atomic(&out.join("fingerprint.json"), &artifact)?;

    println!("+------------------------------------------+");
    println!("| GENERAL FINGERPRINTING                   |");
    println!("+------------------------------------------+");
    println!("| Mask size      : {:>22} |", artifact.stats.best_mask_size);
    println!("| Classes        : {:>22} |", artifact.stats.n_anon_sets);
    println!(
        "| Max class      : {:>22} |",
        artifact.stats.max_anon_set_size
    );
    println!(
        "| Entropy        : {:>22.4} |",
        artifact.stats.anon_set_entropy
    );
    println!("+------------------------------------------+");
    Ok(())
}

// ---------------------------------------------------------------------------
// robustness
// ---------------------------------------------------------------------------

fn cmd_robustness(
    source: &Path,
    filterlist_dir: &Path,
    fingerprint_dir: &Path,
    out: PathBuf,
    max_iter: u32,
    uniqueness: Option<f64>,
    entropy: Option<f64>,
) -> anyhow::Result<()> {
    let outcome = robustness::run(&robustness::RobustnessConfig {
        users: source.join("users_resolved.jsonl"),
        equivalence_sets: filterlist_dir.join("equivalence_sets.json"),
        fingerprint_dir: fingerprint_dir.to_path_buf(),
        out_dir: out,
        thresholds: robustness::Thresholds {
            max_iter: Some(max_iter),
            uniqueness,
            entropy,
        },
    })?;

    println!("+------------------------------------------+");
    println!("| ITERATIVE ROBUSTNESS                     |");
    println!("+------------------------------------------+");
    println!("| Iterations     : {:>22} |", outcome.iterations);
    println!(
        "| Unique users   : {:>22} |",
        outcome.final_summary.n_unique_users
    );
    println!(
        "| Entropy        : {:>22.4} |",
        outcome.final_summary.stats.anon_set_entropy
    );
    println!(
        "| Usable rules   : {:>22} |",
        outcome.final_summary.n_usable_rules
    );
    println!("+------------------------------------------+");
    Ok(())
}

fn snapshot_of(path: &Path) -> Option<String> {
    common::io::digest_file(path).ok().map(hex::encode)
}
