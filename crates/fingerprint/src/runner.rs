//! Parallel targeted-fingerprinting runner.
//!
//! One task per user over a rayon pool. Workers only read the shared
//! matrices; each completed task writes one self-contained checkpoint
//! artifact (write-then-rename), so a long run can be killed and resumed.
//! Dispatch order is ascending user id; completion order is not, so the
//! aggregate is re-sorted before returning.

use crate::TargetedOutcome;
use common::artifacts::TargetedArtifact;
use common::io;
use rayon::prelude::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Best-effort cancellation: once set, queued tasks are skipped; in-flight
/// tasks run to completion and their artifacts remain valid for resume.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct RunnerConfig {
    /// Per-user artifacts land in `out_dir/users/<uid>.json`.
    pub out_dir: PathBuf,
    /// Recompute even when a checkpoint exists.
    pub force: bool,
    /// Hex digest of the ruleset snapshot; checkpoints carrying a different
    /// digest are treated as stale and recomputed.
    pub snapshot: Option<String>,
    pub cancel: CancelToken,
}

fn artifact_path(users_dir: &Path, uid: usize) -> PathBuf {
    users_dir.join(format!("{uid}.json"))
}

/// Runs `kernel` for every requested user, checkpointing per user, and
/// returns the aggregate sorted by user id. A panicking task yields an
/// empty artifact for that user; the run proceeds.
pub fn run_targeted<F>(
    uids: &[usize],
    n_users: usize,
    kernel: F,
    cfg: &RunnerConfig,
) -> anyhow::Result<Vec<(usize, TargetedArtifact)>>
where
    F: Fn(usize) -> TargetedOutcome + Sync,
{
    let users_dir = cfg.out_dir.join("users");
    std::fs::create_dir_all(&users_dir)?;

    let mut loaded: Vec<(usize, TargetedArtifact)> = Vec::new();
    let mut todo: Vec<usize> = Vec::new();
    for &uid in uids {
        match load_checkpoint(&users_dir, uid, cfg) {
            Some(artifact) => loaded.push((uid, artifact)),
            None => todo.push(uid),
        }
    }
    todo.sort_unstable();
    info!(
        total = uids.len(),
        resumed = loaded.len(),
        scheduled = todo.len(),
        "targeted fingerprinting"
    );

    let computed: Vec<(usize, TargetedArtifact)> = todo
        .par_iter()
        .filter_map(|&uid| {
            if cfg.cancel.is_cancelled() {
                return None;
            }
            let started = Instant::now();
            let outcome = match catch_unwind(AssertUnwindSafe(|| kernel(uid))) {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(uid, "worker panicked; recording empty fingerprint");
                    TargetedOutcome::default()
                }
            };
            let artifact = to_artifact(outcome, n_users, started.elapsed().as_secs_f64(), cfg);
            if let Err(error) = io::write_json_atomic(&artifact_path(&users_dir, uid), &artifact) {
                warn!(uid, %error, "failed to write checkpoint");
            }
            Some((uid, artifact))
        })
        .collect();

    let mut results = loaded;
    results.extend(computed);
    results.sort_by_key(|(uid, _)| *uid);
    info!(completed = results.len(), "targeted fingerprinting done");
    Ok(results)
}

fn to_artifact(
    outcome: TargetedOutcome,
    n_users: usize,
    time: f64,
    cfg: &RunnerConfig,
) -> TargetedArtifact {
    let min_anon_set = outcome
        .history
        .last()
        .map_or(n_users as u64, |h| h.len_anon_set);
    TargetedArtifact {
        max_size: outcome.mask.len(),
        min_anon_set,
        unique: min_anon_set <= 1,
        best_mask: outcome.mask,
        history: outcome.history,
        time,
        snapshot: cfg.snapshot.clone(),
    }
}

/// A checkpoint counts only when it parses and carries the expected
/// snapshot digest; anything else is recomputed.
fn load_checkpoint(users_dir: &Path, uid: usize, cfg: &RunnerConfig) -> Option<TargetedArtifact> {
    if cfg.force {
        return None;
    }
    let path = artifact_path(users_dir, uid);
    if !path.exists() {
        return None;
    }
    match io::read_json::<TargetedArtifact>(&path) {
        Ok(artifact) => {
            if cfg.snapshot.is_some() && artifact.snapshot != cfg.snapshot {
                warn!(uid, "checkpoint from a different snapshot; recomputing");
                None
            } else {
                Some(artifact)
            }
        }
        Err(error) => {
            warn!(uid, %error, "unreadable checkpoint; recomputing");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{HistoryEntry, SignedAttr};

    fn outcome_for(uid: usize) -> TargetedOutcome {
        TargetedOutcome {
            mask: vec![SignedAttr::has(uid as u32)],
            history: vec![HistoryEntry {
                len_anon_set: 1,
                len_mask: 1,
            }],
        }
    }

    fn config(dir: &Path) -> RunnerConfig {
        RunnerConfig {
            out_dir: dir.to_path_buf(),
            force: false,
            snapshot: Some("abc123".into()),
            cancel: CancelToken::default(),
        }
    }

    #[test]
    fn test_run_writes_sorted_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let uids = vec![2, 0, 1];
        let results = run_targeted(&uids, 3, outcome_for, &cfg).unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(
            results.iter().map(|(u, _)| *u).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        for (uid, artifact) in &results {
            assert!(artifact.unique);
            assert_eq!(artifact.best_mask, vec![SignedAttr::has(*uid as u32)]);
            assert!(dir.path().join("users").join(format!("{uid}.json")).exists());
        }
    }

    #[test]
    fn test_resume_skips_existing_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        run_targeted(&[0, 1], 2, outcome_for, &cfg).unwrap();

        // A second pass must load, not recompute: a kernel that panics on
        // every call would poison any recomputed artifact.
        let results = run_targeted(
            &[0, 1],
            2,
            |_| panic!("must not be called"),
            &cfg,
        )
        .unwrap();
        assert!(results.iter().all(|(_, a)| a.unique));
    }

    #[test]
    fn test_force_recomputes() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        run_targeted(&[0], 1, outcome_for, &cfg).unwrap();

        cfg.force = true;
        let results = run_targeted(&[0], 1, |_| TargetedOutcome::default(), &cfg).unwrap();
        assert!(results[0].1.best_mask.is_empty());
    }

    #[test]
    fn test_snapshot_mismatch_recomputes() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        run_targeted(&[0], 1, outcome_for, &cfg).unwrap();

        let newer = RunnerConfig {
            snapshot: Some("def456".into()),
            ..config(dir.path())
        };
        let results = run_targeted(&[0], 1, |_| TargetedOutcome::default(), &newer).unwrap();
        assert!(results[0].1.best_mask.is_empty());
        assert_eq!(results[0].1.snapshot.as_deref(), Some("def456"));
    }

    #[test]
    fn test_panicking_worker_yields_empty_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let results = run_targeted(
            &[0, 1],
            7,
            |uid| {
                if uid == 1 {
                    panic!("boom");
                }
                outcome_for(uid)
            },
            &cfg,
        )
        .unwrap();

        assert_eq!(results.len(), 2);
        let failed = &results[1].1;
        assert!(failed.best_mask.is_empty());
        assert!(failed.history.is_empty());
        assert_eq!(failed.min_anon_set, 7);
        assert!(!failed.unique);
    }

    #[test]
    fn test_cancel_skips_queued_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        cfg.cancel.cancel();
        let results = run_targeted(&[0, 1, 2], 3, outcome_for, &cfg).unwrap();
        assert!(results.is_empty());
        assert!(!dir.path().join("users").join("0.json").exists());
    }
}
