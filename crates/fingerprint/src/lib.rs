pub mod dense;
pub mod general;
pub mod prepare;
pub mod runner;
pub mod stats;
pub mod targeted;

use common::{HistoryEntry, SignedAttr};

/// Result of one targeted fingerprinting task: the signed mask in selection
/// order and the anonymity-set trajectory. An empty history means the very
/// first candidate scan found no attribute that separates the target from
/// anyone (not an error).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetedOutcome {
    pub mask: Vec<SignedAttr>,
    pub history: Vec<HistoryEntry>,
}
