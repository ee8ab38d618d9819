pub mod attack;
pub mod provenance;
pub mod registry;
pub mod rules;
pub mod subscriptions;

use std::path::PathBuf;

/// Errors from corpus ingestion and resolution.
#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error(transparent)]
    Artifact(#[from] common::io::ArtifactError),
    #[error(transparent)]
    Codec(#[from] common::bitset::CodecError),
    #[error("rule table missing for list {list}: {path}")]
    MissingRuleTable { list: String, path: PathBuf },
    #[error("registry defines no filterlists")]
    EmptyRegistry,
}
