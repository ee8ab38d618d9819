//! Parsed-rule records and attack-pattern filtering.
//!
//! Rule parsing itself is an external collaborator: this module only
//! consumes the record schema it produces (one record per rule, boolean
//! type flags, opaque options) and decides which rules an attacker is
//! allowed to use.

use crate::CorpusError;
use bitflags::bitflags;
use common::io;
use serde::{Deserialize, Serialize};
use std::path::Path;

bitflags! {
    /// Rule type flags from the parser.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RuleKinds: u8 {
        const COSMETIC     = 1 << 0;
        const NETWORK      = 1 << 1;
        const HTML         = 1 << 2;
        const SCRIPT       = 1 << 3;
        const EXCEPTION    = 1 << 4;
        const EXTENDED_CSS = 1 << 5;
    }
}

/// One parsed rule. Only `rule`, the type flags, and `generic` are consumed
/// by the attack; the rest is pass-through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleRecord {
    pub rule: String,
    #[serde(default)]
    pub cosmetic: bool,
    #[serde(default)]
    pub network: bool,
    #[serde(default)]
    pub html: bool,
    #[serde(default)]
    pub script: bool,
    #[serde(default)]
    pub exception: bool,
    #[serde(default)]
    pub extended_css: bool,
    #[serde(default)]
    pub generic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cosmetic_how: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_how: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl RuleRecord {
    pub fn kinds(&self) -> RuleKinds {
        let mut kinds = RuleKinds::empty();
        kinds.set(RuleKinds::COSMETIC, self.cosmetic);
        kinds.set(RuleKinds::NETWORK, self.network);
        kinds.set(RuleKinds::HTML, self.html);
        kinds.set(RuleKinds::SCRIPT, self.script);
        kinds.set(RuleKinds::EXCEPTION, self.exception);
        kinds.set(RuleKinds::EXTENDED_CSS, self.extended_css);
        kinds
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Cosmetic,
    Network,
    Html,
    Script,
    Exception,
    ExtendedCss,
}

impl RuleKind {
    fn flag(self) -> RuleKinds {
        match self {
            RuleKind::Cosmetic => RuleKinds::COSMETIC,
            RuleKind::Network => RuleKinds::NETWORK,
            RuleKind::Html => RuleKinds::HTML,
            RuleKind::Script => RuleKinds::SCRIPT,
            RuleKind::Exception => RuleKinds::EXCEPTION,
            RuleKind::ExtendedCss => RuleKinds::EXTENDED_CSS,
        }
    }
}

/// One pattern of the attacker model: a rule is usable if any configured
/// pattern matches it. All fields are conjunctive within a pattern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttackPattern {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<RuleKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cosmetic_how: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_how: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_resource_types: Option<Vec<String>>,
}

impl AttackPattern {
    pub fn matches(&self, record: &RuleRecord) -> bool {
        if let Some(kind) = self.kind {
            if !record.kinds().contains(kind.flag()) {
                return false;
            }
        }
        if let Some(generic) = self.generic {
            if record.generic != generic {
                return false;
            }
        }
        if let Some(how) = &self.cosmetic_how {
            if record.cosmetic_how.as_deref() != Some(how.as_str()) {
                return false;
            }
        }
        if let Some(how) = &self.network_how {
            if record.network_how.as_deref() != Some(how.as_str()) {
                return false;
            }
        }
        if let Some(excluded) = &self.exclude_resource_types {
            if let Some(resource) = &record.resource {
                if excluded.iter().any(|r| r == resource) {
                    return false;
                }
            }
        }
        true
    }
}

/// Loads a per-list rule table (JSON Lines, optionally gzipped). Rule text
/// is whitespace-trimmed here; identity downstream is plain string equality.
pub fn load_rule_table(path: &Path) -> Result<Vec<RuleRecord>, CorpusError> {
    let mut records: Vec<RuleRecord> = io::read_jsonl(path)?;
    for record in &mut records {
        let trimmed = record.rule.trim();
        if trimmed.len() != record.rule.len() {
            record.rule = trimmed.to_string();
        }
    }
    Ok(records)
}

/// Rules an attacker may use, per list: rules matching any pattern. With no
/// patterns configured, every rule is allowed.
pub fn allowed_rules(records: &[RuleRecord], patterns: &[AttackPattern]) -> Vec<String> {
    records
        .iter()
        .filter(|r| patterns.is_empty() || patterns.iter().any(|p| p.matches(r)))
        .map(|r| r.rule.clone())
        .collect()
}
