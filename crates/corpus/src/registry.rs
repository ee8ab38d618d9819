//! Filterlist registry: named lists, alias resolution, per-list file slugs.

use crate::CorpusError;
use common::io;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// One registry record. `version_control` is pass-through metadata for the
/// history-scraping tools and is not consumed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterlistDef {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_control: Option<String>,
}

/// Ordered filterlist registry with alias → canonical-name resolution.
#[derive(Debug, Clone)]
pub struct Registry {
    lists: Vec<FilterlistDef>,
    resolutions: HashMap<String, usize>,
}

impl Registry {
    pub fn new(lists: Vec<FilterlistDef>) -> Self {
        let mut resolutions = HashMap::new();
        for (i, def) in lists.iter().enumerate() {
            resolutions.insert(def.name.clone(), i);
            for alias in &def.aliases {
                resolutions.insert(alias.clone(), i);
            }
        }
        Self { lists, resolutions }
    }

    pub fn load(path: &Path) -> Result<Self, CorpusError> {
        let lists: Vec<FilterlistDef> = io::read_json(path)?;
        if lists.is_empty() {
            return Err(CorpusError::EmptyRegistry);
        }
        Ok(Self::new(lists))
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    /// Resolves a name or alias to the canonical list index.
    pub fn resolve(&self, name: &str) -> Option<usize> {
        self.resolutions.get(name).copied()
    }

    pub fn name(&self, index: usize) -> &str {
        &self.lists[index].name
    }

    pub fn names(&self) -> Vec<String> {
        self.lists.iter().map(|l| l.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FilterlistDef> {
        self.lists.iter()
    }
}

/// File-name slug for a list name.
pub fn slug(name: &str) -> String {
    name.to_lowercase()
        .replace([' ', '/', '.', ','], "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Registry {
        Registry::new(vec![
            FilterlistDef {
                name: "EasyList".into(),
                aliases: vec!["easylist-std".into()],
                version_control: None,
            },
            FilterlistDef {
                name: "EasyPrivacy".into(),
                aliases: vec![],
                version_control: None,
            },
        ])
    }

    #[test]
    fn test_resolve_canonical_and_alias() {
        let reg = sample();
        assert_eq!(reg.resolve("EasyList"), Some(0));
        assert_eq!(reg.resolve("easylist-std"), Some(0));
        assert_eq!(reg.resolve("EasyPrivacy"), Some(1));
        assert_eq!(reg.resolve("no-such-list"), None);
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("AdGuard Base filter"), "adguard-base-filter");
        assert_eq!(slug("uBlock filters, 2024.1"), "ublock-filters--2024-1");
    }
}
