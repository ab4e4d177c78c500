//! Feeds of source units for the extract step.
//!
//! A provider lists the units of a context and reads them one at a time;
//! listing failures are setup errors, read failures are per-unit.
use crate::error::IndexError;
use crate::indexer::languages::{Language, LanguageConfig};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A unit known to a provider but not yet read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitRef {
    pub name: String,
    pub language: Language,
}

/// Raw text of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    pub name: String,
    pub language: Language,
    pub text: String,
}

impl SourceUnit {
    pub fn new(name: impl Into<String>, language: Language, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            language,
            text: text.into(),
        }
    }

    pub fn unit_ref(&self) -> UnitRef {
        UnitRef {
            name: self.name.clone(),
            language: self.language,
        }
    }
}

pub trait SourceUnitProvider: Send + Sync {
    /// Every unit of `context`, in a stable order.
    fn list(&self, context: &str) -> Result<Vec<UnitRef>, IndexError>;

    fn read(&self, unit: &UnitRef) -> Result<SourceUnit, IndexError>;
}

/// Walks a directory, honouring `.gitignore`, language toggles and globs.
pub struct DirectoryProvider {
    root: PathBuf,
    languages: Vec<Language>,
    include: Option<GlobSet>,
    ignore: GlobSet,
    selection: Option<BTreeSet<String>>,
}

impl DirectoryProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            languages: Language::all().to_vec(),
            include: None,
            ignore: GlobSet::empty(),
            selection: None,
        }
    }

    pub fn languages(mut self, languages: impl IntoIterator<Item = Language>) -> Self {
        self.languages = languages.into_iter().collect();
        self
    }

    /// Include globs (empty means everything) and ignore globs, matched
    /// against unit names relative to the root.
    pub fn patterns(mut self, include: &[String], ignore: &[String]) -> Result<Self, IndexError> {
        self.include = if include.is_empty() {
            None
        } else {
            Some(build_globset(include)?)
        };
        self.ignore = build_globset(ignore)?;
        Ok(self)
    }

    /// Restricts the walk to exactly these unit names; empty means no restriction.
    pub fn selection(mut self, names: &[String]) -> Self {
        self.selection = if names.is_empty() {
            None
        } else {
            Some(names.iter().map(|n| n.replace('\\', "/")).collect())
        };
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn unit_name(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(rel.to_string_lossy().replace('\\', "/"))
    }

    fn accepts(&self, name: &str) -> bool {
        if self.selection.as_ref().is_some_and(|s| !s.contains(name)) {
            return false;
        }
        if self.include.as_ref().is_some_and(|g| !g.is_match(name)) {
            return false;
        }
        !self.ignore.is_match(name)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, IndexError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| IndexError::Setup(format!("invalid glob `{pattern}`: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| IndexError::Setup(format!("cannot build glob set: {e}")))
}

impl SourceUnitProvider for DirectoryProvider {
    fn list(&self, _context: &str) -> Result<Vec<UnitRef>, IndexError> {
        if !self.root.is_dir() {
            return Err(IndexError::Setup(format!(
                "source root is not a directory: {}",
                self.root.display()
            )));
        }

        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .require_git(false)
            .build();

        let mut units = Vec::new();
        for entry in walker.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() || path.components().any(|c| c.as_os_str() == ".git") {
                continue;
            }
            let Some(name) = self.unit_name(path) else {
                continue;
            };
            if name.ends_with(".d.ts") {
                debug!("Skipping declaration file {name}");
                continue;
            }
            let Some(config) = path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(LanguageConfig::get_by_extension)
            else {
                continue;
            };
            if !self.languages.contains(&config.language) || !self.accepts(&name) {
                continue;
            }
            units.push(UnitRef {
                name,
                language: config.language,
            });
        }

        units.sort();
        Ok(units)
    }

    fn read(&self, unit: &UnitRef) -> Result<SourceUnit, IndexError> {
        let text = fs::read_to_string(self.root.join(&unit.name)).map_err(|e| IndexError::UnitRead {
            unit: unit.name.clone(),
            reason: e.to_string(),
        })?;
        Ok(SourceUnit {
            name: unit.name.clone(),
            language: unit.language,
            text,
        })
    }
}

/// Units held in memory, listed in name order.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    units: BTreeMap<String, SourceUnit>,
}

impl MemoryProvider {
    pub fn new(units: impl IntoIterator<Item = SourceUnit>) -> Self {
        Self {
            units: units.into_iter().map(|u| (u.name.clone(), u)).collect(),
        }
    }

    pub fn insert(&mut self, unit: SourceUnit) {
        self.units.insert(unit.name.clone(), unit);
    }

    pub fn remove(&mut self, name: &str) -> Option<SourceUnit> {
        self.units.remove(name)
    }
}

impl SourceUnitProvider for MemoryProvider {
    fn list(&self, _context: &str) -> Result<Vec<UnitRef>, IndexError> {
        Ok(self.units.values().map(SourceUnit::unit_ref).collect())
    }

    fn read(&self, unit: &UnitRef) -> Result<SourceUnit, IndexError> {
        self.units
            .get(&unit.name)
            .cloned()
            .ok_or_else(|| IndexError::UnitRead {
                unit: unit.name.clone(),
                reason: "no such unit".to_string(),
            })
    }
}
