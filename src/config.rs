/// Configuration module for codekb.
///
/// Handles loading, validating, and providing default configuration values.
/// Files ending in `.yaml`/`.yml` are read as YAML, anything else as JSON.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::IndexError;
use crate::indexer::languages::{Denylists, Language};
use crate::source::DirectoryProvider;

pub const DEFAULT_CONFIG_PATH: &str = "codekb.json";

// ── Default value functions ──────────────────────────────────────────

fn default_db_path() -> String {
    "./codekb.db".to_string()
}

fn default_context() -> String {
    "DEFAULT".to_string()
}

fn default_root() -> String {
    "./".to_string()
}

fn default_ignore_patterns() -> Vec<String> {
    vec![
        "**/node_modules/**".to_string(),
        "**/vendor/**".to_string(),
        "**/*.min.js".to_string(),
    ]
}

fn default_workers() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_history_capacity() -> usize {
    1000
}

fn default_snapshot_every() -> usize {
    10
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Project context every run writes into.
    #[serde(default = "default_context")]
    pub context: String,

    /// Directory walked for source units.
    #[serde(default = "default_root")]
    pub root: String,

    #[serde(default)]
    pub languages: LanguagesConfig,

    #[serde(default)]
    pub include_patterns: Vec<String>,

    #[serde(default = "default_ignore_patterns")]
    pub ignore_patterns: Vec<String>,

    /// When non-empty, only these unit names (relative to `root`) are indexed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_selection: Vec<String>,

    /// Additional denylist words per language name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_builtins: BTreeMap<String, Vec<String>>,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LanguagesConfig {
    #[serde(default = "default_true")]
    pub sql: bool,

    #[serde(default = "default_true")]
    pub javascript: bool,

    #[serde(default = "default_true")]
    pub typescript: bool,

    #[serde(default = "default_true")]
    pub php: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_history_capacity")]
    pub capacity: usize,

    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: usize,

    /// JSON file the history is persisted to; kept in memory only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            context: default_context(),
            root: default_root(),
            languages: LanguagesConfig::default(),
            include_patterns: Vec::new(),
            ignore_patterns: default_ignore_patterns(),
            file_selection: Vec::new(),
            extra_builtins: BTreeMap::new(),
            workers: default_workers(),
            history: HistoryConfig::default(),
        }
    }
}

impl Default for LanguagesConfig {
    fn default() -> Self {
        Self {
            sql: default_true(),
            javascript: default_true(),
            typescript: default_true(),
            php: default_true(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: default_history_capacity(),
            snapshot_every: default_snapshot_every(),
            path: None,
        }
    }
}

impl LanguagesConfig {
    #[must_use]
    pub fn enabled(&self) -> Vec<Language> {
        Language::all()
            .into_iter()
            .filter(|lang| match lang {
                Language::Sql => self.sql,
                Language::JavaScript => self.javascript,
                Language::TypeScript => self.typescript,
                Language::Php => self.php,
            })
            .collect()
    }
}

// ── Config implementation ────────────────────────────────────────────

fn is_yaml(path: &str) -> bool {
    matches!(
        Path::new(path).extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    )
}

impl Config {
    /// Load configuration from a JSON or YAML file.
    ///
    /// If `config_path` is empty, defaults to [`DEFAULT_CONFIG_PATH`].
    /// If the file does not exist, returns a default config and generates a
    /// template for the default path.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            DEFAULT_CONFIG_PATH
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            if path == DEFAULT_CONFIG_PATH {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let parsed: Result<Config> = if is_yaml(path) {
            serde_yaml::from_str(&data).map_err(anyhow::Error::from)
        } else {
            serde_json::from_str(&data).map_err(anyhow::Error::from)
        };
        let cfg = match parsed {
            Ok(c) => c,
            Err(e) => {
                warn!("Invalid configuration in {path}: {e}");
                warn!("Using default configuration");
                return Ok(Self::default());
            }
        };

        info!("Loaded configuration from {path}");
        Ok(cfg)
    }

    /// Save configuration, choosing the format by extension.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = if is_yaml(path) {
            serde_yaml::to_string(self).context("failed to marshal config")?
        } else {
            serde_json::to_string_pretty(self).context("failed to marshal config")?
        };
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.context.trim().is_empty(), "context must not be empty");
        anyhow::ensure!(!self.db_path.is_empty(), "db_path must not be empty");
        anyhow::ensure!(self.workers > 0, "workers must be positive");
        anyhow::ensure!(self.history.capacity > 0, "history.capacity must be positive");
        anyhow::ensure!(
            self.history.snapshot_every > 0,
            "history.snapshot_every must be positive"
        );
        anyhow::ensure!(
            !self.languages.enabled().is_empty(),
            "at least one language must be enabled"
        );
        for name in self.extra_builtins.keys() {
            anyhow::ensure!(
                name.parse::<Language>().is_ok(),
                "extra_builtins: unsupported language `{name}`"
            );
        }
        for pattern in self.include_patterns.iter().chain(&self.ignore_patterns) {
            globset::Glob::new(pattern).with_context(|| format!("invalid glob pattern: {pattern}"))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn root_dir(&self) -> PathBuf {
        PathBuf::from(&self.root)
    }

    #[must_use]
    pub fn denylists(&self) -> Denylists {
        Denylists::with_extras(&self.extra_builtins)
    }

    /// Provider walking `root` with this configuration's filters.
    pub fn directory_provider(&self) -> std::result::Result<DirectoryProvider, IndexError> {
        Ok(DirectoryProvider::new(self.root_dir())
            .languages(self.languages.enabled())
            .patterns(&self.include_patterns, &self.ignore_patterns)?
            .selection(&self.file_selection))
    }
}

// ── Tests ────────────────────────────────────────────────────────────
