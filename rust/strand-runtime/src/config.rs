//! Runtime configuration loaded from `strand.toml`.
//!
//! Searches the current directory then its ancestors for a `strand.toml`
//! with a `[runtime]` table. Environment variables `STRAND_WORKERS` and
//! `STRAND_MAX_OPS` override the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

pub const CONFIG_FILE_NAME: &str = "strand.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads; `0` means one per logical CPU.
    pub workers: usize,
    /// Instructions a fiber may execute before it yields its worker.
    pub max_ops_before_yield: usize,
    pub thread_name_prefix: String,
    /// STM conflicts tolerated in one go before the committing fiber yields.
    pub stm_conflicts_before_yield: usize,
    /// Log defects of daemon fibers nobody observes.
    pub log_daemon_defects: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            max_ops_before_yield: 2048,
            thread_name_prefix: "strand-worker".to_string(),
            stm_conflicts_before_yield: 64,
            log_daemon_defects: true,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    runtime: RuntimeConfig,
}

impl RuntimeConfig {
    /// Load config from `strand.toml`, searching current dir then parents,
    /// then apply environment overrides. Returns defaults (plus overrides)
    /// when no readable file is found.
    pub fn load() -> Self {
        let base = match Self::find() {
            Some(path) => match Self::load_from(&path) {
                Ok(cfg) => {
                    tracing::debug!(path = %path.display(), "loaded runtime config");
                    cfg
                }
                Err(err) => {
                    tracing::warn!(%err, "ignoring unreadable runtime config");
                    Self::default()
                }
            },
            None => Self::default(),
        };
        base.with_env_overrides()
    }

    /// Load config from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse a TOML document holding an optional `[runtime]` table.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(s)?;
        Ok(file.runtime)
    }

    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `STRAND_*` overrides looked up through `lookup`.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(n) = parse_override(&lookup, "STRAND_WORKERS") {
            self.workers = n;
        }
        if let Some(n) = parse_override(&lookup, "STRAND_MAX_OPS") {
            self.max_ops_before_yield = n;
        }
        self
    }

    /// Worker count with `0` resolved to the number of logical CPUs.
    pub fn resolved_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }

    pub fn default_template() -> &'static str {
        r#"# strand runtime configuration

[runtime]
# Worker threads (0 = one per logical CPU).
workers = 0
# Instructions a fiber runs before yielding its worker.
max_ops_before_yield = 2048
thread_name_prefix = "strand-worker"
stm_conflicts_before_yield = 64
log_daemon_defects = true
"#
    }

    fn find() -> Option<PathBuf> {
        let mut dir = std::env::current_dir().ok()?;
        loop {
            let candidate = dir.join(CONFIG_FILE_NAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}

fn parse_override(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.trim().parse::<usize>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring non-numeric override");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
