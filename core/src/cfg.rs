use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::activity::{Activity, Whitelist};

/// Identifier used to compute per-app configuration directories.
#[derive(Clone, Copy)]
pub struct AppId {
    /// Reverse-DNS style qualifier, e.g. `"com"`.
    pub qualifier: &'static str,
    /// Organization or vendor name, e.g. `"local"`.
    pub organization: &'static str,
    /// Application name, e.g. `"vigil"`.
    pub application: &'static str,
}

/// Agent configuration persisted to `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tracing level to use if `RUST_LOG` is not set (e.g. `"info"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Scheduler tick and lookahead window (seconds).
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Seconds a command may run before the reap sweep kills it.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Upper bound on worker tasks.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Ordered regex patterns a command must match; empty allows all.
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Directory for command output files (OS temp dir if unset).
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Root of the offline queue (per-app data dir if unset).
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Extra environment exported to every command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Activities to schedule.
    #[serde(default)]
    pub activities: Vec<Activity>,
}

fn default_log_level() -> String { "info".to_string() }
fn default_tick_secs() -> u64 { 5 }
fn default_command_timeout_secs() -> u64 { 30 }
fn default_max_workers() -> usize { 8 }

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            tick_secs: default_tick_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            max_workers: default_max_workers(),
            whitelist: Vec::new(),
            temp_dir: None,
            data_dir: None,
            env: BTreeMap::new(),
            activities: Vec::new(),
        }
    }
}

/// Reasons a loaded configuration is rejected.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An activity has an empty id.
    #[error("activity #{0} has an empty id")]
    EmptyId(usize),
    /// Two activities share an id.
    #[error("duplicate activity id {0}")]
    DuplicateId(String),
    /// An activity interval is zero.
    #[error("activity {0} has a zero interval")]
    ZeroInterval(String),
    /// An activity command is empty.
    #[error("activity {0} has an empty command")]
    EmptyCommand(String),
    /// A whitelist pattern does not compile.
    #[error("whitelist pattern {pattern:?}: {source}")]
    BadPattern {
        /// Offending pattern.
        pattern: String,
        /// Regex compile error.
        #[source]
        source: regex::Error,
    },
    /// `tick_secs` is zero.
    #[error("tick_secs must be > 0")]
    ZeroTick,
    /// `max_workers` is zero.
    #[error("max_workers must be > 0")]
    ZeroWorkers,
}

impl Config {
    /// Check invariants the scheduler relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_secs == 0 {
            return Err(ConfigError::ZeroTick);
        }
        if self.max_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        let mut seen = HashSet::new();
        for (i, a) in self.activities.iter().enumerate() {
            if a.id.is_empty() {
                return Err(ConfigError::EmptyId(i));
            }
            if !seen.insert(a.id.as_str()) {
                return Err(ConfigError::DuplicateId(a.id.clone()));
            }
            if a.interval == 0 {
                return Err(ConfigError::ZeroInterval(a.id.clone()));
            }
            if a.command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand(a.id.clone()));
            }
        }
        self.whitelist()?;
        Ok(())
    }

    /// Compile the whitelist patterns.
    pub fn whitelist(&self) -> Result<Whitelist, ConfigError> {
        Whitelist::new(&self.whitelist).map_err(|source| {
            let pattern = self
                .whitelist
                .iter()
                .find(|p| regex::Regex::new(p).is_err())
                .cloned()
                .unwrap_or_default();
            ConfigError::BadPattern { pattern, source }
        })
    }

    /// Scheduler tick.
    pub fn tick(&self) -> Duration { Duration::from_secs(self.tick_secs) }

    /// Command timeout.
    pub fn command_timeout(&self) -> Duration { Duration::from_secs(self.command_timeout_secs) }

    /// Resolved temp directory for command output.
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Return the configuration directory for this app, creating it if needed.
pub fn config_dir(app: &AppId) -> Result<PathBuf> {
    let pd = project_dirs(app)?;
    let dir = pd.config_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create config dir {}", dir.display()))?;
    Ok(dir)
}

/// Return the data directory for this app, creating it if needed.
pub fn data_dir(app: &AppId) -> Result<PathBuf> {
    let pd = project_dirs(app)?;
    let dir = pd.data_dir().to_path_buf();
    fs::create_dir_all(&dir).with_context(|| format!("create data dir {}", dir.display()))?;
    Ok(dir)
}

fn project_dirs(app: &AppId) -> Result<ProjectDirs> {
    ProjectDirs::from(app.qualifier, app.organization, app.application)
        .ok_or_else(|| anyhow::anyhow!("failed to resolve ProjectDirs"))
}

/// Path of `config.toml` in the app config dir.
pub fn default_path(app: &AppId) -> Result<PathBuf> {
    Ok(config_dir(app)?.join("config.toml"))
}

/// Load `config.toml` from the app config dir or create a default one.
pub fn load_or_init(app: &AppId) -> Result<Config> {
    let path = default_path(app)?;
    if path.exists() {
        load_from(&path)
    } else {
        let cfg = Config::default();
        save_config(&path, &cfg)?;
        Ok(cfg)
    }
}

/// Load and parse an explicit config file.
pub fn load_from(path: &Path) -> Result<Config> {
    let txt = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config = toml::from_str(&txt).with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg)
}

/// Persist `cfg` to `path` as TOML.
pub fn save_config(path: &Path, cfg: &Config) -> Result<()> {
    let txt = toml::to_string_pretty(cfg).context("serialize config")?;
    fs::write(path, txt).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityKind;

    const SAMPLE: &str = r#"
log_level = "debug"
command_timeout_secs = 10
whitelist = ["^echo", "^df"]

[env]
LANG = "C"

[[activities]]
id = "a1"
command = "echo hi"
interval = 60

[[activities]]
id = "p1"
command = "loadavg"
interval = 30
kind = "plugin"
"#;

    #[test]
    fn parses_with_defaults() {
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.tick_secs, 5);
        assert_eq!(cfg.max_workers, 8);
        assert_eq!(cfg.command_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.activities.len(), 2);
        assert_eq!(cfg.activities[1].kind, ActivityKind::Plugin);
        assert_eq!(cfg.env.get("LANG").map(String::as_str), Some("C"));
        cfg.validate().unwrap();
        assert_eq!(cfg.whitelist().unwrap().len(), 2);
    }

    #[test]
    fn empty_file_is_default() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.command_timeout_secs, 30);
        assert!(cfg.activities.is_empty());
    }

    #[test]
    fn rejects_duplicates_and_zero_intervals() {
        let mut cfg: Config = toml::from_str(SAMPLE).unwrap();
        cfg.activities[1].id = "a1".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::DuplicateId(id)) if id == "a1"));

        let mut cfg: Config = toml::from_str(SAMPLE).unwrap();
        cfg.activities[0].interval = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroInterval(_))));
    }

    #[test]
    fn rejects_bad_pattern() {
        let cfg = Config { whitelist: vec!["(".into()], ..Config::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::BadPattern { pattern, .. }) if pattern == "("));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg: Config = toml::from_str(SAMPLE).unwrap();
        save_config(&path, &cfg).unwrap();
        let back = load_from(&path).unwrap();
        assert_eq!(back.activities, cfg.activities);
        assert_eq!(back.whitelist, cfg.whitelist);
    }
}
