//! Shell configuration, read from `~/.config/pipeshell/config.toml`.
//!
//! Every field has a default, so a missing file or a partial one is fine.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PROMPT: &str = "\\u@\\h:\\w\\$ ";
pub const DEFAULT_MAX_HISTORY: usize = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {}", .path.display(), .source)]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {}: {}", .path.display(), .source)]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Shell configuration, read from `$HOME/.config/pipeshell/config.toml`.
///
/// Every field is optional in the file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Where history is persisted; `None` keeps it in memory only.
    pub history_file: Option<PathBuf>,
    pub alias_file: Option<PathBuf>,
    pub max_history: usize,
    pub prompt: String,
    /// ANSI escape written before the prompt, e.g. `"\u001b[32m"`.
    pub prompt_color: Option<String>,
    /// ANSI escape for the shell's own error lines.
    pub error_color: Option<String>,
    /// Tab completion and history hints at the interactive prompt.
    pub auto_complete: bool,
    pub kill_grace_ms: u64,
    pub poll_interval_ms: u64,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub aliases: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        let dir = config_dir();
        Self {
            history_file: dir.as_ref().map(|d| d.join("history")),
            alias_file: dir.as_ref().map(|d| d.join("aliases.json")),
            max_history: DEFAULT_MAX_HISTORY,
            prompt: DEFAULT_PROMPT.to_string(),
            prompt_color: None,
            error_color: None,
            auto_complete: true,
            kill_grace_ms: 2000,
            poll_interval_ms: 10,
            log_level: "warn".to_string(),
            log_file: None,
            aliases: BTreeMap::new(),
        }
    }
}

/// `$HOME/.config/pipeshell`, if `HOME` is set.
pub fn config_dir() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(Path::new(&home).join(".config").join("pipeshell"))
}

impl Config {
    /// Defaults with no files: nothing is persisted.
    pub fn ephemeral() -> Self {
        Self {
            history_file: None,
            alias_file: None,
            ..Self::default()
        }
    }

    /// Loads `path`, or the default location when `path` is `None`.
    ///
    /// A missing file yields the defaults; an unreadable or malformed one is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match config_dir() {
                Some(dir) => dir.join("config.toml"),
                None => return Ok(Self::default()),
            },
        };
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        Self::parse(&content).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
