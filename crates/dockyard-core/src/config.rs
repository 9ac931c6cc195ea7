//! Engine settings: which runtime to drive and where to keep local state.
//!
//! Read from an optional TOML file, then overridden by environment variables.

use crate::CoreError;
use dockyard_runtime::RuntimeSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const ENV_RUNTIME: &str = "DOCKYARD_RUNTIME";
pub const ENV_STATE_DIR: &str = "DOCKYARD_STATE_DIR";
pub const ENV_COMPOSE: &str = "DOCKYARD_COMPOSE";
pub const ENV_MOCK_STATE: &str = "DOCKYARD_MOCK_STATE";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// `docker`, `podman` or `mock`.
    pub runtime: Option<String>,
    pub docker_path: Option<String>,
    pub compose_command: Option<String>,
    pub state_dir: Option<PathBuf>,
    /// Timeout for each external command, measured from its own start; unlimited when unset.
    pub command_timeout_secs: Option<u64>,
    #[serde(skip)]
    pub mock_state: Option<PathBuf>,
}

impl EngineConfig {
    /// `$XDG_CONFIG_HOME/dockyard/config.toml`, falling back to `~/.config`.
    pub fn default_path() -> Option<PathBuf> {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("dockyard").join("config.toml"))
    }

    /// Parse a settings file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            debug!("no engine settings at {}", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content).map_err(|e| CoreError::Settings {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Settings from the default file with environment overrides applied.
    pub fn from_environment() -> Result<Self, CoreError> {
        let config = match Self::default_path() {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        Ok(config.with_overrides(|key| std::env::var(key).ok()))
    }

    /// Apply `DOCKYARD_*` overrides read through `lookup`.
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(runtime) = get(ENV_RUNTIME) {
            self.runtime = Some(runtime);
        }
        if let Some(dir) = get(ENV_STATE_DIR) {
            self.state_dir = Some(PathBuf::from(dir));
        }
        if let Some(compose) = get(ENV_COMPOSE) {
            self.compose_command = Some(compose);
        }
        if let Some(state) = get(ENV_MOCK_STATE) {
            self.mock_state = Some(PathBuf::from(state));
        }
        self
    }

    pub fn runtime_settings(&self) -> RuntimeSettings {
        let defaults = RuntimeSettings::default();
        RuntimeSettings {
            runtime: self.runtime.clone().unwrap_or(defaults.runtime),
            binary: self.docker_path.clone(),
            compose_command: self.compose_command.clone(),
            mock_state: self.mock_state.clone(),
        }
    }

    /// Lock files and other local state. `$XDG_STATE_HOME/dockyard` by default.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        std::env::var_os("XDG_STATE_HOME")
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .or_else(|| {
                std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local").join("state"))
            })
            .unwrap_or_else(std::env::temp_dir)
            .join("dockyard")
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }
}
