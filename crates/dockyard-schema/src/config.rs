use crate::types::Plan;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Config location relative to the workspace folder when none is given.
pub const DEFAULT_CONFIG_PATH: &str = ".devcontainer/devcontainer.json";

/// Primary service name used by the single-container plan.
pub const DEFAULT_SINGLE_SERVICE: &str = "dev";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("service '{service}' is not declared in the compose files")]
    UndeclaredService { service: String },
    #[error("feature '{feature}' depends on '{dependency}', which is not declared")]
    MissingFeatureDependency { feature: String, dependency: String },
    #[error("feature dependency cycle: {}", .0.join(" -> "))]
    FeatureCycle(Vec<String>),
    #[error("invalid compose file '{}': {reason}", path.display())]
    InvalidCompose { path: PathBuf, reason: String },
}

/// Already-resolved devcontainer configuration.
///
/// Field names follow the devcontainer JSON vocabulary. Keys this engine does
/// not act on are accepted and ignored; they never reach the config hash.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildSpec>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub docker_compose_file: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default)]
    pub run_services: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_folder: Option<String>,
    #[serde(default)]
    pub mounts: Vec<String>,
    #[serde(default)]
    pub container_env: BTreeMap<String, String>,
    #[serde(default)]
    pub remote_env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_user: Option<String>,
    #[serde(default)]
    pub run_args: Vec<String>,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub security_opt: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub init: bool,
    #[serde(default)]
    pub features: Vec<FeatureDeclaration>,
    #[serde(default)]
    pub forward_ports: Vec<PortSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_command: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_create_command: Option<LifecycleCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_create_command: Option<LifecycleCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_start_command: Option<LifecycleCommand>,
    #[serde(default, flatten, skip_serializing)]
    pub ignored: BTreeMap<String, serde_json::Value>,
}

/// Image build definition for the single-container plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// A feature as declared by the configuration, with its metadata already resolved.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureDeclaration {
    pub id: String,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
    /// Directory holding the feature's `install.sh`, relative to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub installs_after: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub init: bool,
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub security_opt: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<String>,
    #[serde(default)]
    pub container_env: BTreeMap<String, String>,
}

/// One command line: a shell string or an argv vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandLine {
    Shell(String),
    Exec(Vec<String>),
}

impl CommandLine {
    /// Argv form; shell strings run through `/bin/sh -c`.
    pub fn argv(&self) -> Vec<String> {
        match self {
            Self::Shell(cmd) => vec!["/bin/sh".to_owned(), "-c".to_owned(), cmd.clone()],
            Self::Exec(args) => args.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Shell(cmd) => cmd.trim().is_empty(),
            Self::Exec(args) => args.is_empty(),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell(cmd) => f.write_str(cmd),
            Self::Exec(args) => f.write_str(&args.join(" ")),
        }
    }
}

/// A lifecycle hook: one command, or a keyed set run concurrently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum LifecycleCommand {
    Single(CommandLine),
    Parallel(BTreeMap<String, CommandLine>),
}

/// A forwarded port: a bare number or a `host:container` mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(untagged)]
pub enum PortSpec {
    Number(u16),
    Text(String),
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(port) => write!(f, "{port}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(file) => vec![file],
        OneOrMany::Many(files) => files,
    })
}

impl ResolvedConfig {
    pub fn plan(&self) -> Plan {
        if self.docker_compose_file.is_empty() {
            Plan::Single
        } else {
            Plan::Compose
        }
    }

    /// Name of the primary service.
    pub fn primary_service(&self) -> &str {
        match self.plan() {
            Plan::Compose => self.service.as_deref().unwrap_or_default(),
            Plan::Single => self.service.as_deref().unwrap_or(DEFAULT_SINGLE_SERVICE),
        }
    }

    /// Primary service first, then each run service once.
    pub fn declared_services(&self) -> Vec<String> {
        let primary = self.primary_service().to_owned();
        let mut out = vec![primary.clone()];
        for svc in &self.run_services {
            if *svc != primary && !out.contains(svc) {
                out.push(svc.clone());
            }
        }
        out
    }

    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.plan() {
            Plan::Compose => {
                if self.service.as_deref().map_or(true, |s| s.trim().is_empty()) {
                    return Err(ConfigError::Invalid(
                        "'service' is required when 'dockerComposeFile' is set".to_owned(),
                    ));
                }
            }
            Plan::Single => {
                if self.image.is_none() && self.build.is_none() {
                    return Err(ConfigError::Invalid(
                        "one of 'image', 'build', or 'dockerComposeFile' is required".to_owned(),
                    ));
                }
            }
        }
        for feature in &self.features {
            if feature.id.trim().is_empty() {
                return Err(ConfigError::Invalid("feature id must not be empty".to_owned()));
            }
        }
        Ok(())
    }

    /// Sorted, deduplicated copy used for hashing. Lists whose order carries
    /// no meaning are sorted; mounts, run args, and features keep their order.
    pub fn normalized(&self) -> Self {
        let mut out = self.clone();
        out.cap_add = normalize_string_list(&self.cap_add);
        out.security_opt = normalize_string_list(&self.security_opt);
        out.run_services = normalize_string_list(&self.run_services);
        out.forward_ports.sort();
        out.forward_ports.dedup();
        for feature in &mut out.features {
            feature.cap_add = normalize_string_list(&feature.cap_add);
            feature.security_opt = normalize_string_list(&feature.security_opt);
            feature.depends_on = normalize_string_list(&feature.depends_on);
            feature.installs_after = normalize_string_list(&feature.installs_after);
        }
        out.ignored.clear();
        out
    }

    pub fn canonical_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.normalized())
    }
}

fn normalize_string_list(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = values
        .iter()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

pub fn parse_config_str(input: &str) -> Result<ResolvedConfig, serde_json::Error> {
    serde_json::from_str(input)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<ResolvedConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    for key in config.ignored.keys() {
        debug!("ignoring config key '{key}' in {}", path.display());
    }
    Ok(config)
}

/// A workspace folder bound to its resolved configuration.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub folder: PathBuf,
    pub config_path: PathBuf,
    pub config: ResolvedConfig,
}

impl Workspace {
    /// Load and validate the config for `folder`, defaulting to
    /// [`DEFAULT_CONFIG_PATH`] when `config_path` is `None`.
    pub fn load(folder: &Path, config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let config_path = match config_path {
            Some(p) if p.is_absolute() => p.to_path_buf(),
            Some(p) => folder.join(p),
            None => folder.join(DEFAULT_CONFIG_PATH),
        };
        let config = parse_config_file(&config_path)?;
        Self::new(folder, config_path, config)
    }

    pub fn new(
        folder: &Path,
        config_path: PathBuf,
        config: ResolvedConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            folder: crate::identity::canonical_workspace_path(folder),
            config_path,
            config,
        })
    }

    pub fn config_dir(&self) -> &Path {
        self.config_path.parent().unwrap_or(Path::new("."))
    }

    /// Resolve a config-relative path.
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.config_dir().join(p)
        }
    }

    pub fn compose_files(&self) -> Vec<PathBuf> {
        self.config
            .docker_compose_file
            .iter()
            .map(|f| self.resolve_path(f))
            .collect()
    }

    pub fn folder_basename(&self) -> String {
        self.folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// In-container workspace path; defaults to `/workspaces/<basename>`.
    pub fn container_workspace_folder(&self) -> String {
        match &self.config.workspace_folder {
            Some(folder) if !folder.trim().is_empty() => folder.trim().to_owned(),
            _ => format!("/workspaces/{}", self.folder_basename()),
        }
    }
}
