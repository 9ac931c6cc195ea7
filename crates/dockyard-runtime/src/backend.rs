use crate::process::ProcessOptions;
use crate::RuntimeError;
use dockyard_schema::{ContainerId, LabelMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Compose's own per-container service label.
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// One container as reported by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: ContainerId,
    pub name: String,
    pub running: bool,
    pub labels: LabelMap,
}

impl ContainerRecord {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Compose service name, if the container was created by compose.
    pub fn service(&self) -> Option<&str> {
        self.label(COMPOSE_SERVICE_LABEL)
    }
}

/// Conjunction of `key=value` label filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    pub labels: Vec<(String, String)>,
}

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    pub fn matches(&self, labels: &LabelMap) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageBuildRequest {
    pub context: PathBuf,
    pub dockerfile: PathBuf,
    pub tag: String,
    pub build_args: BTreeMap<String, String>,
    pub target: Option<String>,
    pub no_cache: bool,
    pub labels: LabelMap,
}

/// `compose -p <project> -f <file>... <subcommand> <args>...`
#[derive(Debug, Clone, Default)]
pub struct ComposeInvocation {
    pub project: String,
    pub files: Vec<PathBuf>,
    pub subcommand: String,
    pub args: Vec<String>,
}

impl ComposeInvocation {
    pub fn new(project: impl Into<String>, subcommand: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            subcommand: subcommand.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn files(mut self, files: impl IntoIterator<Item = PathBuf>) -> Self {
        self.files.extend(files);
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// A command executed inside a running container.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub container: ContainerId,
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub argv: Vec<String>,
}

/// The operations the engine needs from a container runtime.
///
/// Implementations must be safe to share across threads; parallel lifecycle
/// hooks call [`ContainerRuntime::exec`] concurrently.
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// All containers (running or not) matching the selector.
    fn list_containers(
        &self,
        selector: &LabelSelector,
        opts: &ProcessOptions,
    ) -> Result<Vec<ContainerRecord>, RuntimeError>;

    /// Local image id for a reference, `None` when the image is not present.
    fn image_id(&self, reference: &str, opts: &ProcessOptions)
        -> Result<Option<String>, RuntimeError>;

    fn build_image(
        &self,
        request: &ImageBuildRequest,
        opts: &ProcessOptions,
    ) -> Result<(), RuntimeError>;

    fn compose(
        &self,
        invocation: &ComposeInvocation,
        opts: &ProcessOptions,
    ) -> Result<(), RuntimeError>;

    fn exec(&self, request: &ExecRequest, opts: &ProcessOptions) -> Result<(), RuntimeError>;
}

/// Which runtime to talk to and how.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// `docker`, `podman` or `mock`.
    pub runtime: String,
    /// Override for the runtime binary path.
    pub binary: Option<String>,
    /// Explicit compose command, e.g. `docker-compose` or `podman compose`.
    pub compose_command: Option<String>,
    /// Persist mock runtime state to this file between invocations.
    pub mock_state: Option<PathBuf>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            runtime: "docker".to_owned(),
            binary: None,
            compose_command: None,
            mock_state: None,
        }
    }
}

pub fn select_runtime(settings: &RuntimeSettings) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
    match settings.runtime.as_str() {
        "docker" | "podman" => {
            let binary = settings
                .binary
                .clone()
                .unwrap_or_else(|| settings.runtime.clone());
            Ok(Arc::new(crate::cli::CliRuntime::new(
                &settings.runtime,
                binary,
                settings.compose_command.as_deref(),
            )))
        }
        "mock" => {
            let runtime = match &settings.mock_state {
                Some(path) => crate::mock::MockRuntime::with_state_file(path)?,
                None => crate::mock::MockRuntime::new(),
            };
            Ok(Arc::new(runtime))
        }
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
