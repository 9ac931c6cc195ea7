use crate::config::EngineConfig;
use crate::CoreError;
use dockyard_runtime::{
    select_runtime, CancelToken, ContainerRuntime, HostSelinuxProbe, ProcessOptions, SelinuxProbe,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Everything one invocation needs from the host, built once and passed down.
#[derive(Clone)]
pub struct EngineContext {
    runtime: Arc<dyn ContainerRuntime>,
    selinux: Arc<dyn SelinuxProbe>,
    state_dir: PathBuf,
    cancel: CancelToken,
    stream: bool,
    command_timeout: Option<Duration>,
}

impl EngineContext {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            selinux: Arc::new(HostSelinuxProbe),
            state_dir: state_dir.into(),
            cancel: CancelToken::new(),
            stream: false,
            command_timeout: None,
        }
    }

    /// Select the runtime and per-command timeout described by `config`.
    pub fn from_config(config: &EngineConfig) -> Result<Self, CoreError> {
        let runtime = select_runtime(&config.runtime_settings())?;
        Ok(Self::new(runtime, config.state_dir()).with_command_timeout(config.command_timeout()))
    }

    #[must_use]
    pub fn with_selinux(mut self, probe: Arc<dyn SelinuxProbe>) -> Self {
        self.selinux = probe;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Limit every external command to `timeout`, each measured from its own start.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Tee external command output to stderr.
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn selinux(&self) -> &dyn SelinuxProbe {
        self.selinux.as_ref()
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn process_options(&self) -> ProcessOptions {
        ProcessOptions::new(self.stream, self.cancel.clone()).with_timeout(self.command_timeout)
    }
}
