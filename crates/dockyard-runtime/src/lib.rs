//! Container runtime backends and host probes for dockyard.
//!
//! This crate implements the boundary to external collaborators: the pluggable
//! `ContainerRuntime` trait with a docker/podman CLI backend and an in-memory
//! mock backend, a subprocess runner honouring cancellation and deadlines, the
//! SELinux mode probe, and prerequisite checking.

pub mod backend;
pub mod cli;
pub mod mock;
pub mod prereq;
pub mod process;
pub mod selinux;

pub use backend::{
    COMPOSE_PROJECT_LABEL, COMPOSE_SERVICE_LABEL,
    select_runtime, ComposeInvocation, ContainerRecord, ContainerRuntime, ExecRequest,
    ImageBuildRequest, LabelSelector, RuntimeSettings,
};
pub use mock::MockRuntime;
pub use prereq::{check_runtime_prereqs, format_missing, MissingPrereq};
pub use process::{CancelToken, CommandOutput, ProcessOptions};
pub use selinux::{FixedSelinuxProbe, HostSelinuxProbe, SelinuxMode, SelinuxProbe};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed ({status})\n{output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },
    #[error("`{0}` was cancelled")]
    Cancelled(String),
    #[error("`{0}` exceeded its deadline")]
    DeadlineExceeded(String),
    #[error("failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
}
