//! Resolved configuration model, environment identity, and label vocabulary for dockyard.
//!
//! This crate defines the schema layer: the already-resolved devcontainer
//! configuration (`ResolvedConfig`) and its workspace binding (`Workspace`),
//! deterministic identity hashing (`hash_config`, `hash_workspace`,
//! `compute_identity`), the managed container label set, the devcontainer
//! mount-string parser, and `${...}` variable substitution.

pub mod config;
pub mod identity;
pub mod labels;
pub mod mount;
pub mod substitute;
pub mod types;

pub use config::{
    parse_config_file, parse_config_str, BuildSpec, CommandLine, ConfigError,
    FeatureDeclaration, LifecycleCommand, PortSpec, ResolvedConfig, Workspace,
    DEFAULT_CONFIG_PATH, DEFAULT_SINGLE_SERVICE,
};
pub use identity::{
    canonical_workspace_path, compose_project_name, compute_identity, hash_config,
    hash_workspace, EnvironmentIdentity,
};
pub use labels::{managed_labels, LabelMap};
pub use mount::{parse_mount, MountEntry, MountKind};
pub use substitute::SubstitutionContext;
pub use types::{ConfigHash, ContainerId, EnvKey, Plan, WorkspaceHash};
