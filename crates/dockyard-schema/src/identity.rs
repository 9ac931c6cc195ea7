use crate::config::{ResolvedConfig, Workspace};
use crate::types::{ConfigHash, EnvKey, WorkspaceHash};
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

/// Length of the env key prefix taken from the workspace hash.
const ENV_KEY_LEN: usize = 16;

/// Identity of one workspace's environment, recomputed on every invocation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EnvironmentIdentity {
    pub workspace_path: String,
    pub env_key: EnvKey,
    pub workspace_root_hash: WorkspaceHash,
    pub config_hash: ConfigHash,
    pub compose_project: String,
}

/// Content hash of a resolved configuration.
///
/// Hashes the canonical JSON of [`ResolvedConfig::normalized`], so map key
/// order and the order of set-like lists do not matter. Total: an empty
/// default configuration hashes like any other.
pub fn hash_config(config: &ResolvedConfig) -> ConfigHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"dockyard-config-v1\0");
    match config.canonical_json() {
        Ok(json) => hasher.update(json.as_bytes()),
        Err(_) => hasher.update(format!("{:?}", config.normalized()).as_bytes()),
    };
    ConfigHash::new(hasher.finalize().to_hex().to_string())
}

/// Hash of the canonicalized absolute workspace path.
pub fn hash_workspace(path: &Path) -> WorkspaceHash {
    let canonical = canonical_workspace_path(path);
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"dockyard-workspace-v1\0");
    hasher.update(canonical.to_string_lossy().as_bytes());
    WorkspaceHash::new(hasher.finalize().to_hex().to_string())
}

/// Canonical absolute form of `path`.
///
/// Symlinks are resolved when the path exists; otherwise the path is made
/// absolute and `.`/`..` components are folded lexically.
pub fn canonical_workspace_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return canonical;
    }
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Compose project name for a workspace.
///
/// An explicit name wins. Otherwise the workspace basename is reduced to the
/// characters compose accepts (`[a-z0-9_-]`, alphanumeric first) and suffixed
/// with the env key prefix so two checkouts with the same basename never share
/// a project.
pub fn compose_project_name(workspace: &Path, env_key: &EnvKey, explicit: Option<&str>) -> String {
    if let Some(name) = explicit.map(sanitize_project_name).filter(|n| !n.is_empty()) {
        return name;
    }
    let base = workspace
        .file_name()
        .map(|n| sanitize_project_name(&n.to_string_lossy()))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "dockyard".to_owned());
    format!("{base}-{}", env_key.short(8))
}

fn sanitize_project_name(raw: &str) -> String {
    let lowered: String = raw
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    lowered
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_owned()
}

/// Derive the full identity for a loaded workspace.
pub fn compute_identity(workspace: &Workspace) -> EnvironmentIdentity {
    let workspace_root_hash = hash_workspace(&workspace.folder);
    let env_key = EnvKey::new(workspace_root_hash.short(ENV_KEY_LEN));
    let compose_project = compose_project_name(
        &workspace.folder,
        &env_key,
        workspace.config.compose_project_name.as_deref(),
    );
    EnvironmentIdentity {
        workspace_path: workspace.folder.to_string_lossy().into_owned(),
        env_key,
        workspace_root_hash,
        config_hash: hash_config(&workspace.config),
        compose_project,
    }
}
