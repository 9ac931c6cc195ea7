//! Feature resolution and dependency ordering.

use dockyard_schema::{ConfigError, FeatureDeclaration, Workspace};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// A declared feature with its source located on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFeature {
    pub id: String,
    pub options: BTreeMap<String, Value>,
    /// Local directory holding `install.sh`, when the feature ships one.
    pub source_dir: Option<PathBuf>,
    pub privileged: bool,
    pub init: bool,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    pub mounts: Vec<String>,
    pub container_env: BTreeMap<String, String>,
}

impl ResolvedFeature {
    fn from_declaration(decl: &FeatureDeclaration, workspace: &Workspace) -> Self {
        let source_dir = match &decl.source {
            Some(source) => Some(workspace.resolve_path(source)),
            None if decl.id.starts_with("./") || decl.id.starts_with("../") => {
                Some(workspace.resolve_path(&decl.id))
            }
            None => None,
        };
        Self {
            id: decl.id.clone(),
            options: decl.options.clone(),
            source_dir,
            privileged: decl.privileged,
            init: decl.init,
            cap_add: decl.cap_add.clone(),
            security_opt: decl.security_opt.clone(),
            mounts: decl.mounts.clone(),
            container_env: decl.container_env.clone(),
        }
    }

    /// Options as `devcontainer-features.env` lines: upper-cased names,
    /// single-quoted values.
    pub fn options_env(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.options {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            out.push_str(&option_env_name(name));
            out.push('=');
            out.push_str(&shell_quote(&value));
            out.push('\n');
        }
        out
    }
}

/// Features in installation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSet {
    features: Vec<ResolvedFeature>,
}

impl FeatureSet {
    /// Resolve the workspace's declared features and order them.
    pub fn resolve(workspace: &Workspace) -> Result<Self, ConfigError> {
        let decls = &workspace.config.features;
        let order = install_order(decls)?;
        Ok(Self {
            features: order
                .into_iter()
                .map(|idx| ResolvedFeature::from_declaration(&decls[idx], workspace))
                .collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedFeature> {
        self.features.iter()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.features.iter().map(|f| f.id.as_str()).collect()
    }

    /// Ids of features that require a privileged container.
    pub fn privileged_requesters(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter(|f| f.privileged)
            .map(|f| f.id.as_str())
            .collect()
    }

    pub fn requires_init(&self) -> bool {
        self.features.iter().any(|f| f.init)
    }
}

/// Indices of `decls` in installation order.
///
/// Kahn's algorithm over `dependsOn` (hard) and `installsAfter` (soft, only
/// when the target is declared) edges. Among ready features the earliest
/// declared goes first.
pub fn install_order(decls: &[FeatureDeclaration]) -> Result<Vec<usize>, ConfigError> {
    let mut index: BTreeMap<&str, usize> = BTreeMap::new();
    for (i, decl) in decls.iter().enumerate() {
        if index.insert(decl.id.as_str(), i).is_some() {
            return Err(ConfigError::Invalid(format!(
                "feature '{}' is declared more than once",
                decl.id
            )));
        }
    }

    // prerequisites[i]: features that must install before i
    let mut prerequisites: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); decls.len()];
    for (i, decl) in decls.iter().enumerate() {
        for dep in &decl.depends_on {
            let &j = index
                .get(dep.as_str())
                .ok_or_else(|| ConfigError::MissingFeatureDependency {
                    feature: decl.id.clone(),
                    dependency: dep.clone(),
                })?;
            prerequisites[i].insert(j);
        }
        for after in &decl.installs_after {
            if let Some(&j) = index.get(after.as_str()) {
                prerequisites[i].insert(j);
            }
        }
    }

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); decls.len()];
    let mut indegree: Vec<usize> = vec![0; decls.len()];
    for (i, prereqs) in prerequisites.iter().enumerate() {
        indegree[i] = prereqs.len();
        for &j in prereqs {
            dependents[j].push(i);
        }
    }

    let mut ready: BTreeSet<usize> = (0..decls.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(decls.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &d in &dependents[next] {
            indegree[d] -= 1;
            if indegree[d] == 0 {
                ready.insert(d);
            }
        }
    }

    if order.len() < decls.len() {
        let remaining: BTreeSet<usize> = (0..decls.len()).filter(|i| !order.contains(i)).collect();
        let cycle = find_cycle(&prerequisites, &remaining)
            .into_iter()
            .map(|i| decls[i].id.clone())
            .collect();
        return Err(ConfigError::FeatureCycle(cycle));
    }
    Ok(order)
}

/// Walk prerequisite edges inside `remaining` until a node repeats.
fn find_cycle(prerequisites: &[BTreeSet<usize>], remaining: &BTreeSet<usize>) -> Vec<usize> {
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(&next) = prerequisites[current]
            .iter()
            .find(|p| remaining.contains(p))
        else {
            return path;
        };
        if let Some(pos) = path.iter().position(|&n| n == next) {
            let mut cycle = path.split_off(pos);
            cycle.push(next);
            return cycle;
        }
        path.push(next);
        current = next;
    }
}

/// blake3 over every file below `dir`, in sorted relative-path order.
pub fn hash_source_dir(dir: &Path) -> std::io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut entries = Vec::new();
    collect_files(dir, dir, &mut entries)?;
    entries.sort();
    for (rel, full) in entries {
        hasher.update(rel.as_bytes());
        hasher.update(b"\0");
        hasher.update(&fs::read(&full)?);
        hasher.update(b"\0");
    }
    Ok(hasher.finalize().to_hex().to_string())
}

fn collect_files(root: &Path, current: &Path, out: &mut Vec<(String, PathBuf)>) -> std::io::Result<()> {
    for entry in fs::read_dir(current)? {
        let full = entry?.path();
        let meta = full.symlink_metadata()?;
        if meta.is_dir() {
            collect_files(root, &full, out)?;
        } else if meta.is_file() {
            let rel = full
                .strip_prefix(root)
                .map_err(|e| std::io::Error::other(format!("path strip: {e}")))?
                .to_string_lossy()
                .into_owned();
            out.push((rel, full));
        }
    }
    Ok(())
}

/// Recursively copy a feature source directory into a build context.
pub fn copy_source_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = from.symlink_metadata()?;
        if meta.is_dir() {
            copy_source_dir(&from, &to)?;
        } else if meta.is_file() {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

fn option_env_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
