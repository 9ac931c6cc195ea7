//! `${...}` variable substitution for user names, mounts and environment values.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    pub local_workspace_folder: String,
    pub container_workspace_folder: String,
    pub local_env: BTreeMap<String, String>,
}

impl SubstitutionContext {
    /// Context backed by the current process environment.
    pub fn from_host(local_workspace_folder: &str, container_workspace_folder: &str) -> Self {
        Self {
            local_workspace_folder: local_workspace_folder.to_owned(),
            container_workspace_folder: container_workspace_folder.to_owned(),
            local_env: std::env::vars().collect(),
        }
    }

    /// Replace every known variable in `input`. Unknown variables and
    /// unterminated `${` sequences are kept verbatim.
    pub fn substitute(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return out;
            };
            let name = &after[..end];
            match self.resolve(name) {
                Some(value) => out.push_str(&value),
                None => {
                    out.push_str("${");
                    out.push_str(name);
                    out.push('}');
                }
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        out
    }

    fn resolve(&self, name: &str) -> Option<String> {
        match name {
            "localWorkspaceFolder" => Some(self.local_workspace_folder.clone()),
            "localWorkspaceFolderBasename" => Some(basename(&self.local_workspace_folder)),
            "containerWorkspaceFolder" => Some(self.container_workspace_folder.clone()),
            "containerWorkspaceFolderBasename" => {
                Some(basename(&self.container_workspace_folder))
            }
            _ => {
                let spec = name
                    .strip_prefix("localEnv:")
                    .or_else(|| name.strip_prefix("env:"))?;
                let (var, default) = match spec.split_once(':') {
                    Some((var, default)) => (var, default),
                    None => (spec, ""),
                };
                Some(
                    self.local_env
                        .get(var)
                        .cloned()
                        .unwrap_or_else(|| default.to_owned()),
                )
            }
        }
    }
}

fn basename(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_owned()
}
