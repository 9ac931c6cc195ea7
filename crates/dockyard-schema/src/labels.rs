//! Container label vocabulary stamped on every managed container.

use crate::identity::EnvironmentIdentity;
use crate::types::Plan;
use std::collections::BTreeMap;

pub type LabelMap = BTreeMap<String, String>;

pub const PREFIX: &str = "dev.dockyard.";
pub const SCHEMA_VERSION: &str = "1";

pub const MANAGED: &str = "dev.dockyard.managed";
pub const ENV_KEY: &str = "dev.dockyard.env_key";
pub const WORKSPACE_ROOT_HASH: &str = "dev.dockyard.workspace_root_hash";
pub const WORKSPACE_PATH: &str = "dev.dockyard.workspace_path";
pub const CONFIG_HASH: &str = "dev.dockyard.config_hash";
pub const PLAN: &str = "dev.dockyard.plan";
pub const COMPOSE_PROJECT: &str = "dev.dockyard.compose_project";
pub const PRIMARY_SERVICE: &str = "dev.dockyard.primary_service";
pub const PRIMARY: &str = "dev.dockyard.primary";
pub const SCHEMA: &str = "dev.dockyard.schema_version";

/// Every label a managed container must carry.
pub const ALL: [&str; 10] = [
    MANAGED,
    ENV_KEY,
    WORKSPACE_ROOT_HASH,
    WORKSPACE_PATH,
    CONFIG_HASH,
    PLAN,
    COMPOSE_PROJECT,
    PRIMARY_SERVICE,
    PRIMARY,
    SCHEMA,
];

/// The full managed label set for one service.
pub fn managed_labels(
    identity: &EnvironmentIdentity,
    plan: Plan,
    primary_service: &str,
    is_primary: bool,
) -> LabelMap {
    let mut labels = LabelMap::new();
    labels.insert(MANAGED.to_owned(), "true".to_owned());
    labels.insert(ENV_KEY.to_owned(), identity.env_key.to_string());
    labels.insert(
        WORKSPACE_ROOT_HASH.to_owned(),
        identity.workspace_root_hash.to_string(),
    );
    labels.insert(WORKSPACE_PATH.to_owned(), identity.workspace_path.clone());
    labels.insert(CONFIG_HASH.to_owned(), identity.config_hash.to_string());
    labels.insert(PLAN.to_owned(), plan.as_str().to_owned());
    labels.insert(COMPOSE_PROJECT.to_owned(), identity.compose_project.clone());
    labels.insert(PRIMARY_SERVICE.to_owned(), primary_service.to_owned());
    labels.insert(PRIMARY.to_owned(), is_primary.to_string());
    labels.insert(SCHEMA.to_owned(), SCHEMA_VERSION.to_owned());
    labels
}

pub fn is_managed(labels: &LabelMap) -> bool {
    labels.get(MANAGED).map(String::as_str) == Some("true")
}

pub fn is_primary(labels: &LabelMap) -> bool {
    labels.get(PRIMARY).map(String::as_str) == Some("true")
}

/// Labels from [`ALL`] that are absent or empty.
pub fn missing_labels(labels: &LabelMap) -> Vec<&'static str> {
    ALL.iter()
        .copied()
        .filter(|key| labels.get(*key).map_or(true, |v| v.is_empty()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConfigHash, EnvKey, WorkspaceHash};

    fn identity() -> EnvironmentIdentity {
        EnvironmentIdentity {
            workspace_path: "/src/demo".to_owned(),
            env_key: EnvKey::new("0123456789abcdef"),
            workspace_root_hash: WorkspaceHash::new("0123456789abcdef0000"),
            config_hash: ConfigHash::new("feed"),
            compose_project: "demo-01234567".to_owned(),
        }
    }

    #[test]
    fn label_set_is_complete() {
        let labels = managed_labels(&identity(), Plan::Compose, "app", true);
        assert!(missing_labels(&labels).is_empty());
        assert!(is_managed(&labels));
        assert!(is_primary(&labels));
        assert_eq!(labels[PLAN], "compose");
    }

    #[test]
    fn non_primary_is_marked_false() {
        let labels = managed_labels(&identity(), Plan::Compose, "app", false);
        assert_eq!(labels[PRIMARY], "false");
        assert!(!is_primary(&labels));
        assert!(missing_labels(&labels).is_empty());
    }

    #[test]
    fn all_labels_share_prefix() {
        assert!(ALL.iter().all(|l| l.starts_with(PREFIX)));
    }

    #[test]
    fn unmanaged_without_label() {
        let mut labels = LabelMap::new();
        assert!(!is_managed(&labels));
        labels.insert(MANAGED.to_owned(), "false".to_owned());
        assert!(!is_managed(&labels));
    }
}
