use dockyard_runtime::{ContainerRecord, ContainerRuntime, LabelSelector, ProcessOptions, RuntimeError};
use dockyard_schema::{labels, EnvironmentIdentity};
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

/// Observed state of a workspace's environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Absent,
    Created,
    Running,
    /// Containers exist but were created from a different configuration.
    Stale,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Absent => "absent",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stale => "stale",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub state: LifecycleState,
    pub primary: Option<ContainerRecord>,
    /// Every managed container of this environment.
    pub containers: Vec<ContainerRecord>,
}

impl Classification {
    pub fn primary_id(&self) -> Option<&str> {
        self.primary.as_ref().map(|c| c.id.as_str())
    }

    pub fn is_stale(&self) -> bool {
        self.state == LifecycleState::Stale
    }
}

/// Classify the environment from the containers carrying its labels. Read only.
pub fn classify(
    runtime: &dyn ContainerRuntime,
    identity: &EnvironmentIdentity,
    opts: &ProcessOptions,
) -> Result<Classification, RuntimeError> {
    let selector = LabelSelector::new()
        .with(labels::MANAGED, "true")
        .with(labels::ENV_KEY, identity.env_key.as_str());
    let containers = runtime.list_containers(&selector, opts)?;
    let primary = pick_primary(&containers);

    let state = match &primary {
        None => LifecycleState::Absent,
        Some(_) if containers.iter().any(|c| !same_config(c, identity)) => LifecycleState::Stale,
        Some(p) if p.running => LifecycleState::Running,
        Some(_) => LifecycleState::Created,
    };
    debug!(
        "env {}: {state} ({} containers)",
        identity.env_key,
        containers.len()
    );
    Ok(Classification {
        state,
        primary,
        containers,
    })
}

fn same_config(container: &ContainerRecord, identity: &EnvironmentIdentity) -> bool {
    container.label(labels::CONFIG_HASH) == Some(identity.config_hash.as_str())
}

fn pick_primary(containers: &[ContainerRecord]) -> Option<ContainerRecord> {
    let primaries: Vec<&ContainerRecord> = containers
        .iter()
        .filter(|c| labels::is_primary(&c.labels))
        .collect();
    if primaries.len() > 1 {
        warn!(
            "{} containers claim to be primary for this environment; preferring a running one",
            primaries.len()
        );
    }
    primaries
        .iter()
        .find(|c| c.running)
        .or_else(|| primaries.first())
        .map(|c| (*c).clone())
}
