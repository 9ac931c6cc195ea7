//! Override synthesis: translate resolved configuration into a compose overlay.
//!
//! The overlay is layered last on top of the user's compose files, so every
//! field set here wins under compose's own merge rules. User files are never
//! modified.

use crate::compose::ComposeModel;
use crate::features::FeatureSet;
use crate::image_cache::DerivedImage;
use crate::run_args::{parse_run_args, Ulimit};
use crate::CoreError;
use dockyard_runtime::SelinuxMode;
use dockyard_schema::{
    managed_labels, parse_mount, EnvironmentIdentity, MountEntry, MountKind, Plan, PortSpec,
    SubstitutionContext, Workspace,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Keeps a single-plan container alive when the image's own command would exit.
const KEEP_ALIVE: &str = "trap 'exit 0' TERM INT; while sleep 1000 & wait $!; do :; done";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildOverride {
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Overlay fields for one service.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServiceOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildOverride>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cap_add: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cap_drop: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub security_opt: Vec<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub privileged: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub init: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shm_size: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_hosts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub ulimits: BTreeMap<String, Ulimit>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub sysctls: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tmpfs: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<String>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(v: &bool) -> bool {
    !*v
}

impl ServiceOverride {
    fn add_mount(&mut self, mount: MountEntry, named_volumes: &mut BTreeMap<String, EmptyMap>) {
        match mount.kind {
            MountKind::Tmpfs => push_unique(&mut self.tmpfs, mount.target.clone()),
            MountKind::Volume => {
                if is_named_volume(&mount.source) {
                    named_volumes.insert(mount.source.clone(), EmptyMap::default());
                }
                push_unique(&mut self.volumes, mount.to_string());
            }
            MountKind::Bind => push_unique(&mut self.volumes, mount.to_string()),
        }
    }
}

type EmptyMap = BTreeMap<String, String>;

/// The full overlay document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OverrideDocument {
    pub services: BTreeMap<String, ServiceOverride>,
    /// Named volumes referenced by mounts; compose rejects undeclared ones.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, EmptyMap>,
}

impl OverrideDocument {
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn service(&self, name: &str) -> Option<&ServiceOverride> {
        self.services.get(name)
    }
}

pub struct SynthesisInput<'a> {
    pub workspace: &'a Workspace,
    pub identity: &'a EnvironmentIdentity,
    pub model: &'a ComposeModel,
    pub features: &'a FeatureSet,
    pub derived_image: Option<&'a DerivedImage>,
    pub selinux: SelinuxMode,
    pub substitution: &'a SubstitutionContext,
}

/// Overlay plus the non-fatal diagnostics raised while building it.
#[derive(Debug, Clone, Default)]
pub struct Synthesis {
    pub document: OverrideDocument,
    pub diagnostics: Vec<String>,
}

pub fn synthesize(input: &SynthesisInput<'_>) -> Result<Synthesis, CoreError> {
    let config = &input.workspace.config;
    let plan = config.plan();
    let primary = config.primary_service();
    let services = config.declared_services();
    input.model.require_all(&services)?;

    let relabel = cfg!(target_os = "linux") && input.selinux.is_enforcing();
    let workspace_mount = MountEntry::bind(
        input.identity.workspace_path.clone(),
        input.workspace.container_workspace_folder(),
    )
    .with_relabel(relabel);

    let mut out = Synthesis::default();
    for name in &services {
        let is_primary = name == primary;
        let mut svc = ServiceOverride {
            labels: managed_labels(input.identity, plan, primary, is_primary),
            volumes: vec![workspace_mount.to_string()],
            ..ServiceOverride::default()
        };
        if is_primary {
            primary_service(input, &mut svc, &mut out, relabel)?;
        } else {
            svc.pull_policy = Some("build".to_owned());
        }
        out.document.services.insert(name.clone(), svc);
    }
    Ok(out)
}

fn primary_service(
    input: &SynthesisInput<'_>,
    svc: &mut ServiceOverride,
    out: &mut Synthesis,
    relabel: bool,
) -> Result<(), CoreError> {
    let workspace = input.workspace;
    let config = &workspace.config;
    let name = config.primary_service();
    let subst = input.substitution;
    let model_service = input.model.require(name)?;

    match input.derived_image {
        Some(derived) => {
            if model_service.image.is_none() && !model_service.has_build {
                return Err(CoreError::Synthesis {
                    service: name.to_owned(),
                    reason: "derived image requested but the service has neither image nor build"
                        .to_owned(),
                });
            }
            svc.image = Some(derived.tag.clone());
            svc.pull_policy = Some("never".to_owned());
        }
        None if config.plan() == Plan::Single => {
            if let Some(image) = &config.image {
                svc.image = Some(image.clone());
            } else if let Some(build) = &config.build {
                svc.build = Some(BuildOverride {
                    context: workspace
                        .resolve_path(build.context.as_deref().unwrap_or("."))
                        .to_string_lossy()
                        .into_owned(),
                    dockerfile: build.dockerfile.as_ref().map(|d| {
                        workspace.resolve_path(d).to_string_lossy().into_owned()
                    }),
                    args: build.args.clone(),
                    target: build.target.clone(),
                });
            }
        }
        None => {}
    }

    if config.plan() == Plan::Single && config.override_command != Some(false) {
        svc.command = Some(vec!["/bin/sh".to_owned(), "-c".to_owned(), KEEP_ALIVE.to_owned()]);
    }

    for (k, v) in config.container_env.iter().chain(&config.remote_env) {
        svc.environment.insert(k.clone(), subst.substitute(v));
    }

    for raw in &config.mounts {
        add_mount_string(svc, &mut out.document.volumes, &subst.substitute(raw), relabel);
    }

    if let Some(user) = config.remote_user.as_ref().or(config.container_user.as_ref()) {
        svc.user = Some(subst.substitute(user));
    }

    // runArgs replay
    let run = parse_run_args(&config.run_args);
    for (k, v) in run.labels {
        svc.labels.entry(k).or_insert(v);
    }
    svc.cap_add.extend(run.cap_add);
    svc.cap_drop.extend(run.cap_drop);
    svc.security_opt.extend(run.security_opt);
    svc.devices.extend(run.devices);
    svc.extra_hosts.extend(run.extra_hosts);
    svc.tmpfs.extend(run.tmpfs);
    svc.ports.extend(run.ports);
    svc.network_mode = run.network_mode;
    svc.ipc = run.ipc;
    svc.pid = run.pid;
    svc.shm_size = run.shm_size;
    svc.privileged = run.privileged;
    svc.init = run.init;
    svc.sysctls = run.sysctls;
    svc.ulimits = run.ulimits;

    // feature requirements
    for feature in input.features.iter() {
        for cap in &feature.cap_add {
            push_unique(&mut svc.cap_add, cap.clone());
        }
        for opt in &feature.security_opt {
            push_unique(&mut svc.security_opt, opt.clone());
        }
        for raw in &feature.mounts {
            add_mount_string(svc, &mut out.document.volumes, &subst.substitute(raw), relabel);
        }
    }
    let privileged = input.features.privileged_requesters();
    if !privileged.is_empty() {
        let msg = format!(
            "privileged mode enabled at the request of feature(s): {}",
            privileged.join(", ")
        );
        warn!("{msg}");
        out.diagnostics.push(msg);
        svc.privileged = true;
    }
    if input.features.requires_init() {
        svc.init = true;
    }

    // config-level settings are additive
    for cap in &config.cap_add {
        push_unique(&mut svc.cap_add, cap.clone());
    }
    for opt in &config.security_opt {
        push_unique(&mut svc.security_opt, opt.clone());
    }
    svc.privileged |= config.privileged;
    svc.init |= config.init;

    for port in &config.forward_ports {
        if let Some(mapping) = port_mapping(port, input.model) {
            push_unique(&mut svc.ports, mapping);
        }
    }

    // managed labels always win over runArgs labels
    svc.labels.extend(managed_labels(
        input.identity,
        config.plan(),
        name,
        true,
    ));
    Ok(())
}

fn add_mount_string(
    svc: &mut ServiceOverride,
    named_volumes: &mut BTreeMap<String, EmptyMap>,
    raw: &str,
    relabel: bool,
) {
    match parse_mount(raw) {
        Some(mount) => svc.add_mount(mount.with_relabel(relabel), named_volumes),
        None => debug!("dropping unparseable mount '{raw}'"),
    }
}

/// Compose port string for a forwarded port. `service:port` entries naming
/// another service are reachable on the compose network already.
fn port_mapping(port: &PortSpec, model: &ComposeModel) -> Option<String> {
    match port {
        PortSpec::Number(n) => Some(format!("{n}:{n}")),
        PortSpec::Text(text) => {
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            match text.split_once(':') {
                Some((host, _)) if model.contains(host) => {
                    debug!("forwardPorts: '{text}' targets another service; skipping");
                    None
                }
                _ => Some(text.to_owned()),
            }
        }
    }
}

fn is_named_volume(source: &str) -> bool {
    !(source.starts_with('/') || source.starts_with('.') || source.starts_with('~'))
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}
