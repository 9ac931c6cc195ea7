//! In-memory container runtime used by tests and `DOCKYARD_RUNTIME=mock`.
//!
//! Interprets the subset of compose the engine relies on: service merging
//! across `-f` files, image build-or-pull, label-driven recreation and the
//! `start`/`stop`/`down`/`build` subcommands. State can be persisted to a JSON
//! file so separate processes observe the same "daemon".

use crate::backend::{
    ComposeInvocation, ContainerRecord, ContainerRuntime, ExecRequest, ImageBuildRequest,
    LabelSelector, COMPOSE_PROJECT_LABEL, COMPOSE_SERVICE_LABEL,
};
use crate::process::ProcessOptions;
use crate::RuntimeError;
use dockyard_schema::{ContainerId, LabelMap};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Prefix of the progress line each feature install step prints.
pub const FEATURE_MARKER: &str = "dockyard-feature: ";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MockContainer {
    pub record: ContainerRecord,
    pub project: String,
    pub service: String,
    pub image_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MockState {
    pub containers: Vec<MockContainer>,
    /// Image reference to image id.
    pub images: BTreeMap<String, String>,
    pub next_id: u64,
    pub builds: Vec<String>,
    pub compose_calls: Vec<String>,
    /// `-f` files of each compose call, parallel to `compose_calls`.
    pub compose_files: Vec<Vec<PathBuf>>,
    /// Named volumes, as `<project>_<name>`.
    pub volumes: BTreeSet<String>,
    pub execs: Vec<Vec<String>>,
    pub last_overlay: Option<String>,
    /// Path the last overlay was read from.
    pub last_overlay_path: Option<PathBuf>,
    pub last_dockerfile: Option<String>,
    /// Fail any exec whose command line contains this text.
    pub fail_exec_matching: Option<String>,
    /// Fail an image build at the first Dockerfile line containing this text.
    pub fail_build_matching: Option<String>,
}

impl MockState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn new_image_id(&mut self) -> String {
        format!("sha256:mock{:060}", self.next())
    }

    fn new_container_id(&mut self) -> ContainerId {
        ContainerId::new(format!("mock{:012}", self.next()))
    }

    fn project_containers(&mut self, project: &str) -> impl Iterator<Item = &mut MockContainer> {
        let project = project.to_owned();
        self.containers.iter_mut().filter(move |c| c.project == project)
    }
}

pub struct MockRuntime {
    state: Mutex<MockState>,
    state_file: Option<PathBuf>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            state_file: None,
        }
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load state from `path` when it exists and write it back after every call.
    pub fn with_state_file(path: &Path) -> Result<Self, RuntimeError> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content).map_err(|e| RuntimeError::Parse {
                what: format!("mock state {}", path.display()),
                reason: e.to_string(),
            })?
        } else {
            MockState::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            state_file: Some(path.to_path_buf()),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))
    }

    fn save(&self, state: &MockState) -> Result<(), RuntimeError> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(state).map_err(|e| RuntimeError::Parse {
            what: "mock state".to_owned(),
            reason: e.to_string(),
        })?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut MockState) -> Result<T, RuntimeError>,
    ) -> Result<T, RuntimeError> {
        let mut state = self.lock()?;
        let result = f(&mut state);
        self.save(&state)?;
        result
    }

    fn snapshot(&self) -> MockState {
        self.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn containers(&self) -> Vec<ContainerRecord> {
        self.snapshot()
            .containers
            .into_iter()
            .map(|c| c.record)
            .collect()
    }

    pub fn images(&self) -> BTreeMap<String, String> {
        self.snapshot().images
    }

    pub fn builds(&self) -> Vec<String> {
        self.snapshot().builds
    }

    pub fn build_count(&self) -> usize {
        self.snapshot().builds.len()
    }

    pub fn compose_calls(&self) -> Vec<String> {
        self.snapshot().compose_calls
    }

    pub fn compose_files(&self) -> Vec<Vec<PathBuf>> {
        self.snapshot().compose_files
    }

    pub fn volumes(&self) -> BTreeSet<String> {
        self.snapshot().volumes
    }

    pub fn exec_calls(&self) -> Vec<Vec<String>> {
        self.snapshot().execs
    }

    pub fn last_overlay(&self) -> Option<String> {
        self.snapshot().last_overlay
    }

    pub fn last_overlay_path(&self) -> Option<PathBuf> {
        self.snapshot().last_overlay_path
    }

    pub fn last_dockerfile(&self) -> Option<String> {
        self.snapshot().last_dockerfile
    }

    pub fn insert_image(&self, reference: &str, id: &str) -> Result<(), RuntimeError> {
        self.mutate(|s| {
            s.images.insert(reference.to_owned(), id.to_owned());
            Ok(())
        })
    }

    pub fn remove_image(&self, reference: &str) -> Result<(), RuntimeError> {
        self.mutate(|s| {
            s.images.remove(reference);
            Ok(())
        })
    }

    /// Register a container created outside the engine.
    pub fn insert_container(
        &self,
        project: &str,
        service: &str,
        running: bool,
        mut labels: LabelMap,
    ) -> Result<ContainerId, RuntimeError> {
        self.mutate(|s| {
            let id = s.new_container_id();
            labels.insert(COMPOSE_PROJECT_LABEL.to_owned(), project.to_owned());
            labels.insert(COMPOSE_SERVICE_LABEL.to_owned(), service.to_owned());
            s.containers.push(MockContainer {
                record: ContainerRecord {
                    id: id.clone(),
                    name: format!("{project}-{service}-1"),
                    running,
                    labels,
                },
                project: project.to_owned(),
                service: service.to_owned(),
                image_id: String::new(),
            });
            Ok(id)
        })
    }

    pub fn remove_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.mutate(|s| {
            s.containers.retain(|c| &c.record.id != id);
            Ok(())
        })
    }

    pub fn set_running(&self, id: &ContainerId, running: bool) -> Result<(), RuntimeError> {
        self.mutate(|s| {
            for c in s.containers.iter_mut().filter(|c| &c.record.id == id) {
                c.record.running = running;
            }
            Ok(())
        })
    }

    pub fn fail_exec_matching(&self, needle: Option<&str>) -> Result<(), RuntimeError> {
        self.mutate(|s| {
            s.fail_exec_matching = needle.map(str::to_owned);
            Ok(())
        })
    }

    pub fn fail_build_matching(&self, needle: Option<&str>) -> Result<(), RuntimeError> {
        self.mutate(|s| {
            s.fail_build_matching = needle.map(str::to_owned);
            Ok(())
        })
    }
}

impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn list_containers(
        &self,
        selector: &LabelSelector,
        _opts: &ProcessOptions,
    ) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let state = self.lock()?;
        Ok(state
            .containers
            .iter()
            .filter(|c| selector.matches(&c.record.labels))
            .map(|c| c.record.clone())
            .collect())
    }

    fn image_id(
        &self,
        reference: &str,
        _opts: &ProcessOptions,
    ) -> Result<Option<String>, RuntimeError> {
        Ok(self.lock()?.images.get(reference).cloned())
    }

    fn build_image(
        &self,
        request: &ImageBuildRequest,
        _opts: &ProcessOptions,
    ) -> Result<(), RuntimeError> {
        let dockerfile = std::fs::read_to_string(&request.dockerfile).map_err(|e| {
            failure(
                "mock build",
                format!("cannot read {}: {e}", request.dockerfile.display()),
            )
        })?;
        self.mutate(|s| {
            let mut output = String::new();
            for line in dockerfile.lines() {
                let run = line.trim_start().starts_with("RUN ");
                if let Some(marker) = marker_in(line).filter(|_| run) {
                    output.push_str(FEATURE_MARKER);
                    output.push_str(marker);
                    output.push('\n');
                }
                if s
                    .fail_build_matching
                    .as_deref()
                    .is_some_and(|needle| line.contains(needle))
                {
                    s.last_dockerfile = Some(dockerfile.clone());
                    output.push_str("install.sh: exit status 1\n");
                    return Err(failure("mock build", output));
                }
            }
            let id = s.new_image_id();
            s.images.insert(request.tag.clone(), id);
            s.builds.push(request.tag.clone());
            s.last_dockerfile = Some(dockerfile.clone());
            Ok(())
        })
    }

    fn compose(
        &self,
        invocation: &ComposeInvocation,
        _opts: &ProcessOptions,
    ) -> Result<(), RuntimeError> {
        if invocation.files.is_empty() {
            return Err(failure(
                "mock compose",
                "no configuration file provided: not found".to_owned(),
            ));
        }
        let model = load_model(&invocation.files)?;
        let overlay = match invocation.files.last() {
            Some(path) if invocation.subcommand == "up" => Some(std::fs::read_to_string(path)?),
            _ => None,
        };
        self.mutate(|s| {
            let call = format!("{} {}", invocation.subcommand, invocation.args.join(" "));
            s.compose_calls.push(call.trim_end().to_owned());
            s.compose_files.push(invocation.files.clone());
            if overlay.is_some() {
                s.last_overlay = overlay;
                s.last_overlay_path = invocation.files.last().cloned();
            }
            let (flags, services) = split_args(&invocation.args);
            match invocation.subcommand.as_str() {
                "up" => {
                    compose_up(s, &invocation.project, &model.services, &flags, &services)?;
                    s.volumes.extend(model.volume_names(&invocation.project));
                    Ok(())
                }
                "start" => compose_start(s, &invocation.project, &services),
                "stop" => {
                    for c in s.project_containers(&invocation.project) {
                        if services.is_empty() || services.contains(&c.service) {
                            c.record.running = false;
                        }
                    }
                    Ok(())
                }
                "down" => {
                    s.containers.retain(|c| c.project != invocation.project);
                    if flags.contains("--volumes") || flags.contains("-v") {
                        for name in model.volume_names(&invocation.project) {
                            s.volumes.remove(&name);
                        }
                    }
                    Ok(())
                }
                "build" => compose_build(s, &invocation.project, &model.services, &services),
                other => Err(failure(
                    "mock compose",
                    format!("unsupported subcommand '{other}'"),
                )),
            }
        })
    }

    fn exec(&self, request: &ExecRequest, _opts: &ProcessOptions) -> Result<(), RuntimeError> {
        self.mutate(|s| {
            s.execs.push(request.argv.clone());
            let line = request.argv.join(" ");
            let running = s
                .containers
                .iter()
                .any(|c| c.record.id == request.container && c.record.running);
            if !running {
                return Err(failure(
                    "mock exec",
                    format!("container {} is not running", request.container),
                ));
            }
            if s
                .fail_exec_matching
                .as_deref()
                .is_some_and(|needle| line.contains(needle))
            {
                return Err(failure("mock exec", format!("{line}: exit status 1")));
            }
            Ok(())
        })
    }
}

fn failure(command: &str, output: String) -> RuntimeError {
    RuntimeError::CommandFailed {
        command: command.to_owned(),
        status: "exit code 1".to_owned(),
        output,
    }
}

fn marker_in(line: &str) -> Option<&str> {
    let start = line.find(FEATURE_MARKER)? + FEATURE_MARKER.len();
    let rest = &line[start..];
    let end = rest
        .find(|c: char| c == '\'' || c == '"' || c.is_whitespace())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Separate `-x`/`--flag` arguments from service names.
fn split_args(args: &[String]) -> (BTreeSet<String>, Vec<String>) {
    let mut flags = BTreeSet::new();
    let mut services = Vec::new();
    for arg in args {
        if arg.starts_with('-') {
            flags.insert(arg.clone());
        } else {
            services.push(arg.clone());
        }
    }
    (flags, services)
}

/// Services and top-level volumes merged across compose files.
#[derive(Debug, Default)]
struct MockModel {
    services: BTreeMap<String, Mapping>,
    /// Non-external named volumes.
    volumes: BTreeSet<String>,
}

impl MockModel {
    fn volume_names(&self, project: &str) -> Vec<String> {
        self.volumes.iter().map(|v| format!("{project}_{v}")).collect()
    }
}

/// Merge every compose file in order.
fn load_model(files: &[PathBuf]) -> Result<MockModel, RuntimeError> {
    let mut model = MockModel::default();
    for path in files {
        let content = std::fs::read_to_string(path)?;
        let doc: Value = serde_yaml::from_str(&content).map_err(|e| RuntimeError::Parse {
            what: path.display().to_string(),
            reason: e.to_string(),
        })?;
        if let Some(declared) = doc.get("services").and_then(Value::as_mapping) {
            for (name, body) in declared {
                let (Some(name), Some(body)) = (name.as_str(), body.as_mapping()) else {
                    continue;
                };
                let entry = model.services.entry(name.to_owned()).or_default();
                merge_mapping(entry, body);
            }
        }
        if let Some(volumes) = doc.get("volumes").and_then(Value::as_mapping) {
            for (name, body) in volumes {
                let Some(name) = name.as_str() else { continue };
                let external = body
                    .get("external")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if external {
                    model.volumes.remove(name);
                } else {
                    model.volumes.insert(name.to_owned());
                }
            }
        }
    }
    Ok(model)
}

fn merge_mapping(base: &mut Mapping, overlay: &Mapping) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Mapping(existing)), Value::Mapping(incoming)) => {
                merge_mapping(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn str_field<'a>(service: &'a Mapping, key: &str) -> Option<&'a str> {
    service.get(key).and_then(Value::as_str)
}

fn service_labels(service: &Mapping) -> LabelMap {
    let mut labels = LabelMap::new();
    match service.get("labels") {
        Some(Value::Mapping(map)) => {
            for (k, v) in map {
                let Some(k) = k.as_str() else { continue };
                let v = match v {
                    Value::String(s) => s.clone(),
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    _ => String::new(),
                };
                labels.insert(k.to_owned(), v);
            }
        }
        Some(Value::Sequence(items)) => {
            for item in items.iter().filter_map(Value::as_str) {
                let (k, v) = item.split_once('=').unwrap_or((item, ""));
                labels.insert(k.to_owned(), v.to_owned());
            }
        }
        _ => {}
    }
    labels
}

fn depends_on(service: &Mapping) -> Vec<String> {
    match service.get("depends_on") {
        Some(Value::Sequence(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        Some(Value::Mapping(map)) => map
            .keys()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    }
}

fn image_ref(project: &str, name: &str, service: &Mapping) -> String {
    str_field(service, "image").map_or_else(|| format!("{project}-{name}"), str::to_owned)
}

/// Requested services plus their transitive `depends_on`, or every service.
fn targets(
    model: &BTreeMap<String, Mapping>,
    requested: &[String],
) -> Result<Vec<String>, RuntimeError> {
    if requested.is_empty() {
        return Ok(model.keys().cloned().collect());
    }
    let mut out = Vec::new();
    let mut stack: Vec<String> = requested.iter().rev().cloned().collect();
    while let Some(name) = stack.pop() {
        if out.contains(&name) {
            continue;
        }
        let service = model
            .get(&name)
            .ok_or_else(|| failure("mock compose", format!("no such service: {name}")))?;
        stack.extend(depends_on(service));
        out.push(name);
    }
    Ok(out)
}

fn compose_up(
    s: &mut MockState,
    project: &str,
    model: &BTreeMap<String, Mapping>,
    flags: &BTreeSet<String>,
    requested: &[String],
) -> Result<(), RuntimeError> {
    if model.is_empty() {
        return Err(failure("mock compose up", "no service selected".to_owned()));
    }
    let force = flags.contains("--force-recreate");
    for name in targets(model, requested)? {
        let service = &model[&name];
        let reference = image_ref(project, &name, service);
        let known = s.images.get(&reference).cloned();
        let image_id = match known {
            Some(id) => id,
            None if service.contains_key("build") => {
                let id = s.new_image_id();
                s.images.insert(reference.clone(), id.clone());
                s.builds.push(reference.clone());
                id
            }
            None if str_field(service, "pull_policy") == Some("never") => {
                return Err(failure(
                    "mock compose up",
                    format!("image {reference} not found and pull_policy is never"),
                ));
            }
            None => {
                let id = s.new_image_id();
                s.images.insert(reference.clone(), id.clone());
                id
            }
        };

        let mut labels = service_labels(service);
        labels.insert(COMPOSE_PROJECT_LABEL.to_owned(), project.to_owned());
        labels.insert(COMPOSE_SERVICE_LABEL.to_owned(), name.clone());

        let existing = s
            .containers
            .iter()
            .position(|c| c.project == project && c.service == name);
        match existing {
            Some(idx)
                if !force
                    && s.containers[idx].record.labels == labels
                    && s.containers[idx].image_id == image_id =>
            {
                s.containers[idx].record.running = true;
            }
            _ => {
                if let Some(idx) = existing {
                    s.containers.remove(idx);
                }
                let id = s.new_container_id();
                s.containers.push(MockContainer {
                    record: ContainerRecord {
                        id,
                        name: format!("{project}-{name}-1"),
                        running: true,
                        labels,
                    },
                    project: project.to_owned(),
                    service: name.clone(),
                    image_id,
                });
            }
        }
    }
    Ok(())
}

fn compose_start(s: &mut MockState, project: &str, services: &[String]) -> Result<(), RuntimeError> {
    let mut started = 0usize;
    for c in s.project_containers(project) {
        if services.is_empty() || services.contains(&c.service) {
            c.record.running = true;
            started += 1;
        }
    }
    if started == 0 {
        return Err(failure("mock compose start", "no containers to start".to_owned()));
    }
    Ok(())
}

fn compose_build(
    s: &mut MockState,
    project: &str,
    model: &BTreeMap<String, Mapping>,
    requested: &[String],
) -> Result<(), RuntimeError> {
    let names: Vec<String> = if requested.is_empty() {
        model.keys().cloned().collect()
    } else {
        requested.to_vec()
    };
    for name in names {
        let service = model
            .get(&name)
            .ok_or_else(|| failure("mock compose build", format!("no such service: {name}")))?;
        if !service.contains_key("build") {
            continue;
        }
        let reference = image_ref(project, &name, service);
        let id = s.new_image_id();
        s.images.insert(reference.clone(), id);
        s.builds.push(reference);
    }
    Ok(())
}
