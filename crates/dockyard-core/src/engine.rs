use crate::classify::{classify, Classification, LifecycleState};
use crate::compose::ComposeModel;
use crate::concurrency::EnvLock;
use crate::context::EngineContext;
use crate::features::FeatureSet;
use crate::hooks::{run_hook, HookPhase, HookTarget};
use crate::image_cache::{CacheOutcome, DerivedImage, FeatureImageCache};
use crate::lifecycle::{plan_start, plan_stop, plan_up, StartAction, StopAction, UpAction, UpFlags};
use crate::synthesize::{synthesize, OverrideDocument, Synthesis, SynthesisInput};
use crate::CoreError;
use dockyard_runtime::{ComposeInvocation, ContainerRecord, RuntimeError};
use dockyard_schema::{
    compute_identity, ContainerId, EnvironmentIdentity, Plan, SubstitutionContext, Workspace,
};
use serde::Serialize;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Reconciles a workspace's declared environment with the container runtime.
///
/// Every mutating operation holds the environment's [`EnvLock`] for its whole
/// duration and recomputes identity and classification from scratch; nothing
/// is cached between invocations except what the runtime itself stores.
pub struct Engine {
    ctx: EngineContext,
}

#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    /// Recreate containers even when nothing changed.
    pub recreate: bool,
    /// Rebuild the derived image and service images before starting.
    pub rebuild: bool,
    pub no_cache: bool,
    /// Restrict to these services; empty means every declared service.
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DownOptions {
    pub volumes: bool,
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub no_cache: bool,
    /// Bypass the derived image cache.
    pub force: bool,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpOutcome {
    AlreadyRunning,
    Started,
    Created,
    Recreated,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpReport {
    pub outcome: UpOutcome,
    pub container_id: Option<ContainerId>,
    pub compose_project: String,
    pub env_key: String,
    pub derived_image: Option<DerivedImage>,
    pub cache: Option<CacheOutcome>,
    pub hooks: Vec<HookPhase>,
    pub diagnostics: Vec<String>,
}

/// Result of `start`, `stop` and `down`.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleReport {
    pub command: &'static str,
    /// False when the environment was already in the requested state.
    pub changed: bool,
    pub state: LifecycleState,
    pub compose_project: String,
    pub hooks: Vec<HookPhase>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub compose_project: String,
    pub derived_image: Option<DerivedImage>,
    pub cache: Option<CacheOutcome>,
    pub services_built: Vec<String>,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: LifecycleState,
    pub plan: Plan,
    pub primary_service: String,
    #[serde(flatten)]
    pub identity: EnvironmentIdentity,
    pub primary: Option<ContainerRecord>,
    pub containers: Vec<ContainerRecord>,
}

/// Derived image and overlay for one `up` or `build`.
struct Staged {
    derived: Option<DerivedImage>,
    cache: Option<CacheOutcome>,
    synthesis: Synthesis,
}

/// Per-invocation view of a workspace, computed before anything is spawned.
struct Prepared<'w> {
    workspace: &'w Workspace,
    identity: EnvironmentIdentity,
    model: ComposeModel,
    features: FeatureSet,
    substitution: SubstitutionContext,
}

impl<'w> Prepared<'w> {
    fn new(workspace: &'w Workspace, selected: &[String]) -> Result<Self, CoreError> {
        let model = ComposeModel::for_workspace(workspace)?;
        model.require_all(&workspace.config.declared_services())?;
        model.require_all(selected)?;
        let features = FeatureSet::resolve(workspace)?;
        let identity = compute_identity(workspace);
        let substitution = SubstitutionContext::from_host(
            &identity.workspace_path,
            &workspace.container_workspace_folder(),
        );
        Ok(Self {
            workspace,
            identity,
            model,
            features,
            substitution,
        })
    }

    fn project(&self) -> &str {
        &self.identity.compose_project
    }

    /// User compose files; the single plan has none.
    fn user_files(&self) -> Vec<PathBuf> {
        self.model.files.clone()
    }

    /// Services to bring up. The primary always leads a non-empty selection.
    fn services(&self, selected: &[String]) -> Vec<String> {
        if selected.is_empty() {
            return self.workspace.config.declared_services();
        }
        let mut services = vec![self.workspace.config.primary_service().to_owned()];
        for name in selected {
            if !services.contains(name) {
                services.push(name.clone());
            }
        }
        services
    }

    /// The selection as given, or every declared service.
    fn selection(&self, selected: &[String]) -> Vec<String> {
        if selected.is_empty() {
            self.workspace.config.declared_services()
        } else {
            selected.to_vec()
        }
    }

    fn hook_target(&self, container: ContainerId) -> HookTarget {
        let config = &self.workspace.config;
        let subst = &self.substitution;
        HookTarget {
            container,
            user: config
                .remote_user
                .as_ref()
                .or(config.container_user.as_ref())
                .map(|u| subst.substitute(u)),
            workdir: Some(self.workspace.container_workspace_folder()),
            env: config
                .remote_env
                .iter()
                .map(|(k, v)| (k.clone(), subst.substitute(v)))
                .collect(),
        }
    }
}

impl Engine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    fn lock(&self, identity: &EnvironmentIdentity) -> Result<EnvLock, CoreError> {
        EnvLock::acquire(self.ctx.state_dir(), &identity.env_key)
    }

    fn classify(&self, identity: &EnvironmentIdentity) -> Result<Classification, CoreError> {
        Ok(classify(
            self.ctx.runtime().as_ref(),
            identity,
            &self.ctx.process_options(),
        )?)
    }

    fn compose(&self, prepared: &Prepared<'_>, files: Vec<PathBuf>, subcommand: &str, args: Vec<String>) -> Result<(), CoreError> {
        let invocation = ComposeInvocation::new(prepared.project(), subcommand)
            .files(files)
            .args(args);
        self.ctx
            .runtime()
            .compose(&invocation, &self.ctx.process_options())?;
        Ok(())
    }

    /// Classify the environment without changing anything.
    pub fn status(&self, workspace: &Workspace) -> Result<StatusReport, CoreError> {
        let prepared = Prepared::new(workspace, &[])?;
        let classification = self.classify(&prepared.identity)?;
        Ok(StatusReport {
            state: classification.state,
            plan: workspace.config.plan(),
            primary_service: workspace.config.primary_service().to_owned(),
            identity: prepared.identity,
            primary: classification.primary,
            containers: classification.containers,
        })
    }

    /// Bring the environment to RUNNING, creating or recreating it as needed.
    pub fn up(&self, workspace: &Workspace, opts: &UpOptions) -> Result<UpReport, CoreError> {
        let prepared = Prepared::new(workspace, &opts.services)?;
        let _lock = self.lock(&prepared.identity)?;
        let before = self.classify(&prepared.identity)?;
        let flags = UpFlags {
            recreate: opts.recreate,
            rebuild: opts.rebuild,
        };
        let action = plan_up(before.state, flags);
        info!(
            "up: environment {} is {}, action {action:?}",
            prepared.identity.env_key, before.state
        );

        let mut report = UpReport {
            outcome: UpOutcome::AlreadyRunning,
            container_id: before.primary.as_ref().map(|c| c.id.clone()),
            compose_project: prepared.project().to_owned(),
            env_key: prepared.identity.env_key.to_string(),
            derived_image: None,
            cache: None,
            hooks: Vec::new(),
            diagnostics: Vec::new(),
        };

        match action {
            UpAction::AlreadyRunning => {
                info!("environment already running");
                return Ok(report);
            }
            UpAction::Start => {
                self.with_project_files(&prepared, |files| {
                    self.compose(&prepared, files, "start", prepared.services(&opts.services))
                })?;
                report.outcome = UpOutcome::Started;
                self.run_start_hooks(&prepared, &mut report.hooks)?;
                return Ok(report);
            }
            UpAction::Create { force_recreate } => {
                let staged = self.stage(&prepared, opts.rebuild, opts.no_cache)?;
                let derived = staged.derived.is_some();
                self.with_overlay(&staged.synthesis.document, |overlay| {
                    if opts.rebuild {
                        let candidates = prepared.services(&opts.services);
                        self.build_services(&prepared, overlay, derived, opts.no_cache, candidates)?;
                    }
                    let mut args = vec!["-d".to_owned()];
                    if force_recreate {
                        args.push("--force-recreate".to_owned());
                    }
                    args.extend(prepared.services(&opts.services));
                    let mut files = prepared.user_files();
                    files.push(overlay.to_path_buf());
                    self.compose(&prepared, files, "up", args)
                })?;
                report.derived_image = staged.derived;
                report.cache = staged.cache;
                report.diagnostics = staged.synthesis.diagnostics;
            }
        }

        let after = self.classify(&prepared.identity)?;
        let Some(primary) = after.primary else {
            return Err(RuntimeError::ExecFailed(format!(
                "primary service '{}' has no container after `compose up`",
                workspace.config.primary_service()
            ))
            .into());
        };
        let previous = before.primary.as_ref();
        let created = previous.map_or(true, |p| p.id != primary.id);
        let started = created || !previous.is_some_and(|p| p.running);
        report.outcome = match (created, previous) {
            (true, None) => UpOutcome::Created,
            (true, Some(_)) => UpOutcome::Recreated,
            (false, _) if started => UpOutcome::Started,
            (false, _) => UpOutcome::AlreadyRunning,
        };
        report.container_id = Some(primary.id.clone());
        info!("up: {:?} container {}", report.outcome, primary.id.short(12));

        let target = prepared.hook_target(primary.id);
        let config = &workspace.config;
        if created {
            for (phase, command) in [
                (HookPhase::OnCreate, &config.on_create_command),
                (HookPhase::PostCreate, &config.post_create_command),
            ] {
                if let Some(command) = command {
                    run_hook(&self.ctx, phase, command, &target)?;
                    report.hooks.push(phase);
                }
            }
        }
        if started {
            if let Some(command) = &config.post_start_command {
                run_hook(&self.ctx, HookPhase::PostStart, command, &target)?;
                report.hooks.push(HookPhase::PostStart);
            }
        }
        Ok(report)
    }

    /// Start existing containers. Fails when the environment was never created.
    pub fn start(&self, workspace: &Workspace, services: &[String]) -> Result<LifecycleReport, CoreError> {
        let prepared = Prepared::new(workspace, services)?;
        let _lock = self.lock(&prepared.identity)?;
        let before = self.classify(&prepared.identity)?;
        let mut report = LifecycleReport {
            command: "start",
            changed: false,
            state: before.state,
            compose_project: prepared.project().to_owned(),
            hooks: Vec::new(),
        };
        if before.is_stale() {
            warn!("configuration changed since the environment was created; run `dockyard up` to apply it");
        }
        if plan_start(before.state)? == StartAction::NoOp {
            info!("environment already running");
            return Ok(report);
        }
        self.with_project_files(&prepared, |files| {
            self.compose(&prepared, files, "start", prepared.services(services))
        })?;
        self.run_start_hooks(&prepared, &mut report.hooks)?;
        report.changed = true;
        report.state = self.classify(&prepared.identity)?.state;
        Ok(report)
    }

    pub fn stop(&self, workspace: &Workspace, services: &[String]) -> Result<LifecycleReport, CoreError> {
        let prepared = Prepared::new(workspace, services)?;
        let _lock = self.lock(&prepared.identity)?;
        let before = self.classify(&prepared.identity)?;
        let mut report = LifecycleReport {
            command: "stop",
            changed: false,
            state: before.state,
            compose_project: prepared.project().to_owned(),
            hooks: Vec::new(),
        };
        if plan_stop(before.state) == StopAction::NoOp && before.containers.is_empty() {
            info!("nothing to stop");
            return Ok(report);
        }
        self.with_project_files(&prepared, |files| {
            self.compose(&prepared, files, "stop", services.to_vec())
        })?;
        report.changed = true;
        report.state = self.classify(&prepared.identity)?.state;
        Ok(report)
    }

    /// Remove the environment's containers and networks.
    pub fn down(&self, workspace: &Workspace, opts: &DownOptions) -> Result<LifecycleReport, CoreError> {
        let prepared = Prepared::new(workspace, &[])?;
        let _lock = self.lock(&prepared.identity)?;
        let before = self.classify(&prepared.identity)?;
        let mut report = LifecycleReport {
            command: "down",
            changed: false,
            state: before.state,
            compose_project: prepared.project().to_owned(),
            hooks: Vec::new(),
        };
        if before.containers.is_empty() {
            info!("environment is absent; nothing to remove");
            return Ok(report);
        }
        let mut args = Vec::new();
        if opts.volumes {
            args.push("--volumes".to_owned());
        }
        self.with_project_files(&prepared, |files| self.compose(&prepared, files, "down", args))?;
        report.changed = true;
        report.state = self.classify(&prepared.identity)?.state;
        Ok(report)
    }

    /// Build the derived image and service images without starting anything.
    pub fn build(&self, workspace: &Workspace, opts: &BuildOptions) -> Result<BuildReport, CoreError> {
        let prepared = Prepared::new(workspace, &opts.services)?;
        let _lock = self.lock(&prepared.identity)?;
        let staged = self.stage(&prepared, opts.force, opts.no_cache)?;
        let derived = staged.derived.is_some();
        let services_built = self.with_overlay(&staged.synthesis.document, |overlay| {
            let candidates = prepared.selection(&opts.services);
            self.build_services(&prepared, overlay, derived, opts.no_cache, candidates)
        })?;
        Ok(BuildReport {
            compose_project: prepared.project().to_owned(),
            derived_image: staged.derived,
            cache: staged.cache,
            services_built,
            diagnostics: staged.synthesis.diagnostics,
        })
    }

    /// Derive the feature image when features are declared, then synthesize.
    fn stage(&self, prepared: &Prepared<'_>, force: bool, no_cache: bool) -> Result<Staged, CoreError> {
        let (derived, cache) = if prepared.features.is_empty() {
            (None, None)
        } else {
            let (derived, outcome) = FeatureImageCache::new(&self.ctx).derive(
                prepared.workspace,
                &prepared.identity,
                &prepared.model,
                &prepared.features,
                force,
                no_cache,
            )?;
            (Some(derived), Some(outcome))
        };
        let synthesis = synthesize(&SynthesisInput {
            workspace: prepared.workspace,
            identity: &prepared.identity,
            model: &prepared.model,
            features: &prepared.features,
            derived_image: derived.as_ref(),
            selinux: self.ctx.selinux().mode(),
            substitution: &prepared.substitution,
        })?;
        for diagnostic in &synthesis.diagnostics {
            warn!("{diagnostic}");
        }
        Ok(Staged {
            derived,
            cache,
            synthesis,
        })
    }

    /// Run `f` with the user files plus a freshly synthesized overlay, so
    /// project-level commands see the model `up` created. Nothing is built.
    fn with_project_files<T>(
        &self,
        prepared: &Prepared<'_>,
        f: impl FnOnce(Vec<PathBuf>) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let synthesis = synthesize(&SynthesisInput {
            workspace: prepared.workspace,
            identity: &prepared.identity,
            model: &prepared.model,
            features: &prepared.features,
            derived_image: None,
            selinux: self.ctx.selinux().mode(),
            substitution: &prepared.substitution,
        })?;
        for diagnostic in &synthesis.diagnostics {
            debug!("{diagnostic}");
        }
        self.with_overlay(&synthesis.document, |overlay| {
            let mut files = prepared.user_files();
            files.push(overlay.to_path_buf());
            f(files)
        })
    }

    /// `compose build` for candidate services that own a build definition.
    ///
    /// The primary is skipped when it runs a derived image; building it here
    /// would overwrite nothing it uses.
    fn build_services(
        &self,
        prepared: &Prepared<'_>,
        overlay: &Path,
        derived: bool,
        no_cache: bool,
        candidates: Vec<String>,
    ) -> Result<Vec<String>, CoreError> {
        let primary = prepared.workspace.config.primary_service();
        let services: Vec<String> = candidates
            .into_iter()
            .filter(|name| !(derived && name == primary))
            .filter(|name| prepared.model.service(name).is_some_and(|s| s.has_build))
            .collect();
        if services.is_empty() {
            debug!("no services with a build definition to build");
            return Ok(services);
        }
        let mut args = Vec::new();
        if no_cache {
            args.push("--no-cache".to_owned());
        }
        args.extend(services.iter().cloned());
        let mut files = prepared.user_files();
        files.push(overlay.to_path_buf());
        self.compose(prepared, files, "build", args)?;
        Ok(services)
    }

    fn run_start_hooks(&self, prepared: &Prepared<'_>, hooks: &mut Vec<HookPhase>) -> Result<(), CoreError> {
        let Some(command) = &prepared.workspace.config.post_start_command else {
            return Ok(());
        };
        let after = self.classify(&prepared.identity)?;
        let Some(primary) = after.primary.filter(|p| p.running) else {
            debug!("primary container not running; skipping postStartCommand");
            return Ok(());
        };
        run_hook(&self.ctx, HookPhase::PostStart, command, &prepared.hook_target(primary.id))?;
        hooks.push(HookPhase::PostStart);
        Ok(())
    }

    /// Write `document` to a temp file outside the workspace, run `f` with
    /// its path, and remove the file whatever `f` returns.
    fn with_overlay<T>(
        &self,
        document: &OverrideDocument,
        f: impl FnOnce(&Path) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        let yaml = document.to_yaml()?;
        let mut file = tempfile::Builder::new()
            .prefix("dockyard-")
            .suffix(".yml")
            .tempfile()?;
        file.write_all(yaml.as_bytes())?;
        file.flush()?;
        debug!("override written to {}", file.path().display());
        let result = f(file.path());
        if let Err(e) = file.close() {
            warn!("failed to remove override file: {e}");
        }
        result
    }
}
