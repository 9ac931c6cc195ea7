use dockyard_core::{
    BuildOptions, CacheOutcome, CoreError, DownOptions, Engine, EngineContext, HookPhase,
    LifecycleState, UpOptions, UpOutcome,
};
use dockyard_runtime::{FixedSelinuxProbe, MockRuntime, SelinuxMode};
use dockyard_schema::labels::{self, missing_labels};
use dockyard_schema::{compute_identity, ConfigError, Workspace};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

struct Fixture {
    project: tempfile::TempDir,
    _state: tempfile::TempDir,
    mock: Arc<MockRuntime>,
    engine: Engine,
}

impl Fixture {
    fn new() -> Self {
        let project = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockRuntime::new());
        let engine = engine_for(&mock, state.path());
        Self {
            project,
            _state: state,
            mock,
            engine,
        }
    }

    fn config_dir(&self) -> PathBuf {
        self.project.path().join(".devcontainer")
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.config_dir().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn workspace(&self, config: &str) -> Workspace {
        self.write("devcontainer.json", config);
        Workspace::load(self.project.path(), None).unwrap()
    }

    fn up(&self, ws: &Workspace) -> dockyard_core::UpReport {
        self.engine.up(ws, &UpOptions::default()).unwrap()
    }

    fn state(&self, ws: &Workspace) -> LifecycleState {
        self.engine.status(ws).unwrap().state
    }

    fn compose_calls_starting(&self, prefix: &str) -> Vec<String> {
        self.mock
            .compose_calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }
}

fn engine_for(mock: &Arc<MockRuntime>, state_dir: &Path) -> Engine {
    let ctx = EngineContext::new(mock.clone(), state_dir)
        .with_selinux(Arc::new(FixedSelinuxProbe(SelinuxMode::Disabled)));
    Engine::new(ctx)
}

const SINGLE: &str = r#"{"image": "alpine:3.20"}"#;

const APP_DB_COMPOSE: &str = "services:\n  app:\n    build: .\n  db:\n    image: postgres:16\n";
const APP_DB: &str = r#"{
    "dockerComposeFile": "docker-compose.yml",
    "service": "app",
    "runServices": ["app", "db"]
}"#;

fn feature_config(option: &str) -> String {
    format!(
        r#"{{
            "image": "ubuntu:24.04",
            "features": [
                {{"id": "./features/node", "options": {{"version": "{option}"}}}},
                {{"id": "./features/tools", "dependsOn": ["./features/node"]}}
            ]
        }}"#
    )
}

fn write_features(f: &Fixture) {
    f.write("features/node/install.sh", "#!/bin/sh\necho node\n");
    f.write("features/tools/install.sh", "#!/bin/sh\necho tools\n");
}

#[test]
fn up_twice_is_idempotent() {
    let f = Fixture::new();
    let ws = f.workspace(SINGLE);

    let first = f.up(&ws);
    assert_eq!(first.outcome, UpOutcome::Created);
    let id = first.container_id.clone().unwrap();

    let second = f.up(&ws);
    assert_eq!(second.outcome, UpOutcome::AlreadyRunning);
    assert_eq!(second.container_id, Some(id));
    assert_eq!(f.compose_calls_starting("up").len(), 1);
    assert_eq!(f.state(&ws), LifecycleState::Running);
}

#[test]
fn config_edit_marks_stale_and_up_recreates() {
    let f = Fixture::new();
    let ws = f.workspace(SINGLE);
    let old_id = f.up(&ws).container_id.unwrap();

    let edited = f.workspace(r#"{"image": "alpine:3.20", "containerEnv": {"EDITOR": "vi"}}"#);
    assert_eq!(f.state(&edited), LifecycleState::Stale);

    let report = f.up(&edited);
    assert_eq!(report.outcome, UpOutcome::Recreated);
    let new_id = report.container_id.unwrap();
    assert_ne!(new_id, old_id);
    assert!(f
        .compose_calls_starting("up")
        .last()
        .unwrap()
        .contains("--force-recreate"));

    let status = f.engine.status(&edited).unwrap();
    assert_eq!(status.state, LifecycleState::Running);
    let primary = status.primary.unwrap();
    assert_eq!(
        primary.label(labels::CONFIG_HASH),
        Some(compute_identity(&edited).config_hash.as_str())
    );
}

#[test]
fn recreate_flag_bypasses_idempotence() {
    let f = Fixture::new();
    let ws = f.workspace(SINGLE);
    let old_id = f.up(&ws).container_id.unwrap();
    let report = f
        .engine
        .up(
            &ws,
            &UpOptions {
                recreate: true,
                ..UpOptions::default()
            },
        )
        .unwrap();
    assert_eq!(report.outcome, UpOutcome::Recreated);
    assert_ne!(report.container_id.unwrap(), old_id);
}

#[test]
fn stop_then_up_starts_the_same_container() {
    let f = Fixture::new();
    let ws = f.workspace(SINGLE);
    let id = f.up(&ws).container_id.unwrap();

    let stopped = f.engine.stop(&ws, &[]).unwrap();
    assert!(stopped.changed);
    assert_eq!(stopped.state, LifecycleState::Created);

    let report = f.up(&ws);
    assert_eq!(report.outcome, UpOutcome::Started);
    assert_eq!(report.container_id, Some(id));
    assert_eq!(f.state(&ws), LifecycleState::Running);
}

#[test]
fn start_stop_down_round_trip() {
    let f = Fixture::new();
    let ws = f.workspace(SINGLE);

    let err = f.engine.start(&ws, &[]).unwrap_err();
    assert!(matches!(err, CoreError::NotCreated));

    f.up(&ws);
    f.engine.stop(&ws, &[]).unwrap();
    let started = f.engine.start(&ws, &[]).unwrap();
    assert!(started.changed);
    assert_eq!(started.state, LifecycleState::Running);

    let again = f.engine.start(&ws, &[]).unwrap();
    assert!(!again.changed);

    let down = f
        .engine
        .down(&ws, &DownOptions { volumes: true })
        .unwrap();
    assert!(down.changed);
    assert_eq!(down.state, LifecycleState::Absent);
    assert!(f.mock.containers().is_empty());
    assert_eq!(f.compose_calls_starting("down"), ["down --volumes"]);

    let noop = f.engine.down(&ws, &DownOptions::default()).unwrap();
    assert!(!noop.changed);
}

#[test]
fn app_db_scenario() {
    let f = Fixture::new();
    f.write("docker-compose.yml", APP_DB_COMPOSE);
    let ws = f.workspace(APP_DB);

    let report = f.up(&ws);
    assert_eq!(report.outcome, UpOutcome::Created);

    let overlay: serde_yaml::Value = serde_yaml::from_str(&f.mock.last_overlay().unwrap()).unwrap();
    let app = &overlay["services"]["app"];
    let db = &overlay["services"]["db"];
    assert_eq!(app["labels"]["dev.dockyard.primary"].as_str(), Some("true"));
    assert!(app.get("pull_policy").is_none());
    assert_eq!(db["labels"]["dev.dockyard.primary"].as_str(), Some("false"));
    assert_eq!(db["pull_policy"].as_str(), Some("build"));

    let containers = f.mock.containers();
    assert_eq!(containers.len(), 2);
    let env_key = compute_identity(&ws).env_key;
    for c in &containers {
        assert!(missing_labels(&c.labels).is_empty(), "{c:?}");
        assert_eq!(c.label(labels::ENV_KEY), Some(env_key.as_str()));
    }
}

#[test]
fn overlay_file_is_removed_and_outside_the_workspace() {
    let f = Fixture::new();
    let ws = f.workspace(SINGLE);
    f.up(&ws);
    let path = f.mock.last_overlay_path().unwrap();
    assert!(!path.exists());
    assert!(!path.starts_with(&ws.folder));
    assert!(!path.starts_with(f.project.path()));
}

#[test]
fn overlay_file_is_removed_when_compose_fails() {
    let f = Fixture::new();
    f.write(
        "docker-compose.yml",
        "services:\n  app:\n    image: alpine\n    depends_on: [ghost]\n",
    );
    let ws = f.workspace(r#"{"dockerComposeFile": "docker-compose.yml", "service": "app"}"#);
    let err = f.engine.up(&ws, &UpOptions::default()).unwrap_err();
    assert!(err.is_runtime());
    let path = f.mock.last_overlay_path().unwrap();
    assert!(!path.exists());
}

#[test]
fn derived_image_is_cached_and_invalidated_by_options() {
    let f = Fixture::new();
    write_features(&f);
    let ws = f.workspace(&feature_config("20"));

    let first = f.up(&ws);
    assert_eq!(first.cache, Some(CacheOutcome::Built));
    let tag = first.derived_image.unwrap().tag;
    let env_key = compute_identity(&ws).env_key;
    assert!(tag.starts_with(&format!("dockyard-features-{env_key}:")));

    let dockerfile = f.mock.last_dockerfile().unwrap();
    assert!(dockerfile.starts_with("FROM ubuntu:24.04\n"));
    let node = dockerfile.find("dockyard-feature: ./features/node").unwrap();
    let tools = dockerfile.find("dockyard-feature: ./features/tools").unwrap();
    assert!(node < tools);

    let overlay: serde_yaml::Value = serde_yaml::from_str(&f.mock.last_overlay().unwrap()).unwrap();
    assert_eq!(overlay["services"]["dev"]["image"].as_str(), Some(tag.as_str()));
    assert_eq!(overlay["services"]["dev"]["pull_policy"].as_str(), Some("never"));

    f.engine.down(&ws, &DownOptions::default()).unwrap();
    let builds = f.mock.build_count();
    let cached = f.up(&ws);
    assert_eq!(cached.cache, Some(CacheOutcome::Cached));
    assert_eq!(cached.derived_image.unwrap().tag, tag);
    assert_eq!(f.mock.build_count(), builds);

    let changed = f.workspace(&feature_config("22"));
    let rebuilt = f.up(&changed);
    assert_eq!(rebuilt.cache, Some(CacheOutcome::Built));
    assert_ne!(rebuilt.derived_image.unwrap().tag, tag);
    assert_eq!(rebuilt.outcome, UpOutcome::Recreated);
}

#[test]
fn feature_build_failure_names_the_feature() {
    let f = Fixture::new();
    write_features(&f);
    f.mock.fail_build_matching(Some("features/tools")).unwrap();
    let ws = f.workspace(&feature_config("20"));
    let err = f.engine.up(&ws, &UpOptions::default()).unwrap_err();
    match err {
        CoreError::FeatureBuild { feature, .. } => assert_eq!(feature, "./features/tools"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(f.mock.containers().is_empty());
    assert!(f.compose_calls_starting("up").is_empty());
}

#[test]
fn build_failure_before_any_feature_layer_names_the_first_feature() {
    let f = Fixture::new();
    write_features(&f);
    f.mock.fail_build_matching(Some("FROM ubuntu")).unwrap();
    let ws = f.workspace(&feature_config("20"));
    let err = f.engine.up(&ws, &UpOptions::default()).unwrap_err();
    assert!(err.is_runtime());
    match err {
        CoreError::FeatureBuild { feature, .. } => assert_eq!(feature, "./features/node"),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn feature_cycle_fails_before_any_build() {
    let f = Fixture::new();
    let ws = f.workspace(
        r#"{
            "image": "ubuntu:24.04",
            "features": [
                {"id": "a", "dependsOn": ["b"]},
                {"id": "b", "dependsOn": ["a"]}
            ]
        }"#,
    );
    let err = f.engine.up(&ws, &UpOptions::default()).unwrap_err();
    assert!(err.is_configuration());
    assert!(matches!(err, CoreError::Config(ConfigError::FeatureCycle(_))));
    assert_eq!(f.mock.build_count(), 0);
    assert!(f.mock.compose_calls().is_empty());
}

#[test]
fn missing_feature_dependency_is_configuration_error() {
    let f = Fixture::new();
    let ws = f.workspace(
        r#"{"image": "ubuntu:24.04", "features": [{"id": "a", "dependsOn": ["ghost"]}]}"#,
    );
    let err = f.engine.build(&ws, &BuildOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        CoreError::Config(ConfigError::MissingFeatureDependency { .. })
    ));
    assert_eq!(f.mock.build_count(), 0);
}

#[test]
fn undeclared_service_selection_spawns_nothing() {
    let f = Fixture::new();
    f.write("docker-compose.yml", APP_DB_COMPOSE);
    let ws = f.workspace(APP_DB);
    let err = f
        .engine
        .up(
            &ws,
            &UpOptions {
                services: vec!["cache".to_owned()],
                ..UpOptions::default()
            },
        )
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Config(ConfigError::UndeclaredService { ref service }) if service == "cache"
    ));
    assert!(f.mock.compose_calls().is_empty());
}

#[test]
fn service_selection_always_brings_the_primary() {
    let f = Fixture::new();
    f.write("docker-compose.yml", APP_DB_COMPOSE);
    let ws = f.workspace(APP_DB);
    let only_db = vec!["db".to_owned()];

    let report = f
        .engine
        .up(
            &ws,
            &UpOptions {
                services: only_db.clone(),
                ..UpOptions::default()
            },
        )
        .unwrap();
    assert_eq!(report.outcome, UpOutcome::Created);
    assert!(report.container_id.is_some());
    assert_eq!(f.compose_calls_starting("up"), ["up -d app db"]);
    assert_eq!(f.state(&ws), LifecycleState::Running);

    f.engine.stop(&ws, &only_db).unwrap();
    assert_eq!(f.compose_calls_starting("stop"), ["stop db"]);
    assert_eq!(f.state(&ws), LifecycleState::Running);

    f.engine.stop(&ws, &[]).unwrap();
    let started = f.engine.start(&ws, &only_db).unwrap();
    assert!(started.changed);
    assert_eq!(started.state, LifecycleState::Running);
    assert_eq!(f.compose_calls_starting("start"), ["start app db"]);
}

#[test]
fn single_plan_project_commands_name_the_overlay() {
    let f = Fixture::new();
    let ws = f.workspace(SINGLE);
    f.up(&ws);
    f.engine.stop(&ws, &[]).unwrap();
    f.engine.start(&ws, &[]).unwrap();
    f.engine.down(&ws, &DownOptions::default()).unwrap();

    let calls = f.mock.compose_calls();
    assert_eq!(calls, ["up -d dev", "stop", "start dev", "down"]);
    for (call, files) in calls.iter().zip(f.mock.compose_files()) {
        assert_eq!(files.len(), 1, "{call}: {files:?}");
        assert!(!files[0].starts_with(f.project.path()), "{call}");
        assert!(!files[0].exists(), "{call}: overlay left behind");
    }
}

#[test]
fn compose_down_with_volumes_removes_overlay_volumes() {
    let f = Fixture::new();
    f.write("docker-compose.yml", APP_DB_COMPOSE);
    let ws = f.workspace(
        r#"{
            "dockerComposeFile": "docker-compose.yml",
            "service": "app",
            "runServices": ["app", "db"],
            "mounts": ["source=cache,target=/cache,type=volume"]
        }"#,
    );
    f.up(&ws);
    let volume = format!("{}_cache", compute_identity(&ws).compose_project);
    assert!(f.mock.volumes().contains(&volume));

    f.engine.down(&ws, &DownOptions { volumes: true }).unwrap();
    assert_eq!(f.compose_calls_starting("down"), ["down --volumes"]);
    let files = f.mock.compose_files().pop().unwrap();
    assert_eq!(files.len(), 2);
    assert!(files[0].ends_with("docker-compose.yml"));
    assert!(!files[1].starts_with(f.project.path()));
    assert!(f.mock.volumes().is_empty());
    assert!(f.mock.containers().is_empty());
}

#[test]
fn hooks_follow_creation_and_start() {
    let f = Fixture::new();
    let ws = f.workspace(
        r#"{
            "image": "alpine:3.20",
            "onCreateCommand": "echo on-create",
            "postCreateCommand": ["echo", "post-create"],
            "postStartCommand": "echo post-start"
        }"#,
    );
    let report = f.up(&ws);
    assert_eq!(
        report.hooks,
        [HookPhase::OnCreate, HookPhase::PostCreate, HookPhase::PostStart]
    );
    assert_eq!(
        f.mock.exec_calls(),
        vec![
            vec!["/bin/sh", "-c", "echo on-create"],
            vec!["echo", "post-create"],
            vec!["/bin/sh", "-c", "echo post-start"],
        ]
    );

    assert!(f.up(&ws).hooks.is_empty());

    f.engine.stop(&ws, &[]).unwrap();
    let restarted = f.up(&ws);
    assert_eq!(restarted.hooks, [HookPhase::PostStart]);
    assert_eq!(f.mock.exec_calls().len(), 4);
}

#[test]
fn parallel_hook_failure_reports_the_key() {
    let f = Fixture::new();
    f.mock.fail_exec_matching(Some("migrate")).unwrap();
    let ws = f.workspace(
        r#"{
            "image": "alpine:3.20",
            "postCreateCommand": {"deps": "make deps", "db": "make migrate"}
        }"#,
    );
    let err = f.engine.up(&ws, &UpOptions::default()).unwrap_err();
    match err {
        CoreError::Hook { phase, key, .. } => {
            assert_eq!(phase, HookPhase::PostCreate);
            assert_eq!(key.as_deref(), Some("db"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(f.mock.exec_calls().len(), 2);
}

#[test]
fn rebuild_never_hands_derived_primary_to_compose_build() {
    let f = Fixture::new();
    write_features(&f);
    f.write(
        "docker-compose.yml",
        "services:\n  app:\n    build: .\n  worker:\n    build: ./worker\n",
    );
    let ws = f.workspace(
        r#"{
            "dockerComposeFile": "docker-compose.yml",
            "service": "app",
            "runServices": ["worker"],
            "features": [{"id": "./features/node"}]
        }"#,
    );
    f.up(&ws);
    let report = f
        .engine
        .up(
            &ws,
            &UpOptions {
                rebuild: true,
                ..UpOptions::default()
            },
        )
        .unwrap();
    assert_eq!(report.cache, Some(CacheOutcome::Built));

    let builds = f.compose_calls_starting("build");
    // base image of the primary, built from the user files alone
    assert!(builds.iter().any(|c| c == "build app"));
    assert!(builds.iter().any(|c| c == "build worker"));
    assert!(!builds.iter().any(|c| c.contains("app") && c.contains("worker")));
}

#[test]
fn build_does_not_start_containers() {
    let f = Fixture::new();
    write_features(&f);
    let ws = f.workspace(&feature_config("20"));
    let report = f.engine.build(&ws, &BuildOptions::default()).unwrap();
    assert_eq!(report.cache, Some(CacheOutcome::Built));
    assert!(report.services_built.is_empty());
    assert!(f.mock.containers().is_empty());
    assert!(f.compose_calls_starting("up").is_empty());

    let again = f.engine.build(&ws, &BuildOptions::default()).unwrap();
    assert_eq!(again.cache, Some(CacheOutcome::Cached));
    let forced = f
        .engine
        .build(
            &ws,
            &BuildOptions {
                force: true,
                ..BuildOptions::default()
            },
        )
        .unwrap();
    assert_eq!(forced.cache, Some(CacheOutcome::Built));
}

#[test]
fn single_plan_with_build_definition() {
    let f = Fixture::new();
    f.write("Dockerfile", "FROM alpine\n");
    let ws = f.workspace(r#"{"build": {"dockerfile": "Dockerfile", "args": {"V": "1"}}}"#);
    let report = f.engine.build(&ws, &BuildOptions::default()).unwrap();
    assert_eq!(report.services_built, ["dev"]);
    let up = f.up(&ws);
    assert_eq!(up.outcome, UpOutcome::Created);
}

#[test]
fn concurrent_up_creates_one_environment() {
    let f = Fixture::new();
    let ws = f.workspace(SINGLE);
    let state = tempfile::tempdir().unwrap();
    let outcomes: Vec<UpOutcome> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine_for(&f.mock, state.path());
                let ws = &ws;
                scope.spawn(move || engine.up(ws, &UpOptions::default()).unwrap().outcome)
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(
        outcomes.iter().filter(|o| **o == UpOutcome::Created).count(),
        1
    );
    assert_eq!(f.mock.containers().len(), 1);
}

#[test]
fn separate_workspaces_do_not_interfere() {
    let a = Fixture::new();
    let ws_a = a.workspace(SINGLE);
    let b_dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(b_dir.path().join(".devcontainer")).unwrap();
    fs::write(b_dir.path().join(".devcontainer/devcontainer.json"), SINGLE).unwrap();
    let ws_b = Workspace::load(b_dir.path(), None).unwrap();

    a.up(&ws_a);
    assert_eq!(a.state(&ws_b), LifecycleState::Absent);
    a.up(&ws_b);
    a.engine.down(&ws_a, &DownOptions::default()).unwrap();
    assert_eq!(a.state(&ws_b), LifecycleState::Running);
}
