//! Lifecycle hooks executed inside the primary container.

use crate::context::EngineContext;
use crate::CoreError;
use dockyard_runtime::{ContainerRuntime, ExecRequest, ProcessOptions, RuntimeError};
use dockyard_schema::{CommandLine, ContainerId, LifecycleCommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HookPhase {
    OnCreate,
    PostCreate,
    PostStart,
}

impl HookPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OnCreate => "onCreateCommand",
            Self::PostCreate => "postCreateCommand",
            Self::PostStart => "postStartCommand",
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and as whom hooks run.
#[derive(Debug, Clone, Default)]
pub struct HookTarget {
    pub container: ContainerId,
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl HookTarget {
    fn request(&self, line: &CommandLine) -> ExecRequest {
        ExecRequest {
            container: self.container.clone(),
            user: self.user.clone(),
            workdir: self.workdir.clone(),
            env: self.env.clone(),
            argv: line.argv(),
        }
    }
}

/// Run one hook to completion.
///
/// Keyed commands run concurrently. The first failure cancels the others;
/// it is reported once every command has finished.
pub fn run_hook(
    ctx: &EngineContext,
    phase: HookPhase,
    command: &LifecycleCommand,
    target: &HookTarget,
) -> Result<(), CoreError> {
    match command {
        LifecycleCommand::Single(line) => {
            if line.is_empty() {
                debug!("{phase}: empty command, skipping");
                return Ok(());
            }
            info!("running {phase}: {line}");
            ctx.runtime()
                .exec(&target.request(line), &ctx.process_options())
                .map_err(|source| CoreError::Hook {
                    phase,
                    key: None,
                    source,
                })
        }
        LifecycleCommand::Parallel(entries) => run_parallel(ctx, phase, entries, target),
    }
}

fn run_parallel(
    ctx: &EngineContext,
    phase: HookPhase,
    entries: &BTreeMap<String, CommandLine>,
    target: &HookTarget,
) -> Result<(), CoreError> {
    let jobs: Vec<(String, ExecRequest)> = entries
        .iter()
        .filter(|(key, line)| {
            if line.is_empty() {
                debug!("{phase} '{key}': empty command, skipping");
            }
            !line.is_empty()
        })
        .map(|(key, line)| (key.clone(), target.request(line)))
        .collect();
    if jobs.is_empty() {
        return Ok(());
    }
    info!("running {phase}: {} commands in parallel", jobs.len());

    let group = ctx.process_options().child();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    let failure = runtime.block_on(join_all(ctx.runtime(), jobs, &group));
    match failure {
        Some((key, source)) => Err(CoreError::Hook {
            phase,
            key,
            source,
        }),
        None => Ok(()),
    }
}

async fn join_all(
    runtime: &Arc<dyn ContainerRuntime>,
    jobs: Vec<(String, ExecRequest)>,
    group: &ProcessOptions,
) -> Option<(Option<String>, RuntimeError)> {
    let mut set = tokio::task::JoinSet::new();
    for (key, request) in jobs {
        let runtime = Arc::clone(runtime);
        let opts = group.clone();
        set.spawn_blocking(move || {
            let result = runtime.exec(&request, &opts);
            (key, result)
        });
    }

    let mut first: Option<(Option<String>, RuntimeError)> = None;
    while let Some(joined) = set.join_next().await {
        let (key, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                group.cancel.cancel();
                first.get_or_insert((None, RuntimeError::ExecFailed(format!("hook task failed: {e}"))));
                continue;
            }
        };
        match result {
            Ok(()) => debug!("hook '{key}' finished"),
            Err(e) if first.is_none() => {
                warn!("hook '{key}' failed; cancelling the remaining commands");
                group.cancel.cancel();
                first = Some((Some(key), e));
            }
            Err(e) => debug!("hook '{key}' also failed: {e}"),
        }
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_runtime::MockRuntime;
    use dockyard_schema::labels::LabelMap;

    fn setup() -> (Arc<MockRuntime>, EngineContext, HookTarget) {
        let mock = Arc::new(MockRuntime::new());
        let id = mock
            .insert_container("proj", "dev", true, LabelMap::new())
            .unwrap();
        let ctx = EngineContext::new(mock.clone(), std::env::temp_dir());
        let target = HookTarget {
            container: id,
            workdir: Some("/workspaces/demo".to_owned()),
            ..HookTarget::default()
        };
        (mock, ctx, target)
    }

    fn parse(json: &str) -> LifecycleCommand {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn shell_string_runs_through_sh() {
        let (mock, ctx, target) = setup();
        run_hook(&ctx, HookPhase::PostCreate, &parse(r#""make deps""#), &target).unwrap();
        assert_eq!(mock.exec_calls(), vec![vec!["/bin/sh", "-c", "make deps"]]);
    }

    #[test]
    fn parallel_entries_all_run() {
        let (mock, ctx, target) = setup();
        let cmd = parse(r#"{"a": "echo a", "b": ["echo", "b"], "empty": ""}"#);
        run_hook(&ctx, HookPhase::OnCreate, &cmd, &target).unwrap();
        let mut calls = mock.exec_calls();
        calls.sort();
        assert_eq!(calls, vec![vec!["/bin/sh", "-c", "echo a"], vec!["echo", "b"]]);
    }

    #[test]
    fn parallel_failure_names_the_key() {
        let (mock, ctx, target) = setup();
        mock.fail_exec_matching(Some("explode")).unwrap();
        let cmd = parse(r#"{"good": "echo ok", "bad": "explode now"}"#);
        let err = run_hook(&ctx, HookPhase::PostStart, &cmd, &target).unwrap_err();
        match err {
            CoreError::Hook { phase, key, .. } => {
                assert_eq!(phase, HookPhase::PostStart);
                assert_eq!(key.as_deref(), Some("bad"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(mock.exec_calls().len(), 2);
    }

    #[test]
    fn single_failure_is_hook_error() {
        let (mock, ctx, target) = setup();
        mock.fail_exec_matching(Some("false")).unwrap();
        let err = run_hook(&ctx, HookPhase::OnCreate, &parse(r#"["false"]"#), &target).unwrap_err();
        assert!(err.is_runtime());
        assert!(err.to_string().starts_with("onCreateCommand hook failed"));
    }
}
