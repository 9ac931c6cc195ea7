//! Docker/Podman command-line backend.

use crate::backend::{
    ComposeInvocation, ContainerRecord, ContainerRuntime, ExecRequest, ImageBuildRequest,
    LabelSelector,
};
use crate::process::{run_checked, run_command, ProcessOptions};
use crate::RuntimeError;
use dockyard_schema::{ContainerId, LabelMap};
use serde::Deserialize;
use std::process::Command;
use std::sync::OnceLock;
use tracing::debug;

pub struct CliRuntime {
    name: String,
    binary: String,
    explicit_compose: Option<Vec<String>>,
    compose: OnceLock<Vec<String>>,
}

impl CliRuntime {
    pub fn new(name: &str, binary: impl Into<String>, compose_command: Option<&str>) -> Self {
        let explicit_compose = compose_command
            .map(|c| c.split_whitespace().map(str::to_owned).collect::<Vec<_>>())
            .filter(|argv| !argv.is_empty());
        Self {
            name: name.to_owned(),
            binary: binary.into(),
            explicit_compose,
            compose: OnceLock::new(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    /// Compose entry point: explicit setting, then `<bin> compose`, then the
    /// standalone `docker-compose`/`podman-compose` tools.
    pub fn compose_argv(&self) -> &[String] {
        if let Some(explicit) = &self.explicit_compose {
            return explicit;
        }
        self.compose.get_or_init(|| {
            let plugin = vec![self.binary.clone(), "compose".to_owned()];
            if succeeds(&plugin, &["version"]) {
                return plugin;
            }
            for standalone in ["docker-compose", "podman-compose"] {
                let argv = vec![standalone.to_owned()];
                if succeeds(&argv, &["version"]) {
                    debug!("using standalone compose: {standalone}");
                    return argv;
                }
            }
            plugin
        })
    }

    fn compose_command(&self, invocation: &ComposeInvocation) -> Command {
        let argv = self.compose_argv();
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.arg("-p").arg(&invocation.project);
        for file in &invocation.files {
            cmd.arg("-f").arg(file);
        }
        cmd.arg(&invocation.subcommand);
        cmd.args(&invocation.args);
        cmd
    }

    fn inspect(
        &self,
        ids: &[String],
        opts: &ProcessOptions,
    ) -> Result<Vec<ContainerRecord>, RuntimeError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = self.command();
        cmd.arg("inspect").args(ids);
        let output = run_checked(cmd, &quiet(opts))?;
        parse_inspect(&output.stdout)
    }
}

impl ContainerRuntime for CliRuntime {
    fn name(&self) -> &str {
        &self.name
    }

    fn available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn list_containers(
        &self,
        selector: &LabelSelector,
        opts: &ProcessOptions,
    ) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let mut cmd = self.command();
        cmd.args(["ps", "-a", "-q", "--no-trunc"]);
        for (key, value) in &selector.labels {
            cmd.arg("--filter").arg(format!("label={key}={value}"));
        }
        let output = run_checked(cmd, &quiet(opts))?;
        let ids: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect();
        let records = self.inspect(&ids, opts)?;
        Ok(records
            .into_iter()
            .filter(|r| selector.matches(&r.labels))
            .collect())
    }

    fn image_id(
        &self,
        reference: &str,
        opts: &ProcessOptions,
    ) -> Result<Option<String>, RuntimeError> {
        let mut cmd = self.command();
        cmd.args(["image", "inspect", "--format", "{{.Id}}", reference]);
        let display = crate::process::describe_command(&cmd);
        let output = run_command(cmd, &quiet(opts))?;
        if output.success() {
            let id = output.stdout.trim();
            return Ok((!id.is_empty()).then(|| id.to_owned()));
        }
        if is_missing_image(&output.combined()) {
            return Ok(None);
        }
        Err(crate::process::command_failed(display, &output))
    }

    fn build_image(
        &self,
        request: &ImageBuildRequest,
        opts: &ProcessOptions,
    ) -> Result<(), RuntimeError> {
        let mut cmd = self.command();
        cmd.arg("build")
            .arg("-f")
            .arg(&request.dockerfile)
            .arg("-t")
            .arg(&request.tag);
        for (key, value) in &request.build_args {
            cmd.arg("--build-arg").arg(format!("{key}={value}"));
        }
        if let Some(target) = &request.target {
            cmd.arg("--target").arg(target);
        }
        if request.no_cache {
            cmd.arg("--no-cache");
        }
        for (key, value) in &request.labels {
            cmd.arg("--label").arg(format!("{key}={value}"));
        }
        cmd.arg(&request.context);
        run_checked(cmd, opts)?;
        Ok(())
    }

    fn compose(
        &self,
        invocation: &ComposeInvocation,
        opts: &ProcessOptions,
    ) -> Result<(), RuntimeError> {
        run_checked(self.compose_command(invocation), opts)?;
        Ok(())
    }

    fn exec(&self, request: &ExecRequest, opts: &ProcessOptions) -> Result<(), RuntimeError> {
        let mut cmd = self.command();
        cmd.arg("exec");
        if let Some(user) = &request.user {
            cmd.arg("-u").arg(user);
        }
        if let Some(workdir) = &request.workdir {
            cmd.arg("-w").arg(workdir);
        }
        for (key, value) in &request.env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg(request.container.as_str());
        cmd.args(&request.argv);
        run_checked(cmd, opts)?;
        Ok(())
    }
}

/// Listing and inspection output is parsed, never echoed.
fn quiet(opts: &ProcessOptions) -> ProcessOptions {
    ProcessOptions::new(false, opts.cancel.clone()).with_timeout(opts.timeout)
}

fn succeeds(argv: &[String], args: &[&str]) -> bool {
    Command::new(&argv[0])
        .args(&argv[1..])
        .args(args)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn is_missing_image(output: &str) -> bool {
    let lower = output.to_lowercase();
    ["no such image", "no such object", "image not known", "not found"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    config: InspectConfig,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<LabelMap>,
}

fn parse_inspect(json: &str) -> Result<Vec<ContainerRecord>, RuntimeError> {
    let entries: Vec<InspectEntry> =
        serde_json::from_str(json).map_err(|e| RuntimeError::Parse {
            what: "container inspect output".to_owned(),
            reason: e.to_string(),
        })?;
    Ok(entries
        .into_iter()
        .map(|e| ContainerRecord {
            id: ContainerId::new(e.id),
            name: e.name.trim_start_matches('/').to_owned(),
            running: e.state.running,
            labels: e.config.labels.unwrap_or_default(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_inspect() {
        let json = r#"[
            {
                "Id": "abc123",
                "Name": "/demo-app-1",
                "State": {"Running": true, "Status": "running"},
                "Config": {"Labels": {"dev.dockyard.managed": "true"}, "Image": "x"}
            },
            {
                "Id": "def456",
                "Name": "/demo-db-1",
                "State": {"Running": false},
                "Config": {"Labels": null}
            }
        ]"#;
        let records = parse_inspect(json).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id.as_str(), "abc123");
        assert_eq!(records[0].name, "demo-app-1");
        assert!(records[0].running);
        assert_eq!(records[0].label("dev.dockyard.managed"), Some("true"));
        assert!(!records[1].running);
        assert!(records[1].labels.is_empty());
    }

    #[test]
    fn malformed_inspect_is_parse_error() {
        assert!(matches!(
            parse_inspect("not json"),
            Err(RuntimeError::Parse { .. })
        ));
    }

    #[test]
    fn missing_image_messages() {
        assert!(is_missing_image("Error: No such image: foo:latest"));
        assert!(is_missing_image("Error: foo: image not known"));
        assert!(!is_missing_image("Cannot connect to the Docker daemon"));
    }

    #[test]
    fn explicit_compose_command_is_split() {
        let rt = CliRuntime::new("podman", "podman", Some("podman compose"));
        assert_eq!(rt.compose_argv(), ["podman", "compose"]);
        let inv = ComposeInvocation::new("proj", "up")
            .files(["/a.yml".into(), "/b.yml".into()])
            .args(["-d", "app"]);
        let cmd = rt.compose_command(&inv);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            ["compose", "-p", "proj", "-f", "/a.yml", "-f", "/b.yml", "up", "-d", "app"]
        );
    }

    #[test]
    fn blank_compose_setting_falls_back_to_detection() {
        let rt = CliRuntime::new("docker", "/nonexistent/docker", Some("  "));
        assert!(rt.explicit_compose.is_none());
    }

    #[test]
    fn missing_binary_is_unavailable() {
        let rt = CliRuntime::new("docker", "/nonexistent/dockyard-docker", None);
        assert!(!rt.available());
    }
}
