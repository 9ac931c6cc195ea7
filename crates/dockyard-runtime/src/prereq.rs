use crate::backend::RuntimeSettings;
use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: String,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    if name.contains('/') {
        return std::path::Path::new(name).is_file();
    }
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn command_succeeds(argv: &[&str]) -> bool {
    let Some((program, args)) = argv.split_first() else {
        return false;
    };
    Command::new(program)
        .args(args)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check the runtime binary and a usable compose implementation.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_runtime_prereqs(settings: &RuntimeSettings) -> Vec<MissingPrereq> {
    if settings.runtime == "mock" {
        return Vec::new();
    }
    let mut missing = Vec::new();
    let binary = settings.binary.as_deref().unwrap_or(&settings.runtime);

    if !command_exists(binary) {
        missing.push(MissingPrereq {
            name: binary.to_owned(),
            purpose: "container runtime",
            install_hint: "apt install docker.io | dnf install podman | zypper install podman | pacman -S docker",
        });
        return missing;
    }

    let compose_ok = match settings.compose_command.as_deref() {
        Some(explicit) => {
            let mut argv: Vec<&str> = explicit.split_whitespace().collect();
            argv.push("version");
            command_succeeds(&argv)
        }
        None => {
            command_succeeds(&[binary, "compose", "version"])
                || command_exists("docker-compose")
                || command_exists("podman-compose")
        }
    };
    if !compose_ok {
        missing.push(MissingPrereq {
            name: settings
                .compose_command
                .clone()
                .unwrap_or_else(|| format!("{binary} compose")),
            purpose: "multi-container orchestration",
            install_hint: "install the compose plugin, docker-compose, or podman-compose",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\ndockyard needs these tools to manage development containers.");
    msg
}
