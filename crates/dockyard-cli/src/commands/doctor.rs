use super::{load_settings, EXIT_FAILURE, EXIT_SUCCESS};
use dockyard_core::{EngineConfig, EnvLock};
use dockyard_runtime::{HostSelinuxProbe, SelinuxMode, SelinuxProbe};
use dockyard_schema::{compute_identity, Workspace};
use serde::Serialize;
use std::path::Path;

pub fn run(
    folder: &Path,
    config_path: Option<&Path>,
    settings_path: Option<&Path>,
    json_output: bool,
) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    let settings = match load_settings(settings_path) {
        Ok(settings) => {
            checks.push(Check::pass(
                "settings",
                &format!(
                    "Engine settings valid (runtime {})",
                    settings.runtime_settings().runtime
                ),
            ));
            settings
        }
        Err(e) => {
            all_pass = false;
            checks.push(Check::fail("settings", &e.to_string()));
            EngineConfig::default()
        }
    };

    check_runtime(&settings, &mut checks, &mut all_pass);
    check_selinux(&HostSelinuxProbe, &mut checks);

    let state_dir = settings.state_dir();
    match std::fs::create_dir_all(&state_dir) {
        Ok(()) => {
            checks.push(Check::pass(
                "state_dir",
                &format!("State directory {} is writable", state_dir.display()),
            ));
            check_disk_space(&state_dir, &mut checks);
        }
        Err(e) => {
            all_pass = false;
            checks.push(Check::fail(
                "state_dir",
                &format!("Cannot create state directory {}: {e}", state_dir.display()),
            ));
        }
    }

    check_workspace(folder, config_path, &state_dir, &mut checks, &mut all_pass);

    print_results(&checks, all_pass, json_output)
}

fn check_runtime(settings: &EngineConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let runtime_settings = settings.runtime_settings();
    let missing = dockyard_runtime::check_runtime_prereqs(&runtime_settings);
    if !missing.is_empty() {
        *all_pass = false;
        checks.push(Check::fail(
            "runtime_prereqs",
            &dockyard_runtime::format_missing(&missing),
        ));
        return;
    }
    checks.push(Check::pass(
        "runtime_prereqs",
        "Runtime prerequisites satisfied",
    ));

    match dockyard_runtime::select_runtime(&runtime_settings) {
        Ok(runtime) if runtime.available() => checks.push(Check::pass(
            "runtime_available",
            &format!("Runtime '{}' is reachable", runtime.name()),
        )),
        Ok(runtime) => {
            *all_pass = false;
            checks.push(Check::fail(
                "runtime_available",
                &format!("Runtime '{}' is installed but not responding", runtime.name()),
            ));
        }
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("runtime_available", &e.to_string()));
        }
    }
}

fn check_selinux(probe: &dyn SelinuxProbe, checks: &mut Vec<Check>) {
    let mode = probe.mode();
    let message = match mode {
        SelinuxMode::Enforcing => {
            "SELinux is enforcing; bind mounts are relabelled with :Z".to_owned()
        }
        other => format!("SELinux: {other}"),
    };
    checks.push(Check::info("selinux", &message));
}

fn check_workspace(
    folder: &Path,
    config_path: Option<&Path>,
    state_dir: &Path,
    checks: &mut Vec<Check>,
    all_pass: &mut bool,
) {
    let workspace = match Workspace::load(folder, config_path) {
        Ok(ws) => ws,
        Err(dockyard_schema::ConfigError::Io { path, .. }) => {
            checks.push(Check::info(
                "workspace_config",
                &format!("No config at {}", path.display()),
            ));
            return;
        }
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("workspace_config", &e.to_string()));
            return;
        }
    };

    let identity = compute_identity(&workspace);
    checks.push(Check::pass(
        "workspace_config",
        &format!(
            "Config {} valid ({} plan, primary service '{}', env key {})",
            workspace.config_path.display(),
            workspace.config.plan(),
            workspace.config.primary_service(),
            identity.env_key
        ),
    ));

    match EnvLock::try_acquire(state_dir, &identity.env_key) {
        Ok(Some(_)) => checks.push(Check::pass("env_lock", "Environment lock is free")),
        Ok(None) => checks.push(Check::warn(
            "env_lock",
            "Environment lock is held by another dockyard process",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "env_lock",
                &format!("Cannot check environment lock: {e}"),
            ));
        }
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("Dockyard Doctor\n");
        for check in checks {
            let icon = match check.status {
                Status::Pass => "✓",
                Status::Fail => "✗",
                Status::Warn => "⚠",
                Status::Info => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Status {
    Pass,
    Fail,
    Warn,
    Info,
}

#[derive(Debug, Serialize)]
struct Check {
    name: String,
    status: Status,
    message: String,
}

impl Check {
    fn new(name: &str, status: Status, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &str, message: &str) -> Self {
        Self::new(name, Status::Pass, message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::new(name, Status::Fail, message)
    }

    fn warn(name: &str, message: &str) -> Self {
        Self::new(name, Status::Warn, message)
    }

    fn info(name: &str, message: &str) -> Self {
        Self::new(name, Status::Info, message)
    }
}

fn check_disk_space(path: &Path, checks: &mut Vec<Check>) {
    let Ok(c_path) = std::ffi::CString::new(path.to_string_lossy().as_bytes()) else {
        return;
    };

    // SAFETY: zeroed statvfs is a valid initial state for the struct.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a live, writable struct;
    // it is only read after a zero return.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &raw mut stat) };
    if ret != 0 {
        return;
    }

    #[allow(clippy::useless_conversion)]
    let avail_mb = u64::from(stat.f_bavail) * u64::from(stat.f_frsize) / (1024 * 1024);

    if avail_mb < 512 {
        checks.push(Check::warn(
            "disk_space",
            &format!("Low disk space for images: {avail_mb} MB available"),
        ));
    } else {
        checks.push(Check::pass(
            "disk_space",
            &format!("Disk space: {} GB available", avail_mb / 1024),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_runtime::FixedSelinuxProbe;

    #[test]
    fn selinux_is_reported_as_info() {
        let mut checks = Vec::new();
        check_selinux(&FixedSelinuxProbe(SelinuxMode::Enforcing), &mut checks);
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].status, Status::Info);
        assert!(checks[0].message.contains(":Z"));
    }

    #[test]
    fn missing_config_is_informational() {
        let dir = tempfile::tempdir().unwrap();
        let mut checks = Vec::new();
        let mut all_pass = true;
        check_workspace(dir.path(), None, dir.path(), &mut checks, &mut all_pass);
        assert!(all_pass);
        assert_eq!(checks[0].status, Status::Info);
    }

    #[test]
    fn invalid_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        let mut checks = Vec::new();
        let mut all_pass = true;
        check_workspace(
            dir.path(),
            Some(Path::new("broken.json")),
            dir.path(),
            &mut checks,
            &mut all_pass,
        );
        assert!(!all_pass);
        assert_eq!(checks[0].status, Status::Fail);
    }

    #[test]
    fn valid_config_checks_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("devcontainer.json"),
            r#"{"image": "alpine:3.19"}"#,
        )
        .unwrap();
        let state = tempfile::tempdir().unwrap();
        let mut checks = Vec::new();
        let mut all_pass = true;
        check_workspace(
            dir.path(),
            Some(Path::new("devcontainer.json")),
            state.path(),
            &mut checks,
            &mut all_pass,
        );
        assert!(all_pass);
        let names: Vec<&str> = checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["workspace_config", "env_lock"]);
        assert_eq!(checks[1].status, Status::Pass);
    }

    #[test]
    fn disk_space_reports_for_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut checks = Vec::new();
        check_disk_space(dir.path(), &mut checks);
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].name, "disk_space");
    }
}
