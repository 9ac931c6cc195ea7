pub mod build;
pub mod completions;
pub mod doctor;
pub mod down;
pub mod man_pages;
pub mod start;
pub mod status;
pub mod stop;
pub mod up;

use dockyard_core::{CoreError, Engine, EngineConfig, EngineContext, LifecycleState};
use dockyard_schema::Workspace;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_RUNTIME_ERROR: u8 = 3;

pub const CONFIG_PREFIX: &str = "configuration error:";
pub const RUNTIME_PREFIX: &str = "runtime error:";

/// Everything an engine-backed command needs: settings, engine, workspace.
pub struct Session {
    pub settings: EngineConfig,
    pub engine: Engine,
    pub workspace: Workspace,
    verbose: bool,
}

impl Session {
    pub fn open(
        folder: &Path,
        config_path: Option<&Path>,
        settings_path: Option<&Path>,
        verbose: bool,
    ) -> Result<Self, String> {
        let settings = load_settings(settings_path).map_err(|e| describe(&e))?;
        let workspace =
            Workspace::load(folder, config_path).map_err(|e| describe(&CoreError::Config(e)))?;

        if std::env::var("DOCKYARD_SKIP_PREREQS").as_deref() != Ok("1") {
            let missing = dockyard_runtime::check_runtime_prereqs(&settings.runtime_settings());
            if !missing.is_empty() {
                return Err(format!(
                    "{RUNTIME_PREFIX} {}",
                    dockyard_runtime::format_missing(&missing)
                ));
            }
        }

        let ctx = EngineContext::from_config(&settings)
            .map_err(|e| describe(&e))?
            .with_stream(verbose);
        dockyard_core::install_signal_handler(ctx.cancel());

        Ok(Self {
            settings,
            engine: Engine::new(ctx),
            workspace,
            verbose,
        })
    }

    /// Spinner on stderr; hidden for JSON output and while runtime output streams.
    pub fn progress(&self, msg: &str, json_output: bool) -> ProgressBar {
        if json_output || self.verbose {
            return ProgressBar::hidden();
        }
        spinner(msg)
    }
}

pub fn load_settings(path: Option<&Path>) -> Result<EngineConfig, CoreError> {
    match path {
        Some(path) => {
            Ok(EngineConfig::load(path)?.with_overrides(|key| std::env::var(key).ok()))
        }
        None => EngineConfig::from_environment(),
    }
}

/// Render an engine error with the prefix that selects its exit code.
pub fn describe(err: &CoreError) -> String {
    let msg = err.to_string();
    let prefix = if err.is_configuration() {
        CONFIG_PREFIX
    } else if err.is_runtime() {
        RUNTIME_PREFIX
    } else {
        return msg;
    };
    if msg.starts_with(prefix) {
        msg
    } else {
        format!("{prefix} {msg}")
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_state(state: LifecycleState) -> String {
    use console::Style;
    let text = state.to_string();
    match state {
        LifecycleState::Running => Style::new().green().bold().apply_to(text).to_string(),
        LifecycleState::Created => Style::new().yellow().apply_to(text).to_string(),
        LifecycleState::Stale => Style::new().red().apply_to(text).to_string(),
        LifecycleState::Absent => Style::new().dim().apply_to(text).to_string(),
    }
}

/// Print configuration diagnostics collected while synthesizing the overlay.
pub fn print_diagnostics(diagnostics: &[String]) {
    let style = console::Style::new().yellow();
    for d in diagnostics {
        eprintln!("{} {d}", style.apply_to("warning:"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_runtime::RuntimeError;
    use dockyard_schema::ConfigError;
    use std::path::PathBuf;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn colorize_state_keeps_the_name() {
        for state in [
            LifecycleState::Absent,
            LifecycleState::Created,
            LifecycleState::Running,
            LifecycleState::Stale,
        ] {
            assert!(colorize_state(state).contains(&state.to_string()));
        }
    }

    #[test]
    fn describe_prefixes_configuration_errors() {
        let err = CoreError::Synthesis {
            service: "db".to_owned(),
            reason: "ports must be numeric".to_owned(),
        };
        let msg = describe(&err);
        assert!(msg.starts_with(CONFIG_PREFIX));
        assert!(msg.contains("'db'"));

        let err = CoreError::Config(ConfigError::UndeclaredService {
            service: "ghost".to_owned(),
        });
        let msg = describe(&err);
        assert!(msg.starts_with(CONFIG_PREFIX));
        assert_eq!(msg.matches(CONFIG_PREFIX).count(), 1);
    }

    #[test]
    fn describe_prefixes_runtime_errors() {
        let err = CoreError::FeatureBuild {
            feature: "ghcr.io/acme/node:1".to_owned(),
            source: RuntimeError::ExecFailed("exit 1".to_owned()),
        };
        let msg = describe(&err);
        assert!(msg.starts_with(RUNTIME_PREFIX));
        assert!(msg.contains("ghcr.io/acme/node:1"));
    }

    #[test]
    fn describe_leaves_other_errors_alone() {
        assert_eq!(describe(&CoreError::Lock("busy".to_owned())), "lock error: busy");
        let err = CoreError::Settings {
            path: PathBuf::from("/etc/dockyard.toml"),
            reason: "unknown field".to_owned(),
        };
        assert!(describe(&err).starts_with(CONFIG_PREFIX));
    }

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_SUCCESS, EXIT_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_CONFIG_ERROR);
        assert_ne!(EXIT_CONFIG_ERROR, EXIT_RUNTIME_ERROR);
    }

    #[test]
    fn spinner_finishes_both_ways() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
        let pb = spinner("testing...");
        spin_fail(&pb, "failed");
    }

    #[test]
    fn explicit_settings_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "runtime = \"podman\"\ncommand_timeout_secs = 30\n").unwrap();
        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.command_timeout_secs, Some(30));
    }
}
