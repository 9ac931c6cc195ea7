mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{Session, EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_RUNTIME_ERROR};
use dockyard_core::{BuildOptions, DownOptions, UpOptions};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "dockyard",
    version,
    about = "Reconcile development containers with their workspace configuration"
)]
struct Cli {
    /// Workspace folder holding the project sources.
    #[arg(long, default_value = ".", global = true)]
    workspace_folder: PathBuf,

    /// Resolved devcontainer config, relative to the workspace folder.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Engine settings file (defaults to $XDG_CONFIG_HOME/dockyard/config.toml).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging and stream runtime output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or start the environment, converging it to the configuration.
    Up {
        /// Recreate containers even when they match the configuration.
        #[arg(long, default_value_t = false)]
        recreate: bool,
        /// Rebuild images before starting.
        #[arg(long, default_value_t = false)]
        rebuild: bool,
        /// Build images without the layer cache.
        #[arg(long, default_value_t = false)]
        no_cache: bool,
        /// Limit to these services (the primary service is always included).
        #[arg(long = "service", value_name = "SERVICE")]
        services: Vec<String>,
    },
    /// Remove the environment's containers and networks.
    Down {
        /// Also remove named volumes.
        #[arg(long, default_value_t = false)]
        volumes: bool,
    },
    /// Start existing containers without recreating them.
    Start {
        /// Start these services too; the primary service is always started.
        #[arg(long = "service", value_name = "SERVICE")]
        services: Vec<String>,
    },
    /// Stop running containers, keeping them for a later start.
    Stop {
        /// Stop only these services.
        #[arg(long = "service", value_name = "SERVICE")]
        services: Vec<String>,
    },
    /// Build images (including feature layers) without starting anything.
    Build {
        /// Build without the layer cache.
        #[arg(long, default_value_t = false)]
        no_cache: bool,
        /// Rebuild the feature image even when a cached one exists.
        #[arg(long, default_value_t = false)]
        force: bool,
        #[arg(long = "service", value_name = "SERVICE")]
        services: Vec<String>,
    },
    /// Show the lifecycle state of the environment.
    Status,
    /// Run diagnostic checks on the host and runtime.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DOCKYARD_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let json_output = cli.json;
    let open = || {
        Session::open(
            &cli.workspace_folder,
            cli.config.as_deref(),
            cli.settings.as_deref(),
            cli.verbose,
        )
    };

    let result = match cli.command {
        Commands::Up {
            recreate,
            rebuild,
            no_cache,
            services,
        } => open().and_then(|session| {
            commands::up::run(
                &session,
                &UpOptions {
                    recreate,
                    rebuild,
                    no_cache,
                    services,
                },
                json_output,
            )
        }),
        Commands::Down { volumes } => open().and_then(|session| {
            commands::down::run(&session, &DownOptions { volumes }, json_output)
        }),
        Commands::Start { services } => {
            open().and_then(|session| commands::start::run(&session, &services, json_output))
        }
        Commands::Stop { services } => {
            open().and_then(|session| commands::stop::run(&session, &services, json_output))
        }
        Commands::Build {
            no_cache,
            force,
            services,
        } => open().and_then(|session| {
            commands::build::run(
                &session,
                &BuildOptions {
                    no_cache,
                    force,
                    services,
                },
                json_output,
            )
        }),
        Commands::Status => open().and_then(|session| commands::status::run(&session, json_output)),
        Commands::Doctor => commands::doctor::run(
            &cli.workspace_folder,
            cli.config.as_deref(),
            cli.settings.as_deref(),
            json_output,
        ),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with(commands::CONFIG_PREFIX) {
        EXIT_CONFIG_ERROR
    } else if msg.starts_with(commands::RUNTIME_PREFIX) {
        EXIT_RUNTIME_ERROR
    } else {
        EXIT_FAILURE
    }
}
