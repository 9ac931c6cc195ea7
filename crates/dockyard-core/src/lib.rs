//! Reconciliation engine for dockyard development environments.
//!
//! This crate ties the resolved configuration, identity hashing, and runtime
//! backends together into the `Engine`, the central API for bringing an
//! environment up, starting, stopping, tearing it down, and building it. It
//! also provides the compose model, the override synthesizer, feature
//! ordering and the derived-image cache, state classification, lifecycle
//! hooks, and per-environment locking.

pub mod classify;
pub mod compose;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod engine;
pub mod features;
pub mod hooks;
pub mod image_cache;
pub mod lifecycle;
pub mod run_args;
pub mod synthesize;

pub use classify::{classify, Classification, LifecycleState};
pub use compose::{ComposeModel, ComposeService};
pub use concurrency::{install_signal_handler, EnvLock};
pub use config::EngineConfig;
pub use context::EngineContext;
pub use engine::{
    BuildOptions, BuildReport, DownOptions, Engine, LifecycleReport, StatusReport, UpOptions,
    UpOutcome, UpReport,
};
pub use features::{FeatureSet, ResolvedFeature};
pub use hooks::HookPhase;
pub use image_cache::{CacheOutcome, DerivedImage, FeatureImageCache};
pub use lifecycle::{plan_start, plan_stop, plan_up, StartAction, StopAction, UpAction, UpFlags};
pub use run_args::{parse_run_args, RunArgs, Ulimit};
pub use synthesize::{synthesize, OverrideDocument, ServiceOverride, Synthesis, SynthesisInput};

use dockyard_runtime::RuntimeError;
use dockyard_schema::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("failed to install feature '{feature}': {source}")]
    FeatureBuild {
        feature: String,
        #[source]
        source: RuntimeError,
    },
    #[error("cannot synthesize override for service '{service}': {reason}")]
    Synthesis { service: String, reason: String },
    #[error("{phase} hook{} failed: {source}", key_suffix(.key))]
    Hook {
        phase: HookPhase,
        key: Option<String>,
        #[source]
        source: RuntimeError,
    },
    #[error("environment has not been created; run `dockyard up` first")]
    NotCreated,
    #[error("invalid engine settings in '{}': {reason}", path.display())]
    Settings { path: PathBuf, reason: String },
    #[error("lock error: {0}")]
    Lock(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn key_suffix(key: &Option<String>) -> String {
    key.as_ref().map(|k| format!(" '{k}'")).unwrap_or_default()
}

impl CoreError {
    /// Errors the user fixes by editing configuration rather than the host.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Synthesis { .. } | Self::Settings { .. }
        )
    }

    /// Errors raised by an external process or the runtime itself.
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            Self::Runtime(_) | Self::FeatureBuild { .. } | Self::Hook { .. }
        )
    }
}
