//! Derived images: a base image with every declared feature layered on top.
//!
//! The tag is a content digest, so an unchanged base and feature set reuse
//! the image already present in the local store.

use crate::compose::ComposeModel;
use crate::context::EngineContext;
use crate::features::{copy_source_dir, hash_source_dir, shell_quote, FeatureSet};
use crate::CoreError;
use dockyard_runtime::mock::FEATURE_MARKER;
use dockyard_runtime::{ComposeInvocation, ImageBuildRequest, RuntimeError};
use dockyard_schema::{labels, EnvironmentIdentity, Plan, Workspace};
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

const DIGEST_LEN: usize = 16;
const FEATURE_ROOT: &str = "/tmp/dockyard-features";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DerivedImage {
    pub tag: String,
    pub base_image: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheOutcome {
    Built,
    Cached,
}

/// The base image features are layered onto.
struct BaseImage {
    reference: String,
    /// Present when the base was built locally rather than named.
    image_id: Option<String>,
}

pub struct FeatureImageCache<'a> {
    ctx: &'a EngineContext,
}

impl<'a> FeatureImageCache<'a> {
    pub fn new(ctx: &'a EngineContext) -> Self {
        Self { ctx }
    }

    /// Return the derived image for `features`, building it when absent or
    /// when `force` is set.
    pub fn derive(
        &self,
        workspace: &Workspace,
        identity: &EnvironmentIdentity,
        model: &ComposeModel,
        features: &FeatureSet,
        force: bool,
        no_cache: bool,
    ) -> Result<(DerivedImage, CacheOutcome), CoreError> {
        let base = self.base_image(workspace, identity, model, force, no_cache)?;
        let digest = derived_digest(&base, features)?;
        let derived = DerivedImage {
            tag: format!("dockyard-features-{}:{}", identity.env_key, &digest[..DIGEST_LEN]),
            base_image: base.reference.clone(),
        };

        let opts = self.ctx.process_options();
        if !force && self.ctx.runtime().image_id(&derived.tag, &opts)?.is_some() {
            info!("using cached derived image {}", derived.tag);
            return Ok((derived, CacheOutcome::Cached));
        }

        info!(
            "building derived image {} ({} features on {})",
            derived.tag,
            features.len(),
            derived.base_image
        );
        let dir = tempfile::Builder::new().prefix("dockyard-features-").tempdir()?;
        let result = self.build_derived(dir.path(), &derived, identity, features, no_cache);
        if let Err(e) = dir.close() {
            warn!("failed to remove feature build context: {e}");
        }
        result.map(|()| (derived, CacheOutcome::Built))
    }

    fn base_image(
        &self,
        workspace: &Workspace,
        identity: &EnvironmentIdentity,
        model: &ComposeModel,
        force: bool,
        no_cache: bool,
    ) -> Result<BaseImage, CoreError> {
        let config = &workspace.config;
        let primary = config.primary_service();
        let runtime = self.ctx.runtime();
        let opts = self.ctx.process_options();

        match config.plan() {
            Plan::Compose => {
                let service = model.require(primary)?;
                if !service.has_build {
                    return match &service.image {
                        Some(image) => Ok(BaseImage {
                            reference: image.clone(),
                            image_id: None,
                        }),
                        None => Err(CoreError::Synthesis {
                            service: primary.to_owned(),
                            reason: "features require a base image but the service has neither image nor build"
                                .to_owned(),
                        }),
                    };
                }
                let reference = service
                    .image
                    .clone()
                    .unwrap_or_else(|| format!("{}-{primary}", identity.compose_project));
                if force || runtime.image_id(&reference, &opts)?.is_none() {
                    debug!("building base service '{primary}'");
                    let mut args = Vec::new();
                    if no_cache {
                        args.push("--no-cache".to_owned());
                    }
                    args.push(primary.to_owned());
                    let invocation = ComposeInvocation::new(&identity.compose_project, "build")
                        .files(model.files.iter().cloned())
                        .args(args);
                    runtime.compose(&invocation, &opts)?;
                }
                let image_id = runtime.image_id(&reference, &opts)?;
                Ok(BaseImage { reference, image_id })
            }
            Plan::Single => {
                if let Some(image) = &config.image {
                    return Ok(BaseImage {
                        reference: image.clone(),
                        image_id: None,
                    });
                }
                let Some(build) = &config.build else {
                    return Err(CoreError::Synthesis {
                        service: primary.to_owned(),
                        reason: "features require an image or a build definition".to_owned(),
                    });
                };
                let reference = format!("dockyard-base-{}:latest", identity.env_key);
                if force || runtime.image_id(&reference, &opts)?.is_none() {
                    let context = workspace.resolve_path(build.context.as_deref().unwrap_or("."));
                    let dockerfile = match &build.dockerfile {
                        Some(d) => workspace.resolve_path(d),
                        None => context.join("Dockerfile"),
                    };
                    let mut image_labels = labels::LabelMap::new();
                    image_labels.insert(labels::MANAGED.to_owned(), "true".to_owned());
                    image_labels.insert(labels::ENV_KEY.to_owned(), identity.env_key.to_string());
                    debug!("building base image {reference}");
                    runtime.build_image(
                        &ImageBuildRequest {
                            context,
                            dockerfile,
                            tag: reference.clone(),
                            build_args: build.args.clone(),
                            target: build.target.clone(),
                            no_cache,
                            labels: image_labels,
                        },
                        &opts,
                    )?;
                }
                let image_id = runtime.image_id(&reference, &opts)?;
                Ok(BaseImage { reference, image_id })
            }
        }
    }

    fn build_derived(
        &self,
        dir: &Path,
        derived: &DerivedImage,
        identity: &EnvironmentIdentity,
        features: &FeatureSet,
        no_cache: bool,
    ) -> Result<(), CoreError> {
        let dockerfile = write_context(dir, &derived.base_image, features)?;
        let mut image_labels = labels::LabelMap::new();
        image_labels.insert(labels::MANAGED.to_owned(), "true".to_owned());
        image_labels.insert(labels::ENV_KEY.to_owned(), identity.env_key.to_string());
        let request = ImageBuildRequest {
            context: dir.to_path_buf(),
            dockerfile,
            tag: derived.tag.clone(),
            no_cache,
            labels: image_labels,
            ..ImageBuildRequest::default()
        };
        self.ctx
            .runtime()
            .build_image(&request, &self.ctx.process_options())
            .map_err(|err| attribute_failure(err, features))
    }
}

/// Name the feature whose layer was running when the build failed. Before
/// any layer ran (base pull, daemon error) that is the first to install.
fn attribute_failure(err: RuntimeError, features: &FeatureSet) -> CoreError {
    let marked = match &err {
        RuntimeError::CommandFailed { output, .. } => last_marker(output),
        _ => None,
    };
    match marked.or_else(|| features.iter().next().map(|f| f.id.clone())) {
        Some(feature) => CoreError::FeatureBuild { feature, source: err },
        None => CoreError::Runtime(err),
    }
}

fn last_marker(output: &str) -> Option<String> {
    output.lines().rev().find_map(|line| {
        let rest = &line[line.find(FEATURE_MARKER)? + FEATURE_MARKER.len()..];
        let id = rest
            .split(|c: char| c.is_whitespace() || c == '\'' || c == '"')
            .next()
            .unwrap_or_default();
        (!id.is_empty()).then(|| id.to_owned())
    })
}

/// Tag digest over the image inputs only: base reference and id, then each
/// feature's id, options and source tree. The config hash is left out on
/// purpose, so edits that do not change the image (env, mounts, hooks) keep
/// reusing the cached derived image.
fn derived_digest(base: &BaseImage, features: &FeatureSet) -> Result<String, CoreError> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"dockyard-derived-v1\0");
    hasher.update(base.reference.as_bytes());
    hasher.update(b"\0");
    if let Some(id) = &base.image_id {
        hasher.update(id.as_bytes());
    }
    hasher.update(b"\0");
    for feature in features.iter() {
        hasher.update(feature.id.as_bytes());
        hasher.update(b"\0");
        hasher.update(serde_json::to_string(&feature.options)?.as_bytes());
        hasher.update(b"\0");
        if let Some(dir) = &feature.source_dir {
            hasher.update(hash_source_dir(dir)?.as_bytes());
        }
        hasher.update(b"\0");
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Lay out the build context and return the Dockerfile path.
fn write_context(dir: &Path, base: &str, features: &FeatureSet) -> Result<std::path::PathBuf, CoreError> {
    let mut dockerfile = format!("FROM {base}\nUSER root\n");
    for (idx, feature) in features.iter().enumerate() {
        let marker = shell_quote(&format!("{FEATURE_MARKER}{}", feature.id));
        match &feature.source_dir {
            Some(source) => {
                let name = format!("feature-{idx}");
                let staged = dir.join(&name);
                copy_source_dir(source, &staged)?;
                fs::write(staged.join("devcontainer-features.env"), feature.options_env())?;
                let target = format!("{FEATURE_ROOT}/{idx}");
                let _ = writeln!(dockerfile, "COPY {name} {target}");
                let _ = writeln!(
                    dockerfile,
                    "RUN echo {marker} && cd {target} && set -a && . ./devcontainer-features.env && set +a && chmod +x ./install.sh && ./install.sh"
                );
            }
            None => {
                debug!("feature '{}' has no local source; adding marker layer only", feature.id);
                let _ = writeln!(dockerfile, "RUN echo {marker}");
            }
        }
        for (k, v) in &feature.container_env {
            let _ = writeln!(dockerfile, "ENV {k}={}", serde_json::Value::String(v.clone()));
        }
    }
    let path = dir.join("Dockerfile");
    fs::write(&path, dockerfile)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockyard_schema::parse_config_str;

    fn feature_set(dir: &Path, json: &str) -> FeatureSet {
        let config = parse_config_str(json).unwrap();
        let ws = Workspace::new(dir, dir.join("devcontainer.json"), config).unwrap();
        FeatureSet::resolve(&ws).unwrap()
    }

    fn base(reference: &str, id: Option<&str>) -> BaseImage {
        BaseImage {
            reference: reference.to_owned(),
            image_id: id.map(str::to_owned),
        }
    }

    #[test]
    fn digest_tracks_base_options_and_sources() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("feat");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("install.sh"), "echo one").unwrap();

        let json = r#"{"image": "ubuntu", "features": [{"id": "./feat", "options": {"v": "1"}}]}"#;
        let set = feature_set(dir.path(), json);
        let a = derived_digest(&base("ubuntu", None), &set).unwrap();
        assert_eq!(a, derived_digest(&base("ubuntu", None), &set).unwrap());
        assert_ne!(a, derived_digest(&base("debian", None), &set).unwrap());
        assert_ne!(a, derived_digest(&base("ubuntu", Some("sha256:1")), &set).unwrap());

        let other = feature_set(
            dir.path(),
            r#"{"image": "ubuntu", "features": [{"id": "./feat", "options": {"v": "2"}}]}"#,
        );
        assert_ne!(a, derived_digest(&base("ubuntu", None), &other).unwrap());

        fs::write(src.join("install.sh"), "echo two").unwrap();
        assert_ne!(a, derived_digest(&base("ubuntu", None), &set).unwrap());
    }

    #[test]
    fn context_layers_follow_install_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b"] {
            let src = dir.path().join(name);
            fs::create_dir_all(&src).unwrap();
            fs::write(src.join("install.sh"), format!("echo {name}")).unwrap();
        }
        let set = feature_set(
            dir.path(),
            r#"{"image": "ubuntu", "features": [
                {"id": "./a", "dependsOn": ["./b"], "options": {"version": "lts"}, "containerEnv": {"A_HOME": "/opt/a"}},
                {"id": "./b"},
                {"id": "ghcr.io/x/remote:1"}
            ]}"#,
        );
        let ctx = tempfile::tempdir().unwrap();
        let path = write_context(ctx.path(), "ubuntu:22.04", &set).unwrap();
        let dockerfile = fs::read_to_string(path).unwrap();
        assert!(dockerfile.starts_with("FROM ubuntu:22.04\n"));
        let b = dockerfile.find("dockyard-feature: ./b").unwrap();
        let a = dockerfile.find("dockyard-feature: ./a").unwrap();
        let remote = dockerfile.find("dockyard-feature: ghcr.io/x/remote:1").unwrap();
        assert!(b < a && a < remote);
        assert!(dockerfile.contains("ENV A_HOME=\"/opt/a\""));
        let env = fs::read_to_string(ctx.path().join("feature-1/devcontainer-features.env")).unwrap();
        assert_eq!(env, "VERSION='lts'\n");
        assert!(ctx.path().join("feature-0/install.sh").exists());
    }

    fn failed(output: &str) -> RuntimeError {
        RuntimeError::CommandFailed {
            command: "docker build".to_owned(),
            status: "exit code 1".to_owned(),
            output: output.to_owned(),
        }
    }

    #[test]
    fn failure_is_attributed_to_last_marker() {
        let dir = tempfile::tempdir().unwrap();
        let set = feature_set(
            dir.path(),
            r#"{"image": "ubuntu", "features": [{"id": "./a"}, {"id": "./b"}]}"#,
        );
        let err = attribute_failure(
            failed("dockyard-feature: ./a\nok\ndockyard-feature: ./b\ninstall.sh: boom\n"),
            &set,
        );
        assert!(matches!(err, CoreError::FeatureBuild { ref feature, .. } if feature == "./b"));
    }

    #[test]
    fn failure_before_any_layer_names_the_first_feature() {
        let dir = tempfile::tempdir().unwrap();
        let set = feature_set(
            dir.path(),
            r#"{"image": "ubuntu", "features": [{"id": "./a", "dependsOn": ["./b"]}, {"id": "./b"}]}"#,
        );
        let err = attribute_failure(failed("pull access denied"), &set);
        assert!(matches!(err, CoreError::FeatureBuild { ref feature, .. } if feature == "./b"));

        let err = attribute_failure(RuntimeError::BackendUnavailable("docker".to_owned()), &set);
        assert!(matches!(err, CoreError::FeatureBuild { ref feature, .. } if feature == "./b"));
        assert!(err.is_runtime());
    }
}
