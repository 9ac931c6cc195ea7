//! Per-service view over one or more compose documents.
//!
//! Only the fields the engine needs are read; everything else in the user's
//! files is left for the orchestration engine to interpret.

use dockyard_schema::{ConfigError, ResolvedConfig, Workspace};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComposeService {
    pub name: String,
    pub image: Option<String>,
    pub has_build: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ComposeModel {
    pub files: Vec<PathBuf>,
    services: BTreeMap<String, ComposeService>,
}

#[derive(Deserialize, Default)]
struct RawDocument {
    #[serde(default)]
    services: BTreeMap<String, Option<RawService>>,
}

#[derive(Deserialize, Default)]
struct RawService {
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    build: Option<serde_yaml::Value>,
}

impl ComposeModel {
    /// Model for a workspace: its compose files, or the single implicit
    /// service the overlay defines when there are none.
    pub fn for_workspace(workspace: &Workspace) -> Result<Self, ConfigError> {
        let files = workspace.compose_files();
        if files.is_empty() {
            Ok(Self::single(&workspace.config))
        } else {
            Self::load(&files)
        }
    }

    /// Read and merge compose files in order; later files override `image`.
    pub fn load(files: &[PathBuf]) -> Result<Self, ConfigError> {
        let mut model = Self {
            files: files.to_vec(),
            services: BTreeMap::new(),
        };
        for path in files {
            let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            model.merge_document(path, &content)?;
        }
        debug!(
            "compose model: {} service(s) from {} file(s)",
            model.services.len(),
            files.len()
        );
        Ok(model)
    }

    /// The implicit single-service model of a config without compose files.
    pub fn single(config: &ResolvedConfig) -> Self {
        let name = config.primary_service().to_owned();
        let mut services = BTreeMap::new();
        services.insert(
            name.clone(),
            ComposeService {
                name,
                image: config.image.clone(),
                has_build: config.build.is_some(),
            },
        );
        Self {
            files: Vec::new(),
            services,
        }
    }

    fn merge_document(&mut self, path: &Path, content: &str) -> Result<(), ConfigError> {
        if content.trim().is_empty() {
            return Ok(());
        }
        let doc: RawDocument =
            serde_yaml::from_str(content).map_err(|e| ConfigError::InvalidCompose {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        for (name, raw) in doc.services {
            if name.trim().is_empty() {
                return Err(ConfigError::InvalidCompose {
                    path: path.to_path_buf(),
                    reason: "empty service name".to_owned(),
                });
            }
            let raw = raw.unwrap_or_default();
            let entry = self
                .services
                .entry(name.clone())
                .or_insert_with(|| ComposeService {
                    name,
                    ..ComposeService::default()
                });
            if raw.image.is_some() {
                entry.image = raw.image;
            }
            entry.has_build |= raw.build.is_some_and(|b| !b.is_null());
        }
        Ok(())
    }

    pub fn service(&self, name: &str) -> Option<&ComposeService> {
        self.services.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn require(&self, name: &str) -> Result<&ComposeService, ConfigError> {
        self.service(name)
            .ok_or_else(|| ConfigError::UndeclaredService {
                service: name.to_owned(),
            })
    }

    /// Fail unless every name is a declared service.
    pub fn require_all<'a>(
        &self,
        names: impl IntoIterator<Item = &'a String>,
    ) -> Result<(), ConfigError> {
        for name in names {
            self.require(name)?;
        }
        Ok(())
    }
}
