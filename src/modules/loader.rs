//! Module loader: resolves a descriptor's `location` to a fresh module instance.
//!
//! The set of implementations is closed and registered at startup under stable
//! location keys. Installing a module means adding a registry row pointing at one
//! of those keys. Per-module configuration is read from
//! `<modules_dir>/<location>/rsc.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ModuleError;
use crate::modules::hello_world::{self, HelloWorldModule};
use crate::modules::history::{self, HistoryModule};
use crate::modules::{Module, ModuleConfig};
use crate::registry::ModuleDescriptor;

/// Name of the per-module configuration file.
pub const RSC_FILE: &str = "rsc.json";

/// Builds one module instance from its configuration.
pub type ModuleFactory =
    Arc<dyn Fn(ModuleConfig) -> Result<Box<dyn Module>, ModuleError> + Send + Sync>;

/// Resolves descriptors to module instances.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, descriptor: &ModuleDescriptor) -> Result<Box<dyn Module>, ModuleError>;
}

/// Loader backed by a fixed table of factories.
pub struct StaticLoader {
    factories: HashMap<String, ModuleFactory>,
    modules_dir: PathBuf,
    lang: String,
}

impl StaticLoader {
    /// Create an empty loader.
    pub fn new(modules_dir: impl Into<PathBuf>, lang: impl Into<String>) -> Self {
        Self {
            factories: HashMap::new(),
            modules_dir: modules_dir.into(),
            lang: lang.into(),
        }
    }

    /// Loader with the built-in modules registered.
    pub fn with_builtins(modules_dir: impl Into<PathBuf>, lang: impl Into<String>) -> Self {
        let mut loader = Self::new(modules_dir, lang);
        loader.register(history::LOCATION, |config| {
            Ok(Box::new(HistoryModule::new(config)))
        });
        loader.register(hello_world::LOCATION, |config| {
            Ok(Box::new(HelloWorldModule::new(config)?))
        });
        loader
    }

    /// Register (or replace) the factory for a location key.
    pub fn register<F>(&mut self, location: &str, factory: F)
    where
        F: Fn(ModuleConfig) -> Result<Box<dyn Module>, ModuleError> + Send + Sync + 'static,
    {
        let key = normalize_location(location).to_string();
        tracing::debug!(location = %key, "Registered module factory");
        self.factories.insert(key, Arc::new(factory));
    }

    /// Registered location keys, sorted.
    pub fn locations(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn modules_dir(&self) -> &Path {
        &self.modules_dir
    }

    /// Read the module's `rsc.json`. A missing file is an empty object.
    async fn read_rsc(&self, location: &str) -> Result<serde_json::Value, ModuleError> {
        let path = self.modules_dir.join(location).join(RSC_FILE);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(serde_json::json!({}));
            }
            Err(e) => {
                return Err(ModuleError::Resolution {
                    location: location.to_string(),
                    reason: format!("cannot read {}: {e}", path.display()),
                });
            }
        };

        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| ModuleError::Resolution {
                location: location.to_string(),
                reason: format!("invalid {}: {e}", path.display()),
            })?;
        if !value.is_object() {
            return Err(ModuleError::Resolution {
                location: location.to_string(),
                reason: format!("{} is not a JSON object", path.display()),
            });
        }
        Ok(value)
    }
}

#[async_trait]
impl ModuleLoader for StaticLoader {
    async fn load(&self, descriptor: &ModuleDescriptor) -> Result<Box<dyn Module>, ModuleError> {
        let location = normalize_location(&descriptor.location);
        let factory = self
            .factories
            .get(location)
            .ok_or_else(|| ModuleError::Resolution {
                location: location.to_string(),
                reason: "no module registered at this location".to_string(),
            })?;

        let rsc = self.read_rsc(location).await?;
        factory(ModuleConfig {
            name: descriptor.name.clone(),
            location: location.to_string(),
            metadata: descriptor.metadata.clone(),
            rsc,
            lang: self.lang.clone(),
        })
    }
}

/// Strip trailing slashes: `talk/hello_world/` and `talk/hello_world` are the same key.
fn normalize_location(location: &str) -> &str {
    location.trim_end_matches('/')
}
