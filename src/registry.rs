//! Module registry: the ordered catalog of installed modules.
//!
//! Readers work on an immutable snapshot (`Arc<Vec<_>>`) so a `find_candidates`
//! call never observes a half-applied administrative change. Writers build a new
//! snapshot and swap it in under the write lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::interaction::TEXT_DATATYPE;
use crate::modules::{hello_world, history};
use crate::store::ModuleCatalog;

/// Content type that accepts every payload kind.
pub const WILDCARD_CONTENT_TYPE: &str = "*";

/// Condition matching every body.
pub const CATCH_ALL_CONDITION: &str = ".*";

/// One installed module: when it is eligible and where its implementation lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Unique name.
    pub name: String,
    /// Lower runs first.
    pub priority: i64,
    pub enabled: bool,
    /// Payload kind this module accepts, or `*`.
    #[serde(rename = "type")]
    pub content_type: String,
    /// Regular expression searched case-insensitively in the body.
    pub condition: String,
    /// Key resolved by the module loader.
    #[serde(rename = "path")]
    pub location: String,
    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Value,
}

fn empty_metadata() -> serde_json::Value {
    serde_json::json!({})
}

impl ModuleDescriptor {
    /// An enabled descriptor accepting every content type, with empty metadata.
    pub fn new(
        name: impl Into<String>,
        priority: i64,
        condition: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            enabled: true,
            content_type: WILDCARD_CONTENT_TYPE.to_string(),
            condition: condition.into(),
            location: location.into(),
            metadata: empty_metadata(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether this module accepts payloads of `content_type`.
    pub fn accepts(&self, content_type: &str) -> bool {
        self.content_type == WILDCARD_CONTENT_TYPE || self.content_type == content_type
    }

    /// Compile the condition (case-insensitive).
    pub fn compile_condition(&self) -> Result<Regex, RegistryError> {
        RegexBuilder::new(&self.condition)
            .case_insensitive(true)
            .build()
            .map_err(|e| RegistryError::InvalidCondition {
                name: self.name.clone(),
                reason: e.to_string(),
            })
    }
}

/// The modules every installation starts with.
pub fn default_descriptors() -> Vec<ModuleDescriptor> {
    vec![
        ModuleDescriptor::new("history", 0, CATCH_ALL_CONDITION, history::LOCATION),
        ModuleDescriptor::new(
            "hello_world",
            1,
            hello_world::GREETING_CONDITION,
            hello_world::LOCATION,
        )
        .with_content_type(TEXT_DATATYPE),
    ]
}

/// A descriptor with its compiled condition and registration slot.
#[derive(Debug)]
struct RegisteredModule {
    descriptor: ModuleDescriptor,
    regex: Regex,
    seq: u64,
}

type Snapshot = Arc<Vec<Arc<RegisteredModule>>>;

/// Ordered module catalog. Entries are kept sorted by `(priority, registration order)`.
pub struct ModuleRegistry {
    snapshot: RwLock<Snapshot>,
    next_seq: AtomicU64,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Vec::new())),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Build a registry from persisted descriptors.
    ///
    /// Rows with an invalid condition are skipped with a warning.
    pub async fn load(catalog: &dyn ModuleCatalog) -> Result<Self, RegistryError> {
        let registry = Self::new();
        registry.refresh(catalog).await?;
        Ok(registry)
    }

    /// Replace the whole snapshot with the catalog's current rows. Returns the
    /// number of modules now registered.
    pub async fn refresh(&self, catalog: &dyn ModuleCatalog) -> Result<usize, RegistryError> {
        let descriptors = catalog.list_modules().await?;

        let mut entries = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            match descriptor.compile_condition() {
                Ok(regex) => entries.push(Arc::new(RegisteredModule {
                    descriptor,
                    regex,
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                })),
                Err(e) => {
                    warn!(module = %descriptor.name, error = %e, "Skipping module with invalid condition");
                }
            }
        }
        sort_entries(&mut entries);

        let count = entries.len();
        *self.snapshot.write().await = Arc::new(entries);
        info!(modules = count, "Module registry loaded");
        Ok(count)
    }

    /// Add a new module. Fails if the name is taken or the condition does not compile.
    pub async fn register(&self, descriptor: ModuleDescriptor) -> Result<(), RegistryError> {
        let regex = descriptor.compile_condition()?;
        let mut guard = self.snapshot.write().await;
        if guard.iter().any(|m| m.descriptor.name == descriptor.name) {
            return Err(RegistryError::DuplicateName(descriptor.name));
        }

        let mut entries: Vec<_> = guard.iter().cloned().collect();
        debug!(module = %descriptor.name, priority = descriptor.priority, "Registered module");
        entries.push(Arc::new(RegisteredModule {
            descriptor,
            regex,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        }));
        sort_entries(&mut entries);
        *guard = Arc::new(entries);
        Ok(())
    }

    /// Insert or replace by name. A replaced entry keeps its registration slot.
    pub async fn upsert(&self, descriptor: ModuleDescriptor) -> Result<(), RegistryError> {
        let regex = descriptor.compile_condition()?;
        let mut guard = self.snapshot.write().await;

        let mut entries: Vec<_> = guard.iter().cloned().collect();
        let seq = match entries
            .iter()
            .position(|m| m.descriptor.name == descriptor.name)
        {
            Some(idx) => entries.remove(idx).seq,
            None => self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        entries.push(Arc::new(RegisteredModule {
            descriptor,
            regex,
            seq,
        }));
        sort_entries(&mut entries);
        *guard = Arc::new(entries);
        Ok(())
    }

    /// Enable or disable a module by name.
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), RegistryError> {
        let mut guard = self.snapshot.write().await;
        let idx = guard
            .iter()
            .position(|m| m.descriptor.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        let mut entries: Vec<_> = guard.iter().cloned().collect();
        let current = &entries[idx];
        let mut descriptor = current.descriptor.clone();
        descriptor.enabled = enabled;
        let replacement = Arc::new(RegisteredModule {
            descriptor,
            regex: current.regex.clone(),
            seq: current.seq,
        });
        entries[idx] = replacement;
        *guard = Arc::new(entries);
        debug!(module = name, enabled, "Module toggled");
        Ok(())
    }

    /// Remove a module by name.
    pub async fn remove(&self, name: &str) -> Result<ModuleDescriptor, RegistryError> {
        let mut guard = self.snapshot.write().await;
        let mut entries: Vec<_> = guard.iter().cloned().collect();
        let idx = entries
            .iter()
            .position(|m| m.descriptor.name == name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        let removed = entries.remove(idx);
        *guard = Arc::new(entries);
        Ok(removed.descriptor.clone())
    }

    /// Every descriptor in dispatch order, enabled or not.
    pub async fn list(&self) -> Vec<ModuleDescriptor> {
        let snapshot = Arc::clone(&*self.snapshot.read().await);
        snapshot.iter().map(|m| m.descriptor.clone()).collect()
    }

    /// Descriptor registered under `name`, enabled or not.
    pub async fn get(&self, name: &str) -> Option<ModuleDescriptor> {
        self.snapshot
            .read()
            .await
            .iter()
            .find(|m| m.descriptor.name == name)
            .map(|m| m.descriptor.clone())
    }

    pub async fn len(&self) -> usize {
        self.snapshot.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshot.read().await.is_empty()
    }

    /// Enabled modules accepting `content_type` whose condition is found in `body`,
    /// ordered by `(priority, registration order)`.
    pub async fn find_candidates(&self, body: &str, content_type: &str) -> Vec<ModuleDescriptor> {
        let snapshot = Arc::clone(&*self.snapshot.read().await);
        snapshot
            .iter()
            .filter(|m| m.descriptor.enabled)
            .filter(|m| m.descriptor.accepts(content_type))
            .filter(|m| m.regex.is_match(body))
            .map(|m| m.descriptor.clone())
            .collect()
    }
}

fn sort_entries(entries: &mut [Arc<RegisteredModule>]) {
    entries.sort_by_key(|m| (m.descriptor.priority, m.seq));
}
