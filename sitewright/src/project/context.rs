//! The shared project context.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::chain::{OutputChain, Part};
use crate::contracts::{MemoryMetadataCache, MetadataCache};
use crate::errors::{BuildError, StaleError};
use crate::event::{EventParser, EventSink};

/// State every compiled stage can reach through its setup: project
/// properties, the registered event parser, the metadata cache, the part
/// and output tables, and the template compile cache.
///
/// One context backs one [`Site`](super::Site) and is shared as a plain
/// `Arc`; interior mutability covers the rare writes (registration at
/// compile time, property updates between passes).
pub struct ProjectContext {
    properties: RwLock<HashMap<String, String>>,
    parser: RwLock<Option<Arc<dyn EventParser>>>,
    metadata: RwLock<Arc<dyn MetadataCache>>,
    parts: RwLock<HashMap<String, Part>>,
    outputs: RwLock<HashMap<String, OutputChain>>,
    compiled: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ProjectContext {
    /// Creates a context with an in-memory metadata cache and no parser.
    #[must_use]
    pub fn new() -> Self {
        Self {
            properties: RwLock::new(HashMap::new()),
            parser: RwLock::new(None),
            metadata: RwLock::new(Arc::new(MemoryMetadataCache::new())),
            parts: RwLock::new(HashMap::new()),
            outputs: RwLock::new(HashMap::new()),
            compiled: DashMap::new(),
        }
    }

    /// Sets a project property, replacing any previous value.
    pub fn set_property(&self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.write().insert(name.into(), value.into());
    }

    /// Looks a project property up.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<String> {
        self.properties.read().get(name).cloned()
    }

    /// Registers the event parser `read` and `parse` stages go through.
    pub fn set_parser(&self, parser: Arc<dyn EventParser>) {
        *self.parser.write() = Some(parser);
    }

    /// The registered event parser, if any.
    #[must_use]
    pub fn parser(&self) -> Option<Arc<dyn EventParser>> {
        self.parser.read().clone()
    }

    /// Replaces the metadata cache backing.
    pub fn set_metadata(&self, cache: Arc<dyn MetadataCache>) {
        *self.metadata.write() = cache;
    }

    /// The cache stages record their source dependencies in.
    #[must_use]
    pub fn metadata(&self) -> Arc<dyn MetadataCache> {
        Arc::clone(&self.metadata.read())
    }

    pub(crate) fn register_part(&self, part: Part) {
        self.parts.write().insert(part.name().to_string(), part);
    }

    pub(crate) fn register_output(&self, output: OutputChain) {
        let name = output.name().to_string();
        self.outputs.write().insert(name, output);
    }

    /// Looks a declared part up by name.
    #[must_use]
    pub fn part(&self, name: &str) -> Option<Part> {
        self.parts.read().get(name).cloned()
    }

    /// Looks a declared output up by name.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<OutputChain> {
        self.outputs.read().get(name).cloned()
    }

    /// Drives the named part's producer into `sink`.
    ///
    /// Resolution is lazy: a part's chain runs only when a `part:`
    /// reference is actually delivered.
    ///
    /// # Errors
    ///
    /// [`BuildError::UnknownPart`] for an undeclared name, otherwise
    /// whatever the part's chain reports.
    pub fn deliver_part(&self, name: &str, sink: &mut dyn EventSink) -> Result<(), BuildError> {
        // Clone out of the table so the chain never drives under the lock.
        let part = self.part(name).ok_or_else(|| BuildError::UnknownPart {
            name: name.to_string(),
        })?;
        part.deliver(sink)
    }

    /// Whether the named part's inputs changed after `since`.
    ///
    /// # Errors
    ///
    /// Fails for an undeclared name or a failing staleness evaluation.
    pub fn part_updated_since(
        &self,
        name: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StaleError> {
        let part = self
            .part(name)
            .ok_or_else(|| StaleError::new(format!("unknown part '{name}'")))?;
        part.has_been_updated(since)
    }

    /// Fetches or builds a compiled object cached under `key`.
    ///
    /// Template-style stages park their expensive compiled forms here so a
    /// form is built once per process, not once per artifact. The entry
    /// lives as long as the context.
    pub fn compiled<T, F>(&self, key: &str, build: F) -> Arc<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Arc<T>,
    {
        if let Some(hit) = self.compiled.get(key) {
            if let Ok(typed) = Arc::clone(hit.value()).downcast::<T>() {
                return typed;
            }
        }
        let built = build();
        self.compiled
            .insert(key.to_string(), Arc::clone(&built) as Arc<dyn Any + Send + Sync>);
        built
    }

    /// Drops the part and output tables, which hold the stage handles that
    /// in turn hold this context.
    pub(crate) fn clear_tables(&self) {
        self.parts.write().clear();
        self.outputs.write().clear();
    }
}

impl Default for ProjectContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProjectContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectContext")
            .field("properties", &self.properties.read().len())
            .field("parts", &self.parts.read().len())
            .field("outputs", &self.outputs.read().len())
            .field("has_parser", &self.parser.read().is_some())
            .finish_non_exhaustive()
    }
}
