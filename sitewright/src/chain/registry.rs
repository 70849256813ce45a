//! The stage factory registry.

use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::ConfigError;
use crate::manifest::StageCategory;
use crate::stage::builtin::{
    FormatStage, IdentityTransform, ParseStage, ReadStage, SourceStage, SplitProcess,
};
use crate::stage::{StageHandle, StageSetup};

/// Builds one stage from its compiled setup.
pub type StageFactory = Arc<dyn Fn(StageSetup) -> Result<StageHandle, ConfigError> + Send + Sync>;

type StageKey = (StageCategory, Option<String>);

/// Maps `(category, type)` declarations to stage factories.
///
/// A `None` type is the category's default. Registering a key again
/// replaces the factory, so hosts may override built-ins.
#[derive(Clone)]
pub struct StageRegistry {
    factories: HashMap<StageKey, StageFactory>,
}

impl StageRegistry {
    /// Starts an empty registry.
    #[must_use]
    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder {
            factories: HashMap::new(),
        }
    }

    /// A registry holding the built-in stage set.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::builder_with_defaults().build()
    }

    /// A builder pre-loaded with the built-in set, for hosts that register
    /// their own stages on top.
    #[must_use]
    pub fn builder_with_defaults() -> StageRegistryBuilder {
        Self::builder()
            .register(StageCategory::Source, None, SourceStage::from_setup)
            .register(StageCategory::Read, None, ReadStage::from_setup)
            .register(StageCategory::Parse, None, ParseStage::from_setup)
            .register(StageCategory::Format, None, FormatStage::xml_from_setup)
            .register(StageCategory::Format, Some("xml"), FormatStage::xml_from_setup)
            .register(StageCategory::Format, Some("text"), FormatStage::text_from_setup)
            .register(StageCategory::Transform, None, IdentityTransform::from_setup)
            .register(
                StageCategory::Transform,
                Some("identity"),
                IdentityTransform::from_setup,
            )
            .register(StageCategory::Process, Some("split"), SplitProcess::from_setup)
    }

    /// Looks a factory up.
    #[must_use]
    pub fn lookup(
        &self,
        category: StageCategory,
        type_name: Option<&str>,
    ) -> Option<&StageFactory> {
        self.factories
            .get(&(category, type_name.map(str::to_string)))
    }

    /// Registered `(category, type)` keys, for diagnostics.
    #[must_use]
    pub fn registered(&self) -> Vec<(StageCategory, Option<String>)> {
        let mut keys: Vec<StageKey> = self.factories.keys().cloned().collect();
        keys.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()).then(a.1.cmp(&b.1)));
        keys
    }

    /// Builds a stage from its setup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownStage`] for an unregistered key, or
    /// whatever the factory reported.
    pub fn build_stage(&self, setup: StageSetup) -> Result<StageHandle, ConfigError> {
        let factory = self
            .lookup(setup.category, setup.type_name.as_deref())
            .cloned()
            .ok_or_else(|| ConfigError::UnknownStage {
                category: setup.category,
                type_name: setup
                    .type_name
                    .clone()
                    .unwrap_or_else(|| "(default)".to_string()),
            })?;
        factory(setup)
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("registered", &self.registered())
            .finish()
    }
}

/// Accumulates factory registrations.
pub struct StageRegistryBuilder {
    factories: HashMap<StageKey, StageFactory>,
}

impl StageRegistryBuilder {
    /// Registers a factory for a `(category, type)` key.
    #[must_use]
    pub fn register<F>(
        mut self,
        category: StageCategory,
        type_name: Option<&str>,
        factory: F,
    ) -> Self
    where
        F: Fn(StageSetup) -> Result<StageHandle, ConfigError> + Send + Sync + 'static,
    {
        self.factories
            .insert((category, type_name.map(str::to_string)), Arc::new(factory));
        self
    }

    /// Finalizes the registry.
    #[must_use]
    pub fn build(self) -> StageRegistry {
        StageRegistry {
            factories: self.factories,
        }
    }
}
