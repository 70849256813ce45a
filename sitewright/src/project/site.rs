//! The compiled site and its build pass driver.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::build::{ArtifactBuilder, BuildReport};
use crate::chain::{ChainCompiler, OutputChain, Part, StageRegistry};
use crate::contracts::{
    ArtifactSource, MetadataCache, Source, SourceTree, Storage, StorageSession,
};
use crate::errors::{BuildPassError, ConfigError};
use crate::event::EventParser;
use crate::manifest::{FileDecl, Manifest, ManifestEntry, UrlPattern};
use crate::project::ProjectContext;
use crate::stage::StreamKind;

/// Everything a site needs besides its manifest.
pub struct SiteEnv {
    storage: Arc<dyn Storage>,
    location: String,
    password: Option<String>,
    source_tree: Arc<dyn SourceTree>,
    registry: StageRegistry,
    parser: Option<Arc<dyn EventParser>>,
    metadata: Option<Arc<dyn MetadataCache>>,
}

impl SiteEnv {
    /// Creates an environment over a storage backend and a source tree,
    /// with the built-in stage registry.
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        location: impl Into<String>,
        source_tree: Arc<dyn SourceTree>,
    ) -> Self {
        Self {
            storage,
            location: location.into(),
            password: None,
            source_tree,
            registry: StageRegistry::with_defaults(),
            parser: None,
            metadata: None,
        }
    }

    /// Sets the storage password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Replaces the stage registry.
    #[must_use]
    pub fn with_registry(mut self, registry: StageRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Registers the project's source document parser.
    #[must_use]
    pub fn with_parser(mut self, parser: Arc<dyn EventParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Replaces the default in-memory metadata cache.
    #[must_use]
    pub fn with_metadata(mut self, cache: Arc<dyn MetadataCache>) -> Self {
        self.metadata = Some(cache);
        self
    }
}

impl std::fmt::Debug for SiteEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteEnv")
            .field("location", &self.location)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

/// One compiled manifest entry. Property declarations apply to the
/// context at compile time and leave no entry behind.
enum SiteEntry {
    Artifact(ArtifactBuilder),
    Part(Part),
    Output(OutputChain),
    Delete(String),
}

impl SiteEntry {
    fn notify_pass_start(&self) {
        match self {
            Self::Artifact(builder) => builder.chain().notify_pass_start(),
            Self::Part(part) => part.chain().notify_pass_start(),
            Self::Output(output) => output.chain().notify_pass_start(),
            Self::Delete(_) => {}
        }
    }

    fn notify_pass_end(&self) {
        match self {
            Self::Artifact(builder) => builder.chain().notify_pass_end(),
            Self::Part(part) => part.chain().notify_pass_end(),
            Self::Output(output) => output.chain().notify_pass_end(),
            Self::Delete(_) => {}
        }
    }
}

/// Counts aggregated over one build pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassSummary {
    /// The pass identity, for correlating logs.
    pub pass: Uuid,
    /// Targets rebuilt and committed.
    pub built: usize,
    /// Targets already up to date.
    pub skipped: usize,
    /// Targets whose build failed.
    pub failed: usize,
    /// Delete entries executed.
    pub deleted: usize,
}

impl PassSummary {
    /// Whether no artifact failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    fn absorb(&mut self, report: BuildReport) {
        self.built += report.built;
        self.skipped += report.skipped;
        self.failed += report.failed;
    }
}

/// A compiled manifest, ready to run build passes.
///
/// Compilation wires every entry's chain up front, so a running pass only
/// decides staleness and drives writes. The storage connection opens lazily
/// on the first pass and stays open until [`close`](Self::close).
pub struct Site {
    context: Arc<ProjectContext>,
    storage: Arc<dyn Storage>,
    location: String,
    password: Option<String>,
    session: RwLock<Option<Arc<StorageSession>>>,
    entries: Vec<SiteEntry>,
}

impl Site {
    /// Compiles a manifest into buildable entries.
    ///
    /// Entries compile in declaration order: properties apply to the
    /// entries after them, and an output must be declared before the
    /// artifacts routed through it.
    ///
    /// # Errors
    ///
    /// Returns the first wiring failure; a site compiles whole or not at
    /// all.
    pub fn compile(manifest: &Manifest, env: SiteEnv) -> Result<Self, ConfigError> {
        let context = Arc::new(ProjectContext::new());
        if let Some(parser) = env.parser {
            context.set_parser(parser);
        }
        if let Some(metadata) = env.metadata {
            context.set_metadata(metadata);
        }
        let compiler = ChainCompiler::new(&env.registry, &context);

        let mut entries = Vec::with_capacity(manifest.entries.len());
        let mut artifact_targets: HashSet<String> = HashSet::new();
        for entry in &manifest.entries {
            match entry {
                ManifestEntry::Property(decl) => {
                    debug!(property = %decl.name, "property set");
                    context.set_property(&decl.name, &decl.value);
                }
                ManifestEntry::Output(decl) => {
                    if context.output(&decl.name).is_some() {
                        return Err(ConfigError::DuplicateName {
                            kind: "output",
                            name: decl.name.clone(),
                        });
                    }
                    let source = entry_source(&decl.name, None, &env.source_tree, &context);
                    let output = compiler.compile_output(&decl.name, &decl.stages, &source)?;
                    context.register_output(output.clone());
                    entries.push(SiteEntry::Output(output));
                }
                ManifestEntry::Part(decl) => {
                    if context.part(&decl.name).is_some() {
                        return Err(ConfigError::DuplicateName {
                            kind: "part",
                            name: decl.name.clone(),
                        });
                    }
                    let pattern = decl
                        .source
                        .as_deref()
                        .map(UrlPattern::source)
                        .transpose()?;
                    if let Some(pattern) = &pattern {
                        if pattern.is_wildcard() {
                            return Err(ConfigError::BadPattern {
                                pattern: pattern.as_str().to_string(),
                                message: "part sources cannot expand wildcards".to_string(),
                            });
                        }
                    }
                    let source = entry_source(&decl.name, pattern, &env.source_tree, &context);
                    let part = compiler.compile_part(&decl.name, &decl.stages, &source)?;
                    context.register_part(part.clone());
                    entries.push(SiteEntry::Part(part));
                }
                ManifestEntry::File(decl) => {
                    if !artifact_targets.insert(decl.target.clone()) {
                        return Err(ConfigError::DuplicateName {
                            kind: "artifact",
                            name: decl.target.clone(),
                        });
                    }
                    let builder = compile_file(&compiler, decl, &env.source_tree, &context)?;
                    entries.push(SiteEntry::Artifact(builder));
                }
                ManifestEntry::Delete(decl) => {
                    let pattern = UrlPattern::target(&decl.target)?;
                    if pattern.is_wildcard() {
                        return Err(ConfigError::BadPattern {
                            pattern: decl.target.clone(),
                            message: "delete targets must be concrete".to_string(),
                        });
                    }
                    entries.push(SiteEntry::Delete(decl.target.clone()));
                }
            }
        }

        debug!(entries = entries.len(), location = %env.location, "site compiled");
        Ok(Self {
            context,
            storage: env.storage,
            location: env.location,
            password: env.password,
            session: RwLock::new(None),
            entries,
        })
    }

    /// The shared project context.
    #[must_use]
    pub fn context(&self) -> &Arc<ProjectContext> {
        &self.context
    }

    /// Finds the artifact whose target pattern covers `url`.
    #[must_use]
    pub fn artifact(&self, url: &str) -> Option<&ArtifactBuilder> {
        self.entries.iter().find_map(|entry| match entry {
            SiteEntry::Artifact(builder) if builder.target().matches_url(url).is_some() => {
                Some(builder)
            }
            _ => None,
        })
    }

    /// Looks a part up by name. Part chains run only when delivered.
    #[must_use]
    pub fn part(&self, name: &str) -> Option<Part> {
        self.context.part(name)
    }

    /// Looks a named output up.
    #[must_use]
    pub fn output(&self, name: &str) -> Option<OutputChain> {
        self.context.output(name)
    }

    /// Looks a project property up.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<String> {
        self.context.property(name)
    }

    /// Runs one build pass; `force` rebuilds regardless of staleness.
    ///
    /// Returns whether every entry succeeded. Artifact failures are logged
    /// and reflected in the flag; the pass always runs to the end.
    ///
    /// # Errors
    ///
    /// Only pass-fatal conditions: the storage backend cannot be opened or
    /// authenticated.
    pub fn run_build_pass(&self, force: bool) -> Result<bool, BuildPassError> {
        self.build_pass(force).map(|summary| summary.is_success())
    }

    /// Runs one build pass and returns its summary.
    ///
    /// # Errors
    ///
    /// As [`run_build_pass`](Self::run_build_pass).
    pub fn build_pass(&self, force: bool) -> Result<PassSummary, BuildPassError> {
        let session = self.session()?;
        let pass = Uuid::new_v4();
        let span = info_span!("build_pass", %pass, force);
        let _guard = span.enter();
        info!(entries = self.entries.len(), "build pass started");

        for entry in &self.entries {
            entry.notify_pass_start();
        }

        let mut summary = PassSummary {
            pass,
            ..PassSummary::default()
        };
        for entry in &self.entries {
            match entry {
                SiteEntry::Artifact(builder) => {
                    let report = builder.build(&session, force);
                    summary.absorb(report);
                }
                SiteEntry::Delete(target) => {
                    // Deletes report success regardless of the outcome and
                    // independent of whether the target ever existed.
                    if let Err(err) = session.delete(target) {
                        warn!(%target, error = %err, "delete failed");
                    }
                    summary.deleted += 1;
                }
                SiteEntry::Part(_) | SiteEntry::Output(_) => {}
            }
        }

        for entry in &self.entries {
            entry.notify_pass_end();
        }

        info!(
            built = summary.built,
            skipped = summary.skipped,
            failed = summary.failed,
            deleted = summary.deleted,
            success = summary.is_success(),
            "build pass finished"
        );
        Ok(summary)
    }

    fn session(&self) -> Result<Arc<StorageSession>, BuildPassError> {
        if let Some(session) = self.session.read().as_ref() {
            return Ok(Arc::clone(session));
        }
        let mut slot = self.session.write();
        if let Some(session) = slot.as_ref() {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(StorageSession::open(
            Arc::clone(&self.storage),
            self.location.clone(),
            self.password.clone(),
        )?);
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Closes the storage connection and drops the part and output tables.
    ///
    /// Tearing the tables down breaks the reference cycle between stages
    /// and the context; the site is not usable afterwards.
    pub fn close(&self) {
        if let Some(session) = self.session.write().take() {
            session.close();
        }
        self.context.clear_tables();
    }
}

impl std::fmt::Debug for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Site")
            .field("location", &self.location)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

fn entry_source(
    entry: &str,
    declared: Option<UrlPattern>,
    tree: &Arc<dyn SourceTree>,
    context: &Arc<ProjectContext>,
) -> Arc<dyn Source> {
    Arc::new(ArtifactSource::new(
        entry,
        declared,
        Arc::clone(tree),
        Arc::clone(context),
    ))
}

fn compile_file(
    compiler: &ChainCompiler<'_>,
    decl: &FileDecl,
    tree: &Arc<dyn SourceTree>,
    context: &Arc<ProjectContext>,
) -> Result<ArtifactBuilder, ConfigError> {
    let target = UrlPattern::target(&decl.target)?;
    let source_pattern = decl.source.as_deref().map(UrlPattern::source).transpose()?;
    if target.is_wildcard()
        && !source_pattern
            .as_ref()
            .is_some_and(UrlPattern::is_wildcard)
    {
        return Err(ConfigError::BadPattern {
            pattern: decl.target.clone(),
            message: "a wildcard target needs a wildcard source to expand it".to_string(),
        });
    }

    let artifact_source = Arc::new(ArtifactSource::new(
        decl.target.clone(),
        source_pattern.clone(),
        Arc::clone(tree),
        Arc::clone(context),
    ));
    let dyn_source: Arc<dyn Source> = artifact_source.clone();
    let chain = compiler.compile("artifact", &decl.target, &decl.stages, &dyn_source)?;

    let output = match (chain.output_kind(), decl.output.as_deref()) {
        (StreamKind::Bytes, None) => None,
        (StreamKind::Bytes, Some(_)) => {
            return Err(ConfigError::RootHasOutput {
                artifact: decl.target.clone(),
            })
        }
        (StreamKind::Events, None) => {
            return Err(ConfigError::RootNeedsOutput {
                artifact: decl.target.clone(),
            })
        }
        (StreamKind::Events, Some(name)) => Some(context.output(name).ok_or_else(|| {
            ConfigError::UnknownOutput {
                artifact: decl.target.clone(),
                output: name.to_string(),
            }
        })?),
    };

    Ok(ArtifactBuilder::new(
        target,
        source_pattern,
        chain,
        output,
        artifact_source,
        Arc::clone(context),
    ))
}
