//! Artifact building: staleness decisions, wildcard expansion, and the
//! transactional rebuild loop with its rename retry.

mod session;

pub use session::DetachedScope;

use std::fs;
use std::sync::Arc;

use tracing::{debug, error, info, info_span};

use crate::chain::{Chain, OutputChain};
use crate::contracts::{ArtifactSource, FileStamp, Source, StorageSession};
use crate::errors::{BuildError, ErrorClass};
use crate::manifest::UrlPattern;
use crate::project::ProjectContext;

use session::{sibling_url, WriteSession};

/// Per-entry build counts, absorbed into the pass summary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuildReport {
    /// Targets rebuilt and committed.
    pub built: usize,
    /// Targets already up to date.
    pub skipped: usize,
    /// Targets whose build failed.
    pub failed: usize,
}

impl BuildReport {
    /// Whether every expanded target settled without failure.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    fn built_one() -> Self {
        Self {
            built: 1,
            ..Self::default()
        }
    }

    fn skipped_one() -> Self {
        Self {
            skipped: 1,
            ..Self::default()
        }
    }

    fn failed_one() -> Self {
        Self {
            failed: 1,
            ..Self::default()
        }
    }

    fn absorb(&mut self, other: Self) {
        self.built += other.built;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

/// One compiled `file` entry: a target pattern, its chain, and the source
/// view the chain reads through.
///
/// Building decides staleness per concrete target, expands wildcards
/// against the source directory, and drives the chain into a transactional
/// write with the rename retry on top.
pub struct ArtifactBuilder {
    target: UrlPattern,
    source_pattern: Option<UrlPattern>,
    chain: Chain,
    output: Option<OutputChain>,
    source: Arc<ArtifactSource>,
    context: Arc<ProjectContext>,
}

impl ArtifactBuilder {
    pub(crate) fn new(
        target: UrlPattern,
        source_pattern: Option<UrlPattern>,
        chain: Chain,
        output: Option<OutputChain>,
        source: Arc<ArtifactSource>,
        context: Arc<ProjectContext>,
    ) -> Self {
        Self {
            target,
            source_pattern,
            chain,
            output,
            source,
            context,
        }
    }

    /// The declared target pattern.
    #[must_use]
    pub fn target(&self) -> &UrlPattern {
        &self.target
    }

    /// The compiled chain.
    #[must_use]
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Whether the entry expands against a source directory listing.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.source_pattern
            .as_ref()
            .is_some_and(UrlPattern::is_wildcard)
    }

    /// Builds every concrete target of this entry.
    ///
    /// Failures are logged and counted, never raised; the pass carries on
    /// with the next target.
    pub fn build(&self, session: &Arc<StorageSession>, force: bool) -> BuildReport {
        if self.is_wildcard() {
            self.build_wildcard(session, force)
        } else {
            let target = self.target.as_str().to_string();
            self.build_target(session, force, &target)
        }
    }

    fn build_wildcard(&self, session: &Arc<StorageSession>, force: bool) -> BuildReport {
        let mut report = BuildReport::default();
        let matches = match self.expand_wildcard() {
            Ok(matches) => matches,
            Err(err) => {
                report_failure(self.target.as_str(), &err);
                return BuildReport::failed_one();
            }
        };
        if matches.is_empty() {
            debug!(entry = %self.target, "wildcard matched no source files");
        }
        for (source_url, fragment) in matches {
            let target = self.target.instantiate(&fragment);
            self.source.set_current(Some(source_url.clone()));
            debug!(source = %source_url, %target, "wildcard match");
            report.absorb(self.build_target(session, force, &target));
        }
        self.source.set_current(None);
        report
    }

    /// Lists the source directory and matches file names against the mask.
    ///
    /// A missing or unreadable directory is a hard failure, not an empty
    /// expansion; matching nothing is a successful no-op.
    fn expand_wildcard(&self) -> Result<Vec<(String, String)>, BuildError> {
        let Some(pattern) = self.source_pattern.as_ref().filter(|p| p.is_wildcard()) else {
            return Ok(Vec::new());
        };
        let Some(mask) = pattern.mask() else {
            return Ok(Vec::new());
        };
        let dir_url = pattern.directory();
        let dir = self
            .source
            .resolve_local_file(dir_url)
            .ok_or_else(|| BuildError::WildcardUnresolvable {
                url: dir_url.to_string(),
            })?;
        let entries = fs::read_dir(&dir).map_err(|source| BuildError::WildcardDirMissing {
            url: dir_url.to_string(),
            source,
        })?;
        let mut matches = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| BuildError::WildcardDirMissing {
                url: dir_url.to_string(),
                source,
            })?;
            if !entry.file_type().is_ok_and(|kind| kind.is_file()) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(fragment) = mask.matches(name) {
                matches.push((pattern.join_file(name), fragment));
            }
        }
        // Directory listing order is platform-dependent.
        matches.sort();
        Ok(matches)
    }

    fn build_target(&self, session: &Arc<StorageSession>, force: bool, target: &str) -> BuildReport {
        let span = info_span!("artifact", %target);
        let _guard = span.enter();
        match self.build_one(session, force, target) {
            Ok(true) => BuildReport::built_one(),
            Ok(false) => BuildReport::skipped_one(),
            Err(err) => {
                report_failure(target, &err);
                BuildReport::failed_one()
            }
        }
    }

    fn build_one(
        &self,
        session: &Arc<StorageSession>,
        force: bool,
        target: &str,
    ) -> Result<bool, BuildError> {
        let stamp = session.last_modified(target)?;
        if !force && !self.needs_rebuild(&stamp)? {
            debug!(%target, "target up to date");
            return Ok(false);
        }
        self.rebuild(session, target)?;
        Ok(true)
    }

    fn needs_rebuild(&self, stamp: &FileStamp) -> Result<bool, BuildError> {
        match stamp {
            FileStamp::Absent | FileStamp::Unknown => Ok(true),
            FileStamp::Modified(when) => {
                if self.chain.has_been_updated(*when)? {
                    return Ok(true);
                }
                match &self.output {
                    Some(output) => Ok(output.has_been_updated(*when)?),
                    None => Ok(false),
                }
            }
        }
    }

    /// Runs write attempts until one settles.
    ///
    /// A failed attempt whose chain requested a rename retries under the
    /// composed sibling name; two consecutive failures of the same class
    /// end the loop.
    fn rebuild(&self, session: &Arc<StorageSession>, target: &str) -> Result<(), BuildError> {
        let mut target = target.to_string();
        let mut last_class: Option<ErrorClass> = None;
        loop {
            let ws = WriteSession::open(
                Arc::clone(session),
                Arc::clone(&self.context),
                target.clone(),
                self.is_wildcard(),
            )?;
            match self.drive(&ws) {
                Ok(()) => {
                    let final_target = ws.target_url();
                    ws.commit_primary()?;
                    ws.join_workers()?;
                    ws.replay_spools()?;
                    info!(target = %final_target, "target built");
                    return Ok(());
                }
                Err(err) => {
                    let rename = ws.take_rename_request();
                    ws.discard();
                    let class = err.class();
                    match rename {
                        None => return Err(err),
                        Some(_) if last_class == Some(class) => {
                            return Err(BuildError::RenameLoop { target, class });
                        }
                        Some(name) => {
                            let next = sibling_url(&target, &name, false);
                            debug!(from = %target, to = %next, error = %err, "retrying under a new name");
                            last_class = Some(class);
                            target = next;
                        }
                    }
                }
            }
        }
    }

    fn drive(&self, ws: &WriteSession) -> Result<(), BuildError> {
        let mut out = ws.primary();
        match &self.output {
            None => self.chain.drive_bytes(ws, &mut out),
            Some(output) => {
                let mut sink = output.event_sink_into(ws, &mut out)?;
                self.chain.drive_events(ws, &mut *sink)
            }
        }
    }
}

impl std::fmt::Debug for ArtifactBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactBuilder")
            .field("target", &self.target.as_str())
            .field(
                "source",
                &self.source_pattern.as_ref().map(UrlPattern::as_str),
            )
            .field("stages", &self.chain.len())
            .finish_non_exhaustive()
    }
}

fn report_failure(target: &str, err: &BuildError) {
    match err.location() {
        Some(location) => error!(%target, error = %err, %location, "build failed"),
        None => error!(%target, error = %err, "build failed"),
    }
}
