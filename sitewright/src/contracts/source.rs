//! The source-side contracts: raw source trees and the per-artifact view.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::errors::{BuildError, StaleError};
use crate::event::EventSink;
use crate::manifest::{resolve_relative, UrlPattern};
use crate::project::ProjectContext;

/// URL scheme resolving to a named part's event stream.
pub const PART_SCHEME: &str = "part:";

/// Raw access to the site's source documents.
///
/// URLs handed to a tree are pseudo-absolute within the source root or carry
/// a scheme the tree understands; `part:` URLs never reach it.
pub trait SourceTree: Send + Sync {
    /// Opens a source document for reading.
    ///
    /// # Errors
    ///
    /// Returns the I/O failure, including not-found.
    fn open(&self, url: &str) -> std::io::Result<Box<dyn Read + Send>>;

    /// Maps a URL to a local filesystem path, when one exists.
    ///
    /// Wildcard expansion lists the directory behind the mapped path, so
    /// trees without local backing cannot serve wildcard artifacts.
    fn local_path(&self, url: &str) -> Option<PathBuf>;

    /// Whether the document changed after `since`.
    ///
    /// A document the tree cannot date must report `true`.
    ///
    /// # Errors
    ///
    /// Returns an error when the question cannot be answered at all.
    fn modified_since(&self, url: &str, since: DateTime<Utc>) -> Result<bool, StaleError>;
}

/// What a stage sees of its artifact's source.
///
/// Wraps the raw [`SourceTree`] with the artifact's current source binding,
/// relative URL resolution, and `part:` indirection.
pub trait Source: Send + Sync {
    /// The artifact's current source URL, after wildcard instantiation.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::MissingSource`] for artifacts that declare no
    /// source.
    fn source_url(&self) -> Result<String, BuildError>;

    /// The source pattern the entry declared, when it declared one.
    fn declared_url(&self) -> Option<String>;

    /// Opens a URL as a byte stream.
    ///
    /// # Errors
    ///
    /// Fails for `part:` URLs, which only exist as event streams, and for
    /// I/O failures.
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, BuildError>;

    /// Maps a URL to a local file, when the tree can.
    fn resolve_local_file(&self, url: &str) -> Option<PathBuf>;

    /// Wraps a URL as a deliverable event source.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for trees that must negotiate.
    fn as_event_source(&self, url: &str) -> Result<EventSource, BuildError>;

    /// Parses or resolves a URL and pushes its event stream into `sink`.
    ///
    /// # Errors
    ///
    /// Propagates parse, part resolution, and sink failures.
    fn deliver_events(&self, url: &str, sink: &mut dyn EventSink) -> Result<(), BuildError>;

    /// Resolves a reference against the artifact's current source.
    fn resolve_relative(&self, reference: &str) -> String;

    /// Whether a URL's content changed after `since`.
    ///
    /// `part:` URLs delegate to the part's chain, recursing across chain
    /// boundaries.
    ///
    /// # Errors
    ///
    /// Returns an error when the check cannot be evaluated.
    fn has_been_updated_since(&self, url: &str, since: DateTime<Utc>)
        -> Result<bool, StaleError>;
}

/// A URL bound to the machinery that can deliver it as events.
#[derive(Clone)]
pub struct EventSource {
    url: String,
    tree: Arc<dyn SourceTree>,
    context: Arc<ProjectContext>,
}

impl EventSource {
    /// The wrapped URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Pushes the URL's event stream into `sink`.
    ///
    /// `part:` URLs drive the named part's chain; everything else is read
    /// from the tree and fed through the project's event parser.
    ///
    /// # Errors
    ///
    /// Propagates part resolution, parse, and sink failures.
    pub fn deliver(&self, sink: &mut dyn EventSink) -> Result<(), BuildError> {
        if let Some(part) = self.url.strip_prefix(PART_SCHEME) {
            return self.context.deliver_part(part, sink);
        }
        let parser = self
            .context
            .parser()
            .ok_or_else(|| BuildError::parse(format!("no event parser registered for '{}'", self.url)))?;
        let mut input = self.tree.open(&self.url)?;
        parser.parse(&mut *input, sink)
    }
}

/// The [`Source`] implementation compiled into every artifact chain.
///
/// The current source binding is set by the artifact builder before each
/// concrete build; builds never run concurrently, so a plain lock suffices.
pub struct ArtifactSource {
    entry: String,
    declared: Option<UrlPattern>,
    current: RwLock<Option<String>>,
    tree: Arc<dyn SourceTree>,
    context: Arc<ProjectContext>,
}

impl ArtifactSource {
    /// Creates the source view for one manifest entry.
    #[must_use]
    pub fn new(
        entry: impl Into<String>,
        declared: Option<UrlPattern>,
        tree: Arc<dyn SourceTree>,
        context: Arc<ProjectContext>,
    ) -> Self {
        let current = declared
            .as_ref()
            .filter(|p| !p.is_wildcard())
            .map(|p| p.as_str().to_string());
        Self {
            entry: entry.into(),
            declared,
            current: RwLock::new(current),
            tree,
            context,
        }
    }

    /// The declared source pattern, when the entry has one.
    #[must_use]
    pub fn declared(&self) -> Option<&UrlPattern> {
        self.declared.as_ref()
    }

    /// Binds the concrete source for the next build.
    pub fn set_current(&self, url: Option<String>) {
        *self.current.write() = url;
    }
}

impl Source for ArtifactSource {
    fn source_url(&self) -> Result<String, BuildError> {
        self.current
            .read()
            .clone()
            .ok_or_else(|| BuildError::MissingSource {
                entry: self.entry.clone(),
            })
    }

    fn declared_url(&self) -> Option<String> {
        self.declared.as_ref().map(|p| p.as_str().to_string())
    }

    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>, BuildError> {
        if url.starts_with(PART_SCHEME) {
            return Err(BuildError::Unsupported {
                operation: "reading a part as bytes",
            });
        }
        Ok(self.tree.open(url)?)
    }

    fn resolve_local_file(&self, url: &str) -> Option<PathBuf> {
        if url.starts_with(PART_SCHEME) {
            return None;
        }
        self.tree.local_path(url)
    }

    fn as_event_source(&self, url: &str) -> Result<EventSource, BuildError> {
        Ok(EventSource {
            url: url.to_string(),
            tree: Arc::clone(&self.tree),
            context: Arc::clone(&self.context),
        })
    }

    fn deliver_events(&self, url: &str, sink: &mut dyn EventSink) -> Result<(), BuildError> {
        self.as_event_source(url)?.deliver(sink)
    }

    fn resolve_relative(&self, reference: &str) -> String {
        let current = self.current.read();
        let base = current
            .as_deref()
            .or_else(|| self.declared.as_ref().map(UrlPattern::as_str))
            .unwrap_or("/");
        resolve_relative(base, reference)
    }

    fn has_been_updated_since(
        &self,
        url: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, StaleError> {
        if let Some(part) = url.strip_prefix(PART_SCHEME) {
            return self.context.part_updated_since(part, since);
        }
        self.tree.modified_since(url, since)
    }
}

impl std::fmt::Debug for ArtifactSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactSource")
            .field("entry", &self.entry)
            .field("declared", &self.declared.as_ref().map(UrlPattern::as_str))
            .field("current", &*self.current.read())
            .finish_non_exhaustive()
    }
}
