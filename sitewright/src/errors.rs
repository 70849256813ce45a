//! Error types for the sitewright build engine.
//!
//! The taxonomy separates fatal configuration problems (caught while the
//! manifest is compiled, before any build pass) from per-artifact build
//! failures (reported, counted, and survived by the pass).

use std::fmt;
use thiserror::Error;

use crate::manifest::StageCategory;
use crate::stage::StreamKind;

/// A parse position carried by build failures that originate in a source
/// document, used when reporting the failing artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// Source file or URL, when known.
    pub file: Option<String>,
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number.
    pub column: u32,
}

impl SourceLocation {
    /// Creates a location without a file name.
    #[must_use]
    pub fn new(line: u32, column: u32) -> Self {
        Self {
            file: None,
            line,
            column,
        }
    }

    /// Sets the originating file or URL.
    #[must_use]
    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}:{}:{}", file, self.line, self.column),
            None => write!(f, "line {}, column {}", self.line, self.column),
        }
    }
}

/// Fatal manifest-wiring errors, raised while compiling the manifest and
/// never at build time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No factory is registered for a (category, type) pair.
    #[error("no stage registered for {category} type '{type_name}'")]
    UnknownStage {
        /// The declared stage category.
        category: StageCategory,
        /// The declared type, or `(default)`.
        type_name: String,
    },

    /// Adjacent stages disagree about the stream kind flowing between them.
    #[error("stage '{stage}' consumes {expected} but its upstream '{upstream}' produces {found}")]
    KindMismatch {
        /// The consuming stage's display name.
        stage: String,
        /// The upstream producer's display name.
        upstream: String,
        /// What the consumer expects.
        expected: StreamKind,
        /// What the producer emits.
        found: StreamKind,
    },

    /// A consuming stage sits at the source end of a chain.
    #[error("stage '{stage}' consumes {expected} but has no upstream producer")]
    MissingUpstream {
        /// The consuming stage's display name.
        stage: String,
        /// The kind it expects.
        expected: StreamKind,
    },

    /// A producing stage that takes no input was given an upstream.
    #[error("stage '{stage}' does not consume a stream but was declared downstream of '{upstream}'")]
    UnexpectedUpstream {
        /// The offending stage's display name.
        stage: String,
        /// The upstream it would shadow.
        upstream: String,
    },

    /// A stage declaration nests more than one child stage.
    #[error("stage '{stage}' declares more than one nested stage")]
    MultipleChildren {
        /// The offending stage's display name.
        stage: String,
    },

    /// A stage initializer failed during manifest compilation.
    #[error("stage '{stage}' failed to initialize: {message}")]
    InitFailed {
        /// The stage's display name.
        stage: String,
        /// The underlying failure.
        message: String,
    },

    /// A required stage parameter is missing.
    #[error("stage '{stage}' requires parameter '{param}'")]
    MissingParam {
        /// The stage's display name.
        stage: String,
        /// The missing parameter name.
        param: String,
    },

    /// A parameter interpolation referenced an undeclared project property.
    #[error("parameter '{param}' of stage '{stage}' references unknown property '{property}'")]
    UnknownProperty {
        /// The stage's display name.
        stage: String,
        /// The parameter holding the reference.
        param: String,
        /// The property name that failed to resolve.
        property: String,
    },

    /// A target or source URL pattern is malformed.
    #[error("bad URL pattern '{pattern}': {message}")]
    BadPattern {
        /// The pattern as declared.
        pattern: String,
        /// What is wrong with it.
        message: String,
    },

    /// Two entries of the same kind share a name.
    #[error("duplicate {kind} '{name}' in manifest")]
    DuplicateName {
        /// Entry kind (part, output, artifact).
        kind: &'static str,
        /// The duplicated name.
        name: String,
    },

    /// An artifact references a named output that is not declared.
    #[error("artifact '{artifact}' references unknown output '{output}'")]
    UnknownOutput {
        /// The artifact's target pattern.
        artifact: String,
        /// The missing output name.
        output: String,
    },

    /// An event-producing artifact root has no serializer to route through.
    #[error("artifact '{artifact}' has an event-producing root but no named output to serialize it")]
    RootNeedsOutput {
        /// The artifact's target pattern.
        artifact: String,
    },

    /// A byte-producing artifact root was also routed through an output.
    #[error("artifact '{artifact}' has a byte-producing root and must not name an output")]
    RootHasOutput {
        /// The artifact's target pattern.
        artifact: String,
    },

    /// A part's chain does not produce events.
    #[error("part '{name}' must produce an event stream")]
    PartNotEvents {
        /// The part name.
        name: String,
    },

    /// An output tail contains a stage shape it cannot drive.
    #[error("stage '{stage}' cannot be used in an output tail")]
    InvalidOutputTail {
        /// The offending stage's display name.
        stage: String,
    },

    /// An entry declares no stages where a chain is required.
    #[error("{kind} '{name}' declares no stages")]
    EmptyChain {
        /// Entry kind.
        kind: &'static str,
        /// Entry name or target pattern.
        name: String,
    },

    /// A stage needs the project's event parser but none was registered.
    #[error("stage '{stage}' requires an event parser but none is registered")]
    NoParser {
        /// The stage's display name.
        stage: String,
    },
}

/// Storage backend failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend needs a password and none was supplied.
    #[error("storage '{location}' requires a password")]
    PasswordRequired {
        /// The storage location string.
        location: String,
    },

    /// The backend rejected the supplied credentials.
    #[error("authentication failed for storage '{location}': {message}")]
    AuthenticationFailed {
        /// The storage location string.
        location: String,
        /// Backend-reported reason.
        message: String,
    },

    /// A possibly-recoverable connection failure; retried once after a
    /// reconnect before being promoted to a build failure.
    #[error("transient storage failure: {message}")]
    Transient {
        /// Backend-reported reason.
        message: String,
    },

    /// A permanent backend failure.
    #[error("storage failure: {message}")]
    Backend {
        /// Backend-reported reason.
        message: String,
    },

    /// An I/O failure inside a backend.
    #[error("storage I/O failure: {source}")]
    Io {
        /// The underlying error.
        #[from]
        source: std::io::Error,
    },
}

impl StorageError {
    /// Whether a reconnect-and-retry is worth attempting.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Whether the error is an authentication problem (pass-fatal).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::PasswordRequired { .. } | Self::AuthenticationFailed { .. }
        )
    }
}

/// A staleness check that could not be evaluated.
///
/// Surfaced to the artifact builder, which fails that artifact and lets the
/// pass continue.
#[derive(Debug, Error)]
#[error("staleness check failed: {message}")]
pub struct StaleError {
    /// What went wrong.
    pub message: String,
}

impl StaleError {
    /// Creates a staleness evaluation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for StaleError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<CacheError> for StaleError {
    fn from(err: CacheError) -> Self {
        Self::new(err.to_string())
    }
}

/// Metadata cache failures.
#[derive(Debug, Error)]
pub enum CacheError {
    /// I/O failure in a persistent backing.
    #[error("metadata cache I/O failure: {source}")]
    Io {
        /// The underlying error.
        #[from]
        source: std::io::Error,
    },

    /// A stored payload could not be encoded or decoded.
    #[error("metadata cache payload error: {source}")]
    Payload {
        /// The underlying error.
        #[from]
        source: serde_json::Error,
    },
}

/// Coarse classification of build failures, compared by the rename-retry
/// bail-out guard: the same class twice in direct succession aborts the
/// artifact instead of retrying again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Storage-originated failure.
    Storage,
    /// Staleness evaluation failure.
    Stale,
    /// I/O failure while driving a chain.
    Io,
    /// Parse failure in a source document.
    Parse,
    /// Failure raised by a stage implementation.
    Stage,
    /// Async bridge protocol failure.
    Bridge,
    /// Everything else.
    Other,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Storage => "storage",
            Self::Stale => "stale",
            Self::Io => "io",
            Self::Parse => "parse",
            Self::Stage => "stage",
            Self::Bridge => "bridge",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Any failure while driving a chain for one artifact.
///
/// Caught at the artifact builder boundary: the transactional write is
/// discarded, the artifact is marked failed, and the pass continues.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Storage failure promoted after the reconnect retry.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Staleness evaluation failure.
    #[error(transparent)]
    Stale(#[from] StaleError),

    /// I/O failure while driving the chain.
    #[error("I/O failure: {source}")]
    Io {
        /// The underlying error.
        #[from]
        source: std::io::Error,
    },

    /// Metadata bookkeeping failed while recording a build.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A source document failed to parse.
    #[error("parse failure: {message}")]
    Parse {
        /// What failed to parse.
        message: String,
        /// Position in the source, when the parser reported one.
        location: Option<SourceLocation>,
    },

    /// A stage implementation failed; the cause is opaque to the engine.
    #[error("stage '{stage}' failed: {source}")]
    Stage {
        /// The failing stage's display name.
        stage: String,
        /// The stage-reported cause.
        source: anyhow::Error,
    },

    /// The async bridge protocol broke down.
    #[error("async bridge failure: {message}")]
    Bridge {
        /// What went wrong.
        message: String,
    },

    /// An artifact declares no source but a stage asked for one.
    #[error("artifact '{entry}' declares no source")]
    MissingSource {
        /// The artifact's entry name.
        entry: String,
    },

    /// A `part:` reference names a part the manifest does not declare.
    #[error("unknown part '{name}'")]
    UnknownPart {
        /// The referenced part name.
        name: String,
    },

    /// An async event target referenced an undeclared output.
    #[error("unknown output '{output}'")]
    UnknownOutput {
        /// The referenced output name.
        output: String,
    },

    /// A wildcard source could not be resolved to a listable directory.
    #[error("wildcard source '{url}' does not resolve to a local directory")]
    WildcardUnresolvable {
        /// The directory part of the source pattern.
        url: String,
    },

    /// The wildcard source directory is missing or unreadable.
    #[error("cannot list source directory '{url}': {source}")]
    WildcardDirMissing {
        /// The directory part of the source pattern.
        url: String,
        /// The listing failure.
        source: std::io::Error,
    },

    /// The rename-retry loop raised the same error class twice in a row.
    #[error("giving up on '{target}' after repeated {class} failures")]
    RenameLoop {
        /// The target being retried.
        target: String,
        /// The repeated class.
        class: ErrorClass,
    },

    /// An operation is not available in the current target scope.
    #[error("{operation} is not available here")]
    Unsupported {
        /// The rejected operation.
        operation: &'static str,
    },
}

impl BuildError {
    /// Wraps an opaque stage failure.
    #[must_use]
    pub fn stage(stage: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Stage {
            stage: stage.into(),
            source,
        }
    }

    /// Creates a parse failure without a location.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            location: None,
        }
    }

    /// Creates a parse failure carrying a source location.
    #[must_use]
    pub fn parse_at(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::Parse {
            message: message.into(),
            location: Some(location),
        }
    }

    /// Creates an async bridge failure.
    #[must_use]
    pub fn bridge(message: impl Into<String>) -> Self {
        Self::Bridge {
            message: message.into(),
        }
    }

    /// The source location carried by this failure, if any.
    #[must_use]
    pub fn location(&self) -> Option<&SourceLocation> {
        match self {
            Self::Parse { location, .. } => location.as_ref(),
            _ => None,
        }
    }

    /// The class used by the bail-out guard.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Storage(_) => ErrorClass::Storage,
            Self::Stale(_) => ErrorClass::Stale,
            Self::Io { .. } => ErrorClass::Io,
            Self::Parse { .. } => ErrorClass::Parse,
            Self::Stage { .. } => ErrorClass::Stage,
            Self::Bridge { .. } => ErrorClass::Bridge,
            _ => ErrorClass::Other,
        }
    }
}

/// Pass-fatal conditions; artifact-local failures never surface here.
#[derive(Debug, Error)]
pub enum BuildPassError {
    /// The storage backend is unusable for the whole pass.
    #[error(transparent)]
    Storage(#[from] StorageError),
}
