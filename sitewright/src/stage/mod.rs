//! Stage traits and the handles chains are linked from.
//!
//! A chain segment carries either raw bytes or structured document events;
//! the two stage shapes are separate traits and a [`StageHandle`] is the
//! closed union the compiler links. Kind agreement between adjacent stages
//! is checked once at compile time, so driving needs no downcasts.

pub mod builtin;
mod params;

pub use params::StageParams;

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::contracts::{Source, TargetWrite};
use crate::errors::{BuildError, ConfigError, StaleError};
use crate::event::EventSink;
use crate::manifest::StageCategory;
use crate::project::ProjectContext;

/// The kind of stream flowing between two adjacent stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Raw bytes.
    Bytes,
    /// Structured document events.
    Events,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes => f.write_str("a byte stream"),
            Self::Events => f.write_str("an event stream"),
        }
    }
}

/// What a driving stage may do with the artifact's write targets.
///
/// The primary implementation is the artifact builder's write session;
/// detached scopes (parts, bridge workers) reject the write operations.
pub trait TargetScope: Send + Sync {
    /// The concrete target URL currently being written.
    fn current_target_url(&self) -> String;

    /// Whether the artifact was instantiated from a wildcard pattern.
    fn is_wildcard(&self) -> bool;

    /// Commits the bytes written so far under the current target name and
    /// continues the same stream into a new sibling target.
    ///
    /// With `prepend_current_name` the new name is prefixed by the current
    /// target's stem.
    ///
    /// # Errors
    ///
    /// Returns an error when the running write cannot be committed or the
    /// next one cannot be opened.
    fn rename_and_continue(&self, name: &str, prepend_current_name: bool)
        -> Result<(), BuildError>;

    /// Asks the builder to retry the whole build under a different target
    /// name if the current attempt fails.
    ///
    /// Consumed by the rebuild loop; calling it on a succeeding build has no
    /// effect.
    fn request_rename(&self, name: &str);

    /// Opens a transactional byte write for a secondary target next to the
    /// current one.
    ///
    /// On non-reentrant storage the write lands in a numbered temp spool and
    /// is replayed after the primary commits, so opening never disturbs the
    /// primary write.
    ///
    /// # Errors
    ///
    /// Returns an error when the secondary write cannot be opened.
    fn open_async_target(
        &self,
        name: &str,
        prepend_current_name: bool,
    ) -> Result<Box<dyn TargetWrite>, BuildError>;

    /// Opens a secondary target fed by an event stream serialized through a
    /// named output on a worker thread.
    ///
    /// The returned sink hands each event to the worker at a blocking
    /// rendezvous; [`AsyncEventTarget::finish`] closes the stream and
    /// re-raises any worker failure.
    ///
    /// # Errors
    ///
    /// Returns an error when the output is unknown or the worker cannot be
    /// started.
    fn open_async_event_target(
        &self,
        name: &str,
        prepend_current_name: bool,
        output: &str,
    ) -> Result<Box<dyn AsyncEventTarget>, BuildError>;
}

/// The primary-side handle of an async secondary target.
pub trait AsyncEventTarget: EventSink + Send {
    /// Ends the stream, waits for the worker, and re-raises its failure.
    ///
    /// # Errors
    ///
    /// Returns whatever the worker's chain or write reported.
    fn finish(self: Box<Self>) -> Result<(), BuildError>;
}

/// Behavior shared by both stage shapes.
pub trait StageCore: Send + Sync {
    /// Display name used in diagnostics, usually `entry/category`.
    fn name(&self) -> &str;

    /// Depth from the chain root; the root stage is 0.
    fn position(&self) -> usize;

    /// The stream kind this stage consumes, `None` for pure producers.
    fn input_kind(&self) -> Option<StreamKind>;

    /// One-time setup after the chain is fully linked.
    ///
    /// Runs in declaration order, outermost stage first.
    ///
    /// # Errors
    ///
    /// A failure aborts manifest compilation.
    fn initialize(&self) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Whether this stage's inputs changed after `since`.
    ///
    /// Implementations check their own captured inputs and delegate to their
    /// upstream link, short-circuiting on the first `true`. A stage without
    /// prior build metadata must answer `true`.
    ///
    /// # Errors
    ///
    /// Returns an error when the question cannot be evaluated; the builder
    /// fails the artifact without rebuilding it.
    fn has_been_updated(&self, since: DateTime<Utc>) -> Result<bool, StaleError>;

    /// Hook fired before any artifact builds in a pass.
    fn on_pass_start(&self) {}

    /// Hook fired after all artifact builds in a pass.
    fn on_pass_end(&self) {}
}

/// A stage producing raw bytes.
pub trait ByteStage: StageCore {
    /// Pulls the stage's upstream (if any) and writes the produced bytes
    /// into `out`.
    ///
    /// # Errors
    ///
    /// Propagates upstream, I/O, and stage failures.
    fn drive(&self, scope: &dyn TargetScope, out: &mut dyn Write) -> Result<(), BuildError>;

    /// For event-consuming serializers: builds a sink that serializes a
    /// pushed event stream into `out`.
    ///
    /// Used when the stage runs as an output tail fed by another chain.
    ///
    /// # Errors
    ///
    /// The default rejects the call; only serializers support tails.
    fn serializer_sink<'a>(
        &'a self,
        scope: &'a dyn TargetScope,
        out: &'a mut dyn Write,
    ) -> Result<Box<dyn EventSink + 'a>, BuildError> {
        let _ = (scope, out);
        Err(BuildError::Unsupported {
            operation: "serializing a pushed event stream",
        })
    }
}

/// A stage producing structured document events.
pub trait EventStage: StageCore {
    /// Pulls the stage's upstream (if any) and pushes the produced events
    /// into `sink`.
    ///
    /// # Errors
    ///
    /// Propagates upstream, parse, and sink failures.
    fn drive_events(
        &self,
        scope: &dyn TargetScope,
        sink: &mut dyn EventSink,
    ) -> Result<(), BuildError>;

    /// For event-to-event stages: wraps a downstream sink so the stage's
    /// rewriting applies to a pushed stream.
    ///
    /// Used when the stage runs inside an output tail.
    ///
    /// # Errors
    ///
    /// The default rejects the call.
    fn wrap_sink<'a>(
        &'a self,
        scope: &'a dyn TargetScope,
        downstream: Box<dyn EventSink + 'a>,
    ) -> Result<Box<dyn EventSink + 'a>, BuildError> {
        let _ = (scope, downstream);
        Err(BuildError::Unsupported {
            operation: "wrapping a pushed event stream",
        })
    }
}

/// A linked stage, tagged by the kind of stream it produces.
#[derive(Clone)]
pub enum StageHandle {
    /// A byte producer.
    Bytes(Arc<dyn ByteStage>),
    /// An event producer.
    Events(Arc<dyn EventStage>),
}

impl StageHandle {
    /// The stream kind this stage produces.
    #[must_use]
    pub fn output_kind(&self) -> StreamKind {
        match self {
            Self::Bytes(_) => StreamKind::Bytes,
            Self::Events(_) => StreamKind::Events,
        }
    }

    /// The stage's display name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Bytes(stage) => stage.name(),
            Self::Events(stage) => stage.name(),
        }
    }

    /// The stage's position, 0 at the chain root.
    #[must_use]
    pub fn position(&self) -> usize {
        match self {
            Self::Bytes(stage) => stage.position(),
            Self::Events(stage) => stage.position(),
        }
    }

    /// The stream kind the stage consumes.
    #[must_use]
    pub fn input_kind(&self) -> Option<StreamKind> {
        match self {
            Self::Bytes(stage) => stage.input_kind(),
            Self::Events(stage) => stage.input_kind(),
        }
    }

    /// Runs the stage's one-time setup.
    ///
    /// # Errors
    ///
    /// Propagates the initializer failure.
    pub fn initialize(&self) -> Result<(), ConfigError> {
        match self {
            Self::Bytes(stage) => stage.initialize(),
            Self::Events(stage) => stage.initialize(),
        }
    }

    /// Evaluates the stage's staleness contract.
    ///
    /// # Errors
    ///
    /// Propagates the evaluation failure.
    pub fn has_been_updated(&self, since: DateTime<Utc>) -> Result<bool, StaleError> {
        match self {
            Self::Bytes(stage) => stage.has_been_updated(since),
            Self::Events(stage) => stage.has_been_updated(since),
        }
    }

    /// Fires the pass-start hook.
    pub fn on_pass_start(&self) {
        match self {
            Self::Bytes(stage) => stage.on_pass_start(),
            Self::Events(stage) => stage.on_pass_start(),
        }
    }

    /// Fires the pass-end hook.
    pub fn on_pass_end(&self) {
        match self {
            Self::Bytes(stage) => stage.on_pass_end(),
            Self::Events(stage) => stage.on_pass_end(),
        }
    }
}

impl fmt::Debug for StageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Bytes(_) => "bytes",
            Self::Events(_) => "events",
        };
        write!(f, "StageHandle({} -> {kind})", self.name())
    }
}

/// Everything a stage factory gets to build one stage.
pub struct StageSetup {
    /// The owning entry's name or target pattern.
    pub entry: String,
    /// The declared category.
    pub category: StageCategory,
    /// The declared type within the category.
    pub type_name: Option<String>,
    /// Depth from the chain root; the root stage is 0.
    pub position: usize,
    /// Compiled parameters, properties already interpolated.
    pub params: StageParams,
    /// The artifact's source view.
    pub source: Arc<dyn Source>,
    /// The shared project context.
    pub context: Arc<ProjectContext>,
    /// The already-built upstream stage, when one exists.
    pub upstream: Option<StageHandle>,
    /// Whether the stage is compiled into an output tail, where the
    /// outermost stage is fed by the invoking chain instead of an upstream.
    pub tail: bool,
}

impl StageSetup {
    /// The display name for diagnostics, `entry/category` or
    /// `entry/category:type`.
    #[must_use]
    pub fn display_name(&self) -> String {
        match &self.type_name {
            Some(type_name) => format!("{}/{}:{}", self.entry, self.category, type_name),
            None => format!("{}/{}", self.entry, self.category),
        }
    }

    /// The upstream as an event producer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingUpstream`] when there is no upstream
    /// and [`ConfigError::KindMismatch`] when it produces bytes.
    pub fn upstream_events(&self) -> Result<Arc<dyn EventStage>, ConfigError> {
        match &self.upstream {
            Some(StageHandle::Events(stage)) => Ok(Arc::clone(stage)),
            Some(StageHandle::Bytes(stage)) => Err(ConfigError::KindMismatch {
                stage: self.display_name(),
                upstream: stage.name().to_string(),
                expected: StreamKind::Events,
                found: StreamKind::Bytes,
            }),
            None => Err(ConfigError::MissingUpstream {
                stage: self.display_name(),
                expected: StreamKind::Events,
            }),
        }
    }

    /// The upstream as an event producer, absent only at the head of an
    /// output tail.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingUpstream`] outside tails and
    /// [`ConfigError::KindMismatch`] for a byte-producing upstream.
    pub fn upstream_events_optional(
        &self,
    ) -> Result<Option<Arc<dyn EventStage>>, ConfigError> {
        match &self.upstream {
            Some(StageHandle::Events(stage)) => Ok(Some(Arc::clone(stage))),
            Some(StageHandle::Bytes(stage)) => Err(ConfigError::KindMismatch {
                stage: self.display_name(),
                upstream: stage.name().to_string(),
                expected: StreamKind::Events,
                found: StreamKind::Bytes,
            }),
            None if self.tail => Ok(None),
            None => Err(ConfigError::MissingUpstream {
                stage: self.display_name(),
                expected: StreamKind::Events,
            }),
        }
    }

    /// The upstream as a byte producer.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingUpstream`] when there is no upstream
    /// and [`ConfigError::KindMismatch`] when it produces events.
    pub fn upstream_bytes(&self) -> Result<Arc<dyn ByteStage>, ConfigError> {
        match &self.upstream {
            Some(StageHandle::Bytes(stage)) => Ok(Arc::clone(stage)),
            Some(StageHandle::Events(stage)) => Err(ConfigError::KindMismatch {
                stage: self.display_name(),
                upstream: stage.name().to_string(),
                expected: StreamKind::Bytes,
                found: StreamKind::Events,
            }),
            None => Err(ConfigError::MissingUpstream {
                stage: self.display_name(),
                expected: StreamKind::Bytes,
            }),
        }
    }

    /// Rejects an upstream for pure producer stages.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnexpectedUpstream`] when one was declared.
    pub fn require_no_upstream(&self) -> Result<(), ConfigError> {
        match &self.upstream {
            None => Ok(()),
            Some(upstream) => Err(ConfigError::UnexpectedUpstream {
                stage: self.display_name(),
                upstream: upstream.name().to_string(),
            }),
        }
    }
}
