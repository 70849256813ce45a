//! Compiled stage chains.
//!
//! A [`Chain`] is the runnable form of one manifest entry's stage stack,
//! linked root-first: the innermost declaration is the root (the stage
//! nearest the output) and every stage holds the link to its upstream
//! producer. [`OutputChain`] and [`Part`] wrap chains for the two reusable
//! entry kinds.

mod compiler;
mod registry;

pub use compiler::ChainCompiler;
pub use registry::{StageFactory, StageRegistry, StageRegistryBuilder};

use std::io::Write;

use chrono::{DateTime, Utc};

use crate::build::DetachedScope;
use crate::errors::{BuildError, ConfigError, StaleError};
use crate::event::EventSink;
use crate::stage::{StageHandle, StreamKind, TargetScope};

/// A linked stage stack, ready to drive.
#[derive(Clone)]
pub struct Chain {
    entry: String,
    members: Vec<StageHandle>,
}

impl Chain {
    /// Builds a chain from root-first members; the compiler guarantees the
    /// list is non-empty and kind-consistent.
    pub(crate) fn new(entry: impl Into<String>, members: Vec<StageHandle>) -> Self {
        Self {
            entry: entry.into(),
            members,
        }
    }

    /// The owning entry's name or target pattern.
    #[must_use]
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// The stages, root first.
    #[must_use]
    pub fn stages(&self) -> &[StageHandle] {
        &self.members
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the chain has no stages; never true for compiled chains.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The root stage, nearest the output.
    #[must_use]
    pub fn root(&self) -> &StageHandle {
        &self.members[0]
    }

    /// The stream kind the chain delivers at its root.
    #[must_use]
    pub fn output_kind(&self) -> StreamKind {
        self.root().output_kind()
    }

    /// Evaluates the staleness contract from the root, which recurses
    /// through its upstream links and short-circuits on the first `true`.
    ///
    /// # Errors
    ///
    /// Propagates the first evaluation failure.
    pub fn has_been_updated(&self, since: DateTime<Utc>) -> Result<bool, StaleError> {
        self.root().has_been_updated(since)
    }

    /// Runs every stage's one-time setup, outermost declaration first.
    ///
    /// # Errors
    ///
    /// Propagates the first initializer failure.
    pub fn initialize(&self) -> Result<(), ConfigError> {
        for stage in self.members.iter().rev() {
            stage.initialize()?;
        }
        Ok(())
    }

    /// Fires every stage's pass-start hook, outermost declaration first.
    pub fn notify_pass_start(&self) {
        for stage in self.members.iter().rev() {
            stage.on_pass_start();
        }
    }

    /// Fires every stage's pass-end hook, outermost declaration first.
    pub fn notify_pass_end(&self) {
        for stage in self.members.iter().rev() {
            stage.on_pass_end();
        }
    }

    /// Drives a byte-producing root into `out`.
    ///
    /// # Errors
    ///
    /// Rejects event-producing chains and propagates drive failures.
    pub fn drive_bytes(
        &self,
        scope: &dyn TargetScope,
        out: &mut dyn Write,
    ) -> Result<(), BuildError> {
        match self.root() {
            StageHandle::Bytes(stage) => stage.drive(scope, out),
            StageHandle::Events(_) => Err(BuildError::Unsupported {
                operation: "driving an event-producing chain as bytes",
            }),
        }
    }

    /// Drives an event-producing root into `sink`.
    ///
    /// # Errors
    ///
    /// Rejects byte-producing chains and propagates drive failures.
    pub fn drive_events(
        &self,
        scope: &dyn TargetScope,
        sink: &mut dyn EventSink,
    ) -> Result<(), BuildError> {
        match self.root() {
            StageHandle::Events(stage) => stage.drive_events(scope, sink),
            StageHandle::Bytes(_) => Err(BuildError::Unsupported {
                operation: "driving a byte-producing chain as events",
            }),
        }
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("entry", &self.entry)
            .field("stages", &self.members)
            .finish()
    }
}

/// A named byte-producing tail shared by event-rooted artifacts.
///
/// The tail is fed by pushing: the invoking chain's events flow into the
/// sink stack built by [`event_sink_into`](Self::event_sink_into), with the
/// serializer at the bottom writing the target's bytes.
#[derive(Clone, Debug)]
pub struct OutputChain {
    name: String,
    chain: Chain,
}

impl OutputChain {
    pub(crate) fn new(name: impl Into<String>, chain: Chain) -> Self {
        Self {
            name: name.into(),
            chain,
        }
    }

    /// The output's manifest name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying chain.
    #[must_use]
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Evaluates the tail's own staleness contract.
    ///
    /// # Errors
    ///
    /// Propagates the evaluation failure.
    pub fn has_been_updated(&self, since: DateTime<Utc>) -> Result<bool, StaleError> {
        self.chain.has_been_updated(since)
    }

    /// Composes the tail into a sink writing into `out`.
    ///
    /// The serializer root builds the bottom sink; event transforms wrap it
    /// outward, so the returned sink is the tail's injection point.
    ///
    /// # Errors
    ///
    /// Fails when a tail stage cannot run in pushed form; compilation
    /// rejects such tails up front.
    pub fn event_sink_into<'a>(
        &'a self,
        scope: &'a dyn TargetScope,
        out: &'a mut dyn Write,
    ) -> Result<Box<dyn EventSink + 'a>, BuildError> {
        let root = match self.chain.root() {
            StageHandle::Bytes(stage) => stage,
            StageHandle::Events(_) => {
                return Err(BuildError::Unsupported {
                    operation: "serializing through an event-rooted output",
                })
            }
        };
        let mut sink = root.serializer_sink(scope, out)?;
        for stage in &self.chain.stages()[1..] {
            match stage {
                StageHandle::Events(transform) => sink = transform.wrap_sink(scope, sink)?,
                StageHandle::Bytes(_) => {
                    return Err(BuildError::Unsupported {
                        operation: "running a byte stage inside an output tail",
                    })
                }
            }
        }
        Ok(sink)
    }
}

/// A named event-producing chain resolved through `part:` URLs.
///
/// Parts never write targets; their chains drive against a detached scope
/// and deliver into whatever sink the referencing chain supplies.
#[derive(Clone, Debug)]
pub struct Part {
    name: String,
    chain: Chain,
}

impl Part {
    pub(crate) fn new(name: impl Into<String>, chain: Chain) -> Self {
        Self {
            name: name.into(),
            chain,
        }
    }

    /// The part's manifest name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying chain.
    #[must_use]
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Drives the part's chain into `sink`.
    ///
    /// # Errors
    ///
    /// Propagates drive failures; target writes are rejected by the
    /// detached scope.
    pub fn deliver(&self, sink: &mut dyn EventSink) -> Result<(), BuildError> {
        let scope = DetachedScope::new(format!("part:{}", self.name));
        self.chain.drive_events(&scope, sink)
    }

    /// Whether the part's inputs changed after `since`.
    ///
    /// # Errors
    ///
    /// Propagates the evaluation failure.
    pub fn has_been_updated(&self, since: DateTime<Utc>) -> Result<bool, StaleError> {
        self.chain.has_been_updated(since)
    }
}
