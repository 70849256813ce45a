//! The async bridge between a primary build and its secondary targets.
//!
//! A `process` stage that opens an async event target keeps pushing events
//! while a worker thread serializes them through a named output into the
//! secondary write. The two sides alternate at a blocking rendezvous: every
//! event is handed over on a bound-0 channel and acknowledged on a second
//! one, so exactly one side is actively executing at each handoff point.
//!
//! Worker failures are captured and re-raised on the primary as soon as it
//! resumes. A primary that drops its handle without finishing closes the
//! event channel; the worker observes the hangup, discards its open write,
//! and carries the failure to the session join instead of leaking.

use std::sync::mpsc::{sync_channel, Receiver, SendError, SyncSender};
use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::build::DetachedScope;
use crate::chain::OutputChain;
use crate::contracts::TargetWrite;
use crate::errors::BuildError;
use crate::event::{Event, EventSink};
use crate::stage::AsyncEventTarget;

enum ToWorker {
    Event(Event),
    Finish,
}

type Reply = Result<(), BuildError>;

enum PumpEnd {
    Finished,
    Aborted,
}

/// The primary-side handle to a bridged secondary target.
///
/// Created by the write session when a stage opens an async event target;
/// the paired [`WorkerHandle`] stays with the session and is joined before
/// the artifact settles.
pub struct BridgeTarget {
    events: SyncSender<ToWorker>,
    replies: Receiver<Reply>,
    target: String,
}

impl BridgeTarget {
    /// Starts a worker serializing through `output` into `writer`, and
    /// blocks until the worker has built its sink stack.
    ///
    /// # Errors
    ///
    /// Returns the worker's setup failure, or a bridge failure when the
    /// thread cannot start.
    pub(crate) fn spawn(
        output: OutputChain,
        target: impl Into<String>,
        writer: Box<dyn TargetWrite>,
    ) -> Result<(Self, WorkerHandle), BuildError> {
        let target = target.into();
        let (events_tx, events_rx) = sync_channel::<ToWorker>(0);
        let (replies_tx, replies_rx) = sync_channel::<Reply>(0);

        let worker_target = target.clone();
        let handle = thread::Builder::new()
            .name(format!("bridge:{target}"))
            .spawn(move || run_worker(&output, &worker_target, writer, &events_rx, &replies_tx))
            .map_err(|err| {
                BuildError::bridge(format!("cannot start worker for '{target}': {err}"))
            })?;
        let worker = WorkerHandle {
            target: target.clone(),
            handle,
        };

        // Suspend until the worker's chain is ready to accept events.
        match replies_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if let Err(join_err) = worker.join() {
                    debug!(%target, error = %join_err, "worker exit after failed setup");
                }
                return Err(err);
            }
            Err(_) => {
                return Err(worker.join().err().unwrap_or_else(|| {
                    BuildError::bridge(format!("worker for '{target}' exited before becoming ready"))
                }));
            }
        }

        Ok((
            Self {
                events: events_tx,
                replies: replies_rx,
                target,
            },
            worker,
        ))
    }

    fn exchange(&mut self, message: ToWorker) -> Result<(), BuildError> {
        if self.events.send(message).is_err() {
            return Err(BuildError::bridge(format!(
                "worker for '{}' exited before the stream ended",
                self.target
            )));
        }
        match self.replies.recv() {
            Ok(reply) => reply,
            Err(_) => Err(BuildError::bridge(format!(
                "worker for '{}' exited without acknowledging",
                self.target
            ))),
        }
    }
}

impl EventSink for BridgeTarget {
    fn handle(&mut self, event: Event) -> Result<(), BuildError> {
        self.exchange(ToWorker::Event(event))
    }
}

impl AsyncEventTarget for BridgeTarget {
    fn finish(mut self: Box<Self>) -> Result<(), BuildError> {
        self.exchange(ToWorker::Finish)
    }
}

impl std::fmt::Debug for BridgeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeTarget")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// A joinable bridge worker.
///
/// Join results only carry failures the worker could not deliver through
/// the rendezvous; everything it did deliver has already been re-raised on
/// the primary.
pub struct WorkerHandle {
    target: String,
    handle: JoinHandle<Result<(), BuildError>>,
}

impl WorkerHandle {
    /// The secondary target the worker writes.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Waits for the worker to exit.
    ///
    /// # Errors
    ///
    /// Returns a failure the worker could not deliver to the primary, or a
    /// bridge failure when the worker panicked.
    pub fn join(self) -> Result<(), BuildError> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(BuildError::bridge(format!(
                "worker for '{}' panicked",
                self.target
            ))),
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

fn run_worker(
    output: &OutputChain,
    target: &str,
    mut writer: Box<dyn TargetWrite>,
    events: &Receiver<ToWorker>,
    replies: &SyncSender<Reply>,
) -> Result<(), BuildError> {
    debug!(%target, output = %output.name(), "bridge worker started");
    match pump(output, target, &mut writer, events, replies) {
        Ok(PumpEnd::Finished) => {
            let reply: Reply = writer.commit().map_err(BuildError::from);
            debug!(%target, committed = reply.is_ok(), "bridge worker finished");
            match replies.send(reply) {
                Ok(()) => Ok(()),
                // The primary vanished between Finish and the final reply;
                // keep the failure for the session join.
                Err(SendError(reply)) => reply,
            }
        }
        Ok(PumpEnd::Aborted) => {
            // The failure already reached the primary at its rendezvous.
            writer.discard();
            debug!(%target, "bridge worker aborted, write discarded");
            Ok(())
        }
        Err(err) => {
            writer.discard();
            debug!(%target, error = %err, "bridge worker failed, write discarded");
            Err(err)
        }
    }
}

fn pump(
    output: &OutputChain,
    target: &str,
    writer: &mut Box<dyn TargetWrite>,
    events: &Receiver<ToWorker>,
    replies: &SyncSender<Reply>,
) -> Result<PumpEnd, BuildError> {
    let scope = DetachedScope::new(target);
    let mut sink = match output.event_sink_into(&scope, writer) {
        Ok(sink) => sink,
        Err(err) => return deliver_failure(replies, err),
    };
    if replies.send(Ok(())).is_err() {
        return Err(BuildError::bridge(format!(
            "primary for '{target}' went away before the worker became ready"
        )));
    }
    loop {
        match events.recv() {
            Ok(ToWorker::Event(event)) => match sink.handle(event) {
                Ok(()) => {
                    if replies.send(Ok(())).is_err() {
                        return Err(BuildError::bridge(format!(
                            "primary for '{target}' went away mid-stream"
                        )));
                    }
                }
                Err(err) => return deliver_failure(replies, err),
            },
            Ok(ToWorker::Finish) => return Ok(PumpEnd::Finished),
            // Hangup: the primary dropped its handle without finishing.
            Err(_) => {
                return Err(BuildError::bridge(format!(
                    "primary for '{target}' ended before the split target finished"
                )))
            }
        }
    }
}

fn deliver_failure(replies: &SyncSender<Reply>, err: BuildError) -> Result<PumpEnd, BuildError> {
    match replies.send(Err(err)) {
        Ok(()) => Ok(PumpEnd::Aborted),
        Err(SendError(reply)) => Err(reply
            .err()
            .unwrap_or_else(|| BuildError::bridge("worker failure lost on a closed channel"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::chain::{ChainCompiler, StageRegistry};
    use crate::contracts::{ArtifactSource, Source, SourceTree, Storage};
    use crate::errors::StorageError;
    use crate::manifest::{StageCategory, StageDecl};
    use crate::project::ProjectContext;
    use crate::testing::mocks::{MemorySourceTree, MemoryStorage};

    fn xml_output(name: &str) -> OutputChain {
        let registry = StageRegistry::with_defaults();
        let context = Arc::new(ProjectContext::new());
        let compiler = ChainCompiler::new(&registry, &context);
        let tree: Arc<dyn SourceTree> = Arc::new(MemorySourceTree::new());
        let source: Arc<dyn Source> =
            Arc::new(ArtifactSource::new(name, None, tree, Arc::clone(&context)));
        let decls = vec![StageDecl::new(StageCategory::Format).with_type("xml")];
        compiler.compile_output(name, &decls, &source).unwrap()
    }

    #[test]
    fn test_finish_commits_the_secondary_write() {
        let backend = Arc::new(MemoryStorage::new());
        let writer = backend.create_file("/section-1.xml").unwrap();
        let (mut target, worker) =
            BridgeTarget::spawn(xml_output("serialize"), "/section-1.xml", writer).unwrap();

        target.handle(Event::StartDocument).unwrap();
        target.handle(Event::open("section")).unwrap();
        target.handle(Event::text("one")).unwrap();
        target.handle(Event::close("section")).unwrap();
        target.handle(Event::EndDocument).unwrap();
        Box::new(target).finish().unwrap();
        worker.join().unwrap();

        let written = String::from_utf8(backend.read("/section-1.xml").unwrap()).unwrap();
        assert!(written.contains("<section>one</section>"));
        assert_eq!(backend.commits(), 1);
        assert_eq!(backend.discards(), 0);
    }

    #[test]
    fn test_worker_failure_reraised_on_the_primary() {
        struct ExplodingWrite {
            discards: Arc<AtomicUsize>,
        }
        impl Write for ExplodingWrite {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("disk full"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        impl TargetWrite for ExplodingWrite {
            fn commit(self: Box<Self>) -> Result<(), StorageError> {
                Ok(())
            }
            fn discard(self: Box<Self>) {
                self.discards.fetch_add(1, Ordering::SeqCst);
            }
        }

        let discards = Arc::new(AtomicUsize::new(0));
        let writer = Box::new(ExplodingWrite {
            discards: Arc::clone(&discards),
        });
        let (mut target, worker) =
            BridgeTarget::spawn(xml_output("serialize"), "/broken.xml", writer).unwrap();

        // The declaration write fails inside the worker; the failure comes
        // back at this rendezvous.
        let err = target.handle(Event::StartDocument).unwrap_err();
        assert!(matches!(err, BuildError::Io { .. }));
        drop(target);

        // Delivered failures are not repeated at the join.
        worker.join().unwrap();
        assert_eq!(discards.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_primary_discards_the_worker_write() {
        let backend = Arc::new(MemoryStorage::new());
        let writer = backend.create_file("/abandoned.xml").unwrap();
        let (mut target, worker) =
            BridgeTarget::spawn(xml_output("serialize"), "/abandoned.xml", writer).unwrap();

        target.handle(Event::StartDocument).unwrap();
        target.handle(Event::open("section")).unwrap();
        drop(target);

        let err = worker.join().unwrap_err();
        assert!(matches!(err, BuildError::Bridge { .. }));
        assert!(backend.read("/abandoned.xml").is_none());
        assert_eq!(backend.discards(), 1);
    }

    #[test]
    fn test_commit_failure_surfaces_at_finish() {
        let backend = Arc::new(MemoryStorage::new());
        let writer = backend.create_file("/flaky.xml").unwrap();
        let (mut target, worker) =
            BridgeTarget::spawn(xml_output("serialize"), "/flaky.xml", writer).unwrap();

        target.handle(Event::StartDocument).unwrap();
        target.handle(Event::EndDocument).unwrap();
        backend.fail_next(StorageError::Backend {
            message: "quota exceeded".to_string(),
        });
        let err = Box::new(target).finish().unwrap_err();
        assert!(matches!(err, BuildError::Storage(_)));
        worker.join().unwrap();
        assert!(backend.read("/flaky.xml").is_none());
    }
}
