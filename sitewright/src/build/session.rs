//! The write session handed to a driving chain as its target scope.

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::bridge::{BridgeTarget, WorkerHandle};
use crate::contracts::{StorageSession, TargetWrite};
use crate::errors::{BuildError, StorageError};
use crate::project::ProjectContext;
use crate::stage::{AsyncEventTarget, TargetScope};

/// Mutable state of one write attempt: the open primary write, the target
/// it currently points at, and the pending retry rename.
struct BuildState {
    target_url: String,
    writer: Option<Box<dyn TargetWrite>>,
    rename_request: Option<String>,
    spool_seq: usize,
}

/// One transactional write attempt for one concrete target.
///
/// The session is the [`TargetScope`] a chain drives against. It owns the
/// primary write (swappable mid-stream by `rename_and_continue`), the
/// spooled secondary targets waiting for the primary commit, and the bridge
/// workers that must be joined before the artifact settles.
pub(crate) struct WriteSession {
    session: Arc<StorageSession>,
    context: Arc<ProjectContext>,
    wildcard: bool,
    state: Mutex<BuildState>,
    spools: Arc<Mutex<Vec<SpooledTarget>>>,
    workers: Mutex<Vec<WorkerHandle>>,
}

impl WriteSession {
    /// Opens the primary write for `target`.
    pub(crate) fn open(
        session: Arc<StorageSession>,
        context: Arc<ProjectContext>,
        target: impl Into<String>,
        wildcard: bool,
    ) -> Result<Self, BuildError> {
        let target = target.into();
        let writer = session.create_file(&target)?;
        Ok(Self {
            session,
            context,
            wildcard,
            state: Mutex::new(BuildState {
                target_url: target,
                writer: Some(writer),
                rename_request: None,
                spool_seq: 0,
            }),
            spools: Arc::new(Mutex::new(Vec::new())),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// A `Write` handle that follows the current primary write across
    /// renames.
    pub(crate) fn primary(&self) -> PrimaryWrite<'_> {
        PrimaryWrite { session: self }
    }

    /// The target name the attempt ended on.
    pub(crate) fn target_url(&self) -> String {
        self.state.lock().target_url.clone()
    }

    /// Takes the pending retry rename, if a stage requested one.
    pub(crate) fn take_rename_request(&self) -> Option<String> {
        self.state.lock().rename_request.take()
    }

    /// Commits the primary write.
    pub(crate) fn commit_primary(&self) -> Result<(), BuildError> {
        let writer = self.state.lock().writer.take();
        match writer {
            Some(writer) => Ok(writer.commit()?),
            None => Err(BuildError::Unsupported {
                operation: "committing a write that is no longer open",
            }),
        }
    }

    /// Joins outstanding bridge workers, surfacing the first failure none
    /// of them could deliver through the rendezvous.
    ///
    /// Callers must have dropped the chain's sink stack first, so every
    /// worker has already observed its stream end.
    pub(crate) fn join_workers(&self) -> Result<(), BuildError> {
        let mut first_error = None;
        for worker in self.drain_workers() {
            let target = worker.target().to_string();
            if let Err(err) = worker.join() {
                debug!(%target, error = %err, "bridge worker failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Replays spooled secondary targets to storage, oldest first, and
    /// removes the temp files.
    pub(crate) fn replay_spools(&self) -> Result<(), BuildError> {
        let spooled: Vec<SpooledTarget> = std::mem::take(&mut *self.spools.lock());
        for spool in spooled {
            spool.replay(&self.session)?;
        }
        Ok(())
    }

    /// Discards everything the attempt opened or spooled.
    pub(crate) fn discard(&self) {
        if let Some(writer) = self.state.lock().writer.take() {
            writer.discard();
        }
        for worker in self.drain_workers() {
            let target = worker.target().to_string();
            if let Err(err) = worker.join() {
                debug!(%target, error = %err, "bridge worker ended with the discarded build");
            }
        }
        self.spools.lock().clear();
    }

    fn drain_workers(&self) -> Vec<WorkerHandle> {
        std::mem::take(&mut *self.workers.lock())
    }

    fn open_secondary(&self, target: &str) -> Result<Box<dyn TargetWrite>, BuildError> {
        if self.session.is_reentrant() {
            return Ok(self.session.create_file(target)?);
        }
        let seq = {
            let mut state = self.state.lock();
            state.spool_seq += 1;
            state.spool_seq
        };
        let spool = tempfile::Builder::new()
            .prefix(&format!("sitewright-spool-{seq}-"))
            .tempfile()?;
        debug!(%target, spool = %spool.path().display(), "secondary write spooled");
        Ok(Box::new(SpooledWrite {
            target: target.to_string(),
            file: Some(spool),
            spools: Arc::clone(&self.spools),
        }))
    }
}

impl TargetScope for WriteSession {
    fn current_target_url(&self) -> String {
        self.state.lock().target_url.clone()
    }

    fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    fn rename_and_continue(
        &self,
        name: &str,
        prepend_current_name: bool,
    ) -> Result<(), BuildError> {
        let mut state = self.state.lock();
        let Some(writer) = state.writer.take() else {
            return Err(BuildError::Unsupported {
                operation: "renaming a write that is no longer open",
            });
        };
        writer.commit()?;
        let next = sibling_url(&state.target_url, name, prepend_current_name);
        debug!(from = %state.target_url, to = %next, "rename and continue");
        state.writer = Some(self.session.create_file(&next)?);
        state.target_url = next;
        Ok(())
    }

    fn request_rename(&self, name: &str) {
        self.state.lock().rename_request = Some(name.to_string());
    }

    fn open_async_target(
        &self,
        name: &str,
        prepend_current_name: bool,
    ) -> Result<Box<dyn TargetWrite>, BuildError> {
        let target = sibling_url(&self.current_target_url(), name, prepend_current_name);
        self.open_secondary(&target)
    }

    fn open_async_event_target(
        &self,
        name: &str,
        prepend_current_name: bool,
        output: &str,
    ) -> Result<Box<dyn AsyncEventTarget>, BuildError> {
        let target = sibling_url(&self.current_target_url(), name, prepend_current_name);
        let chain = self
            .context
            .output(output)
            .ok_or_else(|| BuildError::UnknownOutput {
                output: output.to_string(),
            })?;
        let writer = self.open_secondary(&target)?;
        let (bridge, worker) = BridgeTarget::spawn(chain, target, writer)?;
        self.workers.lock().push(worker);
        Ok(Box::new(bridge))
    }
}

/// `Write` view over the session's current primary write.
///
/// The indirection keeps a serializer's output valid across
/// `rename_and_continue`, which swaps the underlying write mid-stream.
pub(crate) struct PrimaryWrite<'a> {
    session: &'a WriteSession,
}

impl Write for PrimaryWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.session.state.lock().writer.as_mut() {
            Some(writer) => writer.write(buf),
            None => Err(io::Error::other("no open target write")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.session.state.lock().writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

/// A secondary write parked in a local temp file until the primary commits.
struct SpooledWrite {
    target: String,
    file: Option<NamedTempFile>,
    spools: Arc<Mutex<Vec<SpooledTarget>>>,
}

impl Write for SpooledWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::other("spooled write already settled")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl TargetWrite for SpooledWrite {
    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        file.flush()?;
        self.spools.lock().push(SpooledTarget {
            target: self.target.clone(),
            file,
        });
        Ok(())
    }

    fn discard(mut self: Box<Self>) {
        // Dropping the temp file removes it.
        self.file.take();
    }
}

/// One committed spool awaiting replay.
struct SpooledTarget {
    target: String,
    file: NamedTempFile,
}

impl SpooledTarget {
    fn replay(self, session: &StorageSession) -> Result<(), BuildError> {
        let mut reader = self.file.reopen()?;
        let mut writer = session.create_file(&self.target)?;
        if let Err(err) = io::copy(&mut reader, &mut writer) {
            writer.discard();
            return Err(err.into());
        }
        writer.commit()?;
        debug!(target = %self.target, "spooled secondary replayed");
        Ok(())
    }
}

/// A scope for chains that run without a target: parts, output tails on the
/// worker side, and stage-level tests.
///
/// Target writes are rejected; the current URL reports the name the scope
/// was created with.
#[derive(Debug, Clone)]
pub struct DetachedScope {
    name: String,
}

impl DetachedScope {
    /// Creates a scope reporting `name` as the current target.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl TargetScope for DetachedScope {
    fn current_target_url(&self) -> String {
        self.name.clone()
    }

    fn is_wildcard(&self) -> bool {
        false
    }

    fn rename_and_continue(
        &self,
        _name: &str,
        _prepend_current_name: bool,
    ) -> Result<(), BuildError> {
        Err(BuildError::Unsupported {
            operation: "renaming without a target",
        })
    }

    fn request_rename(&self, _name: &str) {}

    fn open_async_target(
        &self,
        _name: &str,
        _prepend_current_name: bool,
    ) -> Result<Box<dyn TargetWrite>, BuildError> {
        Err(BuildError::Unsupported {
            operation: "opening a secondary target without a primary",
        })
    }

    fn open_async_event_target(
        &self,
        _name: &str,
        _prepend_current_name: bool,
        _output: &str,
    ) -> Result<Box<dyn AsyncEventTarget>, BuildError> {
        Err(BuildError::Unsupported {
            operation: "opening a secondary event target without a primary",
        })
    }
}

/// Composes a sibling URL in the current target's directory.
///
/// Plain names replace the file component; with `prepend` the name is
/// appended to the current file's stem.
pub(crate) fn sibling_url(current: &str, name: &str, prepend: bool) -> String {
    let (dir, file) = match current.rfind('/') {
        Some(split) => (&current[..split], &current[split + 1..]),
        None => ("", current),
    };
    let file = if prepend {
        let stem = file.rfind('.').map_or(file, |dot| &file[..dot]);
        format!("{stem}{name}")
    } else {
        name.to_string()
    };
    if dir.is_empty() {
        format!("/{file}")
    } else {
        format!("{dir}/{file}")
    }
}
