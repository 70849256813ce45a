//! In-memory doubles for the host contracts.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tempfile::TempDir;

use crate::contracts::{FileStamp, SourceTree, Storage, TargetWrite};
use crate::errors::{BuildError, SourceLocation, StaleError, StorageError};
use crate::event::{Event, EventParser, EventSink};

pub use crate::build::DetachedScope;

#[derive(Default)]
struct StorageState {
    files: HashMap<String, (Vec<u8>, FileStamp)>,
    queued_failures: VecDeque<StorageError>,
    open: bool,
    open_writes: usize,
    opens: usize,
    closes: usize,
    creates: usize,
    commits: usize,
    discards: usize,
    deletes: usize,
    leaks: usize,
}

/// An in-memory [`Storage`] backend with failure injection and call
/// counters.
///
/// Counters audit the transactional contract: every opened write must
/// settle as exactly one commit or discard, and a write dropped without
/// settling counts as a leak.
pub struct MemoryStorage {
    password: Option<String>,
    reentrant: bool,
    state: Arc<Mutex<StorageState>>,
}

impl MemoryStorage {
    /// Creates an open-for-anything backend: no password, reentrant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            password: None,
            reentrant: true,
            state: Arc::new(Mutex::new(StorageState::default())),
        }
    }

    /// Requires `password` at open time.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Rejects overlapping writes, so secondary targets must spool.
    #[must_use]
    pub fn non_reentrant(mut self) -> Self {
        self.reentrant = false;
        self
    }

    /// Queues a failure for the next storage operation, including a
    /// pending write's commit.
    pub fn fail_next(&self, error: StorageError) {
        self.state.lock().queued_failures.push_back(error);
    }

    /// Seeds a published file stamped now.
    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.add_file_stamped(path, data, Utc::now());
    }

    /// Seeds a published file with a fixed stamp.
    pub fn add_file_stamped(&self, path: &str, data: &[u8], stamp: DateTime<Utc>) {
        self.state
            .lock()
            .files
            .insert(path.to_string(), (data.to_vec(), FileStamp::Modified(stamp)));
    }

    /// Marks an existing file as undatable.
    pub fn set_unknown_stamp(&self, path: &str) {
        if let Some(entry) = self.state.lock().files.get_mut(path) {
            entry.1 = FileStamp::Unknown;
        }
    }

    /// A published file's content.
    #[must_use]
    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(path).map(|(data, _)| data.clone())
    }

    /// Reconnects observed after the initial open.
    #[must_use]
    pub fn reconnects(&self) -> usize {
        self.state.lock().opens.saturating_sub(1)
    }

    /// Calls to `close` on an open connection.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.state.lock().closes
    }

    /// Writes opened.
    #[must_use]
    pub fn creates(&self) -> usize {
        self.state.lock().creates
    }

    /// Writes committed.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.state.lock().commits
    }

    /// Writes discarded, including commits the backend failed.
    #[must_use]
    pub fn discards(&self) -> usize {
        self.state.lock().discards
    }

    /// Delete calls carried out.
    #[must_use]
    pub fn deletes(&self) -> usize {
        self.state.lock().deletes
    }

    /// Writes dropped without commit or discard.
    #[must_use]
    pub fn leaks(&self) -> usize {
        self.state.lock().leaks
    }

    fn take_failure(&self) -> Result<(), StorageError> {
        match self.state.lock().queued_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn needs_password(&self) -> bool {
        self.password.is_some()
    }

    fn is_reentrant(&self) -> bool {
        self.reentrant
    }

    fn open(&self, location: &str, password: Option<&str>) -> Result<(), StorageError> {
        if let Some(expected) = &self.password {
            if password != Some(expected.as_str()) {
                return Err(StorageError::AuthenticationFailed {
                    location: location.to_string(),
                    message: "password rejected".to_string(),
                });
            }
        }
        let mut state = self.state.lock();
        state.open = true;
        state.opens += 1;
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state.open {
            state.open = false;
            state.closes += 1;
        }
    }

    fn last_modified(&self, path: &str) -> Result<FileStamp, StorageError> {
        self.take_failure()?;
        let state = self.state.lock();
        Ok(state
            .files
            .get(path)
            .map_or(FileStamp::Absent, |(_, stamp)| *stamp))
    }

    fn create_file(&self, path: &str) -> Result<Box<dyn TargetWrite>, StorageError> {
        self.take_failure()?;
        {
            let mut state = self.state.lock();
            if !self.reentrant && state.open_writes > 0 {
                return Err(StorageError::Backend {
                    message: format!("write to '{path}' while another write is open"),
                });
            }
            state.creates += 1;
            state.open_writes += 1;
        }
        Ok(Box::new(MemoryWrite {
            path: path.to_string(),
            buffer: Vec::new(),
            state: Arc::clone(&self.state),
            settled: false,
        }))
    }

    fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.take_failure()?;
        let mut state = self.state.lock();
        state.files.remove(path);
        state.deletes += 1;
        Ok(())
    }
}

struct MemoryWrite {
    path: String,
    buffer: Vec<u8>,
    state: Arc<Mutex<StorageState>>,
    settled: bool,
}

impl Write for MemoryWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl TargetWrite for MemoryWrite {
    fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        self.settled = true;
        let mut state = self.state.lock();
        state.open_writes = state.open_writes.saturating_sub(1);
        if let Some(err) = state.queued_failures.pop_front() {
            // A failed commit publishes nothing; the write is gone.
            state.discards += 1;
            return Err(err);
        }
        state.commits += 1;
        state.files.insert(
            std::mem::take(&mut self.path),
            (
                std::mem::take(&mut self.buffer),
                FileStamp::Modified(Utc::now()),
            ),
        );
        Ok(())
    }

    fn discard(mut self: Box<Self>) {
        self.settled = true;
        let mut state = self.state.lock();
        state.open_writes = state.open_writes.saturating_sub(1);
        state.discards += 1;
    }
}

impl Drop for MemoryWrite {
    fn drop(&mut self) {
        if !self.settled {
            let mut state = self.state.lock();
            state.open_writes = state.open_writes.saturating_sub(1);
            state.leaks += 1;
        }
    }
}

/// An in-memory [`SourceTree`], mirrored to a temp directory so wildcard
/// expansion can list it.
pub struct MemorySourceTree {
    files: Mutex<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
    local: Option<TempDir>,
}

impl MemorySourceTree {
    /// Creates a tree with local-disk backing.
    #[must_use]
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            local: TempDir::new().ok(),
        }
    }

    /// Drops the local backing; wildcard expansion cannot resolve the
    /// tree afterwards.
    #[must_use]
    pub fn detached(mut self) -> Self {
        self.local = None;
        self
    }

    /// Adds a source document stamped now.
    pub fn add_file(&self, url: &str, data: &[u8]) {
        self.add_file_stamped(url, data, Utc::now());
    }

    /// Adds a source document with a fixed stamp.
    pub fn add_file_stamped(&self, url: &str, data: &[u8], stamp: DateTime<Utc>) {
        self.files
            .lock()
            .insert(url.to_string(), (data.to_vec(), stamp));
        if let Some(dir) = &self.local {
            let path = dir.path().join(url.trim_start_matches('/'));
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            let _ = fs::write(&path, data);
        }
    }
}

impl Default for MemorySourceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceTree for MemorySourceTree {
    fn open(&self, url: &str) -> io::Result<Box<dyn Read + Send>> {
        match self.files.lock().get(url) {
            Some((data, _)) => Ok(Box::new(Cursor::new(data.clone()))),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no source at '{url}'"),
            )),
        }
    }

    fn local_path(&self, url: &str) -> Option<PathBuf> {
        let dir = self.local.as_ref()?;
        Some(dir.path().join(url.trim_start_matches('/')))
    }

    fn modified_since(&self, url: &str, since: DateTime<Utc>) -> Result<bool, StaleError> {
        match self.files.lock().get(url) {
            Some((_, stamp)) => Ok(*stamp > since),
            // A vanished source reads as updated; the build surfaces the
            // real failure when it tries to open it.
            None => Ok(true),
        }
    }
}

/// A line-oriented [`EventParser`].
///
/// `+name` opens an element, `-name` closes it, `#text` emits a comment,
/// `!message` fails the parse at that line, and anything else is text.
/// The stream is wrapped in document events and element balance is
/// enforced.
#[derive(Debug, Default, Clone, Copy)]
pub struct LineParser;

impl LineParser {
    /// Creates the parser.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl EventParser for LineParser {
    fn parse(&self, input: &mut dyn Read, sink: &mut dyn EventSink) -> Result<(), BuildError> {
        let mut text = String::new();
        input.read_to_string(&mut text)?;

        sink.handle(Event::StartDocument)?;
        let mut open: Vec<String> = Vec::new();
        let mut line_no: u32 = 0;
        for line in text.lines() {
            line_no += 1;
            if line.is_empty() {
                continue;
            }
            let location = SourceLocation::new(line_no, 1);
            if let Some(name) = line.strip_prefix('+') {
                open.push(name.to_string());
                sink.handle(Event::open(name))?;
            } else if let Some(name) = line.strip_prefix('-') {
                match open.pop() {
                    Some(expected) if expected == name => {
                        sink.handle(Event::close(name))?;
                    }
                    Some(expected) => {
                        return Err(BuildError::parse_at(
                            format!("closed '{name}' while '{expected}' is open"),
                            location,
                        ));
                    }
                    None => {
                        return Err(BuildError::parse_at(
                            format!("closed '{name}' with nothing open"),
                            location,
                        ));
                    }
                }
            } else if let Some(comment) = line.strip_prefix('#') {
                sink.handle(Event::Comment(comment.to_string()))?;
            } else if let Some(message) = line.strip_prefix('!') {
                return Err(BuildError::parse_at(message.to_string(), location));
            } else {
                sink.handle(Event::text(line))?;
            }
        }
        if let Some(unclosed) = open.pop() {
            return Err(BuildError::parse(format!(
                "document ended with '{unclosed}' open"
            )));
        }
        sink.handle(Event::EndDocument)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::BufferSink;

    #[test]
    fn test_line_parser_produces_wrapped_events() {
        let mut sink = BufferSink::new();
        LineParser::new()
            .parse(
                &mut Cursor::new(b"+page\nhello\n#note\n-page\n".to_vec()),
                &mut sink,
            )
            .unwrap();
        assert_eq!(
            sink.events(),
            &[
                Event::StartDocument,
                Event::open("page"),
                Event::text("hello"),
                Event::Comment("note".into()),
                Event::close("page"),
                Event::EndDocument,
            ]
        );
    }

    #[test]
    fn test_line_parser_reports_locations() {
        let mut sink = BufferSink::new();
        let err = LineParser::new()
            .parse(&mut Cursor::new(b"+page\n!bad markup\n".to_vec()), &mut sink)
            .unwrap_err();
        let location = err.location().cloned().unwrap();
        assert_eq!(location.line, 2);
        assert!(err.to_string().contains("bad markup"));
    }

    #[test]
    fn test_line_parser_enforces_balance() {
        let mut sink = BufferSink::new();
        let err = LineParser::new()
            .parse(&mut Cursor::new(b"+a\n-b\n".to_vec()), &mut sink)
            .unwrap_err();
        assert!(err.to_string().contains("'b'"));

        let mut sink = BufferSink::new();
        let err = LineParser::new()
            .parse(&mut Cursor::new(b"+a\ntext\n".to_vec()), &mut sink)
            .unwrap_err();
        assert!(err.to_string().contains("'a'"));
    }

    #[test]
    fn test_storage_audits_settlement() {
        let storage = MemoryStorage::new();
        let mut write = storage.create_file("/a.txt").unwrap();
        write.write_all(b"one").unwrap();
        write.commit().unwrap();

        let write = storage.create_file("/b.txt").unwrap();
        write.discard();

        drop(storage.create_file("/c.txt").unwrap());

        assert_eq!(storage.creates(), 3);
        assert_eq!(storage.commits(), 1);
        assert_eq!(storage.discards(), 1);
        assert_eq!(storage.leaks(), 1);
    }

    #[test]
    fn test_non_reentrant_storage_rejects_overlapping_writes() {
        let storage = MemoryStorage::new().non_reentrant();
        let first = storage.create_file("/a.txt").unwrap();
        let Err(err) = storage.create_file("/b.txt") else {
            panic!("second write must be rejected while the first is open");
        };
        assert!(matches!(err, StorageError::Backend { .. }));
        first.discard();
        storage.create_file("/b.txt").unwrap().discard();
    }

    #[test]
    fn test_source_tree_mirrors_files_locally() {
        let tree = MemorySourceTree::new();
        tree.add_file("/posts/a.txt", b"alpha");
        let path = tree.local_path("/posts/a.txt").unwrap();
        assert_eq!(fs::read(path).unwrap(), b"alpha");
        assert!(tree.local_path("/posts").unwrap().is_dir());

        let detached = MemorySourceTree::new().detached();
        detached.add_file("/posts/a.txt", b"alpha");
        assert!(detached.local_path("/posts/a.txt").is_none());
    }
}
