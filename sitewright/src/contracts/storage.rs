//! The storage contract and the engine-side session that wraps it.

use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::errors::StorageError;

/// What a storage backend knows about a file's modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStamp {
    /// The file does not exist.
    Absent,
    /// The file exists but the backend cannot date it; treated as stale.
    Unknown,
    /// The file's last modification time.
    Modified(DateTime<Utc>),
}

impl FileStamp {
    /// Whether the file is missing.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// The modification time, when the backend knows one.
    #[must_use]
    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Modified(time) => Some(*time),
            _ => None,
        }
    }
}

/// A transactional write to one storage target.
///
/// Bytes become visible at the target path only when [`commit`](Self::commit)
/// succeeds; a discarded or dropped write leaves the target untouched.
pub trait TargetWrite: Write + Send {
    /// Publishes the written bytes at the target path.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend cannot complete the write; the
    /// target keeps its previous content.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Abandons the write, leaving the target untouched.
    fn discard(self: Box<Self>);
}

/// A site storage backend.
///
/// Backends manage their own connection state behind `&self`; the engine
/// serializes access within a build pass.
pub trait Storage: Send + Sync {
    /// Whether [`open`](Self::open) requires a password.
    fn needs_password(&self) -> bool;

    /// Whether the backend tolerates a second concurrent [`TargetWrite`].
    ///
    /// Non-reentrant backends get secondary writes spooled to temp files and
    /// replayed after the primary write commits.
    fn is_reentrant(&self) -> bool;

    /// Connects to the backend.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AuthenticationFailed`] for credential
    /// problems and other variants for connection failures.
    fn open(&self, location: &str, password: Option<&str>) -> Result<(), StorageError>;

    /// Releases the connection. Idempotent.
    fn close(&self);

    /// Reports a file's modification stamp.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend cannot answer; a missing file is
    /// [`FileStamp::Absent`], not an error.
    fn last_modified(&self, path: &str) -> Result<FileStamp, StorageError>;

    /// Opens a transactional write for a target path.
    ///
    /// # Errors
    ///
    /// Returns an error when the write cannot be opened.
    fn create_file(&self, path: &str) -> Result<Box<dyn TargetWrite>, StorageError>;

    /// Deletes a target path.
    ///
    /// Deleting a path that does not exist succeeds; delete entries report
    /// success independent of prior existence.
    ///
    /// # Errors
    ///
    /// Returns an error only when the backend failed to carry the deletion
    /// out.
    fn delete(&self, path: &str) -> Result<(), StorageError>;
}

/// An authenticated storage connection with transient-failure recovery.
///
/// Every operation that fails with [`StorageError::Transient`] is retried
/// exactly once after closing and reopening the backend; a second failure
/// propagates to the caller.
pub struct StorageSession {
    backend: Arc<dyn Storage>,
    location: String,
    password: Option<String>,
}

impl StorageSession {
    /// Opens a session, enforcing the password requirement up front.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PasswordRequired`] when the backend wants a
    /// password and none was given, or whatever the backend's `open`
    /// reported.
    pub fn open(
        backend: Arc<dyn Storage>,
        location: impl Into<String>,
        password: Option<String>,
    ) -> Result<Self, StorageError> {
        let location = location.into();
        if backend.needs_password() && password.is_none() {
            return Err(StorageError::PasswordRequired { location });
        }
        backend.open(&location, password.as_deref())?;
        Ok(Self {
            backend,
            location,
            password,
        })
    }

    /// The location this session is connected to.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Whether the backend tolerates concurrent writes.
    #[must_use]
    pub fn is_reentrant(&self) -> bool {
        self.backend.is_reentrant()
    }

    /// A file's modification stamp, with the transient retry.
    ///
    /// # Errors
    ///
    /// Propagates the backend failure after the retry.
    pub fn last_modified(&self, path: &str) -> Result<FileStamp, StorageError> {
        self.with_retry(|backend| backend.last_modified(path))
    }

    /// Opens a transactional write, with the transient retry.
    ///
    /// # Errors
    ///
    /// Propagates the backend failure after the retry.
    pub fn create_file(&self, path: &str) -> Result<Box<dyn TargetWrite>, StorageError> {
        self.with_retry(|backend| backend.create_file(path))
    }

    /// Deletes a target, with the transient retry.
    ///
    /// # Errors
    ///
    /// Propagates the backend failure after the retry.
    pub fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.with_retry(|backend| backend.delete(path))
    }

    /// Releases the backend connection.
    pub fn close(&self) {
        self.backend.close();
    }

    fn with_retry<T>(
        &self,
        op: impl Fn(&dyn Storage) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        match op(self.backend.as_ref()) {
            Err(err) if err.is_transient() => {
                debug!(location = %self.location, error = %err, "transient storage failure, reconnecting");
                self.backend.close();
                self.backend
                    .open(&self.location, self.password.as_deref())?;
                op(self.backend.as_ref())
            }
            result => result,
        }
    }
}

impl std::fmt::Debug for StorageSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSession")
            .field("location", &self.location)
            .field("reentrant", &self.backend.is_reentrant())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::MemoryStorage;

    #[test]
    fn test_open_requires_password_when_backend_demands_one() {
        let backend = Arc::new(MemoryStorage::new().with_password("secret"));
        let err = StorageSession::open(backend.clone(), "mem:", None).unwrap_err();
        assert!(matches!(err, StorageError::PasswordRequired { .. }));

        let session =
            StorageSession::open(backend, "mem:", Some("secret".to_string())).unwrap();
        assert_eq!(session.location(), "mem:");
    }

    #[test]
    fn test_wrong_password_is_authentication_failure() {
        let backend = Arc::new(MemoryStorage::new().with_password("secret"));
        let err =
            StorageSession::open(backend, "mem:", Some("wrong".to_string())).unwrap_err();
        assert!(matches!(err, StorageError::AuthenticationFailed { .. }));
    }

    #[test]
    fn test_transient_failure_retried_once() {
        let backend = Arc::new(MemoryStorage::new());
        let session = StorageSession::open(backend.clone(), "mem:", None).unwrap();

        backend.fail_next(StorageError::Transient {
            message: "connection reset".to_string(),
        });
        let stamp = session.last_modified("/index.html").unwrap();
        assert!(stamp.is_absent());
        assert_eq!(backend.reconnects(), 1);
    }

    #[test]
    fn test_second_transient_failure_propagates() {
        let backend = Arc::new(MemoryStorage::new());
        let session = StorageSession::open(backend.clone(), "mem:", None).unwrap();

        backend.fail_next(StorageError::Transient {
            message: "reset".to_string(),
        });
        backend.fail_next(StorageError::Transient {
            message: "reset again".to_string(),
        });
        let err = session.last_modified("/index.html").unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let backend = Arc::new(MemoryStorage::new());
        let session = StorageSession::open(backend.clone(), "mem:", None).unwrap();

        backend.fail_next(StorageError::Backend {
            message: "corrupt".to_string(),
        });
        assert!(session.last_modified("/index.html").is_err());
        assert_eq!(backend.reconnects(), 0);
    }

    #[test]
    fn test_commit_publishes_and_discard_does_not() {
        let backend = Arc::new(MemoryStorage::new());
        let session = StorageSession::open(backend.clone(), "mem:", None).unwrap();

        let mut write = session.create_file("/a.txt").unwrap();
        write.write_all(b"hello").unwrap();
        assert!(backend.read("/a.txt").is_none());
        write.commit().unwrap();
        assert_eq!(backend.read("/a.txt").unwrap(), b"hello");

        let mut write = session.create_file("/b.txt").unwrap();
        write.write_all(b"nope").unwrap();
        write.discard();
        assert!(backend.read("/b.txt").is_none());
    }
}
