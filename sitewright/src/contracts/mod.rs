//! Host integration contracts.
//!
//! The engine never touches the outside world directly. Hosts provide a
//! [`Storage`] for the built site, a [`SourceTree`] for source documents, and
//! a [`MetadataCache`] for incremental-build bookkeeping; everything else is
//! derived from those three seams.

mod repository;
mod source;
mod storage;

pub use repository::{JsonFileCache, MemoryMetadataCache, MetadataCache, MetadataKey};
pub use source::{ArtifactSource, EventSource, Source, SourceTree, PART_SCHEME};
pub use storage::{FileStamp, Storage, StorageSession, TargetWrite};
