//! # Sitewright
//!
//! An incremental site-build engine. A manifest declares the artifacts a
//! site is made of, each artifact carries a chain of nested stages, and a
//! build pass walks the declarations and rebuilds exactly the artifacts
//! whose inputs changed since they were last written.
//!
//! The crate is organized around a few core ideas:
//!
//! - **Manifests**: declarative descriptions of artifacts, parts, outputs,
//!   deletions, and properties, with `*` wildcards expanded against the
//!   source tree
//! - **Stages**: byte and event processors compiled from declarations
//!   through a registry and linked into per-artifact chains
//! - **Contracts**: the storage, source-tree, and metadata traits a host
//!   implements to plug the engine into its environment
//! - **Sites**: a compiled manifest plus its storage connection, driven one
//!   pass at a time with per-pass summaries
//! - **Events**: the structured document stream that flows between event
//!   stages and out through serializer sinks
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use sitewright::prelude::*;
//! use sitewright::testing::mocks::{LineParser, MemorySourceTree, MemoryStorage};
//!
//! let source = Arc::new(MemorySourceTree::new());
//! source.add_file("/src/index.txt", b"+page\nhello\n-page\n");
//!
//! let manifest = Manifest::new().with_file(
//!     FileDecl::new("/index.html")
//!         .with_source("/src/index.txt")
//!         .with_stage(StageDecl::new(StageCategory::Source)),
//! );
//!
//! let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
//! let env = SiteEnv::new(storage, "memory:site", source)
//!     .with_parser(Arc::new(LineParser::new()));
//!
//! let site = Site::compile(&manifest, env)?;
//! let summary = site.build_pass(false)?;
//! assert!(summary.is_success());
//! ```
//!
//! Hosts that persist to real backends implement [`contracts::Storage`] and
//! [`contracts::SourceTree`]; the in-memory versions above live in
//! [`testing::mocks`] and exist for tests and examples.

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

mod bridge;

pub mod build;
pub mod chain;
pub mod contracts;
pub mod errors;
pub mod event;
pub mod manifest;
pub mod project;
pub mod stage;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::build::{ArtifactBuilder, BuildReport, DetachedScope};
    pub use crate::chain::{
        Chain, ChainCompiler, OutputChain, Part, StageRegistry, StageRegistryBuilder,
    };
    pub use crate::contracts::{
        ArtifactSource, FileStamp, MetadataCache, MetadataKey, Source, SourceTree,
        Storage, StorageSession, TargetWrite,
    };
    pub use crate::errors::{
        BuildError, BuildPassError, CacheError, ConfigError, ErrorClass,
        SourceLocation, StaleError, StorageError,
    };
    pub use crate::event::{Event, EventParser, EventSink};
    pub use crate::manifest::{
        DeleteDecl, FileDecl, Manifest, ManifestEntry, OutputDecl, PartDecl,
        PropertyDecl, StageCategory, StageDecl, UrlPattern,
    };
    pub use crate::project::{PassSummary, ProjectContext, Site, SiteEnv};
    pub use crate::stage::{
        ByteStage, EventStage, StageCore, StageHandle, StageParams, StageSetup,
        StreamKind, TargetScope,
    };
}
