//! Site compilation and build pass execution.
//!
//! [`ProjectContext`] carries the cross-cutting state every stage can
//! reach: properties, the parser, the metadata cache, and the part and
//! output tables. [`Site`] owns the compiled entry list and drives build
//! passes over it.

mod context;
mod site;

#[cfg(test)]
mod integration_tests;

pub use context::ProjectContext;
pub use site::{PassSummary, Site, SiteEnv};
