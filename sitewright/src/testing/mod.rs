//! Test doubles for the host contracts.
//!
//! Engine tests run against [`mocks::MemoryStorage`], an in-memory
//! [`mocks::MemorySourceTree`] with local-disk backing for wildcard
//! listing, and the line-oriented [`mocks::LineParser`]. Hosts writing
//! their own stages can reuse the same doubles.

pub mod mocks;
