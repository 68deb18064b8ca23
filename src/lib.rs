//! forked library crate.
//!
//! The primary interface is the `forked` binary. The library exposes the
//! resolver, the overlay builder, the sync driver, and the guard engine so
//! that integration tests (and embedding tools) can drive them against any
//! [`forked_git::GitRepo`].

pub mod artifacts;
pub mod config;
pub mod conflict;
pub mod error;
pub mod globs;
pub mod guard;
pub mod overlay;
pub mod provenance;
pub mod selection;
pub mod telemetry;
pub mod trailers;

pub use config::ForkedConfig;
pub use error::ForkedError;
