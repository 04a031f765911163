//! Offline document cache and reading-progress sync for sheaf.
//!
//! Documents saved for offline use live in a local SQLite store together
//! with their content. Reading positions recorded while the server is
//! unreachable are queued, collapsed to the latest state per document,
//! and replayed once connectivity returns.

pub mod app;
pub mod cache;
pub mod commands;
pub mod config;
pub mod error;
pub mod format;
pub mod remote;
pub mod sync;
