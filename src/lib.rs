//! Deferred XLink resolution for CityGML bulk imports.
//!
//! The forward import pass writes every cross-reference it cannot resolve yet
//! into a staging table. [`splitter::ReferenceSplitter`] drains those queues in
//! dependency order once all features are in the store.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod geometry;
pub mod models;
pub mod pool;
pub mod resolver;
pub mod splitter;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use error::{Result, XlinkError};
pub use splitter::{ReferenceSplitter, RunResult, RunStatus};
