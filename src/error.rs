use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Failure kinds raised by the data stores.
///
/// Store operations return `anyhow::Result`; these variants travel inside the
/// `anyhow::Error` and can be recovered with `downcast_ref::<StoreError>()`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The persisted file could not be decoded into the expected table.
    #[error("malformed data store {path:?}: {reason}")]
    Structural { path: PathBuf, reason: String },

    /// A dimension was omitted although the store holds more than one entry.
    #[error("ambiguous indexing: {dimension} not specified but the store holds {count} of them")]
    AmbiguousIndex { dimension: &'static str, count: usize },

    #[error("unknown objective: {0}")]
    UnknownObjective(String),

    #[error("unknown solver: {0}")]
    UnknownSolver(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("unknown run: {0}")]
    UnknownRun(u32),

    #[error("unknown extractor: {0}")]
    UnknownExtractor(String),

    #[error("unknown feature {name} in group {group} of extractor {extractor}")]
    UnknownFeature {
        extractor: String,
        group: String,
        name: String,
    },

    /// A value list does not match the dimension it is supposed to fill.
    #[error("dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("timed out after {timeout:?} waiting for lock {path:?}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    /// An external tool exited unsuccessfully or produced no artifact.
    #[error("{tool} failed (stdout: {stdout:?}, stderr: {stderr:?})")]
    ExternalTool {
        tool: String,
        stdout: PathBuf,
        stderr: PathBuf,
    },

    #[error("{0}")]
    Invalid(String),
}
