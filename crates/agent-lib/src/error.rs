//! Typed error kinds for collector components, per the recovery policy each
//! sub-collector must honor: `NoData` and `Transient` are local-scrape,
//! non-fatal; `Fatal` aborts startup.

use thiserror::Error;

/// Error returned by a sub-collector from a single scrape.
///
/// The coordinator never aborts a scrape because of one sub-collector's
/// failure; it downgrades `Transient`/`NoData` to a logged skip and surfaces
/// `Fatal` only when it originates at startup.
#[derive(Debug, Error)]
pub enum CollectError {
    /// The data source was absent for this scrape (e.g. cgroup mount not
    /// present). The caller should suppress emission, not fail the scrape.
    #[error("no data: {0}")]
    NoData(String),

    /// A single read raced a process exit or a transient subprocess
    /// failure. Log at debug/warn and skip just that item.
    #[error("transient I/O: {0}")]
    Transient(#[source] anyhow::Error),

    /// Capability acquisition or a kernel precondition failed for the
    /// operation in progress; fatal to that operation, not the process.
    #[error("security context: {0}")]
    Security(String),

    /// A kernel capability constraint the process cannot satisfy at
    /// runtime (e.g. `perf_event_paranoid`); fatal at startup.
    #[error("kernel capability unmet: {0}")]
    KernelCapability(String),
}

impl CollectError {
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, CollectError::KernelCapability(_))
    }
}

pub type Result<T> = std::result::Result<T, CollectError>;
