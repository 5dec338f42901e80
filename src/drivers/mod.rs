//! The two interchangeable export-protocol drivers (`batch` / AQuA and
//! `sync` / REST) share this capability set. Grounded on the teacher's
//! `connector-protocol` crate, which expresses a connector's capability
//! surface as a plain trait rather than an inheritance hierarchy.

pub mod batch;
pub mod sync;

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::catalog::ObjectDescriptor;
use crate::error::ExportError;

/// The time bound a job should cover, expressed uniformly across both
/// drivers even though each projects it into a different wire shape
/// (AQuA's `incrementalTime` vs REST's `where` clause bounds).
#[derive(Debug, Clone)]
pub enum JobWindow {
    /// Full-table object: no replication key, no bound.
    FullTable,
    /// AQuA: everything from `bookmark` forward; the driver's own
    /// adaptive `current_window_end` cursor (if any) narrows this.
    Since {
        bookmark: DateTime<Utc>,
        window_end: Option<DateTime<Utc>>,
    },
    /// REST: a fixed `[start, end)` range.
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct JobRequest<'a> {
    pub object: &'a ObjectDescriptor,
    pub window: JobWindow,
    /// The per-object session label (`state.bookmarks[object].version`);
    /// only AQuA uses it to build the project name, but it's threaded
    /// through uniformly so callers don't special-case drivers.
    pub version: i64,
    pub partner_id: String,
    /// Whether the caller has selected `Deleted` for this object; only
    /// meaningful for AQuA, which can request the deleted-column
    /// extension.
    pub want_deleted: bool,
}

/// The outcome of polling a job once.
#[derive(Debug, Clone)]
pub enum JobStatus {
    Pending,
    Ready(Vec<String>),
}

pub type LineStream = Pin<Box<dyn Stream<Item = Result<String, ExportError>> + Send>>;

#[async_trait]
pub trait ExportDriver: Send + Sync {
    async fn create_job(&self, req: &JobRequest<'_>) -> Result<String, ExportError>;

    async fn job_ready(&self, job_id: &str) -> Result<JobStatus, ExportError>;

    async fn stream_file(&self, file_id: &str) -> Result<LineStream, ExportError>;

    /// Submits a small `limit 1` job for `object_name` purely to probe
    /// whether the object is exportable, and whether deleted-record
    /// tracking is available for it. Discovery-only; never used on the
    /// data path.
    async fn probe(&self, object_name: &str, partner_id: &str) -> Result<ProbeOutcome, ExportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Unavailable,
    Available,
    AvailableWithDeleted,
}
