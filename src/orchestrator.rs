//! Drives a full sync: walks the selected catalog streams in their
//! declared order, resuming mid-catalog from `state.current_stream`, and
//! for each stream runs one or more export jobs, shrinking the query
//! window whenever a job times out rather than giving up outright.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use serde_json::Value;

use crate::catalog::{Catalog, ObjectDescriptor};
use crate::csv_stream::{decode_records, RowSchema};
use crate::drivers::{ExportDriver, JobRequest, JobStatus, JobWindow};
use crate::error::{ExportError, TapError};
use crate::output::Writer;
use crate::state::State;

/// Matches Zuora's documented AQuA job ceiling; a job still running past
/// this is presumed stuck rather than merely slow.
const DEFAULT_JOB_TIMEOUT: StdDuration = StdDuration::from_secs(12 * 60 * 60);
const POLL_INTERVAL: StdDuration = StdDuration::from_secs(30);

/// The sync driver's default window before any timeout has forced a
/// smaller one.
const DEFAULT_WINDOW_LENGTH_SECS: i64 = 30 * 24 * 60 * 60;

pub struct Orchestrator<W: Write> {
    driver: Arc<dyn ExportDriver>,
    /// True when `driver` is the AQuA/batch driver; the two drivers
    /// persist and halve their adaptive window under different state
    /// keys (`current_window_end` vs `window_length`), so the
    /// orchestrator needs to know which bookkeeping applies.
    is_batch: bool,
    partner_id: String,
    start_date: DateTime<Utc>,
    state: State,
    writer: Writer<W>,
}

impl<W: Write> Orchestrator<W> {
    pub fn new(
        driver: Arc<dyn ExportDriver>,
        is_batch: bool,
        partner_id: String,
        start_date: DateTime<Utc>,
        state: State,
        out: W,
    ) -> Orchestrator<W> {
        Orchestrator {
            driver,
            is_batch,
            partner_id,
            start_date,
            state,
            writer: Writer::new(out),
        }
    }

    pub fn into_state(self) -> State {
        self.state
    }

    pub async fn run(&mut self, catalog: &Catalog) -> Result<(), TapError> {
        self.state.initialize_for_catalog(catalog, self.start_date);

        let start_index = match self.state.current_stream() {
            Some(resume_at) => catalog.streams.iter().position(|s| s.name == resume_at).unwrap_or(0),
            None => 0,
        };

        for object in &catalog.streams[start_index..] {
            self.state.set_current_stream(Some(&object.name));
            self.emit_state()?;
            self.writer.schema(object).map_err(TapError::Io)?;

            match self.sync_object(object).await {
                Ok(()) => {
                    self.state.clear_transient(&object.name);
                }
                Err(err) if is_recoverable(&err) => {
                    tracing::error!(object = %object.name, %err, "stream sync failed, continuing to next stream");
                }
                Err(err) => return Err(err),
            }

            self.emit_state()?;
        }

        self.state.set_current_stream(None);
        self.emit_state()?;
        Ok(())
    }

    async fn sync_object(&mut self, object: &ObjectDescriptor) -> Result<(), TapError> {
        if object.is_incremental() {
            if self.is_batch {
                self.sync_incremental_batch(object).await
            } else {
                self.sync_incremental_sync(object).await
            }
        } else {
            self.sync_full_table(object).await
        }
    }

    async fn sync_full_table(&mut self, object: &ObjectDescriptor) -> Result<(), TapError> {
        if !self.state.file_ids(&object.name).is_empty() {
            return self
                .process_existing_files(object, self.state.version(&object.name))
                .await
                .map_err(|e| self.handle_object_error(object, e));
        }

        let version = self.state.version(&object.name);
        let req = JobRequest {
            object,
            window: JobWindow::FullTable,
            version,
            partner_id: self.partner_id.clone(),
            want_deleted: object.supports_deleted,
        };
        self.run_job(object, &req).await.map_err(|e| self.handle_object_error(object, e))
    }

    /// AQuA: one job per invocation normally covers everything from the
    /// bookmark forward (no upper bound); a timeout narrows it via
    /// `current_window_end`, which is re-widened back to "everything"
    /// once a window succeeds.
    async fn sync_incremental_batch(&mut self, object: &ObjectDescriptor) -> Result<(), TapError> {
        let rk = object.replication_key.clone().expect("incremental object has a replication key");

        loop {
            if !self.state.file_ids(&object.name).is_empty() {
                self.process_existing_files(object, self.state.version(&object.name))
                    .await
                    .map_err(|e| self.handle_object_error(object, e))?;
                if let Some(end) = self.state.window_end(&object.name) {
                    self.state.set_bookmark(&object.name, &rk, end);
                    self.state.clear_window_end(&object.name);
                    self.emit_state()?;
                }
                continue;
            }

            let bookmark = self.state.bookmark(&object.name, &rk).unwrap_or(self.start_date);
            let now = Utc::now();
            if bookmark >= now {
                break;
            }

            let window_end = self.state.window_end(&object.name);
            let version = self.state.version(&object.name);
            let req = JobRequest {
                object,
                window: JobWindow::Since { bookmark, window_end },
                version,
                partner_id: self.partner_id.clone(),
                want_deleted: object.supports_deleted,
            };

            match self.run_job(object, &req).await {
                Ok(()) => {
                    // A halved `current_window_end` only ever bounds the
                    // query; on a genuine completion it becomes the new
                    // bookmark even for an empty window. With no window
                    // (the common, unbounded case) `process_existing_files`
                    // already advanced the bookmark to the max row value
                    // seen; `now` is merely when polling *started* and must
                    // not clobber it.
                    if let Some(end) = window_end {
                        self.state.set_bookmark(&object.name, &rk, end);
                        self.state.clear_window_end(&object.name);
                        self.emit_state()?;
                    } else {
                        self.emit_state()?;
                        break;
                    }
                }
                Err(ExportError::TimedOut(_)) => {
                    let previous_end = window_end.unwrap_or(now);
                    let half_end = previous_end - halve(previous_end - bookmark);
                    if half_end <= bookmark {
                        return Err(TapError::Export(ExportError::TooLarge {
                            replication_key: rk,
                            window_start: bookmark.to_rfc3339(),
                        }));
                    }
                    self.state.set_window_end(&object.name, half_end);
                    self.emit_state()?;
                    tracing::warn!(object = %object.name, %half_end, "export timed out, halved query window");
                }
                Err(err) => return Err(self.handle_object_error(object, err)),
            }
        }

        Ok(())
    }

    /// REST: one job per fixed-width `[start, start+window_length)` time
    /// window, walked forward until the window reaches the sync-start
    /// moment.
    async fn sync_incremental_sync(&mut self, object: &ObjectDescriptor) -> Result<(), TapError> {
        let rk = object.replication_key.clone().expect("incremental object has a replication key");
        let sync_start = Utc::now();

        loop {
            if !self.state.file_ids(&object.name).is_empty() {
                self.process_existing_files(object, self.state.version(&object.name))
                    .await
                    .map_err(|e| self.handle_object_error(object, e))?;
                self.emit_state()?;
                continue;
            }

            let bookmark = self.state.bookmark(&object.name, &rk).unwrap_or(self.start_date);
            if bookmark >= sync_start {
                break;
            }

            let window_length = self.state.window_length(&object.name).unwrap_or(DEFAULT_WINDOW_LENGTH_SECS);
            let mut window_end = bookmark + Duration::seconds(window_length);
            if window_end > sync_start {
                window_end = sync_start;
            }

            let version = self.state.version(&object.name);
            let req = JobRequest {
                object,
                window: JobWindow::Range { start: bookmark, end: window_end },
                version,
                partner_id: self.partner_id.clone(),
                want_deleted: false,
            };

            match self.run_job(object, &req).await {
                Ok(()) => {
                    self.state.set_bookmark(&object.name, &rk, window_end);
                    self.state.clear_window_length(&object.name);
                    self.emit_state()?;
                }
                Err(ExportError::TimedOut(_)) => {
                    let halved = window_length / 2;
                    if halved == 0 {
                        return Err(TapError::Export(ExportError::TooLarge {
                            replication_key: rk,
                            window_start: bookmark.to_rfc3339(),
                        }));
                    }
                    self.state.set_window_length(&object.name, halved);
                    self.emit_state()?;
                    tracing::warn!(object = %object.name, halved, "export timed out, halved window length");
                }
                Err(err) => return Err(self.handle_object_error(object, err)),
            }
        }

        Ok(())
    }

    /// Submits one job and polls it to completion, capturing the file ids
    /// it produces, then hands off to `process_existing_files`.
    async fn run_job(&mut self, object: &ObjectDescriptor, req: &JobRequest<'_>) -> Result<(), ExportError> {
        let job_id = self.driver.create_job(req).await?;
        let file_ids = self.poll_until_ready(&job_id).await?;
        self.state.set_file_ids(&object.name, file_ids);
        self.writer
            .state(&self.state.to_value())
            .map_err(|e| ExportError::Failed(format!("writing state: {e}")))?;
        self.process_existing_files(object, req.version).await
    }

    /// Consumes whatever file ids are currently persisted for `object`,
    /// one at a time: streams, decodes, filters, and emits each file's
    /// rows, advancing the bookmark and popping the file id as each file
    /// completes, so a kill mid-list resumes from the next unconsumed id.
    async fn process_existing_files(&mut self, object: &ObjectDescriptor, version: i64) -> Result<(), ExportError> {
        let schema = RowSchema::for_object(object, object.supports_deleted);

        loop {
            let file_id = match self.state.file_ids(&object.name).first() {
                Some(id) => id.clone(),
                None => break,
            };

            let bookmark_before = object
                .replication_key
                .as_ref()
                .and_then(|rk| self.state.bookmark(&object.name, rk));

            let lines = self.driver.stream_file(&file_id).await?;
            let mut records = Box::pin(decode_records(schema.clone(), file_id.clone(), lines));
            let time_extracted = Utc::now();

            let mut max_seen: Option<DateTime<Utc>> = None;
            let mut saw_deleted = false;
            while let Some(record) = records.next().await {
                let record = record?;

                if record.get("Deleted").and_then(Value::as_bool) == Some(true) {
                    saw_deleted = true;
                }

                if let Some(rk) = &object.replication_key {
                    let rk_value = record.get(rk).and_then(Value::as_str).and_then(|s| s.parse::<DateTime<Utc>>().ok());
                    let Some(value) = rk_value else {
                        // Null replication-key: not emittable as an incremental row.
                        continue;
                    };
                    if let Some(bookmark) = bookmark_before {
                        if value <= bookmark {
                            // Already emitted (or exactly at the frontier); drop.
                            continue;
                        }
                    }
                    if max_seen.map_or(true, |m| value > m) {
                        max_seen = Some(value);
                    }
                }

                self.writer
                    .record(&object.name, version, record, time_extracted)
                    .map_err(|e| ExportError::Failed(format!("writing record: {e}")))?;
            }

            if saw_deleted {
                // Deletion tracking is only as reliable as the documented
                // limitation in SPEC_FULL.md §9: whether AQuA ever actually
                // enables it alongside the mandatory `incrementalTime` is
                // unconfirmed upstream, so this is observability only.
                tracing::debug!(object = %object.name, file_id = %file_id, "file contained one or more Deleted=true rows");
            }

            if let (Some(rk), Some(value)) = (&object.replication_key, max_seen) {
                self.state.set_bookmark(&object.name, rk, value);
            }
            self.state.pop_file_id(&object.name, &file_id);
            self.writer
                .state(&self.state.to_value())
                .map_err(|e| ExportError::Failed(format!("writing state: {e}")))?;
        }

        Ok(())
    }

    async fn poll_until_ready(&self, job_id: &str) -> Result<Vec<String>, ExportError> {
        let deadline = tokio::time::Instant::now() + DEFAULT_JOB_TIMEOUT;
        loop {
            match self.driver.job_ready(job_id).await? {
                JobStatus::Ready(file_ids) => return Ok(file_ids),
                JobStatus::Pending => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ExportError::TimedOut(DEFAULT_JOB_TIMEOUT));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Applies the state-side effects of a terminal per-object error
    /// (clear `file_ids`, optionally bump `version`) and turns it into
    /// the `TapError` that aborts this object's sync while letting the
    /// run continue to the next catalog entry.
    fn handle_object_error(&mut self, object: &ObjectDescriptor, err: ExportError) -> TapError {
        match &err {
            ExportError::FileDeletedMidSync(_) => {
                // Do not advance the bookmark: the window is recomputed
                // from the still-untouched frontier on the next run.
                self.state.set_file_ids(&object.name, Vec::new());
            }
            ExportError::CorruptExport { .. } => {
                self.state.bump_version(&object.name);
            }
            _ => {}
        }
        if let Err(io_err) = self.writer.state(&self.state.to_value()) {
            tracing::error!(object = %object.name, %io_err, "failed to flush state after object error");
        }
        TapError::Export(err)
    }

    fn emit_state(&mut self) -> Result<(), TapError> {
        self.writer.state(&self.state.to_value()).map_err(TapError::Io)
    }
}

/// Halves a `chrono::Duration`, matching the spec's integer-division
/// halving for both AQuA's `current_window_end` and REST's
/// `window_length`.
fn halve(d: Duration) -> Duration {
    let micros = d.num_microseconds().unwrap_or_else(|| d.num_milliseconds().saturating_mul(1_000));
    Duration::microseconds(micros / 2)
}

/// Anything that failed for a reason local to one stream (bad query,
/// export timeout even after halving, a corrupt file, a deleted export)
/// should not abort the whole sync; a rejected-credentials or I/O
/// failure should.
fn is_recoverable(err: &TapError) -> bool {
    matches!(err, TapError::Export(_))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn export_errors_are_recoverable_transport_errors_are_not() {
        assert!(is_recoverable(&TapError::Export(ExportError::Failed("x".to_string()))));
        assert!(!is_recoverable(&TapError::Transport(crate::error::TransportError::BadCredentials)));
    }

    #[test]
    fn halving_a_duration_rounds_down() {
        assert_eq!(halve(Duration::seconds(10)), Duration::seconds(5));
        assert_eq!(halve(Duration::seconds(1)), Duration::milliseconds(500));
    }

    #[test]
    fn halving_converges_to_zero_rather_than_looping_forever() {
        let mut d = Duration::seconds(1);
        for _ in 0..80 {
            d = halve(d);
        }
        assert_eq!(d, Duration::zero());
    }
}
