//! The REST ("sync") driver: a time-boxed export job per `[start, end)`
//! window, submitted through `v1/object-query/` rather than AQuA.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::ExportError;
use crate::transport::Transport;

use super::{ExportDriver, JobRequest, JobStatus, JobWindow, LineStream, ProbeOutcome};

/// REST date-bound format for `where` clause literals; pinned in
/// SPEC_FULL.md rather than left to chrono's default RFC 3339 rendering,
/// since Zuora's REST query parser rejects offsets and fractional
/// seconds.
const WHERE_CLAUSE_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Serialize)]
struct RestPayload {
    format: &'static str,
    query: String,
}

fn where_clause(object: &crate::catalog::ObjectDescriptor, window: &JobWindow) -> Option<String> {
    let rk = object.replication_key.as_ref()?;
    match window {
        JobWindow::Range { start, end } => Some(format!(
            "{} >= '{}' and {} < '{}'",
            rk,
            start.format(WHERE_CLAUSE_DATE_FORMAT),
            rk,
            end.format(WHERE_CLAUSE_DATE_FORMAT),
        )),
        JobWindow::Since { bookmark, window_end: Some(end) } => Some(format!(
            "{} >= '{}' and {} < '{}'",
            rk,
            bookmark.format(WHERE_CLAUSE_DATE_FORMAT),
            rk,
            end.format(WHERE_CLAUSE_DATE_FORMAT),
        )),
        JobWindow::Since { bookmark, window_end: None } => {
            Some(format!("{} >= '{}'", rk, bookmark.format(WHERE_CLAUSE_DATE_FORMAT)))
        }
        JobWindow::FullTable => None,
    }
}

fn build_query(object: &crate::catalog::ObjectDescriptor, window: &JobWindow) -> String {
    let fields = object.select_query_fields();
    let mut query = format!("select {fields} from {}", object.name);
    if let Some(clause) = where_clause(object, window) {
        query.push_str(" where ");
        query.push_str(&clause);
    }
    query
}

pub struct SyncDriver {
    transport: Arc<Transport>,
}

impl SyncDriver {
    pub fn new(transport: Arc<Transport>) -> SyncDriver {
        SyncDriver { transport }
    }
}

#[async_trait]
impl ExportDriver for SyncDriver {
    async fn create_job(&self, req: &JobRequest<'_>) -> Result<String, ExportError> {
        let query = build_query(req.object, &req.window);
        let payload = RestPayload { format: "csv", query };

        tracing::info!(object = %req.object.name, query = %payload.query, "submitting rest export job");
        let resp = self.transport.post("v1/object-query/", &payload).await?;
        let body = resp.json()?;

        if body.get("Success").and_then(Value::as_bool) == Some(false) {
            let message = body["Reasons"][0]["Message"].as_str().unwrap_or("rest export rejected").to_string();
            return Err(ExportError::Failed(message));
        }

        body.get("Id")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .ok_or_else(|| ExportError::Failed("rest export response missing Id".to_string()))
    }

    async fn job_ready(&self, job_id: &str) -> Result<JobStatus, ExportError> {
        let resp = self.transport.get(&format!("v1/object-query/{job_id}")).await?;
        let body = resp.json()?;
        match body.get("Status").and_then(Value::as_str) {
            Some("Completed") => {
                let file_id = body
                    .get("FileId")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ExportError::Failed("rest export completed with no FileId".to_string()))?;
                Ok(JobStatus::Ready(vec![file_id.to_string()]))
            }
            Some("Failed") | Some("Cancelled") => {
                let reason = body.get("StatusReason").and_then(Value::as_str).unwrap_or("export failed").to_string();
                Err(ExportError::Failed(reason))
            }
            _ => Ok(JobStatus::Pending),
        }
    }

    async fn stream_file(&self, file_id: &str) -> Result<LineStream, ExportError> {
        super::batch::stream_lines(&self.transport, &format!("v1/object-query/{file_id}/file"), file_id).await
    }

    async fn probe(&self, object_name: &str, _partner_id: &str) -> Result<ProbeOutcome, ExportError> {
        let query = format!("select Id from {object_name} limit 1");
        let payload = RestPayload { format: "csv", query };
        let resp = self.transport.post_raw("v1/object-query/", &payload).await?;
        let body = resp.json()?;

        if let Some(id) = body.get("Id").and_then(Value::as_str) {
            let _ = self.transport.delete(&format!("v1/object-query/{id}")).await;
        }

        match body.get("Success").and_then(Value::as_bool) {
            Some(false) => Ok(ProbeOutcome::Unavailable),
            _ => Ok(ProbeOutcome::Available),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::{FieldType, Inclusion, ObjectDescriptor, Property, ReplicationMethod};
    use std::collections::BTreeMap;

    fn subscription_object() -> ObjectDescriptor {
        let mut properties = BTreeMap::new();
        properties.insert(
            "Id".to_string(),
            Property {
                field_type: FieldType::String,
                nullable: false,
                inclusion: Inclusion::Automatic,
                joined_parent: None,
            },
        );
        properties.insert(
            "UpdatedDate".to_string(),
            Property {
                field_type: FieldType::Datetime,
                nullable: false,
                inclusion: Inclusion::Automatic,
                joined_parent: None,
            },
        );
        ObjectDescriptor {
            name: "Subscription".to_string(),
            properties,
            key_properties: vec!["Id".to_string()],
            replication_key: Some("UpdatedDate".to_string()),
            replication_method: ReplicationMethod::Incremental,
            supports_deleted: false,
        }
    }

    #[test]
    fn range_window_bounds_both_sides() {
        let object = subscription_object();
        let window = JobWindow::Range {
            start: "2024-01-01T00:00:00Z".parse().unwrap(),
            end: "2024-01-02T00:00:00Z".parse().unwrap(),
        };
        let query = build_query(&object, &window);
        assert!(query.contains("UpdatedDate >= '2024-01-01T00:00:00Z'"));
        assert!(query.contains("UpdatedDate < '2024-01-02T00:00:00Z'"));
    }

    #[test]
    fn open_ended_since_window_has_no_upper_bound() {
        let object = subscription_object();
        let window = JobWindow::Since {
            bookmark: "2024-01-01T00:00:00Z".parse().unwrap(),
            window_end: None,
        };
        let query = build_query(&object, &window);
        assert!(query.contains(">="));
        assert!(!query.contains('<'));
    }

    #[test]
    fn full_table_has_no_where_clause() {
        let mut object = subscription_object();
        object.replication_key = None;
        object.replication_method = ReplicationMethod::FullTable;
        let query = build_query(&object, &JobWindow::FullTable);
        assert!(!query.contains("where"));
    }
}
