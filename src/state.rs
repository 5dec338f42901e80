//! Resumable sync state: per-stream bookmarks plus the `current_stream`
//! marker that lets a killed process resume mid-catalog instead of
//! restarting from the first selected stream.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::catalog::Catalog;

/// The replication-key value lives under its own field name (e.g.
/// `UpdatedDate`) rather than a fixed key, matching the external state
/// document's shape; a `BTreeMap` with (at most) one entry gets that for
/// free via `#[serde(flatten)]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamBookmark {
    /// Bumped whenever this stream's export turns out non-rectangular or
    /// otherwise corrupt, so a downstream consumer knows to discard
    /// whatever it already buffered under the old version.
    #[serde(default)]
    pub version: i64,
    /// AQuA/REST file ids already fetched for the in-progress job, so a
    /// restart after a partial multi-file export resumes instead of
    /// re-downloading files it already emitted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<String>,
    /// Batch-mode adaptive window cursor, set only while a timeout is
    /// forcing a narrower query than "everything since the bookmark".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_window_end: Option<DateTime<Utc>>,
    /// Sync-mode adaptive window length in seconds, set only while a
    /// timeout is forcing a narrower window than the 30-day default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_length: Option<i64>,
    #[serde(flatten)]
    pub replication_key: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stream: Option<String>,
    #[serde(default)]
    pub bookmarks: BTreeMap<String, StreamBookmark>,
}

impl State {
    /// Parses a state file, transparently migrating the legacy flat shape
    /// (`{"<Stream>": {"UpdatedDate": "..."}}`, no `bookmarks` wrapper and
    /// no per-stream `version`) into the current two-level shape.
    pub fn parse(raw: &Value) -> State {
        if raw.get("bookmarks").is_some() || raw.get("current_stream").is_some() {
            serde_json::from_value(raw.clone()).unwrap_or_default()
        } else {
            Self::from_legacy(raw)
        }
    }

    fn from_legacy(raw: &Value) -> State {
        let mut bookmarks = BTreeMap::new();
        if let Some(map) = raw.as_object() {
            for (stream, value) in map {
                let mut replication_key = BTreeMap::new();
                if let Some(obj) = value.as_object() {
                    for (field, v) in obj {
                        if let Some(s) = v.as_str() {
                            replication_key.insert(field.clone(), s.to_string());
                        }
                    }
                }
                bookmarks.insert(
                    stream.clone(),
                    StreamBookmark {
                        version: 0,
                        file_ids: Vec::new(),
                        current_window_end: None,
                        window_length: None,
                        replication_key,
                    },
                );
            }
        }
        State {
            current_stream: None,
            bookmarks,
        }
    }

    /// For each selected stream without a bookmark yet, seeds one:
    /// `{version: now_seconds()}` plus, for incremental streams,
    /// `<replication_key>: config.start_date`. Unselected streams are
    /// left untouched; a `current_stream` naming one is cleared, since an
    /// unselected stream can never be "in progress".
    pub fn initialize_for_catalog(&mut self, catalog: &Catalog, start_date: DateTime<Utc>) {
        for object in &catalog.streams {
            if !self.bookmarks.contains_key(&object.name) {
                let mut replication_key = BTreeMap::new();
                if let Some(rk) = &object.replication_key {
                    replication_key.insert(rk.clone(), start_date.to_rfc3339());
                }
                self.bookmarks.insert(
                    object.name.clone(),
                    StreamBookmark {
                        version: now_seconds(),
                        file_ids: Vec::new(),
                        current_window_end: None,
                        window_length: None,
                        replication_key,
                    },
                );
            }
        }

        if let Some(current) = &self.current_stream {
            if catalog.find(current).is_none() {
                self.current_stream = None;
            }
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("State always serializes")
    }

    fn entry(&mut self, stream: &str) -> &mut StreamBookmark {
        self.bookmarks.entry(stream.to_string()).or_insert_with(|| StreamBookmark {
            version: now_seconds(),
            ..Default::default()
        })
    }

    /// Reads the persisted replication-key value for `stream` under its
    /// object's own replication-key field name.
    pub fn bookmark(&self, stream: &str, replication_key: &str) -> Option<DateTime<Utc>> {
        self.bookmarks
            .get(stream)?
            .replication_key
            .get(replication_key)?
            .parse()
            .ok()
    }

    pub fn set_bookmark(&mut self, stream: &str, replication_key: &str, value: DateTime<Utc>) {
        let entry = self.entry(stream);
        entry.replication_key.clear();
        entry.replication_key.insert(replication_key.to_string(), value.to_rfc3339());
    }

    pub fn version(&mut self, stream: &str) -> i64 {
        self.entry(stream).version
    }

    /// Bumping the version invalidates whatever a downstream consumer has
    /// already buffered for this stream under the old version; used when
    /// an export comes back corrupt and must be treated as a fresh start.
    pub fn bump_version(&mut self, stream: &str) -> i64 {
        let entry = self.entry(stream);
        entry.version = now_seconds();
        entry.file_ids.clear();
        entry.version
    }

    pub fn file_ids(&self, stream: &str) -> &[String] {
        self.bookmarks.get(stream).map(|b| b.file_ids.as_slice()).unwrap_or(&[])
    }

    pub fn set_file_ids(&mut self, stream: &str, file_ids: Vec<String>) {
        self.entry(stream).file_ids = file_ids;
    }

    /// Removes one already-consumed file id from the front of the
    /// persisted list, matching the orchestrator's one-file-at-a-time
    /// consumption order.
    pub fn pop_file_id(&mut self, stream: &str, file_id: &str) {
        let entry = self.entry(stream);
        if entry.file_ids.first().map(String::as_str) == Some(file_id) {
            entry.file_ids.remove(0);
        } else {
            entry.file_ids.retain(|id| id != file_id);
        }
    }

    pub fn clear_transient(&mut self, stream: &str) {
        let entry = self.entry(stream);
        entry.file_ids.clear();
        entry.current_window_end = None;
        entry.window_length = None;
    }

    pub fn window_end(&self, stream: &str) -> Option<DateTime<Utc>> {
        self.bookmarks.get(stream).and_then(|b| b.current_window_end)
    }

    pub fn set_window_end(&mut self, stream: &str, value: DateTime<Utc>) {
        self.entry(stream).current_window_end = Some(value);
    }

    pub fn clear_window_end(&mut self, stream: &str) {
        self.entry(stream).current_window_end = None;
    }

    pub fn window_length(&self, stream: &str) -> Option<i64> {
        self.bookmarks.get(stream).and_then(|b| b.window_length)
    }

    pub fn set_window_length(&mut self, stream: &str, value: i64) {
        self.entry(stream).window_length = Some(value);
    }

    pub fn clear_window_length(&mut self, stream: &str) {
        self.entry(stream).window_length = None;
    }

    pub fn current_stream(&self) -> Option<&str> {
        self.current_stream.as_deref()
    }

    pub fn set_current_stream(&mut self, stream: Option<&str>) {
        self.current_stream = stream.map(str::to_string);
    }
}

fn now_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::{FieldType, Inclusion, ObjectDescriptor, Property, ReplicationMethod};
    use serde_json::json;
    use std::collections::BTreeMap as Map;

    fn account_catalog(replication_key: Option<&str>) -> Catalog {
        let mut properties = Map::new();
        properties.insert(
            "Id".to_string(),
            Property {
                field_type: FieldType::String,
                nullable: false,
                inclusion: Inclusion::Automatic,
                joined_parent: None,
            },
        );
        Catalog {
            streams: vec![ObjectDescriptor {
                name: "Account".to_string(),
                properties,
                key_properties: vec!["Id".to_string()],
                replication_key: replication_key.map(str::to_string),
                replication_method: if replication_key.is_some() {
                    ReplicationMethod::Incremental
                } else {
                    ReplicationMethod::FullTable
                },
                supports_deleted: false,
            }],
        }
    }

    #[test]
    fn migrates_legacy_flat_state() {
        let legacy = json!({
            "Account": { "UpdatedDate": "2024-01-01T00:00:00Z" },
        });
        let state = State::parse(&legacy);
        assert_eq!(
            state.bookmark("Account", "UpdatedDate"),
            Some("2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap())
        );
    }

    #[test]
    fn parses_current_shape_with_dynamic_replication_key_field() {
        let current = json!({
            "current_stream": "Subscription",
            "bookmarks": {
                "Subscription": { "version": 3, "UpdatedDate": "2024-02-01T00:00:00Z" },
            },
        });
        let state = State::parse(&current);
        assert_eq!(state.current_stream(), Some("Subscription"));
        assert_eq!(state.bookmarks["Subscription"].version, 3);
        assert_eq!(
            state.bookmark("Subscription", "UpdatedDate"),
            Some("2024-02-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap())
        );
    }

    #[test]
    fn bump_version_clears_file_ids() {
        let mut state = State::default();
        state.set_file_ids("Account", vec!["f1".to_string()]);
        let v0 = state.version("Account");
        let v1 = state.bump_version("Account");
        assert!(v1 >= v0);
        assert!(state.file_ids("Account").is_empty());
    }

    #[test]
    fn initialize_seeds_missing_incremental_bookmark_from_start_date() {
        let catalog = account_catalog(Some("UpdatedDate"));
        let mut state = State::default();
        let start = "2023-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        state.initialize_for_catalog(&catalog, start);
        assert_eq!(state.bookmark("Account", "UpdatedDate"), Some(start));
    }

    #[test]
    fn initialize_leaves_existing_bookmark_untouched() {
        let catalog = account_catalog(Some("UpdatedDate"));
        let mut state = State::default();
        let existing = "2024-06-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        state.set_bookmark("Account", "UpdatedDate", existing);
        state.initialize_for_catalog(&catalog, "2023-01-01T00:00:00Z".parse().unwrap());
        assert_eq!(state.bookmark("Account", "UpdatedDate"), Some(existing));
    }

    #[test]
    fn initialize_clears_current_stream_if_unselected() {
        let catalog = account_catalog(Some("UpdatedDate"));
        let mut state = State::default();
        state.set_current_stream(Some("SomeOtherStream"));
        state.initialize_for_catalog(&catalog, "2023-01-01T00:00:00Z".parse().unwrap());
        assert_eq!(state.current_stream(), None);
    }

    #[test]
    fn pop_file_id_removes_from_front() {
        let mut state = State::default();
        state.set_file_ids("Account", vec!["f1".to_string(), "f2".to_string()]);
        state.pop_file_id("Account", "f1");
        assert_eq!(state.file_ids("Account"), &["f2".to_string()]);
    }

    #[test]
    fn state_round_trips_through_an_on_disk_file() {
        let mut state = State::default();
        state.set_bookmark("Account", "UpdatedDate", "2024-05-01T00:00:00Z".parse().unwrap());
        state.set_current_stream(Some("Account"));

        let mut file = tempfile::NamedTempFile::new().expect("failed to create temp state file");
        serde_json::to_writer(&mut file, &state.to_value()).expect("failed to write state to disk");

        let raw = std::fs::read_to_string(file.path()).expect("failed to read state back from disk");
        let reloaded = State::parse(&serde_json::from_str(&raw).unwrap());

        assert_eq!(reloaded.current_stream(), Some("Account"));
        assert_eq!(
            reloaded.bookmark("Account", "UpdatedDate"),
            Some("2024-05-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap())
        );
    }

    #[test]
    fn clear_transient_removes_window_and_file_state() {
        let mut state = State::default();
        state.set_file_ids("Account", vec!["f1".to_string()]);
        state.set_window_end("Account", "2024-01-01T00:00:00Z".parse().unwrap());
        state.set_window_length("Account", 60);
        state.clear_transient("Account");
        assert!(state.file_ids("Account").is_empty());
        assert_eq!(state.window_end("Account"), None);
        assert_eq!(state.window_length("Account"), None);
    }
}
