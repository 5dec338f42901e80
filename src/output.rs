//! Writes the Singer SCHEMA / RECORD / STATE message stream to stdout,
//! one compact JSON object per line.

use std::io::Write;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::catalog::ObjectDescriptor;

pub struct Writer<W: Write> {
    out: W,
}

impl<W: Write> Writer<W> {
    pub fn new(out: W) -> Writer<W> {
        Writer { out }
    }

    fn emit(&mut self, message: Value) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.out, &message)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }

    pub fn schema(&mut self, object: &ObjectDescriptor) -> std::io::Result<()> {
        let mut properties = Map::new();
        for (name, prop) in &object.properties {
            if !prop.is_selected() {
                continue;
            }
            let mut schema = json!({ "type": nullable_type(prop.field_type.json_schema_type(), prop.nullable) });
            if prop.field_type.is_temporal() {
                schema["format"] = json!("date-time");
            }
            properties.insert(name.clone(), schema);
        }

        self.emit(json!({
            "type": "SCHEMA",
            "stream": object.name,
            "key_properties": object.key_properties,
            "schema": {
                "type": "object",
                "properties": properties,
            },
        }))
    }

    pub fn record(
        &mut self,
        stream: &str,
        version: i64,
        fields: Map<String, Value>,
        time_extracted: DateTime<Utc>,
    ) -> std::io::Result<()> {
        self.emit(json!({
            "type": "RECORD",
            "stream": stream,
            "version": version,
            "record": fields,
            "time_extracted": time_extracted.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }))
    }

    pub fn state(&mut self, state: &Value) -> std::io::Result<()> {
        self.emit(json!({
            "type": "STATE",
            "value": state,
        }))
    }
}

fn nullable_type(base: &str, nullable: bool) -> Value {
    if nullable {
        json!([base, "null"])
    } else {
        json!(base)
    }
}
