//! The catalog data model: object descriptors, their field metadata, and
//! the selection rules that decide which fields are queried and emitted.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The first of these present on an object's fields wins as the
/// replication key, in priority order.
pub const REPLICATION_KEY_CANDIDATES: &[&str] = &["UpdatedDate", "TransactionDate", "UpdatedOn"];

/// Field names that are always present, always required, and always
/// automatically included regardless of upstream metadata.
pub const REQUIRED_KEYS: &[&str] = &["Id", "UpdatedDate", "TransactionDate", "UpdatedOn"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Date,
    Datetime,
}

impl FieldType {
    /// Maps a raw Zuora `describe` field type to our internal type, per the
    /// fixed dictionary: unmapped types return `None` (caller marks the
    /// field `Unsupported` but keeps it in the schema as an opaque string).
    pub fn from_raw(raw: &str) -> Option<FieldType> {
        match raw {
            "picklist" | "text" => Some(FieldType::String),
            "boolean" => Some(FieldType::Boolean),
            "integer" => Some(FieldType::Integer),
            "decimal" => Some(FieldType::Number),
            "date" => Some(FieldType::Date),
            "datetime" => Some(FieldType::Datetime),
            _ => None,
        }
    }

    /// The JSON-schema primitive type this field surfaces as externally.
    /// `date`/`datetime` surface as `string` with `format: date-time`.
    pub fn json_schema_type(&self) -> &'static str {
        match self {
            FieldType::String | FieldType::Date | FieldType::Datetime => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
        }
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, FieldType::Date | FieldType::Datetime)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Inclusion {
    Automatic,
    Available,
    Unsupported,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Property {
    pub field_type: FieldType,
    pub nullable: bool,
    pub inclusion: Inclusion,
    /// Set when this field was contributed by a `<related-objects>` entry:
    /// the name of the parent object it was joined from (e.g. `Account`
    /// for a field named `AccountId`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_parent: Option<String>,
}

impl Property {
    pub fn is_selected(&self) -> bool {
        !matches!(self.inclusion, Inclusion::Unsupported)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub enum ReplicationMethod {
    #[serde(rename = "INCREMENTAL")]
    Incremental,
    #[serde(rename = "FULL_TABLE")]
    FullTable,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ObjectDescriptor {
    pub name: String,
    pub properties: BTreeMap<String, Property>,
    pub key_properties: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_key: Option<String>,
    pub replication_method: ReplicationMethod,
    pub supports_deleted: bool,
}

impl ObjectDescriptor {
    pub fn is_incremental(&self) -> bool {
        matches!(self.replication_method, ReplicationMethod::Incremental)
    }

    /// Field names that should be projected into the export query: every
    /// selected, non-`Deleted` field. `Deleted` is always carried as a
    /// side-channel declaration on the driver payload, never as a queried
    /// column (see `drivers::batch`).
    pub fn selected_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self
            .properties
            .iter()
            .filter(|(name, prop)| prop.is_selected() && name.as_str() != "Deleted")
            .map(|(name, _)| name.clone())
            .collect();
        fields.sort();
        fields
    }

    /// Renders the selected fields as the dotted names the ZOQL query
    /// expects for joined-object columns (`Account.Id` rather than
    /// `AccountId`).
    pub fn joined_field_names(&self) -> Vec<String> {
        self.selected_fields()
            .into_iter()
            .map(|field_name| match self.properties[&field_name].joined_parent.as_ref() {
                Some(parent) => format!("{}.{}", parent, field_name.replacen(parent, "", 1)),
                None => field_name,
            })
            .collect()
    }

    pub fn select_query_fields(&self) -> String {
        self.joined_field_names().join(", ")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Catalog {
    pub streams: Vec<ObjectDescriptor>,
}

impl Catalog {
    pub fn find(&self, name: &str) -> Option<&ObjectDescriptor> {
        self.streams.iter().find(|s| s.name == name)
    }
}

/// Picks the first replication-key candidate present among `field_names`,
/// in priority order.
pub fn choose_replication_key<'a>(field_names: impl IntoIterator<Item = &'a String>) -> Option<String> {
    let present: Vec<&String> = field_names.into_iter().collect();
    REPLICATION_KEY_CANDIDATES
        .iter()
        .find(|candidate| present.iter().any(|f| f.as_str() == **candidate))
        .map(|s| s.to_string())
}
