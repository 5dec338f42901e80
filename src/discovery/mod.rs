//! Builds a `Catalog` by walking Zuora's `describe` metadata endpoints and
//! probing each object through whichever export driver is configured.

pub mod xml;

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::catalog::{choose_replication_key, Catalog, FieldType, Inclusion, ObjectDescriptor, Property, ReplicationMethod, REQUIRED_KEYS};
use crate::drivers::{ExportDriver, ProbeOutcome};
use crate::error::{ExportError, TransportError};
use crate::transport::Transport;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("failed to parse describe XML for {object}: {source}")]
    Xml {
        object: String,
        #[source]
        source: quick_xml::de::DeError,
    },
}

/// Objects whose metadata does exist but that Zuora's describe endpoint
/// never marks exportable in any useful way; kept as a literal deny-list
/// the way `drivers::batch::DOES_NOT_SUPPORT_DELETED` is, rather than
/// threaded through as configuration.
const SKIP_OBJECTS: &[&str] = &["Export", "BatchQuery"];

/// `(object, field)` pairs AQuA can project but the smaller REST/"sync"
/// query interface cannot: large binary document blobs that were never
/// exposed through synchronous export. A data table, like
/// `drivers::batch::DOES_NOT_SUPPORT_DELETED`, so it can be extended
/// without touching discovery logic. See SPEC_FULL.md §4.3/§9.
const SYNC_UNSUPPORTED_FIELDS: &[(&str, &str)] = &[
    ("Invoice", "Body"),
    ("CreditMemo", "Body"),
    ("DebitMemo", "Body"),
];

pub struct Discoverer {
    transport: Arc<Transport>,
    driver: Arc<dyn ExportDriver>,
    partner_id: String,
    /// Whether `driver` is the REST/sync driver; only sync-mode catalogs
    /// apply `SYNC_UNSUPPORTED_FIELDS`.
    is_sync: bool,
}

impl Discoverer {
    pub fn new(transport: Arc<Transport>, driver: Arc<dyn ExportDriver>, partner_id: String, is_sync: bool) -> Discoverer {
        Discoverer {
            transport,
            driver,
            partner_id,
            is_sync,
        }
    }

    pub async fn discover(&self) -> Result<Catalog, DiscoveryError> {
        let listing = self.transport.get("v1/describe").await?;
        let body = listing.text();
        let objects = xml::parse_objects_list(&body).map_err(|source| DiscoveryError::Xml {
            object: "v1/describe".to_string(),
            source,
        })?;

        let mut streams = Vec::new();
        for summary in objects.objects {
            if SKIP_OBJECTS.contains(&summary.name.as_str()) {
                continue;
            }
            if let Some(descriptor) = self.describe_one(&summary.name).await? {
                streams.push(descriptor);
            }
        }
        streams.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Catalog { streams })
    }

    async fn describe_one(&self, object_name: &str) -> Result<Option<ObjectDescriptor>, DiscoveryError> {
        let resp = self.transport.get_raw(&format!("v1/describe/{object_name}")).await?;
        if resp.is_no_such_data_source() {
            tracing::debug!(object = object_name, "no such data source, skipping");
            return Ok(None);
        }
        if !resp.is_success() {
            tracing::warn!(object = object_name, status = resp.status.as_u16(), "describe failed, skipping object");
            return Ok(None);
        }

        let body = resp.text();
        let described = xml::parse_describe_object(&body).map_err(|source| DiscoveryError::Xml {
            object: object_name.to_string(),
            source,
        })?;

        let mut properties: BTreeMap<String, Property> = BTreeMap::new();
        for field in &described.fields.fields {
            if !field.is_exportable() {
                // A required key that isn't exportable makes the whole
                // object un-incrementally-exportable; anything else is
                // just a field we drop from the schema.
                if REQUIRED_KEYS.contains(&field.name.as_str()) {
                    tracing::debug!(
                        object = object_name,
                        field = field.name,
                        "required key lacks export context, dropping whole object"
                    );
                    return Ok(None);
                }
                continue;
            }
            let mut prop = synthesize_property(field);
            if self.is_sync && is_sync_unsupported(object_name, &field.name) {
                prop.inclusion = Inclusion::Unsupported;
            }
            properties.insert(field.name.clone(), prop);
        }

        // `Id` is the one field every queryable object must carry; its
        // absence means the describe payload is for something that isn't
        // really a data table (a report, a settings blob, etc).
        if !properties.contains_key("Id") {
            tracing::debug!(object = object_name, "describe response has no Id field, skipping");
            return Ok(None);
        }

        for related in &described.related_objects.related {
            for field in &related.fields.fields {
                if !field.is_exportable() {
                    continue;
                }
                let joined_name = format!("{}{}", related.name, field.name);
                let mut prop = synthesize_property(field);
                prop.joined_parent = Some(related.name.clone());
                properties.insert(joined_name, prop);
            }
        }

        let replication_key = choose_replication_key(properties.keys());
        if let Some(rk) = &replication_key {
            if let Some(prop) = properties.get_mut(rk) {
                prop.inclusion = Inclusion::Automatic;
            }
        }
        if let Some(id_prop) = properties.get_mut("Id") {
            id_prop.inclusion = Inclusion::Automatic;
        }

        let supports_deleted = match self.driver.probe(object_name, &self.partner_id).await {
            Ok(ProbeOutcome::Unavailable) => {
                tracing::debug!(object = object_name, "probe reports unavailable, skipping");
                return Ok(None);
            }
            Ok(ProbeOutcome::Available) => false,
            Ok(ProbeOutcome::AvailableWithDeleted) => true,
            Err(err) => {
                tracing::warn!(object = object_name, %err, "probe failed, assuming no deleted-record support");
                false
            }
        };

        let replication_method = if replication_key.is_some() {
            ReplicationMethod::Incremental
        } else {
            ReplicationMethod::FullTable
        };

        if supports_deleted {
            // The driver requests this column and every row carries it
            // (csv_stream::decode_row), so the schema must declare it too.
            properties.insert(
                "Deleted".to_string(),
                Property {
                    field_type: FieldType::Boolean,
                    nullable: true,
                    inclusion: Inclusion::Available,
                    joined_parent: None,
                },
            );
        }

        Ok(Some(ObjectDescriptor {
            name: object_name.to_string(),
            properties,
            key_properties: vec!["Id".to_string()],
            replication_key,
            replication_method,
            supports_deleted,
        }))
    }
}

fn is_sync_unsupported(object_name: &str, field_name: &str) -> bool {
    SYNC_UNSUPPORTED_FIELDS.contains(&(object_name, field_name))
}

fn synthesize_property(field: &xml::DescribeField) -> Property {
    match FieldType::from_raw(&field.field_type) {
        Some(field_type) => Property {
            field_type,
            nullable: !field.required,
            inclusion: Inclusion::Available,
            joined_parent: None,
        },
        None => Property {
            field_type: FieldType::String,
            nullable: true,
            inclusion: Inclusion::Unsupported,
            joined_parent: None,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unmapped_field_type_is_unsupported_but_kept() {
        let field = xml::DescribeField {
            name: "Weird".to_string(),
            field_type: "unknown-upstream-type".to_string(),
            required: false,
            contexts: xml::ContextList { contexts: vec!["export".to_string()] },
        };
        let prop = synthesize_property(&field);
        assert_eq!(prop.inclusion, Inclusion::Unsupported);
        assert_eq!(prop.field_type, FieldType::String);
    }

    #[test]
    fn sync_unsupported_deny_list_is_scoped_to_its_object() {
        assert!(is_sync_unsupported("Invoice", "Body"));
        assert!(!is_sync_unsupported("Account", "Body"));
        assert!(!is_sync_unsupported("Invoice", "Id"));
    }

    #[test]
    fn mapped_field_type_is_available() {
        let field = xml::DescribeField {
            name: "Balance".to_string(),
            field_type: "decimal".to_string(),
            required: false,
            contexts: xml::ContextList { contexts: vec!["export".to_string()] },
        };
        let prop = synthesize_property(&field);
        assert_eq!(prop.inclusion, Inclusion::Available);
        assert_eq!(prop.field_type, FieldType::Number);
    }
}
