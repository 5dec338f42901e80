//! Deserializes Zuora's `describe` XML payloads with `quick-xml`'s serde
//! integration, rather than hand-walking an XML event stream.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct ObjectsList {
    #[serde(rename = "object", default)]
    pub objects: Vec<ObjectSummary>,
}

#[derive(Debug, Deserialize)]
pub struct ObjectSummary {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct DescribeObject {
    pub name: String,
    #[serde(rename = "fields", default)]
    pub fields: FieldList,
    #[serde(rename = "related-objects", default)]
    pub related_objects: RelatedObjectList,
}

#[derive(Debug, Default, Deserialize)]
pub struct FieldList {
    #[serde(rename = "field", default)]
    pub fields: Vec<DescribeField>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RelatedObjectList {
    #[serde(rename = "related-object", default)]
    pub related: Vec<RelatedObject>,
}

#[derive(Debug, Deserialize)]
pub struct RelatedObject {
    pub name: String,
    #[serde(rename = "fields", default)]
    pub fields: FieldList,
}

#[derive(Debug, Deserialize)]
pub struct DescribeField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(rename = "contexts", default)]
    pub contexts: ContextList,
}

#[derive(Debug, Default, Deserialize)]
pub struct ContextList {
    #[serde(rename = "context", default)]
    pub contexts: Vec<String>,
}

impl DescribeField {
    /// Only fields that carry the `export` context are queryable at all;
    /// Zuora exposes plenty of metadata-only fields that never appear in
    /// an AQuA/REST result set.
    pub fn is_exportable(&self) -> bool {
        self.contexts.contexts.iter().any(|c| c == "export")
    }
}

pub fn parse_objects_list(body: &str) -> Result<ObjectsList, quick_xml::de::DeError> {
    quick_xml::de::from_str(body)
}

pub fn parse_describe_object(body: &str) -> Result<DescribeObject, quick_xml::de::DeError> {
    quick_xml::de::from_str(body)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_objects_list() {
        let xml = r#"<objects><object><name>Account</name></object><object><name>Subscription</name></object></objects>"#;
        let parsed = parse_objects_list(xml).unwrap();
        assert_eq!(parsed.objects.len(), 2);
        assert_eq!(parsed.objects[0].name, "Account");
    }

    #[test]
    fn parses_describe_object_with_contexts() {
        let xml = r#"
            <object>
                <name>Account</name>
                <fields>
                    <field>
                        <name>Id</name>
                        <type>text</type>
                        <required>true</required>
                        <contexts>
                            <context>export</context>
                        </contexts>
                    </field>
                </fields>
            </object>
        "#;
        let parsed = parse_describe_object(xml).unwrap();
        assert_eq!(parsed.fields.fields.len(), 1);
        assert!(parsed.fields.fields[0].is_exportable());
    }
}
