/// Schema Provider: merges/overrides per-project object & relationship
/// schemas behind one interface, `get_project_schemas`.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::CoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectSchema {
    pub type_name: String,
    pub description: Option<String>,
    pub properties: Value,
    pub required: Vec<String>,
    pub extraction_guidelines: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipSchema {
    pub type_name: String,
    pub description: Option<String>,
    pub source_types: Vec<String>,
    pub target_types: Vec<String>,
    pub extraction_guidelines: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectSchemas {
    pub object_schemas: Vec<ObjectSchema>,
    pub relationship_schemas: Vec<RelationshipSchema>,
}

#[async_trait]
pub trait SchemaProvider: Send + Sync {
    async fn get_project_schemas(&self, project_id: Uuid) -> Result<ProjectSchemas, CoreError>;
}

/// One template-pack assignment's customizations.
#[derive(Debug, Clone, Default)]
pub struct PackCustomization {
    pub enabled_types: Vec<String>,
    pub disabled_types: Vec<String>,
    /// Raw override documents keyed by type name, deep-merged onto the
    /// pack's shipped schema.
    pub schema_overrides: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
pub struct TemplatePackAssignment {
    pub object_schemas: Vec<ObjectSchema>,
    pub relationship_schemas: Vec<RelationshipSchema>,
    pub customization: PackCustomization,
}

/// Merges all active pack assignments for a project. Later packs in
/// `assignments` override earlier ones on duplicate type names.
pub struct TemplatePackSchemaProvider {
    assignments_by_project: HashMap<Uuid, Vec<TemplatePackAssignment>>,
}

impl TemplatePackSchemaProvider {
    pub fn new(assignments_by_project: HashMap<Uuid, Vec<TemplatePackAssignment>>) -> Self {
        TemplatePackSchemaProvider { assignments_by_project }
    }

    fn merge(assignments: &[TemplatePackAssignment]) -> ProjectSchemas {
        let mut objects: HashMap<String, ObjectSchema> = HashMap::new();
        let mut relationships: HashMap<String, RelationshipSchema> = HashMap::new();

        for assignment in assignments {
            let allow = &assignment.customization.enabled_types;
            let deny = &assignment.customization.disabled_types;

            for schema in &assignment.object_schemas {
                if deny.contains(&schema.type_name) {
                    continue;
                }
                if !allow.is_empty() && !allow.contains(&schema.type_name) {
                    continue;
                }
                let merged = match assignment.customization.schema_overrides.get(&schema.type_name) {
                    Some(override_doc) => apply_object_override(schema, override_doc),
                    None => schema.clone(),
                };
                objects.insert(merged.type_name.clone(), merged);
            }

            for schema in &assignment.relationship_schemas {
                if deny.contains(&schema.type_name) {
                    continue;
                }
                if !allow.is_empty() && !allow.contains(&schema.type_name) {
                    continue;
                }
                relationships.insert(schema.type_name.clone(), schema.clone());
            }
        }

        ProjectSchemas {
            object_schemas: objects.into_values().collect(),
            relationship_schemas: relationships.into_values().collect(),
        }
    }
}

fn apply_object_override(schema: &ObjectSchema, override_doc: &Value) -> ObjectSchema {
    let mut merged = schema.clone();

    if let Some(description) = override_doc.get("description").and_then(Value::as_str) {
        merged.description = Some(description.to_string());
    }

    if let Some(extra_props) = override_doc.get("properties").and_then(Value::as_object) {
        let mut props = match merged.properties {
            Value::Object(ref map) => map.clone(),
            _ => Map::new(),
        };
        for (key, value) in extra_props {
            props.insert(key.clone(), value.clone());
        }
        merged.properties = Value::Object(props);
    }

    if let Some(required) = override_doc.get("required").and_then(Value::as_array) {
        merged.required = required.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
    }

    if let Some(guidelines) = override_doc.get("extraction_guidelines").and_then(Value::as_str) {
        merged.extraction_guidelines = Some(guidelines.to_string());
    }

    merged
}

#[async_trait]
impl SchemaProvider for TemplatePackSchemaProvider {
    async fn get_project_schemas(&self, project_id: Uuid) -> Result<ProjectSchemas, CoreError> {
        let assignments = self.assignments_by_project.get(&project_id).cloned().unwrap_or_default();
        Ok(Self::merge(&assignments))
    }
}

/// Reads schemas directly from the job's extraction config instead of
/// template packs.
pub struct InlineSchemaProvider {
    pub schemas: ProjectSchemas,
}

#[async_trait]
impl SchemaProvider for InlineSchemaProvider {
    async fn get_project_schemas(&self, _project_id: Uuid) -> Result<ProjectSchemas, CoreError> {
        Ok(self.schemas.clone())
    }
}

/// Tolerates `source_types`/`sourceTypes`/`fromTypes`/singular `source` (and
/// the equivalent `target_*` family) when parsing a relationship schema
/// document from an untyped JSON source (e.g. a template pack's raw schema
/// blob).
pub fn parse_relationship_type_list(doc: &Value, canonical_prefix: &str) -> Vec<String> {
    let candidates: &[String] = &[
        format!("{canonical_prefix}_types"),
        to_camel_case(&format!("{canonical_prefix}_types")),
        match canonical_prefix {
            "source" => "fromTypes".to_string(),
            "target" => "toTypes".to_string(),
            _ => format!("{canonical_prefix}Types"),
        },
        canonical_prefix.to_string(),
    ];

    for key in candidates {
        if let Some(value) = doc.get(key) {
            match value {
                Value::Array(items) => {
                    return items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
                }
                Value::String(s) => return vec![s.clone()],
                _ => {}
            }
        }
    }
    Vec::new()
}

fn to_camel_case(snake: &str) -> String {
    let mut out = String::new();
    let mut upper_next = false;
    for ch in snake.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tolerates_all_source_naming_conventions() {
        for key in ["source_types", "sourceTypes", "fromTypes", "source"] {
            let doc = json!({ key: ["person", "company"] });
            assert_eq!(parse_relationship_type_list(&doc, "source"), vec!["person", "company"]);
        }
    }

    #[test]
    fn tolerates_singular_target_string() {
        let doc = json!({ "target": "company" });
        assert_eq!(parse_relationship_type_list(&doc, "target"), vec!["company"]);
    }

    #[test]
    fn merge_applies_disabled_types_and_later_pack_precedence() {
        let base_schema = ObjectSchema {
            type_name: "person".to_string(),
            description: Some("a person".to_string()),
            properties: json!({}),
            required: vec![],
            extraction_guidelines: None,
        };
        let overridden_schema = ObjectSchema {
            description: Some("overridden person".to_string()),
            ..base_schema.clone()
        };

        let assignments = vec![
            TemplatePackAssignment {
                object_schemas: vec![base_schema.clone()],
                relationship_schemas: vec![],
                customization: PackCustomization::default(),
            },
            TemplatePackAssignment {
                object_schemas: vec![overridden_schema],
                relationship_schemas: vec![],
                customization: PackCustomization::default(),
            },
        ];

        let merged = TemplatePackSchemaProvider::merge(&assignments);
        assert_eq!(merged.object_schemas.len(), 1);
        assert_eq!(merged.object_schemas[0].description.as_deref(), Some("overridden person"));
    }

    #[test]
    fn merge_respects_enabled_types_allow_list() {
        let person = ObjectSchema {
            type_name: "person".to_string(),
            description: None,
            properties: json!({}),
            required: vec![],
            extraction_guidelines: None,
        };
        let company = ObjectSchema {
            type_name: "company".to_string(),
            ..person.clone()
        };

        let assignments = vec![TemplatePackAssignment {
            object_schemas: vec![person, company],
            relationship_schemas: vec![],
            customization: PackCustomization {
                enabled_types: vec!["person".to_string()],
                ..Default::default()
            },
        }];

        let merged = TemplatePackSchemaProvider::merge(&assignments);
        assert_eq!(merged.object_schemas.len(), 1);
        assert_eq!(merged.object_schemas[0].type_name, "person");
    }
}
