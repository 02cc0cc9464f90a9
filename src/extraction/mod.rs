/// Object-extraction pipeline: text → entities + relationships.
///
/// Grounded in the ambient stack's extraction module shape (`ExtractionError`,
/// `build_extraction_prompt`, a provider trait feeding a retry loop), adapted
/// from "entities + facts" to "entities + relationships with a temp-id
/// graph" and the orphan-rate retry contract.

pub mod pipeline;
pub mod schema;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("model call failed: {0}")]
    Model(String),

    #[error("schema loading failed: {0}")]
    Schema(String),

    #[error("response parsing failed: {0}")]
    Parse(String),
}

impl From<ExtractionError> for crate::errors::CoreError {
    fn from(e: ExtractionError) -> Self {
        crate::errors::CoreError::Internal(e.to_string())
    }
}

/// The object-extraction job's source is a discriminated union, not three
/// optional fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelector {
    Document(Uuid),
    Chunk(Uuid),
    Manual(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub temp_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub description: Option<String>,
    #[serde(default)]
    pub properties: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relationship {
    pub source_ref: String,
    pub target_ref: String,
    #[serde(rename = "type")]
    pub relationship_type: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionResult {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
    pub orphan_rate: f64,
}

/// Fraction of `entities` that appear as neither `source_ref` nor
/// `target_ref` in `relationships`.
pub fn orphan_rate(entities: &[Entity], relationships: &[Relationship]) -> f64 {
    if entities.is_empty() {
        return 0.0;
    }
    let referenced: std::collections::HashSet<&str> = relationships
        .iter()
        .flat_map(|r| [r.source_ref.as_str(), r.target_ref.as_str()])
        .collect();
    let orphans = entities.iter().filter(|e| !referenced.contains(e.temp_id.as_str())).count();
    orphans as f64 / entities.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str) -> Entity {
        Entity {
            temp_id: id.to_string(),
            name: id.to_string(),
            entity_type: "thing".to_string(),
            description: None,
            properties: Value::Null,
        }
    }

    fn relationship(src: &str, dst: &str) -> Relationship {
        Relationship {
            source_ref: src.to_string(),
            target_ref: dst.to_string(),
            relationship_type: "rel".to_string(),
            description: None,
        }
    }

    #[test]
    fn orphan_rate_matches_scenario_s3_first_attempt() {
        let entities: Vec<Entity> = (0..10).map(|i| entity(&i.to_string())).collect();
        let relationships = vec![relationship("0", "1")];
        // 2 entities referenced, 8 orphaned -> 0.8
        assert!((orphan_rate(&entities, &relationships) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn orphan_rate_is_zero_with_no_entities() {
        assert_eq!(orphan_rate(&[], &[]), 0.0);
    }
}
