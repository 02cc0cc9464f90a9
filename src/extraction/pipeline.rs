/// Pure orchestration over a model-provider trait: ask for entities, then
/// relationships, retrying the relationship pass while the orphan rate
/// stays above threshold.

use uuid::Uuid;

use crate::extraction::schema::{ObjectSchema, RelationshipSchema};
use crate::extraction::{orphan_rate, Entity, ExtractionError, ExtractionResult, Relationship};
use crate::services::ModelFactory;

pub struct ExtractionPipeline<'a> {
    model_factory: &'a dyn ModelFactory,
}

impl<'a> ExtractionPipeline<'a> {
    pub fn new(model_factory: &'a dyn ModelFactory) -> Self {
        ExtractionPipeline { model_factory }
    }

    pub async fn run(
        &self,
        text: &str,
        object_schemas: &[ObjectSchema],
        relationship_schemas: &[RelationshipSchema],
        allowed_types: Option<&[String]>,
        orphan_threshold: f64,
        max_retries: u32,
    ) -> Result<ExtractionResult, ExtractionError> {
        let model = self
            .model_factory
            .extraction_model()
            .await
            .map_err(|e| ExtractionError::Model(e.to_string()))?;

        let entity_prompt = build_entity_prompt(text, object_schemas, allowed_types);
        let entity_response = model
            .complete(&entity_prompt)
            .await
            .map_err(|e| ExtractionError::Model(e.to_string()))?;
        let entities = parse_entities(&entity_response)?;

        let mut best: Option<ExtractionResult> = None;
        let attempts = max_retries.max(1);

        for _ in 0..attempts {
            let relationship_prompt = build_relationship_prompt(text, &entities, relationship_schemas);
            let relationship_response = model
                .complete(&relationship_prompt)
                .await
                .map_err(|e| ExtractionError::Model(e.to_string()))?;
            let relationships = parse_relationships(&relationship_response)?;
            let rate = orphan_rate(&entities, &relationships);

            let candidate = ExtractionResult {
                entities: entities.clone(),
                relationships,
                orphan_rate: rate,
            };

            if rate <= orphan_threshold {
                return Ok(candidate);
            }

            if best.as_ref().map(|b| rate < b.orphan_rate).unwrap_or(true) {
                best = Some(candidate);
            }
        }

        Ok(best.expect("at least one attempt always runs"))
    }
}

fn build_entity_prompt(text: &str, schemas: &[ObjectSchema], allowed_types: Option<&[String]>) -> String {
    let type_list: Vec<&str> = match allowed_types {
        Some(allow) if !allow.is_empty() => allow.iter().map(String::as_str).collect(),
        _ => schemas.iter().map(|s| s.type_name.as_str()).collect(),
    };
    format!(
        "Extract entities of types [{}] from the following text. Respond with a JSON array \
         of objects with fields temp_id, name, type, description, properties.\n\n{}",
        type_list.join(", "),
        text,
    )
}

fn build_relationship_prompt(text: &str, entities: &[Entity], schemas: &[RelationshipSchema]) -> String {
    let entity_list: Vec<String> = entities.iter().map(|e| format!("{} ({})", e.temp_id, e.entity_type)).collect();
    let relationship_types: Vec<&str> = schemas.iter().map(|s| s.type_name.as_str()).collect();
    format!(
        "Given these entities: [{}], extract relationships of types [{}] from the text below. \
         Reference entities by temp_id. Respond with a JSON array of objects with fields \
         source_ref, target_ref, type, description.\n\n{}",
        entity_list.join(", "),
        relationship_types.join(", "),
        text,
    )
}

fn parse_entities(response: &str) -> Result<Vec<Entity>, ExtractionError> {
    let mut entities: Vec<Entity> =
        serde_json::from_str(response).map_err(|e| ExtractionError::Parse(e.to_string()))?;
    for entity in &mut entities {
        if entity.temp_id.is_empty() {
            entity.temp_id = Uuid::new_v4().to_string();
        }
    }
    Ok(entities)
}

fn parse_relationships(response: &str) -> Result<Vec<Relationship>, ExtractionError> {
    serde_json::from_str(response).map_err(|e| ExtractionError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::errors::CoreError;
    use crate::services::ExtractionModel;
    use std::sync::Mutex;

    struct ScriptedModel {
        responses: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ExtractionModel for ScriptedModel {
        async fn complete(&self, _prompt: &str) -> Result<String, CoreError> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(CoreError::Internal("no more scripted responses".to_string()));
            }
            Ok(responses.remove(0))
        }
    }

    struct ScriptedFactory {
        responses: Vec<String>,
    }

    #[async_trait]
    impl ModelFactory for ScriptedFactory {
        async fn extraction_model(&self) -> Result<Box<dyn ExtractionModel>, CoreError> {
            Ok(Box::new(ScriptedModel {
                responses: Mutex::new(self.responses.clone()),
            }))
        }
    }

    fn ten_entities() -> String {
        let entities: Vec<_> = (0..10)
            .map(|i| format!(r#"{{"temp_id":"e{i}","name":"e{i}","type":"thing"}}"#))
            .collect();
        format!("[{}]", entities.join(","))
    }

    #[tokio::test]
    async fn accepts_second_attempt_matching_scenario_s3() {
        let low_orphan_relationships: Vec<_> = (0..7)
            .map(|i| format!(r#"{{"source_ref":"e{i}","target_ref":"e{}","type":"rel"}}"#, (i + 1) % 10))
            .collect();
        let high_orphan_relationships = r#"[{"source_ref":"e0","target_ref":"e1","type":"rel"},{"source_ref":"e1","target_ref":"e2","type":"rel"}]"#;

        let factory = ScriptedFactory {
            responses: vec![
                ten_entities(),
                high_orphan_relationships.to_string(),
                format!("[{}]", low_orphan_relationships.join(",")),
            ],
        };

        let pipeline = ExtractionPipeline::new(&factory);
        let result = pipeline.run("doc text", &[], &[], None, 0.3, 3).await.unwrap();
        assert!(result.orphan_rate <= 0.3);
    }

    #[tokio::test]
    async fn accepts_best_attempt_when_all_over_threshold() {
        let factory = ScriptedFactory {
            responses: vec![
                ten_entities(),
                r#"[{"source_ref":"e0","target_ref":"e1","type":"rel"}]"#.to_string(),
                r#"[{"source_ref":"e0","target_ref":"e1","type":"rel"},{"source_ref":"e1","target_ref":"e2","type":"rel"}]"#.to_string(),
                r#"[{"source_ref":"e0","target_ref":"e1","type":"rel"},{"source_ref":"e1","target_ref":"e2","type":"rel"},{"source_ref":"e2","target_ref":"e3","type":"rel"}]"#.to_string(),
            ],
        };

        let pipeline = ExtractionPipeline::new(&factory);
        let result = pipeline.run("doc text", &[], &[], None, 0.2, 3).await.unwrap();
        // Best of the three attempts is the last one (4 entities referenced of 10).
        assert!((result.orphan_rate - 0.6).abs() < 1e-9);
    }
}
