//! Fact classification: one batched call per question labels every fact.
//!
//! Annotation only. Weights and order are never touched.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::gateway::Attribution;
use crate::prompts::{bindings, CLASSIFY_FACTS};
use crate::structured::{
    FieldType, ResponseSchema, StructuredCall, StructuredError, StructuredGateway, StructuredReply,
};
use crate::types::{Category, ClinicalFact};

#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error(transparent)]
    Structured(#[from] StructuredError),
}

impl ClassificationError {
    pub fn code(&self) -> &'static str {
        match self {
            ClassificationError::Structured(e) => e.code(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FactLabel {
    pub fact_id: String,
    pub category: String,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationReply {
    pub labels: Vec<FactLabel>,
}

impl StructuredReply for ClassificationReply {
    fn schema() -> ResponseSchema {
        ResponseSchema::new().field(
            "labels",
            FieldType::array_of(FieldType::Object(
                ResponseSchema::new()
                    .field("fact_id", FieldType::String)
                    .field("category", FieldType::String)
                    .field("confidence", FieldType::Number),
            )),
        )
    }
}

fn check_labels(facts: &[ClinicalFact], reply: &ClassificationReply) -> Result<(), String> {
    let missing: Vec<&str> = facts
        .iter()
        .filter(|f| !reply.labels.iter().any(|l| l.fact_id.trim() == f.id))
        .map(|f| f.id.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(format!("no label for fact(s) {}", missing.join(", ")));
    }
    if let Some(label) = reply
        .labels
        .iter()
        .find(|l| !(0.0..=1.0).contains(&l.confidence))
    {
        return Err(format!(
            "confidence for {} must be between 0 and 1, got {}",
            label.fact_id, label.confidence
        ));
    }
    Ok(())
}

/// Label every fact; returns the enriched facts and the retry count.
pub async fn classify_facts(
    gateway: &StructuredGateway,
    config: &PipelineConfig,
    facts: &[ClinicalFact],
    attribution: Attribution,
) -> Result<(Vec<ClinicalFact>, u32), ClassificationError> {
    let listing = facts
        .iter()
        .map(|f| format!("{}: {}", f.id, f.text))
        .collect::<Vec<_>>()
        .join("\n");
    let call = StructuredCall::new(&CLASSIFY_FACTS, bindings([("facts", listing)]), attribution)
        .temperature(config.temperature);

    let reply = gateway
        .call_validated::<ClassificationReply, _>(call, |r| check_labels(facts, r))
        .await?;

    let mut by_id: HashMap<&str, &FactLabel> = HashMap::new();
    for label in &reply.value.labels {
        by_id.entry(label.fact_id.trim()).or_insert(label);
    }

    let classified = facts
        .iter()
        .map(|fact| {
            let mut fact = fact.clone();
            if let Some(label) = by_id.get(fact.id.as_str()) {
                fact.category = Some(Category::from_label(&label.category));
                fact.category_confidence = Some(label.confidence);
                fact.category_rationale = Some(label.rationale.trim().to_string());
            }
            fact
        })
        .collect();

    Ok((classified, reply.retry_count))
}

/// Number of facts per category across a set of questions.
pub fn category_distribution<'a>(
    facts: impl IntoIterator<Item = &'a ClinicalFact>,
) -> BTreeMap<Category, usize> {
    let mut counts = BTreeMap::new();
    for fact in facts {
        if let Some(category) = fact.category {
            *counts.entry(category).or_insert(0) += 1;
        }
    }
    counts
}
