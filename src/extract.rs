//! Fact extraction: question in, ordered weighted facts out.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::gateway::Attribution;
use crate::prompts::{bindings, EXTRACT_FACTS};
use crate::structured::{
    FieldType, ResponseSchema, StructuredCall, StructuredError, StructuredGateway, StructuredReply,
};
use crate::types::{ClinicalFact, Question};

static TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-z0-9]+(?:\.[0-9]+)?").expect("Invalid token regex"));

static ANSWER_BRACKETS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\[\]()]").expect("Invalid bracket regex"));

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Structured(#[from] StructuredError),
    #[error("only {0} distinct fact(s) after deduplication, need at least 2")]
    TooFewFacts(usize),
    #[error("extractor answered {chosen:?}, expected {expected:?}")]
    AnswerMismatch { chosen: String, expected: String },
}

impl ExtractionError {
    pub fn code(&self) -> &'static str {
        match self {
            ExtractionError::Structured(e) => e.code(),
            ExtractionError::TooFewFacts(_) => "too_few_facts",
            ExtractionError::AnswerMismatch { .. } => "answer_mismatch",
        }
    }
}

// =============================================================================
// Reply
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RawFact {
    pub text: String,
    pub weight: f64,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionReply {
    pub facts: Vec<RawFact>,
    pub answer: String,
    #[serde(default)]
    pub justification: String,
}

impl StructuredReply for ExtractionReply {
    fn schema() -> ResponseSchema {
        ResponseSchema::new()
            .field(
                "facts",
                FieldType::array_of(FieldType::Object(
                    ResponseSchema::new()
                        .field("text", FieldType::String)
                        .field("weight", FieldType::Number),
                )),
            )
            .field("answer", FieldType::String)
    }
}

fn check_reply(reply: &ExtractionReply) -> Result<(), String> {
    if reply.facts.is_empty() {
        return Err("the facts array is empty".into());
    }
    if let Some(pos) = reply.facts.iter().position(|f| f.text.trim().is_empty()) {
        return Err(format!("facts[{pos}].text is empty"));
    }
    Ok(())
}

/// Output of a successful extraction.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub facts: Vec<ClinicalFact>,
    pub answer: String,
    pub justification: String,
    pub retry_count: u32,
}

// =============================================================================
// Post-processing
// =============================================================================

fn tokens(text: &str) -> HashSet<String> {
    let lower = text.to_lowercase();
    TOKEN
        .find_iter(&lower)
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Jaccard overlap of the two texts' token sets.
pub fn token_overlap(a: &str, b: &str) -> f64 {
    let (ta, tb) = (tokens(a), tokens(b));
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let shared = ta.intersection(&tb).count();
    shared as f64 / ta.union(&tb).count() as f64
}

/// Rescale weights into [0, 1] when any falls outside it.
pub fn normalize_weights(weights: &mut [f64]) {
    if weights.iter().all(|w| (0.0..=1.0).contains(w)) {
        return;
    }
    let min = weights.iter().copied().fold(f64::INFINITY, f64::min);
    let max = weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    for w in weights.iter_mut() {
        *w = if span > 0.0 { (*w - min) / span } else { 1.0 };
    }
}

/// Collapse near-duplicate facts onto the heavier one, then renumber in
/// extraction order.
pub fn dedup_facts(raw: Vec<RawFact>, overlap_threshold: f64) -> Vec<ClinicalFact> {
    let mut weights: Vec<f64> = raw.iter().map(|f| f.weight).collect();
    normalize_weights(&mut weights);

    let mut by_weight: Vec<usize> = (0..raw.len()).collect();
    by_weight.sort_by(|&a, &b| weights[b].total_cmp(&weights[a]).then(a.cmp(&b)));

    let mut kept: Vec<usize> = Vec::new();
    for i in by_weight {
        let text = raw[i].text.trim();
        if text.is_empty() {
            continue;
        }
        let duplicate = kept
            .iter()
            .any(|&k| token_overlap(raw[k].text.trim(), text) > overlap_threshold);
        if !duplicate {
            kept.push(i);
        }
    }
    kept.sort_unstable();

    kept.into_iter()
        .enumerate()
        .map(|(index, i)| {
            let mut fact = ClinicalFact::new(index, raw[i].text.trim(), weights[i]);
            fact.rationale = raw[i].rationale.trim().to_string();
            fact
        })
        .collect()
}

fn normalize_answer(answer: &str) -> String {
    ANSWER_BRACKETS
        .replace_all(&answer.trim().to_lowercase(), "")
        .trim()
        .to_string()
}

/// Compare answers ignoring case, surrounding space and brackets.
pub fn answers_match(chosen: &str, expected: &str) -> bool {
    normalize_answer(chosen) == normalize_answer(expected)
}

fn choices_block(question: &Question) -> String {
    if question.choices.is_empty() {
        "(choices are given in the question text)".to_string()
    } else {
        question.choices.join("\n")
    }
}

// =============================================================================
// Stage entry point
// =============================================================================

pub async fn extract_facts(
    gateway: &StructuredGateway,
    config: &PipelineConfig,
    question: &Question,
    attribution: Attribution,
) -> Result<Extraction, ExtractionError> {
    let call = StructuredCall::new(
        &EXTRACT_FACTS,
        bindings([
            ("question", question.stem.clone()),
            ("choices", choices_block(question)),
        ]),
        attribution,
    )
    .temperature(config.temperature);

    let reply = gateway
        .call_validated::<ExtractionReply, _>(call, check_reply)
        .await?;
    let ExtractionReply {
        facts,
        answer,
        justification,
    } = reply.value;

    if config.verify_extracted_answer && !answers_match(&answer, &question.correct_answer) {
        return Err(ExtractionError::AnswerMismatch {
            chosen: answer,
            expected: question.correct_answer.clone(),
        });
    }

    let facts = dedup_facts(facts, config.dedup_overlap_threshold);
    if facts.len() < 2 {
        return Err(ExtractionError::TooFewFacts(facts.len()));
    }

    Ok(Extraction {
        facts,
        answer,
        justification,
        retry_count: reply.retry_count,
    })
}
