//! Narrative rewriting with a coverage check.
//!
//! Each round writes a narrative from the disclosed facts, then asks the model
//! to verify it: every disclosed fact present and no other fact of the question
//! leaked in. A failed check feeds the violations back into the next round.
//! When rounds run out the prompt is returned with `coverage_passed = false`.

use serde::Deserialize;
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::gateway::Attribution;
use crate::prompts::{bindings, REWRITE_NARRATIVE, VERIFY_COVERAGE};
use crate::structured::{
    FieldType, ResponseSchema, StructuredCall, StructuredError, StructuredGateway, StructuredReply,
};
use crate::types::{ClinicalFact, ContrastSet, FactCoverage, PatientPrompt};

const NO_FEEDBACK: &str = "None. This is the first draft.";

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error(transparent)]
    Structured(#[from] StructuredError),
    #[error("contrast set references unknown fact {0}")]
    UnknownFact(String),
}

impl RewriteError {
    pub fn code(&self) -> &'static str {
        match self {
            RewriteError::Structured(e) => e.code(),
            RewriteError::UnknownFact(_) => "unknown_fact",
        }
    }
}

// =============================================================================
// Replies
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct NarrativeReply {
    pub narrative: String,
}

impl StructuredReply for NarrativeReply {
    fn schema() -> ResponseSchema {
        ResponseSchema::new().field("narrative", FieldType::String)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoverageReply {
    pub disclosed: Vec<FactCoverage>,
    pub leaked: Vec<String>,
}

impl StructuredReply for CoverageReply {
    fn schema() -> ResponseSchema {
        ResponseSchema::new()
            .field(
                "disclosed",
                FieldType::array_of(FieldType::Object(
                    ResponseSchema::new()
                        .field("fact_id", FieldType::String)
                        .field("present", FieldType::Boolean),
                )),
            )
            .field("leaked", FieldType::array_of(FieldType::String))
    }
}

/// Outcome of one coverage check.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageReport {
    pub coverage: Vec<FactCoverage>,
    /// Disclosed facts judged absent.
    pub missing: Vec<String>,
    /// Non-disclosed facts judged present.
    pub leaked: Vec<String>,
}

impl CoverageReport {
    pub fn passed(&self) -> bool {
        self.missing.is_empty() && self.leaked.is_empty()
    }

    fn from_reply(
        reply: CoverageReply,
        disclosed: &[&ClinicalFact],
        hidden: &[&ClinicalFact],
    ) -> Self {
        let coverage: Vec<FactCoverage> = disclosed
            .iter()
            .map(|fact| {
                reply
                    .disclosed
                    .iter()
                    .find(|c| c.fact_id.trim() == fact.id)
                    .map(|c| FactCoverage {
                        fact_id: fact.id.clone(),
                        present: c.present,
                        evidence: c.evidence.trim().to_string(),
                    })
                    .unwrap_or_else(|| FactCoverage {
                        fact_id: fact.id.clone(),
                        present: false,
                        evidence: String::new(),
                    })
            })
            .collect();
        let missing = coverage
            .iter()
            .filter(|c| !c.present)
            .map(|c| c.fact_id.clone())
            .collect();
        let leaked = hidden
            .iter()
            .filter(|f| reply.leaked.iter().any(|id| id.trim() == f.id))
            .map(|f| f.id.clone())
            .collect();
        Self {
            coverage,
            missing,
            leaked,
        }
    }
}

// =============================================================================
// Stage entry point
// =============================================================================

fn listing(facts: &[&ClinicalFact]) -> String {
    if facts.is_empty() {
        return "(none)".to_string();
    }
    facts
        .iter()
        .map(|f| format!("{}: {}", f.id, f.text))
        .collect::<Vec<_>>()
        .join("\n")
}

fn feedback(report: &CoverageReport, narrative: &str, facts: &[ClinicalFact]) -> String {
    let describe = |ids: &[String]| {
        ids.iter()
            .map(|id| {
                let text = facts.iter().find(|f| &f.id == id).map_or("", |f| f.text.as_str());
                format!("- {text}")
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let mut out = format!("Your previous draft was rejected.\nPrevious draft: {narrative}\n");
    if !report.missing.is_empty() {
        out.push_str("These facts were missing and must be included:\n");
        out.push_str(&describe(&report.missing));
        out.push('\n');
    }
    if !report.leaked.is_empty() {
        out.push_str("These facts must NOT be mentioned, remove them:\n");
        out.push_str(&describe(&report.leaked));
        out.push('\n');
    }
    out
}

async fn check_coverage(
    gateway: &StructuredGateway,
    config: &PipelineConfig,
    narrative: &str,
    disclosed: &[&ClinicalFact],
    hidden: &[&ClinicalFact],
    attribution: Attribution,
) -> Result<CoverageReport, StructuredError> {
    let call = StructuredCall::new(
        &VERIFY_COVERAGE,
        bindings([
            ("disclosed", listing(disclosed)),
            ("withheld", listing(hidden)),
            ("narrative", narrative.to_string()),
        ]),
        attribution,
    )
    .temperature(config.verify_temperature);

    let reply = gateway
        .call_validated::<CoverageReply, _>(call, |r| {
            let unjudged: Vec<&str> = disclosed
                .iter()
                .filter(|f| !r.disclosed.iter().any(|c| c.fact_id.trim() == f.id))
                .map(|f| f.id.as_str())
                .collect();
            if unjudged.is_empty() {
                Ok(())
            } else {
                Err(format!("no verdict for fact(s) {}", unjudged.join(", ")))
            }
        })
        .await?;
    Ok(CoverageReport::from_reply(reply.value, disclosed, hidden))
}

/// Rewrite one contrast set into a patient narrative and verify its coverage.
///
/// `retry_count` counts every extra rewrite call: coverage rounds plus the
/// structured retries of the rewrite calls themselves.
pub async fn rewrite_contrast_set(
    gateway: &StructuredGateway,
    config: &PipelineConfig,
    facts: &[ClinicalFact],
    set: &ContrastSet,
    attribution: Attribution,
) -> Result<PatientPrompt, RewriteError> {
    let disclosed = set
        .disclosed
        .iter()
        .map(|id| {
            facts
                .iter()
                .find(|f| &f.id == id)
                .ok_or_else(|| RewriteError::UnknownFact(id.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let hidden: Vec<&ClinicalFact> = facts.iter().filter(|f| !set.discloses(&f.id)).collect();
    let fact_lines = disclosed
        .iter()
        .map(|f| format!("- {}", f.text))
        .collect::<Vec<_>>()
        .join("\n");

    let mut note = NO_FEEDBACK.to_string();
    let mut retry_count = 0u32;
    let mut round = 0u32;
    loop {
        let call = StructuredCall::new(
            &REWRITE_NARRATIVE,
            bindings([
                ("facts", fact_lines.clone()),
                ("voice", config.narrative_voice.describe().to_string()),
                ("feedback", note.clone()),
            ]),
            Attribution {
                caller: "rewrite",
                ..attribution.clone()
            },
        )
        .temperature(config.temperature);
        let written = gateway
            .call_validated::<NarrativeReply, _>(call, |r| {
                if r.narrative.trim().is_empty() {
                    Err("narrative is empty".into())
                } else {
                    Ok(())
                }
            })
            .await?;
        retry_count += written.retry_count;
        let narrative = written.value.narrative.trim().to_string();

        let report = check_coverage(
            gateway,
            config,
            &narrative,
            &disclosed,
            &hidden,
            Attribution {
                caller: "rewrite::verify",
                ..attribution.clone()
            },
        )
        .await?;

        let passed = report.passed();
        if passed || round >= config.max_retries {
            if !passed {
                tracing::warn!(
                    question_id = %set.question_id,
                    bucket = %set.bucket,
                    missing = ?report.missing,
                    leaked = ?report.leaked,
                    "coverage check failed after all rounds"
                );
            }
            return Ok(PatientPrompt {
                question_id: set.question_id.clone(),
                bucket: set.bucket,
                narrative,
                coverage_passed: passed,
                retry_count,
                coverage: report.coverage,
                leaked: report.leaked,
            });
        }

        tracing::warn!(
            question_id = %set.question_id,
            bucket = %set.bucket,
            round = round + 1,
            missing = report.missing.len(),
            leaked = report.leaked.len(),
            "coverage check failed, rewriting with feedback"
        );
        note = feedback(&report, &narrative, facts);
        round += 1;
        retry_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::gateway::{ChatModel, Provider, RetryPolicy};
    use crate::structured::testing::ScriptedGateway;
    use crate::types::Bucket;

    fn facts() -> Vec<ClinicalFact> {
        vec![
            ClinicalFact::new(0, "Fever for two days", 1.0),
            ClinicalFact::new(1, "Stiff neck", 0.8),
            ClinicalFact::new(2, "Recent camping trip", 0.1),
        ]
    }

    fn set() -> ContrastSet {
        ContrastSet {
            question_id: "q1".into(),
            bucket: Bucket::HardButFair,
            disclosed: vec!["f1".into(), "f3".into()],
            disclosed_mass: 0.5,
            withheld_critical: vec![],
        }
    }

    fn gateway(script: Arc<ScriptedGateway>) -> StructuredGateway {
        StructuredGateway::new(
            script,
            ChatModel::new(Provider::OpenAi, "m"),
            RetryPolicy::immediate(2),
        )
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::new(ChatModel::new(Provider::OpenAi, "m"));
        config.max_retries = 2;
        config
    }

    async fn rewrite(
        script: Arc<ScriptedGateway>,
        set: &ContrastSet,
    ) -> Result<PatientPrompt, RewriteError> {
        let attribution = Attribution::new("rewrite");
        rewrite_contrast_set(&gateway(script), &config(), &facts(), set, attribution).await
    }

    const GOOD_COVERAGE: &str = r#"{"disclosed": [
        {"fact_id": "f1", "present": true, "evidence": "fever since Monday"},
        {"fact_id": "f3", "present": true, "evidence": "went camping"}
    ], "leaked": []}"#;

    #[tokio::test]
    async fn passes_on_first_round() {
        let script = Arc::new(ScriptedGateway::new(vec![
            Ok(r#"{"narrative": "I went camping and have had a fever since Monday."}"#),
            Ok(GOOD_COVERAGE),
        ]));
        let prompt = rewrite(script.clone(), &set()).await.unwrap();

        assert!(prompt.coverage_passed);
        assert_eq!(prompt.retry_count, 0);
        assert_eq!(prompt.coverage.len(), 2);
        assert_eq!(prompt.coverage[0].evidence, "fever since Monday");

        let requests = script.requests();
        assert_eq!(requests[1].attribution.caller, "rewrite::verify");
        assert!(requests[1].messages[1].content.contains("f2: Stiff neck"));
        assert!((requests[1].temperature - 0.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn leak_is_fed_back_then_fixed() {
        let script = Arc::new(ScriptedGateway::new(vec![
            Ok(r#"{"narrative": "Fever, stiff neck, went camping."}"#),
            Ok(r#"{"disclosed": [
                {"fact_id": "f1", "present": true},
                {"fact_id": "f3", "present": true}
            ], "leaked": ["f2"]}"#),
            Ok(r#"{"narrative": "I have a fever and went camping."}"#),
            Ok(GOOD_COVERAGE),
        ]));
        let prompt = rewrite(script.clone(), &set()).await.unwrap();

        assert!(prompt.coverage_passed);
        assert_eq!(prompt.retry_count, 1);
        assert!(prompt.leaked.is_empty());
        let second_rewrite = &script.requests()[2].messages[1].content;
        assert!(second_rewrite.contains("must NOT be mentioned"));
        assert!(second_rewrite.contains("Stiff neck"));
    }

    #[tokio::test]
    async fn exhausted_rounds_mark_prompt_failed() {
        let missing = r#"{"disclosed": [
            {"fact_id": "f1", "present": true},
            {"fact_id": "f3", "present": false}
        ], "leaked": ["f9"]}"#;
        let script = Arc::new(ScriptedGateway::new(vec![
            Ok(r#"{"narrative": "I have a fever."}"#),
            Ok(missing),
            Ok(r#"{"narrative": "I have a fever."}"#),
            Ok(missing),
            Ok(r#"{"narrative": "I have a fever."}"#),
            Ok(missing),
        ]));
        let prompt = rewrite(script, &set()).await.unwrap();

        assert!(!prompt.coverage_passed);
        assert_eq!(prompt.retry_count, 2);
        // Unknown ids in the leak list are ignored.
        assert!(prompt.leaked.is_empty());
        assert!(!prompt.coverage[1].present);
    }

    #[tokio::test]
    async fn unknown_disclosed_fact_is_an_error() {
        let mut bad = set();
        bad.disclosed.push("f7".into());
        let script = Arc::new(ScriptedGateway::new(vec![]));
        let err = rewrite(script, &bad).await.unwrap_err();
        assert!(matches!(err, RewriteError::UnknownFact(id) if id == "f7"));
    }
}
