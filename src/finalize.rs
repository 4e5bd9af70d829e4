//! Benchmark assembly from rewritten records.

use thiserror::Error;

use crate::types::{BenchmarkEntry, Bucket, ContrastSet, PatientPrompt, Question, QuestionRecord};

/// A question reached finalization without a single usable bucket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("question {question_id} has no surviving bucket: {reason}")]
pub struct IncompleteDataError {
    pub question_id: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Finalized {
    /// Entries in input question order, buckets in `Bucket::ALL` order.
    pub entries: Vec<BenchmarkEntry>,
    pub incomplete: Vec<IncompleteDataError>,
}

/// What the evaluation runner sends: narrative, the question sentence, choices.
pub fn assemble_prompt(question: &Question, narrative: &str) -> String {
    let mut prompt = narrative.trim().to_string();
    if let Some(ask) = question.final_question() {
        prompt.push_str("\n\n");
        prompt.push_str(ask);
    }
    if !question.choices.is_empty() {
        prompt.push('\n');
        for choice in &question.choices {
            prompt.push('\n');
            prompt.push_str(choice.trim());
        }
    }
    prompt
}

fn entry(record: &QuestionRecord, set: &ContrastSet, prompt: &PatientPrompt) -> BenchmarkEntry {
    let withheld = record
        .facts
        .iter()
        .flatten()
        .filter(|f| !set.discloses(&f.id))
        .map(|f| f.id.clone())
        .collect();
    BenchmarkEntry {
        question_id: record.question.id.clone(),
        bucket: set.bucket,
        narrative: prompt.narrative.clone(),
        prompt: assemble_prompt(&record.question, &prompt.narrative),
        expected_answer: record.question.correct_answer.clone(),
        distractors: record.question.distractors.clone(),
        disclosed_fact_ids: set.disclosed.clone(),
        withheld_fact_ids: withheld,
        disclosed_mass: set.disclosed_mass,
        retry_count: prompt.retry_count,
    }
}

fn entries_for(record: &QuestionRecord) -> Result<Vec<BenchmarkEntry>, IncompleteDataError> {
    let incomplete = |reason: &str| IncompleteDataError {
        question_id: record.question.id.clone(),
        reason: reason.to_string(),
    };
    let sets = record
        .contrast_sets
        .as_deref()
        .ok_or_else(|| incomplete("never sampled"))?;
    let prompts = record
        .prompts
        .as_deref()
        .ok_or_else(|| incomplete("never rewritten"))?;

    let entries: Vec<BenchmarkEntry> = Bucket::ALL
        .iter()
        .filter_map(|bucket| {
            let set = sets.iter().find(|s| s.bucket == *bucket)?;
            let prompt = prompts
                .iter()
                .find(|p| p.bucket == *bucket && p.coverage_passed)?;
            Some(entry(record, set, prompt))
        })
        .collect();

    if entries.is_empty() {
        Err(incomplete("no narrative passed the coverage check"))
    } else {
        Ok(entries)
    }
}

/// Build benchmark entries, preserving input order. Answers and distractors
/// are copied unchanged.
pub fn finalize_records(records: &[QuestionRecord]) -> Finalized {
    let mut out = Finalized::default();
    for record in records {
        match entries_for(record) {
            Ok(entries) => out.entries.extend(entries),
            Err(err) => {
                tracing::warn!(
                    question_id = %err.question_id,
                    reason = %err.reason,
                    "incomplete question"
                );
                out.incomplete.push(err);
            }
        }
    }
    out
}
