//! Data model shared by every stage.
//!
//! Stage artifacts are `Vec<QuestionRecord>`: each stage fills one more
//! optional field, so every file is a superset of the one before it.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// A sentence boundary: terminal punctuation followed by whitespace, or a line break.
static SENTENCE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]\s+|\n").expect("Invalid sentence regex"));

// =============================================================================
// Input
// =============================================================================

/// An exam question as loaded from the input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    /// Full question text: vignette plus the final interrogative sentence.
    pub stem: String,
    pub correct_answer: String,
    #[serde(default)]
    pub distractors: Vec<String>,
    /// Answer options as displayed, e.g. `"(A) Lisinopril"`.
    #[serde(default)]
    pub choices: Vec<String>,
}

impl Question {
    /// The stem's final interrogative sentence, if it has one.
    pub fn final_question(&self) -> Option<&str> {
        let stem = self.stem.trim();
        let head = &stem[..stem.rfind('?')? + 1];
        let start = SENTENCE_END
            .find_iter(head)
            .last()
            .map_or(0, |m| m.end());
        Some(head[start..].trim())
    }
}

// =============================================================================
// Facts
// =============================================================================

/// Fixed clinical category vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Demographics,
    RiskFactors,
    Symptoms,
    TimingCourse,
    PhysicalExam,
    LabsImaging,
    NegativeFindings,
    Context,
    Other,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Demographics,
        Category::RiskFactors,
        Category::Symptoms,
        Category::TimingCourse,
        Category::PhysicalExam,
        Category::LabsImaging,
        Category::NegativeFindings,
        Category::Context,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Demographics => "DEMOGRAPHICS",
            Category::RiskFactors => "RISK_FACTORS",
            Category::Symptoms => "SYMPTOMS",
            Category::TimingCourse => "TIMING_COURSE",
            Category::PhysicalExam => "PHYSICAL_EXAM",
            Category::LabsImaging => "LABS_IMAGING",
            Category::NegativeFindings => "NEGATIVE_FINDINGS",
            Category::Context => "CONTEXT",
            Category::Other => "OTHER",
        }
    }

    /// Map a model-supplied label onto the vocabulary; anything unknown is `Other`.
    pub fn from_label(label: &str) -> Self {
        let norm = label.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == norm)
            .unwrap_or(Category::Other)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One weighted clinical fact of a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalFact {
    /// Stable within a question: `f1`, `f2`, ... in extraction order.
    pub id: String,
    /// Position in extraction order (0-based).
    pub index: usize,
    pub text: String,
    /// Importance in [0, 1].
    pub weight: f64,
    #[serde(default)]
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_rationale: Option<String>,
}

impl ClinicalFact {
    pub fn new(index: usize, text: impl Into<String>, weight: f64) -> Self {
        Self {
            id: format!("f{}", index + 1),
            index,
            text: text.into(),
            weight,
            rationale: String::new(),
            category: None,
            category_confidence: None,
            category_rationale: None,
        }
    }
}

// =============================================================================
// Buckets and contrast sets
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    Answerable,
    HardButFair,
    BoundaryTest,
}

impl Bucket {
    pub const ALL: [Bucket; 3] = [Bucket::Answerable, Bucket::HardButFair, Bucket::BoundaryTest];

    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Answerable => "answerable",
            Bucket::HardButFair => "hard_but_fair",
            Bucket::BoundaryTest => "boundary_test",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts disclosed to one bucket of one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContrastSet {
    pub question_id: String,
    pub bucket: Bucket,
    /// Disclosed fact ids, in sampling order (weight descending).
    pub disclosed: Vec<String>,
    /// Share of the question's normalised weight that is disclosed, in [0, 1].
    pub disclosed_mass: f64,
    /// Critical facts deliberately withheld; empty except for `BoundaryTest`.
    #[serde(default)]
    pub withheld_critical: Vec<String>,
}

impl ContrastSet {
    pub fn discloses(&self, fact_id: &str) -> bool {
        self.disclosed.iter().any(|id| id == fact_id)
    }
}

// =============================================================================
// Narratives and benchmark entries
// =============================================================================

/// Coverage verdict for one disclosed fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactCoverage {
    pub fact_id: String,
    pub present: bool,
    #[serde(default)]
    pub evidence: String,
}

/// Rewritten narrative for one contrast set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientPrompt {
    pub question_id: String,
    pub bucket: Bucket,
    pub narrative: String,
    pub coverage_passed: bool,
    pub retry_count: u32,
    /// Result of the last coverage check.
    #[serde(default)]
    pub coverage: Vec<FactCoverage>,
    /// Non-disclosed fact ids the last check found in the narrative.
    #[serde(default)]
    pub leaked: Vec<String>,
}

/// One row of the final benchmark file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkEntry {
    pub question_id: String,
    pub bucket: Bucket,
    pub narrative: String,
    /// What the evaluation runner sends: narrative, question sentence, choices.
    pub prompt: String,
    pub expected_answer: String,
    pub distractors: Vec<String>,
    pub disclosed_fact_ids: Vec<String>,
    pub withheld_fact_ids: Vec<String>,
    pub disclosed_mass: f64,
    pub retry_count: u32,
}

/// A question and everything the stages so far have attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRecord {
    pub question: Question,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facts: Option<Vec<ClinicalFact>>,
    /// Answer the extractor chose, kept for audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contrast_sets: Option<Vec<ContrastSet>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Vec<PatientPrompt>>,
}

impl QuestionRecord {
    pub fn new(question: Question) -> Self {
        Self {
            question,
            facts: None,
            extracted_answer: None,
            contrast_sets: None,
            prompts: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.question.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(stem: &str) -> Question {
        Question {
            id: "q1".into(),
            stem: stem.into(),
            correct_answer: "(A) x".into(),
            distractors: vec![],
            choices: vec![],
        }
    }

    #[test]
    fn final_question_is_last_interrogative_sentence() {
        let q = question(
            "A 45-year-old man has chest pain. ECG shows ST elevation. Which is the next best step?",
        );
        assert_eq!(q.final_question(), Some("Which is the next best step?"));
        assert_eq!(question("No question here.").final_question(), None);
        assert_eq!(
            question("What is the diagnosis?").final_question(),
            Some("What is the diagnosis?")
        );
    }

    #[test]
    fn final_question_keeps_decimals_and_abbreviations() {
        let q = question("A man has fever. Which dose of 0.5 mg/kg is best?");
        assert_eq!(q.final_question(), Some("Which dose of 0.5 mg/kg is best?"));

        let q = question(
            "She was seen by Dr.Lee today.\nWhat is the most likely dx., given a Na of 128.4?",
        );
        assert_eq!(
            q.final_question(),
            Some("What is the most likely dx., given a Na of 128.4?")
        );
    }

    #[test]
    fn unknown_category_labels_map_to_other() {
        assert_eq!(Category::from_label("labs imaging"), Category::LabsImaging);
        assert_eq!(Category::from_label(" symptoms "), Category::Symptoms);
        assert_eq!(Category::from_label("HISTORY"), Category::Other);
    }

    #[test]
    fn record_round_trips_without_later_stage_fields() {
        let record = QuestionRecord::new(question("Why?"));
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("facts").is_none());
        let back: QuestionRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn bucket_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Bucket::HardButFair).unwrap(),
            "\"hard_but_fair\""
        );
    }
}
