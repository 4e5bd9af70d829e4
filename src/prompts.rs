//! Prompt templates for every structured call in the pipeline.
//!
//! Templates carry `{name}` placeholders; a [`Bindings`] value supplies them.
//! Bound values are XML-escaped because they are spliced inside tags.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::gateway::Message;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-z_]+)\}").expect("Invalid placeholder regex"));

/// Variable binding for a template render.
pub type Bindings = BTreeMap<&'static str, String>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("template {template} has no binding for {{{name}}}")]
    Unbound { template: &'static str, name: String },
}

/// Rendered prompt ready for the model.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters so bound text cannot close our tags.
pub fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// A prompt template with placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    pub fn render(&self, bindings: &Bindings) -> Result<PromptInstance, PromptError> {
        Ok(PromptInstance {
            template_slug: self.slug,
            system: self.fill(self.system, bindings)?.trim().to_string(),
            user: self.fill(self.user, bindings)?.trim().to_string(),
        })
    }

    fn fill(&self, text: &str, bindings: &Bindings) -> Result<String, PromptError> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            let name = &caps[1];
            let value = bindings.get(name).ok_or_else(|| PromptError::Unbound {
                template: self.slug,
                name: name.to_string(),
            })?;
            out.push_str(&text[last..whole.start()]);
            out.push_str(&escape_xml_chars(value));
            last = whole.end();
        }
        out.push_str(&text[last..]);
        Ok(out)
    }
}

// =============================================================================
// Templates
// =============================================================================

pub const EXTRACT_FACTS: PromptTemplate = PromptTemplate {
    slug: "extract_facts_v1",
    system: "\
You are a senior clinician. You receive one medical exam question and work in two phases.

PHASE 1 - EXTRACTION
List the patient-specific, clinically meaningful facts needed to answer the question.
- One standalone fact per item. Merge facts only when they cannot be separated.
- Only facts about the patient: demographics, symptoms, timing and course, examination \
findings, labs, imaging, test results, history, medications, exposures, context.
- Never extract the task itself, the answer choices, or anything that would stop being \
true if the question sentence and the choices were removed.
- Each item must be understandable without the original question.
- Give each item an importance weight from 0 to 10: how much answering correctly depends on it.
- Give each item a one-sentence rationale for its weight.
- Do not reason about the diagnosis or management in this phase.

PHASE 2 - ANSWER
Answer the question using only the extracted facts, leaning on the highest weights.
Quote the chosen option exactly as written in the choices, including its letter.

Respond with JSON only:
{
  \"facts\": [ {\"text\": \"...\", \"weight\": 0-10, \"rationale\": \"...\"} ],
  \"answer\": \"(B) ...\",
  \"justification\": \"...\"
}",
    user: "<question>\n{question}\n</question>\n\n<choices>\n{choices}\n</choices>",
};

pub const CLASSIFY_FACTS: PromptTemplate = PromptTemplate {
    slug: "classify_facts_v1",
    system: "\
You are a clinical information classifier. Each input line is one standalone fact with an id.
Assign every fact exactly one category:
- DEMOGRAPHICS: age, sex, pregnancy status, ethnicity, baseline characteristics
- RISK_FACTORS: past history, lifestyle, genetics, exposures, medications, comorbidities
- SYMPTOMS: complaints reported by the patient
- TIMING_COURSE: onset, duration, progression, acuity, sequence
- PHYSICAL_EXAM: objective findings on examination
- LABS_IMAGING: laboratory values, imaging, diagnostic test results
- NEGATIVE_FINDINGS: explicit denials or absent findings
- CONTEXT: situational context such as travel, hospitalization, surgery, delivery, trauma
- OTHER: only when nothing above fits

Classify by the fact's content alone. Do not infer diagnoses.
Confidence (0.00-1.00) is how clearly the fact fits the category, not how important it is.

Respond with JSON only:
{
  \"labels\": [ {\"fact_id\": \"f1\", \"category\": \"SYMPTOMS\", \"confidence\": 0.95, \"rationale\": \"...\"} ]
}",
    user: "<facts>\n{facts}\n</facts>",
};

pub const REWRITE_NARRATIVE: PromptTemplate = PromptTemplate {
    slug: "rewrite_narrative_v1",
    system: "\
You turn clinical facts into a short message a patient would type to a health chatbot.
- Write in the {voice}, in plain everyday language.
- Include EVERY listed fact. You may rephrase, but the meaning of each fact must survive.
- Do not add, infer or invent anything that is not listed. No diagnoses, no interpretation.
- Use medical terms only when they appear in the facts.
- Do not ask a question and do not address a clinician by name.
- If reviewer feedback lists problems with an earlier draft, fix every one of them.

Respond with JSON only:
{\"narrative\": \"...\"}",
    user: "<facts>\n{facts}\n</facts>\n\n<reviewer_feedback>\n{feedback}\n</reviewer_feedback>",
};

pub const VERIFY_COVERAGE: PromptTemplate = PromptTemplate {
    slug: "verify_coverage_v1",
    system: "\
You are a strict coverage verifier. You receive facts that must appear in a patient message, \
facts that must NOT appear, and the message itself.
- For each required fact decide whether the message states it or faithfully rephrases it. \
Weak implication does not count. Quote short evidence from the message when present.
- List the ids of forbidden facts whose meaning appears in the message.
- Judge only from the texts given; use no outside knowledge.

Respond with JSON only:
{
  \"disclosed\": [ {\"fact_id\": \"f1\", \"present\": true, \"evidence\": \"...\"} ],
  \"leaked\": [\"f4\"]
}",
    user: "<required_facts>\n{disclosed}\n</required_facts>\n\n<forbidden_facts>\n{withheld}\n</forbidden_facts>\n\n<message>\n{narrative}\n</message>",
};

/// Correction appended after a reply that failed validation.
pub fn correction_message(violation: &str, required_fields: &str) -> String {
    format!(
        "Your previous reply was rejected: {violation}\n\
         Fix your output. Reply with a single JSON object containing the required fields \
         ({required_fields}) and nothing else."
    )
}

pub fn bindings<const N: usize>(pairs: [(&'static str, String); N]) -> Bindings {
    pairs.into_iter().collect()
}
