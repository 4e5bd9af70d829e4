//! Structured calls: render a prompt, call the model, validate the JSON reply
//! against a response schema, and retry.
//!
//! Provider failures are retried with exponential backoff and jitter. An
//! invalid reply gets one corrective re-prompt (the rejected reply plus a
//! "fix your output" note) and the next attempt is judged on its own. Both
//! kinds of retry draw on the same `max_retries` budget, so a call makes at
//! most `max_retries + 1` attempts and `retry_count` is `attempts - 1`.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::gateway::{
    Attribution, ChatGateway, ChatModel, ChatRequest, Message, ProviderError, RetryPolicy,
};
use crate::prompts::{correction_message, Bindings, PromptError, PromptTemplate};

// =============================================================================
// Schema
// =============================================================================

/// Expected JSON type of a reply field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array(Box<FieldType>),
    Object(ResponseSchema),
}

impl FieldType {
    pub fn array_of(item: FieldType) -> Self {
        FieldType::Array(Box::new(item))
    }

    fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Array(_) => "array",
            FieldType::Object(_) => "object",
        }
    }

    fn check(&self, value: &Value, path: &str) -> Result<(), ValidationError> {
        let ok = match (self, value) {
            (FieldType::String, Value::String(_)) => true,
            (FieldType::Number, Value::Number(_)) => true,
            (FieldType::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
            (FieldType::Boolean, Value::Bool(_)) => true,
            (FieldType::Array(item), Value::Array(items)) => {
                for (i, v) in items.iter().enumerate() {
                    item.check(v, &format!("{path}[{i}]"))?;
                }
                true
            }
            (FieldType::Object(schema), Value::Object(_)) => {
                schema.check_at(value, path)?;
                true
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(ValidationError::WrongType {
                path: path.to_string(),
                expected: self.name(),
                found: json_type_name(value),
            })
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Ordered set of required, typed fields of a JSON object.
///
/// Fields not listed are allowed and ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseSchema {
    fields: Vec<(&'static str, FieldType)>,
}

impl ResponseSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &'static str, ty: FieldType) -> Self {
        self.fields.push((name, ty));
        self
    }

    /// Comma-separated field names, used in correction prompts.
    pub fn field_list(&self) -> String {
        self.fields
            .iter()
            .map(|(name, _)| *name)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        self.check_at(value, "$")
    }

    fn check_at(&self, value: &Value, path: &str) -> Result<(), ValidationError> {
        let Value::Object(map) = value else {
            return Err(ValidationError::WrongType {
                path: path.to_string(),
                expected: "object",
                found: json_type_name(value),
            });
        };
        for (name, ty) in &self.fields {
            let field_path = format!("{path}.{name}");
            match map.get(*name) {
                None | Some(Value::Null) => {
                    return Err(ValidationError::MissingField { path: field_path })
                }
                Some(v) => ty.check(v, &field_path)?,
            }
        }
        Ok(())
    }
}

/// A reply type with a declared response schema.
pub trait StructuredReply: DeserializeOwned + Send {
    fn schema() -> ResponseSchema;
}

// =============================================================================
// Errors
// =============================================================================

/// The model's reply did not satisfy the response contract.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("missing required field {path}")]
    MissingField { path: String },

    #[error("field {path} should be {expected}, got {found}")]
    WrongType {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("reply is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("reply does not match the expected shape: {0}")]
    Mismatch(String),

    #[error("{0}")]
    Semantic(String),
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::MissingField { .. } => "missing_field",
            ValidationError::WrongType { .. } => "wrong_type",
            ValidationError::InvalidJson(_) => "invalid_json",
            ValidationError::Mismatch(_) => "schema_mismatch",
            ValidationError::Semantic(_) => "semantic",
        }
    }
}

#[derive(Debug, Error)]
pub enum StructuredError {
    #[error("provider failed after {attempts} attempt(s): {source}")]
    Provider {
        #[source]
        source: ProviderError,
        attempts: u32,
    },

    #[error("invalid output after {attempts} attempt(s): {source}")]
    Validation {
        #[source]
        source: ValidationError,
        attempts: u32,
    },

    #[error(transparent)]
    Prompt(#[from] PromptError),
}

impl StructuredError {
    pub fn attempts(&self) -> u32 {
        match self {
            StructuredError::Provider { attempts, .. } => *attempts,
            StructuredError::Validation { attempts, .. } => *attempts,
            StructuredError::Prompt(_) => 0,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            StructuredError::Provider { source, .. } => source.code(),
            StructuredError::Validation { source, .. } => source.code(),
            StructuredError::Prompt(_) => "prompt_error",
        }
    }
}

// =============================================================================
// JSON extraction
// =============================================================================

/// Extract a JSON object from potentially noisy model output.
///
/// Handles bare JSON, JSON in markdown fences, and JSON embedded in prose.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();

    if trimmed.starts_with('{') {
        if let Some(end) = find_matching_brace(trimmed) {
            return &trimmed[..end];
        }
    }

    if let Some(start) = trimmed.find('{') {
        let remainder = &trimmed[start..];
        if let Some(end) = find_matching_brace(remainder) {
            return &remainder[..end];
        }
    }

    trimmed
}

/// Byte offset just past the brace closing the first `{`, ignoring braces in strings.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse and schema-check a raw model reply.
pub fn parse_reply<T: StructuredReply>(raw: &str) -> Result<T, ValidationError> {
    let json = extract_json(raw);
    let value: Value = serde_json::from_str(json).map_err(|e| {
        let preview: String = raw.chars().take(200).collect();
        ValidationError::InvalidJson(format!("{e} (reply starts: {preview:?})"))
    })?;
    T::schema().validate(&value)?;
    serde_json::from_value(value).map_err(|e| ValidationError::Mismatch(e.to_string()))
}

// =============================================================================
// Gateway
// =============================================================================

/// Seed policy for the attempts of one logical call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedMode {
    /// Every attempt sends the same seed.
    Fixed(u64),
    /// Each attempt draws a fresh seed.
    #[default]
    PerAttempt,
}

impl SeedMode {
    pub fn from_config(seed: Option<u64>) -> Self {
        seed.map(SeedMode::Fixed).unwrap_or_default()
    }
}

/// One logical call: a template, its binding, and per-call settings.
#[derive(Debug, Clone)]
pub struct StructuredCall<'a> {
    pub template: &'a PromptTemplate,
    pub bindings: Bindings,
    pub attribution: Attribution,
    pub temperature: f32,
}

impl<'a> StructuredCall<'a> {
    pub fn new(template: &'a PromptTemplate, bindings: Bindings, attribution: Attribution) -> Self {
        Self {
            template,
            bindings,
            attribution,
            temperature: 0.0,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }
}

/// A validated reply and how many retries it took.
#[derive(Debug, Clone)]
pub struct Structured<T> {
    pub value: T,
    pub retry_count: u32,
    /// Raw text of the accepted reply.
    pub raw: String,
}

#[derive(Clone)]
pub struct StructuredGateway {
    gateway: Arc<dyn ChatGateway>,
    model: ChatModel,
    policy: RetryPolicy,
    max_tokens: u32,
    seed_mode: SeedMode,
}

impl fmt::Debug for StructuredGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructuredGateway")
            .field("model", &self.model)
            .field("policy", &self.policy)
            .field("max_tokens", &self.max_tokens)
            .field("seed_mode", &self.seed_mode)
            .finish_non_exhaustive()
    }
}

impl StructuredGateway {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: ChatModel, policy: RetryPolicy) -> Self {
        Self {
            gateway,
            model,
            policy,
            max_tokens: 4096,
            seed_mode: SeedMode::PerAttempt,
        }
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = max;
        self
    }

    pub fn seed_mode(mut self, mode: SeedMode) -> Self {
        self.seed_mode = mode;
        self
    }

    pub async fn call<T: StructuredReply>(
        &self,
        call: StructuredCall<'_>,
    ) -> Result<Structured<T>, StructuredError> {
        self.call_validated(call, |_: &T| Ok(())).await
    }

    /// Like [`call`](Self::call), with an extra semantic check on the parsed value.
    /// A check failure is a [`ValidationError::Semantic`] and is corrected like any other.
    pub async fn call_validated<T, F>(
        &self,
        call: StructuredCall<'_>,
        check: F,
    ) -> Result<Structured<T>, StructuredError>
    where
        T: StructuredReply,
        F: Fn(&T) -> Result<(), String> + Send + Sync,
    {
        let prompt = call.template.render(&call.bindings)?;
        let base = prompt.to_messages();
        let required = T::schema().field_list();
        let question_id = call.attribution.question_id.clone().unwrap_or_default();

        let mut correction: Option<(String, String)> = None;
        let mut attempt = 0u32;
        loop {
            let mut messages = base.clone();
            if let Some((rejected, note)) = &correction {
                messages.push(Message::assistant(rejected.as_str()));
                messages.push(Message::user(note.as_str()));
            }
            let seed = match self.seed_mode {
                SeedMode::Fixed(seed) => seed,
                SeedMode::PerAttempt => rand::random(),
            };
            let req = ChatRequest::new(self.model.clone(), messages, call.attribution.clone())
                .temperature(call.temperature)
                .max_tokens(self.max_tokens)
                .seed(seed)
                .json();

            match self.gateway.chat(req).await {
                Err(err) => {
                    if !self.policy.retries_provider_error(&err, attempt) {
                        return Err(StructuredError::Provider {
                            source: err,
                            attempts: attempt + 1,
                        });
                    }
                    let delay = self
                        .policy
                        .backoff(attempt, Some(&err), &mut rand::thread_rng());
                    tracing::warn!(
                        caller = call.attribution.caller,
                        question_id = %question_id,
                        attempt = attempt + 1,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(resp) => {
                    let parsed = parse_reply::<T>(&resp.content).and_then(|value| {
                        check(&value).map_err(ValidationError::Semantic)?;
                        Ok(value)
                    });
                    match parsed {
                        Ok(value) => {
                            return Ok(Structured {
                                value,
                                retry_count: attempt,
                                raw: resp.content,
                            })
                        }
                        Err(violation) => {
                            if !self.policy.corrects_invalid_output(attempt) {
                                return Err(StructuredError::Validation {
                                    source: violation,
                                    attempts: attempt + 1,
                                });
                            }
                            tracing::warn!(
                                caller = call.attribution.caller,
                                question_id = %question_id,
                                attempt = attempt + 1,
                                violation = %violation,
                                "invalid model output, re-prompting with correction"
                            );
                            let note = correction_message(&violation.to_string(), &required);
                            correction = Some((resp.content, note));
                        }
                    }
                }
            }
            attempt += 1;
        }
    }
}
