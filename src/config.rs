//! Pipeline configuration document.
//!
//! Loaded once from JSON, validated, then passed by reference into every stage.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::{ChatModel, GatewayConfig, RetryPolicy};
use crate::sample::SamplerParams;
use crate::structured::SeedMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unknown step {0:?} (expected extract, classify, sample, rewrite or finalize)")]
    UnknownStep(String),
    #[error("steps must not be empty")]
    NoSteps,
    #[error("step {0} listed more than once")]
    DuplicateStep(Step),
    #[error("step {0} is out of pipeline order")]
    StepOrder(Step),
    #[error("{name} must be in (0, 1], got {value}")]
    Threshold { name: &'static str, value: f64 },
    #[error("hard_mass_threshold {hard} exceeds answerable_mass_threshold {answerable}")]
    ThresholdOrder { hard: f64, answerable: f64 },
    #[error("{name} must be in [0, 2], got {value}")]
    Temperature { name: &'static str, value: f32 },
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("min_facts must be at least 2, got {0}")]
    MinFacts(usize),
    #[error("model name must not be empty")]
    EmptyModelName,
}

// =============================================================================
// Steps
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Step {
    Extract,
    Classify,
    Sample,
    Rewrite,
    Finalize,
}

impl Step {
    pub const ALL: [Step; 5] = [
        Step::Extract,
        Step::Classify,
        Step::Sample,
        Step::Rewrite,
        Step::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Extract => "extract",
            Step::Classify => "classify",
            Step::Sample => "sample",
            Step::Rewrite => "rewrite",
            Step::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Step::ALL
            .into_iter()
            .find(|step| step.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| ConfigError::UnknownStep(s.to_string()))
    }
}

impl TryFrom<String> for Step {
    type Error = ConfigError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Step> for String {
    fn from(step: Step) -> Self {
        step.as_str().to_string()
    }
}

/// Person the narrative is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeVoice {
    #[default]
    FirstPerson,
    ThirdPerson,
}

impl NarrativeVoice {
    pub fn describe(&self) -> &'static str {
        match self {
            NarrativeVoice::FirstPerson => "first person, as the patient (\"I have...\")",
            NarrativeVoice::ThirdPerson => {
                "third person, as a relative describing the patient (\"My father has...\")"
            }
        }
    }
}

// =============================================================================
// Config
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub model: ChatModel,
    /// Temperature for extraction, classification and rewriting (default: 0.6).
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Temperature for coverage verification (default: 0.0).
    #[serde(default)]
    pub verify_temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Per-attempt deadline (default: 120s).
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// When set, every attempt of a call sends this seed.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_answerable_mass_threshold")]
    pub answerable_mass_threshold: f64,
    #[serde(default = "default_hard_mass_threshold")]
    pub hard_mass_threshold: f64,
    #[serde(default = "default_critical_weight_threshold")]
    pub critical_weight_threshold: f64,
    /// Token-overlap ratio above which two extracted facts are duplicates.
    #[serde(default = "default_dedup_overlap_threshold")]
    pub dedup_overlap_threshold: f64,
    #[serde(default = "default_min_facts")]
    pub min_facts: usize,
    /// Reject extractions whose chosen answer differs from the correct one.
    #[serde(default = "default_true")]
    pub verify_extracted_answer: bool,
    #[serde(default)]
    pub narrative_voice: NarrativeVoice,

    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Local per-provider request budget.
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default = "default_steps")]
    pub steps: Vec<Step>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
    /// Reuse records already present in a stage's output file.
    #[serde(default)]
    pub resume: bool,
}

fn default_temperature() -> f32 {
    0.6
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1000
}
fn default_retry_max_delay_ms() -> u64 {
    30_000
}
fn default_call_timeout_secs() -> u64 {
    120
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_answerable_mass_threshold() -> f64 {
    0.8
}
fn default_hard_mass_threshold() -> f64 {
    0.5
}
fn default_critical_weight_threshold() -> f64 {
    0.3
}
fn default_dedup_overlap_threshold() -> f64 {
    0.8
}
fn default_min_facts() -> usize {
    2
}
fn default_true() -> bool {
    true
}
fn default_concurrency_limit() -> usize {
    4
}
fn default_steps() -> Vec<Step> {
    Step::ALL.to_vec()
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}
fn default_output_prefix() -> String {
    "benchmark".to_string()
}

impl PipelineConfig {
    /// Config with every default and the given model.
    pub fn new(model: ChatModel) -> Self {
        Self {
            model,
            temperature: default_temperature(),
            verify_temperature: 0.0,
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            call_timeout_secs: default_call_timeout_secs(),
            seed: None,
            max_tokens: default_max_tokens(),
            answerable_mass_threshold: default_answerable_mass_threshold(),
            hard_mass_threshold: default_hard_mass_threshold(),
            critical_weight_threshold: default_critical_weight_threshold(),
            dedup_overlap_threshold: default_dedup_overlap_threshold(),
            min_facts: default_min_facts(),
            verify_extracted_answer: true,
            narrative_voice: NarrativeVoice::default(),
            concurrency_limit: default_concurrency_limit(),
            requests_per_minute: None,
            steps: default_steps(),
            output_dir: default_output_dir(),
            output_prefix: default_output_prefix(),
            resume: false,
        }
    }

    /// Read, parse and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.name.trim().is_empty() {
            return Err(ConfigError::EmptyModelName);
        }
        for (name, value) in [
            ("answerable_mass_threshold", self.answerable_mass_threshold),
            ("hard_mass_threshold", self.hard_mass_threshold),
            ("critical_weight_threshold", self.critical_weight_threshold),
            ("dedup_overlap_threshold", self.dedup_overlap_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ConfigError::Threshold { name, value });
            }
        }
        if self.hard_mass_threshold > self.answerable_mass_threshold {
            return Err(ConfigError::ThresholdOrder {
                hard: self.hard_mass_threshold,
                answerable: self.answerable_mass_threshold,
            });
        }
        for (name, value) in [
            ("temperature", self.temperature),
            ("verify_temperature", self.verify_temperature),
        ] {
            if !(0.0..=2.0).contains(&value) {
                return Err(ConfigError::Temperature { name, value });
            }
        }
        if self.concurrency_limit == 0 {
            return Err(ConfigError::Zero("concurrency_limit"));
        }
        if self.min_facts < 2 {
            return Err(ConfigError::MinFacts(self.min_facts));
        }
        if self.requests_per_minute == Some(0) {
            return Err(ConfigError::Zero("requests_per_minute"));
        }
        validate_steps(&self.steps)
    }

    pub fn runs(&self, step: Step) -> bool {
        self.steps.contains(&step)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            requests_per_minute: self.requests_per_minute,
        }
    }

    pub fn seed_mode(&self) -> SeedMode {
        SeedMode::from_config(self.seed)
    }

    pub fn sampler_params(&self) -> SamplerParams {
        SamplerParams {
            answerable_mass_threshold: self.answerable_mass_threshold,
            hard_mass_threshold: self.hard_mass_threshold,
            critical_weight_threshold: self.critical_weight_threshold,
            min_facts: self.min_facts,
        }
    }
}

fn validate_steps(steps: &[Step]) -> Result<(), ConfigError> {
    if steps.is_empty() {
        return Err(ConfigError::NoSteps);
    }
    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(*step) {
            return Err(ConfigError::DuplicateStep(*step));
        }
    }
    for pair in steps.windows(2) {
        if pair[1] < pair[0] {
            return Err(ConfigError::StepOrder(pair[1]));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Provider;

    const MINIMAL: &str = r#"{"model": {"provider": "openrouter", "name": "openai/gpt-5-mini"}}"#;

    #[test]
    fn defaults_fill_a_minimal_document() {
        let config = PipelineConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.model.provider, Provider::OpenRouter);
        assert!((config.temperature - 0.6).abs() < 1e-6);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.steps, Step::ALL.to_vec());
        assert_eq!(config.concurrency_limit, 4);
        assert_eq!(config.seed_mode(), SeedMode::PerAttempt);
        assert_eq!(config.retry_policy().max_attempts(), 4);
        assert_eq!(config.gateway_config().call_timeout, Duration::from_secs(120));
    }

    #[test]
    fn unknown_step_is_config_error() {
        let raw = r#"{
            "model": {"provider": "openai", "name": "m"},
            "steps": ["extract", "polish"]
        }"#;
        let err = PipelineConfig::from_json(raw).unwrap_err();
        assert!(err.to_string().contains("polish"), "{err}");
    }

    #[test]
    fn steps_must_be_unique_and_ordered() {
        let mut config = PipelineConfig::new(ChatModel::new(Provider::OpenAi, "m"));
        config.steps = vec![Step::Sample, Step::Sample];
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateStep(Step::Sample))));

        config.steps = vec![Step::Rewrite, Step::Sample];
        assert!(matches!(config.validate(), Err(ConfigError::StepOrder(Step::Sample))));

        config.steps = vec![];
        assert!(matches!(config.validate(), Err(ConfigError::NoSteps)));

        config.steps = vec![Step::Sample, Step::Rewrite, Step::Finalize];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn thresholds_are_checked() {
        let mut config = PipelineConfig::new(ChatModel::new(Provider::OpenAi, "m"));
        config.hard_mass_threshold = 0.9;
        assert!(matches!(config.validate(), Err(ConfigError::ThresholdOrder { .. })));

        config.hard_mass_threshold = 0.5;
        config.critical_weight_threshold = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Threshold { name: "critical_weight_threshold", .. })
        ));
    }

    #[test]
    fn other_fields_are_checked() {
        let mut config = PipelineConfig::new(ChatModel::new(Provider::OpenAi, " "));
        assert!(matches!(config.validate(), Err(ConfigError::EmptyModelName)));

        config.model.name = "m".into();
        config.concurrency_limit = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Zero("concurrency_limit"))));

        config.concurrency_limit = 2;
        config.temperature = 2.5;
        assert!(matches!(config.validate(), Err(ConfigError::Temperature { .. })));

        config.temperature = 0.6;
        config.min_facts = 1;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::MinFacts(1)));
        assert_eq!(err.to_string(), "min_facts must be at least 2, got 1");
    }

    #[test]
    fn misspelled_keys_are_rejected() {
        let raw = r#"{
            "model": {"provider": "openai", "name": "m"},
            "answerable_mass_treshold": 0.95,
            "concurency_limit": 64
        }"#;
        let err = PipelineConfig::from_json(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "{err}");
        assert!(err.to_string().contains("answerable_mass_treshold"), "{err}");

        let raw = r#"{"model": {"provider": "openai", "name": "m", "temprature": 0.1}}"#;
        assert!(matches!(
            PipelineConfig::from_json(raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn fixed_seed_from_config() {
        let raw = r#"{"model": {"provider": "openai", "name": "m"}, "seed": 7}"#;
        let config = PipelineConfig::from_json(raw).unwrap();
        assert_eq!(config.seed_mode(), SeedMode::Fixed(7));
    }
}
