#![forbid(unsafe_code)]

//! # clinical-contrast
//!
//! Turns clinical exam questions into difficulty-stratified patient prompts for
//! benchmarking how reliably language models answer medical questions.
//!
//! Each question goes through five stages: extract weighted facts, classify
//! them, sample three contrast sets (answerable, hard but fair, boundary test)
//! that disclose less and less of the decisive information, rewrite each set
//! into a patient narrative whose fact coverage is verified, and assemble the
//! benchmark file. Every model call goes through [`structured`], which
//! validates replies against a schema and retries.

pub mod artifacts;
pub mod classify;
pub mod config;
pub mod extract;
pub mod finalize;
pub mod gateway;
pub mod pipeline;
pub mod prompts;
pub mod rewrite;
pub mod sample;
pub mod structured;
pub mod types;

pub use artifacts::{ArtifactPaths, FailureRecord, FailureSink, JsonlFailureSink};
pub use config::{ConfigError, PipelineConfig, Step};
pub use gateway::{Attribution, ChatGateway, ProviderError, ProviderGateway, UsageSink};
pub use pipeline::{Pipeline, PipelineError, RunReport};
pub use sample::{sample_contrast_sets, SampleRejection, SamplerParams};
pub use structured::{StructuredError, StructuredGateway, ValidationError};
pub use types::{
    BenchmarkEntry, Bucket, Category, ClinicalFact, ContrastSet, PatientPrompt, Question,
    QuestionRecord,
};
