//! Stage runner.
//!
//! Runs the configured steps in order. Each per-question stage fans out over a
//! bounded worker pool, re-sorts results into input order, persists its output
//! file and logs item-level failures. Item failures never stop the run; only
//! config errors, I/O errors, an abort, or a run with no survivors do.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{future, stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::artifacts::{
    read_questions, read_records, write_json, ArtifactError, ArtifactPaths, FailureRecord,
    FailureSink, JsonlFailureSink,
};
use crate::classify::{category_distribution, classify_facts};
use crate::config::{ConfigError, PipelineConfig, Step};
use crate::extract::extract_facts;
use crate::finalize::finalize_records;
use crate::gateway::{
    Attribution, ChatGateway, ProviderError, ProviderGateway, TracingUsageSink,
};
use crate::rewrite::rewrite_contrast_set;
use crate::sample::sample_contrast_sets;
use crate::structured::StructuredGateway;
use crate::types::QuestionRecord;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error("gateway setup failed: {0}")]
    Gateway(#[from] ProviderError),
    #[error("first step is extract but no input file was given")]
    MissingInput,
    #[error("run aborted during {stage} with {remaining} question(s) not dispatched")]
    Aborted { stage: Step, remaining: usize },
    #[error("no question survived the run ({})", summarize_causes(.causes))]
    NoSurvivors { causes: BTreeMap<String, usize> },
}

fn summarize_causes(causes: &BTreeMap<String, usize>) -> String {
    if causes.is_empty() {
        return "no input questions".to_string();
    }
    causes
        .iter()
        .map(|(cause, n)| format!("{cause} x{n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// Reports
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub stage: Step,
    /// Questions handed to the stage.
    pub processed: usize,
    /// Questions taken from a previous run's output instead of reprocessed.
    pub reused: usize,
    pub kept: usize,
    /// Questions dropped by the stage.
    pub failed: usize,
    /// Failure log entries by kind, including ones that did not drop a question.
    pub failure_kinds: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    /// blake3 of the serialized config.
    pub config_hash: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub benchmark_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub benchmark_entries: Option<usize>,
    pub incomplete_questions: Vec<String>,
}

/// Result of one question in one stage.
struct ItemOutcome {
    record: Option<QuestionRecord>,
    failures: Vec<FailureRecord>,
}

impl ItemOutcome {
    fn kept(record: QuestionRecord) -> Self {
        Self {
            record: Some(record),
            failures: Vec::new(),
        }
    }

    fn failed(failure: FailureRecord) -> Self {
        Self {
            record: None,
            failures: vec![failure],
        }
    }
}

/// Hex blake3 digest of the config as JSON.
pub fn config_hash(config: &PipelineConfig) -> String {
    let bytes = serde_json::to_vec(config).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct Pipeline {
    structured: StructuredGateway,
    config: PipelineConfig,
    paths: ArtifactPaths,
    run_id: Uuid,
    abort: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let structured =
            StructuredGateway::new(gateway, config.model.clone(), config.retry_policy())
                .max_tokens(config.max_tokens)
                .seed_mode(config.seed_mode());
        let paths = ArtifactPaths::new(&config.output_dir, &config.output_prefix);
        Ok(Self {
            structured,
            config,
            paths,
            run_id: Uuid::new_v4(),
            abort: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Pipeline over the real provider named in the config, credentials from env.
    pub fn from_env(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let gateway = ProviderGateway::from_env(
            &[config.model.provider],
            Arc::new(TracingUsageSink),
            config.gateway_config(),
        )?;
        Self::new(Arc::new(gateway), config)
    }

    /// Share an abort flag; once set, no new question is dispatched.
    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = flag;
        self
    }

    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.abort.clone()
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    pub async fn run(&self, input: Option<&Path>) -> Result<RunReport, PipelineError> {
        let started_at = Utc::now();
        let config_hash = config_hash(&self.config);
        tracing::info!(
            run_id = %self.run_id,
            config_hash = %config_hash,
            model = %self.config.model,
            steps = ?self.config.steps,
            "pipeline run starting"
        );

        let mut records = self.initial_records(input)?;
        let mut stages = Vec::new();
        let mut causes: BTreeMap<String, usize> = BTreeMap::new();
        let mut benchmark = None;
        let mut incomplete_questions = Vec::new();

        for &step in &self.config.steps {
            let input = std::mem::take(&mut records);
            let (kept, summary) = match step {
                Step::Extract => self.run_stage(step, input, |r| self.extract_one(r)).await?,
                Step::Classify => self.run_stage(step, input, |r| self.classify_one(r)).await?,
                Step::Sample => self.run_stage(step, input, |r| self.sample_one(r)).await?,
                Step::Rewrite => self.run_stage(step, input, |r| self.rewrite_one(r)).await?,
                Step::Finalize => {
                    let (entries, incomplete, summary) = self.finalize(&input)?;
                    benchmark = Some(entries);
                    incomplete_questions = incomplete;
                    (input, summary)
                }
            };
            records = kept;
            for (kind, n) in &summary.failure_kinds {
                *causes.entry(format!("{step}:{kind}")).or_insert(0) += n;
            }
            stages.push(summary);
        }

        let survivors = benchmark.unwrap_or(records.len());
        if survivors == 0 {
            return Err(PipelineError::NoSurvivors { causes });
        }

        let ran_finalize = self.config.runs(Step::Finalize);
        Ok(RunReport {
            run_id: self.run_id,
            config_hash,
            started_at,
            finished_at: Utc::now(),
            stages,
            benchmark_path: ran_finalize.then(|| self.paths.output(Step::Finalize)),
            benchmark_entries: benchmark,
            incomplete_questions,
        })
    }

    fn initial_records(&self, input: Option<&Path>) -> Result<Vec<QuestionRecord>, PipelineError> {
        let first = self.config.steps.first().copied().unwrap_or(Step::Extract);
        if first == Step::Extract {
            let path = input.ok_or(PipelineError::MissingInput)?;
            let questions = read_questions(path)?;
            tracing::info!(
                path = %path.display(),
                questions = questions.len(),
                "loaded input questions"
            );
            return Ok(questions.into_iter().map(QuestionRecord::new).collect());
        }

        let path = match input {
            Some(path) => path.to_path_buf(),
            None => {
                let pos = Step::ALL.iter().position(|s| *s == first).unwrap_or(0);
                self.paths.output(Step::ALL[pos.saturating_sub(1)])
            }
        };
        let records = read_records(&path)?;
        tracing::info!(
            path = %path.display(),
            records = records.len(),
            first_step = %first,
            "resuming from stage output"
        );
        Ok(records)
    }

    fn attribution(&self, caller: &'static str, question_id: &str) -> Attribution {
        Attribution::new(caller)
            .with_run(self.run_id)
            .with_question(question_id)
    }

    fn failure(
        &self,
        step: Step,
        question_id: &str,
        kind: &str,
        cause: impl ToString,
    ) -> FailureRecord {
        FailureRecord::new(self.run_id, step, question_id, kind, cause)
    }

    async fn run_stage<F, Fut>(
        &self,
        step: Step,
        records: Vec<QuestionRecord>,
        work: F,
    ) -> Result<(Vec<QuestionRecord>, StageSummary), PipelineError>
    where
        F: Fn(QuestionRecord) -> Fut,
        Fut: Future<Output = ItemOutcome>,
    {
        let output = self.paths.output(step);
        let mut previous: HashMap<String, QuestionRecord> =
            if self.config.resume && output.exists() {
                read_records(&output)?
                    .into_iter()
                    .map(|r| (r.id().to_string(), r))
                    .collect()
            } else {
                HashMap::new()
            };

        let total = records.len();
        let mut slots: Vec<Option<QuestionRecord>> = vec![None; total];
        let mut pending = Vec::new();
        let mut reused = 0;
        for (idx, record) in records.into_iter().enumerate() {
            match previous.remove(record.id()) {
                Some(done) => {
                    slots[idx] = Some(done);
                    reused += 1;
                }
                None => pending.push((idx, record)),
            }
        }

        let pending_count = pending.len();
        tracing::info!(
            stage = %step,
            questions = total,
            reused,
            pending = pending_count,
            "stage starting"
        );

        let abort = self.abort.as_ref();
        let work = &work;
        let results: Vec<(usize, ItemOutcome)> = stream::iter(pending)
            .take_while(|_| future::ready(!abort.load(Ordering::SeqCst)))
            .map(|(idx, record)| async move { (idx, work(record).await) })
            .buffer_unordered(self.config.concurrency_limit)
            .collect()
            .await;
        let dispatched = results.len();

        let (sink, worker) =
            JsonlFailureSink::open(&self.paths.failures(step), self.config.resume)?;
        let mut failed = 0;
        let mut failure_kinds = BTreeMap::new();
        for (idx, outcome) in results {
            for failure in outcome.failures {
                *failure_kinds.entry(failure.kind.clone()).or_insert(0) += 1;
                sink.record(failure)?;
            }
            match outcome.record {
                Some(record) => slots[idx] = Some(record),
                None => failed += 1,
            }
        }
        drop(sink);
        worker.join()?;

        let kept: Vec<QuestionRecord> = slots.into_iter().flatten().collect();
        write_json(&output, &kept)?;

        let summary = StageSummary {
            stage: step,
            processed: total,
            reused,
            kept: kept.len(),
            failed,
            failure_kinds,
        };
        tracing::info!(
            stage = %step,
            processed = summary.processed,
            kept = summary.kept,
            failed = summary.failed,
            reused = summary.reused,
            output = %output.display(),
            "stage finished"
        );

        if dispatched < pending_count {
            tracing::warn!(
                stage = %step,
                remaining = pending_count - dispatched,
                "abort requested, stopping"
            );
            return Err(PipelineError::Aborted {
                stage: step,
                remaining: pending_count - dispatched,
            });
        }

        if step == Step::Classify {
            let distribution =
                category_distribution(kept.iter().flat_map(|r| r.facts.iter().flatten()));
            tracing::info!(?distribution, "category distribution");
        }

        Ok((kept, summary))
    }

    // -------------------------------------------------------------------------
    // Per-question work
    // -------------------------------------------------------------------------

    async fn extract_one(&self, mut record: QuestionRecord) -> ItemOutcome {
        let id = record.id().to_string();
        let attribution = self.attribution("extract", &id);
        match extract_facts(&self.structured, &self.config, &record.question, attribution).await {
            Ok(extraction) => {
                tracing::debug!(
                    question_id = %id,
                    facts = extraction.facts.len(),
                    retries = extraction.retry_count,
                    "extracted"
                );
                record.facts = Some(extraction.facts);
                record.extracted_answer = Some(extraction.answer);
                record.contrast_sets = None;
                record.prompts = None;
                ItemOutcome::kept(record)
            }
            Err(err) => {
                tracing::warn!(question_id = %id, error = %err, "extraction failed");
                ItemOutcome::failed(self.failure(Step::Extract, &id, err.code(), &err))
            }
        }
    }

    async fn classify_one(&self, mut record: QuestionRecord) -> ItemOutcome {
        let id = record.id().to_string();
        let Some(facts) = record.facts.as_deref() else {
            return ItemOutcome::failed(self.failure(
                Step::Classify,
                &id,
                "missing_facts",
                "record has no extracted facts",
            ));
        };
        let attribution = self.attribution("classify", &id);
        match classify_facts(&self.structured, &self.config, facts, attribution).await {
            Ok((classified, _retries)) => {
                record.facts = Some(classified);
                ItemOutcome::kept(record)
            }
            Err(err) => {
                tracing::warn!(question_id = %id, error = %err, "classification failed");
                ItemOutcome::failed(self.failure(Step::Classify, &id, err.code(), &err))
            }
        }
    }

    async fn sample_one(&self, mut record: QuestionRecord) -> ItemOutcome {
        let id = record.id().to_string();
        let Some(facts) = record.facts.as_deref() else {
            return ItemOutcome::failed(self.failure(
                Step::Sample,
                &id,
                "missing_facts",
                "record has no extracted facts",
            ));
        };
        match sample_contrast_sets(&id, facts, &self.config.sampler_params()) {
            Ok(sets) => {
                record.contrast_sets = Some(sets.to_vec());
                record.prompts = None;
                ItemOutcome::kept(record)
            }
            Err(rejection) => {
                tracing::warn!(
                    question_id = %id,
                    reason = %rejection,
                    "question skipped by sampler"
                );
                ItemOutcome::failed(self.failure(Step::Sample, &id, rejection.code(), &rejection))
            }
        }
    }

    async fn rewrite_one(&self, mut record: QuestionRecord) -> ItemOutcome {
        let id = record.id().to_string();
        let (Some(facts), Some(sets)) = (record.facts.as_deref(), record.contrast_sets.as_deref())
        else {
            return ItemOutcome::failed(self.failure(
                Step::Rewrite,
                &id,
                "missing_contrast_sets",
                "record was never sampled",
            ));
        };

        let mut prompts = Vec::new();
        let mut failures = Vec::new();
        for set in sets {
            let attribution = self.attribution("rewrite", &id);
            let outcome =
                rewrite_contrast_set(&self.structured, &self.config, facts, set, attribution).await;
            match outcome {
                Ok(prompt) => {
                    if !prompt.coverage_passed {
                        let missing: Vec<&str> = prompt
                            .coverage
                            .iter()
                            .filter(|c| !c.present)
                            .map(|c| c.fact_id.as_str())
                            .collect();
                        let cause = format!("missing {missing:?}, leaked {:?}", prompt.leaked);
                        failures.push(
                            self.failure(Step::Rewrite, &id, "coverage_failed", cause)
                                .bucket(set.bucket),
                        );
                    }
                    prompts.push(prompt);
                }
                Err(err) => {
                    tracing::warn!(
                        question_id = %id,
                        bucket = %set.bucket,
                        error = %err,
                        "rewrite failed"
                    );
                    failures.push(
                        self.failure(Step::Rewrite, &id, err.code(), &err)
                            .bucket(set.bucket),
                    );
                }
            }
        }

        record.prompts = Some(prompts);
        ItemOutcome {
            record: Some(record),
            failures,
        }
    }

    // -------------------------------------------------------------------------
    // Finalize
    // -------------------------------------------------------------------------

    fn finalize(
        &self,
        records: &[QuestionRecord],
    ) -> Result<(usize, Vec<String>, StageSummary), PipelineError> {
        let finalized = finalize_records(records);
        let output = self.paths.output(Step::Finalize);
        write_json(&output, &finalized.entries)?;

        let (sink, worker) =
            JsonlFailureSink::open(&self.paths.failures(Step::Finalize), self.config.resume)?;
        for err in &finalized.incomplete {
            sink.record(self.failure(Step::Finalize, &err.question_id, "incomplete_data", err))?;
        }
        drop(sink);
        worker.join()?;

        let incomplete: Vec<String> = finalized
            .incomplete
            .iter()
            .map(|e| e.question_id.clone())
            .collect();
        let mut failure_kinds = BTreeMap::new();
        if !incomplete.is_empty() {
            failure_kinds.insert("incomplete_data".to_string(), incomplete.len());
            tracing::warn!(questions = ?incomplete, "questions without a surviving bucket");
        }
        let summary = StageSummary {
            stage: Step::Finalize,
            processed: records.len(),
            reused: 0,
            kept: records.len() - incomplete.len(),
            failed: incomplete.len(),
            failure_kinds,
        };
        tracing::info!(
            entries = finalized.entries.len(),
            questions = summary.kept,
            incomplete = summary.failed,
            output = %output.display(),
            "benchmark written"
        );
        Ok((finalized.entries.len(), incomplete, summary))
    }
}
