//! Stage artifacts on disk and the per-stage failure log.
//!
//! Every stage writes `{prefix}_{name}.json` to the output directory and logs
//! item-level failures to `{prefix}_{stage}_failures.jsonl`.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Step;
use crate::types::{Bucket, Question, QuestionRecord};

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failure log channel closed")]
    Closed,
    #[error("failure log worker failed: {0}")]
    Join(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// =============================================================================
// Paths
// =============================================================================

#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    dir: PathBuf,
    prefix: String,
}

impl ArtifactPaths {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// Output file of `step`; also the input of the step after it.
    pub fn output(&self, step: Step) -> PathBuf {
        let name = match step {
            Step::Extract => "extracted",
            Step::Classify => "classified",
            Step::Sample => "sampled",
            Step::Rewrite => "rewritten",
            Step::Finalize => "benchmark",
        };
        self.dir.join(format!("{}_{name}.json", self.prefix))
    }

    pub fn failures(&self, step: Step) -> PathBuf {
        self.dir
            .join(format!("{}_{}_failures.jsonl", self.prefix, step.as_str()))
    }
}

// =============================================================================
// JSON files
// =============================================================================

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let raw = std::fs::read_to_string(path).map_err(io_err(path))?;
    serde_json::from_str(&raw).map_err(|source| ArtifactError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Write pretty JSON through a sibling temp file so readers never see a torn file.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    let tmp = path.with_extension("json.tmp");
    {
        let file = std::fs::File::create(&tmp).map_err(io_err(&tmp))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value).map_err(|source| ArtifactError::Json {
            path: tmp.clone(),
            source,
        })?;
        writer.flush().map_err(io_err(&tmp))?;
    }
    std::fs::rename(&tmp, path).map_err(io_err(path))
}

pub fn read_records(path: &Path) -> Result<Vec<QuestionRecord>, ArtifactError> {
    read_json(path)
}

/// Load input questions from a JSON array, or one question per line for `.jsonl`.
pub fn read_questions(path: &Path) -> Result<Vec<Question>, ArtifactError> {
    if path.extension().is_some_and(|ext| ext == "jsonl") {
        let raw = std::fs::read_to_string(path).map_err(io_err(path))?;
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|source| ArtifactError::Json {
                    path: path.to_path_buf(),
                    source,
                })
            })
            .collect()
    } else {
        read_json(path)
    }
}

// =============================================================================
// Failure log
// =============================================================================

/// One item-level failure, as written to a stage's failure log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub stage: Step,
    pub question_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<Bucket>,
    /// Short machine-readable cause, e.g. `missing_field` or `answer_mismatch`.
    pub kind: String,
    pub cause: String,
}

impl FailureRecord {
    pub fn new(
        run_id: Uuid,
        stage: Step,
        question_id: impl Into<String>,
        kind: impl Into<String>,
        cause: impl ToString,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id,
            stage,
            question_id: question_id.into(),
            bucket: None,
            kind: kind.into(),
            cause: cause.to_string(),
        }
    }

    pub fn bucket(mut self, bucket: Bucket) -> Self {
        self.bucket = Some(bucket);
        self
    }
}

pub trait FailureSink: Send + Sync {
    fn record(&self, failure: FailureRecord) -> Result<(), ArtifactError>;
}

/// Appends failures to a JSONL file from a dedicated writer thread.
#[derive(Clone)]
pub struct JsonlFailureSink {
    sender: mpsc::Sender<FailureRecord>,
}

pub struct FailureLogWorker {
    handle: Option<std::thread::JoinHandle<Result<(), ArtifactError>>>,
    path: PathBuf,
}

impl FailureLogWorker {
    /// Wait for every queued record to be flushed. Drop all sinks first.
    pub fn join(mut self) -> Result<(), ArtifactError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(ArtifactError::Join(format!(
                    "writer for {} panicked",
                    self.path.display()
                ))),
            },
            None => Ok(()),
        }
    }
}

impl JsonlFailureSink {
    /// Open the log, truncating it unless `append` is set.
    pub fn open(path: &Path, append: bool) -> Result<(Self, FailureLogWorker), ArtifactError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .map_err(io_err(path))?;
        let (sender, receiver) = mpsc::channel::<FailureRecord>();
        let log_path = path.to_path_buf();
        let handle = std::thread::spawn(move || write_failure_loop(file, receiver, log_path));
        Ok((
            Self { sender },
            FailureLogWorker {
                handle: Some(handle),
                path: path.to_path_buf(),
            },
        ))
    }
}

impl FailureSink for JsonlFailureSink {
    fn record(&self, failure: FailureRecord) -> Result<(), ArtifactError> {
        self.sender.send(failure).map_err(|_| ArtifactError::Closed)
    }
}

fn write_failure_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<FailureRecord>,
    path: PathBuf,
) -> Result<(), ArtifactError> {
    let mut writer = BufWriter::new(file);
    for failure in receiver {
        let line = serde_json::to_string(&failure).map_err(|source| ArtifactError::Json {
            path: path.clone(),
            source,
        })?;
        writeln!(writer, "{line}").map_err(io_err(&path))?;
    }
    writer.flush().map_err(io_err(&path))
}

/// Read back a failure log.
pub fn read_failures(path: &Path) -> Result<Vec<FailureRecord>, ArtifactError> {
    let raw = std::fs::read_to_string(path).map_err(io_err(path))?;
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|source| ArtifactError::Json {
                path: path.to_path_buf(),
                source,
            })
        })
        .collect()
}
