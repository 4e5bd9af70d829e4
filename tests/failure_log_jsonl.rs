use clinical_contrast::artifacts::{read_failures, FailureRecord, FailureSink, JsonlFailureSink};
use clinical_contrast::{Bucket, Step};
use tempfile::tempdir;
use uuid::Uuid;

#[derive(Debug, serde::Deserialize)]
struct FailureRow {
    question_id: String,
    stage: String,
    #[serde(default)]
    bucket: Option<String>,
}

#[test]
fn jsonl_failure_sink_writes_rows_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run_rewrite_failures.jsonl");
    let run_id = Uuid::new_v4();

    let (sink, worker) = JsonlFailureSink::open(&path, false).unwrap();
    sink.record(FailureRecord::new(
        run_id,
        Step::Extract,
        "q1",
        "answer_mismatch",
        "model chose (A), expected (C)",
    ))
    .unwrap();
    sink.record(
        FailureRecord::new(run_id, Step::Rewrite, "q2", "missing_field", "no narrative")
            .bucket(Bucket::BoundaryTest),
    )
    .unwrap();

    drop(sink);
    worker.join().unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2);

    let first: FailureRow = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first.question_id, "q1");
    assert_eq!(first.stage, "extract");
    assert_eq!(first.bucket, None);

    let second: FailureRow = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(second.bucket.as_deref(), Some("boundary_test"));
}

#[test]
fn reopening_in_append_mode_keeps_earlier_rows() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("logs/run_extract_failures.jsonl");
    let run_id = Uuid::new_v4();

    for (append, qid) in [(false, "q1"), (true, "q2")] {
        let (sink, worker) = JsonlFailureSink::open(&path, append).unwrap();
        sink.record(FailureRecord::new(run_id, Step::Extract, qid, "too_few_facts", "1 fact"))
            .unwrap();
        drop(sink);
        worker.join().unwrap();
    }

    let rows = read_failures(&path).unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r.question_id.as_str()).collect();
    assert_eq!(ids, vec!["q1", "q2"]);

    let (sink, worker) = JsonlFailureSink::open(&path, false).unwrap();
    drop(sink);
    worker.join().unwrap();
    assert!(read_failures(&path).unwrap().is_empty());
}
