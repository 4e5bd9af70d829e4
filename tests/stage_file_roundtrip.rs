use clinical_contrast::artifacts::{read_records, write_json};
use clinical_contrast::extract::{dedup_facts, RawFact};
use clinical_contrast::{sample_contrast_sets, Question, QuestionRecord, SamplerParams};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn record(id: usize, rng: &mut StdRng) -> QuestionRecord {
    let raw: Vec<RawFact> = (0..6)
        .map(|i| RawFact {
            text: format!("finding {i} marker{id}x{i}"),
            weight: rng.gen_range(0..=20) as f64 / 2.0,
            rationale: String::new(),
        })
        .collect();
    let mut record = QuestionRecord::new(Question {
        id: format!("q{id}"),
        stem: "What is the next step?".into(),
        correct_answer: "(A) x".into(),
        distractors: vec![],
        choices: vec![],
    });
    record.facts = Some(dedup_facts(raw, 0.8));
    record
}

#[test]
fn sampling_after_reload_matches_in_memory_sampling() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("medqa_classified.json");
    let mut rng = StdRng::seed_from_u64(17);
    let records: Vec<QuestionRecord> = (0..400).map(|i| record(i, &mut rng)).collect();

    write_json(&path, &records).unwrap();
    let reloaded = read_records(&path).unwrap();
    assert_eq!(reloaded, records);

    let params = SamplerParams::default();
    for (before, after) in records.iter().zip(&reloaded) {
        let facts_before = before.facts.as_deref().unwrap();
        let facts_after = after.facts.as_deref().unwrap();
        assert_eq!(
            sample_contrast_sets(before.id(), facts_before, &params),
            sample_contrast_sets(after.id(), facts_after, &params),
            "question {}",
            before.id()
        );
    }
}

#[test]
fn weights_survive_the_stage_file_bit_for_bit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("weights.json");
    let weights: Vec<f64> = vec![0.46950000000000003, 0.908695652173913, 0.517391304347826, 1.0 / 3.0];

    write_json(&path, &weights).unwrap();
    let raw = std::fs::read_to_string(&path).unwrap();
    let reloaded: Vec<f64> = serde_json::from_str(&raw).unwrap();
    for (a, b) in weights.iter().zip(&reloaded) {
        assert_eq!(a.to_bits(), b.to_bits(), "{a} came back as {b}");
    }
}
