//! Contrast sampling: split a question's facts into three disclosure buckets.
//!
//! A pure function of the facts and [`SamplerParams`]. Weights are min-max
//! normalised first (all-equal weights normalise to 1.0) and a set's mass is
//! its share of the question's total normalised weight, so masses are in [0, 1].
//! Thresholds are compared against normalised weights.
//!
//! Guarantees for every accepted question:
//! - mass(Answerable) >= mass(HardButFair) >= mass(BoundaryTest)
//! - BoundaryTest withholds at least one fact at or above the critical weight,
//!   or the top fact when none reaches it
//! - BoundaryTest discloses at least two facts and differs from Answerable

use thiserror::Error;

use crate::types::{Bucket, ClinicalFact, ContrastSet};

/// Slack for float comparisons against thresholds.
const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerParams {
    pub answerable_mass_threshold: f64,
    pub hard_mass_threshold: f64,
    pub critical_weight_threshold: f64,
    /// Smallest Answerable set, unless the question has fewer facts.
    pub min_facts: usize,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            answerable_mass_threshold: 0.8,
            hard_mass_threshold: 0.5,
            critical_weight_threshold: 0.3,
            min_facts: 2,
        }
    }
}

/// Why a question produced no contrast sets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SampleRejection {
    #[error("question has {0} fact(s), need at least 2")]
    TooFewFacts(usize),
    #[error("boundary test would disclose only {0} fact(s)")]
    BoundaryTooSmall(usize),
    #[error("answerable and boundary test disclose the same facts")]
    NoContrast,
}

impl SampleRejection {
    pub fn code(&self) -> &'static str {
        match self {
            SampleRejection::TooFewFacts(_) => "too_few_facts",
            SampleRejection::BoundaryTooSmall(_) => "boundary_too_small",
            SampleRejection::NoContrast => "no_contrast",
        }
    }
}

/// Min-max normalised weights, in input order.
pub fn normalized_weights(facts: &[ClinicalFact]) -> Vec<f64> {
    let min = facts.iter().map(|f| f.weight).fold(f64::INFINITY, f64::min);
    let max = facts.iter().map(|f| f.weight).fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    facts
        .iter()
        .map(|f| if span > EPS { (f.weight - min) / span } else { 1.0 })
        .collect()
}

/// Positions into `facts`, weight descending, ties by extraction order.
fn sampling_order(facts: &[ClinicalFact], norm: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..facts.len()).collect();
    order.sort_by(|&a, &b| {
        norm[b]
            .total_cmp(&norm[a])
            .then(facts[a].index.cmp(&facts[b].index))
            .then(a.cmp(&b))
    });
    order
}

struct Masses<'a> {
    norm: &'a [f64],
    total: f64,
}

impl Masses<'_> {
    fn of(&self, set: &[usize]) -> f64 {
        set.iter().map(|&i| self.norm[i]).sum::<f64>() / self.total
    }
}

pub fn sample_contrast_sets(
    question_id: &str,
    facts: &[ClinicalFact],
    params: &SamplerParams,
) -> Result<[ContrastSet; 3], SampleRejection> {
    if facts.len() < 2 {
        return Err(SampleRejection::TooFewFacts(facts.len()));
    }

    let norm = normalized_weights(facts);
    let masses = Masses {
        norm: &norm,
        total: norm.iter().sum(),
    };
    let order = sampling_order(facts, &norm);
    let critical = |i: usize| norm[i] >= params.critical_weight_threshold - EPS;

    // Answerable: shortest prefix reaching the mass threshold with at least min_facts.
    let mut answerable = Vec::new();
    for &i in &order {
        answerable.push(i);
        if masses.of(&answerable) >= params.answerable_mass_threshold - EPS
            && answerable.len() >= params.min_facts
        {
            break;
        }
    }

    // HardButFair: drop the top decisive fact if enough mass remains,
    // otherwise drop up to two of the lightest facts.
    let without_decisive = answerable.iter().position(|&i| critical(i)).and_then(|pos| {
        let mut candidate = answerable.clone();
        candidate.remove(pos);
        let keeps_mass = !candidate.is_empty()
            && masses.of(&candidate) >= params.hard_mass_threshold - EPS;
        keeps_mass.then_some(candidate)
    });
    let hard = without_decisive.unwrap_or_else(|| {
        let keep = answerable.len().saturating_sub(2).max(1);
        answerable[..keep].to_vec()
    });
    let hard_mass = masses.of(&hard);

    // BoundaryTest: withhold every critical fact, then shed the heaviest
    // disclosed facts until it discloses no more than HardButFair.
    let mut withheld: Vec<usize> = order.iter().copied().filter(|&i| critical(i)).collect();
    if withheld.is_empty() {
        withheld.push(order[0]);
    }
    let mut boundary: Vec<usize> = order
        .iter()
        .copied()
        .filter(|i| !withheld.contains(i))
        .collect();
    while !boundary.is_empty() && masses.of(&boundary) > hard_mass + EPS {
        boundary.remove(0);
    }

    if boundary.len() < 2 {
        return Err(SampleRejection::BoundaryTooSmall(boundary.len()));
    }
    let mut a_sorted = answerable.clone();
    let mut b_sorted = boundary.clone();
    a_sorted.sort_unstable();
    b_sorted.sort_unstable();
    if a_sorted == b_sorted {
        return Err(SampleRejection::NoContrast);
    }

    let ids = |set: &[usize]| set.iter().map(|&i| facts[i].id.clone()).collect::<Vec<_>>();
    let set = |bucket: Bucket, disclosed: &[usize], withheld_critical: Vec<String>| ContrastSet {
        question_id: question_id.to_string(),
        bucket,
        disclosed: ids(disclosed),
        disclosed_mass: masses.of(disclosed),
        withheld_critical,
    };

    Ok([
        set(Bucket::Answerable, &answerable, Vec::new()),
        set(Bucket::HardButFair, &hard, Vec::new()),
        set(Bucket::BoundaryTest, &boundary, ids(&withheld)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(weights: &[f64]) -> Vec<ClinicalFact> {
        weights
            .iter()
            .enumerate()
            .map(|(i, &w)| ClinicalFact::new(i, format!("fact {i}"), w))
            .collect()
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn worked_example() {
        let sets =
            sample_contrast_sets("q1", &facts(&[0.9, 0.7, 0.4, 0.2]), &SamplerParams::default())
                .unwrap();
        let [answerable, hard, boundary] = sets;

        assert_eq!(answerable.disclosed, ids(&["f1", "f2"]));
        assert!((answerable.disclosed_mass - 6.0 / 7.0).abs() < 1e-9);

        // Dropping f1 leaves too little mass; the fallback keeps one fact.
        assert_eq!(hard.disclosed, ids(&["f1"]));
        assert!((hard.disclosed_mass - 0.5).abs() < 1e-9);

        assert_eq!(boundary.bucket, Bucket::BoundaryTest);
        assert_eq!(boundary.withheld_critical, ids(&["f1", "f2"]));
        assert_eq!(boundary.disclosed, ids(&["f3", "f4"]));
        assert!(boundary.disclosed_mass < hard.disclosed_mass);
        assert!(answerable.withheld_critical.is_empty());
    }

    #[test]
    fn decisive_fact_is_dropped_when_mass_survives() {
        let weights = [1.0, 0.95, 0.9, 0.29, 0.29, 0.29, 0.29, 0.29, 0.29, 0.0];
        let [answerable, hard, boundary] =
            sample_contrast_sets("q", &facts(&weights), &SamplerParams::default()).unwrap();
        assert_eq!(answerable.disclosed, ids(&["f1", "f2", "f3", "f4", "f5", "f6"]));
        assert_eq!(hard.disclosed, ids(&["f2", "f3", "f4", "f5", "f6"]));
        assert_eq!(boundary.withheld_critical, ids(&["f1", "f2", "f3"]));
        assert_eq!(boundary.disclosed.len(), 7);
    }

    #[test]
    fn boundary_is_trimmed_below_hard_mass() {
        let mut weights = vec![1.0, 0.0];
        weights.extend(std::iter::repeat(0.29).take(10));
        let [answerable, hard, boundary] =
            sample_contrast_sets("q", &facts(&weights), &SamplerParams::default()).unwrap();

        assert_eq!(answerable.disclosed.len(), 9);
        assert_eq!(hard.disclosed.len(), 8);
        assert!(!hard.discloses("f1"));
        // f3 and f4 are shed; they are neither disclosed nor listed as critical.
        assert_eq!(boundary.disclosed.len(), 9);
        assert!(!boundary.discloses("f3") && !boundary.discloses("f4"));
        assert_eq!(boundary.withheld_critical, ids(&["f1"]));
        assert!(boundary.disclosed_mass <= hard.disclosed_mass + EPS);
    }

    #[test]
    fn ties_break_by_extraction_order() {
        let facts = facts(&[0.0, 0.5, 0.5, 0.5, 1.0, 0.1]);
        let params = SamplerParams::default();
        let [answerable, ..] = sample_contrast_sets("q", &facts, &params).unwrap();
        assert_eq!(&answerable.disclosed[..4], &ids(&["f5", "f2", "f3", "f4"])[..]);
    }

    #[test]
    fn equal_weights_leave_nothing_to_disclose() {
        let err =
            sample_contrast_sets("q", &facts(&[0.5, 0.5, 0.5]), &SamplerParams::default())
                .unwrap_err();
        assert_eq!(err, SampleRejection::BoundaryTooSmall(0));
    }

    #[test]
    fn too_few_facts() {
        let err = sample_contrast_sets("q", &facts(&[0.9]), &SamplerParams::default()).unwrap_err();
        assert_eq!(err, SampleRejection::TooFewFacts(1));
        assert_eq!(err.code(), "too_few_facts");
    }

    #[test]
    fn single_light_fact_left_for_boundary_is_rejected() {
        let err =
            sample_contrast_sets("q", &facts(&[1.0, 0.8, 0.0]), &SamplerParams::default())
                .unwrap_err();
        assert_eq!(err, SampleRejection::BoundaryTooSmall(1));
    }

    #[test]
    fn repeated_runs_are_identical() {
        let input = facts(&[0.3, 0.91, 0.12, 0.55, 0.55, 0.07, 0.4]);
        let params = SamplerParams::default();
        let first = sample_contrast_sets("q", &input, &params);
        for _ in 0..10 {
            assert_eq!(sample_contrast_sets("q", &input, &params), first);
        }
    }

    #[test]
    fn normalisation_rescales_to_unit_range() {
        let norm = normalized_weights(&facts(&[2.0, 6.0, 10.0]));
        assert_eq!(norm, vec![0.0, 0.5, 1.0]);
        assert_eq!(normalized_weights(&facts(&[3.0, 3.0])), vec![1.0, 1.0]);
    }
}
