use std::collections::HashSet;

use clinical_contrast::sample::normalized_weights;
use clinical_contrast::{sample_contrast_sets, Bucket, ClinicalFact, SamplerParams};
use proptest::prelude::*;

const TOL: f64 = 1e-9;

fn facts(weights: &[f64]) -> Vec<ClinicalFact> {
    weights
        .iter()
        .enumerate()
        .map(|(i, &w)| ClinicalFact::new(i, format!("finding {i}"), w))
        .collect()
}

fn params() -> impl Strategy<Value = SamplerParams> {
    (0.3f64..=1.0, 0.05f64..=1.0, 0.05f64..=1.0, 2usize..=4).prop_map(
        |(answerable, hard_share, critical, min_facts)| SamplerParams {
            answerable_mass_threshold: answerable,
            hard_mass_threshold: answerable * hard_share,
            critical_weight_threshold: critical,
            min_facts,
        },
    )
}

proptest! {
    #[test]
    fn buckets_disclose_decreasing_mass(
        weights in prop::collection::vec(0.0f64..10.0, 2..12),
        params in params(),
    ) {
        let facts = facts(&weights);
        if let Ok([answerable, hard, boundary]) = sample_contrast_sets("q", &facts, &params) {
            prop_assert_eq!(answerable.bucket, Bucket::Answerable);
            prop_assert_eq!(boundary.bucket, Bucket::BoundaryTest);
            prop_assert!(hard.disclosed_mass <= answerable.disclosed_mass + TOL);
            prop_assert!(boundary.disclosed_mass <= hard.disclosed_mass + TOL);
            prop_assert!(
                answerable.disclosed_mass >= params.answerable_mass_threshold - TOL
                    || answerable.disclosed.len() == facts.len()
            );
            prop_assert!(answerable.disclosed.len() >= params.min_facts.min(facts.len()));
            prop_assert!(boundary.disclosed.len() >= 2);
        }
    }

    #[test]
    fn boundary_withholds_every_critical_fact(
        weights in prop::collection::vec(0.0f64..10.0, 2..12),
        params in params(),
    ) {
        let facts = facts(&weights);
        let norm = normalized_weights(&facts);
        if let Ok([_, _, boundary]) = sample_contrast_sets("q", &facts, &params) {
            prop_assert!(!boundary.withheld_critical.is_empty());
            for (fact, w) in facts.iter().zip(&norm) {
                if *w >= params.critical_weight_threshold - TOL {
                    prop_assert!(!boundary.discloses(&fact.id));
                    prop_assert!(boundary.withheld_critical.contains(&fact.id));
                }
            }
            // The heaviest fact always normalises to 1.0, so it is never disclosed here.
            let top = norm
                .iter()
                .enumerate()
                .fold(0, |best, (i, w)| if *w > norm[best] { i } else { best });
            prop_assert!(!boundary.discloses(&facts[top].id));
        }
    }

    #[test]
    fn disclosed_ids_are_distinct_known_facts(
        weights in prop::collection::vec(0.0f64..10.0, 2..12),
        params in params(),
    ) {
        let facts = facts(&weights);
        let known: HashSet<&str> = facts.iter().map(|f| f.id.as_str()).collect();
        if let Ok(sets) = sample_contrast_sets("q", &facts, &params) {
            for set in &sets {
                prop_assert!(!set.disclosed.is_empty());
                let unique: HashSet<&str> = set.disclosed.iter().map(String::as_str).collect();
                prop_assert_eq!(unique.len(), set.disclosed.len());
                prop_assert!(unique.is_subset(&known));
                prop_assert_eq!(set.question_id.as_str(), "q");
            }
            let mut a = sets[0].disclosed.clone();
            let mut b = sets[2].disclosed.clone();
            a.sort();
            b.sort();
            prop_assert_ne!(a, b);
        }
    }

    #[test]
    fn sampling_is_deterministic(
        weights in prop::collection::vec(0.0f64..10.0, 2..12),
        params in params(),
    ) {
        let facts = facts(&weights);
        prop_assert_eq!(
            sample_contrast_sets("q", &facts, &params),
            sample_contrast_sets("q", &facts, &params)
        );
    }
}
