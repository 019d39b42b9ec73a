//! Property-based tests for core components using proptest.

use proptest::prelude::*;

use researchops_core::config::{QueryLimits, RateLimitConfig};
use researchops_core::providers::{LocalEmbedder, cosine_similarity};
use researchops_core::research::{Scout, parse_verdict};
use researchops_core::resilience::RateLimiter;
use researchops_core::types::{Paper, ResearchQuery};
use std::collections::HashMap;

fn limiter(limit: u32, burst_allowance: Option<u32>) -> RateLimiter {
    RateLimiter::new(&RateLimitConfig {
        default_limit: limit,
        default_window_secs: 3600,
        burst_multiplier: 1.0,
        burst_allowance,
        endpoints: HashMap::new(),
    })
}

// --- Rate limiter properties ---

proptest! {
    #[test]
    fn admitted_never_exceeds_burst_ceiling(
        limit in 1u32..50,
        extra in 0u32..10,
        requests in 0usize..120,
    ) {
        let limiter = limiter(limit, Some(extra));
        let admitted = (0..requests)
            .filter(|_| limiter.check("client", None).allowed)
            .count();
        prop_assert_eq!(admitted, requests.min((limit + extra) as usize));
    }

    #[test]
    fn remaining_counts_down_then_stays_zero(limit in 1u32..30, requests in 1usize..80) {
        let limiter = limiter(limit, None);
        let mut previous = u32::MAX;
        for i in 0..requests {
            let decision = limiter.check("client", Some("/research"));
            prop_assert!(decision.remaining <= previous);
            prop_assert!(decision.remaining < limit);
            if (i as u32) < limit {
                prop_assert!(decision.allowed);
                prop_assert_eq!(decision.remaining, limit - 1 - i as u32);
            } else {
                prop_assert!(!decision.allowed);
            }
            previous = decision.remaining;
        }
    }

    #[test]
    fn identifiers_do_not_share_windows(limit in 1u32..20, clients in 2usize..6) {
        let limiter = limiter(limit, None);
        for client in 0..clients {
            let id = format!("client-{client}");
            for _ in 0..limit {
                prop_assert!(limiter.check(&id, None).allowed);
            }
            prop_assert!(!limiter.check(&id, None).allowed);
        }
        prop_assert_eq!(limiter.window_count(), clients);
    }
}

// --- Similarity and embedding properties ---

proptest! {
    #[test]
    fn cosine_similarity_is_bounded(
        a in prop::collection::vec(-100.0f32..100.0, 1..32),
        b in prop::collection::vec(-100.0f32..100.0, 1..32),
    ) {
        let sim = cosine_similarity(&a, &b);
        prop_assert!((0.0..=1.0).contains(&sim));
    }

    #[test]
    fn local_embeddings_are_unit_or_zero(text in "[a-z ]{0,80}") {
        let v = LocalEmbedder::new(64).embed_text(&text);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if text.trim().is_empty() {
            prop_assert_eq!(norm, 0.0);
        } else {
            prop_assert!((norm - 1.0).abs() < 1e-4);
        }
    }
}

// --- Query validation and merge properties ---

proptest! {
    #[test]
    fn max_papers_outside_bounds_is_rejected(max_papers in 101usize..10_000) {
        let result = ResearchQuery::new("sleep and memory", max_papers, &QueryLimits::default());
        prop_assert!(result.is_err());
    }

    #[test]
    fn plain_queries_are_accepted(
        text in "[a-zA-Z][a-zA-Z0-9 ]{0,200}",
        max_papers in 1usize..=100,
    ) {
        let query = ResearchQuery::new(&text, max_papers, &QueryLimits::default()).unwrap();
        prop_assert_eq!(query.text(), text.trim());
    }

    #[test]
    fn merge_is_bounded_and_unique(
        existing in prop::collection::vec("[a-e]{1,3}", 0..10),
        incoming in prop::collection::vec("[a-e]{1,3}", 0..20),
        max in 0usize..15,
    ) {
        let to_papers = |ids: &[String]| -> Vec<Paper> {
            ids.iter().map(|id| Paper::new(id.clone(), format!("title {id}"))).collect()
        };
        let merged = Scout::merge(to_papers(&existing[..]), to_papers(&incoming[..]), max);
        prop_assert!(merged.len() <= max);
        let mut ids: Vec<&str> = merged.iter().map(|p| p.id.as_str()).collect();
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        // Duplicates already present in `existing` are kept as-is.
        let existing_dups = existing.len() - {
            let mut e = existing.clone();
            e.sort_unstable();
            e.dedup();
            e.len()
        };
        prop_assert!(total - ids.len() <= existing_dups);
    }

    #[test]
    fn verdict_parsing_never_panics(reply in ".{0,100}") {
        let _ = parse_verdict(&reply);
    }
}
