use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};

use crate::{configuration::ScoringConfig, oracle::BugKind, profile::Trace};

/// Interestingness of one candidate, with every term that went into it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub score: f64,
    pub profiled: bool,

    pub total_self_ms: f64,
    pub trait_like_ms: f64,
    pub trait_core_ms: f64,
    pub projection_ms: f64,
    pub monomorphization_ms: f64,

    pub obligation_event: Option<String>,
    pub obligation_avg_us: f64,

    pub pressure_ms: f64,
    pub complexity: f64,
    pub base: f64,
    pub fallback_applied: bool,
    pub gated: bool,
    pub normalizer: f64,
}

#[derive(Clone, Copy, Default)]
struct LabelTotals {
    millis: f64,
    calls: u64,
}

pub struct Scorer {
    config: ScoringConfig,
}

fn matches_any(label: &str, vocabulary: &[String]) -> bool {
    vocabulary.iter().any(|word| label.contains(&word.to_lowercase()))
}

impl Scorer {
    pub fn new(config: ScoringConfig) -> Self {
        Scorer { config }
    }

    fn fallback(&self, kind: BugKind) -> Option<f64> {
        let fallback = &self.config.fallback;
        match kind {
            BugKind::TraitOverflow => Some(fallback.trait_overflow),
            BugKind::Ice => Some(fallback.ice),
            BugKind::Hang => Some(fallback.hang),
            _ => None,
        }
    }

    /// Exact names first, in priority order; otherwise the busiest label containing
    /// the needle, ties broken by self time.
    fn obligation_event<'t>(
        &self,
        totals: &'t BTreeMap<String, LabelTotals>,
    ) -> Option<(&'t String, &'t LabelTotals)> {
        let exact = self
            .config
            .obligation_events
            .iter()
            .find_map(|name| totals.get_key_value(&name.to_lowercase()));
        if exact.is_some() {
            return exact;
        }

        let needle = self.config.obligation_needle.to_lowercase();
        totals
            .iter()
            .filter(|(label, _)| !needle.is_empty() && label.contains(&needle))
            .max_by(|(_, a), (_, b)| {
                a.calls
                    .cmp(&b.calls)
                    .then(a.millis.total_cmp(&b.millis))
            })
    }

    /// Never fails: without a trace every profiling term is zero and only the
    /// per-kind fallback can produce a non-zero score.
    pub fn score(&self, trace: Option<&Trace>, kind: BugKind, line_count: usize) -> ScoreRecord {
        let config = &self.config;
        let mut record = ScoreRecord {
            profiled: trace.map_or(false, |t| !t.is_empty()),
            ..ScoreRecord::default()
        };

        let mut totals: BTreeMap<String, LabelTotals> = BTreeMap::new();
        for event in trace.iter().flat_map(|t| t.records.iter()) {
            let entry = totals.entry(event.label.to_lowercase()).or_default();
            entry.millis += event.self_time.millis();
            entry.calls += event.invocation_count;
        }

        for (label, totals) in &totals {
            record.total_self_ms += totals.millis;
            if matches_any(label, &config.trait_like) {
                record.trait_like_ms += totals.millis;
            }

            // each label contributes to at most one pressure term
            if matches_any(label, &config.trait_core) {
                record.trait_core_ms += totals.millis;
            } else if matches_any(label, &config.projection) {
                record.projection_ms += totals.millis;
            } else if matches_any(label, &config.monomorphization) {
                record.monomorphization_ms += totals.millis;
            }
        }

        if let Some((label, event)) = self.obligation_event(&totals) {
            record.obligation_event = Some(label.clone());
            if event.calls > 0 {
                record.obligation_avg_us = event.millis * 1e3 / event.calls as f64;
            }
        }

        record.pressure_ms = record.trait_core_ms + record.projection_ms + record.monomorphization_ms;
        record.complexity =
            config.complexity_offset + record.obligation_avg_us / config.obligation_divisor_us;
        record.base = record.pressure_ms * record.complexity;

        if let Some(fallback) = self.fallback(kind) {
            let floor = if config.fallback_uses_complexity {
                fallback * record.complexity
            } else {
                fallback
            };
            if floor > record.base {
                record.base = floor;
                record.fallback_applied = true;
            }
        }

        let mut score = record.base;
        if record.total_self_ms > 0.0
            && record.trait_like_ms < config.gate_threshold * record.total_self_ms
        {
            score *= config.gate_factor;
            record.gated = true;
        }

        record.normalizer = if config.normalize_by_lines && line_count >= 1 {
            (1.0 + line_count as f64).ln()
        } else {
            1.0
        };
        record.score = score / record.normalizer;
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{EventRecord, SelfTime};

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn event(label: &str, millis: u64, calls: u64) -> EventRecord {
        EventRecord {
            label: label.to_string(),
            self_time: SelfTime::Nanos(millis * 1_000_000),
            invocation_count: calls,
        }
    }

    fn unnormalized() -> Scorer {
        Scorer::new(ScoringConfig {
            normalize_by_lines: false,
            ..ScoringConfig::default()
        })
    }

    #[test]
    fn empty_trace_ice_uses_fallback_over_log_lines() {
        let scorer = Scorer::new(ScoringConfig::default());

        let record = scorer.score(Some(&Trace::default()), BugKind::Ice, 50);

        assert!(close(record.score, 200.0 / 51f64.ln()));
        assert!(record.fallback_applied);
        assert!(!record.profiled);
        assert_eq!(record, scorer.score(None, BugKind::Ice, 50));
    }

    #[test]
    fn fallbacks_rank_hang_above_ice_above_overflow() {
        let scorer = Scorer::new(ScoringConfig::default());
        let score = |kind| scorer.score(None, kind, 10).score;

        assert!(score(BugKind::Hang) > score(BugKind::Ice));
        assert!(score(BugKind::Ice) > score(BugKind::TraitOverflow));
        assert_eq!(score(BugKind::NewFailureRegression), 0.0);
        assert_eq!(score(BugKind::Boring), 0.0);
    }

    #[test]
    fn pressure_times_complexity() {
        let trace = Trace {
            records: vec![
                event("evaluate_obligation", 1, 10),
                event("trait_select", 9, 3),
                event("normalize_projection_ty", 5, 1),
                event("monomorphization_collector", 5, 1),
            ],
        };

        let record = unnormalized().score(Some(&trace), BugKind::NewFailureRegression, 40);

        assert!(close(record.trait_core_ms, 10.0));
        assert!(close(record.projection_ms, 5.0));
        assert!(close(record.monomorphization_ms, 5.0));
        assert_eq!(record.obligation_event.as_deref(), Some("evaluate_obligation"));
        assert!(close(record.obligation_avg_us, 100.0));
        assert!(close(record.complexity, 3.0));
        assert!(close(record.score, 60.0));
        assert!(!record.gated);
    }

    #[test]
    fn unrelated_hot_paths_are_gated() {
        let trace = Trace {
            records: vec![event("trait_select", 1, 1), event("llvm_module_passes", 10_000, 1)],
        };

        let record = unnormalized().score(Some(&trace), BugKind::NewSuccessRegression, 1);

        assert!(record.gated);
        assert!(close(record.score, 0.1));
    }

    #[test]
    fn fuzzy_obligation_event_prefers_call_volume() {
        let trace = Trace {
            records: vec![
                event("poly_obligation_walk", 50, 2),
                event("check_obligations", 5, 5),
            ],
        };

        let record = unnormalized().score(Some(&trace), BugKind::Boring, 1);

        assert_eq!(record.obligation_event.as_deref(), Some("check_obligations"));
        assert!(close(record.obligation_avg_us, 1000.0));
    }

    #[test]
    fn strong_profile_beats_fallback() {
        let trace = Trace {
            records: vec![event("trait_select", 1_000, 1)],
        };

        let record = unnormalized().score(Some(&trace), BugKind::TraitOverflow, 1);

        assert!(!record.fallback_applied);
        assert!(close(record.score, 1_000.0));
    }
}
