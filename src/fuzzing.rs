use std::{
    path::PathBuf,
    sync::{mpsc::Sender, Arc, RwLock},
};

use anyhow::anyhow;
use rand::rngs::StdRng;

use crate::{
    corpus::{Candidate, Corpus, EntryMetadata, Fate, Lineage, PersistOutcome, Seed},
    execution::Lane,
    log::{log, record_event, FuzzingEvent, FuzzingEventKind},
    mutation::{Family, Feedback, Mutators, Selection, StrategyPool},
    oracle::{BugKind, Evaluator, Verdict},
    reduce::ReductionJob,
    scoring::Scorer,
    syntax::SyntaxTree,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleStatus {
    /// No mutator could change the picked seed.
    NoMutation,
    /// The candidate failed the parse check; the pool is not told.
    Rejected,
    Boring,
    Duplicate(BugKind),
    /// The root seed of the candidate's family already fails this way.
    Fated(BugKind),
    New(BugKind),
}

#[derive(Debug)]
pub struct CycleReport {
    pub status: CycleStatus,
    pub mutator: Option<&'static str>,
    pub fingerprint: Option<String>,
    pub score: f64,
    pub stored: Option<PathBuf>,
}

impl CycleReport {
    fn bare(status: CycleStatus) -> Self {
        CycleReport {
            status,
            mutator: None,
            fingerprint: None,
            score: 0.0,
            stored: None,
        }
    }
}

pub struct Fuzzer<E: Evaluator + ?Sized> {
    lane: Lane,
    mutators: Mutators,
    pool: Arc<RwLock<StrategyPool>>,
    corpus: Arc<RwLock<Corpus>>,
    evaluator: Arc<E>,
    scorer: Arc<Scorer>,
    reductions: Option<Sender<ReductionJob>>,
    suppress_fated: bool,
    rng: StdRng,
}

/// Whether a variant failing with `kind` only repeats its root seed's failure.
fn repeats(baseline: BugKind, kind: BugKind) -> bool {
    let crash = |k: BugKind| matches!(k, BugKind::Hang | BugKind::Ice);
    baseline == kind || (crash(baseline) && crash(kind))
}

impl<E: Evaluator + ?Sized> Fuzzer<E> {
    pub fn new(
        lane: Lane,
        mutators: Mutators,
        pool: Arc<RwLock<StrategyPool>>,
        corpus: Arc<RwLock<Corpus>>,
        evaluator: Arc<E>,
        scorer: Arc<Scorer>,
        rng: StdRng,
    ) -> Self {
        Fuzzer {
            lane,
            mutators,
            pool,
            corpus,
            evaluator,
            scorer,
            reductions: None,
            suppress_fated: false,
            rng,
        }
    }

    pub fn with_reductions(mut self, reductions: Sender<ReductionJob>) -> Self {
        self.reductions = Some(reductions);
        self
    }

    pub fn with_fate_suppression(mut self, suppress: bool) -> Self {
        self.suppress_fated = suppress;
        self
    }

    /// Evaluates the family's root seed once and checks whether `kind` repeats it.
    fn is_fated(&self, seed: &Seed, kind: BugKind) -> Result<bool, anyhow::Error> {
        if !self.suppress_fated {
            return Ok(false);
        }
        let cached = self.corpus.read().unwrap().fate(&seed.family);
        let fate = match cached {
            Some(fate) => fate,
            None => {
                let Some(root) = self.corpus.read().unwrap().family_root(&seed.family).cloned() else {
                    return Ok(false);
                };
                let fate = match self.evaluator.evaluate(&root.tree.render(), &self.lane)? {
                    Verdict::Classified { kind: own, .. } if own.is_interesting() => Fate::Fails(own),
                    _ => Fate::Clean,
                };
                self.corpus.write().unwrap().record_fate(&seed.family, fate);
                fate
            }
        };
        Ok(matches!(fate, Fate::Fails(baseline) if repeats(baseline, kind)))
    }

    /// Picks a mutator and site that change `seed`. Arms whose rewrite fails or
    /// leaves the text as it was are dropped for the rest of the round.
    fn mutate(&mut self, seed: &Seed) -> Option<(Selection, SyntaxTree)> {
        let table = self.pool.read().unwrap().snapshot();
        let mut round = table.round();
        let original = seed.tree.fingerprint();

        while let Some(selection) = round.next(&self.mutators, &seed.tree, &mut self.rng) {
            let mut tree = seed.tree.clone();
            if self.mutators[selection.arm].apply(&mut tree, selection.index)
                && tree.fingerprint() != original
            {
                return Some((selection, tree));
            }
            round.reject(selection.arm);
        }
        None
    }

    pub fn run_once(&mut self) -> Result<CycleReport, anyhow::Error> {
        let seed = self
            .corpus
            .read()
            .unwrap()
            .pick_seed(&mut self.rng)
            .ok_or_else(|| anyhow!("corpus has no seeds"))?;

        let Some((selection, tree)) = self.mutate(&seed) else {
            return Ok(CycleReport::bare(CycleStatus::NoMutation));
        };
        self.pool.write().unwrap().record_pick(selection.arm);

        let mutator = self.mutators[selection.arm].name();
        let source = tree.render();
        let fingerprint = tree.fingerprint();

        let (kind, result, trace, line_count) = match self.evaluator.evaluate(&source, &self.lane)? {
            Verdict::Rejected { .. } => {
                return Ok(CycleReport {
                    mutator: Some(mutator),
                    fingerprint: Some(fingerprint),
                    ..CycleReport::bare(CycleStatus::Rejected)
                })
            }
            Verdict::Classified {
                kind,
                result,
                trace,
                line_count,
            } => (kind, result, trace, line_count),
        };

        let score = self.scorer.score(trace.as_ref(), kind, line_count);
        let mut report = CycleReport {
            status: CycleStatus::Boring,
            mutator: Some(mutator),
            fingerprint: Some(fingerprint.clone()),
            score: score.score,
            stored: None,
        };

        if kind.is_interesting() && self.is_fated(&seed, kind)? {
            log!(
                "[lane {}] {kind} {} repeats seed {}",
                self.lane.index,
                &fingerprint[..12],
                seed.family
            );
            record_event(FuzzingEvent::now(
                self.lane.index,
                FuzzingEventKind::Fated {
                    kind,
                    fingerprint: fingerprint.clone(),
                    family: seed.family.clone(),
                },
            ));
            report.status = CycleStatus::Fated(kind);
        } else if kind.is_interesting() {
            let candidate = Candidate {
                source,
                fingerprint: fingerprint.clone(),
                lineage: Lineage {
                    parent: seed.id.clone(),
                    family: seed.family.clone(),
                    mutator: mutator.to_string(),
                    index: selection.index,
                    generation: seed.generation + 1,
                },
            };
            let metadata = EntryMetadata {
                fingerprint: fingerprint.clone(),
                kind,
                score: score.clone(),
                lineage: candidate.lineage.clone(),
                oracle: result,
                line_count,
                found_at: chrono::Local::now().to_rfc3339(),
                lane: self.lane.index,
            };

            let outcome = self.corpus.write().unwrap().persist(&candidate, &metadata)?;
            match outcome {
                PersistOutcome::Stored(path) => {
                    log!(
                        "[lane {}] new {kind} {} via {mutator} (score {:.2})",
                        self.lane.index,
                        &fingerprint[..12],
                        score.score
                    );
                    record_event(FuzzingEvent::now(
                        self.lane.index,
                        FuzzingEventKind::NewEntry {
                            kind,
                            fingerprint: fingerprint.clone(),
                            score: score.score,
                            mutator: mutator.to_string(),
                        },
                    ));
                    if let Some(reductions) = &self.reductions {
                        let _ = reductions.send(ReductionJob { entry: path.clone() });
                    }
                    report.status = CycleStatus::New(kind);
                    report.stored = Some(path);
                }
                PersistOutcome::Duplicate { hits } => {
                    record_event(FuzzingEvent::now(
                        self.lane.index,
                        FuzzingEventKind::Duplicate {
                            kind,
                            fingerprint,
                            hits,
                        },
                    ));
                    report.status = CycleStatus::Duplicate(kind);
                }
            }
        } else if result.baseline.status.success()
            && self.mutators[selection.arm].family() == Family::Structural
        {
            let promoted = Seed {
                id: fingerprint.clone(),
                tree,
                generation: seed.generation + 1,
                family: seed.family.clone(),
            };
            if self.corpus.write().unwrap().promote(promoted) {
                log!(
                    "[lane {}] promoted {} from {} to the seed pool",
                    self.lane.index,
                    &fingerprint[..12],
                    seed.family
                );
            }
        }

        if self.suppress_fated && matches!(kind, BugKind::Hang | BugKind::Ice) {
            self.corpus.write().unwrap().ban_family(&seed.family);
        }

        let feedback = Feedback {
            kind,
            score: score.score,
            persisted: matches!(report.status, CycleStatus::New(_)),
        };
        self.pool.write().unwrap().feedback(selection.arm, &feedback);

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use rand::SeedableRng;

    use super::*;
    use crate::{
        configuration::{tests::minimal, ScoringConfig},
        corpus::CANDIDATE_FILE,
        mutation::{build_mutators, non_structural, structural, Mutator},
        oracle::tests::FnEvaluator,
    };

    type Classifier = fn(&str) -> Option<BugKind>;

    fn fuzzer(
        output: &std::path::Path,
        seed: &str,
        mutators: Mutators,
        classify: Classifier,
    ) -> Fuzzer<FnEvaluator<Classifier>> {
        let config = minimal();
        let seeds = vec![Seed::initial("seed".to_string(), SyntaxTree::parse(seed).unwrap())];
        // discovered entries are never picked, so every cycle starts from `seed`
        let corpus = Corpus::open(output, seeds, 0.0, 0.5).unwrap();
        let pool = StrategyPool::new(&mutators, &config.strategy);

        Fuzzer::new(
            Lane::default(),
            mutators,
            Arc::new(RwLock::new(pool)),
            Arc::new(RwLock::new(corpus)),
            Arc::new(FnEvaluator(classify)),
            Arc::new(Scorer::new(ScoringConfig::default())),
            StdRng::seed_from_u64(7),
        )
    }

    fn weights(fuzzer: &Fuzzer<FnEvaluator<Classifier>>) -> Vec<f64> {
        let pool = fuzzer.pool.read().unwrap();
        pool.snapshot().arms.iter().map(|arm| arm.weight).collect()
    }

    fn bool_flip_only() -> Mutators {
        let mutators: Vec<Box<dyn Mutator>> = vec![Box::new(non_structural::BoolFlip)];
        Arc::new(mutators)
    }

    #[test]
    fn new_find_is_persisted_and_rewarded() {
        let dir = tempfile::tempdir().unwrap();
        let mutators = build_mutators(&minimal()).unwrap();
        let mut fuzzer = fuzzer(
            dir.path(),
            "trait T { fn go(&self) -> bool; }\nfn main() { let a = 1 + 2; let b = true; }",
            mutators,
            |_| Some(BugKind::NewFailureRegression),
        );
        let (tx, rx) = mpsc::channel();
        fuzzer = fuzzer.with_reductions(tx);
        let before = weights(&fuzzer);

        let report = fuzzer.run_once().unwrap();

        assert_eq!(report.status, CycleStatus::New(BugKind::NewFailureRegression));
        let stored = report.stored.unwrap();
        assert!(stored.join(CANDIDATE_FILE).exists());
        assert_eq!(rx.try_recv().unwrap().entry, stored);

        let arm = fuzzer
            .mutators
            .iter()
            .position(|m| Some(m.name()) == report.mutator)
            .unwrap();
        assert!(weights(&fuzzer)[arm] > before[arm]);
        assert_eq!(fuzzer.corpus.read().unwrap().discovered_len(), 1);
    }

    #[test]
    fn rejected_candidates_leave_weights_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut fuzzer = fuzzer(dir.path(), "fn main() { let b = true; }", bool_flip_only(), |_| None);
        let before = weights(&fuzzer);

        assert_eq!(fuzzer.run_once().unwrap().status, CycleStatus::Rejected);
        assert_eq!(weights(&fuzzer), before);
    }

    #[test]
    fn boring_candidates_are_not_stored() {
        let dir = tempfile::tempdir().unwrap();
        let mut fuzzer = fuzzer(
            dir.path(),
            "fn main() { let b = true; }",
            bool_flip_only(),
            |_| Some(BugKind::Boring),
        );

        let report = fuzzer.run_once().unwrap();

        assert_eq!(report.status, CycleStatus::Boring);
        assert!(report.stored.is_none());
        assert_eq!(fuzzer.corpus.read().unwrap().discovered_len(), 0);
    }

    #[test]
    fn unmutatable_seed_reports_no_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let mutators: Vec<Box<dyn Mutator>> =
            vec![Box::new(non_structural::BinOpFlip), Box::new(non_structural::BoolFlip)];
        let mut fuzzer = fuzzer(dir.path(), "fn main(){}", Arc::new(mutators), |_| {
            Some(BugKind::Hang)
        });

        assert_eq!(fuzzer.run_once().unwrap().status, CycleStatus::NoMutation);
    }

    #[test]
    fn repeated_candidate_is_a_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let mut fuzzer = fuzzer(
            dir.path(),
            "fn main() { let b = true; }",
            bool_flip_only(),
            |source| Some(if source.contains("false") { BugKind::Ice } else { BugKind::Boring }),
        );

        assert_eq!(fuzzer.run_once().unwrap().status, CycleStatus::New(BugKind::Ice));
        assert_eq!(fuzzer.run_once().unwrap().status, CycleStatus::Duplicate(BugKind::Ice));
    }

    #[test]
    fn finds_repeating_the_seed_are_fated() {
        let dir = tempfile::tempdir().unwrap();
        let mut fuzzer = fuzzer(
            dir.path(),
            "fn main() { let b = true; }",
            bool_flip_only(),
            |_| Some(BugKind::Hang),
        )
        .with_fate_suppression(true);

        let report = fuzzer.run_once().unwrap();

        assert_eq!(report.status, CycleStatus::Fated(BugKind::Hang));
        assert!(report.stored.is_none());
        let corpus = fuzzer.corpus.read().unwrap();
        assert_eq!(corpus.discovered_len(), 0);
        assert_eq!(corpus.fate("seed"), Some(Fate::Fails(BugKind::Hang)));
        assert!(corpus.is_banned("seed"));
    }

    #[test]
    fn clean_seed_finds_are_kept_and_close_the_family() {
        let dir = tempfile::tempdir().unwrap();
        let mut fuzzer = fuzzer(
            dir.path(),
            "fn main() { let b = true; }",
            bool_flip_only(),
            |source| Some(if source.contains("false") { BugKind::Ice } else { BugKind::Boring }),
        )
        .with_fate_suppression(true);

        assert_eq!(fuzzer.run_once().unwrap().status, CycleStatus::New(BugKind::Ice));
        let corpus = fuzzer.corpus.read().unwrap();
        assert_eq!(corpus.fate("seed"), Some(Fate::Clean));
        assert!(corpus.is_banned("seed"));
    }

    #[test]
    fn compiling_structural_variants_are_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let mutators: Vec<Box<dyn Mutator>> = vec![Box::new(structural::AddTrait::new().unwrap())];
        let mut fuzzer = fuzzer(dir.path(), "fn main() {}", Arc::new(mutators), |_| {
            Some(BugKind::Boring)
        });

        for _ in 0..30 {
            assert_eq!(fuzzer.run_once().unwrap().status, CycleStatus::Boring);
        }
        // two per family by default
        assert_eq!(fuzzer.corpus.read().unwrap().promoted_len(), 2);
    }
}
