use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::Sender,
        Arc, RwLock,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, SeedableRng};

use crate::{
    configuration::CampaignConfig,
    corpus::Corpus,
    execution::{ExecutionError, Lane},
    fuzzing::Fuzzer,
    log::{log, record_event, FuzzingEvent, FuzzingEventKind},
    mutation::{Mutators, StrategyPool},
    oracle::Evaluator,
    reduce::ReductionJob,
    scoring::Scorer,
    state::{CancelToken, State, AM},
};

/// Consecutive failed cycles after which a lane stops the campaign.
const MAX_CONSECUTIVE_FAILURES: usize = 16;

/// Global iteration and wall-clock limits shared by every lane.
pub struct Budget {
    iterations: Option<u64>,
    deadline: Option<Instant>,
    issued: AtomicU64,
}

impl Budget {
    pub fn new(iterations: Option<u64>, time: Option<Duration>) -> Self {
        Budget {
            iterations,
            deadline: time.map(|t| Instant::now() + t),
            issued: AtomicU64::new(0),
        }
    }

    /// Claims one cycle. Returns false once either limit is reached.
    pub fn take(&self) -> bool {
        if self.deadline.map_or(false, |d| Instant::now() >= d) {
            return false;
        }
        match self.iterations {
            Some(max) => self.issued.fetch_add(1, Ordering::SeqCst) < max,
            None => true,
        }
    }

    pub fn remaining_time(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

/// Everything the lanes share.
#[derive(Clone)]
pub struct Shared {
    pub mutators: Mutators,
    pub pool: Arc<RwLock<StrategyPool>>,
    pub corpus: Arc<RwLock<Corpus>>,
    pub evaluator: Arc<dyn Evaluator>,
    pub scorer: Arc<Scorer>,
    pub reductions: Option<Sender<ReductionJob>>,
}

fn lane_rng(seed: Option<u64>, lane: usize) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(lane as u64)),
        None => StdRng::from_entropy(),
    }
}

fn is_cancellation(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<ExecutionError>(), Some(ExecutionError::Cancelled))
}

pub fn spawn_workers(
    campaign: &CampaignConfig,
    shared: Shared,
    state: AM<State>,
    cancel: CancelToken,
    budget: Arc<Budget>,
) -> Vec<JoinHandle<()>> {
    (0..campaign.workers)
        .map(|index| {
            let lane = Lane::new(index, campaign.cpu_affinity, campaign.nice);
            let mut fuzzer = Fuzzer::new(
                lane,
                shared.mutators.clone(),
                shared.pool.clone(),
                shared.corpus.clone(),
                shared.evaluator.clone(),
                shared.scorer.clone(),
                lane_rng(campaign.seed, index),
            )
            .with_fate_suppression(campaign.suppress_fated);
            if let Some(reductions) = &shared.reductions {
                fuzzer = fuzzer.with_reductions(reductions.clone());
            }

            let (state, cancel, budget) = (state.clone(), cancel.clone(), budget.clone());

            thread::spawn(move || {
                let mut failures = 0;

                while !cancel.is_cancelled() && budget.take() {
                    match fuzzer.run_once() {
                        Ok(report) => {
                            failures = 0;
                            state.lock().unwrap().record(&report.status);
                        }
                        Err(e) if is_cancellation(&e) => break,
                        Err(e) => {
                            failures += 1;
                            log!("[lane {index}] cycle failed: {e:#}");
                            record_event(FuzzingEvent::now(
                                index,
                                FuzzingEventKind::ToolFailure {
                                    message: format!("{e:#}"),
                                },
                            ));
                            state.lock().unwrap().errors += 1;

                            if failures >= MAX_CONSECUTIVE_FAILURES {
                                log!("[lane {index}] {failures} failures in a row, stopping campaign");
                                cancel.cancel();
                            }
                        }
                    }
                }
                log!("[lane {index}] finished");
            })
        })
        .collect()
}

/// Writes the strategy pool to disk at a fixed interval.
pub struct Snapshotter {
    pool: Arc<RwLock<StrategyPool>>,
    path: PathBuf,
    interval: Duration,
    last: Instant,
}

impl Snapshotter {
    pub fn new(pool: Arc<RwLock<StrategyPool>>, path: PathBuf, interval: Duration) -> Self {
        Snapshotter {
            pool,
            path,
            interval,
            last: Instant::now(),
        }
    }

    pub fn tick(&mut self) {
        if self.last.elapsed() >= self.interval {
            self.save();
        }
    }

    pub fn save(&mut self) {
        self.last = Instant::now();
        let result = self.pool.read().unwrap().save(&self.path);
        if let Err(e) = result {
            log!("cannot save strategy snapshot: {e:#}");
        }
    }
}
