use std::{
    path::{Path, PathBuf},
    process,
    sync::{mpsc, Arc, Mutex, RwLock},
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};

use crate::{
    completion::HttpCompletion,
    configuration::{load_config, validate_config, ConfigReadError, FuzzConfig},
    corpus::{load_seeds, Corpus, CorpusError, SeedWeighting},
    execution::{sweep_stale_scratch, Lane, Sandbox},
    fuzz_thread::{spawn_workers, Budget, Shared, Snapshotter},
    log::log,
    mutation::{build_mutators, StrategyPool},
    oracle::{Evaluator, KindFilter, Oracle, Verdict},
    reduce::{spawn_reducer, ReduceError, Reducer},
    scoring::Scorer,
    state::{CancelToken, State, AM},
    syntax::SyntaxTree,
};

mod completion;
mod configuration;
mod corpus;
mod execution;
mod fuzz_thread;
mod fuzzing;
mod log;
mod mutation;
mod oracle;
mod profile;
mod reduce;
mod scoring;
mod state;
mod syntax;
mod ui;

const BUG_KIND_VAR: &str = "TRAITFUZZ_BUG_KIND";
const STRATEGY_FILE: &str = "strategy.json";
const SUMMARY_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(
    name = "traitfuzz",
    about = "Differential fuzzer for the Rust trait solver",
    version,
    long_about = None
)]
struct Cli {
    /// Campaign configuration (TOML).
    #[arg(long, short = 'c', global = true, value_name = "FILE", default_value = "fuzz.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a fuzzing campaign.
    Run {
        /// Show the terminal dashboard instead of logging to stderr.
        #[arg(long)]
        tui: bool,

        #[arg(long)]
        iterations: Option<u64>,

        #[arg(long)]
        workers: Option<usize>,

        /// Wall-clock budget, e.g. `2h` or `90m`.
        #[arg(long, value_parser = humantime::parse_duration)]
        time: Option<Duration>,
    },

    /// Classify one file; exits 0 when it matches $TRAITFUZZ_BUG_KIND.
    Oracle { path: PathBuf },

    /// Minimize a stored corpus entry.
    Reduce { entry: PathBuf },

    /// Print how many mutation sites each mutator finds in a file.
    Sites { file: PathBuf },
}

fn fail(code: exitcode::ExitCode, message: impl std::fmt::Display) -> ! {
    eprintln!("{message}");
    process::exit(code)
}

fn read_config(path: &Path) -> FuzzConfig {
    match load_config(path) {
        Ok(config) => config,
        Err(ConfigReadError::ReadError(e)) => {
            fail(exitcode::IOERR, format!("failed to read {}: {e}", path.display()))
        }
        Err(ConfigReadError::ParseError(e)) => fail(exitcode::CONFIG, e),
        Err(ConfigReadError::Validation(e)) => {
            fail(exitcode::CONFIG, format!("invalid configuration:\n{e}"))
        }
    }
}

fn scratch_root(config: &FuzzConfig) -> PathBuf {
    config
        .campaign
        .scratch_root
        .clone()
        .unwrap_or_else(std::env::temp_dir)
}

fn sandbox(config: &FuzzConfig, cancel: CancelToken) -> Arc<Sandbox> {
    Arc::new(Sandbox::new(
        scratch_root(config),
        cancel,
        config.oracle.kill_grace,
        config.oracle.max_stderr_bytes,
    ))
}

fn run_campaign(config_path: &Path, config: FuzzConfig, tui: bool) -> Result<(), anyhow::Error> {
    let output = config.corpus.output.clone();
    if let Err(e) = log::init(&output, !tui) {
        fail(exitcode::IOERR, format!("cannot prepare {}: {e}", output.display()));
    }

    match sweep_stale_scratch(&scratch_root(&config)) {
        Ok(0) => {}
        Ok(n) => log!("removed {n} stale scratch directories"),
        Err(e) => log!("scratch sweep failed: {e}"),
    }

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || cancel.cancel()) {
            log!("cannot install interrupt handler: {e}");
        }
    }

    let sandbox = sandbox(&config, cancel.clone());
    let oracle = Arc::new(Oracle::new(&config, sandbox.clone()));
    if let Err(e) = oracle.check_tools() {
        fail(exitcode::UNAVAILABLE, e);
    }

    let mutators = match build_mutators(&config) {
        Ok(mutators) => mutators,
        Err(e) => fail(exitcode::SOFTWARE, format!("cannot build mutators: {e:#}")),
    };
    if config.llm.enabled {
        if let Err(e) = HttpCompletion::new(&config.llm).check_available() {
            fail(exitcode::UNAVAILABLE, e);
        }
    }

    let (seeds, report) = match load_seeds(&config.corpus.seeds, config.campaign.skip_internal_seeds) {
        Ok(loaded) => loaded,
        Err(e @ CorpusError::NoSeeds(_)) => fail(exitcode::CONFIG, e),
        Err(e) => fail(exitcode::IOERR, e),
    };
    log!(
        "loaded {} seeds ({} empty, {} internal, {} unparseable skipped)",
        report.loaded,
        report.empty,
        report.internal,
        report.unparseable
    );

    let corpus = match Corpus::open(
        &output,
        seeds,
        config.campaign.discovered_bias,
        config.campaign.pick_decay,
    ) {
        Ok(corpus) => corpus.with_weighting(SeedWeighting::from(&config.campaign)),
        Err(e) => fail(exitcode::IOERR, e),
    };
    log!("{} entries already in the corpus", corpus.discovered_len());

    let strategy_path = output.join(STRATEGY_FILE);
    let mut pool = StrategyPool::new(&mutators, &config.strategy);
    if config.campaign.resume && strategy_path.exists() {
        let table = StrategyPool::load(&strategy_path)?;
        let restored = pool.restore(&table);
        log!("restored {restored} strategy weights from {}", strategy_path.display());
    }
    let pool = Arc::new(RwLock::new(pool));

    let state: AM<State> = Arc::new(Mutex::new(State::new()));

    let (reductions, reducer) = if config.reducer.enabled {
        let evaluator: Arc<dyn Evaluator> = oracle.clone();
        let reducer = Reducer::new(&config, config_path, evaluator, sandbox.clone());
        if let Err(e) = reducer.check_external() {
            fail(exitcode::UNAVAILABLE, e);
        }
        let (tx, rx) = mpsc::channel();
        (Some(tx), Some(spawn_reducer(reducer, rx, state.clone())))
    } else {
        (None, None)
    };

    let budget = Arc::new(Budget::new(config.campaign.iterations, config.campaign.time_budget));

    let shared = Shared {
        mutators,
        pool: pool.clone(),
        corpus: Arc::new(RwLock::new(corpus)),
        evaluator: oracle,
        scorer: Arc::new(Scorer::new(config.scoring.clone())),
        reductions,
    };
    log!(
        "starting {} lanes with {} mutators",
        config.campaign.workers,
        shared.mutators.len()
    );
    let workers = spawn_workers(&config.campaign, shared, state.clone(), cancel.clone(), budget.clone());

    let mut snapshotter = Snapshotter::new(pool.clone(), strategy_path, config.campaign.snapshot_interval);
    let running = |workers: &[thread::JoinHandle<()>]| workers.iter().any(|w| !w.is_finished());

    if tui {
        let result = ui::serve_ui(state.clone(), pool.clone(), budget.clone(), || {
            snapshotter.tick();
            running(&workers) && !cancel.is_cancelled()
        });
        if running(&workers) {
            cancel.cancel();
        }
        result?;
    } else {
        let mut last_summary = Instant::now();
        while running(&workers) {
            thread::sleep(Duration::from_millis(200));
            snapshotter.tick();
            if last_summary.elapsed() >= SUMMARY_INTERVAL {
                last_summary = Instant::now();
                log!("{}", ui::summary(&state.lock().unwrap()));
            }
        }
    }

    for worker in workers {
        if worker.join().is_err() {
            log!("a lane panicked");
        }
    }
    if let Some(reducer) = reducer {
        if !cancel.is_cancelled() {
            log!("waiting for pending reductions");
        }
        let _ = reducer.join();
    }
    snapshotter.save();

    let summary = ui::summary(&state.lock().unwrap());
    log!("campaign finished: {summary}");
    println!("{summary}");
    Ok(())
}

/// Predicate for external reducers: exit 0 when the file classifies as the kind
/// named by `TRAITFUZZ_BUG_KIND`.
fn run_oracle(config: &FuzzConfig, path: &Path) -> i32 {
    let filter = match std::env::var(BUG_KIND_VAR) {
        Ok(value) => match value.parse::<KindFilter>() {
            Ok(filter) => filter,
            Err(e) => fail(exitcode::CONFIG, format!("{BUG_KIND_VAR}: {e}")),
        },
        Err(_) => KindFilter::Any,
    };

    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => fail(exitcode::IOERR, format!("cannot read {}: {e}", path.display())),
    };

    let oracle = Oracle::new(config, sandbox(config, CancelToken::new()));
    match oracle.evaluate(&source, &Lane::default()) {
        Ok(Verdict::Classified { kind, .. }) => {
            println!("{kind}");
            if filter.accepts(kind) {
                0
            } else {
                1
            }
        }
        Ok(Verdict::Rejected { reason }) => {
            println!("rejected: {reason}");
            1
        }
        Err(e) => fail(exitcode::SOFTWARE, e),
    }
}

fn run_reduce(config_path: &Path, config: &FuzzConfig, entry: &Path) -> i32 {
    if let Err(e) = log::init(&config.corpus.output, true) {
        fail(exitcode::IOERR, e);
    }

    let sandbox = sandbox(config, CancelToken::new());
    let oracle = Arc::new(Oracle::new(config, sandbox.clone()));
    if let Err(e) = oracle.check_tools() {
        fail(exitcode::UNAVAILABLE, e);
    }

    let reducer = Reducer::new(config, config_path, oracle, sandbox);
    if let Err(e) = reducer.check_external() {
        fail(exitcode::UNAVAILABLE, e);
    }

    match reducer.reduce_entry(entry) {
        Ok(reduction) => {
            println!(
                "{} ({} -> {} lines)",
                reduction.path.display(),
                reduction.lines_before,
                reduction.lines_after
            );
            exitcode::OK
        }
        Err(e @ (ReduceError::Entry { .. } | ReduceError::NotReproducible(_))) => {
            fail(exitcode::DATAERR, e)
        }
        Err(e) => fail(exitcode::SOFTWARE, e),
    }
}

fn run_sites(config: &FuzzConfig, file: &Path) -> i32 {
    let source = match std::fs::read_to_string(file) {
        Ok(source) => source,
        Err(e) => fail(exitcode::IOERR, format!("cannot read {}: {e}", file.display())),
    };
    let tree = match SyntaxTree::parse(&source) {
        Ok(tree) => tree,
        Err(e) => fail(exitcode::DATAERR, e),
    };
    let mutators = match build_mutators(config) {
        Ok(mutators) => mutators,
        Err(e) => fail(exitcode::SOFTWARE, format!("{e:#}")),
    };

    for mutator in mutators.iter() {
        println!(
            "{:<16} {:<22} {}",
            mutator.family().name(),
            mutator.name(),
            mutator.count(&tree)
        );
    }
    exitcode::OK
}

fn main() {
    let cli = Cli::parse();
    let mut config = read_config(&cli.config);

    let code = match cli.command {
        Command::Run {
            tui,
            iterations,
            workers,
            time,
        } => {
            if iterations.is_some() {
                config.campaign.iterations = iterations;
            }
            if let Some(workers) = workers {
                config.campaign.workers = workers;
            }
            if time.is_some() {
                config.campaign.time_budget = time;
            }
            if let Err(e) = validate_config(&config) {
                fail(exitcode::CONFIG, format!("invalid configuration:\n{e}"));
            }

            match run_campaign(&cli.config, config, tui) {
                Ok(()) => exitcode::OK,
                Err(e) => fail(exitcode::SOFTWARE, format!("campaign failed: {e:#}")),
            }
        }
        Command::Oracle { path } => run_oracle(&config, &path),
        Command::Reduce { entry } => run_reduce(&cli.config, &config, &entry),
        Command::Sites { file } => run_sites(&config, &file),
    };

    process::exit(code)
}
