use std::{
    fmt::Display,
    path::Path,
    str::FromStr,
    sync::Arc,
    time::Instant,
};

use serde_derive::{Deserialize, Serialize};

use crate::{
    configuration::{CompilerConfig, FuzzConfig, OracleConfig},
    execution::{command_from, ExecutionError, Lane, ProcessOutcome, Sandbox, ScratchDir, ToolError},
    log::log,
    profile::{Profiler, Trace},
    syntax::{self, SyntaxTree},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BugKind {
    Hang,
    Ice,
    NewFailureRegression,
    NewSuccessRegression,
    TraitOverflow,
    Boring,
}

impl BugKind {
    pub const INTERESTING: [BugKind; 5] = [
        BugKind::Hang,
        BugKind::Ice,
        BugKind::NewFailureRegression,
        BugKind::NewSuccessRegression,
        BugKind::TraitOverflow,
    ];

    /// Corpus bucket name.
    pub fn dir_name(self) -> &'static str {
        match self {
            BugKind::Hang => "hang",
            BugKind::Ice => "ice",
            BugKind::NewFailureRegression => "new_failure",
            BugKind::NewSuccessRegression => "new_success",
            BugKind::TraitOverflow => "trait_overflow",
            BugKind::Boring => "boring",
        }
    }

    /// Name accepted by `FromStr` and the predicate environment variable.
    pub fn short_name(self) -> &'static str {
        match self {
            BugKind::Hang => "hang",
            BugKind::Ice => "ice",
            BugKind::NewFailureRegression => "new-failure",
            BugKind::NewSuccessRegression => "new-success",
            BugKind::TraitOverflow => "trait-overflow",
            BugKind::Boring => "boring",
        }
    }

    pub fn is_interesting(self) -> bool {
        self != BugKind::Boring
    }
}

impl Display for BugKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown bug kind `{0}`")]
pub struct UnknownKind(String);

impl FromStr for BugKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('_', "-");
        [
            BugKind::Hang,
            BugKind::Ice,
            BugKind::NewFailureRegression,
            BugKind::NewSuccessRegression,
            BugKind::TraitOverflow,
            BugKind::Boring,
        ]
        .into_iter()
        .find(|kind| {
            kind.short_name() == normalized || kind.dir_name().replace('_', "-") == normalized
        })
        .or_else(|| match normalized.as_str() {
            "new-failure-regression" => Some(BugKind::NewFailureRegression),
            "new-success-regression" => Some(BugKind::NewSuccessRegression),
            _ => None,
        })
        .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Which classifications count as "interesting" for the predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KindFilter {
    Any,
    Only(BugKind),
}

impl KindFilter {
    pub fn accepts(self, kind: BugKind) -> bool {
        match self {
            KindFilter::Any => kind.is_interesting(),
            KindFilter::Only(target) => kind == target,
        }
    }
}

impl FromStr for KindFilter {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("any") {
            Ok(KindFilter::Any)
        } else {
            s.parse().map(KindFilter::Only)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OracleStage {
    ParseCheck,
    BaselineCompile,
    DivergenceCompile,
    Classify,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OracleResult {
    pub baseline: ProcessOutcome,
    /// Absent when the baseline compile timed out and the divergence compile was skipped.
    pub divergence: Option<ProcessOutcome>,
}

#[derive(Clone, Debug)]
pub enum Verdict {
    Rejected {
        reason: String,
    },
    Classified {
        kind: BugKind,
        result: OracleResult,
        trace: Option<Trace>,
        line_count: usize,
    },
}

impl Verdict {
    pub fn kind(&self) -> Option<BugKind> {
        match self {
            Verdict::Rejected { .. } => None,
            Verdict::Classified { kind, .. } => Some(*kind),
        }
    }
}

pub trait Evaluator: Send + Sync {
    fn evaluate(&self, source: &str, lane: &Lane) -> Result<Verdict, ExecutionError>;
}

/// Lowercased diagnostic substrings.
pub struct Signatures {
    ice: Vec<String>,
    overflow: Vec<String>,
}

impl Signatures {
    pub fn new(config: &OracleConfig) -> Self {
        let lower = |items: &[String]| -> Vec<String> { items.iter().map(|s| s.to_lowercase()).collect() };
        Signatures {
            ice: lower(&config.ice_signatures),
            overflow: lower(&config.overflow_signatures),
        }
    }

    fn contains(stderr: &str, signatures: &[String]) -> bool {
        let stderr = stderr.to_lowercase();
        signatures.iter().any(|sig| stderr.contains(sig.as_str()))
    }
}

/// First matching rule wins.
pub fn classify(
    signatures: &Signatures,
    baseline: &ProcessOutcome,
    divergence: Option<&ProcessOutcome>,
) -> BugKind {
    let Some(divergence) = divergence else {
        return BugKind::Boring;
    };

    if divergence.status.timed_out() {
        return BugKind::Hang;
    }
    if Signatures::contains(&divergence.stderr, &signatures.ice) {
        return BugKind::Ice;
    }

    match (baseline.status.success(), divergence.status.success()) {
        (true, false) => return BugKind::NewFailureRegression,
        (false, true) => return BugKind::NewSuccessRegression,
        _ => {}
    }

    if Signatures::contains(&baseline.stderr, &signatures.overflow)
        || Signatures::contains(&divergence.stderr, &signatures.overflow)
    {
        return BugKind::TraitOverflow;
    }
    BugKind::Boring
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Baseline,
    Divergence,
}

pub struct Oracle {
    compiler: CompilerConfig,
    config: OracleConfig,
    signatures: Signatures,
    profiler: Profiler,
    sandbox: Arc<Sandbox>,
}

const CANDIDATE_FILE: &str = "candidate.rs";

impl Oracle {
    pub fn new(config: &FuzzConfig, sandbox: Arc<Sandbox>) -> Self {
        Oracle {
            compiler: config.compiler.clone(),
            config: config.oracle.clone(),
            signatures: Signatures::new(&config.oracle),
            profiler: Profiler::new(config.profiling.clone()),
            sandbox,
        }
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    /// Startup check: both compiler commands must answer `--version`.
    pub fn check_tools(&self) -> Result<(), ToolError> {
        let timeout = self.config.baseline_timeout;
        self.sandbox.check_available(&self.compiler.baseline, &["--version"], timeout)?;
        if self.compiler.divergence != self.compiler.baseline {
            self.sandbox.check_available(&self.compiler.divergence, &["--version"], timeout)?;
        }
        Ok(())
    }

    /// Lexes, re-renders and grammar-checks the candidate; returns the line count on
    /// success. The in-process check runs on the lane thread and is rejected if it
    /// overran `parse_timeout`.
    fn parse_check(&self, source: &str, scratch: &ScratchDir, lane: &Lane) -> Result<Result<usize, String>, ExecutionError> {
        let started = Instant::now();
        let checked = SyntaxTree::parse(source).and_then(|tree| {
            syntax::check_program(&tree.render())?;
            Ok(tree.line_count())
        });

        let line_count = match checked {
            Err(e) => return Ok(Err(e.to_string())),
            Ok(_) if started.elapsed() > self.config.parse_timeout => {
                return Ok(Err("parse check timed out".to_string()))
            }
            Ok(lines) => lines,
        };

        if let Some(argv) = &self.config.parse_check {
            let file = scratch.file(CANDIDATE_FILE);
            let mut command = command_from(argv, &[("file", &*file.to_string_lossy())])?;
            command.current_dir(scratch.path());

            let outcome = self.sandbox.run(&mut command, self.config.parse_timeout, lane)?;
            if !outcome.status.success() {
                return Ok(Err(format!("external parse check: {}", outcome.status)));
            }
        }
        Ok(Ok(line_count))
    }

    fn compile(&self, mode: Mode, scratch: &ScratchDir, lane: &Lane) -> Result<ProcessOutcome, ExecutionError> {
        let compiler = &self.compiler;
        let (argv, timeout) = match mode {
            Mode::Baseline => (&compiler.baseline, self.config.baseline_timeout),
            Mode::Divergence => (&compiler.divergence, self.config.divergence_timeout),
        };
        let out_dir = scratch.file(match mode {
            Mode::Baseline => "out-baseline",
            Mode::Divergence => "out-divergence",
        });

        let mut command = command_from(argv, &[])?;
        command
            .current_dir(scratch.path())
            .args(["--crate-type", compiler.crate_type.as_str()])
            .args(["--edition", compiler.edition.as_str()])
            .arg(format!("--emit={}", compiler.emit))
            .arg("--out-dir")
            .arg(&out_dir);

        if mode == Mode::Divergence {
            if let Some(flag) = &compiler.experimental_flag {
                command.arg(flag);
            }
            command.args(self.profiler.args(&scratch.file("profile")));
        }
        command.args(&compiler.extra_args).arg(CANDIDATE_FILE);

        self.sandbox.run(&mut command, timeout, lane)
    }

    fn load_trace(&self, profile_dir: &Path, lane: &Lane) -> Option<Trace> {
        match self.profiler.collect(profile_dir, &self.sandbox, lane) {
            Ok(trace) => trace,
            Err(e) => {
                log!("[lane {}] profiling unavailable: {e}", lane.index);
                None
            }
        }
    }
}

impl Evaluator for Oracle {
    fn evaluate(&self, source: &str, lane: &Lane) -> Result<Verdict, ExecutionError> {
        let scratch = self.sandbox.scratch(lane)?;
        std::fs::write(scratch.file(CANDIDATE_FILE), source).map_err(ExecutionError::Scratch)?;

        let mut stage = OracleStage::ParseCheck;
        let mut line_count = 0;
        let mut baseline = None;
        let mut divergence = None;

        loop {
            stage = match stage {
                OracleStage::ParseCheck => match self.parse_check(source, &scratch, lane)? {
                    Ok(lines) => {
                        line_count = lines;
                        OracleStage::BaselineCompile
                    }
                    Err(reason) => return Ok(Verdict::Rejected { reason }),
                },
                OracleStage::BaselineCompile => {
                    let outcome = self.compile(Mode::Baseline, &scratch, lane)?;
                    let next = if outcome.status.timed_out() {
                        OracleStage::Classify
                    } else {
                        OracleStage::DivergenceCompile
                    };
                    baseline = Some(outcome);
                    next
                }
                OracleStage::DivergenceCompile => {
                    divergence = Some(self.compile(Mode::Divergence, &scratch, lane)?);
                    OracleStage::Classify
                }
                OracleStage::Classify => break,
            }
        }

        let Some(baseline) = baseline else {
            return Ok(Verdict::Rejected {
                reason: "baseline compile did not run".to_string(),
            });
        };
        let kind = classify(&self.signatures, &baseline, divergence.as_ref());

        let trace = if kind.is_interesting() && divergence.is_some() && self.profiler.enabled() {
            self.load_trace(&scratch.file("profile"), lane)
        } else {
            None
        };

        Ok(Verdict::Classified {
            kind,
            result: OracleResult {
                baseline,
                divergence,
            },
            trace,
            line_count,
        })
    }
}
