use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{mpsc::Receiver, Arc},
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::{
    configuration::{FuzzConfig, ReducerConfig},
    corpus::load_entry,
    execution::{command_from, ExecutionError, Lane, Sandbox, ToolError},
    log::{log, record_event, FuzzingEvent, FuzzingEventKind},
    oracle::{BugKind, Evaluator},
    state::{State, AM},
};

#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    #[error("cannot load entry {path}: {error:#}")]
    Entry { path: PathBuf, error: anyhow::Error },
    #[error("candidate no longer classifies as {0}")]
    NotReproducible(BugKind),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("external reducer failed: {0}")]
    External(String),
    #[error("cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The pass/fail question a reduction preserves.
pub trait Predicate {
    fn holds(&self, source: &str) -> Result<bool, ReduceError>;
}

impl<F: Fn(&str) -> Result<bool, ReduceError>> Predicate for F {
    fn holds(&self, source: &str) -> Result<bool, ReduceError> {
        self(source)
    }
}

/// Line-level delta debugging. Returns the smallest text found within `max_passes`
/// passes for which `predicate` still holds.
pub fn ddmin(source: &str, predicate: &dyn Predicate, max_passes: usize) -> Result<String, ReduceError> {
    let mut lines: Vec<&str> = source.lines().collect();
    let mut granularity = 2;

    for _ in 0..max_passes {
        if lines.len() < 2 {
            break;
        }

        let chunk = lines.len().div_ceil(granularity);
        let mut reduced = false;
        let mut start = 0;

        while start < lines.len() {
            let end = (start + chunk).min(lines.len());
            let complement: Vec<&str> = lines[..start].iter().chain(&lines[end..]).copied().collect();

            if !complement.is_empty() && predicate.holds(&complement.join("\n"))? {
                lines = complement;
                reduced = true;
            } else {
                start = end;
            }
        }

        if reduced {
            granularity = (granularity - 1).max(2);
        } else if granularity >= lines.len() {
            break;
        } else {
            granularity = (granularity * 2).min(lines.len());
        }
    }

    Ok(lines.join("\n"))
}

#[derive(Debug)]
pub struct Reduction {
    pub kind: BugKind,
    pub fingerprint: String,
    pub path: PathBuf,
    pub lines_before: usize,
    pub lines_after: usize,
}

pub struct ReductionJob {
    pub entry: PathBuf,
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

pub struct Reducer {
    config: ReducerConfig,
    output: PathBuf,
    config_path: PathBuf,
    evaluator: Arc<dyn Evaluator>,
    sandbox: Arc<Sandbox>,
    lane: Lane,
}

impl Reducer {
    pub fn new(
        config: &FuzzConfig,
        config_path: &Path,
        evaluator: Arc<dyn Evaluator>,
        sandbox: Arc<Sandbox>,
    ) -> Self {
        let campaign = &config.campaign;
        Reducer {
            config: config.reducer.clone(),
            output: config.corpus.output.clone(),
            config_path: config_path.to_path_buf(),
            evaluator,
            sandbox,
            lane: Lane::new(campaign.workers, campaign.cpu_affinity, campaign.nice),
        }
    }

    pub fn output_path(&self, kind: BugKind, fingerprint: &str) -> PathBuf {
        self.output
            .join("reduced")
            .join(kind.dir_name())
            .join(format!("{fingerprint}.rs"))
    }

    pub fn check_external(&self) -> Result<(), ToolError> {
        match &self.config.external {
            Some(argv) => self
                .sandbox
                .check_available(&argv[..1.min(argv.len())], &["--version"], Duration::from_secs(10)),
            None => Ok(()),
        }
    }

    fn classifies_as(&self, source: &str, kind: BugKind) -> Result<bool, ReduceError> {
        Ok(self.evaluator.evaluate(source, &self.lane)?.kind() == Some(kind))
    }

    /// Minimizes the entry at `entry` into `<output>/reduced/<kind>/<fingerprint>.rs`.
    /// The entry itself is left untouched.
    pub fn reduce_entry(&self, entry: &Path) -> Result<Reduction, ReduceError> {
        let (metadata, tree) = load_entry(entry).map_err(|error| ReduceError::Entry {
            path: entry.to_path_buf(),
            error,
        })?;
        let kind = metadata.kind;
        let source = tree.render();

        if !self.classifies_as(&source, kind)? {
            return Err(ReduceError::NotReproducible(kind));
        }

        let reduced = match &self.config.external {
            Some(argv) => self.run_external(argv, &source, kind)?,
            None => {
                let predicate = |text: &str| self.classifies_as(text, kind);
                ddmin(&source, &predicate, self.config.max_passes)?
            }
        };

        let path = self.output_path(kind, &metadata.fingerprint);
        write_atomically(&path, &reduced)?;

        Ok(Reduction {
            kind,
            fingerprint: metadata.fingerprint,
            path,
            lines_before: source.lines().count(),
            lines_after: reduced.lines().count(),
        })
    }

    fn predicate_script(&self, kind: BugKind) -> Result<String, ReduceError> {
        let exe = std::env::current_exe().map_err(|e| ReduceError::External(e.to_string()))?;
        let config = self
            .config_path
            .canonicalize()
            .unwrap_or_else(|_| self.config_path.clone());

        Ok(format!(
            "#!/bin/sh\nTRAITFUZZ_BUG_KIND={} exec {} --config {} oracle \"${{1:-candidate.rs}}\"\n",
            kind.short_name(),
            shell_quote(&exe.to_string_lossy()),
            shell_quote(&config.to_string_lossy()),
        ))
    }

    /// Hands the candidate to an external reducer that shrinks `{file}` in place,
    /// using the generated `{predicate}` script as its interestingness test.
    fn run_external(&self, argv: &[String], source: &str, kind: BugKind) -> Result<String, ReduceError> {
        let scratch = self.sandbox.scratch(&self.lane)?;
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| ReduceError::Io { path, source }
        };

        let predicate = scratch.file("predicate.sh");
        std::fs::write(&predicate, self.predicate_script(kind)?).map_err(io(&predicate))?;
        std::fs::set_permissions(&predicate, std::fs::Permissions::from_mode(0o755))
            .map_err(io(&predicate))?;

        let file = scratch.file("candidate.rs");
        std::fs::write(&file, source).map_err(io(&file))?;

        let (predicate, file_arg) = (predicate.to_string_lossy(), file.to_string_lossy());
        let mut command = command_from(argv, &[("predicate", &*predicate), ("file", &*file_arg)])?;
        command.current_dir(scratch.path());

        let outcome = self
            .sandbox
            .run(&mut command, self.config.external_timeout, &self.lane)?;
        if !outcome.status.success() {
            return Err(ReduceError::External(format!(
                "exited with {}: {}",
                outcome.status,
                outcome.stderr.trim()
            )));
        }

        let reduced = std::fs::read_to_string(&file).map_err(io(&file))?;
        if !self.classifies_as(&reduced, kind)? {
            return Err(ReduceError::External(format!(
                "result no longer classifies as {kind}"
            )));
        }
        Ok(reduced)
    }
}

fn write_atomically(path: &Path, content: &str) -> Result<(), ReduceError> {
    let io = |source| ReduceError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io)?;
    }
    let tmp = path.with_extension("rs.tmp");
    std::fs::write(&tmp, content).map_err(io)?;
    std::fs::rename(&tmp, path).map_err(io)
}

/// Single reducer thread working through jobs in arrival order.
pub fn spawn_reducer(reducer: Reducer, jobs: Receiver<ReductionJob>, state: AM<State>) -> JoinHandle<()> {
    thread::spawn(move || {
        for job in jobs {
            if reducer.sandbox.cancel_token().is_cancelled() {
                break;
            }
            match reducer.reduce_entry(&job.entry) {
                Ok(reduction) => {
                    log!(
                        "reduced {} {} from {} to {} lines",
                        reduction.kind,
                        &reduction.fingerprint[..12.min(reduction.fingerprint.len())],
                        reduction.lines_before,
                        reduction.lines_after
                    );
                    record_event(FuzzingEvent::now(
                        reducer.lane.index,
                        FuzzingEventKind::Reduced {
                            kind: reduction.kind,
                            fingerprint: reduction.fingerprint,
                            lines_before: reduction.lines_before,
                            lines_after: reduction.lines_after,
                        },
                    ));
                    state.lock().unwrap().reductions += 1;
                }
                Err(ReduceError::Execution(ExecutionError::Cancelled)) => break,
                Err(e) => log!("reduction of {} failed: {e}", job.entry.display()),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{
        configuration::tests::minimal,
        corpus::{tests::metadata, CANDIDATE_FILE, METADATA_FILE},
        oracle::tests::FnEvaluator,
        state::CancelToken,
    };

    #[test]
    fn ddmin_keeps_the_needed_line() {
        let source = (0..10)
            .map(|i| if i == 7 { "KEEP".to_string() } else { format!("line {i}") })
            .collect::<Vec<_>>()
            .join("\n");
        let predicate = |text: &str| Ok(text.contains("KEEP"));

        assert_eq!(ddmin(&source, &predicate, 8).unwrap(), "KEEP");
    }

    #[test]
    fn ddmin_keeps_dependent_lines_together() {
        let source = "a\nb\nNEED1\nc\nd\ne\nNEED2\nf";
        let predicate = |text: &str| Ok(text.contains("NEED1") && text.contains("NEED2"));

        assert_eq!(ddmin(source, &predicate, 16).unwrap(), "NEED1\nNEED2");
    }

    #[test]
    fn ddmin_respects_pass_limit() {
        let source = "1\n2\n3\n4\n5\n6\n7\n8";
        let calls = Cell::new(0);
        let predicate = |_: &str| {
            calls.set(calls.get() + 1);
            Ok(false)
        };

        assert_eq!(ddmin(source, &predicate, 1).unwrap(), source);
        assert_eq!(calls.get(), 2);
    }

    fn write_entry(dir: &Path, source: &str, kind: BugKind) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(CANDIDATE_FILE), source).unwrap();
        let meta = metadata("cafe", kind, 1.0);
        std::fs::write(dir.join(METADATA_FILE), serde_json::to_string(&meta).unwrap()).unwrap();
    }

    fn reducer(output: &Path, evaluator: Arc<dyn Evaluator>) -> Reducer {
        let mut config = minimal();
        config.corpus.output = output.to_path_buf();
        let sandbox = Sandbox::new(
            output.join("scratch"),
            CancelToken::new(),
            Duration::from_millis(100),
            4096,
        );
        Reducer::new(&config, Path::new("fuzz.toml"), evaluator, Arc::new(sandbox))
    }

    #[test]
    fn reduced_file_lands_beside_the_untouched_entry() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("new_failure").join("cafe");
        let source = "struct A;\nstruct B;\ntrait Boom {}\nfn main() {}";
        write_entry(&entry, source, BugKind::NewFailureRegression);

        let evaluator = FnEvaluator(|text: &str| {
            Some(if text.contains("Boom") {
                BugKind::NewFailureRegression
            } else {
                BugKind::Boring
            })
        });
        let reduction = reducer(dir.path(), Arc::new(evaluator))
            .reduce_entry(&entry)
            .unwrap();

        assert_eq!(
            reduction.path,
            dir.path().join("reduced").join("new_failure").join("cafe.rs")
        );
        assert_eq!(std::fs::read_to_string(&reduction.path).unwrap(), "trait Boom { }");
        assert_eq!(reduction.lines_after, 1);
        assert_eq!(
            std::fs::read_to_string(entry.join(CANDIDATE_FILE)).unwrap(),
            source
        );
    }

    #[test]
    fn entries_that_stopped_reproducing_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let entry = dir.path().join("hang").join("cafe");
        write_entry(&entry, "fn main() {}", BugKind::Hang);

        let evaluator = FnEvaluator(|_: &str| Some(BugKind::Boring));
        let result = reducer(dir.path(), Arc::new(evaluator)).reduce_entry(&entry);

        assert!(matches!(result, Err(ReduceError::NotReproducible(BugKind::Hang))));
    }

    #[test]
    fn predicate_script_quotes_paths() {
        let dir = tempfile::tempdir().unwrap();
        let evaluator = FnEvaluator(|_: &str| None);
        let script = reducer(dir.path(), Arc::new(evaluator))
            .predicate_script(BugKind::TraitOverflow)
            .unwrap();

        assert!(script.starts_with("#!/bin/sh\nTRAITFUZZ_BUG_KIND=trait-overflow exec '"));
        assert!(script.contains("oracle \"${1:-candidate.rs}\""));
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
