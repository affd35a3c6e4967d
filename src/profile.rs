use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use itertools::Itertools;
use serde_derive::Deserialize;

use crate::{
    configuration::ProfilingConfig,
    execution::{command_from, ExecutionError, Lane, Sandbox},
};

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("error reading profile: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed profile {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("profile summarizer failed: {0}")]
    Summarize(String),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Self time, either as `{secs, nanos}` or a plain nanosecond count.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SelfTime {
    Structured {
        secs: u64,
        #[serde(default)]
        nanos: u32,
    },
    Nanos(u64),
}

impl Default for SelfTime {
    fn default() -> Self {
        SelfTime::Nanos(0)
    }
}

impl SelfTime {
    pub fn as_duration(&self) -> Duration {
        match *self {
            SelfTime::Structured { secs, nanos } => Duration::new(secs, nanos),
            SelfTime::Nanos(nanos) => Duration::from_nanos(nanos),
        }
    }

    pub fn millis(&self) -> f64 {
        self.as_duration().as_secs_f64() * 1e3
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct EventRecord {
    pub label: String,
    #[serde(default)]
    pub self_time: SelfTime,
    #[serde(default, alias = "count")]
    pub invocation_count: u64,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Trace {
    #[serde(alias = "query_data", alias = "events")]
    pub records: Vec<EventRecord>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TraceDocument {
    Bare(Vec<EventRecord>),
    Wrapped(Trace),
}

impl Trace {
    pub fn parse(text: &str) -> Result<Trace, serde_json::Error> {
        Ok(match serde_json::from_str(text)? {
            TraceDocument::Bare(records) => Trace { records },
            TraceDocument::Wrapped(trace) => trace,
        })
    }

    pub fn from_file(path: &Path) -> Result<Trace, ProfileError> {
        let text = std::fs::read_to_string(path)?;
        Trace::parse(&text).map_err(|source| ProfileError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn merge(mut self, other: Trace) -> Trace {
        self.records.extend(other.records);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn files_with_extension(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, std::io::Error> {
    Ok(std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().map_or(false, |e| e == extension))
        .sorted()
        .collect())
}

/// Locates and loads self-profiling output written by the divergence compile.
pub struct Profiler {
    config: ProfilingConfig,
}

impl Profiler {
    pub fn new(config: ProfilingConfig) -> Self {
        Profiler { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Compiler arguments that send profiling output into `dir`.
    pub fn args(&self, dir: &Path) -> Vec<String> {
        if !self.config.enabled {
            return vec![];
        }
        let dir = dir.to_string_lossy();
        self.config
            .args
            .iter()
            .map(|arg| arg.replace("{dir}", &dir))
            .collect()
    }

    /// Reads every JSON trace in `dir`, converting raw profiles first when a summarizer
    /// is configured. `Ok(None)` means no trace was produced.
    pub fn collect(
        &self,
        dir: &Path,
        sandbox: &Sandbox,
        lane: &Lane,
    ) -> Result<Option<Trace>, ProfileError> {
        if !self.config.enabled || !dir.is_dir() {
            return Ok(None);
        }

        let mut traces = files_with_extension(dir, "json")?;

        if traces.is_empty() {
            if let Some(summarize) = &self.config.summarize {
                for raw in files_with_extension(dir, "mm_profdata")? {
                    self.summarize(summarize, &raw, dir, sandbox, lane)?;
                }
                traces = files_with_extension(dir, "json")?;
            }
        }

        if traces.is_empty() {
            return Ok(None);
        }

        let mut merged = Trace::default();
        for path in traces {
            merged = merged.merge(Trace::from_file(&path)?);
        }
        Ok(Some(merged))
    }

    fn summarize(
        &self,
        argv: &[String],
        raw: &Path,
        dir: &Path,
        sandbox: &Sandbox,
        lane: &Lane,
    ) -> Result<(), ProfileError> {
        let file = raw.to_string_lossy();
        let mut command = command_from(argv, &[("file", &*file)])?;
        command.current_dir(dir);

        let outcome = sandbox.run(&mut command, self.config.summarize_timeout, lane)?;
        if outcome.status.success() {
            Ok(())
        } else {
            Err(ProfileError::Summarize(format!(
                "{}: {}",
                outcome.status,
                outcome.stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CancelToken;

    #[test]
    fn accepts_both_time_and_count_forms() {
        let trace = Trace::parse(
            r#"{"query_data": [
                {"label": "evaluate_obligation", "self_time": {"secs": 1, "nanos": 500000000}, "invocation_count": 4},
                {"label": "typeck", "self_time": 2000000, "count": 7},
                {"label": "misc"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(trace.records.len(), 3);
        assert_eq!(trace.records[0].self_time.millis(), 1500.0);
        assert_eq!(trace.records[0].invocation_count, 4);
        assert_eq!(trace.records[1].self_time.millis(), 2.0);
        assert_eq!(trace.records[1].invocation_count, 7);
        assert_eq!(trace.records[2].self_time, SelfTime::Nanos(0));
    }

    #[test]
    fn accepts_bare_arrays() {
        let trace = Trace::parse(r#"[{"label": "x", "self_time": 1}]"#).unwrap();
        assert_eq!(trace.records[0].label, "x");
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(Trace::parse("{\"unrelated\": 1}").is_err());
        assert!(Trace::parse("not json").is_err());
    }

    fn profiler(summarize: Option<Vec<String>>) -> Profiler {
        Profiler::new(ProfilingConfig {
            summarize,
            ..ProfilingConfig::default()
        })
    }

    fn sandbox(root: &Path) -> Sandbox {
        Sandbox::new(
            root.to_path_buf(),
            CancelToken::new(),
            Duration::from_millis(100),
            4096,
        )
    }

    #[test]
    fn traces_in_a_directory_are_merged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), r#"[{"label": "a"}]"#).unwrap();
        std::fs::write(dir.path().join("b.json"), r#"{"events": [{"label": "b"}]}"#).unwrap();

        let trace = profiler(None)
            .collect(dir.path(), &sandbox(dir.path()), &Lane::default())
            .unwrap()
            .unwrap();

        assert_eq!(trace.records.iter().map(|r| r.label.as_str()).collect_vec(), ["a", "b"]);
    }

    #[test]
    fn missing_profile_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("profile");

        let trace = profiler(None)
            .collect(&missing, &sandbox(dir.path()), &Lane::default())
            .unwrap();
        assert!(trace.is_none());
    }

    #[test]
    fn raw_profiles_go_through_the_summarizer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("candidate-1.mm_profdata"), "raw").unwrap();

        let summarize = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            r#"test -f "$0" && echo '[{"label": "fulfill", "self_time": 5}]' > summary.json"#
                .to_string(),
            "{file}".to_string(),
        ];
        let trace = profiler(Some(summarize))
            .collect(dir.path(), &sandbox(dir.path()), &Lane::default())
            .unwrap()
            .unwrap();

        assert_eq!(trace.records[0].label, "fulfill");
    }

    #[test]
    fn profiling_args_point_into_the_directory() {
        let args = profiler(None).args(Path::new("/tmp/x/profile"));
        assert_eq!(args, ["-Zself-profile=/tmp/x/profile"]);
    }
}
