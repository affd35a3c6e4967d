use std::{
    fmt::Display,
    io::Read,
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::{Child, ChildStderr, Command, Stdio},
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sched::{sched_getaffinity, sched_setaffinity, CpuSet},
    sys::signal::{kill, killpg, Signal},
    unistd::Pid,
};
use serde_derive::{Deserialize, Serialize};

use crate::{log::log, state::CancelToken};

const SCRATCH_PREFIX: &str = "tf-scratch-";
const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("error spawning {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("error waiting for child: {0}")]
    Wait(std::io::Error),
    #[error("error preparing scratch directory: {0}")]
    Scratch(std::io::Error),
    #[error("empty command line")]
    EmptyCommand,
    #[error("campaign cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{program} is unavailable: {reason}")]
    Unavailable { program: String, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Exited within the grace window after SIGTERM.
    Graceful,
    /// Needed SIGKILL.
    Forced,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExitStatus {
    Code { code: i32 },
    Signal { signal: i32 },
    TimedOut { termination: Termination },
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code { code: 0 })
    }

    pub fn timed_out(&self) -> bool {
        matches!(self, ExitStatus::TimedOut { .. })
    }

    fn from_std(status: std::process::ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitStatus::Code { code },
            (None, Some(signal)) => ExitStatus::Signal { signal },
            (None, None) => ExitStatus::Code { code: -1 },
        }
    }
}

impl Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Code { code } => write!(f, "code {code}"),
            ExitStatus::Signal { signal } => write!(f, "signal {signal}"),
            ExitStatus::TimedOut {
                termination: Termination::Graceful,
            } => write!(f, "timed out (terminated)"),
            ExitStatus::TimedOut {
                termination: Termination::Forced,
            } => write!(f, "timed out (killed)"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessOutcome {
    pub status: ExitStatus,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Resource isolation for one worker: optional CPU pinning and a niceness value.
#[derive(Clone, Copy, Debug, Default)]
pub struct Lane {
    pub index: usize,
    pub cpu: Option<usize>,
    pub nice: i32,
}

impl Lane {
    /// Pins lane `index` round-robin over the CPUs this process may run on.
    pub fn new(index: usize, pin: bool, nice: i32) -> Self {
        let cpu = if pin {
            let cpus = allowed_cpus();
            if cpus.is_empty() {
                log!("[lane {index}] cpu affinity unavailable, running unpinned");
            }
            cpus.get(index % cpus.len().max(1)).copied()
        } else {
            None
        };
        Lane { index, cpu, nice }
    }
}

/// CPU ids in the current affinity mask, which need not be `0..n`.
pub fn allowed_cpus() -> Vec<usize> {
    match sched_getaffinity(Pid::from_raw(0)) {
        Ok(set) => (0..CpuSet::count())
            .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
            .collect(),
        Err(_) => vec![],
    }
}

/// Runs in the forked child. A refused CPU pin leaves the child unpinned.
fn isolate(cpu: Option<usize>, nice: i32) -> std::io::Result<()> {
    if let Some(cpu) = cpu {
        let mut set = CpuSet::new();
        if set.set(cpu).is_ok() {
            let _ = sched_setaffinity(Pid::from_raw(0), &set);
        }
    }
    if nice != 0 && unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Scratch directory removed when dropped.
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

/// Builds a command from an argv template, replacing `{name}` placeholders.
pub fn command_from(argv: &[String], substitutions: &[(&str, &str)]) -> Result<Command, ExecutionError> {
    let expand = |arg: &String| {
        substitutions
            .iter()
            .fold(arg.clone(), |arg, (name, value)| arg.replace(&format!("{{{name}}}"), value))
    };

    let (program, args) = argv.split_first().ok_or(ExecutionError::EmptyCommand)?;
    let mut command = Command::new(expand(program));
    command.args(args.iter().map(expand));
    Ok(command)
}

pub struct Sandbox {
    root: PathBuf,
    counter: AtomicU64,
    cancel: CancelToken,
    grace: Duration,
    max_stderr: usize,
}

impl Sandbox {
    pub fn new(root: PathBuf, cancel: CancelToken, grace: Duration, max_stderr: usize) -> Self {
        Sandbox {
            root,
            counter: AtomicU64::new(0),
            cancel,
            grace,
            max_stderr,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn scratch(&self, lane: &Lane) -> Result<ScratchDir, ExecutionError> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let path = self.root.join(format!(
            "{SCRATCH_PREFIX}{}-{}-{n}",
            std::process::id(),
            lane.index
        ));

        std::fs::create_dir_all(&path).map_err(ExecutionError::Scratch)?;
        Ok(ScratchDir { path })
    }

    /// Runs the command to completion or until `timeout`, whichever comes first.
    ///
    /// The child gets its own process group, so escalation reaches anything it spawned.
    /// Only stderr is captured, truncated to the configured size.
    pub fn run(
        &self,
        command: &mut Command,
        timeout: Duration,
        lane: &Lane,
    ) -> Result<ProcessOutcome, ExecutionError> {
        if self.cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let (cpu, nice) = (lane.cpu, lane.nice);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0);
        unsafe {
            command.pre_exec(move || isolate(cpu, nice));
        }

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| ExecutionError::Spawn {
            program: command.get_program().to_string_lossy().into_owned(),
            source,
        })?;

        let stderr = child.stderr.take();
        let max_stderr = self.max_stderr;
        let reader = thread::spawn(move || read_capped(stderr, max_stderr));

        let status = loop {
            if let Some(status) = child.try_wait().map_err(ExecutionError::Wait)? {
                break ExitStatus::from_std(status);
            }
            if self.cancel.is_cancelled() {
                self.terminate(&mut child)?;
                let _ = reader.join();
                return Err(ExecutionError::Cancelled);
            }
            if start.elapsed() >= timeout {
                break ExitStatus::TimedOut {
                    termination: self.terminate(&mut child)?,
                };
            }
            thread::sleep(POLL_INTERVAL);
        };

        // background children may still hold stderr open
        let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);

        let deadline = Instant::now() + self.grace;
        while !reader.is_finished() && Instant::now() < deadline {
            thread::sleep(POLL_INTERVAL);
        }
        let stderr = if reader.is_finished() {
            reader.join().unwrap_or_default()
        } else {
            log!("stderr of {:?} still open after exit, dropping it", command.get_program());
            String::new()
        };

        Ok(ProcessOutcome {
            status,
            stderr,
            elapsed: start.elapsed(),
        })
    }

    fn terminate(&self, child: &mut Child) -> Result<Termination, ExecutionError> {
        let group = Pid::from_raw(child.id() as i32);
        let _ = killpg(group, Signal::SIGTERM);

        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline {
            if child.try_wait().map_err(ExecutionError::Wait)?.is_some() {
                let _ = killpg(group, Signal::SIGKILL);
                return Ok(Termination::Graceful);
            }
            thread::sleep(POLL_INTERVAL);
        }

        let _ = killpg(group, Signal::SIGKILL);
        child.wait().map_err(ExecutionError::Wait)?;
        Ok(Termination::Forced)
    }

    /// Runs `argv` with `args` appended and requires a zero exit.
    pub fn check_available(&self, argv: &[String], args: &[&str], timeout: Duration) -> Result<(), ToolError> {
        let program = argv.first().cloned().unwrap_or_default();
        let unavailable = |reason: String| ToolError::Unavailable {
            program: program.clone(),
            reason,
        };

        let mut command = command_from(argv, &[]).map_err(|e| unavailable(e.to_string()))?;
        command.args(args);
        let outcome = self
            .run(&mut command, timeout, &Lane::default())
            .map_err(|e| unavailable(e.to_string()))?;

        if outcome.status.success() {
            Ok(())
        } else {
            Err(unavailable(format!(
                "exited with {}: {}",
                outcome.status,
                outcome.stderr.trim()
            )))
        }
    }
}

fn read_capped(pipe: Option<ChildStderr>, max: usize) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };

    let mut kept = vec![];
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = max.saturating_sub(kept.len());
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

fn process_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Removes scratch directories left behind by processes that no longer exist.
pub fn sweep_stale_scratch(root: &Path) -> std::io::Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let mut removed = 0;
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(rest) = name.strip_prefix(SCRATCH_PREFIX) else {
            continue;
        };
        let Some(pid) = rest.split('-').next().and_then(|p| p.parse::<i32>().ok()) else {
            continue;
        };

        if pid as u32 != std::process::id() && !process_alive(pid) {
            std::fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}
