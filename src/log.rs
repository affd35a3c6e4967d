use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{Datelike, Local, Timelike};
use itertools::Itertools;
use lazy_static::lazy_static;
use ringbuffer::RingBufferWrite;
use ringbuffer::{AllocRingBuffer, RingBufferExt};
use serde_derive::Serialize;

use crate::oracle::BugKind;

#[derive(Default)]
struct Sinks {
    log_file: Option<File>,
    events: Option<File>,
    echo: bool,
}

lazy_static! {
    static ref BUFFER: Mutex<AllocRingBuffer<String>> =
        Mutex::new(AllocRingBuffer::with_capacity(128));
    static ref SINKS: Mutex<Sinks> = Mutex::new(Sinks::default());
    static ref START: Instant = Instant::now();
}

fn append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Sends messages to `<output>/traitfuzz.log` and events to `<output>/events.jsonl`.
/// With `echo`, messages are also printed to stderr.
pub fn init(output: &Path, echo: bool) -> std::io::Result<()> {
    std::fs::create_dir_all(output)?;
    lazy_static::initialize(&START);

    let mut sinks = SINKS.lock().unwrap();
    sinks.log_file = Some(append(&output.join("traitfuzz.log"))?);
    sinks.events = Some(append(&output.join("events.jsonl"))?);
    sinks.echo = echo;
    Ok(())
}

pub fn write_message(message: &str) {
    let time = Local::now();

    let human_readable = format!(
        "{:02}.{:02} {:02}:{:02}:{:02}",
        time.day(),
        time.month(),
        time.hour(),
        time.minute(),
        time.second()
    );
    let line = format!("[{human_readable}] {message}");

    {
        let mut sinks = SINKS.lock().unwrap();
        if sinks.echo {
            eprintln!("{line}");
        }
        if let Some(file) = sinks.log_file.as_mut() {
            let _ = writeln!(file, "{line}");
        }
    }

    let mut buffer = BUFFER.lock().unwrap();

    buffer.push(line)
}

macro_rules! log{
    ($($e:expr),+) => {
        crate::log::write_message(&format!($($e),+))
    }
}

pub(crate) use log;

pub fn pull_messages(n: usize) -> Vec<String> {
    let mut items = {
        let buffer = BUFFER.lock().unwrap();

        buffer.iter().rev().take(n).map(Clone::clone).collect_vec()
    };
    items.reverse();
    items
}

#[derive(Clone, Debug, Serialize)]
pub struct FuzzingEvent {
    pub time_as_seconds: f64,
    pub lane: usize,
    pub kind: FuzzingEventKind,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum FuzzingEventKind {
    NewEntry {
        kind: BugKind,
        fingerprint: String,
        score: f64,
        mutator: String,
    },

    Duplicate {
        kind: BugKind,
        fingerprint: String,
        hits: u64,
    },

    Fated {
        kind: BugKind,
        fingerprint: String,
        family: String,
    },

    Reduced {
        kind: BugKind,
        fingerprint: String,
        lines_before: usize,
        lines_after: usize,
    },

    ToolFailure { message: String },
}

impl FuzzingEvent {
    pub fn now(lane: usize, kind: FuzzingEventKind) -> Self {
        FuzzingEvent {
            time_as_seconds: START.elapsed().as_secs_f64(),
            lane,
            kind,
        }
    }
}

pub fn record_event(event: FuzzingEvent) {
    let Ok(line) = serde_json::to_string(&event) else {
        return;
    };
    let mut sinks = SINKS.lock().unwrap();
    if let Some(file) = sinks.events.as_mut() {
        let _ = writeln!(file, "{line}");
    }
}
