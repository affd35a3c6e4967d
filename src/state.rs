use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use ringbuffer::RingBufferWrite;
use vector_map::VecMap;

use crate::{fuzzing::CycleStatus, oracle::BugKind};

#[derive(Clone)]
pub struct State {
    pub cycles: usize,
    pub rejected: usize,
    pub no_mutation: usize,
    pub boring: usize,
    pub duplicates: usize,
    pub fated: usize,
    pub reductions: usize,
    pub errors: usize,
    pub found: VecMap<BugKind, usize>,

    pub start_time: Instant,
    pub last_find: Option<Instant>,
    pub executions: ringbuffer::AllocRingBuffer<Instant>,
}

impl State {
    pub fn new() -> Self {
        State {
            cycles: 0,
            rejected: 0,
            no_mutation: 0,
            boring: 0,
            duplicates: 0,
            fated: 0,
            reductions: 0,
            errors: 0,
            found: VecMap::new(),
            start_time: Instant::now(),
            last_find: None,
            executions: ringbuffer::AllocRingBuffer::with_capacity(512),
        }
    }

    pub fn record(&mut self, status: &CycleStatus) {
        self.cycles += 1;
        self.executions.push(Instant::now());

        match status {
            CycleStatus::NoMutation => self.no_mutation += 1,
            CycleStatus::Rejected => self.rejected += 1,
            CycleStatus::Boring => self.boring += 1,
            CycleStatus::Duplicate(_) => self.duplicates += 1,
            CycleStatus::Fated(_) => self.fated += 1,
            CycleStatus::New(kind) => {
                match self.found.get_mut(kind) {
                    Some(count) => *count += 1,
                    None => {
                        self.found.insert(*kind, 1);
                    }
                }
                self.last_find = Some(Instant::now());
            }
        }
    }

    pub fn total_found(&self) -> usize {
        self.found.iter().map(|(_, count)| *count).sum()
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Campaign-wide stop flag shared by workers, subprocess waits and the dashboard.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub type AM<T> = Arc<Mutex<T>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_are_counted_per_kind() {
        let mut state = State::new();
        state.record(&CycleStatus::New(BugKind::Hang));
        state.record(&CycleStatus::New(BugKind::Hang));
        state.record(&CycleStatus::New(BugKind::Ice));
        state.record(&CycleStatus::Duplicate(BugKind::Ice));
        state.record(&CycleStatus::Rejected);
        state.record(&CycleStatus::Fated(BugKind::Hang));

        assert_eq!(state.cycles, 6);
        assert_eq!(state.found.get(&BugKind::Hang), Some(&2));
        assert_eq!(state.total_found(), 3);
        assert_eq!(state.duplicates, 1);
        assert_eq!(state.fated, 1);
        assert!(state.last_find.is_some());
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
