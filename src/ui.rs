use std::{
    marker::PhantomData,
    sync::{Arc, MutexGuard, RwLock},
    time::{Duration, Instant},
};

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use itertools::Itertools;
use ringbuffer::RingBufferExt;
use tui::{
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction, Layout, Margin, Rect},
    widgets::{Block, Borders, Cell, Row, Table},
    Frame, Terminal,
};

use crate::{
    fuzz_thread::Budget,
    log::pull_messages,
    mutation::{StrategyPool, WeightTable},
    oracle::BugKind,
    state::{State, AM},
};

const RATE_WINDOW: Duration = Duration::from_secs(10);

pub struct TerminalUi<B: Backend + std::io::Write> {
    state: AM<State>,
    pool: Arc<RwLock<StrategyPool>>,
    budget: Arc<Budget>,
    terminal: Option<Terminal<B>>,
}

impl TerminalUi<CrosstermBackend<std::io::Stdout>> {
    pub fn new(
        state: AM<State>,
        pool: Arc<RwLock<StrategyPool>>,
        budget: Arc<Budget>,
    ) -> Result<Self, anyhow::Error> {
        enable_raw_mode()?;
        let mut stdout = std::io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        let backend = CrosstermBackend::new(stdout);
        let terminal = Terminal::new(backend)?;

        Ok(TerminalUi {
            state,
            pool,
            budget,
            terminal: Some(terminal),
        })
    }
}

struct TerminalInstance<'m, B: Backend + std::io::Write> {
    pub state: MutexGuard<'m, State>,
    pub weights: WeightTable,
    pub budget: &'m Budget,
    pub backend: PhantomData<B>,
}

impl<B: Backend + std::io::Write> TerminalUi<B> {
    pub fn tick(&mut self) -> Result<(), anyhow::Error> {
        let Some(mut terminal) = self.terminal.take() else {
            return Ok(());
        };

        terminal.draw(|frame| {
            let size: tui::layout::Rect = frame.size();

            let weights = self.pool.read().unwrap().snapshot();
            let state = self.state.lock().unwrap();

            let mut instance = TerminalInstance {
                state,
                weights,
                budget: &self.budget,
                backend: PhantomData {},
            };

            instance.draw_all(frame, size);
        })?;

        let _nothing = self.terminal.insert(terminal);
        Ok(())
    }
}

fn format_duration(duration: Duration) -> String {
    humantime::format_duration(Duration::from_secs(duration.as_secs())).to_string()
}

/// Executions per second over the last few seconds.
pub fn execution_rate(state: &State) -> f64 {
    let now = Instant::now();
    let window_start = now.checked_sub(RATE_WINDOW).unwrap_or(state.start_time);
    let window = now.duration_since(window_start.max(state.start_time));

    let recent = state
        .executions
        .iter()
        .filter(|t| **t >= window_start)
        .count();
    if window.is_zero() {
        0.0
    } else {
        recent as f64 / window.as_secs_f64()
    }
}

/// One-line campaign status for headless runs.
pub fn summary(state: &State) -> String {
    let finds = BugKind::INTERESTING
        .iter()
        .map(|kind| format!("{}={}", kind.short_name(), state.found.get(kind).unwrap_or(&0)))
        .join(" ");
    format!(
        "{} cycles ({:.1}/s), {} boring, {} rejected, {} duplicates, {} errors | {finds}",
        state.cycles,
        execution_rate(state),
        state.boring,
        state.rejected,
        state.duplicates,
        state.errors
    )
}

impl<'m, B: Backend + std::io::Write> TerminalInstance<'m, B> {
    fn draw_all(&mut self, frame: &mut Frame<B>, mut target: Rect) {
        self.draw_outer_frame(frame, target);

        target = target.inner(&Margin {
            vertical: 1,
            horizontal: 1,
        });

        let layout = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(40), Constraint::Percentage(60)].as_ref())
            .split(target);

        self.write_left_panel(frame, layout[0]);

        self.write_right_panel(frame, layout[1]);
    }

    fn draw_outer_frame(&mut self, frame: &mut Frame<B>, target: Rect) {
        let block = Block::default()
            .title("traitfuzz (q to stop)")
            .borders(Borders::ALL);
        frame.render_widget(block, target);
    }

    fn extract_time_stats(&mut self) -> Vec<(String, String)> {
        let mut stats = vec![
            (
                "run duration".to_string(),
                format_duration(self.state.start_time.elapsed()),
            ),
            (
                "last find".to_string(),
                match self.state.last_find {
                    Some(at) => format!("{} ago", format_duration(at.elapsed())),
                    None => "none yet".to_string(),
                },
            ),
            (
                "cycles/sec".to_string(),
                format!("{:.2}", execution_rate(&self.state)),
            ),
        ];
        if let Some(remaining) = self.budget.remaining_time() {
            stats.push(("time left".to_string(), format_duration(remaining)));
        }
        stats
    }

    fn extract_run_stats(&mut self) -> Vec<(String, String)> {
        [
            ("cycles", self.state.cycles),
            ("no mutation", self.state.no_mutation),
            ("rejected", self.state.rejected),
            ("boring", self.state.boring),
            ("duplicates", self.state.duplicates),
            ("fated", self.state.fated),
            ("reductions", self.state.reductions),
            ("errors", self.state.errors),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
    }

    fn extract_find_stats(&mut self) -> Vec<(String, String)> {
        let mut stats = BugKind::INTERESTING
            .iter()
            .map(|kind| {
                (
                    kind.short_name().to_string(),
                    self.state.found.get(kind).unwrap_or(&0).to_string(),
                )
            })
            .collect_vec();
        stats.push(("total".to_string(), self.state.total_found().to_string()));
        stats
    }

    fn write_stats(frame: &mut Frame<B>, target: Rect, stats: Vec<(String, String)>) {
        let rows = stats
            .into_iter()
            .map(|(k, v)| Row::new(vec![Cell::from(k), Cell::from(v)]).height(1));

        let table = Table::new(rows)
            .block(Block::default().borders(Borders::NONE))
            .widths(&[Constraint::Percentage(50), Constraint::Percentage(50)]);

        frame.render_widget(table, target);
    }

    fn write_list(frame: &mut Frame<B>, target: Rect, stats: Vec<String>) {
        let rows = stats
            .into_iter()
            .map(|item| Row::new(vec![Cell::from(item)]).height(1));

        let table = Table::new(rows)
            .block(Block::default().borders(Borders::NONE))
            .widths(&[Constraint::Percentage(100)]);

        frame.render_widget(table, target);
    }

    fn write_stats_in_frame(
        frame: &mut Frame<B>,
        mut target: Rect,
        stats: Vec<(String, String)>,
        title: &str,
    ) {
        let block = Block::default().title(title).borders(Borders::ALL);
        frame.render_widget(block, target);

        target = target.inner(&Margin {
            vertical: 1,
            horizontal: 1,
        });

        Self::write_stats(frame, target, stats)
    }

    fn write_list_in_frame(frame: &mut Frame<B>, mut target: Rect, list: Vec<String>, title: &str) {
        let block = Block::default().title(title).borders(Borders::ALL);
        frame.render_widget(block, target);

        target = target.inner(&Margin {
            vertical: 1,
            horizontal: 1,
        });

        Self::write_list(frame, target, list)
    }

    fn write_left_panel(&mut self, frame: &mut Frame<B>, target: Rect) {
        let layout = Layout::default()
            .direction(Direction::Vertical)
            .constraints(
                [
                    Constraint::Percentage(25),
                    Constraint::Percentage(40),
                    Constraint::Percentage(35),
                ]
                .as_ref(),
            )
            .split(target);

        let time_stats = self.extract_time_stats();

        Self::write_stats_in_frame(frame, layout[0], time_stats, "time stats");

        let run_stats = self.extract_run_stats();

        Self::write_stats_in_frame(frame, layout[1], run_stats, "cycles");

        let find_stats = self.extract_find_stats();

        Self::write_stats_in_frame(frame, layout[2], find_stats, "finds");
    }

    fn format_weights(&self) -> Vec<String> {
        let families = self
            .weights
            .families
            .iter()
            .map(|f| format!("{}={:.2}", f.family.name(), f.weight))
            .join(" ");

        let arms = self
            .weights
            .arms
            .iter()
            .sorted_by(|a, b| b.weight.total_cmp(&a.weight))
            .map(|arm| {
                format!(
                    "{:<22} {:>6.2}  picks {:<6} rewards {}",
                    arm.mutator, arm.weight, arm.picks, arm.rewards
                )
            });

        std::iter::once(families).chain(arms).collect()
    }

    fn format_log(width: u16, height: u16) -> Vec<String> {
        let width = (width as usize).max(10);
        let lines = pull_messages(height as usize)
            .iter()
            .flat_map(|message| {
                textwrap::wrap(message, width)
                    .into_iter()
                    .map(|line| line.into_owned())
                    .collect_vec()
            })
            .collect_vec();

        let skip = lines.len().saturating_sub(height as usize);
        lines.into_iter().skip(skip).collect()
    }

    fn write_right_panel(&mut self, frame: &mut Frame<B>, target: Rect) {
        let layout = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Percentage(45), Constraint::Percentage(55)].as_ref())
            .split(target);

        Self::write_list_in_frame(frame, layout[0], self.format_weights(), "strategy");

        let inner = layout[1].inner(&Margin {
            vertical: 1,
            horizontal: 1,
        });
        Self::write_list_in_frame(
            frame,
            layout[1],
            Self::format_log(inner.width, inner.height),
            "log",
        );
    }
}

impl<B: Backend + std::io::Write> Drop for TerminalUi<B> {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        if let Some(terminal) = self.terminal.as_mut() {
            let _ = execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture);
            let _ = terminal.show_cursor();
        }
    }
}

/// Draws until `q` is pressed or `keep_running` returns false.
pub fn serve_ui(
    state: AM<State>,
    pool: Arc<RwLock<StrategyPool>>,
    budget: Arc<Budget>,
    mut keep_running: impl FnMut() -> bool,
) -> Result<(), anyhow::Error> {
    let mut ui = TerminalUi::new(state, pool, budget)?;

    const FRAME_RATE: u32 = 30;

    while keep_running() {
        ui.tick()?;

        if !event::poll(Duration::from_secs_f64(1.0 / (FRAME_RATE as f64)))? {
            continue;
        }

        if let Event::Key(key) = event::read()? {
            if let KeyCode::Char('q') = key.code {
                return Ok(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use ringbuffer::RingBufferWrite;

    use super::*;
    use crate::fuzzing::CycleStatus;

    #[test]
    fn summary_lists_every_interesting_kind() {
        let mut state = State::new();
        state.record(&CycleStatus::New(BugKind::Ice));
        state.record(&CycleStatus::Boring);

        let line = summary(&state);

        assert!(line.starts_with("2 cycles"));
        assert!(line.contains("ice=1"));
        assert!(line.contains("hang=0"));
        assert!(line.contains("trait-overflow=0"));
    }

    #[test]
    fn rate_counts_only_the_recent_window() {
        let mut state = State::new();
        assert_eq!(execution_rate(&state), 0.0);

        state.start_time = Instant::now().checked_sub(Duration::from_secs(60)).unwrap();
        state.executions.push(state.start_time);
        for _ in 0..20 {
            state.executions.push(Instant::now());
        }

        let rate = execution_rate(&state);
        assert!((rate - 2.0).abs() < 0.1, "rate was {rate}");
    }
}
