use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table, Wrap};

use crate::app::{ProgressEvent, ProgressSink, Stage};
use crate::cancel::CancelToken;
use crate::domain::{DatasetStatus, RecordId};
use crate::error::SyncError;
use crate::summary::RunSummary;

const EVENTS_MAX: usize = 8;

#[derive(Debug, Clone)]
struct RowState {
    stage: Stage,
    message: String,
}

#[derive(Debug)]
struct ViewState {
    stage: Stage,
    status: String,
    rows: BTreeMap<RecordId, RowState>,
    events: VecDeque<String>,
    started: Instant,
    cancelling: bool,
}

/// Live status table for `--visual-gui`. `q` or `Esc` cancels the run.
pub struct Tui {
    state: Arc<Mutex<ViewState>>,
}

struct TuiProgress {
    state: Arc<Mutex<ViewState>>,
}

impl ProgressSink for TuiProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            let message = event.message.trim().to_string();
            state.stage = event.stage;
            match &event.record {
                Some(id) => {
                    state.rows.insert(id.clone(), RowState {
                        stage: event.stage,
                        message: message.clone(),
                    });
                    push_event(&mut state.events, format!("[{}] {id} {message}", timestamp()));
                }
                None => {
                    state.status = message.clone();
                    push_event(&mut state.events, format!("[{}] {message}", timestamp()));
                }
            }
        }
    }
}

impl Default for Tui {
    fn default() -> Self {
        Self::new()
    }
}

impl Tui {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ViewState {
                stage: Stage::Manifest,
                status: "starting".to_string(),
                rows: BTreeMap::new(),
                events: VecDeque::new(),
                started: Instant::now(),
                cancelling: false,
            })),
        }
    }

    /// Runs `f` on a worker thread while drawing its progress. Cancelling
    /// only raises `cancel`; the call still waits for `f` to wind down.
    pub fn run<F, R>(&mut self, cancel: CancelToken, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, SyncError> + Send + 'static,
        R: Send + 'static,
    {
        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let sink = TuiProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let mut tick = 0usize;
        let result = loop {
            if let Ok(state) = self.state.lock() {
                terminal
                    .draw(|frame| draw_run(frame, &state, tick))
                    .into_diagnostic()?;
            }

            if let Ok(result) = rx.try_recv() {
                break result;
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if is_cancel_key(key) && !cancel.is_cancelled() {
                        cancel.cancel();
                        if let Ok(mut state) = self.state.lock() {
                            state.cancelling = true;
                            state.status = "cancelling, waiting for transfers".to_string();
                        }
                    }
                }
            }

            tick = tick.wrapping_add(1);
        };

        disable_raw_mode().into_diagnostic()?;
        let mut stdout = io::stdout();
        stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
        handle.join().ok();
        result.map_err(miette::Report::new)
    }

    /// Shows the final status table until a key is pressed.
    pub fn show_summary(&mut self, summary: &RunSummary) -> miette::Result<()> {
        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;

        loop {
            terminal
                .draw(|frame| draw_summary(frame, summary))
                .into_diagnostic()?;
            if event::poll(Duration::from_millis(100)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if key.kind == KeyEventKind::Press {
                        break;
                    }
                }
            }
        }

        disable_raw_mode().into_diagnostic()?;
        let mut stdout = io::stdout();
        stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
        Ok(())
    }
}

fn is_cancel_key(key: KeyEvent) -> bool {
    key.kind == KeyEventKind::Press && matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
}

fn draw_run(frame: &mut ratatui::Frame, state: &ViewState, tick: usize) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(EVENTS_MAX as u16 + 2),
        ])
        .split(frame.area());

    frame.render_widget(draw_header(state, tick), chunks[0]);

    let rows = state
        .rows
        .iter()
        .map(|(id, row)| {
            Row::new(vec![
                Cell::from(id.to_string()),
                Cell::from(Span::styled(
                    row.stage.label(),
                    Style::default().fg(stage_color(row.stage)),
                )),
                Cell::from(row.message.clone()),
            ])
        })
        .collect::<Vec<_>>();
    let table = Table::new(rows, [
        Constraint::Percentage(40),
        Constraint::Length(10),
        Constraint::Min(10),
    ])
    .header(
        Row::new(vec!["Dataset", "Stage", "Last event"])
            .style(Style::default().add_modifier(Modifier::BOLD)),
    )
    .block(Block::default().borders(Borders::ALL).title("Datasets"));
    frame.render_widget(table, chunks[1]);

    let events = state
        .events
        .iter()
        .map(|event| Line::from(event.clone()))
        .collect::<Vec<_>>();
    let log = Paragraph::new(events)
        .block(Block::default().borders(Borders::ALL).title("Events"))
        .wrap(Wrap { trim: true });
    frame.render_widget(log, chunks[2]);
}

fn draw_header(state: &ViewState, tick: usize) -> Paragraph<'static> {
    let hb = if tick % 2 == 0 { "*" } else { " " };
    let elapsed = state.started.elapsed().as_secs();
    let hint = if state.cancelling {
        Span::styled("cancelling", Style::default().fg(Color::Yellow))
    } else {
        Span::styled("q/Esc: cancel", Style::default().fg(Color::Gray))
    };
    let header_line = Line::from(vec![
        Span::styled(
            "DE PROFUNDIS",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(" "),
        Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
        Span::raw("   Stage: "),
        Span::styled(state.stage.label(), Style::default().fg(stage_color(state.stage))),
        Span::raw(format!(
            " ({}/{})   {elapsed}s   ",
            state.stage.index() + 1,
            Stage::ALL.len()
        )),
        hint,
        Span::raw("   "),
        Span::styled(hb, Style::default().fg(Color::Green)),
    ]);
    let status_line = Line::from(Span::styled(
        state.status.clone(),
        Style::default().fg(Color::Gray),
    ));
    Paragraph::new(vec![header_line, status_line])
        .alignment(Alignment::Left)
        .block(Block::default().borders(Borders::BOTTOM))
}

fn draw_summary(frame: &mut ratatui::Frame, summary: &RunSummary) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(6)])
        .split(frame.area());

    let counts = DatasetStatus::ALL
        .iter()
        .map(|status| format!("{} {}", status.icon(), summary.counts.get(*status)))
        .collect::<Vec<_>>()
        .join("  ");
    let header = Paragraph::new(vec![
        Line::from(Span::styled(
            format!(
                "Run finished in {:.1}s, {} transferred",
                summary.elapsed_secs,
                bytes_to_human(summary.bytes_transferred)
            ),
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(format!("{counts}   (press any key)")),
    ])
    .block(Block::default().borders(Borders::BOTTOM));
    frame.render_widget(header, chunks[0]);

    let rows = summary
        .records
        .iter()
        .map(|record| {
            Row::new(vec![
                Cell::from(record.id.to_string()),
                Cell::from(Span::styled(
                    format!("{} {}", record.status.icon(), record.status),
                    Style::default().fg(status_color(record.status)),
                )),
                Cell::from(bytes_to_human(record.size_bytes)),
            ])
        })
        .collect::<Vec<_>>();
    let table = Table::new(rows, [
        Constraint::Percentage(50),
        Constraint::Length(16),
        Constraint::Min(10),
    ])
    .header(
        Row::new(vec!["Dataset", "Status", "Size"])
            .style(Style::default().add_modifier(Modifier::BOLD)),
    )
    .block(Block::default().borders(Borders::ALL).title("Datasets"));
    frame.render_widget(table, chunks[1]);
}

fn stage_color(stage: Stage) -> Color {
    match stage {
        Stage::Fetch => Color::Cyan,
        Stage::Extract => Color::Magenta,
        Stage::Summary => Color::Green,
        _ => Color::Yellow,
    }
}

fn status_color(status: DatasetStatus) -> Color {
    match status {
        DatasetStatus::Downloaded => Color::Green,
        DatasetStatus::Warning => Color::Yellow,
        DatasetStatus::Error => Color::Red,
        DatasetStatus::Unknown => Color::Gray,
        DatasetStatus::Manual => Color::Blue,
    }
}

fn push_event(buffer: &mut VecDeque<String>, item: String) {
    buffer.push_back(item);
    while buffer.len() > EVENTS_MAX {
        buffer.pop_front();
    }
}

fn timestamp() -> String {
    let now = SystemTime::now();
    let secs = now
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs();
    let mins = (secs / 60) % 60;
    let hours = (secs / 3600) % 24;
    let seconds = secs % 60;
    format!("{hours:02}:{mins:02}:{seconds:02}")
}

fn bytes_to_human(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let value = bytes as f64;
    if value >= GB {
        format!("{:.1} GB", value / GB)
    } else if value >= MB {
        format!("{:.1} MB", value / MB)
    } else if value >= KB {
        format!("{:.1} KB", value / KB)
    } else {
        format!("{bytes} B")
    }
}
