use std::error::Error;
use std::io::stdout;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use crossbeam_channel::unbounded;
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event as CEvent, KeyCode, KeyEvent};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table, Wrap};

use crate::control::api;
use crate::{DMA_PERIOD_COUNT, Engine, EngineStatus, HwState, StreamStatus};

const TICK_RATE: Duration = Duration::from_millis(100);

#[derive(Default)]
struct AppState {
    status: Option<EngineStatus>,
    selected: usize,
    message: Option<String>,
    last_update: Option<Instant>,
}

/// Run the ratatui-based developer console against `engine`.
pub fn run(engine: Arc<Engine>) -> Result<(), Box<dyn Error>> {
    setup_terminal()?;

    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let (status_tx, status_rx) = unbounded();
    let feed = engine.clone();
    std::thread::spawn(move || {
        loop {
            let status = api::get_status(&feed);
            if status_tx.send(status).is_err() {
                break;
            }
            std::thread::sleep(TICK_RATE);
        }
    });

    let mut app = AppState::default();

    loop {
        terminal.draw(|frame| draw(frame, &app))?;

        if let Some(status) = try_recv_latest(&status_rx) {
            let stream_len = status.streams.len();
            app.status = Some(status);
            app.last_update = Some(Instant::now());
            app.selected = app.selected.min(stream_len.saturating_sub(1));
        }

        if event::poll(Duration::from_millis(10))? {
            if let CEvent::Key(key) = event::read()? {
                if handle_key(&mut app, &engine, key) {
                    break;
                }
            }
        }
    }

    restore_terminal()?;
    Ok(())
}

fn setup_terminal() -> Result<(), Box<dyn Error>> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    Ok(())
}

fn restore_terminal() -> Result<(), Box<dyn Error>> {
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    Ok(())
}

fn try_recv_latest<T>(rx: &Receiver<T>) -> Option<T> {
    let mut last = None;
    while let Ok(value) = rx.try_recv() {
        last = Some(value);
    }
    last
}

fn handle_key(app: &mut AppState, engine: &Engine, key: KeyEvent) -> bool {
    match key.code {
        KeyCode::Char('q') => return true,
        KeyCode::Up => {
            app.selected = app.selected.saturating_sub(1);
        }
        KeyCode::Down => {
            if let Some(status) = &app.status {
                if app.selected + 1 < status.streams.len() {
                    app.selected += 1;
                }
            }
        }
        KeyCode::Char(' ') => {
            if let Some(stream) = current_stream(app) {
                let running = !stream.running;
                app.message = Some(match api::set_running(engine, stream.handle, running) {
                    Ok(()) => format!("{} {}", stream.handle, if running { "started" } else { "stopped" }),
                    Err(err) => format!("{}: {err}", stream.handle),
                });
            }
        }
        KeyCode::Char('d') => {
            let enabled = api::toggle_dump(engine);
            app.message = Some(format!("PCM dump {}", if enabled { "on" } else { "off" }));
        }
        _ => {}
    }
    false
}

fn current_stream(app: &AppState) -> Option<StreamStatus> {
    app.status.as_ref()?.streams.get(app.selected).cloned()
}

fn draw(frame: &mut ratatui::Frame<'_>, app: &AppState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4),
            Constraint::Length(3),
            Constraint::Min(6),
            Constraint::Length(8),
            Constraint::Length(3),
        ])
        .split(frame.size());

    draw_header(frame, chunks[0], app);
    draw_ring(frame, chunks[1], app);
    draw_streams(frame, chunks[2], app);
    draw_events(frame, chunks[3], app);
    draw_footer(frame, chunks[4], app);
}

fn state_style(state: HwState) -> Style {
    let color = match state {
        HwState::Idle => Color::DarkGray,
        HwState::Prebuffering => Color::Yellow,
        HwState::Running => Color::Green,
        HwState::Stopping => Color::Red,
    };
    Style::default().fg(color).add_modifier(Modifier::BOLD)
}

fn draw_header(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("EAX Mixer Console").borders(Borders::ALL);

    let content = if let Some(status) = &app.status {
        let ring = &status.ring;
        let first = Line::from(vec![
            Span::styled(format!("{:?}", status.state), state_style(status.state)),
            Span::raw(format!(
                "    Mix: {:?} x {} frames    Period: {} bytes    Channel: {}    Dump: {}",
                status.mix_format,
                status.mix_frames,
                ring.period_bytes,
                status
                    .channel
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                if status.dump_enabled { "on" } else { "off" },
            )),
        ]);
        let second = Line::from(format!(
            "DMA pos: {:#x}    Completions: {}    Timeouts: {}    Fill at trigger: {}",
            ring.dma_pos,
            ring.completions,
            ring.timeouts,
            ring.last_trigger_fill
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ));
        Paragraph::new(vec![first, second])
    } else {
        Paragraph::new(Line::from(vec![Span::styled(
            "Waiting for engine status",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )]))
    };

    frame.render_widget(content.block(block), area);
}

fn draw_ring(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("Ring").borders(Borders::ALL);
    let Some(status) = &app.status else {
        frame.render_widget(Paragraph::new("").block(block), area);
        return;
    };

    let ring = &status.ring;
    let mut spans = Vec::with_capacity(DMA_PERIOD_COUNT * 2);
    for (index, filled) in ring.filled.iter().enumerate() {
        let marker = match (index == ring.write_index, index == ring.read_index) {
            (true, true) => "WR",
            (true, false) => "W ",
            (false, true) => " R",
            (false, false) => "  ",
        };
        let style = if *filled {
            Style::default().fg(Color::Black).bg(Color::Green)
        } else {
            Style::default().fg(Color::DarkGray)
        };
        spans.push(Span::styled(format!("[{index} {marker}]"), style));
        spans.push(Span::raw(" "));
    }
    spans.push(Span::raw(format!("  {}/{} filled", ring.filled_count(), DMA_PERIOD_COUNT)));

    frame.render_widget(Paragraph::new(Line::from(spans)).block(block), area);
}

fn draw_streams(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("Streams").borders(Borders::ALL);

    if let Some(status) = &app.status {
        let header = Row::new(vec![
            Cell::from(""),
            Cell::from("Stream"),
            Cell::from("Device"),
            Cell::from("Format"),
            Cell::from("Rate"),
            Cell::from("Period"),
            Cell::from("Running"),
            Cell::from("Position"),
        ])
        .style(
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        );

        let rows = status.streams.iter().enumerate().map(|(idx, stream)| {
            let indicator = if idx == app.selected { ">" } else { "" };
            let mut row = Row::new(vec![
                Cell::from(indicator.to_string()),
                Cell::from(stream.handle.to_string()),
                Cell::from(stream.device.to_string()),
                Cell::from(format!("{:?}", stream.format)),
                Cell::from(format!("{} Hz", stream.rate)),
                Cell::from(format!("{} B", stream.period_bytes)),
                Cell::from(if stream.running { "Yes" } else { "No" }),
                Cell::from(format!("{}/{}", stream.position_frames, stream.buffer_frames)),
            ]);
            if idx == app.selected {
                row = row.style(Style::default().fg(Color::Yellow));
            }
            row
        });

        let table = Table::new(
            rows,
            [
                Constraint::Length(2),
                Constraint::Length(12),
                Constraint::Length(8),
                Constraint::Length(12),
                Constraint::Length(10),
                Constraint::Length(10),
                Constraint::Length(8),
                Constraint::Length(14),
            ],
        )
        .header(header)
        .block(block)
        .column_spacing(2);

        frame.render_widget(table, area);
    } else {
        frame.render_widget(Paragraph::new("").block(block), area);
    }
}

fn draw_events(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let visible = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = app
        .status
        .as_ref()
        .map(|status| {
            let skip = status.events.len().saturating_sub(visible);
            status.events.iter().skip(skip).map(|e| Line::from(e.clone())).collect()
        })
        .unwrap_or_default();

    let paragraph = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Events"));
    frame.render_widget(paragraph, area);
}

fn draw_footer(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let info = "Up/Down: Select  •  Space: Start/stop  •  d: Toggle dump  •  q: Quit";
    let mut lines = vec![Line::from(info)];
    if let Some(message) = &app.message {
        lines.push(Line::from(Span::styled(
            message.clone(),
            Style::default().fg(Color::Green),
        )));
    }
    if let Some(updated) = app.last_update {
        let ago = updated.elapsed().as_secs_f32();
        lines.push(Line::from(Span::styled(
            format!("Last update {:.1}s ago", ago),
            Style::default().fg(Color::DarkGray),
        )));
    }

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Help"))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}
