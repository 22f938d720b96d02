//! Terminal call screen for the Realty Call CLI

use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::{Backend, CrosstermBackend},
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame, Terminal,
};
use realty_call_core::prelude::*;
use std::{
    io::{self, Stdout},
    time::Duration,
};

/// What the call screen shows, derived from a [`CallSnapshot`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallView {
    pub status: CallStatus,
    pub peer: Option<String>,
    pub kind: Option<CallKind>,
    pub duration_seconds: u64,
    pub muted: bool,
    pub camera_off: bool,
    pub remote_media: bool,
    pub show_help: bool,
}

impl CallView {
    pub fn from_snapshot(snapshot: &CallSnapshot, show_help: bool) -> Self {
        Self {
            status: snapshot.status,
            peer: snapshot.peer.as_ref().map(ToString::to_string),
            kind: snapshot.call_kind,
            duration_seconds: snapshot.duration_seconds,
            muted: snapshot.muted,
            camera_off: snapshot.camera_off,
            remote_media: snapshot.has_remote_media,
            show_help,
        }
    }

    pub fn status_label(&self) -> &'static str {
        match self.status {
            CallStatus::Idle => "Call ended",
            CallStatus::Ringing => "Ringing...",
            CallStatus::Incoming => "Incoming call",
            CallStatus::Connecting => "Connecting...",
            CallStatus::Connected => "Connected",
        }
    }

    fn status_color(&self) -> Color {
        match self.status {
            CallStatus::Connected => Color::Green,
            CallStatus::Idle => Color::Red,
            _ => Color::Yellow,
        }
    }
}

/// `mm:ss`, or `h:mm:ss` past the hour
pub fn format_duration(seconds: u64) -> String {
    let (h, m, s) = (seconds / 3600, (seconds % 3600) / 60, seconds % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

/// Key press outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    ToggleMute,
    ToggleCamera,
    ToggleHelp,
    HangUp,
    None,
}

pub fn key_action(code: KeyCode) -> KeyAction {
    match code {
        KeyCode::Char('q') | KeyCode::Esc => KeyAction::HangUp,
        KeyCode::Char('m') => KeyAction::ToggleMute,
        KeyCode::Char('c') | KeyCode::Char('v') => KeyAction::ToggleCamera,
        KeyCode::Char('h') => KeyAction::ToggleHelp,
        _ => KeyAction::None,
    }
}

/// Draw the whole call screen
pub fn draw_call_screen(f: &mut Frame, view: &CallView) {
    let size = f.size();

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(6),    // Call area
            Constraint::Length(3), // Duration
            Constraint::Length(3), // Controls
        ])
        .split(size);

    draw_call_area(f, chunks[0], view);
    draw_duration_area(f, chunks[1], view);
    draw_controls_area(f, chunks[2], view);
}

fn draw_call_area(f: &mut Frame, area: Rect, view: &CallView) {
    let block = Block::default()
        .title("📞 Call")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let mut content = vec![
        Line::from(Span::styled(
            view.status_label(),
            Style::default()
                .fg(view.status_color())
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(format!(
            "Peer: {}",
            view.peer.as_deref().unwrap_or("(none)")
        )),
        Line::from(format!(
            "Kind: {}",
            view.kind.map_or_else(|| "-".to_string(), |k| k.to_string())
        )),
        Line::from(if view.remote_media {
            Span::styled("Remote media flowing", Style::default().fg(Color::Green))
        } else {
            Span::styled("Waiting for remote media", Style::default().fg(Color::Yellow))
        }),
    ];

    if view.show_help {
        content.push(Line::from(""));
        content.push(Line::from("m: mute microphone   c/v: camera on/off"));
        content.push(Line::from("q/Esc: hang up       h: hide help"));
    }

    let paragraph = Paragraph::new(content)
        .block(block)
        .alignment(Alignment::Center);
    f.render_widget(paragraph, area);
}

fn draw_duration_area(f: &mut Frame, area: Rect, view: &CallView) {
    let block = Block::default().title("⏱ Duration").borders(Borders::ALL);
    let paragraph = Paragraph::new(Line::from(format_duration(view.duration_seconds)))
        .block(block)
        .alignment(Alignment::Center);
    f.render_widget(paragraph, area);
}

fn draw_controls_area(f: &mut Frame, area: Rect, view: &CallView) {
    let block = Block::default().title("🎮 Controls").borders(Borders::ALL);
    let video = view.kind.is_some_and(CallKind::has_video);

    let mut spans = vec![
        Span::styled(
            "(q/Esc)",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ),
        Span::raw(" Hang up | "),
        Span::styled(
            "(m)",
            Style::default().fg(if view.muted { Color::Red } else { Color::Green }),
        ),
        Span::raw(if view.muted { " Unmute | " } else { " Mute | " }),
    ];
    if video {
        spans.push(Span::styled(
            "(c)",
            Style::default().fg(if view.camera_off {
                Color::Yellow
            } else {
                Color::Green
            }),
        ));
        spans.push(Span::raw(" Camera | "));
    }
    spans.push(Span::styled("(h)", Style::default().fg(Color::Blue)));
    spans.push(Span::raw(" Help"));

    let paragraph = Paragraph::new(Line::from(spans)).block(block);
    f.render_widget(paragraph, area);
}

/// Terminal UI state
pub struct TerminalUI {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    show_help: bool,
}

impl TerminalUI {
    /// Take over the terminal
    pub fn new() -> Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let terminal = Terminal::new(backend)?;

        Ok(Self {
            terminal,
            show_help: false,
        })
    }

    /// Run until the user hangs up or the call ends
    pub async fn run<T: SignalingTransport + 'static>(
        &mut self,
        service: &CallService<T>,
    ) -> Result<()> {
        loop {
            if event::poll(Duration::from_millis(100))? {
                if let Event::Key(key) = event::read()? {
                    match key_action(key.code) {
                        KeyAction::HangUp => {
                            if let Err(e) = service.end_call().await {
                                tracing::warn!(error = %e, "Hangup not delivered");
                            }
                            break;
                        }
                        KeyAction::ToggleMute => {
                            service.toggle_mute();
                        }
                        KeyAction::ToggleCamera => {
                            service.toggle_camera();
                        }
                        KeyAction::ToggleHelp => self.show_help = !self.show_help,
                        KeyAction::None => {}
                    }
                }
            }

            let view = CallView::from_snapshot(&service.snapshot(), self.show_help);
            render(&mut self.terminal, &view)?;
            if view.status == CallStatus::Idle {
                tokio::time::sleep(Duration::from_secs(1)).await;
                break;
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        Ok(())
    }
}

/// Draw one frame on any backend
pub fn render<B: Backend>(terminal: &mut Terminal<B>, view: &CallView) -> Result<()> {
    terminal.draw(|f| draw_call_screen(f, view))?;
    Ok(())
}

impl Drop for TerminalUI {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(self.terminal.backend_mut(), LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
    }
}
