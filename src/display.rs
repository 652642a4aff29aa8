//! Terminal display boundary: ANSI frame writes and session raw mode.

use std::io::{self, Write};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};

use crate::error::{PlayerError, Result};
use crate::grid::RenderedGrid;

/// Sink for rendered grids. The playback loop only knows this seam, so
/// tests can capture frames without a terminal.
pub trait CellWriter {
    fn write(&mut self, grid: &RenderedGrid, status_line: Option<&str>) -> Result<()>;
}

/// Keys the playback loop reacts to, already decoded from raw events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerKey {
    Quit,
    TogglePause,
    ToggleSync,
    ToggleAdaptive,
    FpsUp,
    FpsDown,
}

/// A raw-mode terminal session: alternate screen, hidden cursor, restored
/// on drop (including error paths).
pub struct TerminalDisplay {
    cols: u16,
    rows: u16,
    active: bool,
    scratch: String,
}

impl TerminalDisplay {
    pub fn size() -> Result<(u16, u16)> {
        crossterm::terminal::size().map_err(PlayerError::Io)
    }

    pub fn enter() -> Result<Self> {
        let (cols, rows) = Self::size()?;
        crossterm::terminal::enable_raw_mode()?;
        let mut stdout = io::stdout();
        if let Err(error) = crossterm::execute!(
            stdout,
            crossterm::terminal::EnterAlternateScreen,
            crossterm::cursor::Hide,
            crossterm::terminal::Clear(crossterm::terminal::ClearType::All),
        ) {
            let _ = crossterm::terminal::disable_raw_mode();
            return Err(PlayerError::Io(error));
        }
        Ok(Self {
            cols,
            rows,
            active: true,
            scratch: String::new(),
        })
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    /// Rows available for the image; the bottom row holds the status line.
    pub fn grid_rows(&self) -> u16 {
        self.rows.saturating_sub(1).max(1)
    }

    /// Poll the keyboard without blocking beyond `timeout`. Event polling
    /// is process-global, so this does not borrow the display.
    pub fn poll_key(timeout: Duration) -> Result<Option<PlayerKey>> {
        if !event::poll(timeout)? {
            return Ok(None);
        }
        let Event::Key(key) = event::read()? else {
            return Ok(None);
        };
        if key.kind == KeyEventKind::Release {
            return Ok(None);
        }
        let mapped = match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                Some(PlayerKey::Quit)
            }
            KeyCode::Char('q') | KeyCode::Esc | KeyCode::Enter => Some(PlayerKey::Quit),
            KeyCode::Char('p') | KeyCode::Char(' ') => Some(PlayerKey::TogglePause),
            KeyCode::Char('s') => Some(PlayerKey::ToggleSync),
            KeyCode::Char('a') => Some(PlayerKey::ToggleAdaptive),
            KeyCode::Char('+') | KeyCode::Char('=') => Some(PlayerKey::FpsUp),
            KeyCode::Char('-') => Some(PlayerKey::FpsDown),
            _ => None,
        };
        Ok(mapped)
    }

    fn restore(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let mut stdout = io::stdout();
        let _ = crossterm::execute!(
            stdout,
            crossterm::cursor::Show,
            crossterm::terminal::LeaveAlternateScreen,
        );
        let _ = crossterm::terminal::disable_raw_mode();
    }
}

impl CellWriter for TerminalDisplay {
    fn write(&mut self, grid: &RenderedGrid, status_line: Option<&str>) -> Result<()> {
        self.scratch.clear();
        grid.write_ansi(&mut self.scratch);
        if let Some(status) = status_line {
            let width = self.cols as usize;
            let line: String = status.chars().take(width).collect();
            self.scratch
                .push_str(&format!("\x1b[{};1H\x1b[0m{:<width$}", self.rows, line));
        }
        let mut stdout = io::stdout().lock();
        stdout.write_all(self.scratch.as_bytes())?;
        stdout.flush()?;
        Ok(())
    }
}

impl Drop for TerminalDisplay {
    fn drop(&mut self) {
        self.restore();
    }
}
