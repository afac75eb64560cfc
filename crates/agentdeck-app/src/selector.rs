//! Startup menu for picking the entry agent.

use std::io::{self, Write};

use agentdeck_pool::AgentInfo;
use anyhow::Context;
use crossterm::cursor::MoveToColumn;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};
use crossterm::terminal::{self, Clear, ClearType};
use crossterm::{cursor, queue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Pending,
    Chosen(String),
    Aborted,
}

/// Cursor over detected agents. Missing agents are listed but never selectable.
pub struct Selector<'a> {
    agents: &'a [AgentInfo],
    cursor: usize,
}

impl<'a> Selector<'a> {
    pub fn new(agents: &'a [AgentInfo]) -> Self {
        let cursor = agents.iter().position(|a| a.found).unwrap_or(0);
        Self { agents, cursor }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> Selection {
        match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                Selection::Aborted
            }
            KeyCode::Char('q') | KeyCode::Esc => Selection::Aborted,
            KeyCode::Up | KeyCode::Char('k') => {
                self.step(-1);
                Selection::Pending
            }
            KeyCode::Down | KeyCode::Char('j') => {
                self.step(1);
                Selection::Pending
            }
            KeyCode::Enter => match self.agents.get(self.cursor) {
                Some(agent) if agent.found => Selection::Chosen(agent.kind.clone()),
                _ => Selection::Pending,
            },
            _ => Selection::Pending,
        }
    }

    fn step(&mut self, dir: isize) {
        let mut idx = self.cursor as isize;
        loop {
            idx += dir;
            if idx < 0 || idx as usize >= self.agents.len() {
                return;
            }
            if self.agents[idx as usize].found {
                self.cursor = idx as usize;
                return;
            }
        }
    }

    fn draw(&self, out: &mut impl Write) -> io::Result<()> {
        queue!(out, MoveToColumn(0), Clear(ClearType::FromCursorDown))?;
        queue!(out, Print("Select an agent (↑/↓ or j/k, Enter to start, q to quit)\r\n\r\n"))?;
        for (i, agent) in self.agents.iter().enumerate() {
            let marker = if i == self.cursor { '>' } else { ' ' };
            if agent.found {
                queue!(
                    out,
                    Print(format!(" {marker} {:<14} {}\r\n", agent.name, agent.version))
                )?;
            } else {
                queue!(
                    out,
                    SetForegroundColor(Color::DarkGrey),
                    Print(format!("   {:<14} not installed\r\n", agent.name)),
                    ResetColor
                )?;
            }
        }
        out.flush()
    }
}

/// Run the selector on the terminal. `None` when the user aborts.
pub fn select_agent(agents: &[AgentInfo]) -> anyhow::Result<Option<String>> {
    let mut selector = Selector::new(agents);
    let height = agents.len() as u16 + 2;

    terminal::enable_raw_mode().context("failed to enter raw mode for agent selection")?;
    let result = (|| -> anyhow::Result<Option<String>> {
        let mut out = io::stdout();
        loop {
            selector.draw(&mut out)?;
            let key = match event::read()? {
                Event::Key(key) if key.kind != KeyEventKind::Release => key,
                _ => continue,
            };
            match selector.handle_key(key) {
                Selection::Pending => queue!(out, cursor::MoveUp(height))?,
                Selection::Chosen(kind) => return Ok(Some(kind)),
                Selection::Aborted => return Ok(None),
            }
        }
    })();
    let _ = terminal::disable_raw_mode();
    println!();
    result
}
