//! The control panel shown while the session is paused.
//!
//! [`ControlPanel`] is a pure key-driven state machine; [`run_panel`] wires
//! it to a [`PanelSurface`] (the real one draws with crossterm on the
//! alternate screen) and a [`ControlHost`] that answers queries and
//! performs disconnects.

use std::io::{self, Write};

use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::style::{Attribute, Print, SetAttribute};
use crossterm::terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{execute, queue};

use crate::share::ClientInfo;

/// What the user decided in the panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Resume,
    Quit,
    Switch(String),
}

/// Which view the panel opens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelEntry {
    Menu,
    /// Straight to the quit confirmation; cancelling resumes.
    ConfirmQuit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentChoice {
    pub kind: String,
    pub name: String,
}

/// Session facts the panel renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PanelSnapshot {
    pub agent_name: String,
    pub can_resume: bool,
    pub agents: Vec<AgentChoice>,
    pub clients: Vec<ClientInfo>,
    pub running_agents: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    Menu,
    SwitchAgent,
    ConfirmQuit { resume_on_cancel: bool },
    ConfirmDisconnect(String),
    Help,
    Message(String),
}

/// Result of one key press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelEffect {
    Redraw,
    Refresh,
    Disconnect(String),
    Done(Action),
}

pub struct ControlPanel {
    snapshot: PanelSnapshot,
    view: View,
    client_cursor: usize,
    agent_cursor: usize,
}

impl ControlPanel {
    pub fn new(snapshot: PanelSnapshot, entry: PanelEntry) -> Self {
        let view = match entry {
            PanelEntry::Menu => View::Menu,
            PanelEntry::ConfirmQuit => View::ConfirmQuit {
                resume_on_cancel: true,
            },
        };
        Self {
            snapshot,
            view,
            client_cursor: 0,
            agent_cursor: 0,
        }
    }

    pub fn view(&self) -> &View {
        &self.view
    }

    pub fn snapshot(&self) -> &PanelSnapshot {
        &self.snapshot
    }

    pub fn update_snapshot(&mut self, snapshot: PanelSnapshot) {
        self.snapshot = snapshot;
        self.client_cursor = self
            .client_cursor
            .min(self.snapshot.clients.len().saturating_sub(1));
        self.agent_cursor = self
            .agent_cursor
            .min(self.snapshot.agents.len().saturating_sub(1));
    }

    pub fn show_message(&mut self, message: impl Into<String>) {
        self.view = View::Message(message.into());
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> PanelEffect {
        match self.view.clone() {
            View::Menu => self.menu_key(key),
            View::SwitchAgent => self.switch_key(key),
            View::ConfirmQuit { resume_on_cancel } => self.quit_key(key, resume_on_cancel),
            View::ConfirmDisconnect(id) => self.disconnect_key(key, id),
            View::Help | View::Message(_) => {
                self.view = View::Menu;
                PanelEffect::Redraw
            }
        }
    }

    fn menu_key(&mut self, key: KeyEvent) -> PanelEffect {
        match key.code {
            KeyCode::Char('r' | 'R') | KeyCode::Esc => {
                if self.snapshot.can_resume {
                    return PanelEffect::Done(Action::Resume);
                }
            }
            KeyCode::Char('s' | 'S') => {
                self.agent_cursor = 0;
                self.view = View::SwitchAgent;
            }
            KeyCode::Char('f' | 'F') => return PanelEffect::Refresh,
            KeyCode::Char('d' | 'D') | KeyCode::Enter => {
                if let Some(client) = self.snapshot.clients.get(self.client_cursor) {
                    self.view = View::ConfirmDisconnect(client.id.clone());
                }
            }
            KeyCode::Char('h' | 'H') => self.view = View::Help,
            KeyCode::Char('q' | 'Q') => {
                if self.snapshot.running_agents == 0 {
                    return PanelEffect::Done(Action::Quit);
                }
                self.view = View::ConfirmQuit {
                    resume_on_cancel: false,
                };
            }
            KeyCode::Up | KeyCode::Char('k') => {
                self.client_cursor = self.client_cursor.saturating_sub(1);
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.client_cursor + 1 < self.snapshot.clients.len() {
                    self.client_cursor += 1;
                }
            }
            _ => {}
        }
        PanelEffect::Redraw
    }

    fn switch_key(&mut self, key: KeyEvent) -> PanelEffect {
        match key.code {
            KeyCode::Esc => self.view = View::Menu,
            KeyCode::Up | KeyCode::Char('k') => {
                self.agent_cursor = self.agent_cursor.saturating_sub(1);
            }
            KeyCode::Down | KeyCode::Char('j') => {
                if self.agent_cursor + 1 < self.snapshot.agents.len() {
                    self.agent_cursor += 1;
                }
            }
            KeyCode::Enter => {
                if let Some(agent) = self.snapshot.agents.get(self.agent_cursor) {
                    return PanelEffect::Done(Action::Switch(agent.kind.clone()));
                }
            }
            KeyCode::Char(c @ '1'..='9') => {
                let idx = c as usize - '1' as usize;
                if let Some(agent) = self.snapshot.agents.get(idx) {
                    return PanelEffect::Done(Action::Switch(agent.kind.clone()));
                }
            }
            _ => {}
        }
        PanelEffect::Redraw
    }

    fn quit_key(&mut self, key: KeyEvent, resume_on_cancel: bool) -> PanelEffect {
        match key.code {
            KeyCode::Char('y' | 'Y') => PanelEffect::Done(Action::Quit),
            KeyCode::Char('n' | 'N') | KeyCode::Esc => {
                if resume_on_cancel {
                    return PanelEffect::Done(Action::Resume);
                }
                self.view = View::Menu;
                PanelEffect::Redraw
            }
            _ => PanelEffect::Redraw,
        }
    }

    fn disconnect_key(&mut self, key: KeyEvent, id: String) -> PanelEffect {
        match key.code {
            KeyCode::Char('y' | 'Y') => {
                self.view = View::Menu;
                PanelEffect::Disconnect(id)
            }
            KeyCode::Char('n' | 'N') | KeyCode::Esc => {
                self.view = View::Menu;
                PanelEffect::Redraw
            }
            _ => PanelEffect::Redraw,
        }
    }

    /// Text lines for the current view.
    pub fn render_lines(&self) -> Vec<String> {
        let mut lines = vec![
            " agentdeck control".to_string(),
            format!(" Current agent: {}", self.snapshot.agent_name),
            String::new(),
        ];
        match &self.view {
            View::Menu => {
                lines.push(" Web clients:".to_string());
                if self.snapshot.clients.is_empty() {
                    lines.push("   No web clients connected".to_string());
                }
                for (i, client) in self.snapshot.clients.iter().enumerate() {
                    let marker = if i == self.client_cursor { '>' } else { ' ' };
                    lines.push(format!(
                        " {marker} {}  {}",
                        or_unknown(&client.addr, "Unknown"),
                        or_unknown(&client.user_agent, "Unknown User Agent")
                    ));
                }
                lines.push(String::new());
                let resume = if self.snapshot.can_resume {
                    "r Resume"
                } else {
                    "(r Resume)"
                };
                lines.push(format!(
                    " {resume}   s Switch Agent   f Refresh   d Disconnect Client   h Help   q Quit"
                ));
            }
            View::SwitchAgent => {
                lines.push(" Switch agent (Enter or number to choose, Esc back):".to_string());
                for (i, agent) in self.snapshot.agents.iter().enumerate() {
                    let marker = if i == self.agent_cursor { '>' } else { ' ' };
                    lines.push(format!(" {marker} {}. {}", i + 1, agent.name));
                }
            }
            View::ConfirmQuit { .. } => {
                lines.push(" Quit will terminate all agents.".to_string());
                lines.push(String::new());
                lines.push(" Continue? (y/n)".to_string());
            }
            View::ConfirmDisconnect(id) => {
                lines.push(" Disconnect web client?".to_string());
                if let Some(client) = self.snapshot.clients.iter().find(|c| &c.id == id) {
                    lines.push(format!("   {}", client.addr));
                    lines.push(format!("   {}", client.user_agent));
                }
                lines.push(String::new());
                lines.push(" (y/n)".to_string());
            }
            View::Help => {
                lines.extend(
                    [
                        " Resume: back to the current agent",
                        " Switch Agent: replace the current agent with another",
                        " Disconnect Client: drop the selected web client (arrows to select)",
                        " Refresh: reload the web client list",
                        " Help: this screen",
                        " Quit: stop every agent and exit",
                        "",
                        " Shortcuts: r/s/f/d/h/q, Esc: back (when resume is available)",
                        "",
                        " Press any key to return",
                    ]
                    .map(String::from),
                );
            }
            View::Message(message) => {
                lines.push(format!(" {message}"));
                lines.push(String::new());
                lines.push(" Press any key to return".to_string());
            }
        }
        lines
    }
}

fn or_unknown<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

/// Queries and commands the panel needs from the session.
pub trait ControlHost {
    fn snapshot(&self) -> PanelSnapshot;
    fn disconnect_client(&self, id: &str) -> Result<(), String>;
}

/// Where the panel is drawn and keys come from.
pub trait PanelSurface: Send + Sync {
    fn open(&self) -> io::Result<()>;
    fn draw(&self, panel: &ControlPanel) -> io::Result<()>;
    fn next_key(&self) -> io::Result<KeyEvent>;
    fn close(&self);
}

/// Show the panel until the user picks an action.
///
/// Resuming is re-checked against a fresh snapshot, since the agent may
/// have exited while the panel was open. Surface failures are returned.
pub fn run_panel(
    surface: &dyn PanelSurface,
    host: &dyn ControlHost,
    entry: PanelEntry,
) -> io::Result<Action> {
    let mut panel = ControlPanel::new(host.snapshot(), entry);
    if let Err(e) = surface.open() {
        surface.close();
        return Err(e);
    }

    let result = loop {
        if let Err(e) = surface.draw(&panel) {
            break Err(e);
        }
        let key = match surface.next_key() {
            Ok(key) => key,
            Err(e) => break Err(e),
        };
        match panel.handle_key(key) {
            PanelEffect::Redraw => {}
            PanelEffect::Refresh => panel.update_snapshot(host.snapshot()),
            PanelEffect::Disconnect(id) => match host.disconnect_client(&id) {
                Ok(()) => panel.update_snapshot(host.snapshot()),
                Err(e) => panel.show_message(format!("Disconnect failed: {e}")),
            },
            PanelEffect::Done(Action::Resume) => {
                let fresh = host.snapshot();
                if fresh.can_resume {
                    break Ok(Action::Resume);
                }
                let message = format!("{} is no longer running", or_unknown(&fresh.agent_name, "The agent"));
                panel.update_snapshot(fresh);
                panel.show_message(message);
            }
            PanelEffect::Done(action) => break Ok(action),
        }
    };
    surface.close();
    result
}

/// The panel on the real terminal's alternate screen.
#[derive(Debug, Default)]
pub struct CrosstermSurface;

impl PanelSurface for CrosstermSurface {
    fn open(&self) -> io::Result<()> {
        terminal::enable_raw_mode()?;
        execute!(io::stdout(), EnterAlternateScreen, Hide)
    }

    fn draw(&self, panel: &ControlPanel) -> io::Result<()> {
        let mut out = io::stdout().lock();
        queue!(out, Clear(ClearType::All))?;
        for (row, line) in panel.render_lines().iter().enumerate() {
            queue!(out, MoveTo(0, row as u16))?;
            if row == 0 {
                queue!(out, SetAttribute(Attribute::Bold), Print(line), SetAttribute(Attribute::Reset))?;
            } else {
                queue!(out, Print(line))?;
            }
        }
        out.flush()
    }

    fn next_key(&self) -> io::Result<KeyEvent> {
        loop {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Release {
                    return Ok(key);
                }
            }
        }
    }

    fn close(&self) {
        let _ = execute!(io::stdout(), Show, LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
    }
}

/// Key event with no modifiers; handy for scripted input.
pub fn key(code: KeyCode) -> KeyEvent {
    KeyEvent::new(code, KeyModifiers::NONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn snapshot(can_resume: bool, running: usize, clients: usize) -> PanelSnapshot {
        PanelSnapshot {
            agent_name: "Claude Code".into(),
            can_resume,
            agents: vec![
                AgentChoice {
                    kind: "claude".into(),
                    name: "Claude Code".into(),
                },
                AgentChoice {
                    kind: "codex".into(),
                    name: "Codex".into(),
                },
            ],
            clients: (0..clients)
                .map(|i| ClientInfo {
                    id: format!("client-{}", i + 1),
                    addr: format!("10.0.0.{}", i + 1),
                    user_agent: "test".into(),
                })
                .collect(),
            running_agents: running,
        }
    }

    fn ch(c: char) -> KeyEvent {
        key(KeyCode::Char(c))
    }

    #[test]
    fn test_resume_only_when_running() {
        let mut panel = ControlPanel::new(snapshot(true, 1, 0), PanelEntry::Menu);
        assert_eq!(panel.handle_key(ch('r')), PanelEffect::Done(Action::Resume));

        let mut panel = ControlPanel::new(snapshot(false, 0, 0), PanelEntry::Menu);
        assert_eq!(panel.handle_key(ch('r')), PanelEffect::Redraw);
        assert_eq!(panel.handle_key(key(KeyCode::Esc)), PanelEffect::Redraw);
        assert_eq!(panel.view(), &View::Menu);
    }

    #[test]
    fn test_switch_by_number_and_arrows() {
        let mut panel = ControlPanel::new(snapshot(true, 1, 0), PanelEntry::Menu);
        panel.handle_key(ch('s'));
        assert_eq!(panel.view(), &View::SwitchAgent);
        assert_eq!(
            panel.handle_key(ch('2')),
            PanelEffect::Done(Action::Switch("codex".into()))
        );

        let mut panel = ControlPanel::new(snapshot(true, 1, 0), PanelEntry::Menu);
        panel.handle_key(ch('s'));
        panel.handle_key(key(KeyCode::Down));
        panel.handle_key(key(KeyCode::Down));
        assert_eq!(
            panel.handle_key(key(KeyCode::Enter)),
            PanelEffect::Done(Action::Switch("codex".into()))
        );
    }

    #[test]
    fn test_switch_out_of_range_and_back() {
        let mut panel = ControlPanel::new(snapshot(true, 1, 0), PanelEntry::Menu);
        panel.handle_key(ch('s'));
        assert_eq!(panel.handle_key(ch('7')), PanelEffect::Redraw);
        panel.handle_key(key(KeyCode::Esc));
        assert_eq!(panel.view(), &View::Menu);
    }

    #[test]
    fn test_quit_immediate_without_running_agents() {
        let mut panel = ControlPanel::new(snapshot(false, 0, 0), PanelEntry::Menu);
        assert_eq!(panel.handle_key(ch('q')), PanelEffect::Done(Action::Quit));
    }

    #[test]
    fn test_quit_confirmation_from_menu() {
        let mut panel = ControlPanel::new(snapshot(true, 2, 0), PanelEntry::Menu);
        assert_eq!(panel.handle_key(ch('q')), PanelEffect::Redraw);
        assert_eq!(
            panel.view(),
            &View::ConfirmQuit {
                resume_on_cancel: false
            }
        );
        assert!(panel
            .render_lines()
            .iter()
            .any(|l| l.contains("Quit will terminate all agents")));
        assert_eq!(panel.handle_key(ch('n')), PanelEffect::Redraw);
        assert_eq!(panel.view(), &View::Menu);
        panel.handle_key(ch('q'));
        assert_eq!(panel.handle_key(ch('y')), PanelEffect::Done(Action::Quit));
    }

    #[test]
    fn test_quit_entry_cancel_resumes() {
        let mut panel = ControlPanel::new(snapshot(true, 1, 0), PanelEntry::ConfirmQuit);
        assert_eq!(
            panel.handle_key(key(KeyCode::Esc)),
            PanelEffect::Done(Action::Resume)
        );
    }

    #[test]
    fn test_disconnect_selected_client() {
        let mut panel = ControlPanel::new(snapshot(true, 1, 3), PanelEntry::Menu);
        panel.handle_key(key(KeyCode::Down));
        panel.handle_key(ch('d'));
        assert_eq!(panel.view(), &View::ConfirmDisconnect("client-2".into()));
        assert_eq!(
            panel.handle_key(ch('y')),
            PanelEffect::Disconnect("client-2".into())
        );
        assert_eq!(panel.view(), &View::Menu);
    }

    #[test]
    fn test_disconnect_without_clients_is_noop() {
        let mut panel = ControlPanel::new(snapshot(true, 1, 0), PanelEntry::Menu);
        panel.handle_key(ch('d'));
        assert_eq!(panel.view(), &View::Menu);
        assert!(panel
            .render_lines()
            .iter()
            .any(|l| l.contains("No web clients connected")));
    }

    #[test]
    fn test_refresh_clamps_cursor() {
        let mut panel = ControlPanel::new(snapshot(true, 1, 3), PanelEntry::Menu);
        panel.handle_key(key(KeyCode::Down));
        panel.handle_key(key(KeyCode::Down));
        assert_eq!(panel.handle_key(ch('f')), PanelEffect::Refresh);
        panel.update_snapshot(snapshot(true, 1, 1));
        panel.handle_key(ch('d'));
        assert_eq!(panel.view(), &View::ConfirmDisconnect("client-1".into()));
    }

    #[test]
    fn test_help_and_back() {
        let mut panel = ControlPanel::new(snapshot(true, 1, 0), PanelEntry::Menu);
        panel.handle_key(ch('h'));
        assert_eq!(panel.view(), &View::Help);
        panel.handle_key(ch('x'));
        assert_eq!(panel.view(), &View::Menu);
    }

    struct Scripted {
        keys: Mutex<VecDeque<KeyEvent>>,
        draws: Mutex<usize>,
    }

    impl Scripted {
        fn new(keys: Vec<KeyEvent>) -> Self {
            Self {
                keys: Mutex::new(keys.into()),
                draws: Mutex::new(0),
            }
        }
    }

    impl PanelSurface for Scripted {
        fn open(&self) -> io::Result<()> {
            Ok(())
        }
        fn draw(&self, _panel: &ControlPanel) -> io::Result<()> {
            *self.draws.lock().unwrap() += 1;
            Ok(())
        }
        fn next_key(&self) -> io::Result<KeyEvent> {
            self.keys
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "script done"))
        }
        fn close(&self) {}
    }

    struct Host {
        clients: RefCell<Vec<ClientInfo>>,
        fail: bool,
        /// Snapshots that still report the agent as running.
        running_for: Cell<usize>,
    }

    impl ControlHost for Host {
        fn snapshot(&self) -> PanelSnapshot {
            let running = self.running_for.get();
            self.running_for.set(running.saturating_sub(1));
            let mut snap = snapshot(running > 0, 1, 0);
            snap.clients = self.clients.borrow().clone();
            snap
        }
        fn disconnect_client(&self, id: &str) -> Result<(), String> {
            if self.fail {
                return Err("boom".into());
            }
            self.clients.borrow_mut().retain(|c| c.id != id);
            Ok(())
        }
    }

    #[test]
    fn test_run_panel_disconnect_then_resume() {
        let host = Host {
            clients: RefCell::new(snapshot(true, 1, 2).clients),
            fail: false,
            running_for: Cell::new(usize::MAX),
        };
        let surface = Scripted::new(vec![ch('d'), ch('y'), ch('r')]);
        let action = run_panel(&surface, &host, PanelEntry::Menu).unwrap();
        assert_eq!(action, Action::Resume);
        assert_eq!(host.clients.borrow().len(), 1);
        assert_eq!(host.clients.borrow()[0].id, "client-2");
        assert_eq!(*surface.draws.lock().unwrap(), 3);
    }

    #[test]
    fn test_run_panel_disconnect_failure_shows_message() {
        let host = Host {
            clients: RefCell::new(snapshot(true, 1, 1).clients),
            fail: true,
            running_for: Cell::new(usize::MAX),
        };
        let surface = Scripted::new(vec![ch('d'), ch('y')]);
        // Script runs out after the error view.
        let err = run_panel(&surface, &host, PanelEntry::Menu).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(host.clients.borrow().len(), 1);
    }

    #[test]
    fn test_resume_rechecked_after_agent_exit() {
        // Running when the panel opened, gone by the time r is pressed.
        let host = Host {
            clients: RefCell::new(Vec::new()),
            fail: false,
            running_for: Cell::new(1),
        };
        let surface = Scripted::new(vec![ch('r'), ch('x'), ch('r'), ch('q'), ch('y')]);
        let action = run_panel(&surface, &host, PanelEntry::Menu).unwrap();
        assert_eq!(action, Action::Quit);
        assert!(surface.keys.lock().unwrap().is_empty());
    }
}
