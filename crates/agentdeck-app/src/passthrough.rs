//! The interactive session: local terminal ⇄ current agent.
//!
//! [`Passthrough`] owns the terminal mode, routes keystrokes to the current
//! agent, opens the control panel on the reserved bytes or when the current
//! agent exits, performs agent switches and runs the shutdown sequence.
//!
//! Which agent is current, and the paused/switching flags, live behind one
//! mutex. It is never held across pty writes, panel I/O or channel waits.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

use agentdeck_pool::{AgentInstance, AgentPool, CreateOptions, OutputSink, PoolError};
use agentdeck_pty::ChildExit;
use anyhow::Context;
use log::{debug, error, info, warn};
use tokio::runtime::Handle;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::control::{self, Action, AgentChoice, ControlHost, PanelEntry, PanelSnapshot, PanelSurface};
use crate::share::TerminalShare;
use crate::terminal::HostTerminal;

/// Ctrl+\ opens the control panel.
pub const KEY_CONTROL: u8 = 0x1c;
/// Ctrl+Q opens the quit confirmation.
pub const KEY_QUIT: u8 = 0x11;

const INPUT_POLL: Duration = Duration::from_millis(100);
const INPUT_BUF_SIZE: usize = 1024;
const SWITCH_STOP_WAIT: Duration = Duration::from_secs(3);
const SHUTDOWN_GRACE: Duration = Duration::from_millis(50);

/// The local side of the session.
pub struct HostIo {
    pub terminal: Arc<dyn HostTerminal>,
    pub surface: Arc<dyn PanelSurface>,
    /// Where the current agent's output is written.
    pub sink: Arc<dyn OutputSink>,
}

#[derive(Default)]
struct SessionState {
    current: Option<Arc<AgentInstance>>,
    main: Option<Arc<AgentInstance>>,
    input_paused: bool,
    switching: bool,
    /// The current agent exited while the control panel was open.
    exit_pending: bool,
    exit_watch: Option<CancellationToken>,
}

pub struct Passthrough {
    pool: Arc<AgentPool>,
    share: Option<Arc<dyn TerminalShare>>,
    io: HostIo,
    runtime: Handle,
    state: Mutex<SessionState>,
    quit: CancellationToken,
    stopping: AtomicBool,
}

impl Passthrough {
    /// `main` is the entry agent and becomes current. Background tasks are
    /// spawned on `runtime`; [`run`](Self::run) must not be called from
    /// inside it.
    pub fn new(
        pool: Arc<AgentPool>,
        main: Arc<AgentInstance>,
        share: Option<Arc<dyn TerminalShare>>,
        io: HostIo,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            share,
            io,
            runtime,
            state: Mutex::new(SessionState {
                current: Some(Arc::clone(&main)),
                main: Some(main),
                ..SessionState::default()
            }),
            quit: CancellationToken::new(),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn current(&self) -> Option<Arc<AgentInstance>> {
        self.lock_state().current.clone()
    }

    pub fn main_agent(&self) -> Option<Arc<AgentInstance>> {
        self.lock_state().main.clone()
    }

    pub fn is_input_paused(&self) -> bool {
        self.lock_state().input_paused
    }

    /// Cancelled once the session starts shutting down.
    pub fn quit_token(&self) -> CancellationToken {
        self.quit.clone()
    }

    /// Take over the terminal and block until the session ends, then shut
    /// everything down.
    pub fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        let current = self.current().context("no current agent")?;
        self.print_banner(current.name());
        self.io
            .terminal
            .make_raw()
            .context("failed to put the terminal into raw mode")?;

        current.set_output_sink(Some(Arc::clone(&self.io.sink)));
        self.resize_current();
        self.watch_exit(current.id().to_string());
        self.spawn_signal_tasks();

        let reader = Arc::clone(self);
        if let Err(e) = thread::Builder::new()
            .name("stdin-reader".into())
            .spawn(move || reader.read_input_loop())
        {
            self.shutdown();
            return Err(e).context("failed to spawn the input reader");
        }

        self.runtime.block_on(self.quit.cancelled());
        self.shutdown();
        Ok(())
    }

    /// Begin shutting down. Only the first call has an effect.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(watch) = self.lock_state().exit_watch.take() {
            watch.cancel();
        }
        self.quit.cancel();
    }

    fn read_input_loop(self: &Arc<Self>) {
        let mut buf = [0u8; INPUT_BUF_SIZE];
        while !self.quit.is_cancelled() {
            if self.is_input_paused() {
                thread::sleep(INPUT_POLL);
                continue;
            }
            match self.io.terminal.read_input(&mut buf, INPUT_POLL) {
                Ok(0) => {}
                Ok(n) => self.route_input(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    if e.kind() == io::ErrorKind::UnexpectedEof {
                        info!("stdin closed");
                    } else {
                        error!("stdin read failed: {e}");
                    }
                    self.stop();
                    return;
                }
            }
        }
    }

    /// Forward keystrokes, diverting at the first reserved byte. Bytes
    /// before it reach the agent; the rest of the chunk is discarded.
    fn route_input(self: &Arc<Self>, data: &[u8]) {
        let Some(pos) = data.iter().position(|&b| b == KEY_CONTROL || b == KEY_QUIT) else {
            self.forward(data);
            return;
        };
        self.forward(&data[..pos]);
        let entry = if data[pos] == KEY_QUIT {
            PanelEntry::ConfirmQuit
        } else {
            PanelEntry::Menu
        };
        self.enter_control_mode(entry);
    }

    fn forward(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let Some(current) = self.current() else {
            return;
        };
        if let Err(e) = current.write(data) {
            debug!("write to {} failed: {e}", current.id());
        }
    }

    fn enter_control_mode(self: &Arc<Self>, mut entry: PanelEntry) {
        {
            let mut state = self.lock_state();
            if state.input_paused || self.quit.is_cancelled() {
                return;
            }
            state.input_paused = true;
        }
        self.io.terminal.restore();

        loop {
            let host: &dyn ControlHost = &**self;
            let action = match control::run_panel(&*self.io.surface, host, entry) {
                Ok(action) => action,
                Err(e) => {
                    warn!("control panel failed: {e}");
                    if !self.resume() {
                        error!("current agent has exited and the control panel is unusable");
                        self.stop();
                    }
                    return;
                }
            };
            debug!("control panel closed with {action:?}");

            match action {
                Action::Resume => {}
                Action::Quit => {
                    self.stop();
                    return;
                }
                Action::Switch(kind) => {
                    if let Err(e) = self.switch_agent(&kind) {
                        error!("switch to {kind} failed: {e}");
                        self.stop();
                        return;
                    }
                }
            }
            if self.resume() {
                return;
            }
            info!("current agent is not running, reopening control panel");
            entry = PanelEntry::Menu;
        }
    }

    /// Leave control mode for Active. Returns false, with input still
    /// paused, when the current agent has exited in the meantime.
    fn resume(&self) -> bool {
        if !self.current().is_some_and(|c| c.is_running()) {
            self.lock_state().exit_pending = false;
            return false;
        }
        if let Err(e) = self.io.terminal.make_raw() {
            error!("failed to re-enter raw mode: {e}");
            self.stop();
            return true;
        }
        {
            let mut state = self.lock_state();
            if !std::mem::take(&mut state.exit_pending) {
                state.input_paused = false;
                drop(state);
                self.resize_current();
                return true;
            }
        }
        self.io.terminal.restore();
        false
    }

    fn switch_agent(self: &Arc<Self>, kind: &str) -> Result<(), PoolError> {
        let old = {
            let mut state = self.lock_state();
            state.switching = true;
            if let Some(watch) = state.exit_watch.take() {
                watch.cancel();
            }
            state.current.clone()
        };
        if let Some(old) = &old {
            info!("switching from {} to {kind}", old.id());
            old.set_output_sink(None);
            stop_bounded(old);
        }

        let instance = match self
            .pool
            .get_or_create(kind, CreateOptions::with_sink(Arc::clone(&self.io.sink)))
        {
            Ok(instance) => instance,
            Err(e) => {
                self.lock_state().switching = false;
                return Err(e);
            }
        };

        {
            let mut state = self.lock_state();
            let old_id = old.as_ref().map(|o| o.id());
            if state.main.as_ref().map(|m| m.id()) == old_id {
                state.main = Some(Arc::clone(&instance));
            }
            state.current = Some(Arc::clone(&instance));
            state.exit_pending = false;
        }
        self.watch_exit(instance.id().to_string());
        self.print_banner(instance.name());
        self.resize_current();

        if let Some(share) = &self.share {
            share.set_proxy(Some(Arc::clone(instance.proxy())));
            share.set_agent_name(instance.name());
            share.broadcast_reset();
        }

        self.lock_state().switching = false;
        Ok(())
    }

    /// Watch the agent with `id` for exit, replacing any previous watcher.
    fn watch_exit(self: &Arc<Self>, id: String) {
        let token = CancellationToken::new();
        if let Some(previous) = self.lock_state().exit_watch.replace(token.clone()) {
            previous.cancel();
        }

        let pool = Arc::clone(&self.pool);
        let session: Weak<Self> = Arc::downgrade(self);
        self.runtime.spawn(async move {
            let Ok(instance) = pool.get(&id) else {
                return;
            };
            let exit = tokio::select! {
                _ = token.cancelled() => return,
                exit = instance.wait_exit() => exit,
            };
            drop(instance);
            let Some(session) = session.upgrade() else {
                return;
            };
            let _ = tokio::task::spawn_blocking(move || session.handle_agent_exit(&id, exit)).await;
        });
    }

    fn handle_agent_exit(self: &Arc<Self>, id: &str, exit: Option<ChildExit>) {
        {
            let mut state = self.lock_state();
            if state.switching || state.current.as_ref().map(|c| c.id()) != Some(id) {
                debug!("ignoring exit of {id}");
                return;
            }
            // The open panel picks this up when it tries to resume.
            if state.input_paused {
                info!("{id} exited while the control panel is open");
                state.exit_pending = true;
                return;
            }
        }
        match exit {
            Some(exit) => info!("{id} exited ({exit}), opening control panel"),
            None => info!("{id} exit channel closed, opening control panel"),
        }
        self.enter_control_mode(PanelEntry::Menu);
    }

    fn spawn_signal_tasks(self: &Arc<Self>) {
        let session = Arc::downgrade(self);
        let quit = self.quit.clone();
        self.runtime.spawn(async move {
            let mut winch = match signal(SignalKind::window_change()) {
                Ok(s) => s,
                Err(e) => {
                    warn!("cannot watch window size: {e}");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = quit.cancelled() => return,
                    got = winch.recv() => {
                        let (Some(()), Some(this)) = (got, session.upgrade()) else {
                            return;
                        };
                        this.resize_current();
                    }
                }
            }
        });

        let session = Arc::downgrade(self);
        let quit = self.quit.clone();
        self.runtime.spawn(async move {
            let (mut int, mut term) = match (
                signal(SignalKind::interrupt()),
                signal(SignalKind::terminate()),
            ) {
                (Ok(int), Ok(term)) => (int, term),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("cannot watch interrupt signals: {e}");
                    return;
                }
            };
            tokio::select! {
                _ = quit.cancelled() => return,
                _ = int.recv() => info!("interrupted"),
                _ = term.recv() => info!("terminated"),
            }
            if let Some(session) = session.upgrade() {
                session.stop();
            }
        });
    }

    fn resize_current(&self) {
        let (Some(size), Some(current)) = (self.io.terminal.size(), self.current()) else {
            return;
        };
        if let Err(e) = current.resize(size) {
            debug!("resize of {} failed: {e}", current.id());
        }
    }

    fn print_banner(&self, agent_name: &str) {
        let banner = format!(
            "\x1b[90m[agentdeck] Ctrl+\\ control mode │ Ctrl+Q quit │ Current: {agent_name}\x1b[0m\r\n"
        );
        self.io.sink.write_output(banner.as_bytes());
    }

    fn shutdown(&self) {
        info!("shutting down");
        if let Some(current) = self.current() {
            current.set_output_sink(None);
        }
        thread::sleep(SHUTDOWN_GRACE);
        self.io.terminal.restore();
        self.io.sink.write_output(b"\r\nShutting down...\r\n");

        if let Some(share) = &self.share {
            if let Err(e) = share.stop() {
                warn!("failed to stop web terminal: {e}");
            }
        }
        self.pool.shutdown();
        self.io.sink.write_output(b"Goodbye!\r\n");
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ControlHost for Passthrough {
    fn snapshot(&self) -> PanelSnapshot {
        let current = self.current();
        PanelSnapshot {
            agent_name: current
                .as_ref()
                .map(|c| c.name().to_string())
                .unwrap_or_default(),
            can_resume: current.as_ref().is_some_and(|c| c.is_running()),
            agents: self
                .pool
                .available_agents()
                .into_iter()
                .map(|a| AgentChoice {
                    kind: a.kind,
                    name: a.name,
                })
                .collect(),
            clients: self
                .share
                .as_ref()
                .map(|s| s.list_clients())
                .unwrap_or_default(),
            running_agents: self.pool.running_count(),
        }
    }

    fn disconnect_client(&self, id: &str) -> Result<(), String> {
        let share = self.share.as_ref().ok_or("web terminal is not running")?;
        share.disconnect_client(id).map_err(|e| e.to_string())
    }
}

/// Stop `agent`, waiting at most [`SWITCH_STOP_WAIT`] before moving on.
fn stop_bounded(agent: &Arc<AgentInstance>) {
    agent.mark_stopped();
    let stopping = Arc::clone(agent);
    let spawned = thread::Builder::new()
        .name(format!("stop-{}", agent.id()))
        .spawn(move || stopping.stop());
    let handle = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            warn!("failed to spawn stop thread for {}: {e}", agent.id());
            agent.stop();
            return;
        }
    };

    let deadline = Instant::now() + SWITCH_STOP_WAIT;
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(25));
    }
    if !handle.is_finished() {
        warn!("{} still stopping after {SWITCH_STOP_WAIT:?}, continuing", agent.id());
    }
}
