use std::collections::HashMap;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use log::{debug, info, warn};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::runtime::Handle;

use crate::error::{PtyError, Result};

/// Terminal type advertised to every child.
pub const TERM_VALUE: &str = "xterm-256color";

/// How long `stop` waits for the child to honour SIGTERM.
pub const STOP_GRACE: Duration = Duration::from_secs(3);

/// How long `stop` waits for the child to disappear after SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

const READ_BUF_SIZE: usize = 4096;

/// Lifecycle of a [`ProcessProxy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

impl ProxyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyStatus::Stopped => "stopped",
            ProxyStatus::Starting => "starting",
            ProxyStatus::Running => "running",
            ProxyStatus::Error => "error",
        }
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PTY dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl From<WindowSize> for PtySize {
    fn from(size: WindowSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// How a child process ended, as observed by the waiter thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildExit {
    Exited(u32),
    WaitFailed(String),
}

impl ChildExit {
    pub fn success(&self) -> bool {
        matches!(self, ChildExit::Exited(0))
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildExit::Exited(code) => write!(f, "exit status {code}"),
            ChildExit::WaitFailed(msg) => write!(f, "wait failed: {msg}"),
        }
    }
}

/// Synchronous handler invoked on the reader thread for every chunk.
pub type OutputHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Fan-out consumer; each chunk is delivered on its own task with its own copy.
pub type OutputConsumer = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Fired exactly once when the child exits.
pub type ExitHandler = Box<dyn FnOnce(ChildExit) + Send>;

/// One-shot flag the waiter thread raises when the child is gone.
#[derive(Default)]
struct ExitLatch {
    exited: Mutex<bool>,
    cond: Condvar,
}

impl ExitLatch {
    fn reset(&self) {
        *lock(&self.exited) = false;
    }

    fn set(&self) {
        *lock(&self.exited) = true;
        self.cond.notify_all();
    }

    fn is_set(&self) -> bool {
        *lock(&self.exited)
    }

    /// Returns `true` if the latch was raised before `timeout` elapsed.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = lock(&self.exited);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |exited| !*exited)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

/// State shared with the reader and waiter threads.
#[derive(Default)]
struct Shared {
    status: RwLock<Option<ProxyStatus>>,
    on_output: RwLock<Option<OutputHandler>>,
    consumers: RwLock<HashMap<String, OutputConsumer>>,
    on_exit: Mutex<Option<ExitHandler>>,
    exit: ExitLatch,
    /// Survives the waiter resetting the status to `Stopped`.
    read_failed: AtomicBool,
}

impl Shared {
    fn status(&self) -> ProxyStatus {
        read(&self.status).unwrap_or(ProxyStatus::Stopped)
    }

    fn set_status(&self, status: ProxyStatus) {
        *write(&self.status) = Some(status);
    }

    /// A read error ends the reader; only a live failure marks the proxy.
    fn record_read_error(&self, err: &std::io::Error) {
        if is_end_of_stream(err) || self.status() != ProxyStatus::Running {
            return;
        }
        warn!("pty read failed: {err}");
        self.read_failed.store(true, Ordering::SeqCst);
        self.set_status(ProxyStatus::Error);
    }
}

/// Master side of the PTY; dropping it closes the terminal.
struct PtyIo {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
}

struct ChildControl {
    pid: Option<u32>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

/// Owns one child process running inside a PTY.
///
/// Output is pumped by a dedicated reader thread: the legacy handler (see
/// [`ProcessProxy::set_output_handler`]) runs inline, then every named
/// consumer receives its own copy of the chunk on an independent task. A
/// waiter thread blocks on the child and fires the exit handler once.
pub struct ProcessProxy {
    command: String,
    args: Vec<String>,
    env: Mutex<Vec<(String, String)>>,
    shared: Arc<Shared>,
    io: Mutex<Option<PtyIo>>,
    child: Mutex<Option<ChildControl>>,
}

impl ProcessProxy {
    /// Create a proxy for `command`. Nothing is spawned until [`start`](Self::start).
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: Mutex::new(Vec::new()),
            shared: Arc::new(Shared::default()),
            io: Mutex::new(None),
            child: Mutex::new(None),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Extra environment, applied over the inherited environment at start.
    pub fn set_env(&self, env: Vec<(String, String)>) {
        *lock(&self.env) = env;
    }

    pub fn set_output_handler<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        *write(&self.shared.on_output) = Some(Arc::new(handler));
    }

    pub fn set_exit_handler<F>(&self, handler: F)
    where
        F: FnOnce(ChildExit) + Send + 'static,
    {
        *lock(&self.shared.on_exit) = Some(Box::new(handler));
    }

    /// Register (or replace) the consumer stored under `id`.
    pub fn add_output_handler<F>(&self, id: impl Into<String>, handler: F)
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        write(&self.shared.consumers).insert(id.into(), Arc::new(handler));
    }

    pub fn remove_output_handler(&self, id: &str) {
        write(&self.shared.consumers).remove(id);
    }

    pub fn status(&self) -> ProxyStatus {
        self.shared.status()
    }

    /// Whether output stopped on an I/O failure rather than end of stream
    /// since the last [`start`](Self::start).
    pub fn read_failed(&self) -> bool {
        self.shared.read_failed.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        lock(&self.child).as_ref().and_then(|c| c.pid)
    }

    /// Allocate a PTY of `size` and launch the command inside it.
    ///
    /// Fails only if the PTY cannot be opened or the command cannot be
    /// launched; the status is then `Error`.
    pub fn start(&self, size: WindowSize) -> Result<()> {
        let mut io = lock(&self.io);
        if matches!(self.status(), ProxyStatus::Starting | ProxyStatus::Running) {
            return Err(PtyError::SpawnFailed(format!(
                "{} is already running",
                self.command
            )));
        }

        self.shared.set_status(ProxyStatus::Starting);
        self.shared.read_failed.store(false, Ordering::SeqCst);
        self.shared.exit.reset();

        let launched = match self.launch(size) {
            Ok(launched) => launched,
            Err(e) => {
                self.shared.set_status(ProxyStatus::Error);
                return Err(e);
            }
        };

        let pid = launched.child.process_id();
        let killer = launched.child.clone_killer();
        *lock(&self.child) = Some(ChildControl { pid, killer });
        *io = Some(PtyIo {
            master: launched.master,
            writer: launched.writer,
        });
        self.shared.set_status(ProxyStatus::Running);

        // Consumers are dispatched onto the caller's runtime when there is one.
        let runtime = Handle::try_current().ok();
        let shared = Arc::clone(&self.shared);
        let reader = launched.reader;
        std::thread::Builder::new()
            .name(format!("pty-read-{}", pid.unwrap_or_default()))
            .spawn(move || read_loop(reader, shared, runtime))?;

        let shared = Arc::clone(&self.shared);
        let child = launched.child;
        std::thread::Builder::new()
            .name(format!("pty-wait-{}", pid.unwrap_or_default()))
            .spawn(move || wait_loop(child, shared))?;

        info!("started {} (pid {:?}) at {}x{}", self.command, pid, size.cols, size.rows);
        Ok(())
    }

    fn launch(&self, size: WindowSize) -> Result<Launched> {
        let pair = native_pty_system()
            .openpty(size.into())
            .map_err(|e| PtyError::SpawnFailed(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&self.command);
        cmd.args(&self.args);
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }
        cmd.env("TERM", TERM_VALUE);
        for (key, value) in lock(&self.env).iter() {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("failed to spawn {}: {e}", self.command)))?;
        // The child holds its own copy; ours must go so reads see EOF on exit.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to clone reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("failed to take writer: {e}")))?;

        Ok(Launched {
            master: pair.master,
            reader,
            writer,
            child,
        })
    }

    /// Write bytes to the child's terminal (user input -> agent).
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut io = lock(&self.io);
        let io = io.as_mut().ok_or(PtyError::Closed)?;
        io.writer.write_all(data)?;
        io.writer.flush()?;
        Ok(data.len())
    }

    /// Resize the PTY. A no-op unless the child is running.
    pub fn resize(&self, size: WindowSize) -> Result<()> {
        if self.status() != ProxyStatus::Running {
            return Ok(());
        }
        let io = lock(&self.io);
        match io.as_ref() {
            Some(io) => io
                .master
                .resize(size.into())
                .map_err(|e| PtyError::ResizeFailed(e.to_string())),
            None => Ok(()),
        }
    }

    /// Terminate the child and close the PTY.
    ///
    /// Sends SIGTERM and waits up to [`STOP_GRACE`]; if the child is still
    /// alive (or the signal could not be delivered) it is killed outright.
    /// Always leaves the proxy `Stopped` with its PTY closed.
    pub fn stop(&self) {
        let control = lock(&self.child).take();
        if let Some(mut control) = control {
            if !self.shared.exit.is_set() {
                self.terminate(&mut control);
            }
        }
        lock(&self.io).take();
        self.shared.set_status(ProxyStatus::Stopped);
    }

    fn terminate(&self, control: &mut ChildControl) {
        info!(
            "stopping {} (pid {:?}) with SIGTERM",
            self.command, control.pid
        );
        match soft_terminate(control.pid) {
            Ok(()) => {
                if self.shared.exit.wait_timeout(STOP_GRACE) {
                    info!("{} exited gracefully", self.command);
                    return;
                }
                warn!("{} ignored SIGTERM, forcing with SIGKILL", self.command);
            }
            Err(e) => warn!("SIGTERM to {} failed: {e}, forcing with SIGKILL", self.command),
        }

        if let Err(e) = hard_kill(control) {
            warn!("SIGKILL to {} failed: {e}", self.command);
        }
        if !self.shared.exit.wait_timeout(KILL_GRACE) {
            warn!("{} still not reaped after SIGKILL", self.command);
        }
    }
}

impl fmt::Debug for ProcessProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessProxy")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("status", &self.status())
            .finish()
    }
}

struct Launched {
    master: Box<dyn MasterPty + Send>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
}

fn read_loop(mut reader: Box<dyn Read + Send>, shared: Arc<Shared>, runtime: Option<Handle>) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                shared.record_read_error(&e);
                return;
            }
        };
        let data = &buf[..n];

        let handler = read(&shared.on_output).clone();
        if let Some(handler) = handler {
            handler(data);
        }

        let consumers: Vec<OutputConsumer> = read(&shared.consumers).values().cloned().collect();
        for consumer in consumers {
            let chunk = data.to_vec();
            dispatch(runtime.as_ref(), move || consumer(chunk));
        }
    }
}

fn wait_loop(mut child: Box<dyn Child + Send + Sync>, shared: Arc<Shared>) {
    let exit = match child.wait() {
        Ok(status) => ChildExit::Exited(status.exit_code()),
        Err(e) => ChildExit::WaitFailed(e.to_string()),
    };
    debug!("child exited: {exit}");
    shared.set_status(ProxyStatus::Stopped);
    shared.exit.set();

    let on_exit = lock(&shared.on_exit).take();
    if let Some(on_exit) = on_exit {
        on_exit(exit);
    }
}

fn dispatch<F>(runtime: Option<&Handle>, job: F)
where
    F: FnOnce() + Send + 'static,
{
    match runtime {
        Some(handle) => {
            handle.spawn_blocking(job);
        }
        None => {
            std::thread::spawn(job);
        }
    }
}

/// Linux reports EIO on the master once the child side is gone.
fn is_end_of_stream(err: &std::io::Error) -> bool {
    if err.kind() == ErrorKind::UnexpectedEof {
        return true;
    }
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(nix::errno::Errno::EIO as i32)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(unix)]
fn soft_terminate(pid: Option<u32>) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = pid.ok_or_else(|| std::io::Error::other("child has no pid"))?;
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
fn soft_terminate(_pid: Option<u32>) -> std::io::Result<()> {
    Err(std::io::Error::other("soft terminate is not supported"))
}

#[cfg(unix)]
fn hard_kill(control: &mut ChildControl) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match control.pid {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGKILL).map_err(std::io::Error::from),
        None => control.killer.kill(),
    }
}

#[cfg(not(unix))]
fn hard_kill(control: &mut ChildControl) -> std::io::Result<()> {
    control.killer.kill()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}
