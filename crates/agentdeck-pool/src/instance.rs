use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use agentdeck_pty::{ChildExit, EscapeFilter, ProcessProxy, ProxyStatus, WindowSize};
use log::debug;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{PoolError, Result};

/// Quiet period after which a response is considered complete.
pub const SILENCE_WINDOW: Duration = Duration::from_secs(3);

/// How often the output buffer is sampled while waiting for a response.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Running,
    Stopped,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Error => "error",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination for an instance's (filtered) output.
pub trait OutputSink: Send + Sync {
    fn write_output(&self, data: &[u8]);
}

/// Writes output straight to the process's stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write_output(&self, data: &[u8]) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(data);
        let _ = out.flush();
    }
}

#[derive(Default)]
struct OutputState {
    buffer: Vec<u8>,
    sink: Option<Arc<dyn OutputSink>>,
}

/// One launched agent.
///
/// Output flows `proxy -> filter (optional) -> buffer -> sink`. The sink is
/// invoked outside the buffer lock so a slow sink never blocks readers of
/// the buffer.
pub struct AgentInstance {
    id: String,
    kind: String,
    name: String,
    proxy: Arc<ProcessProxy>,
    status: RwLock<InstanceStatus>,
    output: Mutex<OutputState>,
    filter: Option<Mutex<EscapeFilter>>,
    exit_tx: mpsc::Sender<ChildExit>,
    exit_rx: tokio::sync::Mutex<mpsc::Receiver<ChildExit>>,
    hint_sent: AtomicBool,
}

impl AgentInstance {
    /// Wrap `proxy` and wire its output and exit handlers. The proxy is not started.
    pub fn new(
        id: String,
        kind: String,
        name: String,
        proxy: ProcessProxy,
        filter: bool,
        sink: Option<Arc<dyn OutputSink>>,
    ) -> Arc<Self> {
        let (exit_tx, exit_rx) = mpsc::channel(1);
        let instance = Arc::new(Self {
            id,
            kind,
            name,
            proxy: Arc::new(proxy),
            status: RwLock::new(InstanceStatus::Stopped),
            output: Mutex::new(OutputState {
                buffer: Vec::new(),
                sink,
            }),
            filter: filter.then(|| Mutex::new(EscapeFilter::new())),
            exit_tx,
            exit_rx: tokio::sync::Mutex::new(exit_rx),
            hint_sent: AtomicBool::new(false),
        });

        // Handlers live inside the proxy, which the instance owns.
        let weak: Weak<Self> = Arc::downgrade(&instance);
        instance.proxy.set_output_handler(move |data| {
            if let Some(instance) = weak.upgrade() {
                instance.handle_output(data);
            }
        });
        let weak: Weak<Self> = Arc::downgrade(&instance);
        instance.proxy.set_exit_handler(move |exit| {
            if let Some(instance) = weak.upgrade() {
                let read_failed = instance.proxy.read_failed();
                instance.handle_exit(exit, read_failed);
            }
        });
        instance
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn proxy(&self) -> &Arc<ProcessProxy> {
        &self.proxy
    }

    /// A running instance whose proxy has lost its output reports `Error`.
    pub fn status(&self) -> InstanceStatus {
        let status = *self.status.read().unwrap_or_else(|e| e.into_inner());
        if status == InstanceStatus::Running && self.proxy.status() == ProxyStatus::Error {
            return InstanceStatus::Error;
        }
        status
    }

    pub fn is_running(&self) -> bool {
        self.status() == InstanceStatus::Running
    }

    pub(crate) fn set_status(&self, status: InstanceStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Flag the instance as no longer current so the pool will not reuse it.
    pub fn mark_stopped(&self) {
        self.set_status(InstanceStatus::Stopped);
    }

    /// Replace (or detach, with `None`) the output sink.
    pub fn set_output_sink(&self, sink: Option<Arc<dyn OutputSink>>) {
        self.lock_output().sink = sink;
    }

    /// Everything buffered since the last reset.
    pub fn output_snapshot(&self) -> Vec<u8> {
        self.lock_output().buffer.clone()
    }

    pub fn write(&self, data: &[u8]) -> Result<usize> {
        Ok(self.proxy.write(data)?)
    }

    pub fn resize(&self, size: WindowSize) -> Result<()> {
        Ok(self.proxy.resize(size)?)
    }

    /// Mark stopped and stop the proxy, blocking for the proxy's stop bound.
    pub fn stop(&self) {
        self.mark_stopped();
        self.proxy.stop();
    }

    /// Wait for the child to exit. Only one caller receives each exit.
    pub async fn wait_exit(&self) -> Option<ChildExit> {
        self.exit_rx.lock().await.recv().await
    }

    /// Write `message` followed by a newline, at most once per instance.
    pub fn send_hint_once(&self, message: &str) -> Result<()> {
        if self.hint_sent.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.proxy.write(format!("{message}\n").as_bytes())?;
        Ok(())
    }

    /// Send `message` and collect the reply using the default silence window.
    pub async fn send_and_wait(&self, message: &str, cancel: &CancellationToken) -> Result<String> {
        self.send_and_wait_with(message, SILENCE_WINDOW, cancel).await
    }

    /// Reset the buffer, write `message` plus newline, then sample the buffer
    /// every [`POLL_INTERVAL`] until it has stopped growing for `window`.
    ///
    /// Silence is only measured once some output has arrived, so an agent
    /// that never answers is bounded by `cancel` alone.
    pub async fn send_and_wait_with(
        &self,
        message: &str,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.lock_output().buffer.clear();
        self.proxy.write(format!("{message}\n").as_bytes())?;

        let mut ticker = interval_at(Instant::now() + POLL_INTERVAL, POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_size = 0;
        let mut silence_start: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                _ = ticker.tick() => {}
            }

            let size = self.lock_output().buffer.len();
            if size > last_size {
                last_size = size;
                silence_start = Some(Instant::now());
                continue;
            }

            match silence_start {
                Some(start) if start.elapsed() >= window => {
                    let output = self.lock_output();
                    return Ok(String::from_utf8_lossy(&output.buffer).into_owned());
                }
                None if size > 0 => silence_start = Some(Instant::now()),
                _ => {}
            }
        }
    }

    fn handle_output(&self, data: &[u8]) {
        let filtered;
        let data = match &self.filter {
            Some(filter) => {
                filtered = filter.lock().unwrap_or_else(|e| e.into_inner()).filter(data);
                if filtered.is_empty() {
                    return;
                }
                filtered.as_slice()
            }
            None => data,
        };

        let sink = {
            let mut output = self.lock_output();
            output.buffer.extend_from_slice(data);
            output.sink.clone()
        };
        if let Some(sink) = sink {
            sink.write_output(data);
        }
    }

    fn handle_exit(&self, exit: ChildExit, read_failed: bool) {
        debug!("{} exited: {exit}", self.id);
        let status = match exit {
            ChildExit::Exited(_) if !read_failed => InstanceStatus::Stopped,
            ChildExit::Exited(_) | ChildExit::WaitFailed(_) => InstanceStatus::Error,
        };
        self.set_status(status);
        // Capacity 1: a second exit notification is never needed.
        let _ = self.exit_tx.try_send(exit);
    }

    fn lock_output(&self) -> MutexGuard<'_, OutputState> {
        self.output.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for AgentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentInstance")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<u8>>);

    impl OutputSink for Collect {
        fn write_output(&self, data: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(data);
        }
    }

    fn idle_instance(filter: bool, sink: Option<Arc<dyn OutputSink>>) -> Arc<AgentInstance> {
        let proxy = ProcessProxy::new("/bin/sh", vec!["-c".into(), "sleep 5".into()]);
        AgentInstance::new(
            "test-1".into(),
            "test".into(),
            "Test".into(),
            proxy,
            filter,
            sink,
        )
    }

    #[test]
    fn test_output_goes_to_buffer_and_sink() {
        let sink = Arc::new(Collect::default());
        let instance = idle_instance(false, Some(sink.clone()));
        instance.handle_output(b"hello ");
        instance.handle_output(b"world");
        assert_eq!(instance.output_snapshot(), b"hello world");
        assert_eq!(*sink.0.lock().unwrap(), b"hello world");
    }

    #[test]
    fn test_filter_applied_before_buffer() {
        let sink = Arc::new(Collect::default());
        let instance = idle_instance(true, Some(sink.clone()));
        instance.handle_output(b"a\x1b[2J");
        instance.handle_output(b"\x1b[?1049");
        instance.handle_output(b"hb");
        assert_eq!(instance.output_snapshot(), b"ab");
        assert_eq!(*sink.0.lock().unwrap(), b"ab");
    }

    #[test]
    fn test_sink_can_be_swapped_and_detached() {
        let first = Arc::new(Collect::default());
        let second = Arc::new(Collect::default());
        let instance = idle_instance(false, Some(first.clone()));
        instance.handle_output(b"one");
        instance.set_output_sink(Some(second.clone()));
        instance.handle_output(b"two");
        instance.set_output_sink(None);
        instance.handle_output(b"three");
        assert_eq!(*first.0.lock().unwrap(), b"one");
        assert_eq!(*second.0.lock().unwrap(), b"two");
        assert_eq!(instance.output_snapshot(), b"onetwothree");
    }

    #[tokio::test]
    async fn test_exit_notification_is_capacity_one() {
        let instance = idle_instance(false, None);
        instance.set_status(InstanceStatus::Running);
        instance.handle_exit(ChildExit::Exited(0), false);
        instance.handle_exit(ChildExit::Exited(1), false);
        assert_eq!(instance.status(), InstanceStatus::Stopped);
        assert_eq!(instance.wait_exit().await, Some(ChildExit::Exited(0)));
        assert!(instance.exit_rx.lock().await.try_recv().is_err());
    }

    #[test]
    fn test_wait_failure_marks_error() {
        let instance = idle_instance(false, None);
        instance.handle_exit(ChildExit::WaitFailed("boom".into()), false);
        assert_eq!(instance.status(), InstanceStatus::Error);
    }

    #[test]
    fn test_exit_after_read_failure_marks_error() {
        let instance = idle_instance(false, None);
        instance.set_status(InstanceStatus::Running);
        instance.handle_exit(ChildExit::Exited(0), true);
        assert_eq!(instance.status(), InstanceStatus::Error);
        assert!(!instance.is_running());
    }

    #[test]
    fn test_hint_without_pty_fails_once() {
        let instance = idle_instance(false, None);
        assert!(instance.send_hint_once("hint").is_err());
        // The flag is consumed even when the write fails.
        assert!(instance.send_hint_once("hint").is_ok());
    }

    #[tokio::test]
    async fn test_send_and_wait_cancelled() {
        let instance = idle_instance(false, None);
        instance
            .proxy()
            .start(WindowSize::default())
            .expect("start sleep");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = instance.send_and_wait("hello", &cancel).await;
        assert!(matches!(result, Err(PoolError::Cancelled)));
        let proxy = Arc::clone(instance.proxy());
        tokio::task::spawn_blocking(move || proxy.stop()).await.unwrap();
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(InstanceStatus::Running.to_string(), "running");
        assert_eq!(InstanceStatus::Error.as_str(), "error");
    }
}
