use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use agentdeck_pty::{ProcessProxy, WindowSize};
use log::{info, warn};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::args::ArgTemplates;
use crate::detect::AgentInfo;
use crate::error::{PoolError, Result};
use crate::instance::{AgentInstance, InstanceStatus, OutputSink};
use crate::profiles::{self, SetupContext};

/// Options for [`AgentPool::get_or_create`].
#[derive(Clone, Default)]
pub struct CreateOptions {
    /// Where output goes; also rebinds the sink of a reused instance.
    pub sink: Option<Arc<dyn OutputSink>>,
    /// Suppress informational logging.
    pub quiet: bool,
}

impl CreateOptions {
    pub fn with_sink(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            sink: Some(sink),
            quiet: false,
        }
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

/// Row of [`AgentPool::list_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    pub id: String,
    pub kind: String,
    pub status: InstanceStatus,
}

#[derive(Default)]
struct PoolState {
    agents: HashMap<String, Arc<AgentInstance>>,
    counters: HashMap<String, u32>,
}

/// Creates, reuses and tears down agent instances.
///
/// At most one instance per type is `Running`; a request for a type with a
/// running instance returns it instead of launching another process.
/// Instance ids are `{type}-{n}` with `n` counting from 1 and never reused.
pub struct AgentPool {
    available: HashMap<String, AgentInfo>,
    state: RwLock<PoolState>,
    notify_addr: Option<String>,
    templates: ArgTemplates,
    initial_size: WindowSize,
}

impl AgentPool {
    /// `notify_addr` is handed to agents on first launch; `None` skips that setup.
    pub fn new(available: Vec<AgentInfo>, notify_addr: Option<String>) -> Self {
        Self {
            available: available
                .into_iter()
                .filter(|a| a.found)
                .map(|a| (a.kind.clone(), a))
                .collect(),
            state: RwLock::new(PoolState::default()),
            notify_addr,
            templates: ArgTemplates::from_env(),
            initial_size: WindowSize::default(),
        }
    }

    pub fn with_templates(mut self, templates: ArgTemplates) -> Self {
        self.templates = templates;
        self
    }

    pub fn is_available(&self, kind: &str) -> bool {
        self.available.contains_key(kind)
    }

    /// Return the running instance of `kind`, or launch a new one.
    pub fn get_or_create(&self, kind: &str, options: CreateOptions) -> Result<Arc<AgentInstance>> {
        let mut state = self.write_state();

        let info = self
            .available
            .get(kind)
            .ok_or_else(|| PoolError::Unavailable(kind.to_string()))?;

        if let Some(existing) = state
            .agents
            .values()
            .find(|a| a.kind() == kind && a.is_running())
        {
            if let Some(sink) = options.sink {
                existing.set_output_sink(Some(sink));
            }
            return Ok(Arc::clone(existing));
        }

        let counter = state.counters.entry(kind.to_string()).or_insert(0);
        *counter += 1;
        let seq = *counter;
        let id = format!("{kind}-{seq}");
        if !options.quiet {
            info!("starting {id}");
        }

        if seq == 1 {
            self.run_setup(kind, &info.command, options.quiet);
        }

        let proxy = ProcessProxy::new(info.command.clone(), info.args.clone());
        proxy.set_env(self.agent_env(kind, options.quiet));

        let instance = AgentInstance::new(
            id.clone(),
            kind.to_string(),
            info.name.clone(),
            proxy,
            profiles::wants_filter(kind),
            options.sink,
        );
        // Running before start so an immediate exit is not overwritten.
        instance.set_status(InstanceStatus::Running);
        if let Err(source) = instance.proxy().start(self.initial_size) {
            instance.set_status(InstanceStatus::Error);
            return Err(PoolError::Start {
                kind: kind.to_string(),
                source,
            });
        }

        state.agents.insert(id, Arc::clone(&instance));
        Ok(instance)
    }

    pub fn get(&self, id: &str) -> Result<Arc<AgentInstance>> {
        self.read_state()
            .agents
            .get(id)
            .cloned()
            .ok_or_else(|| PoolError::NotFound(id.to_string()))
    }

    /// Every instance ever created, sorted by id.
    pub fn list_all(&self) -> Vec<InstanceSummary> {
        let mut list: Vec<InstanceSummary> = self
            .read_state()
            .agents
            .values()
            .map(|a| InstanceSummary {
                id: a.id().to_string(),
                kind: a.kind().to_string(),
                status: a.status(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Available agent types sorted by display name.
    pub fn available_agents(&self) -> Vec<AgentInfo> {
        let mut agents: Vec<AgentInfo> = self.available.values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    pub fn running_count(&self) -> usize {
        self.read_state()
            .agents
            .values()
            .filter(|a| a.is_running())
            .count()
    }

    /// Run `kind` once as a batch subprocess and return its trimmed output.
    ///
    /// stdout and stderr are both captured. The child is killed if `cancel`
    /// fires first.
    pub async fn call_non_interactive(
        &self,
        kind: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let info = self
            .available
            .get(kind)
            .ok_or_else(|| PoolError::Unavailable(kind.to_string()))?;
        let args = self.templates.build(kind, message);

        let mut cmd = Command::new(&info.command);
        cmd.args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(PoolError::Cancelled),
            output = cmd.output() => output.map_err(|source| PoolError::Spawn {
                command: info.command.clone(),
                source,
            })?,
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(PoolError::Command {
                kind: kind.to_string(),
                status: output.status.to_string(),
                output: combined,
            });
        }
        Ok(combined.trim().to_string())
    }

    /// [`call_non_interactive`](Self::call_non_interactive) bounded by
    /// `timeout` and by `interrupt`. Whichever fires first cancels the call,
    /// killing the batch process, and is reported as `TimedOut` or
    /// `Cancelled` respectively.
    pub async fn call_with_timeout(
        &self,
        kind: &str,
        message: &str,
        timeout: Duration,
        interrupt: impl Future<Output = ()>,
    ) -> Result<String> {
        let cancel = CancellationToken::new();
        let call = self.call_non_interactive(kind, message, &cancel);
        tokio::pin!(call);

        let reason = tokio::select! {
            reply = &mut call => return reply,
            _ = tokio::time::sleep(timeout) => PoolError::TimedOut,
            _ = interrupt => PoolError::Cancelled,
        };
        cancel.cancel();
        match call.await {
            Err(PoolError::Cancelled) => Err(reason),
            other => other,
        }
    }

    /// Stop every tracked instance. Stops run in parallel so hanging agents
    /// share one escalation bound; returns once all have been attempted.
    pub fn shutdown(&self) {
        let agents: Vec<Arc<AgentInstance>> = self.read_state().agents.values().cloned().collect();
        if agents.is_empty() {
            return;
        }
        info!("stopping {} agent instance(s)", agents.len());

        std::thread::scope(|scope| {
            for agent in &agents {
                let spawned = std::thread::Builder::new()
                    .name(format!("stop-{}", agent.id()))
                    .spawn_scoped(scope, move || agent.stop());
                if let Err(e) = spawned {
                    warn!("failed to spawn stop thread for {}: {e}", agent.id());
                    agent.stop();
                }
            }
        });
    }

    fn run_setup(&self, kind: &str, command: &str, quiet: bool) {
        let (Some(setup), Some(addr)) = (
            profiles::profile(kind).and_then(|p| p.setup),
            self.notify_addr.as_deref(),
        ) else {
            return;
        };
        let ctx = SetupContext {
            command,
            notify_addr: addr,
            quiet,
        };
        if let Err(e) = setup(&ctx) {
            warn!("setup for {kind} failed: {e}");
        }
    }

    fn agent_env(&self, kind: &str, quiet: bool) -> Vec<(String, String)> {
        match self.notify_addr.as_deref() {
            Some(addr) if profiles::wants_notify_env(kind) => {
                let url = profiles::notify_url(addr);
                if !quiet {
                    info!("{kind} env: {}={url}", profiles::NOTIFY_ENV_VAR);
                }
                vec![(profiles::NOTIFY_ENV_VAR.to_string(), url)]
            }
            _ => Vec::new(),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, PoolState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, PoolState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper(kind: &str) -> AgentInfo {
        AgentInfo::new(kind, kind.to_uppercase(), "/bin/sh").with_args(["-c", "sleep 30"])
    }

    #[test]
    fn test_unavailable_type_spawns_nothing() {
        let pool = AgentPool::new(vec![sleeper("a")], None);
        let err = pool.get_or_create("b", CreateOptions::default()).unwrap_err();
        assert!(matches!(err, PoolError::Unavailable(ref k) if k == "b"));
        assert!(pool.list_all().is_empty());
    }

    #[test]
    fn test_not_found_types_are_unavailable() {
        let mut missing = sleeper("ghost");
        missing.found = false;
        let pool = AgentPool::new(vec![missing], None);
        assert!(!pool.is_available("ghost"));
    }

    #[test]
    fn test_start_failure_is_reported() {
        let info = AgentInfo::new("broken", "Broken", "/definitely/not/an/agent");
        let pool = AgentPool::new(vec![info], None);
        let err = pool
            .get_or_create("broken", CreateOptions::default().quiet())
            .unwrap_err();
        assert!(matches!(err, PoolError::Start { .. }), "got {err}");
        assert_eq!(pool.running_count(), 0);
    }

    #[test]
    fn test_available_agents_sorted_by_name() {
        let pool = AgentPool::new(
            vec![
                AgentInfo::new("z", "Zed", "z"),
                AgentInfo::new("a", "Beta", "a"),
                AgentInfo::new("m", "Alpha", "m"),
            ],
            None,
        );
        let names: Vec<String> = pool.available_agents().into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["Alpha", "Beta", "Zed"]);
    }

    #[test]
    fn test_get_unknown_id() {
        let pool = AgentPool::new(Vec::new(), None);
        assert!(matches!(pool.get("x-1"), Err(PoolError::NotFound(_))));
    }

    #[test]
    fn test_agent_env_only_with_notify_addr() {
        let without = AgentPool::new(Vec::new(), None);
        assert!(without.agent_env("codex", true).is_empty());

        let with = AgentPool::new(Vec::new(), Some("http://127.0.0.1:7000".into()));
        assert_eq!(
            with.agent_env("gemini", true),
            vec![(
                "MCP_SERVER_URL".to_string(),
                "http://127.0.0.1:7000/mcp".to_string()
            )]
        );
        assert!(with.agent_env("claude", true).is_empty());
    }
}
