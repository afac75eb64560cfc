use std::path::Path;
use std::time::Duration;

use log::debug;
use tokio::process::Command;

use crate::profiles::{AgentProfile, PROFILES};

const VERSION_TIMEOUT: Duration = Duration::from_secs(1);
const VERSION_MAX_CHARS: usize = 50;

/// An agent type as seen on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentInfo {
    pub kind: String,
    pub name: String,
    pub command: String,
    /// Arguments for the interactive launch.
    pub args: Vec<String>,
    pub version: String,
    pub found: bool,
}

impl AgentInfo {
    /// An available agent with no launch arguments.
    pub fn new(kind: impl Into<String>, name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            version: String::new(),
            found: true,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    fn from_profile(profile: &AgentProfile) -> Self {
        let mut info = Self::new(profile.kind, profile.name, profile.command);
        info.found = false;
        info
    }
}

/// Check every known agent concurrently, in profile order.
pub async fn scan() -> Vec<AgentInfo> {
    let handles: Vec<_> = PROFILES
        .iter()
        .map(|profile| tokio::spawn(check(AgentInfo::from_profile(profile))))
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (handle, profile) in handles.into_iter().zip(PROFILES) {
        match handle.await {
            Ok(info) => results.push(info),
            Err(e) => {
                debug!("detection of {} aborted: {e}", profile.kind);
                results.push(AgentInfo::from_profile(profile));
            }
        }
    }
    results
}

/// The subset of `agents` that were found.
pub fn available(agents: &[AgentInfo]) -> Vec<AgentInfo> {
    agents.iter().filter(|a| a.found).cloned().collect()
}

async fn check(mut info: AgentInfo) -> AgentInfo {
    match which::which(&info.command) {
        Ok(path) => {
            info.found = true;
            info.version = query_version(&path).await;
            debug!("found {} at {} ({})", info.kind, path.display(), info.version);
        }
        Err(_) => {
            info.found = false;
            debug!("{} not found on PATH", info.command);
        }
    }
    info
}

async fn query_version(path: &Path) -> String {
    let output = Command::new(path)
        .arg("--version")
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(VERSION_TIMEOUT, output).await {
        Err(_) => "unknown (timeout)".to_string(),
        Ok(Err(_)) => "unknown".to_string(),
        Ok(Ok(out)) if !out.status.success() => "unknown".to_string(),
        Ok(Ok(out)) => truncate_version(String::from_utf8_lossy(&out.stdout).trim()),
    }
}

fn truncate_version(version: &str) -> String {
    match version.char_indices().nth(VERSION_MAX_CHARS) {
        Some((idx, _)) => format!("{}...", &version[..idx]),
        None => version.to_string(),
    }
}
