use std::process::Command;

use log::info;

use crate::error::{PoolError, Result};

/// Name this process registers under in an agent's own configuration.
pub const REGISTRATION_NAME: &str = "agentdeck";

/// Environment variable pointing an agent at the notification endpoint.
pub const NOTIFY_ENV_VAR: &str = "MCP_SERVER_URL";

/// Inputs to a one-time per-type setup.
#[derive(Debug, Clone, Copy)]
pub struct SetupContext<'a> {
    pub command: &'a str,
    pub notify_addr: &'a str,
    pub quiet: bool,
}

pub type SetupFn = fn(&SetupContext<'_>) -> Result<()>;
pub type BatchArgsFn = fn(&str) -> Vec<String>;

/// Static description of one supported agent type.
#[derive(Debug)]
pub struct AgentProfile {
    pub kind: &'static str,
    pub name: &'static str,
    pub command: &'static str,
    /// Run the agent's output through an [`agentdeck_pty::EscapeFilter`].
    pub filter_output: bool,
    /// Pass the notification endpoint through the environment.
    pub notify_env: bool,
    /// Runs once, on the first instantiation of the type.
    pub setup: Option<SetupFn>,
    /// Default arguments for a one-shot batch call.
    pub batch_args: BatchArgsFn,
}

pub static PROFILES: &[AgentProfile] = &[
    AgentProfile {
        kind: "claude",
        name: "Claude Code",
        command: "claude",
        filter_output: false,
        notify_env: false,
        setup: Some(register_claude),
        batch_args: flag_args,
    },
    AgentProfile {
        kind: "codex",
        name: "Codex",
        command: "codex",
        filter_output: true,
        notify_env: true,
        setup: None,
        batch_args: codex_exec_args,
    },
    AgentProfile {
        kind: "gemini",
        name: "Gemini CLI",
        command: "gemini",
        filter_output: false,
        notify_env: true,
        setup: None,
        batch_args: flag_args,
    },
];

pub fn profile(kind: &str) -> Option<&'static AgentProfile> {
    PROFILES.iter().find(|p| p.kind == kind)
}

/// Built-in batch arguments; unknown types get the flag style.
pub fn default_batch_args(kind: &str, message: &str) -> Vec<String> {
    match profile(kind) {
        Some(p) => (p.batch_args)(message),
        None => flag_args(message),
    }
}

/// Whether `kind` should see the notification endpoint in its environment.
/// Unknown types get it too.
pub fn wants_notify_env(kind: &str) -> bool {
    profile(kind).map_or(true, |p| p.notify_env)
}

pub fn wants_filter(kind: &str) -> bool {
    profile(kind).is_some_and(|p| p.filter_output)
}

pub fn notify_url(addr: &str) -> String {
    format!("{}/mcp", addr.trim_end_matches('/'))
}

fn flag_args(message: &str) -> Vec<String> {
    vec!["-p".to_string(), message.to_string()]
}

fn codex_exec_args(message: &str) -> Vec<String> {
    vec![
        "exec".to_string(),
        "--sandbox".to_string(),
        "danger-full-access".to_string(),
        message.to_string(),
    ]
}

/// Registers the notification endpoint with Claude Code's MCP config.
fn register_claude(ctx: &SetupContext<'_>) -> Result<()> {
    if !ctx.quiet {
        info!("configuring {} MCP server via CLI", ctx.command);
    }

    // A stale entry is fine to lose; the remove fails when there is none.
    let _ = Command::new(ctx.command)
        .args(["mcp", "remove", REGISTRATION_NAME])
        .output();

    let url = notify_url(ctx.notify_addr);
    let output = Command::new(ctx.command)
        .args(["mcp", "add", "--transport", "http", REGISTRATION_NAME, &url])
        .output()
        .map_err(|e| PoolError::Setup(format!("failed to run {}: {e}", ctx.command)))?;

    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(PoolError::Setup(format!(
            "{} mcp add exited with {}: {}",
            ctx.command,
            output.status,
            combined.trim()
        )));
    }

    if !ctx.quiet {
        info!("{} MCP configured: {url}", ctx.command);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_lookup() {
        assert_eq!(profile("claude").map(|p| p.name), Some("Claude Code"));
        assert_eq!(profile("codex").map(|p| p.command), Some("codex"));
        assert!(profile("unknown").is_none());
    }

    #[test]
    fn test_only_codex_is_filtered() {
        assert!(wants_filter("codex"));
        assert!(!wants_filter("claude"));
        assert!(!wants_filter("gemini"));
        assert!(!wants_filter("other"));
    }

    #[test]
    fn test_notify_env_selection() {
        assert!(!wants_notify_env("claude"));
        assert!(wants_notify_env("codex"));
        assert!(wants_notify_env("gemini"));
        assert!(wants_notify_env("custom"));
    }

    #[test]
    fn test_default_batch_args() {
        assert_eq!(
            default_batch_args("codex", "fix it"),
            vec!["exec", "--sandbox", "danger-full-access", "fix it"]
        );
        assert_eq!(default_batch_args("claude", "hi"), vec!["-p", "hi"]);
        assert_eq!(default_batch_args("mystery", "hi"), vec!["-p", "hi"]);
    }

    #[test]
    fn test_notify_url() {
        assert_eq!(notify_url("http://127.0.0.1:9000"), "http://127.0.0.1:9000/mcp");
        assert_eq!(notify_url("http://127.0.0.1:9000/"), "http://127.0.0.1:9000/mcp");
    }

    #[test]
    fn test_setup_missing_command_fails() {
        let ctx = SetupContext {
            command: "/definitely/not/claude",
            notify_addr: "http://127.0.0.1:1",
            quiet: true,
        };
        assert!(matches!(register_claude(&ctx), Err(PoolError::Setup(_))));
    }
}
