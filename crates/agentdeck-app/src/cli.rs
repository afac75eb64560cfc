use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Drive several AI coding agents from one terminal and share the session
/// with browsers.
#[derive(Debug, Parser)]
#[command(name = "agentdeck", version, about)]
pub struct Cli {
    /// Agent type to start with (claude, codex, gemini). Prompts when omitted.
    #[arg(short, long, env = "AGENTDECK_ENTRY")]
    pub entry: Option<String>,

    /// First port tried for the web terminal; the next ten are fallbacks.
    #[arg(long, env = "AGENTDECK_WEB_PORT", default_value_t = 8080)]
    pub web_port: u16,

    /// Basic auth user for the web terminal.
    #[arg(long, env = "AGENTDECK_WEB_USER")]
    pub web_user: Option<String>,

    /// Basic auth password for the web terminal.
    #[arg(long, env = "AGENTDECK_WEB_PASS", hide_env_values = true)]
    pub web_pass: Option<String>,

    /// Do not start the web terminal.
    #[arg(long)]
    pub no_web: bool,

    /// Endpoint agents are pointed at on first launch (e.g. http://127.0.0.1:9000).
    #[arg(long, env = "AGENTDECK_NOTIFY_ADDR")]
    pub notify_addr: Option<String>,

    /// Write logs to this file. `DEBUG=1` logs to ./agentdeck.log.
    #[arg(long, env = "AGENTDECK_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ask one agent a single question non-interactively and print the answer.
    Ask {
        /// Agent type.
        agent: String,

        /// The message; multiple words are joined with spaces.
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,

        /// Give up after this many seconds.
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["agentdeck"]).unwrap();
        assert!(cli.entry.is_none() || std::env::var("AGENTDECK_ENTRY").is_ok());
        assert!(!cli.no_web);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_interactive_flags() {
        let cli = Cli::try_parse_from([
            "agentdeck",
            "-e",
            "codex",
            "--web-port",
            "9100",
            "--web-user",
            "me",
            "--web-pass",
            "secret",
            "--no-web",
            "--log-file",
            "/tmp/deck.log",
        ])
        .unwrap();
        assert_eq!(cli.entry.as_deref(), Some("codex"));
        assert_eq!(cli.web_port, 9100);
        assert_eq!(cli.web_user.as_deref(), Some("me"));
        assert_eq!(cli.web_pass.as_deref(), Some("secret"));
        assert!(cli.no_web);
        assert_eq!(cli.log_file, Some(PathBuf::from("/tmp/deck.log")));
    }

    #[test]
    fn test_ask_subcommand() {
        let cli =
            Cli::try_parse_from(["agentdeck", "ask", "claude", "what", "is", "up", "--timeout", "5"])
                .unwrap();
        match cli.command {
            Some(Command::Ask {
                agent,
                message,
                timeout,
            }) => {
                assert_eq!(agent, "claude");
                assert_eq!(message.join(" "), "what is up");
                assert_eq!(timeout, 5);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_ask_requires_message() {
        assert!(Cli::try_parse_from(["agentdeck", "ask", "claude"]).is_err());
    }
}
