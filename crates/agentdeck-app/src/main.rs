use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use agentdeck_app::cli::{Cli, Command};
use agentdeck_app::control::CrosstermSurface;
use agentdeck_app::logging::{self, LogSink};
use agentdeck_app::passthrough::{HostIo, Passthrough};
use agentdeck_app::selector;
use agentdeck_app::share::TerminalShare;
use agentdeck_app::terminal::{self, TtyTerminal};
use agentdeck_app::webterm::{WebConfig, WebTerminal};
use agentdeck_pool::{detect, AgentInstance, AgentPool, CreateOptions, OutputSink, StdoutSink};
use anyhow::{bail, Context};
use clap::Parser;
use log::{info, warn, LevelFilter};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown gets this long before the process is forced down.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);
const RUNTIME_DRAIN: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    let mut cli = Cli::parse();
    let log_sink = init_logging(&cli);
    info!("agentdeck {} starting", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("agentdeck-rt")
        .build()
        .context("failed to start the async runtime")?;

    let result = match cli.command.take() {
        Some(Command::Ask {
            agent,
            message,
            timeout,
        }) => runtime.block_on(ask(
            &agent,
            &message.join(" "),
            Duration::from_secs(timeout),
            cli.notify_addr.clone(),
        )),
        None => run_session(&cli, &runtime),
    };

    // A control panel blocked on terminal input must not hold up exit.
    runtime.shutdown_timeout(RUNTIME_DRAIN);
    if let Some(sink) = log_sink {
        sink.close();
    }
    result
}

fn init_logging(cli: &Cli) -> Option<LogSink> {
    let debug_env = std::env::var("DEBUG").ok();
    let path = logging::log_path(cli.log_file.clone(), debug_env.as_deref())?;
    let sink = match LogSink::open(&path) {
        Ok(sink) => sink,
        Err(e) => {
            eprintln!("warning: cannot open log file {}: {e}", path.display());
            return None;
        }
    };
    let level = if debug_env.is_some() {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(e) = sink.install(level) {
        eprintln!("warning: logger already installed: {e}");
    }
    Some(sink)
}

async fn ask(
    kind: &str,
    message: &str,
    timeout: Duration,
    notify_addr: Option<String>,
) -> anyhow::Result<()> {
    let pool = AgentPool::new(detect::scan().await, notify_addr);
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot watch for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };
    let reply = pool
        .call_with_timeout(kind, message, timeout, interrupt)
        .await
        .with_context(|| format!("ask {kind} failed"))?;

    println!("{reply}");
    Ok(())
}

fn run_session(cli: &Cli, runtime: &Runtime) -> anyhow::Result<()> {
    // Proxies started from here dispatch output consumers onto the runtime.
    let _guard = runtime.enter();

    let detected = runtime.block_on(detect::scan());
    if detect::available(&detected).is_empty() {
        bail!("no supported agent CLI found on PATH (looked for claude, codex, gemini)");
    }

    let kind = match &cli.entry {
        Some(kind) => kind.to_lowercase(),
        None => match selector::select_agent(&detected)? {
            Some(kind) => kind,
            None => {
                println!("Cancelled.");
                return Ok(());
            }
        },
    };

    let pool = Arc::new(AgentPool::new(detected, cli.notify_addr.clone()));
    if !pool.is_available(&kind) {
        bail!("agent '{kind}' is not installed or not supported");
    }

    let terminal = Arc::new(TtyTerminal::new().context("stdin is not usable as a terminal")?);
    let sink: Arc<dyn OutputSink> = Arc::new(StdoutSink);
    let main_agent = pool
        .get_or_create(&kind, CreateOptions::with_sink(Arc::clone(&sink)))
        .with_context(|| format!("failed to start {kind}"))?;

    let share = if cli.no_web {
        None
    } else {
        start_web(cli, runtime, &main_agent)
    };

    terminal::drain_stdin();
    let session = Passthrough::new(
        Arc::clone(&pool),
        main_agent,
        share,
        HostIo {
            terminal,
            surface: Arc::new(CrosstermSurface),
            sink,
        },
        runtime.handle().clone(),
    );
    spawn_watchdog(runtime, session.quit_token());

    let result = session.run();
    if result.is_err() {
        pool.shutdown();
    }
    result
}

fn start_web(
    cli: &Cli,
    runtime: &Runtime,
    agent: &AgentInstance,
) -> Option<Arc<dyn TerminalShare>> {
    let config = WebConfig {
        port: cli.web_port,
        user: cli.web_user.clone(),
        pass: cli.web_pass.clone(),
        ..WebConfig::default()
    };
    let proxy = Some(Arc::clone(agent.proxy()));
    match runtime.block_on(WebTerminal::bind(config, agent.name(), proxy)) {
        Ok(web) => {
            println!("Web terminal: {}", display_url(web.local_addr()));
            Some(Arc::new(web))
        }
        Err(e) => {
            warn!("web terminal failed to start: {e}");
            eprintln!("Web terminal unavailable: {e}");
            None
        }
    }
}

fn display_url(addr: SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        format!("http://localhost:{}", addr.port())
    } else {
        format!("http://{addr}")
    }
}

/// Once shutdown begins: force exit after [`SHUTDOWN_DEADLINE`], or at once
/// on a second interrupt.
fn spawn_watchdog(runtime: &Runtime, quit: CancellationToken) {
    runtime.spawn(async move {
        quit.cancelled().await;
        let spawned = thread::Builder::new()
            .name("shutdown-watchdog".into())
            .spawn(|| {
                thread::sleep(SHUTDOWN_DEADLINE);
                eprintln!("\r\nShutdown timed out, forcing exit");
                std::process::exit(1);
            });
        if let Err(e) = spawned {
            warn!("failed to spawn shutdown watchdog: {e}");
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\r\nForced exit");
            std::process::exit(130);
        }
    });
}
