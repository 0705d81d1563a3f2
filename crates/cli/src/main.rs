//! Interactive command-line front-end for the minerva agent.

mod commands;

use std::io::{BufRead, IsTerminal, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use minerva_agent::controller::{Agent, InterruptSource, Services};
use minerva_config::AppConfig;

#[derive(Debug, Parser)]
#[command(name = "minerva", version, about = "An autonomous reasoning agent")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "minerva.toml")]
    config: String,
}

/// ANSI palette. Empty codes when colour is disabled.
#[derive(Debug, Clone, Copy)]
pub struct Colors {
    pub header: &'static str,
    pub info: &'static str,
    pub ok: &'static str,
    pub warn: &'static str,
    pub fail: &'static str,
    pub reset: &'static str,
}

impl Colors {
    fn new(enabled: bool) -> Self {
        if enabled {
            Self {
                header: "\x1b[95m",
                info: "\x1b[96m",
                ok: "\x1b[92m",
                warn: "\x1b[93m",
                fail: "\x1b[91m",
                reset: "\x1b[0m",
            }
        } else {
            Self {
                header: "",
                info: "",
                ok: "",
                warn: "",
                fail: "",
                reset: "",
            }
        }
    }
}

/// Between-step cancellation: any pending key press on the TTY cancels the
/// running turn. A no-op off-terminal.
struct TtyInterrupt;

impl InterruptSource for TtyInterrupt {
    fn interrupted(&mut self) -> bool {
        if !std::io::stdin().is_terminal() {
            return false;
        }
        let mut hit = false;
        while crossterm::event::poll(Duration::ZERO).unwrap_or(false) {
            if let Ok(crossterm::event::Event::Key(_)) = crossterm::event::read() {
                hit = true;
            }
        }
        hit
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone())),
        )
        .init();

    let colors = Colors::new(config.ui.colored && std::io::stdout().is_terminal());
    let services = Arc::new(Services::initialize(config).await?);
    let mut agent = Agent::new(services.clone());
    if std::io::stdin().is_terminal() {
        agent = agent.with_interrupt(Box::new(TtyInterrupt));
    }

    println!(
        "{}minerva is online. {} tools loaded. Type a message, or q to quit.{}",
        colors.ok,
        services.registry.names().len(),
        colors.reset
    );

    // Proactive assistant: work through any queued research topics while the
    // session runs.
    {
        let services = services.clone();
        let ctx = agent.tool_ctx().clone();
        tokio::spawn(async move {
            match minerva_agent::process_research_queue(&services, &ctx).await {
                Ok(0) => {}
                Ok(done) => tracing::info!(topics = done, "research queue drained"),
                Err(err) => tracing::warn!(%err, "research queue processing failed"),
            }
        });
    }

    let stdin = std::io::stdin();
    loop {
        print!("{}you>{} ", colors.header, colors.reset);
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "q" | "quit" | "exit") {
            break;
        }

        if let Some(rest) = line.strip_prefix('/') {
            commands::dispatch(rest, &services, &mut agent, &colors).await;
            continue;
        }

        match agent.run(line).await {
            Ok(reply) => println!("{}minerva>{} {reply}", colors.ok, colors.reset),
            Err(err) => println!(
                "{}minerva>{} I ran into a problem while handling that: {err}",
                colors.fail, colors.reset
            ),
        }
    }

    println!("{}bye.{}", colors.info, colors.reset);
    Ok(())
}
