//! toolhub CLI: list and call tools on local MCP servers.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use toolhub_config::{CliOverrides, ConfigSource};
use toolhub_mcp::{HubEvent, McpHub, ServerStatus, StartupReport};

#[derive(Parser)]
#[command(name = "toolhub", version, about = "Call tools on local MCP servers")]
struct Cli {
    /// Config file to use (.json or .toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Request timeout in milliseconds, applied to every server
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_ms: Option<u64>,

    /// Enable verbose/debug logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every tool exposed by the configured servers
    Tools {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Call a tool by `server.tool` or bare name
    Call {
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        args: Option<String>,
        /// Server to call, when `tool` is a bare name
        #[arg(long)]
        server: Option<String>,
    },
    /// Show the state of every server
    Status,
    /// Print server notifications and connection events as they arrive
    Watch {
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let loaded = toolhub_config::load(CliOverrides {
        config_path: cli.config,
        timeout_ms: cli.timeout_ms,
    })
    .context("Failed to load configuration")?;
    if let ConfigSource::Default = loaded.source {
        eprintln!("No configuration found; no servers will be started.");
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let hub = McpHub::new(loaded.mcp);
    let report = hub
        .initialize()
        .await
        .context("Failed to start MCP servers")?;
    print_failures(&report);

    let result = run(&hub, cli.command, &cancel).await;
    hub.shutdown().await;
    result
}

async fn run(hub: &McpHub, command: Command, cancel: &CancellationToken) -> Result<()> {
    match command {
        Command::Tools { json } => list_tools(hub, json).await,
        Command::Call { tool, args, server } => {
            call_tool(hub, &tool, args.as_deref(), server.as_deref(), cancel).await
        }
        Command::Status => {
            print_status(&hub.server_status().await);
            Ok(())
        }
        Command::Watch { seconds } => {
            watch(hub.subscribe(), seconds.map(Duration::from_secs), cancel).await;
            Ok(())
        }
    }
}

async fn list_tools(hub: &McpHub, json: bool) -> Result<()> {
    let tools = hub.list_tools().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }
    if tools.is_empty() {
        eprintln!("No tools available.");
        return Ok(());
    }
    let width = tools.iter().map(|t| t.full_name.len()).max().unwrap_or(0);
    for tool in &tools {
        println!("{:<width$}  {}", tool.full_name, first_line(&tool.description));
    }
    Ok(())
}

async fn call_tool(
    hub: &McpHub,
    tool: &str,
    args: Option<&str>,
    server: Option<&str>,
    cancel: &CancellationToken,
) -> Result<()> {
    let arguments: serde_json::Value = match args {
        Some(raw) => serde_json::from_str(raw).context("Tool arguments must be valid JSON")?,
        None => serde_json::json!({}),
    };

    let result = match server {
        Some(server) => hub.invoke_with_cancel(server, tool, arguments, cancel).await?,
        None => {
            let name = hub.resolve_tool(tool).await?;
            tracing::debug!(tool = %name, "Resolved tool");
            hub.invoke_with_cancel(name.server.as_str(), name.tool.as_str(), arguments, cancel)
                .await?
        }
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{}", serde_json::to_string_pretty(&result)?)?;
    Ok(())
}

async fn watch(
    mut events: broadcast::Receiver<HubEvent>,
    limit: Option<Duration>,
    cancel: &CancellationToken,
) {
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    eprintln!("Watching for server events. Press Ctrl+C to stop.");
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => eprintln!("Warning: could not encode event: {e}"),
                },
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    eprintln!("Warning: missed {missed} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            () = &mut deadline => break,
            () = cancel.cancelled() => break,
        }
    }
}

fn print_failures(report: &StartupReport) {
    for failure in &report.failed {
        eprintln!(
            "Warning: MCP server '{}' failed to start: {}",
            failure.server, failure.error
        );
    }
}

fn print_status(statuses: &[ServerStatus]) {
    if statuses.is_empty() {
        eprintln!("No servers running.");
        return;
    }
    let now = Utc::now();
    for status in statuses {
        let uptime = (now - status.started_at).num_seconds().max(0);
        let pid = status
            .pid
            .map_or_else(|| "-".to_string(), |pid| pid.to_string());
        let identity = match (&status.server_info.name, &status.server_info.version) {
            (Some(name), Some(version)) => format!("{name} {version}"),
            (Some(name), None) => name.clone(),
            _ => "unknown".to_string(),
        };
        println!(
            "{}  {}  pid {}  {} tools (v{})  {} pending  {} bytes sent  up {}s  [{}]",
            status.name,
            if status.alive { "alive" } else { "dead" },
            pid,
            status.tool_count,
            status.catalog_version.unwrap_or(0),
            status.pending_requests,
            status.bytes_written,
            uptime,
            identity
        );
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
