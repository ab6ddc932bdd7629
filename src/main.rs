use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use a3s_mcp::{McpRuntime, RuntimeConfig, ServerState};

#[derive(Parser)]
#[command(
    name = "a3s-mcp",
    version,
    about = "Run and inspect Model Context Protocol servers"
)]
struct Cli {
    /// Path to the mcpServers config file
    #[arg(short, long, default_value = "mcp.json")]
    config: PathBuf,

    /// Log level when RUST_LOG is unset (defaults to the config's logLevel)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the config file without starting anything
    Validate,
    /// Connect every enabled server and list its tools
    Tools,
    /// Call one tool by its full name (mcp__<server>__<tool>)
    Call {
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(short, long)]
        args: Option<String>,
        /// Cancel the call after this many seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Connect one server and ping it
    Ping { server: String },
    /// Connect every enabled server and show its status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = RuntimeConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if matches!(cli.command, Commands::Validate) {
        println!(
            "{} {} ({} server(s))",
            "✓".green(),
            cli.config.display(),
            config.servers.len()
        );
        for (name, server) in &config.servers {
            let deps = if server.depends_on.is_empty() {
                String::new()
            } else {
                format!(" after {}", server.depends_on.join(", "))
            };
            println!(
                "  {} {} {}{}",
                name.cyan(),
                server.command,
                server.args.join(" "),
                deps.dimmed()
            );
        }
        return Ok(());
    }

    let runtime = McpRuntime::new(config);
    runtime.register_all().await?;
    let outcome = run(&runtime, cli.command).await;
    runtime.shutdown().await?;
    outcome
}

async fn run(runtime: &McpRuntime, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Validate => {}
        Commands::Tools => {
            if let Err(e) = runtime.connect_all().await {
                eprintln!("{} {e}", "[a3s-mcp]".yellow().bold());
            }
            for (name, tool) in runtime.all_tools().await {
                match tool.description {
                    Some(desc) => println!("{}  {}", name.cyan(), desc),
                    None => println!("{}", name.cyan()),
                }
            }
        }
        Commands::Call {
            tool,
            args,
            timeout,
        } => {
            let (server, _) = a3s_mcp::parse_tool_name(&tool)?;
            let arguments = args
                .map(|a| serde_json::from_str::<serde_json::Value>(&a))
                .transpose()
                .context("--args must be valid JSON")?;
            runtime.connect(&server).await?;
            let result = runtime
                .call_tool(&tool, arguments, timeout.map(Duration::from_secs))
                .await?;
            if result.is_error {
                anyhow::bail!("{} reported an error: {}", tool, result.to_text());
            }
            println!("{}", result.to_text());
        }
        Commands::Ping { server } => {
            runtime.connect(&server).await?;
            let client = runtime
                .client(&server)
                .await
                .with_context(|| format!("{server} is not connected"))?;
            let started = std::time::Instant::now();
            client.ping().await?;
            println!(
                "{} {} responded in {}ms",
                "✓".green(),
                server,
                started.elapsed().as_millis()
            );
        }
        Commands::Status => {
            if let Err(e) = runtime.connect_all().await {
                eprintln!("{} {e}", "[a3s-mcp]".yellow().bold());
            }
            for s in runtime.status().await {
                let state = match s.state {
                    ServerState::Running => s.state.label().green(),
                    ServerState::Starting | ServerState::Stopping => s.state.label().yellow(),
                    ServerState::Stopped => s.state.label().dimmed(),
                    ServerState::Crashed | ServerState::Error => s.state.label().red(),
                };
                let pid = s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
                println!(
                    "{:<20} {:<10} pid {:<8} tools {:<4} restarts {}",
                    s.name, state, pid, s.tool_count, s.restart_count
                );
                if let Some(err) = s.error {
                    println!("  {}", err.red());
                }
            }
        }
    }
    Ok(())
}
