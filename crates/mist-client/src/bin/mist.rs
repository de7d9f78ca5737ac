//! `mist` - command line UI for the MIST broker

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mist_client::{AgentRunner, BrokerClient, EchoAgent};
use mist_config::MistConfig;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mist")]
#[command(about = "mist - talk to the MIST broker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $XDG_CONFIG_HOME/mist/config.toml)
    #[arg(short = 'C', long, global = true)]
    config: Option<PathBuf>,

    /// Broker socket, overriding config and MIST_SOCKET
    #[arg(short, long, global = true)]
    socket: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered agents
    Catalog,

    /// Send a command to an agent
    Send {
        agent: String,

        /// Command text
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,

        /// Print streamed chunks as they arrive
        #[arg(long)]
        stream: bool,
    },

    /// Call a broker service
    Service {
        service: String,
        action: String,

        /// Params as a JSON object
        params: Option<String>,
    },

    /// Run the demo echo agent until interrupted
    EchoAgent,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    let mut config = MistConfig::load(cli.config.as_deref()).context("failed to load config")?;
    if let Some(socket) = cli.socket {
        config.socket_path = Some(socket);
    }
    let socket = config.paths().socket_path();

    match cli.command {
        Commands::EchoAgent => run_echo_agent(&socket).await,
        command => {
            let client = BrokerClient::connect(&config)
                .await
                .with_context(|| format!("failed to connect to {}", socket.display()))?;
            let result = run_client_command(&client, command).await;
            client.close().await;
            result
        }
    }
}

async fn run_echo_agent(socket: &Path) -> Result<()> {
    let running = AgentRunner::new(EchoAgent, socket)
        .start()
        .await
        .with_context(|| format!("failed to register with {}", socket.display()))?;
    println!("registered as {}", running.agent_id());

    let interrupted = tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        _ = running.wait_closed() => false,
    };
    if interrupted {
        running.stop().await;
    } else {
        println!("broker closed the connection");
    }
    Ok(())
}

async fn run_client_command(client: &BrokerClient, command: Commands) -> Result<()> {
    match command {
        Commands::Catalog => {
            let agents = client.request_catalog().await?;
            if agents.is_empty() {
                println!("no agents registered");
            }
            for agent in agents {
                println!("{}\t{}\t{}", agent.agent_id, agent.name, agent.description);
                for cmd in &agent.commands {
                    println!("    {:<12} {}", cmd.name, cmd.description);
                }
            }
        }
        Commands::Send {
            agent,
            text,
            stream,
        } => {
            let text = text.join(" ");
            if stream {
                let mut replies = client.send_command_stream(&agent, &text).await?;
                while let Some(part) = replies.next().await {
                    println!("{}", part?);
                }
            } else {
                println!("{}", client.send_command(&agent, &text).await?);
            }
        }
        Commands::Service {
            service,
            action,
            params,
        } => {
            let params = params
                .map(|p| serde_json::from_str(&p))
                .transpose()
                .context("params must be valid JSON")?;
            let result = client.request_service(&service, &action, params).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::EchoAgent => run_echo_agent(client.transport().path()).await?,
    }
    Ok(())
}
