//! # GraphSync Agent
//!
//! Joins a room and exposes an in-memory graph through line commands on
//! stdin:
//!
//! - `add <x> <y> [label]`
//! - `move <id> <x> <y>`
//! - `link <source> <target>`
//! - `show`
//! - `quit`

use anyhow::{bail, Context, Result};
use graphsync_agent::{AgentConfig, MqttTransport, Session, SessionHandle};
use graphsync_core::{GraphModel, NodeId, Position};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting GraphSync agent"
    );

    let config = AgentConfig::from_env()?;
    let replica_id = config.replica_id.unwrap_or_else(Uuid::new_v4);

    let channels = MqttTransport::connect(&config.transport, replica_id)
        .context("Failed to start transport")?;
    let (handle, session) =
        Session::new(GraphModel::new(), replica_id).spawn(channels.events, channels.outbound);

    tracing::info!(%replica_id, room = %config.transport.room, "Agent running");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                match run_command(&handle, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => eprintln!("error: {err:#}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    drop(handle);
    session.await.context("Session task failed")?;
    tracing::info!("Agent stopped");
    Ok(())
}

/// Execute one command line. Returns `false` on `quit`.
async fn run_command(handle: &SessionHandle, line: &str) -> Result<bool> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [] => {}
        ["add", x, y, label @ ..] => {
            let label = (!label.is_empty()).then(|| label.join(" "));
            let id = handle.add_node(parse_position(x, y)?, label).await?;
            println!("{id}");
        }
        ["move", id, x, y] => {
            handle.move_node(parse_id(id)?, parse_position(x, y)?).await?;
        }
        ["link", source, target] => {
            let edge = handle.link(parse_id(source)?, parse_id(target)?).await?;
            println!("{}", edge.0);
        }
        ["show"] => {
            let view = handle.view().await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        ["quit" | "exit"] => return Ok(false),
        [command, ..] => bail!("unknown command '{command}' (add, move, link, show, quit)"),
    }
    Ok(true)
}

fn parse_id(input: &str) -> Result<NodeId> {
    NodeId::from_key(input).with_context(|| format!("invalid node id '{input}'"))
}

fn parse_position(x: &str, y: &str) -> Result<Position> {
    let x: f64 = x.parse().with_context(|| format!("invalid x coordinate '{x}'"))?;
    let y: f64 = y.parse().with_context(|| format!("invalid y coordinate '{y}'"))?;
    Ok(Position::new(x, y))
}
