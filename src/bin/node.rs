//! CLI entry point for one replicated key-value node with a line console.
//!
//! The binary starts a node and reads commands from stdin. PUT and GET run
//! through a causal session, so a GET typed after a PUT always reflects that
//! PUT no matter which member answers it.
//!
//! # Example usage
//!
//! Start a 3-node cluster:
//! ```bash
//! # Terminal 1 (node 1)
//! cargo run --bin node -- \
//!   --id 1 --listen 127.0.0.1:7101 \
//!   --peer 1=127.0.0.1:7101 --peer 2=127.0.0.1:7102 --peer 3=127.0.0.1:7103
//!
//! # Terminal 2 (node 2)
//! cargo run --bin node -- \
//!   --id 2 --listen 127.0.0.1:7102 \
//!   --peer 1=127.0.0.1:7101 --peer 2=127.0.0.1:7102 --peer 3=127.0.0.1:7103
//!
//! # Terminal 3 (node 3)
//! cargo run --bin node -- \
//!   --id 3 --listen 127.0.0.1:7103 \
//!   --peer 1=127.0.0.1:7101 --peer 2=127.0.0.1:7102 --peer 3=127.0.0.1:7103
//! ```
//!
//! Then, in any terminal: `PUT color teal all`, `GET color majority leader`,
//! `STATUS`, `CAMPAIGN`, `EXIT`.

use std::collections::HashMap;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::select;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use quorum_kv::config::{NodeConfig, TimingConfig};
use quorum_kv::protocol::{self, ConsoleCommand};
use quorum_kv::runtime::{spawn_node, NodeHandle, NodeStatus};
use quorum_kv::session::CausalSession;
use quorum_kv::types::NodeId;

const HELP: &str = "\
Commands (case-insensitive):
  PUT <key> <value> [one|majority|all]     (alias: p)  write, default majority
  GET <key> [local|majority] [leader|any]  (alias: g)  read, default local any
  STATUS                                   (alias: s)  node and member state
  CAMPAIGN                                 (alias: c)  force an election
  HELP                                     (alias: h)  show this message
  EXIT                                     (alias: e)  shut down node";

/// Command-line arguments for one node.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run a replicated key-value node")]
struct Args {
    /// Numeric node ID (must match one entry in --peer)
    #[arg(long)]
    id: u64,

    /// Address this node should listen on for replication traffic, e.g. 127.0.0.1:7101
    #[arg(long, value_hint = ValueHint::Hostname)]
    listen: String,

    /// Comma-separated peer map: id=addr,id=addr,... (must include self)
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    peer: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let peers = parse_peers(&args.peer)?;

    // The node's own entry doubles as a sanity check on the listen address.
    if peers.get(&args.id).map(String::as_str) != Some(args.listen.as_str()) {
        return Err(anyhow::anyhow!(
            "self id {} must map to listen addr {} via --peer entries",
            args.id,
            args.listen
        ));
    }

    let handle = spawn_node(NodeConfig {
        id: args.id,
        listen_addr: args.listen.clone(),
        peers,
        timing: TimingConfig::default(),
    })
    .await?;

    write_stdout(&format!(
        "node {} ready, type HELP (or h) for commands",
        args.id
    ))
    .await?;
    run_console(&handle).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run_console(handle: &NodeHandle) -> Result<()> {
    let mut session = CausalSession::new();
    let mut stdin = BufReader::new(io::stdin());
    let mut input = String::new();

    loop {
        input.clear();
        select! {
            bytes_read = stdin.read_line(&mut input) => {
                if !handle_console_line(bytes_read, &input, handle, &mut session).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }

    if handle.shutdown().await.is_err() {
        warn!("worker already stopped");
    }
    Ok(())
}

async fn handle_console_line(
    bytes_read: io::Result<usize>,
    input: &str,
    handle: &NodeHandle,
    session: &mut CausalSession,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let line = input.trim();
    if line.is_empty() {
        return Ok(true);
    }

    let command = match protocol::parse(line) {
        Ok(command) => command,
        Err(err) => {
            write_stderr(&format!("!!! {err}")).await?;
            return Ok(true);
        }
    };

    match command {
        ConsoleCommand::Put {
            key,
            value,
            concern,
        } => match session.write(handle, key.clone(), value.clone(), concern).await {
            Ok(ack) => {
                write_stdout(&format!(
                    "OK {key} = {value} (index {}, token {})",
                    ack.index, ack.token
                ))
                .await?
            }
            Err(err) => write_stderr(&format!("!!! {err}")).await?,
        },
        ConsoleCommand::Get {
            key,
            concern,
            preference,
        } => match session.read(handle, key.clone(), concern, preference).await {
            Ok(outcome) => match outcome.value {
                Some(value) => {
                    write_stdout(&format!("{key} = {value} (token {})", outcome.token)).await?
                }
                None => {
                    write_stdout(&format!("{key} not found (token {})", outcome.token)).await?
                }
            },
            Err(err) => write_stderr(&format!("!!! {err}")).await?,
        },
        ConsoleCommand::Status => match handle.status().await {
            Ok(status) => print_status(&status).await?,
            Err(err) => write_stderr(&format!("!!! {err}")).await?,
        },
        ConsoleCommand::Campaign => match handle.campaign().await {
            Ok(()) => write_stdout("campaigning for leadership").await?,
            Err(err) => write_stderr(&format!("!!! {err}")).await?,
        },
        ConsoleCommand::Help => write_stdout(HELP).await?,
        ConsoleCommand::Exit => {
            write_stdout("shutting down...").await?;
            return Ok(false);
        }
    }
    Ok(true)
}

async fn print_status(status: &NodeStatus) -> io::Result<()> {
    let leader = status
        .leader
        .map_or_else(|| "none".to_string(), |id| id.to_string());
    write_stdout(&format!(
        "node {} | term {} | role {} | leader {} | commit {} | last {}",
        status.id, status.term, status.role, leader, status.commit_index, status.last_index
    ))
    .await?;
    for member in &status.members {
        let liveness = if member.online { "online" } else { "offline" };
        write_stdout(&format!(
            "  member {} | {} | term {} | {}",
            member.id, member.role, member.term, liveness
        ))
        .await?;
    }
    if status.store.is_empty() {
        write_stdout("  store: empty").await?;
    } else {
        for (key, value) in &status.store {
            write_stdout(&format!("  {key} = {value}")).await?;
        }
    }
    Ok(())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

/// Parses peer entries from the command line into a map.
fn parse_peers(entries: &[String]) -> Result<HashMap<NodeId, String>> {
    let mut peers = HashMap::new();
    for entry in entries {
        let Some((id_str, addr)) = entry.split_once('=') else {
            return Err(anyhow::anyhow!(
                "invalid peer entry '{entry}', expected id=addr"
            ));
        };
        let id: NodeId = id_str
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        peers.insert(id, addr.to_string());
    }
    if peers.is_empty() {
        return Err(anyhow::anyhow!(
            "at least one --peer entry is required (include self)"
        ));
    }
    Ok(peers)
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
