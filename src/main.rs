// mesh - demo binary running a small mesh on the loopback fabric
//
// Spins up N in-process nodes, ticks them every 100 ms and exposes each
// node's terminal on stdin as `<nodeId> <command...>`, e.g. `1 status` or
// `2 ping 1`. Watch the cluster converge with RUST_LOG=blemesh=debug.

use blemesh::ble::{BleGapAddr, loopback::LoopbackFabric};
use blemesh::modules::CommandResult;
use blemesh::proto::{NetworkId, NodeId};
use blemesh::storage::{MemoryRecordStore, NodeIdentity};
use blemesh::{BoardConfig, MeshConfig, MeshNode};
use clap::Parser;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mesh", about = "Run a simulated BLE mesh on this machine")]
struct Args {
    /// Number of nodes to simulate
    #[arg(short, long, default_value_t = 3)]
    nodes: u16,

    /// Network id shared by all nodes
    #[arg(long, default_value_t = 10)]
    network_id: u16,

    /// Seed for the jitter PRNG
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Timer tick in milliseconds
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,
}

fn build_nodes(args: &Args, fabric: &LoopbackFabric) -> Vec<MeshNode> {
    (1..=args.nodes)
        .map(|id| {
            let addr = BleGapAddr::new([id as u8, 0, 0, 0, 0, 1]);
            let radio = fabric.endpoint(addr);
            let board = BoardConfig {
                identity: NodeIdentity::new(NodeId(id), NetworkId(args.network_id)),
                mesh: MeshConfig::default(),
                seed: args.seed.wrapping_add(id as u64),
            };
            MeshNode::init(board, Box::new(MemoryRecordStore::new()), Box::new(radio))
                .expect("node init failed")
        })
        .collect()
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let fabric = LoopbackFabric::new();
    let mut nodes = build_nodes(&args, &fabric);
    info!(count = nodes.len(), "mesh nodes started");

    let mut ticker = tokio::time::interval(Duration::from_millis(args.tick_ms));
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                fabric.tick(1);
                for (index, node) in nodes.iter_mut().enumerate() {
                    while let Some(event) = fabric.take_event(index) {
                        node.ble_event(event);
                    }
                    node.timer_event(1);
                    if let Some(reason) = node.pending_reboot() {
                        error!(node = index + 1, ?reason, "node hit a fatal error");
                    }
                }
            }
            line = stdin.next_line() => {
                let Ok(Some(line)) = line else { break };
                let parts: Vec<&str> = line.split_whitespace().collect();
                let Some((first, rest)) = parts.split_first() else { continue };
                let Ok(target) = first.parse::<usize>() else {
                    info!("usage: <nodeId> <command...>");
                    continue;
                };
                match nodes.get_mut(target.saturating_sub(1)) {
                    Some(node) if target >= 1 => {
                        let result = node.terminal_command(rest);
                        if result != CommandResult::Success {
                            info!(?result, "command finished");
                        }
                    }
                    _ => info!("no such node {}", target),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    info!("shutting down");
}
