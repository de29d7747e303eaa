//! Tree Mesh Command-Line Interface
//!
//! This CLI provides tools for:
//! - Simulating whole mesh networks without hardware
//! - Inspecting the protocol constants a deployment must agree on
//!
//! The simulation builds a line topology (master at one end) on the
//! in-process channel and drives every node with a shared, explicitly
//! stepped clock, so runs are reproducible apart from traffic sampling.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::info;
use treemesh_core::frame::{FRAME_LEN, HEADER_LEN, PAYLOAD_LEN};
use treemesh_core::routing::MAX_NEAR_NODE;
use treemesh_core::sim::{spawn_node, SimChannel};
use treemesh_core::{resolve_address, MeshConfig, NodeAddress};

#[derive(Parser)]
#[command(name = "treemesh")]
#[command(author, version, about = "Tree mesh network simulator CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a multi-node mesh simulation on a line topology
    Simulate {
        /// Number of nodes including the master
        #[arg(short, long, default_value = "3")]
        nodes: usize,

        /// Number of maintenance cycles to run
        #[arg(short, long, default_value = "100")]
        ticks: u64,

        /// Simulated milliseconds between cycles
        #[arg(long, default_value = "100")]
        tick_ms: u64,

        /// Per-node chance of originating data each cycle
        #[arg(long, default_value = "0.1")]
        rate: f64,

        /// Emit the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the protocol constants every node on a network must share
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Simulate {
            nodes,
            ticks,
            tick_ms,
            rate,
            json,
        } => cmd_simulate(nodes, ticks, tick_ms, rate, json),
        Commands::Info => cmd_info(),
    }
}

fn cmd_simulate(nodes: usize, ticks: u64, tick_ms: u64, rate: f64, json: bool) -> Result<()> {
    if nodes < 2 {
        bail!("need at least a master and one node, got {nodes}");
    }
    if !(0.0..=1.0).contains(&rate) {
        bail!("rate must be within 0.0..=1.0, got {rate}");
    }

    let channel = SimChannel::new();
    let start = Instant::now();

    // Line topology: 0x0000 (master) <-> 0x0001 <-> 0x0002 <-> ...
    for n in 1..nodes as u16 {
        channel.set_link(NodeAddress::new(n - 1), NodeAddress::new(n));
    }
    let mut mesh: Vec<_> = (0..nodes as u16)
        .map(|n| spawn_node(&channel, n, start))
        .collect();
    info!(nodes, ticks, tick_ms, "simulation starting");

    let mut rng = rand::thread_rng();
    let mut originated = 0u64;
    for tick in 0..ticks {
        let now = start + Duration::from_millis(tick * tick_ms);
        for (node, _sink) in mesh.iter_mut() {
            node.poll(now);
            if !node.identity().ip.is_master() && node.is_joined() && rng.gen_bool(rate) {
                if node.send_data(&tick.to_le_bytes()).is_ok() {
                    originated += 1;
                }
            }
        }
    }

    let (master, master_sink) = &mesh[0];
    let delivered = master_sink.delivered().len() as u64;
    if json {
        let report = serde_json::json!({
            "nodes": nodes,
            "ticks": ticks,
            "tick_ms": tick_ms,
            "originated": originated,
            "delivered": delivered,
            "master_stats": master.stats(),
            "members": mesh
                .iter()
                .map(|(node, _)| {
                    serde_json::json!({
                        "address": node.identity().ip,
                        "weight": node.identity().weight,
                        "state": node.state().to_string(),
                        "joined": node.is_joined(),
                        "stats": node.stats(),
                    })
                })
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Simulation: {nodes} nodes, {ticks} cycles at {tick_ms} ms");
    println!();
    println!("{:<10} {:>6} {:>14} {:>8} {:>10} {:>10}", "address", "weight", "state", "tx", "forwarded", "delivered");
    for (node, _) in &mesh {
        let id = node.identity();
        let stats = node.stats();
        println!(
            "{:<10} {:>6} {:>14} {:>8} {:>10} {:>10}",
            id.ip.to_string(),
            id.weight,
            node.state().to_string(),
            stats.frames_tx,
            stats.frames_forwarded,
            stats.data_delivered,
        );
    }
    println!();
    println!("Originated {originated} payloads, master delivered {delivered}");
    if originated > 0 {
        println!("Delivery rate: {:.1}%", delivered as f64 / originated as f64 * 100.0);
    }
    Ok(())
}

fn cmd_info() -> Result<()> {
    let defaults = MeshConfig::default();
    println!("Frame layout");
    println!("  frame size:       {FRAME_LEN} bytes");
    println!("  header size:      {HEADER_LEN} bytes");
    println!("  inline payload:   {PAYLOAD_LEN} bytes");
    println!();
    println!("Reserved addresses");
    println!("  master:           {} -> {}", NodeAddress::MASTER, resolve_address(NodeAddress::MASTER));
    println!("  broadcast:        {} -> {}", NodeAddress::BROADCAST, resolve_address(NodeAddress::BROADCAST));
    println!();
    println!("Message type tags: J(oin) W(elcome) D(ata) F(orward) U(weight update)");
    println!();
    println!("Defaults");
    println!("  channel:          {}", defaults.channel);
    println!("  neighbor slots:   {MAX_NEAR_NODE}");
    println!("  queue depths:     {} recv / {} send", defaults.receive_depth, defaults.send_depth);
    println!("  retry budget:     {}", defaults.retry_budget);
    println!("  welcome wait:     {} ms", defaults.welcome_wait.as_millis());
    println!("  join refresh:     {} s", defaults.join_refresh.as_secs());
    Ok(())
}
