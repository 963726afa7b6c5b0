//! `vndnode`: runs a set of vendor model nodes on an in-process mesh.
//!
//! Every node announces itself, then the first node exercises the client
//! against its peers and a host bridge, and the directories are printed as
//! JSON.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vendor_node::{
    LoopbackMesh, NetworkConfig, NodeConfig, Reply, VendorError, VendorNode,
};
use vendor_protocol::{GetKind, GetRequest, HostCommand, MessageContext, SerialNumber};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "vndnode", about = "Run vendor model nodes on a loopback mesh")]
struct Args {
    /// Network configuration (YAML). Generated when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of generated nodes.
    #[arg(short, long, default_value_t = 3)]
    nodes: u16,

    /// Log filter, e.g. `info` or `vendor_node=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Base seed for the publish start-up delay.
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn generated_network(nodes: u16, seed: u64) -> NetworkConfig {
    let nodes = (1..=nodes)
        .map(|i| NodeConfig {
            serial_number: Some(SerialNumber(0x1000 + u64::from(i))),
            capacity: i as u8,
            quality: 200,
            publish_jitter_secs: 0,
            rng_seed: Some(seed + u64::from(i)),
            ..NodeConfig::new(format!("node{}", i), i)
        })
        .collect();
    NetworkConfig { nodes }
}

fn start_node(mesh: &LoopbackMesh, config: NodeConfig) -> Result<VendorNode, VendorError> {
    let (port, inbox) = mesh.attach(config.address, config.publish_address);
    let mut reading: u32 = 0;

    VendorNode::builder(config)
        .on_set(|_, payload, rsp| {
            rsp.extend_from_slice(payload)?;
            Ok(Reply::Now)
        })
        .on_get(move |incoming, request, rsp| {
            match request.kind {
                GetKind::Status => {
                    rsp.push(incoming.local.capacity)?;
                    rsp.push(incoming.local.quality)?;
                }
                GetKind::NodeDetails => rsp.put_record(incoming.local)?,
                GetKind::MeterData => {
                    reading = reading.wrapping_add(1);
                    rsp.extend_from_slice(&incoming.local.serial_number.to_device_sn())?;
                    rsp.extend_from_slice(&reading.to_be_bytes())?;
                }
            }
            Ok(Reply::Now)
        })
        .start(port, inbox)
}

fn run(args: Args) -> Result<(), VendorError> {
    let network = match &args.config {
        Some(path) => NetworkConfig::from_yaml_file(path)?,
        None => generated_network(args.nodes, args.seed),
    };
    network.validate()?;
    if network.nodes.len() < 2 {
        return Err(VendorError::invalid_argument("need at least two nodes"));
    }

    let mesh = LoopbackMesh::new();
    let nodes = network
        .nodes
        .into_iter()
        .map(|config| start_node(&mesh, config))
        .collect::<Result<Vec<_>, _>>()?;
    info!("{} nodes attached to the mesh", mesh.len());

    // Nodes started earlier announced before their peers were attached.
    for node in &nodes {
        if let Err(e) = node.publish_now() {
            warn!("{} did not announce: {}", node.config().name, e);
        }
    }
    for node in &nodes {
        node.tick()?;
    }

    let first = &nodes[0];
    let peer = &nodes[1];
    let to_peer = MessageContext::to(peer.address());

    let details = first.client().get(GetKind::NodeDetails, None)?;
    info!("node details from {}: {:?}", details.source, details.node_record()?);

    let echoed = first.client().set(b"hello", Some(&to_peer))?;
    info!("set echoed {:?}", String::from_utf8_lossy(&echoed.payload));

    let status = first
        .client()
        .get_request(GetRequest::new(GetKind::Status).with_length(1), Some(&to_peer))?;
    info!("status from {}: {}", status.source, hex::encode(&status.payload));

    let bridge = first.spawn_host_bridge();
    for node in nodes.iter().skip(1) {
        let Some(serial) = node.config().serial_number else {
            continue;
        };
        let response = bridge.request(&HostCommand::GetMeterData(serial), Duration::from_secs(10))?;
        info!("host bridge meter data for {}: {:?}", serial, response);
    }
    for report in bridge.take_reports() {
        info!("host bridge report: {:?}", report);
    }
    bridge.shutdown();

    for node in &nodes {
        let directory = node.directory().lock();
        let entries: Vec<_> = directory.entries().collect();
        match serde_json::to_string_pretty(&entries) {
            Ok(json) => println!("{}:\n{}", node.config().name, json),
            Err(e) => error!("cannot serialize directory: {}", e),
        }
    }

    for node in nodes {
        node.shutdown()?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(e.code().unsigned_abs() as u8)
        }
    }
}
