//! End-to-end tests: several nodes on one loopback mesh.
//!
//! All nodes share a [`ManualClock`] so directory ages and publish deadlines
//! are deterministic. `tick()` is used as a barrier: it returns after the
//! node has handled every frame already queued for it.

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use vendor_node::{
    errno, LoopbackMesh, ManualClock, NodeBuilder, NodeConfig, Reply, VendorError, VendorNode,
};
use vendor_protocol::{
    GetKind, GetRequest, HostCommand, HostResponse, MeshAddress, MessageContext, NodeRecord,
    SerialNumber, VendorMessage, URC_NODE_DETAILS,
};

const SN_A: SerialNumber = SerialNumber(0x0000_00A1_0001);
const SN_B: SerialNumber = SerialNumber(0x0000_00B2_0002);

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    mesh: LoopbackMesh,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        Harness {
            mesh: LoopbackMesh::new(),
            clock: Arc::new(ManualClock::new(Duration::ZERO)),
        }
    }

    fn config(name: &str, address: u16, serial: SerialNumber) -> NodeConfig {
        NodeConfig {
            serial_number: Some(serial),
            publish_jitter_secs: 0,
            request_timeout_ms: 2000,
            rng_seed: Some(u64::from(address)),
            ..NodeConfig::new(name, address)
        }
    }

    fn builder(&self, config: NodeConfig) -> NodeBuilder {
        VendorNode::builder(config)
            .clock(self.clock.clone())
            .on_set(|_, payload, rsp| {
                rsp.extend_from_slice(payload)?;
                Ok(Reply::Now)
            })
            .on_get(|incoming, request, rsp| {
                match request.kind {
                    GetKind::Status => rsp.extend_from_slice(b"status-ok")?,
                    GetKind::NodeDetails => rsp.put_record(incoming.local)?,
                    GetKind::MeterData => {
                        rsp.extend_from_slice(&incoming.local.serial_number.to_device_sn())?
                    }
                }
                Ok(Reply::Now)
            })
    }

    fn start_with(&self, builder: NodeBuilder, config_address: MeshAddress) -> VendorNode {
        let (port, inbox) = self.mesh.attach(config_address, MeshAddress(0xC000));
        builder.start(port, inbox).unwrap()
    }

    fn start(&self, name: &str, address: u16, serial: SerialNumber) -> VendorNode {
        let node = self.start_with(
            self.builder(Self::config(name, address, serial)),
            MeshAddress(address),
        );
        // The first announcement runs before the runtime answers a command.
        node.tick().unwrap();
        node
    }
}

fn to(address: u16) -> MessageContext {
    MessageContext::to(address)
}

// ============================================================================
// Node Details and Directory
// ============================================================================

#[test]
fn test_node_details_exchange_populates_directory() {
    let h = Harness::new();
    let a = h.start("a", 1, SN_A);
    let b = h.start("b", 2, SN_B);

    // B announced after A attached, so A already knows B.
    a.tick().unwrap();
    assert_eq!(a.lookup(SN_B), MeshAddress(2));

    // A announced before B attached; B learns A by asking.
    assert_eq!(b.lookup(SN_A), MeshAddress::UNASSIGNED);
    let reply = b.client().get(GetKind::NodeDetails, Some(&to(1))).unwrap();
    assert_eq!(reply.source, MeshAddress(1));
    assert_eq!(reply.node_record().unwrap(), NodeRecord::new(SN_A, 1u16, 0, 0));
    assert_eq!(b.lookup(SN_A), MeshAddress(1));
}

#[test]
fn test_lookup_right_after_node_details_get() {
    let h = Harness::new();
    let _a = h.start("a", 1, SN_A);
    let b = h.start("b", 2, SN_B);

    for _ in 0..200 {
        b.directory().lock().clear();
        b.client().get(GetKind::NodeDetails, Some(&to(1))).unwrap();
        assert_eq!(b.lookup(SN_A), MeshAddress(1));
    }
}

#[test]
fn test_stale_entry_purged_after_max_age() {
    let h = Harness::new();
    let a = h.start("a", 1, SN_A);
    let b = h.start("b", 2, SN_B);

    b.client().get(GetKind::NodeDetails, Some(&to(1))).unwrap();
    assert_eq!(b.lookup(SN_A), MeshAddress(1));

    a.shutdown().unwrap();

    // Exactly max_age old is kept.
    h.clock.set(Duration::from_secs(3600));
    b.tick().unwrap();
    assert_eq!(b.lookup(SN_A), MeshAddress(1));

    // Next cycle, one interval later, sees it stale.
    h.clock.set(Duration::from_secs(7200));
    b.tick().unwrap();
    assert_eq!(b.lookup(SN_A), MeshAddress::UNASSIGNED);
}

#[test]
fn test_periodic_announcement_refreshes_entry() {
    let h = Harness::new();
    let a = h.start("a", 1, SN_A);
    let b = h.start("b", 2, SN_B);
    a.tick().unwrap();
    assert_eq!(a.directory().lock().get(SN_B).unwrap().last_seen, Duration::ZERO);

    h.clock.set(Duration::from_secs(3600));
    b.tick().unwrap();
    a.tick().unwrap();
    assert_eq!(
        a.directory().lock().get(SN_B).unwrap().last_seen,
        Duration::from_secs(3600)
    );
}

#[test]
fn test_full_directory_evicts_oldest() {
    let h = Harness::new();
    let mut config = Harness::config("x", 1, SerialNumber(0x10));
    config.directory_capacity = 2;
    let x = h.start_with(h.builder(config), MeshAddress(1));
    x.tick().unwrap();

    let peers: Vec<VendorNode> = (2..=4u16)
        .map(|addr| h.start(&format!("p{}", addr), addr, SerialNumber(u64::from(addr) * 0x100)))
        .collect();
    // Start-up announcements: p4 replaced p2 at t=0.
    x.tick().unwrap();

    for (i, peer) in peers.iter().enumerate() {
        h.clock.set(Duration::from_secs(10 * (i as u64 + 1)));
        peer.publish_now().unwrap();
        x.tick().unwrap();
    }

    let directory = x.directory().lock();
    assert_eq!(directory.len(), 2);
    assert_eq!(directory.lookup(SerialNumber(0x200)), MeshAddress::UNASSIGNED);
    assert_eq!(directory.lookup(SerialNumber(0x300)), MeshAddress(3));
    assert_eq!(directory.lookup(SerialNumber(0x400)), MeshAddress(4));
}

#[test]
fn test_unconfigured_serial_not_announced() {
    let h = Harness::new();
    let a = h.start("a", 1, SN_A);
    let b = h.start("b", 2, SerialNumber::EMPTY);

    assert!(matches!(b.publish_now(), Err(VendorError::NotReady(_))));
    a.tick().unwrap();
    assert!(a.directory().lock().is_empty());

    b.settings().save_serial(SN_B).unwrap();
    b.publish_now().unwrap();
    a.tick().unwrap();
    assert_eq!(a.lookup(SN_B), MeshAddress(2));
}

// ============================================================================
// Set / Get
// ============================================================================

#[test]
fn test_set_round_trip() {
    let h = Harness::new();
    let _a = h.start("a", 1, SN_A);
    let b = h.start("b", 2, SN_B);

    let reply = b.client().set(b"hello mesh", Some(&to(1))).unwrap();
    assert_eq!(reply.kind, GetKind::Status);
    assert_eq!(reply.source, MeshAddress(1));
    assert_eq!(reply.payload, b"hello mesh");
}

#[test]
fn test_set_unacknowledged_reaches_handler() {
    let h = Harness::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let a = h.start_with(
        h.builder(Harness::config("a", 1, SN_A)).on_set(move |incoming, payload, _| {
            sink.lock().push((incoming.acknowledged(), payload.to_vec()));
            Ok(Reply::Now)
        }),
        MeshAddress(1),
    );
    let b = h.start("b", 2, SN_B);

    b.client().set_unacknowledged(&[1, 2, 3], Some(&to(1))).unwrap();
    a.tick().unwrap();

    assert_eq!(*seen.lock(), vec![(false, vec![1, 2, 3])]);
    assert!(!b.client().has_pending());
}

#[test]
fn test_get_status_with_length_hint() {
    let h = Harness::new();
    let _a = h.start("a", 1, SN_A);
    let b = h.start("b", 2, SN_B);

    let full = b.client().get(GetKind::Status, Some(&to(1))).unwrap();
    assert_eq!(full.payload, b"status-ok");

    let short = b
        .client()
        .get_request(GetRequest::new(GetKind::Status).with_length(6), Some(&to(1)))
        .unwrap();
    assert_eq!(short.payload, b"status");

    let meter = b.client().get(GetKind::MeterData, Some(&to(1))).unwrap();
    assert_eq!(meter.kind, GetKind::MeterData);
    assert_eq!(meter.payload, SN_A.to_device_sn().to_vec());
}

#[test]
fn test_group_request_accepts_any_responder() {
    let h = Harness::new();
    let _a = h.start("a", 1, SN_A);
    let b = h.start("b", 2, SN_B);

    let reply = b.client().get(GetKind::NodeDetails, None).unwrap();
    assert_eq!(reply.source, MeshAddress(1));
}

#[test]
fn test_request_times_out_without_responder() {
    let h = Harness::new();
    let mut config = Harness::config("b", 2, SN_B);
    config.request_timeout_ms = 100;
    let b = h.start_with(h.builder(config), MeshAddress(2));
    let _a = h.start("a", 1, SN_A);

    let err = b.client().get(GetKind::Status, Some(&to(0x0042))).unwrap_err();
    assert!(matches!(err, VendorError::Timeout(_)));
    assert_eq!(err.code(), -errno::ETIMEDOUT);
    assert!(!b.client().has_pending());

    // The correlation slot is free again.
    let reply = b.client().get(GetKind::Status, Some(&to(1))).unwrap();
    assert_eq!(reply.payload, b"status-ok");
}

#[test]
fn test_oversized_set_rejected_before_sending() {
    let h = Harness::new();
    let b = h.start("b", 2, SN_B);
    let err = b.client().set(&[0u8; 378], Some(&to(1))).unwrap_err();
    assert!(matches!(err, VendorError::Size { max: 377, actual: 378 }));
}

#[test]
fn test_deferred_reply_through_status_sender() {
    let h = Harness::new();
    let (ctx_tx, ctx_rx) = crossbeam_channel::unbounded();

    let a = h.start_with(
        h.builder(Harness::config("a", 1, SN_A)).on_set(move |incoming, _, _| {
            let _ = ctx_tx.send(*incoming.ctx);
            Ok(Reply::Later)
        }),
        MeshAddress(1),
    );
    let b = h.start("b", 2, SN_B);

    let client = Arc::clone(b.client());
    let waiter = thread::spawn(move || client.set(b"later", Some(&to(1))));

    let ctx: MessageContext = recv(&ctx_rx);
    assert_eq!(ctx.addr, MeshAddress(2));
    a.status_sender()
        .send(Some(&ctx), &VendorMessage::Status(b"done".to_vec()))
        .unwrap();

    let reply = waiter.join().unwrap().unwrap();
    assert_eq!(reply.payload, b"done");
}

fn recv<T>(rx: &Receiver<T>) -> T {
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

// ============================================================================
// Host Bridge
// ============================================================================

#[test]
fn test_host_bridge_queries_peer_by_serial() {
    let h = Harness::new();
    let a = h.start("a", 1, SN_A);
    let b = h.start("b", 2, SN_B);
    a.publish_now().unwrap();
    b.tick().unwrap();

    let bridge = b.spawn_host_bridge();
    let timeout = Duration::from_secs(5);

    let response = bridge.request(&HostCommand::GetNodeDetails(SN_A), timeout).unwrap();
    assert_eq!(response, HostResponse::NodeDetails(NodeRecord::new(SN_A, 1u16, 0, 0)));

    let response = bridge.request(&HostCommand::GetMeterData(SN_A), timeout).unwrap();
    assert_eq!(response, HostResponse::MeterData(SN_A.to_device_sn().to_vec()));

    let response = bridge
        .request(&HostCommand::GetMeterData(SerialNumber(0xDEAD)), timeout)
        .unwrap();
    assert_eq!(response, HostResponse::Error { code: -errno::ENOENT });

    bridge.shutdown();
}

#[test]
fn test_host_bridge_reports_unsolicited_details() {
    let h = Harness::new();
    let a = h.start("a", 1, SN_A);
    let b = h.start("b", 2, SN_B);
    let bridge = b.spawn_host_bridge();

    a.publish_now().unwrap();
    b.tick().unwrap();

    let reports = bridge.take_reports();
    assert_eq!(
        reports,
        vec![HostResponse::Urc {
            code: URC_NODE_DETAILS,
            data: NodeRecord::new(SN_A, 1u16, 0, 0).encode().to_vec(),
        }]
    );
}

#[test]
fn test_host_bridge_sets_serial_and_node_announces_it() {
    let h = Harness::new();
    let a = h.start("a", 1, SN_A);
    let b = h.start("b", 2, SerialNumber::EMPTY);
    let bridge = b.spawn_host_bridge();

    let response = bridge
        .request(&HostCommand::SetDeviceSn(SN_B), Duration::from_secs(5))
        .unwrap();
    assert_eq!(response, HostResponse::DeviceSnSet);

    assert_eq!(b.tick().unwrap().local.serial_number, SN_B);
    b.publish_now().unwrap();
    a.tick().unwrap();
    assert_eq!(a.lookup(SN_B), MeshAddress(2));
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_serial_persists_across_restart() {
    let path = std::env::temp_dir().join(format!("vendor-node-e2e-{}.json", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let h = Harness::new();
    let mut config = Harness::config("a", 1, SN_A);
    config.settings_path = Some(path.clone());
    let a = h.start_with(h.builder(config.clone()), MeshAddress(1));
    assert_eq!(a.tick().unwrap().local.serial_number, SN_A);
    a.shutdown().unwrap();

    config.serial_number = None;
    let a = h.start_with(h.builder(config), MeshAddress(1));
    assert_eq!(a.tick().unwrap().local.serial_number, SN_A);
    a.shutdown().unwrap();

    let _ = std::fs::remove_file(&path);
}
