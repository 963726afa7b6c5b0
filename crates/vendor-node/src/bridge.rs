//! Host bridge: executes host commands against the node and reports
//! unsolicited Status messages back to the host.
//!
//! The framing layer (UART, TCP, ...) hands complete host records to
//! [`HostBridge::process`] or to a [`HostBridgeHandle`] worker thread and
//! writes whatever comes back out of the handle's output queue.

use crate::client::{ReceivedStatus, SubscriptionId, VendorClient};
use crate::directory::NodeDirectory;
use crate::error::VendorError;
use crate::settings::Settings;
use crate::transport::MeshTransport;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vendor_protocol::{
    GetKind, HostCommand, HostResponse, MessageContext, NodeRecord, Opcode, SerialNumber,
    STATUS_BRIDGE_READY, STATUS_PROVISIONED, STATUS_SN_CONFIGURED, URC_NODE_DETAILS,
    URC_STATUS_RECEIVED,
};

// ============================================================================
// Command Execution
// ============================================================================

/// Executes host commands.
#[derive(Clone)]
pub struct HostBridge {
    client: Arc<VendorClient>,
    directory: Arc<Mutex<NodeDirectory>>,
    settings: Arc<Settings>,
    transport: Arc<dyn MeshTransport>,
}

impl HostBridge {
    /// Create a bridge over a node's components.
    pub fn new(
        client: Arc<VendorClient>,
        directory: Arc<Mutex<NodeDirectory>>,
        settings: Arc<Settings>,
        transport: Arc<dyn MeshTransport>,
    ) -> Self {
        HostBridge {
            client,
            directory,
            settings,
            transport,
        }
    }

    /// Handle one host record. Failures become [`HostResponse::Error`].
    pub fn process(&self, record: &[u8]) -> HostResponse {
        let result = HostCommand::decode(record)
            .map_err(VendorError::from)
            .and_then(|cmd| self.execute(cmd));

        match result {
            Ok(response) => response,
            Err(e) => {
                warn!("host command failed: {}", e);
                HostResponse::Error { code: e.code() }
            }
        }
    }

    /// Execute a decoded host command.
    ///
    /// `GetNodeDetails` and `GetMeterData` block until the peer answers or the
    /// client deadline passes.
    pub fn execute(&self, cmd: HostCommand) -> Result<HostResponse, VendorError> {
        debug!("host command {:?}", cmd);

        match cmd {
            HostCommand::Ping => Ok(HostResponse::Pong {
                status: self.status_bits(),
            }),
            HostCommand::SetDeviceSn(serial) => {
                if serial.is_empty() {
                    return Err(VendorError::invalid_argument("serial number must be non-zero"));
                }
                self.settings.save_serial(serial)?;
                info!("host set device serial number to {}", serial);
                Ok(HostResponse::DeviceSnSet)
            }
            HostCommand::GetNodeDetails(serial) => {
                let ctx = self.resolve(serial)?;
                let reply = self.client.get(GetKind::NodeDetails, Some(&ctx))?;
                Ok(HostResponse::NodeDetails(reply.node_record()?))
            }
            HostCommand::GetMeterData(serial) => {
                let ctx = self.resolve(serial)?;
                let reply = self.client.get(GetKind::MeterData, Some(&ctx))?;
                Ok(HostResponse::MeterData(reply.payload))
            }
        }
    }

    /// `STATUS_*` bits reported by `Ping`.
    pub fn status_bits(&self) -> u8 {
        let mut status = STATUS_BRIDGE_READY;
        if self.transport.is_provisioned() {
            status |= STATUS_PROVISIONED;
        }
        if matches!(self.settings.load_serial(), Ok(serial) if !serial.is_empty()) {
            status |= STATUS_SN_CONFIGURED;
        }
        status
    }

    fn resolve(&self, serial: SerialNumber) -> Result<MessageContext, VendorError> {
        if serial.is_empty() {
            return Err(VendorError::invalid_argument("serial number must be non-zero"));
        }
        let addr = self.directory.lock().lookup(serial);
        if addr.is_unassigned() {
            return Err(VendorError::NotFound(serial));
        }
        Ok(MessageContext::to(addr))
    }
}

/// The report forwarded to the host for a received Status, if any.
///
/// Statuses that completed a request are answered through the command
/// response instead.
pub fn urc_for(status: &ReceivedStatus) -> Option<HostResponse> {
    if status.matched {
        return None;
    }

    if status.opcode == Opcode::StatusNodeDetails {
        let record = NodeRecord::decode(&status.payload).ok()?;
        return Some(HostResponse::Urc {
            code: URC_NODE_DETAILS,
            data: record.encode().to_vec(),
        });
    }

    let mut data = Vec::with_capacity(2 + status.payload.len());
    data.extend_from_slice(&status.source.0.to_be_bytes());
    data.extend_from_slice(&status.payload);
    Some(HostResponse::Urc {
        code: URC_STATUS_RECEIVED,
        data,
    })
}

// ============================================================================
// Worker Thread
// ============================================================================

/// Handle to a host bridge worker thread.
///
/// Records submitted with [`submit`](Self::submit) are processed in order;
/// responses and reports are queued on [`output`](Self::output).
pub struct HostBridgeHandle {
    input: Option<Sender<Vec<u8>>>,
    output: Receiver<Vec<u8>>,
    held_reports: Mutex<VecDeque<HostResponse>>,
    thread: Option<JoinHandle<()>>,
    client: Arc<VendorClient>,
    subscription: Option<SubscriptionId>,
}

/// Spawn a worker thread serving `bridge`.
pub fn spawn_host_bridge(bridge: HostBridge, name: &str) -> HostBridgeHandle {
    let (input_tx, input_rx) = crossbeam_channel::unbounded::<Vec<u8>>();
    let (output_tx, output_rx) = crossbeam_channel::unbounded();

    let client = Arc::clone(&bridge.client);
    let reports = output_tx.clone();
    let subscription = client.subscribe(move |status| {
        if let Some(urc) = urc_for(status) {
            let _ = reports.send(urc.encode());
        }
    });

    let thread = thread::Builder::new()
        .name(format!("bridge-{}", name))
        .spawn(move || {
            for record in input_rx {
                let response = bridge.process(&record);
                if output_tx.send(response.encode()).is_err() {
                    break;
                }
            }
            debug!("host bridge stopped");
        })
        .expect("Failed to spawn host bridge thread");

    HostBridgeHandle {
        input: Some(input_tx),
        output: output_rx,
        held_reports: Mutex::new(VecDeque::new()),
        thread: Some(thread),
        client,
        subscription: Some(subscription),
    }
}

impl HostBridgeHandle {
    /// Queue a host record.
    pub fn submit(&self, record: Vec<u8>) -> Result<(), VendorError> {
        self.input
            .as_ref()
            .and_then(|input| input.send(record).ok())
            .ok_or_else(|| VendorError::not_ready("host bridge stopped"))
    }

    /// Raw output records, in the order the host would read them.
    pub fn output(&self) -> &Receiver<Vec<u8>> {
        &self.output
    }

    /// Wait for the next output record and decode it.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<HostResponse, VendorError> {
        let record = self.output.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => VendorError::Timeout(timeout),
            RecvTimeoutError::Disconnected => VendorError::not_ready("host bridge stopped"),
        })?;
        Ok(HostResponse::decode(&record)?)
    }

    /// Submit a command and wait for its response.
    ///
    /// Reports arriving first are held back; collect them with
    /// [`take_reports`](Self::take_reports).
    pub fn request(&self, cmd: &HostCommand, timeout: Duration) -> Result<HostResponse, VendorError> {
        self.submit(cmd.encode())?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv_timeout(remaining)? {
                report @ HostResponse::Urc { .. } => self.held_reports.lock().push_back(report),
                response => return Ok(response),
            }
        }
    }

    /// Reports held back by [`request`](Self::request) plus any queued since.
    pub fn take_reports(&self) -> Vec<HostResponse> {
        let mut reports: Vec<HostResponse> = self.held_reports.lock().drain(..).collect();
        while let Ok(record) = self.output.try_recv() {
            match HostResponse::decode(&record) {
                Ok(report) => reports.push(report),
                Err(e) => warn!("undecodable host output: {}", e),
            }
        }
        reports
    }

    /// Stop the worker after it drains the queued records.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.client.unsubscribe(subscription);
        }
        self.input.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HostBridgeHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::errno;
    use crate::transport::{LoopbackMesh, LoopbackPort};
    use vendor_metrics::MetricLabels;
    use vendor_protocol::{MeshAddress, HOST_CMD_PING};

    fn bridge() -> (HostBridge, Arc<LoopbackPort>, LoopbackMesh) {
        let mesh = LoopbackMesh::new();
        let (port, _inbox) = mesh.attach(MeshAddress(1), MeshAddress(0xC000));
        let directory = Arc::new(Mutex::new(NodeDirectory::new(4)));
        let client = Arc::new(
            VendorClient::new(
                port.clone(),
                Arc::clone(&directory),
                Arc::new(ManualClock::new(Duration::ZERO)),
                MeshAddress(0xC000),
                MetricLabels::new("test", 1),
            )
            .with_timeout(Duration::from_millis(50)),
        );
        let bridge = HostBridge::new(client, directory, Arc::new(Settings::in_memory()), port.clone());
        (bridge, port, mesh)
    }

    #[test]
    fn test_ping_reports_status_bits() {
        let (bridge, port, _mesh) = bridge();
        let ping = HostCommand::Ping.encode();

        assert_eq!(
            bridge.process(&ping),
            HostResponse::Pong {
                status: STATUS_BRIDGE_READY | STATUS_PROVISIONED
            }
        );

        port.set_provisioned(false);
        bridge.process(&HostCommand::SetDeviceSn(SerialNumber(9)).encode());
        assert_eq!(
            bridge.process(&ping),
            HostResponse::Pong {
                status: STATUS_BRIDGE_READY | STATUS_SN_CONFIGURED
            }
        );
    }

    #[test]
    fn test_set_device_sn() {
        let (bridge, _port, _mesh) = bridge();

        let response = bridge.process(&HostCommand::SetDeviceSn(SerialNumber(0x0A0B)).encode());
        assert_eq!(response, HostResponse::DeviceSnSet);
        assert_eq!(bridge.settings.load_serial().unwrap(), SerialNumber(0x0A0B));

        let response = bridge.process(&HostCommand::SetDeviceSn(SerialNumber::EMPTY).encode());
        assert_eq!(response, HostResponse::Error { code: -errno::EINVAL });
    }

    #[test]
    fn test_unknown_serial_not_found() {
        let (bridge, _port, _mesh) = bridge();
        let response = bridge.process(&HostCommand::GetMeterData(SerialNumber(77)).encode());
        assert_eq!(response, HostResponse::Error { code: -errno::ENOENT });
    }

    #[test]
    fn test_known_serial_times_out_without_peer() {
        let (bridge, _port, _mesh) = bridge();
        bridge
            .directory
            .lock()
            .upsert(NodeRecord::new(77u64, 0x0005u16, 1, 1), Duration::ZERO)
            .unwrap();

        // Address 5 is not attached, so the request is lost.
        let response = bridge.process(&HostCommand::GetNodeDetails(SerialNumber(77)).encode());
        assert_eq!(response, HostResponse::Error { code: -errno::ETIMEDOUT });
    }

    #[test]
    fn test_malformed_records() {
        let (bridge, _port, _mesh) = bridge();
        assert_eq!(
            bridge.process(&[0x42, 0x00, 0x00]),
            HostResponse::Error { code: -errno::ENOTSUP }
        );
        assert_eq!(
            bridge.process(&[HOST_CMD_PING, 0x00]),
            HostResponse::Error { code: -errno::EBADMSG }
        );
    }

    #[test]
    fn test_urc_mapping() {
        let record = NodeRecord::new(5u64, 0x0002u16, 3, 4);
        let details = ReceivedStatus {
            opcode: Opcode::StatusNodeDetails,
            source: MeshAddress(2),
            payload: record.encode().to_vec(),
            matched: false,
        };
        assert_eq!(
            urc_for(&details),
            Some(HostResponse::Urc {
                code: URC_NODE_DETAILS,
                data: record.encode().to_vec()
            })
        );

        let status = ReceivedStatus {
            opcode: Opcode::Status,
            source: MeshAddress(0x0102),
            payload: vec![0xAA],
            matched: false,
        };
        assert_eq!(
            urc_for(&status),
            Some(HostResponse::Urc {
                code: URC_STATUS_RECEIVED,
                data: vec![0x01, 0x02, 0xAA]
            })
        );

        assert_eq!(urc_for(&ReceivedStatus { matched: true, ..status }), None);
    }

    #[test]
    fn test_worker_answers_in_order() {
        let (bridge, _port, _mesh) = bridge();
        let client = Arc::clone(&bridge.client);
        let handle = spawn_host_bridge(bridge, "test");

        handle.submit(HostCommand::SetDeviceSn(SerialNumber(3)).encode()).unwrap();
        handle.submit(HostCommand::Ping.encode()).unwrap();
        assert_eq!(
            handle.recv_timeout(Duration::from_secs(2)).unwrap(),
            HostResponse::DeviceSnSet
        );
        assert_eq!(
            handle.recv_timeout(Duration::from_secs(2)).unwrap(),
            HostResponse::Pong {
                status: STATUS_BRIDGE_READY | STATUS_PROVISIONED | STATUS_SN_CONFIGURED
            }
        );

        let response = handle
            .request(&HostCommand::GetMeterData(SerialNumber(8)), Duration::from_secs(2))
            .unwrap();
        assert_eq!(response, HostResponse::Error { code: -errno::ENOENT });

        client
            .handle_status(Opcode::Status, &MessageContext::to(0x0002u16), &[0x55])
            .unwrap();
        assert_eq!(
            handle.take_reports(),
            vec![HostResponse::Urc {
                code: URC_STATUS_RECEIVED,
                data: vec![0x00, 0x02, 0x55]
            }]
        );

        handle.shutdown();
    }

    #[test]
    fn test_stopped_worker_releases_status_subscription() {
        let (bridge, _port, _mesh) = bridge();
        let client = Arc::clone(&bridge.client);
        assert_eq!(client.subscriber_count(), 0);

        for _ in 0..3 {
            let handle = spawn_host_bridge(bridge.clone(), "test");
            assert_eq!(client.subscriber_count(), 1);
            handle.shutdown();
            assert_eq!(client.subscriber_count(), 0);
        }

        let handle = spawn_host_bridge(bridge, "test");
        assert_eq!(client.subscriber_count(), 1);
        drop(handle);
        assert_eq!(client.subscriber_count(), 0);

        client
            .handle_status(Opcode::Status, &MessageContext::to(0x0002u16), &[0x55])
            .unwrap();
    }
}
