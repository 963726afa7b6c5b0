//! Node composition and the node runtime thread.
//!
//! ## Architecture
//!
//! Each node runs one runtime thread that owns the [`VendorServer`] and the
//! [`PublishScheduler`]. Inbound mesh frames, scheduler deadlines and control
//! commands are all processed there, one at a time. Blocking client calls
//! (`set`, `get`) run on the caller's thread and are completed by the runtime
//! thread when the matching Status arrives.
//!
//! ## Key Types
//!
//! - [`VendorNode`]: handle owning the runtime thread and the shared state
//! - [`NodeBuilder`]: start-up entry point
//! - [`NodeCommand`]: commands sent to the runtime thread
//! - [`Registration`]: models and opcodes the node registers with the mesh stack

use crate::bridge::{spawn_host_bridge, HostBridge, HostBridgeHandle};
use crate::client::VendorClient;
use crate::clock::{Clock, SystemClock};
use crate::config::NodeConfig;
use crate::directory::NodeDirectory;
use crate::error::VendorError;
use crate::scheduler::{PublishScheduler, SchedulerConfig};
use crate::server::{Incoming, Reply, StatusBuffer, StatusSender, VendorServer, VendorServerBuilder};
use crate::settings::{
    decode_serial, JsonFileSettings, MemorySettings, Settings, SettingsStore, SETTINGS_KEY_SN,
};
use crate::transport::{InboundFrame, MeshTransport};
use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use vendor_metrics::{metric_defs, MetricLabels};
use vendor_protocol::{
    split_frame, GetRequest, MeshAddress, NodeRecord, Opcode, ProtocolError, SerialNumber,
    COMPANY_ID, MODEL_ID_CLIENT, MODEL_ID_SERVER, NODE_RECORD_SIZE,
};

/// Longest the runtime sleeps when no deadline is pending.
const IDLE_WAIT: Duration = Duration::from_secs(1);

// ============================================================================
// Registration Descriptor
// ============================================================================

/// One entry of a model's opcode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeEntry {
    /// The opcode.
    pub opcode: Opcode,
    /// Shortest accepted payload.
    pub min_len: usize,
}

/// A vendor model as registered with the mesh stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRegistration {
    /// Company identifier.
    pub company_id: u16,
    /// Model identifier.
    pub model_id: u16,
    /// Opcodes the model receives.
    pub opcodes: Vec<OpcodeEntry>,
}

impl ModelRegistration {
    /// The table entry for `opcode`.
    pub fn entry(&self, opcode: Opcode) -> Option<&OpcodeEntry> {
        self.opcodes.iter().find(|entry| entry.opcode == opcode)
    }
}

/// Both models of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// The server model.
    pub server: ModelRegistration,
    /// The client model.
    pub client: ModelRegistration,
}

impl Registration {
    /// The standard registration.
    pub fn new() -> Self {
        let server = Opcode::SERVER_OPCODES
            .iter()
            .map(|&opcode| OpcodeEntry { opcode, min_len: 0 })
            .collect();
        let client = Opcode::CLIENT_OPCODES
            .iter()
            .map(|&opcode| OpcodeEntry {
                opcode,
                min_len: if opcode == Opcode::StatusNodeDetails {
                    NODE_RECORD_SIZE
                } else {
                    0
                },
            })
            .collect();

        Registration {
            server: ModelRegistration {
                company_id: COMPANY_ID,
                model_id: MODEL_ID_SERVER,
                opcodes: server,
            },
            client: ModelRegistration {
                company_id: COMPANY_ID,
                model_id: MODEL_ID_CLIENT,
                opcodes: client,
            },
        }
    }

    /// Which model receives `opcode`, with its table entry.
    pub fn route(&self, opcode: Opcode) -> Option<(u16, &OpcodeEntry)> {
        self.server
            .entry(opcode)
            .map(|entry| (self.server.model_id, entry))
            .or_else(|| self.client.entry(opcode).map(|entry| (self.client.model_id, entry)))
    }
}

impl Default for Registration {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Commands sent to the node runtime thread.
#[derive(Debug)]
pub enum NodeCommand {
    /// Run any due scheduler work and report the node's state.
    Tick {
        /// Where to send the report.
        reply: Sender<TickReport>,
    },

    /// Run a scheduler cycle now.
    PublishNow {
        /// Outcome of the announcement.
        reply: Sender<Result<(), VendorError>>,
    },

    /// The persisted serial number changed.
    SetSerial(SerialNumber),

    /// Update the announced capacity and quality.
    SetLinkMetrics {
        /// New capacity.
        capacity: u8,
        /// New quality.
        quality: u8,
    },

    /// Stop the runtime thread.
    Shutdown,
}

/// State of the runtime after a [`NodeCommand::Tick`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Clock reading when the tick ran.
    pub now: Duration,
    /// When the next announcement is due.
    pub next_publish: Option<Duration>,
    /// The record this node announces.
    pub local: NodeRecord,
}

// ============================================================================
// Runtime
// ============================================================================

/// Everything the runtime thread owns.
struct NodeRuntime {
    server: VendorServer,
    client: Arc<VendorClient>,
    scheduler: PublishScheduler,
    clock: Arc<dyn Clock>,
    registration: Registration,
    labels: MetricLabels,
}

impl NodeRuntime {
    fn run(mut self, cmd_rx: Receiver<NodeCommand>, mut inbox: Receiver<InboundFrame>) {
        let delay = self.scheduler.start(self.clock.now());
        info!("node runtime started, first announcement in {:?}", delay);

        loop {
            self.poll_scheduler();

            let wait = self
                .scheduler
                .remaining(self.clock.now())
                .map_or(IDLE_WAIT, |remaining| remaining.min(IDLE_WAIT));

            select! {
                recv(cmd_rx) -> cmd => match cmd {
                    Ok(cmd) => {
                        self.drain(&inbox);
                        if !self.handle_command(cmd) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(inbox) -> frame => match frame {
                    Ok(frame) => self.handle_frame(frame),
                    Err(_) => {
                        debug!("mesh inbox closed");
                        inbox = crossbeam_channel::never();
                    }
                },
                default(wait) => {}
            }
        }

        info!("node runtime stopped");
    }

    /// Handle every frame already queued, so commands observe them.
    fn drain(&mut self, inbox: &Receiver<InboundFrame>) {
        while let Ok(frame) = inbox.try_recv() {
            self.handle_frame(frame);
        }
    }

    fn poll_scheduler(&mut self) {
        if let Some(outcome) = self.scheduler.poll(self.clock.now()) {
            trace!("scheduler cycle done, next at {:?}", outcome.next);
        }
    }

    /// Returns `false` when the thread should exit.
    fn handle_command(&mut self, cmd: NodeCommand) -> bool {
        match cmd {
            NodeCommand::Tick { reply } => {
                self.poll_scheduler();
                let report = TickReport {
                    now: self.clock.now(),
                    next_publish: self.scheduler.next_deadline(),
                    local: *self.scheduler.local_record(),
                };
                let _ = reply.send(report);
                true
            }
            NodeCommand::PublishNow { reply } => {
                let outcome = self.scheduler.run_cycle(self.clock.now());
                let _ = reply.send(outcome.published);
                true
            }
            NodeCommand::SetSerial(serial) => {
                self.scheduler.set_serial(serial);
                true
            }
            NodeCommand::SetLinkMetrics { capacity, quality } => {
                self.scheduler.set_link_metrics(capacity, quality);
                true
            }
            NodeCommand::Shutdown => {
                self.scheduler.stop();
                false
            }
        }
    }

    fn handle_frame(&mut self, frame: InboundFrame) {
        let (opcode, payload) = match split_frame(&frame.data) {
            Ok(split) => split,
            Err(e) => {
                self.dropped(frame.src, &VendorError::Protocol(e));
                return;
            }
        };

        let Some((model_id, entry)) = self.registration.route(opcode) else {
            self.dropped(frame.src, &VendorError::invalid_argument(format!("{} not registered", opcode)));
            return;
        };
        if payload.len() < entry.min_len {
            let err = ProtocolError::FrameTooShort {
                expected: entry.min_len,
                actual: payload.len(),
            };
            self.dropped(frame.src, &VendorError::Protocol(err));
            return;
        }

        debug!(
            "rx {} from {} to {} ({} bytes)",
            opcode,
            frame.src,
            frame.dst,
            payload.len()
        );

        let ctx = frame.context();
        let result = if model_id == MODEL_ID_CLIENT {
            self.client.handle_status(opcode, &ctx, payload)
        } else {
            let local = *self.scheduler.local_record();
            self.server.handle_message(opcode, &ctx, payload, &local)
        };

        match result {
            Ok(()) => {}
            Err(e @ (VendorError::Protocol(_) | VendorError::Size { .. } | VendorError::InvalidArgument(_))) => {
                self.dropped(frame.src, &e)
            }
            Err(e) => debug!("{} from {} not answered: {}", opcode, frame.src, e),
        }
    }

    fn dropped(&self, src: MeshAddress, err: &VendorError) {
        warn!("dropped frame from {}: {}", src, err);
        metrics::counter!(metric_defs::FRAMES_DROPPED.name, &self.labels.to_labels()).increment(1);
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Start-up entry point for a [`VendorNode`].
pub struct NodeBuilder {
    config: NodeConfig,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn SettingsStore>>,
    server: VendorServerBuilder,
}

impl NodeBuilder {
    /// Use a specific clock (default: [`SystemClock`]).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a specific settings store (default: from `settings_path`, else in memory).
    pub fn settings_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Install the server's Set handler.
    pub fn on_set<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&Incoming<'_>, &[u8], &mut StatusBuffer) -> Result<Reply, VendorError> + Send + 'static,
    {
        self.server = self.server.on_set(handler);
        self
    }

    /// Install the server's Get handler.
    pub fn on_get<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&Incoming<'_>, &GetRequest, &mut StatusBuffer) -> Result<Reply, VendorError>
            + Send
            + 'static,
    {
        self.server = self.server.on_get(handler);
        self
    }

    /// Validate, build every component and spawn the runtime thread.
    pub fn start(
        self,
        transport: Arc<dyn MeshTransport>,
        inbox: Receiver<InboundFrame>,
    ) -> Result<VendorNode, VendorError> {
        let config = self.config;
        config.validate()?;
        if transport.address() != config.address {
            return Err(VendorError::invalid_argument(format!(
                "transport address {} does not match configured address {}",
                transport.address(),
                config.address
            )));
        }

        let labels = MetricLabels::new(config.name.clone(), config.address.0);

        let store: Arc<dyn SettingsStore> = match (self.store, &config.settings_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(JsonFileSettings::open(path)?),
            (None, None) => Arc::new(MemorySettings::new()),
        };
        let settings = Arc::new(Settings::new(store));

        let mut serial = settings.load_serial()?;
        if serial.is_empty() {
            if let Some(initial) = config.serial_number.filter(|sn| !sn.is_empty()) {
                settings.save_serial(initial)?;
                serial = initial;
            }
        }

        let directory = Arc::new(Mutex::new(NodeDirectory::new(config.directory_capacity)));
        let sender = StatusSender::new(Arc::clone(&transport));
        let server = self.server.build(sender.clone(), labels.clone())?;

        let client = Arc::new(
            VendorClient::new(
                Arc::clone(&transport),
                Arc::clone(&directory),
                Arc::clone(&self.clock),
                config.publish_address,
                labels.clone(),
            )
            .with_timeout(config.request_timeout()),
        );

        let mut scheduler = PublishScheduler::new(
            NodeRecord::new(serial, config.address, config.capacity, config.quality),
            SchedulerConfig {
                interval: config.publish_interval(),
                max_age: config.node_max_age(),
                jitter: config.publish_jitter(),
            },
            Arc::clone(&directory),
            sender.clone(),
            labels.clone(),
        );
        if let Some(seed) = config.rng_seed {
            scheduler = scheduler.with_seed(seed);
        }

        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();

        let notify = cmd_tx.clone();
        settings.subscribe(move |key, value| {
            if key != SETTINGS_KEY_SN {
                return;
            }
            match decode_serial(value) {
                Ok(serial) => {
                    let _ = notify.send(NodeCommand::SetSerial(serial));
                }
                Err(e) => warn!("ignoring serial number change: {}", e),
            }
        });

        let runtime = NodeRuntime {
            server,
            client: Arc::clone(&client),
            scheduler,
            clock: self.clock,
            registration: Registration::new(),
            labels,
        };

        let thread = thread::Builder::new()
            .name(format!("node-{}", config.name))
            .spawn(move || runtime.run(cmd_rx, inbox))
            .expect("Failed to spawn node runtime thread");

        info!(
            "node '{}' started at {} (serial {})",
            config.name, config.address, serial
        );

        Ok(VendorNode {
            config,
            transport,
            client,
            directory,
            settings,
            sender,
            cmd_tx,
            thread: Some(thread),
        })
    }
}

// ============================================================================
// Node Handle
// ============================================================================

/// A running vendor model node.
pub struct VendorNode {
    config: NodeConfig,
    transport: Arc<dyn MeshTransport>,
    client: Arc<VendorClient>,
    directory: Arc<Mutex<NodeDirectory>>,
    settings: Arc<Settings>,
    sender: StatusSender,
    cmd_tx: Sender<NodeCommand>,
    thread: Option<JoinHandle<()>>,
}

impl VendorNode {
    /// Start configuring a node.
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder {
            config,
            clock: Arc::new(SystemClock::new()),
            store: None,
            server: VendorServer::builder(),
        }
    }

    /// The models and opcodes this node registers.
    pub fn registration(&self) -> Registration {
        Registration::new()
    }

    /// The node's configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Own unicast address.
    pub fn address(&self) -> MeshAddress {
        self.config.address
    }

    /// The vendor client.
    pub fn client(&self) -> &Arc<VendorClient> {
        &self.client
    }

    /// The shared node directory.
    pub fn directory(&self) -> &Arc<Mutex<NodeDirectory>> {
        &self.directory
    }

    /// Address of the node with `serial`, or unassigned when unknown.
    pub fn lookup(&self, serial: SerialNumber) -> MeshAddress {
        self.directory.lock().lookup(serial)
    }

    /// The node's settings.
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Sender for deferred server replies.
    pub fn status_sender(&self) -> StatusSender {
        self.sender.clone()
    }

    /// Run due scheduler work and report the runtime state.
    ///
    /// Returns after the runtime has processed every frame queued before it.
    pub fn tick(&self) -> Result<TickReport, VendorError> {
        self.command(|reply| NodeCommand::Tick { reply })
    }

    /// Purge the directory and announce the local node now.
    pub fn publish_now(&self) -> Result<(), VendorError> {
        self.command(|reply| NodeCommand::PublishNow { reply })?
    }

    /// Update the announced capacity and quality.
    pub fn set_link_metrics(&self, capacity: u8, quality: u8) -> Result<(), VendorError> {
        self.cmd_tx
            .send(NodeCommand::SetLinkMetrics { capacity, quality })
            .map_err(|_| VendorError::not_ready("node runtime stopped"))
    }

    /// A host bridge over this node's state.
    pub fn host_bridge(&self) -> HostBridge {
        HostBridge::new(
            Arc::clone(&self.client),
            Arc::clone(&self.directory),
            Arc::clone(&self.settings),
            Arc::clone(&self.transport),
        )
    }

    /// Spawn a host bridge worker thread.
    pub fn spawn_host_bridge(&self) -> HostBridgeHandle {
        spawn_host_bridge(self.host_bridge(), &self.config.name)
    }

    /// Whether the runtime thread is still alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Stop the runtime thread and wait for it.
    pub fn shutdown(mut self) -> Result<(), VendorError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), VendorError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let _ = self.cmd_tx.send(NodeCommand::Shutdown);
        thread
            .join()
            .map_err(|_| VendorError::not_ready("node runtime panicked"))
    }

    fn command<T>(&self, make: impl FnOnce(Sender<T>) -> NodeCommand) -> Result<T, VendorError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| VendorError::not_ready("node runtime stopped"))?;
        rx.recv()
            .map_err(|_| VendorError::not_ready("node runtime stopped"))
    }
}

impl Drop for VendorNode {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::LoopbackMesh;

    fn test_config(name: &str, address: u16, serial: u64) -> NodeConfig {
        NodeConfig {
            serial_number: Some(SerialNumber(serial)),
            publish_jitter_secs: 0,
            request_timeout_ms: 2000,
            rng_seed: Some(1),
            ..NodeConfig::new(name, address)
        }
    }

    fn echo(builder: NodeBuilder) -> NodeBuilder {
        builder
            .on_set(|_, payload, rsp| {
                rsp.extend_from_slice(payload)?;
                Ok(Reply::Now)
            })
            .on_get(|incoming, _, rsp| {
                rsp.put_record(incoming.local)?;
                Ok(Reply::Now)
            })
    }

    #[test]
    fn test_registration_table() {
        let registration = Registration::new();
        assert_eq!(registration.server.model_id, MODEL_ID_SERVER);
        assert_eq!(registration.client.model_id, MODEL_ID_CLIENT);
        assert_eq!(registration.server.opcodes.len(), 5);
        assert_eq!(registration.client.opcodes.len(), 3);

        let (model, entry) = registration.route(Opcode::StatusNodeDetails).unwrap();
        assert_eq!(model, MODEL_ID_CLIENT);
        assert_eq!(entry.min_len, NODE_RECORD_SIZE);
        assert_eq!(registration.route(Opcode::Get).unwrap().0, MODEL_ID_SERVER);
    }

    #[test]
    fn test_start_requires_handlers() {
        let mesh = LoopbackMesh::new();
        let (port, inbox) = mesh.attach(MeshAddress(1), MeshAddress(0xC000));
        let result = VendorNode::builder(test_config("a", 1, 1))
            .on_set(|_, _, _| Ok(Reply::Now))
            .start(port, inbox);
        assert!(matches!(result, Err(VendorError::InvalidArgument(_))));
    }

    #[test]
    fn test_start_rejects_address_mismatch() {
        let mesh = LoopbackMesh::new();
        let (port, inbox) = mesh.attach(MeshAddress(2), MeshAddress(0xC000));
        let result = echo(VendorNode::builder(test_config("a", 1, 1))).start(port, inbox);
        assert!(matches!(result, Err(VendorError::InvalidArgument(_))));
    }

    #[test]
    fn test_start_rejects_invalid_config() {
        let mesh = LoopbackMesh::new();
        let (port, inbox) = mesh.attach(MeshAddress(1), MeshAddress(0xC000));
        let mut config = test_config("a", 1, 1);
        config.directory_capacity = 0;
        let result = echo(VendorNode::builder(config)).start(port, inbox);
        assert!(matches!(result, Err(VendorError::Config(_))));
    }

    #[test]
    fn test_start_rejects_serial_wider_than_device_sn() {
        let mesh = LoopbackMesh::new();
        let (port, inbox) = mesh.attach(MeshAddress(1), MeshAddress(0xC000));
        let store = Arc::new(MemorySettings::new());
        let result = echo(VendorNode::builder(test_config("a", 1, 0x0100_0000_0000_0001)))
            .settings_store(store.clone())
            .start(port, inbox);

        assert!(matches!(result, Err(VendorError::Config(_))));
        assert_eq!(store.load(SETTINGS_KEY_SN).unwrap(), None);
    }

    #[test]
    fn test_tick_reports_schedule() {
        let mesh = LoopbackMesh::new();
        let (port, inbox) = mesh.attach(MeshAddress(1), MeshAddress(0xC000));
        let clock = Arc::new(ManualClock::new(Duration::ZERO));
        let node = echo(VendorNode::builder(test_config("a", 1, 0x42)))
            .clock(clock.clone())
            .start(port, inbox)
            .unwrap();

        // Zero jitter: the first cycle ran at t=0 and the next is one interval later.
        let report = node.tick().unwrap();
        assert_eq!(report.next_publish, Some(Duration::from_secs(3600)));
        assert_eq!(report.local.serial_number, SerialNumber(0x42));

        clock.advance(Duration::from_secs(3600));
        let report = node.tick().unwrap();
        assert_eq!(report.next_publish, Some(Duration::from_secs(7200)));

        node.shutdown().unwrap();
    }

    #[test]
    fn test_settings_change_updates_local_record() {
        let mesh = LoopbackMesh::new();
        let (port, inbox) = mesh.attach(MeshAddress(1), MeshAddress(0xC000));
        let node = echo(VendorNode::builder(test_config("a", 1, 0)))
            .start(port, inbox)
            .unwrap();

        assert_eq!(node.tick().unwrap().local.serial_number, SerialNumber::EMPTY);
        node.settings().save_serial(SerialNumber(0xBEEF)).unwrap();
        node.set_link_metrics(4, 5).unwrap();

        let local = node.tick().unwrap().local;
        assert_eq!(local.serial_number, SerialNumber(0xBEEF));
        assert_eq!((local.capacity, local.quality), (4, 5));
    }

    #[test]
    fn test_publish_now_not_ready_when_unprovisioned() {
        let mesh = LoopbackMesh::new();
        let (port, inbox) = mesh.attach(MeshAddress(1), MeshAddress(0xC000));
        port.set_provisioned(false);
        let node = echo(VendorNode::builder(test_config("a", 1, 7)))
            .start(port.clone(), inbox)
            .unwrap();

        assert!(matches!(node.publish_now(), Err(VendorError::NotReady(_))));
        port.set_provisioned(true);
        assert!(node.publish_now().is_ok());
    }

    #[test]
    fn test_shutdown_stops_runtime() {
        let mesh = LoopbackMesh::new();
        let (port, inbox) = mesh.attach(MeshAddress(1), MeshAddress(0xC000));
        let node = echo(VendorNode::builder(test_config("a", 1, 7)))
            .start(port, inbox)
            .unwrap();
        assert!(node.is_running());
        node.shutdown().unwrap();
    }
}
