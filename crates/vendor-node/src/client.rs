//! Vendor client: sends Set/Get requests and correlates Status replies.
//!
//! The client owns a single correlation slot. Acknowledged requests take an
//! internal request lock for their whole lifetime, so concurrent callers queue
//! up instead of overwriting each other's pending request.
//!
//! [`VendorClient::handle_status`] must run on a different thread than the
//! blocked caller; in a [`VendorNode`](crate::VendorNode) that is the node
//! runtime thread.

use crate::clock::Clock;
use crate::directory::{NodeDirectory, UpsertOutcome};
use crate::error::VendorError;
use crate::transport::MeshTransport;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use vendor_metrics::{metric_defs, MetricLabels};
use vendor_protocol::{
    GetKind, GetRequest, MeshAddress, MessageContext, NodeRecord, Opcode, ProtocolError,
    VendorMessage, MAX_SET_PAYLOAD,
};

/// Default deadline for acknowledged requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

/// Callback invoked for every Status the client receives.
pub type StatusCallback = Arc<dyn Fn(&ReceivedStatus) + Send + Sync>;

/// Identifies a registered callback for [`VendorClient::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A Status that completed an acknowledged request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReply {
    /// Which kind of Status this is.
    pub kind: GetKind,
    /// The replying node.
    pub source: MeshAddress,
    /// Raw payload.
    pub payload: Vec<u8>,
}

impl StatusReply {
    /// Decode the payload as a node record.
    pub fn node_record(&self) -> Result<NodeRecord, ProtocolError> {
        NodeRecord::decode(&self.payload)
    }
}

/// A Status as seen by notification callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedStatus {
    /// Opcode the Status arrived with.
    pub opcode: Opcode,
    /// Sender.
    pub source: MeshAddress,
    /// Raw payload.
    pub payload: Vec<u8>,
    /// Whether it completed the pending request.
    pub matched: bool,
}

/// The pending request.
#[derive(Debug)]
struct AckContext {
    /// Reply opcode we are waiting for.
    opcode: Opcode,
    /// Destination of the request; replies must come from here when unicast.
    dst: MeshAddress,
    /// Filled in by the matching Status.
    response: Option<(MeshAddress, Vec<u8>)>,
}

impl AckContext {
    fn matches(&self, opcode: Opcode, source: MeshAddress) -> bool {
        self.response.is_none()
            && self.opcode == opcode
            && (!self.dst.is_unicast() || self.dst == source)
    }
}

/// Client side of the vendor model.
pub struct VendorClient {
    transport: Arc<dyn MeshTransport>,
    directory: Arc<Mutex<NodeDirectory>>,
    clock: Arc<dyn Clock>,
    publish_address: MeshAddress,
    timeout: Duration,
    request_lock: Mutex<()>,
    pending: Mutex<Option<AckContext>>,
    completed: Condvar,
    callbacks: RwLock<Vec<(SubscriptionId, StatusCallback)>>,
    next_subscription: AtomicU64,
    labels: MetricLabels,
}

impl VendorClient {
    /// Create a client.
    ///
    /// `publish_address` is the destination used when a call has no context.
    pub fn new(
        transport: Arc<dyn MeshTransport>,
        directory: Arc<Mutex<NodeDirectory>>,
        clock: Arc<dyn Clock>,
        publish_address: MeshAddress,
        labels: MetricLabels,
    ) -> Self {
        VendorClient {
            transport,
            directory,
            clock,
            publish_address,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            request_lock: Mutex::new(()),
            pending: Mutex::new(None),
            completed: Condvar::new(),
            callbacks: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
            labels,
        }
    }

    /// Set the deadline for acknowledged requests.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The deadline for acknowledged requests.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a callback invoked for every received Status.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ReceivedStatus) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.callbacks.write().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns `false` when it was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(registered, _)| *registered != id);
        callbacks.len() != before
    }

    /// Number of registered callbacks.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Whether an acknowledged request is waiting for its reply.
    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    // ========================================================================
    // Requests
    // ========================================================================

    /// Send an acknowledged Set and wait for the Status.
    pub fn set(&self, payload: &[u8], ctx: Option<&MessageContext>) -> Result<StatusReply, VendorError> {
        check_set_payload(payload)?;
        self.request(VendorMessage::Set(payload.to_vec()), GetKind::Status, ctx)
    }

    /// Send an unacknowledged Set.
    pub fn set_unacknowledged(&self, payload: &[u8], ctx: Option<&MessageContext>) -> Result<(), VendorError> {
        check_set_payload(payload)?;
        self.transmit(&VendorMessage::SetUnack(payload.to_vec()), ctx)
    }

    /// Send a Get for `kind` and wait for the matching Status.
    pub fn get(&self, kind: GetKind, ctx: Option<&MessageContext>) -> Result<StatusReply, VendorError> {
        self.get_request(GetRequest::new(kind), ctx)
    }

    /// Send a Get with an explicit request (e.g. carrying a length hint).
    pub fn get_request(
        &self,
        request: GetRequest,
        ctx: Option<&MessageContext>,
    ) -> Result<StatusReply, VendorError> {
        self.request(VendorMessage::Get(request), request.kind, ctx)
    }

    fn request(
        &self,
        message: VendorMessage,
        reply_kind: GetKind,
        ctx: Option<&MessageContext>,
    ) -> Result<StatusReply, VendorError> {
        let _serialized = self.request_lock.lock();
        let reply_opcode = Opcode::status_for(reply_kind);
        let dst = ctx.map(|c| c.addr).unwrap_or(self.publish_address);

        *self.pending.lock() = Some(AckContext {
            opcode: reply_opcode,
            dst,
            response: None,
        });

        let started = Instant::now();
        if let Err(e) = self.transmit(&message, ctx) {
            *self.pending.lock() = None;
            return Err(e);
        }

        let deadline = started + self.timeout;
        let mut pending = self.pending.lock();
        loop {
            if let Some((source, payload)) = pending.as_mut().and_then(|ack| ack.response.take()) {
                *pending = None;
                drop(pending);

                metrics::histogram!(metric_defs::CLIENT_ROUND_TRIP.name, &self.labels.to_labels())
                    .record(started.elapsed().as_secs_f64() * 1000.0);
                return Ok(StatusReply {
                    kind: reply_kind,
                    source,
                    payload,
                });
            }

            if self.completed.wait_until(&mut pending, deadline).timed_out() {
                let answered = pending.as_ref().map_or(false, |ack| ack.response.is_some());
                if !answered {
                    *pending = None;
                    drop(pending);

                    warn!("{} to {} timed out after {:?}", message.opcode(), dst, self.timeout);
                    metrics::counter!(metric_defs::CLIENT_TIMEOUTS.name, &self.labels.to_labels())
                        .increment(1);
                    return Err(VendorError::Timeout(self.timeout));
                }
            }
        }
    }

    fn transmit(&self, message: &VendorMessage, ctx: Option<&MessageContext>) -> Result<(), VendorError> {
        let frame = message.encode()?;
        let opcode = message.opcode();

        let result = match ctx {
            Some(ctx) => self.transport.send(ctx, &frame),
            None => self.transport.publish(&frame),
        };
        if let Err(e) = result {
            error!("failed to send {}: {}", opcode, e);
            return Err(e.into());
        }

        trace!("sent {} ({} bytes)", opcode, frame.len());
        metrics::counter!(
            metric_defs::CLIENT_REQUESTS_SENT.name,
            &self.labels.with_opcode(opcode.name())
        )
        .increment(1);
        Ok(())
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Handle a received Status of any kind.
    ///
    /// Feeds node details into the directory, completes the pending request
    /// when `(opcode, source)` matches, then notifies every callback.
    pub fn handle_status(
        &self,
        opcode: Opcode,
        ctx: &MessageContext,
        payload: &[u8],
    ) -> Result<(), VendorError> {
        if !opcode.is_status() {
            return Err(VendorError::invalid_argument(format!(
                "{} is not a status opcode",
                opcode
            )));
        }

        let record = match opcode {
            Opcode::StatusNodeDetails => Some(NodeRecord::decode(payload).map_err(|e| {
                warn!("malformed node details from {}: {}", ctx.addr, e);
                e
            })?),
            _ => None,
        };

        debug!("{} from {} ({} bytes)", opcode, ctx.addr, payload.len());

        // Stored before the waiter wakes, so a lookup right after get() sees it.
        if let Some(record) = record {
            self.record_node(record);
        }

        metrics::counter!(
            metric_defs::CLIENT_STATUS_RECEIVED.name,
            &self.labels.with_opcode(opcode.name())
        )
        .increment(1);

        let matched = {
            let mut pending = self.pending.lock();
            match pending.as_mut() {
                Some(ack) if ack.matches(opcode, ctx.addr) => {
                    ack.response = Some((ctx.addr, payload.to_vec()));
                    self.completed.notify_all();
                    true
                }
                _ => false,
            }
        };

        if !matched {
            metrics::counter!(
                metric_defs::CLIENT_STATUS_UNSOLICITED.name,
                &self.labels.with_opcode(opcode.name())
            )
            .increment(1);
        }

        let status = ReceivedStatus {
            opcode,
            source: ctx.addr,
            payload: payload.to_vec(),
            matched,
        };
        let callbacks: Vec<StatusCallback> = self
            .callbacks
            .read()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(&status);
        }

        Ok(())
    }

    fn record_node(&self, record: NodeRecord) {
        info!(
            "node details: serial={} addr={} capacity={} quality={}",
            record.serial_number, record.mesh_address, record.capacity, record.quality
        );

        let now = self.clock.now();
        let mut directory = self.directory.lock();
        match directory.upsert(record, now) {
            Ok(UpsertOutcome::Evicted(evicted)) => {
                debug!("evicted {} from directory", evicted.record.serial_number);
                metrics::counter!(metric_defs::DIRECTORY_EVICTIONS.name, &self.labels.to_labels())
                    .increment(1);
            }
            Ok(_) => {}
            Err(e) => warn!("node details not stored: {}", e),
        }
        metrics::gauge!(metric_defs::DIRECTORY_ENTRIES.name, &self.labels.to_labels())
            .set(directory.len() as f64);
    }
}

fn check_set_payload(payload: &[u8]) -> Result<(), VendorError> {
    if payload.len() > MAX_SET_PAYLOAD {
        return Err(VendorError::Size {
            max: MAX_SET_PAYLOAD,
            actual: payload.len(),
        });
    }
    Ok(())
}
