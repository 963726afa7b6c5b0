//! Vendor server: dispatches Set and Get messages to application handlers.

use crate::error::VendorError;
use crate::transport::MeshTransport;
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};
use vendor_metrics::{metric_defs, MetricLabels};
use vendor_protocol::{
    GetKind, GetRequest, MessageContext, NodeRecord, Opcode, ProtocolError, VendorMessage,
    MAX_SET_PAYLOAD, MAX_STATUS_PAYLOAD,
};

// ============================================================================
// Handler Types
// ============================================================================

/// What a handler wants done with the response buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Send the buffer as the reply.
    Now,
    /// Do not reply; the application answers later through a [`StatusSender`].
    Later,
}

/// Context passed to handlers alongside the request.
#[derive(Debug, Clone, Copy)]
pub struct Incoming<'a> {
    /// Opcode the request arrived with.
    pub opcode: Opcode,
    /// Receive context; `ctx.addr` is the requester.
    pub ctx: &'a MessageContext,
    /// This node's current identity.
    pub local: &'a NodeRecord,
}

impl Incoming<'_> {
    /// Whether the requester expects a reply.
    pub fn acknowledged(&self) -> bool {
        self.opcode != Opcode::SetUnack
    }
}

/// Handler for Set and SetUnack.
pub type SetHandler =
    Box<dyn FnMut(&Incoming<'_>, &[u8], &mut StatusBuffer) -> Result<Reply, VendorError> + Send>;

/// Handler for all Get kinds.
pub type GetHandler =
    Box<dyn FnMut(&Incoming<'_>, &GetRequest, &mut StatusBuffer) -> Result<Reply, VendorError> + Send>;

// ============================================================================
// Status Buffer
// ============================================================================

/// Scratch buffer a handler writes its response into.
///
/// Writes past [`MAX_STATUS_PAYLOAD`] fail with [`VendorError::Size`].
#[derive(Debug, Clone)]
pub struct StatusBuffer {
    buf: BytesMut,
}

impl StatusBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        StatusBuffer {
            buf: BytesMut::with_capacity(MAX_STATUS_PAYLOAD),
        }
    }

    /// Append bytes.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<(), VendorError> {
        let actual = self.buf.len() + data.len();
        if actual > MAX_STATUS_PAYLOAD {
            return Err(VendorError::Size {
                max: MAX_STATUS_PAYLOAD,
                actual,
            });
        }
        self.buf.put_slice(data);
        Ok(())
    }

    /// Append one byte.
    pub fn push(&mut self, byte: u8) -> Result<(), VendorError> {
        self.extend_from_slice(&[byte])
    }

    /// Append a node record in its wire layout.
    pub fn put_record(&mut self, record: &NodeRecord) -> Result<(), VendorError> {
        self.extend_from_slice(&record.encode())
    }

    /// Shorten to at most `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    /// Discard the contents.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Number of bytes written.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl Default for StatusBuffer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Status Sender
// ============================================================================

/// Sends Status messages from the server model.
///
/// With a context the message is unicast to `ctx.addr`; without one it goes
/// to the model's publish address.
#[derive(Clone)]
pub struct StatusSender {
    transport: Arc<dyn MeshTransport>,
}

impl StatusSender {
    /// Create a sender over the given transport.
    pub fn new(transport: Arc<dyn MeshTransport>) -> Self {
        StatusSender { transport }
    }

    /// Encode and send a message.
    pub fn send(&self, ctx: Option<&MessageContext>, message: &VendorMessage) -> Result<(), VendorError> {
        let frame = message.encode()?;
        let result = match ctx {
            Some(ctx) => self.transport.send(ctx, &frame),
            None => self.transport.publish(&frame),
        };
        result.map_err(|e| {
            error!("failed to send {}: {}", message.opcode(), e);
            VendorError::from(e)
        })
    }

    /// Whether the underlying node is provisioned.
    pub fn is_provisioned(&self) -> bool {
        self.transport.is_provisioned()
    }
}

impl fmt::Debug for StatusSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusSender")
            .field("address", &self.transport.address())
            .finish()
    }
}

// ============================================================================
// Server
// ============================================================================

/// Builder for [`VendorServer`]. Both handlers are required.
#[derive(Default)]
pub struct VendorServerBuilder {
    set_handler: Option<SetHandler>,
    get_handler: Option<GetHandler>,
}

impl VendorServerBuilder {
    /// Install the Set handler.
    pub fn on_set<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&Incoming<'_>, &[u8], &mut StatusBuffer) -> Result<Reply, VendorError> + Send + 'static,
    {
        self.set_handler = Some(Box::new(handler));
        self
    }

    /// Install the Get handler.
    pub fn on_get<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&Incoming<'_>, &GetRequest, &mut StatusBuffer) -> Result<Reply, VendorError>
            + Send
            + 'static,
    {
        self.get_handler = Some(Box::new(handler));
        self
    }

    /// Build the server. Fails with `InvalidArgument` when a handler is missing.
    pub fn build(self, sender: StatusSender, labels: MetricLabels) -> Result<VendorServer, VendorError> {
        let set_handler = self
            .set_handler
            .ok_or_else(|| VendorError::invalid_argument("vendor server requires a Set handler"))?;
        let get_handler = self
            .get_handler
            .ok_or_else(|| VendorError::invalid_argument("vendor server requires a Get handler"))?;

        Ok(VendorServer {
            set_handler,
            get_handler,
            sender,
            scratch: StatusBuffer::new(),
            labels,
        })
    }
}

/// Server side of the vendor model.
pub struct VendorServer {
    set_handler: SetHandler,
    get_handler: GetHandler,
    sender: StatusSender,
    scratch: StatusBuffer,
    labels: MetricLabels,
}

impl VendorServer {
    /// Start building a server.
    pub fn builder() -> VendorServerBuilder {
        VendorServerBuilder::default()
    }

    /// The sender replies go out through.
    pub fn sender(&self) -> &StatusSender {
        &self.sender
    }

    /// Dispatch a server-bound message.
    ///
    /// Errors mean the message was dropped without a reply.
    pub fn handle_message(
        &mut self,
        opcode: Opcode,
        ctx: &MessageContext,
        payload: &[u8],
        local: &NodeRecord,
    ) -> Result<(), VendorError> {
        metrics::counter!(
            metric_defs::SERVER_MESSAGES.name,
            &self.labels.with_opcode(opcode.name())
        )
        .increment(1);

        match opcode {
            Opcode::Set | Opcode::SetUnack => self.on_set(opcode, ctx, payload, local),
            Opcode::Get | Opcode::GetNodeDetails | Opcode::GetMeterData => {
                self.on_get(opcode, ctx, payload, local)
            }
            other => Err(VendorError::invalid_argument(format!(
                "{} is not handled by the server",
                other
            ))),
        }
    }

    fn on_set(
        &mut self,
        opcode: Opcode,
        ctx: &MessageContext,
        payload: &[u8],
        local: &NodeRecord,
    ) -> Result<(), VendorError> {
        if payload.len() > MAX_SET_PAYLOAD {
            warn!("{} from {}: payload of {} bytes too large", opcode, ctx.addr, payload.len());
            return Err(VendorError::Size {
                max: MAX_SET_PAYLOAD,
                actual: payload.len(),
            });
        }

        debug!("{} from {} ({} bytes)", opcode, ctx.addr, payload.len());

        self.scratch.clear();
        let incoming = Incoming { opcode, ctx, local };
        let outcome = (self.set_handler)(&incoming, payload, &mut self.scratch);

        match (opcode, outcome) {
            (Opcode::Set, Ok(Reply::Now)) => self
                .sender
                .send(Some(ctx), &VendorMessage::Status(self.scratch.as_slice().to_vec())),
            (_, Ok(_)) => {
                if opcode == Opcode::Set {
                    self.suppressed(opcode);
                }
                Ok(())
            }
            (_, Err(e)) => {
                debug!("{} handler failed: {}", opcode, e);
                if opcode == Opcode::Set {
                    self.suppressed(opcode);
                }
                Err(e)
            }
        }
    }

    fn on_get(
        &mut self,
        opcode: Opcode,
        ctx: &MessageContext,
        payload: &[u8],
        local: &NodeRecord,
    ) -> Result<(), VendorError> {
        let request = GetRequest::decode(opcode, payload).map_err(|e| {
            warn!("{} from {} dropped: {}", opcode, ctx.addr, e);
            match e {
                ProtocolError::UnknownGetKind(tag) => {
                    VendorError::invalid_argument(format!("unknown get kind {}", tag))
                }
                other => VendorError::Protocol(other),
            }
        })?;

        debug!(
            "{} from {}: kind={} length={:?}",
            opcode, ctx.addr, request.kind, request.length
        );

        self.scratch.clear();
        let incoming = Incoming { opcode, ctx, local };
        match (self.get_handler)(&incoming, &request, &mut self.scratch) {
            Ok(Reply::Now) => {}
            Ok(Reply::Later) => {
                self.suppressed(opcode);
                return Ok(());
            }
            Err(e) => {
                debug!("{} handler failed: {}", opcode, e);
                self.suppressed(opcode);
                return Err(e);
            }
        }

        match request.kind {
            GetKind::Status | GetKind::MeterData => {
                if let Some(length) = request.length {
                    self.scratch.truncate(length as usize);
                }
                let message = VendorMessage::status(request.kind, self.scratch.as_slice())?;
                self.sender.send(Some(ctx), &message)
            }
            GetKind::NodeDetails => {
                let record = NodeRecord::decode(self.scratch.as_slice())?;
                self.sender
                    .send(None, &VendorMessage::StatusNodeDetails(record))
            }
        }
    }

    fn suppressed(&self, opcode: Opcode) {
        metrics::counter!(
            metric_defs::SERVER_REPLIES_SUPPRESSED.name,
            &self.labels.with_opcode(opcode.name())
        )
        .increment(1);
    }
}
