//! Mesh transport seam and an in-memory loopback mesh.
//!
//! The node never talks to a radio directly. Everything it sends goes through
//! [`MeshTransport`], and everything it receives arrives as [`InboundFrame`]s
//! on a crossbeam channel.

use crate::error::TransportError;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;
use vendor_protocol::{MeshAddress, MessageContext};

/// What the node needs from the mesh stack.
pub trait MeshTransport: Send + Sync {
    /// Own unicast address.
    fn address(&self) -> MeshAddress;

    /// Send a frame to `ctx.addr`.
    fn send(&self, ctx: &MessageContext, frame: &[u8]) -> Result<(), TransportError>;

    /// Send a frame to the model's configured publish address.
    fn publish(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Whether the node has joined a mesh network.
    fn is_provisioned(&self) -> bool;
}

/// A frame received from the mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Sender address.
    pub src: MeshAddress,
    /// Destination the frame was sent to (own address or a group).
    pub dst: MeshAddress,
    /// Opcode and payload.
    pub data: Vec<u8>,
}

impl InboundFrame {
    /// Receive context for handlers: `addr` is the sender.
    pub fn context(&self) -> MessageContext {
        MessageContext::to(self.src)
    }
}

// ============================================================================
// Loopback Mesh
// ============================================================================

/// An in-memory mesh connecting any number of endpoints.
///
/// Unicast frames reach the endpoint with the destination address, or are
/// silently lost when there is none. Group frames reach every endpoint
/// except the sender.
#[derive(Clone, Default)]
pub struct LoopbackMesh {
    endpoints: Arc<RwLock<HashMap<MeshAddress, Sender<InboundFrame>>>>,
}

impl LoopbackMesh {
    /// Create an empty mesh.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint. Returns its transport and inbox.
    ///
    /// Attaching an address twice replaces the earlier endpoint.
    pub fn attach(
        &self,
        address: MeshAddress,
        publish_address: MeshAddress,
    ) -> (Arc<LoopbackPort>, Receiver<InboundFrame>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.endpoints.write().insert(address, tx);

        let port = Arc::new(LoopbackPort {
            address,
            publish_address,
            mesh: self.clone(),
            provisioned: AtomicBool::new(true),
        });
        (port, rx)
    }

    /// Detach an endpoint. Frames to it are lost from now on.
    pub fn detach(&self, address: MeshAddress) {
        self.endpoints.write().remove(&address);
    }

    /// Number of attached endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    /// Whether no endpoint is attached.
    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }

    fn deliver(&self, src: MeshAddress, dst: MeshAddress, data: &[u8]) -> Result<(), TransportError> {
        let endpoints = self.endpoints.read();
        if !endpoints.contains_key(&src) {
            return Err(TransportError::Detached(src.0));
        }

        let frame = InboundFrame {
            src,
            dst,
            data: data.to_vec(),
        };

        if dst.is_unicast() {
            match endpoints.get(&dst) {
                // A closed inbox means the node stopped; the frame is lost like on air.
                Some(tx) => {
                    let _ = tx.send(frame);
                }
                None => trace!("no endpoint at {}, frame lost", dst),
            }
            return Ok(());
        }

        for (addr, tx) in endpoints.iter() {
            if *addr != src {
                let _ = tx.send(frame.clone());
            }
        }
        Ok(())
    }
}

/// One endpoint of a [`LoopbackMesh`].
pub struct LoopbackPort {
    address: MeshAddress,
    publish_address: MeshAddress,
    mesh: LoopbackMesh,
    provisioned: AtomicBool,
}

impl LoopbackPort {
    /// Simulate joining or leaving the network.
    pub fn set_provisioned(&self, provisioned: bool) {
        self.provisioned.store(provisioned, Ordering::SeqCst);
    }

    /// The configured publish address.
    pub fn publish_address(&self) -> MeshAddress {
        self.publish_address
    }
}

impl MeshTransport for LoopbackPort {
    fn address(&self) -> MeshAddress {
        self.address
    }

    fn send(&self, ctx: &MessageContext, frame: &[u8]) -> Result<(), TransportError> {
        if !self.is_provisioned() {
            return Err(TransportError::NotProvisioned);
        }
        self.mesh.deliver(self.address, ctx.addr, frame)
    }

    fn publish(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.is_provisioned() {
            return Err(TransportError::NotProvisioned);
        }
        if self.publish_address.is_unassigned() {
            return Err(TransportError::Delivery("no publish address".to_string()));
        }
        self.mesh.deliver(self.address, self.publish_address, frame)
    }

    fn is_provisioned(&self) -> bool {
        self.provisioned.load(Ordering::SeqCst)
    }
}
