//! Mesh vendor model node.
//!
//! This crate implements both sides of a vendor-specific mesh model plus the
//! state a node keeps about its peers:
//!
//! - [`VendorClient`]: acknowledged Set/Get requests with reply correlation
//! - [`VendorServer`]: dispatches Set and Get to application handlers
//! - [`NodeDirectory`]: bounded serial number to address table
//! - [`PublishScheduler`]: periodic purge and node details announcement
//! - [`VendorNode`]: runs all of the above on a per-node runtime thread
//! - [`HostBridge`]: host command interface on top of a node
//!
//! The mesh stack itself is abstracted behind [`MeshTransport`];
//! [`LoopbackMesh`] connects nodes in-process.
//!
//! ## Example
//!
//! ```no_run
//! use vendor_node::{LoopbackMesh, NodeConfig, Reply, VendorNode};
//! use vendor_protocol::{GetKind, MeshAddress, MessageContext};
//!
//! let mesh = LoopbackMesh::new();
//! let config = NodeConfig::new("meter", 0x0002);
//! let (port, inbox) = mesh.attach(config.address, config.publish_address);
//!
//! let node = VendorNode::builder(config)
//!     .on_set(|_, payload, rsp| {
//!         rsp.extend_from_slice(payload)?;
//!         Ok(Reply::Now)
//!     })
//!     .on_get(|incoming, _, rsp| {
//!         rsp.put_record(incoming.local)?;
//!         Ok(Reply::Now)
//!     })
//!     .start(port, inbox)?;
//!
//! let reply = node.client().get(GetKind::NodeDetails, Some(&MessageContext::to(0x0003u16)))?;
//! println!("{:?}", reply.node_record()?);
//! # Ok::<(), vendor_node::VendorError>(())
//! ```

pub mod bridge;
pub mod client;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod node;
pub mod scheduler;
pub mod server;
pub mod settings;
pub mod transport;

pub use bridge::{spawn_host_bridge, urc_for, HostBridge, HostBridgeHandle};
pub use client::{
    ReceivedStatus, StatusReply, SubscriptionId, VendorClient, DEFAULT_REQUEST_TIMEOUT,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{NetworkConfig, NodeConfig};
pub use directory::{
    DirectoryEntry, NodeDirectory, UpsertOutcome, DEFAULT_DIRECTORY_CAPACITY, DEFAULT_NODE_MAX_AGE,
};
pub use error::{errno, ConfigError, SettingsError, TransportError, VendorError};
pub use node::{
    ModelRegistration, NodeBuilder, NodeCommand, OpcodeEntry, Registration, TickReport, VendorNode,
};
pub use scheduler::{
    CycleOutcome, DelayedWork, PublishScheduler, SchedulerConfig, DEFAULT_PUBLISH_INTERVAL,
    DEFAULT_PUBLISH_JITTER,
};
pub use server::{Incoming, Reply, StatusBuffer, StatusSender, VendorServer, VendorServerBuilder};
pub use settings::{JsonFileSettings, MemorySettings, Settings, SettingsStore, SETTINGS_KEY_SN};
pub use transport::{InboundFrame, LoopbackMesh, LoopbackPort, MeshTransport};
