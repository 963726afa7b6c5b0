//! Mesh Vendor Model Protocol
//!
//! This crate provides the wire types of a vendor-specific mesh model: a
//! Set / Get / Status exchange between a client and a server, plus the node
//! record that nodes announce to each other and the host bridge records used
//! by an attached host processor.
//!
//! # Protocol Overview
//!
//! Every mesh message starts with a 3-byte vendor opcode (see [`Opcode`]):
//!
//! - **Set / SetUnack** (client → server): opaque payload up to 377 bytes
//! - **Get** (client → server): kind carried in the opcode, optional length hint
//! - **Status** (server → client): plain, node details or meter data
//!
//! The host bridge uses `cmd | len_be16 | data` records (see [`HostCommand`]
//! and [`HostResponse`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use vendor_protocol::{GetKind, GetRequest, VendorMessage};
//!
//! let frame = VendorMessage::Get(GetRequest::new(GetKind::NodeDetails)).encode()?;
//! let message = VendorMessage::decode(&received)?;
//! ```

mod constants;
mod error;
mod host;
mod message;
mod opcode;
mod types;

pub use constants::*;
pub use error::*;
pub use host::*;
pub use message::*;
pub use opcode::*;
pub use types::*;
