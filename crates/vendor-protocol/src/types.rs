//! Protocol data types.

use crate::constants::*;
use crate::error::ProtocolError;
use crate::opcode::Opcode;
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Addresses
// ============================================================================

/// A 16-bit mesh network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeshAddress(pub u16);

impl MeshAddress {
    /// The unassigned address. Doubles as the "not found" result of a directory lookup.
    pub const UNASSIGNED: MeshAddress = MeshAddress(ADDR_UNASSIGNED);
    /// The all-nodes group address.
    pub const ALL_NODES: MeshAddress = MeshAddress(ADDR_ALL_NODES);

    /// Whether this is a unicast (single element) address.
    pub const fn is_unicast(self) -> bool {
        self.0 != ADDR_UNASSIGNED && self.0 <= ADDR_UNICAST_MAX
    }

    /// Whether this is a group address.
    pub const fn is_group(self) -> bool {
        self.0 >= ADDR_GROUP_MIN
    }

    /// Whether this is the unassigned address.
    pub const fn is_unassigned(self) -> bool {
        self.0 == ADDR_UNASSIGNED
    }
}

impl fmt::Display for MeshAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl From<u16> for MeshAddress {
    fn from(value: u16) -> Self {
        MeshAddress(value)
    }
}

/// Addressing information for a message.
///
/// On send, `addr` is the destination; on receive, it is the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContext {
    /// Peer address.
    pub addr: MeshAddress,
    /// Application key index used for the message.
    pub app_idx: u16,
    /// Time-to-live for outgoing messages.
    pub ttl: u8,
}

impl MessageContext {
    /// Default TTL used when none is configured.
    pub const DEFAULT_TTL: u8 = 7;

    /// Create a context for the given peer with default key and TTL.
    pub fn to(addr: impl Into<MeshAddress>) -> Self {
        MessageContext {
            addr: addr.into(),
            app_idx: 0,
            ttl: Self::DEFAULT_TTL,
        }
    }
}

// ============================================================================
// Serial Numbers
// ============================================================================

/// A node's unique serial number. Zero is reserved as the "empty" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SerialNumber(pub u64);

impl SerialNumber {
    /// The empty-slot sentinel.
    pub const EMPTY: SerialNumber = SerialNumber(0);

    /// Largest serial that fits the 6-byte device serial.
    pub const MAX_DEVICE_SN: u64 = (1 << (8 * DEVICE_SN_SIZE)) - 1;

    /// Whether this is the empty sentinel.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Build from the 6-byte persisted device serial (big-endian, zero-extended).
    pub fn from_device_sn(sn: [u8; DEVICE_SN_SIZE]) -> Self {
        let mut wide = [0u8; 8];
        wide[8 - DEVICE_SN_SIZE..].copy_from_slice(&sn);
        SerialNumber(u64::from_be_bytes(wide))
    }

    /// Build from a byte slice holding a 6-byte device serial.
    pub fn from_device_sn_slice(data: &[u8]) -> Result<Self, ProtocolError> {
        let sn: [u8; DEVICE_SN_SIZE] = data.try_into().map_err(|_| {
            ProtocolError::invalid_data(format!(
                "device serial must be {} bytes, got {}",
                DEVICE_SN_SIZE,
                data.len()
            ))
        })?;
        Ok(SerialNumber::from_device_sn(sn))
    }

    /// Whether the serial can be stored as a 6-byte device serial.
    pub const fn fits_device_sn(self) -> bool {
        self.0 <= Self::MAX_DEVICE_SN
    }

    /// The 6-byte device serial, or an error when the value is wider.
    pub fn try_to_device_sn(self) -> Result<[u8; DEVICE_SN_SIZE], ProtocolError> {
        if !self.fits_device_sn() {
            return Err(ProtocolError::invalid_data(format!(
                "serial {} does not fit {} bytes",
                self, DEVICE_SN_SIZE
            )));
        }
        Ok(self.to_device_sn())
    }

    /// The low 6 bytes, big-endian. Callers check [`fits_device_sn`](Self::fits_device_sn)
    /// first; wider serials lose their high bytes.
    pub fn to_device_sn(self) -> [u8; DEVICE_SN_SIZE] {
        let wide = self.0.to_be_bytes();
        let mut sn = [0u8; DEVICE_SN_SIZE];
        sn.copy_from_slice(&wide[8 - DEVICE_SN_SIZE..]);
        sn
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:012X}", self.0)
    }
}

impl From<u64> for SerialNumber {
    fn from(value: u64) -> Self {
        SerialNumber(value)
    }
}

// ============================================================================
// Node Record
// ============================================================================

/// Identity of a node as announced over the mesh.
///
/// Wire layout (12 bytes, little-endian, no padding):
///
/// | Field         | Size |
/// |---------------|------|
/// | serial_number | 8    |
/// | mesh_address  | 2    |
/// | capacity      | 1    |
/// | quality       | 1    |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unique serial number.
    pub serial_number: SerialNumber,
    /// Mesh address the node answers on.
    pub mesh_address: MeshAddress,
    /// Backhaul capacity reported by the node.
    pub capacity: u8,
    /// Link quality reported by the node.
    pub quality: u8,
}

impl NodeRecord {
    /// Create a new node record.
    pub fn new(
        serial_number: impl Into<SerialNumber>,
        mesh_address: impl Into<MeshAddress>,
        capacity: u8,
        quality: u8,
    ) -> Self {
        NodeRecord {
            serial_number: serial_number.into(),
            mesh_address: mesh_address.into(),
            capacity,
            quality,
        }
    }

    /// Encode into the fixed 12-byte layout.
    pub fn encode(&self) -> [u8; NODE_RECORD_SIZE] {
        let mut buf = [0u8; NODE_RECORD_SIZE];
        let mut out = &mut buf[..];
        out.put_u64_le(self.serial_number.0);
        out.put_u16_le(self.mesh_address.0);
        out.put_u8(self.capacity);
        out.put_u8(self.quality);
        buf
    }

    /// Decode from the fixed layout. Trailing bytes are ignored.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        ProtocolError::ensure_len(data, NODE_RECORD_SIZE)?;
        let mut buf = data;
        Ok(NodeRecord {
            serial_number: SerialNumber(buf.get_u64_le()),
            mesh_address: MeshAddress(buf.get_u16_le()),
            capacity: buf.get_u8(),
            quality: buf.get_u8(),
        })
    }
}

// ============================================================================
// Get Requests
// ============================================================================

/// What a Get asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GetKind {
    /// A plain Status.
    Status,
    /// The server's node record.
    NodeDetails,
    /// The server's meter data.
    MeterData,
}

impl GetKind {
    /// The legacy tag byte for this kind.
    pub const fn tag(self) -> u8 {
        match self {
            GetKind::Status => GET_TAG_STATUS,
            GetKind::NodeDetails => GET_TAG_NODE_DETAILS,
            GetKind::MeterData => GET_TAG_METER_DATA,
        }
    }

    /// Parse a legacy tag byte.
    pub fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            GET_TAG_STATUS => Ok(GetKind::Status),
            GET_TAG_NODE_DETAILS => Ok(GetKind::NodeDetails),
            GET_TAG_METER_DATA => Ok(GetKind::MeterData),
            other => Err(ProtocolError::UnknownGetKind(other)),
        }
    }
}

impl fmt::Display for GetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GetKind::Status => write!(f, "status"),
            GetKind::NodeDetails => write!(f, "node_details"),
            GetKind::MeterData => write!(f, "meter_data"),
        }
    }
}

/// A decoded Get request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetRequest {
    /// Requested kind.
    pub kind: GetKind,
    /// Optional maximum response length.
    pub length: Option<u16>,
}

impl GetRequest {
    /// A Get for the given kind without a length hint.
    pub fn new(kind: GetKind) -> Self {
        GetRequest { kind, length: None }
    }

    /// Attach a length hint.
    pub fn with_length(mut self, length: u16) -> Self {
        self.length = Some(length);
        self
    }

    /// The opcode this request is sent with.
    pub fn opcode(&self) -> Opcode {
        Opcode::get_for(self.kind)
    }

    /// Encode the payload (without opcode): empty, or the 2-byte length hint.
    ///
    /// The kind travels in the opcode, so no tag byte is ever written.
    pub fn encode_payload(&self) -> Vec<u8> {
        match self.length {
            Some(length) => length.to_le_bytes().to_vec(),
            None => Vec::new(),
        }
    }

    /// Decode a Get payload received with `opcode`.
    ///
    /// The layout is detected by exact size:
    /// - 0 bytes: no length hint
    /// - 2 bytes: length hint
    /// - 3 bytes: length hint + kind tag (plain `GET` only)
    ///
    /// The tag byte is only read when exactly three bytes are present.
    pub fn decode(opcode: Opcode, payload: &[u8]) -> Result<Self, ProtocolError> {
        let kind = match opcode {
            Opcode::Get => GetKind::Status,
            Opcode::GetNodeDetails => GetKind::NodeDetails,
            Opcode::GetMeterData => GetKind::MeterData,
            other => {
                return Err(ProtocolError::invalid_data(format!(
                    "{} is not a get opcode",
                    other
                )))
            }
        };

        match payload.len() {
            0 => Ok(GetRequest { kind, length: None }),
            GET_LENGTH_HINT_SIZE => Ok(GetRequest {
                kind,
                length: Some(u16::from_le_bytes([payload[0], payload[1]])),
            }),
            GET_TAGGED_SIZE if opcode == Opcode::Get => Ok(GetRequest {
                kind: GetKind::from_tag(payload[2])?,
                length: Some(u16::from_le_bytes([payload[0], payload[1]])),
            }),
            other => Err(ProtocolError::invalid_data(format!(
                "malformed {} payload of {} bytes",
                opcode, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_classes() {
        assert!(MeshAddress(0x0001).is_unicast());
        assert!(!MeshAddress::UNASSIGNED.is_unicast());
        assert!(MeshAddress(0xC000).is_group());
        assert!(MeshAddress::ALL_NODES.is_group());
        assert!(!MeshAddress(0x8000).is_group());
        assert_eq!(MeshAddress(0x1A).to_string(), "0x001A");
    }

    #[test]
    fn test_serial_from_device_sn() {
        let serial = SerialNumber::from_device_sn([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(serial.0, 0x0102_0304_0506);
        assert_eq!(serial.to_device_sn(), [0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(serial.to_string(), "0x010203040506");
        assert_eq!(serial.try_to_device_sn().unwrap(), [0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert!(SerialNumber::from_device_sn_slice(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_serial_wider_than_device_sn() {
        let wide = SerialNumber(0x0100_0000_0000_0001);
        assert!(!wide.fits_device_sn());
        assert!(wide.try_to_device_sn().is_err());
        assert_eq!(wide.to_string(), "0x100000000000001");
        assert_ne!(wide.to_string(), SerialNumber(1).to_string());
        assert_eq!(SerialNumber(1).to_string(), "0x000000000001");

        let max = SerialNumber(SerialNumber::MAX_DEVICE_SN);
        assert!(max.fits_device_sn());
        assert_eq!(max.try_to_device_sn().unwrap(), [0xFF; 6]);
    }

    #[test]
    fn test_node_record_layout() {
        let record = NodeRecord::new(0x1122_3344_5566_7788u64, 0x0102, 7, 200);
        let bytes = record.encode();
        assert_eq!(
            bytes,
            [0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0x02, 0x01, 7, 200]
        );
        assert_eq!(NodeRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_node_record_too_short() {
        let err = NodeRecord::decode(&[0u8; 11]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::FrameTooShort {
                expected: 12,
                actual: 11
            }
        );
    }

    #[test]
    fn test_get_decode_by_size() {
        let req = GetRequest::decode(Opcode::Get, &[]).unwrap();
        assert_eq!(req, GetRequest::new(GetKind::Status));

        let req = GetRequest::decode(Opcode::GetMeterData, &[0x10, 0x00]).unwrap();
        assert_eq!(req, GetRequest::new(GetKind::MeterData).with_length(16));

        let req = GetRequest::decode(Opcode::Get, &[0x05, 0x00, GET_TAG_NODE_DETAILS]).unwrap();
        assert_eq!(req, GetRequest::new(GetKind::NodeDetails).with_length(5));
    }

    #[test]
    fn test_get_decode_rejects_bad_shapes() {
        assert_eq!(
            GetRequest::decode(Opcode::Get, &[0, 0, 9]),
            Err(ProtocolError::UnknownGetKind(9))
        );
        // A tag is only honored on the plain GET opcode.
        assert!(GetRequest::decode(Opcode::GetNodeDetails, &[0, 0, 1]).is_err());
        assert!(GetRequest::decode(Opcode::Get, &[1]).is_err());
        assert!(GetRequest::decode(Opcode::Set, &[]).is_err());
    }

    #[test]
    fn test_get_encode_never_tags() {
        assert!(GetRequest::new(GetKind::NodeDetails).encode_payload().is_empty());
        assert_eq!(
            GetRequest::new(GetKind::Status).with_length(300).encode_payload(),
            vec![0x2C, 0x01]
        );
    }
}
