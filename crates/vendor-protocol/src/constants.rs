//! Protocol constants
//!
//! These constants define the model identifiers, opcode numbers, payload
//! limits and host bridge command codes used by the vendor model.

// ============================================================================
// Model Identity
// ============================================================================

/// Company identifier carried in every vendor opcode.
pub const COMPANY_ID: u16 = 0x0059;
/// Model identifier of the vendor server.
pub const MODEL_ID_SERVER: u16 = 0x1000;
/// Model identifier of the vendor client.
pub const MODEL_ID_CLIENT: u16 = 0x1001;

// ============================================================================
// Opcode Numbers (low 6 bits of the first opcode byte)
// ============================================================================

/// Acknowledged Set.
pub const OP_SET: u8 = 0x10;
/// Get for a plain Status.
pub const OP_GET: u8 = 0x11;
/// Plain Status.
pub const OP_STATUS: u8 = 0x12;
/// Unacknowledged Set.
pub const OP_SET_UNACK: u8 = 0x13;
/// Status carrying a node record.
pub const OP_STATUS_NODE_DETAILS: u8 = 0x14;
/// Status carrying meter data.
pub const OP_STATUS_METER_DATA: u8 = 0x15;
/// Get for node details.
pub const OP_GET_NODE_DETAILS: u8 = 0x16;
/// Get for meter data.
pub const OP_GET_METER_DATA: u8 = 0x17;

/// Marker bits of a 3-byte vendor opcode.
pub const VENDOR_OPCODE_MARKER: u8 = 0xC0;
/// Size of an encoded vendor opcode.
pub const VENDOR_OPCODE_SIZE: usize = 3;

// ============================================================================
// Payload Limits
// ============================================================================

/// Maximum Set payload (excluding the 3 byte opcode).
pub const MAX_SET_PAYLOAD: usize = 377;
/// Maximum Status payload (excluding the 3 byte opcode).
pub const MAX_STATUS_PAYLOAD: usize = 377;
/// Size of the optional Get length hint.
pub const GET_LENGTH_HINT_SIZE: usize = 2;
/// Size of a legacy Get payload carrying both a length hint and a kind tag.
pub const GET_TAGGED_SIZE: usize = 3;

// ============================================================================
// Get Kind Tags (legacy 3-byte Get payloads)
// ============================================================================

/// Tag for a plain Status request.
pub const GET_TAG_STATUS: u8 = 0;
/// Tag for a node details request.
pub const GET_TAG_NODE_DETAILS: u8 = 1;
/// Tag for a meter data request.
pub const GET_TAG_METER_DATA: u8 = 2;

// ============================================================================
// Node Record Layout
// ============================================================================

/// Encoded size of a node record: serial(8) + address(2) + capacity(1) + quality(1).
pub const NODE_RECORD_SIZE: usize = 12;
/// Size of the persisted device serial number.
pub const DEVICE_SN_SIZE: usize = 6;

// ============================================================================
// Mesh Addresses
// ============================================================================

/// The unassigned address, also the "not found" sentinel.
pub const ADDR_UNASSIGNED: u16 = 0x0000;
/// Highest unicast address.
pub const ADDR_UNICAST_MAX: u16 = 0x7FFF;
/// First group address.
pub const ADDR_GROUP_MIN: u16 = 0xC000;
/// The all-nodes group address.
pub const ADDR_ALL_NODES: u16 = 0xFFFF;

// ============================================================================
// Host Bridge Command Codes (host → node)
// ============================================================================

/// Ping; answered with the device status byte.
pub const HOST_CMD_PING: u8 = 0x01;
/// Persist a new device serial number.
pub const HOST_CMD_SET_DEVICE_SN: u8 = 0x10;
/// Query node details of a peer by serial number.
pub const HOST_CMD_GET_NODE_DETAILS: u8 = 0x11;
/// Query meter data of a peer by serial number.
pub const HOST_CMD_GET_METER_DATA: u8 = 0x12;
/// Unsolicited report from the node.
pub const HOST_CMD_REPORT_URC: u8 = 0xFE;
/// Command failed; payload is a big-endian i16 error code.
pub const HOST_CMD_ERROR: u8 = 0xFF;

/// Host record header: cmd(1) + len_be16(2).
pub const HOST_HEADER_SIZE: usize = 3;
/// Maximum host record payload.
pub const HOST_MAX_PAYLOAD: usize = 400;

// ============================================================================
// Device Status Bits (Ping response)
// ============================================================================

/// Node is provisioned into a mesh network.
pub const STATUS_PROVISIONED: u8 = 1 << 0;
/// A serial number has been configured.
pub const STATUS_SN_CONFIGURED: u8 = 1 << 1;
/// Host bridge is ready.
pub const STATUS_BRIDGE_READY: u8 = 1 << 2;

// ============================================================================
// Unsolicited Report Codes
// ============================================================================

/// A Status arrived that did not answer a host request.
pub const URC_STATUS_RECEIVED: u8 = 0x01;
/// A node details announcement refreshed the directory.
pub const URC_NODE_DETAILS: u8 = 0x02;
