//! Vendor opcodes.
//!
//! Every vendor model message starts with a 3-byte opcode:
//!
//! ```text
//! +--------------------+-----------+-----------+
//! | 0xC0 | op (6 bits) | cid_lo    | cid_hi    |
//! +--------------------+-----------+-----------+
//! ```

use crate::constants::*;
use crate::error::ProtocolError;
use crate::types::GetKind;
use std::fmt;

/// The opcodes understood by the vendor client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Acknowledged Set.
    Set,
    /// Unacknowledged Set.
    SetUnack,
    /// Get for a plain Status.
    Get,
    /// Get for node details.
    GetNodeDetails,
    /// Get for meter data.
    GetMeterData,
    /// Plain Status.
    Status,
    /// Status carrying a node record.
    StatusNodeDetails,
    /// Status carrying meter data.
    StatusMeterData,
}

impl Opcode {
    /// All opcodes handled by the server model.
    pub const SERVER_OPCODES: [Opcode; 5] = [
        Opcode::Set,
        Opcode::SetUnack,
        Opcode::Get,
        Opcode::GetNodeDetails,
        Opcode::GetMeterData,
    ];

    /// All opcodes handled by the client model.
    pub const CLIENT_OPCODES: [Opcode; 3] = [
        Opcode::Status,
        Opcode::StatusNodeDetails,
        Opcode::StatusMeterData,
    ];

    /// The 6-bit opcode number.
    pub const fn number(self) -> u8 {
        match self {
            Opcode::Set => OP_SET,
            Opcode::SetUnack => OP_SET_UNACK,
            Opcode::Get => OP_GET,
            Opcode::GetNodeDetails => OP_GET_NODE_DETAILS,
            Opcode::GetMeterData => OP_GET_METER_DATA,
            Opcode::Status => OP_STATUS,
            Opcode::StatusNodeDetails => OP_STATUS_NODE_DETAILS,
            Opcode::StatusMeterData => OP_STATUS_METER_DATA,
        }
    }

    /// Look up an opcode by its 6-bit number.
    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            OP_SET => Some(Opcode::Set),
            OP_SET_UNACK => Some(Opcode::SetUnack),
            OP_GET => Some(Opcode::Get),
            OP_GET_NODE_DETAILS => Some(Opcode::GetNodeDetails),
            OP_GET_METER_DATA => Some(Opcode::GetMeterData),
            OP_STATUS => Some(Opcode::Status),
            OP_STATUS_NODE_DETAILS => Some(Opcode::StatusNodeDetails),
            OP_STATUS_METER_DATA => Some(Opcode::StatusMeterData),
            _ => None,
        }
    }

    /// Encode as the 3-byte vendor opcode.
    pub fn to_bytes(self) -> [u8; VENDOR_OPCODE_SIZE] {
        let cid = COMPANY_ID.to_le_bytes();
        [VENDOR_OPCODE_MARKER | self.number(), cid[0], cid[1]]
    }

    /// Decode the 3-byte vendor opcode at the start of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        ProtocolError::ensure_len(data, VENDOR_OPCODE_SIZE)?;
        let raw = [data[0], data[1], data[2]];

        if raw[0] & VENDOR_OPCODE_MARKER != VENDOR_OPCODE_MARKER
            || u16::from_le_bytes([raw[1], raw[2]]) != COMPANY_ID
        {
            return Err(ProtocolError::UnknownOpcode(raw));
        }

        Opcode::from_number(raw[0] & !VENDOR_OPCODE_MARKER).ok_or(ProtocolError::UnknownOpcode(raw))
    }

    /// The Get opcode used to request the given kind.
    pub const fn get_for(kind: GetKind) -> Self {
        match kind {
            GetKind::Status => Opcode::Get,
            GetKind::NodeDetails => Opcode::GetNodeDetails,
            GetKind::MeterData => Opcode::GetMeterData,
        }
    }

    /// The Status opcode that answers the given kind.
    pub const fn status_for(kind: GetKind) -> Self {
        match kind {
            GetKind::Status => Opcode::Status,
            GetKind::NodeDetails => Opcode::StatusNodeDetails,
            GetKind::MeterData => Opcode::StatusMeterData,
        }
    }

    /// Whether the opcode is a Status addressed to the client model.
    pub const fn is_status(self) -> bool {
        matches!(
            self,
            Opcode::Status | Opcode::StatusNodeDetails | Opcode::StatusMeterData
        )
    }

    /// Short uppercase name used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Opcode::Set => "SET",
            Opcode::SetUnack => "SET_UNACK",
            Opcode::Get => "GET",
            Opcode::GetNodeDetails => "GET_NODE_DETAILS",
            Opcode::GetMeterData => "GET_METER_DATA",
            Opcode::Status => "STATUS",
            Opcode::StatusNodeDetails => "STATUS_NODE_DETAILS",
            Opcode::StatusMeterData => "STATUS_METER_DATA",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
