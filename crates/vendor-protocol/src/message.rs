//! Vendor model messages.
//!
//! A message on the wire is the 3-byte vendor opcode followed by the payload:
//!
//! ```text
//! +----------------+----------------------+
//! | opcode (3)     | payload[0..len]      |
//! +----------------+----------------------+
//! ```

use crate::constants::*;
use crate::error::ProtocolError;
use crate::opcode::Opcode;
use crate::types::*;

/// A vendor model message, tagged by opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorMessage {
    /// Acknowledged Set.
    Set(Vec<u8>),
    /// Unacknowledged Set.
    SetUnack(Vec<u8>),
    /// Get for any kind. The opcode is chosen from the kind.
    Get(GetRequest),
    /// Plain Status.
    Status(Vec<u8>),
    /// Status carrying a node record.
    StatusNodeDetails(NodeRecord),
    /// Status carrying meter data.
    StatusMeterData(Vec<u8>),
}

impl VendorMessage {
    /// The opcode this message is sent with.
    pub fn opcode(&self) -> Opcode {
        match self {
            VendorMessage::Set(_) => Opcode::Set,
            VendorMessage::SetUnack(_) => Opcode::SetUnack,
            VendorMessage::Get(req) => req.opcode(),
            VendorMessage::Status(_) => Opcode::Status,
            VendorMessage::StatusNodeDetails(_) => Opcode::StatusNodeDetails,
            VendorMessage::StatusMeterData(_) => Opcode::StatusMeterData,
        }
    }

    /// Build the Status message answering `kind` from a raw payload.
    ///
    /// Node details must decode as a node record.
    pub fn status(kind: GetKind, payload: &[u8]) -> Result<Self, ProtocolError> {
        Ok(match kind {
            GetKind::Status => VendorMessage::Status(payload.to_vec()),
            GetKind::NodeDetails => VendorMessage::StatusNodeDetails(NodeRecord::decode(payload)?),
            GetKind::MeterData => VendorMessage::StatusMeterData(payload.to_vec()),
        })
    }

    /// Encode into a wire frame, checking payload limits.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload: Vec<u8> = match self {
            VendorMessage::Set(data) | VendorMessage::SetUnack(data) => {
                check_payload(data, MAX_SET_PAYLOAD)?;
                data.clone()
            }
            VendorMessage::Get(req) => req.encode_payload(),
            VendorMessage::Status(data) | VendorMessage::StatusMeterData(data) => {
                check_payload(data, MAX_STATUS_PAYLOAD)?;
                data.clone()
            }
            VendorMessage::StatusNodeDetails(record) => record.encode().to_vec(),
        };

        let mut buf = Vec::with_capacity(VENDOR_OPCODE_SIZE + payload.len());
        buf.extend_from_slice(&self.opcode().to_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a wire frame.
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (opcode, payload) = split_frame(frame)?;

        match opcode {
            Opcode::Set => {
                check_payload(payload, MAX_SET_PAYLOAD)?;
                Ok(VendorMessage::Set(payload.to_vec()))
            }
            Opcode::SetUnack => {
                check_payload(payload, MAX_SET_PAYLOAD)?;
                Ok(VendorMessage::SetUnack(payload.to_vec()))
            }
            Opcode::Get | Opcode::GetNodeDetails | Opcode::GetMeterData => {
                Ok(VendorMessage::Get(GetRequest::decode(opcode, payload)?))
            }
            Opcode::Status => {
                check_payload(payload, MAX_STATUS_PAYLOAD)?;
                Ok(VendorMessage::Status(payload.to_vec()))
            }
            Opcode::StatusNodeDetails => {
                Ok(VendorMessage::StatusNodeDetails(NodeRecord::decode(payload)?))
            }
            Opcode::StatusMeterData => {
                check_payload(payload, MAX_STATUS_PAYLOAD)?;
                Ok(VendorMessage::StatusMeterData(payload.to_vec()))
            }
        }
    }
}

/// Split a frame into its opcode and payload without interpreting the payload.
pub fn split_frame(frame: &[u8]) -> Result<(Opcode, &[u8]), ProtocolError> {
    let opcode = Opcode::from_bytes(frame)?;
    Ok((opcode, &frame[VENDOR_OPCODE_SIZE..]))
}

fn check_payload(data: &[u8], max: usize) -> Result<(), ProtocolError> {
    if data.len() > max {
        return Err(ProtocolError::PayloadTooLong {
            max,
            actual: data.len(),
        });
    }
    Ok(())
}
