//! Host bridge command and response records.
//!
//! The host talks to the node over a byte stream. The framing layer hands over
//! complete records of the form:
//!
//! ```text
//! +--------+--------+--------+-------------------+
//! | cmd    | len_hi | len_lo | data[0..len]      |
//! +--------+--------+--------+-------------------+
//! ```
//!
//! Responses echo the command code; failures answer with [`HOST_CMD_ERROR`]
//! and a big-endian i16 error code.

use crate::constants::*;
use crate::error::ProtocolError;
use crate::types::*;
use bytes::BufMut;

/// Split a host record into its command code and data.
pub fn decode_record(record: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    ProtocolError::ensure_len(record, HOST_HEADER_SIZE)?;
    let len = u16::from_be_bytes([record[1], record[2]]) as usize;
    if len > HOST_MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLong {
            max: HOST_MAX_PAYLOAD,
            actual: len,
        });
    }
    ProtocolError::ensure_len(record, HOST_HEADER_SIZE + len)?;
    Ok((record[0], &record[HOST_HEADER_SIZE..HOST_HEADER_SIZE + len]))
}

/// Build a host record from a command code and data.
pub fn encode_record(cmd: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HOST_HEADER_SIZE + data.len());
    buf.push(cmd);
    buf.put_u16(data.len() as u16);
    buf.extend_from_slice(data);
    buf
}

/// Commands sent by the host to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    /// Liveness check.
    Ping,
    /// Persist a new device serial number.
    SetDeviceSn(SerialNumber),
    /// Fetch the node record of the peer with the given serial.
    GetNodeDetails(SerialNumber),
    /// Fetch the meter data of the peer with the given serial.
    GetMeterData(SerialNumber),
}

impl HostCommand {
    /// The command code.
    pub fn code(&self) -> u8 {
        match self {
            HostCommand::Ping => HOST_CMD_PING,
            HostCommand::SetDeviceSn(_) => HOST_CMD_SET_DEVICE_SN,
            HostCommand::GetNodeDetails(_) => HOST_CMD_GET_NODE_DETAILS,
            HostCommand::GetMeterData(_) => HOST_CMD_GET_METER_DATA,
        }
    }

    /// Encode into a host record.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            HostCommand::Ping => encode_record(HOST_CMD_PING, &[]),
            HostCommand::SetDeviceSn(sn)
            | HostCommand::GetNodeDetails(sn)
            | HostCommand::GetMeterData(sn) => encode_record(self.code(), &sn.to_device_sn()),
        }
    }

    /// Decode a host record.
    pub fn decode(record: &[u8]) -> Result<Self, ProtocolError> {
        let (cmd, data) = decode_record(record)?;

        match cmd {
            HOST_CMD_PING => Ok(HostCommand::Ping),
            HOST_CMD_SET_DEVICE_SN => Ok(HostCommand::SetDeviceSn(
                SerialNumber::from_device_sn_slice(data)?,
            )),
            HOST_CMD_GET_NODE_DETAILS => Ok(HostCommand::GetNodeDetails(
                SerialNumber::from_device_sn_slice(data)?,
            )),
            HOST_CMD_GET_METER_DATA => Ok(HostCommand::GetMeterData(
                SerialNumber::from_device_sn_slice(data)?,
            )),
            other => Err(ProtocolError::UnknownHostCommand(other)),
        }
    }
}

/// Responses and reports sent by the node to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostResponse {
    /// Answer to `Ping` with the device status bits.
    Pong {
        /// `STATUS_*` bits.
        status: u8,
    },
    /// Serial number stored.
    DeviceSnSet,
    /// Node record of the requested peer.
    NodeDetails(NodeRecord),
    /// Meter data of the requested peer.
    MeterData(Vec<u8>),
    /// Unsolicited report.
    Urc {
        /// `URC_*` code.
        code: u8,
        /// Report body.
        data: Vec<u8>,
    },
    /// Command failed.
    Error {
        /// Negative errno-style code.
        code: i16,
    },
}

impl HostResponse {
    /// Encode into a host record.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            HostResponse::Pong { status } => encode_record(HOST_CMD_PING, &[*status]),
            HostResponse::DeviceSnSet => encode_record(HOST_CMD_SET_DEVICE_SN, &[]),
            HostResponse::NodeDetails(record) => {
                encode_record(HOST_CMD_GET_NODE_DETAILS, &record.encode())
            }
            HostResponse::MeterData(data) => encode_record(HOST_CMD_GET_METER_DATA, data),
            HostResponse::Urc { code, data } => {
                let mut body = Vec::with_capacity(1 + data.len());
                body.push(*code);
                body.extend_from_slice(data);
                encode_record(HOST_CMD_REPORT_URC, &body)
            }
            HostResponse::Error { code } => encode_record(HOST_CMD_ERROR, &code.to_be_bytes()),
        }
    }

    /// Decode a host record.
    pub fn decode(record: &[u8]) -> Result<Self, ProtocolError> {
        let (cmd, data) = decode_record(record)?;

        match cmd {
            HOST_CMD_PING => {
                ProtocolError::ensure_len(data, 1)?;
                Ok(HostResponse::Pong { status: data[0] })
            }
            HOST_CMD_SET_DEVICE_SN => Ok(HostResponse::DeviceSnSet),
            HOST_CMD_GET_NODE_DETAILS => Ok(HostResponse::NodeDetails(NodeRecord::decode(data)?)),
            HOST_CMD_GET_METER_DATA => Ok(HostResponse::MeterData(data.to_vec())),
            HOST_CMD_REPORT_URC => {
                ProtocolError::ensure_len(data, 1)?;
                Ok(HostResponse::Urc {
                    code: data[0],
                    data: data[1..].to_vec(),
                })
            }
            HOST_CMD_ERROR => {
                ProtocolError::ensure_len(data, 2)?;
                Ok(HostResponse::Error {
                    code: i16::from_be_bytes([data[0], data[1]]),
                })
            }
            other => Err(ProtocolError::UnknownHostCommand(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_header_is_big_endian() {
        let record = encode_record(0x12, &[0u8; 300]);
        assert_eq!(&record[..3], &[0x12, 0x01, 0x2C]);
        assert_eq!(record.len(), 303);
    }

    #[test]
    fn test_decode_command() {
        let record = [0x11, 0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0x12, 0x34];
        assert_eq!(
            HostCommand::decode(&record).unwrap(),
            HostCommand::GetNodeDetails(SerialNumber(0x1234))
        );
        assert_eq!(HostCommand::decode(&[0x01, 0x00, 0x00]).unwrap(), HostCommand::Ping);
    }

    #[test]
    fn test_decode_command_errors() {
        // Length field larger than the data present.
        assert!(HostCommand::decode(&[0x10, 0x00, 0x06, 1, 2]).is_err());
        // Wrong serial size.
        assert!(HostCommand::decode(&[0x10, 0x00, 0x02, 1, 2]).is_err());
        assert_eq!(
            HostCommand::decode(&[0x42, 0x00, 0x00]),
            Err(ProtocolError::UnknownHostCommand(0x42))
        );
    }

    #[test]
    fn test_error_response() {
        let record = HostResponse::Error { code: -110 }.encode();
        assert_eq!(record, vec![0xFF, 0x00, 0x02, 0xFF, 0x92]);
        assert_eq!(
            HostResponse::decode(&record).unwrap(),
            HostResponse::Error { code: -110 }
        );
    }

    #[test]
    fn test_urc_layout() {
        let record = HostResponse::Urc {
            code: URC_STATUS_RECEIVED,
            data: vec![7, 8],
        }
        .encode();
        assert_eq!(record, vec![0xFE, 0x00, 0x03, 0x01, 7, 8]);
    }
}
