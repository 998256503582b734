//! Modbus wire formats handled by the bridge
//!
//! This module contains the Modbus-TCP MBAP header codec, the `Session` that
//! carries a request's routing identity through the transaction queue, and the
//! Modbus-RTU frame encoder/validator. PDUs are opaque byte strings here.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::crc;
use crate::error::{ModbusError, ModbusResult};
use crate::server::ClientHandle;
use crate::{BROADCAST_UNIT_ID, MAX_MBAP_LENGTH, MAX_PDU_SIZE, MBAP_HEADER_SIZE, MBAP_LENGTH_PREFIX};

/// Modbus slave/unit identifier (0 = broadcast, 1-247 addressable)
pub type UnitId = u8;

/// Modbus exception codes a gateway may report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::GatewayPathUnavailable => "Gateway was unable to allocate an internal communication path",
            ModbusException::GatewayTargetDeviceFailedToRespond => "No response was obtained from the target device",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Modbus-TCP MBAP header
///
/// `length` counts the unit id plus the PDU, so a frame occupies
/// `length + 6` bytes on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: UnitId,
}

impl FrameHeader {
    /// Decode a header from its 7 wire bytes
    ///
    /// Never fails: any 7 bytes decode to some header. Use
    /// [`FrameHeader::validate`] to judge it.
    pub fn decode(bytes: &[u8; MBAP_HEADER_SIZE]) -> Self {
        Self {
            transaction_id: BigEndian::read_u16(&bytes[0..2]),
            protocol_id: BigEndian::read_u16(&bytes[2..4]),
            length: BigEndian::read_u16(&bytes[4..6]),
            unit_id: bytes[6],
        }
    }

    /// Encode the header to its 7 wire bytes
    pub fn encode(&self) -> [u8; MBAP_HEADER_SIZE] {
        let mut bytes = [0u8; MBAP_HEADER_SIZE];
        BigEndian::write_u16(&mut bytes[0..2], self.transaction_id);
        BigEndian::write_u16(&mut bytes[2..4], self.protocol_id);
        BigEndian::write_u16(&mut bytes[4..6], self.length);
        bytes[6] = self.unit_id;
        bytes
    }

    /// Protocol id and length field read from the first 6 bytes of a frame,
    /// before the unit id arrives
    pub fn peek_prefix(prefix: &[u8; MBAP_LENGTH_PREFIX]) -> (u16, u16) {
        (BigEndian::read_u16(&prefix[2..4]), BigEndian::read_u16(&prefix[4..6]))
    }

    /// Total bytes the frame occupies on the stream
    pub fn frame_len(&self) -> usize {
        self.length as usize + MBAP_LENGTH_PREFIX
    }

    /// PDU length implied by the length field
    pub fn pdu_len(&self) -> usize {
        (self.length as usize).saturating_sub(1)
    }

    /// Check protocol id and length bounds
    pub fn validate(&self) -> ModbusResult<()> {
        validate_prefix(self.protocol_id, self.length)
    }
}

/// Judge the protocol id and length field of an incoming frame
///
/// Length must cover the unit id plus at least one PDU byte and at most a
/// maximum-size PDU.
pub fn validate_prefix(protocol_id: u16, length: u16) -> ModbusResult<()> {
    if protocol_id != 0 {
        return Err(ModbusError::frame(format!("Protocol id {} is not Modbus", protocol_id)));
    }
    if length < 2 || length as usize > MAX_MBAP_LENGTH {
        return Err(ModbusError::frame(format!(
            "Declared length {} outside 2..={}",
            length, MAX_MBAP_LENGTH
        )));
    }
    Ok(())
}

/// Routing identity of one request
///
/// Derived fresh from each assembled client frame and consumed by exactly one
/// RTU round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Session {
    pub client: ClientHandle,
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub unit_id: UnitId,
}

impl Session {
    /// Bytes a session occupies inside a transaction queue entry
    pub const ENCODED_LEN: usize = 13;

    pub fn from_header(client: ClientHandle, header: &FrameHeader) -> Self {
        Self {
            client,
            transaction_id: header.transaction_id,
            protocol_id: header.protocol_id,
            unit_id: header.unit_id,
        }
    }

    /// Broadcast requests are never answered on the RTU bus
    pub fn is_broadcast(&self) -> bool {
        self.unit_id == BROADCAST_UNIT_ID
    }

    /// MBAP header for a response carrying `pdu_len` PDU bytes
    pub fn response_header(&self, pdu_len: usize) -> FrameHeader {
        FrameHeader {
            transaction_id: self.transaction_id,
            protocol_id: self.protocol_id,
            length: (pdu_len + 1) as u16,
            unit_id: self.unit_id,
        }
    }

    /// Full Modbus-TCP response frame: MBAP header followed by the PDU
    pub fn frame_response(&self, pdu: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(MBAP_HEADER_SIZE + pdu.len());
        frame.extend_from_slice(&self.response_header(pdu.len()).encode());
        frame.extend_from_slice(pdu);
        frame
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        LittleEndian::write_u32(&mut bytes[0..4], self.client.index());
        LittleEndian::write_u32(&mut bytes[4..8], self.client.generation());
        LittleEndian::write_u16(&mut bytes[8..10], self.transaction_id);
        LittleEndian::write_u16(&mut bytes[10..12], self.protocol_id);
        bytes[12] = self.unit_id;
        bytes
    }

    pub fn decode(bytes: &[u8; Self::ENCODED_LEN]) -> Self {
        Self {
            client: ClientHandle::new(LittleEndian::read_u32(&bytes[0..4]), LittleEndian::read_u32(&bytes[4..8])),
            transaction_id: LittleEndian::read_u16(&bytes[8..10]),
            protocol_id: LittleEndian::read_u16(&bytes[10..12]),
            unit_id: bytes[12],
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} tid={} unit={}", self.client, self.transaction_id, self.unit_id)
    }
}

/// Encode an RTU frame: unit id, PDU, CRC16 low byte first
pub fn encode_rtu_frame(unit_id: UnitId, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    crc::append_crc(&mut frame);
    frame
}

/// Validate a received RTU frame and split it into unit id and PDU
///
/// The frame needs at least a unit id, a function code and the two CRC
/// bytes; anything shorter cannot be a response.
pub fn decode_rtu_frame(frame: &[u8]) -> ModbusResult<(UnitId, &[u8])> {
    if frame.len() < 4 {
        return Err(ModbusError::protocol(format!("RTU frame too short: {} bytes", frame.len())));
    }
    if frame.len() > MAX_PDU_SIZE + 3 {
        return Err(ModbusError::protocol(format!("RTU frame too long: {} bytes", frame.len())));
    }

    let body = &frame[..frame.len() - 2];
    let computed = crc::crc16(body);
    let received = crc::trailing_crc(frame).unwrap_or_default();
    if computed != received {
        return Err(ModbusError::crc_mismatch(computed, received));
    }

    Ok((body[0], &body[1..]))
}

/// Exception PDU answering a request with function code `function`
pub fn exception_pdu(function: u8, exception: ModbusException) -> [u8; 2] {
    [function | 0x80, exception.to_u8()]
}
