//! Modbus CRC16 engine
//!
//! Standard Modbus RTU checksum: initial value 0xFFFF, reflected polynomial
//! 0xA001, no final xor. The checksum is sent low byte first.

use crc::{Crc, CRC_16_MODBUS};

/// CRC calculator for RTU frames
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Compute the Modbus CRC16 over a byte span
///
/// ```rust
/// use modbus_rtu_bridge::crc::crc16;
///
/// assert_eq!(crc16(&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]), 0x8776);
/// ```
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Append the CRC of `frame` to it, low byte first
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// True when `frame` ends in a valid little-endian CRC over the bytes before it
///
/// Running the CRC over data followed by its own checksum leaves a zero
/// residual, which is what this checks.
pub fn check(frame: &[u8]) -> bool {
    frame.len() >= 2 && crc16(frame) == 0
}

/// CRC carried by the last two bytes of `frame`, if there are two bytes
pub fn trailing_crc(frame: &[u8]) -> Option<u16> {
    match frame.len() {
        n if n >= 2 => Some(u16::from_le_bytes([frame[n - 2], frame[n - 1]])),
        _ => None,
    }
}
