//! Per-client Modbus-TCP frame assembly
//!
//! A `Framer` consumes arbitrary receive chunks into a fixed-size ring and
//! reports when a complete MBAP frame is buffered. The socket reads straight
//! into [`Framer::recv_span`]; the framer never copies on the receive path.
//!
//! ```rust
//! use modbus_rtu_bridge::framer::{Framer, FramerState};
//!
//! let mut framer = Framer::new(512);
//! let request = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03];
//!
//! for &byte in &request[..11] {
//!     framer.recv_span()[0] = byte;
//!     assert!(!framer.on_bytes_received(1).unwrap().is_ready());
//! }
//! framer.recv_span()[0] = request[11];
//! assert_eq!(framer.on_bytes_received(1).unwrap(), FramerState::FrameReady { frame_len: 12 });
//!
//! let frame = framer.frame().unwrap();
//! assert_eq!(frame.header.unit_id, 0x11);
//! assert_eq!(&frame.pdu[..], &[0x03, 0x00, 0x6B, 0x00, 0x03]);
//! ```

use bytes::Bytes;

use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{validate_prefix, FrameHeader};
use crate::ring::RingBuffer;
use crate::{MBAP_HEADER_SIZE, MBAP_LENGTH_PREFIX};

/// Framing progress of one client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramerState {
    /// Fewer than 6 bytes buffered, length unknown
    AwaitingHeader,
    /// Length known, frame not complete yet
    AwaitingBody { frame_len: usize },
    /// A complete frame sits at the front of the buffer
    FrameReady { frame_len: usize },
}

impl FramerState {
    pub fn is_ready(&self) -> bool {
        matches!(self, FramerState::FrameReady { .. })
    }
}

/// A complete frame copied out of the ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyFrame {
    pub header: FrameHeader,
    pub pdu: Bytes,
}

#[derive(Debug)]
pub struct Framer {
    ring: RingBuffer,
    /// Total length of the frame at the front, 0 while unknown
    declared_len: usize,
}

impl Framer {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RingBuffer::with_capacity(capacity),
            declared_len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Bytes buffered, including any that follow the current frame
    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    /// Free space left for the socket to read into
    pub fn vacancy(&self) -> usize {
        self.ring.vacancy()
    }

    /// Contiguous free region the next socket read should fill
    pub fn recv_span(&mut self) -> &mut [u8] {
        self.ring.write_span()
    }

    /// Bytes are buffered but do not yet add up to a complete frame
    pub fn holds_partial_frame(&self) -> bool {
        self.ring.len() > 0 && !self.state().is_ready()
    }

    pub fn state(&self) -> FramerState {
        match self.declared_len {
            0 => FramerState::AwaitingHeader,
            frame_len if self.ring.len() >= frame_len => FramerState::FrameReady { frame_len },
            frame_len => FramerState::AwaitingBody { frame_len },
        }
    }

    /// Account for `n` bytes the socket wrote into the last receive span
    ///
    /// A `Frame` error means the stream declared a length or protocol id that
    /// cannot be trusted; the connection has to go.
    pub fn on_bytes_received(&mut self, n: usize) -> ModbusResult<FramerState> {
        self.ring.commit(n);
        self.evaluate()
    }

    fn evaluate(&mut self) -> ModbusResult<FramerState> {
        if self.declared_len == 0 {
            let mut prefix = [0u8; MBAP_LENGTH_PREFIX];
            if !self.ring.peek_into(0, &mut prefix) {
                return Ok(FramerState::AwaitingHeader);
            }

            let (protocol_id, length) = FrameHeader::peek_prefix(&prefix);
            validate_prefix(protocol_id, length)?;

            let frame_len = length as usize + MBAP_LENGTH_PREFIX;
            if frame_len > self.ring.capacity() {
                return Err(ModbusError::frame(format!(
                    "Declared frame of {} bytes exceeds buffer of {}",
                    frame_len,
                    self.ring.capacity()
                )));
            }
            self.declared_len = frame_len;
        }
        Ok(self.state())
    }

    /// Copy of the ready frame, or `None` if the frame is not complete
    pub fn frame(&self) -> Option<ReadyFrame> {
        let frame_len = match self.state() {
            FramerState::FrameReady { frame_len } => frame_len,
            _ => return None,
        };

        let mut raw = vec![0u8; frame_len];
        if !self.ring.peek_into(0, &mut raw) {
            return None;
        }
        let mut head = [0u8; MBAP_HEADER_SIZE];
        head.copy_from_slice(&raw[..MBAP_HEADER_SIZE]);

        Some(ReadyFrame {
            header: FrameHeader::decode(&head),
            pdu: Bytes::from(raw).slice(MBAP_HEADER_SIZE..),
        })
    }

    /// Drop the ready frame after a successful hand-off
    ///
    /// Bytes that followed it are framed immediately, so the returned state
    /// can already be `FrameReady` for a pipelined request.
    pub fn consume(&mut self) -> ModbusResult<FramerState> {
        if let FramerState::FrameReady { frame_len } = self.state() {
            self.ring.pop(frame_len);
            self.declared_len = 0;
        }
        self.evaluate()
    }
}
