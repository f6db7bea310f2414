//! Pipeline frame codec
//!
//! Frames multiplex many logical sessions over one TLS connection:
//!
//! ```text
//! +--------+---------------------+------------+----------+
//! |  Cmd   | Session ID (4B, BE) | Len (2B)   |   Data   |
//! +--------+---------------------+------------+----------+
//! ```
//!
//! `ICMP` frames always carry session id 0.

use super::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const PIPELINE_FRAME_HEADER_SIZE: usize = 7;

/// Pipeline commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineCommand {
    /// Open a logical session; payload is address + first bytes
    Connect = 0x01,
    /// Relay bytes for a session
    Data = 0x02,
    /// Flow-control acknowledgement
    Ack = 0x03,
    /// Close a logical session
    Close = 0x04,
    /// Tunnelled ICMP packet (session id 0)
    Icmp = 0x05,
}

impl TryFrom<u8> for PipelineCommand {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PipelineCommand::Connect),
            0x02 => Ok(PipelineCommand::Data),
            0x03 => Ok(PipelineCommand::Ack),
            0x04 => Ok(PipelineCommand::Close),
            0x05 => Ok(PipelineCommand::Icmp),
            other => Err(ProtocolError::InvalidCommand(other)),
        }
    }
}

impl PipelineCommand {
    /// Human-readable name for log lines
    pub fn name(self) -> &'static str {
        match self {
            PipelineCommand::Connect => "CONNECT",
            PipelineCommand::Data => "DATA",
            PipelineCommand::Ack => "ACK",
            PipelineCommand::Close => "CLOSE",
            PipelineCommand::Icmp => "ICMP",
        }
    }
}

/// One multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFrame {
    pub command: PipelineCommand,
    pub session_id: u32,
    pub payload: Bytes,
}

impl PipelineFrame {
    pub fn connect(session_id: u32, payload: Bytes) -> Self {
        Self { command: PipelineCommand::Connect, session_id, payload }
    }

    pub fn data(session_id: u32, payload: Bytes) -> Self {
        Self { command: PipelineCommand::Data, session_id, payload }
    }

    pub fn ack(session_id: u32) -> Self {
        Self { command: PipelineCommand::Ack, session_id, payload: Bytes::new() }
    }

    pub fn close(session_id: u32) -> Self {
        Self { command: PipelineCommand::Close, session_id, payload: Bytes::new() }
    }

    pub fn icmp(payload: Bytes) -> Self {
        Self { command: PipelineCommand::Icmp, session_id: 0, payload }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        debug_assert!(self.payload.len() <= u16::MAX as usize);
        let mut buf = BytesMut::with_capacity(PIPELINE_FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.command as u8);
        buf.put_u32(self.session_id);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf
    }

    /// Take one frame from the front of an accumulator.
    ///
    /// `Ok(None)` means more bytes are needed; an unknown command byte
    /// is a hard error and the caller must destroy the carrier.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < PIPELINE_FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let command = PipelineCommand::try_from(buf[0])?;
        let session_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let len = u16::from_be_bytes([buf[5], buf[6]]) as usize;
        if buf.len() < PIPELINE_FRAME_HEADER_SIZE + len {
            return Ok(None);
        }

        buf.advance(PIPELINE_FRAME_HEADER_SIZE);
        let payload = buf.split_to(len).freeze();
        Ok(Some(Self { command, session_id, payload }))
    }
}
