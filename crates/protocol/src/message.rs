//! Message header and raw frames

use bytes::{Buf, Bytes};

use crate::{ProtocolError, Result, MAX_MESSAGE_SIZE};

/// Bytes in the fixed message header
pub const HEADER_LEN: usize = 16;

/// Operation codes of the dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
}

impl Opcode {
    pub fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            1 => Opcode::Reply,
            2001 => Opcode::Update,
            2002 => Opcode::Insert,
            2004 => Opcode::Query,
            2005 => Opcode::GetMore,
            2006 => Opcode::Delete,
            2007 => Opcode::KillCursors,
            other => return Err(ProtocolError::BadOpcode(other)),
        })
    }
}

/// The fixed header leading every message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Total message length, header included
    pub len: u32,
    pub req_id: u32,
    pub response_to: u32,
    pub opcode: Opcode,
}

impl MsgHeader {
    /// Parse the 16 header bytes; validates opcode and length bounds
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(ProtocolError::TooShort { size: buf.len() });
        }
        let len = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if (len as usize) < HEADER_LEN {
            return Err(ProtocolError::TooShort { size: len as usize });
        }
        if len as usize > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLong {
                size: len as usize,
                limit: MAX_MESSAGE_SIZE,
            });
        }
        Ok(Self {
            len,
            req_id: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            response_to: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            opcode: Opcode::from_u32(u32::from_le_bytes(buf[12..16].try_into().unwrap()))?,
        })
    }
}

/// A complete inbound frame: parsed header plus the body after it
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub header: MsgHeader,
    pub body: Bytes,
}

impl RawMessage {
    /// Split one message off a complete frame (header + body of the
    /// declared length)
    pub fn parse(mut frame: Bytes) -> Result<Self> {
        let header = MsgHeader::parse(&frame)?;
        if frame.len() < header.len as usize {
            return Err(ProtocolError::truncated("message body"));
        }
        frame.advance(HEADER_LEN);
        frame.truncate(header.len as usize - HEADER_LEN);
        Ok(Self {
            header,
            body: frame,
        })
    }

    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    #[inline]
    pub fn req_id(&self) -> u32 {
        self.header.req_id
    }
}
