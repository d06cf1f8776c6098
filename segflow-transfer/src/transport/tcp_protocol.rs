//! Wire format of the TCP transport.
//!
//! Request: `opcode u8 | addr u64 LE | len u64 LE`, followed by `len` payload
//! bytes for a write. Response: one status byte, followed by `len` payload
//! bytes for an accepted read. One request per connection.

use std::io::{self, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::api::OpCode;

pub(crate) const HEADER_BYTES: usize = 17;

#[derive(Debug, Error)]
pub(crate) enum WireError {
    #[error("truncated header: expected {HEADER_BYTES} bytes, got {0}")]
    Truncated(usize),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("unknown status {0}")]
    UnknownStatus(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WireStatus {
    Ok = 0,
    /// The range is not inside a remote-accessible registered region.
    AccessDenied = 1,
    BadRequest = 2,
}

impl WireStatus {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Ok),
            1 => Some(Self::AccessDenied),
            2 => Some(Self::BadRequest),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RequestHeader {
    pub(crate) opcode: OpCode,
    pub(crate) addr: u64,
    pub(crate) len: u64,
}

impl RequestHeader {
    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_BYTES);
        buf.put_u8(self.opcode.as_raw() as u8);
        buf.put_u64_le(self.addr);
        buf.put_u64_le(self.len);
        buf.freeze()
    }

    pub(crate) fn decode(mut bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != HEADER_BYTES {
            return Err(WireError::Truncated(bytes.len()));
        }
        let raw_opcode = bytes.get_u8();
        let opcode =
            OpCode::from_raw(i32::from(raw_opcode)).ok_or(WireError::UnknownOpcode(raw_opcode))?;
        Ok(Self {
            opcode,
            addr: bytes.get_u64_le(),
            len: bytes.get_u64_le(),
        })
    }
}

pub(crate) fn write_request(
    stream: &mut impl Write,
    header: &RequestHeader,
) -> Result<(), WireError> {
    stream.write_all(&header.encode())?;
    Ok(())
}

/// `Ok(None)` when the peer closed the connection before sending anything.
pub(crate) fn read_request(stream: &mut impl Read) -> Result<Option<RequestHeader>, WireError> {
    let mut raw = [0_u8; HEADER_BYTES];
    let mut filled = 0;
    while filled < HEADER_BYTES {
        match stream.read(&mut raw[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(WireError::Truncated(filled)),
            Ok(n) => filled += n,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => return Err(error.into()),
        }
    }
    RequestHeader::decode(&raw).map(Some)
}

pub(crate) fn write_status(stream: &mut impl Write, status: WireStatus) -> Result<(), WireError> {
    stream.write_all(&[status as u8])?;
    Ok(())
}

pub(crate) fn read_status(stream: &mut impl Read) -> Result<WireStatus, WireError> {
    let mut raw = [0_u8; 1];
    stream.read_exact(&mut raw)?;
    WireStatus::from_u8(raw[0]).ok_or(WireError::UnknownStatus(raw[0]))
}
