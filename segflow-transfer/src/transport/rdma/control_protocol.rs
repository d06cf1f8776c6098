//! RC connection handshake carried over UD datagrams.

use bytes::{Buf, BufMut, BytesMut};

use super::domain_address::DomainAddress;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RcEndpoint {
    pub(crate) gid: [u8; 16],
    pub(crate) lid: u16,
    pub(crate) qp_num: u32,
    pub(crate) psn: u32,
}

impl RcEndpoint {
    const BYTES: usize = 26;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.gid);
        buf.put_u16_le(self.lid);
        buf.put_u32_le(self.qp_num);
        buf.put_u32_le(self.psn);
    }

    fn get(buf: &mut &[u8]) -> Option<Self> {
        if buf.remaining() != Self::BYTES {
            return None;
        }
        let mut gid = [0_u8; 16];
        buf.copy_to_slice(&mut gid);
        Some(Self {
            gid,
            lid: buf.get_u16_le(),
            qp_num: buf.get_u32_le(),
            psn: buf.get_u32_le(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum MessageType {
    ConnectReq = 1,
    ConnectResp = 2,
    ConnectReject = 3,
}

impl MessageType {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::ConnectReq),
            2 => Some(Self::ConnectResp),
            3 => Some(Self::ConnectReject),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ControlMessage {
    ConnectReq {
        request_id: u64,
        src: DomainAddress,
        rc: RcEndpoint,
    },
    ConnectResp {
        request_id: u64,
        src: DomainAddress,
        rc: RcEndpoint,
    },
    /// The passive side could not bring up its queue pair.
    ConnectReject { request_id: u64, src: DomainAddress },
}

impl ControlMessage {
    pub(crate) fn request_id(&self) -> u64 {
        match self {
            ControlMessage::ConnectReq { request_id, .. }
            | ControlMessage::ConnectResp { request_id, .. }
            | ControlMessage::ConnectReject { request_id, .. } => *request_id,
        }
    }
}

const PREFIX_BYTES: usize = 1 + 8 + DomainAddress::BYTES;

pub(crate) fn encode_message(message: &ControlMessage) -> BytesMut {
    let mut buf = BytesMut::with_capacity(PREFIX_BYTES + RcEndpoint::BYTES);
    let (kind, request_id, src, rc) = match message {
        ControlMessage::ConnectReq {
            request_id,
            src,
            rc,
        } => (MessageType::ConnectReq, request_id, src, Some(rc)),
        ControlMessage::ConnectResp {
            request_id,
            src,
            rc,
        } => (MessageType::ConnectResp, request_id, src, Some(rc)),
        ControlMessage::ConnectReject { request_id, src } => {
            (MessageType::ConnectReject, request_id, src, None)
        }
    };
    buf.put_u8(kind as u8);
    buf.put_u64_le(*request_id);
    buf.put_slice(&src.to_bytes());
    if let Some(rc) = rc {
        rc.put(&mut buf);
    }
    buf
}

pub(crate) fn decode_message(bytes: &[u8]) -> Option<ControlMessage> {
    if bytes.len() < PREFIX_BYTES {
        return None;
    }
    let mut buf = bytes;
    let kind = MessageType::from_u8(buf.get_u8())?;
    let request_id = buf.get_u64_le();
    let src = DomainAddress::from_bytes(&buf[..DomainAddress::BYTES])?;
    buf.advance(DomainAddress::BYTES);

    match kind {
        MessageType::ConnectReq => Some(ControlMessage::ConnectReq {
            request_id,
            src,
            rc: RcEndpoint::get(&mut buf)?,
        }),
        MessageType::ConnectResp => Some(ControlMessage::ConnectResp {
            request_id,
            src,
            rc: RcEndpoint::get(&mut buf)?,
        }),
        MessageType::ConnectReject => buf
            .is_empty()
            .then_some(ControlMessage::ConnectReject { request_id, src }),
    }
}

#[cfg(test)]
mod tests {
    use super::{ControlMessage, PREFIX_BYTES, RcEndpoint, decode_message, encode_message};
    use crate::transport::rdma::domain_address::DomainAddress;

    fn addr(seed: u8) -> DomainAddress {
        DomainAddress {
            gid: [seed; 16],
            lid: 100 + seed as u16,
            qp_num: 200 + seed as u32,
            qkey: 0x1111_1111,
        }
    }

    fn rc(seed: u8) -> RcEndpoint {
        RcEndpoint {
            gid: [seed; 16],
            lid: 300 + seed as u16,
            qp_num: 400 + seed as u32,
            psn: 500 + seed as u32,
        }
    }

    #[test]
    fn connect_messages_decode_to_themselves() {
        for message in [
            ControlMessage::ConnectReq {
                request_id: 1,
                src: addr(1),
                rc: rc(2),
            },
            ControlMessage::ConnectResp {
                request_id: 2,
                src: addr(3),
                rc: rc(4),
            },
            ControlMessage::ConnectReject {
                request_id: 3,
                src: addr(5),
            },
        ] {
            let encoded = encode_message(&message);
            assert_eq!(decode_message(&encoded), Some(message));
        }
    }

    #[test]
    fn decode_rejects_malformed_input() {
        let mut bytes = vec![9_u8; PREFIX_BYTES];
        bytes[0] = 99;
        assert!(decode_message(&bytes).is_none());
        assert!(decode_message(&bytes[..PREFIX_BYTES - 1]).is_none());

        let mut truncated = encode_message(&ControlMessage::ConnectReq {
            request_id: 4,
            src: addr(6),
            rc: rc(7),
        })
        .to_vec();
        truncated.pop();
        assert!(decode_message(&truncated).is_none());
    }
}
