use std::fmt::{Display, Formatter};

/// UD endpoint of a device's control plane, published as hex in the
/// segment descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct DomainAddress {
    pub(crate) gid: [u8; 16],
    pub(crate) lid: u16,
    pub(crate) qp_num: u32,
    pub(crate) qkey: u32,
}

impl DomainAddress {
    pub(crate) const BYTES: usize = 26;

    pub(crate) fn to_bytes(self) -> [u8; Self::BYTES] {
        let mut bytes = [0_u8; Self::BYTES];
        bytes[..16].copy_from_slice(&self.gid);
        bytes[16..18].copy_from_slice(&self.lid.to_le_bytes());
        bytes[18..22].copy_from_slice(&self.qp_num.to_le_bytes());
        bytes[22..26].copy_from_slice(&self.qkey.to_le_bytes());
        bytes
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::BYTES {
            return None;
        }
        let mut gid = [0_u8; 16];
        gid.copy_from_slice(&bytes[..16]);
        Some(Self {
            gid,
            lid: u16::from_le_bytes(bytes[16..18].try_into().ok()?),
            qp_num: u32::from_le_bytes(bytes[18..22].try_into().ok()?),
            qkey: u32::from_le_bytes(bytes[22..26].try_into().ok()?),
        })
    }

    pub(crate) fn to_hex(self) -> String {
        to_hex(&self.to_bytes())
    }

    pub(crate) fn from_hex(s: &str) -> Option<Self> {
        Self::from_bytes(&from_hex(s)?)
    }
}

impl Display for DomainAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DomainAddress(lid={}, qp_num={}, qkey={:#x})",
            self.lid, self.qp_num, self.qkey
        )
    }
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(DIGITS[(byte >> 4) as usize] as char);
        out.push(DIGITS[(byte & 0x0f) as usize] as char);
    }
    out
}

pub(crate) fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    s.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some(((hi << 4) | lo) as u8)
        })
        .collect()
}
