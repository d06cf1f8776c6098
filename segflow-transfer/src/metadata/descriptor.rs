use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::MetadataError;
use crate::transport::topology::Topology;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcEndpoint {
    pub host: String,
    pub port: u16,
}

impl RpcEndpoint {
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// One remote-accessible buffer of a segment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDesc {
    /// Start of the buffer in the segment's address space.
    pub offset: u64,
    pub addr: u64,
    pub length: u64,
    pub location: String,
    /// Remote keys, one per entry of [`SegmentDesc::devices`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rkeys: Vec<u32>,
}

/// RDMA device advertised by a segment owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDesc {
    pub name: String,
    pub lid: u16,
    /// Hex encoded GID.
    pub gid: String,
    /// Hex encoded control-plane address used for the connection handshake.
    pub control_addr: String,
}

/// Everything a peer needs to reach a segment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDesc {
    pub name: String,
    pub rpc: RpcEndpoint,
    /// Transports installed by the owner.
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub buffers: Vec<BufferDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<RpcEndpoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<DeviceDesc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<Topology>,
}

impl SegmentDesc {
    pub fn new(name: impl Into<String>, rpc: RpcEndpoint) -> Self {
        Self {
            name: name.into(),
            rpc,
            protocols: Vec::new(),
            buffers: Vec::new(),
            tcp: None,
            devices: Vec::new(),
            topology: None,
        }
    }

    pub fn supports(&self, protocol: &str) -> bool {
        self.protocols.iter().any(|name| name == protocol)
    }

    /// Maps `[offset, offset + len)` of the segment address space onto the
    /// single buffer that covers it, returning the buffer and the remote
    /// virtual address of `offset`. Ranges whose arithmetic would overflow
    /// are never covered.
    pub fn locate(&self, offset: u64, len: u64) -> Option<(usize, &BufferDesc, u64)> {
        let end = offset.checked_add(len)?;
        self.buffers.iter().enumerate().find_map(|(idx, buffer)| {
            let buffer_end = buffer.offset.checked_add(buffer.length)?;
            if offset < buffer.offset || end > buffer_end {
                return None;
            }
            let addr = buffer.addr.checked_add(offset - buffer.offset)?;
            addr.checked_add(len)?;
            Some((idx, buffer, addr))
        })
    }

    pub(crate) fn to_json(&self, key: &str) -> Result<Bytes, MetadataError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|error| MetadataError::Malformed {
                key: key.to_string(),
                reason: error.to_string(),
            })
    }

    pub(crate) fn from_json(key: &str, raw: &[u8]) -> Result<Self, MetadataError> {
        serde_json::from_slice(raw).map_err(|error| MetadataError::Malformed {
            key: key.to_string(),
            reason: error.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferDesc, RpcEndpoint, SegmentDesc};

    fn sample() -> SegmentDesc {
        let mut desc = SegmentDesc::new(
            "node-b:9000",
            RpcEndpoint {
                host: "node-b".to_string(),
                port: 9000,
            },
        );
        desc.buffers = vec![
            BufferDesc {
                offset: 0,
                addr: 0x10_0000,
                length: 8192,
                location: "cpu:0".to_string(),
                rkeys: Vec::new(),
            },
            BufferDesc {
                offset: 8192,
                addr: 0x80_0000,
                length: 4096,
                location: "cpu:0".to_string(),
                rkeys: Vec::new(),
            },
        ];
        desc
    }

    #[test]
    fn locate_maps_offsets_to_remote_addresses() {
        let desc = sample();
        let (idx, _, addr) = desc.locate(0, 4096).expect("first buffer");
        assert_eq!((idx, addr), (0, 0x10_0000));

        let (idx, _, addr) = desc.locate(8192 + 100, 200).expect("second buffer");
        assert_eq!((idx, addr), (1, 0x80_0000 + 100));
    }

    #[test]
    fn locate_rejects_straddling_and_out_of_range() {
        let desc = sample();
        assert!(desc.locate(8000, 400).is_none());
        assert!(desc.locate(12288, 1).is_none());
        assert!(desc.locate(u64::MAX, 2).is_none());
    }

    #[test]
    fn locate_treats_overflowing_buffers_as_uncovered() {
        let mut desc = sample();
        desc.buffers = vec![
            BufferDesc {
                offset: u64::MAX - 10,
                addr: 0x10_0000,
                length: 100,
                location: "cpu:0".to_string(),
                rkeys: Vec::new(),
            },
            BufferDesc {
                offset: 0,
                addr: u64::MAX - 1,
                length: 100,
                location: "cpu:0".to_string(),
                rkeys: Vec::new(),
            },
        ];
        assert!(desc.locate(u64::MAX - 5, 1).is_none());
        assert!(desc.locate(50, 1).is_none());
        assert_eq!(desc.locate(0, 1).map(|(_, _, addr)| addr), Some(u64::MAX - 1));
    }

    #[test]
    fn json_omits_absent_transport_sections() {
        let desc = sample();
        let raw = desc.to_json("k").expect("encode");
        let text = std::str::from_utf8(&raw).expect("utf8");
        assert!(!text.contains("devices"));
        assert!(!text.contains("topology"));
        assert_eq!(SegmentDesc::from_json("k", &raw).expect("decode"), desc);
    }

    #[test]
    fn rpc_endpoint_brackets_ipv6() {
        let endpoint = RpcEndpoint {
            host: "fe80::1".to_string(),
            port: 7000,
        };
        assert_eq!(endpoint.socket_addr(), "[fe80::1]:7000");
    }
}
