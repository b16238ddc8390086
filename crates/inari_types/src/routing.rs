use bytes::{Buf, BufMut};
use std::fmt;

use crate::cell;
use crate::error::{TypesError, TypesResult};
use crate::hash::hash128;
use crate::keyspace::KeyId;

/// Packed payload bytes of one routing entry.
pub const ROUTING_ENTRY_BYTES: usize = 26;
/// One routing entry as a standalone verified cell (fixed overlay).
pub const ROUTING_CELL_BYTES: usize = cell::cell_bytes(ROUTING_ENTRY_BYTES);

const IP_BYTES: usize = 16;
const PORT_BYTES: usize = 6;

/// Identity and dial address of one node. Host and port are fixed-width,
/// NUL-padded text so the record has a stable remote-memory layout.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub id: KeyId,
    ip: [u8; IP_BYTES],
    port: [u8; PORT_BYTES],
}

impl NodeId {
    pub fn new(id: KeyId, host: &str, port: &str) -> Self {
        let mut ip = [0u8; IP_BYTES];
        let mut p = [0u8; PORT_BYTES];
        let h = host.as_bytes();
        let q = port.as_bytes();
        ip[..h.len().min(IP_BYTES)].copy_from_slice(&h[..h.len().min(IP_BYTES)]);
        p[..q.len().min(PORT_BYTES)].copy_from_slice(&q[..q.len().min(PORT_BYTES)]);
        Self { id, ip, port: p }
    }

    /// Identity of a node is the hash of its dial address, placed on the
    /// ring.
    pub fn from_addr(host: &str, port: &str) -> Self {
        let id = KeyId::from_hash(hash128(format!("{host}:{port}").as_bytes()));
        Self::new(id, host, port)
    }

    pub fn host(&self) -> &str {
        str_field(&self.ip)
    }

    pub fn port(&self) -> &str {
        str_field(&self.port)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host(), self.port())
    }

    /// A slot in a routing table is vacant while no address has been
    /// written into it.
    pub fn is_vacant(&self) -> bool {
        self.ip[0] == 0
    }

    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.id.0);
        buf.put_slice(&self.ip);
        buf.put_slice(&self.port);
    }

    pub fn get(buf: &mut impl Buf) -> TypesResult<Self> {
        if buf.remaining() < 2 + IP_BYTES + PORT_BYTES {
            return Err(TypesError::ShortBuffer {
                need: 2 + IP_BYTES + PORT_BYTES,
                have: buf.remaining(),
            });
        }
        let id = KeyId(buf.get_u16_le());
        let mut ip = [0u8; IP_BYTES];
        buf.copy_to_slice(&mut ip);
        let mut port = [0u8; PORT_BYTES];
        buf.copy_to_slice(&mut port);
        Ok(Self { id, ip, port })
    }
}

fn str_field(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}

impl Default for NodeId {
    fn default() -> Self {
        Self {
            id: KeyId(0),
            ip: [0; IP_BYTES],
            port: [0; PORT_BYTES],
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr())
    }
}

/// One interval of the keyspace and the node owning it. The fixed overlay
/// exports an array of these; the Chord overlay packs predecessor, self
/// and the fingers into a single cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoutingEntry {
    pub node: NodeId,
    pub start: KeyId,
}

impl RoutingEntry {
    pub fn new(node: NodeId, start: KeyId) -> Self {
        Self { node, start }
    }

    pub fn put(&self, buf: &mut impl BufMut) {
        self.node.put(buf);
        buf.put_u16_le(self.start.0);
    }

    pub fn get(buf: &mut impl Buf) -> TypesResult<Self> {
        let node = NodeId::get(buf)?;
        if buf.remaining() < 2 {
            return Err(TypesError::ShortBuffer {
                need: 2,
                have: buf.remaining(),
            });
        }
        Ok(Self {
            node,
            start: KeyId(buf.get_u16_le()),
        })
    }

    /// Seal into a standalone verified cell.
    pub fn encode_cell(&self) -> [u8; ROUTING_CELL_BYTES] {
        let mut payload = [0u8; ROUTING_ENTRY_BYTES];
        self.put(&mut payload.as_mut_slice());
        let mut out = [0u8; ROUTING_CELL_BYTES];
        cell::seal(&payload, &mut out);
        out
    }

    pub fn decode_cell(bytes: &[u8]) -> TypesResult<Self> {
        if bytes.len() != ROUTING_CELL_BYTES {
            return Err(TypesError::ShortBuffer {
                need: ROUTING_CELL_BYTES,
                have: bytes.len(),
            });
        }
        let mut payload = cell::open(bytes)?;
        Self::get(&mut payload)
    }
}
