use bytes::{Buf, BufMut};

use crate::cell;
use crate::error::{TypesError, TypesResult};
use crate::region::RegionDescriptor;

pub const NODE_INFO_PAYLOAD_BYTES: usize = 56;
pub const NODE_INFO_BYTES: usize = cell::cell_bytes(NODE_INFO_PAYLOAD_BYTES);

/// The node-info page: the one verified cell a client must read before it
/// can read anything else. Publishing a new table (after resize) means
/// rewriting this cell; clients catch up on their next read of it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeInfo {
    /// Full-width node identity (the routing ring uses its low bits).
    pub id: u128,
    /// Current number of table slots.
    pub table_entries: u64,
    /// Descriptor of the exported table region.
    pub table: RegionDescriptor,
    /// Descriptor of the exported routing-table region.
    pub routing: RegionDescriptor,
}

impl NodeInfo {
    pub fn encode(&self) -> [u8; NODE_INFO_BYTES] {
        let mut payload = [0u8; NODE_INFO_PAYLOAD_BYTES];
        {
            let mut buf = payload.as_mut_slice();
            buf.put_u128_le(self.id);
            buf.put_u64_le(self.table_entries);
            self.table.put(&mut buf);
            self.routing.put(&mut buf);
        }
        let mut out = [0u8; NODE_INFO_BYTES];
        cell::seal(&payload, &mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> TypesResult<Self> {
        if bytes.len() != NODE_INFO_BYTES {
            return Err(TypesError::ShortBuffer {
                need: NODE_INFO_BYTES,
                have: bytes.len(),
            });
        }
        let mut payload = cell::open(bytes)?;
        let buf = &mut payload;
        Ok(Self {
            id: buf.get_u128_le(),
            table_entries: buf.get_u64_le(),
            table: RegionDescriptor::get(buf)?,
            routing: RegionDescriptor::get(buf)?,
        })
    }
}
