use bytes::{Buf, BufMut};
use std::fmt;

use crate::error::{TypesError, TypesResult};

pub const REGION_DESCRIPTOR_BYTES: usize = 16;

/// Remote-memory descriptor of one registered region: where it starts, how
/// long it is, and the rkey a remote reader must present to the fabric.
#[derive(Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RegionDescriptor {
    pub addr: u64,
    pub len: u32,
    pub rkey: u32,
}

impl RegionDescriptor {
    pub fn new(addr: u64, len: u32, rkey: u32) -> Self {
        Self { addr, len, rkey }
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0 && self.len == 0
    }

    /// Descriptor of a sub-range, for reads of a single cell out of a
    /// larger exported region.
    pub fn slice(&self, offset: u64, len: u32) -> RegionDescriptor {
        debug_assert!(offset + len as u64 <= self.len as u64);
        RegionDescriptor {
            addr: self.addr + offset,
            len,
            rkey: self.rkey,
        }
    }

    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.addr);
        buf.put_u32_le(self.len);
        buf.put_u32_le(self.rkey);
    }

    pub fn get(buf: &mut impl Buf) -> TypesResult<Self> {
        if buf.remaining() < REGION_DESCRIPTOR_BYTES {
            return Err(TypesError::ShortBuffer {
                need: REGION_DESCRIPTOR_BYTES,
                have: buf.remaining(),
            });
        }
        Ok(Self {
            addr: buf.get_u64_le(),
            len: buf.get_u32_le(),
            rkey: buf.get_u32_le(),
        })
    }
}

impl fmt::Debug for RegionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mr {{ addr: {:#x}, len: {}, rkey: {} }}",
            self.addr, self.len, self.rkey
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_round_trips() {
        let mr = RegionDescriptor::new(0xdead_beef_0000, 4096, 42);
        let mut buf = Vec::new();
        mr.put(&mut buf);
        assert_eq!(buf.len(), REGION_DESCRIPTOR_BYTES);
        let back = RegionDescriptor::get(&mut buf.as_slice()).unwrap();
        assert_eq!(mr, back);
    }

    #[test]
    fn slice_offsets_the_address_and_keeps_the_rkey() {
        let mr = RegionDescriptor::new(0x1000, 400, 7);
        let cell = mr.slice(80, 40);
        assert_eq!(cell.addr, 0x1050);
        assert_eq!(cell.len, 40);
        assert_eq!(cell.rkey, 7);
    }
}
