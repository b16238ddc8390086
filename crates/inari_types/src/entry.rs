use bytes::{Buf, BufMut};
use std::fmt;

use crate::cell;
use crate::error::{TypesError, TypesResult};
use crate::hash::hash64;

/// Payload bytes of a table-entry cell, before the trailing cell hash.
pub const ENTRY_PAYLOAD_BYTES: usize = 32;
/// Full wire size of one table slot.
pub const ENTRY_CELL_BYTES: usize = cell::cell_bytes(ENTRY_PAYLOAD_BYTES);

/// A remote-memory pointer that carries the content hash of its referent,
/// so a reader can tell whether pointer and referent were consistent when
/// the pointer was written.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct VerifyingPtr {
    pub addr: u64,
    pub len: u32,
    pub hash: u64,
}

impl VerifyingPtr {
    pub fn new(addr: u64, blob: &[u8]) -> Self {
        Self {
            addr,
            len: blob.len() as u32,
            hash: hash64(blob),
        }
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }

    /// Does an observed copy of the referent match the hash stored when
    /// this pointer was written?
    pub fn verifies(&self, blob: &[u8]) -> bool {
        blob.len() == self.len as usize && hash64(blob) == self.hash
    }
}

impl fmt::Debug for VerifyingPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "vptr {{ addr: {:#x}, len: {}, hash: {:#018x} }}",
            self.addr, self.len, self.hash
        )
    }
}

/// The payload of one table slot: a verifying pointer to the key+value
/// blob, the key length, the placement word and the rkey of the region
/// exporting the blob.
///
/// The placement word is the occupied-neighbor bitmap for a hopscotch
/// table and the hash-seed index for a cuckoo table.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct EntryImage {
    pub ptr: VerifyingPtr,
    pub key_len: u32,
    pub placement: u32,
    pub rkey: u32,
}

impl EntryImage {
    pub fn new(ptr: VerifyingPtr, key_len: u32, placement: u32, rkey: u32) -> Self {
        Self {
            ptr,
            key_len,
            placement,
            rkey,
        }
    }

    /// `empty <=> pointer is null`; the placement word survives emptying
    /// because neighbors may still hang off this home slot.
    pub fn is_empty(&self) -> bool {
        self.ptr.is_null()
    }

    pub fn clear(&mut self) {
        self.ptr = VerifyingPtr::default();
        self.key_len = 0;
        self.rkey = 0;
    }

    pub fn value_len(&self) -> u32 {
        self.ptr.len - self.key_len
    }

    pub fn has_hop(&self, distance: u32) -> bool {
        self.placement & (1 << distance) != 0
    }

    pub fn set_hop(&mut self, distance: u32) {
        self.placement |= 1 << distance;
    }

    pub fn clear_hop(&mut self, distance: u32) {
        self.placement &= !(1 << distance);
    }

    fn put_payload(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.ptr.addr);
        buf.put_u32_le(self.ptr.len);
        buf.put_u64_le(self.ptr.hash);
        buf.put_u32_le(self.key_len);
        buf.put_u32_le(self.placement);
        buf.put_u32_le(self.rkey);
    }

    fn get_payload(mut buf: &[u8]) -> Self {
        let buf = &mut buf;
        Self {
            ptr: VerifyingPtr {
                addr: buf.get_u64_le(),
                len: buf.get_u32_le(),
                hash: buf.get_u64_le(),
            },
            key_len: buf.get_u32_le(),
            placement: buf.get_u32_le(),
            rkey: buf.get_u32_le(),
        }
    }

    /// Seal this entry into a cell image.
    pub fn encode(&self) -> [u8; ENTRY_CELL_BYTES] {
        let mut payload = [0u8; ENTRY_PAYLOAD_BYTES];
        self.put_payload(&mut payload.as_mut_slice());
        let mut out = [0u8; ENTRY_CELL_BYTES];
        cell::seal(&payload, &mut out);
        out
    }

    /// Decode and validate an observed cell image.
    pub fn decode(bytes: &[u8]) -> TypesResult<Self> {
        if bytes.len() != ENTRY_CELL_BYTES {
            return Err(TypesError::ShortBuffer {
                need: ENTRY_CELL_BYTES,
                have: bytes.len(),
            });
        }
        let payload = cell::open(bytes)?;
        Ok(Self::get_payload(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn entries_round_trip_through_their_cell() {
        let blob = b"keyvaluevaluevalue";
        let entry = EntryImage::new(VerifyingPtr::new(0x4000, blob), 3, 0b101, 9);
        let cell = entry.encode();
        let back = EntryImage::decode(&cell).unwrap();
        assert_eq!(entry, back);
        assert_eq!(back.value_len(), blob.len() as u32 - 3);
        assert!(back.ptr.verifies(blob));
    }

    #[test]
    fn an_empty_entry_has_a_null_pointer() {
        let mut entry = EntryImage::new(VerifyingPtr::new(0x4000, b"kv"), 1, 0b11, 3);
        assert!(!entry.is_empty());
        entry.clear();
        assert!(entry.is_empty());
        // the hop bitmap is placement state of the home slot, not of the
        // occupant, and must survive
        assert_eq!(entry.placement, 0b11);
    }

    #[test]
    fn hop_bits_toggle_independently() {
        let mut entry = EntryImage::default();
        entry.set_hop(0);
        entry.set_hop(5);
        assert!(entry.has_hop(0));
        assert!(entry.has_hop(5));
        assert!(!entry.has_hop(1));
        entry.clear_hop(0);
        assert!(!entry.has_hop(0));
        assert!(entry.has_hop(5));
    }

    #[test]
    fn a_corrupt_cell_is_a_torn_read() {
        let entry = EntryImage::new(VerifyingPtr::new(0x4000, b"kv"), 1, 0, 3);
        let mut cell = entry.encode();
        cell[4] ^= 0xff;
        assert!(matches!(
            EntryImage::decode(&cell),
            Err(TypesError::TornRead)
        ));
    }
}
