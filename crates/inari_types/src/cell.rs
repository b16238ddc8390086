//! The verified-cell framing shared by every remotely readable record.
//!
//! A cell is `payload ++ hash64(payload)`. The owner recomputes the
//! trailing hash immediately after any mutation; a reader that observes a
//! mismatch has raced the writer and retries. An accepted read observed a
//! state that existed at some instant between the last two writes; there is
//! no ordering requirement on either side beyond that.

use crate::error::{TypesError, TypesResult};
use crate::hash::hash64;

/// Width of the trailing content hash.
pub const CELL_HASH_BYTES: usize = 8;

/// Total cell size for a payload of `payload_len` bytes.
pub const fn cell_bytes(payload_len: usize) -> usize {
    payload_len + CELL_HASH_BYTES
}

/// Seal `payload` into `cell`, writing the payload followed by its hash.
///
/// `cell` must be exactly `cell_bytes(payload.len())` long.
pub fn seal(payload: &[u8], cell: &mut [u8]) {
    assert_eq!(cell.len(), cell_bytes(payload.len()));
    let (body, hash) = cell.split_at_mut(payload.len());
    body.copy_from_slice(payload);
    hash.copy_from_slice(&hash64(payload).to_le_bytes());
}

/// Validate an observed cell, returning the payload slice on success.
///
/// `Err(TornRead)` means the observation raced a writer; re-read the cell.
pub fn open(cell: &[u8]) -> TypesResult<&[u8]> {
    if cell.len() < CELL_HASH_BYTES {
        return Err(TypesError::ShortBuffer {
            need: CELL_HASH_BYTES,
            have: cell.len(),
        });
    }
    let (body, hash) = cell.split_at(cell.len() - CELL_HASH_BYTES);
    let observed = u64::from_le_bytes(hash.try_into().expect("8 byte hash"));
    if hash64(body) == observed {
        Ok(body)
    } else {
        Err(TypesError::TornRead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_cells_open() {
        let payload = b"the quick brown fox";
        let mut cell = vec![0u8; cell_bytes(payload.len())];
        seal(payload, &mut cell);
        assert_eq!(open(&cell).unwrap(), payload);
    }

    #[test]
    fn any_flipped_payload_byte_reads_as_torn() {
        let payload = [0xabu8; 64];
        let mut cell = vec![0u8; cell_bytes(payload.len())];
        seal(&payload, &mut cell);
        for i in 0..payload.len() {
            let mut torn = cell.clone();
            torn[i] ^= 0x01;
            assert!(matches!(open(&torn), Err(TypesError::TornRead)), "byte {i}");
        }
    }

    #[test]
    fn a_flipped_hash_byte_reads_as_torn() {
        let mut cell = vec![0u8; cell_bytes(4)];
        seal(b"abcd", &mut cell);
        let last = cell.len() - 1;
        cell[last] ^= 0x80;
        assert!(matches!(open(&cell), Err(TypesError::TornRead)));
    }
}
