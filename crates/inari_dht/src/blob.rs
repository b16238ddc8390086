use std::fmt;

use inari_mem::Mem;
use inari_types::{EntryImage, VerifyingPtr};

/// The owner side of one stored record: the registered allocation holding
/// `key ++ value` plus the split point. The blob exclusively owns the
/// allocation; the table cell holds a verified reference for remote
/// readers. Relocation moves the blob, never copies it.
pub struct Blob {
    mem: Mem,
    len: usize,
    key_len: usize,
}

impl Blob {
    /// `mem` must hold `key ++ value` in its first `len` bytes.
    pub fn new(mem: Mem, len: usize, key_len: usize) -> Self {
        debug_assert!(key_len <= len);
        debug_assert!(len <= mem.len());
        Self { mem, len, key_len }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mem.bytes()[..self.len]
    }

    pub fn key(&self) -> &[u8] {
        &self.bytes()[..self.key_len]
    }

    pub fn value(&self) -> &[u8] {
        &self.bytes()[self.key_len..]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn key_len(&self) -> usize {
        self.key_len
    }

    pub fn has_key(&self, key: &[u8]) -> bool {
        self.key() == key
    }

    pub fn rkey(&self) -> u32 {
        self.mem.rkey()
    }

    pub fn addr(&self) -> u64 {
        self.mem.addr()
    }

    /// The table-entry payload advertising this blob, with `placement`
    /// owned by the caller.
    pub fn entry(&self, placement: u32) -> EntryImage {
        EntryImage::new(
            VerifyingPtr::new(self.addr(), self.bytes()),
            self.key_len as u32,
            placement,
            self.rkey(),
        )
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Blob {{ addr: {:#x}, len: {}, key_len: {}, rkey: {} }}",
            self.addr(),
            self.len,
            self.key_len,
            self.rkey()
        )
    }
}
