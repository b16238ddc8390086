use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use inari_net::fabric::{DynFabric, MemoryFabric};
use inari_types::RegionDescriptor;

/// One base region: raw page-aligned memory plus its fabric registration.
/// Dropped (deregistered, then released) when the last [`Mem`] sharing it
/// goes away.
pub(crate) struct RegionAlloc {
    ptr: NonNull<u8>,
    layout: Layout,
    region: RegionDescriptor,
    fabric: DynFabric,
}

impl RegionAlloc {
    pub(crate) fn new(
        ptr: NonNull<u8>,
        layout: Layout,
        region: RegionDescriptor,
        fabric: DynFabric,
    ) -> Arc<Self> {
        Arc::new(Self {
            ptr,
            layout,
            region,
            fabric,
        })
    }
}

impl Drop for RegionAlloc {
    fn drop(&mut self) {
        if let Err(e) = self.fabric.deregister(self.region.rkey) {
            tracing::warn!(rkey = self.region.rkey, "deregister failed: {e}");
        }
        // Safety: allocated with this exact layout in RegionHeap::alloc
        // and never freed elsewhere.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// Safety: the raw pointer is exclusively owned by this struct and the
// memory is never aliased mutably through it.
unsafe impl Send for RegionAlloc {}
unsafe impl Sync for RegionAlloc {}

/// A free-list bin shared between a heap layer and the allocations it
/// handed out; drops push their span back here.
pub(crate) struct Bin {
    parts: Mutex<Vec<Part>>,
}

pub(crate) struct Part {
    pub(crate) addr: NonNull<u8>,
    pub(crate) cap: usize,
    pub(crate) region: RegionDescriptor,
    pub(crate) chunk: Arc<RegionAlloc>,
}

// Safety: a part is an owned span of a pinned region.
unsafe impl Send for Part {}

impl Bin {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            parts: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn push(&self, part: Part) {
        self.parts.lock().push(part);
    }

    pub(crate) fn pop(&self, len: usize) -> Option<Part> {
        let mut parts = self.parts.lock();
        match parts.last() {
            Some(part) if part.cap >= len => parts.pop(),
            _ => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.parts.lock().len()
    }
}

pub(crate) enum Keep {
    /// Shares the lifetime of a chunk; freeing is a no-op.
    Chunk(Arc<RegionAlloc>),
    /// Returns the span to a free list on drop.
    Bin {
        chunk: Arc<RegionAlloc>,
        bin: Arc<Bin>,
    },
}

/// One registered allocation. Carries the descriptor a remote peer needs
/// to read it and keeps the underlying registration alive.
pub struct Mem {
    ptr: NonNull<u8>,
    len: usize,
    cap: usize,
    region: RegionDescriptor,
    keep: Keep,
}

impl Mem {
    pub(crate) fn new(
        ptr: NonNull<u8>,
        len: usize,
        cap: usize,
        region: RegionDescriptor,
        keep: Keep,
    ) -> Self {
        Self {
            ptr,
            len,
            cap,
            region,
            keep,
        }
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Rkey of the registration backing this allocation.
    pub fn rkey(&self) -> u32 {
        self.region.rkey
    }

    /// Descriptor of the whole underlying registration.
    pub fn region(&self) -> RegionDescriptor {
        self.region
    }

    /// Descriptor covering exactly this allocation.
    pub fn descriptor(&self) -> RegionDescriptor {
        RegionDescriptor::new(self.addr(), self.len as u32, self.region.rkey)
    }

    pub fn bytes(&self) -> &[u8] {
        // Safety: the span is owned by this handle for its whole lifetime.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // Safety: as above, and &mut self guarantees local exclusivity.
        // Remote readers may race this; they validate what they observe.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    pub fn copy_from(&mut self, src: &[u8]) {
        self.bytes_mut()[..src.len()].copy_from_slice(src);
    }

    pub(crate) fn keep_alive(&self) -> Arc<RegionAlloc> {
        match &self.keep {
            Keep::Chunk(chunk) => chunk.clone(),
            Keep::Bin { chunk, .. } => chunk.clone(),
        }
    }

    /// Rewire this allocation to return to `bin` when dropped.
    pub(crate) fn into_bin(mut self, bin: Arc<Bin>) -> Mem {
        self.keep = Keep::Bin {
            chunk: self.keep_alive(),
            bin,
        };
        self
    }
}

impl Drop for Mem {
    fn drop(&mut self) {
        if let Keep::Bin { chunk, bin } = &self.keep {
            bin.push(Part {
                addr: self.ptr,
                cap: self.cap,
                region: self.region,
                chunk: chunk.clone(),
            });
        }
    }
}

// Safety: exclusive ownership of the span; see RegionAlloc.
unsafe impl Send for Mem {}
unsafe impl Sync for Mem {}

impl fmt::Debug for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Mem {{ addr: {:#x}, len: {}, rkey: {} }}",
            self.addr(),
            self.len,
            self.region.rkey
        )
    }
}
