use std::alloc::Layout;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;

use inari_net::fabric::{Access, DynFabric, MemoryFabric};

use crate::error::{MemError, MemResult};
use crate::heap::Heap;
use crate::mem::{Bin, Keep, Mem, RegionAlloc};

/// Base-layer alignment; registrations start on page boundaries.
pub const PAGE_BYTES: usize = 4096;
/// Sub-allocation alignment inside a zone chunk.
const ZONE_ALIGN: usize = 128;
/// Default chunk size fed to the zone layers.
const ZONE_CHUNK_BYTES: usize = 16 * 1024 * 1024;

fn align_up(len: usize, align: usize) -> usize {
    (len + align - 1) & !(align - 1)
}

/// The base of the stack: one page-aligned allocation per request,
/// registered with the fabric, deregistered and released when the last
/// handle sharing the registration drops.
pub struct RegionHeap {
    fabric: DynFabric,
    access: Access,
}

impl RegionHeap {
    pub fn new(fabric: DynFabric, access: Access) -> Self {
        Self { fabric, access }
    }
}

impl Heap for RegionHeap {
    fn alloc(&self, len: usize) -> MemResult<Mem> {
        let len = len.max(1);
        let layout = Layout::from_size_align(len, PAGE_BYTES)
            .map_err(|_| MemError::AllocationFailed { len })?;
        // Safety: layout has non-zero size.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(MemError::AllocationFailed { len })?;

        let region = match self.fabric.register(ptr.as_ptr() as u64, len, self.access) {
            Ok(region) => region,
            Err(e) => {
                // Safety: freshly allocated above with this layout.
                unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
                return Err(e.into());
            }
        };
        tracing::trace!(len, rkey = region.rkey, "base allocation");
        let chunk = RegionAlloc::new(ptr, layout, region, self.fabric.clone());
        Ok(Mem::new(ptr, len, len, region, Keep::Chunk(chunk)))
    }
}

struct ZoneState {
    chunk: Option<Mem>,
    used: usize,
}

/// Bump allocation within fixed-size chunks. Individual frees are no-ops;
/// a chunk is released once the zone has moved on and the last allocation
/// carved from it has dropped.
pub struct ZoneHeap<H> {
    inner: H,
    chunk_len: usize,
    state: Mutex<ZoneState>,
}

impl<H: Heap> ZoneHeap<H> {
    pub fn new(inner: H) -> Self {
        Self::with_chunk_len(inner, ZONE_CHUNK_BYTES)
    }

    pub fn with_chunk_len(inner: H, chunk_len: usize) -> Self {
        Self {
            inner,
            chunk_len,
            state: Mutex::new(ZoneState {
                chunk: None,
                used: 0,
            }),
        }
    }
}

impl<H: Heap> Heap for ZoneHeap<H> {
    fn alloc(&self, len: usize) -> MemResult<Mem> {
        let size = align_up(len.max(1), ZONE_ALIGN);
        let mut state = self.state.lock();

        let exhausted = match &state.chunk {
            Some(chunk) => chunk.len() - state.used < size,
            None => true,
        };
        if exhausted {
            state.chunk = Some(self.inner.alloc(size.max(self.chunk_len))?);
            state.used = 0;
        }

        let chunk = state
            .chunk
            .as_ref()
            .ok_or(MemError::AllocationFailed { len })?;
        // Safety: used + size fits the chunk, checked above.
        let ptr = unsafe { NonNull::new_unchecked(chunk.as_ptr().add(state.used) as *mut u8) };
        let mem = Mem::new(ptr, len, size, chunk.region(), Keep::Chunk(chunk.keep_alive()));
        state.used += size;
        Ok(mem)
    }
}

/// LIFO reuse of dropped allocations. One size class: callers above this
/// layer route uniformly sized requests here.
pub struct FreeListHeap<H> {
    inner: H,
    bin: Arc<Bin>,
}

impl<H: Heap> FreeListHeap<H> {
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            bin: Bin::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn free_len(&self) -> usize {
        self.bin.len()
    }
}

impl<H: Heap> Heap for FreeListHeap<H> {
    fn alloc(&self, len: usize) -> MemResult<Mem> {
        if let Some(part) = self.bin.pop(len) {
            return Ok(Mem::new(
                part.addr,
                len,
                part.cap,
                part.region,
                Keep::Bin {
                    chunk: part.chunk,
                    bin: self.bin.clone(),
                },
            ));
        }
        Ok(self.inner.alloc(len)?.into_bin(self.bin.clone()))
    }
}

/// The `size -> class` map of the segregated-fit layer, with its inverse
/// (largest size a class serves).
#[derive(Clone, Copy)]
pub struct SizeClasses {
    pub count: usize,
    class_of: fn(usize) -> usize,
    max_of: fn(usize) -> usize,
}

impl SizeClasses {
    pub fn new(count: usize, class_of: fn(usize) -> usize, max_of: fn(usize) -> usize) -> Self {
        Self {
            count,
            class_of,
            max_of,
        }
    }

    pub fn class_of(&self, len: usize) -> usize {
        (self.class_of)(len)
    }

    pub fn max_of(&self, class: usize) -> usize {
        (self.max_of)(class)
    }
}

fn default_class_of(len: usize) -> usize {
    if len == 0 {
        0
    } else if len <= 128 {
        // 16 bins, 8-byte steps
        len.div_ceil(8) - 1
    } else if len <= 4096 {
        // 31 bins, 128-byte steps
        len.div_ceil(128) + 14
    } else {
        47 + (len - 1).ilog2() as usize - 12
    }
}

fn default_max_of(class: usize) -> usize {
    if class < 16 {
        (class + 1) * 8
    } else if class <= 46 {
        (class - 14) * 128
    } else {
        1 << (class - 34)
    }
}

/// The 48-bin default class map: 8-byte steps up to 128, 128-byte steps up
/// to 4096, then powers of two up to 8192.
pub fn default_size_classes() -> SizeClasses {
    SizeClasses::new(48, default_class_of, default_max_of)
}

/// Routes each request to a per-class bin heap; requests beyond the
/// largest class fall through to the big-object heap.
pub struct SegregatedFitsHeap<B, H> {
    classes: SizeClasses,
    bins: Vec<B>,
    big: H,
}

impl<B: Heap, H: Heap> SegregatedFitsHeap<B, H> {
    pub fn new(classes: SizeClasses, mut mk_bin: impl FnMut() -> B, big: H) -> Self {
        let bins = (0..classes.count).map(|_| mk_bin()).collect();
        Self { classes, bins, big }
    }
}

impl<B: Heap, H: Heap> Heap for SegregatedFitsHeap<B, H> {
    fn alloc(&self, len: usize) -> MemResult<Mem> {
        let class = self.classes.class_of(len);
        if class >= self.classes.count {
            self.big.alloc(len)
        } else {
            // round to the class bound so the bin stays one size class
            self.bins[class].alloc(self.classes.max_of(class))
        }
    }
}

/// Coarse exclusion around any heap.
pub struct LockedHeap<H> {
    inner: Mutex<H>,
}

impl<H: Heap> LockedHeap<H> {
    pub fn new(inner: H) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl<H: Heap> Heap for LockedHeap<H> {
    fn alloc(&self, len: usize) -> MemResult<Mem> {
        self.inner.lock().alloc(len)
    }
}

/// A fixed array of independent sub-heaps; each request goes to the heap
/// picked by hashing the calling thread's id.
pub struct PerThreadHeap<H> {
    heaps: Vec<H>,
}

impl<H: Heap> PerThreadHeap<H> {
    pub fn new(count: usize, mut mk: impl FnMut() -> H) -> Self {
        Self {
            heaps: (0..count.max(1)).map(|_| mk()).collect(),
        }
    }
}

impl<H: Heap> Heap for PerThreadHeap<H> {
    fn alloc(&self, len: usize) -> MemResult<Mem> {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        let index = hasher.finish() as usize % self.heaps.len();
        self.heaps[index].alloc(len)
    }
}

/// The workhorse composition: a locked segregated-fit heap whose bins are
/// free-listed zones and whose big-object path is its own zone.
pub struct DefaultHeap {
    inner: LockedHeap<SegregatedFitsHeap<FreeListHeap<ZoneHeap<RegionHeap>>, ZoneHeap<RegionHeap>>>,
}

impl DefaultHeap {
    pub fn new(fabric: DynFabric, access: Access) -> Self {
        let classes = default_size_classes();
        let mk_bin = || {
            FreeListHeap::new(ZoneHeap::new(RegionHeap::new(fabric.clone(), access)))
        };
        let big = ZoneHeap::new(RegionHeap::new(fabric.clone(), access));
        Self {
            inner: LockedHeap::new(SegregatedFitsHeap::new(classes, mk_bin, big)),
        }
    }
}

impl Heap for DefaultHeap {
    fn alloc(&self, len: usize) -> MemResult<Mem> {
        self.inner.alloc(len)
    }
}

/// Per-thread wrapper over [`DefaultHeap`]; a node's request handlers
/// allocate blobs here without contending.
pub struct NodeHeap {
    inner: PerThreadHeap<DefaultHeap>,
}

impl NodeHeap {
    pub fn new(fabric: DynFabric, access: Access, threads: usize) -> Self {
        Self {
            inner: PerThreadHeap::new(threads, || DefaultHeap::new(fabric.clone(), access)),
        }
    }
}

impl Heap for NodeHeap {
    fn alloc(&self, len: usize) -> MemResult<Mem> {
        self.inner.alloc(len)
    }
}

/// Zone-only heap for short-lived message buffers.
pub struct MessageHeap {
    inner: ZoneHeap<RegionHeap>,
}

impl MessageHeap {
    pub fn new(fabric: DynFabric, access: Access) -> Self {
        Self {
            inner: ZoneHeap::with_chunk_len(RegionHeap::new(fabric, access), 1024 * 1024),
        }
    }
}

impl Heap for MessageHeap {
    fn alloc(&self, len: usize) -> MemResult<Mem> {
        self.inner.alloc(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inari_net::LoopbackFabric;
    use pretty_assertions::assert_eq;

    fn fabric() -> DynFabric {
        LoopbackFabric::new()
    }

    #[tokio::test]
    async fn base_allocations_are_remotely_readable() {
        inari_trace::test_run().ok();
        let fabric = fabric();
        let heap = RegionHeap::new(fabric.clone(), Access::RemoteRead);

        let mut mem = heap.alloc(64).unwrap();
        mem.copy_from(b"one-sided");
        assert_eq!(mem.addr() % PAGE_BYTES as u64, 0);

        let mut out = vec![0u8; 64];
        fabric.read(&mut out, mem.descriptor()).await.unwrap();
        assert_eq!(&out[..9], b"one-sided");
    }

    #[tokio::test]
    async fn dropping_the_last_handle_deregisters() {
        let fabric = fabric();
        let heap = RegionHeap::new(fabric.clone(), Access::RemoteRead);

        let mem = heap.alloc(32).unwrap();
        let mr = mem.descriptor();
        drop(mem);

        let mut out = vec![0u8; 32];
        assert!(fabric.read(&mut out, mr).await.is_err());
    }

    #[test]
    fn zone_bump_allocations_share_one_registration() {
        let heap = ZoneHeap::with_chunk_len(
            RegionHeap::new(fabric(), Access::RemoteRead),
            4096,
        );
        let a = heap.alloc(100).unwrap();
        let b = heap.alloc(100).unwrap();
        assert_eq!(a.rkey(), b.rkey());
        // zone alignment separates the spans
        assert_eq!(b.addr() - a.addr(), 128);
    }

    #[test]
    fn an_oversized_request_gets_its_own_chunk() {
        let heap = ZoneHeap::with_chunk_len(
            RegionHeap::new(fabric(), Access::RemoteRead),
            1024,
        );
        let small = heap.alloc(16).unwrap();
        let large = heap.alloc(8192).unwrap();
        assert_ne!(small.rkey(), large.rkey());
        assert_eq!(large.len(), 8192);
    }

    #[test]
    fn free_list_reuses_the_last_dropped_span() {
        let heap = FreeListHeap::new(ZoneHeap::with_chunk_len(
            RegionHeap::new(fabric(), Access::RemoteRead),
            4096,
        ));
        let first = heap.alloc(256).unwrap();
        let addr = first.addr();
        let rkey = first.rkey();
        drop(first);
        assert_eq!(heap.free_len(), 1);

        let second = heap.alloc(256).unwrap();
        assert_eq!(second.addr(), addr);
        assert_eq!(second.rkey(), rkey);
        assert_eq!(heap.free_len(), 0);
    }

    #[test]
    fn default_class_map_matches_its_inverse() {
        let classes = default_size_classes();
        for len in 1..=8192usize {
            let class = classes.class_of(len);
            assert!(class < classes.count, "len {len} escaped the classes");
            assert!(
                classes.max_of(class) >= len,
                "class {class} max {} below len {len}",
                classes.max_of(class)
            );
            if class > 0 {
                assert!(
                    classes.max_of(class - 1) < len,
                    "len {len} should be in class {}",
                    class - 1
                );
            }
        }
        assert_eq!(classes.class_of(8193), 48);
    }

    #[test]
    fn segregated_requests_round_up_to_their_class() {
        let heap = DefaultHeap::new(fabric(), Access::RemoteRead);
        let mem = heap.alloc(100).unwrap();
        // class of 100 is the 104-byte bin
        assert_eq!(mem.len(), 104);
        let big = heap.alloc(100_000).unwrap();
        assert_eq!(big.len(), 100_000);
    }

    #[test]
    fn same_class_allocations_recycle() {
        let heap = DefaultHeap::new(fabric(), Access::RemoteRead);
        let first = heap.alloc(64).unwrap();
        let addr = first.addr();
        drop(first);
        let second = heap.alloc(60).unwrap();
        assert_eq!(second.addr(), addr);
    }

    #[test]
    fn per_thread_heaps_serve_all_threads() {
        let fabric = fabric();
        let heap = std::sync::Arc::new(NodeHeap::new(fabric, Access::RemoteRead, 4));
        let mut joins = Vec::new();
        for _ in 0..8 {
            let heap = heap.clone();
            joins.push(std::thread::spawn(move || {
                let mem = heap.alloc(512).unwrap();
                assert_eq!(mem.len(), 512);
                mem.addr()
            }));
        }
        for join in joins {
            join.join().unwrap();
        }
    }
}
