//! The pinned-memory allocator stack.
//!
//! Every allocation that a remote peer may read must come out of memory
//! that is page-aligned, pinned, and registered with the memory fabric.
//! The stack layers one policy per type, each delegating to the layer
//! below, mirroring a heap-layers design:
//!
//! - [`RegionHeap`] — the base: page-aligned allocation plus fabric
//!   registration, one region per allocation.
//! - [`ZoneHeap`] — bump allocation inside fixed-size chunks; frees are
//!   no-ops, a chunk is released when its last allocation drops.
//! - [`FreeListHeap`] — LIFO reuse for one size class.
//! - [`SegregatedFitsHeap`] — routes each request to a per-class bin via a
//!   pluggable `size -> class` map, overflowing to a big-object heap.
//! - [`LockedHeap`] — coarse mutual exclusion around any heap.
//! - [`PerThreadHeap`] — a fixed array of sub-heaps indexed by thread id
//!   hash.
//!
//! Every [`Mem`] handle carries the region descriptor of its underlying
//! registration; the registration is dropped (and deregistered) when the
//! last handle sharing it goes away.

mod error;
mod heap;
mod layers;
mod mem;

pub use error::{MemError, MemResult};
pub use heap::Heap;
pub use layers::{
    default_size_classes, DefaultHeap, FreeListHeap, LockedHeap, MessageHeap, NodeHeap,
    PerThreadHeap, RegionHeap, SegregatedFitsHeap, SizeClasses, ZoneHeap,
};
pub use mem::Mem;
