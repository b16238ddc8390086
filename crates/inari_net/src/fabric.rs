//! The remote-memory fabric boundary.
//!
//! The real transport (a verbs wrapper and its connection manager) lives
//! outside this repository; this module fixes the seam it must implement.
//! Registration hands out [`RegionDescriptor`]s whose rkey a remote peer
//! presents to read the region with no involvement of the owning CPU.
//!
//! [`LoopbackFabric`] implements the seam for a single process: a read is
//! a word-wise volatile copy of the registered memory, which is exactly
//! what a remote reader observes — bytes with no ordering or coherence
//! promise. The verified-cell protocol is what makes such reads usable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;

use inari_types::RegionDescriptor;

use crate::error::{NetError, NetResult};

/// What a registration exposes to peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Usable for local work requests only.
    LocalOnly,
    /// Remote peers may issue one-sided reads against the region.
    RemoteRead,
}

pub trait MemoryFabric: Send + Sync + 'static {
    /// Register `len` bytes at `addr` and return the region descriptor a
    /// peer needs to read them.
    ///
    /// The memory must stay valid and pinned until [`deregister`] is
    /// called with the returned rkey; allocation layers enforce this by
    /// tying deregistration to the drop of the owning allocation.
    ///
    /// [`deregister`]: MemoryFabric::deregister
    fn register(&self, addr: u64, len: usize, access: Access) -> NetResult<RegionDescriptor>;

    fn deregister(&self, rkey: u32) -> NetResult<()>;

    /// One-sided read: fill `dst` from the remote region named by `src`.
    /// Completion is asynchronous; the bytes carry no ordering guarantee
    /// with respect to the owner's concurrent writes.
    fn read<'a>(&'a self, dst: &'a mut [u8], src: RegionDescriptor) -> BoxFuture<'a, NetResult<()>>;
}

/// Shared handle to whatever fabric the process was wired with.
pub type DynFabric = Arc<dyn MemoryFabric>;

#[derive(Debug, Clone, Copy)]
struct Registration {
    addr: u64,
    len: usize,
    access: Access,
}

/// In-process fabric. All nodes and clients of a test cluster share one of
/// these; rkeys are process-global.
#[derive(Default)]
pub struct LoopbackFabric {
    regions: Mutex<HashMap<u32, Registration>>,
    next_rkey: AtomicU32,
}

impl LoopbackFabric {
    pub fn new() -> DynFabric {
        Arc::new(Self::default())
    }

    fn lookup(&self, src: &RegionDescriptor) -> NetResult<Registration> {
        let regions = self.regions.lock();
        let reg = regions
            .get(&src.rkey)
            .copied()
            .ok_or(NetError::UnknownRegion { rkey: src.rkey })?;
        if reg.access != Access::RemoteRead {
            return Err(NetError::AccessDenied { rkey: src.rkey });
        }
        let start = reg.addr;
        let end = reg.addr + reg.len as u64;
        let read_end = src.addr + src.len as u64;
        if src.addr < start || read_end > end {
            return Err(NetError::OutOfBounds {
                addr: src.addr,
                len: src.len,
            });
        }
        Ok(reg)
    }
}

impl MemoryFabric for LoopbackFabric {
    fn register(&self, addr: u64, len: usize, access: Access) -> NetResult<RegionDescriptor> {
        if len > u32::MAX as usize {
            return Err(NetError::RegistrationFailed(format!(
                "region of {len} bytes exceeds the addressable length"
            )));
        }
        // rkey 0 stays unused so an all-zero descriptor is always invalid
        let rkey = self.next_rkey.fetch_add(1, Ordering::Relaxed) + 1;
        self.regions
            .lock()
            .insert(rkey, Registration { addr, len, access });
        tracing::trace!(rkey, addr, len, "registered region");
        Ok(RegionDescriptor::new(addr, len as u32, rkey))
    }

    fn deregister(&self, rkey: u32) -> NetResult<()> {
        self.regions
            .lock()
            .remove(&rkey)
            .map(|_| ())
            .ok_or(NetError::UnknownRegion { rkey })
    }

    fn read<'a>(&'a self, dst: &'a mut [u8], src: RegionDescriptor) -> BoxFuture<'a, NetResult<()>> {
        async move {
            if dst.len() != src.len as usize {
                return Err(NetError::OutOfBounds {
                    addr: src.addr,
                    len: src.len,
                });
            }
            self.lookup(&src)?;
            // Safety: the region was registered by this process and stays
            // pinned until deregistered, so the source range is readable.
            // Concurrent writers are expected; volatile copy mirrors the
            // unordered byte observation a NIC DMA would produce.
            unsafe { volatile::copy_from(dst, src.addr as *const u8) };
            Ok(())
        }
        .boxed()
    }
}

/// Attempts before a verified read gives up. A mismatch means the read
/// raced a writer, so almost all retries succeed immediately; the bound
/// only exists to surface a wedged or corrupt region.
pub const READ_RETRY_LIMIT: usize = 1024;

/// One-sided read of a verified cell, retried until the observed cell
/// validates. Returns the raw cell bytes (payload and trailing hash).
pub async fn read_verified(
    fabric: &dyn MemoryFabric,
    src: RegionDescriptor,
) -> NetResult<Vec<u8>> {
    let mut cell = vec![0u8; src.len as usize];
    for attempt in 0..READ_RETRY_LIMIT {
        fabric.read(&mut cell, src).await?;
        if inari_types::open(&cell).is_ok() {
            if attempt > 0 {
                tracing::trace!(attempt, addr = src.addr, "torn read resolved");
            }
            return Ok(cell);
        }
        tokio::task::yield_now().await;
    }
    Err(NetError::Types(inari_types::TypesError::TornRead))
}

pub mod volatile {
    //! Word-wise volatile memory transfer. The owner publishes cells with
    //! [`copy_to`]; the loopback fabric observes them with [`copy_from`].
    //! Neither establishes ordering; torn observations are the norm and
    //! are caught by cell validation.

    /// # Safety
    /// `src..src + dst.len()` must be readable memory.
    pub unsafe fn copy_from(dst: &mut [u8], src: *const u8) {
        let len = dst.len();
        let dst = dst.as_mut_ptr();
        let mut i = 0;
        if (src as usize) % 8 == 0 {
            while i + 8 <= len {
                let word = (src.add(i) as *const u64).read_volatile();
                (dst.add(i) as *mut u64).write_unaligned(word);
                i += 8;
            }
        }
        while i < len {
            *dst.add(i) = src.add(i).read_volatile();
            i += 1;
        }
    }

    /// # Safety
    /// `dst..dst + src.len()` must be writable memory owned by the caller.
    pub unsafe fn copy_to(dst: *mut u8, src: &[u8]) {
        let len = src.len();
        let src = src.as_ptr();
        let mut i = 0;
        if (dst as usize) % 8 == 0 {
            while i + 8 <= len {
                let word = (src.add(i) as *const u64).read_unaligned();
                (dst.add(i) as *mut u64).write_volatile(word);
                i += 8;
            }
        }
        while i < len {
            dst.add(i).write_volatile(*src.add(i));
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inari_types::{cell_bytes, seal};

    fn registered(fabric: &LoopbackFabric, buf: &[u8], access: Access) -> RegionDescriptor {
        fabric
            .register(buf.as_ptr() as u64, buf.len(), access)
            .unwrap()
    }

    #[tokio::test]
    async fn reads_see_registered_bytes() {
        let fabric = LoopbackFabric::default();
        let data = *b"remote memory bytes";
        let mr = registered(&fabric, &data, Access::RemoteRead);

        let mut out = vec![0u8; data.len()];
        fabric.read(&mut out, mr).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn sub_range_reads_work() {
        let fabric = LoopbackFabric::default();
        let data = *b"0123456789abcdef";
        let mr = registered(&fabric, &data, Access::RemoteRead);

        let mut out = vec![0u8; 4];
        fabric.read(&mut out, mr.slice(10, 4)).await.unwrap();
        assert_eq!(&out, b"abcd");
    }

    #[tokio::test]
    async fn out_of_bounds_reads_are_rejected() {
        let fabric = LoopbackFabric::default();
        let data = [0u8; 16];
        let mr = registered(&fabric, &data, Access::RemoteRead);

        let mut out = vec![0u8; 8];
        let bad = RegionDescriptor::new(mr.addr + 12, 8, mr.rkey);
        assert!(matches!(
            fabric.read(&mut out, bad).await,
            Err(NetError::OutOfBounds { .. })
        ));
    }

    #[tokio::test]
    async fn local_only_regions_refuse_remote_reads() {
        let fabric = LoopbackFabric::default();
        let data = [0u8; 8];
        let mr = registered(&fabric, &data, Access::LocalOnly);

        let mut out = vec![0u8; 8];
        assert!(matches!(
            fabric.read(&mut out, mr).await,
            Err(NetError::AccessDenied { .. })
        ));
    }

    #[tokio::test]
    async fn deregistered_rkeys_stop_resolving() {
        let fabric = LoopbackFabric::default();
        let data = [0u8; 8];
        let mr = registered(&fabric, &data, Access::RemoteRead);
        fabric.deregister(mr.rkey).unwrap();

        let mut out = vec![0u8; 8];
        assert!(matches!(
            fabric.read(&mut out, mr).await,
            Err(NetError::UnknownRegion { .. })
        ));
    }

    // The torn-read property: a reader racing a writer must sometimes see
    // an invalid cell, and an accepted cell must always be one of the
    // states the writer actually published.
    #[test]
    fn torn_reads_are_detected_never_invented() {
        inari_trace::test_run().ok();

        const PAYLOAD: usize = 1024;
        let a = vec![0xaau8; PAYLOAD];
        let b = vec![0x55u8; PAYLOAD];

        let mut region = vec![0u8; cell_bytes(PAYLOAD)];
        let mut image_a = vec![0u8; cell_bytes(PAYLOAD)];
        let mut image_b = vec![0u8; cell_bytes(PAYLOAD)];
        seal(&a, &mut image_a);
        seal(&b, &mut image_b);
        seal(&a, &mut region);

        let base = region.as_mut_ptr();
        let len = region.len();
        let stop = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|s| {
            let writer = {
                let stop = &stop;
                let image_a = &image_a;
                let image_b = &image_b;
                // Safety: the writer thread is the only one mutating the
                // region; readers go through volatile copies and validate.
                let dst = base as usize;
                s.spawn(move || {
                    let mut flip = false;
                    while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                        // bursts of rewrites produce torn observations, the
                        // pauses give the reader windows that validate
                        for _ in 0..64 {
                            let src = if flip { image_a } else { image_b };
                            unsafe { volatile::copy_to(dst as *mut u8, src) };
                            flip = !flip;
                        }
                        std::thread::sleep(std::time::Duration::from_micros(50));
                    }
                })
            };

            let mut torn = 0u64;
            let mut accepted = 0u64;
            let mut observed = vec![0u8; len];
            for _ in 0..200_000 {
                unsafe { volatile::copy_from(&mut observed, base as *const u8) };
                match inari_types::open(&observed) {
                    Ok(payload) => {
                        accepted += 1;
                        assert!(
                            payload == a.as_slice() || payload == b.as_slice(),
                            "accepted a payload the writer never published"
                        );
                    }
                    Err(_) => torn += 1,
                }
            }
            stop.store(true, std::sync::atomic::Ordering::Relaxed);
            writer.join().unwrap();

            tracing::info!(torn, accepted, "torn read ratio");
            assert!(accepted > 0, "reader never validated a single cell");
            assert!(torn > 0, "a racing reader should observe torn cells");
        });
    }
}
