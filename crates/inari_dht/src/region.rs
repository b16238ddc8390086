use inari_mem::{Heap, Mem};
use inari_net::fabric::volatile;
use inari_types::{EntryImage, RegionDescriptor, ENTRY_CELL_BYTES};

use crate::error::DhtResult;

/// The remote-visible half of a table: a contiguous array of verified
/// entry cells carved from the pinned heap. The owner publishes each cell
/// with a volatile word-wise store so concurrent remote readers observe at
/// worst a torn cell, never a stale registration.
pub struct TableRegion {
    mem: Mem,
    entries: usize,
}

impl TableRegion {
    pub fn new(heap: &dyn Heap, entries: usize) -> DhtResult<Self> {
        let mem = heap.alloc(entries * ENTRY_CELL_BYTES)?;
        let mut region = Self { mem, entries };
        let empty = EntryImage::default();
        for slot in 0..entries {
            region.publish(slot, &empty);
        }
        Ok(region)
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Descriptor of the exported region, for the node-info cell.
    pub fn descriptor(&self) -> RegionDescriptor {
        RegionDescriptor::new(
            self.mem.addr(),
            (self.entries * ENTRY_CELL_BYTES) as u32,
            self.mem.rkey(),
        )
    }

    fn cell_ptr(&self, slot: usize) -> *mut u8 {
        debug_assert!(slot < self.entries);
        // Safety: slot is in bounds of the allocation.
        unsafe { (self.mem.as_ptr() as *mut u8).add(slot * ENTRY_CELL_BYTES) }
    }

    /// Seal and publish one cell.
    pub fn publish(&mut self, slot: usize, entry: &EntryImage) {
        let cell = entry.encode();
        // Safety: cell_ptr stays within the owned region.
        unsafe { volatile::copy_to(self.cell_ptr(slot), &cell) };
    }

    /// Owner-side read of one cell. The owner is the only writer, so this
    /// decode only fails if the table memory was corrupted.
    pub fn load(&self, slot: usize) -> DhtResult<EntryImage> {
        let mut cell = [0u8; ENTRY_CELL_BYTES];
        // Safety: cell_ptr stays within the owned region.
        unsafe { volatile::copy_from(&mut cell, self.cell_ptr(slot)) };
        Ok(EntryImage::decode(&cell)?)
    }

    /// Mutate one cell in place: load, apply, republish.
    pub fn update(&mut self, slot: usize, f: impl FnOnce(&mut EntryImage)) -> DhtResult<()> {
        let mut entry = self.load(slot)?;
        f(&mut entry);
        self.publish(slot, &entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inari_mem::{DefaultHeap, Heap};
    use inari_net::fabric::{Access, LoopbackFabric};
    use inari_net::MemoryFabric;
    use inari_types::VerifyingPtr;

    fn region(entries: usize) -> (inari_net::DynFabric, TableRegion) {
        let fabric = LoopbackFabric::new();
        let heap = DefaultHeap::new(fabric.clone(), Access::RemoteRead);
        let region = TableRegion::new(&heap, entries).unwrap();
        (fabric, region)
    }

    #[test]
    fn fresh_cells_decode_as_empty() {
        let (_fabric, region) = region(16);
        for slot in 0..16 {
            assert!(region.load(slot).unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn published_cells_are_remotely_validatable() {
        let (fabric, mut region) = region(8);
        let entry = EntryImage::new(VerifyingPtr::new(0xbeef, b"kv-bytes"), 2, 0b1, 77);
        region.publish(3, &entry);

        let mr = region.descriptor();
        let mut cell = vec![0u8; ENTRY_CELL_BYTES];
        fabric
            .read(&mut cell, mr.slice((3 * ENTRY_CELL_BYTES) as u64, ENTRY_CELL_BYTES as u32))
            .await
            .unwrap();
        assert_eq!(EntryImage::decode(&cell).unwrap(), entry);
    }

    #[test]
    fn update_rehashes_the_cell() {
        let (_fabric, mut region) = region(4);
        region.update(1, |e| e.set_hop(5)).unwrap();
        let entry = region.load(1).unwrap();
        assert!(entry.has_hop(5));
        assert!(entry.is_empty());
    }
}
