//! Static partitioning: the keyspace is cut into `S` equal intervals at
//! construction. The table is exported as an array of verified routing
//! cells; a join claims the first vacant partition and every member gets
//! an update message.

use inari_mem::{Heap, Mem};
use inari_net::fabric::{read_verified, volatile, DynFabric};
use inari_types::{KeyId, NodeId, RegionDescriptor, RoutingEntry, ROUTING_CELL_BYTES};

use crate::error::{OverlayError, OverlayResult};

/// Server side: the exported partition table. A node's ring identity under
/// this overlay is the start of its partition.
pub struct FixedTable {
    mem: Mem,
    entries: Vec<RoutingEntry>,
}

impl FixedTable {
    /// Build the partition table with the constructing node occupying
    /// partition 0.
    pub fn new(heap: &dyn Heap, partitions: u16, host: &str, port: &str) -> OverlayResult<Self> {
        let mut table = Self::vacant(heap, partitions)?;
        let first = table.entries[0].start;
        table.entries[0].node = NodeId::new(first, host, port);
        table.publish(0);
        Ok(table)
    }

    /// Build the partition table with every partition vacant; a joining
    /// node adopts the network's current view into it.
    pub fn vacant(heap: &dyn Heap, partitions: u16) -> OverlayResult<Self> {
        assert!(partitions > 0, "a routing table needs at least one partition");
        let mem = heap.alloc(partitions as usize * ROUTING_CELL_BYTES)?;
        let entries = (0..partitions)
            .map(|k| {
                let start = partition_start(k, partitions);
                RoutingEntry::new(NodeId::default(), start)
            })
            .collect();
        let mut table = Self { mem, entries };
        for index in 0..table.entries.len() {
            table.publish(index);
        }
        Ok(table)
    }

    /// Replace the whole table with another node's view.
    pub fn adopt(&mut self, entries: &[RoutingEntry]) -> OverlayResult<()> {
        if entries.len() != self.entries.len() {
            return Err(OverlayError::Protocol(format!(
                "partition count mismatch: ours {}, theirs {}",
                self.entries.len(),
                entries.len()
            )));
        }
        for (index, entry) in entries.iter().enumerate() {
            self.entries[index] = *entry;
            self.publish(index);
        }
        Ok(())
    }

    /// Record ourselves as the owner of the partition starting at `start`.
    pub fn claim(&mut self, start: KeyId, node: NodeId) -> OverlayResult<()> {
        let index = self
            .entries
            .iter()
            .position(|e| e.start == start)
            .ok_or_else(|| {
                OverlayError::Protocol(format!("no partition starts at {start}"))
            })?;
        self.entries[index].node = node;
        self.publish(index);
        Ok(())
    }

    fn publish(&mut self, index: usize) {
        let cell = self.entries[index].encode_cell();
        // Safety: index is bounded by the entry count the region was sized
        // for.
        unsafe {
            volatile::copy_to(
                (self.mem.as_ptr() as *mut u8).add(index * ROUTING_CELL_BYTES),
                &cell,
            )
        };
    }

    pub fn descriptor(&self) -> RegionDescriptor {
        RegionDescriptor::new(
            self.mem.addr(),
            (self.entries.len() * ROUTING_CELL_BYTES) as u32,
            self.mem.rkey(),
        )
    }

    pub fn partitions(&self) -> u16 {
        self.entries.len() as u16
    }

    pub fn entries(&self) -> &[RoutingEntry] {
        &self.entries
    }

    /// Admit a joining node into the first vacant partition. Returns the
    /// claimed index and entry; the caller broadcasts the update and sends
    /// the join reply.
    pub fn join(&mut self, host: &str, port: &str) -> OverlayResult<(usize, RoutingEntry)> {
        let index = self
            .entries
            .iter()
            .position(|e| e.node.is_vacant())
            .ok_or(OverlayError::NetworkFull)?;
        let id = self.entries[index].start;
        self.entries[index].node = NodeId::new(id, host, port);
        self.publish(index);
        tracing::info!(index, %id, host, port, "node joined partition");
        Ok((index, self.entries[index]))
    }

    /// Apply a broadcast update.
    pub fn update(&mut self, index: usize, node: NodeId) -> OverlayResult<()> {
        let Some(entry) = self.entries.get_mut(index) else {
            return Err(OverlayError::Protocol(format!(
                "update of entry {index} in a table of {}",
                self.entries.len()
            )));
        };
        entry.node = node;
        self.publish(index);
        Ok(())
    }

    /// Every member we can currently reach (occupied partitions).
    pub fn members(&self) -> impl Iterator<Item = &RoutingEntry> {
        self.entries.iter().filter(|e| !e.node.is_vacant())
    }

    /// The interval `[start, end]` owned by the node with ring id `id`.
    pub fn range_of(&self, id: KeyId) -> (KeyId, KeyId) {
        let count = self.entries.len();
        for (k, entry) in self.entries.iter().enumerate() {
            if entry.start == id {
                let end = self.entries[(k + 1) % count]
                    .start
                    .wrapping_sub(KeyId(1));
                return (entry.start, end);
            }
        }
        // an id that owns no partition owns nothing: the empty convention
        // start == end covers exactly one key, its own
        (id, id)
    }
}

fn partition_start(k: u16, partitions: u16) -> KeyId {
    KeyId(((k as u32 * 0x1_0000) / partitions as u32) as u16)
}

/// Client side: a loaded copy of some node's partition table.
pub struct FixedNetwork {
    entries: Vec<RoutingEntry>,
}

impl FixedNetwork {
    /// Remote-read all partition cells from an exported table region.
    pub async fn load(
        fabric: &DynFabric,
        table: RegionDescriptor,
        partitions: u16,
    ) -> OverlayResult<Self> {
        let mut entries = Vec::with_capacity(partitions as usize);
        for k in 0..partitions as usize {
            let cell = read_verified(
                fabric.as_ref(),
                table.slice((k * ROUTING_CELL_BYTES) as u64, ROUTING_CELL_BYTES as u32),
            )
            .await?;
            entries.push(RoutingEntry::decode_cell(&cell)?);
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[RoutingEntry] {
        &self.entries
    }

    /// The node owning `id`: linear scan for the containing interval.
    pub fn successor(&self, id: KeyId) -> OverlayResult<&RoutingEntry> {
        let count = self.entries.len();
        for (k, entry) in self.entries.iter().enumerate() {
            let end = self.entries[(k + 1) % count].start.wrapping_sub(KeyId(1));
            if id.in_interval(entry.start, end) {
                if entry.node.is_vacant() {
                    return Err(OverlayError::Unroutable(id));
                }
                return Ok(entry);
            }
        }
        Err(OverlayError::Unroutable(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inari_mem::DefaultHeap;
    use inari_net::fabric::{Access, LoopbackFabric};
    use pretty_assertions::assert_eq;

    fn table(partitions: u16) -> (DynFabric, FixedTable) {
        let fabric = LoopbackFabric::new();
        let heap = DefaultHeap::new(fabric.clone(), Access::RemoteRead);
        let table = FixedTable::new(&heap, partitions, "127.0.0.1", "7000").unwrap();
        (fabric, table)
    }

    #[test]
    fn a_single_partition_owns_the_whole_keyspace() {
        let (_fabric, table) = table(1);
        let (start, end) = table.range_of(KeyId(0));
        assert_eq!(start, KeyId(0));
        assert_eq!(end, KeyId(0xffff));
    }

    #[test]
    fn partitions_are_equal_and_cover_the_ring() {
        let (_fabric, table) = table(4);
        let starts: Vec<u16> = table.entries().iter().map(|e| e.start.0).collect();
        assert_eq!(starts, vec![0x0000, 0x4000, 0x8000, 0xc000]);
        let (start, end) = table.range_of(KeyId(0x4000));
        assert_eq!((start, end), (KeyId(0x4000), KeyId(0x7fff)));
        let (start, end) = table.range_of(KeyId(0xc000));
        assert_eq!((start, end), (KeyId(0xc000), KeyId(0xffff)));
    }

    #[test]
    fn join_takes_the_first_vacant_partition() {
        let (_fabric, mut table) = table(3);
        let (index, entry) = table.join("10.0.0.2", "7001").unwrap();
        assert_eq!(index, 1);
        assert_eq!(entry.node.host(), "10.0.0.2");
        assert_eq!(entry.node.id, entry.start);

        let (index, _) = table.join("10.0.0.3", "7002").unwrap();
        assert_eq!(index, 2);
        assert!(matches!(
            table.join("10.0.0.4", "7003"),
            Err(OverlayError::NetworkFull)
        ));
    }

    #[tokio::test]
    async fn a_loaded_network_routes_by_interval() {
        inari_trace::test_run().ok();
        let (fabric, mut table) = table(2);
        table.join("10.0.0.2", "7001").unwrap();

        let network = FixedNetwork::load(&fabric, table.descriptor(), 2)
            .await
            .unwrap();
        assert_eq!(network.successor(KeyId(5)).unwrap().node.host(), "127.0.0.1");
        assert_eq!(
            network.successor(KeyId(0x8001)).unwrap().node.host(),
            "10.0.0.2"
        );
    }

    #[tokio::test]
    async fn vacant_partitions_are_unroutable() {
        let (fabric, table) = table(2);
        let network = FixedNetwork::load(&fabric, table.descriptor(), 2)
            .await
            .unwrap();
        assert!(matches!(
            network.successor(KeyId(0x9000)),
            Err(OverlayError::Unroutable(_))
        ));
    }
}
