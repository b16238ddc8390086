use inari_mem::Heap;
use inari_types::{RegionDescriptor, TableKind, TuningParams};

use crate::blob::Blob;
use crate::cuckoo::CuckooServer;
use crate::error::{DhtError, DhtResult};
use crate::hopscotch::HopscotchServer;
use crate::region::TableRegion;

/// The placement variants behind one dispatch surface. A node owns exactly
/// one of these; which one is a construction-time choice.
pub enum ServerTable {
    Hopscotch(HopscotchServer),
    Cuckoo(CuckooServer),
}

impl ServerTable {
    pub fn new(heap: &dyn Heap, params: &TuningParams) -> DhtResult<Self> {
        let region = TableRegion::new(heap, params.initial_table_size)?;
        Ok(match params.table {
            TableKind::Hopscotch => {
                ServerTable::Hopscotch(HopscotchServer::new(region, params.hop_range))
            }
            TableKind::Cuckoo => ServerTable::Cuckoo(CuckooServer::new(region, params.hash_count)),
        })
    }

    pub fn insert(&mut self, blob: Blob) -> DhtResult<()> {
        match self {
            ServerTable::Hopscotch(t) => t.insert(blob),
            ServerTable::Cuckoo(t) => t.insert(blob),
        }
    }

    pub fn lookup(&self, key: &[u8]) -> DhtResult<Option<usize>> {
        match self {
            ServerTable::Hopscotch(t) => t.lookup(key),
            ServerTable::Cuckoo(t) => t.lookup(key),
        }
    }

    pub fn remove(&mut self, key: &[u8]) -> DhtResult<bool> {
        match self {
            ServerTable::Hopscotch(t) => t.remove(key),
            ServerTable::Cuckoo(t) => t.remove(key),
        }
    }

    pub fn entries(&self) -> usize {
        match self {
            ServerTable::Hopscotch(t) => t.entries(),
            ServerTable::Cuckoo(t) => t.entries(),
        }
    }

    pub fn used(&self) -> usize {
        match self {
            ServerTable::Hopscotch(t) => t.used(),
            ServerTable::Cuckoo(t) => t.used(),
        }
    }

    pub fn load_factor(&self) -> f64 {
        match self {
            ServerTable::Hopscotch(t) => t.load_factor(),
            ServerTable::Cuckoo(t) => t.load_factor(),
        }
    }

    pub fn descriptor(&self) -> RegionDescriptor {
        match self {
            ServerTable::Hopscotch(t) => t.region().descriptor(),
            ServerTable::Cuckoo(t) => t.region().descriptor(),
        }
    }

    pub fn blob_at(&self, slot: usize) -> Option<&Blob> {
        match self {
            ServerTable::Hopscotch(t) => t.blob_at(slot),
            ServerTable::Cuckoo(t) => t.blob_at(slot),
        }
    }

    fn drain(&mut self) -> Vec<Blob> {
        match self {
            ServerTable::Hopscotch(t) => t.drain(),
            ServerTable::Cuckoo(t) => t.drain(),
        }
    }

    fn stash(&mut self, blobs: Vec<Blob>) {
        match self {
            ServerTable::Hopscotch(t) => t.stash(blobs),
            ServerTable::Cuckoo(t) => t.stash(blobs),
        }
    }

    fn install(&mut self, region: TableRegion) {
        match self {
            ServerTable::Hopscotch(t) => t.install(region),
            ServerTable::Cuckoo(t) => t.install(region),
        }
    }

    pub fn check_consistency(&self) {
        match self {
            ServerTable::Hopscotch(t) => t.check_consistency(),
            ServerTable::Cuckoo(t) => t.check_consistency(),
        }
    }

    pub fn dump(&self) {
        match self {
            ServerTable::Hopscotch(t) => t.dump(),
            ServerTable::Cuckoo(t) => t.dump(),
        }
    }

    /// Rehome the whole table into a larger region, growing again until
    /// everything fits. No record is lost on intermediate failures: they
    /// are parked and re-drained.
    pub fn grow(&mut self, heap: &dyn Heap, params: &TuningParams) -> DhtResult<()> {
        let mut size = self.entries();
        let mut blobs = self.drain();
        loop {
            size = params.next_table_size(size);
            tracing::info!(size, records = blobs.len(), "resizing table");
            let region = match TableRegion::new(heap, size) {
                Ok(region) => region,
                Err(e) => {
                    self.stash(blobs);
                    return Err(e);
                }
            };
            self.install(region);

            let mut failed = None;
            while let Some(blob) = blobs.pop() {
                match self.insert(blob) {
                    Ok(()) => {}
                    Err(DhtError::NeedResize(blob)) => {
                        failed = Some(blob);
                        break;
                    }
                    Err(e) => {
                        self.stash(blobs);
                        return Err(e);
                    }
                }
            }
            match failed {
                None => return Ok(()),
                Some(blob) => {
                    blobs.push(blob);
                    blobs.extend(self.drain());
                }
            }
        }
    }

    /// Insert with transparent resize, the policy a node applies while it
    /// holds the table lock.
    pub fn insert_or_grow(&mut self, heap: &dyn Heap, params: &TuningParams, blob: Blob) -> DhtResult<()> {
        match self.insert(blob) {
            Err(DhtError::NeedResize(blob)) => {
                self.grow(heap, params)?;
                self.insert(blob)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inari_mem::{DefaultHeap, Heap, Mem};
    use inari_net::fabric::{Access, LoopbackFabric};
    use inari_types::hash128;
    use pretty_assertions::assert_eq;

    fn heap() -> DefaultHeap {
        DefaultHeap::new(LoopbackFabric::new(), Access::RemoteRead)
    }

    fn blob(heap: &dyn Heap, key: &str, value: &str) -> Blob {
        let bytes: Vec<u8> = key.bytes().chain(value.bytes()).collect();
        let mut mem: Mem = heap.alloc(bytes.len()).unwrap();
        mem.copy_from(&bytes);
        Blob::new(mem, bytes.len(), key.len())
    }

    fn home(key: &str, entries: usize) -> usize {
        (hash128(key.as_bytes()) % entries as u128) as usize
    }

    /// Generated keys bucketed by home slot for a table of `entries`.
    fn keys_by_home(entries: usize, count: usize) -> Vec<Vec<String>> {
        let mut buckets = vec![Vec::new(); entries];
        for i in 0..count {
            let key = format!("k{i}");
            buckets[home(&key, entries)].push(key);
        }
        buckets
    }

    fn hopscotch(entries: usize, hop_range: u32) -> HopscotchServer {
        let heap = heap();
        let region = TableRegion::new(&heap, entries).unwrap();
        HopscotchServer::new(region, hop_range)
    }

    #[test]
    fn round_trip_insert_lookup() {
        inari_trace::test_run().ok();
        let heap = heap();
        let mut table = hopscotch(16, 8);

        table.insert(blob(&heap, "hello", "world")).unwrap();
        let slot = table.lookup(b"hello").unwrap().expect("present");
        assert_eq!(table.blob_at(slot).unwrap().value(), b"world");
        assert!(table.lookup(b"absent").unwrap().is_none());
        table.check_consistency();
    }

    #[test]
    fn double_insert_is_idempotent() {
        let heap = heap();
        let mut table = hopscotch(16, 8);

        table.insert(blob(&heap, "key", "v1")).unwrap();
        let first = table.lookup(b"key").unwrap();
        table.insert(blob(&heap, "key", "v1")).unwrap();
        assert_eq!(table.lookup(b"key").unwrap(), first);
        assert_eq!(table.used(), 1);
        table.check_consistency();
    }

    #[test]
    fn overwrite_updates_the_value_in_place() {
        let heap = heap();
        let mut table = hopscotch(16, 8);

        table.insert(blob(&heap, "key", "old")).unwrap();
        table.insert(blob(&heap, "key", "newer")).unwrap();
        let slot = table.lookup(b"key").unwrap().expect("present");
        assert_eq!(table.blob_at(slot).unwrap().value(), b"newer");
        assert_eq!(table.used(), 1);
        table.check_consistency();
    }

    #[test]
    fn remove_then_lookup_misses() {
        let heap = heap();
        let mut table = hopscotch(16, 8);

        table.insert(blob(&heap, "key", "value")).unwrap();
        assert!(table.remove(b"key").unwrap());
        assert!(table.lookup(b"key").unwrap().is_none());
        assert!(!table.remove(b"key").unwrap());
        assert_eq!(table.used(), 0);
        table.check_consistency();
    }

    // Three keys sharing a home slot land in adjacent slots and the home's
    // placement word collects one bit per neighbor.
    #[test]
    fn collision_neighborhood_fills_adjacent_slots() {
        let heap = heap();
        let entries = 16;
        let buckets = keys_by_home(entries, 256);
        let (h, keys) = buckets
            .iter()
            .enumerate()
            .find(|(_, b)| b.len() >= 3)
            .expect("some home with three keys");

        let mut table = hopscotch(entries, 8);
        for key in keys.iter().take(3) {
            table.insert(blob(&heap, key, &format!("value-{key}"))).unwrap();
        }

        for (d, key) in keys.iter().take(3).enumerate() {
            let slot = table.lookup(key.as_bytes()).unwrap().expect("present");
            assert_eq!(slot, (h + d) % entries, "key {key}");
            assert_eq!(
                table.blob_at(slot).unwrap().value(),
                format!("value-{key}").as_bytes()
            );
        }
        let hop = table.region().load(h).unwrap().placement;
        assert_eq!(hop, 0b111);
        table.check_consistency();
    }

    // Insert into a clogged neighborhood forces a cascade move that keeps
    // every placement invariant intact.
    #[test]
    fn cascade_relocates_an_eligible_neighbor() {
        let heap = heap();
        let entries = 16;
        let hop_range = 4u32;
        let buckets = keys_by_home(entries, 4096);
        let h = (0..entries)
            .find(|&h| {
                buckets[h].len() >= 4
                    && !buckets[(h + 1) % entries].is_empty()
                    && !buckets[(h + 3) % entries].is_empty()
            })
            .expect("suitable collision pattern");

        let mut table = hopscotch(entries, hop_range);
        // fill h..h+3 with keys homed at h
        for key in buckets[h].iter().take(4) {
            table.insert(blob(&heap, key, "a")).unwrap();
        }
        // a key homed at h+3 is displaced to h+4
        let squatter = &buckets[(h + 3) % entries][0];
        table.insert(blob(&heap, squatter, "b")).unwrap();
        assert_eq!(
            table.lookup(squatter.as_bytes()).unwrap(),
            Some((h + 4) % entries)
        );

        // a key homed at h+1 finds its first free slot at h+5, out of hop
        // range; the squatter must cascade forward to make room
        let trigger = &buckets[(h + 1) % entries][0];
        table.insert(blob(&heap, trigger, "c")).unwrap();

        assert_eq!(
            table.lookup(squatter.as_bytes()).unwrap(),
            Some((h + 5) % entries)
        );
        assert_eq!(
            table.lookup(trigger.as_bytes()).unwrap(),
            Some((h + 4) % entries)
        );
        assert_eq!(table.used(), 6);
        table.check_consistency();
    }

    #[test]
    fn an_unmovable_neighborhood_requests_a_resize() {
        let heap = heap();
        let entries = 16;
        let buckets = keys_by_home(entries, 4096);
        let (_home, keys) = buckets
            .iter()
            .enumerate()
            .find(|(_, b)| b.len() >= 5)
            .expect("five keys sharing a home");

        let mut table = hopscotch(entries, 4);
        for key in keys.iter().take(4) {
            table.insert(blob(&heap, key, "x")).unwrap();
        }
        let overflow = blob(&heap, &keys[4], "x");
        match table.insert(overflow) {
            Err(DhtError::NeedResize(b)) => assert_eq!(b.key(), keys[4].as_bytes()),
            other => panic!("expected NeedResize, got {:?}", other.map(|_| ())),
        }
        assert_eq!(table.used(), 4);
        table.check_consistency();
    }

    #[test]
    fn growth_preserves_every_record() {
        inari_trace::test_run().ok();
        let heap = heap();
        let params = TuningParams {
            initial_table_size: 32,
            ..Default::default()
        };
        let mut table = ServerTable::new(&heap, &params).unwrap();

        let count = 100;
        let mut grew = false;
        for i in 0..count {
            let b = blob(&heap, &format!("key-{i}"), &format!("value-{i}"));
            match table.insert(b) {
                Ok(()) => {}
                Err(DhtError::NeedResize(b)) => {
                    grew = true;
                    table.grow(&heap, &params).unwrap();
                    table.insert(b).unwrap();
                }
                Err(e) => panic!("{e}"),
            }
        }

        assert!(grew, "table of 32 slots must resize for 100 records");
        assert_eq!(table.used(), count);
        for i in 0..count {
            let key = format!("key-{i}");
            let slot = table.lookup(key.as_bytes()).unwrap().unwrap_or_else(|| {
                panic!("{key} lost in resize");
            });
            assert_eq!(
                table.blob_at(slot).unwrap().value(),
                format!("value-{i}").as_bytes()
            );
        }
        table.check_consistency();
    }

    #[test]
    fn cuckoo_round_trip_and_remove() {
        let heap = heap();
        let params = TuningParams {
            table: TableKind::Cuckoo,
            initial_table_size: 32,
            ..Default::default()
        };
        let mut table = ServerTable::new(&heap, &params).unwrap();

        table.insert(blob(&heap, "hello", "world")).unwrap();
        table.insert(blob(&heap, "hello", "again")).unwrap();
        let slot = table.lookup(b"hello").unwrap().expect("present");
        assert_eq!(table.blob_at(slot).unwrap().value(), b"again");
        assert_eq!(table.used(), 1);

        assert!(table.remove(b"hello").unwrap());
        assert!(table.lookup(b"hello").unwrap().is_none());
        assert_eq!(table.used(), 0);
        table.check_consistency();
    }

    #[test]
    fn cuckoo_growth_preserves_every_record() {
        inari_trace::test_run().ok();
        let heap = heap();
        let params = TuningParams {
            table: TableKind::Cuckoo,
            initial_table_size: 8,
            hash_count: 2,
            ..Default::default()
        };
        let mut table = ServerTable::new(&heap, &params).unwrap();

        let count = 60;
        for i in 0..count {
            let mut b = blob(&heap, &format!("key-{i}"), "v");
            loop {
                match table.insert(b) {
                    Ok(()) => break,
                    Err(DhtError::NeedResize(failed)) => {
                        table.grow(&heap, &params).unwrap();
                        b = failed;
                    }
                    Err(e) => panic!("{e}"),
                }
            }
            table.check_consistency();
        }
        assert_eq!(table.used(), count);
        for i in 0..count {
            assert!(
                table.lookup(format!("key-{i}").as_bytes()).unwrap().is_some(),
                "key-{i} lost"
            );
        }
    }

    #[test]
    fn hop_range_at_word_width_fills_to_high_load() {
        let heap = heap();
        let entries = 32;
        let mut table = hopscotch(entries, u32::BITS);
        let mut placed = 0;
        for i in 0..entries {
            match table.insert(blob(&heap, &format!("key-{i}"), "v")) {
                Ok(()) => placed += 1,
                Err(DhtError::NeedResize(_)) => break,
                Err(e) => panic!("{e}"),
            }
        }
        // with the hop range covering the whole placement word the table
        // must either fill completely or fail deterministically
        assert!(placed as f64 / entries as f64 > 0.9, "placed {placed}");
        table.check_consistency();
    }
}
