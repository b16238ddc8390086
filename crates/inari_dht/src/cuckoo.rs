use rand::Rng;

use inari_types::{hash64_seeded, EntryImage};

use crate::blob::Blob;
use crate::error::{DhtError, DhtResult};
use crate::region::TableRegion;

/// Displacements attempted before a failed insert forces a rehash.
const MAX_DISPLACEMENTS: usize = 32;
/// Nested rehash attempts before giving up with `NeedResize`.
const MAX_REHASH_DEPTH: usize = 3;

/// d-ary cuckoo table: every key has `d` candidate slots, one per hash
/// seed, and lives in exactly one of them. The placement word of an
/// occupied cell records which seed put it there.
pub struct CuckooServer {
    region: TableRegion,
    shadow: Vec<Option<Blob>>,
    pending: Vec<Blob>,
    seeds: Vec<u64>,
    used: usize,
    rehashing: bool,
}

impl CuckooServer {
    pub fn new(region: TableRegion, hash_count: usize) -> Self {
        assert!(hash_count >= 2, "cuckoo hashing needs at least two seeds");
        let entries = region.entries();
        let mut rng = rand::thread_rng();
        Self {
            region,
            shadow: (0..entries).map(|_| None).collect(),
            pending: Vec::new(),
            seeds: (0..hash_count).map(|_| rng.gen()).collect(),
            used: 0,
            rehashing: false,
        }
    }

    pub fn entries(&self) -> usize {
        self.region.entries()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn load_factor(&self) -> f64 {
        self.used as f64 / self.entries() as f64
    }

    pub fn region(&self) -> &TableRegion {
        &self.region
    }

    pub fn blob_at(&self, slot: usize) -> Option<&Blob> {
        self.shadow.get(slot).and_then(Option::as_ref)
    }

    fn index(&self, key: &[u8], seed: u64) -> usize {
        (hash64_seeded(key, seed) % self.entries() as u64) as usize
    }

    fn place(&mut self, blob: Blob, slot: usize, seed_idx: usize) {
        self.region.publish(slot, &blob.entry(seed_idx as u32));
        self.shadow[slot] = Some(blob);
    }

    /// Swap `blob` into `slot`, returning the previous occupant together
    /// with the seed index it had been placed under.
    fn swap(&mut self, blob: Blob, slot: usize, seed_idx: usize) -> DhtResult<Option<(Blob, usize)>> {
        let old_seed = self.region.load(slot)?.placement as usize;
        let old = self.shadow[slot].take();
        self.place(blob, slot, seed_idx);
        Ok(old.map(|b| (b, old_seed)))
    }

    fn count_insert(&mut self) {
        // a rehash only moves existing keys
        if !self.rehashing {
            self.used += 1;
        }
    }

    pub fn insert(&mut self, blob: Blob) -> DhtResult<()> {
        self.insert_at_depth(blob, 0)
    }

    fn insert_at_depth(&mut self, blob: Blob, depth: usize) -> DhtResult<()> {
        // place into the first empty candidate, or overwrite a duplicate
        for seed_idx in 0..self.seeds.len() {
            let slot = self.index(blob.key(), self.seeds[seed_idx]);
            let fresh = match &self.shadow[slot] {
                None => true,
                Some(occupant) if occupant.has_key(blob.key()) => false,
                Some(_) => continue,
            };
            self.place(blob, slot, seed_idx);
            if fresh {
                self.count_insert();
            }
            return Ok(());
        }

        // all candidates taken: displace along a bounded chain
        let mut current = blob;
        let mut seed_idx = 0;
        for _ in 0..MAX_DISPLACEMENTS {
            let slot = self.index(current.key(), self.seeds[seed_idx]);
            match self.swap(current, slot, seed_idx)? {
                None => {
                    self.count_insert();
                    return Ok(());
                }
                Some((displaced, displaced_seed)) => {
                    current = displaced;
                    seed_idx = (displaced_seed + 1) % self.seeds.len();
                }
            }
        }

        if depth >= MAX_REHASH_DEPTH {
            return Err(DhtError::NeedResize(current));
        }
        tracing::debug!(depth, used = self.used, "displacement chain exhausted, rehashing");
        if let Err(e) = self.rehash(depth + 1) {
            // keep the record reachable for the resize that follows
            self.pending.push(current);
            return Err(e);
        }
        self.insert_at_depth(current, depth + 1)
    }

    /// Draw fresh seeds and move every occupant through a new insert pass.
    /// `used` is unchanged by construction: only existing keys move.
    fn rehash(&mut self, depth: usize) -> DhtResult<()> {
        let mut rng = rand::thread_rng();
        for seed in self.seeds.iter_mut() {
            *seed = rng.gen();
        }

        let was_rehashing = self.rehashing;
        self.rehashing = true;
        let mut blobs: Vec<Blob> = self.shadow.iter_mut().filter_map(Option::take).collect();
        // the region is reused: every cell must read as empty before the
        // re-insert pass republishes the occupied ones
        let empty = EntryImage::default();
        for slot in 0..self.entries() {
            self.region.publish(slot, &empty);
        }
        let result = loop {
            let Some(blob) = blobs.pop() else {
                break Ok(());
            };
            match self.insert_at_depth(blob, depth) {
                Ok(()) => {}
                Err(DhtError::NeedResize(failed)) => {
                    // park everything unplaced so no record is lost
                    self.pending.extend(blobs);
                    break Err(DhtError::NeedResize(failed));
                }
                Err(e) => break Err(e),
            }
        };
        self.rehashing = was_rehashing;
        result
    }

    pub fn lookup(&self, key: &[u8]) -> DhtResult<Option<usize>> {
        for &seed in &self.seeds {
            let slot = self.index(key, seed);
            if let Some(blob) = &self.shadow[slot] {
                if blob.has_key(key) {
                    return Ok(Some(slot));
                }
            }
        }
        Ok(None)
    }

    pub fn remove(&mut self, key: &[u8]) -> DhtResult<bool> {
        let Some(slot) = self.lookup(key)? else {
            return Ok(false);
        };
        self.region.update(slot, |e| {
            e.clear();
            e.placement = 0;
        })?;
        self.shadow[slot] = None;
        self.used -= 1;
        Ok(true)
    }

    pub fn drain(&mut self) -> Vec<Blob> {
        let mut blobs: Vec<Blob> = self.shadow.iter_mut().filter_map(Option::take).collect();
        blobs.append(&mut self.pending);
        self.used = 0;
        blobs
    }

    pub fn stash(&mut self, blobs: Vec<Blob>) {
        self.pending.extend(blobs);
    }

    /// Swap in a fresh region; seeds are kept, contents must have been
    /// drained.
    pub fn install(&mut self, region: TableRegion) {
        debug_assert!(self.shadow.iter().all(Option::is_none));
        self.shadow = (0..region.entries()).map(|_| None).collect();
        self.region = region;
        self.used = 0;
    }

    pub fn check_consistency(&self) {
        for slot in 0..self.entries() {
            let entry = self.region.load(slot).expect("cell validates");
            match &self.shadow[slot] {
                Some(blob) => {
                    assert_eq!(entry.ptr.addr, blob.addr(), "slot {slot} ptr");
                    assert_eq!(entry.ptr.len as usize, blob.len(), "slot {slot} len");
                    assert_eq!(entry.key_len as usize, blob.key_len(), "slot {slot} key_len");
                    assert_eq!(entry.rkey, blob.rkey(), "slot {slot} rkey");

                    let seed_idx = entry.placement as usize;
                    assert!(seed_idx < self.seeds.len(), "slot {slot} seed index");
                    assert_eq!(
                        self.index(blob.key(), self.seeds[seed_idx]),
                        slot,
                        "slot {slot} not a candidate under its recorded seed"
                    );
                }
                None => assert!(entry.is_empty(), "slot {slot} cell not empty"),
            }
        }
        assert_eq!(
            self.used,
            self.shadow.iter().filter(|s| s.is_some()).count(),
            "used count drifted"
        );
    }

    pub fn dump(&self) {
        for slot in 0..self.entries() {
            if let Some(blob) = &self.shadow[slot] {
                tracing::debug!(
                    slot,
                    key = %String::from_utf8_lossy(blob.key()),
                    len = blob.len(),
                    "occupied"
                );
            }
        }
    }
}
