use inari_types::hash128;

use crate::blob::Blob;
use crate::error::{DhtError, DhtResult};
use crate::region::TableRegion;

/// Concurrent open-addressed table that keeps every key within `hop_range`
/// slots of its home. The placement word of a home slot is the bitmap of
/// neighborhood slots holding keys homed there, which is all a remote
/// reader needs to enumerate candidates.
pub struct HopscotchServer {
    region: TableRegion,
    shadow: Vec<Option<Blob>>,
    pending: Vec<Blob>,
    hop_range: u32,
    used: usize,
}

impl HopscotchServer {
    pub fn new(region: TableRegion, hop_range: u32) -> Self {
        assert!(
            hop_range <= u32::BITS,
            "hop range must fit the placement word"
        );
        let entries = region.entries();
        assert!(entries >= hop_range as usize);
        Self {
            region,
            shadow: (0..entries).map(|_| None).collect(),
            pending: Vec::new(),
            hop_range,
            used: 0,
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

    fn home_of(&self, key: &[u8]) -> usize {
        (hash128(key) % self.entries() as u128) as usize
    }

    fn distance(&self, from: usize, to: usize) -> usize {
        (to + self.entries() - from) % self.entries()
    }

    /// First empty slot at or after `from`, scanning the whole table.
    fn next_free_index(&self, from: usize) -> Option<usize> {
        let n = self.entries();
        (0..n)
            .map(|step| (from + step) % n)
            .find(|&i| self.shadow[i].is_none())
    }

    /// Within the window ending at the free slot `to`, find an occupant
    /// that may legally move into `to` (its home's hop range must still
    /// cover `to`). Returns the nearest such occupant's slot.
    fn next_movable(&self, to: usize) -> DhtResult<Option<usize>> {
        let n = self.entries();
        let window = self.hop_range as usize - 1;
        let start = (to + n - window) % n;
        let mut i = start;
        while i != to {
            let distance = self.distance(i, to);
            let hop = self.region.load(i)?.placement;
            for d in 0..self.hop_range as usize {
                if hop & (1 << d) != 0 && d < distance {
                    return Ok(Some((i + d) % n));
                }
            }
            i = (i + 1) % n;
        }
        Ok(None)
    }

    /// Write `blob` into `to`, homed at `home`. The cell at `to` keeps its
    /// own placement word; only `home`'s bitmap changes.
    fn place(&mut self, blob: Blob, to: usize, home: usize) -> DhtResult<()> {
        let distance = self.distance(home, to);
        debug_assert!(distance < self.hop_range as usize);
        let placement = self.region.load(to)?.placement;
        self.region.publish(to, &blob.entry(placement));
        self.region.update(home, |e| e.set_hop(distance as u32))?;
        self.shadow[to] = Some(blob);
        Ok(())
    }

    /// Relocate the occupant of `from` into the empty slot `to`, vacating
    /// `from`. Ownership of the allocation moves with it.
    fn relocate(&mut self, from: usize, to: usize) -> DhtResult<()> {
        let blob = self.shadow[from].take().expect("relocation source occupied");
        let home = self.home_of(blob.key());
        let old_distance = self.distance(home, from);
        self.place(blob, to, home)?;
        self.region.update(home, |e| e.clear_hop(old_distance as u32))?;
        self.region.update(from, |e| e.clear())?;
        Ok(())
    }

    /// Move some eligible occupant into the free slot `to`; the vacated
    /// slot becomes the new free slot, closer to the inserting key's home.
    fn move_into(&mut self, to: usize) -> DhtResult<Option<usize>> {
        match self.next_movable(to)? {
            Some(movable) => {
                self.relocate(movable, to)?;
                Ok(Some(movable))
            }
            None => Ok(None),
        }
    }

    pub fn insert(&mut self, blob: Blob) -> DhtResult<()> {
        let home = self.home_of(blob.key());

        // overwrite in place on duplicate key
        if let Some(slot) = self.lookup(blob.key())? {
            self.place(blob, slot, home)?;
            return Ok(());
        }

        let Some(mut free) = self.next_free_index(home) else {
            return Err(DhtError::NeedResize(blob));
        };
        loop {
            if self.distance(home, free) < self.hop_range as usize {
                self.place(blob, free, home)?;
                self.used += 1;
                return Ok(());
            }
            match self.move_into(free)? {
                Some(closer) => free = closer,
                None => return Err(DhtError::NeedResize(blob)),
            }
        }
    }

    pub fn lookup(&self, key: &[u8]) -> DhtResult<Option<usize>> {
        let home = self.home_of(key);
        let hop = self.region.load(home)?.placement;
        for d in 0..self.hop_range as usize {
            if hop & (1 << d) == 0 {
                continue;
            }
            let slot = (home + d) % self.entries();
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
        let home = self.home_of(key);
        let distance = self.distance(home, slot) as u32;
        self.region.update(home, |e| e.clear_hop(distance))?;
        self.region.update(slot, |e| e.clear())?;
        self.shadow[slot] = None;
        self.used -= 1;
        Ok(true)
    }

    /// Take every stored blob out of the table, leaving it empty. Used by
    /// resize to rehome contents into a fresh region.
    pub fn drain(&mut self) -> Vec<Blob> {
        let mut blobs: Vec<Blob> = self.shadow.iter_mut().filter_map(Option::take).collect();
        blobs.append(&mut self.pending);
        self.used = 0;
        blobs
    }

    /// Park blobs that could not be placed; they are picked up by the next
    /// [`drain`].
    ///
    /// [`drain`]: HopscotchServer::drain
    pub fn stash(&mut self, blobs: Vec<Blob>) {
        self.pending.extend(blobs);
    }

    /// Swap in a fresh (empty) region. Contents must have been drained.
    pub fn install(&mut self, region: TableRegion) {
        debug_assert!(self.shadow.iter().all(Option::is_none));
        self.shadow = (0..region.entries()).map(|_| None).collect();
        self.region = region;
        self.used = 0;
    }

    /// Verify every table invariant against the shadow state. Panics on
    /// violation; meant for tests and debug paths.
    pub fn check_consistency(&self) {
        let n = self.entries();
        for slot in 0..n {
            let entry = self.region.load(slot).expect("cell validates");
            match &self.shadow[slot] {
                Some(blob) => {
                    assert_eq!(entry.ptr.addr, blob.addr(), "slot {slot} ptr");
                    assert_eq!(entry.ptr.len as usize, blob.len(), "slot {slot} len");
                    assert_eq!(entry.key_len as usize, blob.key_len(), "slot {slot} key_len");
                    assert_eq!(entry.rkey, blob.rkey(), "slot {slot} rkey");

                    let home = self.home_of(blob.key());
                    let distance = self.distance(home, slot);
                    assert!(
                        distance < self.hop_range as usize,
                        "slot {slot} displaced {distance} beyond the hop range"
                    );
                    let hop = self.region.load(home).expect("home validates").placement;
                    assert!(
                        hop & (1 << distance) != 0,
                        "home {home} missing hop bit {distance} for slot {slot}"
                    );
                }
                None => assert!(entry.is_empty(), "slot {slot} cell not empty"),
            }
        }
        for home in 0..n {
            let hop = self.region.load(home).expect("cell validates").placement;
            for d in 0..self.hop_range as usize {
                if hop & (1 << d) != 0 {
                    let slot = (home + d) % n;
                    let blob = self.shadow[slot]
                        .as_ref()
                        .unwrap_or_else(|| panic!("hop bit {d} of {home} points at empty {slot}"));
                    assert_eq!(self.home_of(blob.key()), home, "slot {slot} homed elsewhere");
                }
            }
        }
        assert_eq!(
            self.used,
            self.shadow.iter().filter(|s| s.is_some()).count(),
            "used count drifted"
        );
    }

    /// Trace-level dump of occupied slots.
    pub fn dump(&self) {
        for slot in 0..self.entries() {
            if let Some(blob) = &self.shadow[slot] {
                let entry = self.region.load(slot).ok();
                tracing::debug!(
                    slot,
                    hop = entry.map(|e| e.placement).unwrap_or_default(),
                    key = %String::from_utf8_lossy(blob.key()),
                    len = blob.len(),
                    "occupied"
                );
            }
        }
    }
}
