//! The Chord ring.
//!
//! Every node exports one verified cell holding its full routing table:
//! predecessor, itself, and one finger per keyspace bit. Resolution walks
//! exported tables with one-sided reads; only membership changes
//! (predecessor notifications, updates) involve a remote CPU.

use std::sync::Arc;

use parking_lot::Mutex;

use inari_mem::{Heap, Mem};
use inari_net::fabric::volatile;
use inari_net::Request;
use inari_types::{
    cell_bytes, open, seal, KeyId, NodeId, RegionDescriptor, RoutingEntry, TypesError,
    ROUTING_ENTRY_BYTES,
};

use crate::error::{OverlayError, OverlayResult};
use crate::remote::{NodePool, RemoteNode};
use crate::OverlayTable;

pub const PREDECESSOR_INDEX: usize = 0;
pub const SELF_INDEX: usize = 1;
pub const SUCCESSOR_INDEX: usize = 2;
/// predecessor + self + one finger per keyspace bit
pub const CHORD_ENTRIES: usize = 2 + KeyId::BITS as usize;

const CHORD_PAYLOAD_BYTES: usize = CHORD_ENTRIES * ROUTING_ENTRY_BYTES;
pub const CHORD_CELL_BYTES: usize = cell_bytes(CHORD_PAYLOAD_BYTES);

/// Hops a resolution walk may take before it is declared divergent.
const WALK_LIMIT: usize = 64;

/// A decoded copy of some node's routing table, local or remote.
#[derive(Clone, Debug, PartialEq)]
pub struct ChordImage {
    entries: [RoutingEntry; CHORD_ENTRIES],
}

impl ChordImage {
    fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(CHORD_PAYLOAD_BYTES);
        for entry in &self.entries {
            entry.put(&mut payload);
        }
        let mut cell = vec![0u8; CHORD_CELL_BYTES];
        seal(&payload, &mut cell);
        cell
    }

    pub fn decode(cell: &[u8]) -> OverlayResult<Self> {
        if cell.len() != CHORD_CELL_BYTES {
            return Err(OverlayError::Types(TypesError::ShortBuffer {
                need: CHORD_CELL_BYTES,
                have: cell.len(),
            }));
        }
        let mut payload = open(cell)?;
        let buf = &mut payload;
        let mut entries = [RoutingEntry::default(); CHORD_ENTRIES];
        for entry in entries.iter_mut() {
            *entry = RoutingEntry::get(buf)?;
        }
        Ok(Self { entries })
    }

    pub fn predecessor(&self) -> &RoutingEntry {
        &self.entries[PREDECESSOR_INDEX]
    }

    pub fn self_entry(&self) -> &RoutingEntry {
        &self.entries[SELF_INDEX]
    }

    pub fn self_id(&self) -> KeyId {
        self.self_entry().node.id
    }

    pub fn successor(&self) -> &RoutingEntry {
        &self.entries[SUCCESSOR_INDEX]
    }

    pub fn finger(&self, k: usize) -> &RoutingEntry {
        &self.entries[SUCCESSOR_INDEX + k]
    }

    /// The finger with the largest id strictly between us and `id`; the
    /// next hop of a resolution walk. Falls back to ourselves when no
    /// finger helps.
    pub fn preceding_node(&self, id: KeyId) -> NodeId {
        for k in (0..KeyId::BITS as usize).rev() {
            let finger = &self.finger(k).node;
            if !finger.is_vacant() && finger.id.in_exclusive(self.self_id(), id) {
                return *finger;
            }
        }
        self.self_entry().node
    }
}

/// Server side: the exported routing table of the local node.
pub struct ChordTable {
    mem: Mem,
    image: ChordImage,
}

impl ChordTable {
    pub fn new(heap: &dyn Heap, node: NodeId) -> OverlayResult<Self> {
        let mem = heap.alloc(CHORD_CELL_BYTES)?;
        let mut entries = [RoutingEntry::default(); CHORD_ENTRIES];
        entries[PREDECESSOR_INDEX] = RoutingEntry::new(node, node.id);
        entries[SELF_INDEX] = RoutingEntry::new(node, node.id);
        for k in 0..KeyId::BITS {
            entries[SUCCESSOR_INDEX + k as usize] =
                RoutingEntry::new(node, node.id.finger_start(k));
        }
        let mut table = Self {
            mem,
            image: ChordImage { entries },
        };
        table.publish();
        Ok(table)
    }

    fn publish(&mut self) {
        let cell = self.image.encode();
        // Safety: the allocation was sized for exactly this cell.
        unsafe { volatile::copy_to(self.mem.as_ptr() as *mut u8, &cell) };
    }

    pub fn descriptor(&self) -> RegionDescriptor {
        RegionDescriptor::new(self.mem.addr(), CHORD_CELL_BYTES as u32, self.mem.rkey())
    }

    pub fn image(&self) -> &ChordImage {
        &self.image
    }

    pub fn self_node(&self) -> NodeId {
        self.image.self_entry().node
    }

    pub fn set_predecessor(&mut self, node: NodeId) {
        self.image.entries[PREDECESSOR_INDEX].node = node;
        self.publish();
    }

    pub fn set_successor(&mut self, node: NodeId) {
        self.image.entries[SUCCESSOR_INDEX].node = node;
        self.publish();
    }

    pub fn set_finger(&mut self, k: usize, node: NodeId) {
        self.image.entries[SUCCESSOR_INDEX + k].node = node;
        self.publish();
    }

    pub fn update(&mut self, index: usize, node: NodeId) -> OverlayResult<()> {
        if index >= CHORD_ENTRIES {
            return Err(OverlayError::Protocol(format!(
                "update of entry {index} in a chord table"
            )));
        }
        self.image.entries[index].node = node;
        self.publish();
        Ok(())
    }

    /// A predecessor candidate announced itself (the overlay.predecessor
    /// message). Accept it if it falls in `(current predecessor, self)`.
    pub fn notify_predecessor(&mut self, candidate: NodeId) -> bool {
        let pred = self.image.predecessor().node;
        let me = self.image.self_id();
        let accept = pred.is_vacant()
            || pred.addr() == self.self_node().addr()
            || candidate.id.in_exclusive(pred.id, me);
        if accept {
            self.set_predecessor(candidate);
        }
        accept
    }

    /// The write-ownership interval `(predecessor, self]`.
    pub fn owns(&self, id: KeyId) -> bool {
        let pred = self.image.predecessor().node;
        if pred.is_vacant() || pred.addr() == self.self_node().addr() {
            return true;
        }
        id.in_exclusive_inclusive(pred.id, self.image.self_id())
    }
}

/// Client-side resolution over the ring: walks exported tables until the
/// queried id falls in `(table.self, table.successor]`.
pub struct ChordResolver {
    pool: NodePool,
}

impl ChordResolver {
    pub fn new(pool: NodePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    pub async fn table_of(&self, node: &RemoteNode) -> OverlayResult<ChordImage> {
        ChordImage::decode(&node.read_routing_cell().await?)
    }

    /// Walk the ring from `from`'s table until the table owning `id` is
    /// found.
    pub async fn find_table(&self, from: &Arc<RemoteNode>, id: KeyId) -> OverlayResult<ChordImage> {
        let mut table = self.table_of(from).await?;
        for _ in 0..WALK_LIMIT {
            if id.in_exclusive_inclusive(table.self_id(), table.successor().node.id) {
                return Ok(table);
            }
            let hop = table.preceding_node(id);
            if hop.addr() == table.self_entry().node.addr() {
                // no finger makes progress; our successor is the answer
                return Ok(table);
            }
            let node = self.pool.node(hop.host(), hop.port()).await?;
            table = self.table_of(&node).await?;
        }
        Err(OverlayError::WalkDiverged)
    }

    /// `successor(id)` resolved by walking from `from`.
    pub async fn successor_via(
        &self,
        from: &Arc<RemoteNode>,
        id: KeyId,
    ) -> OverlayResult<RoutingEntry> {
        Ok(*self.find_table(from, id).await?.successor())
    }

    /// `predecessor(id)` resolved by walking from `from`.
    pub async fn predecessor_via(
        &self,
        from: &Arc<RemoteNode>,
        id: KeyId,
    ) -> OverlayResult<RoutingEntry> {
        Ok(*self.find_table(from, id).await?.self_entry())
    }
}

fn with_chord<T>(
    overlay: &Mutex<OverlayTable>,
    f: impl FnOnce(&mut ChordTable) -> T,
) -> OverlayResult<T> {
    match &mut *overlay.lock() {
        OverlayTable::Chord(table) => Ok(f(table)),
        OverlayTable::Fixed(_) => Err(OverlayError::Protocol(
            "chord maintenance on a fixed overlay".into(),
        )),
    }
}

/// Join the ring through any live member.
///
/// Finds our successor, adopts its predecessor, announces ourselves, and
/// runs the finger-initialization pass. Periodic stabilization repairs the
/// rest of the ring.
pub async fn join(
    overlay: &Mutex<OverlayTable>,
    resolver: &ChordResolver,
    me: NodeId,
    seed_host: &str,
    seed_port: &str,
) -> OverlayResult<()> {
    let seed = resolver.pool().node(seed_host, seed_port).await?;
    let succ = resolver.successor_via(&seed, me.id).await?;

    let succ_node = resolver.pool().node(succ.node.host(), succ.node.port()).await?;
    let succ_table = resolver.table_of(&succ_node).await?;
    let pred = succ_table.predecessor().node;

    with_chord(overlay, |table| {
        table.set_successor(succ.node);
        if !pred.is_vacant() {
            table.set_predecessor(pred);
        }
    })?;

    // write ourselves into our successor's predecessor slot
    succ_node
        .conn()
        .request_ack(&Request::Predecessor { node: me })
        .await?;

    // finger initialization: reuse the previous finger when its interval
    // already covers this start, otherwise resolve through the seed
    for k in 1..KeyId::BITS as usize {
        let (start, prev) = with_chord(overlay, |table| {
            let image = table.image();
            (image.finger(k).start, image.finger(k - 1).node)
        })?;
        if start.in_interval(me.id, prev.id.wrapping_sub(KeyId(1))) {
            with_chord(overlay, |table| table.set_finger(k, prev))?;
        } else {
            let entry = resolver.successor_via(&seed, start).await?;
            // a successor computed before the ring learned about us may
            // skip over our own id; keep ourselves in that case
            if !me.id.in_interval(start, entry.node.id) {
                with_chord(overlay, |table| table.set_finger(k, entry.node))?;
            }
        }
    }

    tracing::info!(id = %me.id, via = %format!("{seed_host}:{seed_port}"), "joined ring");
    Ok(())
}

/// One stabilization round: adopt a better successor if our current
/// successor learned of one, then tell the successor about us.
pub async fn stabilize(
    overlay: &Mutex<OverlayTable>,
    resolver: &ChordResolver,
    me: NodeId,
) -> OverlayResult<()> {
    let succ = with_chord(overlay, |table| table.image().successor().node)?;

    let candidate = if succ.addr() == me.addr() {
        with_chord(overlay, |table| table.image().predecessor().node)?
    } else {
        let node = resolver.pool().node(succ.host(), succ.port()).await?;
        resolver.table_of(&node).await?.predecessor().node
    };

    with_chord(overlay, |table| {
        if !candidate.is_vacant()
            && candidate.addr() != me.addr()
            && candidate.id.in_exclusive(me.id, succ.id)
        {
            table.set_successor(candidate);
        }
    })?;

    let succ = with_chord(overlay, |table| table.image().successor().node)?;
    if succ.addr() != me.addr() {
        let node = resolver.pool().node(succ.host(), succ.port()).await?;
        node.conn()
            .request_ack(&Request::Predecessor { node: me })
            .await?;
    }
    Ok(())
}

/// One fix-fingers round: recompute every finger as `successor(start)`.
pub async fn fix_fingers(
    overlay: &Mutex<OverlayTable>,
    resolver: &ChordResolver,
    me: NodeId,
) -> OverlayResult<()> {
    for k in 0..KeyId::BITS as usize {
        let start = with_chord(overlay, |table| table.image().finger(k).start)?;
        let entry = successor(overlay, resolver, me, start).await?;
        with_chord(overlay, |table| table.set_finger(k, entry.node))?;
    }
    Ok(())
}

/// `successor(id)` as seen from this node: answered locally when `id`
/// falls in `(self, successor]`, otherwise resolved by walking the ring
/// from our best preceding finger.
pub async fn successor(
    overlay: &Mutex<OverlayTable>,
    resolver: &ChordResolver,
    me: NodeId,
    id: KeyId,
) -> OverlayResult<RoutingEntry> {
    let image = with_chord(overlay, |table| table.image().clone())?;
    if id.in_exclusive_inclusive(image.self_id(), image.successor().node.id) {
        return Ok(*image.successor());
    }
    let hop = image.preceding_node(id);
    if hop.addr() == me.addr() {
        return Ok(*image.successor());
    }
    let node = resolver.pool().node(hop.host(), hop.port()).await?;
    resolver.find_table(&node, id).await.map(|t| *t.successor())
}

#[cfg(test)]
mod tests {
    use super::*;
    use inari_mem::DefaultHeap;
    use inari_net::fabric::{read_verified, Access, LoopbackFabric};
    use inari_net::DynFabric;
    use pretty_assertions::assert_eq;

    fn chord(id: u16) -> (DynFabric, ChordTable) {
        let fabric = LoopbackFabric::new();
        let heap = DefaultHeap::new(fabric.clone(), Access::RemoteRead);
        let node = NodeId::new(KeyId(id), "127.0.0.1", "7000");
        (fabric.clone(), ChordTable::new(&heap, node).unwrap())
    }

    #[test]
    fn a_fresh_table_points_everywhere_at_itself() {
        let (_fabric, table) = chord(100);
        let image = table.image();
        assert_eq!(image.predecessor().node.id, KeyId(100));
        assert_eq!(image.successor().node.id, KeyId(100));
        for k in 0..KeyId::BITS as usize {
            assert_eq!(image.finger(k).node.id, KeyId(100));
            assert_eq!(image.finger(k).start, KeyId(100).finger_start(k as u32));
        }
    }

    #[tokio::test]
    async fn the_exported_cell_decodes_to_the_image() {
        let (fabric, mut table) = chord(7);
        table.set_successor(NodeId::new(KeyId(9), "10.0.0.9", "7009"));

        let cell = read_verified(fabric.as_ref(), table.descriptor())
            .await
            .unwrap();
        let image = ChordImage::decode(&cell).unwrap();
        assert_eq!(&image, table.image());
        assert_eq!(image.successor().node.id, KeyId(9));
    }

    #[test]
    fn preceding_node_picks_the_highest_useful_finger() {
        let (_fabric, mut table) = chord(0);
        table.set_finger(4, NodeId::new(KeyId(16), "10.0.0.2", "7001"));
        table.set_finger(8, NodeId::new(KeyId(256), "10.0.0.3", "7002"));

        assert_eq!(table.image().preceding_node(KeyId(300)).id, KeyId(256));
        assert_eq!(table.image().preceding_node(KeyId(200)).id, KeyId(16));
        // nothing strictly between us and 10
        assert_eq!(table.image().preceding_node(KeyId(10)).id, KeyId(0));
    }

    #[test]
    fn notify_adopts_closer_predecessors_only() {
        let (_fabric, mut table) = chord(100);
        // first candidate always accepted (predecessor is still ourselves)
        assert!(table.notify_predecessor(NodeId::new(KeyId(40), "10.0.0.2", "7001")));
        // closer candidate accepted
        assert!(table.notify_predecessor(NodeId::new(KeyId(90), "10.0.0.3", "7002")));
        // farther candidate rejected
        assert!(!table.notify_predecessor(NodeId::new(KeyId(10), "10.0.0.4", "7003")));
        assert_eq!(table.image().predecessor().node.id, KeyId(90));
    }

    #[test]
    fn ownership_is_the_predecessor_exclusive_interval() {
        let (_fabric, mut table) = chord(100);
        assert!(table.owns(KeyId(5000)), "single node owns everything");

        table.set_predecessor(NodeId::new(KeyId(40), "10.0.0.2", "7001"));
        assert!(table.owns(KeyId(100)));
        assert!(table.owns(KeyId(41)));
        assert!(!table.owns(KeyId(40)));
        assert!(!table.owns(KeyId(101)));
    }
}
