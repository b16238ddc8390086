//! Overlay routing: which node owns a key.
//!
//! Two flavors behind one surface. [`fixed`] partitions the keyspace into
//! equal intervals at construction; joining nodes claim vacant partitions
//! and every member is told about the change. [`chord`] is a Chord ring:
//! every node exports a verified cell holding its predecessor, itself and
//! `log2(keyspace)` fingers, and resolution walks rings of exported tables
//! with one-sided reads, never touching a remote CPU.
//!
//! Server-side tables own the exported memory; client-side resolvers hold
//! non-owning handles to remote nodes, cached by dial address.

pub mod chord;
mod error;
pub mod fixed;
mod remote;

pub use chord::{ChordImage, ChordResolver, ChordTable, CHORD_ENTRIES};
pub use error::{OverlayError, OverlayResult};
pub use fixed::{FixedNetwork, FixedTable};
pub use remote::{NodePool, RemoteNode};

use inari_types::{KeyId, NodeId, OverlayKind, RegionDescriptor};

/// The overlay table a node exports, fixed or Chord.
pub enum OverlayTable {
    Fixed(FixedTable),
    Chord(ChordTable),
}

impl OverlayTable {
    pub fn kind(&self) -> OverlayKind {
        match self {
            OverlayTable::Fixed(_) => OverlayKind::Fixed,
            OverlayTable::Chord(_) => OverlayKind::Chord,
        }
    }

    pub fn descriptor(&self) -> RegionDescriptor {
        match self {
            OverlayTable::Fixed(t) => t.descriptor(),
            OverlayTable::Chord(t) => t.descriptor(),
        }
    }

    /// Rewrite routing entry `index` (the overlay.update message).
    pub fn update(&mut self, index: usize, node: NodeId) -> OverlayResult<()> {
        match self {
            OverlayTable::Fixed(t) => t.update(index, node),
            OverlayTable::Chord(t) => t.update(index, node),
        }
    }

    /// Does this node answer writes for `id`? `self_id` is the node's own
    /// ring identity.
    pub fn owns(&self, self_id: KeyId, id: KeyId) -> bool {
        match self {
            OverlayTable::Fixed(t) => {
                let (start, end) = t.range_of(self_id);
                id.in_interval(start, end)
            }
            OverlayTable::Chord(t) => t.owns(id),
        }
    }

    pub fn as_chord(&self) -> Option<&ChordTable> {
        match self {
            OverlayTable::Chord(t) => Some(t),
            OverlayTable::Fixed(_) => None,
        }
    }

    pub fn as_fixed_mut(&mut self) -> Option<&mut FixedTable> {
        match self {
            OverlayTable::Fixed(t) => Some(t),
            OverlayTable::Chord(_) => None,
        }
    }

    pub fn as_chord_mut(&mut self) -> Option<&mut ChordTable> {
        match self {
            OverlayTable::Chord(t) => Some(t),
            OverlayTable::Fixed(_) => None,
        }
    }
}
