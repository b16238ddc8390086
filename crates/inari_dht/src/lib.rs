//! The server-side tables behind inari's one-sided read path.
//!
//! A table is two parallel structures: the remote-visible region of
//! verified entry cells, and the owner-local shadow table holding the
//! allocations the cells point at. Writers keep every cell
//! self-validating at every step, so remote readers need no coordination;
//! they re-read anything that fails validation.
//!
//! Two placement algorithms are provided behind [`ServerTable`]: a
//! hopscotch variant that keeps every key within a bounded neighborhood of
//! its home slot, and a d-ary cuckoo variant with a bounded eviction chain
//! and full rehash on failure.

mod blob;
mod cuckoo;
mod error;
mod hopscotch;
mod region;
mod table;

pub use blob::Blob;
pub use cuckoo::CuckooServer;
pub use error::{DhtError, DhtResult};
pub use hopscotch::HopscotchServer;
pub use region::TableRegion;
pub use table::ServerTable;
