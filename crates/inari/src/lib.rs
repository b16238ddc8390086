//! inari: a distributed in-memory key/value store whose read path is
//! one-sided remote memory access. Servers export their hash table as
//! verified cells; clients resolve the owning node through an overlay and
//! read table entries and blobs directly, retrying anything observed torn.
//!
//! [`Node`] is the server: it owns one table, serves put/del and overlay
//! messages, and resizes transparently. [`Client`] is the caller-facing
//! API: `put`/`remove` send messages, `get`/`contains` never touch a
//! remote CPU.

mod client;
mod error;
mod node;

pub use client::Client;
pub use error::{ClientError, ClientResult, NodeError, NodeResult};
pub use node::Node;

pub use inari_net::fabric::{DynFabric, LoopbackFabric};
pub use inari_types::{OverlayKind, TableKind, TuningParams};

/// Process initialization: install tracing and bring up the memory
/// fabric. Explicitly called from `main`; nothing happens in static
/// constructors.
pub fn init() -> DynFabric {
    inari_trace::init().ok();
    LoopbackFabric::new()
}
