//! The network-facing boundary of inari.
//!
//! Two halves live here. [`fabric`] is the seam to the remote-memory
//! transport: registration of local memory for one-sided remote reads, and
//! the read verb itself. The in-tree [`fabric::LoopbackFabric`] serves both
//! halves of a single-process cluster and every test; a verbs-backed fabric
//! plugs in behind the same trait. [`wire`] is the framed request/response
//! protocol spoken over an ordinary reliable connection for everything that
//! does involve the server CPU: puts, deletes and overlay maintenance.

pub mod conn;
mod error;
pub mod fabric;
pub mod wire;

pub use conn::Connection;
pub use error::{NetError, NetResult};
pub use fabric::{Access, DynFabric, LoopbackFabric, MemoryFabric};
pub use wire::{Request, Response};
