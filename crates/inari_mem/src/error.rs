use inari_net::NetError;

#[derive(Debug, thiserror::Error)]
pub enum MemError {
    #[error("allocation of {len} bytes failed")]
    AllocationFailed { len: usize },

    /// Pinning or fabric registration failed; fatal for the requesting
    /// operation.
    #[error("fabric registration failed: {0}")]
    Fabric(#[from] NetError),
}

pub type MemResult<T> = Result<T, MemError>;
