use inari_types::KeyId;

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error(transparent)]
    Net(#[from] inari_net::NetError),

    #[error(transparent)]
    Mem(#[from] inari_mem::MemError),

    #[error(transparent)]
    Types(#[from] inari_types::TypesError),

    /// No reachable node owns the id; for the fixed overlay this means the
    /// partition is still vacant.
    #[error("no route to the owner of {0}")]
    Unroutable(KeyId),

    /// A join hit a fixed table with no vacant partition.
    #[error("the network is full: every partition is taken")]
    NetworkFull,

    #[error("routing walk did not converge")]
    WalkDiverged,

    #[error("unexpected response: {0}")]
    Protocol(String),
}

pub type OverlayResult<T> = Result<T, OverlayError>;
