use inari_dht::DhtError;
use inari_mem::MemError;
use inari_net::NetError;
use inari_overlay::OverlayError;
use inari_types::TypesError;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Mem(#[from] MemError),

    #[error(transparent)]
    Dht(#[from] DhtError),

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    /// A write arrived for a key this node does not own; the client must
    /// re-resolve.
    #[error("not responsible for key id {0}")]
    NotResponsible(inari_types::KeyId),

    #[error("join failed: {0}")]
    JoinFailed(String),
}

pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Mem(#[from] MemError),

    #[error(transparent)]
    Overlay(#[from] OverlayError),

    #[error(transparent)]
    Types(#[from] TypesError),

    #[error("unexpected response: {0}")]
    Protocol(String),
}

pub type ClientResult<T> = Result<T, ClientError>;
