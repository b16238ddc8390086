use crate::blob::Blob;
use inari_mem::MemError;

#[derive(Debug, thiserror::Error)]
pub enum DhtError {
    /// Insertion exhausted every placement option. The blob is handed
    /// back so the caller can resize and retry.
    #[error("insertion exhausted all placement options; the table needs to grow")]
    NeedResize(Blob),

    #[error(transparent)]
    Mem(#[from] MemError),

    #[error(transparent)]
    Types(#[from] inari_types::TypesError),
}

pub type DhtResult<T> = Result<T, DhtError>;
