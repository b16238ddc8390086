use inari_types::TypesError;

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    InvalidFrame(String),

    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    /// The peer closed the connection; outstanding continuations on it
    /// resolve with this.
    #[error("connection lost")]
    ConnectionLost,

    #[error("no region registered under rkey {rkey}")]
    UnknownRegion { rkey: u32 },

    #[error("read of [{addr:#x}, {addr:#x}+{len}) escapes its region")]
    OutOfBounds { addr: u64, len: u32 },

    #[error("region rkey {rkey} is not registered for remote read")]
    AccessDenied { rkey: u32 },

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error(transparent)]
    Types(#[from] TypesError),
}

pub type NetResult<T> = Result<T, NetError>;
