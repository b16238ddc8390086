#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    /// The observed cell hash did not match the observed payload. For a
    /// remote reader this is a torn read and the cell should be re-read.
    #[error("torn read: cell hash does not cover payload")]
    TornRead,

    #[error("short buffer: need {need} bytes, have {have}")]
    ShortBuffer { need: usize, have: usize },

    #[error("field out of range: {0}")]
    OutOfRange(&'static str),
}

pub type TypesResult<T> = Result<T, TypesError>;
