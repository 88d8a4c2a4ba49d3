use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block/page {0} is out of range")]
    OutOfRange(u64),

    #[error("buffer pool exhausted: every frame is pinned")]
    BufferFull,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corrupt on-disk structure: {0}")]
    Corruption(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;
