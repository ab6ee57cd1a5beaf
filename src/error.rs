use thiserror::Error;

pub type MemoryResult<T> = Result<T, MemoryError>;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Spill error: {0}")]
    Spill(String),

    #[error("Config error: {0}")]
    Config(String),
}
