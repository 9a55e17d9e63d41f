#[derive(Debug)]
pub enum MmrError {
    Io(std::io::Error),
    /// Requested index is not part of the current logical state.
    OutOfBounds(u64),
    /// Persisted file content does not parse.
    Corrupt(&'static str),
    InvalidSize(u64),
}

impl std::fmt::Display for MmrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MmrError::Io(err) => write!(f, "{err}"),
            MmrError::OutOfBounds(index) => write!(f, "index {index} out of bounds"),
            MmrError::Corrupt(message) => write!(f, "{message}"),
            MmrError::InvalidSize(size) => write!(f, "{size} is not a valid mmr size"),
        }
    }
}

impl std::error::Error for MmrError {}

impl From<std::io::Error> for MmrError {
    fn from(err: std::io::Error) -> Self {
        MmrError::Io(err)
    }
}
