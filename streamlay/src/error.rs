#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid source `{0}`: {1}")]
    InvalidSource(String, String),
    #[error("Stream `{0}` not found")]
    NotFound(String),
    #[error("Failed to launch encoder: {0}")]
    Launch(String),
    #[error("Could not allocate a unique stream id after {0} attempts")]
    IdExhausted(usize),
    #[error("Config error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors caused by bad caller input
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::InvalidSource(..))
    }
}
