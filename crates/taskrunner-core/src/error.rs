use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The config file or an environment override could not be parsed.
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
