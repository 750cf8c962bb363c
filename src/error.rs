use thiserror::Error;

#[derive(Debug, Error)]
pub enum GarageBotError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("dispatch error: {0}")]
    Dispatch(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

pub use crate::Result;
