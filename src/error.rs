use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("promise already completed")]
    AlreadyCompleted,
    #[error("callback panicked: {message}")]
    Panicked { message: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
