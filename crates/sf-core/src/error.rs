use derive_more::From;
use orion_error::{ErrorCode, StructError, UvsReason};

#[derive(Debug, Clone, PartialEq, thiserror::Error, From)]
pub enum CoreReason {
    #[error("checkpoint error")]
    Checkpoint,
    #[error("sink error")]
    Sink,
    #[error("state store error")]
    State,
    #[error("source error")]
    Source,
    #[error("data format error")]
    DataFormat,
    #[error("dead-letter store error")]
    DeadLetter,
    #[error("{0}")]
    Uvs(UvsReason),
}

impl ErrorCode for CoreReason {
    fn error_code(&self) -> i32 {
        match self {
            Self::Checkpoint => 1001,
            Self::Sink => 1002,
            Self::State => 1003,
            Self::Source => 1004,
            Self::DataFormat => 1005,
            Self::DeadLetter => 1006,
            Self::Uvs(u) => u.error_code(),
        }
    }
}

pub type CoreError = StructError<CoreReason>;
pub type CoreResult<T> = Result<T, CoreError>;
