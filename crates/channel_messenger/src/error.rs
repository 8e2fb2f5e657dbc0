use thiserror::Error;

use crate::transport::ReplyId;

/// Broad classes of [`MessengerError`].
///
/// `InvalidArgument` and `IllegalState` are caller contract violations and should
/// surface in tests; `Runtime` and `Codec` are environmental.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    IllegalState,
    Runtime,
    Codec,
}

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error(
        "unrecognized task queue token {0}; create task queues through make_background_task_queue on this messenger"
    )]
    UnrecognizedTaskQueue(u64),

    #[error("reply already submitted for reply id {0}")]
    ReplyAlreadySubmitted(ReplyId),

    #[error("no tokio runtime available to drive background task queues")]
    NoRuntime,

    #[error("could not start the platform queue worker: {0}")]
    Worker(#[from] std::io::Error),

    #[error("reply for channel `{0}` was dropped before it arrived")]
    ReplyDropped(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl MessengerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MessengerError::UnrecognizedTaskQueue(_) => ErrorKind::InvalidArgument,
            MessengerError::ReplyAlreadySubmitted(_) => ErrorKind::IllegalState,
            MessengerError::NoRuntime
            | MessengerError::Worker(_)
            | MessengerError::ReplyDropped(_) => ErrorKind::Runtime,
            MessengerError::Codec(_) => ErrorKind::Codec,
        }
    }
}

impl From<serde_json::Error> for MessengerError {
    fn from(err: serde_json::Error) -> Self {
        MessengerError::Codec(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for MessengerError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        MessengerError::Codec(err.to_string())
    }
}
