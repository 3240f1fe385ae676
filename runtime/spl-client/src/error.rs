use spl_db::{ErrorKind, Response};

/// Failures seen by the control context.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// The batch was rejected by the execution context.
    #[error("{message}")]
    Batch {
        kind: Option<ErrorKind>,
        message: String,
    },
    #[error("Initialization failed: {0}")]
    Init(String),
    #[error("Worker terminated")]
    Terminated,
    /// A reply did not have the shape the terminal read expects.
    #[error("Unexpected reply: {0}")]
    Decode(String),
}

impl Error {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Batch { kind, .. } => *kind,
            Error::Init(_) | Error::Terminated => Some(ErrorKind::Transport),
            Error::Decode(_) => Some(ErrorKind::Protocol),
        }
    }

    pub(crate) fn from_response(response: &Response) -> Self {
        Error::Batch {
            kind: response.kind,
            message: response.error.clone(),
        }
    }
}

impl From<spl_db::Error> for Error {
    fn from(err: spl_db::Error) -> Self {
        Error::Batch {
            kind: Some(err.kind()),
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
