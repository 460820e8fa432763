use thiserror::Error;

use crate::session::SessionId;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("no active session")]
    NoActiveSession,

    #[error("message is empty")]
    EmptyMessage,

    /// A reply for this session is still pending.
    #[error("session {0} already has a request in flight")]
    Busy(SessionId),

    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;
