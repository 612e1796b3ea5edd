use std::net::SocketAddr;

use crate::sid::Sid;

/// Conditions that callers of the session layer may want to distinguish. Setup code
///  (binding sockets, validating configuration) reports through `anyhow` instead.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("malformed compressed payload: {0}")]
    Codec(#[from] std::io::Error),

    #[error("no free session id after {0} probes")]
    SidExhausted(u64),

    #[error("session {0} is already registered")]
    DuplicateSid(Sid),

    #[error("session {sid} to {remote_addr:?} is closed")]
    SessionClosed { sid: Sid, remote_addr: SocketAddr },

    #[error("reliable transport engine rejected the operation: {0}")]
    Engine(String),

    #[error("already started")]
    AlreadyStarted,
}

pub type SessionResult<T> = Result<T, SessionError>;
