//! Typed error enums for each component that can fail.
//!
//! None of these ever surface from a panic — malformed or hostile input from
//! a connected client degrades to a rejected handshake or a closed session,
//! never a crash. See the crate root docs for the propagation rules.

/// Failures during the strictly-ordered handshake (`HelloSnapO` read).
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake timed out waiting for the hello line")]
    Timeout,
    #[error("hello line exceeded {0} bytes without a newline")]
    TooLarge(usize),
    #[error("unexpected handshake token: {0:?}")]
    UnexpectedToken(String),
    #[error("I/O error during handshake: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures that close an active session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] link_protocol::CodecError),
    #[error("session closed")]
    Closed,
}

impl From<HandshakeError> for SessionError {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Io(e) => SessionError::Io(e),
            HandshakeError::Timeout | HandshakeError::TooLarge(_) | HandshakeError::UnexpectedToken(_) => {
                SessionError::Closed
            }
        }
    }
}

/// Failures raised by the `Server` itself, as opposed to a single session.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind the observability link socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error("refusing to start the observability link in a release build without allow_release")]
    ReleaseBuildBlocked,
}
