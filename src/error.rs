use std::io;

/// Crate-level errors: things that stop the server from starting, or that
/// surface out of `Listener::run`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS configuration error: {0}")]
    Tls(String),
    #[error("privilege drop failed: {0}")]
    Privilege(String),
    #[error("no listening sockets could be created")]
    NoListenSockets,
}

/// Reasons a single session is aborted without completing its command
/// loop. None of these produce a final response line: the connection is
/// simply dropped; there's nothing more worth saying to a peer whose
/// stream already failed.
#[derive(Debug)]
pub enum Fatal {
    /// The line receiver's buffer grew past its cap without finding a
    /// complete line.
    BufferOverflow,
    /// The byte stream contains a sequence that can never be valid UTF-8.
    InvalidUtf8,
    /// The read or write side of the socket failed, or the session's
    /// idle timeout elapsed.
    Io(io::Error),
    /// The adapter asked for the connection to be closed.
    AdapterClosed(String),
}
