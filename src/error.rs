//! Hand-rolled error types, mirroring `flux::shared::{NetworkError, ErrorType}`
//! rather than reaching for `thiserror`/`anyhow`.

use std::fmt;
use std::io;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorType {
    /// The peer's handshake response didn't match the expected challenge.
    ValidationMismatch,
    /// The peer's declared `Config` (endian or version) disagrees with ours.
    ConfigMismatch,
    /// A message body would exceed the peer's declared `max_message_size`.
    FrameOverflow,
    /// The connection isn't in the `Ready` state yet.
    NotReady,
    Io(io::ErrorKind),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NetworkError {
    Fatal(ErrorType),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        NetworkError::Fatal(ErrorType::Io(err.kind()))
    }
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Fatal(kind) => write!(f, "network error: {:?}", kind),
        }
    }
}

impl std::error::Error for NetworkError {}
