//! `wavelink` is a reusable client/server core for exchanging discrete,
//! typed, length-prefixed messages over TCP.
//!
//! Applications embed it to build multi-client services — chat rooms, game
//! backends, control planes — where each message carries an
//! application-chosen numeric identifier plus an opaque byte body. The
//! crate owns the socket I/O, the connection handshake, and the thread-safe
//! inbound queue; encryption, identity authentication, persistence, and
//! reconnection policy are left to the embedding application.
//!
//! The moving pieces:
//!
//! - [`Message`]/[`MessageHeader`] — the typed, LIFO-pushable wire value.
//! - [`ThreadSafeQueue`] — the blocking-capable inbound/outbound queue.
//! - [`Config`]/[`Endian`]/[`ProtocolVersion`] — the handshake's wire config.
//! - [`Server`]/[`ServerHandlers`] — the listening side and its callbacks.
//! - [`Client`] — the connecting side.

mod client;
mod config;
mod connection;
mod error;
mod executor;
mod handshake;
mod message;
mod pod;
mod queue;
mod server;

pub use client::Client;
pub use config::{
    Config, Endian, ProtocolVersion, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_VERSION,
};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionRole, ConnectionState};
pub use error::{ErrorType, NetworkError, NetworkResult};
pub use message::{Message, MessageHeader, MessageId, OwnedMessage, WireValue};
pub use pod::Pod;
pub use queue::ThreadSafeQueue;
pub use server::{Server, ServerHandlers};

pub(crate) fn child_logger(log: Option<&slog::Logger>) -> slog::Logger {
    match log {
        Some(logger) => logger.new(slog::o!()),
        None => slog::Logger::root(slog::Discard, slog::o!()),
    }
}

/// Convenience terminal logger for applications that don't want to wire up
/// their own `slog` drain, built the same way the underlying stack's own
/// `logging::init()` does — minus that helper's unused `logger` binding, so
/// the built logger actually reaches the caller.
pub fn terminal_logger(level: sloggers::types::Severity) -> slog::Logger {
    use sloggers::terminal::{Destination, TerminalLoggerBuilder};
    use sloggers::Build;

    let mut builder = TerminalLoggerBuilder::new();
    builder.destination(Destination::Stderr);
    builder.level(level);
    builder.build().expect("terminal logger builds")
}
