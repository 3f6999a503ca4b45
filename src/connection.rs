//! The per-socket protocol state machine, generalized from
//! `neutronium::net::channel::Channel` (the `mio`/`Buffer`-driven
//! register/deregister and staged-handshake idioms) onto this crate's own
//! wire format and handshake, dropping the encryption layer entirely.

use std::collections::VecDeque;
use std::convert::TryInto;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use mio::net::TcpStream;

use crate::config::Config;
use crate::error::{ErrorType, NetworkError, NetworkResult};
use crate::handshake::{scramble, CHALLENGE_WIRE_SIZE};
use crate::message::{Message, MessageHeader, MessageId, HEADER_WIRE_SIZE};

pub type ConnectionId = u32;

pub(crate) const FIRST_CONNECTION_ID: ConnectionId = 10_000;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionRole {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    New,
    HsWriting,
    HsReading,
    HsValidated,
    CfgExchanging,
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum CloseReason {
    ValidationMismatch,
    ConfigMismatch,
    FrameOverflow,
    Io,
}

pub(crate) enum ConnEvent<Id> {
    Validated,
    ConfigValidated,
    Ready,
    Closed(CloseReason),
    Message(Message<Id>),
}

/// Snapshot shared between the executor-owned `Connection` and every
/// non-owning `ConnectionHandle` held by application code. This is what
/// lets `is_connected()`/`get_remote_config()` answer synchronously from
/// any thread without touching the executor.
#[derive(Debug)]
pub(crate) struct ConnectionShared {
    pub id: ConnectionId,
    pub state: ConnectionState,
    pub remote_config: Config,
    pub peer_addr: Option<SocketAddr>,
}

/// Non-owning handle to a connection living inside a `Server`'s registry.
/// Becomes stale once the connection has been removed from the registry —
/// always check `is_connected()` before routing a reply through it.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub(crate) shared: Arc<Mutex<ConnectionShared>>,
}

impl ConnectionHandle {
    pub fn get_id(&self) -> ConnectionId {
        self.shared.lock().unwrap().id
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().unwrap().state != ConnectionState::Closed
    }

    pub fn is_ready(&self) -> bool {
        self.shared.lock().unwrap().state == ConnectionState::Ready
    }

    pub fn get_remote_config(&self) -> Config {
        self.shared.lock().unwrap().remote_config
    }

    pub fn get_endpoint(&self) -> Option<SocketAddr> {
        self.shared.lock().unwrap().peer_addr
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.lock().unwrap();
        f.debug_struct("ConnectionHandle")
            .field("id", &shared.id)
            .field("state", &shared.state)
            .finish()
    }
}

/// Owns the socket and drives the handshake → config-exchange → framed
/// message I/O state machine. Lives exclusively on its `Executor`'s
/// worker thread.
pub(crate) struct Connection<Id> {
    pub role: ConnectionRole,
    stream: TcpStream,
    state: ConnectionState,
    local_config: Config,
    remote_config: Config,
    expected_response: u64,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    current_header: Option<MessageHeader<Id>>,
    outbound: VecDeque<Message<Id>>,
    shared: Arc<Mutex<ConnectionShared>>,
    log: slog::Logger,
}

impl<Id: MessageId> Connection<Id> {
    fn new(role: ConnectionRole, stream: TcpStream, local_config: Config, log: slog::Logger) -> Connection<Id> {
        let peer_addr = stream.peer_addr().ok();
        let shared = Arc::new(Mutex::new(ConnectionShared {
            id: 0,
            state: ConnectionState::New,
            remote_config: Config::default(),
            peer_addr,
        }));
        Connection {
            role,
            stream,
            state: ConnectionState::New,
            local_config,
            remote_config: Config::default(),
            expected_response: 0,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            current_header: None,
            outbound: VecDeque::new(),
            shared,
            log,
        }
    }

    /// Builds a connection for a freshly accepted server-side socket and
    /// immediately queues its handshake challenge, mirroring the original
    /// constructor computing `m_handshake_out`/`m_handshake_check` up front.
    pub fn accepted(stream: TcpStream, local_config: Config, log: slog::Logger) -> Connection<Id> {
        let mut conn = Connection::new(ConnectionRole::Server, stream, local_config, log);
        let challenge = timestamp_nanos();
        conn.expected_response = scramble(challenge);
        conn.queue_raw(&challenge.to_ne_bytes());
        conn.set_state(ConnectionState::HsWriting);
        conn
    }

    /// Builds a connection for a client's outbound socket, which starts by
    /// waiting to read the server's challenge.
    pub fn outgoing(stream: TcpStream, local_config: Config, log: slog::Logger) -> Connection<Id> {
        let mut conn = Connection::new(ConnectionRole::Client, stream, local_config, log);
        conn.set_state(ConnectionState::HsReading);
        conn
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub(crate) fn shared_arc(&self) -> Arc<Mutex<ConnectionShared>> {
        self.shared.clone()
    }

    pub fn shared_handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: self.shared_arc(),
        }
    }

    pub fn assign_id(&mut self, id: ConnectionId) {
        self.shared.lock().unwrap().id = id;
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.lock().unwrap().id
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn is_connected(&self) -> bool {
        self.state != ConnectionState::Closed
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.shared.lock().unwrap().state = state;
    }

    /// Queues a message for transmission. Only legal once `Ready`; fails
    /// fast if the body would exceed the remote peer's declared
    /// `max_message_size`, without tearing down the connection — the
    /// caller can still retry with a smaller message.
    pub fn send(&mut self, msg: Message<Id>) -> NetworkResult<()> {
        if self.state != ConnectionState::Ready {
            return Err(NetworkError::Fatal(ErrorType::NotReady));
        }
        if msg.len() as u64 > self.remote_config.max_message_size {
            return Err(NetworkError::Fatal(ErrorType::FrameOverflow));
        }
        let was_idle = self.write_buf.is_empty() && self.outbound.is_empty();
        self.outbound.push_back(msg);
        if was_idle {
            let _ = self.flush_writes();
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.set_state(ConnectionState::Closed);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        slog::debug!(self.log, "connection closed"; "id" => self.id());
    }

    fn queue_raw(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
    }

    fn fail(&mut self, reason: CloseReason) -> ConnEvent<Id> {
        slog::warn!(self.log, "connection failed"; "id" => self.id(), "reason" => format!("{:?}", reason));
        self.close();
        ConnEvent::Closed(reason)
    }

    /// Reads non-blockingly until `read_buf` holds at least `need` bytes.
    /// `Ok(true)` once satisfied, `Ok(false)` on `WouldBlock`, `Err` on a
    /// fatal I/O error (peer shutdown included).
    fn try_fill(&mut self, need: usize) -> io::Result<bool> {
        let mut chunk = [0u8; 4096];
        while self.read_buf.len() < need {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer closed the connection"))
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn take(&mut self, n: usize) -> Vec<u8> {
        self.read_buf.drain(..n).collect()
    }

    fn flush_writes(&mut self) -> io::Result<()> {
        loop {
            if self.write_buf.is_empty() {
                match self.outbound.pop_front() {
                    Some(msg) => {
                        self.write_buf.extend_from_slice(&msg.header.to_bytes());
                        self.write_buf.extend_from_slice(&msg.body);
                    }
                    None => return Ok(()),
                }
            }
            match self.stream.write(&self.write_buf) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned zero bytes")),
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Drives outbound I/O in response to a writable-readiness event.
    pub fn on_writable(&mut self) -> Vec<ConnEvent<Id>> {
        match self.flush_writes() {
            Ok(()) => Vec::new(),
            Err(_) => vec![self.fail(CloseReason::Io)],
        }
    }

    /// Drives the handshake/config/framed-message state machine in
    /// response to a readable-readiness event. A single wakeup may advance
    /// through several stages (or decode several pipelined messages), so
    /// this loops until the socket would block.
    pub fn on_readable(&mut self) -> Vec<ConnEvent<Id>> {
        let mut events = Vec::new();
        loop {
            match self.state {
                ConnectionState::Closed => break,

                ConnectionState::New | ConnectionState::HsWriting if self.role == ConnectionRole::Server => {
                    match self.try_fill(CHALLENGE_WIRE_SIZE) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(_) => {
                            events.push(self.fail(CloseReason::Io));
                            break;
                        }
                    }
                    let bytes = self.take(CHALLENGE_WIRE_SIZE);
                    let response = u64::from_ne_bytes(bytes[..].try_into().unwrap());
                    if response != self.expected_response {
                        events.push(self.fail(CloseReason::ValidationMismatch));
                        break;
                    }
                    self.set_state(ConnectionState::HsValidated);
                    events.push(ConnEvent::Validated);
                    self.begin_config_exchange();
                }

                ConnectionState::New | ConnectionState::HsReading if self.role == ConnectionRole::Client => {
                    match self.try_fill(CHALLENGE_WIRE_SIZE) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(_) => {
                            events.push(self.fail(CloseReason::Io));
                            break;
                        }
                    }
                    let bytes = self.take(CHALLENGE_WIRE_SIZE);
                    let challenge = u64::from_ne_bytes(bytes[..].try_into().unwrap());
                    let response = scramble(challenge);
                    self.queue_raw(&response.to_ne_bytes());
                    let _ = self.flush_writes();
                    self.begin_config_exchange();
                }

                ConnectionState::CfgExchanging => {
                    match self.try_fill(Config::WIRE_SIZE) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(_) => {
                            events.push(self.fail(CloseReason::Io));
                            break;
                        }
                    }
                    let bytes = self.take(Config::WIRE_SIZE);
                    let remote = Config::from_bytes(&bytes);
                    if remote.endian != self.local_config.endian || remote.version != self.local_config.version {
                        events.push(self.fail(CloseReason::ConfigMismatch));
                        break;
                    }
                    self.remote_config = remote;
                    self.shared.lock().unwrap().remote_config = remote;
                    events.push(ConnEvent::ConfigValidated);
                    self.set_state(ConnectionState::Ready);
                    slog::info!(self.log, "connection ready"; "id" => self.id());
                    events.push(ConnEvent::Ready);
                }

                ConnectionState::Ready => {
                    if self.current_header.is_none() {
                        match self.try_fill(HEADER_WIRE_SIZE) {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(_) => {
                                events.push(self.fail(CloseReason::Io));
                                break;
                            }
                        }
                        let bytes = self.take(HEADER_WIRE_SIZE);
                        let header: MessageHeader<Id> = MessageHeader::from_bytes(&bytes);
                        if header.size as u64 > self.local_config.max_message_size {
                            events.push(self.fail(CloseReason::FrameOverflow));
                            break;
                        }
                        self.current_header = Some(header);
                    }

                    let header = self.current_header.unwrap();
                    if header.size == 0 {
                        self.current_header = None;
                        events.push(ConnEvent::Message(Message {
                            header,
                            body: Vec::new(),
                        }));
                        continue;
                    }

                    match self.try_fill(header.size as usize) {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(_) => {
                            events.push(self.fail(CloseReason::Io));
                            break;
                        }
                    }
                    let body = self.take(header.size as usize);
                    self.current_header = None;
                    events.push(ConnEvent::Message(Message { header, body }));
                }

                _ => break,
            }
        }
        events
    }

    fn begin_config_exchange(&mut self) {
        self.set_state(ConnectionState::CfgExchanging);
        self.queue_raw(&self.local_config.to_bytes());
        let _ = self.flush_writes();
    }
}

fn timestamp_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as u64
}
