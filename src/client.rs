//! The connecting side: owns a single `Connection` and its executor
//! thread. Mirrors `client_interface<T>`, minus its `asio::io_context`
//! plumbing and its always-`return false;` bug on `connect()`.

use std::net::ToSocketAddrs;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use mio::{Ready, Token};

use crate::config::Config;
use crate::connection::{ConnEvent, Connection, ConnectionShared, ConnectionState};
use crate::error::{ErrorType, NetworkError, NetworkResult};
use crate::executor::{Executor, ExecutorHandle};
use crate::message::{Message, MessageId, OwnedMessage};
use crate::queue::ThreadSafeQueue;

const CONNECTION_TOKEN: Token = Token(1);

struct ClientState<Id> {
    connection: Connection<Id>,
}

pub struct Client<Id: MessageId> {
    local_config: Config,
    shared: Option<Arc<Mutex<ConnectionShared>>>,
    inbound: Arc<ThreadSafeQueue<OwnedMessage<Id>>>,
    executor_handle: Option<ExecutorHandle<ClientState<Id>>>,
    join: Option<JoinHandle<ClientState<Id>>>,
    log: slog::Logger,
}

impl<Id: MessageId> Client<Id> {
    pub fn new() -> Client<Id> {
        Client::with_config(Config::default(), None)
    }

    pub fn with_config(local_config: Config, log: Option<&slog::Logger>) -> Client<Id> {
        Client {
            local_config,
            shared: None,
            inbound: Arc::new(ThreadSafeQueue::new()),
            executor_handle: None,
            join: None,
            log: crate::child_logger(log),
        }
    }

    /// Resolves `host:port` synchronously and kicks off a nonblocking
    /// connect on a dedicated executor thread. Returns `true` once the
    /// socket has been created and the handshake is under way, `false` on
    /// resolution or connect failure — the corrected contract relative to
    /// the original, which always returned `false` regardless of outcome.
    pub fn connect(&mut self, host: &str, port: u16) -> bool {
        if self.executor_handle.is_some() {
            self.disconnect();
        }

        let addr = match (host, port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => return false,
            },
            Err(_) => return false,
        };

        let stream = match mio::net::TcpStream::connect(&addr) {
            Ok(stream) => stream,
            Err(_) => return false,
        };

        let executor: Executor<ClientState<Id>> = match Executor::new() {
            Ok(executor) => executor,
            Err(_) => return false,
        };

        let connection = Connection::outgoing(stream, self.local_config, self.log.clone());
        if executor
            .register(connection.stream(), CONNECTION_TOKEN, Ready::readable() | Ready::writable())
            .is_err()
        {
            return false;
        }

        self.shared = Some(connection.shared_arc());
        let inbound = self.inbound.clone();
        let state = ClientState { connection };

        self.executor_handle = Some(executor.handle());
        self.join = Some(thread::spawn(move || {
            executor.run(state, move |state, _exec, _token, readiness| {
                dispatch(state, readiness, &inbound)
            })
        }));
        slog::info!(self.log, "connecting"; "host" => host, "port" => port);
        true
    }

    /// Posts a socket close and stops/joins the executor thread. Safe to
    /// call even if never connected.
    pub fn disconnect(&mut self) {
        if let Some(handle) = &self.executor_handle {
            handle.post(Box::new(|state: &mut ClientState<Id>| state.connection.close()));
            handle.stop();
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        self.executor_handle = None;
        self.shared = None;
    }

    pub fn is_connected(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.lock().unwrap().state != ConnectionState::Closed,
            None => false,
        }
    }

    pub fn is_ready(&self) -> bool {
        match &self.shared {
            Some(shared) => shared.lock().unwrap().state == ConnectionState::Ready,
            None => false,
        }
    }

    /// Fails fast with `NotReady`/`FrameOverflow` if the connection isn't
    /// ready for this message; otherwise posts the send as a job.
    pub fn send(&self, msg: Message<Id>) -> NetworkResult<()> {
        let shared = self
            .shared
            .as_ref()
            .ok_or(NetworkError::Fatal(ErrorType::NotReady))?;
        {
            let shared = shared.lock().unwrap();
            if shared.state != ConnectionState::Ready {
                return Err(NetworkError::Fatal(ErrorType::NotReady));
            }
            if msg.len() as u64 > shared.remote_config.max_message_size {
                return Err(NetworkError::Fatal(ErrorType::FrameOverflow));
            }
        }
        if let Some(handle) = &self.executor_handle {
            handle.post(Box::new(move |state: &mut ClientState<Id>| {
                let _ = state.connection.send(msg);
            }));
        }
        Ok(())
    }

    /// Returns a cloneable handle to the inbound queue; drain it with
    /// `pop_front()` or block with `wait()`.
    pub fn incoming(&self) -> Arc<ThreadSafeQueue<OwnedMessage<Id>>> {
        self.inbound.clone()
    }
}

impl<Id: MessageId> Default for Client<Id> {
    fn default() -> Self {
        Client::new()
    }
}

impl<Id: MessageId> Drop for Client<Id> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn dispatch<Id: MessageId>(state: &mut ClientState<Id>, readiness: Ready, inbound: &ThreadSafeQueue<OwnedMessage<Id>>) {
    let mut events = Vec::new();
    if readiness.is_writable() {
        events.extend(state.connection.on_writable());
    }
    if readiness.is_readable() {
        events.extend(state.connection.on_readable());
    }
    for event in events {
        if let ConnEvent::Message(msg) = event {
            inbound.push_back(OwnedMessage { remote: None, msg });
        }
    }
}
