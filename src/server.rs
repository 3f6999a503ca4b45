//! The listening side: accepts connections, runs the handshake/config
//! state machine for each, and fans inbound messages out to the
//! application thread. Grounded on `neutronium::net::endpoint::Endpoint`'s
//! accept/dispatch loop and its `indexmap::IndexSet` live-connection set.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use indexmap::IndexMap;
use mio::{Ready, Token};

use crate::config::Config;
use crate::connection::{
    CloseReason, ConnEvent, Connection, ConnectionHandle, ConnectionId, FIRST_CONNECTION_ID,
};
use crate::executor::{Executor, ExecutorHandle};
use crate::message::{Message, MessageId, OwnedMessage};
use crate::queue::ThreadSafeQueue;

const LISTENER_TOKEN: Token = Token(0);

/// Application-supplied connection-lifecycle callbacks, replacing the
/// original's virtual `server_interface<T>` overrides. Lifecycle callbacks
/// (everything but `on_message`) run on the executor thread; `on_message`
/// runs on whichever thread calls `update()`.
pub trait ServerHandlers<Id>: Send + 'static {
    /// Decides whether to accept a freshly connected socket before the
    /// handshake begins. Defaults to rejecting, matching
    /// `server_interface::on_client_connect`'s base `return false;` — an
    /// application must opt in.
    fn on_client_connect(&mut self, _conn: &ConnectionHandle) -> bool {
        false
    }

    fn on_client_validated(&mut self, _conn: &ConnectionHandle) {}

    fn on_client_config_validated(&mut self, _conn: &ConnectionHandle) {}

    fn on_client_ready(&mut self, _conn: &ConnectionHandle) {}

    fn on_client_disconnect(&mut self, _conn: &ConnectionHandle) {}

    fn on_message(&mut self, _conn: Option<ConnectionHandle>, _msg: &mut Message<Id>) {}
}

struct ServerState<Id, H> {
    listener: mio::net::TcpListener,
    registry: IndexMap<ConnectionId, Connection<Id>>,
    next_id: ConnectionId,
    local_config: Config,
    handlers: Arc<Mutex<H>>,
    inbound: Arc<ThreadSafeQueue<OwnedMessage<Id>>>,
    log: slog::Logger,
}

pub struct Server<Id: MessageId, H: ServerHandlers<Id>> {
    port: u16,
    local_addr: Option<SocketAddr>,
    local_config: Config,
    handlers: Arc<Mutex<H>>,
    inbound: Arc<ThreadSafeQueue<OwnedMessage<Id>>>,
    executor_handle: Option<ExecutorHandle<ServerState<Id, H>>>,
    join: Option<JoinHandle<ServerState<Id, H>>>,
    log: slog::Logger,
}

impl<Id: MessageId, H: ServerHandlers<Id>> Server<Id, H> {
    pub fn new(port: u16, handlers: H) -> Server<Id, H> {
        Server::with_config(port, handlers, Config::default(), None)
    }

    pub fn with_config(
        port: u16,
        handlers: H,
        local_config: Config,
        log: Option<&slog::Logger>,
    ) -> Server<Id, H> {
        Server {
            port,
            local_addr: None,
            local_config,
            handlers: Arc::new(Mutex::new(handlers)),
            inbound: Arc::new(ThreadSafeQueue::new()),
            executor_handle: None,
            join: None,
            log: crate::child_logger(log),
        }
    }

    /// The address the listener actually bound to, once `start()` has
    /// succeeded. Useful when constructed with port `0` to let the OS
    /// choose a free port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Binds the listener and spawns the executor thread. Mirrors
    /// `server_interface::start`.
    pub fn start(&mut self) -> io::Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.port)
            .parse()
            .expect("port produces a valid bind address");
        let listener = mio::net::TcpListener::bind(&addr)?;
        self.local_addr = listener.local_addr().ok();

        let executor: Executor<ServerState<Id, H>> = Executor::new()?;
        executor.register(&listener, LISTENER_TOKEN, Ready::readable())?;

        let state = ServerState {
            listener,
            registry: IndexMap::new(),
            next_id: FIRST_CONNECTION_ID,
            local_config: self.local_config,
            handlers: self.handlers.clone(),
            inbound: self.inbound.clone(),
            log: self.log.clone(),
        };

        self.executor_handle = Some(executor.handle());
        self.join = Some(thread::spawn(move || executor.run(state, dispatch)));
        slog::info!(self.log, "server started"; "port" => self.port);
        Ok(())
    }

    /// Stops the executor and joins its thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(handle) = self.executor_handle.take() {
            handle.stop();
        }
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        slog::info!(self.log, "server stopped");
    }

    /// Drains up to `max` inbound messages, invoking `on_message` for each
    /// on the calling thread. If `wait` is set and the queue is currently
    /// empty, blocks until at least one message has arrived.
    pub fn update(&self, max: usize, wait: bool) {
        if wait {
            self.inbound.wait();
        }
        let mut handled = 0;
        while handled < max {
            let owned = match self.inbound.pop_front() {
                Some(owned) => owned,
                None => break,
            };
            let OwnedMessage { remote, mut msg } = owned;
            self.handlers.lock().unwrap().on_message(remote, &mut msg);
            handled += 1;
        }
    }

    /// Posts a job that sends `msg` to a single client, or cleans up the
    /// registry entry (invoking `on_client_disconnect`) if it has since
    /// disconnected.
    pub fn message_client(&self, target: &ConnectionHandle, msg: Message<Id>) {
        let id = target.get_id();
        if let Some(handle) = &self.executor_handle {
            handle.post(Box::new(move |state: &mut ServerState<Id, H>| {
                send_or_disconnect(state, id, msg);
            }));
        }
    }

    /// Posts a job that broadcasts `msg` to every registered client except
    /// `except`, if given.
    pub fn message_all_clients(&self, msg: Message<Id>, except: Option<&ConnectionHandle>) {
        let except_id = except.map(|handle| handle.get_id());
        if let Some(handle) = &self.executor_handle {
            handle.post(Box::new(move |state: &mut ServerState<Id, H>| {
                let ids: Vec<ConnectionId> = state.registry.keys().copied().collect();
                for id in ids {
                    if Some(id) == except_id {
                        continue;
                    }
                    send_or_disconnect(state, id, msg.clone());
                }
            }));
        }
    }
}

/// A target mid-handshake (registered but not yet `Ready`) is left alone:
/// it isn't disconnected, it just can't take a message yet, so the send is
/// silently dropped rather than tearing the connection down underneath a
/// caller holding a handle from `on_client_connect`/`on_client_validated`/
/// `on_client_config_validated`.
fn send_or_disconnect<Id: MessageId, H: ServerHandlers<Id>>(
    state: &mut ServerState<Id, H>,
    id: ConnectionId,
    msg: Message<Id>,
) {
    let disconnected = match state.registry.get_mut(&id) {
        Some(conn) if conn.is_ready() => conn.send(msg).is_err(),
        Some(conn) => !conn.is_connected(),
        None => return,
    };
    if disconnected {
        remove_connection(state, id);
    }
}

/// Drops a registry entry without an explicit `mio` deregister call: the
/// socket's `Drop` closes the fd, which the OS poller reclaims on its own.
/// `dispatch`'s disconnect path still deregisters explicitly since it has
/// an `Executor` reference handy and the connection may still be readable.
fn remove_connection<Id: MessageId, H: ServerHandlers<Id>>(state: &mut ServerState<Id, H>, id: ConnectionId) {
    if let Some(conn) = state.registry.shift_remove(&id) {
        let handle = conn.shared_handle();
        state.handlers.lock().unwrap().on_client_disconnect(&handle);
    }
}

fn accept_loop<Id: MessageId, H: ServerHandlers<Id>>(
    state: &mut ServerState<Id, H>,
    exec: &Executor<ServerState<Id, H>>,
) {
    loop {
        match state.listener.accept() {
            Ok((stream, _addr)) => {
                let mut conn: Connection<Id> = Connection::accepted(stream, state.local_config, state.log.clone());
                let handle = conn.shared_handle();
                let accept = state.handlers.lock().unwrap().on_client_connect(&handle);
                if !accept {
                    conn.close();
                    continue;
                }

                let id = state.next_id;
                state.next_id += 1;
                conn.assign_id(id);

                let token = Token(id as usize);
                if exec
                    .register(conn.stream(), token, Ready::readable() | Ready::writable())
                    .is_err()
                {
                    continue;
                }

                slog::info!(state.log, "connection approved"; "id" => id);
                state.registry.insert(id, conn);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                slog::warn!(state.log, "accept failed"; "error" => %e);
                break;
            }
        }
    }
}

fn dispatch<Id: MessageId, H: ServerHandlers<Id>>(
    state: &mut ServerState<Id, H>,
    exec: &Executor<ServerState<Id, H>>,
    token: Token,
    readiness: Ready,
) {
    if token == LISTENER_TOKEN {
        accept_loop(state, exec);
        return;
    }

    let id = token.0 as ConnectionId;
    let mut should_remove = false;
    if let Some(conn) = state.registry.get_mut(&id) {
        let mut events = Vec::new();
        if readiness.is_writable() {
            events.extend(conn.on_writable());
        }
        if readiness.is_readable() {
            events.extend(conn.on_readable());
        }

        for event in events {
            match event {
                ConnEvent::Validated => {
                    let handle = conn.shared_handle();
                    state.handlers.lock().unwrap().on_client_validated(&handle);
                }
                ConnEvent::ConfigValidated => {
                    let handle = conn.shared_handle();
                    state.handlers.lock().unwrap().on_client_config_validated(&handle);
                }
                ConnEvent::Ready => {
                    let handle = conn.shared_handle();
                    state.handlers.lock().unwrap().on_client_ready(&handle);
                }
                ConnEvent::Message(msg) => {
                    let handle = conn.shared_handle();
                    state.inbound.push_back(OwnedMessage {
                        remote: Some(handle),
                        msg,
                    });
                }
                ConnEvent::Closed(CloseReason::Io)
                | ConnEvent::Closed(CloseReason::ValidationMismatch)
                | ConnEvent::Closed(CloseReason::ConfigMismatch)
                | ConnEvent::Closed(CloseReason::FrameOverflow) => {
                    should_remove = true;
                }
            }
        }
    }

    if should_remove {
        if let Some(conn) = state.registry.get(&id) {
            let _ = exec.deregister(conn.stream());
        }
        if let Some(conn) = state.registry.shift_remove(&id) {
            let handle = conn.shared_handle();
            state.handlers.lock().unwrap().on_client_disconnect(&handle);
        }
    }
}
