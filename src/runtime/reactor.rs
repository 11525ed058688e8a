//! Readiness event loop.
//!
//! One reactor thread owns the listener, the timer heap, and the poll call;
//! ready connections are handed to the worker pool. Connections are
//! registered one-shot, so after an event is dispatched no further events
//! arrive for that connection until the worker re-arms interest through
//! `Notifier::modify`. At most one thread works a connection at a time.
//!
//! Workers and timer callbacks never hold raw slot references: they capture
//! the connection id and resolve it through the shared table at run time, so
//! a slot that closed in the meantime turns the task into a no-op.

use crate::config::{Config, TriggerMode};
use crate::protocol::ProcessorFactory;
use crate::runtime::connection::{ConnState, ConnectionSlot, ReadOutcome, WriteOutcome};
use crate::runtime::notifier::{Event, Events, Interest, Notifier};
use crate::runtime::pool::WorkerPool;
use crate::runtime::timer::TimerHeap;
use slab::Slab;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Registration id reserved for the listening socket.
const LISTENER_ID: u64 = u64::MAX;

/// Fixed reject message for connections over the limit.
const BUSY_MESSAGE: &[u8] = b"Server busy!";

/// Events drained per poll call.
const EVENT_BATCH: usize = 1024;

/// State shared between the reactor thread, workers, and timer callbacks.
pub(crate) struct Shared {
    notifier: Notifier,
    conns: RwLock<Slab<Arc<Mutex<ConnectionSlot>>>>,
    active: AtomicUsize,
    /// Base interest for connection sockets (peer-closed, one-shot, edge).
    conn_interest: Interest,
    conn_edge: bool,
}

/// Cheap cloneable view of the reactor's connection table.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    /// Number of connections currently in the slot table.
    pub fn active_connections(&self) -> usize {
        self.shared.conns.read().unwrap().len()
    }
}

pub struct Reactor {
    shared: Arc<Shared>,
    listener: TcpListener,
    listener_edge: bool,
    timer: TimerHeap,
    pool: WorkerPool,
    factory: Box<dyn ProcessorFactory>,
    idle_timeout: Option<Duration>,
    max_connections: usize,
    linger: bool,
}

impl Reactor {
    pub fn new(config: &Config, factory: Box<dyn ProcessorFactory>) -> io::Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = create_listener(addr)?;

        let listener_edge = config.listener_trigger == TriggerMode::Edge;
        let conn_edge = config.conn_trigger == TriggerMode::Edge;

        let mut conn_interest = Interest::PEER_CLOSED | Interest::ONESHOT;
        if conn_edge {
            conn_interest = conn_interest | Interest::EDGE;
        }

        let notifier = Notifier::new()?;
        let mut listen_interest = Interest::READABLE;
        if listener_edge {
            listen_interest = listen_interest | Interest::EDGE;
        }
        notifier.register(listener.as_raw_fd(), LISTENER_ID, listen_interest)?;

        let threads = if config.workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            config.workers
        };
        let pool = WorkerPool::new(threads)?;

        let idle_timeout = if config.idle_timeout_ms > 0 {
            Some(Duration::from_millis(config.idle_timeout_ms))
        } else {
            None
        };

        Ok(Self {
            shared: Arc::new(Shared {
                notifier,
                conns: RwLock::new(Slab::with_capacity(config.max_connections)),
                active: AtomicUsize::new(0),
                conn_interest,
                conn_edge,
            }),
            listener,
            listener_edge,
            timer: TimerHeap::new(),
            pool,
            factory,
            idle_timeout,
            max_connections: config.max_connections,
            linger: config.linger,
        })
    }

    /// Bound address of the listening socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Drive the event loop. Does not return in normal operation.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_BATCH);

        info!(
            addr = %self.local_addr()?,
            listener_mode = if self.listener_edge { "edge" } else { "level" },
            conn_mode = if self.shared.conn_edge { "edge" } else { "level" },
            idle_timeout_ms = self.idle_timeout.map_or(0, |d| d.as_millis() as u64),
            max_connections = self.max_connections,
            "Reactor started"
        );

        loop {
            // The next timer deadline bounds the poll, so one thread serves
            // both readiness and timeout enforcement.
            let timeout_ms = if self.idle_timeout.is_some() {
                self.timer.next_tick_ms()
            } else {
                -1
            };

            self.shared.notifier.wait(&mut events, timeout_ms)?;

            for event in events.iter() {
                if event.id() == LISTENER_ID {
                    self.accept_connections();
                } else {
                    self.dispatch(event);
                }
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.shared.active.load(Ordering::Relaxed) >= self.max_connections {
                        warn!(peer = %peer, "Connection limit reached, rejecting");
                        reject(stream);
                    } else if let Err(e) = self.install(stream, peer) {
                        warn!(peer = %peer, error = %e, "Failed to install connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // Transient; the next readiness notification retries.
                    error!(error = %e, "Accept failed");
                    break;
                }
            }
            if !self.listener_edge {
                break;
            }
        }
    }

    fn install(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        if self.linger {
            SockRef::from(&stream).set_linger(Some(Duration::from_secs(1)))?;
        }
        let fd = stream.as_raw_fd();

        let interest = Interest::READABLE | self.shared.conn_interest;
        let mut slot = ConnectionSlot::new(stream, peer, self.factory.create());
        slot.set_interest(interest);

        let id = {
            let mut table = self.shared.conns.write().unwrap();
            table.insert(Arc::new(Mutex::new(slot))) as u64
        };
        self.shared.active.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.shared.notifier.register(fd, id, interest) {
            let mut table = self.shared.conns.write().unwrap();
            table.try_remove(id as usize);
            self.shared.active.fetch_sub(1, Ordering::Relaxed);
            return Err(e);
        }

        if let Some(idle) = self.idle_timeout {
            let shared = Arc::clone(&self.shared);
            self.timer.add(
                id,
                idle,
                Box::new(move || {
                    debug!(conn_id = id, "Idle timeout");
                    close_connection(&shared, id);
                }),
            );
        }

        debug!(conn_id = id, peer = %peer, "Accepted connection");
        Ok(())
    }

    fn dispatch(&mut self, event: Event) {
        let id = event.id();
        let conn = {
            let table = self.shared.conns.read().unwrap();
            table.get(id as usize).cloned()
        };
        // Stale event: a worker or the timer already closed this slot.
        let Some(conn) = conn else { return };

        if event.is_error() || event.is_peer_closed() {
            close_connection(&self.shared, id);
            return;
        }

        // Any readiness counts as activity for idle eviction.
        if let Some(idle) = self.idle_timeout {
            self.timer.adjust(id, idle);
        }

        if event.is_readable() {
            {
                let mut slot = conn.lock().unwrap();
                if slot.is_closed() {
                    return;
                }
                slot.state = ConnState::DispatchedRead;
            }
            let shared = Arc::clone(&self.shared);
            self.pool.execute(move || read_turn(&shared, id));
        } else if event.is_writable() {
            {
                let mut slot = conn.lock().unwrap();
                if slot.is_closed() {
                    return;
                }
                slot.state = ConnState::DispatchedWrite;
            }
            let shared = Arc::clone(&self.shared);
            self.pool.execute(move || write_turn(&shared, id));
        }
    }
}

/// Worker body for a readable connection.
fn read_turn(shared: &Arc<Shared>, id: u64) {
    let Some(conn) = lookup(shared, id) else { return };
    let mut slot = conn.lock().unwrap();
    if slot.is_closed() {
        return;
    }

    match slot.read_from_socket(shared.conn_edge) {
        Ok(ReadOutcome::Received(_)) => {}
        Ok(ReadOutcome::PeerClosed) => {
            drop(slot);
            close_connection(shared, id);
            return;
        }
        Err(e) => {
            debug!(conn_id = id, error = %e, "Read failed");
            drop(slot);
            close_connection(shared, id);
            return;
        }
    }

    if !process_turn(shared, id, &mut slot) {
        drop(slot);
        close_connection(shared, id);
    }
}

/// Worker body for a writable connection.
fn write_turn(shared: &Arc<Shared>, id: u64) {
    let Some(conn) = lookup(shared, id) else { return };
    let mut slot = conn.lock().unwrap();
    if slot.is_closed() {
        return;
    }

    match slot.write_to_socket(shared.conn_edge) {
        Ok(WriteOutcome::Complete) => {
            if slot.keep_alive() {
                slot.reset_for_next();
                // Pipelined bytes already buffered will never produce a new
                // readiness event under edge triggering; run the processor
                // now, which re-arms read interest when the buffer is empty.
                if !process_turn(shared, id, &mut slot) {
                    drop(slot);
                    close_connection(shared, id);
                }
            } else {
                drop(slot);
                close_connection(shared, id);
            }
        }
        Ok(WriteOutcome::Pending) => {
            slot.state = ConnState::ArmedWrite;
            let interest = Interest::WRITABLE | shared.conn_interest;
            slot.set_interest(interest);
            if let Err(e) = shared.notifier.modify(slot.fd(), id, interest) {
                debug!(conn_id = id, error = %e, "Re-arm failed");
                drop(slot);
                close_connection(shared, id);
            }
        }
        Err(e) => {
            debug!(conn_id = id, error = %e, "Write failed");
            drop(slot);
            close_connection(shared, id);
        }
    }
}

/// Run the processor and re-arm interest accordingly. Returns false when the
/// slot can no longer be re-armed and must close.
fn process_turn(shared: &Shared, id: u64, slot: &mut ConnectionSlot) -> bool {
    let interest = if slot.process() {
        slot.state = ConnState::ArmedWrite;
        Interest::WRITABLE | shared.conn_interest
    } else {
        slot.state = ConnState::ArmedRead;
        Interest::READABLE | shared.conn_interest
    };
    slot.set_interest(interest);

    match shared.notifier.modify(slot.fd(), id, interest) {
        Ok(()) => true,
        Err(e) => {
            debug!(conn_id = id, error = %e, "Re-arm failed");
            false
        }
    }
}

fn lookup(shared: &Shared, id: u64) -> Option<Arc<Mutex<ConnectionSlot>>> {
    shared.conns.read().unwrap().get(id as usize).cloned()
}

/// Remove a connection from the table, deregister it, and release its
/// resources. Idempotent: only the caller that wins the table removal does
/// any work; late tasks and timer callbacks resolve the id to nothing.
pub(crate) fn close_connection(shared: &Shared, id: u64) {
    let conn = {
        let mut table = shared.conns.write().unwrap();
        table.try_remove(id as usize)
    };
    let Some(conn) = conn else { return };

    let mut slot = conn.lock().unwrap();
    slot.state = ConnState::Closed;
    if let Err(e) = shared.notifier.deregister(slot.fd()) {
        debug!(conn_id = id, error = %e, "Deregister failed");
    }
    shared.active.fetch_sub(1, Ordering::Relaxed);
    debug!(conn_id = id, peer = %slot.peer(), "Connection closed");
    // The socket closes when the last Arc clone drops.
}

/// Over-limit connections get a fixed message and an immediate close; they
/// never enter the slot table.
fn reject(mut stream: TcpStream) {
    if let Err(e) = stream.write_all(BUSY_MESSAGE) {
        debug!(error = %e, "Failed to send busy message");
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
