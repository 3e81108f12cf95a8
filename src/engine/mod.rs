//! Request multiplexer.
//!
//! The [`Engine`] pipelines any number of concurrent operations over the one
//! connection attached by the supervisor. Every operation gets a fresh sync
//! id and is parked in a correlation table until its response arrives, its
//! deadline passes, or the connection dies.
//!
//! # Write path
//!
//! Encoded messages are appended to a bounded shared buffer which a writer
//! thread drains with one socket write per drain. A message larger than
//! `shared_buffer_size * direct_write_factor` skips the buffer and is written
//! directly under the same socket lock, so it neither waits for room nor
//! shares a batch.
//!
//! # Read path
//!
//! A reader thread decodes one frame at a time and completes the operation
//! registered under the frame's sync id. Frames for unknown ids belong to
//! operations that already timed out and are dropped.
mod buffer;
mod pending;
mod staged;
mod timer;

use std::{
    io::{self, BufReader, Write},
    net::TcpStream,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use log::{debug, error, info, trace, warn};

use crate::{
    Error, Result,
    error::{ConnectionError, TimeoutKind},
    protocol::{
        Connection, Message, Response, ToWireMessage, consts::key, protocol_violation,
        read_frame, shutdown,
    },
    supervisor::{ConnectionState, IoLoop, StateCell},
};

use buffer::OutboundBuffer;
use pending::PendingOperation;

pub(crate) use pending::ResultCell;
pub(crate) use timer::Timer;

pub use pending::{Completion, ResponseHandle};
pub use staged::{Stage, Staged};

pub const DEFAULT_SHARED_BUFFER_SIZE: usize = 8 * 1024 * 1024;
pub const DEFAULT_DIRECT_WRITE_FACTOR: f64 = 0.5;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

/// Tuning knobs of one engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default deadline for operations submitted without one.
    pub operation_timeout: Option<Duration>,
    /// How long a producer may wait for room in the shared buffer.
    pub write_timeout: Duration,
    pub shared_buffer_size: usize,
    pub direct_write_factor: f64,
    pub max_frame_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Some(Duration::from_secs(3)),
            write_timeout: Duration::from_secs(1),
            shared_buffer_size: DEFAULT_SHARED_BUFFER_SIZE,
            direct_write_factor: DEFAULT_DIRECT_WRITE_FACTOR,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

struct Socket {
    generation: u64,
    address: String,
    stream: TcpStream,
}

struct Core {
    config: EngineConfig,
    state: Arc<StateCell>,
    next_sync: AtomicU64,
    pending: DashMap<u64, PendingOperation>,
    outbound: OutboundBuffer,
    /// Write half of the attached socket; the lock also serializes writes.
    socket: Mutex<Option<Socket>>,
    schema_version: AtomicU64,
    timer: Timer,
    /// Serializes attaching, failing and closing connections.
    lifecycle: Mutex<()>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a multiplexer. Clones share the same engine.
#[derive(Clone)]
pub struct Engine {
    core: Arc<Core>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.core.state.get())
            .field("pending", &self.core.pending.len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Engine {
    pub fn new(config: EngineConfig, state: Arc<StateCell>) -> Self {
        let core = Arc::new_cyclic(|weak: &Weak<Core>| {
            let weak = weak.clone();
            let timer = Timer::start(
                "tarn-timer",
                Box::new(move |id| {
                    if let Some(core) = weak.upgrade() {
                        core.expire(id);
                    }
                }),
            );
            Core {
                outbound: OutboundBuffer::new(
                    config.shared_buffer_size,
                    config.direct_write_factor,
                ),
                config,
                state,
                next_sync: AtomicU64::new(1),
                pending: DashMap::new(),
                socket: Mutex::new(None),
                schema_version: AtomicU64::new(0),
                timer,
                lifecycle: Mutex::new(()),
                loops: Mutex::new(Vec::new()),
            }
        });
        Self { core }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn state(&self) -> &Arc<StateCell> {
        &self.core.state
    }

    /// Submits `request` with the default operation timeout.
    pub fn execute(&self, request: &dyn ToWireMessage) -> ResponseHandle {
        self.execute_with_timeout(request, self.core.config.operation_timeout)
    }

    pub fn execute_with_timeout(
        &self,
        request: &dyn ToWireMessage,
        timeout: Option<Duration>,
    ) -> ResponseHandle {
        let cell = ResultCell::new();
        let id = self.submit(request, timeout, cell.completion());
        ResponseHandle::new(id, cell)
    }

    /// Submits `request` and arranges for `completion` to run exactly once
    /// with its outcome. Returns the sync id.
    ///
    /// The completion may run on the calling thread (immediate failures), the
    /// reader thread, the timer thread or whichever thread tears the
    /// connection down.
    pub fn submit(
        &self,
        request: &dyn ToWireMessage,
        timeout: Option<Duration>,
        completion: Completion,
    ) -> u64 {
        let core = &self.core;
        let id = core.next_sync.fetch_add(1, Ordering::Relaxed);

        if let Some(e) = core.state.terminal_error() {
            trace!("sync {id}: failing fast, connection unusable");
            completion(Err(e));
            return id;
        }

        let schema_version = core.schema_version.load(Ordering::Acquire);
        let bytes = match encode(request, id, schema_version) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("sync {id}: encode failed: {e}");
                completion(Err(e));
                return id;
            }
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        core.pending.insert(
            id,
            PendingOperation {
                request_type: request.request_type(),
                deadline,
                created_schema_version: schema_version,
                completion,
            },
        );
        if let Some(deadline) = deadline {
            core.timer.schedule(id, deadline);
        }

        // the connection may have died between the first check and registration
        if let Some(e) = core.state.terminal_error() {
            core.complete(id, Err(e));
            return id;
        }

        let written = if core.outbound.is_direct(bytes.len()) {
            trace!("sync {id}: direct write of {} bytes", bytes.len());
            core.write_direct(&bytes)
        } else {
            core.outbound.push(&bytes, core.config.write_timeout)
        };
        if let Err(e) = written {
            core.complete(id, Err(e));
        }
        id
    }

    /// Operations registered and not yet completed.
    pub fn pending_count(&self) -> usize {
        self.core.pending.len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.core.pending.contains_key(&id)
    }

    /// Schema version the server reported most recently.
    pub fn schema_version(&self) -> u64 {
        self.core.schema_version.load(Ordering::Acquire)
    }

    /// Address of the attached connection.
    pub fn address(&self) -> Option<String> {
        lock(&self.core.socket).as_ref().map(|s| s.address.clone())
    }

    /// Schema version current when operation `id` was submitted.
    pub fn created_schema_version(&self, id: u64) -> Option<u64> {
        self.core
            .pending
            .get(&id)
            .map(|op| op.created_schema_version)
    }

    /// Starts the reader and writer loops over a freshly opened connection.
    ///
    /// `generation` must come from [`StateCell::begin_generation`] and the
    /// state must still be `Connecting`.
    pub(crate) fn attach(&self, generation: u64, connection: Connection) -> Result<()> {
        let core = &self.core;
        core.join_loops();

        let _lifecycle = lock(&core.lifecycle);
        if core.state.generation() != generation || core.state.get() != ConnectionState::Connecting
        {
            return Err(ConnectionError::Closed("connection superseded".into()).into());
        }

        let address = connection.address().to_string();
        let (reader, writer) = connection.split()?;
        core.outbound.open();
        *lock(&core.socket) = Some(Socket {
            generation,
            address: address.clone(),
            stream: writer,
        });

        let spawned = spawn_loop("tarn-writer", {
            let core = Arc::clone(core);
            move || core.write_loop(generation)
        })
        .and_then(|writer| {
            lock(&core.loops).push(writer);
            spawn_loop("tarn-reader", {
                let core = Arc::clone(core);
                move || core.read_loop(generation, reader)
            })
        });
        match spawned {
            Ok(reader) => {
                lock(&core.loops).push(reader);
                info!("attached connection to {address} (generation {generation})");
                Ok(())
            }
            Err(e) => {
                error!("failed to start i/o loops: {e}");
                core.detach();
                Err(e.into())
            }
        }
    }

    /// Tears down the live connection so that the supervisor reconnects.
    ///
    /// Returns `false` if no connection is attached.
    pub fn force_reconnect(&self) -> bool {
        let generation = lock(&self.core.socket).as_ref().map(|s| s.generation);
        match generation {
            Some(generation) => {
                let reason = io::Error::new(io::ErrorKind::ConnectionAborted, "reconnect requested");
                self.core.fail_connection(generation, reason.into())
            }
            None => false,
        }
    }

    /// Fails everything and stops for good. Returns `false` if already closed.
    pub fn close(&self, reason: Error) -> bool {
        let core = &self.core;
        let closed = {
            let _lifecycle = lock(&core.lifecycle);
            if core.state.close(reason.clone()) {
                core.teardown(&reason);
                true
            } else {
                false
            }
        };
        if closed {
            info!("engine closed: {reason}");
            core.join_loops();
            core.timer.stop();
        }
        closed
    }
}

fn encode(request: &dyn ToWireMessage, sync: u64, schema_version: u64) -> Result<Vec<u8>> {
    let message = request
        .to_wire_message(schema_version)?
        .with_header(key::SYNC, sync);
    Ok(message.encode()?)
}

fn spawn_loop<F>(name: &str, f: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(f)
}

impl Core {
    /// Removes operation `id` and hands it `result`. No-op if it already completed.
    fn complete(&self, id: u64, result: Result<Response>) {
        if let Some((_, op)) = self.pending.remove(&id) {
            if let Some(deadline) = op.deadline {
                self.timer.cancel(id, deadline);
            }
            (op.completion)(result);
        }
    }

    fn expire(&self, id: u64) {
        if let Some((_, op)) = self.pending.remove(&id) {
            debug!("sync {id}: timed out");
            (op.completion)(Err(Error::Timeout(TimeoutKind::Operation)));
        }
    }

    fn write_direct(&self, bytes: &[u8]) -> Result<()> {
        let mut socket = lock(&self.socket);
        let Some(current) = socket.as_mut() else {
            return Err(ConnectionError::NotConnected.into());
        };
        let generation = current.generation;
        match current.stream.write_all(bytes) {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(socket);
                let e = Error::from(e);
                self.fail_connection(generation, e.clone());
                Err(e)
            }
        }
    }

    /// Writes one drained batch on the socket of `generation`.
    fn write_batch(&self, generation: u64, batch: &[u8]) -> Result<()> {
        let mut socket = lock(&self.socket);
        match socket.as_mut() {
            Some(current) if current.generation == generation => {
                current.stream.write_all(batch)?;
                Ok(())
            }
            _ => Err(ConnectionError::NotConnected.into()),
        }
    }

    fn write_loop(self: Arc<Self>, generation: u64) {
        self.state.loop_started(generation, IoLoop::Writer);
        let mut batch = Vec::with_capacity(self.outbound.capacity());
        while self.outbound.take(&mut batch) {
            let written = self.write_batch(generation, &batch);
            trace!("wrote batch of {} bytes", batch.len());
            batch.clear();
            if let Err(e) = written {
                self.fail_connection(generation, e);
                break;
            }
        }
        debug!("writer loop {generation} stopped");
    }

    fn read_loop(self: Arc<Self>, generation: u64, mut reader: BufReader<TcpStream>) {
        self.state.loop_started(generation, IoLoop::Reader);
        loop {
            let failure = match read_frame(&mut reader, self.config.max_frame_size) {
                Ok(Ok(message)) => match self.dispatch(message) {
                    Ok(()) => continue,
                    Err(e) => Error::Connection(e),
                },
                Ok(Err(e)) => Error::Connection(protocol_violation(e)),
                Err(e) => Error::from(e),
            };
            self.fail_connection(generation, failure);
            break;
        }
        debug!("reader loop {generation} stopped");
    }

    /// Routes one incoming frame to its pending operation.
    fn dispatch(&self, message: Message) -> std::result::Result<(), ConnectionError> {
        if let Some(version) = message.schema_version() {
            self.schema_version.fetch_max(version, Ordering::AcqRel);
        }
        let sync = message
            .sync()
            .ok_or_else(|| ConnectionError::Protocol("response without sync id".into()))?;

        let Some((_, op)) = self.pending.remove(&sync) else {
            debug!("dropping response for unknown sync {sync}");
            return Ok(());
        };
        if let Some(deadline) = op.deadline {
            self.timer.cancel(sync, deadline);
        }
        match Response::from_message(message, Some(op.request_type)) {
            Ok((_, result)) => {
                (op.completion)(result);
                Ok(())
            }
            Err(e) => {
                (op.completion)(Err(e.clone().into()));
                Err(e)
            }
        }
    }

    /// Fails the connection of `generation`. Only the first report per
    /// generation has any effect.
    fn fail_connection(&self, generation: u64, error: Error) -> bool {
        let _lifecycle = lock(&self.lifecycle);
        if !self.state.fail(generation, error.clone()) {
            return false;
        }
        warn!("connection lost: {error}");
        self.teardown(&error);
        true
    }

    fn teardown(&self, error: &Error) {
        self.detach();
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            debug!("failing {} pending operations", ids.len());
        }
        for id in ids {
            self.complete(id, Err(error.clone()));
        }
    }

    /// Drops buffered bytes and shuts the socket so both loops return.
    fn detach(&self) {
        self.outbound.close();
        if let Some(socket) = lock(&self.socket).take() {
            shutdown(&socket.stream);
        }
    }

    fn join_loops(&self) {
        let handles: Vec<_> = lock(&self.loops).drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("i/o loop panicked");
            }
        }
    }
}
