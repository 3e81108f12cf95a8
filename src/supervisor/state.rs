use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock},
    time::{Duration, Instant},
};

use log::debug;

use crate::{Error, error::ConnectionError};

/// Lifecycle of the client's single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Uninitialized,
    Reconnecting,
    Connecting,
    /// Reader loop started, writer not yet.
    Reading,
    /// Writer loop started, reader not yet.
    Writing,
    /// Both loops running.
    Alive,
    Closed,
}

impl ConnectionState {
    /// The transition table. Anything not listed here is rejected.
    pub const fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Uninitialized, Reconnecting)
                | (Reconnecting, Connecting)
                | (Connecting, Reading | Writing | Reconnecting)
                | (Reading, Alive | Reconnecting)
                | (Writing, Alive | Reconnecting)
                | (Alive, Reconnecting)
                | (Uninitialized | Reconnecting | Connecting | Reading | Writing | Alive, Closed)
        )
    }

    pub fn is_alive(self) -> bool {
        self == ConnectionState::Alive
    }

    /// States in which a socket is attached.
    pub fn has_connection(self) -> bool {
        matches!(
            self,
            ConnectionState::Reading | ConnectionState::Writing | ConnectionState::Alive
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which I/O loop reports that it has started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoLoop {
    Reader,
    Writer,
}

pub type StateListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;

struct Inner {
    state: ConnectionState,
    generation: u64,
    terminal: Option<Error>,
}

/// Mutex-guarded connection state shared by the supervisor, the engine and
/// observers.
///
/// Each attached connection gets a new generation number; reports from the
/// loops of an older generation are ignored, so a connection can move to
/// `Reconnecting` at most once.
pub struct StateCell {
    inner: Mutex<Inner>,
    changed: Condvar,
    listeners: RwLock<Vec<StateListener>>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ConnectionState::Uninitialized,
                generation: 0,
                terminal: Some(Error::Connection(ConnectionError::NotConnected)),
            }),
            changed: Condvar::new(),
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateCell")
            .field("state", &self.get())
            .field("generation", &self.generation())
            .finish()
    }
}

impl StateCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// The error new operations fail with, if the connection is not usable.
    pub fn terminal_error(&self) -> Option<Error> {
        self.lock().terminal.clone()
    }

    /// Registers a callback run after every transition.
    pub fn subscribe(&self, listener: StateListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Moves to `to` if the current state is `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let moved = {
            let mut inner = self.lock();
            if inner.state != from || !from.can_transition(to) {
                false
            } else {
                inner.state = to;
                true
            }
        };
        if moved {
            self.announce(from, to);
        }
        moved
    }

    /// Starts a new connection generation. Only valid while `Connecting`.
    pub fn begin_generation(&self) -> Option<u64> {
        let mut inner = self.lock();
        if inner.state != ConnectionState::Connecting {
            return None;
        }
        inner.generation += 1;
        Some(inner.generation)
    }

    /// Records that one I/O loop of `generation` is running.
    pub fn loop_started(&self, generation: u64, which: IoLoop) -> bool {
        let (from, to) = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return false;
            }
            let to = match (inner.state, which) {
                (ConnectionState::Connecting, IoLoop::Reader) => ConnectionState::Reading,
                (ConnectionState::Connecting, IoLoop::Writer) => ConnectionState::Writing,
                (ConnectionState::Writing, IoLoop::Reader)
                | (ConnectionState::Reading, IoLoop::Writer) => ConnectionState::Alive,
                _ => return false,
            };
            let from = inner.state;
            inner.state = to;
            if to.is_alive() {
                inner.terminal = None;
            }
            (from, to)
        };
        self.announce(from, to);
        true
    }

    /// Marks the connection of `generation` as failed with `error`.
    ///
    /// Returns `true` for exactly one caller per generation.
    pub fn fail(&self, generation: u64, error: Error) -> bool {
        let from = {
            let mut inner = self.lock();
            if inner.generation != generation
                || !inner.state.can_transition(ConnectionState::Reconnecting)
                || inner.state == ConnectionState::Uninitialized
            {
                return false;
            }
            let from = inner.state;
            inner.state = ConnectionState::Reconnecting;
            inner.terminal = Some(error);
            from
        };
        self.announce(from, ConnectionState::Reconnecting);
        true
    }

    /// Moves to `Closed`. Returns `false` if already closed.
    pub fn close(&self, reason: Error) -> bool {
        let from = {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Closed {
                return false;
            }
            let from = inner.state;
            inner.state = ConnectionState::Closed;
            inner.terminal = Some(reason);
            from
        };
        self.announce(from, ConnectionState::Closed);
        true
    }

    /// Blocks until `pred` holds or `timeout` elapses; returns the last state seen.
    pub fn wait_until<F>(&self, timeout: Option<Duration>, pred: F) -> ConnectionState
    where
        F: Fn(ConnectionState) -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.lock();
        while !pred(inner.state) {
            inner = match deadline {
                None => self
                    .changed
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.changed
                        .wait_timeout(inner, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        inner.state
    }

    fn announce(&self, from: ConnectionState, to: ConnectionState) {
        debug!("connection state {from} -> {to}");
        self.changed.notify_all();
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(to);
        }
    }
}
