//! Connection supervision.
//!
//! The [`Supervisor`] owns the reconnect loop. Whenever the shared
//! [`StateCell`] enters `Reconnecting` it opens a new socket to the next
//! address, performs the handshake and attaches the result to the
//! [`Engine`]. Failed attempts are retried after `reconnect_delay` until
//! `connect_retries` attempts have failed in a row, at which point the
//! client is closed with [`ConnectionError::Exhausted`].
mod address;
mod state;

use std::{
    sync::{Arc, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, warn};

use crate::{
    Error, Result,
    engine::Engine,
    error::ConnectionError,
    protocol::{ConnectOptions, Connection},
};

pub use address::{AddressSource, RoundRobinAddresses, SingleAddress};
pub use state::{ConnectionState, IoLoop, StateCell, StateListener};

/// How the supervisor opens connections.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub connect: ConnectOptions,
    /// Consecutive failed attempts before giving up; `None` retries forever.
    pub connect_retries: Option<u32>,
    pub reconnect_delay: Duration,
}

pub struct Supervisor {
    engine: Engine,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.engine.state().get())
            .finish()
    }
}

impl Supervisor {
    /// Moves the engine's state to `Reconnecting` and starts the reconnect loop.
    pub fn start(
        engine: Engine,
        addresses: Arc<dyn AddressSource>,
        config: SupervisorConfig,
    ) -> Result<Self> {
        let state = engine.state();
        if !state.transition(ConnectionState::Uninitialized, ConnectionState::Reconnecting) {
            return Err(ConnectionError::Closed(format!(
                "cannot start supervisor in state {}",
                state.get()
            ))
            .into());
        }

        let thread = thread::Builder::new()
            .name("tarn-supervisor".to_string())
            .spawn({
                let engine = engine.clone();
                move || run(engine, addresses, config)
            })?;

        Ok(Self {
            engine,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.engine.state().get()
    }

    /// Closes the client. Later calls have no effect.
    pub fn close(&self, reason: Error) -> bool {
        let closed = self.engine.close(reason);
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("supervisor thread panicked");
            }
        }
        closed
    }

    /// Blocks until the client is closed. Returns `false` on timeout.
    pub fn await_termination(&self, timeout: Option<Duration>) -> bool {
        self.engine
            .state()
            .wait_until(timeout, |s| s == ConnectionState::Closed)
            == ConnectionState::Closed
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.close(ConnectionError::Closed("client dropped".into()).into());
    }
}

fn run(engine: Engine, addresses: Arc<dyn AddressSource>, config: SupervisorConfig) {
    let state = Arc::clone(engine.state());
    loop {
        let current = state.wait_until(None, |s| {
            matches!(s, ConnectionState::Reconnecting | ConnectionState::Closed)
        });
        if current == ConnectionState::Closed {
            break;
        }
        if !state.transition(ConnectionState::Reconnecting, ConnectionState::Connecting) {
            continue;
        }
        if let Err(e) = connect(&engine, addresses.as_ref(), &config) {
            error!("giving up on reconnecting: {e}");
            engine.close(e);
            break;
        }
    }
    debug!("supervisor stopped");
}

/// Tries addresses until one attaches, the client closes, or the retry
/// limit is reached.
fn connect(engine: &Engine, addresses: &dyn AddressSource, config: &SupervisorConfig) -> Result<()> {
    let state = engine.state();
    let mut attempt = 0_u32;
    let mut last_error: Option<Error> = None;

    loop {
        if state.get() == ConnectionState::Closed {
            return Ok(());
        }
        if config.connect_retries.is_some_and(|limit| attempt >= limit) {
            return Err(ConnectionError::Exhausted {
                attempts: attempt,
                last: last_error.map(|e| e.to_string()).unwrap_or_default(),
            }
            .into());
        }

        let result = match addresses.next(attempt, last_error.as_ref()) {
            Some(address) => {
                debug!("connect attempt {attempt} to {address}");
                Connection::open(&address, &config.connect).and_then(|connection| {
                    let generation = state.begin_generation().ok_or_else(|| {
                        Error::from(ConnectionError::Closed("closed while connecting".into()))
                    })?;
                    engine.attach(generation, connection)
                })
            }
            None => Err(ConnectionError::NotConnected.into()),
        };

        match result {
            Ok(()) => {
                if attempt > 0 {
                    info!("reconnected after {attempt} failed attempts");
                }
                return Ok(());
            }
            Err(e) => {
                warn!("connect attempt {attempt} failed: {e}");
                last_error = Some(e);
                attempt += 1;
                state.wait_until(Some(config.reconnect_delay), |s| {
                    s == ConnectionState::Closed
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::{
        codec::Value,
        engine::EngineConfig,
        protocol::{Credentials, Request, consts::RequestType, scramble},
        testing::{MockServer, Reply, SALT, unused_address},
    };

    fn config(retries: Option<u32>) -> SupervisorConfig {
        SupervisorConfig {
            connect: ConnectOptions {
                connect_timeout: Duration::from_millis(500),
                credentials: None,
                max_frame_size: 1024 * 1024,
            },
            connect_retries: retries,
            reconnect_delay: Duration::from_millis(10),
        }
    }

    fn start(address: String, config: SupervisorConfig) -> (Engine, Supervisor) {
        let engine = Engine::new(EngineConfig::default(), StateCell::new());
        let supervisor =
            Supervisor::start(engine.clone(), Arc::new(SingleAddress(address)), config).unwrap();
        (engine, supervisor)
    }

    fn wait_alive(engine: &Engine) {
        let state = engine
            .state()
            .wait_until(Some(Duration::from_secs(5)), ConnectionState::is_alive);
        assert_eq!(state, ConnectionState::Alive);
    }

    #[test]
    fn connects_and_serves_requests() {
        let server = MockServer::start(|_| Reply::ok(Value::Nil));
        let (engine, supervisor) = start(server.address(), config(Some(3)));
        wait_alive(&engine);
        assert!(engine.execute(&Request::ping()).wait().is_ok());

        assert!(supervisor.close(ConnectionError::Closed("done".into()).into()));
        assert!(supervisor.await_termination(Some(Duration::from_secs(1))));
        assert!(!supervisor.close(ConnectionError::Closed("again".into()).into()));
    }

    #[test]
    fn reconnects_after_connection_loss() {
        let server = MockServer::start(|_| Reply::ok(Value::Nil));
        let (engine, supervisor) = start(server.address(), config(None));
        wait_alive(&engine);

        server.kill_connections();
        let deadline = Instant::now() + Duration::from_secs(5);
        while server.connection_count() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        wait_alive(&engine);
        assert_eq!(server.connection_count(), 2);
        assert!(engine.execute(&Request::ping()).wait().is_ok());
        supervisor.close(ConnectionError::Closed("done".into()).into());
    }

    #[test]
    fn exhausted_retries_close_the_client() {
        let (engine, supervisor) = start(unused_address(), config(Some(3)));
        assert!(supervisor.await_termination(Some(Duration::from_secs(5))));
        match engine.state().terminal_error() {
            Some(Error::Connection(ConnectionError::Exhausted { attempts, .. })) => {
                assert_eq!(attempts, 3)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn authenticates_with_credentials() {
        let server = MockServer::start(|request| {
            if request.code() == Some(RequestType::Auth.code()) {
                let expected = Value::Binary(scramble(&SALT[..20], "secret").to_vec());
                let sent = request
                    .body
                    .get(&crate::protocol::consts::key::TUPLE)
                    .and_then(Value::as_array)
                    .and_then(|t| t.get(1))
                    .cloned();
                if sent == Some(expected) {
                    Reply::ok(Value::Nil)
                } else {
                    Reply::error(47, "Incorrect password supplied for user 'admin'")
                }
            } else {
                Reply::ok(Value::Nil)
            }
        });

        let mut good = config(Some(1));
        good.connect.credentials = Some(Credentials {
            user: "admin".into(),
            password: "secret".into(),
        });
        let (engine, supervisor) = start(server.address(), good);
        wait_alive(&engine);
        supervisor.close(ConnectionError::Closed("done".into()).into());

        let mut bad = config(Some(1));
        bad.connect.credentials = Some(Credentials {
            user: "admin".into(),
            password: "wrong".into(),
        });
        let (engine, supervisor) = start(server.address(), bad);
        assert!(supervisor.await_termination(Some(Duration::from_secs(5))));
        match engine.state().terminal_error() {
            Some(Error::Connection(ConnectionError::Exhausted { last, .. })) => {
                assert!(last.contains("Incorrect password"), "{last}")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn close_while_connecting_stops_the_loop() {
        let (_engine, supervisor) = start(unused_address(), config(None));
        thread::sleep(Duration::from_millis(30));
        assert!(supervisor.close(ConnectionError::Closed("stop".into()).into()));
        assert_eq!(supervisor.state(), ConnectionState::Closed);
    }
}
