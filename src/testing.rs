//! In-process server speaking just enough of the protocol for tests.
use std::{
    io::{self, BufReader, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, warn};

use crate::{
    codec::Value,
    engine::{Engine, EngineConfig},
    protocol::{
        ConnectOptions, Connection, Message, consts::key, read_frame, render_greeting,
    },
    supervisor::{ConnectionState, StateCell},
    thread::ThreadPool,
};

pub(crate) const SALT: [u8; 32] = [7; 32];
const VERSION: &str = "2.11.0";
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// What the server does with one request.
pub(crate) enum Reply {
    /// Sent back with the request's sync id.
    Message(Message),
    Delayed(Duration, Box<Reply>),
    Silent,
    /// Drops the connection.
    Hangup,
}

impl Reply {
    pub fn ok(data: impl Into<Value>) -> Self {
        Reply::Message(
            Message::new()
                .with_header(key::CODE, 0)
                .with_body(key::DATA, data),
        )
    }

    pub fn error(code: u32, message: &str) -> Self {
        Reply::Message(
            Message::new()
                .with_header(key::CODE, 0x8000 | code)
                .with_body(key::ERROR_24, message),
        )
    }

    pub fn with_schema_version(self, version: u64) -> Self {
        match self {
            Reply::Message(m) => Reply::Message(m.with_header(key::SCHEMA_VERSION, version)),
            Reply::Delayed(d, reply) => {
                Reply::Delayed(d, Box::new(reply.with_schema_version(version)))
            }
            other => other,
        }
    }
}

type Handler = dyn Fn(&Message) -> Reply + Send + Sync + 'static;

struct Shared {
    handler: Box<Handler>,
    running: Mutex<bool>,
    connections: Mutex<Vec<TcpStream>>,
    accepted: AtomicUsize,
    requests: AtomicUsize,
}

pub(crate) struct MockServer {
    address: SocketAddr,
    shared: Arc<Shared>,
    acceptor: Option<thread::JoinHandle<()>>,
}

impl MockServer {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&Message) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let address = listener.local_addr().expect("mock server address");
        let shared = Arc::new(Shared {
            handler: Box::new(handler),
            running: Mutex::new(true),
            connections: Mutex::new(Vec::new()),
            accepted: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
        });

        let acceptor = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || listen(listener, shared))
        };
        Self {
            address,
            shared,
            acceptor: Some(acceptor),
        }
    }

    pub fn address(&self) -> String {
        self.address.to_string()
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    /// Shuts down every open connection; the listener keeps accepting.
    pub fn kill_connections(&self) {
        kill(&self.shared);
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        *self
            .shared
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = false;
        kill(&self.shared);
        // wake the acceptor
        let _ = TcpStream::connect(self.address);
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.join();
        }
    }
}

fn kill(shared: &Shared) {
    let connections: Vec<_> = shared
        .connections
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .drain(..)
        .collect();
    for stream in connections {
        let _ = stream.shutdown(Shutdown::Both);
    }
}

fn listen(listener: TcpListener, shared: Arc<Shared>) {
    let pool = ThreadPool::new("mock-conn", 8);
    for stream in listener.incoming() {
        if !*shared.running.lock().unwrap_or_else(PoisonError::into_inner) {
            break;
        }
        match stream {
            Ok(stream) => {
                match stream.try_clone() {
                    Ok(clone) => shared
                        .connections
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(clone),
                    Err(e) => warn!("mock server: {e}"),
                }
                shared.accepted.fetch_add(1, Ordering::SeqCst);
                let handle = Arc::clone(&shared);
                pool.execute(move || {
                    if let Err(e) = handle_connection(stream, handle) {
                        debug!("mock connection ended: {e}");
                    }
                });
            }
            Err(e) => warn!("broken connection: {e:?}"),
        }
    }
}

fn handle_connection(stream: TcpStream, shared: Arc<Shared>) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    writer.write_all(&render_greeting(VERSION, &SALT))?;
    let writer = Arc::new(Mutex::new(writer));
    let mut reader = BufReader::new(stream);

    let result = loop {
        let request = match read_frame(&mut reader, MAX_FRAME) {
            Ok(Ok(request)) => request,
            Ok(Err(e)) => break Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) => break Err(e),
        };
        shared.requests.fetch_add(1, Ordering::SeqCst);
        let sync = request.sync().unwrap_or_default();
        if let Err(e) = respond(&writer, sync, (shared.handler)(&request)) {
            break Err(e);
        }
    };

    let _ = reader.get_ref().shutdown(Shutdown::Both);
    result
}

fn respond(writer: &Arc<Mutex<TcpStream>>, sync: u64, reply: Reply) -> io::Result<()> {
    match reply {
        Reply::Message(message) => {
            let bytes = message
                .with_header(key::SYNC, sync)
                .encode()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            writer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .write_all(&bytes)
        }
        Reply::Delayed(delay, reply) => {
            let writer = Arc::clone(writer);
            thread::spawn(move || {
                thread::sleep(delay);
                let _ = respond(&writer, sync, *reply);
            });
            Ok(())
        }
        Reply::Silent => Ok(()),
        Reply::Hangup => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "hangup")),
    }
}

/// An engine with a live connection to `server`, bypassing the supervisor.
pub(crate) fn attached_engine(server: &MockServer, config: EngineConfig) -> Engine {
    let options = ConnectOptions {
        connect_timeout: Duration::from_secs(2),
        credentials: None,
        max_frame_size: config.max_frame_size,
    };
    let state = StateCell::new();
    let engine = Engine::new(config, Arc::clone(&state));
    assert!(state.transition(ConnectionState::Uninitialized, ConnectionState::Reconnecting));
    assert!(state.transition(ConnectionState::Reconnecting, ConnectionState::Connecting));
    let generation = state.begin_generation().expect("connecting");

    let connection = Connection::open(&server.address(), &options).expect("connect to mock");
    engine.attach(generation, connection).expect("attach");
    let state = state.wait_until(Some(Duration::from_secs(2)), ConnectionState::is_alive);
    assert_eq!(state, ConnectionState::Alive);
    engine
}

/// An address nothing listens on.
pub(crate) fn unused_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = listener.local_addr().expect("address");
    drop(listener);
    address.to_string()
}
