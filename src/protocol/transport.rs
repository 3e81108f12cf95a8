use std::{
    io::{BufReader, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::{debug, info};

use crate::{
    Error, Result,
    codec::CodecError,
    error::ConnectionError,
};

use super::{
    GREETING_SIZE, Greeting, HandshakeError, Message, Request, Response, ToWireMessage,
    consts::key, frame::read_frame, greeting::AUTH_MECHANISM,
};

/// Reads and writes whole frames over any byte stream.
pub struct FrameTransport<T: Read + Write> {
    stream: T,
    max_frame_size: usize,
}

impl<T: Read + Write> FrameTransport<T> {
    pub fn new(stream: T, max_frame_size: usize) -> Self {
        Self {
            stream,
            max_frame_size,
        }
    }

    pub fn write_message(&mut self, message: &Message) -> Result<()> {
        let bytes = message.encode()?;
        self.stream.write_all(&bytes)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Reads one frame. A malformed frame is a protocol violation for the
    /// whole connection.
    pub fn read_message(&mut self) -> Result<Message> {
        read_frame(&mut self.stream, self.max_frame_size)?
            .map_err(|e| Error::Connection(protocol_violation(e)))
    }

    pub fn read_greeting(&mut self) -> Result<Greeting> {
        let mut raw = [0_u8; GREETING_SIZE];
        self.stream.read_exact(&mut raw)?;
        Ok(Greeting::parse(&raw)?)
    }

    pub fn into_inner(self) -> T {
        self.stream
    }
}

pub(crate) fn protocol_violation(e: CodecError) -> ConnectionError {
    ConnectionError::Protocol(e.to_string())
}

/// Credentials used to authenticate right after the greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// Settings for opening one socket.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub credentials: Option<Credentials>,
    pub max_frame_size: usize,
}

/// A socket that has passed the handshake and, when configured, authentication.
pub struct Connection {
    address: String,
    greeting: Greeting,
    transport: FrameTransport<TcpStream>,
}

impl Connection {
    /// Connects to `address`, reads the greeting and authenticates.
    ///
    /// The connect timeout also bounds each handshake read.
    pub fn open(address: &str, options: &ConnectOptions) -> Result<Self> {
        let stream = connect(address, options.connect_timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(options.connect_timeout))?;

        let mut transport = FrameTransport::new(stream, options.max_frame_size);
        let greeting = transport.read_greeting()?;
        debug!("greeting from {address}: {}", greeting.banner);

        let mut conn = Self {
            address: address.to_string(),
            greeting,
            transport,
        };
        if let Some(credentials) = &options.credentials {
            conn.authenticate(credentials)?;
        }

        conn.transport.stream.set_read_timeout(None)?;
        info!("connected to {address}");
        Ok(conn)
    }

    fn authenticate(&mut self, credentials: &Credentials) -> Result<()> {
        let scramble = self.greeting.scramble(&credentials.password);
        let request = Request::auth(&credentials.user, AUTH_MECHANISM, &scramble);
        let message = request.to_wire_message(0)?.with_header(key::SYNC, 0);
        self.transport.write_message(&message)?;

        let reply = self.transport.read_message()?;
        let (_, result) = Response::from_message(reply, Some(request.request_type()))?;
        match result {
            Ok(_) => {
                debug!("authenticated as {}", credentials.user);
                Ok(())
            }
            Err(Error::Server(e)) => Err(HandshakeError::AuthFailed {
                code: e.code,
                message: e.message,
            }
            .into()),
            Err(e) => Err(e),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn greeting(&self) -> &Greeting {
        &self.greeting
    }

    /// Splits the socket into the halves driven by the reader and writer loops.
    pub fn split(self) -> Result<(BufReader<TcpStream>, TcpStream)> {
        let writer = self.transport.into_inner();
        let reader = writer.try_clone()?;
        Ok((BufReader::new(reader), writer))
    }
}

fn connect(address: &str, timeout: Duration) -> Result<TcpStream> {
    let mut last = None;
    for addr in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(match last {
        Some(e) => e.into(),
        None => ConnectionError::Protocol(format!("{address} resolved to no addresses")).into(),
    })
}

/// Closes both directions so that blocked readers and writers return.
pub(crate) fn shutdown(stream: &TcpStream) {
    if let Err(e) = stream.shutdown(Shutdown::Both) {
        debug!("socket shutdown: {e}");
    }
}
