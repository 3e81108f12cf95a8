//! Client-server communication protocol.
//!
//! This module defines how the client talks to an iproto server: the greeting
//! exchanged when a socket opens, the authentication proof derived from it,
//! the framing of every later message, and the logical requests and responses
//! carried inside those frames.
//!
//! # Overview
//!
//! On connect the server sends a fixed 128-byte greeting. The first line names
//! the product and version; the second carries a base64 salt. If credentials
//! are configured the client answers with an `AUTH` request holding a
//! chap-sha1 scramble of the password and that salt.
//!
//! After the handshake the connection is symmetric and pipelined: the client
//! may write any number of requests before reading replies, and the server may
//! answer in any order. Each request carries a client-chosen sync id which the
//! server echoes back.
//!
//! # Binary Format
//!
//! - Each message is `length ‖ header-map ‖ body-map`, encoded with the
//!   [`codec`](crate::codec).
//! - Header keys: request or status code, sync id, schema version.
//! - Body keys depend on the request: space and index ids, key, tuple, update
//!   operations, function name, expression, SQL text and binds.
//! - A status of `0` is success; `0x8000 | code` reports a server error.
//!
//! # Key Components
//!
//! - [`Greeting`] and [`scramble`]: handshake parsing and authentication.
//! - [`Message`]: one frame's header and body.
//! - [`Request`] / [`ToWireMessage`]: logical requests and how they become frames.
//! - [`Response`]: a successful reply and its SQL interpretation.
//! - [`Connection`] / [`FrameTransport`]: frames over a byte stream.
//!
//! # See Also
//!
//! - [`engine`](crate::engine): Pipelines requests over a [`Connection`].
pub mod consts;
mod frame;
mod greeting;
mod request;
mod response;
mod transport;

pub use frame::{LENGTH_PREFIX_SIZE, Message, read_frame};
pub use greeting::{
    GREETING_SIZE, Greeting, HandshakeError, PRODUCT_MARKER, SCRAMBLE_SIZE, scramble,
};
pub use request::{IndexRef, Request, SpaceRef, ToWireMessage};
pub use response::{Column, Response, SqlResult};
pub use transport::{ConnectOptions, Connection, Credentials, FrameTransport};

pub(crate) use transport::{protocol_violation, shutdown};

#[cfg(test)]
pub(crate) use greeting::render_greeting;
