pub mod cli;
pub mod client;
pub mod cluster;
pub mod codec;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod schema;
pub mod supervisor;
mod thread;

#[cfg(test)]
mod testing;

pub use cli::{prompt, render};
pub use client::{Client, Ops};
pub use codec::Value;
pub use command::{Command, CommandError};
pub use config::{ClientConfig, ClusterConfig};
pub use engine::{Engine, ResponseHandle};
pub use error::{ConnectionError, Error, Result, ServerError, TimeoutKind};
pub use protocol::{Request, Response};
pub use supervisor::ConnectionState;
