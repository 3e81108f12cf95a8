//! Compact binary value codec.
//!
//! Every message exchanged with the server is built out of [`Value`]s encoded
//! in the MessagePack format. This module converts between the two with no
//! state of its own.
//!
//! # Binary Format
//!
//! - Integers use the smallest exact form: fixints, then 8/16/32/64-bit
//!   unsigned forms for non-negative values and signed forms for negative ones.
//! - Floats keep their width (`0xca` for 32-bit, `0xcb` for 64-bit).
//! - Strings and binaries share a length-prefix family but use distinct tags.
//! - Arrays and maps carry 4/16/32-bit element counts and recurse.
//! - Extensions carry a one-byte subtype. Subtype `2` holding 16 bytes is a
//!   UUID; anything else is kept as raw bytes.
//!
//! All multi-byte quantities are big-endian.
//!
//! # Example
//! ```rust
//! use tarn::codec::{Value, decode, encode};
//!
//! let bytes = encode(&Value::from(300)).unwrap();
//! assert_eq!(bytes, vec![0xcd, 0x01, 0x2c]);
//!
//! let (value, used) = decode(&bytes).unwrap();
//! assert_eq!(value, Value::from(300));
//! assert_eq!(used, 3);
//! ```
mod decode;
mod encode;
mod error;
mod value;

pub use decode::{Decoder, MAX_DEPTH, decode};
pub use encode::{encode, encode_into};
pub use error::CodecError;
pub use value::{EXT_UUID, Value};

pub(crate) mod marker {
    pub const FIXMAP: u8 = 0x80;
    pub const FIXARRAY: u8 = 0x90;
    pub const FIXSTR: u8 = 0xa0;
    pub const NIL: u8 = 0xc0;
    pub const FALSE: u8 = 0xc2;
    pub const TRUE: u8 = 0xc3;
    pub const BIN8: u8 = 0xc4;
    pub const BIN16: u8 = 0xc5;
    pub const BIN32: u8 = 0xc6;
    pub const EXT8: u8 = 0xc7;
    pub const EXT16: u8 = 0xc8;
    pub const EXT32: u8 = 0xc9;
    pub const F32: u8 = 0xca;
    pub const F64: u8 = 0xcb;
    pub const U8: u8 = 0xcc;
    pub const U16: u8 = 0xcd;
    pub const U32: u8 = 0xce;
    pub const U64: u8 = 0xcf;
    pub const I8: u8 = 0xd0;
    pub const I16: u8 = 0xd1;
    pub const I32: u8 = 0xd2;
    pub const I64: u8 = 0xd3;
    pub const FIXEXT1: u8 = 0xd4;
    pub const FIXEXT2: u8 = 0xd5;
    pub const FIXEXT4: u8 = 0xd6;
    pub const FIXEXT8: u8 = 0xd7;
    pub const FIXEXT16: u8 = 0xd8;
    pub const STR8: u8 = 0xd9;
    pub const STR16: u8 = 0xda;
    pub const STR32: u8 = 0xdb;
    pub const ARRAY16: u8 = 0xdc;
    pub const ARRAY32: u8 = 0xdd;
    pub const MAP16: u8 = 0xde;
    pub const MAP32: u8 = 0xdf;
}
