//! Length-prefixed message framing.
//!
//! On the wire every message is `length ‖ header-map ‖ body-map`. The length
//! is a MessagePack unsigned integer counting the bytes of both maps. Requests
//! always use the fixed five-byte `0xce` form so that the prefix can be
//! written before the maps are known to fit.
use std::{
    collections::BTreeMap,
    io::{self, Read},
};

use crate::codec::{CodecError, Decoder, Value, encode_into, marker};

use super::consts::key;

/// Bytes in the fixed-width length prefix written by [`Message::encode`].
pub const LENGTH_PREFIX_SIZE: usize = 5;

/// Header and body of one protocol message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub header: BTreeMap<u8, Value>,
    pub body: BTreeMap<u8, Value>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, key: u8, value: impl Into<Value>) -> Self {
        self.header.insert(key, value.into());
        self
    }

    pub fn with_body(mut self, key: u8, value: impl Into<Value>) -> Self {
        self.body.insert(key, value.into());
        self
    }

    pub fn code(&self) -> Option<u32> {
        self.header
            .get(&key::CODE)
            .and_then(Value::as_u64)
            .and_then(|c| u32::try_from(c).ok())
    }

    pub fn sync(&self) -> Option<u64> {
        self.header.get(&key::SYNC).and_then(Value::as_u64)
    }

    pub fn schema_version(&self) -> Option<u64> {
        self.header.get(&key::SCHEMA_VERSION).and_then(Value::as_u64)
    }

    /// Encodes the message including its length prefix.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![marker::U32, 0, 0, 0, 0];
        encode_into(&int_map(&self.header), &mut out)?;
        encode_into(&int_map(&self.body), &mut out)?;

        let len = out.len() - LENGTH_PREFIX_SIZE;
        let len = u32::try_from(len).map_err(|_| CodecError::LengthOverflow {
            kind: "frame",
            len,
        })?;
        out[1..LENGTH_PREFIX_SIZE].copy_from_slice(&len.to_be_bytes());
        Ok(out)
    }

    /// Decodes the header and body of a frame whose length prefix was
    /// already consumed.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, CodecError> {
        let mut decoder = Decoder::new(payload);
        let header = expect_int_map(decoder.read_value()?)?;
        let body = if decoder.is_empty() {
            BTreeMap::new()
        } else {
            expect_int_map(decoder.read_value()?)?
        };

        if !decoder.is_empty() {
            return Err(CodecError::LengthMismatch {
                declared: payload.len(),
                consumed: decoder.position(),
            });
        }
        Ok(Self { header, body })
    }

    /// Decodes a complete frame, length prefix included.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), CodecError> {
        let mut decoder = Decoder::new(bytes);
        let len = decoder
            .read_value()?
            .as_u64()
            .ok_or(CodecError::UnexpectedType {
                expected: "unsigned frame length",
                found: "other".to_string(),
            })? as usize;
        let start = decoder.position();
        let available = bytes.len() - start;
        if available < len {
            return Err(CodecError::Truncated {
                needed: len,
                available,
            });
        }
        let message = Self::decode_payload(&bytes[start..start + len])?;
        Ok((message, start + len))
    }
}

/// Reads one frame from a blocking stream.
///
/// I/O failures surface as `Err(io)`; malformed frames as `Ok(Err(codec))`.
pub fn read_frame<R: Read>(
    reader: &mut R,
    max_len: usize,
) -> io::Result<Result<Message, CodecError>> {
    let mut first = [0_u8; 1];
    reader.read_exact(&mut first)?;
    let len = match first[0] {
        b @ 0x00..=0x7f => usize::from(b),
        marker::U8 => {
            let mut b = [0_u8; 1];
            reader.read_exact(&mut b)?;
            usize::from(b[0])
        }
        marker::U16 => {
            let mut b = [0_u8; 2];
            reader.read_exact(&mut b)?;
            usize::from(u16::from_be_bytes(b))
        }
        marker::U32 => {
            let mut b = [0_u8; 4];
            reader.read_exact(&mut b)?;
            u32::from_be_bytes(b) as usize
        }
        marker::U64 => {
            let mut b = [0_u8; 8];
            reader.read_exact(&mut b)?;
            match usize::try_from(u64::from_be_bytes(b)) {
                Ok(len) => len,
                Err(_) => {
                    return Ok(Err(CodecError::FrameTooLarge {
                        len: usize::MAX,
                        limit: max_len,
                    }));
                }
            }
        }
        other => return Ok(Err(CodecError::InvalidMarker(other))),
    };

    if len > max_len {
        return Ok(Err(CodecError::FrameTooLarge {
            len,
            limit: max_len,
        }));
    }

    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Message::decode_payload(&payload))
}

fn int_map(map: &BTreeMap<u8, Value>) -> Value {
    Value::Map(
        map.iter()
            .map(|(k, v)| (Value::from(*k), v.clone()))
            .collect(),
    )
}

fn expect_int_map(value: Value) -> Result<BTreeMap<u8, Value>, CodecError> {
    let Value::Map(entries) = value else {
        return Err(CodecError::UnexpectedType {
            expected: "map",
            found: value.to_string(),
        });
    };

    let mut out = BTreeMap::new();
    for (k, v) in entries {
        let key = k
            .as_u64()
            .and_then(|k| u8::try_from(k).ok())
            .ok_or_else(|| CodecError::UnexpectedType {
                expected: "small integer key",
                found: k.to_string(),
            })?;
        out.insert(key, v);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sample() -> Message {
        Message::new()
            .with_header(key::CODE, 1)
            .with_header(key::SYNC, 42)
            .with_body(key::SPACE_ID, 512)
            .with_body(key::KEY, Value::Array(vec![Value::from(1)]))
    }

    #[test]
    fn frame_prefix_counts_payload() {
        let bytes = sample().encode().unwrap();
        assert_eq!(bytes[0], 0xce);
        let len = u32::from_be_bytes(bytes[1..5].try_into().unwrap()) as usize;
        assert_eq!(len, bytes.len() - LENGTH_PREFIX_SIZE);
    }

    #[test]
    fn encode_then_read_frame() {
        let bytes = sample().encode().unwrap();
        let message = read_frame(&mut Cursor::new(bytes), 1024).unwrap().unwrap();
        assert_eq!(message, sample());
        assert_eq!(message.sync(), Some(42));
        assert_eq!(message.code(), Some(1));
    }

    #[test]
    fn body_may_be_absent() {
        // length 3: header {0: 0}
        let bytes = [0x03, 0x81, 0x00, 0x00];
        let (message, used) = Message::decode(&bytes).unwrap();
        assert_eq!(used, 4);
        assert_eq!(message.code(), Some(0));
        assert!(message.body.is_empty());
    }

    #[test]
    fn trailing_bytes_are_a_length_mismatch() {
        // declared 5 bytes: header, empty body, one stray byte
        let bytes = [0x05, 0x81, 0x00, 0x00, 0x80, 0xc0];
        assert_eq!(
            Message::decode(&bytes),
            Err(CodecError::LengthMismatch {
                declared: 5,
                consumed: 4
            })
        );
    }

    #[test]
    fn declared_length_beyond_input_is_truncated() {
        let bytes = [0x09, 0x81, 0x00, 0x00];
        assert!(matches!(
            Message::decode(&bytes),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn oversized_frame_is_rejected_before_reading() {
        let bytes = [0xce, 0x7f, 0xff, 0xff, 0xff];
        let res = read_frame(&mut Cursor::new(bytes), 1024).unwrap();
        assert!(matches!(res, Err(CodecError::FrameTooLarge { .. })));
    }

    #[test]
    fn non_map_header_is_rejected() {
        let bytes = [0x01, 0x01];
        assert!(matches!(
            Message::decode(&bytes),
            Err(CodecError::UnexpectedType { .. })
        ));
    }

    #[test]
    fn eof_is_an_io_error() {
        let err = read_frame(&mut Cursor::new(Vec::<u8>::new()), 1024).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
