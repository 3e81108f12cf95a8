use uuid::Uuid;

use super::{CodecError, EXT_UUID, Value, marker};

/// Deepest container nesting accepted from the wire.
pub const MAX_DEPTH: usize = 512;

/// Decodes one value from the front of `bytes`.
///
/// Returns the value and the number of bytes it occupied.
pub fn decode(bytes: &[u8]) -> Result<(Value, usize), CodecError> {
    let mut decoder = Decoder::new(bytes);
    let value = decoder.read_value()?;
    Ok((value, decoder.position()))
}

/// Cursor over a byte slice yielding consecutive values.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Reads the next value. On error the cursor position is unspecified.
    pub fn read_value(&mut self) -> Result<Value, CodecError> {
        self.value_at_depth(0)
    }

    fn value_at_depth(&mut self, depth: usize) -> Result<Value, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::DepthLimitExceeded(MAX_DEPTH));
        }

        let m = self.byte()?;
        let value = match m {
            0x00..=0x7f => Value::Integer(i128::from(m)),
            0x80..=0x8f => self.map(usize::from(m & 0x0f), depth)?,
            0x90..=0x9f => self.array(usize::from(m & 0x0f), depth)?,
            0xa0..=0xbf => self.string(usize::from(m & 0x1f))?,
            marker::NIL => Value::Nil,
            marker::FALSE => Value::Bool(false),
            marker::TRUE => Value::Bool(true),
            marker::BIN8 => {
                let len = usize::from(self.byte()?);
                Value::Binary(self.take(len)?.to_vec())
            }
            marker::BIN16 => {
                let len = usize::from(self.u16()?);
                Value::Binary(self.take(len)?.to_vec())
            }
            marker::BIN32 => {
                let len = self.u32()? as usize;
                Value::Binary(self.take(len)?.to_vec())
            }
            marker::EXT8 => {
                let len = usize::from(self.byte()?);
                self.ext(len)?
            }
            marker::EXT16 => {
                let len = usize::from(self.u16()?);
                self.ext(len)?
            }
            marker::EXT32 => {
                let len = self.u32()? as usize;
                self.ext(len)?
            }
            marker::F32 => Value::F32(f32::from_be_bytes(self.array_of()?)),
            marker::F64 => Value::F64(f64::from_be_bytes(self.array_of()?)),
            marker::U8 => Value::Integer(i128::from(self.byte()?)),
            marker::U16 => Value::Integer(i128::from(self.u16()?)),
            marker::U32 => Value::Integer(i128::from(self.u32()?)),
            marker::U64 => Value::Integer(i128::from(u64::from_be_bytes(self.array_of()?))),
            marker::I8 => Value::Integer(i128::from(self.byte()? as i8)),
            marker::I16 => Value::Integer(i128::from(i16::from_be_bytes(self.array_of()?))),
            marker::I32 => Value::Integer(i128::from(i32::from_be_bytes(self.array_of()?))),
            marker::I64 => Value::Integer(i128::from(i64::from_be_bytes(self.array_of()?))),
            marker::FIXEXT1 => self.ext(1)?,
            marker::FIXEXT2 => self.ext(2)?,
            marker::FIXEXT4 => self.ext(4)?,
            marker::FIXEXT8 => self.ext(8)?,
            marker::FIXEXT16 => self.ext(16)?,
            marker::STR8 => {
                let len = usize::from(self.byte()?);
                self.string(len)?
            }
            marker::STR16 => {
                let len = usize::from(self.u16()?);
                self.string(len)?
            }
            marker::STR32 => {
                let len = self.u32()? as usize;
                self.string(len)?
            }
            marker::ARRAY16 => {
                let len = usize::from(self.u16()?);
                self.array(len, depth)?
            }
            marker::ARRAY32 => {
                let len = self.u32()? as usize;
                self.array(len, depth)?
            }
            marker::MAP16 => {
                let len = usize::from(self.u16()?);
                self.map(len, depth)?
            }
            marker::MAP32 => {
                let len = self.u32()? as usize;
                self.map(len, depth)?
            }
            0xe0..=0xff => Value::Integer(i128::from(m as i8)),
            other => return Err(CodecError::InvalidMarker(other)),
        };
        Ok(value)
    }

    fn array(&mut self, len: usize, depth: usize) -> Result<Value, CodecError> {
        // every element takes at least one byte
        self.ensure(len)?;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(self.value_at_depth(depth + 1)?);
        }
        Ok(Value::Array(items))
    }

    fn map(&mut self, len: usize, depth: usize) -> Result<Value, CodecError> {
        self.ensure(len.saturating_mul(2))?;
        let mut entries = Vec::with_capacity(len);
        for _ in 0..len {
            let k = self.value_at_depth(depth + 1)?;
            let v = self.value_at_depth(depth + 1)?;
            entries.push((k, v));
        }
        Ok(Value::Map(entries))
    }

    fn string(&mut self, len: usize) -> Result<Value, CodecError> {
        let raw = self.take(len)?;
        let s = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
        Ok(Value::String(s.to_string()))
    }

    fn ext(&mut self, len: usize) -> Result<Value, CodecError> {
        let subtype = self.byte()? as i8;
        let data = self.take(len)?;
        if subtype == EXT_UUID {
            if let Ok(raw) = <[u8; 16]>::try_from(data) {
                return Ok(Value::Uuid(Uuid::from_bytes(raw)));
            }
        }
        Ok(Value::Ext(subtype, data.to_vec()))
    }

    fn ensure(&self, needed: usize) -> Result<(), CodecError> {
        if needed > self.remaining() {
            return Err(CodecError::Truncated {
                needed,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.ensure(len)?;
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn array_of<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let slice = self.take(N)?;
        let mut out = [0_u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_be_bytes(self.array_of()?))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.array_of()?))
    }
}
