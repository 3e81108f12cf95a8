use super::{CodecError, EXT_UUID, Value, marker};

/// Encodes a single value into a fresh buffer.
pub fn encode(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    encode_into(value, &mut out)?;
    Ok(out)
}

/// Appends the encoding of `value` to `out`.
///
/// On error `out` is truncated back to its original length, so a failed
/// encode never leaves a partial value behind.
pub fn encode_into(value: &Value, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let start = out.len();
    let res = write_value(value, out);
    if res.is_err() {
        out.truncate(start);
    }
    res
}

fn write_value(value: &Value, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match value {
        Value::Nil => out.push(marker::NIL),
        Value::Bool(false) => out.push(marker::FALSE),
        Value::Bool(true) => out.push(marker::TRUE),
        Value::Integer(i) => write_int(*i, out)?,
        Value::F32(f) => {
            out.push(marker::F32);
            out.extend_from_slice(&f.to_be_bytes());
        }
        Value::F64(f) => {
            out.push(marker::F64);
            out.extend_from_slice(&f.to_be_bytes());
        }
        Value::String(s) => {
            write_str_header(s.len(), out)?;
            out.extend_from_slice(s.as_bytes());
        }
        Value::Binary(b) => {
            write_bin_header(b.len(), out)?;
            out.extend_from_slice(b);
        }
        Value::Array(items) => {
            write_container_header(
                items.len(),
                "array",
                (marker::FIXARRAY, marker::ARRAY16, marker::ARRAY32),
                out,
            )?;
            for item in items {
                write_value(item, out)?;
            }
        }
        Value::Map(entries) => {
            write_container_header(
                entries.len(),
                "map",
                (marker::FIXMAP, marker::MAP16, marker::MAP32),
                out,
            )?;
            for (k, v) in entries {
                write_value(k, out)?;
                write_value(v, out)?;
            }
        }
        Value::Uuid(u) => write_ext(EXT_UUID, u.as_bytes(), out)?,
        Value::Ext(t, data) => write_ext(*t, data, out)?,
    }
    Ok(())
}

fn write_int(i: i128, out: &mut Vec<u8>) -> Result<(), CodecError> {
    if i < i128::from(i64::MIN) || i > i128::from(u64::MAX) {
        return Err(CodecError::IntegerOutOfRange(i));
    }

    if i >= 0 {
        let u = i as u64;
        if u <= 0x7f {
            out.push(u as u8);
        } else if u <= u64::from(u8::MAX) {
            out.push(marker::U8);
            out.push(u as u8);
        } else if u <= u64::from(u16::MAX) {
            out.push(marker::U16);
            out.extend_from_slice(&(u as u16).to_be_bytes());
        } else if u <= u64::from(u32::MAX) {
            out.push(marker::U32);
            out.extend_from_slice(&(u as u32).to_be_bytes());
        } else {
            out.push(marker::U64);
            out.extend_from_slice(&u.to_be_bytes());
        }
    } else {
        let s = i as i64;
        if s >= -32 {
            out.push(s as i8 as u8);
        } else if s >= i64::from(i8::MIN) {
            out.push(marker::I8);
            out.push(s as i8 as u8);
        } else if s >= i64::from(i16::MIN) {
            out.push(marker::I16);
            out.extend_from_slice(&(s as i16).to_be_bytes());
        } else if s >= i64::from(i32::MIN) {
            out.push(marker::I32);
            out.extend_from_slice(&(s as i32).to_be_bytes());
        } else {
            out.push(marker::I64);
            out.extend_from_slice(&s.to_be_bytes());
        }
    }
    Ok(())
}

fn write_str_header(len: usize, out: &mut Vec<u8>) -> Result<(), CodecError> {
    if len < 32 {
        out.push(marker::FIXSTR | len as u8);
    } else if len <= usize::from(u8::MAX) {
        out.push(marker::STR8);
        out.push(len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.push(marker::STR16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(marker::STR32);
        out.extend_from_slice(&len_u32(len, "string")?.to_be_bytes());
    }
    Ok(())
}

fn write_bin_header(len: usize, out: &mut Vec<u8>) -> Result<(), CodecError> {
    if len <= usize::from(u8::MAX) {
        out.push(marker::BIN8);
        out.push(len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.push(marker::BIN16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(marker::BIN32);
        out.extend_from_slice(&len_u32(len, "binary")?.to_be_bytes());
    }
    Ok(())
}

fn write_container_header(
    len: usize,
    kind: &'static str,
    (fix, m16, m32): (u8, u8, u8),
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    if len < 16 {
        out.push(fix | len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.push(m16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(m32);
        out.extend_from_slice(&len_u32(len, kind)?.to_be_bytes());
    }
    Ok(())
}

fn write_ext(subtype: i8, data: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
    match data.len() {
        1 => out.push(marker::FIXEXT1),
        2 => out.push(marker::FIXEXT2),
        4 => out.push(marker::FIXEXT4),
        8 => out.push(marker::FIXEXT8),
        16 => out.push(marker::FIXEXT16),
        len if len <= usize::from(u8::MAX) => {
            out.push(marker::EXT8);
            out.push(len as u8);
        }
        len if len <= usize::from(u16::MAX) => {
            out.push(marker::EXT16);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(marker::EXT32);
            out.extend_from_slice(&len_u32(len, "extension")?.to_be_bytes());
        }
    }
    out.push(subtype as u8);
    out.extend_from_slice(data);
    Ok(())
}

fn len_u32(len: usize, kind: &'static str) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::LengthOverflow { kind, len })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint16_scenario() {
        assert_eq!(encode(&Value::from(300)).unwrap(), vec![0xcd, 0x01, 0x2c]);
    }

    #[test]
    fn smallest_integer_forms() {
        let cases: Vec<(Value, Vec<u8>)> = vec![
            (Value::from(0), vec![0x00]),
            (Value::from(127), vec![0x7f]),
            (Value::from(128), vec![0xcc, 0x80]),
            (Value::from(-1), vec![0xff]),
            (Value::from(-32), vec![0xe0]),
            (Value::from(-33), vec![0xd0, 0xdf]),
            (Value::from(-129), vec![0xd1, 0xff, 0x7f]),
            (Value::from(65_536), vec![0xce, 0x00, 0x01, 0x00, 0x00]),
            (
                Value::from(u64::MAX),
                vec![0xcf, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff],
            ),
            (
                Value::from(i64::MIN),
                vec![0xd3, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
            ),
        ];

        for (value, expected) in cases {
            assert_eq!(encode(&value).unwrap(), expected, "encoding {value}");
        }
    }

    #[test]
    fn integer_beyond_u64_fails() {
        let too_big = i128::from(u64::MAX) + 1;
        assert_eq!(
            encode(&Value::Integer(too_big)),
            Err(CodecError::IntegerOutOfRange(too_big))
        );

        let too_small = i128::from(i64::MIN) - 1;
        assert!(encode(&Value::Integer(too_small)).is_err());
    }

    #[test]
    fn failed_encode_leaves_buffer_untouched() {
        let mut out = vec![0xaa];
        let value = Value::Array(vec![Value::from(1), Value::Integer(i128::MAX)]);
        assert!(encode_into(&value, &mut out).is_err());
        assert_eq!(out, vec![0xaa]);
    }

    #[test]
    fn string_and_binary_tags_differ() {
        assert_eq!(encode(&Value::from("ab")).unwrap(), vec![0xa2, b'a', b'b']);
        assert_eq!(
            encode(&Value::Binary(b"ab".to_vec())).unwrap(),
            vec![0xc4, 0x02, b'a', b'b']
        );

        let long = "x".repeat(40);
        assert_eq!(&encode(&Value::from(long)).unwrap()[..2], &[0xd9, 40]);
    }

    #[test]
    fn container_headers() {
        let small = Value::Array(vec![Value::Nil; 3]);
        assert_eq!(encode(&small).unwrap()[0], 0x93);

        let large = Value::Array(vec![Value::Nil; 16]);
        assert_eq!(&encode(&large).unwrap()[..3], &[0xdc, 0x00, 0x10]);

        let map = Value::Map(vec![(Value::from(1), Value::from(true))]);
        assert_eq!(encode(&map).unwrap(), vec![0x81, 0x01, 0xc3]);
    }

    #[test]
    fn uuid_uses_fixext16() {
        let id = uuid::Uuid::from_u128(0x0102_0304_0506_0708_090a_0b0c_0d0e_0f10);
        let bytes = encode(&Value::Uuid(id)).unwrap();
        assert_eq!(bytes[0], 0xd8);
        assert_eq!(bytes[1], EXT_UUID as u8);
        assert_eq!(&bytes[2..], id.as_bytes());
    }
}
