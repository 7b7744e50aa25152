//! Tuple wire format for statement parameters.
//!
//! A tuple is a header followed by one body per value. The header holds the
//! value count (one byte for [`TupleFormat::Params`], a little-endian `u32`
//! for [`TupleFormat::Params32`]) and one type code per value, zero-padded to
//! an 8-byte boundary. Every body is padded to 8 bytes as well:
//!
//! | Type | Body |
//! |------|------|
//! | INTEGER | `i64` LE |
//! | FLOAT | `f64` LE |
//! | TEXT, ISO8601 | UTF-8 bytes, NUL terminator |
//! | BLOB | `u64` LE length, bytes |
//! | NULL | 8 zero bytes |
//! | BOOLEAN | `u64` LE, non-zero is true |
//! | UNIXTIME | `i64` LE |

use qlite_error::{QliteError, Result};
use qlite_types::{Value, ValueType};
use tracing::trace;

/// Alignment of the header and of every value body.
pub const TUPLE_WORD: usize = 8;

const fn padded(n: usize) -> usize {
    n.div_ceil(TUPLE_WORD) * TUPLE_WORD
}

/// How the value count is encoded in the tuple header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TupleFormat {
    /// One-byte count, at most 255 values.
    Params,
    /// Four-byte little-endian count.
    Params32,
}

impl TupleFormat {
    const fn count_width(self) -> usize {
        match self {
            Self::Params => 1,
            Self::Params32 => 4,
        }
    }

    /// Largest number of values the header can describe.
    #[must_use]
    pub const fn max_len(self) -> usize {
        match self {
            Self::Params => u8::MAX as usize,
            Self::Params32 => u32::MAX as usize,
        }
    }
}

/// Read position within a message body.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not consumed yet.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(QliteError::protocol(format!(
                "truncated {what}: need {n} bytes, {} left",
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn skip_padding(&mut self, consumed: usize, what: &str) -> Result<()> {
        self.take(padded(consumed) - consumed, what).map(|_| ())
    }

    fn read_word(&mut self, what: &str) -> Result<[u8; TUPLE_WORD]> {
        let mut word = [0u8; TUPLE_WORD];
        word.copy_from_slice(self.take(TUPLE_WORD, what)?);
        Ok(word)
    }

    fn read_text(&mut self) -> Result<&'a str> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| QliteError::protocol("text value is not NUL-terminated"))?;
        let text = std::str::from_utf8(&rest[..nul])
            .map_err(|e| QliteError::protocol(format!("text value is not UTF-8: {e}")))?;
        self.take(padded(nul + 1), "text value")?;
        Ok(text)
    }

    fn read_blob(&mut self) -> Result<&'a [u8]> {
        let len = u64::from_le_bytes(self.read_word("blob length")?);
        let len = usize::try_from(len)
            .map_err(|_| QliteError::protocol(format!("blob length {len} does not fit")))?;
        let bytes = self.take(len, "blob value")?;
        self.skip_padding(len, "blob padding")?;
        Ok(bytes)
    }
}

/// Decodes the values of one tuple, in order.
///
/// Type codes are only checked when their value is reached, so a caller
/// consuming values one by one sees every value before the first bad one.
#[derive(Debug, Clone)]
pub struct TupleDecoder<'a> {
    cursor: Cursor<'a>,
    types: &'a [u8],
    next: usize,
}

impl<'a> TupleDecoder<'a> {
    /// Read the tuple header from `cursor`.
    pub fn new(mut cursor: Cursor<'a>, format: TupleFormat) -> Result<Self> {
        let width = format.count_width();
        let raw = cursor.take(width, "tuple header")?;
        let count = match format {
            TupleFormat::Params => usize::from(raw[0]),
            TupleFormat::Params32 => {
                let count = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                usize::try_from(count).map_err(|_| {
                    QliteError::protocol(format!("tuple count {count} does not fit"))
                })?
            }
        };
        let types = cursor.take(count, "tuple type codes")?;
        cursor.skip_padding(width + count, "tuple header padding")?;
        trace!(?format, count, "tuple header decoded");
        Ok(Self {
            cursor,
            types,
            next: 0,
        })
    }

    /// Number of values the header announces.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.types.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Index of the value the next call decodes.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.next
    }

    /// Decode the next value, or `None` once all values were read.
    ///
    /// After an error the decoder is exhausted.
    pub fn next_value(&mut self) -> Result<Option<Value>> {
        let Some(&code) = self.types.get(self.next) else {
            return Ok(None);
        };
        let index = self.next;
        match self.decode(code) {
            Ok(value) => {
                self.next += 1;
                Ok(Some(value))
            }
            Err(err) => {
                self.next = self.types.len();
                trace!(index, code, %err, "tuple value rejected");
                Err(err)
            }
        }
    }

    fn decode(&mut self, code: u8) -> Result<Value> {
        let index = self.next;
        let ty = ValueType::from_code(code).ok_or_else(|| {
            QliteError::protocol(format!("unknown type code {code} for value {index}"))
        })?;
        let c = &mut self.cursor;
        Ok(match ty {
            ValueType::Integer => Value::Integer(i64::from_le_bytes(c.read_word("integer")?)),
            ValueType::Float => Value::Float(f64::from_le_bytes(c.read_word("float")?)),
            ValueType::Text => Value::Text(c.read_text()?.to_owned()),
            ValueType::Iso8601 => Value::Iso8601(c.read_text()?.to_owned()),
            ValueType::Blob => Value::Blob(c.read_blob()?.to_vec()),
            ValueType::Null => {
                c.read_word("null")?;
                Value::Null
            }
            ValueType::Boolean => Value::Boolean(u64::from_le_bytes(c.read_word("boolean")?) != 0),
            ValueType::UnixTime => {
                c.read_word("unixtime")?;
                return Err(QliteError::protocol(format!(
                    "{ty} value {index} cannot be used as a parameter"
                )));
            }
        })
    }

    /// The cursor positioned after the last decoded value.
    #[must_use]
    pub fn into_cursor(self) -> Cursor<'a> {
        self.cursor
    }
}

impl Iterator for TupleDecoder<'_> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_value().transpose()
    }
}

/// Builds tuple payloads.
#[derive(Debug, Clone)]
pub struct TupleEncoder {
    format: TupleFormat,
    values: Vec<Value>,
}

impl TupleEncoder {
    #[must_use]
    pub const fn new(format: TupleFormat) -> Self {
        Self {
            format,
            values: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.values.push(value.into());
        self
    }

    pub fn push(&mut self, value: impl Into<Value>) {
        self.values.push(value.into());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Encode header and bodies.
    ///
    /// Fails with [`QliteError::Protocol`] when the count does not fit the
    /// format or a text value contains a NUL byte.
    pub fn finish(self) -> Result<Vec<u8>> {
        let count = self.values.len();
        if count > self.format.max_len() {
            return Err(QliteError::protocol(format!(
                "{count} values exceed the {:?} limit of {}",
                self.format,
                self.format.max_len()
            )));
        }

        let width = self.format.count_width();
        let mut out = Vec::with_capacity(padded(width + count) + count * TUPLE_WORD);
        match self.format {
            TupleFormat::Params => out.push(u8::try_from(count).unwrap_or(u8::MAX)),
            TupleFormat::Params32 => {
                out.extend_from_slice(&u32::try_from(count).unwrap_or(u32::MAX).to_le_bytes());
            }
        }
        out.extend(self.values.iter().map(|v| v.value_type().code()));
        out.resize(padded(out.len()), 0);

        for value in &self.values {
            encode_body(&mut out, value)?;
        }
        Ok(out)
    }
}

fn encode_body(out: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Integer(i) => out.extend_from_slice(&i.to_le_bytes()),
        Value::Float(f) => out.extend_from_slice(&f.to_le_bytes()),
        Value::Null => out.extend_from_slice(&[0; TUPLE_WORD]),
        Value::Boolean(b) => out.extend_from_slice(&u64::from(*b).to_le_bytes()),
        Value::Blob(bytes) => {
            out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        Value::Text(s) | Value::Iso8601(s) => {
            if s.as_bytes().contains(&0) {
                return Err(QliteError::protocol("text value contains a NUL byte"));
            }
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
    }
    out.resize(padded(out.len()), 0);
    Ok(())
}
