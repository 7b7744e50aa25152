//! Binding decoded tuple values to statement slots.

use qlite_error::Result;
use qlite_types::Value;
use tracing::{debug, warn};

use crate::stmt::Statement;
use crate::tuple::{Cursor, TupleDecoder, TupleFormat};

/// Bind one value to slot `index` (1-based).
///
/// Booleans bind as the integers 0 and 1, ISO-8601 timestamps as text.
pub fn bind_one<S: Statement + ?Sized>(stmt: &mut S, index: usize, value: &Value) -> Result<()> {
    match value {
        Value::Integer(i) => stmt.bind_int64(index, *i),
        Value::Float(f) => stmt.bind_double(index, *f),
        Value::Blob(bytes) => stmt.bind_blob(index, bytes),
        Value::Null => stmt.bind_null(index),
        Value::Text(s) | Value::Iso8601(s) => stmt.bind_text(index, s),
        Value::Boolean(b) => stmt.bind_int64(index, i64::from(*b)),
    }
}

/// Decode the tuple at `cursor` and bind its values to `stmt`.
///
/// Previous bindings are cleared first and an empty payload binds nothing.
/// Value `i` goes to slot `i + 1`. Decoding stops at the first bad value
/// with [`QliteError::Protocol`](qlite_error::QliteError::Protocol); the slots before it stay bound. A failing
/// bind call aborts with its own error.
pub fn bind_params<S: Statement + ?Sized>(
    stmt: &mut S,
    cursor: Cursor<'_>,
    format: TupleFormat,
) -> Result<()> {
    stmt.clear_bindings()?;
    if cursor.is_empty() {
        return Ok(());
    }

    let mut decoder = TupleDecoder::new(cursor, format)?;
    let count = decoder.len();
    for index in 1..=count {
        let value = match decoder.next_value() {
            Ok(Some(value)) => value,
            Ok(None) => break,
            Err(err) => {
                warn!(slot = index, bound = index - 1, %err, "parameter decoding failed");
                return Err(err);
            }
        };
        bind_one(stmt, index, &value)?;
    }
    debug!(count, ?format, "parameters bound");
    Ok(())
}
