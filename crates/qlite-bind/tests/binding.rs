use proptest::prelude::*;
use qlite_bind::{
    bind_params, BoundParam, Cursor, SlotStatement, Statement, TupleDecoder, TupleEncoder,
    TupleFormat,
};
use qlite_error::{QliteError, Result};
use qlite_types::Value;

fn payload(format: TupleFormat, values: &[Value]) -> Vec<u8> {
    let mut enc = TupleEncoder::new(format);
    for v in values {
        enc.push(v.clone());
    }
    enc.finish().unwrap()
}

fn bind(stmt: &mut SlotStatement, buf: &[u8], format: TupleFormat) -> Result<()> {
    bind_params(stmt, Cursor::new(buf), format)
}

#[test]
fn mixed_values_bind_in_order() {
    let buf = payload(
        TupleFormat::Params,
        &[
            Value::Integer(7),
            Value::Text("abc".to_owned()),
            Value::Null,
            Value::Boolean(true),
        ],
    );
    let mut stmt = SlotStatement::new(4);
    bind(&mut stmt, &buf, TupleFormat::Params).unwrap();
    assert_eq!(
        stmt.slots(),
        &[
            BoundParam::Int64(7),
            BoundParam::Text("abc".to_owned()),
            BoundParam::Null,
            BoundParam::Int64(1),
        ]
    );
}

#[test]
fn refinements_bind_as_storage_classes() {
    let buf = payload(
        TupleFormat::Params32,
        &[
            Value::Iso8601("2024-02-29T12:00:00Z".to_owned()),
            Value::Boolean(false),
            Value::Float(-0.25),
            Value::Blob(vec![0, 1, 2, 3, 4, 5, 6, 7, 8]),
        ],
    );
    let mut stmt = SlotStatement::new(4);
    bind(&mut stmt, &buf, TupleFormat::Params32).unwrap();
    assert_eq!(
        stmt.slots(),
        &[
            BoundParam::Text("2024-02-29T12:00:00Z".to_owned()),
            BoundParam::Int64(0),
            BoundParam::Double(-0.25),
            BoundParam::Blob(vec![0, 1, 2, 3, 4, 5, 6, 7, 8]),
        ]
    );
}

#[test]
fn empty_payload_clears_and_binds_nothing() {
    let mut stmt = SlotStatement::new(2);
    stmt.bind_int64(1, 99).unwrap();
    bind(&mut stmt, &[], TupleFormat::Params).unwrap();
    assert_eq!(stmt.bound_count(), 0);
}

#[test]
fn previous_bindings_are_reset() {
    let mut stmt = SlotStatement::new(3);
    stmt.bind_text(3, "stale").unwrap();
    let buf = payload(TupleFormat::Params, &[Value::Integer(1)]);
    bind(&mut stmt, &buf, TupleFormat::Params).unwrap();
    assert_eq!(stmt.get(1), Some(&BoundParam::Int64(1)));
    assert_eq!(stmt.get(3), Some(&BoundParam::Unbound));
}

#[test]
fn unknown_tag_leaves_earlier_slots_bound() {
    // INTEGER, TEXT, then code 6 which no value type uses.
    let mut buf = vec![3, 1, 3, 6, 0, 0, 0, 0];
    buf.extend_from_slice(&11_i64.to_le_bytes());
    buf.extend_from_slice(b"hi\0\0\0\0\0\0");
    buf.extend_from_slice(&[0; 8]);

    let mut stmt = SlotStatement::new(3);
    let err = bind(&mut stmt, &buf, TupleFormat::Params).unwrap_err();
    assert!(matches!(err, QliteError::Protocol { .. }));
    assert_eq!(
        stmt.slots(),
        &[
            BoundParam::Int64(11),
            BoundParam::Text("hi".to_owned()),
            BoundParam::Unbound,
        ]
    );
}

#[test]
fn unixtime_is_a_protocol_error() {
    let mut buf = vec![2, 5, 9, 0, 0, 0, 0, 0];
    buf.extend_from_slice(&[0; 8]);
    buf.extend_from_slice(&1_700_000_000_i64.to_le_bytes());

    let mut stmt = SlotStatement::new(2);
    let err = bind(&mut stmt, &buf, TupleFormat::Params).unwrap_err();
    assert!(matches!(err, QliteError::Protocol { .. }));
    assert_eq!(stmt.get(1), Some(&BoundParam::Null));
    assert_eq!(stmt.get(2), Some(&BoundParam::Unbound));
}

#[test]
fn too_many_values_is_a_range_error() {
    let buf = payload(
        TupleFormat::Params,
        &[Value::Integer(1), Value::Integer(2), Value::Integer(3)],
    );
    let mut stmt = SlotStatement::new(2);
    let err = bind(&mut stmt, &buf, TupleFormat::Params).unwrap_err();
    assert!(matches!(err, QliteError::Range { index: 3, count: 2 }));
    assert_eq!(stmt.bound_count(), 2);
}

#[test]
fn truncated_header_is_a_protocol_error() {
    let mut stmt = SlotStatement::new(1);
    let err = bind(&mut stmt, &[1, 1, 0], TupleFormat::Params).unwrap_err();
    assert!(matches!(err, QliteError::Protocol { .. }));
    assert_eq!(stmt.bound_count(), 0);
}

#[test]
fn blob_is_copied_out_of_the_message() {
    let mut buf = payload(TupleFormat::Params, &[Value::Blob(b"payload".to_vec())]);
    let mut stmt = SlotStatement::new(1);
    bind(&mut stmt, &buf, TupleFormat::Params).unwrap();
    buf.fill(0);
    assert_eq!(stmt.get(1), Some(&BoundParam::Blob(b"payload".to_vec())));
}

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Integer),
        any::<f64>()
            .prop_filter("NaN never compares equal", |f| !f.is_nan())
            .prop_map(Value::Float),
        prop::collection::vec(any::<u8>(), 0..40).prop_map(Value::Blob),
        Just(Value::Null),
        "[^\\x00]{0,24}".prop_map(Value::Text),
        "[0-9T:Z-]{0,24}".prop_map(Value::Iso8601),
        any::<bool>().prop_map(Value::Boolean),
    ]
}

proptest! {
    #[test]
    fn decoder_reads_back_what_the_encoder_wrote(
        values in prop::collection::vec(value_strategy(), 0..20),
        wide in any::<bool>(),
    ) {
        let format = if wide { TupleFormat::Params32 } else { TupleFormat::Params };
        let buf = payload(format, &values);
        prop_assert_eq!(buf.len() % 8, 0);

        let decoder = TupleDecoder::new(Cursor::new(&buf), format).unwrap();
        prop_assert_eq!(decoder.len(), values.len());
        let decoded: Vec<Value> = decoder.collect::<Result<_>>().unwrap();
        prop_assert_eq!(decoded, values);
    }

    #[test]
    fn every_truncation_is_rejected(
        values in prop::collection::vec(value_strategy(), 1..6),
        cut in any::<prop::sample::Index>(),
    ) {
        let buf = payload(TupleFormat::Params, &values);
        let cut = cut.index(buf.len());
        let result: Result<Vec<Value>> = TupleDecoder::new(Cursor::new(&buf[..cut]), TupleFormat::Params)
            .and_then(Iterator::collect);
        prop_assert!(matches!(result, Err(QliteError::Protocol { .. })), "expected protocol error, got {:?}", result);
    }
}
