//! A length-prefixed binary record stream.
//!
//! Records are self-delimiting msgpack values, so concatenating two packed
//! streams and unpacking the result yields the concatenation of their
//! values -- there is no outer length table to get out of sync.

use std::io::{self, Read, Write};

use crate::error::DqpError;
use crate::value::{validate_for_encode, Value};

/// Pack a single value into its on-the-wire bytes.
pub fn pack(value: &Value) -> Result<Vec<u8>, DqpError> {
    validate_for_encode(value)?;
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value)
        .map_err(|e| DqpError::InvalidValue(e.to_string()))?;
    Ok(buf)
}

/// Append one packed record to `writer`. Does not flush; callers that need
/// the bytes visible to a concurrent reader must flush themselves.
pub fn stream_pack<W: Write>(writer: &mut W, value: &Value) -> Result<(), DqpError> {
    validate_for_encode(value)?;
    rmpv::encode::write_value(writer, value).map_err(|e| match e {
        rmpv::encode::Error::InvalidMarkerWrite(io_err)
        | rmpv::encode::Error::InvalidDataWrite(io_err) => DqpError::IoError(io_err),
    })
}

/// A lazy, forward-only, restart-from-start sequence of records read from
/// `reader`. Stops cleanly at end-of-stream between records; a record that
/// starts but cannot be completed yields `Err(DqpError::Corrupt)` and ends
/// the sequence on the following call.
pub struct UnpackIter<R> {
    reader: R,
    done: bool,
}

pub fn stream_unpack<R: Read>(reader: R) -> UnpackIter<R> {
    UnpackIter {
        reader,
        done: false,
    }
}

impl<R: Read> Iterator for UnpackIter<R> {
    type Item = Result<Value, DqpError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match rmpv::decode::read_value(&mut self.reader) {
            Ok(value) => Some(Ok(value)),
            Err(rmpv::decode::Error::InvalidMarkerRead(err))
                if err.kind() == io::ErrorKind::UnexpectedEof =>
            {
                // Clean EOF exactly at a record boundary: end of sequence.
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(DqpError::Corrupt {
                    path: std::path::PathBuf::new(),
                    reason: err.to_string(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let values = vec![
            Value::from(1_i64),
            Value::from("hello"),
            crate::value::map([("a".to_string(), Value::from(1_i64))]),
        ];
        let mut buf = Vec::new();
        for v in &values {
            stream_pack(&mut buf, v).unwrap();
        }
        let decoded: Vec<Value> = stream_unpack(buf.as_slice())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn concatenation_is_concatenation_of_values() {
        let mut first_file = Vec::new();
        stream_pack(&mut first_file, &Value::from(1_i64)).unwrap();
        stream_pack(&mut first_file, &Value::from(2_i64)).unwrap();

        let mut second_file = Vec::new();
        stream_pack(&mut second_file, &Value::from(3_i64)).unwrap();

        let mut concatenated = first_file.clone();
        concatenated.extend_from_slice(&second_file);

        let decoded: Vec<Value> = stream_unpack(concatenated.as_slice())
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            decoded,
            vec![Value::from(1_i64), Value::from(2_i64), Value::from(3_i64)]
        );
    }

    #[test]
    fn rejects_non_string_map_keys() {
        let bad = Value::Map(vec![(Value::from(1_i64), Value::from(2_i64))]);
        assert!(pack(&bad).is_err());
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let mut buf = Vec::new();
        stream_pack(&mut buf, &Value::from("a longer string value")).unwrap();
        buf.truncate(buf.len() - 2);
        let mut iter = stream_unpack(buf.as_slice());
        assert!(matches!(iter.next(), Some(Err(DqpError::Corrupt { .. }))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn empty_stream_yields_nothing() {
        let mut iter = stream_unpack([].as_slice());
        assert!(iter.next().is_none());
    }
}
