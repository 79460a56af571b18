//! The wire value carried by both the queue and the cached-sequence codec.
//!
//! We reuse `rmpv::Value` rather than hand-rolling a tagged enum: it already
//! has exactly the shape spec'd for a statically typed record (null, bool,
//! int, float, string, bytes, ordered sequence, map), and reusing it means
//! `codec::pack`/`stream_unpack` can be thin wrappers around `rmpv`'s own
//! encode/decode instead of a second serializer.

use crate::error::DqpError;
pub use rmpv::Value;

/// Build a `Value::Map` from `(key, value)` pairs, the shape queue payloads
/// and `VarsMap` round-trip through.
pub fn map<I>(pairs: I) -> Value
where
    I: IntoIterator<Item = (String, Value)>,
{
    Value::Map(
        pairs
            .into_iter()
            .map(|(k, v)| (Value::String(k.into()), v))
            .collect(),
    )
}

/// Read a `Value::Map` back out as string-keyed pairs. Fails with
/// `InvalidValue` if `value` isn't a map, or has a non-string key.
pub fn as_map(value: &Value) -> Result<Vec<(&str, &Value)>, DqpError> {
    let entries = value
        .as_map()
        .ok_or_else(|| DqpError::InvalidValue("expected a map".to_string()))?;
    entries
        .iter()
        .map(|(k, v)| {
            k.as_str()
                .map(|k| (k, v))
                .ok_or_else(|| DqpError::InvalidValue("map key is not a string".to_string()))
        })
        .collect()
}

/// Reject values whose on-the-wire shape would round-trip as an ordinary
/// ordered sequence but whose caller meant something more specific (a fixed
/// arity tuple). `rmpv::Value` has no distinct tuple variant, so there is
/// nothing to construct that ambiguity from on encode -- the only check left
/// to make is that maps are genuinely string-keyed, since that's the shape
/// the queue payload and `VarsMap` both promise.
pub fn validate_for_encode(value: &Value) -> Result<(), DqpError> {
    match value {
        Value::Map(entries) => {
            for (k, _) in entries {
                if k.as_str().is_none() {
                    return Err(DqpError::InvalidValue(
                        "map keys must be strings".to_string(),
                    ));
                }
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                validate_for_encode(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
