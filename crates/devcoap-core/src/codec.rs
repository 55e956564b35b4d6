//! Payload codec
//!
//! Values travel as canonical text:
//! - `Float64` as fixed-point decimal with six fractional digits (`21.500000`)
//! - `Int32` as base-10 decimal (`-42`)
//! - `String` as its UTF-8 bytes
//!
//! Decoding is strict: numeric payloads longer than the per-type limit are
//! rejected before parsing, the whole payload must parse, a Float64 outside
//! the normal range of `f64` is out of range, and a String payload must be
//! valid UTF-8.

use bytes::Bytes;
use tracing::debug;

use crate::error::CodecError;
use crate::{ResourceType, Value};

/// Longest accepted Float64 text
pub const FLOAT64_STR_MAXLEN: usize = 24;
/// Longest accepted Int32 text (`-2147483648`)
pub const INT32_STR_MAXLEN: usize = 11;

/// Fractional digits written for Float64 values
pub const FLOAT64_PRECISION: usize = 6;

/// Encode a value to its wire text.
pub fn encode(value: &Value) -> Bytes {
    match value {
        Value::Float64(v) => Bytes::from(format!("{:.*}", FLOAT64_PRECISION, v)),
        Value::Int32(v) => Bytes::from(v.to_string()),
        Value::String(s) => Bytes::copy_from_slice(s.as_bytes()),
    }
}

/// Encode a value for a resource of the declared type.
///
/// Fails when the declared type has no codec, or when the value's variant
/// differs from the declared type.
pub fn encode_for(value: &Value, declared: &ResourceType) -> Result<Bytes, CodecError> {
    if !declared.is_supported() {
        return Err(CodecError::UnsupportedType(declared.to_string()));
    }
    if &value.resource_type() != declared {
        return Err(CodecError::TypeMismatch {
            value: value.resource_type().to_string(),
            declared: declared.to_string(),
        });
    }
    Ok(encode(value))
}

/// Decode wire bytes as the declared type.
pub fn decode(declared: &ResourceType, data: &[u8]) -> Result<Value, CodecError> {
    match declared {
        ResourceType::Float64 => decode_float64(data),
        ResourceType::Int32 => decode_int32(data),
        ResourceType::String => decode_string(data),
        ResourceType::Other(name) => Err(CodecError::UnsupportedType(name.clone())),
    }
}

/// Decode a Float64 payload.
pub fn decode_float64(data: &[u8]) -> Result<Value, CodecError> {
    const KIND: &str = "float64";
    let text = scratch_text(KIND, data, FLOAT64_STR_MAXLEN)?;

    let parsed: f64 = text.parse().map_err(|_| invalid(KIND, data))?;
    let overflow = parsed.is_infinite() && !is_infinity_literal(text);
    let underflow = (parsed == 0.0 || parsed.is_subnormal()) && has_nonzero_mantissa(text);
    if overflow || underflow {
        debug!("float64 out of range: {}", text);
        return Err(CodecError::OutOfRange { kind: KIND });
    }
    Ok(Value::Float64(parsed))
}

/// Decode an Int32 payload.
pub fn decode_int32(data: &[u8]) -> Result<Value, CodecError> {
    const KIND: &str = "int32";
    let text = scratch_text(KIND, data, INT32_STR_MAXLEN)?;

    // i64 holds every 11-character decimal, so range is checked separately
    let parsed: i64 = text.parse().map_err(|_| invalid(KIND, data))?;
    let value = i32::try_from(parsed).map_err(|_| {
        debug!("int32 out of range: {}", parsed);
        CodecError::OutOfRange { kind: KIND }
    })?;
    Ok(Value::Int32(value))
}

/// Decode a String payload. Bytes that are not UTF-8 are rejected rather
/// than replaced, so a decoded string always carries the payload unchanged.
pub fn decode_string(data: &[u8]) -> Result<Value, CodecError> {
    match std::str::from_utf8(data) {
        Ok(s) => Ok(Value::String(s.to_string())),
        Err(e) => {
            debug!("string payload not UTF-8 at byte {}", e.valid_up_to());
            Err(invalid("string", data))
        }
    }
}

/// Bounds-check a numeric payload and view it as text.
fn scratch_text<'a>(kind: &'static str, data: &'a [u8], max: usize) -> Result<&'a str, CodecError> {
    if data.len() > max {
        debug!("invalid {} of len {}", kind, data.len());
        return Err(CodecError::TooLong {
            kind,
            len: data.len(),
            max,
        });
    }
    if data.is_empty() {
        return Err(invalid(kind, data));
    }
    std::str::from_utf8(data).map_err(|_| invalid(kind, data))
}

fn invalid(kind: &'static str, data: &[u8]) -> CodecError {
    debug!("invalid {} of len {}", kind, data.len());
    CodecError::Invalid {
        kind,
        len: data.len(),
    }
}

/// Whether the digits before any exponent include a nonzero one
fn has_nonzero_mantissa(text: &str) -> bool {
    text.split(['e', 'E'])
        .next()
        .is_some_and(|mantissa| mantissa.bytes().any(|b| (b'1'..=b'9').contains(&b)))
}

fn is_infinity_literal(text: &str) -> bool {
    let unsigned = text.trim_start_matches(['+', '-']);
    unsigned.eq_ignore_ascii_case("inf") || unsigned.eq_ignore_ascii_case("infinity")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_float_precision() {
        assert_eq!(encode(&Value::Float64(3.14)).as_ref(), b"3.140000");
        assert_eq!(encode(&Value::Float64(-0.5)).as_ref(), b"-0.500000");
    }

    #[test]
    fn test_encode_int() {
        assert_eq!(encode(&Value::Int32(i32::MIN)).as_ref(), b"-2147483648");
    }

    #[test]
    fn test_float_overflow_is_out_of_range() {
        assert_eq!(
            decode_float64(b"1e400"),
            Err(CodecError::OutOfRange { kind: "float64" })
        );
        assert!(decode_float64(b"inf").is_ok());
    }

    #[test]
    fn test_float_underflow_is_out_of_range() {
        for text in [&b"1e-400"[..], b"-2.5e-330", b"4e-320"] {
            assert_eq!(
                decode_float64(text),
                Err(CodecError::OutOfRange { kind: "float64" }),
                "{:?}",
                std::str::from_utf8(text)
            );
        }
        // a literal zero is not an underflow
        assert_eq!(decode_float64(b"0e-400"), Ok(Value::Float64(0.0)));
        assert_eq!(decode_float64(b"-0.000"), Ok(Value::Float64(-0.0)));
        assert_eq!(
            decode_float64(b"2.2250738585072014e-308"),
            Ok(Value::Float64(f64::MIN_POSITIVE))
        );
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        assert_eq!(
            decode_string(&[0xFF, b'a']),
            Err(CodecError::Invalid { kind: "string", len: 2 })
        );
        assert_eq!(
            decode_string("héllo".as_bytes()),
            Ok(Value::String("héllo".to_string()))
        );
    }

    #[test]
    fn test_int_boundaries() {
        assert_eq!(decode_int32(b"2147483647"), Ok(Value::Int32(i32::MAX)));
        assert_eq!(decode_int32(b"-2147483648"), Ok(Value::Int32(i32::MIN)));
        assert_eq!(
            decode_int32(b"2147483648"),
            Err(CodecError::OutOfRange { kind: "int32" })
        );
    }

    #[test]
    fn test_too_long_checked_before_parse() {
        let err = decode_int32(b"000000000001").unwrap_err();
        assert!(matches!(err, CodecError::TooLong { len: 12, max: 11, .. }));
    }
}
