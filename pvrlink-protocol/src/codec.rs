//! Codec for the text-framed wire format.
//!
//! Frame format:
//! ```text
//! +------------------+---------------------------------------+
//! | Length           | Payload                               |
//! | 8 ASCII digits   | fields joined by "[]:[]"              |
//! | (zero-padded)    | (Length bytes)                        |
//! +------------------+---------------------------------------+
//! ```
//!
//! The length declares the exact byte count of the payload. Fields are
//! arbitrary UTF-8 as long as they do not contain the delimiter token.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::{
    Frame, ProtocolVersion, LENGTH_PREFIX_WIDTH, MAX_PAYLOAD_SIZE, PAYLOAD_DELIMITER,
};

/// Encode a frame into its wire representation.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    for field in frame.fields() {
        if field.contains(PAYLOAD_DELIMITER) {
            return Err(ProtocolError::MalformedFrame(format!(
                "field contains the payload delimiter: {field:?}"
            )));
        }
    }

    let payload = frame.fields().join(PAYLOAD_DELIMITER);
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_WIDTH + payload.len());
    out.put_slice(format!("{:0width$}", payload.len(), width = LENGTH_PREFIX_WIDTH).as_bytes());
    out.put_slice(payload.as_bytes());
    Ok(out.freeze())
}

/// Parse the fixed-width length prefix.
fn decode_length(prefix: &[u8]) -> Result<usize, ProtocolError> {
    let text = std::str::from_utf8(prefix)
        .map_err(|_| ProtocolError::MalformedFrame("length prefix is not ASCII".to_string()))?;
    if !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::MalformedFrame(format!(
            "length prefix is not decimal: {text:?}"
        )));
    }
    text.parse::<usize>()
        .map_err(|e| ProtocolError::MalformedFrame(format!("length prefix: {e}")))
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` until a complete frame has been buffered; on success
/// the consumed bytes are removed from `buf`.
pub fn decode(
    buf: &mut BytesMut,
    version: ProtocolVersion,
) -> Result<Option<Frame>, ProtocolError> {
    match frame_len(buf)? {
        Some(total) => {
            let raw = buf.split_to(total);
            let payload = std::str::from_utf8(&raw[LENGTH_PREFIX_WIDTH..]).map_err(|e| {
                ProtocolError::MalformedFrame(format!("payload is not UTF-8: {e}"))
            })?;
            let fields: Vec<String> = payload
                .split(PAYLOAD_DELIMITER)
                .map(str::to_string)
                .collect();
            // split always yields at least one element, so the non-empty
            // frame invariant holds even for an empty payload.
            let frame = Frame::new(version, fields).map_err(|e| {
                ProtocolError::MalformedFrame(format!("decoded frame invalid: {e}"))
            })?;
            Ok(Some(frame))
        }
        None => Ok(None),
    }
}

/// Total byte length (prefix + payload) of the frame at the front of `buf`,
/// or `None` if not fully buffered yet.
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_WIDTH {
        return Ok(None);
    }
    let payload_len = decode_length(&buf[..LENGTH_PREFIX_WIDTH])?;
    let total = LENGTH_PREFIX_WIDTH + payload_len;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some(total))
}

/// Encode a 64-bit integer per the version's width rule: two decimal fields
/// (signed high half, unsigned low half) below the wide-int threshold, one
/// signed decimal field at or above it.
pub fn encode_wide_int(value: i64, version: ProtocolVersion) -> Vec<String> {
    if version.wide_ints() {
        vec![value.to_string()]
    } else {
        let high = (value >> 32) as i32;
        let low = (value & 0xFFFF_FFFF) as u32;
        vec![high.to_string(), low.to_string()]
    }
}

/// Decode a 64-bit integer starting at `fields[*idx]`, advancing `idx` past
/// the consumed field(s).
pub fn decode_wide_int(
    fields: &[String],
    idx: &mut usize,
    version: ProtocolVersion,
) -> Result<i64, ProtocolError> {
    let take = |i: usize| -> Result<&str, ProtocolError> {
        fields.get(i).map(String::as_str).ok_or_else(|| {
            ProtocolError::MalformedFrame(format!(
                "expected integer field at index {i}, frame has {}",
                fields.len()
            ))
        })
    };

    if version.wide_ints() {
        let raw = take(*idx)?;
        let value = raw
            .parse::<i64>()
            .map_err(|e| ProtocolError::MalformedFrame(format!("bad 64-bit field {raw:?}: {e}")))?;
        *idx += 1;
        Ok(value)
    } else {
        let high_raw = take(*idx)?;
        let low_raw = take(*idx + 1)?;
        let high = high_raw
            .parse::<i32>()
            .map_err(|e| ProtocolError::MalformedFrame(format!("bad high half {high_raw:?}: {e}")))?;
        let low = low_raw
            .parse::<u32>()
            .map_err(|e| ProtocolError::MalformedFrame(format!("bad low half {low_raw:?}: {e}")))?;
        *idx += 2;
        Ok(((high as i64) << 32) | (low as i64))
    }
}
