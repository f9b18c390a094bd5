//! Core protocol types: the version table and the text frame.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{ClientError, ProtocolError};

/// Default backend control port.
pub const DEFAULT_PORT: u16 = 6543;

/// Field delimiter inside a frame payload. Multi-character on purpose: it
/// must never collide with a legitimate field value.
pub const PAYLOAD_DELIMITER: &str = "[]:[]";

/// Width of the zero-padded decimal length prefix.
pub const LENGTH_PREFIX_WIDTH: usize = 8;

/// Largest payload the 8-digit prefix can declare.
pub const MAX_PAYLOAD_SIZE: usize = 99_999_999;

/// First payload field of an unsolicited event frame.
pub const BACKEND_MESSAGE: &str = "BACKEND_MESSAGE";

/// Handshake vocabulary.
pub const CMD_PROTO_VERSION: &str = "PROTO_VERSION";
pub const CMD_ANN: &str = "ANN";
pub const CMD_DONE: &str = "DONE";
pub const REPLY_ACCEPT: &str = "ACCEPT";
pub const REPLY_REJECT: &str = "REJECT";

/// Versions at or above this carry a negotiation token in the handshake.
pub const TOKEN_MIN_VERSION: u32 = 62;

/// Versions at or above this encode 64-bit integers as a single decimal
/// field instead of two 32-bit halves.
pub const WIDE_INT_MIN_VERSION: u32 = 66;

/// One revision of the backend protocol.
///
/// Ordered by numeric value; the token and release date are metadata and do
/// not participate in comparison.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProtocolVersion {
    value: u32,
    token: Option<&'static str>,
    released: Option<&'static str>,
}

impl PartialEq for ProtocolVersion {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for ProtocolVersion {}

impl PartialOrd for ProtocolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProtocolVersion {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl std::hash::Hash for ProtocolVersion {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

const fn v(
    value: u32,
    token: Option<&'static str>,
    released: Option<&'static str>,
) -> ProtocolVersion {
    ProtocolVersion {
        value,
        token,
        released,
    }
}

/// Every protocol revision this client knows how to speak, oldest first.
///
/// Tokens are the per-revision negotiation secrets the backend checks for
/// revisions >= [`TOKEN_MIN_VERSION`].
pub const KNOWN_VERSIONS: &[ProtocolVersion] = &[
    v(56, None, Some("2010-01-11")),
    v(58, None, Some("2010-03-02")),
    v(59, None, Some("2010-04-16")),
    v(60, None, Some("2010-06-30")),
    v(62, Some("78B5631E"), Some("2010-09-24")),
    v(63, Some("3875641D"), Some("2010-11-08")),
    v(64, Some("8675309J"), Some("2011-01-17")),
    v(65, Some("D2BB94C2"), Some("2011-03-01")),
    v(66, Some("0C0FFEE0"), Some("2011-05-25")),
    v(67, Some("48349644"), Some("2011-07-12")),
    v(69, Some("63835135"), Some("2011-10-03")),
    v(72, Some("D78EFD6F"), Some("2012-02-27")),
    v(75, Some("SweetRock"), Some("2012-09-13")),
    v(77, Some("WindMark"), Some("2013-04-22")),
    v(79, Some("BasaltGiant"), Some("2014-01-30")),
    v(85, Some("BluePool"), Some("2015-07-16")),
    v(87, Some("LongFence"), Some("2016-05-09")),
    v(88, Some("XmasGift"), Some("2017-11-20")),
    v(91, Some("BuzzOff"), Some("2019-08-04")),
];

impl ProtocolVersion {
    /// Numeric revision.
    pub fn value(&self) -> u32 {
        self.value
    }

    /// Negotiation token, present for revisions >= [`TOKEN_MIN_VERSION`].
    pub fn token(&self) -> Option<&'static str> {
        self.token
    }

    /// Release date metadata, if recorded.
    pub fn released(&self) -> Option<&'static str> {
        self.released
    }

    /// Whether the handshake for this revision must carry the token.
    pub fn requires_token(&self) -> bool {
        self.value >= TOKEN_MIN_VERSION
    }

    /// Whether 64-bit integers travel as a single decimal field.
    pub fn wide_ints(&self) -> bool {
        self.value >= WIDE_INT_MIN_VERSION
    }

    /// Newest revision in the table.
    pub fn latest() -> ProtocolVersion {
        *KNOWN_VERSIONS.last().expect("version table is non-empty")
    }

    /// Oldest revision in the table. Negotiation cannot downgrade past it.
    pub fn floor() -> ProtocolVersion {
        *KNOWN_VERSIONS.first().expect("version table is non-empty")
    }

    /// Exact lookup.
    pub fn from_value(value: u32) -> Option<ProtocolVersion> {
        KNOWN_VERSIONS.iter().find(|v| v.value == value).copied()
    }

    /// Newest known revision at or below `value`. Used when the backend
    /// rejects with a version this client does not know exactly.
    pub fn at_or_below(value: u32) -> Option<ProtocolVersion> {
        KNOWN_VERSIONS
            .iter()
            .rev()
            .find(|v| v.value <= value)
            .copied()
    }
}

/// One complete protocol message: an ordered, non-empty list of string
/// fields plus the version it was built for.
#[derive(Debug, Clone)]
pub struct Frame {
    fields: Vec<String>,
    version: ProtocolVersion,
    created: DateTime<Utc>,
}

impl PartialEq for Frame {
    // Creation time is bookkeeping, not identity.
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields && self.version == other.version
    }
}

impl Frame {
    /// Build a frame. Fails on an empty field list.
    pub fn new<I, S>(version: ProtocolVersion, fields: I) -> Result<Frame, ClientError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        if fields.is_empty() {
            return Err(ClientError::ProtocolViolation(
                "frame must carry at least one field".to_string(),
            ));
        }
        Ok(Frame {
            fields,
            version,
            created: Utc::now(),
        })
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// The command word: the first whitespace-separated token of the first
    /// field (`"ANN FileTransfer player01"` -> `"ANN"`).
    pub fn command_word(&self) -> &str {
        self.fields[0]
            .split_whitespace()
            .next()
            .unwrap_or(self.fields[0].as_str())
    }

    /// Whether this frame is an unsolicited backend event.
    pub fn is_event(&self) -> bool {
        self.fields[0] == BACKEND_MESSAGE
    }

    /// Field at `idx`, or a malformed-frame error naming the expectation.
    pub fn field(&self, idx: usize) -> Result<&str, ProtocolError> {
        self.fields.get(idx).map(String::as_str).ok_or_else(|| {
            ProtocolError::MalformedFrame(format!(
                "expected at least {} fields, got {}",
                idx + 1,
                self.fields.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_table_ordering() {
        for pair in KNOWN_VERSIONS.windows(2) {
            assert!(pair[0] < pair[1], "table must be sorted ascending");
        }
    }

    #[test]
    fn test_token_threshold() {
        assert!(!ProtocolVersion::from_value(60).unwrap().requires_token());
        assert!(ProtocolVersion::from_value(62).unwrap().requires_token());
        assert!(ProtocolVersion::from_value(62).unwrap().token().is_some());
        assert!(ProtocolVersion::from_value(56).unwrap().token().is_none());
    }

    #[test]
    fn test_wide_int_threshold() {
        assert!(!ProtocolVersion::from_value(65).unwrap().wide_ints());
        assert!(ProtocolVersion::from_value(66).unwrap().wide_ints());
    }

    #[test]
    fn test_at_or_below() {
        assert_eq!(ProtocolVersion::at_or_below(77).unwrap().value(), 77);
        // 78 is unknown; nearest older is 77
        assert_eq!(ProtocolVersion::at_or_below(78).unwrap().value(), 77);
        assert!(ProtocolVersion::at_or_below(0).is_none());
    }

    #[test]
    fn test_empty_frame_rejected() {
        let ver = ProtocolVersion::latest();
        let fields: Vec<String> = Vec::new();
        assert!(Frame::new(ver, fields).is_err());
    }

    #[test]
    fn test_command_word() {
        let ver = ProtocolVersion::latest();
        let f = Frame::new(ver, ["ANN FileTransfer player01"]).unwrap();
        assert_eq!(f.command_word(), "ANN");
        assert!(!f.is_event());

        let ev = Frame::new(ver, [BACKEND_MESSAGE, "RECORDING_LIST_CHANGE"]).unwrap();
        assert!(ev.is_event());
    }
}
