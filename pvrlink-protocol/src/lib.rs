//! Wire protocol definitions for the pvrlink backend client.
//!
//! This crate defines the text-framed protocol spoken by the PVR backend:
//! the frame codec, the protocol version table, the version-ranged field
//! schemas, and the command registry.
//!
//! # Frame Format
//!
//! ```text
//! +------------------+---------------------------------------+
//! | Length           | Payload                               |
//! | 8 ASCII digits   | fields joined by "[]:[]"              |
//! +------------------+---------------------------------------+
//! ```
//!
//! # Example
//!
//! ```rust
//! use pvrlink_protocol::{codec, Frame, ProtocolVersion};
//! use bytes::BytesMut;
//!
//! let ver = ProtocolVersion::latest();
//! let frame = Frame::new(ver, ["QUERY_RECORDINGS", "Ascending"]).unwrap();
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let mut buf = BytesMut::from(&encoded[..]);
//! let decoded = codec::decode(&mut buf, ver).unwrap().unwrap();
//! assert_eq!(decoded, frame);
//! ```

pub mod codec;
pub mod commands;
pub mod error;
pub mod schema;
pub mod types;

pub use error::{ClientError, ProtocolError};
pub use schema::{lookup_table, FieldSpec, FieldTable, ANN_FILE_TRANSFER, PROGRAM_INFO, RECORDER_INFO};
pub use types::{
    Frame, ProtocolVersion, BACKEND_MESSAGE, CMD_ANN, CMD_DONE, CMD_PROTO_VERSION, DEFAULT_PORT,
    KNOWN_VERSIONS, LENGTH_PREFIX_WIDTH, MAX_PAYLOAD_SIZE, PAYLOAD_DELIMITER, REPLY_ACCEPT,
    REPLY_REJECT, TOKEN_MIN_VERSION, WIDE_INT_MIN_VERSION,
};
