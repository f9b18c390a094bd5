//! Client engine for the pvrlink backend control protocol.
//!
//! Connects to a PVR backend over TCP, negotiates a protocol version,
//! announces a role, and from there offers gated request/response calls,
//! background event delivery, and block-oriented file streaming over a
//! second data connection.
//!
//! ```no_run
//! use pvrlink_client::{AnnounceMode, BackendConnection, ConnectionConfig};
//!
//! # async fn demo() -> Result<(), pvrlink_client::ClientError> {
//! let conn = BackendConnection::open(ConnectionConfig::new("127.0.0.1:6543")).await?;
//! conn.announce(AnnounceMode::Monitor, true).await?;
//! conn.enable_event_mode().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;

pub use client::connection::{AnnounceMode, BackendConnection};
pub use client::events::{Event, EventListener, ListenerId};
pub use client::stream::{TransferStream, DEFAULT_BLOCK_SIZE};
pub use client::transfer::{FileTransfer, SeekWhence, TransferOptions};
pub use config::{load_from_env, ConnectionConfig};

pub use pvrlink_protocol::{ClientError, ProtocolError, ProtocolVersion};
