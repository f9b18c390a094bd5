//! Block-oriented file streaming over a dedicated data connection.
//!
//! A transfer session pairs the caller's announced control connection with a
//! second connection announced as `FileTransfer`. Block requests travel on
//! the control connection; the file bytes arrive on the data connection.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;

use pvrlink_protocol::{codec, lookup_table, ClientError, Frame, ProtocolError, ProtocolVersion};

use crate::client::connection::{AnnounceMode, BackendConnection};

/// How long `request_block` waits between polls of the control connection
/// when the data channel has nothing buffered yet.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Options for the transfer announce handshake. Which of these reach the
/// wire depends on the data connection's negotiated version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOptions {
    pub write_mode: bool,
    pub use_read_ahead: bool,
    /// Retry count, consumed by backends below version 60.
    pub retries: u32,
    /// Per-block timeout in milliseconds, consumed from version 60 on.
    pub timeout_ms: u32,
    pub storage_group: String,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            write_mode: false,
            use_read_ahead: true,
            retries: 2,
            timeout_ms: 2000,
            storage_group: "Default".to_string(),
        }
    }
}

/// Origin for [`FileTransfer::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeekWhence {
    Start,
    Current,
    End,
}

impl SeekWhence {
    fn code(self) -> u8 {
        match self {
            SeekWhence::Start => 0,
            SeekWhence::Current => 1,
            SeekWhence::End => 2,
        }
    }
}

/// Raw byte channel left over once the data connection's announce handshake
/// is complete. Any bytes the announce reader over-buffered are consumed
/// first.
struct DataChannel {
    read_half: OwnedReadHalf,
    buf: BytesMut,
    write_half: OwnedWriteHalf,
}

/// One file streaming session: `Announcing -> Open -> Done`.
pub struct FileTransfer {
    control: Arc<BackendConnection>,
    version: ProtocolVersion,
    session_id: u32,
    size: i64,
    read_timeout: Duration,
    data: Option<DataChannel>,
    done: bool,
}

impl FileTransfer {
    /// Open a transfer session for `target`.
    ///
    /// Connects a second time to the control connection's host, negotiates
    /// independently, and announces the new connection as a transfer channel
    /// with the fields the negotiated version expects. Returns `Ok(None)`
    /// when the backend does not know the target.
    pub async fn announce(
        control: Arc<BackendConnection>,
        target: &str,
        options: &TransferOptions,
    ) -> Result<Option<FileTransfer>, ClientError> {
        let config = control.config().clone();
        let data_conn = BackendConnection::open(config.clone()).await?;
        let version = data_conn.version();
        if version != control.version() {
            data_conn.close().await;
            return Err(ClientError::ProtocolViolation(format!(
                "data connection negotiated {version} but control holds {}",
                control.version()
            )));
        }

        let table = lookup_table("ann_file_transfer")?;
        let mut fields = Vec::new();
        for spec in table.active_fields(version.value()) {
            fields.push(match spec.name {
                "announce" => format!(
                    "ANN {} {}",
                    AnnounceMode::FileTransfer.as_str(),
                    config.client_name
                ),
                "write_mode" => (options.write_mode as u8).to_string(),
                "use_read_ahead" => (options.use_read_ahead as u8).to_string(),
                "retries" => options.retries.to_string(),
                "timeout_ms" => options.timeout_ms.to_string(),
                "target" => target.to_string(),
                "storage_group" => options.storage_group.clone(),
                other => {
                    return Err(ProtocolError::SchemaError {
                        kind: "transfer announce field",
                        name: other.to_string(),
                    }
                    .into())
                }
            });
        }
        data_conn.write_request(&Frame::new(version, fields)?).await?;

        let ack = data_conn.read_response().await?;
        if ack.fields()[0] != "OK" {
            debug!("transfer announce rejected for {target:?}: {:?}", ack.fields());
            data_conn.close().await;
            return Ok(None);
        }

        // OK, session id, then the size in the version's integer width.
        let expected = 2 + if version.wide_ints() { 1 } else { 2 };
        if ack.fields().len() != expected {
            return Err(ProtocolError::MalformedFrame(format!(
                "transfer ack has {} fields, expected {expected} at version {version}",
                ack.fields().len()
            ))
            .into());
        }
        let session_id: u32 = ack.field(1)?.parse().map_err(|_| {
            ProtocolError::MalformedFrame(format!(
                "bad transfer session id {:?}",
                ack.fields()[1]
            ))
        })?;
        let mut idx = 2;
        let size = codec::decode_wide_int(ack.fields(), &mut idx, version)?;
        info!("transfer session {session_id} open for {target:?}, {size} bytes");

        let (read_half, buf, write_half) = data_conn.into_raw_parts()?;
        Ok(Some(FileTransfer {
            control,
            version,
            session_id,
            size,
            read_timeout: config.read_timeout,
            data: Some(DataChannel {
                read_half,
                buf,
                write_half,
            }),
            done: false,
        }))
    }

    /// Declared file size in bytes.
    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Request up to `dest.len()` bytes and read them into `dest`.
    ///
    /// Sends the block request on the control connection without awaiting
    /// its reply, then drains whatever the data channel already has while
    /// the reply is pending, so the peer's send buffer never stalls. Once
    /// the reply declares the byte count, the remainder is read with
    /// blocking reads. Returns the number of bytes placed in `dest`; 0 past
    /// end of file.
    pub async fn request_block(&mut self, dest: &mut [u8]) -> Result<usize, ClientError> {
        if self.done {
            return Err(ClientError::Transfer(
                "session already completed".to_string(),
            ));
        }
        let size = dest.len();
        let frame = self.query_frame(["REQUEST_BLOCK".to_string(), size.to_string()])?;
        self.control.write_request(&frame).await?;

        let mut filled = 0;
        loop {
            if self.control.can_read_response().await? {
                break;
            }
            let data = self.data.as_mut().ok_or(ClientError::ConnectionClosed)?;
            let n = drain_available(data, &mut dest[filled..])?;
            filled += n;
            if filled == size {
                break;
            }
            if n == 0 {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        let reply = self.control.read_response().await?;
        let declared: i64 = reply.field(0)?.parse().map_err(|_| {
            ClientError::ProtocolViolation(format!(
                "unexpected block reply: {:?}",
                reply.fields()
            ))
        })?;
        if declared < 0 {
            return Err(ClientError::Transfer(format!(
                "backend reported block failure ({declared})"
            )));
        }
        let declared = declared as usize;
        if declared > size {
            return Err(ClientError::Transfer(format!(
                "backend declared {declared} bytes for a {size} byte request"
            )));
        }
        if filled > declared {
            return Err(ClientError::Transfer(format!(
                "read {filled} bytes but only {declared} were declared"
            )));
        }

        let data = self.data.as_mut().ok_or(ClientError::ConnectionClosed)?;
        read_exact_into(data, &mut dest[filled..declared], self.read_timeout).await?;
        trace!("block: requested {size}, received {declared}");
        Ok(declared)
    }

    /// Seek within the file. Positions travel in the negotiated version's
    /// integer width, both directions. Returns the resulting absolute
    /// position.
    pub async fn seek(
        &mut self,
        pos: i64,
        whence: SeekWhence,
        current: i64,
    ) -> Result<i64, ClientError> {
        let mut fields = vec!["SEEK".to_string()];
        fields.extend(codec::encode_wide_int(pos, self.version));
        fields.push(whence.code().to_string());
        fields.extend(codec::encode_wide_int(current, self.version));
        let frame = self.query_frame(fields)?;
        self.control.write_request(&frame).await?;

        let reply = self.control.read_response().await?;
        let mut idx = 0;
        Ok(codec::decode_wide_int(reply.fields(), &mut idx, self.version)?)
    }

    /// Whether the backend still holds the file open for this session.
    pub async fn is_open(&mut self) -> Result<bool, ClientError> {
        let frame = self.query_frame(["IS_OPEN".to_string()])?;
        self.control.write_request(&frame).await?;
        let reply = self.control.read_response().await?;
        Ok(reply.field(0)? == "1")
    }

    /// Switch the backend between fast and slow timeout handling for this
    /// session.
    pub async fn set_timeout_mode(&mut self, fast: bool) -> Result<(), ClientError> {
        let frame = self.query_frame(["SET_TIMEOUT".to_string(), (fast as u8).to_string()])?;
        self.control.write_request(&frame).await?;
        let reply = self.control.read_response().await?;
        if reply.fields()[0] != "OK" {
            return Err(ClientError::ProtocolViolation(format!(
                "SET_TIMEOUT rejected: {:?}",
                reply.fields()
            )));
        }
        Ok(())
    }

    /// Point the open session at a different file.
    pub async fn reopen(&mut self, new_target: &str) -> Result<bool, ClientError> {
        let frame = self.query_frame(["REOPEN".to_string(), new_target.to_string()])?;
        self.control.write_request(&frame).await?;
        let reply = self.control.read_response().await?;
        Ok(reply.field(0)? == "1")
    }

    /// Tell the backend the session is finished. Idempotent; the session is
    /// marked done even when the completion frame cannot be delivered, so a
    /// cleanup path can always call this.
    pub async fn done(&mut self) -> Result<(), ClientError> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        let frame = self.query_frame(["DONE".to_string()])?;
        self.control.write_request(&frame).await?;
        let reply = self.control.read_response().await?;
        if reply.fields()[0] != "OK" {
            return Err(ClientError::ProtocolViolation(format!(
                "DONE rejected: {:?}",
                reply.fields()
            )));
        }
        Ok(())
    }

    /// Complete the session if needed, then shut the data channel down.
    /// Idempotent and safe after failures.
    pub async fn close(&mut self) {
        if !self.done {
            if let Err(e) = self.done().await {
                debug!("transfer completion not acknowledged: {e}");
            }
        }
        if let Some(mut data) = self.data.take() {
            let _ = data.write_half.shutdown().await;
            debug!("transfer session {} data channel closed", self.session_id);
        }
    }

    fn query_frame<I>(&self, parts: I) -> Result<Frame, ClientError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut fields = vec![format!("QUERY_FILETRANSFER {}", self.session_id)];
        fields.extend(parts);
        Frame::new(self.version, fields)
    }
}

/// Copy bytes buffered during the announce handshake into `dest`.
fn copy_buffered(data: &mut DataChannel, dest: &mut [u8]) -> usize {
    let n = data.buf.len().min(dest.len());
    if n > 0 {
        dest[..n].copy_from_slice(&data.buf[..n]);
        data.buf.advance(n);
    }
    n
}

/// Read whatever the data channel holds right now, without blocking.
fn drain_available(data: &mut DataChannel, dest: &mut [u8]) -> Result<usize, ClientError> {
    let mut copied = copy_buffered(data, dest);
    while copied < dest.len() {
        match data.read_half.try_read(&mut dest[copied..]) {
            Ok(0) => return Err(ClientError::ConnectionClosed),
            Ok(n) => copied += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(copied)
}

/// Fill `dest` completely, each read bounded by `read_timeout`. The peer has
/// already declared these bytes, so coming up short is a transfer fault.
async fn read_exact_into(
    data: &mut DataChannel,
    dest: &mut [u8],
    read_timeout: Duration,
) -> Result<(), ClientError> {
    let mut filled = copy_buffered(data, dest);
    while filled < dest.len() {
        let n = timeout(read_timeout, data.read_half.read(&mut dest[filled..]))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "data channel read timed out")
            })??;
        if n == 0 {
            return Err(ClientError::Transfer(format!(
                "data channel closed with {} bytes outstanding",
                dest.len() - filled
            )));
        }
        filled += n;
    }
    Ok(())
}
