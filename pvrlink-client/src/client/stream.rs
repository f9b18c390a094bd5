//! Buffered read view over a transfer session.

use log::trace;

use pvrlink_protocol::ClientError;

use crate::client::transfer::FileTransfer;

/// Block size used when none is given.
pub const DEFAULT_BLOCK_SIZE: usize = 65536;

/// A read-oriented stream over a [`FileTransfer`].
///
/// Refills its buffer one block at a time, only when drained, and never
/// requests past the declared file size. End of stream falls exactly at that
/// size; a refill coming up short before it is a transfer fault.
pub struct TransferStream {
    transfer: FileTransfer,
    block_size: usize,
    buf: Vec<u8>,
    buf_pos: usize,
    consumed: i64,
}

impl TransferStream {
    pub fn new(transfer: FileTransfer) -> TransferStream {
        Self::with_block_size(transfer, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(transfer: FileTransfer, block_size: usize) -> TransferStream {
        TransferStream {
            transfer,
            block_size: block_size.max(1),
            buf: Vec::new(),
            buf_pos: 0,
            consumed: 0,
        }
    }

    /// Declared file size in bytes.
    pub fn size(&self) -> i64 {
        self.transfer.size()
    }

    /// Bytes handed out so far.
    pub fn position(&self) -> i64 {
        self.consumed
    }

    /// Read up to `dest.len()` bytes. Returns 0 exactly when `position()`
    /// has reached the declared size.
    pub async fn read(&mut self, dest: &mut [u8]) -> Result<usize, ClientError> {
        if dest.is_empty() {
            return Ok(0);
        }
        if self.buf_pos == self.buf.len() {
            let remaining = self.transfer.size() - self.consumed;
            if remaining <= 0 {
                return Ok(0);
            }
            let want = (self.block_size as i64).min(remaining) as usize;
            self.buf.resize(want, 0);
            self.buf_pos = 0;
            let got = self.transfer.request_block(&mut self.buf).await?;
            if got < want {
                return Err(ClientError::Transfer(format!(
                    "short block: got {got} of {want} with {remaining} bytes left"
                )));
            }
            trace!("stream refill: {got} bytes at offset {}", self.consumed);
        }
        let n = (self.buf.len() - self.buf_pos).min(dest.len());
        dest[..n].copy_from_slice(&self.buf[self.buf_pos..self.buf_pos + n]);
        self.buf_pos += n;
        self.consumed += n as i64;
        Ok(n)
    }

    /// Read everything from the current position to the declared size.
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize, ClientError> {
        let mut total = 0;
        let mut chunk = vec![0u8; self.block_size];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(total);
            }
            out.extend_from_slice(&chunk[..n]);
            total += n;
        }
    }

    /// Complete the underlying session and release the data channel.
    pub async fn close(&mut self) {
        self.transfer.close().await;
    }

    /// Give the underlying session back, discarding any buffered bytes.
    pub fn into_inner(self) -> FileTransfer {
        self.transfer
    }
}
