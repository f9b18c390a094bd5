//! TCP connection to the backend: version negotiation, command gating,
//! and event-mode demultiplexing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use pvrlink_protocol::{
    codec, commands, ClientError, Frame, ProtocolVersion, CMD_ANN, CMD_DONE, CMD_PROTO_VERSION,
    REPLY_ACCEPT, REPLY_REJECT,
};

use crate::client::events::{Event, EventListener, ListenerId, ListenerSet};
use crate::config::ConnectionConfig;

/// How long `close()` waits for the background tasks to stop.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection role declared by the announce handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceMode {
    Playback,
    Monitor,
    FileTransfer,
}

impl AnnounceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceMode::Playback => "Playback",
            AnnounceMode::Monitor => "Monitor",
            AnnounceMode::FileTransfer => "FileTransfer",
        }
    }
}

/// Incremental frame reader over the socket's read half.
pub(crate) struct FrameReader {
    read_half: OwnedReadHalf,
    buf: BytesMut,
    version: ProtocolVersion,
    read_timeout: Duration,
}

impl FrameReader {
    fn new(read_half: OwnedReadHalf, version: ProtocolVersion, read_timeout: Duration) -> Self {
        Self {
            read_half,
            buf: BytesMut::with_capacity(8192),
            version,
            read_timeout,
        }
    }

    fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    /// Read one complete frame, blocking up to `read_timeout` per socket
    /// read. Partial frames stay buffered across calls.
    async fn read_frame(&mut self) -> Result<Frame, ClientError> {
        loop {
            if let Some(frame) = codec::decode(&mut self.buf, self.version)? {
                return Ok(frame);
            }
            let n = timeout(self.read_timeout, self.read_half.read_buf(&mut self.buf))
                .await
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "socket read timed out")
                })??;
            if n == 0 {
                return Err(ClientError::ConnectionClosed);
            }
        }
    }

    /// Whether a complete frame is available without blocking. Drains any
    /// bytes the socket currently holds.
    fn poll_available(&mut self) -> Result<bool, ClientError> {
        loop {
            if codec::frame_len(&self.buf)?.is_some() {
                return Ok(true);
            }
            match self.read_half.try_read_buf(&mut self.buf) {
                Ok(0) => return Err(ClientError::ConnectionClosed),
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(codec::frame_len(&self.buf)?.is_some())
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub(crate) fn into_parts(self) -> (OwnedReadHalf, BytesMut) {
        (self.read_half, self.buf)
    }
}

/// Where `read_response` takes frames from.
enum ReadSource {
    /// Direct socket reads (no event mode).
    Socket(FrameReader),
    /// Event mode: the reader task owns the socket; responses arrive here.
    Queue(mpsc::Receiver<Frame>),
    /// Closed, or the socket was handed off to a transfer session.
    Detached,
}

/// A negotiated connection to the backend.
///
/// Exactly one announce per connection; event mode may be enabled once
/// after announcing. Callers serialize their own writes; the engine only
/// guards the write half against interleaved byte streams.
pub struct BackendConnection {
    config: ConnectionConfig,
    version: ProtocolVersion,
    announced: AtomicBool,
    event_mode: AtomicBool,
    closed: AtomicBool,
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    reader: AsyncMutex<ReadSource>,
    listeners: Arc<ListenerSet>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BackendConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConnection")
            .field("server_addr", &self.config.server_addr)
            .field("version", &self.version)
            .field("announced", &self.announced.load(Ordering::Relaxed))
            .field("event_mode", &self.event_mode.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BackendConnection {
    /// Connect and negotiate a protocol version.
    ///
    /// Offers the newest known version (or `config.start_version`) and walks
    /// down on every `REJECT` until the backend accepts or no lower known
    /// version remains.
    pub async fn open(config: ConnectionConfig) -> Result<BackendConnection, ClientError> {
        let start = match config.start_version {
            Some(value) => ProtocolVersion::from_value(value).ok_or_else(|| {
                ClientError::ProtocolViolation(format!("unknown protocol version {value}"))
            })?,
            None => ProtocolVersion::latest(),
        };

        debug!("connecting to {}", config.server_addr);
        let stream = timeout(
            config.connect_timeout,
            TcpStream::connect(&config.server_addr),
        )
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "tcp connect timed out")
        })??;
        stream.set_nodelay(true)?;

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half, start, config.read_timeout);

        let version = negotiate(&mut reader, &mut write_half, start).await?;
        reader.set_version(version);
        info!(
            "negotiated protocol version {version} with {}",
            config.server_addr
        );

        Ok(BackendConnection {
            config,
            version,
            announced: AtomicBool::new(false),
            event_mode: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            writer: AsyncMutex::new(Some(write_half)),
            reader: AsyncMutex::new(ReadSource::Socket(reader)),
            listeners: Arc::new(ListenerSet::default()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The version negotiated for this connection.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_announced(&self) -> bool {
        self.announced.load(Ordering::Acquire)
    }

    /// Write one request frame, enforcing the gating rules:
    /// only the handshake allow-list before announce, `ANN` at most once,
    /// and every command inside its supported version range.
    pub async fn write_request(&self, frame: &Frame) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::ConnectionClosed);
        }

        let cmd = frame.command_word().to_string();
        let announced = self.announced.load(Ordering::Acquire);
        if !announced && !commands::allowed_before_announce(&cmd) {
            return Err(ClientError::ProtocolViolation(format!(
                "command {cmd} sent before ANN"
            )));
        }
        if cmd == CMD_ANN && announced {
            return Err(ClientError::ProtocolViolation(
                "ANN may be sent at most once per connection".to_string(),
            ));
        }
        commands::check_supported(&cmd, self.version.value())?;

        let encoded = codec::encode(frame)?;
        let mut writer = self.writer.lock().await;
        let write_half = writer.as_mut().ok_or(ClientError::ConnectionClosed)?;
        write_half.write_all(&encoded).await?;
        trace!("sent {cmd} ({} bytes)", encoded.len());

        if cmd == CMD_ANN {
            self.announced.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Read the next response frame: straight off the socket before event
    /// mode, from the response queue afterwards. FIFO either way.
    pub async fn read_response(&self) -> Result<Frame, ClientError> {
        let mut source = self.reader.lock().await;
        match &mut *source {
            ReadSource::Socket(reader) => reader.read_frame().await,
            ReadSource::Queue(rx) => rx.recv().await.ok_or(ClientError::ConnectionClosed),
            ReadSource::Detached => Err(ClientError::ConnectionClosed),
        }
    }

    /// Whether `read_response` would return without blocking. A dead
    /// connection surfaces here the same way it does from `read_response`,
    /// so pollers never spin on a queue that can no longer fill.
    pub async fn can_read_response(&self) -> Result<bool, ClientError> {
        let mut source = self.reader.lock().await;
        match &mut *source {
            ReadSource::Socket(reader) => reader.poll_available(),
            ReadSource::Queue(rx) => {
                if !rx.is_empty() {
                    Ok(true)
                } else if rx.is_closed() {
                    Err(ClientError::ConnectionClosed)
                } else {
                    Ok(false)
                }
            }
            ReadSource::Detached => Err(ClientError::ConnectionClosed),
        }
    }

    /// Announce this connection's role. Must succeed before any
    /// non-handshake command is accepted.
    pub async fn announce(&self, mode: AnnounceMode, want_events: bool) -> Result<(), ClientError> {
        let frame = Frame::new(
            self.version,
            [format!(
                "{CMD_ANN} {} {} {}",
                mode.as_str(),
                self.config.client_name,
                want_events as u8
            )],
        )?;
        self.write_request(&frame).await?;
        let reply = self.read_response().await?;
        if reply.fields()[0] != "OK" {
            return Err(ClientError::ProtocolViolation(format!(
                "announce rejected: {:?}",
                reply.fields()
            )));
        }
        Ok(())
    }

    /// Register an event listener. Takes effect for the next dispatched
    /// event, including while a dispatch is in flight.
    pub fn add_event_listener(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Switch to event mode: the socket's read side moves into a background
    /// reader task that routes `BACKEND_MESSAGE` frames to the dispatcher
    /// and everything else to the response queue. Valid once, and only on
    /// an announced connection.
    pub async fn enable_event_mode(&self) -> Result<(), ClientError> {
        if !self.announced.load(Ordering::Acquire) {
            return Err(ClientError::ProtocolViolation(
                "event mode requires an announced connection".to_string(),
            ));
        }
        if self.event_mode.swap(true, Ordering::AcqRel) {
            return Err(ClientError::ProtocolViolation(
                "event mode already enabled".to_string(),
            ));
        }

        let mut source = self.reader.lock().await;
        let frame_reader = match std::mem::replace(&mut *source, ReadSource::Detached) {
            ReadSource::Socket(reader) => reader,
            other => {
                *source = other;
                return Err(ClientError::ConnectionClosed);
            }
        };

        let (resp_tx, resp_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        *source = ReadSource::Queue(resp_rx);
        drop(source);

        let reader_handle = tokio::spawn(reader_task(
            frame_reader,
            resp_tx,
            event_tx,
            self.config.event_read_budget,
        ));
        let dispatcher_handle = tokio::spawn(dispatcher_task(
            event_rx,
            Arc::clone(&self.listeners),
        ));
        self.tasks.lock().extend([reader_handle, dispatcher_handle]);
        debug!("event mode enabled");
        Ok(())
    }

    /// Close the connection. Idempotent: stops the background tasks with a
    /// bounded join, sends a best-effort `DONE` (end-of-stream counts as
    /// success), and releases the socket whatever happens along the way.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        if !handles.is_empty()
            && timeout(SHUTDOWN_JOIN_TIMEOUT, futures::future::join_all(handles))
                .await
                .is_err()
        {
            warn!("background tasks did not stop within the shutdown window");
        }

        if let Some(mut write_half) = self.writer.lock().await.take() {
            if let Ok(frame) = Frame::new(self.version, [CMD_DONE]) {
                if let Ok(encoded) = codec::encode(&frame) {
                    if let Err(e) = write_half.write_all(&encoded).await {
                        // Peer already gone is fine; we were saying goodbye.
                        debug!("disconnect frame not delivered: {e}");
                    }
                }
            }
            let _ = write_half.shutdown().await;
        }

        *self.reader.lock().await = ReadSource::Detached;
        info!("connection to {} closed", self.config.server_addr);
    }

    /// Tear the connection down to its raw socket halves, for the transfer
    /// data channel once its announce handshake is complete.
    pub(crate) fn into_raw_parts(
        self,
    ) -> Result<(OwnedReadHalf, BytesMut, OwnedWriteHalf), ClientError> {
        let writer = self
            .writer
            .into_inner()
            .ok_or(ClientError::ConnectionClosed)?;
        match self.reader.into_inner() {
            ReadSource::Socket(reader) => {
                let (read_half, buf) = reader.into_parts();
                Ok((read_half, buf, writer))
            }
            _ => Err(ClientError::ProtocolViolation(
                "data connection is no longer in direct-read mode".to_string(),
            )),
        }
    }
}

async fn negotiate(
    reader: &mut FrameReader,
    writer: &mut OwnedWriteHalf,
    start: ProtocolVersion,
) -> Result<ProtocolVersion, ClientError> {
    let floor = ProtocolVersion::floor().value();
    let mut version = start;

    loop {
        let mut fields = vec![CMD_PROTO_VERSION.to_string(), version.value().to_string()];
        if let Some(token) = version.token() {
            fields.push(token.to_string());
        }
        let frame = Frame::new(version, fields)?;
        writer.write_all(&codec::encode(&frame)?).await?;

        let reply = reader.read_frame().await?;
        match reply.fields()[0].as_str() {
            REPLY_ACCEPT => {
                debug!("backend accepted protocol version {version}");
                return Ok(version);
            }
            REPLY_REJECT => {
                let server: u32 = reply.field(1)?.parse().map_err(|_| {
                    ClientError::ProtocolViolation(
                        "REJECT reply carries no usable version".to_string(),
                    )
                })?;
                if server >= version.value() {
                    // A reject pointing at or above our offer cannot converge.
                    return Err(ClientError::NegotiationFailed {
                        lowest_offered: version.value(),
                        floor,
                    });
                }
                match ProtocolVersion::at_or_below(server) {
                    Some(next) => {
                        warn!("backend rejected version {version}, retrying at {next}");
                        version = next;
                    }
                    None => {
                        return Err(ClientError::NegotiationFailed {
                            lowest_offered: version.value(),
                            floor,
                        })
                    }
                }
            }
            other => {
                return Err(ClientError::ProtocolViolation(format!(
                    "unexpected handshake reply: {other:?}"
                )))
            }
        }
    }
}

/// Background task owning the socket's read side in event mode.
///
/// Classifies every inbound frame (event marker vs response). A read
/// timeout inside the configured budget retries; the budget is checked as
/// an explicit deadline before each read. Any other failure, or budget
/// exhaustion, becomes a synthesized error event and ends the task.
async fn reader_task(
    mut reader: FrameReader,
    resp_tx: mpsc::Sender<Frame>,
    event_tx: mpsc::Sender<Event>,
    budget: Option<Duration>,
) {
    let mut deadline = budget.map(|b| Instant::now() + b);

    loop {
        if let Some(d) = deadline {
            if Instant::now() >= d {
                let err = ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "event read budget exhausted",
                ));
                let _ = event_tx.send(Event::from_client_error(&err)).await;
                break;
            }
        }

        match reader.read_frame().await {
            Ok(frame) => {
                deadline = budget.map(|b| Instant::now() + b);
                if frame.is_event() {
                    trace!("event frame: {:?}", frame.fields().get(1));
                    if event_tx.send(Event::from_backend_frame(&frame)).await.is_err() {
                        break;
                    }
                } else if resp_tx.send(frame).await.is_err() {
                    debug!("response queue dropped, reader task stopping");
                    break;
                }
            }
            Err(err) if err.is_timeout() && deadline.is_some() => {
                trace!("read timed out inside the budget, retrying");
            }
            Err(err) => {
                warn!("reader task stopping: {err}");
                let _ = event_tx.send(Event::from_client_error(&err)).await;
                break;
            }
        }
    }
}

/// Background task fanning events out to listeners, in arrival order.
async fn dispatcher_task(mut event_rx: mpsc::Receiver<Event>, listeners: Arc<ListenerSet>) {
    while let Some(event) = event_rx.recv().await {
        listeners.dispatch(&event);
    }
    debug!("dispatcher task finished");
}
