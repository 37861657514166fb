//! Framed Channel
//!
//! Wraps a connected duplex byte stream and exposes it as a sequence of
//! [`CommandRecord`]s. The same framing is used for the device link and for
//! the relay link to the presentation peer.
//!
//! A channel is split into two halves:
//!
//! - [`ChannelReader`], owned by exactly one task, pulls records with a
//!   bounded poll timeout
//! - [`ChannelSender`], cheaply cloneable, serialises writes so that a record
//!   is never interleaved with another
//!
//! Writes are bounded by a write timeout, so a peer that stops reading
//! surfaces as [`ProtocolError::Timeout`] instead of a stuck writer.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use synchrony_protocol::{CommandRecord, FramedChannel};
//!
//! # tokio_test::block_on(async {
//! let (left, right) = tokio::io::duplex(1024);
//! let device = FramedChannel::new(left);
//! let (mut desktop, _desktop_tx) = FramedChannel::new(right).into_parts();
//!
//! device.sender().send("server_heartbeat", None).await.unwrap();
//!
//! let records = desktop.receive(Duration::from_secs(1)).await.unwrap();
//! assert_eq!(records, vec![CommandRecord::bare("server_heartbeat")]);
//! # });
//! ```

mod codec;

pub use codec::{DelimiterCodec, DEFAULT_MAX_FRAME_BYTES};

use crate::command::CommandRecord;
use crate::{ProtocolError, Result};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

/// Any connected, bidirectional byte stream
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Boxed stream as handed out by connectors
pub type BoxedStream = Box<dyn ByteStream>;

const READ_CHUNK: usize = 4096;

/// Default bound on writing and flushing one record
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Read and write halves of one framed connection
pub struct FramedChannel {
    reader: ChannelReader,
    sender: ChannelSender,
}

impl FramedChannel {
    /// Frame a stream with the default frame bound
    pub fn new<S: ByteStream + 'static>(stream: S) -> Self {
        Self::with_max_frame(Box::new(stream), DEFAULT_MAX_FRAME_BYTES)
    }

    /// Frame an already boxed stream with an explicit frame bound
    pub fn with_max_frame(stream: BoxedStream, max_frame_bytes: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);

        Self {
            reader: ChannelReader {
                reader: read_half,
                codec: DelimiterCodec::with_max_length(max_frame_bytes),
                buffer: BytesMut::with_capacity(READ_CHUNK),
            },
            sender: ChannelSender {
                writer: Arc::new(Mutex::new(write_half)),
                write_timeout: DEFAULT_WRITE_TIMEOUT,
            },
        }
    }

    /// Bound every write, lock wait included, by `write_timeout`
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.sender.write_timeout = write_timeout;
        self
    }

    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    pub async fn receive(&mut self, poll_timeout: Duration) -> Result<Vec<CommandRecord>> {
        self.reader.receive(poll_timeout).await
    }

    pub fn into_parts(self) -> (ChannelReader, ChannelSender) {
        (self.reader, self.sender)
    }
}

/// Receiving half of a [`FramedChannel`]
pub struct ChannelReader {
    reader: ReadHalf<BoxedStream>,
    codec: DelimiterCodec,
    buffer: BytesMut,
}

impl ChannelReader {
    /// Wait up to `poll_timeout` for data and return every complete record
    ///
    /// An elapsed timeout yields an empty vector; it only means nothing
    /// arrived in the window. End of stream and I/O failures are errors.
    /// Records that fail to decode are logged and skipped.
    ///
    /// Cancel safe: dropping the future loses no buffered bytes.
    pub async fn receive(&mut self, poll_timeout: Duration) -> Result<Vec<CommandRecord>> {
        self.buffer.reserve(READ_CHUNK);

        match timeout(poll_timeout, self.reader.read_buf(&mut self.buffer)).await {
            Err(_) => return Ok(Vec::new()),
            Ok(Err(e)) => return Err(ProtocolError::from_io_error(e, "reading from channel")),
            Ok(Ok(0)) => {
                return Err(ProtocolError::Transport(
                    "channel closed by peer".to_string(),
                ))
            }
            Ok(Ok(n)) => debug!("Read {} bytes from channel", n),
        }

        Ok(self.drain())
    }

    fn drain(&mut self) -> Vec<CommandRecord> {
        let mut records = Vec::new();

        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(e) => warn!("Skipping undecodable record: {}", e),
            }
        }

        records
    }
}

/// Sending half of a [`FramedChannel`]
///
/// Clones share the underlying writer; each record is written and flushed
/// while holding the lock.
#[derive(Clone)]
pub struct ChannelSender {
    writer: Arc<Mutex<WriteHalf<BoxedStream>>>,
    write_timeout: Duration,
}

impl ChannelSender {
    /// Send `keyword` or `keyword: payload`
    pub async fn send(&self, keyword: &str, payload: Option<&str>) -> Result<()> {
        self.send_record(CommandRecord::new(keyword, payload.map(str::to_string)))
            .await
    }

    pub async fn send_record(&self, record: CommandRecord) -> Result<()> {
        let mut bytes = BytesMut::new();
        DelimiterCodec::new().encode(record, &mut bytes)?;

        let write = async {
            let mut writer = self.writer.lock().await;
            writer
                .write_all(&bytes)
                .await
                .map_err(|e| ProtocolError::from_io_error(e, "writing to channel"))?;
            writer
                .flush()
                .await
                .map_err(|e| ProtocolError::from_io_error(e, "flushing channel"))
        };

        match timeout(self.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout(format!(
                "peer not reading, write stalled for {:?}",
                self.write_timeout
            ))),
        }
    }

    /// Shut down the write direction
    pub async fn close(&self) -> Result<()> {
        let close = async {
            let mut writer = self.writer.lock().await;
            writer
                .shutdown()
                .await
                .map_err(|e| ProtocolError::from_io_error(e, "closing channel"))
        };

        match timeout(self.write_timeout, close).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout(format!(
                "closing channel took longer than {:?}",
                self.write_timeout
            ))),
        }
    }
}

impl std::fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSender").finish_non_exhaustive()
    }
}
