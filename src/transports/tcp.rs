//! Line-framed TCP transport
//!
//! Each feed frame is one line of text. The handshake and any other outgoing
//! message is written as one line as well.
//!
//! Line trouble is a frame problem, not a link problem: bytes that are not
//! UTF-8 are replaced and the frame is still handed on, and a line longer
//! than the frame limit is dropped. The link stays open in both cases.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

use crate::transport::{FeedConnector, FeedEndpoint, FeedLink, LinkEvent};
use crate::{KartwallError, Result};

/// Default time allowed for the TCP connect.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest line accepted as one frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Opens line-framed TCP links to the relay.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    stale_timeout: Option<Duration>,
    max_frame_bytes: usize,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stale_timeout: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Treat a link as failed when no line arrives for this long.
    pub fn with_stale_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stale_timeout = timeout;
        self
    }

    /// Lines longer than this are skipped without ending the link.
    pub fn with_max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit.max(1);
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FeedConnector for TcpConnector {
    async fn open(&self, endpoint: &FeedEndpoint) -> Result<Box<dyn FeedLink>> {
        let address = endpoint.address();
        debug!(address = %address, "Opening TCP feed link");

        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| KartwallError::Timeout { duration: self.connect_timeout })?
            .map_err(|e| {
                KartwallError::connection_failed_with_source(
                    format!("cannot reach {}", address),
                    Box::new(e),
                )
            })?;

        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        info!(address = %address, "TCP feed link open");
        Ok(Box::new(TcpLink {
            reader: Some(BufReader::new(reader)),
            writer: Some(writer),
            line: Vec::new(),
            stale_timeout: self.stale_timeout,
            max_frame_bytes: self.max_frame_bytes,
            faulted: false,
        }))
    }
}

struct TcpLink {
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: Option<OwnedWriteHalf>,
    line: Vec<u8>,
    stale_timeout: Option<Duration>,
    max_frame_bytes: usize,
    faulted: bool,
}

/// Outcome of reading one line.
#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line,
    Oversized,
    Eof,
}

/// Read up to and including the next `\n` into `line`.
///
/// A line over `max` bytes is consumed from the socket but not kept.
async fn read_bounded_line<R>(reader: &mut R, line: &mut Vec<u8>, max: usize) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let mut oversized = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(match (oversized, line.is_empty()) {
                (true, _) => LineRead::Oversized,
                (false, true) => LineRead::Eof,
                (false, false) => LineRead::Line,
            });
        }

        let (used, complete) = match available.iter().position(|byte| *byte == b'\n') {
            Some(end) => (end + 1, true),
            None => (available.len(), false),
        };
        if !oversized {
            if line.len() + used > max {
                oversized = true;
                line.clear();
            } else {
                line.extend_from_slice(&available[..used]);
            }
        }
        reader.consume(used);

        if complete {
            return Ok(if oversized { LineRead::Oversized } else { LineRead::Line });
        }
    }
}

impl TcpLink {
    fn shut(&mut self) {
        self.reader = None;
        self.writer = None;
    }
}

#[async_trait::async_trait]
impl FeedLink for TcpLink {
    async fn send(&mut self, message: &str) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| KartwallError::connection_failed("link is closed"))?;

        let mut payload = String::with_capacity(message.len() + 1);
        payload.push_str(message);
        payload.push('\n');

        writer.write_all(payload.as_bytes()).await.map_err(|e| {
            KartwallError::connection_failed_with_source("write to feed failed", Box::new(e))
        })?;
        writer.flush().await.map_err(|e| {
            KartwallError::connection_failed_with_source("flush to feed failed", Box::new(e))
        })
    }

    async fn next_event(&mut self) -> LinkEvent {
        if self.faulted {
            self.shut();
            return LinkEvent::Closed;
        }

        loop {
            let Some(reader) = self.reader.as_mut() else {
                return LinkEvent::Closed;
            };

            let max = self.max_frame_bytes;
            let read = match self.stale_timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, read_bounded_line(reader, &mut self.line, max)).await {
                        Ok(read) => read,
                        Err(_) => {
                            self.faulted = true;
                            return LinkEvent::Error(KartwallError::Timeout { duration: limit });
                        }
                    }
                }
                None => read_bounded_line(reader, &mut self.line, max).await,
            };

            match read {
                Ok(LineRead::Eof) => {
                    debug!("Relay closed TCP feed link");
                    self.shut();
                    return LinkEvent::Closed;
                }
                Ok(LineRead::Oversized) => {
                    warn!(limit = max, "Skipped feed line over the frame size limit");
                    continue;
                }
                Ok(LineRead::Line) => {
                    let text = String::from_utf8_lossy(&self.line);
                    if matches!(text, std::borrow::Cow::Owned(_)) {
                        debug!(bytes = self.line.len(), "Feed line was not valid UTF-8, replaced bad bytes");
                    }
                    let frame = text.trim_end_matches(['\r', '\n']);
                    if frame.trim().is_empty() {
                        continue;
                    }
                    return LinkEvent::Frame(frame.to_string());
                }
                Err(e) => {
                    self.faulted = true;
                    return LinkEvent::Error(KartwallError::connection_failed_with_source(
                        "read from feed failed",
                        Box::new(e),
                    ));
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.reader = None;
    }
}
