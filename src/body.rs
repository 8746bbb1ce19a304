//! Component C: body handles, either an in-memory buffer or a streaming
//! producer/consumer pipe (§4.C, §5).
//!
//! The streaming variant follows the same pattern as turning
//! guest-produced bytes into an HTTP body via an mpsc channel fed into
//! `axum::body::Body::from_stream`. We do the same thing in the other
//! direction (guest writes -> subrequest body) using
//! `reqwest::Body::wrap_stream` over a bounded channel, which gives the
//! backpressure §4.C and §5 ask for "for free" instead of hand
//! rolling an OS pipe.

use bytes::{Bytes, BytesMut};
use std::io;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{XqdError, XqdResult};

/// Bounded channel capacity between a guest's `body_write` calls and the
/// subrequest that eventually reads them (§4.C, §5: "128 x 8KB").
pub const STREAM_CHANNEL_CAPACITY: usize = 128;

pub enum BodyEntry {
    Buffered(BufferedBody),
    Streaming(StreamingBody),
}

impl Default for BodyEntry {
    fn default() -> Self {
        BodyEntry::Buffered(BufferedBody::default())
    }
}

impl BodyEntry {
    /// Total bytes seen so far: the in-buffer length, or the cumulative
    /// count of bytes a streaming body has accepted (§4.C: "best
    /// effort" for the streaming case, since bytes already drained out of
    /// the channel are no longer held anywhere).
    pub fn size(&self) -> u64 {
        match self {
            BodyEntry::Buffered(b) => b.buf.len() as u64,
            BodyEntry::Streaming(s) => s.accepted,
        }
    }

    pub fn append(&mut self, data: &[u8]) -> XqdResult<()> {
        match self {
            BodyEntry::Buffered(b) => {
                b.buf.extend_from_slice(data);
                Ok(())
            }
            BodyEntry::Streaming(s) => s.write(data),
        }
    }

    /// Same as `append`, but a full streaming channel suspends the
    /// caller instead of erroring, giving `body_write` real backpressure
    /// (§4.C, §5: "Producer blocks on full queue -> natural
    /// backpressure"). Buffered bodies can't be full, so this never
    /// actually awaits for them.
    pub async fn append_blocking(&mut self, data: &[u8]) -> XqdResult<()> {
        match self {
            BodyEntry::Buffered(b) => {
                b.buf.extend_from_slice(data);
                Ok(())
            }
            BodyEntry::Streaming(s) => s.write_blocking(data).await,
        }
    }

    /// Reads up to `max_len` bytes starting at the buffered body's read
    /// cursor, advancing it. Streaming bodies are write-only from the
    /// guest's perspective once activated; reading back from one is not
    /// part of the ABI surface.
    pub fn read(&mut self, max_len: usize) -> XqdResult<Vec<u8>> {
        match self {
            BodyEntry::Buffered(b) => {
                let start = b.cursor.min(b.buf.len());
                let end = start.saturating_add(max_len).min(b.buf.len());
                let chunk = b.buf[start..end].to_vec();
                b.cursor = end;
                Ok(chunk)
            }
            BodyEntry::Streaming(_) => Err(XqdError::Unsupported),
        }
    }

    /// Reads every remaining byte from the cursor onward (used when
    /// assembling a finished body for `resp_send_downstream`).
    pub fn read_all(&mut self) -> XqdResult<Vec<u8>> {
        let remaining = match self {
            BodyEntry::Buffered(b) => b.buf.len() - b.cursor.min(b.buf.len()),
            BodyEntry::Streaming(_) => return Err(XqdError::Unsupported),
        };
        self.read(remaining)
    }

    /// Converts a buffered body into a streaming one in place, as
    /// `req_send_async_streaming` requires (§4.G). Any bytes already
    /// buffered are replayed onto the channel first so ordering is
    /// preserved (§5: "within one body, writes are ordered").
    pub fn activate_streaming(&mut self) -> mpsc::Receiver<io::Result<Bytes>> {
        let (existing, accepted) = match self {
            BodyEntry::Buffered(b) => (std::mem::take(&mut b.buf), b.buf.len() as u64),
            BodyEntry::Streaming(_) => {
                // Already streaming: hand back a fresh receiver is not
                // possible once the first one was taken, so this is a
                // caller bug; treat as a no-op empty channel.
                let (_tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
                return rx;
            }
        };
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        if !existing.is_empty() {
            let _ = tx.try_send(Ok(Bytes::from(existing.to_vec())));
        }
        *self = BodyEntry::Streaming(StreamingBody { tx, accepted });
        rx
    }
}

#[derive(Default)]
pub struct BufferedBody {
    buf: BytesMut,
    cursor: usize,
}

pub struct StreamingBody {
    tx: mpsc::Sender<io::Result<Bytes>>,
    accepted: u64,
}

impl StreamingBody {
    fn write(&mut self, data: &[u8]) -> XqdResult<()> {
        self.accepted += data.len() as u64;
        match self.tx.try_send(Ok(Bytes::copy_from_slice(data))) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Backpressure: the guest call is expected to block until
                // there is room. `try_send` can't block, so callers that
                // need blocking semantics use `write_blocking` below.
                Err(XqdError::Internal("stream buffer full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Reader side went away early (§4.C: "continue
                // draining... discarding data silently" -- from the
                // writer's perspective that means writes simply succeed
                // as no-ops instead of erroring out the guest).
                Ok(())
            }
        }
    }

    /// Async variant used by the ABI layer so a full channel really does
    /// suspend the calling task instead of erroring.
    pub async fn write_blocking(&mut self, data: &[u8]) -> XqdResult<()> {
        self.accepted += data.len() as u64;
        match self.tx.send(Ok(Bytes::copy_from_slice(data))).await {
            Ok(()) => Ok(()),
            Err(_closed) => Ok(()),
        }
    }
}

/// Builds a `reqwest::Body` from a streaming channel's receiver.
pub fn streaming_reqwest_body(rx: mpsc::Receiver<io::Result<Bytes>>) -> reqwest::Body {
    reqwest::Body::wrap_stream(ReceiverStream::new(rx))
}
