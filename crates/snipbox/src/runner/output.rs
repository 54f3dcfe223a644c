//! Byte-capped capture of child output

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Read size used by [`drain`]
const CHUNK_SIZE: usize = 8 * 1024;

/// Accumulates at most `cap` bytes while counting everything pushed
#[derive(Debug, Clone)]
pub struct CappedBuffer {
    cap: usize,
    bytes: Vec<u8>,
    total: u64,
}

impl CappedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            bytes: Vec::new(),
            total: 0,
        }
    }

    /// Append `chunk`, keeping only what fits under the cap
    ///
    /// Returns true if this push is the one that first crossed the cap.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        let was_truncated = self.truncated();
        self.total += chunk.len() as u64;

        let room = self.cap.saturating_sub(self.bytes.len());
        let take = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..take]);

        !was_truncated && self.truncated()
    }

    /// Check if more bytes were pushed than the cap allows
    pub fn truncated(&self) -> bool {
        self.total > self.cap as u64
    }

    /// Number of bytes pushed, stored or not
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Stored bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Lossy UTF-8 text, never longer than the cap
    ///
    /// Replacement characters can make the decoded text longer than the raw
    /// bytes, so the result is cut back to the last char boundary under the cap.
    pub fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if text.len() > self.cap {
            let mut end = self.cap;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        text
    }
}

/// Read `reader` to EOF into `buffer`
///
/// Bytes past the cap are read and discarded so the writer never blocks on a
/// full pipe. `overflow` is notified once, when the cap is first exceeded. A
/// read error ends the drain early with whatever was captured.
pub async fn drain<R>(mut reader: R, buffer: &mut CappedBuffer, overflow: Option<&Notify>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; CHUNK_SIZE];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if buffer.push(&chunk[..n]) {
                    debug!(cap = buffer.cap(), "output cap exceeded");
                    if let Some(notify) = overflow {
                        notify.notify_one();
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "output read error");
                break;
            }
        }
    }
}
