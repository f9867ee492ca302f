// src/mirror/pacing.rs
//! Process-wide bandwidth ceiling
//!
//! One [`Pacer`] is shared by every transfer. Each chunk reserves its
//! transmission slot on a shared virtual clock; the copying task sleeps
//! until its slot ends, so the aggregate rate stays at the ceiling no
//! matter how many transfers run.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

/// Copy buffer for paced transfers
const PACED_CHUNK_SIZE: usize = 16 * 1024;

/// Shared rate limiter over all transfers
#[derive(Debug)]
pub struct Pacer {
    bytes_per_sec: f64,
    /// End of the last reserved slot
    next_free: Mutex<Instant>,
}

impl Pacer {
    /// Pacer for a positive byte rate
    pub fn new(bytes_per_sec: f64) -> Self {
        Self {
            bytes_per_sec,
            next_free: Mutex::new(Instant::now()),
        }
    }

    /// Pacer for a ceiling in Mbit/s; `None` when unlimited (0 or less)
    pub fn from_mbits(mbits: f64) -> Option<Self> {
        (mbits > 0.0).then(|| Self::new(mbits * 1_000_000.0 / 8.0))
    }

    pub fn bytes_per_sec(&self) -> f64 {
        self.bytes_per_sec
    }

    /// Reserve the slot for `bytes` and return the instant it ends
    ///
    /// Idle time is not banked: a slot starts no earlier than now.
    pub fn reserve(&self, bytes: usize) -> Instant {
        let cost = Duration::from_secs_f64(bytes as f64 / self.bytes_per_sec);
        let now = Instant::now();

        let mut next_free = self.next_free.lock();
        let start = (*next_free).max(now);
        let end = start + cost;
        *next_free = end;
        end
    }

    /// Wait out the slot for `bytes`
    pub async fn pace(&self, bytes: usize) {
        let deadline = self.reserve(bytes);
        tokio::time::sleep_until(deadline).await;
    }
}

/// Copy `reader` into `writer`, honouring the pacer when one is given
///
/// Returns the number of bytes copied.
pub async fn copy_paced<R, W>(
    reader: &mut R,
    writer: &mut W,
    pacer: Option<&Pacer>,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let Some(pacer) = pacer else {
        let copied = tokio::io::copy(reader, writer).await?;
        writer.flush().await?;
        return Ok(copied);
    };

    let mut buffer = vec![0u8; PACED_CHUNK_SIZE];
    let mut copied = 0u64;

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        copied += n as u64;
        pacer.pace(n).await;
    }

    writer.flush().await?;
    Ok(copied)
}
