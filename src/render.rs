//! Response rendering and transmission.
//!
//! Every response is a status line, the rendered html page and, usually, an
//! image. Payloads are written in chunks whose sizes come from a
//! [`ChunkPolicy`]; the default policy picks pseudo-random sizes so that
//! clients see plenty of short reads. The active [`FaultMode`] is applied
//! here as well:
//!
//! - `SmallerDeclaredLength` announces `len - len / 3` bytes but sends `len`
//! - `PrematureClose` sends only half of the ok image
//! - `WriteDelay` sleeps after every chunk
//! - `HtmlOnlyReply` omits the image
//! - `HugeFile` inserts a filler file before the image

use crate::assets::{self, ERROR_PNG, OK_PNG};
use crate::fault::FaultMode;
use crate::protocol::response::{status_line, FileHeader};
use crate::protocol::{
    Status, ERROR_IMAGE_NAME, FILLER_NAME, OK_IMAGE_NAME, RESPONSE_PAGE_NAME,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Pause inserted between chunks in `WriteDelay` mode.
pub const WRITE_DELAY: Duration = Duration::from_millis(200);

/// Size of the filler file in `HugeFile` mode (1 GiB).
pub const HUGE_FILE_BYTES: u64 = 1024 * 1024 * 1024;

/// Block size used when writing filler bytes.
const FILLER_BLOCK: usize = 1024;

/// Decides how many bytes go into the next write.
pub trait ChunkPolicy: Send {
    /// Return a size in `1..=remaining`. `remaining` is never zero.
    fn next_chunk(&mut self, remaining: usize) -> usize;
}

/// Uniformly random chunk sizes.
#[derive(Debug, Clone)]
pub struct RandomChunks {
    rng: SmallRng,
}

impl RandomChunks {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl ChunkPolicy for RandomChunks {
    fn next_chunk(&mut self, remaining: usize) -> usize {
        self.rng.gen_range(1..=remaining)
    }
}

/// Chunks of at most a fixed size.
#[derive(Debug, Clone, Copy)]
pub struct FixedChunks(pub usize);

impl ChunkPolicy for FixedChunks {
    fn next_chunk(&mut self, remaining: usize) -> usize {
        remaining.min(self.0.max(1))
    }
}

/// Seed derived from the wall clock, taken once per process.
pub fn process_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default()
}

/// Fault related rendering settings, fixed for the process lifetime.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions {
    pub fault: FaultMode,
    pub write_delay: Duration,
    pub huge_file_bytes: u64,
}

impl RenderOptions {
    pub fn new(fault: FaultMode) -> Self {
        Self {
            fault,
            write_delay: WRITE_DELAY,
            huge_file_bytes: HUGE_FILE_BYTES,
        }
    }
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self::new(FaultMode::None)
    }
}

/// Role of a file within a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    Page,
    OkImage,
    ErrorImage,
}

/// A file segment to be sent.
#[derive(Debug, Clone, Copy)]
pub struct OutgoingFile<'a> {
    pub name: &'a str,
    pub payload: &'a [u8],
    pub role: FileRole,
}

impl<'a> OutgoingFile<'a> {
    pub fn new(name: &'a str, payload: &'a [u8], role: FileRole) -> Self {
        Self {
            name,
            payload,
            role,
        }
    }
}

/// Writes responses to one connection.
pub struct Renderer<W, C> {
    out: W,
    chunks: C,
    options: RenderOptions,
    sent: u64,
}

impl<W, C> Renderer<W, C>
where
    W: AsyncWrite + Unpin,
    C: ChunkPolicy,
{
    pub fn new(out: W, chunks: C, options: RenderOptions) -> Self {
        Self {
            out,
            chunks,
            options,
            sent: 0,
        }
    }

    /// Total bytes written so far.
    pub fn bytes_sent(&self) -> u64 {
        self.sent
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Send the response for an accepted post.
    pub async fn ok_response(&mut self, url: &str) -> io::Result<()> {
        let page = assets::render_ok_page(url);
        self.respond(
            Status::Ok,
            OutgoingFile::new(RESPONSE_PAGE_NAME, page.as_bytes(), FileRole::Page),
            OutgoingFile::new(OK_IMAGE_NAME, OK_PNG, FileRole::OkImage),
        )
        .await
    }

    /// Send the response for a rejected post.
    pub async fn error_response(&mut self, status: Status, message: &str) -> io::Result<()> {
        let page = assets::render_error_page(message);
        self.respond(
            status,
            OutgoingFile::new(RESPONSE_PAGE_NAME, page.as_bytes(), FileRole::Page),
            OutgoingFile::new(ERROR_IMAGE_NAME, ERROR_PNG, FileRole::ErrorImage),
        )
        .await
    }

    /// Send a status, a page and an image, subject to the fault mode.
    pub async fn respond(
        &mut self,
        status: Status,
        page: OutgoingFile<'_>,
        image: OutgoingFile<'_>,
    ) -> io::Result<()> {
        self.write_status(status).await?;
        self.send_file(page).await?;

        if self.options.fault != FaultMode::HtmlOnlyReply {
            if self.options.fault == FaultMode::HugeFile {
                self.send_filler().await?;
            }
            self.send_file(image).await?;
        }

        self.out.flush().await?;
        debug!(%status, bytes = self.sent, "Response sent");
        Ok(())
    }

    async fn write_status(&mut self, status: Status) -> io::Result<()> {
        self.write_in_chunks(status_line(status).as_bytes()).await
    }

    async fn send_file(&mut self, file: OutgoingFile<'_>) -> io::Result<()> {
        let len = file.payload.len();
        let declared = match self.options.fault {
            FaultMode::SmallerDeclaredLength => len - len / 3,
            _ => len,
        };
        let header = FileHeader::new(file.name, declared as u64);
        self.write_in_chunks(header.encode().as_bytes()).await?;

        let payload = match (self.options.fault, file.role) {
            (FaultMode::PrematureClose, FileRole::OkImage) => &file.payload[..len / 2],
            _ => file.payload,
        };
        trace!(name = file.name, declared, sent = payload.len(), "Sending file");
        self.write_in_chunks(payload).await
    }

    async fn send_filler(&mut self) -> io::Result<()> {
        let total = self.options.huge_file_bytes;
        let header = FileHeader::new(FILLER_NAME, total);
        self.write_in_chunks(header.encode().as_bytes()).await?;

        let block = [b' '; FILLER_BLOCK];
        let mut remaining = total;
        while remaining > 0 {
            let n = remaining.min(FILLER_BLOCK as u64) as usize;
            self.out.write_all(&block[..n]).await?;
            self.sent += n as u64;
            remaining -= n as u64;
            trace!(remaining, "Wrote filler block");
        }
        Ok(())
    }

    async fn write_in_chunks(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut remaining = buf;
        while !remaining.is_empty() {
            let size = self.chunks.next_chunk(remaining.len()).clamp(1, remaining.len());
            let n = self.out.write(&remaining[..size]).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            trace!(bytes = n, "Wrote chunk");
            remaining = &remaining[n..];
            self.sent += n as u64;

            if self.options.fault == FaultMode::WriteDelay {
                tokio::time::sleep(self.options.write_delay).await;
            }
        }
        Ok(())
    }
}
