//! Connection worker.
//!
//! One worker drives one connection from start to finish: read the request
//! until the peer half-closes, validate it, append it to the content store
//! and stream back the ok or error response. Workers share nothing mutable;
//! the only common resource is the content file, which the store serializes
//! with a file lock.

use crate::config::Config;
use crate::fault::FaultMode;
use crate::protocol::{self, Post, Status};
use crate::render::{process_seed, RandomChunks, RenderOptions, Renderer};
use crate::store::ContentStore;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Default cap on the request size in bytes.
pub const DEFAULT_MAX_REQUEST: usize = 1024;

/// Largest request cap the server accepts.
pub const MAX_REQUEST_LIMIT: usize = 16 * 1024 * 1024;

/// Initial read buffer size; larger requests grow the buffer as they arrive.
const INITIAL_READ_CAPACITY: usize = 8 * 1024;

/// Bytes read and discarded after an overflow before answering.
const DRAIN_BUDGET: u64 = 64 * 1024;

/// Time spent draining after an overflow before answering.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Immutable settings shared by all workers of a server process.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub store: Arc<ContentStore>,
    /// Caller-visible url of the bulletin board main page.
    pub board_url: String,
    pub max_request: usize,
    pub render: RenderOptions,
    /// Process-wide seed for chunk sizing.
    pub seed: u64,
}

impl WorkerContext {
    pub fn new(store: ContentStore, board_url: impl Into<String>) -> Self {
        Self {
            store: Arc::new(store),
            board_url: board_url.into(),
            max_request: DEFAULT_MAX_REQUEST,
            render: RenderOptions::default(),
            seed: process_seed(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut ctx = Self::new(ContentStore::new(&config.board_dir), &config.board_url)
            .with_fault(config.fault);
        ctx.max_request = config.max_request;
        ctx.render.huge_file_bytes = config.huge_file_bytes;
        ctx
    }

    pub fn with_fault(mut self, fault: FaultMode) -> Self {
        self.render.fault = fault;
        self
    }

    pub fn fault(&self) -> FaultMode {
        self.render.fault
    }
}

/// Who a worker is: the server program it belongs to and its sequence number.
#[derive(Debug, Clone)]
pub struct WorkerIdentity {
    pub program: String,
    pub id: u64,
    pub peer: SocketAddr,
}

impl WorkerIdentity {
    pub fn new(program: impl Into<String>, id: u64, peer: SocketAddr) -> Self {
        Self {
            program: program.into(),
            id,
            peer,
        }
    }

    pub fn name(&self) -> String {
        format!("{}[{}]", self.program, self.id)
    }

    /// Fail unless the identity is fully set.
    pub fn check(&self) -> Result<(), WorkerError> {
        if self.program.trim().is_empty() {
            return Err(WorkerError::IdentityCheck(format!(
                "program name not set for worker {}",
                self.id
            )));
        }
        if self.id == 0 {
            return Err(WorkerError::IdentityCheck(format!(
                "worker id not set for {}",
                self.program
            )));
        }
        Ok(())
    }
}

/// Ways a worker can end unsuccessfully.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Reading or writing the connection failed. No response is attempted.
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    /// The post was rejected; the error response has been delivered.
    #[error("post rejected with status {status}: {reason}")]
    Rejected { status: Status, reason: String },

    #[error("identity check failed: {0}")]
    IdentityCheck(String),

    #[error("descriptor check failed: {0}")]
    StrayDescriptor(String),

    #[error("content store task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

/// What was read from the peer.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// The peer closed without sending anything.
    Empty,
    /// The peer sent more than the limit.
    Overflow,
    Request(BytesMut),
}

/// Result of processing a request, before anything is written back.
enum Verdict {
    Accepted(Post),
    Rejected { status: Status, reason: String },
}

impl Verdict {
    fn rejected(status: Status, reason: impl Into<String>) -> Self {
        Verdict::Rejected {
            status,
            reason: reason.into(),
        }
    }
}

/// Handle one accepted TCP connection.
pub async fn handle_connection(
    stream: TcpStream,
    ctx: Arc<WorkerContext>,
    identity: WorkerIdentity,
) -> Result<(), WorkerError> {
    match ctx.fault() {
        FaultMode::CheckInvocationIdentity => identity.check()?,
        FaultMode::CheckNoStrayDescriptors => check_close_on_exec(stream.as_raw_fd())?,
        _ => {}
    }

    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Could not disable Nagle's algorithm");
    }

    let (reader, writer) = stream.into_split();
    serve(reader, writer, &ctx, &identity).await
}

/// Drive the request/response cycle over any byte stream pair.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    ctx: &WorkerContext,
    identity: &WorkerIdentity,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let verdict = process(reader, ctx).await?;

    let chunks = RandomChunks::from_seed(ctx.seed.wrapping_add(identity.id));
    let mut renderer = Renderer::new(writer, chunks, ctx.render);
    let outcome = match verdict {
        Verdict::Accepted(post) => {
            renderer.ok_response(&ctx.board_url).await?;
            info!(user = %post.user, "Post accepted");
            Ok(())
        }
        Verdict::Rejected { status, reason } => {
            renderer.error_response(status, &reason).await?;
            Err(WorkerError::Rejected { status, reason })
        }
    };

    let mut writer = renderer.into_inner();
    if ctx.fault() == FaultMode::PostponeCompletion {
        info!(
            worker = %identity.name(),
            peer = %identity.peer,
            "Postponing completion indefinitely"
        );
        std::future::pending::<()>().await;
    }
    writer.shutdown().await?;

    outcome
}

async fn process<R>(reader: R, ctx: &WorkerContext) -> Result<Verdict, WorkerError>
where
    R: AsyncRead + Unpin,
{
    let main_page = {
        let store = Arc::clone(&ctx.store);
        tokio::task::spawn_blocking(move || store.prepare_main_page()).await?
    };

    let request = match read_request(reader, ctx.max_request).await? {
        Inbound::Request(request) => request,
        Inbound::Empty => return Ok(Verdict::rejected(Status::Invalid, "no request received")),
        Inbound::Overflow => {
            return Ok(Verdict::rejected(
                Status::Overflow,
                format!(
                    "server input buffer overflow - requests are limited to {} bytes",
                    ctx.max_request
                ),
            ))
        }
    };
    debug!(bytes = request.len(), "Request received");

    if let Err(e) = main_page {
        warn!(error = %e, "Main page unavailable");
        return Ok(Verdict::rejected(
            Status::Failed,
            "server could not create main html page",
        ));
    }

    let post = match protocol::validate(&request) {
        Ok(post) => post,
        Err(rejection) => return Ok(Verdict::rejected(Status::Invalid, rejection.to_string())),
    };

    let stored = {
        let store = Arc::clone(&ctx.store);
        let post = post.clone();
        tokio::task::spawn_blocking(move || store.append(&post)).await?
    };

    match stored {
        Ok(_) => Ok(Verdict::Accepted(post)),
        Err(e) => Ok(Verdict::rejected(Status::Invalid, e.to_string())),
    }
}

/// Read until end of stream, accepting at most `limit` bytes.
///
/// Input beyond the limit is drained, within [`DRAIN_BUDGET`] bytes and
/// [`DRAIN_TIMEOUT`], so a well-behaved peer sees an orderly close rather
/// than a reset while it reads the response.
pub async fn read_request<R>(reader: R, limit: usize) -> io::Result<Inbound>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(limit.min(INITIAL_READ_CAPACITY));
    let mut limited = reader.take((limit as u64).saturating_add(1));

    while limited.read_buf(&mut buffer).await? != 0 {}

    if buffer.is_empty() {
        return Ok(Inbound::Empty);
    }
    if buffer.len() <= limit {
        return Ok(Inbound::Request(buffer));
    }

    let mut tail = limited.into_inner().take(DRAIN_BUDGET);
    match tokio::time::timeout(DRAIN_TIMEOUT, tokio::io::copy(&mut tail, &mut tokio::io::sink()))
        .await
    {
        Ok(Ok(discarded)) => debug!(discarded, "Discarded oversized request tail"),
        Ok(Err(e)) => debug!(error = %e, "Failed to drain oversized request"),
        Err(_) => debug!("Peer kept sending after overflow, answering anyway"),
    }
    Ok(Inbound::Overflow)
}

/// Fail unless `fd` is marked close-on-exec.
pub fn check_close_on_exec(fd: RawFd) -> Result<(), WorkerError> {
    // SAFETY: F_GETFD only inspects descriptor flags.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(WorkerError::StrayDescriptor(format!(
            "descriptor {fd}: {}",
            io::Error::last_os_error()
        )));
    }
    if flags & libc::FD_CLOEXEC == 0 {
        return Err(WorkerError::StrayDescriptor(format!(
            "descriptor {fd} would be inherited by spawned programs"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CONTENT_FILE_NAME;
    use std::fs;
    use std::path::Path;

    fn identity() -> WorkerIdentity {
        WorkerIdentity::new("bulletin-server", 1, "127.0.0.1:9".parse().unwrap())
    }

    fn context(dir: &Path) -> WorkerContext {
        WorkerContext::new(ContentStore::new(dir), "http://board/bulletin_board.php")
    }

    async fn exchange(ctx: WorkerContext, request: &[u8]) -> (Result<(), WorkerError>, Vec<u8>) {
        let (mut client, server) = tokio::io::duplex(1 << 20);
        let (reader, writer) = tokio::io::split(server);
        let task = tokio::spawn(async move { serve(reader, writer, &ctx, &identity()).await });

        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        (task.await.unwrap(), response)
    }

    #[tokio::test]
    async fn test_read_request_variants() {
        assert_eq!(read_request(&b""[..], 8).await.unwrap(), Inbound::Empty);
        assert_eq!(
            read_request(&b"12345678"[..], 8).await.unwrap(),
            Inbound::Request(BytesMut::from(&b"12345678"[..]))
        );
        assert_eq!(read_request(&b"123456789"[..], 8).await.unwrap(), Inbound::Overflow);
    }

    #[tokio::test]
    async fn test_read_request_handles_short_reads() {
        let reader = tokio_test::io::Builder::new()
            .read(b"user=al")
            .read(b"ice\nhel")
            .read(b"lo")
            .build();
        match read_request(reader, 64).await.unwrap() {
            Inbound::Request(buf) => assert_eq!(&buf[..], b"user=alice\nhello"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_request_does_not_preallocate_the_cap() {
        match read_request(&b"user=a\nhi"[..], 1 << 40).await.unwrap() {
            Inbound::Request(buf) => {
                assert_eq!(&buf[..], b"user=a\nhi");
                assert!(buf.capacity() <= INITIAL_READ_CAPACITY);
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert!(matches!(
            read_request(&b"user=a\nhi"[..], usize::MAX).await.unwrap(),
            Inbound::Request(_)
        ));
    }

    #[tokio::test]
    async fn test_read_request_grows_past_initial_capacity() {
        let input = vec![b'x'; INITIAL_READ_CAPACITY * 3];
        match read_request(&input[..], MAX_REQUEST_LIMIT).await.unwrap() {
            Inbound::Request(buf) => assert_eq!(buf.len(), input.len()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_overflow_answers_without_peer_close() {
        let (mut client, server) = tokio::io::duplex(1 << 16);
        client.write_all(&[b'x'; 64]).await.unwrap();

        let inbound = tokio::time::timeout(
            DRAIN_TIMEOUT + Duration::from_secs(5),
            read_request(server, 16),
        )
        .await
        .expect("overflow answered while the peer is still open")
        .unwrap();
        assert_eq!(inbound, Inbound::Overflow);
        drop(client);
    }

    #[tokio::test]
    async fn test_accepted_post_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let (result, response) = exchange(context(dir.path()), b"user=alice\nmessage body").await;

        assert!(result.is_ok());
        assert!(response.starts_with(b"status=0\nfile=bulletin_board_response.html\n"));
        let content = fs::read_to_string(dir.path().join(CONTENT_FILE_NAME)).unwrap();
        assert!(content.contains("alice"));
        assert!(content.contains("message body"));
        assert!(dir.path().join(crate::store::MAIN_PAGE_NAME).exists());
    }

    #[tokio::test]
    async fn test_missing_user_never_reaches_store() {
        let dir = tempfile::tempdir().unwrap();
        let (result, response) = exchange(context(dir.path()), b"message only").await;

        assert!(matches!(
            result,
            Err(WorkerError::Rejected {
                status: Status::Invalid,
                ..
            })
        ));
        assert!(response.starts_with(b"status=1\n"));
        assert!(!dir.path().join(CONTENT_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_unsupported_tag_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (_, response) = exchange(context(dir.path()), b"user=eve\n<script>x</script>").await;

        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("status=1\n"));
        assert!(text.contains("&lt;script&gt;"));
        assert!(text.contains("file=error.png\n"));
    }

    #[tokio::test]
    async fn test_empty_request_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (result, response) = exchange(context(dir.path()), b"").await;

        assert!(result.is_err());
        assert!(response.starts_with(b"status=1\n"));
    }

    #[tokio::test]
    async fn test_overflow_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.max_request = 16;
        let (result, response) = exchange(ctx, b"user=alice\nthis message is too long").await;

        assert!(matches!(
            result,
            Err(WorkerError::Rejected {
                status: Status::Overflow,
                ..
            })
        ));
        assert!(response.starts_with(b"status=2\n"));
        assert!(!dir.path().join(CONTENT_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_main_page_failure_rejects_until_it_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let board = dir.path().join("missing");
        let ctx = context(&board);
        let (result, response) = exchange(ctx.clone(), b"user=alice\nhello").await;

        assert!(matches!(
            result,
            Err(WorkerError::Rejected {
                status: Status::Failed,
                ..
            })
        ));
        assert!(response.starts_with(b"status=-1\n"));
        assert!(String::from_utf8_lossy(&response).contains("could not create main html page"));
        assert!(!board.exists());

        fs::create_dir(&board).unwrap();
        let (result, response) = exchange(ctx, b"user=alice\nhello again").await;

        assert!(result.is_ok());
        assert!(response.starts_with(b"status=0\n"));
        assert!(board.join(crate::store::MAIN_PAGE_NAME).exists());
        let content = fs::read_to_string(board.join(CONTENT_FILE_NAME)).unwrap();
        assert!(content.contains("hello again"));
    }

    #[tokio::test]
    async fn test_store_failure_embeds_os_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(CONTENT_FILE_NAME)).unwrap();
        let (result, response) = exchange(context(dir.path()), b"user=alice\nhello").await;

        match result {
            Err(WorkerError::Rejected { status, reason }) => {
                assert_eq!(status, Status::Invalid);
                assert!(reason.starts_with("unable to open file"));
                assert!(reason.contains("Is a directory"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(response.starts_with(b"status=1\n"));
    }

    #[test]
    fn test_identity_check() {
        assert!(identity().check().is_ok());
        assert_eq!(identity().name(), "bulletin-server[1]");

        let unnamed = WorkerIdentity::new("", 3, "127.0.0.1:9".parse().unwrap());
        assert!(matches!(unnamed.check(), Err(WorkerError::IdentityCheck(_))));

        let unnumbered = WorkerIdentity::new("bulletin-server", 0, "127.0.0.1:9".parse().unwrap());
        assert!(matches!(unnumbered.check(), Err(WorkerError::IdentityCheck(_))));
    }

    #[test]
    fn test_close_on_exec_check() {
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        assert!(check_close_on_exec(fd).is_ok());

        // SAFETY: clearing descriptor flags on a file owned by this test.
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, 0);
        }
        assert!(matches!(
            check_close_on_exec(fd),
            Err(WorkerError::StrayDescriptor(_))
        ));
    }
}
