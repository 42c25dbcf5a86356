//! Client side of the bulletin board protocol.
//!
//! Sends one post, half-closes the connection and stores every file of the
//! response in a local directory. Files are written as they arrive; when the
//! transfer breaks off, whatever was received stays on disk.

use crate::protocol::response::{parse_file_name, parse_len, parse_status};
use crate::protocol::{Post, ProtocolError};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, info};

/// Client errors. Any of them aborts the remaining transfer.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("unable to resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },

    #[error("unable to connect to {host}: {source}")]
    Connect { host: String, source: io::Error },

    #[error("transport failure: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("short read on file {name}: expected {expected} bytes, received {received}")]
    ShortRead {
        name: String,
        expected: u64,
        received: u64,
    },

    #[error("unable to create file {}: {source}", path.display())]
    File { path: PathBuf, source: io::Error },
}

/// A file stored from the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub name: String,
    pub path: PathBuf,
    pub len: u64,
}

/// A fully decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Raw status value; zero means the post was accepted.
    pub status: i32,
    pub files: Vec<DownloadedFile>,
}

impl Reply {
    pub fn is_accepted(&self) -> bool {
        self.status == 0
    }
}

/// Connect to the first reachable address of `host:port`.
pub async fn connect(host: &str, port: u16) -> Result<TcpStream, ClientError> {
    let target = format!("{host}:{port}");
    let addrs = lookup_host((host, port))
        .await
        .map_err(|source| ClientError::Resolve {
            host: target.clone(),
            source,
        })?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!(peer = %addr, "Connected");
                return Ok(stream);
            }
            Err(e) => {
                debug!(peer = %addr, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(source) => ClientError::Connect {
            host: target,
            source,
        },
        None => ClientError::Resolve {
            host: target,
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
        },
    })
}

/// Write the encoded request and flush it.
pub async fn send_request<W>(writer: &mut W, post: &Post) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let request = post.encode();
    writer.write_all(&request).await?;
    writer.flush().await?;
    debug!(bytes = request.len(), "Request sent");
    Ok(())
}

/// Decode a response, storing each file under `dir`.
pub async fn read_response<R>(reader: &mut R, dir: &Path) -> Result<Reply, ClientError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Err(ProtocolError::MissingStatus.into());
    }
    let status = parse_status(&line)?;
    debug!(status, "Status received");

    let mut files = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        let name = parse_file_name(&line)?;

        line.clear();
        reader.read_until(b'\n', &mut line).await?;
        let len = parse_len(&line)?;

        files.push(download(reader, dir, name, len).await?);
    }

    Ok(Reply { status, files })
}

/// Copy exactly `len` bytes into `dir/name`.
async fn download<R>(
    reader: &mut R,
    dir: &Path,
    name: String,
    len: u64,
) -> Result<DownloadedFile, ClientError>
where
    R: AsyncBufRead + Unpin,
{
    let path = dir.join(&name);
    let mut file = File::create(&path)
        .await
        .map_err(|source| ClientError::File {
            path: path.clone(),
            source,
        })?;

    let mut payload = (&mut *reader).take(len);
    let received = tokio::io::copy_buf(&mut payload, &mut file).await?;
    file.flush().await?;

    if received < len {
        return Err(ClientError::ShortRead {
            name,
            expected: len,
            received,
        });
    }

    debug!(file = %name, bytes = len, "File received");
    Ok(DownloadedFile { name, path, len })
}

/// Send `post` to `host:port` and store the response files under `dir`.
pub async fn post(host: &str, port: u16, post: &Post, dir: &Path) -> Result<Reply, ClientError> {
    let stream = connect(host, port).await?;
    let (reader, mut writer) = stream.into_split();

    send_request(&mut writer, post).await?;
    writer.shutdown().await?;

    let mut reader = BufReader::new(reader);
    let reply = read_response(&mut reader, dir).await?;
    info!(status = reply.status, files = reply.files.len(), "Response received");
    Ok(reply)
}
