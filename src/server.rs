//! TCP server for the bulletin board.
//!
//! Accepts connections and hands each one to its own worker task. Finished
//! workers are reaped as they complete, so the accept loop never waits for
//! a slow or stuck worker.

use crate::config::Config;
use crate::worker::{handle_connection, WorkerContext, WorkerError, WorkerIdentity};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Listen backlog for the server socket
const LISTEN_BACKLOG: i32 = 1024;

/// Server errors. All of them are fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to resolve listen address '{0}'")]
    Resolve(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("Failed to accept connection: {0}")]
    Accept(io::Error),
}

/// Server instance
pub struct Server {
    listener: TcpListener,
    ctx: Arc<WorkerContext>,
    program: String,
}

impl Server {
    /// Bind the listener described by `config`.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let target = format!("{}:{}", config.listen, config.port);
        let addr = (config.listen.as_str(), config.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or(ServerError::Resolve(target))?;

        Self::bind_addr(addr, WorkerContext::from_config(config), &config.program)
    }

    /// Bind `addr` and serve connections with `ctx`.
    pub fn bind_addr(
        addr: SocketAddr,
        ctx: WorkerContext,
        program: &str,
    ) -> Result<Self, ServerError> {
        let listener =
            create_listener(addr).map_err(|source| ServerError::Bind { addr, source })?;
        info!(address = %addr, "Server listening");

        Ok(Server {
            listener,
            ctx: Arc::new(ctx),
            program: program.to_string(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until a non-transient accept error occurs.
    ///
    /// Running workers are detached, not cancelled, when this returns.
    pub async fn run(self) -> Result<(), ServerError> {
        let mut workers = JoinSet::new();
        let mut next_id: u64 = 0;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        next_id += 1;
                        debug!(peer = %peer, worker = next_id, "New connection");

                        let identity = WorkerIdentity::new(self.program.clone(), next_id, peer);
                        let ctx = Arc::clone(&self.ctx);
                        let span = info_span!("worker", id = next_id, peer = %peer);
                        workers.spawn(
                            async move {
                                let id = identity.id;
                                (id, handle_connection(stream, ctx, identity).await)
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) if is_transient(&e) => {
                        debug!(error = %e, "Transient accept failure, retrying");
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        workers.detach_all();
                        return Err(ServerError::Accept(e));
                    }
                },
                Some(finished) = workers.join_next(), if !workers.is_empty() => {
                    reap(finished);
                }
            }
        }
    }
}

/// Log the outcome of a finished worker.
fn reap(finished: Result<(u64, Result<(), WorkerError>), JoinError>) {
    match finished {
        Ok((id, Ok(()))) => debug!(worker = id, "Worker finished"),
        Ok((id, Err(WorkerError::Rejected { status, reason }))) => {
            warn!(worker = id, status = status.code(), reason = %reason, "Post rejected");
        }
        Ok((id, Err(e))) => error!(worker = id, error = %e, "Worker failed"),
        Err(e) if e.is_panic() => error!(error = %e, "Worker panicked"),
        Err(e) => debug!(error = %e, "Worker cancelled"),
    }
}

/// Accept errors that leave the listener usable.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// Create a TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}
