//! Session layer
//!
//! A session is the unit of relay: one accepted inner socket (plus its
//! UDP sub-socket for UDP associate) coupled to one outbound path. The
//! variants share the id space, the status machine and the destruction
//! protocol; what differs is how the first request is obtained.

mod client;
mod forward;
mod server;

pub use client::{ClientSession, Outbound};
pub use forward::{ForwardSession, ForwardKind};
pub use server::{serve_connection, ServerEnv};

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

/// Type-erased bidirectional stream, the outer socket of a session
pub type BoxedStream = Box<dyn StreamIo>;

/// Object-safe `AsyncRead + AsyncWrite` bound for outer sockets
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// Dials the remote server for one session.
///
/// The production implementation opens TLS via
/// [`crate::tls::TlsClientContext`]; tests substitute in-memory pipes.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> crate::Result<BoxedStream>;
}

/// Monotonic id source shared by all sessions (and, separately, all
/// pipelines) of one service. Wraps at `u32::MAX`.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: AtomicU32,
}

impl IdAllocator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn allocate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Relay accounting for one session, logged when the session ends.
///
/// Counters are atomic so both relay directions can update them while
/// racing inside one `select!`.
pub struct SessionStats {
    pub session_id: u32,
    pub peer: SocketAddr,
    sent_len: AtomicU64,
    recv_len: AtomicU64,
    start: Instant,
}

impl SessionStats {
    pub fn new(session_id: u32, peer: SocketAddr) -> Self {
        Self {
            session_id,
            peer,
            sent_len: AtomicU64::new(0),
            recv_len: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    pub fn add_sent(&self, n: u64) {
        self.sent_len.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_recv(&self, n: u64) {
        self.recv_len.fetch_add(n, Ordering::Relaxed);
    }

    /// `[tcp] ip:port session_id: N` prefix for log lines
    pub fn prefix(&self) -> String {
        format!("[tcp] {} session_id: {}", self.peer, self.session_id)
    }

    pub fn log_disconnect(&self) {
        info!(
            "{} disconnected, {} bytes received, {} bytes sent, lasted for {} seconds",
            self.prefix(),
            self.recv_len.load(Ordering::Relaxed),
            self.sent_len.load(Ordering::Relaxed),
            self.start.elapsed().as_secs()
        );
    }
}

/// Bidirectional splice between two established streams.
///
/// Bytes flowing `a -> b` count as sent, `b -> a` as received. The
/// first direction to end (EOF or error) tears both down; within each
/// direction the next read is only issued after the previous write
/// completed.
pub(crate) async fn relay<A, B>(a: A, b: B, stats: &SessionStats) -> std::io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let upload = async {
        let mut buf = vec![0u8; crate::MAX_BUF_LENGTH];
        loop {
            let n = a_read.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, std::io::Error>(());
            }
            stats.add_sent(n as u64);
            b_write.write_all(&buf[..n]).await?;
        }
    };
    let download = async {
        let mut buf = vec![0u8; crate::MAX_BUF_LENGTH];
        loop {
            let n = b_read.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, std::io::Error>(());
            }
            stats.add_recv(n as u64);
            a_write.write_all(&buf[..n]).await?;
        }
    };

    let result = tokio::select! {
        result = upload => result,
        result = download => result,
    };

    // Best-effort close-notify in both directions before the halves drop
    let _ = b_write.shutdown().await;
    let _ = a_write.shutdown().await;
    result
}
