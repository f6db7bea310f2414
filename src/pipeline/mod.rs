//! Pipeline multiplexer
//!
//! A pipeline is one long-lived TLS connection carrying many logical
//! sessions as [`PipelineFrame`]s. The pipeline task exclusively owns
//! its member registry and the outbound [`SendBuffer`]; sessions hold a
//! clonable [`PipelineHandle`] back-reference and receive inbound
//! payloads through a per-session event channel.
//!
//! The first bytes written on a new pipeline are always the 56-byte
//! password digest followed by CRLF; everything after is framed.

mod send_buffer;

pub use send_buffer::{SendBuffer, SentCallback};

use crate::protocol::{PipelineFrame, CRLF};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Events a pipeline delivers to a member session
#[derive(Debug)]
pub enum SessionEvent {
    /// Relay bytes from the peer
    Data(Bytes),
    /// The peer acknowledged one DATA frame
    Ack,
    /// The peer closed the session, or the pipeline itself died
    Close,
}

/// A logical session opened by the peer (server side only): the
/// CONNECT payload plus the event stream the pipeline feeds.
pub struct IncomingSession {
    pub session_id: u32,
    pub payload: Bytes,
    pub events: mpsc::Receiver<SessionEvent>,
}

enum Command {
    Open {
        session_id: u32,
        event_tx: mpsc::Sender<SessionEvent>,
        payload: Bytes,
        done: oneshot::Sender<io::Result<()>>,
    },
    Data {
        session_id: u32,
        payload: Bytes,
        done: oneshot::Sender<io::Result<()>>,
    },
    Ack {
        session_id: u32,
    },
    Close {
        session_id: u32,
    },
    Icmp {
        payload: Bytes,
    },
}

/// Session-facing handle to a pipeline task
#[derive(Clone)]
pub struct PipelineHandle {
    pipeline_id: u32,
    ack_window: u32,
    cmd_tx: mpsc::Sender<Command>,
    live_sessions: Arc<AtomicUsize>,
}

impl PipelineHandle {
    pub fn id(&self) -> u32 {
        self.pipeline_id
    }

    /// Flow-control window for member sessions
    pub fn ack_window(&self) -> u32 {
        self.ack_window
    }

    /// Number of sessions currently multiplexed on this pipeline
    pub fn load(&self) -> usize {
        self.live_sessions.load(Ordering::Relaxed)
    }

    /// Whether the pipeline task has terminated
    pub fn is_destroyed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// Register a session and emit its CONNECT frame. Resolves when the
    /// frame has been written out.
    pub async fn open_session(
        &self,
        session_id: u32,
        event_tx: mpsc::Sender<SessionEvent>,
        payload: Bytes,
    ) -> io::Result<()> {
        let (done, wait) = oneshot::channel();
        self.send_cmd(Command::Open {
            session_id,
            event_tx,
            payload,
            done,
        })
        .await?;
        wait.await.map_err(broken_pipe)?
    }

    /// Emit a DATA frame; resolves when the bytes reached the carrier
    pub async fn send_data(&self, session_id: u32, payload: Bytes) -> io::Result<()> {
        let (done, wait) = oneshot::channel();
        self.send_cmd(Command::Data {
            session_id,
            payload,
            done,
        })
        .await?;
        wait.await.map_err(broken_pipe)?
    }

    /// Acknowledge one received DATA frame
    pub async fn send_ack(&self, session_id: u32) -> io::Result<()> {
        self.send_cmd(Command::Ack { session_id }).await
    }

    /// Deregister a session and emit its CLOSE frame.
    ///
    /// A no-op for sessions the pipeline already removed, which is what
    /// prevents CLOSE frame loops when destruction came from the
    /// pipeline side.
    pub async fn close_session(&self, session_id: u32) {
        let _ = self.send_cmd(Command::Close { session_id }).await;
    }

    /// Tunnel a raw ICMP packet (session id 0)
    pub async fn send_icmp(&self, payload: Bytes) -> io::Result<()> {
        self.send_cmd(Command::Icmp { payload }).await
    }

    async fn send_cmd(&self, cmd: Command) -> io::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

fn broken_pipe<E>(_: E) -> io::Error {
    io::Error::from(io::ErrorKind::BrokenPipe)
}

/// Spawn the task driving one client-side pipeline over an established
/// TLS stream. `icmp_tx`, when present, receives tunnelled ICMP
/// payloads arriving from the server.
pub fn spawn_client_pipeline<S>(
    pipeline_id: u32,
    stream: S,
    password_hex: &str,
    ack_window: u32,
    icmp_tx: Option<mpsc::Sender<Bytes>>,
) -> PipelineHandle
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut prefix = BytesMut::with_capacity(password_hex.len() + 2);
    prefix.put_slice(password_hex.as_bytes());
    prefix.put_slice(CRLF);

    spawn_pipeline(
        pipeline_id,
        stream,
        Some(prefix.freeze()),
        Bytes::new(),
        ack_window,
        icmp_tx,
        None,
    )
}

/// Spawn the task driving the server end of a pipeline carrier. The
/// authenticator has already been consumed by the dispatcher; any bytes
/// read past it are handed over as `leftover`. Sessions the peer opens
/// arrive on `incoming_tx`.
pub fn spawn_server_pipeline<S>(
    pipeline_id: u32,
    stream: S,
    leftover: Bytes,
    ack_window: u32,
    icmp_tx: Option<mpsc::Sender<Bytes>>,
    incoming_tx: mpsc::Sender<IncomingSession>,
) -> PipelineHandle
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    spawn_pipeline(
        pipeline_id,
        stream,
        None,
        leftover,
        ack_window,
        icmp_tx,
        Some(incoming_tx),
    )
}

fn spawn_pipeline<S>(
    pipeline_id: u32,
    stream: S,
    auth_prefix: Option<Bytes>,
    leftover: Bytes,
    ack_window: u32,
    icmp_tx: Option<mpsc::Sender<Bytes>>,
    incoming_tx: Option<mpsc::Sender<IncomingSession>>,
) -> PipelineHandle
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let live_sessions = Arc::new(AtomicUsize::new(0));

    let task = PipelineTask {
        pipeline_id,
        sessions: HashMap::new(),
        send_buffer: SendBuffer::new(),
        live_sessions: Arc::clone(&live_sessions),
        icmp_tx,
        incoming_tx,
        event_capacity: ack_window as usize * 2 + 8,
    };
    tokio::spawn(task.run(stream, auth_prefix, leftover, cmd_rx));

    PipelineHandle {
        pipeline_id,
        ack_window,
        cmd_tx,
        live_sessions,
    }
}

struct PipelineTask {
    pipeline_id: u32,
    sessions: HashMap<u32, mpsc::Sender<SessionEvent>>,
    send_buffer: SendBuffer,
    live_sessions: Arc<AtomicUsize>,
    icmp_tx: Option<mpsc::Sender<Bytes>>,
    incoming_tx: Option<mpsc::Sender<IncomingSession>>,
    event_capacity: usize,
}

impl PipelineTask {
    async fn run<S>(
        mut self,
        stream: S,
        auth_prefix: Option<Bytes>,
        leftover: Bytes,
        mut cmd_rx: mpsc::Receiver<Command>,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        // Reader task feeds raw chunks; the parse accumulator stays here
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Bytes>(64);
        tokio::spawn(async move {
            let mut buf = vec![0u8; crate::MAX_BUF_LENGTH];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if chunk_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        self.send_buffer.set_connected(true);
        if let Some(prefix) = auth_prefix {
            self.send_buffer.insert_data(prefix);
            debug!(
                "pipeline {} connected, sending authenticator",
                self.pipeline_id
            );
        }

        let mut accumulator = BytesMut::from(&leftover[..]);
        if !self.drain_frames(&mut accumulator).await {
            self.destroy(write_half).await;
            return;
        }

        loop {
            if !self.flush_writes(&mut write_half).await {
                break;
            }

            tokio::select! {
                chunk = chunk_rx.recv() => {
                    let Some(chunk) = chunk else {
                        debug!("pipeline {} carrier closed by peer", self.pipeline_id);
                        break;
                    };
                    accumulator.extend_from_slice(&chunk);
                    if !self.drain_frames(&mut accumulator).await {
                        break;
                    }
                }
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_command(cmd);
                }
            }
        }

        self.destroy(write_half).await;
    }

    /// Drive the send buffer until idle. Returns false on writer error.
    async fn flush_writes<W: AsyncWrite + Unpin>(&mut self, write_half: &mut W) -> bool {
        while let Some(data) = self.send_buffer.begin_write() {
            let result = write_half.write_all(&data).await;
            let ok = result.is_ok();
            self.send_buffer.complete_write(result);
            if !ok {
                return false;
            }
        }
        true
    }

    /// Parse and dispatch every complete frame. Returns false on a
    /// malformed frame, which destroys the whole pipeline.
    async fn drain_frames(&mut self, accumulator: &mut BytesMut) -> bool {
        loop {
            match PipelineFrame::decode(accumulator) {
                Ok(Some(frame)) => self.dispatch_frame(frame).await,
                Ok(None) => return true,
                Err(e) => {
                    warn!("pipeline {} protocol violation: {}", self.pipeline_id, e);
                    return false;
                }
            }
        }
    }

    async fn dispatch_frame(&mut self, frame: PipelineFrame) {
        use crate::protocol::PipelineCommand::*;

        debug!(
            "pipeline {} session_id: {} <-- {} length: {}",
            self.pipeline_id,
            frame.session_id,
            frame.command.name(),
            frame.payload.len()
        );

        match frame.command {
            Icmp => {
                if let Some(icmp_tx) = &self.icmp_tx {
                    let _ = icmp_tx.send(frame.payload).await;
                } else {
                    debug!("pipeline {} dropping ICMP frame without processor", self.pipeline_id);
                }
            }
            Close => {
                if let Some(event_tx) = self.sessions.remove(&frame.session_id) {
                    self.live_sessions.fetch_sub(1, Ordering::Relaxed);
                    let _ = event_tx.send(SessionEvent::Close).await;
                } else {
                    warn!(
                        "pipeline {} cannot find session_id: {} for CLOSE",
                        self.pipeline_id, frame.session_id
                    );
                }
            }
            Ack => {
                if let Some(event_tx) = self.sessions.get(&frame.session_id) {
                    let _ = event_tx.send(SessionEvent::Ack).await;
                }
            }
            Data => {
                if let Some(event_tx) = self.sessions.get(&frame.session_id) {
                    let _ = event_tx.send(SessionEvent::Data(frame.payload)).await;
                } else {
                    // Frames racing a CLOSE are expected; drop loudly
                    warn!(
                        "pipeline {} cannot find session_id: {}, dropping {} bytes",
                        self.pipeline_id,
                        frame.session_id,
                        frame.payload.len()
                    );
                }
            }
            Connect => match &self.incoming_tx {
                Some(incoming_tx) => {
                    let (event_tx, events) = mpsc::channel(self.event_capacity);
                    self.sessions.insert(frame.session_id, event_tx);
                    self.live_sessions.fetch_add(1, Ordering::Relaxed);
                    let _ = incoming_tx
                        .send(IncomingSession {
                            session_id: frame.session_id,
                            payload: frame.payload,
                            events,
                        })
                        .await;
                }
                None => {
                    warn!(
                        "pipeline {} unexpected CONNECT for session_id: {}",
                        self.pipeline_id, frame.session_id
                    );
                }
            },
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Open {
                session_id,
                event_tx,
                payload,
                done,
            } => {
                self.sessions.insert(session_id, event_tx);
                self.live_sessions.fetch_add(1, Ordering::Relaxed);
                self.push_frame(PipelineFrame::connect(session_id, payload), Some(done));
            }
            Command::Data {
                session_id,
                payload,
                done,
            } => {
                self.push_frame(PipelineFrame::data(session_id, payload), Some(done));
            }
            Command::Ack { session_id } => {
                self.push_frame(PipelineFrame::ack(session_id), None);
            }
            Command::Close { session_id } => {
                // Only emit CLOSE for sessions we still own; destruction
                // triggered by the pipeline already removed the entry
                if self.sessions.remove(&session_id).is_some() {
                    self.live_sessions.fetch_sub(1, Ordering::Relaxed);
                    debug!(
                        "pipeline {} send command to close session_id: {}",
                        self.pipeline_id, session_id
                    );
                    self.push_frame(PipelineFrame::close(session_id), None);
                }
            }
            Command::Icmp { payload } => {
                self.push_frame(PipelineFrame::icmp(payload), None);
            }
        }
    }

    fn push_frame(&mut self, frame: PipelineFrame, done: Option<oneshot::Sender<io::Result<()>>>) {
        debug!(
            "pipeline {} session_id: {} --> {} length: {}",
            self.pipeline_id,
            frame.session_id,
            frame.command.name(),
            frame.payload.len()
        );
        let callback: SentCallback = match done {
            Some(done) => Box::new(move |result| {
                let _ = done.send(result);
            }),
            None => Box::new(|_| {}),
        };
        self.send_buffer.push_data(frame.encode().freeze(), callback);
    }

    async fn destroy<W: AsyncWrite + Unpin>(mut self, mut write_half: W) {
        debug!(
            "pipeline {} destroyed, closing all {} sessions",
            self.pipeline_id,
            self.sessions.len()
        );
        for (_, event_tx) in self.sessions.drain() {
            let _ = event_tx.send(SessionEvent::Close).await;
        }
        self.live_sessions.store(0, Ordering::Relaxed);
        // Best-effort close-notify
        let _ = write_half.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PipelineCommand, PASSWORD_HEX_LEN};
    use crate::protocol::hash_password;
    use tokio::io::AsyncReadExt;

    /// Read one frame; `accumulator` carries bytes read past the frame
    /// boundary over to the next call.
    async fn read_frame(
        stream: &mut (impl AsyncRead + Unpin),
        accumulator: &mut BytesMut,
    ) -> PipelineFrame {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = PipelineFrame::decode(accumulator).unwrap() {
                return frame;
            }
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "stream closed mid-frame");
            accumulator.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_auth_prefix_precedes_frames() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let hash = hash_password("pw");
        let handle = spawn_client_pipeline(0, local, &hash, 200, None);

        let (event_tx, _event_rx) = mpsc::channel(16);
        handle
            .open_session(1, event_tx, Bytes::from_static(b"target"))
            .await
            .unwrap();

        let mut prefix = vec![0u8; PASSWORD_HEX_LEN + 2];
        remote.read_exact(&mut prefix).await.unwrap();
        assert_eq!(&prefix[..PASSWORD_HEX_LEN], hash.as_bytes());
        assert_eq!(&prefix[PASSWORD_HEX_LEN..], b"\r\n");

        let mut acc = BytesMut::new();
        let frame = read_frame(&mut remote, &mut acc).await;
        assert_eq!(frame.command, PipelineCommand::Connect);
        assert_eq!(frame.session_id, 1);
        assert_eq!(&frame.payload[..], b"target");
    }

    #[tokio::test]
    async fn test_frames_keep_enqueue_order() {
        let (local, mut remote) = tokio::io::duplex(65536);
        let handle = spawn_client_pipeline(1, local, &hash_password("pw"), 200, None);

        let (tx1, _rx1) = mpsc::channel(16);
        let (tx2, _rx2) = mpsc::channel(16);
        handle.open_session(10, tx1, Bytes::from_static(b"a")).await.unwrap();
        handle.open_session(11, tx2, Bytes::from_static(b"b")).await.unwrap();
        handle.send_data(10, Bytes::from_static(b"payload")).await.unwrap();

        let mut skip = vec![0u8; PASSWORD_HEX_LEN + 2];
        remote.read_exact(&mut skip).await.unwrap();

        let mut acc = BytesMut::new();
        let first = read_frame(&mut remote, &mut acc).await;
        let second = read_frame(&mut remote, &mut acc).await;
        let third = read_frame(&mut remote, &mut acc).await;
        assert_eq!((first.command, first.session_id), (PipelineCommand::Connect, 10));
        assert_eq!((second.command, second.session_id), (PipelineCommand::Connect, 11));
        assert_eq!((third.command, third.session_id), (PipelineCommand::Data, 10));
    }

    #[tokio::test]
    async fn test_close_from_peer_suppresses_close_frame() {
        let (local, mut remote) = tokio::io::duplex(65536);
        let handle = spawn_client_pipeline(2, local, &hash_password("pw"), 200, None);

        let (event_tx, mut event_rx) = mpsc::channel(16);
        handle.open_session(5, event_tx, Bytes::new()).await.unwrap();
        assert_eq!(handle.load(), 1);

        // Peer closes the session
        remote
            .write_all(&PipelineFrame::close(5).encode())
            .await
            .unwrap();
        assert!(matches!(event_rx.recv().await, Some(SessionEvent::Close)));
        assert_eq!(handle.load(), 0);

        // Session destruction after a pipeline-initiated close must not
        // echo a CLOSE frame back
        handle.close_session(5).await;
        handle.send_ack(5).await.unwrap();

        let mut skip = vec![0u8; PASSWORD_HEX_LEN + 2];
        remote.read_exact(&mut skip).await.unwrap();
        let mut acc = BytesMut::new();
        let connect = read_frame(&mut remote, &mut acc).await;
        assert_eq!(connect.command, PipelineCommand::Connect);
        let next = read_frame(&mut remote, &mut acc).await;
        assert_eq!(next.command, PipelineCommand::Ack);
    }

    #[tokio::test]
    async fn test_malformed_frame_destroys_pipeline() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let handle = spawn_client_pipeline(3, local, &hash_password("pw"), 200, None);

        let (event_tx, mut event_rx) = mpsc::channel(16);
        handle.open_session(9, event_tx, Bytes::new()).await.unwrap();

        // Unknown command byte
        remote.write_all(&[0xFF, 0, 0, 0, 9, 0, 0]).await.unwrap();

        assert!(matches!(event_rx.recv().await, Some(SessionEvent::Close)));
        // The handle observes destruction once the task exits
        loop {
            if handle.is_destroyed() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_server_pipeline_incoming_session() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let (incoming_tx, mut incoming_rx) = mpsc::channel(4);
        let handle = spawn_server_pipeline(5, local, Bytes::new(), 200, None, incoming_tx);

        remote
            .write_all(&PipelineFrame::connect(21, Bytes::from_static(b"addr")).encode())
            .await
            .unwrap();
        remote
            .write_all(&PipelineFrame::data(21, Bytes::from_static(b"xyz")).encode())
            .await
            .unwrap();

        let mut incoming = incoming_rx.recv().await.unwrap();
        assert_eq!(incoming.session_id, 21);
        assert_eq!(&incoming.payload[..], b"addr");
        match incoming.events.recv().await {
            Some(SessionEvent::Data(data)) => assert_eq!(&data[..], b"xyz"),
            other => panic!("expected data event, got {:?}", other),
        }

        handle.send_data(21, Bytes::from_static(b"pong")).await.unwrap();
        let mut acc = BytesMut::new();
        let frame = read_frame(&mut remote, &mut acc).await;
        assert_eq!(frame.command, PipelineCommand::Data);
        assert_eq!(frame.session_id, 21);
        assert_eq!(&frame.payload[..], b"pong");
    }

    #[tokio::test]
    async fn test_server_pipeline_consumes_leftover() {
        let (local, _remote) = tokio::io::duplex(4096);
        let (incoming_tx, mut incoming_rx) = mpsc::channel(4);
        let leftover = PipelineFrame::connect(1, Bytes::from_static(b"early")).encode().freeze();
        let _handle = spawn_server_pipeline(6, local, leftover, 200, None, incoming_tx);

        let incoming = incoming_rx.recv().await.unwrap();
        assert_eq!(incoming.session_id, 1);
        assert_eq!(&incoming.payload[..], b"early");
    }

    #[tokio::test]
    async fn test_data_and_ack_events() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let handle = spawn_client_pipeline(4, local, &hash_password("pw"), 200, None);

        let (event_tx, mut event_rx) = mpsc::channel(16);
        handle.open_session(3, event_tx, Bytes::new()).await.unwrap();

        remote
            .write_all(&PipelineFrame::data(3, Bytes::from_static(b"hi")).encode())
            .await
            .unwrap();
        remote
            .write_all(&PipelineFrame::ack(3).encode())
            .await
            .unwrap();

        match event_rx.recv().await {
            Some(SessionEvent::Data(data)) => assert_eq!(&data[..], b"hi"),
            other => panic!("expected data event, got {:?}", other),
        }
        assert!(matches!(event_rx.recv().await, Some(SessionEvent::Ack)));
    }
}
