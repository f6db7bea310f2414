//! Server dispatch: authenticate-or-decoy
//!
//! After TLS accept the first bytes decide everything. A parseable
//! request line whose 56-byte authenticator matches a configured
//! password becomes a relay session; a matching authenticator on a
//! pipeline-enabled server becomes a pipeline carrier; anything else is
//! silently handed to the decoy so an active probe sees an ordinary
//! webserver. No reply or reset ever exposes the difference.

use super::client::run_pipelined_relay;
use super::{relay, IdAllocator, SessionStats, StreamIo};
use crate::config::Config;
use crate::pipeline::{spawn_server_pipeline, IncomingSession};
use crate::protocol::{
    Address, TrojanCommand, TrojanRequest, TrojanUdpPacket, CRLF, PASSWORD_HEX_LEN,
};
use bytes::{Bytes, BytesMut};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long the dispatcher waits for the authenticator to complete
/// before giving the connection to the decoy
const AUTH_PEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the server side needs per accepted connection
pub struct ServerEnv {
    pub password_hashes: HashSet<String>,
    pub pipeline_enabled: bool,
    pub ack_window: u32,
    /// Preloaded `plain_http_response` body, if configured
    pub decoy_body: Option<Bytes>,
    /// Opaque-relay fallback when no decoy body is configured
    pub fallback_endpoint: String,
    pub udp_timeout: Duration,
    pub udp_buf_len: usize,
    pub prefer_ipv4: bool,
    pub connect_timeout: Duration,
    pub session_ids: Arc<IdAllocator>,
    pub pipeline_ids: Arc<IdAllocator>,
    /// Sink for tunnelled ICMP payloads, when a processor is attached
    pub icmp_tx: Option<mpsc::Sender<Bytes>>,
}

impl ServerEnv {
    pub fn new(config: &Config, decoy_body: Option<Bytes>) -> Self {
        Self {
            password_hashes: config.password_hashes.keys().cloned().collect(),
            pipeline_enabled: config.experimental.pipeline_num > 0,
            ack_window: config.experimental.pipeline_ack_window,
            decoy_body,
            fallback_endpoint: config.remote_endpoint(),
            udp_timeout: Duration::from_secs(config.udp_timeout),
            udp_buf_len: config.udp_read_buf_len(),
            prefer_ipv4: config.tcp.prefer_ipv4,
            connect_timeout: Duration::from_secs(config.tcp.connect_time_out),
            session_ids: IdAllocator::new(),
            pipeline_ids: IdAllocator::new(),
            icmp_tx: None,
        }
    }
}

enum Dispatch {
    Trojan(TrojanRequest),
    Pipeline(Bytes),
    Decoy(BytesMut),
}

enum ParseOutcome {
    Accept(Dispatch),
    NeedMore,
    Reject,
}

/// Drive one accepted (TLS-terminated) connection to completion
pub async fn serve_connection<S>(mut stream: S, peer: SocketAddr, env: Arc<ServerEnv>)
where
    S: StreamIo + 'static,
{
    let dispatch = match classify(&mut stream, &env).await {
        Ok(dispatch) => dispatch,
        Err(e) => {
            debug!("[tcp] {} dropped during dispatch: {}", peer, e);
            return;
        }
    };

    match dispatch {
        Dispatch::Trojan(request) => run_trojan_session(stream, peer, request, env).await,
        Dispatch::Pipeline(leftover) => run_pipeline_carrier(stream, peer, leftover, env).await,
        Dispatch::Decoy(buffered) => {
            warn!(
                "[tcp] {} authentication failed, {} bytes routed to decoy",
                peer,
                buffered.len()
            );
            serve_decoy(stream, peer, buffered, env).await;
        }
    }
}

/// Accumulate first bytes until they authenticate or can never do so
async fn classify<S: StreamIo>(stream: &mut S, env: &ServerEnv) -> std::io::Result<Dispatch> {
    let mut buffered = BytesMut::new();
    let mut buf = vec![0u8; crate::MAX_BUF_LENGTH];

    loop {
        let n = match tokio::time::timeout(AUTH_PEEK_TIMEOUT, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => return Ok(Dispatch::Decoy(buffered)),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
        };
        buffered.extend_from_slice(&buf[..n]);

        match try_accept(&buffered, env) {
            ParseOutcome::Accept(dispatch) => return Ok(dispatch),
            ParseOutcome::NeedMore => continue,
            ParseOutcome::Reject => return Ok(Dispatch::Decoy(buffered)),
        }
    }
}

fn try_accept(buffered: &BytesMut, env: &ServerEnv) -> ParseOutcome {
    if env.pipeline_enabled {
        // Pipeline carriers authenticate with the bare password line;
        // everything after it is framed
        let head = buffered.len().min(PASSWORD_HEX_LEN);
        if !buffered[..head]
            .iter()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
        {
            return ParseOutcome::Reject;
        }
        if buffered.len() < PASSWORD_HEX_LEN + 2 {
            return ParseOutcome::NeedMore;
        }
        if &buffered[PASSWORD_HEX_LEN..PASSWORD_HEX_LEN + 2] != CRLF {
            return ParseOutcome::Reject;
        }
        let password_hex = std::str::from_utf8(&buffered[..PASSWORD_HEX_LEN]).unwrap();
        if !env.password_hashes.contains(password_hex) {
            return ParseOutcome::Reject;
        }
        let leftover = Bytes::copy_from_slice(&buffered[PASSWORD_HEX_LEN + 2..]);
        return ParseOutcome::Accept(Dispatch::Pipeline(leftover));
    }

    match TrojanRequest::decode(buffered) {
        Ok(Some(request)) => {
            if env.password_hashes.contains(&request.password_hex) {
                ParseOutcome::Accept(Dispatch::Trojan(request))
            } else {
                ParseOutcome::Reject
            }
        }
        Ok(None) => ParseOutcome::NeedMore,
        Err(_) => ParseOutcome::Reject,
    }
}

/// Resolve an address triple, honoring `tcp.prefer_ipv4`
async fn resolve(address: &Address, prefer_ipv4: bool) -> std::io::Result<SocketAddr> {
    let candidates: Vec<SocketAddr> = lookup_host(address.to_target_string()).await?.collect();
    let picked = if prefer_ipv4 {
        candidates
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| candidates.first())
    } else {
        candidates.first()
    };
    picked.copied().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no address for target")
    })
}

async fn connect_origin(
    address: &Address,
    env: &ServerEnv,
) -> std::io::Result<TcpStream> {
    let target = resolve(address, env.prefer_ipv4).await?;
    let origin = tokio::time::timeout(env.connect_timeout, TcpStream::connect(target))
        .await
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
    origin.set_nodelay(true).ok();
    Ok(origin)
}

/// One authenticated direct session: FORWARD or UDP_FORWARD to origin
async fn run_trojan_session<S>(stream: S, peer: SocketAddr, request: TrojanRequest, env: Arc<ServerEnv>)
where
    S: StreamIo + 'static,
{
    let session_id = env.session_ids.allocate();
    let stats = SessionStats::new(session_id, peer);

    let result = match request.command {
        TrojanCommand::Connect => {
            info!(
                "{} requested connection to {}",
                stats.prefix(),
                request.address
            );
            run_origin_forward(stream, request, &env, &stats).await
        }
        TrojanCommand::UdpAssociate => {
            info!("{} requested UDP associate", stats.prefix());
            run_server_udp(stream, request.payload, &env, &stats).await
        }
    };
    if let Err(e) = result {
        debug!("{} terminated: {}", stats.prefix(), e);
    }
    stats.log_disconnect();
}

async fn run_origin_forward<S>(
    stream: S,
    request: TrojanRequest,
    env: &ServerEnv,
    stats: &SessionStats,
) -> crate::Result<()>
where
    S: StreamIo,
{
    let mut origin = connect_origin(&request.address, env).await?;
    if !request.payload.is_empty() {
        origin.write_all(&request.payload).await?;
        stats.add_sent(request.payload.len() as u64);
    }
    relay(stream, origin, stats).await?;
    Ok(())
}

/// Server side of UDP associate: unframe packets from the stream and
/// fire them at their targets; frame replies back.
async fn run_server_udp<S>(
    stream: S,
    first_payload: Bytes,
    env: &ServerEnv,
    stats: &SessionStats,
) -> crate::Result<()>
where
    S: StreamIo,
{
    let (mut stream_read, mut stream_write) = tokio::io::split(stream);
    let mut acc = BytesMut::from(&first_payload[..]);
    let mut stream_buf = vec![0u8; crate::MAX_BUF_LENGTH];
    let mut udp_buf = vec![0u8; env.udp_buf_len];
    let mut udp_socket: Option<UdpSocket> = None;

    loop {
        // Flush every complete packet already buffered
        while let Some((packet, consumed)) = TrojanUdpPacket::decode(&acc)? {
            let _ = acc.split_to(consumed);
            let target = resolve(&packet.address, env.prefer_ipv4).await?;
            let socket = match &udp_socket {
                Some(socket) => socket,
                None => {
                    let bind_addr: SocketAddr = if target.is_ipv4() {
                        "0.0.0.0:0".parse().unwrap()
                    } else {
                        "[::]:0".parse().unwrap()
                    };
                    udp_socket = Some(UdpSocket::bind(bind_addr).await.map_err(|e| {
                        crate::Error::Exhausted(format!("cannot bind UDP socket: {}", e))
                    })?);
                    udp_socket.as_ref().unwrap()
                }
            };
            debug!(
                "{} relaying a UDP packet of length {} bytes to {}",
                stats.prefix(),
                packet.payload.len(),
                packet.address
            );
            stats.add_sent(packet.payload.len() as u64);
            socket.send_to(&packet.payload, target).await?;
        }

        let idle = tokio::time::sleep(env.udp_timeout);
        tokio::pin!(idle);

        tokio::select! {
            result = stream_read.read(&mut stream_buf) => {
                let n = result?;
                if n == 0 {
                    return Err(crate::Error::Closed);
                }
                acc.extend_from_slice(&stream_buf[..n]);
            }
            result = recv_from_opt(udp_socket.as_ref(), &mut udp_buf) => {
                let (n, from) = result?;
                let packet = TrojanUdpPacket {
                    address: Address::from(from),
                    payload: Bytes::copy_from_slice(&udp_buf[..n]),
                };
                stats.add_recv(n as u64);
                stream_write.write_all(&packet.encode()).await?;
            }
            _ = &mut idle => {
                info!("{} UDP session timeout", stats.prefix());
                let _ = stream_write.shutdown().await;
                return Ok(());
            }
        }
    }
}

async fn recv_from_opt(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

/// One pipeline carrier: demultiplex frames, spawning a logical session
/// per CONNECT.
async fn run_pipeline_carrier<S>(stream: S, peer: SocketAddr, leftover: Bytes, env: Arc<ServerEnv>)
where
    S: StreamIo + 'static,
{
    let pipeline_id = env.pipeline_ids.allocate();
    let (incoming_tx, mut incoming_rx) = mpsc::channel(16);
    let handle = spawn_server_pipeline(
        pipeline_id,
        stream,
        leftover,
        env.ack_window,
        env.icmp_tx.clone(),
        incoming_tx,
    );
    info!("[tcp] {} pipeline {} established", peer, pipeline_id);

    while let Some(incoming) = incoming_rx.recv().await {
        let handle = handle.clone();
        let env = Arc::clone(&env);
        tokio::spawn(async move {
            run_pipeline_session(handle, incoming, peer, env).await;
        });
    }
    info!("[tcp] {} pipeline {} closed", peer, pipeline_id);
}

async fn run_pipeline_session(
    handle: crate::pipeline::PipelineHandle,
    incoming: IncomingSession,
    peer: SocketAddr,
    env: Arc<ServerEnv>,
) {
    let stats = SessionStats::new(incoming.session_id, peer);

    let (address, consumed) = match Address::decode(&incoming.payload) {
        Ok(Some(parsed)) => parsed,
        Ok(None) | Err(_) => {
            warn!("{} malformed CONNECT payload", stats.prefix());
            handle.close_session(incoming.session_id).await;
            return;
        }
    };
    info!("{} requested connection to {}", stats.prefix(), address);

    let mut origin = match connect_origin(&address, &env).await {
        Ok(origin) => origin,
        Err(e) => {
            warn!("{} cannot reach {}: {}", stats.prefix(), address, e);
            handle.close_session(incoming.session_id).await;
            return;
        }
    };

    let first_bytes = &incoming.payload[consumed..];
    if !first_bytes.is_empty() {
        if origin.write_all(first_bytes).await.is_err() {
            handle.close_session(incoming.session_id).await;
            return;
        }
        stats.add_sent(first_bytes.len() as u64);
    }

    if let Err(e) =
        run_pipelined_relay(&handle, incoming.session_id, origin, incoming.events, &stats).await
    {
        debug!("{} terminated: {}", stats.prefix(), e);
    }
    stats.log_disconnect();
}

/// Decoy dispatch: one-shot response body, or an opaque relay when no
/// body is configured. The prober sees a webserver either way.
async fn serve_decoy<S>(mut stream: S, peer: SocketAddr, buffered: BytesMut, env: Arc<ServerEnv>)
where
    S: StreamIo,
{
    match &env.decoy_body {
        Some(body) => {
            let _ = stream.write_all(body).await;
            let _ = stream.shutdown().await;
        }
        None => {
            let mut origin = match tokio::time::timeout(
                env.connect_timeout,
                TcpStream::connect(&env.fallback_endpoint),
            )
            .await
            {
                Ok(Ok(origin)) => origin,
                _ => return,
            };
            let stats = SessionStats::new(env.session_ids.allocate(), peer);
            if origin.write_all(&buffered).await.is_err() {
                return;
            }
            let _ = relay(stream, origin, &stats).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::hash_password;

    fn test_env(pipeline: bool) -> ServerEnv {
        ServerEnv {
            password_hashes: [hash_password("pw")].into_iter().collect(),
            pipeline_enabled: pipeline,
            ack_window: 200,
            decoy_body: None,
            fallback_endpoint: "127.0.0.1:80".to_string(),
            udp_timeout: Duration::from_secs(60),
            udp_buf_len: crate::MAX_BUF_LENGTH,
            prefer_ipv4: false,
            connect_timeout: Duration::from_secs(10),
            session_ids: IdAllocator::new(),
            pipeline_ids: IdAllocator::new(),
            icmp_tx: None,
        }
    }

    fn valid_request() -> BytesMut {
        TrojanRequest {
            password_hex: hash_password("pw"),
            command: TrojanCommand::Connect,
            address: Address::Ipv4([127, 0, 0, 1], 80),
            payload: Bytes::from_static(b"GET"),
        }
        .encode()
    }

    #[test]
    fn test_accepts_configured_password() {
        let env = test_env(false);
        match try_accept(&valid_request(), &env) {
            ParseOutcome::Accept(Dispatch::Trojan(request)) => {
                assert_eq!(request.command, TrojanCommand::Connect);
                assert_eq!(&request.payload[..], b"GET");
            }
            _ => panic!("expected trojan dispatch"),
        }
    }

    #[test]
    fn test_rejects_unknown_password() {
        let env = test_env(false);
        let mut request = valid_request();
        // Flip the authenticator to a different, well-formed digest
        let other = hash_password("other");
        request[..PASSWORD_HEX_LEN].copy_from_slice(other.as_bytes());
        assert!(matches!(try_accept(&request, &env), ParseOutcome::Reject));
    }

    #[test]
    fn test_probe_rejected_before_complete_line() {
        let env = test_env(false);
        let buffered = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"[..]);
        assert!(matches!(try_accept(&buffered, &env), ParseOutcome::Reject));
    }

    #[test]
    fn test_partial_prefix_waits() {
        let env = test_env(false);
        let request = valid_request();
        for cut in [1, 20, 56, 57, 58] {
            let buffered = BytesMut::from(&request[..cut]);
            assert!(
                matches!(try_accept(&buffered, &env), ParseOutcome::NeedMore),
                "cut at {} should wait for more bytes",
                cut
            );
        }
    }

    #[test]
    fn test_pipeline_mode_accepts_bare_password_line() {
        let env = test_env(true);
        let mut buffered = BytesMut::new();
        buffered.extend_from_slice(hash_password("pw").as_bytes());
        buffered.extend_from_slice(b"\r\n");
        buffered.extend_from_slice(&[0x01, 0, 0, 0, 1]); // partial CONNECT frame

        match try_accept(&buffered, &env) {
            ParseOutcome::Accept(Dispatch::Pipeline(leftover)) => {
                assert_eq!(&leftover[..], &[0x01, 0, 0, 0, 1]);
            }
            _ => panic!("expected pipeline dispatch"),
        }
    }

    #[test]
    fn test_pipeline_mode_still_decoys_probes() {
        let env = test_env(true);
        let buffered = BytesMut::from(&b"GET / HTTP/1.1\r\n"[..]);
        assert!(matches!(try_accept(&buffered, &env), ParseOutcome::Reject));
    }
}
