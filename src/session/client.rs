//! Client session state machine
//!
//! Drives one accepted local TCP connection through
//! HANDSHAKE → REQUEST → CONNECT → FORWARD (or UDP_FORWARD): the SOCKS5
//! exchange, composition of the authenticated request line, and the
//! full-duplex relay between the inner socket and the outer TLS stream
//! or pipeline.

use super::{BoxedStream, Connector, SessionStats};
use crate::pipeline::{PipelineHandle, SessionEvent};
use crate::protocol::{
    socks5, Address, Socks5Reply, TrojanCommand, TrojanRequest, TrojanUdpPacket, UdpDatagram,
};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

/// Outbound path for one session
pub enum Outbound {
    /// A dedicated TLS connection to the server
    Direct(Arc<dyn Connector>),
    /// A slot on a shared pipeline carrier. UDP associate cannot ride a
    /// pipeline, so a direct connector is kept for that case.
    Pipelined {
        handle: PipelineHandle,
        udp_fallback: Arc<dyn Connector>,
    },
}

/// One accepted SOCKS5 connection
pub struct ClientSession {
    session_id: u32,
    password_hex: String,
    outbound: Outbound,
    udp_timeout: Duration,
    udp_buf_len: usize,
}

impl ClientSession {
    pub fn new(
        session_id: u32,
        password_hex: String,
        outbound: Outbound,
        udp_timeout: Duration,
        udp_buf_len: usize,
    ) -> Self {
        Self {
            session_id,
            password_hex,
            outbound,
            udp_timeout,
            udp_buf_len,
        }
    }

    /// Run the session to completion. Errors terminate only this
    /// session; they are logged, never propagated to the accept loop.
    pub async fn run(self, inner: TcpStream) {
        let peer = match inner.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                error!("session_id: {} cannot read peer address: {}", self.session_id, e);
                return;
            }
        };
        let stats = SessionStats::new(self.session_id, peer);
        if let Err(e) = self.drive(inner, &stats).await {
            debug!("{} terminated: {}", stats.prefix(), e);
        }
        stats.log_disconnect();
    }

    async fn drive(self, mut inner: TcpStream, stats: &SessionStats) -> crate::Result<()> {
        let mut buf = vec![0u8; crate::MAX_BUF_LENGTH];

        // HANDSHAKE: SOCKS5 greeting
        let n = inner.read(&mut buf).await?;
        if n == 0 {
            return Err(crate::Error::Closed);
        }
        match socks5::validate_greeting(&buf[..n]) {
            Ok(true) => {
                inner
                    .write_all(&[socks5::SOCKS_VERSION, socks5::SOCKS5_METHOD_NO_AUTH])
                    .await?;
            }
            Ok(false) => {
                warn!("{} unsupported auth method", stats.prefix());
                inner
                    .write_all(&[socks5::SOCKS_VERSION, socks5::SOCKS5_NO_ACCEPTABLE_METHOD])
                    .await?;
                return Ok(());
            }
            Err(e) => {
                warn!("{} unknown protocol", stats.prefix());
                return Err(e.into());
            }
        }

        // REQUEST: SOCKS5 request becomes the authenticated request line
        let n = inner.read(&mut buf).await?;
        if n == 0 {
            return Err(crate::Error::Closed);
        }
        let request = match self.compose_request(&buf[..n]) {
            Ok(request) => request,
            Err(e) => {
                warn!("{} unsupported command: {}", stats.prefix(), e);
                inner
                    .write_all(&Socks5Reply::CommandNotSupported.encode_zero())
                    .await?;
                return Ok(());
            }
        };
        let is_udp = request.command == TrojanCommand::UdpAssociate;
        let mut out_write_buf = request.encode();

        let udp_socket = if is_udp {
            // The relay socket must share the interface the client
            // reached us on
            let local_ip = inner.local_addr()?.ip();
            let udp_socket = UdpSocket::bind(SocketAddr::new(local_ip, 0))
                .await
                .map_err(|e| crate::Error::Exhausted(format!("cannot bind UDP socket: {}", e)))?;
            let bound = Address::from(udp_socket.local_addr()?);
            info!(
                "{} requested UDP associate to {}, opened {} for relay",
                stats.prefix(),
                request.address,
                udp_socket.local_addr()?
            );
            inner
                .write_all(&Socks5Reply::Succeeded.encode(&bound))
                .await?;
            Some(udp_socket)
        } else {
            info!(
                "{} requested connection to {}",
                stats.prefix(),
                request.address
            );
            inner
                .write_all(&Socks5Reply::Succeeded.encode_zero())
                .await?;
            None
        };
        // CONNECT and the forward states
        let udp_timeout = self.udp_timeout;
        let udp_buf_len = self.udp_buf_len;
        match (self.outbound, udp_socket) {
            (Outbound::Pipelined { handle, .. }, None) => {
                run_pipelined_tcp(
                    &handle,
                    self.session_id,
                    inner,
                    request.address,
                    Bytes::new(),
                    stats,
                )
                .await
            }
            (Outbound::Pipelined { udp_fallback, .. }, Some(udp_socket)) => {
                // Pipeline frames carry TCP sessions only; UDP associate
                // gets its own carrier
                let outer = connect_buffering(
                    &*udp_fallback,
                    &mut inner,
                    Some(&udp_socket),
                    &mut out_write_buf,
                    stats,
                )
                .await?;
                run_udp_forward(
                    inner,
                    udp_socket,
                    outer,
                    out_write_buf,
                    udp_timeout,
                    udp_buf_len,
                    stats,
                )
                .await
            }
            (Outbound::Direct(connector), udp_socket) => {
                let outer = connect_buffering(
                    &*connector,
                    &mut inner,
                    udp_socket.as_ref(),
                    &mut out_write_buf,
                    stats,
                )
                .await?;
                match udp_socket {
                    Some(udp_socket) => {
                        run_udp_forward(
                            inner,
                            udp_socket,
                            outer,
                            out_write_buf,
                            udp_timeout,
                            udp_buf_len,
                            stats,
                        )
                        .await
                    }
                    None => run_tcp_forward(inner, outer, out_write_buf, stats).await,
                }
            }
        }
    }

    /// Build the request line from the raw SOCKS5 request and validate
    /// it by parsing it back.
    fn compose_request(&self, data: &[u8]) -> crate::Result<TrojanRequest> {
        let (cmd, addr_bytes) = socks5::validate_request(data)?;

        let mut line = BytesMut::with_capacity(62 + addr_bytes.len());
        line.extend_from_slice(self.password_hex.as_bytes());
        line.extend_from_slice(b"\r\n");
        line.extend_from_slice(&[cmd]);
        line.extend_from_slice(addr_bytes);
        line.extend_from_slice(b"\r\n");

        TrojanRequest::decode(&line)?
            .ok_or_else(|| crate::Error::Protocol(crate::protocol::ProtocolError::Malformed(
                "truncated SOCKS5 request",
            )))
    }
}

/// CONNECT state: open the outer stream while buffering any early
/// client traffic into the first write.
pub(crate) async fn connect_buffering(
    connector: &dyn Connector,
    inner: &mut TcpStream,
    udp_socket: Option<&UdpSocket>,
    out_write_buf: &mut BytesMut,
    stats: &SessionStats,
) -> crate::Result<BoxedStream> {
    let mut first_packet_recv = false;
    let mut tcp_buf = vec![0u8; crate::MAX_BUF_LENGTH];
    let mut udp_buf = vec![0u8; crate::MAX_BUF_LENGTH];

    let connect = connector.connect();
    tokio::pin!(connect);

    let outer = loop {
        tokio::select! {
            result = &mut connect => break result?,
            result = inner.read(&mut tcp_buf) => {
                let n = result?;
                if n == 0 {
                    return Err(crate::Error::Closed);
                }
                stats.add_sent(n as u64);
                out_write_buf.extend_from_slice(&tcp_buf[..n]);
                first_packet_recv = true;
            }
            result = recv_datagram(udp_socket, &mut udp_buf), if udp_socket.is_some() => {
                let (n, _peer) = result?;
                let datagram = UdpDatagram::decode(&udp_buf[..n])?;
                stats.add_sent(datagram.payload.len() as u64);
                let packet = TrojanUdpPacket {
                    address: datagram.address,
                    payload: datagram.payload.freeze(),
                };
                out_write_buf.extend_from_slice(&packet.encode());
                first_packet_recv = true;
            }
        }
    };

    if first_packet_recv {
        debug!("{} early payload buffered before connect", stats.prefix());
    }
    Ok(outer)
}

async fn recv_datagram(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        // Disabled select branch; never polled
        None => std::future::pending().await,
    }
}

/// FORWARD over a dedicated outer stream: write the buffered request
/// line in one piece, then splice both directions until either side
/// ends.
pub(crate) async fn run_tcp_forward(
    inner: TcpStream,
    mut outer: BoxedStream,
    out_write_buf: BytesMut,
    stats: &SessionStats,
) -> crate::Result<()> {
    outer.write_all(&out_write_buf).await?;
    super::relay(inner, outer, stats).await?;
    Ok(())
}

/// UDP_FORWARD: datagrams from the inner UDP socket are re-framed into
/// the outer stream; outer bytes are inverse-framed back into SOCKS5
/// datagrams. Idle sessions are destroyed after `udp_timeout`.
async fn run_udp_forward(
    inner: TcpStream,
    udp_socket: UdpSocket,
    mut outer: BoxedStream,
    out_write_buf: BytesMut,
    udp_timeout: Duration,
    udp_buf_len: usize,
    stats: &SessionStats,
) -> crate::Result<()> {
    outer.write_all(&out_write_buf).await?;

    let (mut out_read, mut out_write) = tokio::io::split(outer);
    let (mut in_read, _in_write) = inner.into_split();

    let mut udp_buf = vec![0u8; udp_buf_len];
    let mut outer_buf = vec![0u8; crate::MAX_BUF_LENGTH];
    let mut tcp_buf = [0u8; 64];
    let mut udp_data_buf = BytesMut::new();
    let mut reply_peer: Option<SocketAddr> = None;

    loop {
        let idle = tokio::time::sleep(udp_timeout);
        tokio::pin!(idle);

        tokio::select! {
            result = udp_socket.recv_from(&mut udp_buf) => {
                let (n, peer) = result?;
                if n == 0 {
                    continue;
                }
                reply_peer = Some(peer);
                let datagram = UdpDatagram::decode(&udp_buf[..n]).map_err(|e| {
                    warn!("{} bad UDP packet", stats.prefix());
                    e
                })?;
                debug!(
                    "{} sent a UDP packet of length {} bytes to {}",
                    stats.prefix(),
                    datagram.payload.len(),
                    datagram.address
                );
                stats.add_sent(datagram.payload.len() as u64);
                let packet = TrojanUdpPacket {
                    address: datagram.address,
                    payload: datagram.payload.freeze(),
                };
                out_write.write_all(&packet.encode()).await?;
            }
            result = out_read.read(&mut outer_buf) => {
                let n = result?;
                if n == 0 {
                    return Err(crate::Error::Closed);
                }
                udp_data_buf.extend_from_slice(&outer_buf[..n]);
                while let Some((packet, consumed)) = TrojanUdpPacket::decode(&udp_data_buf)? {
                    let _ = udp_data_buf.split_to(consumed);
                    debug!(
                        "{} received a UDP packet of length {} bytes from {}",
                        stats.prefix(),
                        packet.payload.len(),
                        packet.address
                    );
                    stats.add_recv(packet.payload.len() as u64);
                    if let Some(peer) = reply_peer {
                        let reply = UdpDatagram {
                            address: packet.address,
                            payload: BytesMut::from(&packet.payload[..]),
                        };
                        udp_socket.send_to(&reply.encode(), peer).await?;
                    }
                }
                if udp_data_buf.len() > crate::MAX_BUF_LENGTH {
                    warn!("{} UDP packet too long", stats.prefix());
                    return Err(crate::Error::Protocol(
                        crate::protocol::ProtocolError::FrameTooLarge(udp_data_buf.len()),
                    ));
                }
            }
            result = in_read.read(&mut tcp_buf) => {
                match result? {
                    0 => return Err(crate::Error::Closed),
                    _ => {
                        warn!("{} unexpected data from TCP port", stats.prefix());
                        return Err(crate::Error::Protocol(
                            crate::protocol::ProtocolError::Malformed(
                                "data on the TCP control connection",
                            ),
                        ));
                    }
                }
            }
            _ = &mut idle => {
                info!("{} UDP session timeout", stats.prefix());
                let _ = out_write.shutdown().await;
                return Ok(());
            }
        }
    }
}

/// FORWARD over a pipeline: CONNECT first, then DATA frames gated by
/// the ACK window.
pub(crate) async fn run_pipelined_tcp(
    handle: &PipelineHandle,
    session_id: u32,
    inner: TcpStream,
    address: Address,
    first_payload: Bytes,
    stats: &SessionStats,
) -> crate::Result<()> {
    let window = handle.ack_window() as usize;
    let (event_tx, event_rx) = mpsc::channel(window * 2 + 8);

    let mut connect_payload = BytesMut::new();
    address.encode(&mut connect_payload);
    connect_payload.extend_from_slice(&first_payload);
    handle
        .open_session(session_id, event_tx, connect_payload.freeze())
        .await?;

    run_pipelined_relay(handle, session_id, inner, event_rx, stats).await
}

/// The shared half of pipelined forwarding: relay between an
/// established inner socket and the pipeline, bounding in-flight DATA
/// frames by the ACK window. Used by both ends of a pipeline.
pub(crate) async fn run_pipelined_relay(
    handle: &PipelineHandle,
    session_id: u32,
    inner: TcpStream,
    mut event_rx: mpsc::Receiver<SessionEvent>,
    stats: &SessionStats,
) -> crate::Result<()> {
    let window = handle.ack_window() as usize;
    let (mut in_read, mut in_write) = inner.into_split();
    let (data_tx, mut data_rx) = mpsc::channel::<Bytes>(64);

    // Window permits: one consumed per DATA sent, one restored per ACK
    let ack_budget = Arc::new(Semaphore::new(window));

    let dispatcher_budget = Arc::clone(&ack_budget);
    let dispatcher = async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                SessionEvent::Data(data) => {
                    if data_tx.send(data).await.is_err() {
                        break;
                    }
                }
                SessionEvent::Ack => {
                    // The counter never exceeds the configured window
                    if dispatcher_budget.available_permits() < window {
                        dispatcher_budget.add_permits(1);
                    }
                }
                SessionEvent::Close => break,
            }
        }
        // Dropping data_tx ends the download loop
    };

    let upload_budget = Arc::clone(&ack_budget);
    let upload = async {
        let mut buf = vec![0u8; crate::MAX_BUF_LENGTH];
        loop {
            let permit = upload_budget
                .acquire()
                .await
                .map_err(|_| std::io::Error::from(std::io::ErrorKind::BrokenPipe))?;
            let n = in_read.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, std::io::Error>(());
            }
            stats.add_sent(n as u64);
            handle
                .send_data(session_id, Bytes::copy_from_slice(&buf[..n]))
                .await?;
            permit.forget();
        }
    };

    let download = async {
        while let Some(data) = data_rx.recv().await {
            stats.add_recv(data.len() as u64);
            in_write.write_all(&data).await?;
            // ACK only after the inner write completed
            handle.send_ack(session_id).await?;
        }
        Ok::<_, std::io::Error>(())
    };

    let result = tokio::select! {
        _ = dispatcher => Ok(()),
        result = upload => result,
        result = download => result,
    };

    // No CLOSE frame is emitted if the pipeline already removed us
    handle.close_session(session_id).await;
    result.map_err(Into::into)
}
