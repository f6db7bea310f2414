//! Forward and NAT session variants
//!
//! Both skip the SOCKS5 exchange: the destination is the configured
//! target (FORWARD) or the flow's original destination recovered from
//! the redirect (NAT). From the CONNECT state on they share the client
//! session's relay path.

use super::client::{connect_buffering, run_pipelined_tcp, run_tcp_forward, Outbound};
use super::SessionStats;
use crate::protocol::{Address, TrojanCommand, TrojanRequest};
use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::{debug, error, info};

/// How the session learns its destination
#[derive(Debug, Clone)]
pub enum ForwardKind {
    /// `target_addr:target_port` from the config
    Fixed(Address),
    /// Transparent redirect; the kernel knows the original destination
    Nat,
}

/// A forwarded (or NAT-redirected) local connection
pub struct ForwardSession {
    session_id: u32,
    password_hex: String,
    kind: ForwardKind,
    outbound: Outbound,
}

impl ForwardSession {
    pub fn new(session_id: u32, password_hex: String, kind: ForwardKind, outbound: Outbound) -> Self {
        Self {
            session_id,
            password_hex,
            kind,
            outbound,
        }
    }

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
        let target = match &self.kind {
            ForwardKind::Fixed(address) => address.clone(),
            ForwardKind::Nat => Address::from(original_destination(&inner)?),
        };
        info!("{} forwarding to {}", stats.prefix(), target);

        let request = TrojanRequest {
            password_hex: self.password_hex.clone(),
            command: TrojanCommand::Connect,
            address: target.clone(),
            payload: Bytes::new(),
        };

        match self.outbound {
            Outbound::Direct(connector) => {
                let mut out_write_buf = request.encode();
                let outer =
                    connect_buffering(&*connector, &mut inner, None, &mut out_write_buf, stats)
                        .await?;
                run_tcp_forward(inner, outer, out_write_buf, stats).await
            }
            Outbound::Pipelined { handle, .. } => {
                run_pipelined_tcp(&handle, self.session_id, inner, target, Bytes::new(), stats)
                    .await
            }
        }
    }
}

/// Original destination of a redirected flow (`SO_ORIGINAL_DST`).
#[cfg(target_os = "linux")]
fn original_destination(stream: &TcpStream) -> crate::Result<std::net::SocketAddr> {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
    use std::os::unix::io::AsRawFd;

    const SO_ORIGINAL_DST: libc::c_int = 80;

    let fd = stream.as_raw_fd();
    let local_is_v4 = stream
        .local_addr()
        .map(|a| a.is_ipv4())
        .unwrap_or(true);

    unsafe {
        if local_is_v4 {
            let mut addr: libc::sockaddr_in = std::mem::zeroed();
            let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            if libc::getsockopt(
                fd,
                libc::SOL_IP,
                SO_ORIGINAL_DST,
                &mut addr as *mut _ as *mut libc::c_void,
                &mut len,
            ) != 0
            {
                return Err(crate::Error::Io(std::io::Error::last_os_error()));
            }
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::new(IpAddr::V4(ip), port))
        } else {
            let mut addr: libc::sockaddr_in6 = std::mem::zeroed();
            let mut len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            if libc::getsockopt(
                fd,
                libc::SOL_IPV6,
                SO_ORIGINAL_DST,
                &mut addr as *mut _ as *mut libc::c_void,
                &mut len,
            ) != 0
            {
                return Err(crate::Error::Io(std::io::Error::last_os_error()));
            }
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::new(IpAddr::V6(ip), port))
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn original_destination(_stream: &TcpStream) -> crate::Result<std::net::SocketAddr> {
    Err(crate::Error::Config(
        "NAT mode requires Linux transparent redirect support".to_string(),
    ))
}
