//! Integration tests for Veil Proxy
//!
//! Exercises the full relay flows over loopback sockets and in-memory
//! pipes: the SOCKS5 exchange, the authenticated request line on the
//! outer stream, pipeline framing, and the server's
//! authenticate-or-decoy dispatch.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use veil_proxy::pipeline::spawn_client_pipeline;
use veil_proxy::protocol::{
    hash_password, PipelineCommand, PipelineFrame, PASSWORD_HEX_LEN,
};
use veil_proxy::session::{
    serve_connection, BoxedStream, ClientSession, Connector, Outbound, ServerEnv,
};

const PASSWORD: &str = "correct horse battery staple";

/// Hands out pre-made in-memory streams instead of dialing TLS
struct DuplexConnector {
    streams: Mutex<Vec<DuplexStream>>,
    calls: AtomicUsize,
}

impl DuplexConnector {
    fn new(streams: Vec<DuplexStream>) -> Arc<Self> {
        Arc::new(Self {
            streams: Mutex::new(streams),
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self) -> veil_proxy::Result<BoxedStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let stream = self.streams.lock().await.pop().ok_or_else(|| {
            veil_proxy::Error::Exhausted("no more test streams".to_string())
        })?;
        Ok(Box::new(stream))
    }
}

/// Accept one loopback connection and run a client session on it
async fn start_client_session(outbound: Outbound) -> TcpStream {
    static NEXT_SESSION_ID: AtomicUsize = AtomicUsize::new(1);
    let session_id = NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst) as u32;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (inner, _) = listener.accept().await.unwrap();
        let session = ClientSession::new(
            session_id,
            hash_password(PASSWORD),
            outbound,
            Duration::from_secs(60),
            8192,
        );
        session.run(inner).await;
    });

    TcpStream::connect(addr).await.unwrap()
}

fn test_server_env(decoy_body: Option<&'static [u8]>, pipeline: bool) -> Arc<ServerEnv> {
    let config = veil_proxy::Config::populate(&format!(
        r#"{{
            "run_type": "server",
            "local_addr": "127.0.0.1", "local_port": 443,
            "remote_addr": "127.0.0.1", "remote_port": 80,
            "password": ["{}"],
            "experimental": {{"pipeline_num": {}}}
        }}"#,
        PASSWORD,
        if pipeline { 4 } else { 0 }
    ))
    .unwrap();
    Arc::new(ServerEnv::new(&config, decoy_body.map(Bytes::from_static)))
}

/// Start a loopback echo server, returning its port
async fn start_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 || socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    port
}

/// Scenario: a greeting without the no-auth method is answered with
/// `05 FF` and no outbound connection is ever attempted.
#[tokio::test]
async fn test_handshake_rejection() {
    let (outer, _remote) = tokio::io::duplex(4096);
    let connector = DuplexConnector::new(vec![outer]);
    let mut client = start_client_session(Outbound::Direct(connector.clone())).await;

    client.write_all(&[0x05, 0x01, 0x01]).await.unwrap();

    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0xFF]);

    // Connection closes without any outbound dial
    let mut rest = [0u8; 1];
    assert_eq!(client.read(&mut rest).await.unwrap(), 0);
    assert_eq!(connector.call_count(), 0);
}

/// Scenario: a CONNECT to 127.0.0.1:80 produces exactly
/// `<pw-hex> 0D 0A 01 01 7F 00 00 01 00 50 0D 0A` as the outer
/// stream's first payload.
#[tokio::test]
async fn test_tcp_connect_request_line() {
    let (outer, mut remote) = tokio::io::duplex(4096);
    let connector = DuplexConnector::new(vec![outer]);
    let mut client = start_client_session(Outbound::Direct(connector)).await;

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    client
        .write_all(&[0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50])
        .await
        .unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

    let mut first_payload = vec![0u8; PASSWORD_HEX_LEN + 12];
    remote.read_exact(&mut first_payload).await.unwrap();
    assert_eq!(&first_payload[..PASSWORD_HEX_LEN], hash_password(PASSWORD).as_bytes());
    assert_eq!(
        &first_payload[PASSWORD_HEX_LEN..],
        &[0x0D, 0x0A, 0x01, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x00, 0x50, 0x0D, 0x0A]
    );
}

/// Scenario: UDP associate is answered with `05 00 00` plus the
/// address of the just-bound UDP socket on the accepting interface.
#[tokio::test]
async fn test_udp_associate_reply() {
    let (outer, _remote) = tokio::io::duplex(4096);
    let connector = DuplexConnector::new(vec![outer]);
    let mut client = start_client_session(Outbound::Direct(connector)).await;

    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();

    // UDP associate to 0.0.0.0:0
    client
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..3], &[0x05, 0x00, 0x00]);
    assert_eq!(reply[3], 0x01); // IPv4 triple
    assert_eq!(&reply[4..8], &[127, 0, 0, 1]); // bound on the accepting interface
    let port = u16::from_be_bytes([reply[8], reply[9]]);
    assert_ne!(port, 0); // ephemeral port actually bound
}

/// Scenario: two sessions share one pipeline; after the 58-byte
/// authenticator the wire carries their CONNECT frames then DATA
/// frames in enqueue order.
#[tokio::test]
async fn test_pipeline_sessions_share_one_carrier() {
    let (carrier, mut remote) = tokio::io::duplex(65536);
    let handle = spawn_client_pipeline(1, carrier, &hash_password(PASSWORD), 200, None);

    // Fallback connector is unused here; give it no streams
    let fallback = DuplexConnector::new(vec![]);

    let mut first = start_client_session(Outbound::Pipelined {
        handle: handle.clone(),
        udp_fallback: fallback.clone(),
    })
    .await;
    socks5_connect(&mut first, b"example.com", 443).await;

    let mut second = start_client_session(Outbound::Pipelined {
        handle: handle.clone(),
        udp_fallback: fallback.clone(),
    })
    .await;
    socks5_connect(&mut second, b"example.org", 443).await;

    // Authenticator comes first
    let mut prefix = vec![0u8; PASSWORD_HEX_LEN + 2];
    remote.read_exact(&mut prefix).await.unwrap();
    assert_eq!(&prefix[..PASSWORD_HEX_LEN], hash_password(PASSWORD).as_bytes());
    assert_eq!(&prefix[PASSWORD_HEX_LEN..], b"\r\n");

    // Then one CONNECT per session, in enqueue order
    let mut acc = BytesMut::new();
    let first_frame = read_frame(&mut remote, &mut acc).await;
    assert_eq!(first_frame.command, PipelineCommand::Connect);
    assert_eq!(first_frame.payload[0], 0x03); // domain triple
    assert_eq!(&first_frame.payload[2..13], b"example.com");

    let second_frame = read_frame(&mut remote, &mut acc).await;
    assert_eq!(second_frame.command, PipelineCommand::Connect);
    assert_eq!(&second_frame.payload[2..13], b"example.org");
    assert_ne!(second_frame.session_id, first_frame.session_id);

    // Payload written after both CONNECTs are on the wire shows up as
    // DATA for the first session
    first.write_all(b"hello from one").await.unwrap();
    let third_frame = read_frame(&mut remote, &mut acc).await;
    assert_eq!(third_frame.command, PipelineCommand::Data);
    assert_eq!(third_frame.session_id, first_frame.session_id);
    assert_eq!(&third_frame.payload[..], b"hello from one");

    assert_eq!(fallback.call_count(), 0);
}

/// The number of in-flight DATA frames for one session never exceeds
/// the ACK window; an ACK releases exactly one more.
#[tokio::test]
async fn test_ack_window_bounds_inflight_data() {
    let (carrier, mut remote) = tokio::io::duplex(65536);
    let handle = spawn_client_pipeline(9, carrier, &hash_password(PASSWORD), 2, None);
    let fallback = DuplexConnector::new(vec![]);

    let mut client = start_client_session(Outbound::Pipelined {
        handle: handle.clone(),
        udp_fallback: fallback,
    })
    .await;
    socks5_connect(&mut client, b"example.net", 443).await;

    let mut prefix = vec![0u8; PASSWORD_HEX_LEN + 2];
    remote.read_exact(&mut prefix).await.unwrap();
    let mut acc = BytesMut::new();
    let connect = read_frame(&mut remote, &mut acc).await;
    assert_eq!(connect.command, PipelineCommand::Connect);

    // Spaced-out writes so each lands in its own DATA frame
    for byte in 0u8..4 {
        client.write_all(&[byte]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Without ACKs only the window's worth of frames may appear
    for _ in 0..2 {
        let frame = read_frame(&mut remote, &mut acc).await;
        assert_eq!(frame.command, PipelineCommand::Data);
    }
    let blocked =
        tokio::time::timeout(Duration::from_millis(200), read_frame(&mut remote, &mut acc)).await;
    assert!(blocked.is_err(), "sender exceeded the ACK window");

    // One ACK releases exactly one more frame
    remote
        .write_all(&PipelineFrame::ack(connect.session_id).encode())
        .await
        .unwrap();
    let released = tokio::time::timeout(Duration::from_secs(2), read_frame(&mut remote, &mut acc))
        .await
        .expect("ACK did not release the sender");
    assert_eq!(released.command, PipelineCommand::Data);
}

/// Scenario: an HTTP probe as the first bytes yields exactly the
/// configured decoy body, then a normal close.
#[tokio::test]
async fn test_active_probe_sees_decoy() {
    const DECOY: &[u8] =
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";

    let (stream, mut probe) = tokio::io::duplex(4096);
    let env = test_server_env(Some(DECOY), false);
    let peer = "203.0.113.9:55555".parse().unwrap();
    tokio::spawn(serve_connection(stream, peer, env));

    probe
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    probe.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, DECOY);
}

/// An authenticated request relays to its origin and back.
#[tokio::test]
async fn test_server_relays_authenticated_request() {
    let port = start_echo_server().await;

    let (stream, mut client) = tokio::io::duplex(4096);
    let env = test_server_env(None, false);
    let peer = "203.0.113.9:55556".parse().unwrap();
    tokio::spawn(serve_connection(stream, peer, env));

    // Request line with the first payload appended
    let mut request = BytesMut::new();
    request.extend_from_slice(hash_password(PASSWORD).as_bytes());
    request.extend_from_slice(b"\r\n\x01\x01\x7F\x00\x00\x01");
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(b"\r\nping");
    client.write_all(&request).await.unwrap();

    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
}

/// End-to-end: SOCKS5 in, dispatch on the server, echo origin behind
/// it; application bytes survive the round trip.
#[tokio::test]
async fn test_end_to_end_tcp_relay() {
    let port = start_echo_server().await;

    // The "outer TLS" is an in-memory pipe between client session and
    // server dispatcher
    let (outer_client, outer_server) = tokio::io::duplex(65536);
    let env = test_server_env(None, false);
    let peer = "203.0.113.9:55557".parse().unwrap();
    tokio::spawn(serve_connection(outer_server, peer, env));

    let connector = DuplexConnector::new(vec![outer_client]);
    let mut client = start_client_session(Outbound::Direct(connector)).await;

    socks5_connect(&mut client, b"127.0.0.1", port).await;

    client.write_all(b"round trip payload").await.unwrap();
    let mut echoed = [0u8; 18];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"round trip payload");
}

/// Drive a SOCKS5 greeting + domain CONNECT and assert both replies
async fn socks5_connect(client: &mut TcpStream, host: &[u8], port: u16) {
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut reply = [0u8; 2];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host);
    request.extend_from_slice(&port.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x05, 0x00]);
}

/// Read one pipeline frame; `accumulator` carries bytes read past the
/// frame boundary over to the next call.
async fn read_frame(stream: &mut DuplexStream, accumulator: &mut BytesMut) -> PipelineFrame {
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
