//! Service loop
//!
//! Owns the listeners, the TLS contexts, the id allocators and the
//! pipeline pool, and spawns one task per accepted connection. The
//! embedding binary drives it with [`Service::run`] and stops it
//! cooperatively with [`Service::stop`].

use crate::config::{Config, RunType};
use crate::pipeline::{spawn_client_pipeline, PipelineHandle};
use crate::protocol::{hash_password, Address};
use crate::session::{
    serve_connection, BoxedStream, ClientSession, Connector, ForwardKind, ForwardSession,
    IdAllocator, Outbound, ServerEnv,
};
use crate::tls::{make_server_acceptor, SingleSessionCache, TlsClientContext};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, warn};

/// A pipeline with more live sessions than this is considered
/// saturated; new sessions prefer another carrier or a fresh one.
const PIPELINE_SATURATION: usize = 32;

/// Consumer of ICMP packets tunnelled from the peer. The raw-socket
/// forwarder is an external collaborator; without one the frames are
/// dropped at debug level.
#[async_trait]
pub trait IcmpProcessor: Send + Sync {
    async fn handle_packet(&self, packet: Bytes);
}

/// The running proxy: accept loops plus shared state
pub struct Service {
    config: Arc<Config>,
    session_ids: Arc<IdAllocator>,
    pipeline_ids: Arc<IdAllocator>,
    session_cache: Arc<SingleSessionCache>,
    stopped: AtomicBool,
    shutdown: Notify,
    icmp_processor: Option<Arc<dyn IcmpProcessor>>,
}

impl Service {
    pub fn new(config: Config) -> crate::Result<Self> {
        let session_cache = Arc::new(SingleSessionCache::with_timeout(Duration::from_secs(
            config.ssl.session_timeout,
        )));
        Ok(Self {
            config: Arc::new(config),
            session_ids: IdAllocator::new(),
            pipeline_ids: IdAllocator::new(),
            session_cache,
            stopped: AtomicBool::new(false),
            shutdown: Notify::new(),
            icmp_processor: None,
        })
    }

    /// Attach the external ICMP forwarder (used with
    /// `experimental.pipeline_proxy_icmp`).
    pub fn set_icmp_processor(&mut self, processor: Arc<dyn IcmpProcessor>) {
        self.icmp_processor = Some(processor);
    }

    /// Ask a running service to wind down. Safe to call from any task.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a stop racing the accept loop
        // still lands
        self.shutdown.notify_one();
    }

    /// Drive the configured run mode until [`Service::stop`]
    pub async fn run(&self) -> crate::Result<()> {
        if self.config.run_type == RunType::Nat && !cfg!(target_os = "linux") {
            return Err(crate::Error::Config(
                "NAT mode requires Linux transparent redirect support".to_string(),
            ));
        }
        match self.config.run_type {
            RunType::Server => self.run_server().await,
            RunType::Client | RunType::Forward | RunType::Nat => self.run_client_side().await,
            RunType::ClientTun | RunType::ServerTun => Err(crate::Error::Config(
                "TUN run modes require the external device stack".to_string(),
            )),
        }
    }

    async fn run_client_side(&self) -> crate::Result<()> {
        let config = &self.config;
        let listener = TcpListener::bind(config.local_endpoint()).await.map_err(|e| {
            crate::Error::Config(format!("cannot bind {}: {}", config.local_endpoint(), e))
        })?;
        info!(
            "listening on {} ({:?} mode)",
            config.local_endpoint(),
            config.run_type
        );

        let primary = Arc::new(DirectConnector::new(config, Arc::clone(&self.session_cache))?);
        let pool = if config.experimental.pipeline_num > 0 {
            Some(Mutex::new(self.build_pool(&primary)?))
        } else {
            None
        };

        let forward_target = match config.run_type {
            RunType::Forward => Some(Address::Domain(
                config.target_addr.clone(),
                config.target_port,
            )),
            _ => None,
        };
        let icmp_tx = self.icmp_sender();

        loop {
            let (inner, peer) = tokio::select! {
                result = listener.accept() => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        // fd exhaustion and the like must not kill the service
                        error!("accept failed: {}", e);
                        continue;
                    }
                },
                _ = self.shutdown.notified() => break,
            };
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            if config.tcp.no_delay {
                inner.set_nodelay(true).ok();
            }
            debug!("[tcp] {} accepted", peer);

            let session_id = self.session_ids.allocate();
            let outbound = match &pool {
                Some(pool) => {
                    let handle = {
                        let mut pool = pool.lock().await;
                        pool.pick(&self.pipeline_ids, icmp_tx.clone()).await
                    };
                    match handle {
                        Ok(handle) => Outbound::Pipelined {
                            handle,
                            udp_fallback: Arc::clone(&primary) as Arc<dyn Connector>,
                        },
                        Err(e) => {
                            warn!("[tcp] {} no usable pipeline: {}", peer, e);
                            continue;
                        }
                    }
                }
                None => Outbound::Direct(Arc::clone(&primary) as Arc<dyn Connector>),
            };

            let password_hex = config
                .first_password_hash()
                .expect("validated at startup")
                .to_string();
            let udp_timeout = Duration::from_secs(config.udp_timeout);
            let udp_buf_len = config.udp_read_buf_len();

            match (config.run_type, &forward_target) {
                (RunType::Client, _) => {
                    let session = ClientSession::new(
                        session_id,
                        password_hex,
                        outbound,
                        udp_timeout,
                        udp_buf_len,
                    );
                    tokio::spawn(session.run(inner));
                }
                (RunType::Forward, Some(target)) => {
                    let session = ForwardSession::new(
                        session_id,
                        password_hex,
                        ForwardKind::Fixed(target.clone()),
                        outbound,
                    );
                    tokio::spawn(session.run(inner));
                }
                (RunType::Nat, _) => {
                    let session =
                        ForwardSession::new(session_id, password_hex, ForwardKind::Nat, outbound);
                    tokio::spawn(session.run(inner));
                }
                _ => unreachable!("client-side accept loop"),
            }
        }

        info!("service stopped");
        Ok(())
    }

    async fn run_server(&self) -> crate::Result<()> {
        let config = &self.config;
        let acceptor = make_server_acceptor(config)?;
        let decoy_body = load_decoy_body(config)?;
        let mut env = ServerEnv::new(config, decoy_body);
        env.session_ids = Arc::clone(&self.session_ids);
        env.pipeline_ids = Arc::clone(&self.pipeline_ids);
        env.icmp_tx = self.icmp_sender();
        let env = Arc::new(env);

        let listener = TcpListener::bind(config.local_endpoint()).await.map_err(|e| {
            crate::Error::Config(format!("cannot bind {}: {}", config.local_endpoint(), e))
        })?;
        info!("listening on {} (server mode)", config.local_endpoint());

        loop {
            let (tcp, peer) = tokio::select! {
                result = listener.accept() => match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!("accept failed: {}", e);
                        continue;
                    }
                },
                _ = self.shutdown.notified() => break,
            };
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            if config.tcp.no_delay {
                tcp.set_nodelay(true).ok();
            }

            let acceptor = acceptor.clone();
            let env = Arc::clone(&env);
            tokio::spawn(async move {
                match acceptor.accept(tcp).await {
                    Ok(stream) => serve_connection(stream, peer, env).await,
                    Err(e) => {
                        // Probes failing the TLS handshake are routine
                        debug!("[tcp] {} TLS accept failed: {}", peer, e);
                    }
                }
            });
        }

        info!("service stopped");
        Ok(())
    }

    fn build_pool(&self, primary: &Arc<DirectConnector>) -> crate::Result<PipelinePool> {
        let config = &self.config;
        // Every target gets the primary's pipeline budget; sub-configs
        // only contribute endpoint and TLS profile
        let limit = config.experimental.pipeline_num as usize;
        let mut groups = vec![PoolGroup::new(limit, Arc::clone(primary))];

        for sub in &config.loadbalance_configs {
            match DirectConnector::new(sub, Arc::new(SingleSessionCache::new())) {
                Ok(connector) => groups.push(PoolGroup::new(limit, Arc::new(connector))),
                Err(e) => {
                    warn!("skipping load balance target {}: {}", sub.remote_endpoint(), e);
                }
            }
        }
        if groups.is_empty() {
            return Err(crate::Error::Config(
                "no usable pipeline target".to_string(),
            ));
        }
        Ok(PipelinePool { groups, rr: 0 })
    }

    /// Bridge from pipeline ICMP frames to the attached processor
    fn icmp_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        if !self.config.experimental.pipeline_proxy_icmp {
            return None;
        }
        let processor = self.icmp_processor.as_ref()?.clone();
        let (tx, mut rx) = mpsc::channel::<Bytes>(64);
        tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                processor.handle_packet(packet).await;
            }
        });
        Some(tx)
    }
}

fn load_decoy_body(config: &Config) -> crate::Result<Option<Bytes>> {
    if config.ssl.plain_http_response.is_empty() {
        return Ok(None);
    }
    let body = std::fs::read(&config.ssl.plain_http_response).map_err(|e| {
        crate::Error::Config(format!(
            "cannot read {}: {}",
            config.ssl.plain_http_response, e
        ))
    })?;
    Ok(Some(Bytes::from(body)))
}

/// Dials the remote server over TLS for direct sessions and new
/// pipeline carriers
struct DirectConnector {
    tls: TlsClientContext,
    endpoint: String,
    password_hex: String,
    ack_window: u32,
}

impl DirectConnector {
    fn new(config: &Config, cache: Arc<SingleSessionCache>) -> crate::Result<Self> {
        let password_hex = config
            .first_password_hash()
            .map(str::to_string)
            .unwrap_or_else(|| hash_password(""));
        Ok(Self {
            tls: TlsClientContext::new(config, cache)?,
            endpoint: config.remote_endpoint(),
            password_hex,
            ack_window: config.experimental.pipeline_ack_window,
        })
    }
}

#[async_trait]
impl Connector for DirectConnector {
    async fn connect(&self) -> crate::Result<BoxedStream> {
        Ok(Box::new(self.tls.connect(&self.endpoint).await?))
    }
}

/// One pipeline target: the primary remote or a load-balance entry
struct PoolGroup {
    connector: Arc<DirectConnector>,
    limit: usize,
    handles: Vec<PipelineHandle>,
}

impl PoolGroup {
    fn new(limit: usize, connector: Arc<DirectConnector>) -> Self {
        Self {
            connector,
            limit,
            handles: Vec::new(),
        }
    }
}

/// Least-loaded pipeline selection across all groups, round-robin on
/// ties; a new carrier is opened only when every live one is saturated
/// and some group is below its limit.
struct PipelinePool {
    groups: Vec<PoolGroup>,
    rr: usize,
}

impl PipelinePool {
    async fn pick(
        &mut self,
        pipeline_ids: &IdAllocator,
        icmp_tx: Option<mpsc::Sender<Bytes>>,
    ) -> crate::Result<PipelineHandle> {
        for group in &mut self.groups {
            group.handles.retain(|handle| !handle.is_destroyed());
        }

        let best = self.least_loaded();
        let saturated = best
            .as_ref()
            .map(|handle| handle.load() >= PIPELINE_SATURATION)
            .unwrap_or(true);

        if !saturated {
            return Ok(best.expect("checked above"));
        }

        // All carriers saturated (or none yet): open a new one if any
        // group has room
        let group_count = self.groups.len();
        for offset in 0..group_count {
            let index = (self.rr + offset) % group_count;
            let group = &mut self.groups[index];
            if group.handles.len() >= group.limit {
                continue;
            }
            self.rr = self.rr.wrapping_add(1);
            let pipeline_id = pipeline_ids.allocate();
            info!(
                "pipeline {} connecting to {}",
                pipeline_id, group.connector.endpoint
            );
            let stream = match group.connector.connect().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(
                        "pipeline {} cannot reach {}: {}",
                        pipeline_id, group.connector.endpoint, e
                    );
                    continue;
                }
            };
            let handle = spawn_client_pipeline(
                pipeline_id,
                stream,
                &group.connector.password_hex,
                group.connector.ack_window,
                icmp_tx.clone(),
            );
            group.handles.push(handle.clone());
            return Ok(handle);
        }

        // Every group full: reuse the least-loaded carrier anyway
        best.ok_or_else(|| crate::Error::Exhausted("no pipeline target reachable".to_string()))
    }

    fn least_loaded(&mut self) -> Option<PipelineHandle> {
        let candidates: Vec<&PipelineHandle> = self
            .groups
            .iter()
            .flat_map(|group| group.handles.iter())
            .collect();
        let min_load = candidates.iter().map(|handle| handle.load()).min()?;
        let tied: Vec<&&PipelineHandle> = candidates
            .iter()
            .filter(|handle| handle.load() == min_load)
            .collect();
        let picked = tied[self.rr % tied.len()];
        self.rr = self.rr.wrapping_add(1);
        Some((**picked).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tun_modes_are_rejected() {
        let config = Config::populate(
            r#"{
                "run_type": "client_tun",
                "local_addr": "127.0.0.1", "local_port": 1080,
                "remote_addr": "example.com", "remote_port": 443,
                "password": ["pw"]
            }"#,
        )
        .unwrap();
        let service = Service::new(config).unwrap();
        let result = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(service.run());
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[tokio::test]
    async fn test_stop_unblocks_run() {
        let config = Config::populate(
            r#"{
                "run_type": "client",
                "local_addr": "127.0.0.1", "local_port": 0,
                "remote_addr": "example.com", "remote_port": 443,
                "password": ["pw"]
            }"#,
        )
        .unwrap();
        let service = Arc::new(Service::new(config).unwrap());

        let runner = Arc::clone(&service);
        let task = tokio::spawn(async move { runner.run().await });

        // Give the accept loop a moment to come up, then stop it
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.stop();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("run did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
