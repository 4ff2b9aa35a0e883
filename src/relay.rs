// Syslog relay for the Docker syslog log driver
//
// Docker is configured with --log-driver=syslog --log-opt
// syslog-format=rfc3339, which produces lines like
//   <30>2015-06-05T16:13:47Z myhost docker/<container id>: message
// The relay swaps the host for the container id and the tag for the
// application name, then hands the result to the forwarder.

use crate::address::{Endpoint, Protocol};
use crate::destination::{Destination, LogRecord};
use crate::destinations::SyslogForwarder;
use crate::error::{Error, Result};
use crate::resolver::NameResolver;
use crate::runtime::{ContainerRuntime, DockerClient};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// <PRI>TIMESTAMP HOST TAG: MSG
static SYSLOG_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<(\d{1,3})>(\S+) (\S+) ([^\s:]+): ?(.*)$").unwrap()
});

const DOCKER_TAG_PREFIX: &str = "docker/";
const MAX_DATAGRAM_SIZE: usize = 64 * 1024;
const MAX_LINE_SIZE: usize = MAX_DATAGRAM_SIZE;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_address: String,
    pub forward_addresses: Vec<String>,
    pub docker_endpoint: Option<String>,
    pub app_name_env_var: Option<String>,
    pub cache_size: usize,
    pub queue_size: usize,
}

/// Parse one inbound line into a record keyed by container id
pub fn parse_syslog_line(line: &str) -> Option<LogRecord> {
    let caps = SYSLOG_LINE.captures(line)?;

    let priority: u8 = caps[1].parse().ok().filter(|p| *p <= 191)?;
    let timestamp = DateTime::parse_from_rfc3339(&caps[2])
        .ok()?
        .with_timezone(&Utc);

    // docker/<id>, optionally followed by [pid]
    let tag = &caps[4];
    let tag = tag.split_once('[').map_or(tag, |(t, _)| t);
    let container_id = tag.strip_prefix(DOCKER_TAG_PREFIX).unwrap_or(tag);
    if container_id.is_empty() {
        return None;
    }

    Some(LogRecord {
        content: caps[5].to_string(),
        timestamp,
        source_id: container_id.to_string(),
        priority,
    })
}

pub struct SyslogRelay {
    config: RelayConfig,
    resolver: Arc<NameResolver>,
    forwarder: Option<Arc<SyslogForwarder>>,
    local_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SyslogRelay {
    pub fn new(config: RelayConfig) -> Result<Self> {
        let runtime = match config.docker_endpoint.as_deref() {
            Some(endpoint) if !endpoint.is_empty() => {
                Some(Arc::new(DockerClient::new(endpoint)?) as Arc<dyn ContainerRuntime>)
            }
            _ => None,
        };
        let resolver = Arc::new(NameResolver::new(
            runtime,
            config.app_name_env_var.as_deref(),
            config.cache_size,
        ));

        Ok(Self::with_resolver(config, resolver))
    }

    pub fn with_resolver(config: RelayConfig, resolver: Arc<NameResolver>) -> Self {
        Self {
            config,
            resolver,
            forwarder: None,
            local_addr: None,
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn resolver(&self) -> &Arc<NameResolver> {
        &self.resolver
    }

    /// The sink shared with the Kubernetes tailers; None until started
    pub fn forwarder(&self) -> Option<Arc<SyslogForwarder>> {
        self.forwarder.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn start(&mut self) -> Result<()> {
        let bind = Endpoint::parse(&self.config.bind_address)?;

        let forwarder = Arc::new(
            SyslogForwarder::connect(
                &self.config.forward_addresses,
                self.resolver.clone(),
                self.config.queue_size,
            )
            .await?,
        );

        let bind_err = |source| Error::Bind {
            address: self.config.bind_address.clone(),
            source,
        };
        let cancel = self.cancel.clone();
        let sink = forwarder.clone();

        let handle = match bind.protocol {
            Protocol::Udp => {
                let socket = UdpSocket::bind(bind.host_port()).await.map_err(bind_err)?;
                self.local_addr = Some(socket.local_addr()?);
                tokio::spawn(udp_loop(socket, sink, cancel))
            }
            Protocol::Tcp => {
                let listener = TcpListener::bind(bind.host_port()).await.map_err(bind_err)?;
                self.local_addr = Some(listener.local_addr()?);
                tokio::spawn(tcp_loop(listener, sink, cancel))
            }
        };

        info!(
            bind = %bind,
            local_addr = ?self.local_addr,
            forward = ?self.config.forward_addresses,
            "Syslog relay started"
        );

        self.forwarder = Some(forwarder);
        self.handle = Some(handle);
        Ok(())
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "Syslog relay task failed");
            }
        }
    }
}

async fn handle_line(line: &str, sink: &SyslogForwarder) {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return;
    }

    match parse_syslog_line(line) {
        Some(record) => {
            if let Err(e) = sink.send(record).await {
                warn!(error = %e, "Failed to relay message");
            }
        }
        None => warn!(line, "Dropping malformed syslog message"),
    }
}

async fn udp_loop(socket: UdpSocket, sink: Arc<SyslogForwarder>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let n = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            result = socket.recv_from(&mut buf) => match result {
                Ok((n, _)) => n,
                Err(e) => {
                    warn!(error = %e, "Error receiving syslog datagram");
                    continue;
                }
            },
        };

        let data = String::from_utf8_lossy(&buf[..n]);
        for line in data.split('\n') {
            handle_line(line, &sink).await;
        }
    }

    debug!("Syslog UDP receive loop stopped");
}

async fn tcp_loop(listener: TcpListener, sink: Arc<SyslogForwarder>, cancel: CancellationToken) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            Some(_) = connections.join_next(), if !connections.is_empty() => {}

            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    debug!(%peer, "Accepted syslog connection");
                    connections.spawn(handle_connection(stream, sink.clone(), cancel.child_token()));
                }
                Err(e) => warn!(error = %e, "Error accepting syslog connection"),
            },
        }
    }

    // Children share the cancelled token and exit on their own
    while connections.join_next().await.is_some() {}
    debug!("Syslog TCP accept loop stopped");
}

async fn handle_connection(stream: TcpStream, sink: Arc<SyslogForwarder>, cancel: CancellationToken) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    // Set while skipping the rest of an oversized line
    let mut discarding = false;

    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_LINE_SIZE as u64);
        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            result = limited.read_until(b'\n', &mut buf) => result,
        };

        match result {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Error reading syslog connection");
                break;
            }
        }

        let complete = buf.last() == Some(&b'\n');
        if discarding {
            discarding = !complete;
            continue;
        }
        if !complete && buf.len() >= MAX_LINE_SIZE {
            warn!(limit = MAX_LINE_SIZE, "Dropping oversized syslog message");
            discarding = true;
            continue;
        }

        handle_line(&String::from_utf8_lossy(&buf), &sink).await;
    }
}
