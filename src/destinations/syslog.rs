// Syslog forwarder - rewrites records as syslog lines and multicasts them
//
// Format: <PRIORITY>TIMESTAMP CONTAINER_ID APP_NAME: MESSAGE
// Example: <30>2015-06-05T16:13:47Z contid1 myappname: mymsg
//
// Every forward target gets its own writer task fed by a bounded queue, so a
// slow or unreachable collector only loses its own messages.

use crate::address::{Endpoint, Protocol};
use crate::destination::{Destination, LogRecord};
use crate::error::{Error, Result};
use crate::resolver::NameResolver;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

pub const DEFAULT_QUEUE_SIZE: usize = 1024;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const TCP_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

enum Connection {
    Udp(UdpSocket),
    // Reconnected lazily after a failed write
    Tcp {
        endpoint: Endpoint,
        stream: Option<TcpStream>,
    },
}

impl Connection {
    async fn open(endpoint: Endpoint) -> Result<Self> {
        match endpoint.protocol {
            Protocol::Udp => {
                let addr = lookup_host(endpoint.host_port())
                    .await?
                    .next()
                    .ok_or_else(|| Error::InvalidAddress {
                        address: endpoint.to_string(),
                        reason: "no addresses found".to_string(),
                    })?;
                let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(addr).await?;
                Ok(Connection::Udp(socket))
            }
            Protocol::Tcp => {
                let stream = connect_tcp(&endpoint).await?;
                Ok(Connection::Tcp {
                    endpoint,
                    stream: Some(stream),
                })
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Connection::Udp(socket) => {
                socket.send(data).await?;
                Ok(())
            }
            Connection::Tcp { endpoint, stream } => {
                if let Some(mut conn) = stream.take() {
                    match write_tcp(&mut conn, data).await {
                        Ok(()) => {
                            *stream = Some(conn);
                            return Ok(());
                        }
                        Err(e) => debug!(address = %endpoint, error = %e, "Write failed, reconnecting"),
                    }
                }

                // The failed line is sent again on the new stream
                let mut conn = connect_tcp(endpoint).await?;
                write_tcp(&mut conn, data).await?;
                *stream = Some(conn);
                Ok(())
            }
        }
    }
}

async fn connect_tcp(endpoint: &Endpoint) -> io::Result<TcpStream> {
    tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(endpoint.host_port()))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?
}

async fn write_tcp(conn: &mut TcpStream, data: &[u8]) -> io::Result<()> {
    tokio::time::timeout(TCP_WRITE_TIMEOUT, conn.write_all(data))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))?
}

async fn open(address: &str) -> Result<Connection> {
    Connection::open(Endpoint::parse(address)?).await
}

struct Target {
    address: String,
    tx: mpsc::Sender<Arc<[u8]>>,
}

pub struct SyslogForwarder {
    resolver: Arc<NameResolver>,
    targets: Vec<Target>,
}

impl SyslogForwarder {
    /// Connect to every forward address. Any failure aborts the whole set.
    pub async fn connect(
        addresses: &[String],
        resolver: Arc<NameResolver>,
        queue_size: usize,
    ) -> Result<Self> {
        let mut connections = Vec::with_capacity(addresses.len());
        for address in addresses {
            let conn = open(address).await.map_err(|e| Error::Connect {
                address: address.clone(),
                source: Box::new(e),
            })?;
            connections.push((address.clone(), conn));
        }

        let targets = connections
            .into_iter()
            .map(|(address, conn)| {
                let (tx, rx) = mpsc::channel(queue_size.max(1));
                tokio::spawn(write_loop(address.clone(), conn, rx));
                Target { address, tx }
            })
            .collect();

        Ok(Self { resolver, targets })
    }

    pub fn resolver(&self) -> &Arc<NameResolver> {
        &self.resolver
    }

    fn forward(&self, line: Arc<[u8]>) {
        for target in &self.targets {
            match target.tx.try_send(line.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(address = %target.address, "Forward queue full, dropping message")
                }
                Err(TrySendError::Closed(_)) => {
                    warn!(address = %target.address, "Forward writer gone, dropping message")
                }
            }
        }
    }
}

#[async_trait]
impl Destination for SyslogForwarder {
    async fn send(&self, record: LogRecord) -> anyhow::Result<()> {
        let name = self.resolver.resolve(&record.source_id).await;
        let line = record.to_syslog_line(&name);
        self.forward(Arc::from(line.into_bytes()));
        Ok(())
    }
}

async fn write_loop(address: String, mut conn: Connection, mut rx: mpsc::Receiver<Arc<[u8]>>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = conn.write(&line).await {
            warn!(address = %address, error = %e, "Failed to forward message");
        }
    }
    debug!(address = %address, "Forward writer stopped");
}
