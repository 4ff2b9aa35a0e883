// Host metrics shipped to logstash as one JSON document per message
//
// Example: {"client":"logrelay","count":1,"metric":"host_check_writableRoot","value":1,"host":"node1","addr":["10.0.0.5"]}

use crate::address::{Endpoint, Protocol};
use crate::error::Result;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tracing::{debug, trace};

pub struct LogstashSender {
    client: String,
    endpoint: Endpoint,
    hostname: String,
}

impl LogstashSender {
    pub fn new(client: &str, host: &str, port: u16, protocol: &str) -> Result<Self> {
        let endpoint = Endpoint::parse(&format!("{}://{}:{}", protocol, host, port))?;
        let hostname = hostname::get()?.to_string_lossy().into_owned();
        Ok(Self {
            client: client.to_string(),
            endpoint,
            hostname,
        })
    }

    #[cfg(test)]
    fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_string();
        self
    }

    pub async fn send_host(&self, key: &str, value: Value) -> Result<()> {
        let message = json!({
            "client": self.client,
            "count": 1,
            "metric": format!("host_{}", key),
            "value": value,
            "host": self.hostname,
            "addr": self.host_addrs().await,
        });
        self.send(serde_json::to_vec(&message)?).await
    }

    /// Addresses the hostname resolves to, empty when it does not resolve
    async fn host_addrs(&self) -> Vec<String> {
        match lookup_host((self.hostname.as_str(), 0)).await {
            Ok(addrs) => {
                let mut ips: Vec<String> = addrs.map(|a| a.ip().to_string()).collect();
                ips.sort();
                ips.dedup();
                ips
            }
            Err(e) => {
                trace!(hostname = %self.hostname, error = %e, "Hostname does not resolve");
                Vec::new()
            }
        }
    }

    // A fresh connection per message
    async fn send(&self, data: Vec<u8>) -> Result<()> {
        match self.endpoint.protocol {
            Protocol::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(self.endpoint.host_port()).await?;
                socket.send(&data).await?;
            }
            Protocol::Tcp => {
                let mut stream = TcpStream::connect(self.endpoint.host_port()).await?;
                stream.write_all(&data).await?;
                stream.shutdown().await?;
            }
        }
        debug!(endpoint = %self.endpoint, bytes = data.len(), "Sent metric");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_send_host_udp() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();

        let sender = LogstashSender::new("logrelay", "127.0.0.1", port, "udp")
            .unwrap()
            .with_hostname("node1.invalid");
        sender.send_host("check_writableRoot", json!(1)).await.unwrap();

        let mut buf = [0u8; 1024];
        let n = timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .expect("timeout waiting for metric")
            .unwrap();
        let got: Value = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(got["client"], "logrelay");
        assert_eq!(got["count"], 1);
        assert_eq!(got["metric"], "host_check_writableRoot");
        assert_eq!(got["value"], 1);
        assert_eq!(got["host"], "node1.invalid");
        assert!(got["addr"].is_array());
    }

    #[tokio::test]
    async fn test_send_host_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let sender = LogstashSender::new("tsuru", "127.0.0.1", port, "tcp")
            .unwrap()
            .with_hostname("node2.invalid");
        let send = tokio::spawn(async move { sender.send_host("cpu", json!(0.5)).await });

        let (mut stream, _) = listener.accept().await.unwrap();
        let mut data = Vec::new();
        timeout(Duration::from_secs(2), stream.read_to_end(&mut data))
            .await
            .expect("timeout waiting for metric")
            .unwrap();
        send.await.unwrap().unwrap();

        let got: Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(got["client"], "tsuru");
        assert_eq!(got["metric"], "host_cpu");
        assert_eq!(got["value"], 0.5);
        assert_eq!(got["host"], "node2.invalid");
    }

    #[tokio::test]
    async fn test_host_addrs() {
        let sender = LogstashSender::new("logrelay", "127.0.0.1", 1984, "udp")
            .unwrap()
            .with_hostname("localhost");
        let addrs = sender.host_addrs().await;
        assert!(addrs.iter().any(|a| a == "127.0.0.1" || a == "::1"));

        let sender = sender.with_hostname("no-such-host.invalid");
        assert!(sender.host_addrs().await.is_empty());
    }

    #[test]
    fn test_invalid_protocol() {
        let err = LogstashSender::new("logrelay", "localhost", 1984, "http")
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidProtocol(p) if p == "http"));
    }
}
