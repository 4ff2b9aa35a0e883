use crate::destinations::syslog::DEFAULT_QUEUE_SIZE;
use crate::relay::RelayConfig;
use crate::resolver::DEFAULT_CACHE_SIZE;
use crate::tailer::TailerConfig;
use crate::watcher::WatcherConfig;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub syslog: SyslogConfig,

    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    // Metrics are only sent when a backend is configured
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,

    #[serde(default)]
    pub host_checks: HostChecksConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyslogConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    pub forward_addresses: Vec<String>,

    // http://host:port or tcp://host:port of the Docker Engine API
    #[serde(default)]
    pub docker_endpoint: Option<String>,

    // Container env var holding the application name, e.g. TSURU_APPNAME
    #[serde(default)]
    pub app_name_env_var: Option<String>,

    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    // Per-target queue; messages beyond it are dropped
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KubernetesConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    #[serde(default = "default_pos_dir")]
    pub pos_dir: PathBuf,

    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_persist_interval_ms")]
    pub persist_interval_ms: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            log_dir: default_log_dir(),
            pos_dir: default_pos_dir(),
            scan_interval_ms: default_scan_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            persist_interval_ms: default_persist_interval_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum MetricsConfig {
    Logstash {
        #[serde(default = "default_logstash_client")]
        client: String,
        #[serde(default = "default_logstash_host")]
        host: String,
        #[serde(default = "default_logstash_port")]
        port: u16,
        #[serde(default = "default_logstash_protocol")]
        protocol: String,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostChecksConfig {
    #[serde(default = "default_host_check_interval_ms")]
    pub interval_ms: u64,

    // Checked for writability in addition to "/"
    #[serde(default)]
    pub extra_paths: Vec<PathBuf>,
}

impl Default for HostChecksConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_host_check_interval_ms(),
            extra_paths: Vec::new(),
        }
    }
}

fn default_bind_address() -> String {
    "udp://0.0.0.0:1514".to_string()
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

fn default_queue_size() -> usize {
    DEFAULT_QUEUE_SIZE
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/containers")
}

fn default_pos_dir() -> PathBuf {
    PathBuf::from("/var/lib/logrelay")
}

fn default_scan_interval_ms() -> u64 {
    1_000
}

fn default_poll_interval_ms() -> u64 {
    100
}

// Bounds re-delivery after a crash
fn default_persist_interval_ms() -> u64 {
    5_000
}

fn default_logstash_client() -> String {
    "logrelay".to_string()
}

fn default_logstash_host() -> String {
    "localhost".to_string()
}

fn default_logstash_port() -> u16 {
    1984
}

fn default_logstash_protocol() -> String {
    "udp".to_string()
}

fn default_host_check_interval_ms() -> u64 {
    60_000
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.syslog.forward_addresses.is_empty() {
            anyhow::bail!("syslog.forward_addresses must list at least one collector");
        }
        if self.kubernetes.poll_interval_ms == 0 || self.kubernetes.scan_interval_ms == 0 {
            anyhow::bail!("kubernetes intervals must be greater than zero");
        }
        Ok(())
    }

    pub fn relay(&self) -> RelayConfig {
        RelayConfig {
            bind_address: self.syslog.bind_address.clone(),
            forward_addresses: self.syslog.forward_addresses.clone(),
            docker_endpoint: self.syslog.docker_endpoint.clone(),
            app_name_env_var: self.syslog.app_name_env_var.clone(),
            cache_size: self.syslog.cache_size,
            queue_size: self.syslog.queue_size,
        }
    }

    pub fn watcher(&self) -> WatcherConfig {
        let k8s = &self.kubernetes;
        WatcherConfig {
            scan_interval: Duration::from_millis(k8s.scan_interval_ms),
            tailer: TailerConfig {
                poll_interval: Duration::from_millis(k8s.poll_interval_ms),
                persist_interval: Duration::from_millis(k8s.persist_interval_ms.max(1)),
            },
        }
    }
}
