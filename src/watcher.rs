// Kubernetes log directory watcher
//
// The kubelet links every container's log file into one directory using the
// name <pod>_<namespace>_<container>-<id>.log. Each scan reconciles the set
// of running tailers with the files currently present: new ids get a tailer,
// ids whose file vanished (or whose tailer died) lose theirs.

use crate::destination::Destination;
use crate::error::{Error, Result};
use crate::tailer::{Tailer, TailerConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const PAUSE_CONTAINER_NAME: &str = "POD";
const SYSTEM_NAMESPACE: &str = "kube-system";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileEntry {
    pub pod_name: String,
    pub namespace: String,
    pub container_name: String,
    pub container_id: String,
}

impl LogFileEntry {
    /// Parse "<pod>_<namespace>_<container>-<id>.log". Pod and namespace
    /// never contain '_'; container names may contain '-', ids never do.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".log")?;
        let mut parts = stem.splitn(3, '_');
        let pod_name = parts.next()?;
        let namespace = parts.next()?;
        let (container_name, container_id) = parts.next()?.rsplit_once('-')?;

        if [pod_name, namespace, container_name, container_id]
            .iter()
            .any(|s| s.is_empty())
        {
            return None;
        }

        Some(Self {
            pod_name: pod_name.to_string(),
            namespace: namespace.to_string(),
            container_name: container_name.to_string(),
            container_id: container_id.to_string(),
        })
    }

    /// Sandbox containers and platform namespaces are never tailed
    pub fn is_ignored(&self) -> bool {
        self.container_name == PAUSE_CONTAINER_NAME || self.namespace == SYSTEM_NAMESPACE
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatcherConfig {
    pub scan_interval: Duration,
    pub tailer: TailerConfig,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(1),
            tailer: TailerConfig::default(),
        }
    }
}

pub struct Watcher {
    destination: Arc<dyn Destination>,
    log_dir: PathBuf,
    pos_dir: PathBuf,
    config: WatcherConfig,
    // Only the watcher's own reconcile step writes to this map
    tailers: HashMap<String, Tailer>,
    cancel: CancellationToken,
}

impl Watcher {
    pub fn new(
        destination: Arc<dyn Destination>,
        log_dir: impl Into<PathBuf>,
        pos_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let log_dir = log_dir.into();
        if !log_dir.is_dir() {
            return Err(Error::NoLogDirectory(log_dir));
        }

        Ok(Self {
            destination,
            log_dir,
            pos_dir: pos_dir.into(),
            config: WatcherConfig::default(),
            tailers: HashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_config(mut self, config: WatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Token that stops watch() from another task
    pub fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Scan and reconcile until stopped, then stop every tailer.
    pub async fn watch(&mut self) {
        info!(log_dir = %self.log_dir.display(), "Watching container log directory");

        loop {
            self.watch_once().await;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.scan_interval) => {}
            }
        }

        self.shutdown().await;
    }

    pub async fn watch_once(&mut self) {
        let current = match self.scan().await {
            Ok(current) => current,
            Err(e) => {
                warn!(log_dir = %self.log_dir.display(), error = %e, "Failed to scan log directory");
                return;
            }
        };

        let gone: Vec<String> = self
            .tailers
            .iter()
            .filter(|(id, tailer)| !current.contains_key(*id) || !tailer.is_alive())
            .map(|(id, _)| id.clone())
            .collect();

        for id in gone {
            if let Some(mut tailer) = self.tailers.remove(&id) {
                if current.contains_key(&id) {
                    warn!(container_id = %id, "Tailer died, restarting");
                } else {
                    info!(container_id = %id, "Log file removed, stopping tailer");
                }
                tailer.stop();
                tailer.wait().await;
                if !current.contains_key(&id) {
                    self.forget_position(&id).await;
                }
            }
        }

        for (id, path) in current {
            if self.tailers.contains_key(&id) {
                continue;
            }

            match self.start_tailer(&id, path).await {
                Ok(tailer) => {
                    info!(container_id = %id, path = %tailer.path().display(), "Started tailer");
                    self.tailers.insert(id, tailer);
                }
                Err(e) => warn!(container_id = %id, error = %e, "Unable to start tailer"),
            }
        }
    }

    /// Stop and wait for every tracked tailer.
    pub async fn shutdown(&mut self) {
        for (id, mut tailer) in self.tailers.drain() {
            debug!(container_id = %id, "Stopping tailer");
            tailer.stop();
            tailer.wait().await;
        }
    }

    async fn forget_position(&self, id: &str) {
        let pos = self.pos_dir.join(id);
        match fs::remove_file(&pos).await {
            Ok(()) => debug!(container_id = %id, "Removed position file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %pos.display(), error = %e, "Failed to remove position file"),
        }
    }

    async fn start_tailer(&self, id: &str, path: PathBuf) -> Result<Tailer> {
        let mut tailer = Tailer::new(self.destination.clone(), path, id)?
            .with_offset_store(self.pos_dir.join(id))
            .with_config(self.config.tailer);
        tailer.start().await?;
        tailer.run();
        Ok(tailer)
    }

    /// container id -> log file path for every file worth tailing
    async fn scan(&self) -> Result<HashMap<String, PathBuf>> {
        let mut found = HashMap::new();
        let mut dir = fs::read_dir(&self.log_dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(parsed) = LogFileEntry::from_file_name(name) else {
                trace!(file = name, "Skipping file with unexpected name");
                continue;
            };
            if parsed.is_ignored() {
                trace!(file = name, "Skipping infrastructure container");
                continue;
            }
            found.insert(parsed.container_id, entry.path());
        }

        Ok(found)
    }

    #[cfg(test)]
    pub fn tracked_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tailers.keys().cloned().collect();
        ids.sort();
        ids
    }
}
