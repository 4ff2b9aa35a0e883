mod address;
mod config;
mod destination;
mod destinations;
mod error;
mod metric;
mod offset_store;
mod relay;
mod resolver;
mod runtime;
mod status;
mod tailer;
mod watcher;

use crate::config::{Config, MetricsConfig};
use crate::destination::Destination;
use crate::metric::LogstashSender;
use crate::relay::SyslogRelay;
use crate::status::CheckCollection;
use crate::watcher::Watcher;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "logrelay", about = "Node agent relaying container logs to syslog collectors")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "LOGRELAY_CONFIG", default_value = "/etc/logrelay/logrelay.yaml")]
    config: String,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, env = "LOGRELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOGRELAY_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let cfg = Config::load(&cli.config)?;
    info!(config = %cli.config, "Starting logrelay");

    let mut relay = SyslogRelay::new(cfg.relay())?;
    relay.start().await?;

    let watcher = match (cfg.kubernetes.enabled, relay.forwarder()) {
        (true, Some(forwarder)) => Some(start_watcher(&cfg, forwarder)?),
        _ => None,
    };

    let status_cancel = CancellationToken::new();
    let status = tokio::spawn(status_loop(cfg.clone(), status_cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    if let Some((token, handle)) = watcher {
        token.cancel();
        if let Err(e) = handle.await {
            error!(error = %e, "Watcher task failed");
        }
    }
    status_cancel.cancel();
    let _ = status.await;
    relay.stop();
    relay.wait().await;

    Ok(())
}

fn start_watcher(
    cfg: &Config,
    sink: Arc<destinations::SyslogForwarder>,
) -> anyhow::Result<(CancellationToken, JoinHandle<()>)> {
    let destination: Arc<dyn Destination> = sink;
    let mut watcher = Watcher::new(
        destination,
        &cfg.kubernetes.log_dir,
        &cfg.kubernetes.pos_dir,
    )?
    .with_config(cfg.watcher());
    let token = watcher.stop_token();
    let handle = tokio::spawn(async move { watcher.watch().await });
    Ok((token, handle))
}

async fn status_loop(cfg: Config, cancel: CancellationToken) {
    let checks = Arc::new(CheckCollection::new(&cfg.host_checks.extra_paths));
    let sender = match &cfg.metrics {
        Some(MetricsConfig::Logstash {
            client,
            host,
            port,
            protocol,
        }) => match LogstashSender::new(client, host, *port, protocol) {
            Ok(sender) => Some(sender),
            Err(e) => {
                warn!(error = %e, "Metrics disabled");
                None
            }
        },
        None => None,
    };

    let period = Duration::from_millis(cfg.host_checks.interval_ms.max(1));
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        // Probe files go through blocking std::fs
        let runner = checks.clone();
        let results = match tokio::task::spawn_blocking(move || runner.run()).await {
            Ok(results) => results,
            Err(e) => {
                error!(error = %e, "Host checks task failed");
                continue;
            }
        };

        for result in results {
            let Some(sender) = &sender else { continue };
            let value = if result.successful { 1 } else { 0 };
            let key = format!("check_{}", result.name);
            if let Err(e) = sender.send_host(&key, value.into()).await {
                warn!(metric = %key, error = %e, "Failed to send host metric");
            }
        }
    }
}
