//! Embedded etcd host: a queue that owns a local single-node server.
//!
//! There is no embeddable etcd library for Rust, so the host supervises a
//! local `etcd` child process bound to localhost and tears it down with the
//! queue. Useful for standalone deployments with no external cluster.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use kv::EtcdStore;

use crate::{Error, Queue};

/// Budget for the child to begin serving client traffic.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

const STARTUP_POLL: Duration = Duration::from_millis(250);

const SERVER_NAME: &str = "sluice";

/// Configuration of the embedded server. Unlisted etcd options keep the
/// server's defaults.
#[derive(Debug, Clone)]
pub struct EmbedConfig {
    /// TCP port for client traffic on localhost.
    pub client_port: u16,
    /// TCP port for peer traffic; required even for a single node.
    pub peer_port: u16,
    /// Directory for the persisted log and snapshots.
    pub data_dir: PathBuf,
    /// Periodic history compaction window, in hours. Minimum 1.
    pub compaction_retention_hours: u32,
    /// Log entries between snapshots. Kept low to bound replay cost.
    pub snapshot_entry_count: u64,
}

impl EmbedConfig {
    pub fn new(client_port: u16, peer_port: u16, data_dir: impl Into<PathBuf>) -> EmbedConfig {
        EmbedConfig {
            client_port,
            peer_port,
            data_dir: data_dir.into(),
            compaction_retention_hours: 1,
            snapshot_entry_count: 1000,
        }
    }

    pub fn client_endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.client_port)
    }

    fn peer_endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.peer_port)
    }

    /// Arguments for a single-node cluster whose initial cluster is
    /// itself.
    fn to_args(&self) -> Vec<String> {
        vec![
            format!("--name={SERVER_NAME}"),
            format!("--data-dir={}", self.data_dir.display()),
            format!("--listen-client-urls={}", self.client_endpoint()),
            format!("--advertise-client-urls={}", self.client_endpoint()),
            format!("--listen-peer-urls={}", self.peer_endpoint()),
            format!("--initial-advertise-peer-urls={}", self.peer_endpoint()),
            format!("--initial-cluster={SERVER_NAME}={}", self.peer_endpoint()),
            "--initial-cluster-state=new".to_string(),
            "--auto-compaction-mode=periodic".to_string(),
            format!(
                "--auto-compaction-retention={}h",
                self.compaction_retention_hours.max(1)
            ),
            format!("--snapshot-count={}", self.snapshot_entry_count.max(1)),
        ]
    }
}

enum Startup {
    Exited(std::io::Result<std::process::ExitStatus>),
    Canceled,
    Ready(Result<EtcdStore, tokio::time::error::Elapsed>),
}

/// A queue served by its own local etcd.
pub struct EmbeddedQueue {
    queue: Queue,
    server: Child,
    endpoint: String,
}

impl EmbeddedQueue {
    /// Starts the server and builds a queue over it.
    ///
    /// Startup races four signals: server ready, server exit, `cancel`,
    /// and a timeout. Only ready yields a queue; every other outcome
    /// tears the child down and fails construction.
    #[tracing::instrument(level = "info", skip_all, fields(endpoint = %config.client_endpoint()))]
    pub async fn start(cancel: CancellationToken, config: EmbedConfig) -> crate::Result<EmbeddedQueue> {
        let mut server = Command::new("etcd")
            .args(config.to_args())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let endpoint = config.client_endpoint();
        tracing::info!(data_dir = %config.data_dir.display(), "starting embedded etcd");

        let ready = tokio::time::timeout(STARTUP_TIMEOUT, wait_ready(&endpoint));
        tokio::pin!(ready);

        let startup = tokio::select! {
            exit = server.wait() => Startup::Exited(exit),
            _ = cancel.cancelled() => Startup::Canceled,
            ready = &mut ready => Startup::Ready(ready),
        };

        match startup {
            Startup::Exited(exit) => Err(Error::ServerExited(exit?.to_string())),
            Startup::Canceled => {
                server.kill().await?;
                Err(Error::StartupCanceled)
            }
            Startup::Ready(Err(_elapsed)) => {
                server.kill().await?;
                Err(Error::StartupTimeout(STARTUP_TIMEOUT))
            }
            Startup::Ready(Ok(store)) => match Queue::new(Arc::new(store)).await {
                Ok(queue) => {
                    tracing::info!("embedded etcd ready");
                    Ok(EmbeddedQueue {
                        queue,
                        server,
                        endpoint: endpoint.clone(),
                    })
                }
                Err(err) => {
                    server.kill().await?;
                    Err(err)
                }
            },
        }
    }

    /// The queue backed by the embedded server.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Client endpoint of the embedded server.
    pub fn client_endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stops the engine first, then the server.
    pub async fn stop(mut self) -> crate::Result<()> {
        self.queue.stop();
        self.server.kill().await?;
        Ok(())
    }
}

/// Polls until the server answers a status round-trip.
async fn wait_ready(endpoint: &str) -> EtcdStore {
    loop {
        if let Ok(store) = EtcdStore::connect([endpoint]).await {
            if store.status().await.is_ok() {
                return store;
            }
        }
        tokio::time::sleep(STARTUP_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> (EmbedConfig, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = portpicker::pick_unused_port().expect("free port");
        let peer = portpicker::pick_unused_port().expect("free port");
        (EmbedConfig::new(client, peer, dir.path()), dir)
    }

    #[test]
    fn defaults_bound_history_and_replay() {
        let (config, _dir) = config();
        assert_eq!(config.compaction_retention_hours, 1);
        assert_eq!(config.snapshot_entry_count, 1000);
    }

    #[test]
    fn args_describe_a_single_node_cluster() {
        let (config, _dir) = config();
        let args = config.to_args();

        let client = format!("--listen-client-urls=http://127.0.0.1:{}", config.client_port);
        let peer = format!("--initial-cluster=sluice=http://127.0.0.1:{}", config.peer_port);
        assert!(args.contains(&client));
        assert!(args.contains(&peer));
        assert!(args.contains(&"--initial-cluster-state=new".to_string()));
        assert!(args.contains(&"--auto-compaction-mode=periodic".to_string()));
        assert!(args.contains(&"--auto-compaction-retention=1h".to_string()));
        assert!(args.contains(&"--snapshot-count=1000".to_string()));
    }

    #[test]
    fn zero_retention_and_snapshot_clamp_to_minimums() {
        let (mut config, _dir) = config();
        config.compaction_retention_hours = 0;
        config.snapshot_entry_count = 0;

        let args = config.to_args();
        assert!(args.contains(&"--auto-compaction-retention=1h".to_string()));
        assert!(args.contains(&"--snapshot-count=1".to_string()));
    }
}
