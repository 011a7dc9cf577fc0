//! Runtime settings for the lifecycle engine
//!
//! Defaults come from the crate-level constants; every field can be
//! overridden through a `KINA_*` environment variable.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::{
    DEFAULT_CONTAINER_CLI, DEFAULT_CSR_POLL_INTERVAL, DEFAULT_CSR_WINDOW, DEFAULT_NODE_IMAGE,
    DEFAULT_NODE_IP_TIMEOUT, DEFAULT_READY_POLL_INTERVAL, DEFAULT_WORKER_JOIN_CONCURRENCY,
};

/// Environment variable naming the container CLI binary
pub const ENV_CONTAINER_CLI: &str = "KINA_CONTAINER_CLI";
/// Environment variable for the kubeconfig output directory
pub const ENV_KUBECONFIG_DIR: &str = "KINA_KUBECONFIG_DIR";
/// Environment variable for the default node image
pub const ENV_NODE_IMAGE: &str = "KINA_NODE_IMAGE";
/// Environment variable for the CSR poll interval, in seconds
pub const ENV_CSR_POLL_INTERVAL: &str = "KINA_CSR_POLL_INTERVAL_SECS";
/// Environment variable for the CSR approval window, in seconds
pub const ENV_CSR_WINDOW: &str = "KINA_CSR_WINDOW_SECS";
/// Environment variable for the worker join fan-out
pub const ENV_WORKER_JOIN_CONCURRENCY: &str = "KINA_WORKER_JOIN_CONCURRENCY";

/// Engine-wide settings, shared by every operation of a
/// [`crate::lifecycle::ClusterLifecycle`].
#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Container CLI binary the default provider shells out to
    pub container_cli: String,
    /// Directory kubeconfig files are written to, one file per cluster
    pub kubeconfig_dir: PathBuf,
    /// Image used for nodes that don't name one
    pub node_image: String,
    /// Interval between CSR scans during bootstrap
    pub csr_poll_interval: Duration,
    /// Total time the bootstrap CSR watch runs for
    pub csr_window: Duration,
    /// Concurrent worker joins
    pub worker_join_concurrency: usize,
    /// Interval between readiness polls
    pub ready_poll_interval: Duration,
    /// How long a new node may take to report an IP
    pub node_ip_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            container_cli: DEFAULT_CONTAINER_CLI.to_string(),
            kubeconfig_dir: default_kubeconfig_dir(std::env::var("HOME").ok()),
            node_image: DEFAULT_NODE_IMAGE.to_string(),
            csr_poll_interval: DEFAULT_CSR_POLL_INTERVAL,
            csr_window: DEFAULT_CSR_WINDOW,
            worker_join_concurrency: DEFAULT_WORKER_JOIN_CONCURRENCY,
            ready_poll_interval: DEFAULT_READY_POLL_INTERVAL,
            node_ip_timeout: DEFAULT_NODE_IP_TIMEOUT,
        }
    }
}

fn default_kubeconfig_dir(home: Option<String>) -> PathBuf {
    let home = home.unwrap_or_else(|| ".".to_string());
    PathBuf::from(home).join(".kube").join("kina")
}

impl Settings {
    /// Defaults overridden by `KINA_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();

        if let Some(cli) = lookup(ENV_CONTAINER_CLI) {
            settings.container_cli = cli;
        }
        if let Some(dir) = lookup(ENV_KUBECONFIG_DIR) {
            settings.kubeconfig_dir = PathBuf::from(dir);
        }
        if let Some(image) = lookup(ENV_NODE_IMAGE) {
            settings.node_image = image;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_CSR_POLL_INTERVAL) {
            settings.csr_poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_CSR_WINDOW) {
            settings.csr_window = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<usize>(&lookup, ENV_WORKER_JOIN_CONCURRENCY) {
            settings.worker_join_concurrency = n.max(1);
        }

        settings
    }

    /// Path of the kubeconfig file for a cluster
    pub fn kubeconfig_path(&self, cluster: &str) -> PathBuf {
        self.kubeconfig_dir.join(cluster)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(variable = key, value = %raw, "Ignoring unparseable setting");
            None
        }
    }
}
