//! kina - local Kubernetes clusters on VM-backed containers
//!
//! kina provisions each cluster node as its own lightweight VM-backed
//! container, bootstraps the control plane with kubeadm, joins the remaining
//! nodes and tears everything down again if any step fails.
//!
//! # Architecture
//!
//! A create runs as a fixed sequence:
//! - the runtime provider creates every node concurrently
//! - the action pipeline runs the post-provisioning phases strictly in order
//!   (endpoint, kubeadm config, init, CNI, storage, join, wait-for-ready)
//! - a bounded watch approves kubelet serving certificates
//!
//! Any failure after the first resource exists is routed through diagnostics
//! collection and the cleanup guard before it is returned.
//!
//! # Modules
//!
//! - [`lifecycle`] - Top-level create/delete/query operations
//! - [`provider`] - Runtime provider abstraction and the container CLI backend
//! - [`pipeline`] - Ordered post-provisioning phases
//! - [`join`] - Control-plane and worker join sequencing
//! - [`csr`] - Kubelet serving certificate approval
//! - [`cleanup`] - Rollback guard for partially created clusters
//! - [`recovery`] - Diagnostics attached to failed operations
//! - [`retry`] - Retry policies keyed by error category
//! - [`config`] - Cluster configuration and validation
//! - [`settings`] - Engine settings with environment overrides
//! - [`types`] - Nodes, exec results, clusters
//! - [`kube_utils`] - Kubernetes client and polling helpers
//! - [`telemetry`] - Tracing setup
//! - [`error`] - Error types

#![deny(missing_docs)]

use std::time::Duration;

pub mod cleanup;
pub mod config;
pub mod csr;
pub mod error;
pub mod join;
pub mod kube_utils;
pub mod lifecycle;
pub mod pipeline;
pub mod provider;
pub mod recovery;
pub mod retry;
pub mod settings;
pub mod telemetry;
pub mod types;

pub use config::{ClusterConfig, NodeSpec};
pub use error::Error;
pub use lifecycle::ClusterLifecycle;
pub use provider::RuntimeProvider;
pub use settings::Settings;
pub use types::{Cluster, ClusterStatus, CreateOptions, NodeRole, NodeState, RuntimeNode};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Port the API server listens on inside the control-plane nodes
pub const DEFAULT_API_SERVER_PORT: u16 = 6443;

/// Container CLI the default provider shells out to
pub const DEFAULT_CONTAINER_CLI: &str = "container";

/// Node image used when a node spec doesn't name one
pub const DEFAULT_NODE_IMAGE: &str = "kindest/node:v1.31.0";

/// Default wait for all nodes to report Ready
pub const DEFAULT_WAIT_FOR_READY: Duration = Duration::from_secs(300);

/// Interval between CSR scans during bootstrap
pub const DEFAULT_CSR_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Total bootstrap CSR watch window
pub const DEFAULT_CSR_WINDOW: Duration = Duration::from_secs(60);

/// Concurrent worker joins
pub const DEFAULT_WORKER_JOIN_CONCURRENCY: usize = 4;

/// Concurrent node creations during provisioning
pub const PROVISION_CONCURRENCY: usize = 8;

/// Interval between node readiness polls
pub const DEFAULT_READY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How long a new node may take to report an IP address
pub const DEFAULT_NODE_IP_TIMEOUT: Duration = Duration::from_secs(60);

/// Signer name of kubelet serving certificates
pub const KUBELET_SERVING_SIGNER: &str = "kubernetes.io/kubelet-serving";

/// Prefix of every label kina owns on provider resources
pub const LABEL_PREFIX: &str = "io.kina.";

/// Label carrying the cluster name on provider resources
pub const LABEL_CLUSTER: &str = "io.kina.cluster";

/// Label carrying the node role on provider resources
pub const LABEL_ROLE: &str = "io.kina.role";

/// Label marking the primary control plane
pub const LABEL_PRIMARY: &str = "io.kina.primary";

/// Label on the primary carrying the port the API server binds
pub const LABEL_API_SERVER_PORT: &str = "io.kina.api-server-port";

/// Label on the primary carrying a configured API server address
pub const LABEL_API_SERVER_ADDRESS: &str = "io.kina.api-server-address";

/// Prefix of per-cluster provider networks
pub const NETWORK_PREFIX: &str = "kina-";

/// Where the rendered kubeadm config lives on every node
pub const KUBEADM_CONFIG_PATH: &str = "/kind/kubeadm.conf";

/// Admin kubeconfig written by kubeadm on control planes
pub const ADMIN_KUBECONFIG_PATH: &str = "/etc/kubernetes/admin.conf";

/// Name of the provider network for a cluster
pub fn network_name(cluster: &str) -> String {
    format!("{NETWORK_PREFIX}{cluster}")
}
