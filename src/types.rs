//! Runtime types shared across the lifecycle engine
//!
//! These describe what actually exists on the provider (nodes, exec results)
//! and what a finished create hands back to the caller ([`Cluster`]).

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Role a node plays in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Runs the API server, etcd and the rest of the control plane
    ControlPlane,
    /// Runs workloads only
    Worker,
}

impl NodeRole {
    /// Label value used on provider resources
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "control-plane",
            NodeRole::Worker => "worker",
        }
    }

    /// Parse a provider label value
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "control-plane" => Some(NodeRole::ControlPlane),
            "worker" => Some(NodeRole::Worker),
            _ => None,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a node as last observed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum NodeState {
    /// Container requested but not yet running
    Creating,
    /// Container running, Kubernetes not confirmed ready
    Running,
    /// Kubelet reports the Ready condition
    Ready,
    /// Kubelet registered but not Ready
    NotReady,
    /// Container exists but is stopped
    Stopped,
    /// State could not be determined
    #[default]
    Unknown,
}

impl NodeState {
    /// Map a container runtime status string onto a node state
    pub fn from_runtime_status(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "running" => NodeState::Running,
            "stopped" | "exited" => NodeState::Stopped,
            "created" | "creating" | "starting" => NodeState::Creating,
            _ => NodeState::Unknown,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Creating => "Creating",
            NodeState::Running => "Running",
            NodeState::Ready => "Ready",
            NodeState::NotReady => "NotReady",
            NodeState::Stopped => "Stopped",
            NodeState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// A node as it exists on the runtime provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeNode {
    /// Provider identifier used for exec and delete
    pub id: String,
    /// Node name, also the Kubernetes node name
    pub name: String,
    /// Cluster role
    pub role: NodeRole,
    /// Whether this is the control plane that runs `kubeadm init`
    pub primary: bool,
    /// Address on the cluster network, once assigned
    pub ip: Option<String>,
    /// Last observed state
    pub state: NodeState,
}

impl RuntimeNode {
    /// The node's IP, or an error naming the node if none is assigned yet
    pub fn require_ip(&self) -> Result<&str> {
        self.ip.as_deref().ok_or_else(|| {
            Error::internal_with_context(
                "require_ip",
                format!("node {} has no IP address assigned", self.name),
            )
        })
    }

    /// Whether the node is a control plane
    pub fn is_control_plane(&self) -> bool {
        self.role == NodeRole::ControlPlane
    }
}

/// Output of a command run inside a node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecResult {
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
    /// Process exit code (-1 when killed by a signal)
    pub exit_code: i32,
}

impl ExecResult {
    /// Whether the command exited with status zero
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`Error::ExecFailed`] carrying the output
    pub fn into_result(self, node: &str, command: &[&str]) -> Result<ExecResult> {
        if self.success() {
            return Ok(self);
        }
        Err(Error::ExecFailed {
            node: node.to_string(),
            command: command.join(" "),
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}

/// A running cluster, as returned by a successful create
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Cluster {
    /// Cluster name
    pub name: String,
    /// Every node, primary control plane first
    pub nodes: Vec<RuntimeNode>,
    /// API server URL reachable from the host
    pub endpoint: String,
    /// Where the admin kubeconfig was written, if Kubernetes was bootstrapped
    pub kubeconfig_path: Option<PathBuf>,
}

impl Cluster {
    /// The primary control-plane node
    pub fn primary(&self) -> Option<&RuntimeNode> {
        self.nodes.iter().find(|n| n.primary)
    }
}

/// A cluster as it looks right now
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    /// Cluster name
    pub name: String,
    /// Every node, with running nodes refined to Ready / NotReady when the
    /// API server answered
    pub nodes: Vec<RuntimeNode>,
    /// API server URL, if a control plane has an address
    pub endpoint: Option<String>,
    /// Whether the node list could be read through the API server
    pub api_reachable: bool,
}

impl ClusterStatus {
    /// Every node reports Ready
    pub fn is_ready(&self) -> bool {
        !self.nodes.is_empty() && self.nodes.iter().all(|n| n.state == NodeState::Ready)
    }
}

/// Per-call knobs for [`crate::lifecycle::ClusterLifecycle::create`]
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    /// Keep nodes around after a failure instead of cleaning up
    pub retain_on_failure: bool,
    /// Return right after provisioning, before any pipeline phase runs
    pub stop_before_kubernetes: bool,
    /// Skip the kubelet serving certificate approval watch
    pub skip_csr_approval: bool,
    /// Overrides the config's wait-for-ready duration
    pub wait: Option<Duration>,
    /// Overrides the settings' worker join fan-out
    pub worker_join_concurrency: Option<usize>,
}
