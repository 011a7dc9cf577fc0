//! Error types for kina
//!
//! Errors are structured with fields to aid debugging. Each variant carries
//! the cluster, node, or command it concerns so a failed create can be
//! explained without a verbose re-run. [`Error::kind`] collapses variants
//! into the categories the retry policy and cleanup logic reason about.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::recovery::OperationFailure;
use crate::types::RuntimeNode;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// How a provider failure is expected to behave if retried
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderFailure {
    /// Resource temporarily unavailable, busy, refused
    Transient,
    /// The runtime or a registry did not answer in time
    NetworkTimeout,
    /// The node image could not be pulled
    ImagePull,
    /// Anything else; retrying will not help
    Fatal,
}

/// Error categories used for retry and cleanup decisions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input, rejected before touching any resource
    Validation,
    /// A cluster or node with this name already exists
    NameConflict,
    /// The named cluster does not exist
    NotFound,
    /// Provider failure that may succeed on retry
    ProviderTransient,
    /// Provider call timed out on the network
    NetworkTimeout,
    /// Node image pull failed
    ImagePull,
    /// Provider failure that will not succeed on retry
    ProviderFatal,
    /// Command inside a node exited non-zero
    Exec,
    /// One or more nodes failed to join
    Join,
    /// Nodes did not become ready in time
    BootstrapTimeout,
    /// Teardown itself failed
    Cleanup,
    /// Kubernetes API or kubeconfig failure
    Kubernetes,
    /// Everything else
    Internal,
}

/// A single node's join failure inside an aggregate [`Error::Join`]
#[derive(Debug)]
pub struct JoinFailure {
    /// Node that failed to join
    pub node: String,
    /// Why it failed
    pub cause: Box<Error>,
}

impl fmt::Display for JoinFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.node, self.cause)
    }
}

/// Main error type for kina operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid cluster configuration
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "networking.podSubnet")
        field: Option<String>,
    },

    /// A cluster with this name already exists or is being created
    #[error("cluster {cluster} already exists")]
    AlreadyExists {
        /// Conflicting cluster name
        cluster: String,
    },

    /// Another create or delete for this cluster is in progress
    #[error("another operation on cluster {cluster} is in progress")]
    InProgress {
        /// Busy cluster name
        cluster: String,
    },

    /// The provider already has a node with this name
    #[error("node {node} already exists")]
    NodeAlreadyExists {
        /// Conflicting node name
        node: String,
    },

    /// The cluster does not exist
    #[error("cluster {cluster} not found")]
    NotFound {
        /// Missing cluster name
        cluster: String,
    },

    /// Runtime provider error
    #[error("provider error [{provider}] for {cluster}: {message}")]
    Provider {
        /// Cluster the call was made for
        cluster: String,
        /// Provider name
        provider: String,
        /// Description of what failed
        message: String,
        /// Retry behaviour of this failure
        failure: ProviderFailure,
    },

    /// Command inside a node exited non-zero
    #[error("`{command}` failed on {node} (exit code {exit_code}): {}", last_line(stderr, stdout))]
    ExecFailed {
        /// Node the command ran on
        node: String,
        /// The command line
        command: String,
        /// Exit code
        exit_code: i32,
        /// Captured standard output
        stdout: String,
        /// Captured standard error
        stderr: String,
    },

    /// Provisioning stopped at the first node failure
    #[error("provisioning node {node} for {cluster} failed: {source}")]
    Provision {
        /// Cluster being provisioned
        cluster: String,
        /// First node that failed
        node: String,
        /// Nodes this attempt did create before stopping
        created: Vec<RuntimeNode>,
        /// Why the node failed
        source: Box<Error>,
    },

    /// One or more nodes failed to join the cluster
    #[error("join failed: {}", join_summary(failures))]
    Join {
        /// Every node that failed, in completion order
        failures: Vec<JoinFailure>,
    },

    /// Nodes did not report Ready before the timeout
    #[error("cluster {cluster} not ready after {waited:?}, waiting on: {}", stragglers.join(", "))]
    BootstrapTimeout {
        /// Cluster being waited on
        cluster: String,
        /// How long we waited
        waited: Duration,
        /// Nodes that were still not Ready
        stragglers: Vec<String>,
    },

    /// Teardown failed (secondary; attached as a note when rolling back)
    #[error("cleanup error for {cluster}: {message}")]
    Cleanup {
        /// Cluster being torn down
        cluster: String,
        /// What could not be removed
        message: String,
    },

    /// Kubeconfig could not be produced or read
    #[error("kubeconfig error for {cluster}: {message}")]
    Kubeconfig {
        /// Cluster the kubeconfig belongs to
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document being processed (if known)
        kind: Option<String>,
    },

    /// Local filesystem or process spawn error
    #[error("io error: {source}")]
    Io {
        /// The underlying io error
        #[from]
        source: std::io::Error,
    },

    /// Internal error with context
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Where the error happened
        context: String,
        /// Description of what failed
        message: String,
    },

    /// A create or delete that failed after touching resources
    #[error("{0}")]
    Operation(Box<OperationFailure>),
}

fn last_line<'a>(stderr: &'a str, stdout: &'a str) -> &'a str {
    let text = if stderr.trim().is_empty() { stdout } else { stderr };
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(str::trim)
        .unwrap_or("no output")
}

fn join_summary(failures: &[JoinFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<OperationFailure> for Error {
    fn from(failure: OperationFailure) -> Self {
        Error::Operation(Box::new(failure))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

impl Error {
    /// Create a validation error with cluster and field context
    pub fn validation_for(
        cluster: impl Into<String>,
        message: impl Into<String>,
        field: Option<&str>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: message.into(),
            field: field.map(str::to_string),
        }
    }

    /// Create a provider error with full context
    pub fn provider_for(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        message: impl Into<String>,
        failure: ProviderFailure,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: message.into(),
            failure,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error naming the document kind
    pub fn serialization_for(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a kubeconfig error
    pub fn kubeconfig(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Kubeconfig {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a cleanup error
    pub fn cleanup(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cleanup {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::internal_with_context(UNKNOWN_CONTEXT, msg)
    }

    /// The category this error belongs to
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Kube { .. } | Error::Kubeconfig { .. } => ErrorKind::Kubernetes,
            Error::Validation { .. } => ErrorKind::Validation,
            Error::AlreadyExists { .. }
            | Error::InProgress { .. }
            | Error::NodeAlreadyExists { .. } => ErrorKind::NameConflict,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Provider { failure, .. } => match failure {
                ProviderFailure::Transient => ErrorKind::ProviderTransient,
                ProviderFailure::NetworkTimeout => ErrorKind::NetworkTimeout,
                ProviderFailure::ImagePull => ErrorKind::ImagePull,
                ProviderFailure::Fatal => ErrorKind::ProviderFatal,
            },
            Error::ExecFailed { .. } => ErrorKind::Exec,
            Error::Provision { source, .. } => source.kind(),
            Error::Join { .. } => ErrorKind::Join,
            Error::BootstrapTimeout { .. } => ErrorKind::BootstrapTimeout,
            Error::Cleanup { .. } => ErrorKind::Cleanup,
            Error::Serialization { .. } | Error::Io { .. } | Error::Internal { .. } => {
                ErrorKind::Internal
            }
            Error::Operation(failure) => failure.cause.kind(),
        }
    }

    /// Whether the retry policy for this error's kind allows another attempt
    pub fn is_retryable(&self) -> bool {
        crate::retry::RetryPolicy::for_kind(self.kind()).max_attempts() > 1
    }

    /// Whether this is a name conflict ("already exists")
    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::NameConflict
    }

    /// Get the cluster name associated with this error, if any
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. }
            | Error::AlreadyExists { cluster }
            | Error::InProgress { cluster }
            | Error::NotFound { cluster }
            | Error::Provider { cluster, .. }
            | Error::Provision { cluster, .. }
            | Error::BootstrapTimeout { cluster, .. }
            | Error::Cleanup { cluster, .. }
            | Error::Kubeconfig { cluster, .. } => Some(cluster),
            Error::Operation(failure) => Some(&failure.cluster),
            _ => None,
        }
    }

    /// Nodes this error is about, for diagnostics
    pub fn affected_nodes(&self) -> Vec<String> {
        match self {
            Error::NodeAlreadyExists { node } | Error::ExecFailed { node, .. } => {
                vec![node.clone()]
            }
            Error::Provision { node, .. } => vec![node.clone()],
            Error::Join { failures } => failures.iter().map(|f| f.node.clone()).collect(),
            Error::BootstrapTimeout { stragglers, .. } => stragglers.clone(),
            Error::Operation(failure) => failure.nodes.clone(),
            _ => Vec::new(),
        }
    }

    /// Stdout/stderr excerpt of the deepest failed command, if any
    pub fn command_output(&self) -> Option<&str> {
        match self {
            Error::ExecFailed { stdout, stderr, .. } => {
                if stderr.trim().is_empty() {
                    Some(stdout)
                } else {
                    Some(stderr)
                }
            }
            Error::Provision { source, .. } => source.command_output(),
            Error::Join { failures } => failures.iter().find_map(|f| f.cause.command_output()),
            Error::Operation(failure) => failure.cause.command_output(),
            _ => None,
        }
    }
}
