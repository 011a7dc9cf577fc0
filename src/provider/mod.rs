//! Runtime provider abstraction layer
//!
//! A provider creates, lists, deletes and execs into nodes, one VM-backed
//! container per node. Each provider implements [`RuntimeProvider`]; the
//! lifecycle engine only ever talks to the trait.
//!
//! # Supported Providers
//!
//! - [`ContainerCliProvider`] - shells out to the `container` CLI
//!
//! Node membership is never cached: every listing goes back to the
//! provider, and provider labels (`io.kina.cluster`, `io.kina.role`,
//! `io.kina.primary`) are the only record of which node belongs where.

mod container;
#[cfg(test)]
pub(crate) mod testing;

pub use container::ContainerCliProvider;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, NodePlan, Networking};
use crate::retry::retry_with_policy;
use crate::types::{ExecResult, RuntimeNode};
use crate::{Error, Result, PROVISION_CONCURRENCY};

/// Backend that hosts cluster nodes
#[async_trait]
pub trait RuntimeProvider: Send + Sync {
    /// Provider name for logs and errors
    fn name(&self) -> &str;

    /// Create the cluster network if it doesn't exist yet
    async fn ensure_network(&self, cluster: &str, networking: &Networking) -> Result<()>;

    /// Delete the cluster network; a missing network is not an error
    async fn delete_network(&self, cluster: &str) -> Result<()>;

    /// Create one node and return once it has an IP address.
    ///
    /// Fails with [`Error::NodeAlreadyExists`] if the name is taken.
    async fn create_node(&self, cluster: &str, plan: &NodePlan) -> Result<RuntimeNode>;

    /// All nodes labelled with this cluster name, in any state
    async fn list_nodes(&self, cluster: &str) -> Result<Vec<RuntimeNode>>;

    /// Delete nodes; nodes that are already gone are skipped
    async fn delete_nodes(&self, nodes: &[RuntimeNode]) -> Result<()>;

    /// `https://<host>:<port>` of the cluster's API server
    async fn get_api_server_endpoint(&self, cluster: &str) -> Result<String>;

    /// Run a command inside a node.
    ///
    /// A non-zero exit is returned in the [`ExecResult`], not as an error.
    async fn exec_in_container(&self, node_id: &str, command: &[&str]) -> Result<ExecResult>;

    /// Write a file inside a node, creating parent directories
    async fn write_file(&self, node_id: &str, path: &str, content: &str) -> Result<()>;

    /// Copy a host file into a node, creating parent directories
    async fn copy_file(&self, node_id: &str, host_path: &Path, path: &str) -> Result<()>;

    /// Names of every cluster with at least one node
    async fn list_clusters(&self) -> Result<Vec<String>>;

    /// Run a command and turn a non-zero exit into [`Error::ExecFailed`]
    async fn exec_checked(&self, node: &RuntimeNode, command: &[&str]) -> Result<ExecResult> {
        self.exec_in_container(&node.id, command)
            .await?
            .into_result(&node.name, command)
    }

    /// Create every node of the cluster concurrently.
    ///
    /// Each create is retried according to its error's category. After the
    /// first failure no further creates are started; creates already in
    /// flight are awaited, and the error carries whatever was created so
    /// the caller can clean up.
    async fn provision(
        &self,
        config: &ClusterConfig,
        default_image: &str,
    ) -> Result<Vec<RuntimeNode>> {
        let cluster = config.name.as_str();
        let plans = config.node_plans(default_image);

        info!(
            cluster = %cluster,
            provider = %self.name(),
            nodes = plans.len(),
            "Provisioning nodes"
        );
        self.ensure_network(cluster, &config.networking).await?;

        let abort = AtomicBool::new(false);
        let abort = &abort;
        let plans = &plans;

        let mut creates = futures::stream::iter(0..plans.len())
            .map(move |i| async move {
                let plan = &plans[i];
                if abort.load(Ordering::SeqCst) {
                    debug!(node = %plan.name, "Skipping node create after earlier failure");
                    return Ok(None);
                }
                let operation = format!("create node {}", plan.name);
                retry_with_policy(&operation, move || self.create_node(cluster, plan))
                    .await
                    .map(Some)
                    .map_err(|e| (plan.name.clone(), e))
            })
            .buffer_unordered(PROVISION_CONCURRENCY);

        let mut created = Vec::with_capacity(plans.len());
        let mut first_failure: Option<(String, Error)> = None;

        while let Some(outcome) = creates.next().await {
            match outcome {
                Ok(Some(node)) => {
                    debug!(node = %node.name, ip = ?node.ip, "Node created");
                    created.push(node);
                }
                Ok(None) => {}
                Err((node, e)) => {
                    abort.store(true, Ordering::SeqCst);
                    if first_failure.is_none() {
                        first_failure = Some((node, e));
                    } else {
                        warn!(node = %node, error = %e, "Additional node create failed");
                    }
                }
            }
        }
        drop(creates);

        created.sort_by_key(|n| plans.iter().position(|p| p.name == n.name));

        match first_failure {
            None => Ok(created),
            Some((node, source)) => Err(Error::Provision {
                cluster: cluster.to_string(),
                node,
                created,
                source: Box::new(source),
            }),
        }
    }
}
