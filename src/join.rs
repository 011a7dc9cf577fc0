//! Node join sequencing
//!
//! Secondary control planes join one at a time, in order, because each one
//! extends etcd membership and a concurrent join can break quorum. Workers
//! carry no such state and join concurrently up to a fan-out limit; one
//! worker failing does not cancel the others.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use tracing::{debug, info, warn};

use crate::error::JoinFailure;
use crate::kube_utils::{kubectl, node_is_ready, parse_item_list};
use crate::provider::RuntimeProvider;
use crate::types::RuntimeNode;
use crate::{Error, Result, KUBEADM_CONFIG_PATH};

/// Joins the non-primary nodes of one cluster
pub struct NodeJoinCoordinator<'a> {
    provider: &'a dyn RuntimeProvider,
    nodes: &'a [RuntimeNode],
    worker_concurrency: usize,
}

impl<'a> NodeJoinCoordinator<'a> {
    /// Coordinator over `nodes`, joining at most `worker_concurrency` workers at once
    pub fn new(
        provider: &'a dyn RuntimeProvider,
        nodes: &'a [RuntimeNode],
        worker_concurrency: usize,
    ) -> Self {
        Self {
            provider,
            nodes,
            worker_concurrency: worker_concurrency.max(1),
        }
    }

    /// The single node flagged primary
    pub fn primary(&self) -> Result<&'a RuntimeNode> {
        let mut primaries = self.nodes.iter().filter(|n| n.primary);
        match (primaries.next(), primaries.next()) {
            (Some(primary), None) => Ok(primary),
            (None, _) => Err(Error::internal_with_context(
                "join",
                "no primary control-plane node",
            )),
            (Some(_), Some(_)) => Err(Error::internal_with_context(
                "join",
                "more than one primary control-plane node",
            )),
        }
    }

    fn secondaries(&self) -> impl Iterator<Item = &'a RuntimeNode> {
        self.nodes
            .iter()
            .filter(|n| n.is_control_plane() && !n.primary)
    }

    fn workers(&self) -> impl Iterator<Item = &'a RuntimeNode> {
        self.nodes.iter().filter(|n| !n.is_control_plane())
    }

    async fn join_node(&self, node: &RuntimeNode) -> Result<()> {
        let config_arg = format!("--config={KUBEADM_CONFIG_PATH}");
        let command = [
            "kubeadm",
            "join",
            config_arg.as_str(),
            "--skip-phases=preflight",
            "--v=1",
        ];
        debug!(node = %node.name, "Running kubeadm join");
        self.provider.exec_checked(node, &command).await?;
        info!(node = %node.name, role = %node.role, "Node joined");
        Ok(())
    }

    /// Join every secondary control plane, then every worker.
    ///
    /// The first control-plane failure ends the phase; workers are not
    /// attempted. Worker failures are collected and reported together once
    /// every worker join has finished.
    pub async fn join_all(&self) -> Result<()> {
        self.primary()?;

        for node in self.secondaries() {
            if let Err(e) = self.join_node(node).await {
                warn!(
                    node = %node.name,
                    error = %e,
                    "Control-plane join failed; its etcd member may remain registered"
                );
                return Err(Error::Join {
                    failures: vec![JoinFailure {
                        node: node.name.clone(),
                        cause: Box::new(e),
                    }],
                });
            }
        }

        let workers: Vec<&RuntimeNode> = self.workers().collect();
        if workers.is_empty() {
            return Ok(());
        }
        info!(
            workers = workers.len(),
            concurrency = self.worker_concurrency,
            "Joining workers"
        );

        let failures: Vec<JoinFailure> = futures::stream::iter(workers)
            .map(move |node| async move {
                self.join_node(node).await.map_err(|e| JoinFailure {
                    node: node.name.clone(),
                    cause: Box::new(e),
                })
            })
            .buffer_unordered(self.worker_concurrency)
            .filter_map(|outcome| async move { outcome.err() })
            .collect()
            .await;

        if failures.is_empty() {
            Ok(())
        } else {
            for failure in &failures {
                warn!(node = %failure.node, error = %failure.cause, "Worker join failed");
            }
            Err(Error::Join { failures })
        }
    }

    /// Poll until every node reports Ready.
    ///
    /// Returns the ready node names. A zero `timeout` checks exactly once.
    /// Query errors count as "nothing ready yet".
    pub async fn wait_for_ready(
        &self,
        cluster: &str,
        timeout: Duration,
        interval: Duration,
    ) -> Result<BTreeSet<String>> {
        let primary = self.primary()?;
        let start = tokio::time::Instant::now();

        loop {
            let ready: BTreeSet<String> = match node_readiness(self.provider, primary).await {
                Ok(readiness) => readiness
                    .into_iter()
                    .filter_map(|(name, ready)| ready.then_some(name))
                    .collect(),
                Err(e) => {
                    debug!(cluster = %cluster, error = %e, "Node readiness check failed");
                    BTreeSet::new()
                }
            };
            let stragglers: Vec<String> = self
                .nodes
                .iter()
                .filter(|n| !ready.contains(&n.name))
                .map(|n| n.name.clone())
                .collect();

            if stragglers.is_empty() {
                info!(cluster = %cluster, nodes = ready.len(), "All nodes Ready");
                return Ok(ready);
            }

            let waited = start.elapsed();
            if waited >= timeout {
                return Err(Error::BootstrapTimeout {
                    cluster: cluster.to_string(),
                    waited: timeout,
                    stragglers,
                });
            }
            debug!(cluster = %cluster, waiting_on = ?stragglers, "Nodes not Ready yet");
            tokio::time::sleep(interval.min(timeout - waited)).await;
        }
    }
}

/// Ready condition of every registered node, read with `kubectl` on `primary`
pub(crate) async fn node_readiness(
    provider: &dyn RuntimeProvider,
    primary: &RuntimeNode,
) -> Result<BTreeMap<String, bool>> {
    let output = provider
        .exec_checked(primary, &kubectl(&["get", "nodes", "-o", "json"]))
        .await?;
    let nodes: Vec<Node> = parse_item_list("NodeList", &output.stdout)?;
    Ok(nodes
        .iter()
        .filter_map(|n| n.metadata.name.clone().map(|name| (name, node_is_ready(n))))
        .collect())
}
