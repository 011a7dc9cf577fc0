//! Rollback guard for cluster creation
//!
//! A [`CleanupGuard`] is armed before the first resource of a cluster is
//! created. On the success path it is disarmed exactly once; any failure
//! while it is still armed tears the cluster down. Dropping an armed guard
//! (a panic, a cancelled future) spawns the same teardown in the
//! background.
//!
//! Teardown always reconciles against the live provider: it lists what is
//! there and deletes it, so it is a no-op when nothing exists.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::provider::RuntimeProvider;
use crate::types::RuntimeNode;
use crate::{Error, Result};

/// Guard lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardState {
    /// Failures will tear the cluster down
    Armed,
    /// Success; nothing will be torn down
    Disarmed,
    /// Rollback has run
    Triggered,
}

/// Scoped cleanup for one create operation
pub struct CleanupGuard {
    cluster: String,
    provider: Arc<dyn RuntimeProvider>,
    state: GuardState,
}

impl CleanupGuard {
    /// Arm a guard for `cluster`
    pub fn arm(cluster: impl Into<String>, provider: Arc<dyn RuntimeProvider>) -> Self {
        let cluster = cluster.into();
        debug!(cluster = %cluster, "Cleanup guard armed");
        Self {
            cluster,
            provider,
            state: GuardState::Armed,
        }
    }

    /// Current state
    pub fn state(&self) -> GuardState {
        self.state
    }

    /// Mark the operation successful. Terminal: later failures never clean up.
    pub fn disarm(&mut self) {
        if self.state == GuardState::Armed {
            debug!(cluster = %self.cluster, "Cleanup guard disarmed");
            self.state = GuardState::Disarmed;
        }
    }

    /// Roll back after `cause`, if still armed.
    ///
    /// Returns a note describing any cleanup failure; the cleanup error
    /// itself is logged and never replaces `cause`.
    pub async fn rollback(&mut self, cause: &Error) -> Option<String> {
        if self.state != GuardState::Armed {
            debug!(cluster = %self.cluster, state = ?self.state, "Rollback skipped");
            return None;
        }
        self.state = GuardState::Triggered;

        info!(cluster = %self.cluster, error = %cause, "Rolling back cluster");

        let result = match cause {
            // Another owner holds a node name: only remove what this attempt made
            Error::Provision { created, source, .. } if source.is_already_exists() => {
                self.remove_created(created).await
            }
            _ => teardown(self.provider.as_ref(), &self.cluster).await,
        };

        match result {
            Ok(()) => None,
            Err(e) => {
                warn!(cluster = %self.cluster, error = %e, "Cleanup failed during rollback");
                Some(e.to_string())
            }
        }
    }
}

impl CleanupGuard {
    /// Delete `created`, then the network once no node of the cluster is left on it
    async fn remove_created(&self, created: &[RuntimeNode]) -> Result<()> {
        if !created.is_empty() {
            self.provider.delete_nodes(created).await?;
        }
        if self.provider.list_nodes(&self.cluster).await?.is_empty() {
            self.provider.delete_network(&self.cluster).await?;
        } else {
            debug!(cluster = %self.cluster, "Network still in use, keeping it");
        }
        Ok(())
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.state != GuardState::Armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                cluster = %self.cluster,
                "Cleanup guard dropped outside a runtime; cluster left behind"
            );
            return;
        };

        warn!(cluster = %self.cluster, "Cleanup guard dropped while armed, tearing down");
        let provider = self.provider.clone();
        let cluster = std::mem::take(&mut self.cluster);
        handle.spawn(async move {
            if let Err(e) = teardown(provider.as_ref(), &cluster).await {
                warn!(cluster = %cluster, error = %e, "Background cleanup failed");
            }
        });
    }
}

/// Delete every node and the network of `cluster`.
///
/// Idempotent. Every step is attempted; failures are collected into one
/// [`Error::Cleanup`].
pub async fn teardown(provider: &dyn RuntimeProvider, cluster: &str) -> Result<()> {
    let mut problems = Vec::new();

    match provider.list_nodes(cluster).await {
        Ok(nodes) if nodes.is_empty() => {
            debug!(cluster = %cluster, "No nodes to delete");
        }
        Ok(nodes) => {
            info!(cluster = %cluster, nodes = nodes.len(), "Deleting nodes");
            if let Err(e) = provider.delete_nodes(&nodes).await {
                problems.push(format!("deleting nodes: {e}"));
            }
        }
        Err(e) => problems.push(format!("listing nodes: {e}")),
    }

    if let Err(e) = provider.delete_network(cluster).await {
        problems.push(format!("deleting network: {e}"));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::cleanup(cluster, problems.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::provider::testing::FakeProvider;
    use std::time::Duration;

    async fn provisioned(name: &str) -> Arc<FakeProvider> {
        let provider = Arc::new(FakeProvider::new());
        provider
            .provision(&ClusterConfig::new(name).with_topology(1, 2), "img")
            .await
            .unwrap();
        provider
    }

    /// Story: A failure while armed removes every node and the network
    #[tokio::test]
    async fn story_rollback_tears_down_cluster() {
        let provider = provisioned("demo").await;
        let mut guard = CleanupGuard::arm("demo", provider.clone());

        let note = guard.rollback(&Error::internal("init failed")).await;

        assert_eq!(note, None);
        assert_eq!(guard.state(), GuardState::Triggered);
        assert!(provider.list_nodes("demo").await.unwrap().is_empty());
        assert!(!provider.has_network("demo"));
    }

    /// Story: Disarm is terminal
    #[tokio::test]
    async fn story_disarmed_guard_never_cleans_up() {
        let provider = provisioned("demo").await;
        let mut guard = CleanupGuard::arm("demo", provider.clone());

        guard.disarm();
        let note = guard.rollback(&Error::internal("late failure")).await;
        drop(guard);
        tokio::task::yield_now().await;

        assert_eq!(note, None);
        assert_eq!(provider.list_nodes("demo").await.unwrap().len(), 3);
    }

    /// Story: Cleanup failure is a note, never the headline
    #[tokio::test]
    async fn story_cleanup_failure_becomes_note() {
        let provider = provisioned("demo").await;
        provider.fail_deletes();
        let mut guard = CleanupGuard::arm("demo", provider.clone());

        let note = guard.rollback(&Error::internal("init failed")).await;

        let note = note.expect("cleanup failure should produce a note");
        assert!(note.contains("deleting nodes"));
        assert!(!provider.has_network("demo"));
    }

    /// Story: A name conflict only removes nodes this attempt created
    #[tokio::test]
    async fn story_name_conflict_spares_the_other_owner() {
        let provider = provisioned("demo").await;
        let nodes = provider.list_nodes("demo").await.unwrap();
        let conflict = Error::Provision {
            cluster: "demo".into(),
            node: "demo-worker1".into(),
            created: vec![nodes[0].clone()],
            source: Box::new(Error::NodeAlreadyExists {
                node: "demo-worker1".into(),
            }),
        };
        let mut guard = CleanupGuard::arm("demo", provider.clone());
        guard.rollback(&conflict).await;

        let left = provider.list_nodes("demo").await.unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.iter().all(|n| n.name != nodes[0].name));
        assert!(provider.has_network("demo"));
    }

    /// Story: A conflict on the first node removes the network this attempt made
    #[tokio::test]
    async fn story_name_conflict_with_nothing_left_removes_network() {
        let provider = Arc::new(FakeProvider::new());
        let config = ClusterConfig::new("demo").with_topology(1, 1);
        provider.provision(&config, "img").await.unwrap();
        let created = provider.list_nodes("demo").await.unwrap();
        let conflict = Error::Provision {
            cluster: "demo".into(),
            node: "demo-worker1".into(),
            created,
            source: Box::new(Error::NodeAlreadyExists {
                node: "demo-worker1".into(),
            }),
        };

        let mut guard = CleanupGuard::arm("demo", provider.clone());
        let note = guard.rollback(&conflict).await;

        assert_eq!(note, None);
        assert!(provider.list_nodes("demo").await.unwrap().is_empty());
        assert!(!provider.has_network("demo"));
    }

    /// Story: Dropping an armed guard still cleans up
    #[tokio::test]
    async fn story_drop_while_armed_spawns_teardown() {
        let provider = provisioned("demo").await;
        {
            let _guard = CleanupGuard::arm("demo", provider.clone());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(provider.list_nodes("demo").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let provider = FakeProvider::new();
        teardown(&provider, "nothing-here").await.unwrap();
        teardown(&provider, "nothing-here").await.unwrap();
        assert!(provider.list_clusters().await.unwrap().is_empty());
    }
}
