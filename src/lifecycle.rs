//! Cluster create, delete and queries
//!
//! [`ClusterLifecycle`] is the entry point embedding code talks to. A create
//! validates the config, claims the cluster name, provisions every node,
//! runs the [`ActionPipeline`] and approves kubelet serving certificates.
//! Anything failing after the name is claimed is wrapped in an
//! [`OperationFailure`] with diagnostics collected before the cleanup guard
//! rolls the cluster back.
//!
//! Two operations on the same cluster name never interleave: the name is
//! claimed in an in-flight set before the first await, and a cluster that
//! already has nodes on the provider is rejected as "already exists".

use std::path::Path;
use std::sync::Arc;

use dashmap::DashSet;
use futures::future::try_join_all;
use tracing::{debug, error, info, instrument, warn};

use crate::cleanup::{self, CleanupGuard};
use crate::config::ClusterConfig;
use crate::csr::{CsrBootstrapMonitor, InNodeCsrClient};
use crate::join::node_readiness;
use crate::pipeline::{ActionContext, ActionPipeline};
use crate::provider::RuntimeProvider;
use crate::recovery::{collect_diagnostics, OperationFailure, OperationKind};
use crate::settings::Settings;
use crate::types::{Cluster, ClusterStatus, CreateOptions, NodeState, RuntimeNode};
use crate::{Error, Result};

const PHASE_PROVISION: &str = "provision";
const PHASE_CSR_APPROVAL: &str = "csr-approval";

/// Where image archives are staged inside nodes before import
const IMAGE_ARCHIVE_DIR: &str = "/kind/images";

/// Removes a claimed name from the in-flight set when dropped
struct NameClaim {
    name: String,
    in_flight: Arc<DashSet<String>>,
}

impl NameClaim {
    fn acquire(in_flight: &Arc<DashSet<String>>, name: &str) -> Option<Self> {
        in_flight.insert(name.to_string()).then(|| Self {
            name: name.to_string(),
            in_flight: in_flight.clone(),
        })
    }
}

impl Drop for NameClaim {
    fn drop(&mut self) {
        self.in_flight.remove(&self.name);
    }
}

/// Creates, deletes and inspects clusters on one provider
pub struct ClusterLifecycle {
    provider: Arc<dyn RuntimeProvider>,
    settings: Settings,
    in_flight: Arc<DashSet<String>>,
}

impl ClusterLifecycle {
    /// Lifecycle engine over `provider`
    pub fn new(provider: Arc<dyn RuntimeProvider>, settings: Settings) -> Self {
        Self {
            provider,
            settings,
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// Engine settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Create a cluster and return it once every node is Ready.
    ///
    /// Validation and name conflicts fail before anything is created. Any
    /// later failure is returned as [`Error::Operation`] after the cluster
    /// has been rolled back, unless `retain_on_failure` is set.
    #[instrument(skip_all, fields(cluster = %config.name))]
    pub async fn create(&self, config: ClusterConfig, options: CreateOptions) -> Result<Cluster> {
        config.validate()?;

        let Some(_claim) = NameClaim::acquire(&self.in_flight, &config.name) else {
            return Err(Error::AlreadyExists {
                cluster: config.name,
            });
        };
        if !self.provider.list_nodes(&config.name).await?.is_empty() {
            return Err(Error::AlreadyExists {
                cluster: config.name,
            });
        }

        info!(
            control_planes = config.control_plane_count(),
            workers = config.worker_count(),
            provider = %self.provider.name(),
            "Creating cluster"
        );
        let mut guard = CleanupGuard::arm(&config.name, self.provider.clone());
        let config = Arc::new(config);

        match self.run_create(config.clone(), &options).await {
            Ok(cluster) => {
                guard.disarm();
                info!(endpoint = %cluster.endpoint, nodes = cluster.nodes.len(), "Cluster created");
                Ok(cluster)
            }
            Err((phase, cause)) => {
                let diagnostics =
                    collect_diagnostics(self.provider.as_ref(), &config.name, &cause).await;
                let note = if options.retain_on_failure {
                    guard.disarm();
                    Some("nodes retained for inspection".to_string())
                } else {
                    guard.rollback(&cause).await
                };

                let failure =
                    OperationFailure::new(OperationKind::Create, &config.name, phase, cause)
                        .with_diagnostics(diagnostics)
                        .with_cleanup_note(note);
                error!(phase = %failure.phase, error = %failure.cause, "Cluster create failed");
                Err(failure.into())
            }
        }
    }

    async fn run_create(
        &self,
        config: Arc<ClusterConfig>,
        options: &CreateOptions,
    ) -> std::result::Result<Cluster, (&'static str, Error)> {
        let nodes = self
            .provider
            .provision(&config, &self.settings.node_image)
            .await
            .map_err(|e| (PHASE_PROVISION, e))?;

        if options.stop_before_kubernetes {
            info!(nodes = nodes.len(), "Stopping before Kubernetes bootstrap");
            let endpoint = self
                .provider
                .get_api_server_endpoint(&config.name)
                .await
                .map_err(|e| (PHASE_PROVISION, e))?;
            return Ok(Cluster {
                name: config.name.clone(),
                nodes,
                endpoint,
                kubeconfig_path: None,
            });
        }

        let mut ctx = ActionContext::new(
            config.clone(),
            self.provider.clone(),
            self.settings.clone(),
            options.clone(),
            nodes,
        );
        ActionPipeline::for_config(&config)
            .execute(&mut ctx)
            .await
            .map_err(|failure| (failure.phase.name(), failure.error))?;

        if options.skip_csr_approval {
            info!("Skipping kubelet serving CSR approval");
        } else {
            let primary = ctx
                .primary()
                .map_err(|e| (PHASE_CSR_APPROVAL, e))?
                .clone();
            let client = InNodeCsrClient::new(self.provider.clone(), primary);
            let report = CsrBootstrapMonitor::from_settings(&self.settings)
                .run(&client)
                .await;
            if report.approved == 0 {
                warn!(polls = report.polls, "No kubelet serving CSRs were approved");
            }
        }

        let endpoint = ctx
            .endpoint()
            .map_err(|e| (PHASE_CSR_APPROVAL, e))?
            .url();
        Ok(Cluster {
            name: config.name.clone(),
            nodes: ctx.nodes,
            endpoint,
            kubeconfig_path: ctx.kubeconfig_path,
        })
    }

    /// Delete a cluster and its kubeconfig. Deleting a missing cluster succeeds.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        let Some(_claim) = NameClaim::acquire(&self.in_flight, name) else {
            return Err(Error::InProgress {
                cluster: name.to_string(),
            });
        };

        if let Err(cause) = cleanup::teardown(self.provider.as_ref(), name).await {
            let diagnostics = collect_diagnostics(self.provider.as_ref(), name, &cause).await;
            let failure = OperationFailure::new(OperationKind::Delete, name, "teardown", cause)
                .with_diagnostics(diagnostics);
            error!(error = %failure.cause, "Cluster delete failed");
            return Err(failure.into());
        }

        let path = self.settings.kubeconfig_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!(path = %path.display(), "Removed kubeconfig"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                let failure =
                    OperationFailure::new(OperationKind::Delete, name, "kubeconfig", e.into());
                return Err(failure.into());
            }
        }

        info!("Cluster deleted");
        Ok(())
    }

    /// Delete every cluster on the provider; returns the names removed.
    ///
    /// A cluster that fails to delete is logged and skipped.
    pub async fn delete_all(&self) -> Result<Vec<String>> {
        let clusters = self.provider.list_clusters().await?;
        if clusters.is_empty() {
            info!("No clusters to delete");
            return Ok(Vec::new());
        }

        let mut deleted = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            match self.delete(&cluster).await {
                Ok(()) => deleted.push(cluster),
                Err(e) => warn!(cluster = %cluster, error = %e, "Failed to delete cluster"),
            }
        }
        Ok(deleted)
    }

    /// Import an image archive into containerd on every node of a cluster.
    ///
    /// `archive` is a `docker save` / OCI tarball on the host. Returns the
    /// names of the nodes the image was loaded on.
    #[instrument(skip(self))]
    pub async fn load_image(&self, name: &str, archive: &Path) -> Result<Vec<String>> {
        let invalid = |message: String| Error::validation_for(name, message, Some("archive"));
        let file_name = archive
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| invalid(format!("{} is not a file path", archive.display())))?;
        if !tokio::fs::try_exists(archive).await? {
            return Err(invalid(format!(
                "image archive {} does not exist",
                archive.display()
            )));
        }

        let nodes = self.require_nodes(name).await?;
        let staged = format!("{IMAGE_ARCHIVE_DIR}/{file_name}");
        let staged = staged.as_str();
        let provider = self.provider.as_ref();

        try_join_all(nodes.iter().map(|node| async move {
            provider.copy_file(&node.id, archive, staged).await?;
            let import = [
                "ctr",
                "--namespace=k8s.io",
                "images",
                "import",
                "--all-platforms",
                staged,
            ];
            let imported = provider.exec_checked(node, &import).await;
            if let Err(e) = provider.exec_in_container(&node.id, &["rm", "-f", staged]).await {
                debug!(node = %node.name, error = %e, "Could not remove staged image archive");
            }
            imported?;
            debug!(node = %node.name, "Imported image archive");
            Ok::<_, Error>(())
        }))
        .await?;

        info!(nodes = nodes.len(), "Loaded image archive");
        Ok(nodes.into_iter().map(|n| n.name).collect())
    }

    /// Node states and readiness of a cluster.
    ///
    /// Readiness is read with `kubectl` on the primary; when the API server
    /// doesn't answer, runtime states are reported as they are.
    pub async fn cluster_status(&self, name: &str) -> Result<ClusterStatus> {
        let mut nodes = self.require_nodes(name).await?;

        let readiness = match nodes.iter().find(|n| n.primary) {
            Some(primary) => match node_readiness(self.provider.as_ref(), primary).await {
                Ok(readiness) => Some(readiness),
                Err(e) => {
                    debug!(cluster = %name, error = %e, "Node readiness check failed");
                    None
                }
            },
            None => None,
        };
        if let Some(readiness) = &readiness {
            for node in nodes.iter_mut().filter(|n| n.state == NodeState::Running) {
                node.state = match readiness.get(&node.name) {
                    Some(true) => NodeState::Ready,
                    Some(false) => NodeState::NotReady,
                    None => NodeState::Running,
                };
            }
        }

        Ok(ClusterStatus {
            name: name.to_string(),
            nodes,
            endpoint: self.provider.get_api_server_endpoint(name).await.ok(),
            api_reachable: readiness.is_some(),
        })
    }

    /// Nodes of a cluster as the provider sees them right now
    pub async fn list_nodes(&self, name: &str) -> Result<Vec<RuntimeNode>> {
        self.provider.list_nodes(name).await
    }

    /// API server URL of a cluster
    pub async fn get_endpoint(&self, name: &str) -> Result<String> {
        self.require_nodes(name).await?;
        self.provider.get_api_server_endpoint(name).await
    }

    /// Names of every cluster on the provider
    pub async fn list_clusters(&self) -> Result<Vec<String>> {
        self.provider.list_clusters().await
    }

    /// Contents of the kubeconfig written for a cluster
    pub async fn get_kubeconfig(&self, name: &str) -> Result<String> {
        let path = self.settings.kubeconfig_path(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound {
                cluster: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Approve whatever kubelet serving CSRs are pending now; returns how many
    pub async fn approve_kubelet_csrs(&self, name: &str) -> Result<usize> {
        let nodes = self.require_nodes(name).await?;
        let primary = nodes.into_iter().find(|n| n.primary).ok_or_else(|| {
            Error::internal_with_context(
                "approve_kubelet_csrs",
                format!("cluster {name} has no primary control plane"),
            )
        })?;
        let client = InNodeCsrClient::new(self.provider.clone(), primary);
        CsrBootstrapMonitor::approve_pending(&client).await
    }

    async fn require_nodes(&self, name: &str) -> Result<Vec<RuntimeNode>> {
        let nodes = self.provider.list_nodes(name).await?;
        if nodes.is_empty() {
            return Err(Error::NotFound {
                cluster: name.to_string(),
            });
        }
        Ok(nodes)
    }
}
