//! Post-provisioning action pipeline
//!
//! Once every node exists, a create runs a fixed list of [`Phase`]s strictly
//! in order, one at a time. Later phases read what earlier ones left in the
//! [`ActionContext`] (the resolved API endpoint feeds the kubeadm config,
//! which `kubeadm init` consumes). The first failing phase stops the
//! pipeline.
//!
//! Canonical order:
//!
//! 1. `load-balancer` - resolve the API server endpoint
//! 2. `config` - render and write kubeadm config to every node
//! 3. `kubeadm-init` - bootstrap the primary, export the kubeconfig
//! 4. `install-cni` - skipped when `disableDefaultCNI` is set
//! 5. `install-storage` - default StorageClass
//! 6. `kubeadm-join` - secondary control planes, then workers
//! 7. `wait-for-ready` - bounded readiness wait

mod addons;
mod kubeadm;

pub use kubeadm::{render_kubeadm_config, rewrite_kubeconfig_server};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{info, instrument};

use crate::config::ClusterConfig;
use crate::join::NodeJoinCoordinator;
use crate::provider::RuntimeProvider;
use crate::settings::Settings;
use crate::types::{CreateOptions, NodeState, RuntimeNode};
use crate::{Error, Result};

/// One post-provisioning step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Resolve the API server endpoint
    LoadBalancer,
    /// Write kubeadm config to every node
    Config,
    /// Run `kubeadm init` on the primary and export the kubeconfig
    KubeadmInit,
    /// Install the default CNI
    InstallCni,
    /// Install the default StorageClass
    InstallStorage,
    /// Join secondary control planes and workers
    KubeadmJoin,
    /// Wait for every node to report Ready
    WaitForReady,
}

impl Phase {
    /// Phase name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Phase::LoadBalancer => "load-balancer",
            Phase::Config => "config",
            Phase::KubeadmInit => "kubeadm-init",
            Phase::InstallCni => "install-cni",
            Phase::InstallStorage => "install-storage",
            Phase::KubeadmJoin => "kubeadm-join",
            Phase::WaitForReady => "wait-for-ready",
        }
    }

    /// Run this phase against the context
    pub async fn execute(self, ctx: &mut ActionContext) -> Result<()> {
        match self {
            Phase::LoadBalancer => addons::resolve_endpoint(ctx),
            Phase::Config => kubeadm::write_config(ctx).await,
            Phase::KubeadmInit => kubeadm::init(ctx).await,
            Phase::InstallCni => addons::install_cni(ctx).await,
            Phase::InstallStorage => addons::install_storage(ctx).await,
            Phase::KubeadmJoin => {
                NodeJoinCoordinator::new(
                    ctx.provider.as_ref(),
                    &ctx.nodes,
                    ctx.worker_join_concurrency(),
                )
                .join_all()
                .await
            }
            Phase::WaitForReady => wait_for_ready(ctx).await,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A phase failure; the remaining phases did not run
#[derive(Debug, Error)]
#[error("phase {phase} failed: {error}")]
pub struct PipelineFailure {
    /// The failed phase
    pub phase: Phase,
    /// Why it failed
    pub error: Error,
}

/// Where the API server is reached
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiEndpoint {
    /// Address or hostname
    pub host: String,
    /// Port
    pub port: u16,
}

impl ApiEndpoint {
    /// `host:port`
    pub fn host_port(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `https://host:port`
    pub fn url(&self) -> String {
        format!("https://{}", self.host_port())
    }
}

const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const HEX_ALPHABET: &[u8] = b"0123456789abcdef";

fn random_string(len: usize, alphabet: &[u8]) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

/// Secrets shared between `kubeadm init` and every join
#[derive(Clone)]
pub struct JoinCredentials {
    /// Bootstrap token, `[a-z0-9]{6}.[a-z0-9]{16}`
    pub token: String,
    /// Key encrypting the uploaded control-plane certificates (hex, 32 bytes)
    pub certificate_key: String,
}

impl JoinCredentials {
    /// Generate fresh credentials for one create
    pub fn generate() -> Self {
        Self {
            token: format!(
                "{}.{}",
                random_string(6, TOKEN_ALPHABET),
                random_string(16, TOKEN_ALPHABET)
            ),
            certificate_key: random_string(64, HEX_ALPHABET),
        }
    }
}

impl fmt::Debug for JoinCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only the public token id
        let id = self.token.split('.').next().unwrap_or_default();
        f.debug_struct("JoinCredentials")
            .field("token_id", &id)
            .finish_non_exhaustive()
    }
}

/// Scratch state for one create, threaded through every phase
pub struct ActionContext {
    /// The cluster being created
    pub config: Arc<ClusterConfig>,
    /// Provider hosting the nodes
    pub provider: Arc<dyn RuntimeProvider>,
    /// Engine settings
    pub settings: Settings,
    /// Per-call options
    pub options: CreateOptions,
    /// Provisioned nodes; states are updated by the readiness wait
    pub nodes: Vec<RuntimeNode>,
    /// Resolved by the load-balancer phase
    pub api_endpoint: Option<ApiEndpoint>,
    /// Token and certificate key for joins
    pub credentials: JoinCredentials,
    /// Set once the kubeconfig has been written
    pub kubeconfig_path: Option<PathBuf>,
}

impl ActionContext {
    /// Fresh context for provisioned `nodes`
    pub fn new(
        config: Arc<ClusterConfig>,
        provider: Arc<dyn RuntimeProvider>,
        settings: Settings,
        options: CreateOptions,
        nodes: Vec<RuntimeNode>,
    ) -> Self {
        Self {
            config,
            provider,
            settings,
            options,
            nodes,
            api_endpoint: None,
            credentials: JoinCredentials::generate(),
            kubeconfig_path: None,
        }
    }

    /// Cluster name
    pub fn cluster(&self) -> &str {
        &self.config.name
    }

    /// The node that runs `kubeadm init`
    pub fn primary(&self) -> Result<&RuntimeNode> {
        self.nodes.iter().find(|n| n.primary).ok_or_else(|| {
            Error::internal_with_context(
                "primary",
                format!("cluster {} has no primary control plane", self.cluster()),
            )
        })
    }

    /// The resolved API endpoint; only valid after the load-balancer phase
    pub fn endpoint(&self) -> Result<&ApiEndpoint> {
        self.api_endpoint.as_ref().ok_or_else(|| {
            Error::internal_with_context("endpoint", "API endpoint not resolved yet")
        })
    }

    /// Whether the cluster has any worker nodes
    pub fn has_workers(&self) -> bool {
        self.nodes.iter().any(|n| !n.is_control_plane())
    }

    /// Readiness timeout: per-call override, else the config's
    pub fn wait_timeout(&self) -> Duration {
        self.options.wait.unwrap_or(self.config.wait_for_ready)
    }

    /// Worker join fan-out: per-call override, else the settings'
    pub fn worker_join_concurrency(&self) -> usize {
        self.options
            .worker_join_concurrency
            .unwrap_or(self.settings.worker_join_concurrency)
            .max(1)
    }
}

async fn wait_for_ready(ctx: &mut ActionContext) -> Result<()> {
    let timeout = ctx.wait_timeout();
    let interval = ctx.settings.ready_poll_interval;
    let ready = NodeJoinCoordinator::new(
        ctx.provider.as_ref(),
        &ctx.nodes,
        ctx.worker_join_concurrency(),
    )
    .wait_for_ready(ctx.cluster(), timeout, interval)
    .await?;

    for node in &mut ctx.nodes {
        node.state = if ready.contains(&node.name) {
            NodeState::Ready
        } else {
            NodeState::NotReady
        };
    }
    Ok(())
}

/// The ordered phase list for a create
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionPipeline {
    phases: Vec<Phase>,
}

impl ActionPipeline {
    /// Canonical phases for `config`
    pub fn for_config(config: &ClusterConfig) -> Self {
        let mut phases = vec![Phase::LoadBalancer, Phase::Config, Phase::KubeadmInit];
        if !config.networking.disable_default_cni {
            phases.push(Phase::InstallCni);
        }
        phases.extend([Phase::InstallStorage, Phase::KubeadmJoin, Phase::WaitForReady]);
        Self { phases }
    }

    /// Phases in execution order
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Run every phase in order, stopping at the first failure
    #[instrument(skip_all, fields(cluster = %ctx.cluster()))]
    pub async fn execute(
        &self,
        ctx: &mut ActionContext,
    ) -> std::result::Result<(), PipelineFailure> {
        let total = self.phases.len();
        for (i, phase) in self.phases.iter().copied().enumerate() {
            info!(phase = %phase, step = i + 1, total, "Running phase");
            let started = tokio::time::Instant::now();

            phase
                .execute(ctx)
                .await
                .map_err(|error| PipelineFailure { phase, error })?;

            info!(
                phase = %phase,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Phase complete"
            );
        }
        Ok(())
    }
}
