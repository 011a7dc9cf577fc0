//! Kubelet serving certificate approval
//!
//! With `serverTLSBootstrap` enabled every kubelet requests its serving
//! certificate through a CSR that nothing in a bare cluster approves. The
//! [`CsrBootstrapMonitor`] watches for those CSRs during bootstrap and
//! approves them; only the `kubernetes.io/kubelet-serving` signer is ever
//! approved.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::api::{ListParams, Patch, PatchParams};
use kube::Api;
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::kube_utils::{create_client, has_condition, kubectl, parse_item_list};
use crate::provider::RuntimeProvider;
use crate::settings::Settings;
use crate::types::RuntimeNode;
use crate::{Result, KUBELET_SERVING_SIGNER};

const CONDITION_APPROVED: &str = "Approved";
const CONDITION_DENIED: &str = "Denied";
const CONDITION_FAILED: &str = "Failed";

/// Where a CSR stands
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsrState {
    /// Awaiting a decision
    Pending,
    /// Approved
    Approved,
    /// Denied or failed
    Denied,
}

/// The parts of a CSR the monitor looks at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Csr {
    /// Object name
    pub name: String,
    /// Requested signer
    pub signer_name: String,
    /// Current state
    pub state: CsrState,
}

impl Csr {
    /// Pending and addressed to the kubelet serving signer
    pub fn is_pending_serving(&self) -> bool {
        self.state == CsrState::Pending && self.signer_name == KUBELET_SERVING_SIGNER
    }
}

impl From<&CertificateSigningRequest> for Csr {
    fn from(csr: &CertificateSigningRequest) -> Self {
        let conditions = csr
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_deref());
        let state = if has_condition(conditions, CONDITION_APPROVED) {
            CsrState::Approved
        } else if has_condition(conditions, CONDITION_DENIED)
            || has_condition(conditions, CONDITION_FAILED)
        {
            CsrState::Denied
        } else {
            CsrState::Pending
        };
        Self {
            name: csr.metadata.name.clone().unwrap_or_default(),
            signer_name: csr.spec.signer_name.clone(),
            state,
        }
    }
}

/// Access to a cluster's CSRs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CsrClient: Send + Sync {
    /// Every CSR in the cluster
    async fn list(&self) -> Result<Vec<Csr>>;

    /// Approve one CSR by name
    async fn approve(&self, name: &str) -> Result<()>;
}

/// Talks to the API server through `kubectl` inside a control-plane node
pub struct InNodeCsrClient {
    provider: Arc<dyn RuntimeProvider>,
    node: RuntimeNode,
}

impl InNodeCsrClient {
    /// Client running `kubectl` on `node`
    pub fn new(provider: Arc<dyn RuntimeProvider>, node: RuntimeNode) -> Self {
        Self { provider, node }
    }
}

#[async_trait]
impl CsrClient for InNodeCsrClient {
    async fn list(&self) -> Result<Vec<Csr>> {
        let output = self
            .provider
            .exec_checked(&self.node, &kubectl(&["get", "csr", "-o", "json"]))
            .await?;
        let csrs: Vec<CertificateSigningRequest> =
            parse_item_list("CertificateSigningRequestList", &output.stdout)?;
        Ok(csrs.iter().map(Csr::from).collect())
    }

    async fn approve(&self, name: &str) -> Result<()> {
        let mut command = kubectl(&["certificate", "approve"]);
        command.push(name);
        self.provider.exec_checked(&self.node, &command).await?;
        Ok(())
    }
}

/// Talks to the API server with kube-rs, from the host
pub struct KubeCsrClient {
    api: Api<CertificateSigningRequest>,
}

impl KubeCsrClient {
    /// Client for the cluster behind `kubeconfig`
    pub async fn from_kubeconfig(kubeconfig: &Path) -> Result<Self> {
        let client = create_client(kubeconfig).await?;
        Ok(Self {
            api: Api::all(client),
        })
    }
}

#[async_trait]
impl CsrClient for KubeCsrClient {
    async fn list(&self) -> Result<Vec<Csr>> {
        let list = self.api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(Csr::from).collect())
    }

    async fn approve(&self, name: &str) -> Result<()> {
        let patch = json!({
            "status": {
                "conditions": [{
                    "type": CONDITION_APPROVED,
                    "status": "True",
                    "reason": "KinaApprove",
                    "message": "approved by kina during bootstrap",
                }]
            }
        });
        self.api
            .patch_subresource("approval", name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Outcome of one monitor run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CsrReport {
    /// CSRs approved
    pub approved: usize,
    /// List calls made
    pub polls: usize,
    /// Stopped before the window elapsed because nothing was left pending
    pub completed_early: bool,
}

/// Bounded watch approving kubelet serving CSRs
#[derive(Clone, Copy, Debug)]
pub struct CsrBootstrapMonitor {
    poll_interval: Duration,
    window: Duration,
}

impl CsrBootstrapMonitor {
    /// Monitor polling every `poll_interval` for at most `window`
    pub fn new(poll_interval: Duration, window: Duration) -> Self {
        Self {
            poll_interval,
            window,
        }
    }

    /// Monitor using the configured interval and window
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.csr_poll_interval, settings.csr_window)
    }

    /// Approve pending serving CSRs until none remain or the window closes.
    ///
    /// A failed list or approval is logged and the watch goes on.
    pub async fn run(&self, client: &dyn CsrClient) -> CsrReport {
        let start = tokio::time::Instant::now();
        let mut report = CsrReport::default();

        loop {
            report.polls += 1;
            match client.list().await {
                Ok(csrs) => {
                    let pending: Vec<&Csr> =
                        csrs.iter().filter(|c| c.is_pending_serving()).collect();
                    if pending.is_empty() && report.approved > 0 {
                        report.completed_early = true;
                        break;
                    }
                    for csr in pending {
                        match client.approve(&csr.name).await {
                            Ok(()) => {
                                info!(csr = %csr.name, "Approved kubelet serving CSR");
                                report.approved += 1;
                            }
                            Err(e) => warn!(csr = %csr.name, error = %e, "Failed to approve CSR"),
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to list CSRs"),
            }

            let elapsed = start.elapsed();
            if elapsed >= self.window {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(self.window - elapsed)).await;
        }

        debug!(
            approved = report.approved,
            polls = report.polls,
            completed_early = report.completed_early,
            "CSR monitor finished"
        );
        report
    }

    /// One pass: approve whatever serving CSRs are pending right now
    pub async fn approve_pending(client: &dyn CsrClient) -> Result<usize> {
        let csrs = client.list().await?;
        let mut approved = 0;
        for csr in csrs.iter().filter(|c| c.is_pending_serving()) {
            match client.approve(&csr.name).await {
                Ok(()) => {
                    info!(csr = %csr.name, "Approved kubelet serving CSR");
                    approved += 1;
                }
                Err(e) => warn!(csr = %csr.name, error = %e, "Failed to approve CSR"),
            }
        }
        Ok(approved)
    }
}
