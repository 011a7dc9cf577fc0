//! In-memory provider for tests
//!
//! Keeps nodes, networks, files and CSRs in memory and simulates the
//! handful of commands the pipeline runs inside nodes (`kubeadm`, `kubectl`,
//! `cat`, `journalctl`). Failures and delays can be injected per node, and
//! every exec is recorded with start/finish instants so tests can assert on
//! ordering and overlap.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
    CertificateSigningRequestStatus,
};
use k8s_openapi::api::core::v1::{Node, NodeCondition, NodeStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tokio::time::Instant;

use super::RuntimeProvider;
use crate::config::{NodePlan, Networking};
use crate::error::ProviderFailure;
use crate::types::{ExecResult, NodeState, RuntimeNode};
use crate::{
    Error, Result, DEFAULT_API_SERVER_PORT, KUBELET_SERVING_SIGNER, LABEL_API_SERVER_ADDRESS,
    LABEL_API_SERVER_PORT,
};

const PROVIDER_NAME: &str = "fake";

/// Signer of kubelet client certificates
pub(crate) const KUBELET_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client-kubelet";

/// One recorded exec call
#[derive(Clone, Debug)]
pub(crate) struct ExecRecord {
    pub node: String,
    pub command: String,
    pub started: Instant,
    pub finished: Instant,
}

impl ExecRecord {
    /// Whether two calls were running at the same time
    pub fn overlaps(&self, other: &ExecRecord) -> bool {
        self.started < other.finished && other.started < self.finished
    }
}

struct FakeNode {
    node: RuntimeNode,
    cluster: String,
    labels: BTreeMap<String, String>,
    registered: bool,
}

struct FakeCsr {
    name: String,
    signer: String,
    cluster: String,
    approved: bool,
}

#[derive(Default)]
struct FakeState {
    nodes: Vec<FakeNode>,
    networks: BTreeSet<String>,
    files: BTreeMap<(String, String), String>,
    csrs: Vec<FakeCsr>,
    create_failures: HashMap<String, (ProviderFailure, Option<u32>)>,
    create_attempts: HashMap<String, u32>,
    join_failures: BTreeSet<String>,
    import_failures: BTreeSet<String>,
    never_ready: BTreeSet<String>,
    fail_deletes: bool,
    exec_log: Vec<ExecRecord>,
    next_ip: u8,
}

/// Stateful in-memory [`RuntimeProvider`]
#[derive(Default)]
pub(crate) struct FakeProvider {
    state: Mutex<FakeState>,
    join_delay: Mutex<Duration>,
    create_delay: Mutex<Duration>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Every create of `node` fails with `failure`
    pub fn fail_create(&self, node: &str, failure: ProviderFailure) {
        self.state()
            .create_failures
            .insert(node.to_string(), (failure, None));
    }

    /// The first `times` creates of `node` fail with `failure`
    pub fn fail_create_times(&self, node: &str, failure: ProviderFailure, times: u32) {
        self.state()
            .create_failures
            .insert(node.to_string(), (failure, Some(times)));
    }

    pub fn create_attempts(&self, node: &str) -> u32 {
        self.state().create_attempts.get(node).copied().unwrap_or(0)
    }

    /// `kubeadm join` on `node` exits non-zero
    pub fn fail_join(&self, node: &str) {
        self.state().join_failures.insert(node.to_string());
    }

    /// `ctr images import` on `node` exits non-zero
    pub fn fail_import(&self, node: &str) {
        self.state().import_failures.insert(node.to_string());
    }

    /// `node` registers with the API server but never reports Ready
    pub fn never_ready(&self, node: &str) {
        self.state().never_ready.insert(node.to_string());
    }

    /// Every `delete_nodes` call fails
    pub fn fail_deletes(&self) {
        self.state().fail_deletes = true;
    }

    pub fn set_join_delay(&self, delay: Duration) {
        *self.join_delay.lock().unwrap() = delay;
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    pub fn has_network(&self, cluster: &str) -> bool {
        self.state().networks.contains(&crate::network_name(cluster))
    }

    pub fn file(&self, node: &str, path: &str) -> Option<String> {
        self.state()
            .files
            .get(&(node.to_string(), path.to_string()))
            .cloned()
    }

    pub fn exec_log(&self) -> Vec<ExecRecord> {
        self.state().exec_log.clone()
    }

    /// Exec calls whose command contains `needle`
    pub fn execs_matching(&self, needle: &str) -> Vec<ExecRecord> {
        self.exec_log()
            .into_iter()
            .filter(|r| r.command.contains(needle))
            .collect()
    }

    pub fn add_csr(&self, cluster: &str, name: &str, signer: &str) {
        self.state().csrs.push(FakeCsr {
            name: name.to_string(),
            signer: signer.to_string(),
            cluster: cluster.to_string(),
            approved: false,
        });
    }

    pub fn csr_approved(&self, name: &str) -> bool {
        self.state()
            .csrs
            .iter()
            .any(|c| c.name == name && c.approved)
    }

    fn cluster_of(&self, node_id: &str) -> Result<String> {
        self.state()
            .nodes
            .iter()
            .find(|n| n.node.id == node_id)
            .map(|n| n.cluster.clone())
            .ok_or_else(|| {
                Error::provider_for(
                    "unknown",
                    PROVIDER_NAME,
                    format!("no such container: {node_id}"),
                    ProviderFailure::Fatal,
                )
            })
    }

    fn register(&self, node_id: &str, cluster: &str) {
        let mut state = self.state();
        if let Some(n) = state.nodes.iter_mut().find(|n| n.node.id == node_id) {
            n.registered = true;
        }
        state.csrs.push(FakeCsr {
            name: format!("csr-{node_id}-serving"),
            signer: KUBELET_SERVING_SIGNER.to_string(),
            cluster: cluster.to_string(),
            approved: false,
        });
        state.csrs.push(FakeCsr {
            name: format!("csr-{node_id}-client"),
            signer: KUBELET_CLIENT_SIGNER.to_string(),
            cluster: cluster.to_string(),
            approved: false,
        });
    }

    fn node_list_json(&self, cluster: &str) -> String {
        let state = self.state();
        let items: Vec<Node> = state
            .nodes
            .iter()
            .filter(|n| n.cluster == cluster && n.registered)
            .map(|n| {
                let ready = if state.never_ready.contains(&n.node.name) {
                    "False"
                } else {
                    "True"
                };
                Node {
                    metadata: ObjectMeta {
                        name: Some(n.node.name.clone()),
                        ..Default::default()
                    },
                    status: Some(NodeStatus {
                        conditions: Some(vec![NodeCondition {
                            type_: "Ready".to_string(),
                            status: ready.to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                    ..Default::default()
                }
            })
            .collect();
        serde_json::json!({ "apiVersion": "v1", "kind": "List", "items": items }).to_string()
    }

    fn csr_list_json(&self, cluster: &str) -> String {
        let items: Vec<CertificateSigningRequest> = self
            .state()
            .csrs
            .iter()
            .filter(|c| c.cluster == cluster)
            .map(|c| CertificateSigningRequest {
                metadata: ObjectMeta {
                    name: Some(c.name.clone()),
                    ..Default::default()
                },
                spec: CertificateSigningRequestSpec {
                    signer_name: c.signer.clone(),
                    request: ByteString(Vec::new()),
                    ..Default::default()
                },
                status: c.approved.then(|| CertificateSigningRequestStatus {
                    conditions: Some(vec![CertificateSigningRequestCondition {
                        type_: "Approved".to_string(),
                        status: "True".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            })
            .collect();
        serde_json::json!({ "apiVersion": "v1", "kind": "List", "items": items }).to_string()
    }

    fn approve_csr(&self, name: &str) -> bool {
        let mut state = self.state();
        match state.csrs.iter_mut().find(|c| c.name == name) {
            Some(csr) => {
                csr.approved = true;
                true
            }
            None => false,
        }
    }

    async fn simulate(&self, node_id: &str, command: &str) -> Result<ExecResult> {
        let cluster = self.cluster_of(node_id)?;
        let ok = |stdout: String| ExecResult {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        };

        if command.contains("kubeadm init") {
            self.register(node_id, &cluster);
            return Ok(ok("Your Kubernetes control-plane has initialized successfully!".into()));
        }

        if command.contains("kubeadm join") {
            let delay = *self.join_delay.lock().unwrap();
            tokio::time::sleep(delay).await;
            if self.state().join_failures.contains(node_id) {
                return Ok(ExecResult {
                    stdout: "[preflight] Running pre-flight checks".into(),
                    stderr: "error execution phase kubelet-start: timed out waiting for the condition"
                        .into(),
                    exit_code: 1,
                });
            }
            self.register(node_id, &cluster);
            return Ok(ok("This node has joined the cluster".into()));
        }

        if command.contains("cat /etc/kubernetes/admin.conf") {
            return Ok(ok(SAMPLE_ADMIN_CONF.to_string()));
        }
        if command.contains("get nodes") {
            return Ok(ok(self.node_list_json(&cluster)));
        }
        if command.contains("get csr") {
            return Ok(ok(self.csr_list_json(&cluster)));
        }
        if command.contains("certificate approve") {
            let name = command.rsplit(' ').next().unwrap_or_default();
            if self.approve_csr(name) {
                return Ok(ok(format!(
                    "certificatesigningrequest.certificates.k8s.io/{name} approved"
                )));
            }
            return Ok(ExecResult {
                stdout: String::new(),
                stderr: format!("Error from server (NotFound): {name} not found"),
                exit_code: 1,
            });
        }
        if command.contains("images import") {
            if self.state().import_failures.contains(node_id) {
                return Ok(ExecResult {
                    stdout: String::new(),
                    stderr: "ctr: unrecognized image format".into(),
                    exit_code: 1,
                });
            }
            return Ok(ok("unpacking docker.io/library/app:dev...done".into()));
        }
        if command.contains("journalctl") {
            return Ok(ok("kubelet[512]: E0101 node not found".into()));
        }

        Ok(ok(String::new()))
    }
}

#[async_trait]
impl RuntimeProvider for FakeProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn ensure_network(&self, cluster: &str, _networking: &Networking) -> Result<()> {
        self.state().networks.insert(crate::network_name(cluster));
        Ok(())
    }

    async fn delete_network(&self, cluster: &str) -> Result<()> {
        self.state().networks.remove(&crate::network_name(cluster));
        Ok(())
    }

    async fn create_node(&self, cluster: &str, plan: &NodePlan) -> Result<RuntimeNode> {
        {
            let mut state = self.state();
            *state.create_attempts.entry(plan.name.clone()).or_insert(0) += 1;

            if let Some((failure, remaining)) = state.create_failures.get_mut(&plan.name) {
                let failure = *failure;
                let fail_now = match remaining {
                    None => true,
                    Some(0) => false,
                    Some(n) => {
                        *n -= 1;
                        true
                    }
                };
                if fail_now {
                    return Err(Error::provider_for(
                        cluster,
                        PROVIDER_NAME,
                        format!("injected failure creating {}", plan.name),
                        failure,
                    ));
                }
            }

            if state.nodes.iter().any(|n| n.node.name == plan.name) {
                return Err(Error::NodeAlreadyExists {
                    node: plan.name.clone(),
                });
            }
        }

        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.next_ip += 1;
        let node = RuntimeNode {
            id: plan.name.clone(),
            name: plan.name.clone(),
            role: plan.role,
            primary: plan.primary,
            ip: Some(format!("172.20.0.{}", state.next_ip + 1)),
            state: NodeState::Running,
        };
        state.nodes.push(FakeNode {
            node: node.clone(),
            cluster: cluster.to_string(),
            labels: plan.labels.clone(),
            registered: false,
        });
        Ok(node)
    }

    async fn list_nodes(&self, cluster: &str) -> Result<Vec<RuntimeNode>> {
        Ok(self
            .state()
            .nodes
            .iter()
            .filter(|n| n.cluster == cluster)
            .map(|n| n.node.clone())
            .collect())
    }

    async fn delete_nodes(&self, nodes: &[RuntimeNode]) -> Result<()> {
        let mut state = self.state();
        if state.fail_deletes {
            return Err(Error::provider_for(
                "unknown",
                PROVIDER_NAME,
                "injected delete failure",
                ProviderFailure::Fatal,
            ));
        }
        state
            .nodes
            .retain(|n| !nodes.iter().any(|d| d.id == n.node.id));
        Ok(())
    }

    async fn get_api_server_endpoint(&self, cluster: &str) -> Result<String> {
        let state = self.state();
        let primary = state
            .nodes
            .iter()
            .find(|n| n.cluster == cluster && n.node.primary)
            .ok_or_else(|| Error::NotFound {
                cluster: cluster.to_string(),
            })?;
        let port = primary
            .labels
            .get(LABEL_API_SERVER_PORT)
            .cloned()
            .unwrap_or_else(|| DEFAULT_API_SERVER_PORT.to_string());
        let host = match primary.labels.get(LABEL_API_SERVER_ADDRESS) {
            Some(address) => address.clone(),
            None => primary.node.require_ip()?.to_string(),
        };
        Ok(format!("https://{host}:{port}"))
    }

    async fn exec_in_container(&self, node_id: &str, command: &[&str]) -> Result<ExecResult> {
        let line = command.join(" ");
        let started = Instant::now();
        let result = self.simulate(node_id, &line).await;
        let finished = Instant::now();
        self.state().exec_log.push(ExecRecord {
            node: node_id.to_string(),
            command: line,
            started,
            finished,
        });
        result
    }

    async fn write_file(&self, node_id: &str, path: &str, content: &str) -> Result<()> {
        self.cluster_of(node_id)?;
        self.state()
            .files
            .insert((node_id.to_string(), path.to_string()), content.to_string());
        Ok(())
    }

    async fn copy_file(&self, node_id: &str, host_path: &Path, path: &str) -> Result<()> {
        self.cluster_of(node_id)?;
        let content = tokio::fs::read(host_path).await?;
        self.state().files.insert(
            (node_id.to_string(), path.to_string()),
            String::from_utf8_lossy(&content).into_owned(),
        );
        Ok(())
    }

    async fn list_clusters(&self) -> Result<Vec<String>> {
        let clusters: BTreeSet<String> =
            self.state().nodes.iter().map(|n| n.cluster.clone()).collect();
        Ok(clusters.into_iter().collect())
    }
}

/// Admin kubeconfig as kubeadm writes it
pub(crate) const SAMPLE_ADMIN_CONF: &str = r#"apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: LS0tLS1CRUdJTi0tLS0t
    server: https://demo-control-plane:6443
  name: kubernetes
contexts:
- context:
    cluster: kubernetes
    user: kubernetes-admin
  name: kubernetes-admin@kubernetes
current-context: kubernetes-admin@kubernetes
preferences: {}
users:
- name: kubernetes-admin
  user:
    client-certificate-data: LS0tLS1CRUdJTi0tLS0t
    client-key-data: LS0tLS1CRUdJTi0tLS0t
"#;
