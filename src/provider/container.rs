//! Container CLI provider
//!
//! Drives the `container` CLI, where every container runs in its own
//! lightweight VM. Nodes are found again through their labels, so nothing
//! about a cluster is stored locally.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, trace};

use super::RuntimeProvider;
use crate::config::{NodePlan, Networking};
use crate::error::ProviderFailure;
use crate::settings::Settings;
use crate::types::{ExecResult, NodeRole, NodeState, RuntimeNode};
use crate::{
    network_name, Error, Result, DEFAULT_API_SERVER_PORT, LABEL_API_SERVER_ADDRESS,
    LABEL_API_SERVER_PORT, LABEL_CLUSTER, LABEL_PRIMARY, LABEL_ROLE,
};

const PROVIDER_NAME: &str = "container";

/// Interval between IP address checks on a new node
const IP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How a failed CLI call should be treated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CliFailure {
    /// The resource already exists
    Conflict,
    /// The resource does not exist
    Missing,
    /// Anything else, with its retry class
    Other(ProviderFailure),
}

/// Classify CLI stderr into a failure class
pub(crate) fn classify_failure(stderr: &str) -> CliFailure {
    let s = stderr.to_ascii_lowercase();

    if s.contains("already exists") || s.contains("already in use") {
        return CliFailure::Conflict;
    }
    if s.contains("pull") || s.contains("manifest unknown") || s.contains("image not found") {
        return CliFailure::Other(ProviderFailure::ImagePull);
    }
    if s.contains("not found") || s.contains("no such") {
        return CliFailure::Missing;
    }
    if s.contains("timed out") || s.contains("timeout") || s.contains("deadline exceeded") {
        return CliFailure::Other(ProviderFailure::NetworkTimeout);
    }
    if s.contains("temporarily unavailable")
        || s.contains("resource busy")
        || s.contains("connection refused")
        || s.contains("try again")
    {
        return CliFailure::Other(ProviderFailure::Transient);
    }
    CliFailure::Other(ProviderFailure::Fatal)
}

/// Entry of `container list --all --format json`
#[derive(Debug, Deserialize)]
struct ContainerEntry {
    #[serde(default)]
    status: String,
    configuration: ContainerConfiguration,
    #[serde(default)]
    networks: Vec<ContainerNetwork>,
}

#[derive(Debug, Deserialize)]
struct ContainerConfiguration {
    id: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ContainerNetwork {
    #[serde(default)]
    address: String,
}

impl ContainerEntry {
    fn cluster(&self) -> Option<&str> {
        self.label(LABEL_CLUSTER)
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.configuration.labels.get(key).map(String::as_str)
    }

    fn ip(&self) -> Option<String> {
        // Addresses are reported in CIDR form
        self.networks
            .first()
            .and_then(|n| n.address.split('/').next())
            .filter(|a| !a.is_empty())
            .map(str::to_string)
    }

    fn into_node(self) -> RuntimeNode {
        let labels = &self.configuration.labels;
        let role = labels
            .get(LABEL_ROLE)
            .and_then(|r| NodeRole::from_label(r))
            .unwrap_or(NodeRole::Worker);
        let primary = labels.get(LABEL_PRIMARY).is_some_and(|v| v == "true");
        let ip = self.ip();

        RuntimeNode {
            id: self.configuration.id.clone(),
            name: self.configuration.id,
            role,
            primary,
            ip,
            state: NodeState::from_runtime_status(&self.status),
        }
    }
}

fn parse_entries(json: &str) -> Result<Vec<ContainerEntry>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(json)
        .map_err(|e| Error::serialization_for("container list", e.to_string()))
}

/// Parse `container list` JSON, keeping only kina nodes of `cluster` (or all)
pub(crate) fn parse_container_list(
    json: &str,
    cluster: Option<&str>,
) -> Result<Vec<RuntimeNode>> {
    Ok(parse_entries(json)?
        .into_iter()
        .filter(|e| match (e.cluster(), cluster) {
            (Some(have), Some(want)) => have == want,
            (Some(_), None) => true,
            (None, _) => false,
        })
        .map(ContainerEntry::into_node)
        .collect())
}

/// API server URL of `cluster` from `container list` JSON.
///
/// Host and port come from the primary's labels, falling back to its
/// address and the default port.
pub(crate) fn parse_api_server_endpoint(json: &str, cluster: &str) -> Result<String> {
    let entries: Vec<ContainerEntry> = parse_entries(json)?
        .into_iter()
        .filter(|e| e.cluster() == Some(cluster))
        .collect();
    let entry = entries
        .iter()
        .find(|e| e.label(LABEL_PRIMARY) == Some("true"))
        .or_else(|| {
            entries
                .iter()
                .find(|e| e.label(LABEL_ROLE) == Some(NodeRole::ControlPlane.as_str()))
        })
        .ok_or_else(|| Error::NotFound {
            cluster: cluster.to_string(),
        })?;

    let port = entry
        .label(LABEL_API_SERVER_PORT)
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(DEFAULT_API_SERVER_PORT);
    let host = match (entry.label(LABEL_API_SERVER_ADDRESS), entry.ip()) {
        (Some(address), _) => address.to_string(),
        (None, Some(ip)) => ip,
        (None, None) => {
            return Err(Error::internal_with_context(
                "get_api_server_endpoint",
                format!("node {} has no IP address", entry.configuration.id),
            ))
        }
    };
    Ok(format!("https://{host}:{port}"))
}

fn exec_result(output: &Output) -> ExecResult {
    ExecResult {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    }
}

/// Shell script writing stdin to `path`
fn write_script(path: &str) -> String {
    let dir = Path::new(path)
        .parent()
        .and_then(Path::to_str)
        .filter(|d| !d.is_empty())
        .unwrap_or("/");
    format!("mkdir -p '{dir}' && cat > '{path}'")
}

/// Provider backed by the `container` CLI
#[derive(Clone, Debug)]
pub struct ContainerCliProvider {
    binary: String,
    node_ip_timeout: Duration,
}

impl ContainerCliProvider {
    /// Create a provider that runs `binary`
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            node_ip_timeout: crate::DEFAULT_NODE_IP_TIMEOUT,
        }
    }

    /// Create a provider from engine settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            binary: settings.container_cli.clone(),
            node_ip_timeout: settings.node_ip_timeout,
        }
    }

    fn spawn(&self, args: &[&str], piped_stdin: bool) -> Result<Child> {
        trace!(binary = %self.binary, args = ?args, "Running container CLI");

        Command::new(&self.binary)
            .args(args)
            .stdin(if piped_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::provider_for(
                    "unknown",
                    PROVIDER_NAME,
                    format!("failed to run {}: {}", self.binary, e),
                    ProviderFailure::Fatal,
                )
            })
    }

    /// Run the CLI and return raw output; only spawn failures are errors
    async fn output(&self, args: &[&str], stdin: Option<&str>) -> Result<Output> {
        let mut child = self.spawn(args, stdin.is_some())?;

        if let (Some(content), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(content.as_bytes()).await?;
            // Close stdin so the command sees EOF
            drop(pipe);
        }

        Ok(child.wait_with_output().await?)
    }

    /// Run the CLI, mapping a non-zero exit to a classified error
    async fn run(
        &self,
        cluster: &str,
        args: &[&str],
    ) -> std::result::Result<String, (CliFailure, Error)> {
        let output = self
            .output(args, None)
            .await
            .map_err(|e| (CliFailure::Other(ProviderFailure::Fatal), e))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let class = classify_failure(&stderr);
        let failure = match class {
            CliFailure::Other(f) => f,
            CliFailure::Conflict | CliFailure::Missing => ProviderFailure::Fatal,
        };
        let message = format!("`{} {}` failed: {}", self.binary, args.join(" "), stderr);
        Err((
            class,
            Error::provider_for(cluster, PROVIDER_NAME, message, failure),
        ))
    }

    async fn list_json(&self, cluster: Option<&str>) -> Result<String> {
        self.run(cluster.unwrap_or("*"), &["list", "--all", "--format", "json"])
            .await
            .map_err(|(_, e)| e)
    }

    async fn list_all(&self, cluster: Option<&str>) -> Result<Vec<RuntimeNode>> {
        parse_container_list(&self.list_json(cluster).await?, cluster)
    }

    /// Poll until the node reports an address on the cluster network
    async fn wait_for_ip(&self, cluster: &str, name: &str) -> Result<RuntimeNode> {
        let deadline = tokio::time::Instant::now() + self.node_ip_timeout;
        loop {
            let node = self
                .list_all(Some(cluster))
                .await?
                .into_iter()
                .find(|n| n.name == name);

            if let Some(node) = node.filter(|n| n.ip.is_some()) {
                return Ok(node);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::provider_for(
                    cluster,
                    PROVIDER_NAME,
                    format!(
                        "node {} got no IP address within {:?}",
                        name, self.node_ip_timeout
                    ),
                    ProviderFailure::NetworkTimeout,
                ));
            }
            tokio::time::sleep(IP_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl RuntimeProvider for ContainerCliProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn ensure_network(&self, cluster: &str, networking: &Networking) -> Result<()> {
        let network = network_name(cluster);
        match self
            .run(
                cluster,
                &["network", "create", "--subnet", &networking.node_subnet, &network],
            )
            .await
        {
            Ok(_) => {
                info!(cluster = %cluster, network = %network, "Created cluster network");
                Ok(())
            }
            Err((CliFailure::Conflict, _)) => {
                debug!(network = %network, "Cluster network already exists");
                Ok(())
            }
            Err((_, e)) => Err(e),
        }
    }

    async fn delete_network(&self, cluster: &str) -> Result<()> {
        let network = network_name(cluster);
        match self.run(cluster, &["network", "delete", &network]).await {
            Ok(_) | Err((CliFailure::Missing, _)) => Ok(()),
            Err((_, e)) => Err(e),
        }
    }

    async fn create_node(&self, cluster: &str, plan: &NodePlan) -> Result<RuntimeNode> {
        let network = network_name(cluster);
        let mut args: Vec<String> = vec![
            "run".into(),
            "--detach".into(),
            "--name".into(),
            plan.name.clone(),
            "--network".into(),
            network,
            "--label".into(),
            format!("{LABEL_CLUSTER}={cluster}"),
            "--label".into(),
            format!("{LABEL_ROLE}={}", plan.role),
        ];
        for (key, value) in &plan.labels {
            args.push("--label".into());
            args.push(format!("{key}={value}"));
        }
        for mount in &plan.extra_mounts {
            let mut volume = format!("{}:{}", mount.host_path, mount.container_path);
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push("--volume".into());
            args.push(volume);
        }
        args.push(plan.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        match self.run(cluster, &arg_refs).await {
            Ok(_) => {}
            Err((CliFailure::Conflict, _)) => {
                return Err(Error::NodeAlreadyExists {
                    node: plan.name.clone(),
                })
            }
            Err((_, e)) => return Err(e),
        }

        info!(node = %plan.name, image = %plan.image, "Started node container");
        self.wait_for_ip(cluster, &plan.name).await
    }

    async fn list_nodes(&self, cluster: &str) -> Result<Vec<RuntimeNode>> {
        self.list_all(Some(cluster)).await
    }

    async fn delete_nodes(&self, nodes: &[RuntimeNode]) -> Result<()> {
        let results = futures::future::join_all(nodes.iter().map(move |node| async move {
            match self.run("*", &["delete", "--force", &node.id]).await {
                Ok(_) | Err((CliFailure::Missing, _)) => Ok(()),
                Err((_, e)) => Err(e),
            }
        }))
        .await;

        // Attempt every delete before reporting the first failure
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    async fn get_api_server_endpoint(&self, cluster: &str) -> Result<String> {
        parse_api_server_endpoint(&self.list_json(Some(cluster)).await?, cluster)
    }

    async fn exec_in_container(&self, node_id: &str, command: &[&str]) -> Result<ExecResult> {
        let mut args = vec!["exec", node_id];
        args.extend_from_slice(command);
        let output = self.output(&args, None).await?;
        Ok(exec_result(&output))
    }

    async fn write_file(&self, node_id: &str, path: &str, content: &str) -> Result<()> {
        let script = write_script(path);
        let command = ["sh", "-c", script.as_str()];

        let mut args = vec!["exec", "--interactive", node_id];
        args.extend_from_slice(&command);
        let output = self.output(&args, Some(content)).await?;

        exec_result(&output)
            .into_result(node_id, &command)
            .map(|_| ())
    }

    async fn copy_file(&self, node_id: &str, host_path: &Path, path: &str) -> Result<()> {
        let mut source = tokio::fs::File::open(host_path).await?;
        let script = write_script(path);
        let command = ["sh", "-c", script.as_str()];

        let mut args = vec!["exec", "--interactive", node_id];
        args.extend_from_slice(&command);
        let mut child = self.spawn(&args, true)?;
        if let Some(mut pipe) = child.stdin.take() {
            let bytes = tokio::io::copy(&mut source, &mut pipe).await?;
            debug!(node = %node_id, path = %path, bytes, "Copied file into node");
            drop(pipe);
        }
        let output = child.wait_with_output().await?;

        exec_result(&output)
            .into_result(node_id, &command)
            .map(|_| ())
    }

    async fn list_clusters(&self) -> Result<Vec<String>> {
        let clusters: BTreeSet<String> = parse_entries(&self.list_json(None).await?)?
            .iter()
            .filter_map(|e| e.cluster().map(str::to_string))
            .collect();
        Ok(clusters.into_iter().collect())
    }
}
