//! Cluster configuration
//!
//! [`ClusterConfig`] is the validated input to a create. Field names follow
//! the KIND cluster config (`camelCase`, `extraMounts`, `featureGates`), so
//! the same document can be deserialized by the outer config layer.
//!
//! [`ClusterConfig::node_plans`] turns node specs into concrete, named
//! nodes. Names are deterministic:
//!
//! - `<cluster>-control-plane` for the first control plane (the primary)
//! - `<cluster>-control-plane<N>` for further control planes, N from 2
//! - `<cluster>-worker<N>` for workers, N from 1

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::NodeRole;
use crate::{
    Error, Result, DEFAULT_API_SERVER_PORT, DEFAULT_WAIT_FOR_READY, LABEL_API_SERVER_ADDRESS,
    LABEL_API_SERVER_PORT, LABEL_PREFIX, LABEL_PRIMARY,
};

/// Maximum cluster name length; node names append up to ~16 characters
const MAX_CLUSTER_NAME_LEN: usize = 40;

/// A whole cluster, as requested
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Cluster name, unique among active clusters
    pub name: String,
    /// Node specs; control planes and workers may be interleaved
    #[serde(default = "default_nodes")]
    pub nodes: Vec<NodeSpec>,
    /// Cluster networking
    #[serde(default)]
    pub networking: Networking,
    /// Kubernetes feature gates applied to every component
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feature_gates: BTreeMap<String, bool>,
    /// Kubernetes version passed to kubeadm; defaults to the image's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    /// How long to wait for every node to become Ready
    #[serde(default = "default_wait", with = "duration_secs")]
    pub wait_for_ready: Duration,
}

/// One requested node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Control plane or worker
    pub role: NodeRole,
    /// Image override; the settings' node image otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Host directories mounted into the node
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_mounts: Vec<Mount>,
    /// Extra labels put on the provider resource
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl NodeSpec {
    /// A control-plane node with defaults
    pub fn control_plane() -> Self {
        Self::with_role(NodeRole::ControlPlane)
    }

    /// A worker node with defaults
    pub fn worker() -> Self {
        Self::with_role(NodeRole::Worker)
    }

    fn with_role(role: NodeRole) -> Self {
        Self {
            role,
            image: None,
            extra_mounts: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    /// Set the image
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// A host path mounted into a node
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    /// Path on the host
    pub host_path: String,
    /// Path inside the node
    pub container_path: String,
    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}

/// CNI installed by the pipeline unless `disableDefaultCNI` is set
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CniPlugin {
    /// Point-to-point plugin with host-local IPAM
    #[default]
    Ptp,
    /// Cilium, installed with the cilium CLI from the node image
    Cilium,
}

/// kube-proxy mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KubeProxyMode {
    /// iptables rules
    #[default]
    Iptables,
    /// IPVS
    Ipvs,
    /// No kube-proxy (e.g. Cilium replacement)
    None,
}

impl KubeProxyMode {
    /// Mode string for KubeProxyConfiguration, `None` when disabled
    pub fn as_config_value(&self) -> Option<&'static str> {
        match self {
            KubeProxyMode::Iptables => Some("iptables"),
            KubeProxyMode::Ipvs => Some("ipvs"),
            KubeProxyMode::None => None,
        }
    }
}

/// Cluster networking
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Networking {
    /// Pod CIDR
    pub pod_subnet: String,
    /// Service CIDR
    pub service_subnet: String,
    /// Subnet of the provider network the nodes attach to
    pub node_subnet: String,
    /// Fixed API server address; the primary's IP otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_server_address: Option<String>,
    /// Fixed API server port; 6443 otherwise
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_server_port: Option<u16>,
    /// Skip the CNI phase entirely
    #[serde(rename = "disableDefaultCNI")]
    pub disable_default_cni: bool,
    /// Which CNI to install
    pub cni: CniPlugin,
    /// kube-proxy mode
    pub kube_proxy_mode: KubeProxyMode,
}

impl Default for Networking {
    fn default() -> Self {
        Self {
            pod_subnet: "10.244.0.0/16".to_string(),
            service_subnet: "10.96.0.0/16".to_string(),
            node_subnet: "172.20.0.0/16".to_string(),
            api_server_address: None,
            api_server_port: None,
            disable_default_cni: false,
            cni: CniPlugin::default(),
            kube_proxy_mode: KubeProxyMode::default(),
        }
    }
}

/// A concrete node to create, derived from a [`NodeSpec`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodePlan {
    /// Deterministic node name
    pub name: String,
    /// Control plane or worker
    pub role: NodeRole,
    /// Resolved image
    pub image: String,
    /// Host mounts
    pub extra_mounts: Vec<Mount>,
    /// Labels, including the primary marker and API server labels on the primary
    pub labels: BTreeMap<String, String>,
    /// Whether this node runs `kubeadm init`
    pub primary: bool,
}

fn default_nodes() -> Vec<NodeSpec> {
    vec![NodeSpec::control_plane()]
}

fn default_wait() -> Duration {
    DEFAULT_WAIT_FOR_READY
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

impl ClusterConfig {
    /// A single control-plane cluster with default networking
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: default_nodes(),
            networking: Networking::default(),
            feature_gates: BTreeMap::new(),
            kubernetes_version: None,
            wait_for_ready: DEFAULT_WAIT_FOR_READY,
        }
    }

    /// Replace the nodes with `control_planes` control planes and `workers` workers
    pub fn with_topology(mut self, control_planes: usize, workers: usize) -> Self {
        self.nodes = std::iter::repeat_with(NodeSpec::control_plane)
            .take(control_planes)
            .chain(std::iter::repeat_with(NodeSpec::worker).take(workers))
            .collect();
        self
    }

    /// Set the wait-for-ready duration
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait_for_ready = wait;
        self
    }

    /// Number of control-plane nodes
    pub fn control_plane_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.role == NodeRole::ControlPlane)
            .count()
    }

    /// Number of worker nodes
    pub fn worker_count(&self) -> usize {
        self.nodes.len() - self.control_plane_count()
    }

    /// Port the API server binds on every control plane
    pub fn api_server_port(&self) -> u16 {
        self.networking
            .api_server_port
            .unwrap_or(DEFAULT_API_SERVER_PORT)
    }

    /// Validate the config without touching any resource
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String, field: &str| {
            Err(Error::validation_for(&self.name, message, Some(field)))
        };

        if self.name.is_empty() {
            return invalid("cluster name must not be empty".into(), "name");
        }
        if self.name.len() > MAX_CLUSTER_NAME_LEN {
            return invalid(
                format!("cluster name must be at most {MAX_CLUSTER_NAME_LEN} characters"),
                "name",
            );
        }
        if !is_dns_label(&self.name) {
            return invalid(
                format!(
                    "cluster name '{}' must consist of lowercase alphanumerics and '-', \
                     starting and ending with an alphanumeric",
                    self.name
                ),
                "name",
            );
        }
        if self.control_plane_count() == 0 {
            return invalid(
                "at least one control-plane node is required".into(),
                "nodes",
            );
        }

        for (i, node) in self.nodes.iter().enumerate() {
            if matches!(&node.image, Some(image) if image.trim().is_empty()) {
                return invalid("image must not be empty".into(), &format!("nodes[{i}].image"));
            }
            if let Some(key) = node.labels.keys().find(|k| k.starts_with(LABEL_PREFIX)) {
                return invalid(
                    format!("label '{key}' uses the reserved '{LABEL_PREFIX}' prefix"),
                    &format!("nodes[{i}].labels"),
                );
            }
            for (j, mount) in node.extra_mounts.iter().enumerate() {
                if mount.host_path.is_empty() || mount.container_path.is_empty() {
                    return invalid(
                        "mount host and container paths must not be empty".into(),
                        &format!("nodes[{i}].extraMounts[{j}]"),
                    );
                }
            }
        }

        let net = &self.networking;
        for (field, cidr) in [
            ("networking.podSubnet", &net.pod_subnet),
            ("networking.serviceSubnet", &net.service_subnet),
            ("networking.nodeSubnet", &net.node_subnet),
        ] {
            if !is_ipv4_cidr(cidr) {
                return invalid(format!("'{cidr}' is not an IPv4 CIDR"), field);
            }
        }
        if net.api_server_port == Some(0) {
            return invalid(
                "API server port must not be 0".into(),
                "networking.apiServerPort",
            );
        }

        Ok(())
    }

    /// Concrete nodes to create, primary first within control planes
    pub fn node_plans(&self, default_image: &str) -> Vec<NodePlan> {
        let mut control_planes = 0usize;
        let mut workers = 0usize;

        self.nodes
            .iter()
            .map(|spec| {
                let (suffix, primary) = match spec.role {
                    NodeRole::ControlPlane => {
                        control_planes += 1;
                        if control_planes == 1 {
                            ("control-plane".to_string(), true)
                        } else {
                            (format!("control-plane{control_planes}"), false)
                        }
                    }
                    NodeRole::Worker => {
                        workers += 1;
                        (format!("worker{workers}"), false)
                    }
                };

                let mut labels = spec.labels.clone();
                if primary {
                    labels.insert(LABEL_PRIMARY.to_string(), "true".to_string());
                    labels.insert(
                        LABEL_API_SERVER_PORT.to_string(),
                        self.api_server_port().to_string(),
                    );
                    if let Some(address) = &self.networking.api_server_address {
                        labels.insert(LABEL_API_SERVER_ADDRESS.to_string(), address.clone());
                    }
                }

                NodePlan {
                    name: format!("{}-{}", self.name, suffix),
                    role: spec.role,
                    image: spec
                        .image
                        .clone()
                        .unwrap_or_else(|| default_image.to_string()),
                    extra_mounts: spec.extra_mounts.clone(),
                    labels,
                    primary,
                }
            })
            .collect()
    }
}

fn is_dns_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    match (bytes.first(), bytes.last()) {
        (Some(&first), Some(&last)) => {
            edge_ok(first) && edge_ok(last) && bytes.iter().all(|&b| edge_ok(b) || b == b'-')
        }
        _ => false,
    }
}

fn is_ipv4_cidr(cidr: &str) -> bool {
    match cidr.split_once('/') {
        Some((addr, prefix)) => {
            addr.parse::<Ipv4Addr>().is_ok() && prefix.parse::<u8>().is_ok_and(|p| p <= 32)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Story: Node names are deterministic and exactly one node is primary
    #[test]
    fn story_node_plans_name_every_node_once() {
        let config = ClusterConfig::new("demo").with_topology(3, 2);
        let plans = config.node_plans("kindest/node:test");

        let names: Vec<_> = plans.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "demo-control-plane",
                "demo-control-plane2",
                "demo-control-plane3",
                "demo-worker1",
                "demo-worker2",
            ]
        );

        let unique: HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), plans.len());

        let primaries: Vec<_> = plans.iter().filter(|p| p.primary).collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].name, "demo-control-plane");
        assert_eq!(
            primaries[0].labels.get(LABEL_PRIMARY).map(String::as_str),
            Some("true")
        );
        assert!(plans.iter().all(|p| p.image == "kindest/node:test"));
    }

    /// Story: Primary is the first control plane even after workers
    #[test]
    fn story_primary_is_first_control_plane_in_any_order() {
        let mut config = ClusterConfig::new("mixed");
        config.nodes = vec![
            NodeSpec::worker(),
            NodeSpec::control_plane().with_image("custom:1"),
            NodeSpec::control_plane(),
        ];
        let plans = config.node_plans("default:1");

        assert_eq!(plans[0].name, "mixed-worker1");
        assert!(plans[1].primary);
        assert_eq!(plans[1].image, "custom:1");
        assert_eq!(plans[2].name, "mixed-control-plane2");
    }

    /// Story: Validation rejects bad configs before any resource exists
    #[test]
    fn story_validation_rejects_bad_configs() {
        assert!(ClusterConfig::new("demo").validate().is_ok());

        let cases = [
            (ClusterConfig::new(""), "name"),
            (ClusterConfig::new("My Cluster!"), "name"),
            (ClusterConfig::new("-demo"), "name"),
            (ClusterConfig::new("demo").with_topology(0, 2), "nodes"),
        ];
        for (config, expected_field) in cases {
            match config.validate() {
                Err(Error::Validation { field, .. }) => {
                    assert_eq!(field.as_deref(), Some(expected_field))
                }
                other => panic!("Expected validation error, got {other:?}"),
            }
        }

        let mut bad_cidr = ClusterConfig::new("demo");
        bad_cidr.networking.pod_subnet = "10.244.0.0".into();
        assert!(bad_cidr.validate().is_err());

        let mut bad_port = ClusterConfig::new("demo");
        bad_port.networking.api_server_port = Some(0);
        assert!(bad_port.validate().is_err());

        let mut bad_mount = ClusterConfig::new("demo");
        bad_mount.nodes[0].extra_mounts.push(Mount {
            host_path: String::new(),
            container_path: "/data".into(),
            read_only: false,
        });
        assert!(bad_mount.validate().is_err());
    }

    /// Story: User labels can't claim kina's own label keys
    ///
    /// A worker labelled as primary (or as part of another cluster) would
    /// break the single-primary rule or hide from teardown.
    #[test]
    fn story_reserved_labels_are_rejected() {
        for key in [LABEL_PRIMARY, crate::LABEL_CLUSTER, "io.kina.anything"] {
            let mut config = ClusterConfig::new("demo").with_topology(1, 1);
            config.nodes[1].labels.insert(key.to_string(), "true".into());

            match config.validate() {
                Err(Error::Validation { field, message, .. }) => {
                    assert_eq!(field.as_deref(), Some("nodes[1].labels"));
                    assert!(message.contains(key));
                }
                other => panic!("Expected validation error for {key}, got {other:?}"),
            }
        }

        let mut config = ClusterConfig::new("demo");
        config.nodes[0].labels.insert("team".into(), "infra".into());
        config.validate().unwrap();
    }

    #[test]
    fn primary_plan_records_api_server_labels() {
        let mut config = ClusterConfig::new("demo").with_topology(2, 0);
        config.networking.api_server_port = Some(7443);
        config.networking.api_server_address = Some("10.0.0.5".into());
        let plans = config.node_plans("img");

        let primary = &plans[0].labels;
        assert_eq!(primary.get(LABEL_API_SERVER_PORT).map(String::as_str), Some("7443"));
        assert_eq!(
            primary.get(LABEL_API_SERVER_ADDRESS).map(String::as_str),
            Some("10.0.0.5")
        );
        assert!(plans[1].labels.is_empty());
        assert_eq!(ClusterConfig::new("demo").api_server_port(), DEFAULT_API_SERVER_PORT);
    }

    /// Story: KIND-style documents deserialize with defaults filled in
    #[test]
    fn story_kind_style_config_deserializes() {
        let yaml = r#"
name: demo
nodes:
  - role: control-plane
  - role: worker
    extraMounts:
      - hostPath: /tmp/data
        containerPath: /data
networking:
  disableDefaultCNI: true
  apiServerPort: 7443
featureGates:
  InPlacePodVerticalScaling: true
waitForReady: 90
"#;
        let config: ClusterConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.worker_count(), 1);
        assert!(config.networking.disable_default_cni);
        assert_eq!(config.networking.api_server_port, Some(7443));
        assert_eq!(config.networking.pod_subnet, "10.244.0.0/16");
        assert_eq!(config.wait_for_ready, Duration::from_secs(90));
        assert_eq!(config.feature_gates.get("InPlacePodVerticalScaling"), Some(&true));
        config.validate().unwrap();
    }

    #[test]
    fn missing_nodes_default_to_single_control_plane() {
        let config: ClusterConfig = serde_yaml::from_str("name: solo").unwrap();
        assert_eq!(config.nodes, vec![NodeSpec::control_plane()]);
        assert_eq!(config.wait_for_ready, DEFAULT_WAIT_FOR_READY);
    }
}
