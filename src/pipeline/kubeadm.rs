//! kubeadm config rendering, `kubeadm init` and kubeconfig export

use std::collections::BTreeMap;

use futures::future::try_join_all;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{ActionContext, ApiEndpoint, JoinCredentials};
use crate::config::ClusterConfig;
use crate::kube_utils::kubectl;
use crate::types::RuntimeNode;
use crate::{Error, Result, ADMIN_KUBECONFIG_PATH, KUBEADM_CONFIG_PATH};

const KUBEADM_API_VERSION: &str = "kubeadm.k8s.io/v1beta3";
const CRI_SOCKET: &str = "unix:///run/containerd/containerd.sock";

fn feature_gate_arg(gates: &BTreeMap<String, bool>) -> Option<String> {
    if gates.is_empty() {
        return None;
    }
    Some(
        gates
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}

fn node_registration(node: &RuntimeNode, ip: &str) -> Value {
    json!({
        "name": node.name,
        "criSocket": CRI_SOCKET,
        "kubeletExtraArgs": { "node-ip": ip },
    })
}

fn component_args(gates: &Option<String>) -> Value {
    match gates {
        Some(g) => json!({ "extraArgs": { "feature-gates": g } }),
        None => json!({}),
    }
}

/// Render the multi-document kubeadm config for `node`.
///
/// Every node gets the same cluster-wide documents; `InitConfiguration`
/// targets the primary, `JoinConfiguration` everyone else (with a
/// `controlPlane` section on secondary control planes).
pub fn render_kubeadm_config(
    config: &ClusterConfig,
    node: &RuntimeNode,
    control_plane_ips: &[String],
    endpoint: &ApiEndpoint,
    credentials: &JoinCredentials,
) -> Result<String> {
    let ip = node.require_ip()?;
    let gates = feature_gate_arg(&config.feature_gates);

    let mut cert_sans = vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        endpoint.host.clone(),
    ];
    for cp in control_plane_ips {
        if !cert_sans.contains(cp) {
            cert_sans.push(cp.clone());
        }
    }

    let mut api_server = component_args(&gates);
    api_server["certSANs"] = json!(cert_sans);

    let mut cluster_configuration = json!({
        "apiVersion": KUBEADM_API_VERSION,
        "kind": "ClusterConfiguration",
        "clusterName": config.name,
        "controlPlaneEndpoint": endpoint.host_port(),
        "apiServer": api_server,
        "controllerManager": component_args(&gates),
        "scheduler": component_args(&gates),
        "networking": {
            "podSubnet": config.networking.pod_subnet,
            "serviceSubnet": config.networking.service_subnet,
        },
    });
    if let Some(version) = &config.kubernetes_version {
        cluster_configuration["kubernetesVersion"] = json!(version);
    }

    let mut documents = vec![cluster_configuration];

    if node.primary {
        documents.push(json!({
            "apiVersion": KUBEADM_API_VERSION,
            "kind": "InitConfiguration",
            "bootstrapTokens": [{
                "token": credentials.token,
                "ttl": "24h0m0s",
                "usages": ["signing", "authentication"],
                "groups": ["system:bootstrappers:kubeadm:default-node-token"],
            }],
            "certificateKey": credentials.certificate_key,
            "localAPIEndpoint": {
                "advertiseAddress": ip,
                "bindPort": endpoint.port,
            },
            "nodeRegistration": node_registration(node, ip),
        }));
    } else {
        let mut join = json!({
            "apiVersion": KUBEADM_API_VERSION,
            "kind": "JoinConfiguration",
            "discovery": {
                "bootstrapToken": {
                    "apiServerEndpoint": endpoint.host_port(),
                    "token": credentials.token,
                    "unsafeSkipCAVerification": true,
                },
            },
            "nodeRegistration": node_registration(node, ip),
        });
        if node.is_control_plane() {
            join["controlPlane"] = json!({
                "localAPIEndpoint": {
                    "advertiseAddress": ip,
                    "bindPort": endpoint.port,
                },
                "certificateKey": credentials.certificate_key,
            });
        }
        documents.push(join);
    }

    documents.push(json!({
        "apiVersion": "kubelet.config.k8s.io/v1beta1",
        "kind": "KubeletConfiguration",
        "cgroupDriver": "systemd",
        "serverTLSBootstrap": true,
        "failSwapOn": false,
        "featureGates": config.feature_gates,
    }));

    if let Some(mode) = config.networking.kube_proxy_mode.as_config_value() {
        documents.push(json!({
            "apiVersion": "kubeproxy.config.k8s.io/v1alpha1",
            "kind": "KubeProxyConfiguration",
            "mode": mode,
            "featureGates": config.feature_gates,
        }));
    }

    let rendered = documents
        .iter()
        .map(serde_yaml::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::serialization_for("kubeadm config", e.to_string()))?;
    Ok(rendered.join("---\n"))
}

/// Write the rendered kubeadm config to every node
pub(super) async fn write_config(ctx: &mut ActionContext) -> Result<()> {
    let endpoint = ctx.endpoint()?;
    let control_plane_ips: Vec<String> = ctx
        .nodes
        .iter()
        .filter(|n| n.is_control_plane())
        .filter_map(|n| n.ip.clone())
        .collect();

    let writes = ctx
        .nodes
        .iter()
        .map(|node| {
            render_kubeadm_config(
                &ctx.config,
                node,
                &control_plane_ips,
                endpoint,
                &ctx.credentials,
            )
            .map(|rendered| (node, rendered))
        })
        .collect::<Result<Vec<_>>>()?;

    let provider = ctx.provider.as_ref();
    try_join_all(writes.iter().map(|(node, rendered)| {
        provider.write_file(&node.id, KUBEADM_CONFIG_PATH, rendered)
    }))
    .await?;

    info!(nodes = writes.len(), path = KUBEADM_CONFIG_PATH, "Wrote kubeadm config");
    Ok(())
}

/// Run `kubeadm init` on the primary, export the kubeconfig right away and
/// untaint the control plane of worker-less clusters
pub(super) async fn init(ctx: &mut ActionContext) -> Result<()> {
    let primary = ctx.primary()?.clone();
    let config_arg = format!("--config={KUBEADM_CONFIG_PATH}");
    let command = [
        "kubeadm",
        "init",
        config_arg.as_str(),
        "--skip-phases=preflight",
        "--upload-certs",
        "--v=1",
    ];

    info!(node = %primary.name, "Running kubeadm init");
    ctx.provider.exec_checked(&primary, &command).await?;

    export_kubeconfig(ctx, &primary).await?;

    if !ctx.has_workers() {
        let untaint = kubectl(&[
            "taint",
            "nodes",
            "--all",
            "node-role.kubernetes.io/control-plane-",
        ]);
        match ctx.provider.exec_in_container(&primary.id, &untaint).await {
            Ok(result) if result.success() => {
                info!(node = %primary.name, "Removed control-plane taint");
            }
            Ok(result) => {
                warn!(
                    node = %primary.name,
                    stderr = %result.stderr.trim(),
                    "Could not remove control-plane taint"
                );
            }
            Err(e) => {
                warn!(node = %primary.name, error = %e, "Could not remove control-plane taint")
            }
        }
    }
    Ok(())
}

async fn export_kubeconfig(ctx: &mut ActionContext, primary: &RuntimeNode) -> Result<()> {
    let cluster = ctx.cluster().to_string();
    let raw = ctx
        .provider
        .exec_checked(primary, &["cat", ADMIN_KUBECONFIG_PATH])
        .await?
        .stdout;
    let server = ctx.endpoint()?.url();
    let kubeconfig = rewrite_kubeconfig_server(&cluster, &raw, &server)?;

    let path = ctx.settings.kubeconfig_path(&cluster);
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(&path, kubeconfig).await?;

    info!(cluster = %cluster, path = %path.display(), "Wrote kubeconfig");
    ctx.kubeconfig_path = Some(path);
    Ok(())
}

/// Point every cluster entry of a kubeconfig at `server`
pub fn rewrite_kubeconfig_server(cluster: &str, raw: &str, server: &str) -> Result<String> {
    let mut doc: serde_yaml::Value = serde_yaml::from_str(raw)
        .map_err(|e| Error::kubeconfig(cluster, format!("admin kubeconfig is not YAML: {e}")))?;

    let entries = doc
        .get_mut("clusters")
        .and_then(|c| c.as_sequence_mut())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::kubeconfig(cluster, "admin kubeconfig has no clusters"))?;

    for entry in entries.iter_mut() {
        let Some(spec) = entry.get_mut("cluster").and_then(|c| c.as_mapping_mut()) else {
            return Err(Error::kubeconfig(cluster, "cluster entry without a cluster field"));
        };
        spec.insert("server".into(), server.into());
    }

    serde_yaml::to_string(&doc).map_err(|e| Error::kubeconfig(cluster, e.to_string()))
}
