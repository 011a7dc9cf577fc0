//! Endpoint resolution, CNI and storage phases

use std::collections::BTreeMap;

use futures::future::try_join_all;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use tracing::info;

use super::{ActionContext, ApiEndpoint};
use crate::config::CniPlugin;
use crate::{Error, Result, ADMIN_KUBECONFIG_PATH};

/// Where the PTP conflist goes on every node
pub const CNI_CONFIG_PATH: &str = "/etc/cni/net.d/10-kina.conflist";

/// Where the storage manifest goes on the primary
pub const STORAGE_MANIFEST_PATH: &str = "/kind/manifests/default-storage.yaml";

/// Resolve the API endpoint: configured address/port, else the primary on 6443
pub(super) fn resolve_endpoint(ctx: &mut ActionContext) -> Result<()> {
    let host = match &ctx.config.networking.api_server_address {
        Some(address) => address.clone(),
        None => ctx.primary()?.require_ip()?.to_string(),
    };
    let endpoint = ApiEndpoint {
        host,
        port: ctx.config.api_server_port(),
    };

    info!(endpoint = %endpoint.url(), "Resolved API server endpoint");
    ctx.api_endpoint = Some(endpoint);
    Ok(())
}

/// Point-to-point CNI config with host-local IPAM over the pod subnet
pub fn ptp_conflist(pod_subnet: &str) -> String {
    let conflist = json!({
        "cniVersion": "1.0.0",
        "name": "kina",
        "plugins": [
            {
                "type": "ptp",
                "ipMasq": true,
                "ipam": {
                    "type": "host-local",
                    "ranges": [[{ "subnet": pod_subnet }]],
                    "routes": [{ "dst": "0.0.0.0/0" }],
                },
                "mtu": 1500,
            },
            {
                "type": "portmap",
                "capabilities": { "portMappings": true },
            },
        ],
    });
    // Infallible for a json! value
    serde_json::to_string_pretty(&conflist).unwrap_or_else(|_| conflist.to_string())
}

pub(super) async fn install_cni(ctx: &mut ActionContext) -> Result<()> {
    let provider = ctx.provider.as_ref();
    match ctx.config.networking.cni {
        CniPlugin::Ptp => {
            let conflist = ptp_conflist(&ctx.config.networking.pod_subnet);
            try_join_all(
                ctx.nodes
                    .iter()
                    .map(|node| provider.write_file(&node.id, CNI_CONFIG_PATH, &conflist)),
            )
            .await?;
            try_join_all(
                ctx.nodes
                    .iter()
                    .map(|node| provider.exec_checked(node, &["systemctl", "restart", "kubelet"])),
            )
            .await?;
            info!(nodes = ctx.nodes.len(), "Installed PTP CNI");
        }
        CniPlugin::Cilium => {
            let primary = ctx.primary()?;
            let script = format!(
                "KUBECONFIG={ADMIN_KUBECONFIG_PATH} cilium install \
                 --set ipam.operator.clusterPoolIPv4PodCIDRList={}",
                ctx.config.networking.pod_subnet
            );
            provider
                .exec_checked(primary, &["sh", "-c", script.as_str()])
                .await?;
            info!(node = %primary.name, "Installed Cilium");
        }
    }
    Ok(())
}

/// Default StorageClass manifest
pub fn default_storage_class() -> Result<String> {
    let class = StorageClass {
        metadata: ObjectMeta {
            name: Some("standard".to_string()),
            annotations: Some(BTreeMap::from([(
                "storageclass.kubernetes.io/is-default-class".to_string(),
                "true".to_string(),
            )])),
            ..Default::default()
        },
        provisioner: "kubernetes.io/no-provisioner".to_string(),
        reclaim_policy: Some("Delete".to_string()),
        volume_binding_mode: Some("WaitForFirstConsumer".to_string()),
        ..Default::default()
    };
    serde_yaml::to_string(&class)
        .map_err(|e| Error::serialization_for("StorageClass", e.to_string()))
}

pub(super) async fn install_storage(ctx: &mut ActionContext) -> Result<()> {
    let primary = ctx.primary()?;
    let manifest = default_storage_class()?;
    ctx.provider
        .write_file(&primary.id, STORAGE_MANIFEST_PATH, &manifest)
        .await?;
    ctx.provider
        .exec_checked(
            primary,
            &[
                "kubectl",
                "--kubeconfig",
                ADMIN_KUBECONFIG_PATH,
                "apply",
                "-f",
                STORAGE_MANIFEST_PATH,
            ],
        )
        .await?;
    info!("Installed default StorageClass");
    Ok(())
}
