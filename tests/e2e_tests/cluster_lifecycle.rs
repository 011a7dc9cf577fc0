//! A real cluster from create to delete

use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};

use kina::csr::{CsrBootstrapMonitor, KubeCsrClient};
use kina::kube_utils::{create_client, node_is_ready};
use kina::{ClusterConfig, CreateOptions, Error};

use super::helpers::{cleanup_cluster, real_lifecycle};

/// Story: A 1+2 cluster comes up Ready and is reachable from the host
///
/// The kubeconfig kina writes is enough for kube-rs to list nodes, and the
/// kubelet serving certificates were approved during bootstrap.
#[tokio::test]
#[ignore = "requires the container CLI"]
async fn story_create_use_and_delete_cluster() {
    let lifecycle = real_lifecycle();
    let name = "kina-e2e-lifecycle";
    cleanup_cluster(&lifecycle, name).await;

    let config = ClusterConfig::new(name)
        .with_topology(1, 2)
        .with_wait(Duration::from_secs(600));
    let cluster = match lifecycle.create(config, CreateOptions::default()).await {
        Ok(cluster) => cluster,
        Err(Error::Operation(failure)) => panic!("{}", failure.report()),
        Err(e) => panic!("create failed: {e}"),
    };
    assert_eq!(cluster.nodes.len(), 3);

    let kubeconfig = cluster.kubeconfig_path.clone().expect("kubeconfig written");
    let client = create_client(&kubeconfig).await.expect("client");
    let nodes: Api<Node> = Api::all(client);
    let listed = nodes.list(&ListParams::default()).await.expect("list nodes");
    assert_eq!(listed.items.len(), 3);
    assert!(listed.items.iter().all(node_is_ready));

    let csrs = KubeCsrClient::from_kubeconfig(&kubeconfig)
        .await
        .expect("csr client");
    let pending = CsrBootstrapMonitor::approve_pending(&csrs)
        .await
        .expect("list csrs");
    assert_eq!(pending, 0, "serving CSRs should already be approved");

    assert!(lifecycle
        .list_clusters()
        .await
        .unwrap()
        .contains(&name.to_string()));

    lifecycle.delete(name).await.expect("delete");
    assert!(lifecycle.list_nodes(name).await.unwrap().is_empty());
}

/// Story: A second create of a live cluster is refused
#[tokio::test]
#[ignore = "requires the container CLI"]
async fn story_duplicate_create_is_refused() {
    let lifecycle = real_lifecycle();
    let name = "kina-e2e-duplicate";
    cleanup_cluster(&lifecycle, name).await;

    let options = CreateOptions {
        stop_before_kubernetes: true,
        ..Default::default()
    };
    lifecycle
        .create(ClusterConfig::new(name), options.clone())
        .await
        .expect("first create");

    let err = lifecycle
        .create(ClusterConfig::new(name), options)
        .await
        .unwrap_err();
    assert!(err.is_already_exists());

    cleanup_cluster(&lifecycle, name).await;
}
