//! End-to-end stories for kina
//!
//! # Test Organization
//!
//! - `cluster_lifecycle`: creating a multi-node cluster, talking to it with
//!   kube-rs from the host, and deleting it again
//!
//! Every test uses its own cluster name and deletes the cluster on the way
//! out, so a failed run leaves nothing behind.

mod cluster_lifecycle;
mod helpers;
