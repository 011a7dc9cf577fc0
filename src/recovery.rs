//! Failure diagnostics
//!
//! When a create or delete fails after resources exist, the error is wrapped
//! in an [`OperationFailure`]: the operation, the phase it was in, the nodes
//! involved, and a [`DiagnosticReport`] gathered from the live provider
//! before cleanup runs. Its `Display` output is meant to be printed as-is.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::provider::RuntimeProvider;
use crate::types::{NodeState, RuntimeNode};
use crate::Error;

/// Lines of command output kept in a report
pub const OUTPUT_EXCERPT_LINES: usize = 12;

/// Kubelet journal lines fetched per affected node
pub const KUBELET_LOG_LINES: usize = 20;

/// Affected nodes whose kubelet logs are fetched
const MAX_LOG_NODES: usize = 3;

/// Which top-level operation failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    /// Cluster create
    Create,
    /// Cluster delete
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Create => f.write_str("create"),
            OperationKind::Delete => f.write_str("delete"),
        }
    }
}

/// What the provider looked like when the operation failed
#[derive(Clone, Debug, Default)]
pub struct DiagnosticReport {
    /// When the report was collected
    pub collected_at: Option<DateTime<Utc>>,
    /// Node states as listed by the provider
    pub node_states: Vec<(String, NodeState)>,
    /// Tail of the failed command's output
    pub output_excerpt: Option<String>,
    /// Kubelet journal tails of affected nodes
    pub kubelet_logs: Vec<(String, String)>,
    /// Set when the provider could not be queried
    pub provider_error: Option<String>,
}

impl fmt::Display for DiagnosticReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(at) = self.collected_at {
            writeln!(f, "diagnostics collected at {}", at.format("%Y-%m-%dT%H:%M:%SZ"))?;
        }
        if let Some(err) = &self.provider_error {
            writeln!(f, "  provider unavailable: {err}")?;
        }
        if !self.node_states.is_empty() {
            writeln!(f, "  nodes:")?;
            for (name, state) in &self.node_states {
                writeln!(f, "    {name}: {state}")?;
            }
        }
        if let Some(excerpt) = &self.output_excerpt {
            writeln!(f, "  command output:")?;
            for line in excerpt.lines() {
                writeln!(f, "    | {line}")?;
            }
        }
        for (node, logs) in &self.kubelet_logs {
            writeln!(f, "  kubelet on {node}:")?;
            for line in logs.lines() {
                writeln!(f, "    | {line}")?;
            }
        }
        Ok(())
    }
}

/// A failed create or delete, with everything needed to explain it
#[derive(Debug)]
pub struct OperationFailure {
    /// Create or delete
    pub operation: OperationKind,
    /// Cluster name
    pub cluster: String,
    /// Phase that failed (e.g. "provision", "kubeadm-join")
    pub phase: String,
    /// Nodes the failure concerns
    pub nodes: Vec<String>,
    /// The original error
    pub cause: Error,
    /// Provider state at failure time
    pub diagnostics: DiagnosticReport,
    /// Set when rollback itself ran into trouble or was skipped
    pub cleanup_note: Option<String>,
}

impl OperationFailure {
    /// Wrap `cause` for `operation` on `cluster` in `phase`
    pub fn new(
        operation: OperationKind,
        cluster: impl Into<String>,
        phase: impl Into<String>,
        cause: Error,
    ) -> Self {
        Self {
            operation,
            cluster: cluster.into(),
            phase: phase.into(),
            nodes: cause.affected_nodes(),
            cause,
            diagnostics: DiagnosticReport::default(),
            cleanup_note: None,
        }
    }

    /// Attach diagnostics
    pub fn with_diagnostics(mut self, diagnostics: DiagnosticReport) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Attach a cleanup note
    pub fn with_cleanup_note(mut self, note: Option<String>) -> Self {
        self.cleanup_note = note;
        self
    }

    /// Full multi-line report for display
    pub fn report(&self) -> String {
        let mut out = format!("{self}\n");
        out.push_str(&self.diagnostics.to_string());
        out
    }
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of cluster {} failed in phase {}",
            self.operation, self.cluster, self.phase
        )?;
        if !self.nodes.is_empty() {
            write!(f, " on {}", self.nodes.join(", "))?;
        }
        write!(f, ": {}", self.cause)?;
        if let Some(note) = &self.cleanup_note {
            write!(f, " (cleanup: {note})")?;
        }
        Ok(())
    }
}

/// Last `max_lines` non-empty lines of `text`
pub fn excerpt(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Gather provider state for a failure of `cluster`, best effort.
///
/// Must run before cleanup, while the nodes still exist.
pub async fn collect_diagnostics(
    provider: &dyn RuntimeProvider,
    cluster: &str,
    cause: &Error,
) -> DiagnosticReport {
    let mut report = DiagnosticReport {
        collected_at: Some(Utc::now()),
        output_excerpt: cause
            .command_output()
            .map(|out| excerpt(out, OUTPUT_EXCERPT_LINES))
            .filter(|e| !e.is_empty()),
        ..Default::default()
    };

    let nodes: Vec<RuntimeNode> = match provider.list_nodes(cluster).await {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(cluster = %cluster, error = %e, "Could not list nodes for diagnostics");
            report.provider_error = Some(e.to_string());
            return report;
        }
    };
    report.node_states = nodes.iter().map(|n| (n.name.clone(), n.state)).collect();

    let affected = cause.affected_nodes();
    let log_lines = KUBELET_LOG_LINES.to_string();
    for node in nodes
        .iter()
        .filter(|n| affected.contains(&n.name))
        .take(MAX_LOG_NODES)
    {
        let command = [
            "journalctl",
            "-u",
            "kubelet",
            "-n",
            log_lines.as_str(),
            "--no-pager",
        ];
        match provider.exec_in_container(&node.id, &command).await {
            Ok(result) if result.success() => {
                report
                    .kubelet_logs
                    .push((node.name.clone(), excerpt(&result.stdout, KUBELET_LOG_LINES)));
            }
            Ok(result) => {
                debug!(node = %node.name, exit_code = result.exit_code, "No kubelet journal");
            }
            Err(e) => {
                debug!(node = %node.name, error = %e, "Could not read kubelet journal");
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::provider::testing::FakeProvider;

    #[test]
    fn excerpt_keeps_last_non_empty_lines() {
        let text = "a\n\nb\nc\n\n";
        assert_eq!(excerpt(text, 2), "b\nc");
        assert_eq!(excerpt(text, 10), "a\nb\nc");
        assert_eq!(excerpt("", 3), "");
    }

    /// Story: A failed join explains itself without a verbose re-run
    ///
    /// The report names the phase and node, shows the tail of the failing
    /// command and the kubelet journal from that node.
    #[tokio::test]
    async fn story_failure_report_names_phase_node_and_output() {
        let provider = FakeProvider::new();
        provider
            .provision(&ClusterConfig::new("demo").with_topology(1, 1), "img")
            .await
            .unwrap();

        let cause = Error::ExecFailed {
            node: "demo-worker1".into(),
            command: "kubeadm join".into(),
            exit_code: 1,
            stdout: String::new(),
            stderr: "[preflight] ok\nerror execution phase kubelet-start".into(),
        };
        let diagnostics = collect_diagnostics(&provider, "demo", &cause).await;

        assert_eq!(diagnostics.node_states.len(), 2);
        assert_eq!(diagnostics.kubelet_logs.len(), 1);
        assert_eq!(diagnostics.kubelet_logs[0].0, "demo-worker1");

        let failure = OperationFailure::new(OperationKind::Create, "demo", "kubeadm-join", cause)
            .with_diagnostics(diagnostics)
            .with_cleanup_note(Some("network kina-demo left behind".into()));

        let headline = failure.to_string();
        assert!(headline.starts_with("create of cluster demo failed in phase kubeadm-join"));
        assert!(headline.contains("on demo-worker1"));
        assert!(headline.contains("(cleanup: network kina-demo left behind)"));

        let report = failure.report();
        assert!(report.contains("demo-control-plane: Running"));
        assert!(report.contains("| error execution phase kubelet-start"));
        assert!(report.contains("kubelet on demo-worker1:"));
    }

    #[tokio::test]
    async fn diagnostics_survive_an_empty_cluster() {
        let provider = FakeProvider::new();
        let report =
            collect_diagnostics(&provider, "ghost", &Error::internal("boom")).await;
        assert!(report.node_states.is_empty());
        assert!(report.output_excerpt.is_none());
        assert!(report.provider_error.is_none());
    }
}
