//! The restoration ledger: everything we need to undo, in the order we did it.
//!
//! Each forward step that changes something outside this process pushes its
//! undo action as soon as it succeeds. Teardown pops them, so actions run in
//! exactly the reverse order. A failed undo is logged and the rest still run.

use crate::kubernetes::Cluster;
use crate::prelude::*;
use crate::substitute::{Progress, ServiceSnapshot};
use crate::tunnel::{Forwarder, TunnelId, TunnelManager};

/// Something to undo at teardown.
#[derive(Clone, Debug, PartialEq)]
pub enum UndoAction {
    /// Close a tunnel we opened.
    CloseTunnel {
        /// The tunnel.
        id: TunnelId,
        /// Namespace of the tunnelled service.
        namespace: String,
        /// Name of the tunnelled service.
        name: String,
    },
    /// Delete a substitute endpoints object we created.
    DeleteEndpoints {
        /// Namespace of the endpoints.
        namespace: String,
        /// Name of the endpoints.
        name: String,
    },
    /// Put a service back the way it was.
    RestoreService(ServiceSnapshot),
}

impl fmt::Display for UndoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UndoAction::CloseTunnel {
                namespace, name, ..
            } => write!(f, "close port forward {}/{}", namespace, name),
            UndoAction::DeleteEndpoints { namespace, name } => {
                write!(f, "delete endpoints {}/{}", namespace, name)
            }
            UndoAction::RestoreService(snapshot) => {
                write!(f, "restore service {}", snapshot.service().qualified_name())
            }
        }
    }
}

/// What happened when we unwound the ledger.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TeardownReport {
    /// Every action we ran, in the order we ran it, whether or not it
    /// succeeded.
    pub executed: Vec<UndoAction>,
    /// How many of `executed` failed.
    pub failed: usize,
    /// How many orphaned substitute endpoints the final sweep deleted.
    pub swept: usize,
}

/// Pending undo actions, oldest first.
#[derive(Debug, Default)]
pub struct RestorationLedger {
    actions: Vec<UndoAction>,
}

impl RestorationLedger {
    /// An empty ledger.
    pub fn new() -> RestorationLedger {
        RestorationLedger::default()
    }

    /// Record an undo action for a step that just succeeded.
    pub fn push(&mut self, action: UndoAction) {
        trace!("ledger: {}", action);
        self.actions.push(action);
    }

    /// Pending actions, oldest first.
    pub fn actions(&self) -> &[UndoAction] {
        &self.actions
    }

    /// How many actions are pending?
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Is there anything to undo?
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Run and remove every pending action, newest first. Failures are
    /// logged, counted, and never stop the remaining actions.
    pub fn unwind<C, F>(
        &mut self,
        cluster: &C,
        tunnels: &mut TunnelManager<F>,
        progress: &mut dyn Progress,
    ) -> TeardownReport
    where
        C: Cluster + ?Sized,
        F: Forwarder,
    {
        let mut report = TeardownReport::default();
        while let Some(action) = self.actions.pop() {
            progress.item(&action.to_string());
            if let Err(err) = run_undo(&action, cluster, tunnels) {
                let err = err.context(SupplantError::RestoreFailed(action.to_string()));
                warn!("{}", err.display_causes_without_backtrace());
                progress.error(&err.display_causes_without_backtrace().to_string());
                report.failed += 1;
            }
            report.executed.push(action);
        }
        report
    }
}

fn run_undo<C, F>(action: &UndoAction, cluster: &C, tunnels: &mut TunnelManager<F>) -> Result<()>
where
    C: Cluster + ?Sized,
    F: Forwarder,
{
    match action {
        UndoAction::CloseTunnel { id, .. } => tunnels.close(*id),
        UndoAction::DeleteEndpoints { namespace, name } => {
            if !cluster.delete_endpoints(namespace, name)? {
                debug!("endpoints {}/{} were already gone", namespace, name);
            }
            Ok(())
        }
        UndoAction::RestoreService(snapshot) => snapshot.restore(cluster),
    }
}

#[test]
fn unwind_runs_actions_newest_first_and_survives_failures() {
    use crate::testing::{service, FakeCluster, FakeForwarder, RecordingProgress};

    let cluster = FakeCluster::new();
    let svc = service("ns", "api", &[("app", "api")], &[(80, "http")]);
    let mut tunnels = TunnelManager::new(FakeForwarder::new());
    let mut ledger = RestorationLedger::new();
    ledger.push(UndoAction::RestoreService(ServiceSnapshot::take(&svc)));
    ledger.push(UndoAction::DeleteEndpoints {
        namespace: "ns".to_owned(),
        name: "api".to_owned(),
    });
    // The restore will fail, because the fake refuses to create `api`.
    cluster.fail_creates_of("api");
    let pushed = ledger.actions().to_vec();

    let mut progress = RecordingProgress::default();
    let report = ledger.unwind(&cluster, &mut tunnels, &mut progress);

    let mut expected = pushed;
    expected.reverse();
    assert_eq!(report.executed, expected);
    assert_eq!(report.failed, 1);
    assert!(ledger.is_empty());
    assert_eq!(
        cluster.mutations(),
        vec!["delete endpoints ns/api", "delete service ns/api", "create service ns/api"],
    );
    assert!(progress.errors.iter().any(|e| e.contains("error restoring")));
}
