//! Driving a whole run: set everything up, wait, then put everything back.
//!
//! A run moves through `Setup → AwaitReady → Active → Teardown → Done`. The
//! `RestorationLedger` is owned here and only touched from this thread, so
//! the order things were done in is exactly the reverse of the order they
//! are undone in.

use crossbeam::channel::Receiver;

use crate::config::{Config, ExternalAccessSpec};
use crate::kubernetes::Cluster;
use crate::ledger::{RestorationLedger, TeardownReport, UndoAction};
use crate::marker::{marked_services, sweep_marked_endpoints};
use crate::prelude::*;
use crate::substitute::{Progress, Substitution, SubstitutionEngine};
use crate::tunnel::{Forwarder, PortPair, Readiness, TunnelId, TunnelManager};

/// Where a run is.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Substituting services and opening tunnels.
    Setup,
    /// Waiting for tunnels to accept connections.
    AwaitReady,
    /// Everything is up; waiting for the operator to stop us.
    Active,
    /// Undoing everything.
    Teardown,
    /// Finished.
    Done,
}

/// What to do when one configured entry can't be set up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryFailurePolicy {
    /// Log the failure and carry on with the other entries.
    Continue,
    /// Tear down everything done so far and fail the run.
    Abort,
}

impl Default for EntryFailurePolicy {
    fn default() -> Self {
        EntryFailurePolicy::Continue
    }
}

/// Per-run settings.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// The address the cluster should send substituted traffic to.
    pub external_ip: IpAddr,
    /// The address tunnels listen on.
    pub local_ip: IpAddr,
    /// What to do when an entry fails.
    pub policy: EntryFailurePolicy,
}

/// What `Setup` managed to do.
#[derive(Clone, Debug, Default)]
pub struct SetupSummary {
    /// Services now pointing at us.
    pub substituted: Vec<Substitution>,
    /// Tunnels we opened.
    pub tunnels: Vec<TunnelId>,
    /// Entries that failed and were skipped.
    pub failures: usize,
    /// The ledger as it stood when setup finished, oldest first.
    pub undo_plan: Vec<UndoAction>,
}

impl SetupSummary {
    /// Did setup change anything worth waiting on?
    pub fn did_anything(&self) -> bool {
        !self.substituted.is_empty() || !self.tunnels.is_empty()
    }
}

/// How a run ended.
#[derive(Debug)]
pub enum RunOutcome {
    /// Nothing was enabled, or nothing enabled could be set up. We never
    /// became `Active`.
    NothingToDo {
        /// Cleanup of anything failed entries left behind.
        teardown: TeardownReport,
    },
    /// We ran until interrupted and then tore everything down.
    Completed {
        /// What setup did.
        setup: SetupSummary,
        /// What teardown did.
        teardown: TeardownReport,
    },
}

/// Runs one configuration against one cluster.
pub struct Coordinator<'a, C: ?Sized, F> {
    cluster: &'a C,
    tunnels: TunnelManager<F>,
    ledger: RestorationLedger,
    options: RunOptions,
    phases: Vec<Phase>,
}

impl<'a, C, F> Coordinator<'a, C, F>
where
    C: Cluster + ?Sized,
    F: Forwarder,
{
    /// Prepare a run against `cluster`, opening tunnels with `forwarder`.
    pub fn new(cluster: &'a C, forwarder: F, options: RunOptions) -> Coordinator<'a, C, F> {
        Coordinator {
            cluster,
            tunnels: TunnelManager::new(forwarder),
            ledger: RestorationLedger::new(),
            options,
            phases: vec![],
        }
    }

    /// Every phase we've entered, in order.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    fn enter(&mut self, phase: Phase) {
        debug!("entering {:?}", phase);
        self.phases.push(phase);
    }

    /// Run `config` from start to finish, returning once the operator has
    /// sent something on `interrupt` and everything has been restored.
    ///
    /// Any error returned here is returned only after `Teardown` has undone
    /// whatever was already done.
    pub fn run(
        &mut self,
        config: &mut Config,
        interrupt: &Receiver<()>,
        progress: &mut dyn Progress,
    ) -> Result<RunOutcome> {
        config.validate()?;
        if !config.has_enabled_entries() {
            self.enter(Phase::Done);
            return Ok(RunOutcome::NothingToDo {
                teardown: TeardownReport::default(),
            });
        }

        let mut setup = match self.setup(config, progress) {
            Ok(setup) => setup,
            Err(err) => {
                self.teardown(progress);
                return Err(err);
            }
        };
        if !setup.did_anything() {
            warn!("nothing was set up");
            let teardown = self.teardown(progress);
            return Ok(RunOutcome::NothingToDo { teardown });
        }

        match self.await_ready(interrupt, &mut setup, progress) {
            Ok(Readiness::Ready) => self.wait_for_interrupt(interrupt, progress),
            Ok(Readiness::Interrupted) => info!("interrupted before every tunnel was ready"),
            Err(err) => {
                self.teardown(progress);
                return Err(err);
            }
        }

        let teardown = self.teardown(progress);
        Ok(RunOutcome::Completed { setup, teardown })
    }

    /// Substitute every enabled service, then open every enabled tunnel.
    /// Each step's undo action is in the ledger before the next step starts.
    pub fn setup(
        &mut self,
        config: &mut Config,
        progress: &mut dyn Progress,
    ) -> Result<SetupSummary> {
        self.enter(Phase::Setup);
        let mut summary = SetupSummary::default();

        let engine = SubstitutionEngine::new(self.cluster, self.options.external_ip);
        for spec in config.supplant.iter_mut().filter(|s| s.enabled) {
            match engine.substitute(spec, &mut self.ledger, progress) {
                Ok(substitution) => summary.substituted.push(substitution),
                Err(err) => self.entry_failed(err, &mut summary, progress)?,
            }
        }

        for spec in config.external.iter().filter(|s| s.enabled) {
            match self.open_external(spec, progress) {
                Ok(id) => summary.tunnels.push(id),
                Err(err) => self.entry_failed(err, &mut summary, progress)?,
            }
        }

        summary.undo_plan = self.ledger.actions().to_vec();
        Ok(summary)
    }

    fn entry_failed(
        &self,
        err: Error,
        summary: &mut SetupSummary,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        match self.options.policy {
            EntryFailurePolicy::Abort => Err(err),
            EntryFailurePolicy::Continue => {
                skip_entry(&err, summary, progress);
                Ok(())
            }
        }
    }

    fn open_external(
        &mut self,
        spec: &ExternalAccessSpec,
        progress: &mut dyn Progress,
    ) -> Result<TunnelId> {
        progress.header(&format!("forwarding ports for {}", spec.name));
        let ports = spec
            .ports
            .iter()
            .map(|p| PortPair {
                local: p.local_port,
                remote: p.target_port,
            })
            .collect();
        let id = self.tunnels.open(
            self.cluster,
            &spec.namespace,
            &spec.name,
            self.options.local_ip,
            ports,
        )?;
        self.ledger.push(UndoAction::CloseTunnel {
            id,
            namespace: spec.namespace.clone(),
            name: spec.name.clone(),
        });
        Ok(id)
    }

    /// Wait until every tunnel is ready, then report where each one
    /// listens. Gives up early if `interrupt` fires.
    ///
    /// A tunnel that dies before it is ready is an entry failure like any
    /// other: under `Continue` it is dropped from `summary` and we keep
    /// waiting for the rest. If that leaves nothing running at all, the last
    /// tunnel's error is returned.
    pub fn await_ready(
        &mut self,
        interrupt: &Receiver<()>,
        summary: &mut SetupSummary,
        progress: &mut dyn Progress,
    ) -> Result<Readiness> {
        self.enter(Phase::AwaitReady);
        let policy = self.options.policy;
        let mut last_failure = None;
        let readiness = self.tunnels.await_ready(interrupt, |id, err| {
            summary.tunnels.retain(|t| *t != id);
            match policy {
                EntryFailurePolicy::Abort => Err(err),
                EntryFailurePolicy::Continue => {
                    skip_entry(&err, summary, progress);
                    last_failure = Some(err);
                    Ok(())
                }
            }
        })?;
        if let Some(err) = last_failure {
            if !summary.did_anything() {
                return Err(err.context("no tunnel or substitution is left running"));
            }
        }

        if readiness == Readiness::Ready {
            for handle in self.tunnels.handles().iter().filter(|h| h.is_ready()) {
                for pair in &handle.ports {
                    progress.item(&format!(
                        "forwarding {}:{} -> {}:{}",
                        handle.local_ip, pair.local, handle.name, pair.remote,
                    ));
                }
            }
        }
        Ok(readiness)
    }

    fn wait_for_interrupt(&mut self, interrupt: &Receiver<()>, progress: &mut dyn Progress) {
        self.enter(Phase::Active);
        progress.info("press Ctrl-C to stop and restore the cluster");
        // A disconnected channel can never deliver, so treat it as a stop.
        let _ = interrupt.recv();
        info!("stopping");
    }

    /// Undo everything in the ledger, newest first, then sweep up any
    /// substitute endpoints left over from earlier runs. Never fails:
    /// problems are logged and counted in the report.
    pub fn teardown(&mut self, progress: &mut dyn Progress) -> TeardownReport {
        self.enter(Phase::Teardown);
        if !self.ledger.is_empty() {
            progress.header("restoring cluster");
        }
        let mut report = self.ledger.unwind(self.cluster, &mut self.tunnels, progress);

        match sweep_marked_endpoints(self.cluster) {
            Ok(swept) => report.swept = swept,
            Err(err) => warn!(
                "could not sweep substitute endpoints: {}",
                err.display_causes_without_backtrace(),
            ),
        }
        match marked_services(self.cluster) {
            Ok(services) => {
                for svc in services {
                    let msg = format!(
                        "service {} still points at a local machine and must be restored by hand",
                        svc.qualified_name(),
                    );
                    warn!("{}", msg);
                    progress.error(&msg);
                }
            }
            Err(err) => warn!(
                "could not check for substituted services: {}",
                err.display_causes_without_backtrace(),
            ),
        }

        self.enter(Phase::Done);
        report
    }
}

/// Log a failed entry, and count it as skipped.
fn skip_entry(err: &Error, summary: &mut SetupSummary, progress: &mut dyn Progress) {
    error!("{}", err.display_causes_without_backtrace());
    progress.error(&err.to_string());
    summary.failures += 1;
}

#[cfg(test)]
fn options(policy: EntryFailurePolicy) -> RunOptions {
    RunOptions {
        external_ip: IpAddr::from([10, 1, 2, 3]),
        local_ip: IpAddr::from([127, 0, 0, 1]),
        policy,
    }
}

#[cfg(test)]
fn cluster_fixture() -> crate::testing::FakeCluster {
    use crate::testing::{pod, service, FakeCluster};

    let cluster = FakeCluster::new();
    cluster.add_service(service("ns", "api", &[("app", "api")], &[(80, "http")]));
    cluster.add_service(service("ns", "db", &[("app", "db")], &[(5432, "pg")]));
    cluster.add_pod(pod("ns", "db-1", &[("app", "db")], &[("pg", 5432)]));
    cluster
}

#[cfg(test)]
fn interrupted() -> Receiver<()> {
    let (tx, rx) = crossbeam::channel::unbounded();
    tx.send(()).expect("send");
    rx
}

#[test]
fn substituted_service_is_restored_after_teardown() {
    use crate::kubernetes::IntOrString;
    use crate::testing::{FakeForwarder, NoProgress};

    let cluster = cluster_fixture();
    let before = cluster.get_service("ns", "api").expect("api");
    let mut config = Config::from_yaml_str(
        r#"
supplant:
  - namespace: ns
    name: api
    enabled: true
    ports:
      - port: 80
"#,
    )
    .expect("config");
    let mut coordinator = Coordinator::new(
        &cluster,
        FakeForwarder::new(),
        options(EntryFailurePolicy::Continue),
    );

    let setup = coordinator.setup(&mut config, &mut NoProgress).expect("setup");
    let local = config.supplant[0].ports[0].local_port;
    assert_ne!(local, 0);
    assert_eq!(setup.substituted.len(), 1);
    let during = cluster.get_service("ns", "api").expect("api");
    assert!(during.spec.selector.is_empty());
    assert_eq!(during.spec.ports[0].target_port, Some(IntOrString::Int(local)));
    let ep = cluster.get_endpoints("ns", "api").expect("endpoints");
    assert_eq!(ep.subsets[0].ports[0].port, local);

    let report = coordinator.teardown(&mut NoProgress);
    assert_eq!(report.failed, 0);
    let after = cluster.get_service("ns", "api").expect("api");
    assert_eq!(after.spec.selector, before.spec.selector);
    assert_eq!(after.spec.ports, before.spec.ports);
    assert!(cluster.get_endpoints("ns", "api").is_none());
}

#[test]
fn teardown_is_the_reverse_of_setup() {
    use crate::testing::{FakeForwarder, NoProgress};

    let cluster = cluster_fixture();
    let forwarder = FakeForwarder::new();
    let log = forwarder.log();
    let mut config = Config::from_yaml_str(
        r#"
supplant:
  - namespace: ns
    name: api
    enabled: true
    ports:
      - port: 80
external:
  - namespace: ns
    name: db
    enabled: true
    ports:
      - target_port: 5432
"#,
    )
    .expect("config");
    let mut coordinator =
        Coordinator::new(&cluster, forwarder, options(EntryFailurePolicy::Continue));

    let outcome = coordinator
        .run(&mut config, &interrupted(), &mut NoProgress)
        .expect("run");
    let (setup, teardown) = match outcome {
        RunOutcome::Completed { setup, teardown } => (setup, teardown),
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(setup.undo_plan.len(), 3);
    let mut reversed = setup.undo_plan.clone();
    reversed.reverse();
    assert_eq!(teardown.executed, reversed);
    assert!(matches!(teardown.executed[0], UndoAction::CloseTunnel { .. }));
    assert_eq!(
        coordinator.phases(),
        &[
            Phase::Setup,
            Phase::AwaitReady,
            Phase::Active,
            Phase::Teardown,
            Phase::Done,
        ]
    );
    assert!(log.lock().expect("lock").contains(&"close ns/db".to_owned()));
}

#[test]
fn nothing_enabled_means_nothing_to_do() {
    use crate::testing::{FakeForwarder, NoProgress};

    let cluster = cluster_fixture();
    let mut config = Config::from_yaml_str(
        r#"
supplant:
  - namespace: ns
    name: api
    ports:
      - port: 80
"#,
    )
    .expect("config");
    let interrupt = interrupted();
    let mut coordinator = Coordinator::new(
        &cluster,
        FakeForwarder::new(),
        options(EntryFailurePolicy::Continue),
    );

    let outcome = coordinator
        .run(&mut config, &interrupt, &mut NoProgress)
        .expect("run");
    assert!(matches!(outcome, RunOutcome::NothingToDo { .. }));
    assert!(cluster.mutations().is_empty());
    assert!(!coordinator.phases().contains(&Phase::Active));
    // We never waited, so the interrupt is still pending.
    assert!(interrupt.try_recv().is_ok());
}

#[test]
fn port_mismatch_skips_only_that_entry() {
    use crate::testing::{FakeForwarder, RecordingProgress};

    let cluster = cluster_fixture();
    let before = cluster.get_service("ns", "api").expect("api");
    let mut config = Config::from_yaml_str(
        r#"
supplant:
  - namespace: ns
    name: api
    enabled: true
    ports:
      - port: 81
  - namespace: ns
    name: db
    enabled: true
    ports:
      - port: 5432
"#,
    )
    .expect("config");
    let mut coordinator = Coordinator::new(
        &cluster,
        FakeForwarder::new(),
        options(EntryFailurePolicy::Continue),
    );

    let mut progress = RecordingProgress::default();
    let setup = coordinator.setup(&mut config, &mut progress).expect("setup");
    assert_eq!(setup.failures, 1);
    assert_eq!(setup.substituted.len(), 1);
    assert_eq!(setup.substituted[0].name, "db");
    assert!(setup.undo_plan.iter().all(|action| match action {
        UndoAction::RestoreService(snapshot) => snapshot.service().metadata.name == "db",
        UndoAction::DeleteEndpoints { name, .. } => name == "db",
        UndoAction::CloseTunnel { .. } => false,
    }));
    assert_eq!(cluster.get_service("ns", "api"), Some(before));
    assert!(progress.errors[0].contains("port 81"));
    coordinator.teardown(&mut progress);
}

#[test]
fn abort_policy_restores_earlier_entries_and_fails() {
    use crate::testing::{FakeForwarder, NoProgress};

    let cluster = cluster_fixture();
    let db_before = cluster.get_service("ns", "db").expect("db");
    let mut config = Config::from_yaml_str(
        r#"
supplant:
  - namespace: ns
    name: db
    enabled: true
    ports:
      - port: 5432
  - namespace: ns
    name: api
    enabled: true
    ports:
      - port: 81
"#,
    )
    .expect("config");
    let interrupt = interrupted();
    let mut coordinator =
        Coordinator::new(&cluster, FakeForwarder::new(), options(EntryFailurePolicy::Abort));

    let err = coordinator
        .run(&mut config, &interrupt, &mut NoProgress)
        .unwrap_err();
    assert!(matches!(
        crate::errors::supplant_error(&err),
        Some(SupplantError::PortMismatch { port: 81, .. })
    ));
    let db_after = cluster.get_service("ns", "db").expect("db");
    assert_eq!(db_after.spec.selector, db_before.spec.selector);
    assert!(cluster.get_endpoints("ns", "db").is_none());
    assert!(!coordinator.phases().contains(&Phase::Active));
}

#[test]
fn entries_that_all_fail_leave_nothing_to_do() {
    use crate::testing::{FakeForwarder, NoProgress};

    let cluster = cluster_fixture();
    let mut config = Config::from_yaml_str(
        r#"
supplant:
  - namespace: ns
    name: api
    enabled: true
    ports:
      - port: 81
"#,
    )
    .expect("config");
    let mut coordinator = Coordinator::new(
        &cluster,
        FakeForwarder::new(),
        options(EntryFailurePolicy::Continue),
    );

    let outcome = coordinator
        .run(&mut config, &interrupted(), &mut NoProgress)
        .expect("run");
    match outcome {
        RunOutcome::NothingToDo { teardown } => assert!(teardown.executed.is_empty()),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(cluster.mutations().is_empty());
}

#[test]
fn interrupt_while_awaiting_readiness_still_tears_down() {
    use crate::testing::{pod, service, FakeForwarder, NoProgress};

    let cluster = cluster_fixture();
    cluster.add_service(service("ns", "cache", &[("app", "cache")], &[(6379, "redis")]));
    cluster.add_pod(pod("ns", "cache-1", &[("app", "cache")], &[("redis", 6379)]));
    let forwarder = FakeForwarder::new();
    forwarder.never_ready("cache");
    let log = forwarder.log();
    let mut config = Config::from_yaml_str(
        r#"
external:
  - namespace: ns
    name: db
    enabled: true
    ports:
      - target_port: 5432
  - namespace: ns
    name: cache
    enabled: true
    ports:
      - target_port: 6379
"#,
    )
    .expect("config");
    let mut coordinator =
        Coordinator::new(&cluster, forwarder, options(EntryFailurePolicy::Continue));

    let outcome = coordinator
        .run(&mut config, &interrupted(), &mut NoProgress)
        .expect("run");
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert!(!coordinator.phases().contains(&Phase::Active));
    let log = log.lock().expect("lock");
    assert!(log.contains(&"close ns/cache".to_owned()));
    assert!(log.contains(&"close ns/db".to_owned()));
}

#[test]
fn teardown_sweeps_endpoints_left_by_a_crashed_run() {
    use crate::kubernetes::{EndpointPort, Endpoints, Protocol};
    use crate::marker::apply_marker;
    use crate::testing::{FakeForwarder, NoProgress};

    let cluster = cluster_fixture();
    let mut orphan = Endpoints::single_address(
        "other",
        "old",
        IpAddr::from([10, 9, 9, 9]),
        vec![EndpointPort {
            name: None,
            port: 9000,
            protocol: Protocol::Tcp,
        }],
    );
    apply_marker(&mut orphan.metadata);
    cluster.add_endpoints(orphan);

    let mut config = Config::from_yaml_str(
        r#"
supplant:
  - namespace: ns
    name: api
    enabled: true
    ports:
      - port: 80
"#,
    )
    .expect("config");
    let mut coordinator = Coordinator::new(
        &cluster,
        FakeForwarder::new(),
        options(EntryFailurePolicy::Continue),
    );
    coordinator.setup(&mut config, &mut NoProgress).expect("setup");
    let report = coordinator.teardown(&mut NoProgress);
    assert_eq!(report.swept, 1);
    assert!(cluster.get_endpoints("other", "old").is_none());

    // A second sweep finds nothing.
    assert_eq!(sweep_marked_endpoints(&cluster).expect("sweep"), 0);
}

#[cfg(test)]
const SUBSTITUTE_API_AND_TUNNEL_DB_AND_CACHE: &str = r#"
supplant:
  - namespace: ns
    name: api
    enabled: true
    ports:
      - port: 80
external:
  - namespace: ns
    name: db
    enabled: true
    ports:
      - target_port: 5432
  - namespace: ns
    name: cache
    enabled: true
    ports:
      - target_port: 6379
"#;

#[cfg(test)]
fn cluster_with_cache() -> crate::testing::FakeCluster {
    use crate::testing::{pod, service};

    let cluster = cluster_fixture();
    cluster.add_service(service("ns", "cache", &[("app", "cache")], &[(6379, "redis")]));
    cluster.add_pod(pod("ns", "cache-1", &[("app", "cache")], &[("redis", 6379)]));
    cluster
}

#[test]
fn a_dead_tunnel_is_skipped_under_continue() {
    use crate::testing::{FakeForwarder, RecordingProgress};

    let cluster = cluster_with_cache();
    let before = cluster.get_service("ns", "api").expect("api");
    let forwarder = FakeForwarder::new();
    forwarder.die_before_ready("cache");
    let log = forwarder.log();
    let mut config =
        Config::from_yaml_str(SUBSTITUTE_API_AND_TUNNEL_DB_AND_CACHE).expect("config");
    let mut coordinator =
        Coordinator::new(&cluster, forwarder, options(EntryFailurePolicy::Continue));
    let mut progress = RecordingProgress::default();

    let outcome = coordinator
        .run(&mut config, &interrupted(), &mut progress)
        .expect("run");
    let setup = match outcome {
        RunOutcome::Completed { setup, .. } => setup,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(setup.failures, 1);
    assert_eq!(setup.substituted.len(), 1);
    assert_eq!(setup.tunnels.len(), 1);
    assert!(coordinator.phases().contains(&Phase::Active));
    assert!(progress.errors.iter().any(|e| e.contains("cache")));
    assert!(log.lock().expect("lock").contains(&"close ns/cache".to_owned()));
    let after = cluster.get_service("ns", "api").expect("api");
    assert_eq!(after.spec.selector, before.spec.selector);
}

#[test]
fn substitutions_outlive_a_dead_tunnel_until_teardown() {
    use crate::testing::{FakeForwarder, NoProgress};

    let cluster = cluster_with_cache();
    let forwarder = FakeForwarder::new();
    forwarder.die_before_ready("cache");
    let mut config =
        Config::from_yaml_str(SUBSTITUTE_API_AND_TUNNEL_DB_AND_CACHE).expect("config");
    let (_tx, interrupt) = crossbeam::channel::unbounded();
    let mut coordinator =
        Coordinator::new(&cluster, forwarder, options(EntryFailurePolicy::Continue));

    let mut setup = coordinator.setup(&mut config, &mut NoProgress).expect("setup");
    let readiness = coordinator
        .await_ready(&interrupt, &mut setup, &mut NoProgress)
        .expect("await");
    assert_eq!(readiness, Readiness::Ready);
    let during = cluster.get_service("ns", "api").expect("api");
    assert!(during.spec.selector.is_empty());
    assert!(cluster.get_endpoints("ns", "api").is_some());

    let report = coordinator.teardown(&mut NoProgress);
    assert_eq!(report.failed, 0);
    assert!(!cluster.get_service("ns", "api").expect("api").spec.selector.is_empty());
    assert!(cluster.get_endpoints("ns", "api").is_none());
}

#[test]
fn a_dead_tunnel_fails_the_run_under_abort() {
    use crate::testing::{FakeForwarder, NoProgress};

    let cluster = cluster_with_cache();
    let before = cluster.get_service("ns", "api").expect("api");
    let forwarder = FakeForwarder::new();
    forwarder.die_before_ready("cache");
    let mut config =
        Config::from_yaml_str(SUBSTITUTE_API_AND_TUNNEL_DB_AND_CACHE).expect("config");
    let mut coordinator =
        Coordinator::new(&cluster, forwarder, options(EntryFailurePolicy::Abort));

    let err = coordinator
        .run(&mut config, &interrupted(), &mut NoProgress)
        .unwrap_err();
    assert!(matches!(
        crate::errors::supplant_error(&err),
        Some(SupplantError::TunnelSetupFailed { name, .. }) if name == "cache"
    ));
    assert!(!coordinator.phases().contains(&Phase::Active));
    assert_eq!(coordinator.phases().last(), Some(&Phase::Done));
    let after = cluster.get_service("ns", "api").expect("api");
    assert_eq!(after.spec.selector, before.spec.selector);
}

#[test]
fn a_run_whose_only_tunnel_dies_fails() {
    use crate::testing::{FakeForwarder, NoProgress};

    let cluster = cluster_with_cache();
    let forwarder = FakeForwarder::new();
    forwarder.die_before_ready("cache");
    let mut config = Config::from_yaml_str(
        r#"
external:
  - namespace: ns
    name: cache
    enabled: true
    ports:
      - target_port: 6379
"#,
    )
    .expect("config");
    let mut coordinator =
        Coordinator::new(&cluster, forwarder, options(EntryFailurePolicy::Continue));

    let err = coordinator
        .run(&mut config, &interrupted(), &mut NoProgress)
        .unwrap_err();
    assert!(matches!(
        crate::errors::supplant_error(&err),
        Some(SupplantError::TunnelSetupFailed { .. })
    ));
    assert!(!coordinator.phases().contains(&Phase::Active));
}
