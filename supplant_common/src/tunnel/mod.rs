//! Local-to-remote port tunnels.
//!
//! A `Forwarder` knows how to start a tunnel to a pod. The `TunnelManager`
//! picks the pod, keeps every open `TunnelHandle`, waits for them all to
//! become ready, and closes them again at teardown. Tunnels are independent:
//! one failing in the background is logged and leaves the others running.

use crossbeam::channel::{self, Receiver, TryRecvError};

use crate::kubernetes::{Cluster, Pod};
use crate::prelude::*;

mod kubectl;

pub use self::kubectl::KubectlForwarder;

/// A local port forwarded to a remote port. A `local` of 0 means the
/// transport picks the local port.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PortPair {
    /// Local port.
    pub local: u16,
    /// Remote port.
    pub remote: u16,
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.local, self.remote)
    }
}

/// What a `Forwarder` should connect.
#[derive(Clone, Debug, PartialEq)]
pub struct ForwardRequest {
    /// Namespace of the service and pod.
    pub namespace: String,
    /// The service we are tunnelling to. Used for messages.
    pub service: String,
    /// The pod which will carry the traffic.
    pub pod: String,
    /// The local address to listen on.
    pub local_ip: IpAddr,
    /// The ports to forward.
    pub ports: Vec<PortPair>,
}

/// A running tunnel that can be shut down.
pub trait Tunnel: Send {
    /// Stop the tunnel. Called at most once per tunnel.
    fn close(&mut self) -> Result<()>;
}

/// Something that can start tunnels.
pub trait Forwarder {
    /// Start forwarding `request.ports`. This must not block until the tunnel
    /// is up: readiness is reported through the returned handle.
    fn forward(&self, request: &ForwardRequest) -> Result<TunnelHandle>;
}

/// A tunnel, its readiness signal, and the ports it carries.
pub struct TunnelHandle {
    /// Namespace of the service.
    pub namespace: String,
    /// Name of the service.
    pub name: String,
    /// The local address we listen on.
    pub local_ip: IpAddr,
    /// The forwarded ports. Once the tunnel is ready, local ports which were
    /// requested as 0 are replaced with the ports actually bound.
    pub ports: Vec<PortPair>,
    ready: Receiver<Vec<PortPair>>,
    is_ready: bool,
    tunnel: Box<dyn Tunnel>,
    closed: bool,
}

impl fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("local_ip", &self.local_ip)
            .field("ports", &self.ports)
            .field("is_ready", &self.is_ready)
            .field("closed", &self.closed)
            .finish()
    }
}

impl TunnelHandle {
    /// Wrap a started tunnel. `ready` should deliver the resolved port pairs
    /// exactly once, when the tunnel accepts local connections, and should be
    /// disconnected if the tunnel dies first.
    pub fn new(
        request: &ForwardRequest,
        ready: Receiver<Vec<PortPair>>,
        tunnel: Box<dyn Tunnel>,
    ) -> TunnelHandle {
        TunnelHandle {
            namespace: request.namespace.clone(),
            name: request.service.clone(),
            local_ip: request.local_ip,
            ports: request.ports.clone(),
            ready,
            is_ready: false,
            tunnel,
            closed: false,
        }
    }

    /// Has this tunnel reported that it is ready?
    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    /// A `namespace/name` string for messages.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Close this tunnel. Closing twice does nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.tunnel
            .close()
            .with_context(|| format!("error closing port forward {}", self.qualified_name()))
    }

    fn mark_ready(&mut self, ports: Vec<PortPair>) {
        self.ports = ports;
        self.is_ready = true;
    }

    fn setup_failed(&self) -> Error {
        SupplantError::TunnelSetupFailed {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
        .into()
    }
}

/// Identifies a tunnel owned by a `TunnelManager`.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TunnelId(usize);

/// The result of waiting for tunnels.
#[derive(Debug, Eq, PartialEq)]
pub enum Readiness {
    /// Every tunnel is accepting connections.
    Ready,
    /// The operator asked us to stop before every tunnel was ready.
    Interrupted,
}

/// Opens, waits for, and closes tunnels.
pub struct TunnelManager<F> {
    forwarder: F,
    tunnels: Vec<TunnelHandle>,
}

impl<F: Forwarder> TunnelManager<F> {
    /// Create a manager which starts tunnels using `forwarder`.
    pub fn new(forwarder: F) -> TunnelManager<F> {
        TunnelManager {
            forwarder,
            tunnels: vec![],
        }
    }

    /// Open a tunnel to a running pod backing `namespace/service`. Returns
    /// as soon as the tunnel is started; see `await_ready`.
    #[instrument(level = "debug", skip(self, cluster, ports), fields(ports = ports.len()))]
    pub fn open<C>(
        &mut self,
        cluster: &C,
        namespace: &str,
        service: &str,
        local_ip: IpAddr,
        ports: Vec<PortPair>,
    ) -> Result<TunnelId>
    where
        C: Cluster + ?Sized,
    {
        let pod = find_forwardable_pod(cluster, namespace, service)?;
        let request = ForwardRequest {
            namespace: namespace.to_owned(),
            service: service.to_owned(),
            pod: pod.metadata.name,
            local_ip,
            ports,
        };
        debug!("forwarding {}/{} via pod {}", namespace, service, request.pod);
        let handle = self.forwarder.forward(&request).map_err(|err| {
            err.context(SupplantError::TunnelSetupFailed {
                namespace: namespace.to_owned(),
                name: service.to_owned(),
            })
        })?;
        self.tunnels.push(handle);
        Ok(TunnelId(self.tunnels.len() - 1))
    }

    /// Block until every open tunnel is ready, or until `interrupt` fires.
    /// There is no timeout: a tunnel that never becomes ready blocks forever
    /// unless the operator interrupts.
    ///
    /// A tunnel that dies before it is ready is closed and handed to
    /// `on_failure` as a `TunnelSetupFailed` error. If `on_failure` returns
    /// the error, we stop waiting and return it. Otherwise we carry on
    /// waiting for the remaining tunnels.
    pub fn await_ready<H>(
        &mut self,
        interrupt: &Receiver<()>,
        mut on_failure: H,
    ) -> Result<Readiness>
    where
        H: FnMut(TunnelId, Error) -> Result<()>,
    {
        let pending = self
            .tunnels
            .iter_mut()
            .enumerate()
            .filter(|(_, h)| !h.is_ready && !h.closed);
        for (index, handle) in pending {
            // Check without blocking first, so that a tunnel which is already
            // up is never lost to a simultaneous interrupt.
            let ports = match handle.ready.try_recv() {
                Ok(ports) => Some(ports),
                Err(TryRecvError::Disconnected) => None,
                Err(TryRecvError::Empty) => channel::select! {
                    recv(handle.ready) -> ports => ports.ok(),
                    // A disconnected interrupt channel means nobody can ever
                    // stop us, so treat it like an interrupt.
                    recv(interrupt) -> _ => return Ok(Readiness::Interrupted),
                },
            };
            match ports {
                Some(ports) => {
                    info!("port forward {} is ready", handle.qualified_name());
                    handle.mark_ready(ports);
                }
                None => {
                    let err = handle.setup_failed();
                    if let Err(close_err) = handle.close() {
                        warn!("{}", close_err.display_causes_without_backtrace());
                    }
                    on_failure(TunnelId(index), err)?;
                }
            }
        }
        Ok(Readiness::Ready)
    }

    /// Close a tunnel. Closing an already-closed tunnel does nothing.
    pub fn close(&mut self, id: TunnelId) -> Result<()> {
        let handle = self
            .tunnels
            .get_mut(id.0)
            .ok_or_else(|| format_err!("no such tunnel {:?}", id))?;
        handle.close()
    }

    /// Look up a tunnel.
    pub fn handle(&self, id: TunnelId) -> Option<&TunnelHandle> {
        self.tunnels.get(id.0)
    }

    /// All tunnels we've opened, in order.
    pub fn handles(&self) -> &[TunnelHandle] {
        &self.tunnels
    }
}

/// Pick the pod we'll attach to: the first running pod selected by the
/// service.
fn find_forwardable_pod<C>(cluster: &C, namespace: &str, service: &str) -> Result<Pod>
where
    C: Cluster + ?Sized,
{
    let no_pod = || -> Error {
        SupplantError::NoPodFound {
            namespace: namespace.to_owned(),
            name: service.to_owned(),
        }
        .into()
    };
    let svc = cluster
        .service(namespace, service)?
        .ok_or_else(|| -> Error {
            SupplantError::ServiceNotFound {
                namespace: namespace.to_owned(),
                name: service.to_owned(),
            }
            .into()
        })?;
    if svc.spec.selector.is_empty() {
        return Err(no_pod());
    }
    cluster
        .pods(namespace, &svc.spec.selector)?
        .into_iter()
        .find(Pod::is_running)
        .ok_or_else(no_pod)
}

#[cfg(test)]
fn manager_fixture() -> (
    crate::testing::FakeCluster,
    crate::testing::FakeForwarder,
) {
    use crate::testing::{pod, service, FakeCluster, FakeForwarder};

    let cluster = FakeCluster::new();
    for &name in &["db", "cache"] {
        cluster.add_service(service("ns", name, &[("app", name)], &[(80, "http")]));
        cluster.add_pod(pod("ns", &format!("{}-1", name), &[("app", name)], &[("http", 8080)]));
    }
    (cluster, FakeForwarder::new())
}

#[cfg(test)]
fn localhost() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

#[test]
fn opened_tunnels_become_ready_with_resolved_ports() {
    let (cluster, forwarder) = manager_fixture();
    let mut manager = TunnelManager::new(forwarder);
    let id = manager
        .open(&cluster, "ns", "db", localhost(), vec![PortPair { local: 0, remote: 8080 }])
        .expect("open failed");
    let (_tx, interrupt) = channel::unbounded();
    assert_eq!(
        manager.await_ready(&interrupt, |_, err| Err(err)).expect("wait"),
        Readiness::Ready
    );
    let handle = manager.handle(id).expect("handle");
    assert!(handle.is_ready());
    assert_ne!(handle.ports[0].local, 0);
    assert_eq!(handle.ports[0].remote, 8080);
}

#[test]
fn tunnel_to_service_without_running_pod_fails() {
    use crate::testing::service;

    let (cluster, forwarder) = manager_fixture();
    cluster.add_service(service("ns", "idle", &[("app", "idle")], &[(80, "http")]));
    let mut manager = TunnelManager::new(forwarder);
    let err = manager
        .open(&cluster, "ns", "idle", localhost(), vec![PortPair { local: 0, remote: 80 }])
        .unwrap_err();
    assert!(matches!(
        crate::errors::supplant_error(&err),
        Some(SupplantError::NoPodFound { .. })
    ));
}

#[test]
fn transport_errors_are_setup_failures() {
    let (cluster, forwarder) = manager_fixture();
    forwarder.fail("cache");
    let mut manager = TunnelManager::new(forwarder);
    let err = manager
        .open(&cluster, "ns", "cache", localhost(), vec![PortPair { local: 0, remote: 80 }])
        .unwrap_err();
    assert!(matches!(
        crate::errors::supplant_error(&err),
        Some(SupplantError::TunnelSetupFailed { .. })
    ));
}

#[test]
fn a_tunnel_that_never_becomes_ready_blocks_until_interrupted() {
    let (cluster, forwarder) = manager_fixture();
    forwarder.never_ready("cache");
    let mut manager = TunnelManager::new(forwarder);
    let db = manager
        .open(&cluster, "ns", "db", localhost(), vec![PortPair { local: 0, remote: 80 }])
        .expect("open db");
    let cache = manager
        .open(&cluster, "ns", "cache", localhost(), vec![PortPair { local: 0, remote: 80 }])
        .expect("open cache");

    let (tx, interrupt) = channel::unbounded();
    tx.send(()).expect("send");
    assert_eq!(
        manager.await_ready(&interrupt, |_, err| Err(err)).expect("wait"),
        Readiness::Interrupted
    );
    // `db` was usable all along; only `cache` held us up.
    assert!(manager.handle(db).expect("db").is_ready());
    assert!(!manager.handle(cache).expect("cache").is_ready());
}

#[test]
fn a_tunnel_that_dies_before_ready_does_not_hold_up_the_others() {
    let (cluster, forwarder) = manager_fixture();
    forwarder.die_before_ready("db");
    let log = forwarder.log();
    let mut manager = TunnelManager::new(forwarder);
    let db = manager
        .open(&cluster, "ns", "db", localhost(), vec![PortPair { local: 0, remote: 80 }])
        .expect("open db");
    let cache = manager
        .open(&cluster, "ns", "cache", localhost(), vec![PortPair { local: 0, remote: 80 }])
        .expect("open cache");

    let (_tx, interrupt) = channel::unbounded();
    let mut failed = vec![];
    let readiness = manager
        .await_ready(&interrupt, |id, err| {
            assert!(matches!(
                crate::errors::supplant_error(&err),
                Some(SupplantError::TunnelSetupFailed { .. })
            ));
            failed.push(id);
            Ok(())
        })
        .expect("wait");
    assert_eq!(readiness, Readiness::Ready);
    assert_eq!(failed, vec![db]);
    assert!(manager.handle(cache).expect("cache").is_ready());
    assert!(!manager.handle(db).expect("db").is_ready());
    assert!(log.lock().expect("lock").contains(&"close ns/db".to_owned()));

    // Waiting again doesn't report the dead tunnel twice.
    manager
        .await_ready(&interrupt, |_, err| Err(err))
        .expect("wait again");
}

#[test]
fn a_tunnel_that_dies_before_ready_can_stop_the_wait() {
    let (cluster, forwarder) = manager_fixture();
    forwarder.die_before_ready("db");
    let mut manager = TunnelManager::new(forwarder);
    manager
        .open(&cluster, "ns", "db", localhost(), vec![PortPair { local: 0, remote: 80 }])
        .expect("open db");
    let (_tx, interrupt) = channel::unbounded();
    let err = manager.await_ready(&interrupt, |_, err| Err(err)).unwrap_err();
    assert!(matches!(
        crate::errors::supplant_error(&err),
        Some(SupplantError::TunnelSetupFailed { .. })
    ));
}

#[test]
fn closing_is_idempotent() {
    let (cluster, forwarder) = manager_fixture();
    let log = forwarder.log();
    let mut manager = TunnelManager::new(forwarder);
    let id = manager
        .open(&cluster, "ns", "db", localhost(), vec![PortPair { local: 0, remote: 80 }])
        .expect("open failed");
    manager.close(id).expect("close");
    manager.close(id).expect("close again");
    let closes = log
        .lock()
        .expect("lock")
        .iter()
        .filter(|line| line.starts_with("close"))
        .count();
    assert_eq!(closes, 1);
}
