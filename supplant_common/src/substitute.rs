//! Pointing a cluster service at this machine, and putting it back.
//!
//! Substituting a service means:
//!
//! 1. Choosing concrete local ports, so we can tell the developer where to
//!    listen before we touch anything.
//! 2. Fetching and validating the live service.
//! 3. Snapshotting it, and recording a "restore" action in the ledger
//!    **before** changing anything.
//! 4. Recreating it with no selector and with target ports that point at the
//!    local ports.
//! 5. Replacing its endpoints with a manual one pointing at our IP, and
//!    recording a "delete endpoints" action.
//!
//! We recreate the service rather than updating it in place. Dropping the
//! selector from a live service leaves the cluster load-balancing across the
//! old pods and our endpoint for a while.

use crate::config::SubstitutionSpec;
use crate::kubernetes::{Cluster, EndpointPort, Endpoints, IntOrString, Service, ServicePort};
use crate::ledger::{RestorationLedger, UndoAction};
use crate::marker::apply_marker;
use crate::net::allocate_local_port;
use crate::prelude::*;
use crate::tunnel::PortPair;

/// Operator-facing progress output.
pub trait Progress {
    /// A top-level step, such as "updating service api".
    fn header(&mut self, message: &str);
    /// A detail line under the last header.
    fn item(&mut self, message: &str);
    /// A standalone notice.
    fn info(&mut self, message: &str);
    /// Something went wrong but we're carrying on.
    fn error(&mut self, message: &str);
}

/// A copy of a service taken before we changed it. Only used to restore it.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceSnapshot {
    service: Service,
}

impl ServiceSnapshot {
    /// Snapshot `service` exactly as the API server returned it.
    pub fn take(service: &Service) -> ServiceSnapshot {
        ServiceSnapshot {
            service: service.clone(),
        }
    }

    /// The service as it was.
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Replace whatever is in the cluster now with the snapshot. The API
    /// server treats the result as a brand new object, so the endpoints
    /// controller rebuilds its endpoints from the restored selector.
    #[instrument(level = "debug", skip(self, cluster), fields(service = %self.service.qualified_name()))]
    pub fn restore<C>(&self, cluster: &C) -> Result<()>
    where
        C: Cluster + ?Sized,
    {
        let meta = &self.service.metadata;
        cluster
            .delete_service(&meta.namespace, &meta.name)
            .with_context(|| format!("error deleting service {}", self.service.qualified_name()))?;
        let mut original = self.service.clone();
        original.prepare_for_creation();
        cluster
            .create_service(&original)
            .with_context(|| format!("error recreating service {}", self.service.qualified_name()))
    }
}

/// A service that now sends its traffic to us.
#[derive(Clone, Debug, PartialEq)]
pub struct Substitution {
    /// Namespace of the service.
    pub namespace: String,
    /// Name of the service.
    pub name: String,
    /// The address the cluster connects to.
    pub external_ip: IpAddr,
    /// Local ports paired with the service ports they replace.
    pub ports: Vec<PortPair>,
}

/// Substitutes services, one at a time.
pub struct SubstitutionEngine<'a, C: ?Sized> {
    cluster: &'a C,
    external_ip: IpAddr,
}

impl<'a, C> SubstitutionEngine<'a, C>
where
    C: Cluster + ?Sized,
{
    /// Substitute services in `cluster`, pointing them at `external_ip`.
    pub fn new(cluster: &'a C, external_ip: IpAddr) -> SubstitutionEngine<'a, C> {
        SubstitutionEngine {
            cluster,
            external_ip,
        }
    }

    /// Substitute the service described by `spec`. Unset local ports in
    /// `spec` are filled in.
    ///
    /// Every change to the cluster has its undo action in `ledger` before
    /// the next change is attempted, so an error part way through leaves
    /// `ledger` describing exactly what needs to be put back.
    #[instrument(level = "debug", skip_all, fields(service = %format!("{}/{}", spec.namespace, spec.name)))]
    pub fn substitute(
        &self,
        spec: &mut SubstitutionSpec,
        ledger: &mut RestorationLedger,
        progress: &mut dyn Progress,
    ) -> Result<Substitution> {
        allocate_local_ports(spec)?;

        let live = self
            .cluster
            .service(&spec.namespace, &spec.name)?
            .ok_or_else(|| SupplantError::ServiceNotFound {
                namespace: spec.namespace.clone(),
                name: spec.name.clone(),
            })?;
        validate(spec, &live)?;

        progress.header(&format!("updating service {}", spec.name));
        for port in &spec.ports {
            progress.item(&format!(
                "{}:{} is now the endpoint for {}:{}",
                self.external_ip, port.local_port, spec.name, port.port,
            ));
        }

        ledger.push(UndoAction::RestoreService(ServiceSnapshot::take(&live)));

        let replacement = substitute_service(&live, spec);
        if self
            .cluster
            .delete_service(&spec.namespace, &spec.name)
            .with_context(|| format!("error deleting existing service {}", spec.name))?
        {
            debug!("deleted service {}", live.qualified_name());
        }
        self.cluster
            .create_service(&replacement)
            .with_context(|| format!("error updating service {}", spec.name))?;

        if self
            .cluster
            .delete_endpoints(&spec.namespace, &spec.name)
            .with_context(|| format!("error deleting endpoints {}", spec.name))?
        {
            debug!("deleted endpoints {}", live.qualified_name());
        }
        let endpoints = substitute_endpoints(&live, spec, self.external_ip);
        self.cluster
            .create_endpoints(&endpoints)
            .with_context(|| format!("error creating endpoints {}", spec.name))?;
        ledger.push(UndoAction::DeleteEndpoints {
            namespace: spec.namespace.clone(),
            name: spec.name.clone(),
        });

        info!("substituted {}", live.qualified_name());
        Ok(Substitution {
            namespace: spec.namespace.clone(),
            name: spec.name.clone(),
            external_ip: self.external_ip,
            ports: spec
                .ports
                .iter()
                .map(|p| PortPair {
                    local: p.local_port,
                    remote: p.port,
                })
                .collect(),
        })
    }
}

/// Replace every unset local port in `spec` with a free one.
pub fn allocate_local_ports(spec: &mut SubstitutionSpec) -> Result<()> {
    for port in spec.ports.iter_mut().filter(|p| p.local_port == 0) {
        port.local_port = allocate_local_port()?;
        debug!(
            "allocated local port {} for {}/{}:{}",
            port.local_port, spec.namespace, spec.name, port.port,
        );
    }
    Ok(())
}

/// Check that `spec` fits the live service.
fn validate(spec: &SubstitutionSpec, live: &Service) -> Result<()> {
    for port in &spec.ports {
        if live.port(port.port).is_none() {
            return Err(SupplantError::PortMismatch {
                namespace: spec.namespace.clone(),
                name: spec.name.clone(),
                port: port.port,
            }
            .into());
        }
    }
    if live.spec.selector.is_empty() {
        return Err(SupplantError::NoSelector {
            namespace: spec.namespace.clone(),
            name: spec.name.clone(),
        }
        .into());
    }
    Ok(())
}

/// Build the selector-less replacement for `live`. Each configured port keeps
/// its number, name and protocol, but targets the local port.
pub fn substitute_service(live: &Service, spec: &SubstitutionSpec) -> Service {
    let mut svc = live.clone();
    svc.prepare_for_creation();
    svc.spec.selector.clear();
    svc.spec.ports = spec
        .ports
        .iter()
        .filter_map(|mapping| {
            let declared = live.port(mapping.port)?;
            Some(ServicePort {
                name: declared.name.clone(),
                protocol: declared.protocol,
                port: mapping.port,
                target_port: Some(IntOrString::Int(mapping.local_port)),
                ..ServicePort::default()
            })
        })
        .collect();
    apply_marker(&mut svc.metadata);
    svc
}

/// Build the manual endpoint pointing `live` at `ip`.
pub fn substitute_endpoints(live: &Service, spec: &SubstitutionSpec, ip: IpAddr) -> Endpoints {
    let ports = spec
        .ports
        .iter()
        .map(|mapping| {
            let declared = live.port(mapping.port);
            EndpointPort {
                name: declared.and_then(|p| p.name.clone()),
                port: mapping.local_port,
                protocol: declared.map(|p| p.protocol).unwrap_or_default(),
            }
        })
        .collect();
    let mut endpoints = Endpoints::single_address(
        &live.metadata.namespace,
        &live.metadata.name,
        ip,
        ports,
    );
    apply_marker(&mut endpoints.metadata);
    endpoints
}

#[cfg(test)]
fn spec(remote: u16, local: u16) -> SubstitutionSpec {
    use crate::config::PortMapping;
    use crate::kubernetes::Protocol;

    SubstitutionSpec {
        namespace: "ns".to_owned(),
        name: "api".to_owned(),
        enabled: true,
        ports: vec![PortMapping {
            name: None,
            protocol: Protocol::Tcp,
            port: remote,
            local_port: local,
        }],
    }
}

#[cfg(test)]
fn external_ip() -> IpAddr {
    IpAddr::from([10, 1, 2, 3])
}

#[test]
fn substitute_redirects_service_to_local_port() {
    use crate::marker::has_marker;
    use crate::testing::{service, FakeCluster, NoProgress};

    let cluster = FakeCluster::new();
    cluster.add_service(service("ns", "api", &[("app", "api")], &[(80, "http")]));
    let engine = SubstitutionEngine::new(&cluster, external_ip());
    let mut ledger = RestorationLedger::new();
    let mut spec = spec(80, 0);

    let sub = engine
        .substitute(&mut spec, &mut ledger, &mut NoProgress)
        .expect("substitute failed");

    let local = spec.ports[0].local_port;
    assert!(local >= 1024);
    assert_eq!(sub.ports, vec![PortPair { local, remote: 80 }]);

    let svc = cluster.get_service("ns", "api").expect("service is gone");
    assert!(svc.spec.selector.is_empty());
    assert_eq!(svc.spec.ports.len(), 1);
    assert_eq!(svc.spec.ports[0].port, 80);
    assert_eq!(svc.spec.ports[0].target_port, Some(IntOrString::Int(local)));
    assert!(has_marker(&svc.metadata));

    let ep = cluster.get_endpoints("ns", "api").expect("no endpoints");
    assert_eq!(ep.subsets.len(), 1);
    assert_eq!(ep.subsets[0].addresses.len(), 1);
    assert_eq!(ep.subsets[0].addresses[0].ip, "10.1.2.3");
    assert_eq!(ep.subsets[0].ports[0].port, local);
    assert_eq!(ep.subsets[0].ports[0].name.as_deref(), Some("http"));
    assert!(has_marker(&ep.metadata));

    assert_eq!(ledger.len(), 2);
    assert!(matches!(ledger.actions()[0], UndoAction::RestoreService(_)));
    assert!(matches!(ledger.actions()[1], UndoAction::DeleteEndpoints { .. }));
}

#[test]
fn port_mismatch_changes_nothing() {
    use crate::testing::{service, FakeCluster, NoProgress};

    let cluster = FakeCluster::new();
    cluster.add_service(service("ns", "api", &[("app", "api")], &[(80, "http")]));
    let engine = SubstitutionEngine::new(&cluster, external_ip());
    let mut ledger = RestorationLedger::new();

    let err = engine
        .substitute(&mut spec(81, 9000), &mut ledger, &mut NoProgress)
        .unwrap_err();
    assert!(matches!(
        crate::errors::supplant_error(&err),
        Some(SupplantError::PortMismatch { port: 81, .. })
    ));
    assert!(ledger.is_empty());
    assert!(cluster.mutations().is_empty());
}

#[test]
fn selectorless_service_is_rejected() {
    use crate::testing::{service, FakeCluster, NoProgress};

    let cluster = FakeCluster::new();
    cluster.add_service(service("ns", "api", &[], &[(80, "http")]));
    let engine = SubstitutionEngine::new(&cluster, external_ip());
    let mut ledger = RestorationLedger::new();

    let err = engine
        .substitute(&mut spec(80, 9000), &mut ledger, &mut NoProgress)
        .unwrap_err();
    assert!(matches!(
        crate::errors::supplant_error(&err),
        Some(SupplantError::NoSelector { .. })
    ));
    assert!(ledger.is_empty());
}

#[test]
fn missing_service_is_reported() {
    use crate::testing::{FakeCluster, NoProgress};

    let cluster = FakeCluster::new();
    let engine = SubstitutionEngine::new(&cluster, external_ip());
    let mut ledger = RestorationLedger::new();
    let err = engine
        .substitute(&mut spec(80, 9000), &mut ledger, &mut NoProgress)
        .unwrap_err();
    assert!(matches!(
        crate::errors::supplant_error(&err),
        Some(SupplantError::ServiceNotFound { .. })
    ));
}

#[test]
fn failed_recreate_still_leaves_restore_in_ledger() {
    use crate::testing::{service, FakeCluster, NoProgress};

    let cluster = FakeCluster::new();
    cluster.add_service(service("ns", "api", &[("app", "api")], &[(80, "http")]));
    cluster.fail_creates_of("api");
    let engine = SubstitutionEngine::new(&cluster, external_ip());
    let mut ledger = RestorationLedger::new();

    engine
        .substitute(&mut spec(80, 9000), &mut ledger, &mut NoProgress)
        .unwrap_err();
    assert_eq!(ledger.len(), 1);
    assert!(matches!(ledger.actions()[0], UndoAction::RestoreService(_)));
}

#[test]
fn restore_puts_back_the_snapshot() {
    use crate::testing::{service, FakeCluster};

    let cluster = FakeCluster::new();
    let original = service("ns", "api", &[("app", "api")], &[(80, "http")]);
    cluster.add_service(original.clone());
    let live = cluster.get_service("ns", "api").expect("service");
    let snapshot = ServiceSnapshot::take(&live);

    cluster.delete_service("ns", "api").expect("delete");
    cluster
        .create_service(&substitute_service(&live, &spec(80, 9000)))
        .expect("create");

    snapshot.restore(&cluster).expect("restore");
    let restored = cluster.get_service("ns", "api").expect("service");
    assert_eq!(restored.spec.selector, original.spec.selector);
    assert_eq!(restored.spec.ports, original.spec.ports);
    assert_ne!(restored.metadata.uid, live.metadata.uid);
}
