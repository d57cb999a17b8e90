//! Resolving a service's named target ports to container port numbers.

use crate::kubernetes::{Cluster, IntOrString, Service};
use crate::prelude::*;

/// Resolves symbolic target ports by inspecting the pods behind a service.
///
/// Results are cached per `(namespace, name)` for the life of the process.
/// We assume a service does not change its named ports mid-run.
#[derive(Debug, Default)]
pub struct PortResolver {
    cache: HashMap<(String, String), HashMap<String, u16>>,
}

impl PortResolver {
    /// Create a resolver with an empty cache.
    pub fn new() -> PortResolver {
        PortResolver::default()
    }

    /// Resolve `port` for `service`. Numeric ports are returned as-is
    /// without talking to the cluster.
    pub fn resolve<C>(
        &mut self,
        cluster: &C,
        service: &Service,
        port: &IntOrString,
    ) -> Result<u16>
    where
        C: Cluster + ?Sized,
    {
        let name = match port {
            IntOrString::Int(port) => return Ok(*port),
            IntOrString::String(name) => name,
        };

        let key = (
            service.metadata.namespace.clone(),
            service.metadata.name.clone(),
        );
        if let Some(&cached) = self.cache.get(&key).and_then(|ports| ports.get(name)) {
            return Ok(cached);
        }

        let pods = cluster
            .pods(&service.metadata.namespace, &service.spec.selector)
            .map_err(|err| {
                err.context(SupplantError::LookupFailed {
                    namespace: key.0.clone(),
                    name: key.1.clone(),
                    port: name.clone(),
                })
            })?;
        let resolved = pods
            .iter()
            .find_map(|pod| pod.named_port(name))
            .ok_or_else(|| SupplantError::PortNotFound {
                namespace: key.0.clone(),
                name: key.1.clone(),
                port: name.clone(),
            })?;
        debug!(
            "resolved port {} of {} to {}",
            name,
            service.qualified_name(),
            resolved
        );
        self.cache
            .entry(key)
            .or_default()
            .insert(name.clone(), resolved);
        Ok(resolved)
    }
}

#[cfg(test)]
fn fixture() -> (crate::testing::FakeCluster, Service) {
    use crate::testing::{pod, service, FakeCluster};

    let cluster = FakeCluster::new();
    let svc = service("ns", "api", &[("app", "api")], &[(80, "http")]);
    cluster.add_service(svc.clone());
    cluster.add_pod(pod("ns", "api-1", &[("app", "api")], &[("http", 8080)]));
    (cluster, svc)
}

#[test]
fn numeric_ports_need_no_lookup() {
    let (cluster, svc) = fixture();
    let mut resolver = PortResolver::new();
    let port = resolver
        .resolve(&cluster, &svc, &IntOrString::Int(9000))
        .expect("resolve failed");
    assert_eq!(port, 9000);
    assert_eq!(cluster.pod_queries(), 0);
}

#[test]
fn named_ports_are_resolved_once_per_service() {
    let (cluster, svc) = fixture();
    let mut resolver = PortResolver::new();
    let http = IntOrString::String("http".to_owned());
    assert_eq!(resolver.resolve(&cluster, &svc, &http).expect("resolve"), 8080);
    assert_eq!(resolver.resolve(&cluster, &svc, &http).expect("resolve"), 8080);
    assert_eq!(cluster.pod_queries(), 1);
}

#[test]
fn missing_named_port_is_reported() {
    let (cluster, svc) = fixture();
    let mut resolver = PortResolver::new();
    let err = resolver
        .resolve(&cluster, &svc, &IntOrString::String("grpc".to_owned()))
        .unwrap_err();
    assert!(matches!(
        crate::errors::supplant_error(&err),
        Some(SupplantError::PortNotFound { .. })
    ));
}

#[test]
fn failed_pod_query_is_reported() {
    let (cluster, svc) = fixture();
    cluster.fail_pod_queries();
    let mut resolver = PortResolver::new();
    let err = resolver
        .resolve(&cluster, &svc, &IntOrString::String("http".to_owned()))
        .unwrap_err();
    assert!(matches!(
        crate::errors::supplant_error(&err),
        Some(SupplantError::LookupFailed { .. })
    ));
}
