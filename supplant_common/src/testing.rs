//! In-memory stand-ins for the cluster, the tunnel transport and the console.

use crossbeam::channel::{self, Sender};
use std::{
    cell::{Cell, RefCell},
    collections::BTreeSet,
    sync::{Arc, Mutex},
};

use crate::kubernetes::{
    Cluster, Container, ContainerPort, Endpoints, IntOrString, ObjectMeta, Pod, PodSpec,
    PodStatus, Protocol, Service, ServicePort,
};
use crate::prelude::*;
use crate::substitute::Progress;
use crate::tunnel::{ForwardRequest, Forwarder, PortPair, Tunnel, TunnelHandle};

fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

/// A service whose ports target container ports of the same name.
pub fn service(
    namespace: &str,
    name: &str,
    selector: &[(&str, &str)],
    ports: &[(u16, &str)],
) -> Service {
    let mut svc = Service::new(namespace, name);
    svc.spec.selector = labels(selector);
    svc.spec.ports = ports
        .iter()
        .map(|(port, port_name)| ServicePort {
            name: Some((*port_name).to_owned()),
            protocol: Protocol::Tcp,
            port: *port,
            target_port: Some(IntOrString::String((*port_name).to_owned())),
            ..ServicePort::default()
        })
        .collect();
    svc
}

/// A running pod with one container declaring `ports`.
pub fn pod(namespace: &str, name: &str, pod_labels: &[(&str, &str)], ports: &[(&str, u16)]) -> Pod {
    let mut metadata = ObjectMeta::named(namespace, name);
    metadata.labels = labels(pod_labels);
    Pod {
        metadata,
        spec: PodSpec {
            containers: vec![Container {
                name: "main".to_owned(),
                ports: ports
                    .iter()
                    .map(|(port_name, port)| ContainerPort {
                        name: Some((*port_name).to_owned()),
                        container_port: *port,
                        protocol: Protocol::Tcp,
                    })
                    .collect(),
            }],
        },
        status: PodStatus {
            phase: Some("Running".to_owned()),
        },
    }
}

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_owned(), name.to_owned())
}

/// Does `labels` satisfy a `k=v,k=v` selector?
fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
            None => false,
        })
}

/// A cluster that keeps its objects in memory and acts like the API server
/// where it matters to us.
#[derive(Debug, Default)]
pub struct FakeCluster {
    services: RefCell<BTreeMap<Key, Service>>,
    endpoints: RefCell<BTreeMap<Key, Endpoints>>,
    pods: RefCell<Vec<Pod>>,
    next_uid: Cell<usize>,
    pod_queries: Cell<usize>,
    fail_pod_queries: Cell<bool>,
    fail_creates_of: RefCell<BTreeSet<String>>,
    mutations: RefCell<Vec<String>>,
}

impl FakeCluster {
    /// An empty cluster.
    pub fn new() -> FakeCluster {
        FakeCluster::default()
    }

    /// Fill in what the API server assigns on creation.
    fn admit(&self, svc: &mut Service) {
        let uid = self.next_uid.get() + 1;
        self.next_uid.set(uid);
        svc.metadata.uid = Some(format!("uid-{}", uid));
        svc.metadata.resource_version = Some(uid.to_string());
        if svc.spec.cluster_ip.is_none() {
            svc.spec.cluster_ip = Some(format!("10.96.0.{}", uid));
        }
    }

    /// Add a service without recording a mutation.
    pub fn add_service(&self, mut svc: Service) {
        self.admit(&mut svc);
        self.services
            .borrow_mut()
            .insert(key(&svc.metadata.namespace, &svc.metadata.name), svc);
    }

    /// Add an endpoints object without recording a mutation.
    pub fn add_endpoints(&self, endpoints: Endpoints) {
        self.endpoints.borrow_mut().insert(
            key(&endpoints.metadata.namespace, &endpoints.metadata.name),
            endpoints,
        );
    }

    /// Add a pod.
    pub fn add_pod(&self, pod: Pod) {
        self.pods.borrow_mut().push(pod);
    }

    /// The current state of a service.
    pub fn get_service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.services.borrow().get(&key(namespace, name)).cloned()
    }

    /// The current state of an endpoints object.
    pub fn get_endpoints(&self, namespace: &str, name: &str) -> Option<Endpoints> {
        self.endpoints.borrow().get(&key(namespace, name)).cloned()
    }

    /// How many times `pods` has been called.
    pub fn pod_queries(&self) -> usize {
        self.pod_queries.get()
    }

    /// Make every later `pods` call fail.
    pub fn fail_pod_queries(&self) {
        self.fail_pod_queries.set(true);
    }

    /// Make every later attempt to create a service or endpoints called
    /// `name` fail.
    pub fn fail_creates_of(&self, name: &str) {
        self.fail_creates_of.borrow_mut().insert(name.to_owned());
    }

    /// Every mutating call attempted so far, including failed ones.
    pub fn mutations(&self) -> Vec<String> {
        self.mutations.borrow().clone()
    }

    fn record(&self, what: &str, namespace: &str, name: &str) {
        self.mutations
            .borrow_mut()
            .push(format!("{} {}/{}", what, namespace, name));
    }

    fn check_create(&self, name: &str) -> Result<()> {
        if self.fail_creates_of.borrow().contains(name) {
            return Err(format_err!("injected failure creating {}", name));
        }
        Ok(())
    }
}

impl Cluster for FakeCluster {
    fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.get_service(namespace, name))
    }

    fn services(&self, namespace: Option<&str>) -> Result<Vec<Service>> {
        Ok(self
            .services
            .borrow()
            .values()
            .filter(|svc| namespace.map_or(true, |ns| svc.metadata.namespace == ns))
            .cloned()
            .collect())
    }

    fn services_matching(&self, label_selector: &str) -> Result<Vec<Service>> {
        Ok(self
            .services
            .borrow()
            .values()
            .filter(|svc| matches_selector(&svc.metadata.labels, label_selector))
            .cloned()
            .collect())
    }

    fn create_service(&self, service: &Service) -> Result<()> {
        let meta = &service.metadata;
        self.record("create service", &meta.namespace, &meta.name);
        self.check_create(&meta.name)?;
        let k = key(&meta.namespace, &meta.name);
        if self.services.borrow().contains_key(&k) {
            return Err(format_err!("service {}/{} already exists", k.0, k.1));
        }
        if meta.uid.is_some() || meta.resource_version.is_some() {
            return Err(format_err!("cannot create a service with a uid"));
        }
        let mut svc = service.clone();
        self.admit(&mut svc);
        self.services.borrow_mut().insert(k, svc);
        Ok(())
    }

    fn delete_service(&self, namespace: &str, name: &str) -> Result<bool> {
        self.record("delete service", namespace, name);
        Ok(self.services.borrow_mut().remove(&key(namespace, name)).is_some())
    }

    fn endpoints_matching(&self, label_selector: &str) -> Result<Vec<Endpoints>> {
        Ok(self
            .endpoints
            .borrow()
            .values()
            .filter(|ep| matches_selector(&ep.metadata.labels, label_selector))
            .cloned()
            .collect())
    }

    fn create_endpoints(&self, endpoints: &Endpoints) -> Result<()> {
        let meta = &endpoints.metadata;
        self.record("create endpoints", &meta.namespace, &meta.name);
        self.check_create(&meta.name)?;
        let k = key(&meta.namespace, &meta.name);
        if self.endpoints.borrow().contains_key(&k) {
            return Err(format_err!("endpoints {}/{} already exist", k.0, k.1));
        }
        self.endpoints.borrow_mut().insert(k, endpoints.clone());
        Ok(())
    }

    fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<bool> {
        self.record("delete endpoints", namespace, name);
        Ok(self
            .endpoints
            .borrow_mut()
            .remove(&key(namespace, name))
            .is_some())
    }

    fn pods(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<Pod>> {
        self.pod_queries.set(self.pod_queries.get() + 1);
        if self.fail_pod_queries.get() {
            return Err(format_err!("injected failure listing pods"));
        }
        Ok(self
            .pods
            .borrow()
            .iter()
            .filter(|pod| {
                pod.metadata.namespace == namespace
                    && selector
                        .iter()
                        .all(|(k, v)| pod.metadata.labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }
}

/// A forwarder whose tunnels are ready immediately, unless told otherwise.
/// Unset local ports become `30000 + remote`, wrapping for high ports.
#[derive(Clone, Debug, Default)]
pub struct FakeForwarder {
    log: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<BTreeSet<String>>>,
    stuck: Arc<Mutex<BTreeSet<String>>>,
    dying: Arc<Mutex<BTreeSet<String>>>,
}

impl FakeForwarder {
    /// A forwarder where everything works.
    pub fn new() -> FakeForwarder {
        FakeForwarder::default()
    }

    /// Everything this forwarder and its tunnels have done.
    pub fn log(&self) -> Arc<Mutex<Vec<String>>> {
        self.log.clone()
    }

    /// Refuse to forward to `service`.
    pub fn fail(&self, service: &str) {
        self.failing
            .lock()
            .expect("lock poisoned")
            .insert(service.to_owned());
    }

    /// Start tunnels to `service`, but never report them ready.
    pub fn never_ready(&self, service: &str) {
        self.stuck
            .lock()
            .expect("lock poisoned")
            .insert(service.to_owned());
    }

    /// Start tunnels to `service` that exit before they are ready, like a
    /// `kubectl port-forward` whose local port is taken.
    pub fn die_before_ready(&self, service: &str) {
        self.dying
            .lock()
            .expect("lock poisoned")
            .insert(service.to_owned());
    }
}

/// The local port a fake tunnel binds when asked for any port.
fn fake_local_port(remote: u16) -> u16 {
    remote.wrapping_add(30000).max(1024)
}

impl Forwarder for FakeForwarder {
    fn forward(&self, request: &ForwardRequest) -> Result<TunnelHandle> {
        let label = format!("{}/{}", request.namespace, request.service);
        self.log
            .lock()
            .expect("lock poisoned")
            .push(format!("forward {} via {}", label, request.pod));
        if self
            .failing
            .lock()
            .expect("lock poisoned")
            .contains(&request.service)
        {
            return Err(format_err!("injected failure forwarding {}", label));
        }

        let (tx, rx) = channel::bounded(1);
        let keep_alive = if self
            .dying
            .lock()
            .expect("lock poisoned")
            .contains(&request.service)
        {
            drop(tx);
            None
        } else if self
            .stuck
            .lock()
            .expect("lock poisoned")
            .contains(&request.service)
        {
            Some(tx)
        } else {
            let ports = request
                .ports
                .iter()
                .map(|p| PortPair {
                    local: if p.local == 0 {
                        fake_local_port(p.remote)
                    } else {
                        p.local
                    },
                    remote: p.remote,
                })
                .collect();
            tx.send(ports).expect("send");
            None
        };
        let tunnel = FakeTunnel {
            label,
            log: self.log.clone(),
            _keep_alive: keep_alive,
        };
        Ok(TunnelHandle::new(request, rx, Box::new(tunnel)))
    }
}

struct FakeTunnel {
    label: String,
    log: Arc<Mutex<Vec<String>>>,
    _keep_alive: Option<Sender<Vec<PortPair>>>,
}

impl Tunnel for FakeTunnel {
    fn close(&mut self) -> Result<()> {
        self.log
            .lock()
            .expect("lock poisoned")
            .push(format!("close {}", self.label));
        Ok(())
    }
}

/// Discards progress output.
pub struct NoProgress;

impl Progress for NoProgress {
    fn header(&mut self, _message: &str) {}
    fn item(&mut self, _message: &str) {}
    fn info(&mut self, _message: &str) {}
    fn error(&mut self, _message: &str) {}
}

/// Keeps progress output for inspection.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    pub headers: Vec<String>,
    pub items: Vec<String>,
    pub infos: Vec<String>,
    pub errors: Vec<String>,
}

impl Progress for RecordingProgress {
    fn header(&mut self, message: &str) {
        self.headers.push(message.to_owned());
    }

    fn item(&mut self, message: &str) {
        self.items.push(message.to_owned());
    }

    fn info(&mut self, message: &str) {
        self.infos.push(message.to_owned());
    }

    fn error(&mut self, message: &str) {
        self.errors.push(message.to_owned());
    }
}

#[test]
fn label_selectors_match_subsets() {
    let l = labels(&[("app", "api"), ("supplant", "true")]);
    assert!(matches_selector(&l, "supplant=true"));
    assert!(matches_selector(&l, "app=api,supplant=true"));
    assert!(!matches_selector(&l, "app=db"));
}

#[test]
fn fake_local_ports_stay_in_range_for_high_remote_ports() {
    assert_eq!(fake_local_port(80), 30080);
    assert_eq!(fake_local_port(40000), 4464);
    assert!(fake_local_port(u16::MAX) >= 1024);
}
