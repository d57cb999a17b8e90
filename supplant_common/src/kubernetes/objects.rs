//! Just enough of the Kubernetes object model to rewrite services and
//! endpoints, and to find the pods behind them.
//!
//! Every type keeps the fields we don't model in a flattened `rest` map. A
//! snapshot taken with `Clone` therefore contains the whole object as the
//! API server returned it, and can be sent back verbatim.

use serde_json::{Map, Value};

use crate::prelude::*;

/// Object fields we don't model explicitly.
pub type Extra = Map<String, Value>;

fn default_api_version() -> String {
    "v1".to_owned()
}

/// A network protocol for a port.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Protocol {
    /// TCP, the only protocol `kubectl port-forward` supports.
    #[serde(rename = "TCP")]
    Tcp,
    /// UDP.
    #[serde(rename = "UDP")]
    Udp,
    /// SCTP.
    #[serde(rename = "SCTP")]
    Sctp,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Tcp
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Sctp => write!(f, "SCTP"),
        }
    }
}

/// A port given either as a number or as the name of a container port.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum IntOrString {
    /// A numeric port.
    Int(u16),
    /// A named container port.
    String(String),
}

impl fmt::Display for IntOrString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntOrString::Int(port) => write!(f, "{}", port),
            IntOrString::String(name) => write!(f, "{}", name),
        }
    }
}

/// Standard object metadata.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name.
    pub name: String,
    /// Object namespace.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Revision marker used for optimistic concurrency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// Server-assigned identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Server-assigned creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    /// Everything else.
    #[serde(flatten)]
    pub rest: Extra,
}

impl ObjectMeta {
    /// Metadata for a new object called `name` in `namespace`.
    pub fn named(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            ..ObjectMeta::default()
        }
    }

    /// Clear everything the API server assigns when an object is created.
    fn clear_identity(&mut self) {
        self.resource_version = None;
        self.uid = None;
        self.creation_timestamp = None;
        for key in &["managedFields", "generation", "selfLink"] {
            self.rest.remove(*key);
        }
    }
}

/// A Kubernetes `Service`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// API version.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Object kind.
    #[serde(default = "Service::default_kind")]
    pub kind: String,
    /// Metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    #[serde(default)]
    pub spec: ServiceSpec,
    /// Everything else, including `status`.
    #[serde(flatten)]
    pub rest: Extra,
}

impl Service {
    fn default_kind() -> String {
        "Service".to_owned()
    }

    /// A new, empty service.
    pub fn new(namespace: &str, name: &str) -> Service {
        Service {
            api_version: default_api_version(),
            kind: Service::default_kind(),
            metadata: ObjectMeta::named(namespace, name),
            spec: ServiceSpec::default(),
            rest: Extra::new(),
        }
    }

    /// Clear the fields the API server fills in, so that this object can be
    /// used to create a brand new service. A headless service keeps its
    /// `clusterIP: None`.
    pub fn prepare_for_creation(&mut self) {
        self.metadata.clear_identity();
        self.rest.remove("status");
        if self.spec.cluster_ip.as_deref() != Some("None") {
            self.spec.cluster_ip = None;
            self.spec.cluster_ips = None;
        }
    }

    /// Look up a declared port by its externally-visible number.
    pub fn port(&self, port: u16) -> Option<&ServicePort> {
        self.spec.ports.iter().find(|p| p.port == port)
    }

    /// A `namespace/name` string for messages.
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.metadata.namespace, self.metadata.name)
    }
}

/// The desired state of a `Service`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Pods matching these labels receive the service's traffic.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
    /// Declared ports, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,
    /// Allocated cluster IP.
    #[serde(rename = "clusterIP", default, skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    /// Allocated cluster IPs.
    #[serde(rename = "clusterIPs", default, skip_serializing_if = "Option::is_none")]
    pub cluster_ips: Option<Vec<String>>,
    /// Everything else.
    #[serde(flatten)]
    pub rest: Extra,
}

/// A port declared by a `Service`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    /// Port name, required when a service has more than one port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Protocol.
    #[serde(default)]
    pub protocol: Protocol,
    /// The port clients connect to.
    pub port: u16,
    /// The port on the backend. Defaults to `port` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<IntOrString>,
    /// Everything else, such as `nodePort`.
    #[serde(flatten)]
    pub rest: Extra,
}

impl ServicePort {
    /// The backend port, applying the Kubernetes default.
    pub fn effective_target_port(&self) -> IntOrString {
        self.target_port
            .clone()
            .unwrap_or(IntOrString::Int(self.port))
    }
}

/// A Kubernetes `Endpoints` object.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    /// API version.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Object kind.
    #[serde(default = "Endpoints::default_kind")]
    pub kind: String,
    /// Metadata.
    pub metadata: ObjectMeta,
    /// Address and port groups.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsets: Vec<EndpointSubset>,
}

impl Endpoints {
    fn default_kind() -> String {
        "Endpoints".to_owned()
    }

    /// A manual endpoint with a single address.
    pub fn single_address(
        namespace: &str,
        name: &str,
        ip: IpAddr,
        ports: Vec<EndpointPort>,
    ) -> Endpoints {
        Endpoints {
            api_version: default_api_version(),
            kind: Endpoints::default_kind(),
            metadata: ObjectMeta::named(namespace, name),
            subsets: vec![EndpointSubset {
                addresses: vec![EndpointAddress { ip: ip.to_string() }],
                ports,
            }],
        }
    }
}

/// A set of addresses which all expose the same ports.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EndpointSubset {
    /// Addresses.
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    /// Ports.
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

/// One endpoint address.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EndpointAddress {
    /// IP address.
    pub ip: String,
}

/// One endpoint port. The name must match the corresponding service port.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EndpointPort {
    /// Port name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Port number.
    pub port: u16,
    /// Protocol.
    #[serde(default)]
    pub protocol: Protocol,
}

/// A Kubernetes `Pod`, reduced to what we need to find ports.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Pod {
    /// Metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    #[serde(default)]
    pub spec: PodSpec,
    /// Observed state.
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    /// Is this pod running?
    pub fn is_running(&self) -> bool {
        self.status.phase.as_deref() == Some("Running")
    }

    /// Find a container port by name.
    pub fn named_port(&self, name: &str) -> Option<u16> {
        self.spec
            .containers
            .iter()
            .flat_map(|c| c.ports.iter())
            .find(|p| p.name.as_deref() == Some(name))
            .map(|p| p.container_port)
    }
}

/// Pod specification.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PodSpec {
    /// Containers.
    #[serde(default)]
    pub containers: Vec<Container>,
}

/// A container in a pod.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Container {
    /// Container name.
    pub name: String,
    /// Declared ports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ContainerPort>,
}

/// A port declared by a container.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    /// Port name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Port number.
    pub container_port: u16,
    /// Protocol.
    #[serde(default)]
    pub protocol: Protocol,
}

/// Pod status.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PodStatus {
    /// `Pending`, `Running`, `Succeeded`, `Failed` or `Unknown`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// A `kind: List` response from `kubectl get -o json`.
#[derive(Debug, Deserialize)]
pub struct List<T> {
    /// The returned objects.
    #[serde(bound(deserialize = "T: Deserialize<'de>"))]
    pub items: Vec<T>,
}

#[test]
fn service_snapshot_keeps_unmodelled_fields() {
    let json = r#"{
      "apiVersion": "v1",
      "kind": "Service",
      "metadata": {
        "name": "api",
        "namespace": "ns",
        "labels": { "app": "api" },
        "resourceVersion": "1234",
        "uid": "0b5c5f9e",
        "creationTimestamp": "2024-01-01T00:00:00Z",
        "managedFields": []
      },
      "spec": {
        "selector": { "app": "api" },
        "ports": [
          { "name": "http", "protocol": "TCP", "port": 80, "targetPort": "http", "nodePort": 30080 }
        ],
        "clusterIP": "10.0.0.12",
        "clusterIPs": ["10.0.0.12"],
        "type": "NodePort",
        "sessionAffinity": "None"
      },
      "status": { "loadBalancer": {} }
    }"#;
    let svc: Service = serde_json::from_str(json).expect("parse error");
    assert_eq!(svc.qualified_name(), "ns/api");
    assert_eq!(
        svc.spec.ports[0].target_port,
        Some(IntOrString::String("http".to_owned()))
    );
    assert_eq!(svc.spec.ports[0].rest["nodePort"], 30080);
    assert_eq!(svc.spec.rest["type"], "NodePort");

    let reparsed: Service =
        serde_json::from_value(serde_json::to_value(&svc).expect("serialize error"))
            .expect("reparse error");
    assert_eq!(reparsed, svc);

    let mut fresh = svc.clone();
    fresh.prepare_for_creation();
    assert_eq!(fresh.metadata.resource_version, None);
    assert_eq!(fresh.metadata.uid, None);
    assert_eq!(fresh.metadata.creation_timestamp, None);
    assert!(!fresh.metadata.rest.contains_key("managedFields"));
    assert!(!fresh.rest.contains_key("status"));
    assert_eq!(fresh.spec.cluster_ip, None);
    assert_eq!(fresh.spec.selector, svc.spec.selector);
    assert_eq!(fresh.spec.ports, svc.spec.ports);
}

#[test]
fn headless_service_stays_headless() {
    let mut svc = Service::new("ns", "db");
    svc.spec.cluster_ip = Some("None".to_owned());
    svc.prepare_for_creation();
    assert_eq!(svc.spec.cluster_ip.as_deref(), Some("None"));
}

#[test]
fn pod_named_port_lookup() {
    let json = r#"{
      "metadata": { "name": "api-5d9c", "namespace": "ns" },
      "spec": { "containers": [
        { "name": "sidecar" },
        { "name": "api", "ports": [ { "name": "http", "containerPort": 8080 } ] }
      ] },
      "status": { "phase": "Running" }
    }"#;
    let pod: Pod = serde_json::from_str(json).expect("parse error");
    assert!(pod.is_running());
    assert_eq!(pod.named_port("http"), Some(8080));
    assert_eq!(pod.named_port("grpc"), None);
}
