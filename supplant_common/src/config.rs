//! The configuration file, which says which services to substitute and which
//! to tunnel to.
//!
//! The file is YAML. `supplant config create` writes a template with every
//! entry disabled, the developer enables what they need, and `supplant run`
//! reads it back. The orchestrator itself never writes it.

use std::collections::HashSet;
use std::fs;

use crate::kubernetes::{Cluster, Protocol, Service};
use crate::port_lookup::PortResolver;
use crate::prelude::*;

/// A complete configuration file.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Services to replace with a local process.
    #[serde(default)]
    pub supplant: Vec<SubstitutionSpec>,
    /// Services to make reachable from this machine.
    #[serde(default)]
    pub external: Vec<ExternalAccessSpec>,
}

/// A cluster service whose traffic should be sent to this machine.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SubstitutionSpec {
    /// Namespace of the service.
    pub namespace: String,
    /// Name of the service.
    pub name: String,
    /// Disabled entries are ignored entirely.
    #[serde(default)]
    pub enabled: bool,
    /// The ports to take over.
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

/// One port of a substituted service.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PortMapping {
    /// The service port's declared name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Protocol. Only TCP can be enabled.
    #[serde(default)]
    pub protocol: Protocol,
    /// The service port. Must be one the service currently declares.
    pub port: u16,
    /// The local port the developer's process listens on. `0` means "pick
    /// a free one when we start".
    #[serde(default)]
    pub local_port: u16,
}

/// A cluster service to forward local ports to.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalAccessSpec {
    /// Namespace of the service.
    pub namespace: String,
    /// Name of the service.
    pub name: String,
    /// Disabled entries are ignored entirely.
    #[serde(default)]
    pub enabled: bool,
    /// The ports to forward.
    #[serde(default)]
    pub ports: Vec<ExternalPortMapping>,
}

/// One forwarded port.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalPortMapping {
    /// The service port's declared name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Protocol. Only TCP can be enabled.
    #[serde(default)]
    pub protocol: Protocol,
    /// The numeric container port on the backing pod.
    pub target_port: u16,
    /// The local port to listen on. `0` lets the tunnel pick one.
    #[serde(default)]
    pub local_port: u16,
}

fn invalid(msg: String) -> Error {
    SupplantError::ConfigInvalid(msg).into()
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_path(path: &Path) -> Result<Config> {
        let yaml = fs::read_to_string(path)
            .map_err(|err| invalid(format!("error opening {}: {}", path.display(), err)))?;
        let config = Config::from_yaml_str(&yaml)
            .with_context(|| format!("error reading {}", path.display()))?;
        Ok(config)
    }

    /// Parse and validate a configuration.
    pub fn from_yaml_str(yaml: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(yaml)
            .map_err(|err| invalid(format!("error decoding configuration: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration as YAML.
    pub fn write_to_path(&self, path: &Path) -> Result<()> {
        let yaml = self.to_yaml()?;
        fs::write(path, yaml).with_context(|| format!("error writing {}", path.display()))
    }

    /// Serialize this configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("error encoding configuration")
    }

    /// Check the enabled entries for mistakes we can catch before touching
    /// the cluster. Disabled entries are never checked.
    pub fn validate(&self) -> Result<()> {
        let mut local_ports = HashSet::new();
        let mut claim = |local_port: u16, owner: &str| -> Result<()> {
            if local_port != 0 && !local_ports.insert(local_port) {
                return Err(invalid(format!(
                    "local port {} is used more than once (again by {})",
                    local_port, owner,
                )));
            }
            Ok(())
        };

        for spec in self.supplant.iter().filter(|s| s.enabled) {
            let owner = check_identity("supplant", &spec.namespace, &spec.name)?;
            if spec.ports.is_empty() {
                return Err(invalid(format!("{} has no ports", owner)));
            }
            let mut remote_ports = HashSet::new();
            for port in &spec.ports {
                check_port(&owner, port.protocol, port.port)?;
                if !remote_ports.insert(port.port) {
                    return Err(invalid(format!(
                        "{} lists port {} more than once",
                        owner, port.port,
                    )));
                }
                claim(port.local_port, &owner)?;
            }
        }
        for spec in self.external.iter().filter(|s| s.enabled) {
            let owner = check_identity("external", &spec.namespace, &spec.name)?;
            if spec.ports.is_empty() {
                return Err(invalid(format!("{} has no ports", owner)));
            }
            for port in &spec.ports {
                check_port(&owner, port.protocol, port.target_port)?;
                claim(port.local_port, &owner)?;
            }
        }
        Ok(())
    }

    /// Does this configuration enable anything at all?
    pub fn has_enabled_entries(&self) -> bool {
        self.supplant.iter().any(|s| s.enabled) || self.external.iter().any(|s| s.enabled)
    }

    /// Does this configuration enable at least one substitution?
    pub fn has_enabled_substitutions(&self) -> bool {
        self.supplant.iter().any(|s| s.enabled)
    }

    /// A copy of this configuration with every disabled entry removed.
    pub fn without_disabled(&self) -> Config {
        Config {
            supplant: self.supplant.iter().filter(|s| s.enabled).cloned().collect(),
            external: self.external.iter().filter(|s| s.enabled).cloned().collect(),
        }
    }

    /// Build a template configuration describing `services`, with every
    /// entry disabled. Only TCP ports are included. External target ports
    /// which cannot be resolved are left out with a warning.
    pub fn template<C>(
        cluster: &C,
        resolver: &mut PortResolver,
        services: &[Service],
    ) -> Config
    where
        C: Cluster + ?Sized,
    {
        let mut config = Config::default();
        for svc in services {
            config.supplant.push(SubstitutionSpec::from_service(svc));
            config
                .external
                .push(ExternalAccessSpec::from_service(cluster, resolver, svc));
        }
        config
    }

    /// Build an enabled configuration which forwards every TCP port of every
    /// service that has a selector.
    pub fn expose_all<C>(
        cluster: &C,
        resolver: &mut PortResolver,
        services: &[Service],
    ) -> Config
    where
        C: Cluster + ?Sized,
    {
        let external = services
            .iter()
            // We can't forward to selector-less services.
            .filter(|svc| !svc.spec.selector.is_empty())
            .map(|svc| ExternalAccessSpec {
                enabled: true,
                ..ExternalAccessSpec::from_service(cluster, resolver, svc)
            })
            .filter(|spec| !spec.ports.is_empty())
            .collect();
        Config {
            supplant: vec![],
            external,
        }
    }
}

fn check_identity(section: &str, namespace: &str, name: &str) -> Result<String> {
    if namespace.is_empty() || name.is_empty() {
        return Err(invalid(format!(
            "every enabled {} entry needs a namespace and a name",
            section,
        )));
    }
    Ok(format!("{} entry {}/{}", section, namespace, name))
}

fn check_port(owner: &str, protocol: Protocol, port: u16) -> Result<()> {
    if protocol != Protocol::Tcp {
        return Err(invalid(format!(
            "{} port {} uses {}, but only TCP can be forwarded",
            owner, port, protocol,
        )));
    }
    if port == 0 {
        return Err(invalid(format!("{} has a port 0", owner)));
    }
    Ok(())
}

impl SubstitutionSpec {
    /// A disabled entry covering every TCP port of `svc`.
    pub fn from_service(svc: &Service) -> SubstitutionSpec {
        SubstitutionSpec {
            namespace: svc.metadata.namespace.clone(),
            name: svc.metadata.name.clone(),
            enabled: false,
            ports: svc
                .spec
                .ports
                .iter()
                // UDP can't be port-forwarded yet, see
                // https://github.com/kubernetes/kubernetes/issues/47862
                .filter(|p| p.protocol == Protocol::Tcp)
                .map(|p| PortMapping {
                    name: p.name.clone(),
                    protocol: p.protocol,
                    port: p.port,
                    local_port: 0,
                })
                .collect(),
        }
    }
}

impl ExternalAccessSpec {
    /// A disabled entry covering every TCP port of `svc` that we can resolve
    /// to a container port.
    pub fn from_service<C>(
        cluster: &C,
        resolver: &mut PortResolver,
        svc: &Service,
    ) -> ExternalAccessSpec
    where
        C: Cluster + ?Sized,
    {
        let mut ports = vec![];
        for port in svc.spec.ports.iter().filter(|p| p.protocol == Protocol::Tcp) {
            match resolver.resolve(cluster, svc, &port.effective_target_port()) {
                Ok(target_port) => ports.push(ExternalPortMapping {
                    name: port.name.clone(),
                    protocol: port.protocol,
                    target_port,
                    local_port: 0,
                }),
                Err(err) => warn!(
                    "skipping port {} of {}: {}",
                    port.port,
                    svc.qualified_name(),
                    err.display_causes_without_backtrace(),
                ),
            }
        }
        ExternalAccessSpec {
            namespace: svc.metadata.namespace.clone(),
            name: svc.metadata.name.clone(),
            enabled: false,
            ports,
        }
    }
}

#[cfg(test)]
const EXAMPLE: &str = r#"
supplant:
  - namespace: ns
    name: api
    enabled: true
    ports:
      - name: http
        protocol: TCP
        port: 80
        local_port: 0
  - namespace: ns
    name: worker
    ports:
      - protocol: UDP
        port: 53
external:
  - namespace: ns
    name: db
    enabled: true
    ports:
      - name: pg
        target_port: 5432
        local_port: 5432
"#;

#[test]
fn parse_example_config() {
    let config = Config::from_yaml_str(EXAMPLE).expect("parse error");
    assert_eq!(config.supplant.len(), 2);
    assert!(config.supplant[0].enabled);
    assert_eq!(config.supplant[0].ports[0].port, 80);
    assert_eq!(config.supplant[0].ports[0].local_port, 0);
    assert!(!config.supplant[1].enabled);
    assert_eq!(config.external[0].ports[0].protocol, Protocol::Tcp);
    assert_eq!(config.external[0].ports[0].target_port, 5432);
    assert!(config.has_enabled_entries());
}

#[test]
fn disabled_entries_are_not_validated() {
    // The disabled `worker` entry uses UDP, which would be rejected if it
    // were enabled.
    Config::from_yaml_str(EXAMPLE).expect("disabled entry was validated");

    let enabled = EXAMPLE.replace("    name: worker\n", "    name: worker\n    enabled: true\n");
    let err = Config::from_yaml_str(&enabled).unwrap_err();
    assert!(matches!(
        crate::errors::supplant_error(&err),
        Some(SupplantError::ConfigInvalid(_))
    ));
}

#[test]
fn duplicate_local_ports_are_rejected() {
    let yaml = r#"
external:
  - { namespace: ns, name: a, enabled: true, ports: [ { target_port: 80, local_port: 8080 } ] }
  - { namespace: ns, name: b, enabled: true, ports: [ { target_port: 80, local_port: 8080 } ] }
"#;
    let err = Config::from_yaml_str(yaml).unwrap_err();
    assert!(err.to_string().contains("8080"));
}

#[test]
fn duplicate_remote_ports_in_one_entry_are_rejected() {
    let yaml = r#"
supplant:
  - namespace: ns
    name: api
    enabled: true
    ports:
      - { port: 80, local_port: 9000 }
      - { port: 80, local_port: 9001 }
"#;
    let err = Config::from_yaml_str(yaml).unwrap_err();
    assert!(matches!(
        crate::errors::supplant_error(&err),
        Some(SupplantError::ConfigInvalid(_))
    ));
    assert!(err.to_string().contains("port 80 more than once"));
}

#[test]
fn malformed_config_is_invalid() {
    let err = Config::from_yaml_str("supplant: [ { name: api } ]").unwrap_err();
    assert!(matches!(
        crate::errors::supplant_error(&err),
        Some(SupplantError::ConfigInvalid(_))
    ));
}

#[test]
fn without_disabled_keeps_enabled_entries() {
    let config = Config::from_yaml_str(EXAMPLE).expect("parse error");
    let cleaned = config.without_disabled();
    assert_eq!(cleaned.supplant.len(), 1);
    assert_eq!(cleaned.supplant[0].name, "api");
    assert_eq!(cleaned.external.len(), 1);

    let reparsed = Config::from_yaml_str(&cleaned.to_yaml().expect("encode"))
        .expect("reparse error");
    assert_eq!(reparsed, cleaned);
}

#[test]
fn template_skips_udp_and_resolves_named_ports() {
    use crate::kubernetes::ServicePort;
    use crate::testing::{pod, service, FakeCluster};

    let cluster = FakeCluster::new();
    let mut svc = service("ns", "dns", &[("app", "dns")], &[(80, "http")]);
    svc.spec.ports.push(ServicePort {
        name: Some("dns".to_owned()),
        protocol: Protocol::Udp,
        port: 53,
        ..ServicePort::default()
    });
    cluster.add_pod(pod("ns", "dns-1", &[("app", "dns")], &[("http", 8080)]));

    let mut resolver = PortResolver::new();
    let config = Config::template(&cluster, &mut resolver, &[svc]);
    assert!(!config.has_enabled_entries());
    assert_eq!(config.supplant[0].ports.len(), 1);
    assert_eq!(config.supplant[0].ports[0].port, 80);
    assert_eq!(config.external[0].ports.len(), 1);
    assert_eq!(config.external[0].ports[0].target_port, 8080);
}

#[test]
fn expose_all_skips_selectorless_services() {
    use crate::testing::{service, FakeCluster};

    let cluster = FakeCluster::new();
    let mut services = vec![
        service("ns", "headless", &[], &[(80, "http")]),
        service("ns", "api", &[("app", "api")], &[(80, "http")]),
    ];
    services[1].spec.ports[0].target_port = None;

    let mut resolver = PortResolver::new();
    let config = Config::expose_all(&cluster, &mut resolver, &services);
    assert_eq!(config.external.len(), 1);
    assert_eq!(config.external[0].name, "api");
    assert!(config.external[0].enabled);
    assert_eq!(config.external[0].ports[0].target_port, 80);
}
