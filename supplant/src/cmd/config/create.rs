//! The `config create` subcommand.

use supplant_common::{
    config::Config,
    kubernetes::{Cluster, Kubectl},
    port_lookup::PortResolver,
    prelude::*,
};

/// Write a template config for the services in `namespace`.
pub fn run(kubectl: &Kubectl, namespace: Option<&str>, path: &Path) -> Result<()> {
    let services = kubectl.services(namespace)?;
    let mut resolver = PortResolver::new();
    let config = Config::template(kubectl, &mut resolver, &services);
    config.write_to_path(path)?;
    println!(
        "wrote {} services to {}; enable the ones you want, then run `supplant run {}`",
        services.len(),
        path.display(),
        path.display(),
    );
    Ok(())
}
