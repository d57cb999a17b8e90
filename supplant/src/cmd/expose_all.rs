//! The `expose-all` subcommand.

use supplant_common::{
    config::Config,
    kubernetes::{Cluster, Kubectl},
    lifecycle::{EntryFailurePolicy, RunOptions},
    port_lookup::PortResolver,
    prelude::*,
};

use crate::console::Console;

/// Forward every service in `namespace` (or everywhere) until interrupted.
pub fn run(kubectl: &Kubectl, namespace: Option<&str>, local_ip: IpAddr) -> Result<()> {
    let mut progress = Console;
    super::print_banner(kubectl, &mut progress)?;

    let services = kubectl.services(namespace)?;
    let mut resolver = PortResolver::new();
    let mut config = Config::expose_all(kubectl, &mut resolver, &services);
    trace!("generated config: {:?}", config);

    let options = RunOptions {
        external_ip: crate::unused_ip(),
        local_ip,
        // One service we can't reach shouldn't hide all the others.
        policy: EntryFailurePolicy::Continue,
    };
    super::run_config(kubectl, &mut config, options, &mut progress)
}
