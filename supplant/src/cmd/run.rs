//! The `run` subcommand.

use supplant_common::{
    config::Config,
    kubernetes::Kubectl,
    lifecycle::{EntryFailurePolicy, RunOptions},
    net::outbound_ip,
    prelude::*,
};

use crate::console::Console;

/// Run the `run` subcommand.
pub fn run(
    kubectl: &Kubectl,
    config_path: &Path,
    ip: Option<IpAddr>,
    local_ip: IpAddr,
    fail_fast: bool,
) -> Result<()> {
    let mut config = Config::from_path(config_path)?;
    let mut progress = Console;
    super::print_banner(kubectl, &mut progress)?;

    // The cluster only connects back to us if we substitute something.
    let external_ip = match ip {
        Some(ip) => ip,
        None if config.has_enabled_substitutions() => outbound_ip()?,
        None => crate::unused_ip(),
    };
    debug!("external IP: {}", external_ip);

    let options = RunOptions {
        external_ip,
        local_ip,
        policy: if fail_fast {
            EntryFailurePolicy::Abort
        } else {
            EntryFailurePolicy::Continue
        },
    };
    super::run_config(kubectl, &mut config, options, &mut progress)
}
