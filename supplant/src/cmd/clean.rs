//! The `clean` subcommand.

use supplant_common::{
    kubernetes::Kubectl,
    marker::{marked_services, sweep_marked_endpoints},
    prelude::*,
    substitute::Progress,
};

use crate::console::Console;

/// Delete substitute endpoints left behind by a run that didn't finish, and
/// list any services we can't put back ourselves.
pub fn run(kubectl: &Kubectl) -> Result<()> {
    let mut progress = Console;
    super::print_banner(kubectl, &mut progress)?;

    progress.header("deleting substitute endpoints");
    let deleted = sweep_marked_endpoints(kubectl)?;
    progress.item(&format!("deleted {} endpoints", deleted));

    let services = marked_services(kubectl)?;
    for svc in &services {
        progress.error(&format!(
            "service {} still points at a local machine; re-apply its manifest to restore it",
            svc.qualified_name(),
        ));
    }
    if !services.is_empty() {
        return Err(format_err!("{} services need restoring by hand", services.len()));
    }
    Ok(())
}
