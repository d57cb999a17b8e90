//! The `config` subcommand.

use structopt::StructOpt;
use supplant_common::{kubernetes::Kubectl, prelude::*};

mod clean;
mod create;

/// The `config` subcommand.
#[derive(Debug, StructOpt)]
pub enum Opt {
    /// Write a config file describing the services in the cluster, with
    /// every entry disabled.
    #[structopt(name = "create")]
    Create {
        /// Only include services in this namespace.
        #[structopt(short = "n", long = "namespace")]
        namespace: Option<String>,

        /// Where to write the config file.
        #[structopt(parse(from_os_str))]
        path: PathBuf,
    },

    /// Remove every disabled entry from a config file.
    #[structopt(name = "clean")]
    Clean {
        /// The config file to rewrite.
        #[structopt(parse(from_os_str))]
        path: PathBuf,
    },
}

/// Run the `config` subcommand.
pub fn run(kubectl: &Kubectl, opt: &Opt) -> Result<()> {
    match opt {
        Opt::Create { namespace, path } => create::run(kubectl, namespace.as_deref(), path),
        Opt::Clean { path } => clean::run(path),
    }
}
