use std::net::Ipv4Addr;

use structopt::StructOpt;
use supplant_common::{
    kubernetes::{Kubectl, KubectlOptions},
    prelude::*,
    quick_main,
    tracing_support::initialize_tracing,
};

mod cmd;
mod console;

/// Command-line options, parsed using `structopt`.
#[derive(Debug, StructOpt)]
#[structopt(
    about = "Temporarily replace Kubernetes services with processes on this machine."
)]
struct Opt {
    /// The kubeconfig file to use.
    #[structopt(long = "kubeconfig", global = true, parse(from_os_str))]
    kubeconfig: Option<PathBuf>,

    /// The kubeconfig context to use.
    #[structopt(long = "context", global = true)]
    context: Option<String>,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Substitute and forward the services enabled in a config file, until
    /// interrupted.
    #[structopt(name = "run")]
    Run {
        /// The address the cluster should send substituted traffic to.
        /// Defaults to this machine's outbound address.
        #[structopt(long = "ip")]
        ip: Option<IpAddr>,

        /// The local address port forwards listen on.
        #[structopt(long = "local-ip", default_value = "127.0.0.1")]
        local_ip: IpAddr,

        /// Stop at the first entry that can't be set up, instead of skipping
        /// it.
        #[structopt(long = "fail-fast")]
        fail_fast: bool,

        /// Path to the config file.
        #[structopt(parse(from_os_str))]
        config: PathBuf,
    },

    /// Forward every service with a selector to this machine, until
    /// interrupted.
    #[structopt(name = "expose-all")]
    ExposeAll {
        /// Only expose services in this namespace.
        #[structopt(short = "n", long = "namespace")]
        namespace: Option<String>,

        /// The local address port forwards listen on.
        #[structopt(long = "local-ip", default_value = "127.0.0.1")]
        local_ip: IpAddr,
    },

    /// Commands for working with config files.
    #[structopt(name = "config")]
    Config {
        #[structopt(subcommand)]
        cmd: cmd::config::Opt,
    },

    /// Delete substitute endpoints left behind by an earlier run.
    #[structopt(name = "clean")]
    Clean,
}

quick_main!(run);

fn run() -> Result<()> {
    initialize_tracing();
    let opt = Opt::from_args();
    debug!("Args: {:?}", opt);

    let kubectl = Kubectl::new(KubectlOptions {
        kubeconfig: opt.kubeconfig.clone(),
        context: opt.context.clone(),
    });

    match &opt.cmd {
        Command::Run {
            ip,
            local_ip,
            fail_fast,
            config,
        } => cmd::run::run(&kubectl, config, *ip, *local_ip, *fail_fast),
        Command::ExposeAll {
            namespace,
            local_ip,
        } => cmd::expose_all::run(&kubectl, namespace.as_deref(), *local_ip),
        Command::Config { cmd } => cmd::config::run(&kubectl, cmd),
        Command::Clean => cmd::clean::run(&kubectl),
    }
}

/// An address to use when nothing will ever connect to it.
pub(crate) fn unused_ip() -> IpAddr {
    IpAddr::from(Ipv4Addr::UNSPECIFIED)
}
