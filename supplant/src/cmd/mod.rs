//! Subcommands.

use crossbeam::channel::{self, Receiver};
use supplant_common::{
    config::Config,
    kubernetes::Kubectl,
    lifecycle::{Coordinator, RunOptions, RunOutcome},
    prelude::*,
    substitute::Progress,
    tunnel::KubectlForwarder,
};

pub mod clean;
pub mod config;
pub mod expose_all;
pub mod run;

/// Print which cluster we're about to change.
fn print_banner(kubectl: &Kubectl, progress: &mut dyn Progress) -> Result<()> {
    let version = kubectl
        .server_version()
        .context("could not connect to the Kubernetes cluster")?;
    progress.info(&format!("connected to Kubernetes {}", version));
    Ok(())
}

/// A channel which receives a message each time the user presses Ctrl-C.
fn interrupt_channel() -> Result<Receiver<()>> {
    let (tx, rx) = channel::unbounded();
    ctrlc::set_handler(move || {
        // Only fails once we've stopped listening, which means we're exiting.
        let _ = tx.send(());
    })
    .context("could not install Ctrl-C handler")?;
    Ok(rx)
}

/// Run `config` until interrupted, then restore everything.
fn run_config(
    kubectl: &Kubectl,
    config: &mut Config,
    options: RunOptions,
    progress: &mut dyn Progress,
) -> Result<()> {
    let interrupt = interrupt_channel()?;
    let forwarder = KubectlForwarder::new(kubectl.clone());
    let mut coordinator = Coordinator::new(kubectl, forwarder, options);
    let outcome = coordinator.run(config, &interrupt, progress)?;
    report_outcome(outcome, progress)
}

/// Tell the user how a run went. Having nothing to do is not a failure.
fn report_outcome(outcome: RunOutcome, progress: &mut dyn Progress) -> Result<()> {
    match outcome {
        RunOutcome::NothingToDo { .. } => {
            progress.error(&SupplantError::NothingToDo.to_string());
            Ok(())
        }
        RunOutcome::Completed { setup, teardown } => {
            if setup.failures > 0 {
                progress.error(&format!("{} entries could not be set up", setup.failures));
            }
            if teardown.failed > 0 {
                return Err(format_err!(
                    "{} of {} restore steps failed; check the cluster by hand",
                    teardown.failed,
                    teardown.executed.len(),
                ));
            }
            progress.info("cluster restored");
            Ok(())
        }
    }
}

#[cfg(test)]
#[derive(Default)]
struct Messages {
    infos: Vec<String>,
    errors: Vec<String>,
}

#[cfg(test)]
impl Progress for Messages {
    fn header(&mut self, _msg: &str) {}
    fn item(&mut self, _msg: &str) {}
    fn info(&mut self, msg: &str) {
        self.infos.push(msg.to_owned());
    }
    fn error(&mut self, msg: &str) {
        self.errors.push(msg.to_owned());
    }
}

#[test]
fn nothing_to_do_is_reported_but_succeeds() {
    use supplant_common::ledger::TeardownReport;

    let mut messages = Messages::default();
    let outcome = RunOutcome::NothingToDo {
        teardown: TeardownReport::default(),
    };
    report_outcome(outcome, &mut messages).expect("nothing to do is not an error");
    assert_eq!(messages.errors, vec![SupplantError::NothingToDo.to_string()]);
    assert!(messages.infos.is_empty());
}

#[test]
fn failed_restore_steps_fail_the_command() {
    use supplant_common::{ledger::TeardownReport, lifecycle::SetupSummary};

    let mut messages = Messages::default();
    let outcome = RunOutcome::Completed {
        setup: SetupSummary::default(),
        teardown: TeardownReport {
            failed: 1,
            ..TeardownReport::default()
        },
    };
    assert!(report_outcome(outcome, &mut messages).is_err());
    assert!(messages.infos.is_empty());
}
