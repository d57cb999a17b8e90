//! Tunnels implemented by running `kubectl port-forward`.

use crossbeam::channel::{self, Sender};
use lazy_static::lazy_static;
use regex::Regex;
use std::{
    collections::BTreeSet,
    io::{self, BufRead, BufReader},
    process::{Child, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use super::{ForwardRequest, Forwarder, PortPair, Tunnel, TunnelHandle};
use crate::kubernetes::Kubectl;
use crate::prelude::*;

/// Starts one `kubectl port-forward` process per tunnel.
#[derive(Clone, Debug, Default)]
pub struct KubectlForwarder {
    kubectl: Kubectl,
}

impl KubectlForwarder {
    /// Forward using the cluster selected by `kubectl`.
    pub fn new(kubectl: Kubectl) -> KubectlForwarder {
        KubectlForwarder { kubectl }
    }
}

impl Forwarder for KubectlForwarder {
    fn forward(&self, request: &ForwardRequest) -> Result<TunnelHandle> {
        let label = format!("{}/{}", request.namespace, request.service);
        let mut cmd = self.kubectl.command();
        cmd.args(&["port-forward", "-n", request.namespace.as_str()])
            .arg("--address")
            .arg(request.local_ip.to_string())
            .arg(format!("pod/{}", request.pod))
            .args(request.ports.iter().map(port_arg))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        trace!("running {:?}", cmd);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("error starting kubectl port-forward for {}", label))?;

        let (ready_tx, ready_rx) = channel::bounded(1);
        let closing = Arc::new(AtomicBool::new(false));
        if let Err(err) = spawn_watchers(&mut child, request, &label, ready_tx, &closing) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }

        let tunnel = KubectlTunnel { child, closing };
        Ok(TunnelHandle::new(request, ready_rx, Box::new(tunnel)))
    }
}

/// Format a port pair the way `kubectl port-forward` expects.
fn port_arg(pair: &PortPair) -> String {
    if pair.local == 0 {
        format!(":{}", pair.remote)
    } else {
        format!("{}:{}", pair.local, pair.remote)
    }
}

/// Start the threads that read `kubectl`'s output.
fn spawn_watchers(
    child: &mut Child,
    request: &ForwardRequest,
    label: &str,
    ready: Sender<Vec<PortPair>>,
    closing: &Arc<AtomicBool>,
) -> Result<()> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| format_err!("kubectl stdout is missing"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| format_err!("kubectl stderr is missing"))?;

    let requested = request.ports.clone();
    let stdout_label = label.to_owned();
    let closing = closing.clone();
    thread::Builder::new()
        .name(format!("port-forward {}", label))
        .spawn(move || {
            watch_stdout(
                BufReader::new(stdout),
                &requested,
                ready,
                &closing,
                &stdout_label,
            )
        })
        .context("could not create port-forward thread")?;

    let stderr_label = label.to_owned();
    thread::Builder::new()
        .name(format!("port-forward {} stderr", label))
        .spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => warn!("port forward {}: {}", stderr_label, line),
                    Err(_) => break,
                }
            }
        })
        .context("could not create port-forward thread")?;
    Ok(())
}

lazy_static! {
    static ref FORWARDING_LINE: Regex =
        Regex::new(r"^Forwarding from (\S+):(\d+) -> (\d+)\s*$").expect("invalid regex");
}

/// Parse a `Forwarding from 127.0.0.1:5000 -> 80` line.
fn parse_forwarding_line(line: &str) -> Option<PortPair> {
    let caps = FORWARDING_LINE.captures(line)?;
    Some(PortPair {
        local: caps[2].parse().ok()?,
        remote: caps[3].parse().ok()?,
    })
}

/// Match each requested pair against what `kubectl` reported, in request
/// order. Returns `None` until every requested pair has been seen.
fn match_reported(requested: &[PortPair], seen: &BTreeSet<PortPair>) -> Option<Vec<PortPair>> {
    let mut used = BTreeSet::new();
    requested
        .iter()
        .map(|want| {
            let found = seen.iter().find(|got| {
                got.remote == want.remote
                    && (want.local == 0 || got.local == want.local)
                    && !used.contains(*got)
            })?;
            used.insert(*found);
            Some(*found)
        })
        .collect()
}

/// Read `kubectl port-forward`'s output, signal readiness once every port is
/// listening, and log if the process goes away without being asked to.
fn watch_stdout<R: BufRead>(
    reader: R,
    requested: &[PortPair],
    ready: Sender<Vec<PortPair>>,
    closing: &AtomicBool,
    label: &str,
) {
    let mut ready = Some(ready);
    let mut seen = BTreeSet::new();
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!("error reading port forward {} output: {}", label, err);
                break;
            }
        };
        trace!("port forward {}: {}", label, line);
        if let Some(pair) = parse_forwarding_line(&line) {
            seen.insert(pair);
        }
        if ready.is_some() {
            if let Some(ports) = match_reported(requested, &seen) {
                if let Some(tx) = ready.take() {
                    // The receiver may be gone if we're already shutting down.
                    let _ = tx.send(ports);
                }
            }
        }
    }
    if !closing.load(Ordering::SeqCst) {
        error!("port forward {} exited unexpectedly", label);
    }
}

/// A running `kubectl port-forward` process.
struct KubectlTunnel {
    child: Child,
    closing: Arc<AtomicBool>,
}

impl KubectlTunnel {
    fn stop(&mut self) -> io::Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        if self.child.try_wait()?.is_none() {
            match self.child.kill() {
                // Already exited between `try_wait` and `kill`.
                Err(err) if err.kind() == io::ErrorKind::InvalidInput => {}
                other => other?,
            }
        }
        self.child.wait()?;
        Ok(())
    }
}

impl Tunnel for KubectlTunnel {
    fn close(&mut self) -> Result<()> {
        self.stop().context("could not stop kubectl port-forward")
    }
}

impl Drop for KubectlTunnel {
    fn drop(&mut self) {
        if !self.closing.load(Ordering::SeqCst) {
            let _ = self.stop();
        }
    }
}

#[test]
fn port_args_leave_unset_local_ports_to_kubectl() {
    assert_eq!(port_arg(&PortPair { local: 0, remote: 80 }), ":80");
    assert_eq!(port_arg(&PortPair { local: 8080, remote: 80 }), "8080:80");
}

#[test]
fn parses_forwarding_lines() {
    assert_eq!(
        parse_forwarding_line("Forwarding from 127.0.0.1:54321 -> 8080"),
        Some(PortPair { local: 54321, remote: 8080 })
    );
    assert_eq!(
        parse_forwarding_line("Forwarding from [::1]:54321 -> 8080"),
        Some(PortPair { local: 54321, remote: 8080 })
    );
    assert_eq!(parse_forwarding_line("Handling connection for 54321"), None);
}

#[test]
fn readiness_waits_for_every_port() {
    let requested = vec![
        PortPair { local: 0, remote: 80 },
        PortPair { local: 9443, remote: 443 },
    ];
    let output = "Forwarding from 127.0.0.1:9443 -> 443\n\
                  Forwarding from [::1]:9443 -> 443\n\
                  Forwarding from 127.0.0.1:40001 -> 80\n";
    let (tx, rx) = channel::bounded(1);
    let closing = AtomicBool::new(true);
    watch_stdout(output.as_bytes(), &requested, tx, &closing, "ns/api");
    assert_eq!(
        rx.recv().expect("never became ready"),
        vec![
            PortPair { local: 40001, remote: 80 },
            PortPair { local: 9443, remote: 443 },
        ]
    );
}

#[test]
fn exiting_before_ready_disconnects_the_signal() {
    let requested = vec![PortPair { local: 0, remote: 80 }];
    let output = "error: unable to forward port because pod is not running\n";
    let (tx, rx) = channel::bounded(1);
    let closing = AtomicBool::new(false);
    watch_stdout(output.as_bytes(), &requested, tx, &closing, "ns/api");
    assert!(rx.recv().is_err());
}
