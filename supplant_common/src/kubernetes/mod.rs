//! Tools for talking to Kubernetes.

use serde::de::DeserializeOwned;
use std::process::{Command, Stdio};

use crate::prelude::*;

mod objects;

pub use self::objects::*;

/// The cluster operations the orchestrator needs.
///
/// Calls are synchronous and may block. Deleting something which is already
/// gone is not an error: the `delete_*` methods return `false` instead.
pub trait Cluster {
    /// Fetch a service, or `None` if it doesn't exist.
    fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;

    /// List services in `namespace`, or in all namespaces.
    fn services(&self, namespace: Option<&str>) -> Result<Vec<Service>>;

    /// List services in all namespaces matching a label selector.
    fn services_matching(&self, label_selector: &str) -> Result<Vec<Service>>;

    /// Create a service.
    fn create_service(&self, service: &Service) -> Result<()>;

    /// Delete a service. Returns `false` if it didn't exist.
    fn delete_service(&self, namespace: &str, name: &str) -> Result<bool>;

    /// List endpoints in all namespaces matching a label selector.
    fn endpoints_matching(&self, label_selector: &str) -> Result<Vec<Endpoints>>;

    /// Create an endpoints object.
    fn create_endpoints(&self, endpoints: &Endpoints) -> Result<()>;

    /// Delete an endpoints object. Returns `false` if it didn't exist.
    fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<bool>;

    /// List the pods in `namespace` matching `selector`.
    fn pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>>;
}

/// Format a selector map as a `-l` argument.
pub fn format_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Run `cmd` in a process group of its own. Ctrl-C in the terminal is sent
/// to the whole foreground group, and only we should see it: teardown still
/// needs every `kubectl` it starts to run to completion.
fn own_process_group(cmd: &mut Command) -> &mut Command {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd
}

/// Global options passed to every `kubectl` invocation.
#[derive(Clone, Debug, Default)]
pub struct KubectlOptions {
    /// The kubeconfig file to use.
    pub kubeconfig: Option<PathBuf>,
    /// The kubeconfig context to use.
    pub context: Option<String>,
}

/// A `Cluster` reached by running `kubectl`.
#[derive(Clone, Debug, Default)]
pub struct Kubectl {
    options: KubectlOptions,
}

impl Kubectl {
    /// Talk to the cluster selected by `options`.
    pub fn new(options: KubectlOptions) -> Kubectl {
        Kubectl { options }
    }

    /// Start building a `kubectl` command with our global options.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new("kubectl");
        own_process_group(&mut cmd);
        if let Some(kubeconfig) = &self.options.kubeconfig {
            cmd.arg("--kubeconfig").arg(kubeconfig);
        }
        if let Some(context) = &self.options.context {
            cmd.arg("--context").arg(context);
        }
        cmd
    }

    /// Run `kubectl` and capture standard output.
    fn output(&self, args: &[&str]) -> Result<Vec<u8>> {
        let output = self
            .command()
            .args(args)
            // Pass `stderr` through on console instead of capturing.
            .stderr(Stdio::inherit())
            .output()
            .with_context(|| format!("error starting kubectl with {:?}", args))?;
        if !output.status.success() {
            return Err(format_err!("error running kubectl with {:?}", args));
        }
        Ok(output.stdout)
    }

    /// Run `kubectl`, capture output as JSON, and parse it using the
    /// specified type. Empty output parses as `None`.
    fn parse_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<Option<T>> {
        let stdout = self.output(args)?;
        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let parsed = serde_json::from_slice(&stdout)
            .with_context(|| format!("error parsing output of kubectl {:?}", args))?;
        Ok(Some(parsed))
    }

    /// Run `kubectl` and parse a `kind: List` response.
    fn list<T: DeserializeOwned>(&self, args: &[&str]) -> Result<Vec<T>> {
        let list: Option<List<T>> = self.parse_json(args)?;
        Ok(list.map(|l| l.items).unwrap_or_default())
    }

    /// Run `kubectl` with the specified input.
    fn with_input(&self, args: &[&str], input: &str) -> Result<()> {
        let mut child = self
            .command()
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .with_context(|| format!("error starting kubectl with {:?}", args))?;
        {
            let stdin = child
                .stdin
                .as_mut()
                .ok_or_else(|| format_err!("kubectl stdin is missing"))?;
            write!(stdin, "{}", input)
                .with_context(|| format!("error writing input to kubectl {:?}", args))?;
        }
        // Close stdin so `kubectl` sees the end of the manifest.
        drop(child.stdin.take());
        let status = child
            .wait()
            .with_context(|| format!("error running kubectl with {:?}", args))?;
        if !status.success() {
            return Err(format_err!("error running kubectl with {:?}", args));
        }
        Ok(())
    }

    /// Create an object from its JSON representation.
    fn create<T: Serialize>(&self, object: &T) -> Result<()> {
        let json = serde_json::to_string(object)?;
        self.with_input(&["create", "-f", "-"], &json)
    }

    /// Delete an object, treating "not found" as success.
    fn delete(&self, kind: &str, namespace: &str, name: &str) -> Result<bool> {
        let deleted = self.output(&[
            "delete",
            kind,
            name,
            "-n",
            namespace,
            "--ignore-not-found",
            "-o",
            "name",
        ])?;
        Ok(!deleted.iter().all(u8::is_ascii_whitespace))
    }

    /// Ask the API server for its version.
    pub fn server_version(&self) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Version {
            server_version: Option<ServerVersion>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct ServerVersion {
            git_version: String,
        }

        let version: Option<Version> = self.parse_json(&["version", "-o", "json"])?;
        version
            .and_then(|v| v.server_version)
            .map(|v| v.git_version)
            .ok_or_else(|| format_err!("kubectl did not report a server version"))
    }
}

impl Cluster for Kubectl {
    #[instrument(level = "trace", skip(self))]
    fn service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        self.parse_json(&[
            "get",
            "service",
            name,
            "-n",
            namespace,
            "--ignore-not-found",
            "-o",
            "json",
        ])
    }

    #[instrument(level = "trace", skip(self))]
    fn services(&self, namespace: Option<&str>) -> Result<Vec<Service>> {
        match namespace {
            Some(namespace) => self.list(&["get", "services", "-n", namespace, "-o", "json"]),
            None => self.list(&["get", "services", "--all-namespaces", "-o", "json"]),
        }
    }

    #[instrument(level = "trace", skip(self))]
    fn services_matching(&self, label_selector: &str) -> Result<Vec<Service>> {
        self.list(&[
            "get",
            "services",
            "--all-namespaces",
            "-l",
            label_selector,
            "-o",
            "json",
        ])
    }

    #[instrument(level = "debug", skip(self, service), fields(service = %service.qualified_name()))]
    fn create_service(&self, service: &Service) -> Result<()> {
        self.create(service)
    }

    #[instrument(level = "debug", skip(self))]
    fn delete_service(&self, namespace: &str, name: &str) -> Result<bool> {
        self.delete("service", namespace, name)
    }

    #[instrument(level = "trace", skip(self))]
    fn endpoints_matching(&self, label_selector: &str) -> Result<Vec<Endpoints>> {
        self.list(&[
            "get",
            "endpoints",
            "--all-namespaces",
            "-l",
            label_selector,
            "-o",
            "json",
        ])
    }

    #[instrument(level = "debug", skip(self, endpoints), fields(endpoints = %endpoints.metadata.name))]
    fn create_endpoints(&self, endpoints: &Endpoints) -> Result<()> {
        self.create(endpoints)
    }

    #[instrument(level = "debug", skip(self))]
    fn delete_endpoints(&self, namespace: &str, name: &str) -> Result<bool> {
        self.delete("endpoints", namespace, name)
    }

    #[instrument(level = "trace", skip(self))]
    fn pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>> {
        let selector = format_selector(selector);
        self.list(&["get", "pods", "-n", namespace, "-l", &selector, "-o", "json"])
    }
}

#[test]
fn selector_formatting_is_sorted() {
    let mut selector = BTreeMap::new();
    selector.insert("tier".to_owned(), "backend".to_owned());
    selector.insert("app".to_owned(), "api".to_owned());
    assert_eq!(format_selector(&selector), "app=api,tier=backend");
}

#[test]
fn kubectl_command_carries_global_options() {
    let kubectl = Kubectl::new(KubectlOptions {
        kubeconfig: Some(PathBuf::from("/tmp/kubeconfig")),
        context: Some("dev".to_owned()),
    });
    let cmd = kubectl.command();
    let args = cmd
        .get_args()
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    assert_eq!(args, vec!["--kubeconfig", "/tmp/kubeconfig", "--context", "dev"]);
}

#[cfg(target_os = "linux")]
#[test]
fn child_processes_do_not_share_our_process_group() {
    use std::fs;

    let mut child = own_process_group(Command::new("sh").args(&["-c", "sleep 5"]))
        .spawn()
        .expect("spawn");
    let stat = fs::read_to_string(format!("/proc/{}/stat", child.id())).expect("stat");
    child.kill().expect("kill");
    child.wait().expect("wait");

    // Fields after the parenthesised command name: state, ppid, pgrp.
    let fields = stat
        .rsplit(')')
        .next()
        .expect("stat format")
        .split_whitespace()
        .collect::<Vec<_>>();
    assert_eq!(fields[2], child.id().to_string());
}
