//! Error-handling code.

use std::fmt;

use thiserror::Error as ThisError;

use crate::Error;

/// The failures that the orchestrator distinguishes between.
///
/// These travel inside an `anyhow::Error`, so callers who care about a
/// particular kind should use `err.downcast_ref::<SupplantError>()`.
#[derive(Debug, ThisError)]
pub enum SupplantError {
    /// The configuration file is missing, malformed, or inconsistent.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The service we were asked to substitute does not exist.
    #[error("unable to find service {name} in namespace {namespace}")]
    ServiceNotFound {
        /// Namespace we looked in.
        namespace: String,
        /// Name of the service.
        name: String,
    },

    /// A configured port is not declared by the live service.
    #[error("no match found for port {port} in service {namespace}/{name}")]
    PortMismatch {
        /// Namespace of the service.
        namespace: String,
        /// Name of the service.
        name: String,
        /// The configured port which did not match.
        port: u16,
    },

    /// The service has no selector, so there is no traffic to redirect.
    #[error("attempted to supplant service {namespace}/{name}, which has no selector")]
    NoSelector {
        /// Namespace of the service.
        namespace: String,
        /// Name of the service.
        name: String,
    },

    /// No backing pod declares the named port.
    #[error("unable to find named port {port} for service {namespace}/{name}")]
    PortNotFound {
        /// Namespace of the service.
        namespace: String,
        /// Name of the service.
        name: String,
        /// The symbolic port name.
        port: String,
    },

    /// Listing the backing pods for a named-port lookup failed.
    #[error("error looking up named port {port} for service {namespace}/{name}")]
    LookupFailed {
        /// Namespace of the service.
        namespace: String,
        /// Name of the service.
        name: String,
        /// The symbolic port name.
        port: String,
    },

    /// No running pod backs the service we want to tunnel to.
    #[error("unable to find a running pod for service {namespace}/{name}")]
    NoPodFound {
        /// Namespace of the service.
        namespace: String,
        /// Name of the service.
        name: String,
    },

    /// The tunnel transport failed.
    #[error("error forwarding ports for {namespace}/{name}")]
    TunnelSetupFailed {
        /// Namespace of the service.
        namespace: String,
        /// Name of the service.
        name: String,
    },

    /// Nothing was enabled, or nothing that was enabled could be set up.
    #[error("no services configured for supplanting or port forwarding")]
    NothingToDo,

    /// An individual undo action failed during teardown.
    #[error("error restoring {0}")]
    RestoreFailed(String),
}

/// Find the `SupplantError` at the root of `err`, if there is one.
pub fn supplant_error(err: &Error) -> Option<&SupplantError> {
    // `anyhow` only lets us downcast to a context value through the
    // `Error` itself, not through `chain()`.
    err.downcast_ref::<SupplantError>().or_else(|| {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<SupplantError>())
    })
}

/// Support for displaying an error with a complete list of causes, and an
/// optional backtrace.
pub trait DisplayCausesAndBacktraceExt {
    /// Display the error and its causes, plus a backtrace (if available).
    fn display_causes_and_backtrace(&self) -> DisplayCauses<'_>;

    /// Display the error and its causes.
    fn display_causes_without_backtrace(&self) -> DisplayCauses<'_>;
}

impl DisplayCausesAndBacktraceExt for Error {
    fn display_causes_and_backtrace(&self) -> DisplayCauses<'_> {
        DisplayCauses {
            err: self,
            show_backtrace: true,
        }
    }

    fn display_causes_without_backtrace(&self) -> DisplayCauses<'_> {
        DisplayCauses {
            err: self,
            show_backtrace: false,
        }
    }
}

/// Helper type used to display errors.
pub struct DisplayCauses<'a> {
    /// The error to display.
    err: &'a Error,

    /// Should we show the backtrace?
    show_backtrace: bool,
}

impl fmt::Display for DisplayCauses<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.err)?;
        for cause in self.err.chain().skip(1) {
            write!(f, "\n  caused by: {}", cause)?;
        }

        if self.show_backtrace {
            // `anyhow` captures backtraces only when `RUST_BACKTRACE` asks
            // for them, so this is usually a single "disabled" line.
            let backtrace = self.err.backtrace().to_string();
            if !backtrace.is_empty() && backtrace != "disabled backtrace" {
                write!(f, "\n{}", backtrace)?;
            }
        }
        Ok(())
    }
}

/// Generate a `main` function which calls the specified function. If the
/// function returns `Result::Err(_)`, then `main` will print the error and exit
/// with a non-zero status code.
#[macro_export]
macro_rules! quick_main {
    ($wrapped:ident) => {
        fn main() {
            if let Err(err) = $wrapped() {
                use ::std::io::Write;
                use $crate::errors::DisplayCausesAndBacktraceExt;
                let stderr = ::std::io::stderr();
                writeln!(
                    &mut stderr.lock(),
                    "ERROR {}",
                    err.display_causes_and_backtrace()
                )
                .expect("Error occurred while trying to display error");
                ::std::process::exit(1);
            }
        }
    };
}

#[test]
fn supplant_error_is_found_under_context() {
    use anyhow::Context;

    let result: Result<(), Error> = Err(SupplantError::NothingToDo.into());
    let err = result.context("while running").unwrap_err();
    assert!(matches!(
        supplant_error(&err),
        Some(SupplantError::NothingToDo)
    ));
    let shown = err.display_causes_without_backtrace().to_string();
    assert_eq!(
        shown,
        "while running\n  caused by: no services configured for supplanting or port forwarding",
    );
}
