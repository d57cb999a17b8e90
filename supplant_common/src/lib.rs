//! Code shared by the `supplant` command-line tool: the cluster object model,
//! the substitution state machine, and the tunnels that run alongside it.

#![warn(missing_docs)]

pub use crossbeam;
pub use serde_json;
pub use serde_yaml;
pub use tracing;

pub mod config;
pub mod errors;
pub mod kubernetes;
pub mod ledger;
pub mod lifecycle;
pub mod marker;
pub mod net;
pub mod port_lookup;
pub mod substitute;
#[cfg(test)]
mod testing;
pub mod tracing_support;
pub mod tunnel;

/// Common imports used by many modules.
pub mod prelude {
    pub use anyhow::{format_err, Context as _};
    pub use serde::{Deserialize, Serialize};
    pub use std::{
        collections::{BTreeMap, HashMap},
        fmt,
        fs::File,
        io::Write as _,
        net::IpAddr,
        path::{Path, PathBuf},
    };
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use crate::errors::{DisplayCausesAndBacktraceExt, SupplantError};
    pub use crate::{Error, Result};
}

/// Error type for this crate's functions.
pub use anyhow::Error;

/// Result type for this crate's functions.
pub type Result<T, E = Error> = std::result::Result<T, E>;
