//! Injected logging handle.
//!
//! Components do not log through a fixed module target.  Each one receives a
//! [`Logger`] in its constructor and passes [`Logger::target`] to the `log`
//! macros, so an embedding application decides how output is scoped and
//! filtered (`RUST_LOG=ethertunnel::switch=debug`).
//!
//! ```ignore
//! let log = Logger::new("ethertunnel").scoped("switch");
//! log::info!(target: log.target(), "[switch] listening on {addr}");
//! ```

use std::fmt;
use std::sync::Arc;

#[derive(Clone, PartialEq, Eq)]
pub struct Logger {
    target: Arc<str>,
}

impl Logger {
    pub fn new(target: impl AsRef<str>) -> Self {
        Self {
            target: Arc::from(target.as_ref()),
        }
    }

    /// A child handle whose target is `<parent>::<scope>`.
    pub fn scoped(&self, scope: impl fmt::Display) -> Self {
        Self::new(format!("{}::{}", self.target, scope))
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"))
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Logger({})", self.target)
    }
}

/// Install `env_logger` as the process logger.  `default_filter` applies
/// when `RUST_LOG` is unset.  Only the binary calls this.
pub fn init(default_filter: &str) {
    let env = env_logger::Env::default().default_filter_or(default_filter);
    let _ = env_logger::Builder::from_env(env).format_timestamp_millis().try_init();
}
