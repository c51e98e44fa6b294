//! Tracing subscriber setup for binaries and tests.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "AGENT_SESSION_LOG";

const DEFAULT_DIRECTIVE: &str = "info";

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Installs a stderr fmt subscriber filtered by `AGENT_SESSION_LOG`.
///
/// Safe to call more than once; only the first call installs anything.
/// Returns whether this process ended up with our subscriber (false when
/// another global subscriber was already set).
pub fn init_from_env() -> bool {
    *INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV_VAR)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .try_init()
            .is_ok()
    })
}
