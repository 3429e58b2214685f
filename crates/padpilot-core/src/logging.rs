//! Tracing setup for binaries embedding the crate.
//!
//! Library code only emits events; nothing here runs unless the host calls
//! [`init`].

use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};

/// Default directive when `RUST_LOG` is unset. Kept quiet on purpose; use
/// `RUST_LOG=padpilot_core=debug` for per-task detail.
pub const DEFAULT_DIRECTIVE: &str = "warn";

/// Install a global fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive`.
///
/// Fails if a global subscriber is already installed.
pub fn init(default_directive: &str) -> Result<()> {
    fmt()
        .with_env_filter(filter(default_directive))
        .with_target(false)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}

fn filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // The first call may lose to another test's subscriber; the second
        // must fail either way.
        let _ = init(DEFAULT_DIRECTIVE);
        assert!(matches!(init("debug"), Err(Error::Logging(_))));
    }
}
