//! Tracing subscriber init helper.
//!
//! This crate is a library with no CLI surface of its own, so there is no
//! `-v`/`--quiet`/`--log-file` flag parsing to hang a subscriber off of. What
//! a host application (or a test) needs instead is an `EnvFilter`-driven
//! `fmt` layer it can install with one call, honoring `RUST_LOG`.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a global `tracing` subscriber reading its level from `RUST_LOG`,
/// defaulting to `info` when unset. Safe to call more than once — later
/// calls are ignored, matching `tracing_subscriber::registry().init()`'s own
/// "first one wins" behavior.
pub fn init_default() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_default_does_not_panic_when_called_twice() {
        init_default();
        init_default();
    }
}
