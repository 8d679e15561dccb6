//! `dubtrack`: the CLI entry point for the dubbing job orchestration
//! service. Wraps `api-server`'s bootstrap (`serve`), a one-shot retention
//! sweep (`retention run-once`), and schema migration (`migrate`) behind one
//! binary, with the exit code table from SPEC_FULL.md §6.2.

/// Exit codes per SPEC_FULL §6.2: `0` success, `1` generic error,
/// `2` misconfiguration, `3` quota exceeded, `4` draining.
///
/// Only `Success`/`Generic`/`Misconfiguration`/`QuotaExceeded` are reachable
/// from this CLI's three subcommands — `Draining` is a property of the
/// long-running `serve` process (modeled by `DrainGuard` in `api-server`,
/// surfaced to HTTP clients as a 503), not something a CLI invocation itself
/// fails with; a drained shutdown of `serve` is a clean exit, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    Generic = 1,
    Misconfiguration = 2,
    QuotaExceeded = 3,
    Draining = 4,
}

impl ExitCode {
    pub fn from_error(err: &anyhow::Error) -> Self {
        if err.downcast_ref::<core_jobstate::quota::QuotaExceededError>().is_some() {
            return ExitCode::QuotaExceeded;
        }
        if err.downcast_ref::<std::io::Error>().is_some_and(|e| e.kind() == std::io::ErrorKind::NotFound) {
            return ExitCode::Misconfiguration;
        }
        ExitCode::Generic
    }
}
