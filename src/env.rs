//! Environment-variable reads used by endpoint discovery and user-id
//! resolution.
//!
//! Kept as a thin, pure module so the connection manager's discovery
//! algorithm can be tested without mutating real process environment
//! state: callers may supply an explicit [`EnvReader`] instead of the
//! default [`process_env`].

/// Reads a named environment variable, returning `None` when unset or not
/// valid UTF-8.
pub trait EnvReader {
    fn get(&self, key: &str) -> Option<String>;
}

/// The default reader: `std::env::var`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvReader for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// `COSERVER_URLS` split on ASCII whitespace, empty when unset or blank.
#[must_use]
pub fn urls(env: &dyn EnvReader) -> Vec<String> {
    env.get("COSERVER_URLS")
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// `COSERVER_HOST`, trimmed; `None` when unset or blank.
#[must_use]
pub fn host(env: &dyn EnvReader) -> Option<String> {
    env.get("COSERVER_HOST")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `COSERVER_USER`, trimmed; `None` when unset or blank.
#[must_use]
pub fn user(env: &dyn EnvReader) -> Option<String> {
    env.get("COSERVER_USER")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Resolves the OS user identity the way the original implementation did:
/// `USER`, then `LOGNAME`, then an empty string (no further OS user-database
/// lookup is attempted; that would require `libc::getpwuid` and this crate
/// avoids widening its unsafe surface for a cosmetic fallback).
#[must_use]
pub fn os_identity(env: &dyn EnvReader) -> String {
    env.get("USER")
        .or_else(|| env.get("LOGNAME"))
        .unwrap_or_default()
}
