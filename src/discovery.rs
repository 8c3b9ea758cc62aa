//! Candidate broker endpoint discovery: picks the first non-empty source
//! from environment, explicit caller input, configuration files, and a
//! synthesized default, in that priority order.

use crate::config::ClientConfig;
use crate::endpoint::Endpoint;
use crate::env::{self, EnvReader};

/// Resolves the ordered list of raw endpoint strings to try, following a
/// five-tier priority: `COSERVER_URLS`, then `COSERVER_HOST`, then an
/// explicit caller-supplied list, then user config, then system config,
/// then a synthesized default. `COSERVER_HOST` alone normally becomes the
/// sole candidate, but an explicit caller-supplied list (e.g. from a
/// prior `set_server_urls` call) wins over a bare `COSERVER_HOST` when
/// `COSERVER_URLS` itself is unset.
#[must_use]
pub fn discover_raw(explicit_urls: &[String], env: &dyn EnvReader, config: &ClientConfig, default_port: u16) -> Vec<String> {
    let url_env = env::urls(env);
    if !url_env.is_empty() {
        return url_env;
    }

    if let Some(host) = env::host(env) {
        if explicit_urls.is_empty() {
            return vec![host];
        }
        log::debug!("[connection] COSERVER_HOST set but explicit server list takes precedence");
        return explicit_urls.to_vec();
    }

    if !explicit_urls.is_empty() {
        return explicit_urls.to_vec();
    }

    if !config.servers.is_empty() {
        return config.servers.clone();
    }

    vec![format!("co4://localhost:{default_port}")]
}

/// Parses each raw candidate, dropping (and logging) any that fail to
/// parse rather than aborting discovery entirely.
#[must_use]
pub fn parse_candidates(raw: &[String]) -> Vec<Endpoint> {
    raw.iter()
        .filter_map(|s| match Endpoint::parse(s) {
            Ok(e) => Some(e),
            Err(err) => {
                log::warn!("[connection] skipping invalid endpoint {s:?}: {err}");
                None
            }
        })
        .collect()
}
