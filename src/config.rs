//! `client.ini` loading: server command, auto-start policy, user id
//! fallback, and the `servers/server_<i>` candidate endpoint list.
//!
//! Directory resolution follows the familiar `Config::config_dir()` pattern
//! (a production path via `dirs::home_dir()`, overridable for tests): the
//! user file lives at `$HOME/.<pkg>/client.ini`, the system file at
//! `<sysconfdir>/client.ini`. User values override system values key by key.

use std::path::{Path, PathBuf};

use ini::Ini;

/// Package directory name under `$HOME`, e.g. `$HOME/.diana/client.ini`.
pub const PKG_DIR_NAME: &str = "diana";

/// Highest `servers/server_<i>` index scanned before giving up on a gap.
/// An ad-hoc heuristic carried over from the original client: scan
/// continues through gaps until the index passes this bound with nothing
/// found, rather than stopping at the first missing index.
const MAX_SERVER_INDEX: usize = 16;

/// One loaded (and possibly merged) `client.ini`.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub server_command: Option<String>,
    pub attempt_to_start_server: Option<bool>,
    pub user_id: Option<String>,
    pub servers: Vec<String>,
}

impl ClientConfig {
    /// Loads and merges the system file, then the user file (user values
    /// win), returning an empty config when neither file is present or
    /// readable.
    #[must_use]
    pub fn load(user_path: Option<&Path>, system_path: Option<&Path>) -> Self {
        let mut merged = Self::default();
        if let Some(path) = system_path {
            merged.merge(Self::load_file(path));
        }
        if let Some(path) = user_path {
            merged.merge(Self::load_file(path));
        }
        merged
    }

    fn load_file(path: &Path) -> Self {
        let Ok(ini) = Ini::load_from_file(path) else {
            return Self::default();
        };

        let client = ini.section(Some("client"));
        let server_command = client.and_then(|s| s.get("server_command")).map(str::to_string);
        let attempt_to_start_server = client
            .and_then(|s| s.get("attempt_to_start_server"))
            .map(parse_bool);
        let user_id = client.and_then(|s| s.get("user_id")).map(str::to_string);

        let mut servers = Vec::new();
        if let Some(section) = ini.section(Some("servers")) {
            for i in 0..=MAX_SERVER_INDEX + 1 {
                let key = format!("server_{i}");
                match section.get(key.as_str()) {
                    Some(url) => servers.push(url.to_string()),
                    None if i > MAX_SERVER_INDEX => break,
                    None => continue,
                }
            }
        }

        Self {
            server_command,
            attempt_to_start_server,
            user_id,
            servers,
        }
    }

    fn merge(&mut self, other: Self) {
        if other.server_command.is_some() {
            self.server_command = other.server_command;
        }
        if other.attempt_to_start_server.is_some() {
            self.attempt_to_start_server = other.attempt_to_start_server;
        }
        if other.user_id.is_some() {
            self.user_id = other.user_id;
        }
        if !other.servers.is_empty() {
            self.servers = other.servers;
        }
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Resolves `$HOME/.<pkg>/client.ini`, or `None` if the home directory
/// cannot be determined.
#[must_use]
pub fn user_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(format!(".{PKG_DIR_NAME}")).join("client.ini"))
}

/// Resolves `<sysconfdir>/client.ini`. On Unix this is `/etc/<pkg>`; there
/// is no broker-defined sysconfdir on other platforms so this returns
/// `None` there.
#[must_use]
pub fn system_config_path() -> Option<PathBuf> {
    #[cfg(unix)]
    {
        Some(PathBuf::from(format!("/etc/{PKG_DIR_NAME}")).join("client.ini"))
    }
    #[cfg(not(unix))]
    {
        None
    }
}

/// Reads the legacy fallback broker port from `$HOME/.coserver.port`, as
/// the original client did before falling back to the compiled-in default.
/// Returns `None` when the file is absent or does not contain a valid port
/// number.
#[must_use]
pub fn legacy_port_file() -> Option<u16> {
    let path = dirs::home_dir()?.join(".coserver.port");
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
