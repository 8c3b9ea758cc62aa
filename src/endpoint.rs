//! Broker endpoint URLs: `co4://host:port` for TCP, `local://path` for a
//! filesystem-domain socket.

use std::fmt;

use anyhow::{bail, Result};
use url::Url;

/// Default coserver broker TCP port, used whenever neither the environment,
/// configuration, nor an explicit URL supplies one. This mirrors the
/// broker's own compiled-in default port.
pub const DEFAULT_PORT: u16 = 3208;

/// Transport scheme selected by an [`Endpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// TCP, `co4://host:port`.
    Co4,
    /// Local filesystem-domain socket, `local://path`.
    Local,
}

/// A single candidate broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
}

impl Endpoint {
    /// Builds a `co4://host:port` endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: Scheme::Co4,
            host: host.into(),
            port,
            path: String::new(),
        }
    }

    /// Builds a `local://path` endpoint.
    #[must_use]
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Local,
            host: String::new(),
            port: 0,
            path: path.into(),
        }
    }

    #[must_use]
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `true` when this endpoint names the local host: empty host,
    /// `127.0.0.1`, `[::1]`/`::1`, `localhost`, or `local_hostname`.
    #[must_use]
    pub fn is_local_ish(&self, local_hostname: &str) -> bool {
        match self.scheme {
            Scheme::Local => true,
            Scheme::Co4 => {
                let h = self.host.as_str();
                h.is_empty()
                    || h.eq_ignore_ascii_case("127.0.0.1")
                    || h.eq_ignore_ascii_case("::1")
                    || h.eq_ignore_ascii_case("[::1]")
                    || h.eq_ignore_ascii_case("localhost")
                    || h.eq_ignore_ascii_case(local_hostname)
            }
        }
    }

    /// Renders the endpoint for a broker spawn argument (`-u <url>`),
    /// applying the legacy default-port substitution: the `co4` port is
    /// filled in with [`DEFAULT_PORT`] before spawning, since the legacy
    /// broker requires an explicit port. The host is always omitted — the
    /// legacy broker binds all local interfaces and only the port is
    /// meaningful to it.
    #[must_use]
    pub fn to_spawn_url(&self) -> String {
        match self.scheme {
            Scheme::Co4 => {
                let port = if self.port == 0 { DEFAULT_PORT } else { self.port };
                format!("co4://:{port}")
            }
            Scheme::Local => format!("local://{}", self.path),
        }
    }

    /// Parses and normalises a raw endpoint string (an explicit URL, a bare
    /// hostname, or a filesystem path).
    ///
    /// Rules:
    /// - A value with no scheme that parses as a bare hostname (no path, no
    ///   slashes) is assumed `co4://<host>`.
    /// - A value with no scheme that has a filesystem-path shape is assumed
    ///   `local://<path>`.
    /// - Endpoints with a query or fragment are rejected.
    /// - `local` endpoints must not carry a port.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            bail!("empty endpoint string");
        }

        if !raw.contains("://") {
            return Self::parse_bare(raw);
        }

        let url = Url::parse(raw).map_err(|e| anyhow::anyhow!("invalid endpoint url {raw:?}: {e}"))?;
        if url.query().is_some() {
            bail!("endpoint {raw:?} must not carry a query string");
        }
        if url.fragment().is_some() {
            bail!("endpoint {raw:?} must not carry a fragment");
        }

        match url.scheme() {
            "co4" => {
                let host = url.host_str().unwrap_or("localhost").to_string();
                let port = url.port().unwrap_or(DEFAULT_PORT);
                Ok(Self::tcp(host, port))
            }
            "local" => {
                if url.port().is_some() {
                    bail!("local endpoint {raw:?} must not carry a port");
                }
                let path = if !url.path().is_empty() && url.path() != "/" {
                    url.path().to_string()
                } else {
                    url.host_str().unwrap_or_default().to_string()
                };
                Ok(Self::local(path))
            }
            other => bail!("unsupported endpoint scheme {other:?} in {raw:?}"),
        }
    }

    fn parse_bare(raw: &str) -> Result<Self> {
        if raw.contains('/') || raw.contains('\\') {
            return Ok(Self::local(raw.to_string()));
        }
        if let Some((host, port_str)) = raw.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                return Ok(Self::tcp(host.to_string(), port));
            }
        }
        Ok(Self::tcp(raw.to_string(), DEFAULT_PORT))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Co4 => write!(f, "co4://{}:{}", self.host, self.port),
            Scheme::Local => write!(f, "local://{}", self.path),
        }
    }
}
