//! The byte-stream transport: a TCP socket for `co4://` endpoints or a
//! Unix-domain socket for `local://` endpoints.
//!
//! The transport is exclusively owned by the connection manager: nothing
//! else creates or destroys one. This module only knows how to open,
//! clone, and shut one down; framing and message semantics live in
//! [`crate::codec`] and [`crate::session`].

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::endpoint::{Endpoint, Scheme};

/// A short bound on the initial connect attempt — long enough to
/// distinguish "refused" from "hanging", short enough that a dead
/// candidate does not stall the failover walk.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// An open connection to a broker, either TCP or a local-domain socket.
#[derive(Debug)]
pub enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Local(std::os::unix::net::UnixStream),
}

impl Transport {
    /// Opens a new transport for `endpoint`, bounded by [`CONNECT_TIMEOUT`].
    pub fn connect(endpoint: &Endpoint) -> Result<Self> {
        match endpoint.scheme() {
            Scheme::Co4 => {
                let addr = format!("{}:{}", endpoint.host(), endpoint.port());
                let mut last_err = None;
                for sock_addr in std::net::ToSocketAddrs::to_socket_addrs(&addr)
                    .with_context(|| format!("resolve {addr}"))?
                {
                    match TcpStream::connect_timeout(&sock_addr, CONNECT_TIMEOUT) {
                        Ok(stream) => return Ok(Self::Tcp(stream)),
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(last_err
                    .map(anyhow::Error::from)
                    .unwrap_or_else(|| anyhow::anyhow!("no addresses for {addr}")))
            }
            Scheme::Local => {
                #[cfg(unix)]
                {
                    let stream = std::os::unix::net::UnixStream::connect(endpoint.path())
                        .with_context(|| format!("connect to local socket {}", endpoint.path()))?;
                    Ok(Self::Local(stream))
                }
                #[cfg(not(unix))]
                {
                    anyhow::bail!("local-domain sockets are not supported on this platform")
                }
            }
        }
    }

    /// Returns `true` when the connect error represents "connection
    /// refused" (eligible for a local broker auto-spawn) rather than some
    /// other failure (host unreachable, DNS failure, timeout).
    #[must_use]
    pub fn is_refused(err: &anyhow::Error) -> bool {
        err.downcast_ref::<io::Error>()
            .map(|e| e.kind() == io::ErrorKind::ConnectionRefused)
            .unwrap_or(false)
    }

    pub fn try_clone(&self) -> Result<Self> {
        match self {
            Self::Tcp(s) => Ok(Self::Tcp(s.try_clone().context("clone tcp stream")?)),
            #[cfg(unix)]
            Self::Local(s) => Ok(Self::Local(s.try_clone().context("clone unix stream")?)),
        }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match self {
            Self::Tcp(s) => s.set_read_timeout(timeout).context("set tcp read timeout"),
            #[cfg(unix)]
            Self::Local(s) => s.set_read_timeout(timeout).context("set unix read timeout"),
        }
    }

    /// Bounded wait for a write to land; a short timeout here is
    /// acceptable back-pressure rather than a hard failure.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match self {
            Self::Tcp(s) => s.set_write_timeout(timeout).context("set tcp write timeout"),
            #[cfg(unix)]
            Self::Local(s) => s.set_write_timeout(timeout).context("set unix write timeout"),
        }
    }

    pub fn shutdown(&self) {
        match self {
            Self::Tcp(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
            #[cfg(unix)]
            Self::Local(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Self::Local(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Self::Local(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Self::Local(s) => s.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn connect_refused_is_detected() {
        // Bind then immediately drop to free the port but make refusal likely;
        // more reliably, connect to a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::tcp("127.0.0.1", port);
        let result = Transport::connect(&endpoint);
        assert!(result.is_err());
        if let Err(e) = result {
            assert!(Transport::is_refused(&e), "expected connection-refused, got {e:?}");
        }
    }

    #[test]
    fn connect_and_exchange_bytes_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let endpoint = Endpoint::tcp("127.0.0.1", port);
        let mut transport = Transport::connect(&endpoint).unwrap();
        transport.write_all(b"hello").unwrap();
        let mut echoed = [0u8; 5];
        transport.read_exact(&mut echoed).unwrap();
        assert_eq!(&echoed, b"hello");

        handle.join().unwrap();
    }
}
