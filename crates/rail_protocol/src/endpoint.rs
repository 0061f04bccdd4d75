use std::{fmt, path::PathBuf, str::FromStr};

use thiserror::Error;

use crate::transport::StreamTransport;

/// Where a broker listens and clients connect.
///
/// Written as `unix:/tmp/railhost.sock`, `tcp:127.0.0.1:7878`,
/// `pipe:\\.\pipe\railhost` or `stdio`. A bare path is taken as a Unix socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
    Pipe(String),
    Stdio,
}

#[derive(Debug, Error)]
#[error("invalid endpoint '{0}': expected unix:<path>, tcp:<host:port>, pipe:<name> or stdio")]
pub struct EndpointParseError(String);

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bad = || EndpointParseError(s.to_string());
        if s.eq_ignore_ascii_case("stdio") {
            return Ok(Endpoint::Stdio);
        }
        match s.split_once(':') {
            Some(("unix", path)) if !path.is_empty() => Ok(Endpoint::Unix(PathBuf::from(path))),
            Some(("tcp", addr)) if addr.contains(':') => Ok(Endpoint::Tcp(addr.to_string())),
            Some(("pipe", name)) if !name.is_empty() => Ok(Endpoint::Pipe(name.to_string())),
            Some(("unix" | "tcp" | "pipe", _)) => Err(bad()),
            _ if s.starts_with('/') || s.starts_with('.') => Ok(Endpoint::Unix(PathBuf::from(s))),
            _ => Err(bad()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
            Endpoint::Tcp(addr) => write!(f, "tcp:{addr}"),
            Endpoint::Pipe(name) => write!(f, "pipe:{name}"),
            Endpoint::Stdio => f.write_str("stdio"),
        }
    }
}

impl Endpoint {
    /// Opens a client connection to this endpoint.
    pub async fn connect(&self) -> std::io::Result<StreamTransport> {
        let label = self.to_string();
        match self {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(StreamTransport::from_stream(label, stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(unsupported(&label)),
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(StreamTransport::from_stream(label, stream))
            }
            #[cfg(windows)]
            Endpoint::Pipe(name) => {
                let pipe = tokio::net::windows::named_pipe::ClientOptions::new().open(name)?;
                Ok(StreamTransport::from_stream(label, pipe))
            }
            #[cfg(not(windows))]
            Endpoint::Pipe(_) => Err(unsupported(&label)),
            Endpoint::Stdio => Ok(StreamTransport::stdio()),
        }
    }
}

fn unsupported(label: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("{label} is not supported on this platform"),
    )
}
