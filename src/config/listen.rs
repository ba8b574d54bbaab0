//! Listen/endpoint specifications of the form `scheme://address`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::net::{TcpStream, UnixStream};

use crate::net::connection::BoxedIo;

/// Socket path used by `unix://default`, `unix:///` and `unix:///default`.
pub const DEFAULT_UNIX_SOCKET: &str = "/var/lib/mysql/mysql.sock";

/// Error type for listen spec parsing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ListenError {
    #[error("incorrect listen addr {0}: expected scheme://address")]
    Malformed(String),
    #[error("unsupported scheme {scheme} in {spec}")]
    UnknownScheme { scheme: String, spec: String },
    #[error("empty address in {0}")]
    EmptyAddress(String),
}

/// A parsed `tcp://` or `unix://` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenAddr {
    Tcp(String),
    Unix(PathBuf),
}

impl ListenAddr {
    /// Scheme name, as written in configuration.
    pub fn scheme(&self) -> &'static str {
        match self {
            ListenAddr::Tcp(_) => "tcp",
            ListenAddr::Unix(_) => "unix",
        }
    }

    /// Open an outbound stream to this endpoint.
    pub async fn connect(&self) -> std::io::Result<BoxedIo> {
        match self {
            ListenAddr::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            ListenAddr::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        }
    }
}

impl FromStr for ListenAddr {
    type Err = ListenError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let (scheme, addr) = spec
            .split_once("://")
            .ok_or_else(|| ListenError::Malformed(spec.to_string()))?;

        match scheme {
            "tcp" => {
                if addr.is_empty() {
                    return Err(ListenError::EmptyAddress(spec.to_string()));
                }
                Ok(ListenAddr::Tcp(addr.to_string()))
            }
            "unix" => {
                let path = match addr {
                    "" => return Err(ListenError::EmptyAddress(spec.to_string())),
                    "default" | "/" | "/default" => DEFAULT_UNIX_SOCKET,
                    other => other,
                };
                Ok(ListenAddr::Unix(PathBuf::from(path)))
            }
            other => Err(ListenError::UnknownScheme {
                scheme: other.to_string(),
                spec: spec.to_string(),
            }),
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "tcp://{}", addr),
            ListenAddr::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}
