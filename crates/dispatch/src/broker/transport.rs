use std::fmt;

use fahrplan_core::{FahrplanError, Result};
use serde::{Deserialize, Serialize};

/// Broker transport selected by the scheme of `broker_url`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "address")]
pub enum Transport {
    /// In-process broker shared by every connection of an app.
    Memory,

    /// Unix domain socket path.
    Ipc(String),

    /// TCP endpoint.
    Tcp { host: String, port: u16 },
}

impl Transport {
    pub fn ipc(path: impl Into<String>) -> Self {
        Self::Ipc(path.into())
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Parse `memory://`, `ipc:///path/to.sock` or `tcp://host:port`.
    /// Credentials and a trailing virtual host are ignored.
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = url.split_once("://").ok_or_else(|| {
            FahrplanError::ImproperlyConfigured(format!("broker url '{url}' has no scheme"))
        })?;
        match scheme {
            "memory" => Ok(Self::Memory),
            "ipc" if !rest.is_empty() => Ok(Self::Ipc(rest.to_string())),
            "tcp" => {
                let authority = rest.split('/').next().unwrap_or_default();
                let host_port = authority.rsplit('@').next().unwrap_or(authority);
                let (host, port) = host_port.rsplit_once(':').ok_or_else(|| {
                    FahrplanError::ImproperlyConfigured(format!(
                        "broker url '{url}' is missing a port"
                    ))
                })?;
                let port = port.parse().map_err(|_| {
                    FahrplanError::ImproperlyConfigured(format!(
                        "broker url '{url}' has an invalid port"
                    ))
                })?;
                Ok(Self::tcp(host, port))
            }
            _ => Err(FahrplanError::ImproperlyConfigured(format!(
                "unsupported broker transport '{scheme}' in '{url}'"
            ))),
        }
    }

    /// The ZeroMQ endpoint address string.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Memory => "memory://".to_string(),
            Self::Ipc(path) => format!("ipc://{path}"),
            Self::Tcp { host, port } => format!("tcp://{host}:{port}"),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}
