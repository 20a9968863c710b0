//! Target URIs.
//!
//! - `tcp://host:port`
//! - `unix:///absolute/path` (Unix only)

use std::fmt;
use std::path::PathBuf;

use crate::error::{RSocketError, Result};

/// A parsed connection target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    /// `host:port`
    Tcp(String),
    Unix(PathBuf),
}

impl Target {
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = || RSocketError::InvalidUri(uri.to_string());

        if let Some(addr) = uri.strip_prefix("tcp://") {
            let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
            if host.is_empty() || port.parse::<u16>().is_err() {
                return Err(invalid());
            }
            return Ok(Target::Tcp(addr.to_string()));
        }

        if let Some(path) = uri.strip_prefix("unix://") {
            if !path.starts_with('/') || path.len() < 2 {
                return Err(invalid());
            }
            return Ok(Target::Unix(PathBuf::from(path)));
        }

        Err(invalid())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Tcp(addr) => write!(f, "tcp://{}", addr),
            Target::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}
