//! Error taxonomy for the verification harness.
//!
//! Each component reports its own failure class: topology problems are
//! [`ResourceError`], injection/capture problems are [`TransportError`],
//! rule-management CLI problems are [`BackendError`], and unparseable
//! counter output is [`ParseError`]. "No reply within the timeout" is never
//! an error anywhere in the harness.

use std::io;
use std::process::ExitStatus;

/// Topology allocation or teardown infrastructure failure.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("topology setup failed: `{command}`: {stderr}")]
    Setup { command: String, stderr: String },

    #[error("topology teardown failed: `{command}`: {stderr}")]
    Teardown { command: String, stderr: String },

    #[error("could not run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Raised at scenario start after repeated teardown failures left
    /// virtual devices behind.
    #[error("giving up after {0} consecutive teardown failures")]
    Exhausted(u32),
}

/// Operational failure of packet injection or capture. A dropped packet is
/// not a transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("interface '{0}' does not exist")]
    InterfaceMissing(String),

    #[error("raw socket on '{iface}' requires CAP_NET_RAW: {source}")]
    PermissionDenied {
        iface: String,
        #[source]
        source: io::Error,
    },

    #[error("capture listener for '{0}' terminated")]
    CaptureClosed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// External rule-management command failure.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("could not invoke '{program}': {source}")]
    Unreachable {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// Backend counter output did not match the expected shape.
#[derive(Debug)]
pub struct ParseError {
    pub reason: String,
    pub line: Option<String>,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unparseable backend stats: {}", self.reason)?;
        if let Some(line) = &self.line {
            write!(f, " in line: {line:?}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

impl ParseError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            line: None,
        }
    }

    pub fn in_line(reason: impl Into<String>, line: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            line: Some(line.into()),
        }
    }
}

/// Any harness failure.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Parse(#[from] ParseError),
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
