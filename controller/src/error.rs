use std::path::PathBuf;
use std::{error::Error, fmt, io};

/// The controller module's result type.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// Setup-level failures on the controlling side. A severed transport on
/// a live node is deliberately not represented here: it surfaces as a
/// node-down event and never aborts the run.
#[derive(Debug)]
pub enum ControllerError {
    /// A worker specification string could not be parsed.
    BadSpec { spec: String, reason: String },
    /// Handshake or readiness did not complete in time.
    SetupTimeout { what: &'static str },
    /// Launching a gateway failed.
    Launch { spec: String, source: io::Error },
    /// Replicating a sync root failed.
    Sync { path: PathBuf, source: io::Error },
    /// An underlying I/O error not covered by the above variants.
    Io(io::Error),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadSpec { spec, reason } => write!(f, "bad worker spec {spec:?}: {reason}"),
            Self::SetupTimeout { what } => write!(f, "timed out waiting for {what}"),
            Self::Launch { spec, source } => write!(f, "failed to launch {spec:?}: {source}"),
            Self::Sync { path, source } => {
                write!(f, "failed to sync {}: {source}", path.display())
            }
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for ControllerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Launch { source, .. } | Self::Sync { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ControllerError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
