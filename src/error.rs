// Error types shared by all NAT drivers

use thiserror::Error;

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, NatError>;

/// Errors reported by NAT drivers and their text adapters.
#[derive(Debug, Error)]
pub enum NatError {
    /// A required configuration key is absent.
    #[error("configuration missing {0}")]
    MissingConfig(&'static str),

    /// A configuration key holds a value of the wrong type or shape.
    #[error("configuration {key} value is not valid: {reason}")]
    InvalidConfig { key: &'static str, reason: String },

    /// The post-init probe failed, so the adapter has no usable NAT setup.
    #[error("NAT is not configured: {0}")]
    NotConfigured(#[source] Box<NatError>),

    /// No driver is registered under the requested name.
    #[error("driver name {0} is not supported")]
    UnsupportedDriver(String),

    /// The external tool could not be started at all.
    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The external tool ran and exited unsuccessfully.
    #[error("{command} failed ({status}): {stderr}{stdout}")]
    CommandFailed {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    /// The external tool exited successfully but printed something we did not expect.
    #[error("{command} returned unexpected output: {output}")]
    UnexpectedCommandOutput { command: String, output: String },

    /// The adapter exists but is not configured as a NAT interface.
    #[error("{0} is not a nat interface")]
    NotNatInterface(String),

    /// Listing output did not have a recognizable block structure.
    #[error("driver {driver} error, {operation} get unexpected output")]
    UnexpectedOutput {
        driver: &'static str,
        operation: &'static str,
    },

    /// A record in the command output could not be parsed.
    #[error("failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    /// A queued command batch stopped at its first failing command.
    #[error("batch stopped after {completed} of {total} commands: {source}")]
    BatchAborted {
        completed: usize,
        total: usize,
        #[source]
        source: Box<NatError>,
    },

    /// No configured mapping matches the one being deleted.
    #[error("no port mapping matches {0}")]
    MappingNotFound(String),

    /// A field value failed validation while encoding or decoding.
    #[error("{field} is not valid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl NatError {
    pub(crate) fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        NatError::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn parse(what: &'static str, detail: impl Into<String>) -> Self {
        NatError::Parse {
            what,
            detail: detail.into(),
        }
    }
}
