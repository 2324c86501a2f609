//! Error type shared by every layer of the engine
//!
//! Each variant carries the legacy integer status code of the simulation
//! library so callers that persist or compare codes keep working.

use thiserror::Error;

/// Errors raised while building or running a simulation
#[derive(Error, Debug)]
pub enum SotlError {
    /// An allocation could not be satisfied
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// A caller-supplied value is out of range (capacity, bounds, counts)
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// More atoms were added than the set was declared with
    #[error("atom buffer full: {capacity} atoms already added")]
    BufferFull { capacity: usize },

    /// A back end id does not name an available device
    #[error("invalid device: {0}")]
    InvalidDevice(String),

    /// A back end was requested with the wrong kind of device
    #[error("invalid device type: {0}")]
    InvalidDeviceType(String),

    /// No adapter could be found for a kernel-dispatch back end
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Unknown parameter name or unusable parameter value
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A back end was driven out of its lifecycle order
    #[error("invalid state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    /// An atom left the padded grid, usually because the run diverged
    #[error("atom left the padded grid: {0}")]
    OutsideGrid(String),

    /// The operation exists in the interface but is not supported
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A config or dump file could not be read or written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A config file is malformed
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
}

impl SotlError {
    /// Legacy status code (negative, `0` is reserved for success)
    pub fn code(&self) -> i32 {
        match self {
            SotlError::OutOfMemory(_) => -1,
            SotlError::InvalidValue(_)
            | SotlError::InvalidState { .. }
            | SotlError::OutsideGrid(_) => -30,
            SotlError::BufferFull { .. } => -31,
            SotlError::InvalidDevice(_) => -32,
            SotlError::InvalidDeviceType(_) => -33,
            SotlError::DeviceNotFound(_) => -34,
            SotlError::InvalidParameter(_) => -35,
            SotlError::NotImplemented(_) => -99,
            SotlError::Io(_) | SotlError::Parse { .. } => -30,
        }
    }
}

impl From<std::collections::TryReserveError> for SotlError {
    fn from(err: std::collections::TryReserveError) -> Self {
        SotlError::OutOfMemory(err.to_string())
    }
}

/// Result type for engine operations
pub type SotlResult<T> = Result<T, SotlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_legacy_values() {
        assert_eq!(SotlError::OutOfMemory("x".into()).code(), -1);
        assert_eq!(SotlError::InvalidValue("x".into()).code(), -30);
        assert_eq!(SotlError::BufferFull { capacity: 3 }.code(), -31);
        assert_eq!(SotlError::InvalidDevice("x".into()).code(), -32);
        assert_eq!(SotlError::InvalidDeviceType("x".into()).code(), -33);
        assert_eq!(SotlError::DeviceNotFound("x".into()).code(), -34);
        assert_eq!(SotlError::InvalidParameter("x".into()).code(), -35);
        assert_eq!(SotlError::NotImplemented("x".into()).code(), -99);
        assert_eq!(SotlError::OutsideGrid("x".into()).code(), -30);
    }

    #[test]
    fn buffer_full_message_names_capacity() {
        let err = SotlError::BufferFull { capacity: 12 };
        assert_eq!(err.to_string(), "atom buffer full: 12 atoms already added");
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: SotlError = io.into();
        assert!(matches!(err, SotlError::Io(_)));
    }
}
