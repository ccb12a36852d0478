//! Error taxonomy shared by every layer of the library.
//!
//! Failures during expression building and validation are raised
//! synchronously; failures inside tasks are recorded on the owning
//! expression (first writer wins) and flip its cancel flag. A failure may
//! additionally be flagged *critical*, which raises the log severity of the
//! record; the library never aborts the process on its own.

use std::fmt;

/// Machine-readable failure category.
///
/// The set is closed; integrating CLIs map each category onto a stable
/// non-zero exit code via [`Status::exit_code`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// Catch-all, preserved for diagnostic propagation.
    Error,
    /// Accelerator reported a fault during context creation or kernel build.
    DeviceError,
    /// No compute device matches the requested constraints.
    DeviceNotPresent,
    /// Allocation or copy to/from the accelerator failed.
    MemOpFailed,
    /// User-supplied value is out of its documented range.
    InvalidArgument,
    /// Combination of flags/arguments is internally inconsistent.
    InvalidState,
    /// Operator signature disagrees with tensor/scalar element types.
    TypeMismatch,
    /// Named element type is not registered in the catalogue.
    UnknownType,
    /// The registry holds no entry capable of processing a params instance.
    NoAlgorithm,
    /// Operation recognised but this build lacks an implementation for the
    /// requested format combination.
    NotImplemented,
}

impl Status {
    /// Stable non-zero exit code for integrating command-line drivers.
    pub fn exit_code(self) -> i32 {
        match self {
            Status::Error => 1,
            Status::DeviceError => 2,
            Status::DeviceNotPresent => 3,
            Status::MemOpFailed => 4,
            Status::InvalidArgument => 5,
            Status::InvalidState => 6,
            Status::TypeMismatch => 7,
            Status::UnknownType => 8,
            Status::NoAlgorithm => 9,
            Status::NotImplemented => 10,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Error => "error",
            Status::DeviceError => "device error",
            Status::DeviceNotPresent => "device not present",
            Status::MemOpFailed => "memory operation failed",
            Status::InvalidArgument => "invalid argument",
            Status::InvalidState => "invalid state",
            Status::TypeMismatch => "type mismatch",
            Status::UnknownType => "unknown type",
            Status::NoAlgorithm => "no algorithm",
            Status::NotImplemented => "not implemented",
        };
        f.write_str(s)
    }
}

/// Library error: a status category plus a human-readable message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{status}: {message}")]
pub struct Error {
    status: Status,
    message: String,
    critical: bool,
}

impl Error {
    /// Create a new recoverable error.
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            critical: false,
        }
    }

    /// Create a critical error; the scheduler logs these at `error` level.
    pub fn critical(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            critical: true,
        }
    }

    /// Failure category.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Human-readable message (no stable format guarantee).
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the failure is classified critical.
    pub fn is_critical(&self) -> bool {
        self.critical
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

macro_rules! error_ctor {
    ($(#[$doc:meta] $fn_name:ident => $status:ident),* $(,)?) => {
        impl Error {
            $(
                #[$doc]
                pub fn $fn_name(message: impl Into<String>) -> Self {
                    Self::new(Status::$status, message)
                }
            )*
        }
    };
}

error_ctor! {
    /// Shorthand for [`Status::Error`].
    generic => Error,
    /// Shorthand for [`Status::DeviceError`].
    device => DeviceError,
    /// Shorthand for [`Status::DeviceNotPresent`].
    device_not_present => DeviceNotPresent,
    /// Shorthand for [`Status::MemOpFailed`].
    mem_op_failed => MemOpFailed,
    /// Shorthand for [`Status::InvalidArgument`].
    invalid_argument => InvalidArgument,
    /// Shorthand for [`Status::InvalidState`].
    invalid_state => InvalidState,
    /// Shorthand for [`Status::TypeMismatch`].
    type_mismatch => TypeMismatch,
    /// Shorthand for [`Status::UnknownType`].
    unknown_type => UnknownType,
    /// Shorthand for [`Status::NoAlgorithm`].
    no_algorithm => NoAlgorithm,
    /// Shorthand for [`Status::NotImplemented`].
    not_implemented => NotImplemented,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_and_nonzero() {
        let all = [
            Status::Error,
            Status::DeviceError,
            Status::DeviceNotPresent,
            Status::MemOpFailed,
            Status::InvalidArgument,
            Status::InvalidState,
            Status::TypeMismatch,
            Status::UnknownType,
            Status::NoAlgorithm,
            Status::NotImplemented,
        ];
        let mut codes: Vec<i32> = all.iter().map(|s| s.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
        assert!(codes.iter().all(|&c| c != 0));
    }

    #[test]
    fn display_carries_status_and_message() {
        let e = Error::type_mismatch("op signature i32 vs f64");
        assert_eq!(e.status(), Status::TypeMismatch);
        assert!(!e.is_critical());
        assert_eq!(e.to_string(), "type mismatch: op signature i32 vs f64");
    }

    #[test]
    fn critical_flag_survives() {
        let e = Error::critical(Status::DeviceError, "context lost");
        assert!(e.is_critical());
    }
}
