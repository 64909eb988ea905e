// This module defines the error type shared by every layer of the harness using the thiserror
// crate. HarnessError covers the failure classes the harness can surface: invalid configuration
// (bad instruction set, feature variant, thread count or filter), resolution failures (missing
// class or method, or a dispatch-kind mismatch), backend compilation failures for one method,
// materialization failures when mapping code executable, and the two image reservation failures
// (address space unavailable, reservation already active). ErrorKind folds the variants back
// into the coarse categories callers usually branch on. HarnessResult<T> is the crate-wide
// alias. Nothing in the harness retries; every error is returned to the caller as soon as it
// is observed.

//! Error types for the compiler harness.

use crate::core::isa::InstructionSet;
use thiserror::Error;

/// Main error type for harness operations.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Configuration error: {reason}")]
    Configuration {
        reason: String,
    },

    #[error("Invalid {isa} feature variant: unknown token `{token}`")]
    InvalidVariant {
        isa: InstructionSet,
        token: String,
    },

    #[error("Resolution failed: {reason}")]
    Resolution {
        reason: String,
    },

    #[error("Compilation of {method} failed: {reason}")]
    Compilation {
        method: String,
        reason: String,
    },

    #[error("Materialization failed: {reason}")]
    Materialization {
        reason: String,
    },

    #[error("Cannot reserve {size} bytes at {base:#x}: {reason}")]
    OutOfAddressSpace {
        base: usize,
        size: usize,
        reason: String,
    },

    #[error("An image reservation is already active at {base:#x}")]
    AlreadyReserved {
        base: usize,
    },

    #[error("Code chunk of {size} bytes cannot be laid out with alignment {alignment}")]
    ArenaLayout {
        size: usize,
        alignment: usize,
    },
}

/// Coarse classification of [`HarnessError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Resolution,
    Compilation,
    Materialization,
    Reservation,
}

impl HarnessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarnessError::Configuration { .. } | HarnessError::InvalidVariant { .. } => {
                ErrorKind::Configuration
            }
            HarnessError::Resolution { .. } => ErrorKind::Resolution,
            HarnessError::Compilation { .. } | HarnessError::ArenaLayout { .. } => {
                ErrorKind::Compilation
            }
            HarnessError::Materialization { .. } => ErrorKind::Materialization,
            HarnessError::OutOfAddressSpace { .. } | HarnessError::AlreadyReserved { .. } => {
                ErrorKind::Reservation
            }
        }
    }

    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        HarnessError::Configuration {
            reason: reason.into(),
        }
    }

    pub(crate) fn resolution(reason: impl Into<String>) -> Self {
        HarnessError::Resolution {
            reason: reason.into(),
        }
    }

    pub(crate) fn compilation(method: impl Into<String>, reason: impl Into<String>) -> Self {
        HarnessError::Compilation {
            method: method.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn materialization(reason: impl Into<String>) -> Self {
        HarnessError::Materialization {
            reason: reason.into(),
        }
    }
}

/// Result type alias for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;
