//! # SimGPU Error Handling
//!
//! Error types for the simulated memory model.
//!
//! Only configuration validation and capacity probing report errors as
//! values. Invariant violations inside the memory model are fatal: once a
//! translation or reservation is wrong the simulated image is already
//! inconsistent, so those paths log and abort instead of returning here.

use core::fmt;

use crate::types::MemoryBank;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// SimGPU Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// SimGPU unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid level count, fan-out, page size or bank layout
    InvalidConfiguration,

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Bank does not exist in this configuration
    InvalidBank(MemoryBank),
    /// Reservation would run past the end of the bank
    OutOfBankMemory {
        /// Bank the reservation targeted
        bank: MemoryBank,
        /// Bytes requested
        requested: u64,
    },
    /// Virtual address wider than the translation tree
    AddressOutOfRange {
        /// Offending address
        addr: u64,
        /// Address bits covered by the tree
        bits: u32,
    },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Simulated memory differs from the expected contents
    Mismatch {
        /// Byte offset of the first difference
        offset: u64,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::InvalidConfiguration => write!(f, "invalid memory configuration"),
            Self::InvalidBank(bank) => write!(f, "memory bank {} does not exist", bank),
            Self::OutOfBankMemory { bank, requested } => {
                write!(f, "bank {} exhausted reserving {:#x} bytes", bank, requested)
            },
            Self::AddressOutOfRange { addr, bits } => {
                write!(f, "address {:#x} exceeds {}-bit translation range", addr, bits)
            },
            Self::Mismatch { offset } => {
                write!(f, "memory mismatch at offset {:#x}", offset)
            },
        }
    }
}
