//! Error types for the transport layer.
//!
//! One enum covers everything a caller can hit: request validation,
//! routing preconditions, launch state, and faults reported by the
//! hardware after a run.

use crate::runtime::MemoryKind;
use crate::topology::RankMode;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from transfers, launches, and setup.
#[derive(Debug, Error)]
pub enum PimError {
    /// Transfer offset or length breaks 8-byte word alignment.
    #[error("misaligned transfer: offset {offset:#x}, length {length:#x} (8-byte words required)")]
    Misaligned {
        /// Effective bank or scratchpad offset.
        offset: u64,
        /// Requested length in bytes.
        length: u64,
    },

    /// Transfer runs past the end of the per-unit memory.
    #[error("transfer escapes the bank: offset {offset:#x} + length {length:#x} > {bank_len:#x}")]
    OutOfBank {
        /// Effective offset.
        offset: u64,
        /// Requested length in bytes.
        length: u64,
        /// Per-unit memory length on the smallest rank touched.
        bank_len: u64,
    },

    /// A rank's mapped window is smaller than its bank scatter needs.
    #[error("rank {rank}: window holds {mapped:#x} bytes, scatter needs {needed:#x}")]
    WindowTooSmall {
        /// Rank ordinal.
        rank: usize,
        /// Mapped window length.
        mapped: u64,
        /// Required window length.
        needed: u64,
    },

    /// The loaded program does not declare the symbol.
    #[error("unknown symbol: {name}")]
    UnknownSymbol {
        /// Symbol name as requested.
        name: String,
    },

    /// The symbol lives in a different memory space than the call expects.
    #[error("symbol {name} is in {actual:?} space, call targets {wanted:?}")]
    WrongMemoryKind {
        /// Symbol name.
        name: String,
        /// Space the symbol resolves into.
        actual: MemoryKind,
        /// Space the call targets.
        wanted: MemoryKind,
    },

    /// Asynchronous transfer requested on the bypass path.
    #[error("bypass transfers are synchronous only; use the generic transport for async")]
    AsyncUnsupported,

    /// A rank cannot take bypass traffic in its current mode.
    #[error("rank {rank} is in {mode:?} mode; bypass needs performance mode")]
    ModeIncompatible {
        /// Rank ordinal.
        rank: usize,
        /// Mode the rank reported.
        mode: RankMode,
    },

    /// The runtime exposes no mapped window for the rank.
    #[error("rank {rank} exposes no mapped window")]
    NoWindow {
        /// Rank ordinal.
        rank: usize,
    },

    /// `launch` called while an asynchronous launch is outstanding.
    #[error("launch already outstanding; sync() first")]
    LaunchInFlight,

    /// No program has been loaded onto the ranks.
    #[error("no program loaded")]
    NoProgram,

    /// A unit faulted during execution.
    #[error("unit fault: rank {rank}, interface {interface}, code {code:#04x}")]
    UnitFault {
        /// Rank ordinal.
        rank: usize,
        /// Control interface reporting the fault.
        interface: usize,
        /// Fault code from the status word.
        code: u8,
    },

    /// Buffer arena does not match the topology the transport serves.
    #[error("buffer arena mismatch: {reason}")]
    ArenaMismatch {
        /// What differed.
        reason: String,
    },

    /// The runtime reported a rank layout this crate cannot serve.
    #[error("topology rejected: {reason}")]
    BadTopology {
        /// What was off.
        reason: String,
    },

    /// The accelerator runtime reported a failure.
    #[error("runtime failure: {reason}")]
    RuntimeFailed {
        /// Runtime's account of the failure.
        reason: String,
    },

    /// Mapping a rank window from a device path failed.
    #[error("cannot map rank window {path:?}: {source}")]
    RegionMap {
        /// Path handed to the mapper.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Plain I/O error (log readback sinks, image files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PimError {
    /// Misaligned-request constructor.
    pub fn misaligned(offset: u64, length: u64) -> Self {
        Self::Misaligned { offset, length }
    }

    /// Out-of-bank constructor.
    pub fn out_of_bank(offset: u64, length: u64, bank_len: u64) -> Self {
        Self::OutOfBank { offset, length, bank_len }
    }

    /// Unknown-symbol constructor.
    pub fn unknown_symbol(name: impl Into<String>) -> Self {
        Self::UnknownSymbol { name: name.into() }
    }

    /// Arena-mismatch constructor.
    pub fn arena_mismatch(reason: impl Into<String>) -> Self {
        Self::ArenaMismatch { reason: reason.into() }
    }

    /// Shorthand for [`PimError::BadTopology`].
    pub fn bad_topology(reason: impl Into<String>) -> Self {
        Self::BadTopology { reason: reason.into() }
    }

    /// Runtime-failure constructor.
    pub fn runtime_failed(reason: impl Into<String>) -> Self {
        Self::RuntimeFailed { reason: reason.into() }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, PimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_numbers() {
        let e = PimError::misaligned(0x41, 0x100);
        assert!(e.to_string().contains("0x41"));

        let e = PimError::out_of_bank(0x3f00, 0x200, 0x4000);
        assert!(e.to_string().contains("0x4000"));

        let e = PimError::UnitFault { rank: 1, interface: 3, code: 0x2a };
        let msg = e.to_string();
        assert!(msg.contains("rank 1") && msg.contains("interface 3") && msg.contains("0x2a"));

        let e = PimError::WrongMemoryKind {
            name: "frame".into(),
            actual: MemoryKind::Scratchpad,
            wanted: MemoryKind::MainBank,
        };
        let msg = e.to_string();
        assert!(msg.contains("frame") && msg.contains("Scratchpad"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "sink gone");
        let e: PimError = io.into();
        assert!(matches!(e, PimError::Io(_)));
    }
}
