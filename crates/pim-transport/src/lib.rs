//! Host-side transport for in-DRAM compute ranks.
//!
//! The units of a PIM rank sit behind a memory controller that
//! interleaves every 64-byte cache line across eight of them at byte
//! granularity and scatters bank addresses through each rank's physical
//! window by a fixed bit permutation. Host code that wants per-unit
//! memory in linear order has two routes there:
//!
//! ```text
//! generic:  arena -> vendor runtime descriptors -> units
//!           (every memory kind, every rank mode, sync or async)
//!
//! bypass:   arena -> SIMD lane codec -> mapped rank window
//!           (main bank, performance-mode ranks, sync only;
//!            one scoped thread per rank)
//! ```
//!
//! [`select_transport`] probes the topology once and returns whichever
//! route is legal; both implement [`Transport`], so call sites never
//! branch again. The silicon contract itself (geometry, address
//! permutation, lane transpose, status registers) lives in `pim_rank`.
//!
//! # Quick start
//!
//! ```no_run
//! use pim_transport::{
//!     select_transport, LaunchMode, ProgramImage, RankRuntime, SoftwareRuntime,
//!     SymbolInfo, TransferMode, TransportSelection, UnitBuffers,
//! };
//!
//! # fn main() -> pim_transport::Result<()> {
//! let mut runtime = SoftwareRuntime::new(2)?;
//! runtime.load(
//!     &ProgramImage::new(&b"kernel image"[..])
//!         .with_symbol(SymbolInfo::main_bank("results", 0, 4096)),
//! )?;
//!
//! let topology = runtime.topology().clone();
//! let mut transport = select_transport(TransportSelection::Auto, runtime)?;
//!
//! let mut arena = UnitBuffers::for_topology(&topology, 4096)?;
//! transport.launch(LaunchMode::Sync)?;
//! transport.receive(&mut arena, "results", 0, 4096, TransferMode::Sync)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

mod buffers;
pub mod codec;
mod direct;
pub mod engine;
mod error;
pub mod exec;
pub mod region;
mod runtime;
pub mod software;
mod topology;
mod transport;

pub use buffers::UnitBuffers;
pub use codec::{CodecKind, LaneCodec};
pub use direct::DirectTransport;
pub use engine::RankEngine;
pub use error::{PimError, Result};
pub use exec::wait_ranks_idle;
pub use region::{memory_fence, RankRegion};
pub use runtime::{
    LaunchMode, MemoryKind, ProgramImage, RankRuntime, SymbolInfo, SymbolTable, TransferMode,
};
pub use software::{Fault, SoftwareConfig, SoftwareRuntime, UnitCtx, UnitProgram};
pub use topology::{RankInfo, RankMode, Topology};
pub use transport::{
    select_transport, RuntimeTransport, Transport, TransportKind, TransportSelection,
};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        select_transport, LaunchMode, PimError, ProgramImage, RankRuntime, Result,
        SoftwareRuntime, SymbolInfo, TransferMode, Transport, TransportSelection, UnitBuffers,
    };
}
