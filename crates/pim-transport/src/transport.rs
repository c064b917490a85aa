//! Transport facade.
//!
//! [`Transport`] is the surface host code programs against: bulk
//! transfers keyed by program symbol, launch, completion, and log
//! readback. Two implementations exist; [`select_transport`] picks one
//! at setup time and hands back an owned boxed value, so call sites
//! never branch on transport kind again.

use std::io;

use tracing::info;

use crate::buffers::UnitBuffers;
use crate::direct::DirectTransport;
use crate::error::Result;
use crate::runtime::{LaunchMode, RankRuntime, TransferMode};

/// Which route a transport takes to the units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Descriptor path through the vendor runtime.
    Generic,
    /// Host-side window path.
    Direct,
}

/// Transport choice at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportSelection {
    /// Bypass when the whole array supports it, descriptor path
    /// otherwise.
    #[default]
    Auto,
    /// Descriptor path unconditionally.
    ForceGeneric,
    /// Bypass or fail setup.
    ForceDirect,
}

/// Bulk transfer, launch, and log surface over a rank array.
pub trait Transport: Send {
    /// Which route this transport takes.
    fn kind(&self) -> TransportKind;

    /// Ranks served.
    fn rank_count(&self) -> usize;

    /// Live units served.
    fn unit_count(&self) -> usize;

    /// Broadcast scatter: each live unit receives its own slot's first
    /// `len` bytes at `symbol + offset`.
    ///
    /// # Errors
    ///
    /// Symbol, validation, and routing errors; see the implementations.
    fn send(
        &mut self,
        buffers: &UnitBuffers,
        symbol: &str,
        offset: u64,
        len: usize,
        mode: TransferMode,
    ) -> Result<()>;

    /// Gather: each live unit's `len` bytes at `symbol + offset` land in
    /// its slot.
    ///
    /// # Errors
    ///
    /// Symbol, validation, and routing errors; see the implementations.
    fn receive(
        &mut self,
        buffers: &mut UnitBuffers,
        symbol: &str,
        offset: u64,
        len: usize,
        mode: TransferMode,
    ) -> Result<()>;

    /// Boot the loaded program on every live unit.
    ///
    /// # Errors
    ///
    /// No program, launch re-entry, and sync-mode faults.
    fn launch(&mut self, mode: LaunchMode) -> Result<()>;

    /// Block until the outstanding launch completes.
    ///
    /// # Errors
    ///
    /// Unit faults raised during the run.
    fn sync(&mut self) -> Result<()>;

    /// Stream the logs of every live unit `filter` admits (by global
    /// slot) into `sink`, ascending.
    ///
    /// # Errors
    ///
    /// Runtime log readback and sink I/O failures.
    fn read_log(&mut self, filter: &dyn Fn(usize) -> bool, sink: &mut dyn io::Write)
        -> Result<()>;
}

/// Descriptor-path transport: every operation delegates to the vendor
/// runtime. Works for every memory kind, rank mode, and transfer mode.
pub struct RuntimeTransport<R> {
    runtime: R,
}

impl<R: RankRuntime> RuntimeTransport<R> {
    /// Wrap a runtime.
    pub fn new(runtime: R) -> Self {
        Self { runtime }
    }

    /// The wrapped runtime.
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// The wrapped runtime, mutably.
    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }
}

impl<R: RankRuntime> Transport for RuntimeTransport<R> {
    fn kind(&self) -> TransportKind {
        TransportKind::Generic
    }

    fn rank_count(&self) -> usize {
        self.runtime.topology().rank_count()
    }

    fn unit_count(&self) -> usize {
        self.runtime.topology().enabled_units()
    }

    fn send(
        &mut self,
        buffers: &UnitBuffers,
        symbol: &str,
        offset: u64,
        len: usize,
        mode: TransferMode,
    ) -> Result<()> {
        self.runtime.copy_in(buffers, symbol, offset, len, mode)
    }

    fn receive(
        &mut self,
        buffers: &mut UnitBuffers,
        symbol: &str,
        offset: u64,
        len: usize,
        mode: TransferMode,
    ) -> Result<()> {
        self.runtime.copy_out(buffers, symbol, offset, len, mode)
    }

    fn launch(&mut self, mode: LaunchMode) -> Result<()> {
        self.runtime.launch(mode)
    }

    fn sync(&mut self) -> Result<()> {
        self.runtime.wait()
    }

    fn read_log(
        &mut self,
        filter: &dyn Fn(usize) -> bool,
        sink: &mut dyn io::Write,
    ) -> Result<()> {
        read_logs(&mut self.runtime, filter, sink)
    }
}

/// Shared log readback loop: every live slot the filter admits, in
/// global order.
pub(crate) fn read_logs<R: RankRuntime>(
    runtime: &mut R,
    filter: &dyn Fn(usize) -> bool,
    sink: &mut dyn io::Write,
) -> Result<()> {
    let admitted: Vec<usize> = {
        let topo = runtime.topology();
        (0..topo.slot_count()).filter(|&g| topo.is_enabled(g) && filter(g)).collect()
    };
    for global in admitted {
        runtime.read_log(global, sink)?;
    }
    Ok(())
}

/// Pick a transport for `runtime` and hand it back as an owned value.
///
/// `Auto` takes the bypass route when every rank is bypass-capable and
/// exposes a large-enough window, and the descriptor route otherwise.
/// The forced selections override that probe.
///
/// # Errors
///
/// `ForceDirect` on an array that cannot take bypass traffic surfaces
/// the capability error; see [`DirectTransport::new`].
pub fn select_transport<R: RankRuntime + 'static>(
    selection: TransportSelection,
    runtime: R,
) -> Result<Box<dyn Transport>> {
    match selection {
        TransportSelection::ForceGeneric => Ok(Box::new(RuntimeTransport::new(runtime))),
        TransportSelection::ForceDirect => Ok(Box::new(DirectTransport::new(runtime)?)),
        TransportSelection::Auto => {
            if DirectTransport::available(&runtime) {
                Ok(Box::new(DirectTransport::new(runtime)?))
            } else {
                info!("bypass unavailable, taking the descriptor path");
                Ok(Box::new(RuntimeTransport::new(runtime)))
            }
        }
    }
}
