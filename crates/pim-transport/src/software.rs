//! Software rank runtime.
//!
//! Implements [`RankRuntime`] with in-process ranks so everything above
//! it runs without accelerator hardware. This enables:
//!
//! 1. **Bypass validation**: each rank's window is a host-backed
//!    [`RankRegion`] laid out in the real interleaved wire format, so the
//!    bypass engine runs against it unchanged.
//! 2. **Cross-checking by construction**: the descriptor path here goes
//!    through the staged-division translation oracle and the byte-lane
//!    definition, while the bypass engine uses the fast bit form and the
//!    SIMD codec. When generic and bypass transfers agree, two
//!    independent implementations of the hardware contract agree.
//! 3. **CI without hardware**: launch drives the real control-interface
//!    status words, so the poll-based `sync()` path is exercised too.
//!
//! Unit programs are host closures run at launch; they stand in for the
//! device kernels this layer never compiles.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use pim_rank::address;
use pim_rank::geometry::{self, INTERFACES_PER_RANK, LINE_BYTES, UNITS_PER_RANK};
use pim_rank::lanes;
use pim_rank::regs;
use tracing::{debug, info};

use crate::buffers::UnitBuffers;
use crate::error::{PimError, Result};
use crate::region::RankRegion;
use crate::runtime::{
    LaunchMode, MemoryKind, ProgramImage, RankRuntime, SymbolInfo, SymbolTable, TransferMode,
};
use crate::topology::{RankInfo, RankMode, Topology};

/// Shape of the simulated rank array.
#[derive(Debug, Clone)]
pub struct SoftwareConfig {
    /// Number of ranks.
    pub ranks: usize,
    /// Per-unit main-bank bytes. Small by default so windows stay cheap;
    /// the window for a bank is `window_span(bank_len)` bytes.
    pub bank_len: u64,
    /// Per-unit scratchpad bytes.
    pub scratchpad_len: u64,
    /// Enabled-slot mask per rank; ranks beyond the vector are fully
    /// populated.
    pub enabled: Vec<u64>,
    /// Mode per rank; ranks beyond the vector come up in performance
    /// mode.
    pub modes: Vec<RankMode>,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self {
            ranks: 1,
            bank_len: 16 << 10,
            scratchpad_len: 4 << 10,
            enabled: Vec::new(),
            modes: Vec::new(),
        }
    }
}

/// A unit program fault, carried into the interface status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// Code reported through the status word's fault field.
    pub code: u8,
}

impl Fault {
    /// Fault raised by [`UnitCtx`] accessors on a bad access.
    pub const BAD_ACCESS: Self = Self { code: 0x10 };

    /// A fault with an explicit code.
    #[must_use]
    pub fn new(code: u8) -> Self {
        Self { code }
    }
}

/// One unit's view during a launch: its scratchpad, its slice of the
/// bank, and its log buffer. Bank words go through the interleaved
/// window, so a program's writes land exactly where the hardware's
/// would.
pub struct UnitCtx<'a> {
    rank: usize,
    slot: usize,
    scratchpad: &'a mut Vec<u8>,
    log: &'a mut Vec<u8>,
    region: &'a RankRegion,
    bank_len: u64,
    symbols: &'a SymbolTable,
}

impl UnitCtx<'_> {
    /// Rank ordinal of this unit.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Slot within the rank.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Global slot index.
    #[must_use]
    pub fn global_slot(&self) -> usize {
        geometry::global_slot(self.rank, self.slot)
    }

    /// Read a word of `symbol + offset`, whichever memory it lives in.
    ///
    /// # Errors
    ///
    /// [`Fault::BAD_ACCESS`] for unknown symbols, misalignment, or
    /// out-of-range offsets.
    pub fn read_u64(&self, symbol: &str, offset: u64) -> std::result::Result<u64, Fault> {
        let (kind, base) = self.locate(symbol, offset)?;
        match kind {
            MemoryKind::Scratchpad => {
                let at = base as usize;
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&self.scratchpad[at..at + 8]);
                Ok(u64::from_le_bytes(bytes))
            }
            MemoryKind::MainBank => {
                let mut bytes = [0u8; 8];
                for (j, byte) in bytes.iter_mut().enumerate() {
                    *byte = self.region.read_u8(bank_byte(self.slot, base, j));
                }
                Ok(u64::from_le_bytes(bytes))
            }
        }
    }

    /// Write a word to `symbol + offset`.
    ///
    /// # Errors
    ///
    /// Same access faults as [`UnitCtx::read_u64`].
    pub fn write_u64(
        &mut self,
        symbol: &str,
        offset: u64,
        value: u64,
    ) -> std::result::Result<(), Fault> {
        let (kind, base) = self.locate(symbol, offset)?;
        let bytes = value.to_le_bytes();
        match kind {
            MemoryKind::Scratchpad => {
                let at = base as usize;
                self.scratchpad[at..at + 8].copy_from_slice(&bytes);
            }
            MemoryKind::MainBank => {
                for (j, &byte) in bytes.iter().enumerate() {
                    self.region.write_u8(bank_byte(self.slot, base, j), byte);
                }
            }
        }
        Ok(())
    }

    /// Append a line to this unit's log buffer.
    pub fn log(&mut self, line: &str) {
        self.log.extend_from_slice(line.as_bytes());
        self.log.push(b'\n');
    }

    fn locate(&self, symbol: &str, offset: u64) -> std::result::Result<(MemoryKind, u64), Fault> {
        let sym = self.symbols.get(symbol).ok_or(Fault::BAD_ACCESS)?;
        let base = sym.offset().checked_add(offset).ok_or(Fault::BAD_ACCESS)?;
        let end = base.checked_add(8).ok_or(Fault::BAD_ACCESS)?;
        let capacity = match sym.kind() {
            MemoryKind::Scratchpad => self.scratchpad.len() as u64,
            MemoryKind::MainBank => self.bank_len,
        };
        if base % 8 != 0 || end > capacity {
            return Err(Fault::BAD_ACCESS);
        }
        Ok((sym.kind(), base))
    }
}

/// A host closure standing in for a device kernel. Run once per enabled
/// unit at every launch.
pub trait UnitProgram: Send + Sync {
    /// Execute on one unit. An `Err` faults that unit's interface.
    fn run(&self, ctx: &mut UnitCtx<'_>) -> std::result::Result<(), Fault>;
}

impl<F> UnitProgram for F
where
    F: Fn(&mut UnitCtx<'_>) -> std::result::Result<(), Fault> + Send + Sync,
{
    fn run(&self, ctx: &mut UnitCtx<'_>) -> std::result::Result<(), Fault> {
        self(ctx)
    }
}

struct SoftUnit {
    scratchpad: Vec<u8>,
    log: Vec<u8>,
}

/// State one launch thread shares with the runtime.
struct SoftRank {
    region: RankRegion,
    units: Mutex<Vec<SoftUnit>>,
}

impl SoftRank {
    fn units(&self) -> std::sync::MutexGuard<'_, Vec<SoftUnit>> {
        self.units.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process [`RankRuntime`] for CI and validation.
pub struct SoftwareRuntime {
    topology: Topology,
    shared: Vec<Arc<SoftRank>>,
    symbols: Option<SymbolTable>,
    program: Option<Arc<dyn UnitProgram>>,
    in_flight: Vec<(usize, JoinHandle<Option<(usize, u8)>>)>,
}

impl SoftwareRuntime {
    /// Bring up `ranks` fully populated performance-mode ranks with the
    /// default bank and scratchpad sizes.
    ///
    /// # Errors
    ///
    /// Topology validation and window allocation failures.
    pub fn new(ranks: usize) -> Result<Self> {
        Self::with_config(SoftwareConfig { ranks, ..SoftwareConfig::default() })
    }

    /// Bring up a rank array shaped by `config`.
    ///
    /// # Errors
    ///
    /// Topology validation and window allocation failures.
    pub fn with_config(config: SoftwareConfig) -> Result<Self> {
        let ranks: Vec<RankInfo> = (0..config.ranks)
            .map(|ordinal| RankInfo {
                ordinal,
                slots: UNITS_PER_RANK,
                enabled: config.enabled.get(ordinal).copied().unwrap_or(u64::MAX),
                bank_len: config.bank_len,
                scratchpad_len: config.scratchpad_len,
                mode: config.modes.get(ordinal).copied().unwrap_or(RankMode::Performance),
            })
            .collect();
        let topology = Topology::new(ranks)?;

        let span = address::window_span(config.bank_len);
        let shared = (0..config.ranks)
            .map(|_| {
                let units = (0..UNITS_PER_RANK)
                    .map(|_| SoftUnit {
                        scratchpad: vec![0u8; config.scratchpad_len as usize],
                        log: Vec::new(),
                    })
                    .collect();
                Ok(Arc::new(SoftRank {
                    region: RankRegion::host_backed(span)?,
                    units: Mutex::new(units),
                }))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            ranks = config.ranks,
            bank_len = config.bank_len,
            window_span = span,
            "software rank array up"
        );
        Ok(Self { topology, shared, symbols: None, program: None, in_flight: Vec::new() })
    }

    /// Install the host closure run by every enabled unit at launch.
    /// Without one, launches complete as no-ops.
    pub fn set_unit_program(&mut self, program: impl UnitProgram + 'static) {
        self.program = Some(Arc::new(program));
    }

    fn loaded_symbols(&self) -> Result<&SymbolTable> {
        self.symbols.as_ref().ok_or(PimError::NoProgram)
    }

    fn check_copy(
        &self,
        buffers: &UnitBuffers,
        symbol: &str,
        offset: u64,
        len: usize,
    ) -> Result<(SymbolInfo, u64)> {
        let sym = self.loaded_symbols()?.resolve(symbol)?;
        buffers.matches(&self.topology)?;
        let len64 = len as u64;
        let capacity = match sym.kind() {
            MemoryKind::MainBank => self.topology.min_bank_len(),
            MemoryKind::Scratchpad => self.topology.min_scratchpad_len(),
        };
        let base = sym
            .offset()
            .checked_add(offset)
            .ok_or_else(|| PimError::out_of_bank(offset, len64, capacity))?;
        if base % 8 != 0 || len64 % 8 != 0 {
            return Err(PimError::misaligned(base, len64));
        }
        let end = base
            .checked_add(len64)
            .ok_or_else(|| PimError::out_of_bank(base, len64, capacity))?;
        if end > capacity {
            return Err(PimError::out_of_bank(base, len64, capacity));
        }
        if buffers.slot_len() < len {
            return Err(PimError::arena_mismatch(format!(
                "slot stride {} bytes, transfer moves {len}",
                buffers.slot_len()
            )));
        }
        Ok((sym, base))
    }

    fn reap(&mut self) -> Result<()> {
        let mut fault: Option<PimError> = None;
        for (rank, handle) in self.in_flight.drain(..) {
            match handle.join() {
                Ok(None) => {}
                Ok(Some((interface, code))) => {
                    fault.get_or_insert(PimError::UnitFault { rank, interface, code });
                }
                Err(_) => {
                    fault.get_or_insert(PimError::runtime_failed(format!(
                        "rank {rank} launch thread panicked"
                    )));
                }
            }
        }
        match fault {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl RankRuntime for SoftwareRuntime {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn load(&mut self, image: &ProgramImage) -> Result<()> {
        if !self.in_flight.is_empty() {
            return Err(PimError::LaunchInFlight);
        }
        self.symbols = Some(image.symbols().clone());
        info!(
            bytes = image.data().len(),
            symbols = image.symbols().len(),
            "software runtime: program loaded"
        );
        Ok(())
    }

    fn symbol(&self, name: &str) -> Result<SymbolInfo> {
        self.loaded_symbols()?.resolve(name)
    }

    fn copy_in(
        &mut self,
        buffers: &UnitBuffers,
        symbol: &str,
        offset: u64,
        len: usize,
        mode: TransferMode,
    ) -> Result<()> {
        let (sym, base) = self.check_copy(buffers, symbol, offset, len)?;
        if len == 0 {
            return Ok(());
        }
        debug!(symbol, base, len, ?mode, "descriptor copy-in");

        for rank in 0..self.topology.rank_count() {
            let shared = &self.shared[rank];
            let mut units = shared.units();
            for slot in 0..UNITS_PER_RANK {
                let global = geometry::global_slot(rank, slot);
                let Some(buf) = buffers.slot(global) else { continue };
                match sym.kind() {
                    MemoryKind::Scratchpad => {
                        let at = base as usize;
                        units[slot].scratchpad[at..at + len].copy_from_slice(&buf[..len]);
                    }
                    MemoryKind::MainBank => {
                        for (b, &value) in buf[..len].iter().enumerate() {
                            shared.region.write_u8(bank_byte(slot, base, b), value);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn copy_out(
        &mut self,
        buffers: &mut UnitBuffers,
        symbol: &str,
        offset: u64,
        len: usize,
        mode: TransferMode,
    ) -> Result<()> {
        let (sym, base) = self.check_copy(buffers, symbol, offset, len)?;
        if len == 0 {
            return Ok(());
        }
        debug!(symbol, base, len, ?mode, "descriptor copy-out");

        for rank in 0..self.topology.rank_count() {
            let shared = &self.shared[rank];
            let units = shared.units();
            for slot in 0..UNITS_PER_RANK {
                let global = geometry::global_slot(rank, slot);
                let Some(buf) = buffers.slot_mut(global) else { continue };
                match sym.kind() {
                    MemoryKind::Scratchpad => {
                        let at = base as usize;
                        buf[..len].copy_from_slice(&units[slot].scratchpad[at..at + len]);
                    }
                    MemoryKind::MainBank => {
                        for (b, byte) in buf[..len].iter_mut().enumerate() {
                            *byte = shared.region.read_u8(bank_byte(slot, base, b));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn launch(&mut self, mode: LaunchMode) -> Result<()> {
        let symbols = self.loaded_symbols()?.clone();
        if !self.in_flight.is_empty() {
            return Err(PimError::LaunchInFlight);
        }
        debug!(?mode, "launch");

        // Status words go to RUNNING before launch returns, so a poll
        // that starts immediately after an async launch cannot observe
        // idle-before-start.
        for (rank, info) in self.topology.ranks().iter().enumerate() {
            mark_running(&self.shared[rank], info);
        }

        match mode {
            LaunchMode::Sync => {
                let mut fault: Option<PimError> = None;
                for (rank, info) in self.topology.ranks().iter().enumerate() {
                    let outcome = run_rank(
                        &self.shared[rank],
                        info,
                        &symbols,
                        self.program.as_deref(),
                    );
                    if let Some((interface, code)) = outcome {
                        fault.get_or_insert(PimError::UnitFault { rank, interface, code });
                    }
                }
                match fault {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
            LaunchMode::Async => {
                for (rank, info) in self.topology.ranks().iter().enumerate() {
                    let shared = Arc::clone(&self.shared[rank]);
                    let info = info.clone();
                    let symbols = symbols.clone();
                    let program = self.program.clone();
                    let handle = std::thread::spawn(move || {
                        run_rank(&shared, &info, &symbols, program.as_deref())
                    });
                    self.in_flight.push((rank, handle));
                }
                Ok(())
            }
        }
    }

    fn wait(&mut self) -> Result<()> {
        self.reap()
    }

    fn window(&self, rank: usize) -> Option<&RankRegion> {
        let info = self.topology.ranks().get(rank)?;
        info.supports_bypass().then(|| &self.shared[rank].region)
    }

    fn read_log(&mut self, global_slot: usize, sink: &mut dyn io::Write) -> Result<()> {
        let rank = geometry::rank_of_global(global_slot);
        let slot = geometry::slot_of_global(global_slot);
        if !self.topology.is_enabled(global_slot) {
            return Err(PimError::runtime_failed(format!(
                "no live unit at global slot {global_slot}"
            )));
        }
        let shared = &self.shared[rank];
        let units = shared.units();
        sink.write_all(&units[slot].log)?;
        Ok(())
    }
}

/// Window byte address of one logical bank byte of one unit, built from
/// the staged-division oracle and the lane definition. The bypass engine
/// uses the fast form and the SIMD codec instead, so agreement between
/// the two paths cross-validates both.
fn bank_byte(slot: usize, base: u64, byte: usize) -> u64 {
    let word = byte / 8;
    let line = address::oracle::bank_to_window(
        base + word as u64 * 8,
        geometry::quad_of(slot) as u64,
    ) + if geometry::second_line(slot) { LINE_BYTES } else { 0 };
    line + lanes::line_byte(geometry::interface_of(slot), byte % 8) as u64
}

fn interface_populated(info: &RankInfo, interface: usize) -> bool {
    (0..geometry::MEMBERS_PER_INTERFACE)
        .any(|member| info.is_enabled(geometry::slot_index(interface, member)))
}

fn mark_running(shared: &SoftRank, info: &RankInfo) {
    for interface in 0..INTERFACES_PER_RANK {
        if interface_populated(info, interface) {
            shared.region.write_u64(regs::status_word_offset(interface), regs::running_word());
        }
    }
}

/// Run every enabled unit of one rank, then retire the status words.
/// Returns the first fault as (interface, code).
fn run_rank(
    shared: &SoftRank,
    info: &RankInfo,
    symbols: &SymbolTable,
    program: Option<&dyn UnitProgram>,
) -> Option<(usize, u8)> {
    let mut interface_faults: [Option<u8>; INTERFACES_PER_RANK] = [None; INTERFACES_PER_RANK];

    {
        let mut units = shared.units();
        for slot in 0..UNITS_PER_RANK {
            if !info.is_enabled(slot) {
                continue;
            }
            let SoftUnit { scratchpad, log } = &mut units[slot];
            let mut ctx = UnitCtx {
                rank: info.ordinal,
                slot,
                scratchpad,
                log,
                region: &shared.region,
                bank_len: info.bank_len,
                symbols,
            };
            let outcome = match program {
                Some(p) => p.run(&mut ctx),
                None => Ok(()),
            };
            if let Err(fault) = outcome {
                interface_faults[geometry::interface_of(slot)].get_or_insert(fault.code);
            }
        }
    }

    for interface in 0..INTERFACES_PER_RANK {
        if !interface_populated(info, interface) {
            continue;
        }
        let word = match interface_faults[interface] {
            Some(code) => regs::fault_word(code),
            None => regs::idle_word(),
        };
        shared.region.write_u64(regs::status_word_offset(interface), word);
    }

    interface_faults
        .into_iter()
        .enumerate()
        .find_map(|(interface, fault)| fault.map(|code| (interface, code)))
}
