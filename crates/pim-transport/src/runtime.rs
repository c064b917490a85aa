//! Accelerator runtime collaborator.
//!
//! Rank allocation, program loading, descriptor transfers, and launch all
//! belong to the vendor runtime; this crate talks to it through the
//! [`RankRuntime`] trait and nothing else. The trait is deliberately
//! narrow: the bypass path needs symbol resolution, the rank windows, and
//! the launch/wait primitives, and the generic path needs the descriptor
//! transfers. Everything beyond that stays on the runtime's side of the
//! fence.

use std::io;

use bytes::Bytes;
use pim_rank::address;

use crate::buffers::UnitBuffers;
use crate::error::{PimError, Result};
use crate::region::RankRegion;
use crate::topology::Topology;

/// Which per-unit memory a symbol lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// The 64 MiB-class main bank, reachable by the bypass path.
    MainBank,
    /// The small working scratchpad, descriptor path only.
    Scratchpad,
}

/// Whether a transfer call may return before the data has moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Data has moved when the call returns.
    Sync,
    /// The runtime may queue the descriptor; `wait()` is the sync point.
    Async,
}

/// Whether a launch call blocks until the units go idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Block until completion.
    Sync,
    /// Return immediately; completion is observed through `sync()`.
    Async,
}

/// One entry of a program's symbol table.
///
/// `raw_address` is the address as the image declares it: main-bank
/// symbols carry [`address::BANK_SPACE_FLAG`] in bit 27, scratchpad
/// symbols do not. The flag is an address-space tag, not part of the
/// offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    /// Symbol name as declared by the image.
    pub name: String,
    /// Tagged address straight from the image.
    pub raw_address: u32,
    /// Declared extent in bytes.
    pub len: u32,
}

impl SymbolInfo {
    /// A main-bank symbol at `offset` bytes into each unit's bank.
    #[must_use]
    pub fn main_bank(name: impl Into<String>, offset: u32, len: u32) -> Self {
        Self { name: name.into(), raw_address: offset | address::BANK_SPACE_FLAG, len }
    }

    /// A scratchpad symbol at `offset` bytes into each unit's scratchpad.
    #[must_use]
    pub fn scratchpad(name: impl Into<String>, offset: u32, len: u32) -> Self {
        Self { name: name.into(), raw_address: offset, len }
    }

    /// Which memory the symbol lives in, read off the address tag.
    #[must_use]
    pub fn kind(&self) -> MemoryKind {
        if address::is_bank_address(self.raw_address) {
            MemoryKind::MainBank
        } else {
            MemoryKind::Scratchpad
        }
    }

    /// Byte offset inside the symbol's memory, tag stripped.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(address::strip_bank_flag(self.raw_address))
    }
}

/// Name-to-address map of a loaded program. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<SymbolInfo>,
}

impl SymbolTable {
    /// Add or replace a symbol by name.
    pub fn insert(&mut self, symbol: SymbolInfo) {
        match self.symbols.iter_mut().find(|s| s.name == symbol.name) {
            Some(slot) => *slot = symbol,
            None => self.symbols.push(symbol),
        }
    }

    /// Look a symbol up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SymbolInfo> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// Look a symbol up, failing with the typed error transfers expect.
    ///
    /// # Errors
    ///
    /// [`PimError::UnknownSymbol`] when the name is absent.
    pub fn resolve(&self, name: &str) -> Result<SymbolInfo> {
        self.get(name).cloned().ok_or_else(|| PimError::unknown_symbol(name))
    }

    /// Number of symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Symbols in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &SymbolInfo> {
        self.symbols.iter()
    }
}

/// An opaque program image plus its declared symbols.
///
/// ELF parsing and relocation stay in the vendor toolchain; this layer
/// only forwards the blob and reads the table.
#[derive(Debug, Clone)]
pub struct ProgramImage {
    data: Bytes,
    symbols: SymbolTable,
}

impl ProgramImage {
    /// Wrap an image blob with an empty symbol table.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into(), symbols: SymbolTable::default() }
    }

    /// Builder-style symbol declaration.
    #[must_use]
    pub fn with_symbol(mut self, symbol: SymbolInfo) -> Self {
        self.symbols.insert(symbol);
        self
    }

    /// The raw image bytes.
    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// The declared symbols.
    #[must_use]
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }
}

/// The narrow interface to the vendor accelerator runtime.
///
/// Implementations own their ranks for the lifetime of the value and
/// release them on drop. All methods operate on the whole rank array; the
/// per-rank fan-out lives on the transport side.
pub trait RankRuntime: Send {
    /// The rank array this runtime brought up.
    fn topology(&self) -> &Topology;

    /// Load a program image into every enabled unit.
    ///
    /// # Errors
    ///
    /// Runtime-side load failures.
    fn load(&mut self, image: &ProgramImage) -> Result<()>;

    /// Resolve a symbol of the loaded program.
    ///
    /// # Errors
    ///
    /// [`PimError::NoProgram`] before a load, [`PimError::UnknownSymbol`]
    /// for names the image does not declare.
    fn symbol(&self, name: &str) -> Result<SymbolInfo>;

    /// Descriptor-path broadcast scatter: each enabled unit receives its
    /// own slot's first `len` bytes at `symbol + offset`.
    ///
    /// # Errors
    ///
    /// Validation failures (alignment, bounds, arena shape) and
    /// runtime-side transfer failures.
    fn copy_in(
        &mut self,
        buffers: &UnitBuffers,
        symbol: &str,
        offset: u64,
        len: usize,
        mode: TransferMode,
    ) -> Result<()>;

    /// Descriptor-path gather: each enabled unit's `len` bytes at
    /// `symbol + offset` land in its slot.
    ///
    /// # Errors
    ///
    /// Validation failures and runtime-side transfer failures.
    fn copy_out(
        &mut self,
        buffers: &mut UnitBuffers,
        symbol: &str,
        offset: u64,
        len: usize,
        mode: TransferMode,
    ) -> Result<()>;

    /// Boot the loaded program on every enabled unit.
    ///
    /// # Errors
    ///
    /// [`PimError::NoProgram`] before a load, [`PimError::LaunchInFlight`]
    /// while an async launch is outstanding, and runtime-side faults in
    /// sync mode.
    fn launch(&mut self, mode: LaunchMode) -> Result<()>;

    /// Block until the outstanding launch (if any) completes and reap it.
    ///
    /// # Errors
    ///
    /// Unit faults surfaced by the runtime.
    fn wait(&mut self) -> Result<()>;

    /// The mapped physical window of `rank`, when the bring-up mode
    /// exposes one.
    fn window(&self, rank: usize) -> Option<&RankRegion>;

    /// Stream one unit's log buffer into `sink`.
    ///
    /// # Errors
    ///
    /// Unknown slots and sink I/O failures.
    fn read_log(&mut self, global_slot: usize, sink: &mut dyn io::Write) -> Result<()>;
}
