//! Rank array topology.
//!
//! Everything here is runtime-discovered from the accelerator runtime,
//! never assumed: rank count, per-rank enabled masks, bank lengths, and
//! the mode that decides whether the bypass path is legal. The transfer
//! paths consult this model; they do not re-derive it.

use crate::error::{PimError, Result};
use pim_rank::geometry::{MAX_RANKS, UNITS_PER_RANK};
use tracing::info;

/// Mode a rank was brought up in.
///
/// Performance mode exposes the rank's physical window for direct host
/// access; interpreted mode keeps every access behind the runtime's
/// descriptor path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankMode {
    /// Window-mapped; bypass transfers are legal.
    Performance,
    /// Descriptor path only.
    Interpreted,
}

/// One rank as the runtime reported it.
#[derive(Debug, Clone)]
pub struct RankInfo {
    /// Position in the rank array.
    pub ordinal: usize,
    /// Addressable unit slots (hardware tops out at 64).
    pub slots: usize,
    /// Bitmask of slots with live units.
    pub enabled: u64,
    /// Per-unit main-bank bytes. Power of two; production silicon is
    /// 64 MiB, the software runtime reports less.
    pub bank_len: u64,
    /// Per-unit scratchpad bytes.
    pub scratchpad_len: u64,
    /// Bring-up mode.
    pub mode: RankMode,
}

impl RankInfo {
    /// Whether bypass transfers may target this rank.
    ///
    /// Decided from the mode alone, once, at transport setup; per-call
    /// code never re-probes.
    #[must_use]
    pub fn supports_bypass(&self) -> bool {
        matches!(self.mode, RankMode::Performance)
    }

    /// Live units on this rank.
    #[must_use]
    pub fn enabled_units(&self) -> usize {
        self.enabled.count_ones() as usize
    }

    /// Whether `slot` holds a live unit.
    #[must_use]
    pub fn is_enabled(&self, slot: usize) -> bool {
        slot < self.slots && self.enabled & (1 << slot) != 0
    }

    fn validate(&self) -> Result<()> {
        if self.slots == 0 || self.slots > UNITS_PER_RANK {
            return Err(PimError::bad_topology(format!(
                "rank {}: {} slots (hardware carries 1..={UNITS_PER_RANK})",
                self.ordinal, self.slots
            )));
        }
        if self.slots < 64 && self.enabled >> self.slots != 0 {
            return Err(PimError::bad_topology(format!(
                "rank {}: enabled mask {:#x} exceeds {} slots",
                self.ordinal, self.enabled, self.slots
            )));
        }
        if self.bank_len < 8 || !self.bank_len.is_power_of_two() {
            return Err(PimError::bad_topology(format!(
                "rank {}: bank length {:#x} must be a power of two",
                self.ordinal, self.bank_len
            )));
        }
        if self.scratchpad_len % 8 != 0 {
            return Err(PimError::bad_topology(format!(
                "rank {}: scratchpad length {:#x} must be word-aligned",
                self.ordinal, self.scratchpad_len
            )));
        }
        Ok(())
    }
}

/// The whole rank array.
#[derive(Debug, Clone)]
pub struct Topology {
    ranks: Vec<RankInfo>,
}

impl Topology {
    /// Validate and adopt a rank list.
    ///
    /// # Errors
    ///
    /// Rejects empty or oversized arrays, out-of-order ordinals, and
    /// ranks that fail their own validation.
    pub fn new(ranks: Vec<RankInfo>) -> Result<Self> {
        if ranks.is_empty() {
            return Err(PimError::bad_topology("no ranks"));
        }
        if ranks.len() > MAX_RANKS {
            return Err(PimError::bad_topology(format!(
                "{} ranks (machine tops out at {MAX_RANKS})",
                ranks.len()
            )));
        }
        for (i, rank) in ranks.iter().enumerate() {
            if rank.ordinal != i {
                return Err(PimError::bad_topology(format!(
                    "rank at position {i} carries ordinal {}",
                    rank.ordinal
                )));
            }
            rank.validate()?;
        }

        let topo = Self { ranks };
        info!(
            "topology: {} rank(s), {} enabled unit(s), bypass {}",
            topo.rank_count(),
            topo.enabled_units(),
            if topo.supports_bypass() { "available" } else { "unavailable" },
        );
        Ok(topo)
    }

    /// Ranks in ordinal order.
    #[must_use]
    pub fn ranks(&self) -> &[RankInfo] {
        &self.ranks
    }

    /// Number of ranks.
    #[must_use]
    pub fn rank_count(&self) -> usize {
        self.ranks.len()
    }

    /// Live units across the array.
    #[must_use]
    pub fn enabled_units(&self) -> usize {
        self.ranks.iter().map(RankInfo::enabled_units).sum()
    }

    /// Unit slots across the array (live or not), one arena stride each.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.ranks.len() * UNITS_PER_RANK
    }

    /// Whether every rank takes bypass traffic.
    #[must_use]
    pub fn supports_bypass(&self) -> bool {
        self.ranks.iter().all(RankInfo::supports_bypass)
    }

    /// Whether a global slot holds a live unit.
    #[must_use]
    pub fn is_enabled(&self, global_slot: usize) -> bool {
        let rank = pim_rank::geometry::rank_of_global(global_slot);
        let slot = pim_rank::geometry::slot_of_global(global_slot);
        self.ranks.get(rank).is_some_and(|r| r.is_enabled(slot))
    }

    /// Smallest bank length across ranks; transfer bounds use this when a
    /// call spans the array.
    #[must_use]
    pub fn min_bank_len(&self) -> u64 {
        self.ranks.iter().map(|r| r.bank_len).min().unwrap_or(0)
    }

    /// Smallest scratchpad length across ranks.
    #[must_use]
    pub fn min_scratchpad_len(&self) -> u64 {
        self.ranks.iter().map(|r| r.scratchpad_len).min().unwrap_or(0)
    }
}
