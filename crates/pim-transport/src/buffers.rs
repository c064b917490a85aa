//! Host-side staging arena.
//!
//! One fixed-stride slot per unit slot in the array, enabled or not, so
//! slot lookup is pure arithmetic. The backing store is a single
//! `Vec<u64>`; the transfer engine reinterprets slots as byte lanes with
//! [`bytemuck`] and never copies through an intermediate.

use crate::error::{PimError, Result};
use crate::topology::Topology;
use pim_rank::geometry::{self, UNITS_PER_RANK};

/// Per-unit staging buffers for a whole rank array.
#[derive(Debug)]
pub struct UnitBuffers {
    data: Vec<u64>,
    slot_words: usize,
    /// Enabled mask per rank, copied from the topology at build time.
    enabled: Vec<u64>,
}

impl UnitBuffers {
    /// Allocate a zeroed arena shaped for `topo`, `slot_len` bytes per
    /// unit slot.
    ///
    /// # Errors
    ///
    /// `slot_len` must be a positive multiple of 8; transfers move whole
    /// 64-bit words and the arena stride has to honor that.
    pub fn for_topology(topo: &Topology, slot_len: usize) -> Result<Self> {
        if slot_len == 0 || slot_len % 8 != 0 {
            return Err(PimError::arena_mismatch(format!(
                "slot stride {slot_len} bytes; need a positive multiple of 8"
            )));
        }
        let slot_words = slot_len / 8;
        let data = vec![0u64; topo.slot_count() * slot_words];
        let enabled = topo.ranks().iter().map(|r| r.enabled).collect();
        Ok(Self { data, slot_words, enabled })
    }

    /// Stride of one slot in bytes.
    #[must_use]
    pub fn slot_len(&self) -> usize {
        self.slot_words * 8
    }

    /// Total slots, live or not.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.enabled.len() * UNITS_PER_RANK
    }

    /// Ranks this arena was shaped for.
    #[must_use]
    pub fn rank_count(&self) -> usize {
        self.enabled.len()
    }

    /// Whether `global_slot` holds a live unit.
    #[must_use]
    pub fn is_enabled(&self, global_slot: usize) -> bool {
        let rank = geometry::rank_of_global(global_slot);
        let slot = geometry::slot_of_global(global_slot);
        self.enabled.get(rank).is_some_and(|mask| mask & (1 << slot) != 0)
    }

    /// Bytes of a live slot, `None` when the slot is dead or out of range.
    #[must_use]
    pub fn slot(&self, global_slot: usize) -> Option<&[u8]> {
        self.is_enabled(global_slot).then(|| self.raw_slot(global_slot))
    }

    /// Mutable bytes of a live slot.
    #[must_use]
    pub fn slot_mut(&mut self, global_slot: usize) -> Option<&mut [u8]> {
        if !self.is_enabled(global_slot) {
            return None;
        }
        let range = global_slot * self.slot_words..(global_slot + 1) * self.slot_words;
        Some(bytemuck::cast_slice_mut(&mut self.data[range]))
    }

    /// Words of a live slot.
    #[must_use]
    pub fn words(&self, global_slot: usize) -> Option<&[u64]> {
        if !self.is_enabled(global_slot) {
            return None;
        }
        Some(&self.data[global_slot * self.slot_words..(global_slot + 1) * self.slot_words])
    }

    /// Mutable words of a live slot.
    #[must_use]
    pub fn words_mut(&mut self, global_slot: usize) -> Option<&mut [u64]> {
        if !self.is_enabled(global_slot) {
            return None;
        }
        Some(&mut self.data[global_slot * self.slot_words..(global_slot + 1) * self.slot_words])
    }

    /// Bytes of any slot, live or dead. Dead slots stay zero across
    /// transfers; tests lean on that.
    ///
    /// # Panics
    ///
    /// When `global_slot` is out of range.
    #[must_use]
    pub fn raw_slot(&self, global_slot: usize) -> &[u8] {
        assert!(global_slot < self.slot_count(), "slot {global_slot} out of range");
        let words = &self.data[global_slot * self.slot_words..(global_slot + 1) * self.slot_words];
        bytemuck::cast_slice(words)
    }

    /// Global indices of live slots, ascending.
    pub fn enabled_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.slot_count()).filter(|&g| self.is_enabled(g))
    }

    /// Run `f` over every live slot in ascending order. `ordinal` counts
    /// live slots only, so a dense input stream lands on dense units even
    /// when the array has holes.
    pub fn fill_enabled(&mut self, mut f: impl FnMut(usize, usize, &mut [u8])) {
        let slot_words = self.slot_words;
        let enabled = &self.enabled;
        let mut ordinal = 0;
        for (global, chunk) in self.data.chunks_exact_mut(slot_words).enumerate() {
            let rank = geometry::rank_of_global(global);
            let slot = geometry::slot_of_global(global);
            if enabled[rank] & (1 << slot) != 0 {
                f(ordinal, global, bytemuck::cast_slice_mut(chunk));
                ordinal += 1;
            }
        }
    }

    /// Per-rank slot views for the engine's gather pass. Dead slots are
    /// `None`.
    pub(crate) fn rank_views(&self) -> Vec<[Option<&[u8]>; UNITS_PER_RANK]> {
        let mut views: Vec<[Option<&[u8]>; UNITS_PER_RANK]> =
            (0..self.enabled.len()).map(|_| [None; UNITS_PER_RANK]).collect();
        for (global, chunk) in self.data.chunks_exact(self.slot_words).enumerate() {
            let rank = geometry::rank_of_global(global);
            let slot = geometry::slot_of_global(global);
            if self.enabled[rank] & (1 << slot) != 0 {
                views[rank][slot] = Some(bytemuck::cast_slice(chunk));
            }
        }
        views
    }

    /// Per-rank mutable slot views for the engine's scatter pass.
    pub(crate) fn rank_views_mut(&mut self) -> Vec<[Option<&mut [u8]>; UNITS_PER_RANK]> {
        let enabled = &self.enabled;
        let mut views: Vec<[Option<&mut [u8]>; UNITS_PER_RANK]> =
            (0..enabled.len()).map(|_| std::array::from_fn(|_| None)).collect();
        for (global, chunk) in self.data.chunks_exact_mut(self.slot_words).enumerate() {
            let rank = geometry::rank_of_global(global);
            let slot = geometry::slot_of_global(global);
            if enabled[rank] & (1 << slot) != 0 {
                views[rank][slot] = Some(bytemuck::cast_slice_mut(chunk));
            }
        }
        views
    }

    /// Check shape against a topology before a transfer touches hardware.
    pub(crate) fn matches(&self, topo: &Topology) -> Result<()> {
        if self.rank_count() != topo.rank_count() {
            return Err(PimError::arena_mismatch(format!(
                "arena spans {} rank(s), topology has {}",
                self.rank_count(),
                topo.rank_count()
            )));
        }
        for (rank, info) in topo.ranks().iter().enumerate() {
            if self.enabled[rank] != info.enabled {
                return Err(PimError::arena_mismatch(format!(
                    "rank {rank}: arena mask {:#x}, topology mask {:#x}",
                    self.enabled[rank], info.enabled
                )));
            }
        }
        Ok(())
    }
}
