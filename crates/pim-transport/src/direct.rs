//! Bypass transport.
//!
//! Maps each rank's physical window and runs the transfer engine on the
//! host instead of descriptor-walking the vendor runtime. Only legal on
//! performance-mode ranks, for synchronous transfers, into main-bank
//! space; everything else routes back to the runtime. Capability is
//! checked once at construction, never per call.
//!
//! Transfers fan out one scoped thread per rank. The arena is split into
//! per-rank views first, so threads never alias; the first error in rank
//! order fails the call.

use std::io;
use std::thread;

use pim_rank::address;
use tracing::{debug, info};

use crate::buffers::UnitBuffers;
use crate::codec::LaneCodec;
use crate::engine::RankEngine;
use crate::error::{PimError, Result};
use crate::exec;
use crate::region::RankRegion;
use crate::runtime::{LaunchMode, MemoryKind, RankRuntime, TransferMode};
use crate::transport::{read_logs, Transport, TransportKind};

/// Window-path transport over a bypass-capable rank array.
pub struct DirectTransport<R> {
    runtime: R,
    codec: LaneCodec,
}

impl<R: RankRuntime> DirectTransport<R> {
    /// Take ownership of `runtime` and stand up the bypass path.
    ///
    /// # Errors
    ///
    /// [`PimError::ModeIncompatible`] when a rank is not in performance
    /// mode, [`PimError::NoWindow`] when one exposes no mapped window,
    /// [`PimError::WindowTooSmall`] when a window cannot hold the
    /// scatter of its bank.
    pub fn new(runtime: R) -> Result<Self> {
        validate_bypass(&runtime)?;
        let codec = LaneCodec::detect();
        info!(
            ranks = runtime.topology().rank_count(),
            codec = ?codec.kind(),
            "bypass transport up"
        );
        Ok(Self { runtime, codec })
    }

    /// Whether [`DirectTransport::new`] would succeed for `runtime`.
    #[must_use]
    pub fn available(runtime: &R) -> bool {
        validate_bypass(runtime).is_ok()
    }

    /// The wrapped runtime.
    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// The wrapped runtime, mutably.
    pub fn runtime_mut(&mut self) -> &mut R {
        &mut self.runtime
    }

    fn windows(&self) -> Result<Vec<(usize, &RankRegion, u64)>> {
        self.runtime
            .topology()
            .ranks()
            .iter()
            .map(|info| {
                let region = self
                    .runtime
                    .window(info.ordinal)
                    .ok_or(PimError::NoWindow { rank: info.ordinal })?;
                Ok((info.ordinal, region, info.bank_len))
            })
            .collect()
    }
}

fn validate_bypass<R: RankRuntime>(runtime: &R) -> Result<()> {
    for info in runtime.topology().ranks() {
        if !info.supports_bypass() {
            return Err(PimError::ModeIncompatible { rank: info.ordinal, mode: info.mode });
        }
        let region = runtime
            .window(info.ordinal)
            .ok_or(PimError::NoWindow { rank: info.ordinal })?;
        let needed = address::window_span(info.bank_len);
        if needed > region.len() {
            return Err(PimError::WindowTooSmall {
                rank: info.ordinal,
                mapped: region.len(),
                needed,
            });
        }
    }
    Ok(())
}

impl<R: RankRuntime> Transport for DirectTransport<R> {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
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
        let sym = self.runtime.symbol(symbol)?;
        if sym.kind() == MemoryKind::Scratchpad {
            debug!(symbol, "scratchpad symbol, routing to the descriptor path");
            return self.runtime.copy_in(buffers, symbol, offset, len, mode);
        }
        if mode == TransferMode::Async {
            return Err(PimError::AsyncUnsupported);
        }
        buffers.matches(self.runtime.topology())?;
        if len == 0 {
            return Ok(());
        }
        let min_bank = self.runtime.topology().min_bank_len();
        let base = sym
            .offset()
            .checked_add(offset)
            .ok_or_else(|| PimError::out_of_bank(offset, len as u64, min_bank))?;
        debug!(symbol, base, len, "bypass send");

        let codec = self.codec;
        let views = buffers.rank_views();
        let targets = self.windows()?;

        let results: Vec<Result<()>> = thread::scope(|s| {
            let handles: Vec<_> = views
                .into_iter()
                .zip(targets)
                .map(|(view, (rank, region, bank_len))| {
                    s.spawn(move || {
                        RankEngine::new(rank, region, codec, bank_len)?.send(&view, base, len)
                    })
                })
                .collect();
            handles.into_iter().map(reap_thread).collect()
        });
        results.into_iter().collect()
    }

    fn receive(
        &mut self,
        buffers: &mut UnitBuffers,
        symbol: &str,
        offset: u64,
        len: usize,
        mode: TransferMode,
    ) -> Result<()> {
        let sym = self.runtime.symbol(symbol)?;
        if sym.kind() == MemoryKind::Scratchpad {
            debug!(symbol, "scratchpad symbol, routing to the descriptor path");
            return self.runtime.copy_out(buffers, symbol, offset, len, mode);
        }
        if mode == TransferMode::Async {
            return Err(PimError::AsyncUnsupported);
        }
        buffers.matches(self.runtime.topology())?;
        if len == 0 {
            return Ok(());
        }
        let min_bank = self.runtime.topology().min_bank_len();
        let base = sym
            .offset()
            .checked_add(offset)
            .ok_or_else(|| PimError::out_of_bank(offset, len as u64, min_bank))?;
        debug!(symbol, base, len, "bypass receive");

        let codec = self.codec;
        let views = buffers.rank_views_mut();
        let targets = self.windows()?;

        let results: Vec<Result<()>> = thread::scope(|s| {
            let handles: Vec<_> = views
                .into_iter()
                .zip(targets)
                .map(|(view, (rank, region, bank_len))| {
                    s.spawn(move || {
                        let mut view = view;
                        RankEngine::new(rank, region, codec, bank_len)?
                            .receive(&mut view, base, len)
                    })
                })
                .collect();
            handles.into_iter().map(reap_thread).collect()
        });
        results.into_iter().collect()
    }

    fn launch(&mut self, mode: LaunchMode) -> Result<()> {
        self.runtime.launch(mode)
    }

    fn sync(&mut self) -> Result<()> {
        exec::wait_ranks_idle(self.windows()?.into_iter().map(|(rank, region, _)| (rank, region)))?;
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

fn reap_thread(handle: thread::ScopedJoinHandle<'_, Result<()>>) -> Result<()> {
    handle
        .join()
        .unwrap_or_else(|_| Err(PimError::runtime_failed("rank transfer thread panicked")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ProgramImage, SymbolInfo};
    use crate::software::{SoftwareRuntime, UnitCtx};
    use crate::topology::Topology;

    fn loaded(ranks: usize) -> SoftwareRuntime {
        let mut rt = SoftwareRuntime::new(ranks).unwrap();
        rt.load(
            &ProgramImage::new(vec![0u8; 16])
                .with_symbol(SymbolInfo::scratchpad("pad", 0, 128))
                .with_symbol(SymbolInfo::main_bank("bank", 0, 4 << 10)),
        )
        .unwrap();
        rt
    }

    fn id_arena(topo: &Topology, stride: usize) -> UnitBuffers {
        let mut arena = UnitBuffers::for_topology(topo, stride).unwrap();
        arena.fill_enabled(|_, global, bytes| {
            for (w, chunk) in bytes.chunks_exact_mut(8).enumerate() {
                chunk.copy_from_slice(&((global as u64) << 16 | w as u64).to_le_bytes());
            }
        });
        arena
    }

    #[test]
    fn bank_transfers_round_trip_through_the_window() {
        let rt = loaded(2);
        let topo = rt.topology().clone();
        let mut t = DirectTransport::new(rt).unwrap();

        let arena = id_arena(&topo, 64);
        t.send(&arena, "bank", 128, 64, TransferMode::Sync).unwrap();

        let mut out = UnitBuffers::for_topology(&topo, 64).unwrap();
        t.receive(&mut out, "bank", 128, 64, TransferMode::Sync).unwrap();
        for global in out.enabled_slots().collect::<Vec<_>>() {
            assert_eq!(out.slot(global), arena.slot(global), "slot {global}");
        }
    }

    #[test]
    fn scratchpad_symbols_take_the_descriptor_route() {
        let rt = loaded(1);
        let topo = rt.topology().clone();
        let mut t = DirectTransport::new(rt).unwrap();

        let arena = id_arena(&topo, 16);
        t.send(&arena, "pad", 16, 16, TransferMode::Sync).unwrap();

        // The engine never learned scratchpad addressing, so data coming
        // back proves the call went through the runtime.
        let mut out = UnitBuffers::for_topology(&topo, 16).unwrap();
        t.receive(&mut out, "pad", 16, 16, TransferMode::Sync).unwrap();
        assert_eq!(out.slot(10), arena.slot(10));
    }

    #[test]
    fn async_bank_transfers_are_rejected() {
        let rt = loaded(1);
        let topo = rt.topology().clone();
        let mut t = DirectTransport::new(rt).unwrap();
        let mut arena = id_arena(&topo, 8);
        assert!(matches!(
            t.send(&arena, "bank", 0, 8, TransferMode::Async),
            Err(PimError::AsyncUnsupported)
        ));
        assert!(matches!(
            t.receive(&mut arena, "bank", 0, 8, TransferMode::Async),
            Err(PimError::AsyncUnsupported)
        ));
        // Scratchpad async is the runtime's business and goes through.
        t.send(&arena, "pad", 0, 8, TransferMode::Async).unwrap();
    }

    #[test]
    fn sync_polls_the_status_words_then_reaps() {
        let mut rt = loaded(1);
        rt.set_unit_program(|ctx: &mut UnitCtx<'_>| {
            let v = ctx.read_u64("pad", 0)?;
            ctx.write_u64("bank", 0, v + 7)
        });
        let topo = rt.topology().clone();
        let mut t = DirectTransport::new(rt).unwrap();

        let arena = id_arena(&topo, 8);
        t.send(&arena, "pad", 0, 8, TransferMode::Sync).unwrap();
        t.launch(LaunchMode::Async).unwrap();
        t.sync().unwrap();

        let mut out = UnitBuffers::for_topology(&topo, 8).unwrap();
        t.receive(&mut out, "bank", 0, 8, TransferMode::Sync).unwrap();
        let want = ((3u64) << 16) + 7;
        assert_eq!(out.words(3).unwrap()[0], want);
    }

    #[test]
    fn arena_shape_is_checked_per_call() {
        let rt = loaded(2);
        let mut t = DirectTransport::new(rt).unwrap();
        let small = SoftwareRuntime::new(1).unwrap();
        let arena = UnitBuffers::for_topology(small.topology(), 8).unwrap();
        assert!(matches!(
            t.send(&arena, "bank", 0, 8, TransferMode::Sync),
            Err(PimError::ArenaMismatch { .. })
        ));
    }
}
