//! Per-rank bulk transfer engine for the bypass path.
//!
//! One engine serves one rank for one call. A transfer walks every quad
//! and every 8-byte step of the request, translates the bank offset to
//! the line pair inside the mapped window, and moves whole 64-byte lines
//! through the lane codec. Receives flush the stale cache lines first and
//! fence once before loading; sends fence once after the last store so
//! streaming stores are globally visible before the call returns.
//!
//! Slot slices arrive as one entry per unit slot; `None` marks a slot
//! with no live unit. Receives never touch a `None` slot's memory and
//! sends put zero lanes on the wire for them.

use pim_rank::address;
use pim_rank::geometry::{
    self, INTERFACES_PER_RANK, LINE_BYTES, QUADS_PER_RANK, UNITS_PER_RANK, WORD_BYTES,
};
use tracing::trace;

use crate::codec::LaneCodec;
use crate::error::{PimError, Result};
use crate::region::{self, RankRegion};

/// Bulk mover between one rank's mapped window and per-unit host slices.
pub struct RankEngine<'w> {
    rank: usize,
    region: &'w RankRegion,
    codec: LaneCodec,
    bank_len: u64,
}

impl<'w> RankEngine<'w> {
    /// Bind an engine to a rank window.
    ///
    /// # Errors
    ///
    /// [`PimError::WindowTooSmall`] when the mapped window cannot hold
    /// every line the translation can produce for `bank_len`, and
    /// [`PimError::BadTopology`] for a bank length that is not a power
    /// of two.
    pub fn new(
        rank: usize,
        region: &'w RankRegion,
        codec: LaneCodec,
        bank_len: u64,
    ) -> Result<Self> {
        if bank_len < WORD_BYTES || !bank_len.is_power_of_two() {
            return Err(PimError::bad_topology(format!(
                "rank {rank}: bank length {bank_len:#x} must be a power of two"
            )));
        }
        let needed = address::window_span(bank_len);
        if needed > region.len() {
            return Err(PimError::WindowTooSmall { rank, mapped: region.len(), needed });
        }
        Ok(Self { rank, region, codec, bank_len })
    }

    /// The rank this engine serves.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Window -> host: deinterleave `len` bytes starting `bank_offset`
    /// into each live slot's slice.
    ///
    /// The pass order matters: every line of the request is flushed
    /// before the single fence, and only then loaded, so no load can see
    /// a stale cache line from before the units wrote their results.
    ///
    /// # Errors
    ///
    /// Alignment, bank bounds, and slice length violations; see
    /// [`RankEngine::send`] for the shared rules.
    pub fn receive(
        &self,
        slices: &mut [Option<&mut [u8]>; UNITS_PER_RANK],
        bank_offset: u64,
        len: usize,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.check_request(bank_offset, len)?;
        for (slot, slice) in slices.iter().enumerate() {
            if let Some(buf) = slice.as_deref() {
                self.check_slice(slot, buf.len(), len)?;
            }
        }
        trace!(rank = self.rank, bank_offset, len, "bypass receive");

        let words = len / WORD_BYTES as usize;
        for quad in 0..QUADS_PER_RANK {
            for i in 0..words {
                let line = self.line_offset(bank_offset, i, quad);
                self.region.flush_line(line);
                self.region.flush_line(line + LINE_BYTES);
            }
        }
        region::memory_fence();

        for quad in 0..QUADS_PER_RANK {
            for i in 0..words {
                if i % 8 == 0 && i + 8 < words {
                    for interface in 0..INTERFACES_PER_RANK {
                        for second in [false, true] {
                            let slot = geometry::line_slot(interface, quad, second);
                            if let Some(buf) = slices[slot].as_deref() {
                                region::prefetch_host(buf[(i + 8) * 8..].as_ptr());
                            }
                        }
                    }
                }
                let line = self.line_offset(bank_offset, i, quad);
                self.region.prefetch(line + LINE_BYTES * 6);
                self.region.prefetch(line + LINE_BYTES * 7);

                let host = self.codec.decode(&self.region.read_line(line));
                for interface in 0..INTERFACES_PER_RANK {
                    let slot = geometry::line_slot(interface, quad, false);
                    if let Some(buf) = slices[slot].as_deref_mut() {
                        store_word(buf, i, host[interface]);
                    }
                }

                let host = self.codec.decode(&self.region.read_line(line + LINE_BYTES));
                for interface in 0..INTERFACES_PER_RANK {
                    let slot = geometry::line_slot(interface, quad, true);
                    if let Some(buf) = slices[slot].as_deref_mut() {
                        store_word(buf, i, host[interface]);
                    }
                }
            }
        }
        Ok(())
    }

    /// Host -> window: interleave `len` bytes from each live slot's
    /// slice into the bank starting at `bank_offset`. Dead slots put
    /// zero lanes on the wire; no unit reads those bytes.
    ///
    /// # Errors
    ///
    /// [`PimError::Misaligned`] unless `bank_offset` and `len` are both
    /// 8-byte multiples, [`PimError::OutOfBank`] when the request runs
    /// past the bank, [`PimError::ArenaMismatch`] when a live slice
    /// holds fewer than `len` bytes. Validation runs before the window
    /// is touched, so a failed call moved nothing.
    pub fn send(
        &self,
        slices: &[Option<&[u8]>; UNITS_PER_RANK],
        bank_offset: u64,
        len: usize,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.check_request(bank_offset, len)?;
        for (slot, slice) in slices.iter().enumerate() {
            if let Some(buf) = slice {
                self.check_slice(slot, buf.len(), len)?;
            }
        }
        trace!(rank = self.rank, bank_offset, len, "bypass send");

        let words = len / WORD_BYTES as usize;
        for quad in 0..QUADS_PER_RANK {
            for i in 0..words {
                if i % 8 == 0 && i + 8 < words {
                    for interface in 0..INTERFACES_PER_RANK {
                        for second in [false, true] {
                            let slot = geometry::line_slot(interface, quad, second);
                            if let Some(buf) = slices[slot] {
                                region::prefetch_host(buf[(i + 8) * 8..].as_ptr());
                            }
                        }
                    }
                }
                let line = self.line_offset(bank_offset, i, quad);

                let mut lanes = [0u64; INTERFACES_PER_RANK];
                for (interface, lane) in lanes.iter_mut().enumerate() {
                    if let Some(buf) = slices[geometry::line_slot(interface, quad, false)] {
                        *lane = load_word(buf, i);
                    }
                }
                self.codec.encode_store(&lanes, self.region, line);

                let mut lanes = [0u64; INTERFACES_PER_RANK];
                for (interface, lane) in lanes.iter_mut().enumerate() {
                    if let Some(buf) = slices[geometry::line_slot(interface, quad, true)] {
                        *lane = load_word(buf, i);
                    }
                }
                self.codec.encode_store(&lanes, self.region, line + LINE_BYTES);
            }
        }
        region::memory_fence();
        Ok(())
    }

    fn line_offset(&self, bank_offset: u64, word: usize, quad: usize) -> u64 {
        address::bank_to_window(bank_offset + word as u64 * WORD_BYTES, quad as u64)
    }

    fn check_request(&self, bank_offset: u64, len: usize) -> Result<()> {
        let len = len as u64;
        if bank_offset % WORD_BYTES != 0 || len % WORD_BYTES != 0 {
            return Err(PimError::misaligned(bank_offset, len));
        }
        let end = bank_offset
            .checked_add(len)
            .ok_or_else(|| PimError::out_of_bank(bank_offset, len, self.bank_len))?;
        if end > self.bank_len {
            return Err(PimError::out_of_bank(bank_offset, len, self.bank_len));
        }
        Ok(())
    }

    fn check_slice(&self, slot: usize, have: usize, need: usize) -> Result<()> {
        if have < need {
            return Err(PimError::arena_mismatch(format!(
                "rank {} slot {slot}: {have} bytes staged, transfer moves {need}",
                self.rank
            )));
        }
        Ok(())
    }
}

fn load_word(buf: &[u8], word: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[word * 8..(word + 1) * 8]);
    u64::from_le_bytes(bytes)
}

fn store_word(buf: &mut [u8], word: usize, value: u64) {
    buf[word * 8..(word + 1) * 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use pim_rank::lanes;

    const BANK_LEN: u64 = 4 << 10;

    fn mix(mut x: u64) -> u64 {
        x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
        x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        x ^ (x >> 31)
    }

    fn test_region() -> RankRegion {
        RankRegion::host_backed(address::window_span(BANK_LEN)).unwrap()
    }

    fn patterned(slot: usize, len: usize) -> Vec<u8> {
        (0..len).map(|b| (mix(((slot as u64) << 32) | b as u64) & 0xff) as u8).collect()
    }

    fn send_views<'a>(bufs: &'a [Vec<u8>], dead: &[usize]) -> [Option<&'a [u8]>; UNITS_PER_RANK] {
        let mut out: [Option<&[u8]>; UNITS_PER_RANK] = [None; UNITS_PER_RANK];
        for (slot, buf) in bufs.iter().enumerate() {
            if !dead.contains(&slot) {
                out[slot] = Some(buf.as_slice());
            }
        }
        out
    }

    fn recv_views<'a>(
        bufs: &'a mut [Vec<u8>],
        dead: &[usize],
    ) -> [Option<&'a mut [u8]>; UNITS_PER_RANK] {
        let mut out: [Option<&'a mut [u8]>; UNITS_PER_RANK] = std::array::from_fn(|_| None);
        for (slot, buf) in bufs.iter_mut().enumerate() {
            if !dead.contains(&slot) {
                out[slot] = Some(buf.as_mut_slice());
            }
        }
        out
    }

    /// Window byte address of one logical byte of one unit, derived from
    /// the oracle translation and the lane definition alone. The engine
    /// never goes through this path, so agreement is meaningful.
    fn window_byte(slot: usize, bank_offset: u64, byte: usize) -> u64 {
        let quad = geometry::quad_of(slot) as u64;
        let word = byte / 8;
        let line = address::oracle::bank_to_window(bank_offset + word as u64 * 8, quad)
            + if geometry::second_line(slot) { LINE_BYTES } else { 0 };
        line + lanes::line_byte(geometry::interface_of(slot), byte % 8) as u64
    }

    #[test]
    fn send_lands_every_byte_where_the_oracle_says() {
        let region = test_region();
        let engine = RankEngine::new(0, &region, LaneCodec::scalar(), BANK_LEN).unwrap();
        let len = 64usize;
        let bufs: Vec<Vec<u8>> = (0..UNITS_PER_RANK).map(|s| patterned(s, len)).collect();
        engine.send(&send_views(&bufs, &[]), 512, len).unwrap();

        for slot in (0..UNITS_PER_RANK).step_by(7).chain([1, 63]) {
            for byte in 0..len {
                assert_eq!(
                    region.read_u8(window_byte(slot, 512, byte)),
                    bufs[slot][byte],
                    "slot {slot} byte {byte}"
                );
            }
        }
    }

    #[test]
    fn receive_picks_every_byte_from_where_the_oracle_put_it() {
        let region = test_region();
        let engine = RankEngine::new(0, &region, LaneCodec::scalar(), BANK_LEN).unwrap();
        let len = 48usize;
        let expect: Vec<Vec<u8>> = (0..UNITS_PER_RANK).map(|s| patterned(s, len)).collect();
        for (slot, bytes) in expect.iter().enumerate() {
            for (byte, &value) in bytes.iter().enumerate() {
                region.write_u8(window_byte(slot, 1024, byte), value);
            }
        }

        let mut bufs = vec![vec![0u8; len]; UNITS_PER_RANK];
        engine.receive(&mut recv_views(&mut bufs, &[]), 1024, len).unwrap();
        assert_eq!(bufs, expect);
    }

    #[test]
    fn round_trip_with_dead_slots() {
        let region = test_region();
        let engine = RankEngine::new(0, &region, LaneCodec::scalar(), BANK_LEN).unwrap();
        let len = 256usize;
        let dead = [3usize, 17, 40];
        let bufs: Vec<Vec<u8>> = (0..UNITS_PER_RANK).map(|s| patterned(s, len)).collect();
        engine.send(&send_views(&bufs, &dead), 0, len).unwrap();

        // Dead slots went out as zero lanes.
        for byte in 0..len {
            assert_eq!(region.read_u8(window_byte(dead[0], 0, byte)), 0);
        }

        let mut out = vec![vec![0xaau8; len]; UNITS_PER_RANK];
        engine.receive(&mut recv_views(&mut out, &dead), 0, len).unwrap();
        for slot in 0..UNITS_PER_RANK {
            if dead.contains(&slot) {
                assert!(out[slot].iter().all(|&b| b == 0xaa), "slot {slot} was touched");
            } else {
                assert_eq!(out[slot], bufs[slot], "slot {slot}");
            }
        }
    }

    #[test]
    fn full_bank_round_trips() {
        let region = test_region();
        let engine = RankEngine::new(0, &region, LaneCodec::scalar(), BANK_LEN).unwrap();
        let len = BANK_LEN as usize;
        let bufs: Vec<Vec<u8>> = (0..UNITS_PER_RANK).map(|s| patterned(s, len)).collect();
        engine.send(&send_views(&bufs, &[]), 0, len).unwrap();
        let mut out = vec![vec![0u8; len]; UNITS_PER_RANK];
        engine.receive(&mut recv_views(&mut out, &[]), 0, len).unwrap();
        assert_eq!(out, bufs);
    }

    #[test]
    fn requests_are_validated_before_the_window_is_touched() {
        let region = test_region();
        let engine = RankEngine::new(0, &region, LaneCodec::scalar(), BANK_LEN).unwrap();
        let bufs: Vec<Vec<u8>> = (0..UNITS_PER_RANK).map(|_| vec![0u8; 64]).collect();
        let views = send_views(&bufs, &[]);

        assert!(matches!(engine.send(&views, 4, 8), Err(PimError::Misaligned { .. })));
        assert!(matches!(engine.send(&views, 0, 12), Err(PimError::Misaligned { .. })));
        assert!(matches!(
            engine.send(&views, BANK_LEN - 8, 16),
            Err(PimError::OutOfBank { .. })
        ));
        // Live slice shorter than the request.
        assert!(matches!(engine.send(&views, 0, 128), Err(PimError::ArenaMismatch { .. })));
        // Zero length is a no-op, not an error.
        engine.send(&views, 0, 0).unwrap();
        engine.send(&views, BANK_LEN, 0).unwrap();
    }

    #[test]
    fn undersized_window_is_rejected_up_front() {
        let region = RankRegion::host_backed(4096).unwrap();
        assert!(matches!(
            RankEngine::new(2, &region, LaneCodec::scalar(), BANK_LEN),
            Err(PimError::WindowTooSmall { rank: 2, .. })
        ));
    }

    #[test]
    fn detected_codec_matches_scalar_end_to_end() {
        let region_a = test_region();
        let region_b = test_region();
        let scalar = RankEngine::new(0, &region_a, LaneCodec::scalar(), BANK_LEN).unwrap();
        let detected = RankEngine::new(0, &region_b, LaneCodec::detect(), BANK_LEN).unwrap();

        let len = 192usize;
        let bufs: Vec<Vec<u8>> = (0..UNITS_PER_RANK).map(|s| patterned(s, len)).collect();
        scalar.send(&send_views(&bufs, &[]), 64, len).unwrap();
        detected.send(&send_views(&bufs, &[]), 64, len).unwrap();
        for offset in (0..address::window_span(BANK_LEN)).step_by(8) {
            assert_eq!(region_a.read_u64(offset), region_b.read_u64(offset), "offset {offset:#x}");
        }

        let mut out = vec![vec![0u8; len]; UNITS_PER_RANK];
        detected.receive(&mut recv_views(&mut out, &[]), 64, len).unwrap();
        assert_eq!(out, bufs);
    }
}
