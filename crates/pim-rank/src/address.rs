//! Bank-to-window address translation.
//!
//! A unit's main bank is linear from the unit's point of view, but the
//! memory controller scatters it through the rank's physical window by a
//! fixed bit redistribution. One 8-aligned bank offset plus a quad selects
//! the first 64-byte line of a pair; the second line of the pair sits at
//! `+64` and carries members 4..7.
//!
//! ## Bit movement (hardware contract)
//!
//! | bank offset bits | window bits | moved by |
//! |------------------|-------------|----------|
//! | 25..22           | 32..29      | `<< 7`   |
//! | 14               | 28          | `<< 14`  |
//! | 21..15           | 27..21      | `<< 6`   |
//! | 13               | 20          | `<< 7`   |
//! | 12..3            | 16..7       | `<< 4`   |
//! | quad             | 19..18      | n/a      |
//!
//! Window bit 17 is never produced by the data map; the control-interface
//! status block in [`crate::regs`] lives behind it. Bits 6..4 come from the
//! low word bits and are zero for 8-aligned offsets, which is what leaves
//! room for the `+64` second line.
//!
//! [`bank_to_window`] is the form the transfer engine runs; the staged
//! division in [`oracle`] is the same map written the way the DRAM
//! datasheet describes it. The two must agree everywhere, and the tests
//! hold them to that.

use crate::geometry::{LINE_BYTES, WORD_BYTES};

/// High symbol-address bit marking main-bank space (scratchpad symbols
/// have it clear).
pub const BANK_SPACE_FLAG: u32 = 1 << 27;

const HIGH_FIELD: u64 = !0x3f_ffff; // bits 63..22
const MID_FIELD: u64 = 0x3f_8000; // bits 21..15
const BIT_14: u64 = 1 << 14;
const BIT_13: u64 = 1 << 13;
const LOW_FIELD: u64 = 0x1fff; // bits 12..0

/// Window offset of the first line of the pair holding `bank_offset` for
/// `quad`.
///
/// `bank_offset` must be 8-aligned and below the unit's bank length;
/// `quad` must be below 4. The function is total (every in-domain input
/// maps) and injective per (offset, quad): every input bit lands in its
/// own output bit, so distinct inputs cannot collide.
#[must_use]
pub const fn bank_to_window(bank_offset: u64, quad: u64) -> u64 {
    ((bank_offset & (HIGH_FIELD | BIT_13)) << 7)
        | ((bank_offset & MID_FIELD) << 6)
        | ((bank_offset & BIT_14) << 14)
        | ((bank_offset & LOW_FIELD) << 4)
        | (quad << 18)
}

/// Staged-division form of the same map.
pub mod oracle {
    /// Window offset of the first line of the pair, derived stage by
    /// stage: 4 MiB blocks spread at 512 MiB, the 16 KiB bit at 256 MiB,
    /// 32 KiB blocks at 2 MiB, the 8 KiB bit at 1 MiB, then the residue
    /// fans out at 16 bytes per word and the quad picks a 256 KiB bucket.
    #[must_use]
    pub const fn bank_to_window(bank_offset: u64, quad: u64) -> u64 {
        let mut addr = bank_offset;
        let mut offset = (512 << 20) * (addr >> 22);
        addr &= (1 << 22) - 1;
        if addr & (16 << 10) != 0 {
            offset += 256 << 20;
        }
        offset += (2 << 20) * (addr / (32 << 10));
        addr %= 16 << 10;
        if addr & (8 << 10) != 0 {
            offset += 1 << 20;
        }
        addr %= 8 << 10;
        offset += addr * 16;
        offset + quad * (256 << 10)
    }
}

/// Smallest window size holding every line the data map can produce for
/// bank offsets below `bank_len`.
///
/// `bank_len` must be a power of two and at least one word; with all
/// offset bits below the bank length in play the scatter peaks at the
/// last word of the bank. The production 64 MiB bank needs an 8 GiB
/// window.
#[must_use]
pub const fn window_span(bank_len: u64) -> u64 {
    assert!(bank_len >= WORD_BYTES && bank_len.is_power_of_two());
    bank_to_window(bank_len - WORD_BYTES, 3) + 2 * LINE_BYTES
}

/// Whether a raw symbol address points into main-bank space.
#[must_use]
pub const fn is_bank_address(raw: u32) -> bool {
    raw & BANK_SPACE_FLAG != 0
}

/// Raw symbol address with the main-bank flag stripped.
#[must_use]
pub const fn strip_bank_flag(raw: u32) -> u32 {
    raw & !BANK_SPACE_FLAG
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::MAIN_BANK_BYTES;
    use std::collections::HashSet;

    /// Offsets straddling every stage boundary of the oracle.
    fn boundary_offsets() -> Vec<u64> {
        let mut v = vec![0, 8];
        for edge in [8u64 << 10, 16 << 10, 32 << 10, 4 << 20, 8 << 20, 32 << 20] {
            v.extend([edge - 8, edge, edge + 8]);
        }
        v.push(MAIN_BANK_BYTES - 8);
        v
    }

    #[test]
    fn fast_form_matches_oracle_at_boundaries() {
        for &offset in &boundary_offsets() {
            for quad in 0..4 {
                assert_eq!(
                    bank_to_window(offset, quad),
                    oracle::bank_to_window(offset, quad),
                    "offset {offset:#x} quad {quad}"
                );
            }
        }
    }

    #[test]
    fn fast_form_matches_oracle_dense_sweep() {
        for word in 0..(64u64 << 10) / 8 {
            let offset = word * 8;
            for quad in 0..4 {
                assert_eq!(bank_to_window(offset, quad), oracle::bank_to_window(offset, quad));
            }
        }
    }

    #[test]
    fn fast_form_matches_oracle_sparse_high_sweep() {
        // Large strides cover the 4 MiB stage without a 2^23-word loop.
        for word in 0..(8u64 << 10) {
            let offset = word * 8 * 1021; // odd stride, crosses every field
            if offset >= MAIN_BANK_BYTES {
                break;
            }
            for quad in 0..4 {
                assert_eq!(bank_to_window(offset, quad), oracle::bank_to_window(offset, quad));
            }
        }
    }

    #[test]
    fn scatter_is_injective() {
        let mut seen = HashSet::new();
        for word in 0..(1u64 << 15) {
            let offset = word * 8;
            for quad in 0..4 {
                assert!(
                    seen.insert(bank_to_window(offset, quad)),
                    "collision at offset {offset:#x} quad {quad}"
                );
            }
        }
    }

    #[test]
    fn scatter_never_sets_bit_17() {
        for &offset in &boundary_offsets() {
            for quad in 0..4 {
                assert_eq!(bank_to_window(offset, quad) & (1 << 17), 0);
            }
        }
    }

    #[test]
    fn scatter_stays_inside_window() {
        for bank_len in [16u64 << 10, 64 << 10, MAIN_BANK_BYTES] {
            let span = window_span(bank_len);
            for &offset in &boundary_offsets() {
                if offset + 8 > bank_len {
                    continue;
                }
                for quad in 0..4 {
                    assert!(bank_to_window(offset, quad) + 2 * LINE_BYTES <= span);
                }
            }
        }
    }

    #[test]
    fn production_window_is_8_gib() {
        assert_eq!(window_span(MAIN_BANK_BYTES), 0x1_fffe_0000);
        assert!(window_span(MAIN_BANK_BYTES) <= 8 << 30);
    }

    #[test]
    fn window_span_grows_with_bank() {
        let mut last = 0;
        let mut bank = 8u64 << 10;
        while bank <= MAIN_BANK_BYTES {
            let span = window_span(bank);
            assert!(span > last);
            last = span;
            bank <<= 1;
        }
    }

    #[test]
    fn bank_flag_round_trips() {
        assert!(is_bank_address(BANK_SPACE_FLAG | 0x40));
        assert!(!is_bank_address(0x40));
        assert_eq!(strip_bank_flag(BANK_SPACE_FLAG | 0x1f8), 0x1f8);
        assert_eq!(strip_bank_flag(0x1f8), 0x1f8);
    }
}
