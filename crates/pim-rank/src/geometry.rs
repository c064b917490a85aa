//! Rank and unit geometry.
//!
//! A rank carries 64 compute units behind 8 control interfaces, 8 member
//! units per interface. The memory controller stripes a 64-byte line over
//! the 8 units that share a member position, one byte lane per interface,
//! so a transfer touches units in groups of 16: the two 64-byte lines of a
//! line pair cover members `quad` and `quad + 4` on every interface.
//!
//! ## Key numbers
//!
//! - 64 unit slots per rank, at most 40 ranks per machine
//! - main bank: 64 MiB per unit; scratchpad: 64 KiB per unit
//! - a line pair (128 bytes of window space) holds one 8-byte word for
//!   each of 16 units

/// Unit slots per rank.
pub const UNITS_PER_RANK: usize = 64;

/// Control interfaces per rank.
pub const INTERFACES_PER_RANK: usize = 8;

/// Member units behind one control interface.
pub const MEMBERS_PER_INTERFACE: usize = 8;

/// Quads per rank: members split into four groups of two lines each.
pub const QUADS_PER_RANK: usize = 4;

/// Bytes in one interleaved line.
pub const LINE_BYTES: u64 = 64;

/// Bytes in a line pair (members `q` and `q + 4`).
pub const PAIR_BYTES: u64 = 128;

/// Bytes of one unit's word inside a line.
pub const WORD_BYTES: u64 = 8;

/// Main-bank capacity of one unit on production silicon.
pub const MAIN_BANK_BYTES: u64 = 64 << 20;

/// Scratchpad capacity of one unit.
pub const SCRATCHPAD_BYTES: u64 = 64 << 10;

/// Upper bound on ranks a single machine exposes.
pub const MAX_RANKS: usize = 40;

/// Slot index of `member` behind `interface`.
#[must_use]
pub const fn slot_index(interface: usize, member: usize) -> usize {
    interface * MEMBERS_PER_INTERFACE + member
}

/// Control interface serving `slot`. Equals the slot's byte lane within a
/// line.
#[must_use]
pub const fn interface_of(slot: usize) -> usize {
    slot / MEMBERS_PER_INTERFACE
}

/// Member position of `slot` behind its interface.
#[must_use]
pub const fn member_of(slot: usize) -> usize {
    slot % MEMBERS_PER_INTERFACE
}

/// Quad of `slot`: which line pair carries its words.
#[must_use]
pub const fn quad_of(slot: usize) -> usize {
    member_of(slot) & 3
}

/// Whether `slot` rides the second line of its pair (members 4..7).
#[must_use]
pub const fn second_line(slot: usize) -> bool {
    member_of(slot) >= 4
}

/// Slot served by byte lane `interface` in the line addressed by
/// (`quad`, `second`).
#[must_use]
pub const fn line_slot(interface: usize, quad: usize, second: bool) -> usize {
    slot_index(interface, if second { quad + 4 } else { quad })
}

/// Global slot number of `slot` on rank `rank`.
#[must_use]
pub const fn global_slot(rank: usize, slot: usize) -> usize {
    rank * UNITS_PER_RANK + slot
}

/// Rank owning a global slot number.
#[must_use]
pub const fn rank_of_global(global: usize) -> usize {
    global / UNITS_PER_RANK
}

/// In-rank slot of a global slot number.
#[must_use]
pub const fn slot_of_global(global: usize) -> usize {
    global % UNITS_PER_RANK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_math_round_trips() {
        for interface in 0..INTERFACES_PER_RANK {
            for member in 0..MEMBERS_PER_INTERFACE {
                let slot = slot_index(interface, member);
                assert!(slot < UNITS_PER_RANK);
                assert_eq!(interface_of(slot), interface);
                assert_eq!(member_of(slot), member);
            }
        }
    }

    #[test]
    fn line_pairs_partition_the_rank() {
        let mut seen = [false; UNITS_PER_RANK];
        for quad in 0..QUADS_PER_RANK {
            for second in [false, true] {
                for interface in 0..INTERFACES_PER_RANK {
                    let slot = line_slot(interface, quad, second);
                    assert!(!seen[slot], "slot {slot} covered twice");
                    seen[slot] = true;
                    assert_eq!(quad_of(slot), quad);
                    assert_eq!(second_line(slot), second);
                }
            }
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn global_slot_round_trips() {
        for rank in [0, 1, MAX_RANKS - 1] {
            for slot in [0, 7, 63] {
                let g = global_slot(rank, slot);
                assert_eq!(rank_of_global(g), rank);
                assert_eq!(slot_of_global(g), slot);
            }
        }
    }

    #[test]
    fn sixteen_units_per_pair() {
        assert_eq!(PAIR_BYTES / WORD_BYTES, 16);
        assert_eq!(UNITS_PER_RANK / QUADS_PER_RANK, 16);
    }
}
