//! Byte-lane format of an interleaved line.
//!
//! Inside one 64-byte line the controller stripes units across byte lanes:
//! lane word `i`, byte `j` carries byte `i` of the word belonging to the
//! unit behind interface `j`. Packing host words into a line and unpacking
//! a line back into host words are therefore the same operation, an 8x8
//! byte matrix transpose, and the transpose is its own inverse.
//!
//! This module is the scalar reference for that format. The vectorised
//! paths in the transport crate must match it byte for byte; they are
//! tested against it.

use crate::geometry::INTERFACES_PER_RANK;

/// Lane words in one line.
pub const LINE_WORDS: usize = INTERFACES_PER_RANK;

/// 8x8 byte transpose of one line.
///
/// `out[i]` byte `j` equals `line[j]` byte `i`. Applying it twice returns
/// the input.
#[must_use]
pub const fn transpose(line: [u64; LINE_WORDS]) -> [u64; LINE_WORDS] {
    let mut out = [0u64; LINE_WORDS];
    let mut lane = 0;
    while lane < LINE_WORDS {
        let mut word = 0;
        while word < LINE_WORDS {
            let byte = (line[word] >> (lane * 8)) & 0xff;
            out[lane] |= byte << (word * 8);
            word += 1;
        }
        lane += 1;
    }
    out
}

/// Pack one 8-byte word per interface into wire order.
#[must_use]
pub const fn host_to_lanes(words: [u64; LINE_WORDS]) -> [u64; LINE_WORDS] {
    transpose(words)
}

/// Unpack a wire-order line into one 8-byte word per interface.
#[must_use]
pub const fn lanes_to_host(line: [u64; LINE_WORDS]) -> [u64; LINE_WORDS] {
    transpose(line)
}

/// Byte index inside a line of logical byte `byte` of the unit behind
/// `interface`.
#[must_use]
pub const fn line_byte(interface: usize, byte: usize) -> usize {
    byte * INTERFACES_PER_RANK + interface
}
