//! Control-interface status block.
//!
//! Each rank exposes one 64-bit status word per control interface in its
//! physical window. The block sits at `0x20000`: the data scatter in
//! [`crate::address`] never sets window bit 17, so the block can never
//! alias a data line no matter the bank length.
//!
//! The execution controller polls these words after an asynchronous
//! launch. A word layout:
//!
//! | bits  | meaning |
//! |-------|---------|
//! | 0     | interface has running units |
//! | 1     | interface has a faulted unit |
//! | 15..8 | fault code of the first faulted unit |

/// Window offset of the status block.
pub const STATUS_BLOCK_OFFSET: u64 = 0x2_0000;

/// Status words in the block, one per control interface.
pub const STATUS_WORDS: usize = 8;

/// Bytes covered by the status block.
pub const STATUS_BLOCK_BYTES: u64 = (STATUS_WORDS as u64) * 8;

/// Window offset past the end of the block.
pub const STATUS_BLOCK_END: u64 = STATUS_BLOCK_OFFSET + STATUS_BLOCK_BYTES;

/// Set while any unit behind the interface is running.
pub const STATUS_RUNNING: u64 = 1 << 0;

/// Set when any unit behind the interface has faulted.
pub const STATUS_FAULT: u64 = 1 << 1;

const FAULT_CODE_SHIFT: u64 = 8;
const FAULT_CODE_MASK: u64 = 0xff << FAULT_CODE_SHIFT;

/// Window offset of the status word for `interface`.
#[must_use]
pub const fn status_word_offset(interface: usize) -> u64 {
    STATUS_BLOCK_OFFSET + (interface as u64) * 8
}

/// Whether the word reports running units.
#[must_use]
pub const fn is_running(word: u64) -> bool {
    word & STATUS_RUNNING != 0
}

/// Whether the word reports a fault.
#[must_use]
pub const fn is_faulted(word: u64) -> bool {
    word & STATUS_FAULT != 0
}

/// Fault code carried by a faulted word.
#[must_use]
pub const fn fault_code(word: u64) -> u8 {
    ((word & FAULT_CODE_MASK) >> FAULT_CODE_SHIFT) as u8
}

/// Word value for an interface with units still running.
#[must_use]
pub const fn running_word() -> u64 {
    STATUS_RUNNING
}

/// Word value for an interface whose units all stopped cleanly.
#[must_use]
pub const fn idle_word() -> u64 {
    0
}

/// Word value for an interface with a faulted unit.
#[must_use]
pub const fn fault_word(code: u8) -> u64 {
    STATUS_FAULT | ((code as u64) << FAULT_CODE_SHIFT)
}
