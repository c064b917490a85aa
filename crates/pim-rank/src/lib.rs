//! Silicon model for byte-interleaved PIM DRAM ranks.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of how a processing-in-memory rank presents itself to the
//! host: unit geometry, the bank-to-window address scatter, the byte-lane
//! format of a 64-byte line, and the control-interface status block.
//!
//! Everything in the address and lane modules is a hardware contract: the
//! memory controller applies these exact bit movements in silicon, so the
//! constants are not tunable. The transfer engine in `pim-transport`
//! consumes this model; nothing here touches device memory.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`geometry`] | Rank/unit layout (8 interfaces x 8 members), quads, sizes |
//! | [`address`] | Bank offset -> physical window scatter, fast form + oracle |
//! | [`lanes`] | Byte-lane format of a line (8x8 transpose), scalar reference |
//! | [`regs`] | Control-interface status words polled after a launch |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod address;
pub mod geometry;
pub mod lanes;
pub mod regs;
