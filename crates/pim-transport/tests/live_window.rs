//! Bypass engine over a live rank window.
//!
//! These tests need a machine that exposes a rank's physical window as a
//! mappable device file. Point `PIM_RANK_WINDOW` at it and run with
//! `cargo test -- --ignored`.

use std::path::PathBuf;

use pim_rank::geometry::UNITS_PER_RANK;
use pim_rank::regs;
use pim_transport::{LaneCodec, RankEngine, RankRegion};

/// Kept small so the test window need not span a full hardware bank.
const BANK_LEN: u64 = 16 << 10;

fn window_path() -> PathBuf {
    PathBuf::from(
        std::env::var("PIM_RANK_WINDOW").expect("set PIM_RANK_WINDOW to the rank window device"),
    )
}

#[test]
#[ignore] // Requires a mapped rank window
fn engine_round_trips_over_a_live_window() {
    let region = RankRegion::map_device(&window_path(), 0).expect("map rank window");
    let engine = RankEngine::new(0, &region, LaneCodec::detect(), BANK_LEN)
        .expect("window too small for the test bank");

    let slots: Vec<Vec<u8>> = (0..UNITS_PER_RANK)
        .map(|slot| {
            (0..BANK_LEN)
                .map(|i| (slot as u8).wrapping_mul(31).wrapping_add(i as u8))
                .collect()
        })
        .collect();
    let views: [Option<&[u8]>; UNITS_PER_RANK] =
        std::array::from_fn(|slot| Some(slots[slot].as_slice()));
    engine.send(&views, 0, BANK_LEN as usize).expect("bypass send");

    let mut back = vec![vec![0u8; BANK_LEN as usize]; UNITS_PER_RANK];
    let mut recv: [Option<&mut [u8]>; UNITS_PER_RANK] = std::array::from_fn(|_| None);
    for (view, buf) in recv.iter_mut().zip(back.iter_mut()) {
        *view = Some(buf.as_mut_slice());
    }
    engine.receive(&mut recv, 0, BANK_LEN as usize).expect("bypass receive");

    for (slot, (sent, got)) in slots.iter().zip(back.iter()).enumerate() {
        assert_eq!(sent, got, "slot {slot} bytes drifted through the window");
    }
}

#[test]
#[ignore] // Requires a mapped rank window
fn status_block_is_reachable() {
    let region = RankRegion::map_device(&window_path(), 0).expect("map rank window");
    for interface in 0..regs::STATUS_WORDS {
        let word = region.read_u64(regs::status_word_offset(interface));
        println!(
            "interface {interface}: {word:#x} (running: {}, faulted: {})",
            regs::is_running(word),
            regs::is_faulted(word)
        );
    }
}
