//! Execution controller for the bypass path.
//!
//! After an async launch, progress is visible to the host only through
//! the per-rank control-interface status words in the mapped window.
//! [`wait_ranks_idle`] polls those words until every interface has
//! retired, then scans once for fault bits. There is deliberately no
//! deadline in the loop: the vendor runtime's own wait primitive blocks
//! unbounded too, and callers that want a timeout keep the launch async
//! and poll from their own timer.

use std::thread;
use std::time::Duration;

use pim_rank::regs;
use tracing::trace;

use crate::error::{PimError, Result};
use crate::region::{memory_fence, RankRegion};

/// Delay between poll sweeps over a busy rank.
const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Block until every control interface of every given rank reports
/// not-running, then surface the first fault found. The status block is
/// DRAM behind the host cache like any other window line, so every
/// sweep flushes it before reading.
///
/// # Errors
///
/// [`PimError::UnitFault`] naming the rank and interface when a status
/// word carries the fault bit after retirement.
pub fn wait_ranks_idle<'a>(
    windows: impl IntoIterator<Item = (usize, &'a RankRegion)>,
) -> Result<()> {
    let windows: Vec<(usize, &RankRegion)> = windows.into_iter().collect();

    for &(rank, region) in &windows {
        let mut sweeps = 0u64;
        loop {
            // All eight status words share one line; flush it first or
            // the reads below can keep coming from a stale cached copy.
            region.flush_line(regs::STATUS_BLOCK_OFFSET);
            memory_fence();
            let busy = (0..regs::STATUS_WORDS).any(|interface| {
                regs::is_running(region.read_u64(regs::status_word_offset(interface)))
            });
            if !busy {
                break;
            }
            sweeps += 1;
            thread::sleep(POLL_INTERVAL);
        }
        trace!(rank, sweeps, "rank idle");
    }

    for &(rank, region) in &windows {
        region.flush_line(regs::STATUS_BLOCK_OFFSET);
        memory_fence();
        for interface in 0..regs::STATUS_WORDS {
            let word = region.read_u64(regs::status_word_offset(interface));
            if regs::is_faulted(word) {
                return Err(PimError::UnitFault {
                    rank,
                    interface,
                    code: regs::fault_code(word),
                });
            }
        }
    }
    Ok(())
}
