//! End-to-end identity run over two software ranks.
//!
//! Scatters each unit its own id through the scratchpad, launches a
//! program that stamps that id into the main bank, then gathers the
//! results back over the bypass window. Exercises the whole transport
//! surface with no hardware attached.
//!
//! Usage:
//!   cargo run --example identity

use anyhow::Result;
use pim_transport::{
    select_transport, Fault, LaunchMode, ProgramImage, RankRuntime, SoftwareRuntime, SymbolInfo,
    TransferMode, Transport, TransportSelection, UnitBuffers, UnitCtx,
};
use tracing_subscriber::EnvFilter;

const RESULT_WORDS: u64 = 4;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("pim_transport=info".parse()?),
        )
        .init();

    println!("🧠 PIM identity walkthrough\n");

    // Bring up two in-process ranks and load the kernel image.
    let mut runtime = SoftwareRuntime::new(2)?;
    runtime.load(
        &ProgramImage::new(&b"identity kernel"[..])
            .with_symbol(SymbolInfo::scratchpad("unit_id", 0, 8))
            .with_symbol(SymbolInfo::main_bank("results", 0, (RESULT_WORDS * 8) as u32)),
    )?;
    runtime.set_unit_program(|ctx: &mut UnitCtx<'_>| -> Result<(), Fault> {
        let id = ctx.read_u64("unit_id", 0)?;
        for w in 0..RESULT_WORDS {
            ctx.write_u64("results", w * 8, id * RESULT_WORDS + w)?;
        }
        ctx.log(&format!("unit {id} wrote {RESULT_WORDS} words"));
        Ok(())
    });

    let topology = runtime.topology().clone();
    println!(
        "✅ {} rank(s) up, {} live unit(s)",
        topology.rank_count(),
        topology.enabled_units()
    );

    // Both ranks run in performance mode, so auto-selection takes the
    // bypass window.
    let mut transport = select_transport(TransportSelection::Auto, runtime)?;
    println!("✅ transport route: {:?}\n", transport.kind());

    // Scatter ids through the scratchpad.
    println!("📤 sending {} unit id(s)", topology.enabled_units());
    let mut ids = UnitBuffers::for_topology(&topology, 8)?;
    ids.fill_enabled(|_, global, slot| slot.copy_from_slice(&(global as u64).to_le_bytes()));
    transport.send(&ids, "unit_id", 0, 8, TransferMode::Sync)?;

    // Run the program and wait for every unit to retire.
    transport.launch(LaunchMode::Async)?;
    transport.sync()?;
    println!("✅ all units retired");

    // Gather the results over the bypass window.
    let len = (RESULT_WORDS * 8) as usize;
    println!("\n📥 gathering {len} bytes per unit");
    let mut results = UnitBuffers::for_topology(&topology, len)?;
    transport.receive(&mut results, "results", 0, len, TransferMode::Sync)?;

    let mut checked = 0usize;
    let mut mismatches = 0usize;
    for global in results.enabled_slots() {
        let Some(words) = results.words(global) else {
            continue;
        };
        for (w, &value) in words.iter().enumerate() {
            if value != global as u64 * RESULT_WORDS + w as u64 {
                mismatches += 1;
            }
        }
        checked += words.len();
    }
    if mismatches == 0 {
        println!("🎉 identity check: PASSED ({checked} words)");
    } else {
        println!("❌ identity check: {mismatches} of {checked} words wrong");
    }

    // Every unit logged one line; show the first unit of each rank.
    println!("\nsample unit logs:");
    let mut log = Vec::new();
    transport.read_log(&|global| global % 64 == 0, &mut log)?;
    print!("{}", String::from_utf8_lossy(&log));

    Ok(())
}
