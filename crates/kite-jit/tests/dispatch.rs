//! Dispatch loop behavior: compile-on-miss, slot reuse, time slicing,
//! interrupts, and fault exits.

mod common;

use std::sync::Arc;

use common::*;
use kite_jit::{
    BlockAssembler, CompileError, CoreError, CpuState, Engine, ExitReason, GuestFault,
    GuestMemView, JitConfig, Translator,
};
use kite_mmu::{AddressSpaceMap, GuestRam, PAGE_SIZE};

#[test]
fn miss_compiles_once_and_reuses_the_slot() {
    let mut engine = engine(4);
    load(&mut engine, 0x0, &[movi(1, 5), movi(2, 7), add(1, 2), halt()]);

    let mut cpu = cpu_at(0x0);
    let exit = engine.enter(&mut cpu, 1000).unwrap();
    assert_eq!(exit.reason, ExitReason::Stopped);
    assert_eq!(exit.next_pc, 4 * ILEN);
    assert_eq!(cpu.regs[1], 12);
    assert_eq!(engine.stats().lookup_misses, 1);
    assert_eq!(engine.stats().blocks_compiled, 1);

    // Same entry again: the installed slot is hit, nothing recompiles.
    let mut cpu = cpu_at(0x0);
    engine.enter(&mut cpu, 1000).unwrap();
    assert_eq!(cpu.regs[1], 12);
    assert_eq!(engine.stats().lookup_misses, 1);
    assert_eq!(engine.stats().blocks_compiled, 1);
}

#[test]
fn time_slice_expires_at_a_block_boundary() {
    let mut engine = engine(4);
    // r1 = 0; loop { r1 += 1 }
    load(&mut engine, 0x0, &[movi(1, 0), addi(1, 1), jmp(0x8)]);

    let mut cpu = cpu_at(0x0);
    let exit = engine.enter(&mut cpu, 10).unwrap();
    assert_eq!(exit.reason, ExitReason::TimeSliceExpired);
    assert_eq!(exit.next_pc, 0x8);
    // Entry block (3 insns) runs once, the loop body (2 insns) four times.
    assert_eq!(cpu.regs[1], 5);
    assert_eq!(engine.stats().blocks_entered, 5);
    assert_eq!(engine.stats().instructions_retired, 11);

    // Resuming picks up where the slice ended.
    let exit = engine.enter(&mut cpu, 2).unwrap();
    assert_eq!(exit.reason, ExitReason::TimeSliceExpired);
    assert_eq!(cpu.regs[1], 6);
}

#[test]
fn interrupt_exits_before_any_guest_instruction() {
    let mut engine = engine(4);
    load(&mut engine, 0x0, &[addi(1, 1), halt()]);

    let mut cpu = cpu_at(0x0);
    engine.request_interrupt();
    let exit = engine.enter(&mut cpu, 1000).unwrap();
    assert_eq!(exit.reason, ExitReason::InterruptPending);
    assert_eq!(exit.next_pc, 0x0);
    assert_eq!(cpu.regs[1], 0);

    // The flag is consumed by the exit.
    let exit = engine.enter(&mut cpu, 1000).unwrap();
    assert_eq!(exit.reason, ExitReason::Stopped);
    assert_eq!(cpu.regs[1], 1);
}

#[test]
fn out_of_range_pc_is_a_guest_fault() {
    let mut engine = engine(4);
    let mut cpu = cpu_at(u64::MAX - 7);
    let exit = engine.enter(&mut cpu, 1000).unwrap();
    assert_eq!(
        exit.reason,
        ExitReason::Fault(GuestFault::OutOfRange { addr: u64::MAX - 7 })
    );
}

#[test]
fn unmapped_data_access_is_a_guest_fault() {
    let mut engine = engine(8);
    engine.unmap_pages(0x4000, 0x1000);
    load(&mut engine, 0x0, &[movi(2, 0x4000), ld(3, 2), halt()]);

    let mut cpu = cpu_at(0x0);
    let exit = engine.enter(&mut cpu, 1000).unwrap();
    assert_eq!(
        exit.reason,
        ExitReason::Fault(GuestFault::Unmapped { addr: 0x4000 })
    );
}

#[test]
fn undecodable_opcode_is_fatal_to_the_context() {
    let mut engine = engine(4);
    load(&mut engine, 0x0, &[ins(0xff, 0, 0, 0)]);

    let mut cpu = cpu_at(0x0);
    let err = engine.enter(&mut cpu, 1000).unwrap_err();
    match err {
        CoreError::Compile { pc: 0, source } => {
            assert!(matches!(source, CompileError::Unsupported { pc: 0, .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

/// Decoder that emits four counting instructions per block with a check
/// point after the first two, so an exhausted slice surfaces mid-block
/// instead of waiting for the terminator.
struct CheckpointTranslator;

impl Translator for CheckpointTranslator {
    fn translate(
        &mut self,
        _mem: &GuestMemView<'_>,
        pc: u64,
        asm: &mut BlockAssembler,
    ) -> Result<(), CompileError> {
        asm.note_fetched(pc, 4 * ILEN);
        let bump = || Arc::new(|st: &mut CpuState| st.regs[1] += 1);
        for half in 0..2 {
            if half == 1 {
                asm.interrupt_point(pc + 2 * ILEN);
            }
            for _ in 0..2 {
                asm.instruction();
                asm.exec(bump());
            }
        }
        asm.stop(pc + 4 * ILEN);
        Ok(())
    }
}

#[test]
fn check_point_exits_mid_block_when_the_slice_runs_out() {
    let ram = GuestRam::new(PAGE_SIZE as usize);
    let mut map = AddressSpaceMap::new(PAGE_SIZE);
    map.map(0, 0, PAGE_SIZE);
    let mut engine = Engine::new(
        CheckpointTranslator,
        RecordingBus::default(),
        ram,
        map,
        JitConfig::default(),
    );

    // The slice covers half the block: the check point fires, only the
    // first two instructions have executed, and the resume pc points at
    // the block's midpoint.
    let mut cpu = cpu_at(0x0);
    let exit = engine.enter(&mut cpu, 2).unwrap();
    assert_eq!(exit.reason, ExitReason::TimeSliceExpired);
    assert_eq!(exit.next_pc, 2 * ILEN);
    assert_eq!(cpu.regs[1], 2);

    // Resuming compiles a fresh block at the midpoint and runs to the stop.
    let exit = engine.enter(&mut cpu, 1000).unwrap();
    assert_eq!(exit.reason, ExitReason::Stopped);
    assert_eq!(cpu.regs[1], 6);
    assert_eq!(engine.stats().blocks_compiled, 2);
}

#[test]
fn block_length_cap_splits_straight_line_code() {
    let mut engine = engine_with(
        4,
        kite_jit::JitConfig {
            max_block_instructions: 2,
            ..Default::default()
        },
    );
    load(
        &mut engine,
        0x0,
        &[addi(1, 1), addi(1, 2), addi(1, 4), halt()],
    );

    let mut cpu = cpu_at(0x0);
    let exit = engine.enter(&mut cpu, 1000).unwrap();
    assert_eq!(exit.reason, ExitReason::Stopped);
    assert_eq!(cpu.regs[1], 7);
    // Capped block plus its fallthrough continuation.
    assert_eq!(engine.stats().blocks_compiled, 2);
}
