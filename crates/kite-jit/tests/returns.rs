//! Return prediction observed end to end.

mod common;

use common::*;
use kite_jit::ExitReason;

#[test]
fn returns_are_predicted() {
    let mut engine = engine(8);
    // main: call F; r1 += 1; halt        F: r1 = 10; ret
    load(&mut engine, 0x0, &[call(0x100)]);
    load(&mut engine, 0x8, &[addi(1, 1), halt()]);
    load(&mut engine, 0x100, &[movi(1, 10), ret()]);

    let mut cpu = cpu_at(0x0);
    engine.enter(&mut cpu, 1000).unwrap();
    assert_eq!(cpu.regs[1], 11);
    assert_eq!(engine.stats().ret_hits, 1);
    assert_eq!(engine.stats().ret_misses, 0);

    let mut cpu = cpu_at(0x0);
    engine.enter(&mut cpu, 1000).unwrap();
    assert_eq!(cpu.regs[1], 11);
    assert_eq!(engine.stats().ret_hits, 2);
    assert_eq!(engine.stats().ret_misses, 0);
}

#[test]
fn tampered_link_register_misses_and_clears() {
    let mut engine = engine(8);
    // F overwrites the link register before returning, so the prediction
    // can never match.
    load(&mut engine, 0x0, &[call(0x100)]);
    load(&mut engine, 0x8, &[movi(1, 1), halt()]);
    load(&mut engine, 0x200, &[movi(1, 2), halt()]);
    load(&mut engine, 0x100, &[movi(LR, 0x200), ret()]);

    let mut cpu = cpu_at(0x0);
    let exit = engine.enter(&mut cpu, 1000).unwrap();
    assert_eq!(exit.reason, ExitReason::Stopped);
    // Landed at 0x200, not the call's continuation.
    assert_eq!(cpu.regs[1], 2);
    assert_eq!(engine.stats().ret_hits, 0);
    assert_eq!(engine.stats().ret_misses, 1);
}

#[test]
fn evicting_a_predicted_target_clears_the_stack() {
    let mut engine = engine(8);
    // main: call F; (ret lands at 0x8) jmp main     F: ret
    load(&mut engine, 0x0, &[call(0x100)]);
    load(&mut engine, 0x8, &[jmp(0x0)]);
    load(&mut engine, 0x100, &[ret()]);

    // Slice tuned so the loop stops right after a call has pushed a frame
    // predicting into the (by then compiled) continuation block.
    let mut cpu = cpu_at(0x0);
    let exit = engine.enter(&mut cpu, 4).unwrap();
    assert_eq!(exit.reason, ExitReason::TimeSliceExpired);
    assert_eq!(exit.next_pc, 0x100);
    let hits = engine.stats().ret_hits;

    // The continuation block goes away while the frame still points at it.
    engine.invalidate(0x8, 8);

    // Resuming must not jump into dead code: the return misses, routes
    // through the table, and the continuation recompiles.
    let exit = engine.enter(&mut cpu, 1000).unwrap();
    assert_eq!(exit.reason, ExitReason::TimeSliceExpired);
    assert_eq!(engine.stats().ret_misses, 1);
    assert!(engine.stats().ret_hits >= hits);
}
