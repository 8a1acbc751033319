//! Randomized soak: generated guest programs run through the engine and
//! through a plain reference interpreter, and every architectural outcome
//! must agree. Small cache caps keep LRU eviction, relinking, and
//! recompilation constantly in play.

mod common;

use common::*;
use kite_jit::{ExitReason, JitConfig};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const DATA_BASE: u64 = 0x1000;
const ROUNDS: usize = 30;
const MAX_SLOTS: usize = 48;

/// Straight interpreter for the toy ISA, the oracle the JIT is checked
/// against.
struct Reference {
    regs: [u64; 16],
    pc: u64,
}

impl Reference {
    fn new(pc: u64) -> Self {
        Self { regs: [0; 16], pc }
    }

    /// Run to HALT; the generator only emits forward branches, so this
    /// always terminates.
    fn run(&mut self, mem: &mut [u8]) {
        loop {
            let i = self.pc as usize;
            let raw: [u8; 8] = mem[i..i + 8].try_into().unwrap();
            let (rd, rs) = (raw[1] as usize, raw[2] as usize);
            let imm = u64::from(u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]));
            let next = self.pc + ILEN;
            self.pc = next;
            match raw[0] {
                OP_HALT => return,
                OP_MOVI => self.regs[rd] = imm,
                OP_ADD => self.regs[rd] = self.regs[rd].wrapping_add(self.regs[rs]),
                OP_ADDI => self.regs[rd] = self.regs[rd].wrapping_add(imm),
                OP_JMP => self.pc = imm,
                OP_BNZ => {
                    if self.regs[rs] != 0 {
                        self.pc = imm;
                    }
                }
                OP_LD => {
                    let a = self.regs[rs] as usize;
                    self.regs[rd] = u64::from_le_bytes(mem[a..a + 8].try_into().unwrap());
                }
                OP_ST => {
                    let a = self.regs[rd] as usize;
                    mem[a..a + 8].copy_from_slice(&self.regs[rs].to_le_bytes());
                }
                other => panic!("generator emitted opcode {other:#04x}"),
            }
        }
    }
}

/// Random program over slots `[0, n)`, branching only forward, ending in
/// HALT. Returns one instruction per slot.
fn gen_program(rng: &mut ChaCha8Rng) -> Vec<[u8; 8]> {
    let n = rng.gen_range(8..MAX_SLOTS);
    let mut prog = Vec::with_capacity(n);
    let mut i = 0;
    while i < n - 1 {
        let slot_addr = |s: usize| (s as u64) * ILEN;
        match rng.gen_range(0..8) {
            0 | 1 => prog.push(movi(rng.gen_range(1..8), rng.gen())),
            2 => prog.push(addi(rng.gen_range(1..8), rng.gen())),
            3 => prog.push(add(rng.gen_range(1..8), rng.gen_range(1..8))),
            4 => {
                let target = rng.gen_range(i + 1..n);
                prog.push(jmp(slot_addr(target) as u32));
            }
            5 => {
                let target = rng.gen_range(i + 1..n);
                prog.push(bnz(rng.gen_range(1..8), slot_addr(target) as u32));
            }
            6 | 7 if i + 2 < n => {
                // Addressed pair: point r9 at the data page, then access it.
                let addr = DATA_BASE + rng.gen_range(0..0x1f0) * 8;
                prog.push(movi(9, addr as u32));
                if rng.gen_bool(0.5) {
                    prog.push(st(9, rng.gen_range(1..8)));
                } else {
                    prog.push(ld(rng.gen_range(1..8), 9));
                }
                i += 1;
            }
            _ => prog.push(addi(rng.gen_range(1..8), 1)),
        }
        i += 1;
    }
    prog.push(halt());
    prog
}

fn run_to_halt(engine: &mut ToyEngine, cpu: &mut kite_jit::CpuState) {
    for _ in 0..10_000 {
        let exit = engine.enter(cpu, 64).unwrap();
        match exit.reason {
            ExitReason::Stopped => return,
            ExitReason::TimeSliceExpired => continue,
            other => panic!("unexpected exit {other:?}"),
        }
    }
    panic!("program did not halt");
}

#[test]
fn jit_matches_reference_across_regenerated_programs() {
    init_tracing();
    let mut rng = ChaCha8Rng::seed_from_u64(0x6b697465);
    let mut engine = engine_with(
        8,
        JitConfig {
            cache_max_blocks: 6,
            ..Default::default()
        },
    );

    for round in 0..ROUNDS {
        let prog = gen_program(&mut rng);
        // New code over the old program: the invalidation path has to tear
        // down everything compiled from earlier rounds.
        load(&mut engine, 0x0, &prog);

        let mut mem = vec![0u8; 0x2000];
        for (i, insn) in prog.iter().enumerate() {
            mem[i * 8..i * 8 + 8].copy_from_slice(insn);
        }
        mem[0x1000..0x2000].copy_from_slice(&engine.ram().bytes(0x1000, 0x1000).unwrap().to_vec());

        let mut reference = Reference::new(0x0);
        reference.run(&mut mem);

        let mut cpu = cpu_at(0x0);
        run_to_halt(&mut engine, &mut cpu);

        assert_eq!(cpu.regs, reference.regs, "registers diverged in round {round}");
        assert_eq!(cpu.pc, reference.pc, "pc diverged in round {round}");
        assert_eq!(
            engine.ram().bytes(0x1000, 0x1000).unwrap(),
            &mem[0x1000..0x2000],
            "data page diverged in round {round}"
        );
    }
    // The caps were actually exercised.
    assert!(engine.stats().blocks_evicted > 0);
}
