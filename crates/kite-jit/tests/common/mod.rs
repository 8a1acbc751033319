//! Shared harness: a tiny fixed-width guest ISA, its translator, and a
//! recording device bus, so each test can assemble real guest programs and
//! drive the engine end to end.

#![allow(dead_code)]

use std::sync::Arc;

use kite_jit::{
    BlockAssembler, CompileError, CpuState, Engine, GuestMemView, JitConfig, Reg, Translator,
};
use kite_mmu::{AddressSpaceMap, GuestRam, MmioHandler, Width, PAGE_SIZE};

/// Instruction size in bytes.
pub const ILEN: u64 = 8;

pub const OP_HALT: u8 = 0x00;
pub const OP_MOVI: u8 = 0x01;
pub const OP_ADD: u8 = 0x02;
pub const OP_JMP: u8 = 0x03;
pub const OP_BNZ: u8 = 0x04;
pub const OP_CALL: u8 = 0x05;
pub const OP_RET: u8 = 0x06;
pub const OP_LD: u8 = 0x07;
pub const OP_ST: u8 = 0x08;
pub const OP_JMPI: u8 = 0x09;
pub const OP_ADDI: u8 = 0x0a;

/// Encode one instruction: opcode, rd, rs, pad, imm (little endian).
pub fn ins(op: u8, rd: u8, rs: u8, imm: u32) -> [u8; 8] {
    let i = imm.to_le_bytes();
    [op, rd, rs, 0, i[0], i[1], i[2], i[3]]
}

pub fn halt() -> [u8; 8] {
    ins(OP_HALT, 0, 0, 0)
}

pub fn movi(rd: u8, imm: u32) -> [u8; 8] {
    ins(OP_MOVI, rd, 0, imm)
}

pub fn add(rd: u8, rs: u8) -> [u8; 8] {
    ins(OP_ADD, rd, rs, 0)
}

pub fn addi(rd: u8, imm: u32) -> [u8; 8] {
    ins(OP_ADDI, rd, 0, imm)
}

pub fn jmp(target: u32) -> [u8; 8] {
    ins(OP_JMP, 0, 0, target)
}

pub fn bnz(rs: u8, target: u32) -> [u8; 8] {
    ins(OP_BNZ, 0, rs, target)
}

pub fn call(target: u32) -> [u8; 8] {
    ins(OP_CALL, 0, 0, target)
}

pub fn ret() -> [u8; 8] {
    ins(OP_RET, 0, 0, 0)
}

pub fn ld(rd: u8, rs: u8) -> [u8; 8] {
    ins(OP_LD, rd, rs, 0)
}

pub fn st(rd: u8, rs: u8) -> [u8; 8] {
    ins(OP_ST, rd, rs, 0)
}

pub fn jmpi(rs: u8) -> [u8; 8] {
    ins(OP_JMPI, rs, 0, 0)
}

/// Link register used by CALL/RET.
pub const LR: u8 = 15;

/// Decoder for the toy ISA. One basic block per call, terminated by the
/// first control transfer or the assembler's instruction cap.
pub struct ToyTranslator;

impl Translator for ToyTranslator {
    fn translate(
        &mut self,
        mem: &GuestMemView<'_>,
        pc: u64,
        asm: &mut BlockAssembler,
    ) -> Result<(), CompileError> {
        let mut cur = pc;
        loop {
            let raw = mem.read_bytes(cur, ILEN as usize)?;
            asm.note_fetched(cur, ILEN);
            asm.instruction();
            let (op, rd, rs) = (raw[0], Reg(raw[1]), Reg(raw[2]));
            let imm = u64::from(u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]));
            let next = cur + ILEN;
            match op {
                OP_HALT => {
                    asm.stop(next);
                    return Ok(());
                }
                OP_MOVI => asm.exec(Arc::new(move |st: &mut CpuState| st.set_reg(rd, imm))),
                OP_ADD => asm.exec(Arc::new(move |st: &mut CpuState| {
                    let v = st.reg(rd).wrapping_add(st.reg(rs));
                    st.set_reg(rd, v);
                })),
                OP_ADDI => asm.exec(Arc::new(move |st: &mut CpuState| {
                    let v = st.reg(rd).wrapping_add(imm);
                    st.set_reg(rd, v);
                })),
                OP_JMP => {
                    asm.branch(imm);
                    return Ok(());
                }
                OP_BNZ => {
                    asm.branch_cond(rs, imm, next);
                    return Ok(());
                }
                OP_CALL => {
                    asm.exec(Arc::new(move |st: &mut CpuState| {
                        st.set_reg(Reg(LR), next)
                    }));
                    asm.call(imm, next);
                    return Ok(());
                }
                OP_RET => {
                    asm.ret(Reg(LR));
                    return Ok(());
                }
                OP_LD => asm.load(rd, rs, Width::W64),
                OP_ST => asm.store(rs, rd, Width::W64),
                OP_JMPI => {
                    asm.jump_indirect(rs);
                    return Ok(());
                }
                other => {
                    return Err(CompileError::Unsupported {
                        pc: cur,
                        detail: format!("opcode {other:#04x}"),
                    })
                }
            }
            if asm.at_limit() {
                asm.branch(next);
                return Ok(());
            }
            cur = next;
        }
    }
}

/// Device bus that records every access and answers reads with a fixed
/// value.
#[derive(Debug, Default)]
pub struct RecordingBus {
    pub reads: Vec<(u64, Width)>,
    pub writes: Vec<(u64, Width, u64)>,
    pub read_value: u64,
}

impl MmioHandler for RecordingBus {
    fn read(&mut self, addr: u64, width: Width) -> u64 {
        self.reads.push((addr, width));
        self.read_value
    }

    fn write(&mut self, addr: u64, width: Width, value: u64) {
        self.writes.push((addr, width, value));
    }
}

pub type ToyEngine = Engine<ToyTranslator, RecordingBus>;

/// Engine over `pages` of RAM, identity-mapped.
pub fn engine_with(pages: u64, config: JitConfig) -> ToyEngine {
    let size = pages * PAGE_SIZE;
    let ram = GuestRam::new(size as usize);
    let mut map = AddressSpaceMap::new(size);
    map.map(0, 0, size);
    Engine::new(ToyTranslator, RecordingBus::default(), ram, map, config)
}

pub fn engine(pages: u64) -> ToyEngine {
    engine_with(pages, JitConfig::default())
}

/// Write a program at `at`, one instruction per slot.
pub fn load(engine: &mut ToyEngine, at: u64, program: &[[u8; 8]]) {
    for (i, insn) in program.iter().enumerate() {
        engine
            .ram_mut()
            .write_bytes(at + i as u64 * ILEN, insn)
            .unwrap();
    }
    engine.invalidate(at, program.len() as u64 * ILEN);
}

/// Route `tracing` output through the libtest capture. Safe to call from
/// every test; only the first call installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

pub fn cpu_at(pc: u64) -> CpuState {
    let mut cpu = CpuState::new();
    cpu.pc = pc;
    cpu
}
