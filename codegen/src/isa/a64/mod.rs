//! AArch64 instruction set support.

pub mod asm;
pub mod imms;
pub mod inst;
pub mod regs;

#[cfg(test)]
mod emit_tests;

pub use asm::Assembler;
pub use inst::{
    ALUOp, AMode, Cond, CondBrKind, FPUOp2, FpuSize, Inst, LoadStoreType, MoveWideOp,
    OperandSize, PairAMode, ShiftOp,
};
