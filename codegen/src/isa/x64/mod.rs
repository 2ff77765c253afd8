//! x86-64 instruction set support: registers, operands, the encoder, and
//! the assembler.

pub mod args;
pub mod asm;
pub mod encoding;
pub mod inst;
pub mod regs;

#[cfg(test)]
mod emit_tests;

pub use args::{Amode, InstOpts, OperandSize, RegMem, RegMemImm, Scale};
pub use asm::Assembler;
pub use inst::{
    AluOp, AvxOp, ExtMode, GprToXmmOp, Inst, MulDivOp, SseMovOp, SseOp, ShiftOp, UnaryOp,
    VexMovOp, XmmToGprOp, CC,
};
