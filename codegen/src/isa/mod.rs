//! Instruction-set backends.
//!
//! Each sub-module provides the full stack for one architecture: register
//! definitions, operand types, the instruction enumeration with its binary
//! encoder, and the [`x64::Assembler`] / [`a64::Assembler`] front ends.

pub mod a64;
pub mod x64;
