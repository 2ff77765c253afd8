//! x86-64 register definitions.

use crate::reg::{Reg, RegClass, Writable};

/// Hardware encodings of the general-purpose registers.
pub mod enc {
    pub const RAX: u8 = 0;
    pub const RCX: u8 = 1;
    pub const RDX: u8 = 2;
    pub const RBX: u8 = 3;
    pub const RSP: u8 = 4;
    pub const RBP: u8 = 5;
    pub const RSI: u8 = 6;
    pub const RDI: u8 = 7;
    pub const R8: u8 = 8;
    pub const R9: u8 = 9;
    pub const R10: u8 = 10;
    pub const R11: u8 = 11;
    pub const R12: u8 = 12;
    pub const R13: u8 = 13;
    pub const R14: u8 = 14;
    pub const R15: u8 = 15;

    /// Encodings `HIGH_BYTE_BASE + n` denote the legacy high-byte registers
    /// AH/CH/DH/BH, which occupy hardware encodings 4..=7 in 8-bit forms
    /// but are only addressable without a REX prefix.
    pub const HIGH_BYTE_BASE: u8 = 16;
}

macro_rules! gpr_constructors {
    ($($name:ident = $enc:expr;)*) => {
        $(
            #[allow(missing_docs)]
            pub const fn $name() -> Reg {
                Reg::physical(RegClass::Gp, $enc)
            }
        )*
    };
}

gpr_constructors! {
    rax = enc::RAX; rcx = enc::RCX; rdx = enc::RDX; rbx = enc::RBX;
    rsp = enc::RSP; rbp = enc::RBP; rsi = enc::RSI; rdi = enc::RDI;
    r8 = enc::R8; r9 = enc::R9; r10 = enc::R10; r11 = enc::R11;
    r12 = enc::R12; r13 = enc::R13; r14 = enc::R14; r15 = enc::R15;
}

/// The legacy high-byte register AH. Only valid in 8-bit forms that emit no
/// REX prefix.
pub const fn ah() -> Reg {
    Reg::physical(RegClass::Gp, enc::HIGH_BYTE_BASE)
}

#[allow(missing_docs)]
pub const fn ch() -> Reg {
    Reg::physical(RegClass::Gp, enc::HIGH_BYTE_BASE + 1)
}

#[allow(missing_docs)]
pub const fn dh() -> Reg {
    Reg::physical(RegClass::Gp, enc::HIGH_BYTE_BASE + 2)
}

#[allow(missing_docs)]
pub const fn bh() -> Reg {
    Reg::physical(RegClass::Gp, enc::HIGH_BYTE_BASE + 3)
}

/// An XMM register by number.
pub const fn xmm(num: u8) -> Reg {
    Reg::physical(RegClass::Vec, num)
}

#[allow(missing_docs)]
pub const fn xmm0() -> Reg {
    xmm(0)
}

#[allow(missing_docs)]
pub const fn xmm1() -> Reg {
    xmm(1)
}

/// Shorthand for a writable register.
pub fn writable(reg: Reg) -> Writable<Reg> {
    Writable::from_reg(reg)
}

/// Registers the compiler reserves as rewrite scratch; excluded from the
/// allocatable pools.
pub const GP_SCRATCH: [u8; 2] = [enc::R10, enc::R11];

/// Vector rewrite scratch.
pub const VEC_SCRATCH: u8 = 15;
