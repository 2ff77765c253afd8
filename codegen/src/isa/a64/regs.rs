//! AArch64 register definitions.

use crate::reg::{Reg, RegClass, Writable};

/// An X-register (integer register). `xreg(31)` is the zero register or
/// the stack pointer depending on the consuming instruction form, exactly
/// as in the hardware encoding.
pub const fn xreg(num: u8) -> Reg {
    Reg::physical(RegClass::Gp, num & 31)
}

/// A V-register (vector/FP register).
pub const fn vreg(num: u8) -> Reg {
    Reg::physical(RegClass::Vec, num & 31)
}

/// The stack pointer. Shares encoding 31 with the zero register; the
/// instruction form decides which is meant.
pub const fn sp() -> Reg {
    xreg(31)
}

/// The zero register.
pub const fn zero_reg() -> Reg {
    xreg(31)
}

/// The frame pointer (x29).
pub const fn fp_reg() -> Reg {
    xreg(29)
}

/// The link register (x30).
pub const fn link_reg() -> Reg {
    xreg(30)
}

/// The platform register (x18), reserved on common AArch64 ABIs.
pub const fn platform_reg() -> Reg {
    xreg(18)
}

/// First rewrite scratch (x16, IP0). Reserved from allocation so spill
/// rewrites always have a register to load into.
pub const fn spilltmp_reg() -> Reg {
    xreg(16)
}

/// Second rewrite scratch (x17, IP1).
pub const fn tmp2_reg() -> Reg {
    xreg(17)
}

/// Vector rewrite scratch (v31).
pub const fn vec_spilltmp_reg() -> Reg {
    vreg(31)
}

/// Shorthand for a writable register.
pub fn writable(reg: Reg) -> Writable<Reg> {
    Writable::from_reg(reg)
}
