//! AArch64 instructions and binary emission.
//!
//! Every instruction is one 32-bit word: a fixed base opcode or'ed with
//! register and immediate fields. Branches to labels are emitted with a
//! zeroed offset field and patched at finalize.

use crate::buffer::CodeBuffer;
use crate::fixup::{Fixup, LabelUse};
use crate::labels::{Label, LabelManager};
use crate::reg::{Reg, RegClass, Writable};
use crate::result::{CodegenError, CodegenResult};

use super::imms::{Imm12, SImm7Scaled, SImm9, UImm12Scaled, UImm5, NZCV};

/// Emission context for AArch64 instructions.
pub(crate) struct EmitCtx<'a> {
    pub buf: &'a mut CodeBuffer,
    pub fixups: &'a mut Vec<Fixup>,
    pub labels: &'a LabelManager,
}

/// Operand size of an integer operation; selects the `sf` bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandSize {
    Size32,
    Size64,
}

impl OperandSize {
    pub fn sf_bit(self) -> u32 {
        match self {
            OperandSize::Size32 => 0,
            OperandSize::Size64 => 1,
        }
    }

    pub fn bytes(self) -> u8 {
        match self {
            OperandSize::Size32 => 4,
            OperandSize::Size64 => 8,
        }
    }
}

/// Condition codes, numbered by their hardware encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[rustfmt::skip]
pub enum Cond {
    Eq = 0, Ne = 1, Hs = 2, Lo = 3, Mi = 4, Pl = 5, Vs = 6, Vc = 7,
    Hi = 8, Ls = 9, Ge = 10, Lt = 11, Gt = 12, Le = 13, Al = 14, Nv = 15,
}

impl Cond {
    pub fn bits(self) -> u32 {
        self as u32
    }

    /// The opposite condition.
    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Hs => Cond::Lo,
            Cond::Lo => Cond::Hs,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Vs => Cond::Vc,
            Cond::Vc => Cond::Vs,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Al => Cond::Nv,
            Cond::Nv => Cond::Al,
        }
    }
}

/// Two-register-source integer ALU operations (shifted-register form).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ALUOp {
    Add,
    Sub,
    AddS,
    SubS,
    And,
    Orr,
    Eor,
}

impl ALUOp {
    /// Bits 31..21 of the shifted-register form, LSL #0.
    fn top11(self, size: OperandSize) -> u32 {
        let base = match self {
            ALUOp::Add => 0b00001011000,
            ALUOp::Sub => 0b01001011000,
            ALUOp::AddS => 0b00101011000,
            ALUOp::SubS => 0b01101011000,
            ALUOp::And => 0b00001010000,
            ALUOp::Orr => 0b00101010000,
            ALUOp::Eor => 0b01001010000,
        };
        base | (size.sf_bit() << 10)
    }

    /// Bits 31..24 of the immediate form; only add/sub have one.
    fn imm_top8(self, size: OperandSize) -> CodegenResult<u32> {
        let base = match self {
            ALUOp::Add => 0b00010001,
            ALUOp::Sub => 0b01010001,
            ALUOp::AddS => 0b00110001,
            ALUOp::SubS => 0b01110001,
            _ => return Err(CodegenError::InvalidInstruction),
        };
        Ok(base | (size.sf_bit() << 7))
    }
}

/// Register shift operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ShiftOp {
    Lsl = 0b00,
    Lsr = 0b01,
    Asr = 0b10,
}

impl ShiftOp {
    pub fn bits(self) -> u32 {
        self as u32
    }
}

/// Move-wide flavors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveWideOp {
    MovZ,
    MovN,
    MovK,
}

/// Integer load/store access types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadStoreType {
    /// 8-bit, zero-extending load.
    B,
    /// 16-bit, zero-extending load.
    H,
    /// 32-bit.
    W,
    /// 64-bit.
    X,
    /// 32-bit, sign-extending to 64 (loads only).
    SW,
}

impl LoadStoreType {
    pub fn bytes(self) -> u8 {
        match self {
            LoadStoreType::B => 1,
            LoadStoreType::H => 2,
            LoadStoreType::W | LoadStoreType::SW => 4,
            LoadStoreType::X => 8,
        }
    }

    /// (unsigned-offset base, unscaled base, register-offset base) for
    /// loads.
    fn load_bases(self) -> (u32, u32, u32) {
        match self {
            LoadStoreType::B => (0x3940_0000, 0x3840_0000, 0x3860_6800),
            LoadStoreType::H => (0x7940_0000, 0x7840_0000, 0x7860_6800),
            LoadStoreType::W => (0xB940_0000, 0xB840_0000, 0xB860_6800),
            LoadStoreType::X => (0xF940_0000, 0xF840_0000, 0xF860_6800),
            LoadStoreType::SW => (0xB980_0000, 0xB880_0000, 0xB8A0_6800),
        }
    }

    /// Same bases for stores; SW has no store form.
    fn store_bases(self) -> CodegenResult<(u32, u32, u32)> {
        Ok(match self {
            LoadStoreType::B => (0x3900_0000, 0x3800_0000, 0x3820_6800),
            LoadStoreType::H => (0x7900_0000, 0x7800_0000, 0x7820_6800),
            LoadStoreType::W => (0xB900_0000, 0xB800_0000, 0xB820_6800),
            LoadStoreType::X => (0xF900_0000, 0xF800_0000, 0xF820_6800),
            LoadStoreType::SW => return Err(CodegenError::InvalidInstruction),
        })
    }
}

/// A memory operand for single loads and stores.
#[derive(Clone, Copy, Debug)]
pub enum AMode {
    /// `[rn, #simm9]` (unscaled).
    Unscaled { rn: Reg, simm9: SImm9 },
    /// `[rn, #uimm12 * scale]`.
    UnsignedOffset { rn: Reg, uimm12: UImm12Scaled },
    /// `[rn, rm]` with no extension or shift.
    RegReg { rn: Reg, rm: Reg },
}

impl AMode {
    /// `[rn]`. Uses the unsigned-offset form so the canonical `ldr`/`str`
    /// encodings are selected rather than `ldur`/`stur`.
    pub fn reg(rn: Reg) -> AMode {
        AMode::UnsignedOffset {
            rn,
            uimm12: UImm12Scaled::zero(1),
        }
    }

    /// `[rn, #offset]` for an access of `size_bytes`, choosing the scaled
    /// unsigned form when the offset admits it and the unscaled form
    /// otherwise.
    pub fn reg_offset(rn: Reg, offset: i64, size_bytes: u8) -> CodegenResult<AMode> {
        if let Some(uimm12) = UImm12Scaled::maybe_from_i64(offset, size_bytes) {
            Ok(AMode::UnsignedOffset { rn, uimm12 })
        } else if let Some(simm9) = SImm9::maybe_from_i64(offset) {
            Ok(AMode::Unscaled { rn, simm9 })
        } else {
            Err(CodegenError::InvalidDisplacement)
        }
    }

    pub fn regs_mut(&mut self) -> impl Iterator<Item = &mut Reg> {
        match self {
            AMode::Unscaled { rn, .. } | AMode::UnsignedOffset { rn, .. } => [Some(rn), None],
            AMode::RegReg { rn, rm } => [Some(rn), Some(rm)],
        }
        .into_iter()
        .flatten()
    }
}

/// A memory operand for load/store pair.
#[derive(Clone, Copy, Debug)]
pub enum PairAMode {
    /// `[rn, #simm7]`.
    SignedOffset { rn: Reg, simm7: SImm7Scaled },
    /// `[rn, #simm7]!`.
    PreIndexed { rn: Reg, simm7: SImm7Scaled },
    /// `[rn], #simm7`.
    PostIndexed { rn: Reg, simm7: SImm7Scaled },
}

/// The kind of a conditional branch.
#[derive(Clone, Copy, Debug)]
pub enum CondBrKind {
    /// CBZ.
    Zero(Reg, OperandSize),
    /// CBNZ.
    NotZero(Reg, OperandSize),
    /// B.cond.
    Cond(Cond),
}

/// Two-source scalar FPU operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FPUOp2 {
    AddF32,
    AddF64,
    SubF32,
    SubF64,
    MulF32,
    MulF64,
}

impl FPUOp2 {
    fn base(self) -> u32 {
        match self {
            FPUOp2::AddF32 => 0x1E20_2800,
            FPUOp2::AddF64 => 0x1E60_2800,
            FPUOp2::SubF32 => 0x1E20_3800,
            FPUOp2::SubF64 => 0x1E60_3800,
            FPUOp2::MulF32 => 0x1E20_0800,
            FPUOp2::MulF64 => 0x1E60_0800,
        }
    }
}

/// Scalar FPU precision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FpuSize {
    F32,
    F64,
}

impl FpuSize {
    pub fn bytes(self) -> u8 {
        match self {
            FpuSize::F32 => 4,
            FpuSize::F64 => 8,
        }
    }
}

/// An AArch64 instruction.
///
/// A closed enumeration; [`Inst::Invalid`] is the zero value.
#[derive(Clone, Debug)]
pub enum Inst {
    Invalid,
    Nop,
    Brk { imm: u16 },
    Ret,
    RetReg { rn: Reg },

    AluRRR {
        op: ALUOp,
        size: OperandSize,
        rd: Writable<Reg>,
        rn: Reg,
        rm: Reg,
    },
    AluRRRShift {
        op: ALUOp,
        size: OperandSize,
        rd: Writable<Reg>,
        rn: Reg,
        rm: Reg,
        shiftop: ShiftOp,
        amount: u8,
    },
    AluRRImm12 {
        op: ALUOp,
        size: OperandSize,
        rd: Writable<Reg>,
        rn: Reg,
        imm12: Imm12,
    },

    MovWide {
        op: MoveWideOp,
        size: OperandSize,
        rd: Writable<Reg>,
        imm: u16,
        shift: u8,
    },
    /// Register move: `orr rd, xzr, rm`.
    MovRR {
        size: OperandSize,
        rd: Writable<Reg>,
        rm: Reg,
    },
    /// Bitwise not: `orn rd, xzr, rm`.
    Mvn {
        size: OperandSize,
        rd: Writable<Reg>,
        rm: Reg,
    },
    /// Synthesized 64-bit constant: `movz` + `movk` per non-zero half-word.
    LoadConst64 {
        rd: Writable<Reg>,
        value: u64,
    },

    MAdd {
        size: OperandSize,
        rd: Writable<Reg>,
        rn: Reg,
        rm: Reg,
        ra: Reg,
    },
    MSub {
        size: OperandSize,
        rd: Writable<Reg>,
        rn: Reg,
        rm: Reg,
        ra: Reg,
    },
    Div {
        signed: bool,
        size: OperandSize,
        rd: Writable<Reg>,
        rn: Reg,
        rm: Reg,
    },
    ShiftVar {
        op: ShiftOp,
        size: OperandSize,
        rd: Writable<Reg>,
        rn: Reg,
        rm: Reg,
    },

    CSel {
        size: OperandSize,
        cond: Cond,
        rd: Writable<Reg>,
        rn: Reg,
        rm: Reg,
    },
    CSet {
        size: OperandSize,
        cond: Cond,
        rd: Writable<Reg>,
    },
    CCmpImm {
        size: OperandSize,
        rn: Reg,
        imm: UImm5,
        nzcv: NZCV,
        cond: Cond,
    },

    ULoad {
        ty: LoadStoreType,
        rd: Writable<Reg>,
        mem: AMode,
    },
    Store {
        ty: LoadStoreType,
        rt: Reg,
        mem: AMode,
    },
    LoadP64 {
        rt: Writable<Reg>,
        rt2: Writable<Reg>,
        mem: PairAMode,
    },
    StoreP64 {
        rt: Reg,
        rt2: Reg,
        mem: PairAMode,
    },

    FpuLoad {
        size: FpuSize,
        rd: Writable<Reg>,
        mem: AMode,
    },
    FpuStore {
        size: FpuSize,
        rt: Reg,
        mem: AMode,
    },
    FpuRRR {
        op: FPUOp2,
        rd: Writable<Reg>,
        rn: Reg,
        rm: Reg,
    },
    FpuMov {
        size: FpuSize,
        rd: Writable<Reg>,
        rn: Reg,
    },
    /// `fmov` from an integer register.
    MovToFpu {
        size: FpuSize,
        rd: Writable<Reg>,
        rn: Reg,
    },

    Jump { dest: Label },
    CondBr {
        kind: CondBrKind,
        target: Label,
    },
    Call { target: Label },
    CallInd { rn: Reg },
    IndirectBr { rn: Reg },
    Adr {
        rd: Writable<Reg>,
        label: Label,
    },
    Adrp {
        rd: Writable<Reg>,
        label: Label,
    },
    /// PC-relative literal load.
    LoadLabel {
        rd: Writable<Reg>,
        size: OperandSize,
        label: Label,
    },
}

fn gpr(reg: Reg) -> CodegenResult<u32> {
    if reg.is_virtual() {
        return Err(CodegenError::IllegalVirtReg);
    }
    if reg.class() != RegClass::Gp {
        return Err(CodegenError::InvalidInstruction);
    }
    Ok(u32::from(reg.hw_enc() & 31))
}

fn vec(reg: Reg) -> CodegenResult<u32> {
    if reg.is_virtual() {
        return Err(CodegenError::IllegalVirtReg);
    }
    if reg.class() != RegClass::Vec {
        return Err(CodegenError::InvalidInstruction);
    }
    Ok(u32::from(reg.hw_enc() & 31))
}

fn enc_arith_rrr(top11: u32, bits_15_10: u32, rd: u32, rn: u32, rm: u32) -> u32 {
    (top11 << 21) | (bits_15_10 << 10) | (rm << 16) | (rn << 5) | rd
}

fn enc_arith_rr_imm12(top8: u32, imm12: Imm12, rn: u32, rd: u32) -> u32 {
    (top8 << 24) | (imm12.shift_bits() << 22) | (imm12.imm_bits() << 10) | (rn << 5) | rd
}

fn enc_move_wide(op: MoveWideOp, size: OperandSize, shift: u8, imm: u16, rd: u32) -> u32 {
    debug_assert!(shift <= 0b11);
    let opc = match op {
        MoveWideOp::MovN => 0b00,
        MoveWideOp::MovZ => 0b10,
        MoveWideOp::MovK => 0b11,
    };
    0x1280_0000
        | (size.sf_bit() << 31)
        | (opc << 29)
        | (u32::from(shift) << 21)
        | (u32::from(imm) << 5)
        | rd
}

fn enc_ldst_pair(base: u32, simm7: SImm7Scaled, rn: u32, rt: u32, rt2: u32) -> u32 {
    base | (simm7.bits() << 15) | (rt2 << 10) | (rn << 5) | rt
}

fn enc_jump26(op_31_26: u32, off_26_0: u32) -> u32 {
    debug_assert!(off_26_0 < (1 << 26));
    (op_31_26 << 26) | off_26_0
}

fn enc_cmpbr(op_31_24: u32, off_18_0: u32, reg: u32) -> u32 {
    debug_assert!(off_18_0 < (1 << 19));
    (op_31_24 << 24) | (off_18_0 << 5) | reg
}

fn enc_cbr(op_31_24: u32, off_18_0: u32, op_4: u32, cond: u32) -> u32 {
    debug_assert!(off_18_0 < (1 << 19));
    (op_31_24 << 24) | (off_18_0 << 5) | (op_4 << 4) | cond
}

fn enc_csel(base: u32, size: OperandSize, rd: u32, rn: u32, rm: u32, cond: Cond) -> u32 {
    base | (size.sf_bit() << 31) | (rm << 16) | (cond.bits() << 12) | (rn << 5) | rd
}

fn enc_madd_msub(size: OperandSize, bit15: u32, rd: u32, rn: u32, rm: u32, ra: u32) -> u32 {
    0x1B00_0000 | (size.sf_bit() << 31) | (rm << 16) | (bit15 << 15) | (ra << 10) | (rn << 5) | rd
}

/// Emit a single load/store given its three addressing-mode base opcodes.
fn enc_ldst(
    bases: (u32, u32, u32),
    mem: &AMode,
    rt: u32,
    size_bytes: u8,
) -> CodegenResult<u32> {
    let (unsigned_base, unscaled_base, regreg_base) = bases;
    match mem {
        AMode::UnsignedOffset { rn, uimm12 } => {
            let _ = size_bytes;
            let rn = gpr(*rn)?;
            Ok(unsigned_base | (uimm12.bits() << 10) | (rn << 5) | rt)
        }
        AMode::Unscaled { rn, simm9 } => {
            let rn = gpr(*rn)?;
            Ok(unscaled_base | (simm9.bits() << 12) | (rn << 5) | rt)
        }
        AMode::RegReg { rn, rm } => {
            let rn = gpr(*rn)?;
            let rm = gpr(*rm)?;
            Ok(regreg_base | (rm << 16) | (rn << 5) | rt)
        }
    }
}

impl Inst {
    /// Encode this instruction into the context's buffer.
    pub(crate) fn encode(&self, ctx: &mut EmitCtx) -> CodegenResult<()> {
        match self {
            Inst::Invalid => Err(CodegenError::InvalidInstruction),

            Inst::Nop => {
                ctx.buf.put4(0xD503_201F)?;
                Ok(())
            }

            Inst::Brk { imm } => {
                ctx.buf.put4(0xD420_0000 | (u32::from(*imm) << 5))?;
                Ok(())
            }

            Inst::Ret => {
                ctx.buf.put4(0xD65F_03C0)?;
                Ok(())
            }

            Inst::RetReg { rn } => {
                let rn = gpr(*rn)?;
                ctx.buf.put4(0xD65F_0000 | (rn << 5))?;
                Ok(())
            }

            Inst::AluRRR { op, size, rd, rn, rm } => {
                let rd = gpr(rd.to_reg())?;
                let rn = gpr(*rn)?;
                let rm = gpr(*rm)?;
                ctx.buf.put4(enc_arith_rrr(op.top11(*size), 0, rd, rn, rm))?;
                Ok(())
            }

            Inst::AluRRRShift {
                op,
                size,
                rd,
                rn,
                rm,
                shiftop,
                amount,
            } => {
                let max = if *size == OperandSize::Size64 { 63 } else { 31 };
                if *amount > max {
                    return Err(CodegenError::InvalidImmediate);
                }
                let rd = gpr(rd.to_reg())?;
                let rn = gpr(*rn)?;
                let rm = gpr(*rm)?;
                let top11 = op.top11(*size) | (shiftop.bits() << 1);
                ctx.buf
                    .put4(enc_arith_rrr(top11, u32::from(*amount), rd, rn, rm))?;
                Ok(())
            }

            Inst::AluRRImm12 {
                op,
                size,
                rd,
                rn,
                imm12,
            } => {
                let top8 = op.imm_top8(*size)?;
                let rd = gpr(rd.to_reg())?;
                let rn = gpr(*rn)?;
                ctx.buf.put4(enc_arith_rr_imm12(top8, *imm12, rn, rd))?;
                Ok(())
            }

            Inst::MovWide {
                op,
                size,
                rd,
                imm,
                shift,
            } => {
                if *shift > 3 || (*size == OperandSize::Size32 && *shift > 1) {
                    return Err(CodegenError::InvalidImmediate);
                }
                let rd = gpr(rd.to_reg())?;
                ctx.buf.put4(enc_move_wide(*op, *size, *shift, *imm, rd))?;
                Ok(())
            }

            Inst::MovRR { size, rd, rm } => {
                let rd = gpr(rd.to_reg())?;
                let rm = gpr(*rm)?;
                // orr rd, xzr, rm.
                let top11 = ALUOp::Orr.top11(*size);
                ctx.buf.put4(enc_arith_rrr(top11, 0, rd, 31, rm))?;
                Ok(())
            }

            Inst::Mvn { size, rd, rm } => {
                let rd = gpr(rd.to_reg())?;
                let rm = gpr(*rm)?;
                // orn rd, xzr, rm: orr with the N bit (21) set.
                let top11 = ALUOp::Orr.top11(*size) | 1;
                ctx.buf.put4(enc_arith_rrr(top11, 0, rd, 31, rm))?;
                Ok(())
            }

            Inst::LoadConst64 { rd, value } => {
                let rd_enc = gpr(rd.to_reg())?;
                let mut first = true;
                for hw in 0..4u8 {
                    let bits = ((*value >> (16 * hw)) & 0xffff) as u16;
                    if bits != 0 {
                        let op = if first { MoveWideOp::MovZ } else { MoveWideOp::MovK };
                        ctx.buf
                            .put4(enc_move_wide(op, OperandSize::Size64, hw, bits, rd_enc))?;
                        first = false;
                    }
                }
                if first {
                    ctx.buf
                        .put4(enc_move_wide(MoveWideOp::MovZ, OperandSize::Size64, 0, 0, rd_enc))?;
                }
                Ok(())
            }

            Inst::MAdd { size, rd, rn, rm, ra } => {
                let rd = gpr(rd.to_reg())?;
                ctx.buf.put4(enc_madd_msub(*size, 0, rd, gpr(*rn)?, gpr(*rm)?, gpr(*ra)?))?;
                Ok(())
            }

            Inst::MSub { size, rd, rn, rm, ra } => {
                let rd = gpr(rd.to_reg())?;
                ctx.buf.put4(enc_madd_msub(*size, 1, rd, gpr(*rn)?, gpr(*rm)?, gpr(*ra)?))?;
                Ok(())
            }

            Inst::Div {
                signed,
                size,
                rd,
                rn,
                rm,
            } => {
                let base = if *signed { 0x1AC0_0C00 } else { 0x1AC0_0800 };
                let word = base
                    | (size.sf_bit() << 31)
                    | (gpr(*rm)? << 16)
                    | (gpr(*rn)? << 5)
                    | gpr(rd.to_reg())?;
                ctx.buf.put4(word)?;
                Ok(())
            }

            Inst::ShiftVar { op, size, rd, rn, rm } => {
                let base = match op {
                    ShiftOp::Lsl => 0x1AC0_2000,
                    ShiftOp::Lsr => 0x1AC0_2400,
                    ShiftOp::Asr => 0x1AC0_2800,
                };
                let word = base
                    | (size.sf_bit() << 31)
                    | (gpr(*rm)? << 16)
                    | (gpr(*rn)? << 5)
                    | gpr(rd.to_reg())?;
                ctx.buf.put4(word)?;
                Ok(())
            }

            Inst::CSel { size, cond, rd, rn, rm } => {
                let word = enc_csel(
                    0x1A80_0000,
                    *size,
                    gpr(rd.to_reg())?,
                    gpr(*rn)?,
                    gpr(*rm)?,
                    *cond,
                );
                ctx.buf.put4(word)?;
                Ok(())
            }

            Inst::CSet { size, cond, rd } => {
                // csinc rd, xzr, xzr, inv(cond).
                let word = enc_csel(0x1A80_0400, *size, gpr(rd.to_reg())?, 31, 31, cond.invert());
                ctx.buf.put4(word)?;
                Ok(())
            }

            Inst::CCmpImm {
                size,
                rn,
                imm,
                nzcv,
                cond,
            } => {
                let word = 0x7A40_0800
                    | (size.sf_bit() << 31)
                    | (imm.bits() << 16)
                    | (cond.bits() << 12)
                    | (gpr(*rn)? << 5)
                    | nzcv.bits();
                ctx.buf.put4(word)?;
                Ok(())
            }

            Inst::ULoad { ty, rd, mem } => {
                let rt = gpr(rd.to_reg())?;
                let word = enc_ldst(ty.load_bases(), mem, rt, ty.bytes())?;
                ctx.buf.put4(word)?;
                Ok(())
            }

            Inst::Store { ty, rt, mem } => {
                let rt = gpr(*rt)?;
                let word = enc_ldst(ty.store_bases()?, mem, rt, ty.bytes())?;
                ctx.buf.put4(word)?;
                Ok(())
            }

            Inst::LoadP64 { rt, rt2, mem } => {
                let rt = gpr(rt.to_reg())?;
                let rt2 = gpr(rt2.to_reg())?;
                let (base, rn, simm7) = match mem {
                    PairAMode::SignedOffset { rn, simm7 } => (0xA940_0000, rn, simm7),
                    PairAMode::PreIndexed { rn, simm7 } => (0xA9C0_0000, rn, simm7),
                    PairAMode::PostIndexed { rn, simm7 } => (0xA8C0_0000, rn, simm7),
                };
                ctx.buf.put4(enc_ldst_pair(base, *simm7, gpr(*rn)?, rt, rt2))?;
                Ok(())
            }

            Inst::StoreP64 { rt, rt2, mem } => {
                let rt = gpr(*rt)?;
                let rt2 = gpr(*rt2)?;
                let (base, rn, simm7) = match mem {
                    PairAMode::SignedOffset { rn, simm7 } => (0xA900_0000, rn, simm7),
                    PairAMode::PreIndexed { rn, simm7 } => (0xA980_0000, rn, simm7),
                    PairAMode::PostIndexed { rn, simm7 } => (0xA880_0000, rn, simm7),
                };
                ctx.buf.put4(enc_ldst_pair(base, *simm7, gpr(*rn)?, rt, rt2))?;
                Ok(())
            }

            Inst::FpuLoad { size, rd, mem } => {
                let bases = match size {
                    FpuSize::F32 => (0xBD40_0000, 0xBC40_0000, 0xBC60_6800),
                    FpuSize::F64 => (0xFD40_0000, 0xFC40_0000, 0xFC60_6800),
                };
                let rt = vec(rd.to_reg())?;
                let word = enc_ldst(bases, mem, rt, size.bytes())?;
                ctx.buf.put4(word)?;
                Ok(())
            }

            Inst::FpuStore { size, rt, mem } => {
                let bases = match size {
                    FpuSize::F32 => (0xBD00_0000, 0xBC00_0000, 0xBC20_6800),
                    FpuSize::F64 => (0xFD00_0000, 0xFC00_0000, 0xFC20_6800),
                };
                let rt = vec(*rt)?;
                let word = enc_ldst(bases, mem, rt, size.bytes())?;
                ctx.buf.put4(word)?;
                Ok(())
            }

            Inst::FpuRRR { op, rd, rn, rm } => {
                let word = op.base() | (vec(*rm)? << 16) | (vec(*rn)? << 5) | vec(rd.to_reg())?;
                ctx.buf.put4(word)?;
                Ok(())
            }

            Inst::FpuMov { size, rd, rn } => {
                let base = match size {
                    FpuSize::F32 => 0x1E20_4000,
                    FpuSize::F64 => 0x1E60_4000,
                };
                ctx.buf.put4(base | (vec(*rn)? << 5) | vec(rd.to_reg())?)?;
                Ok(())
            }

            Inst::MovToFpu { size, rd, rn } => {
                let base = match size {
                    FpuSize::F32 => 0x1E27_0000,
                    FpuSize::F64 => 0x9E67_0000,
                };
                ctx.buf.put4(base | (gpr(*rn)? << 5) | vec(rd.to_reg())?)?;
                Ok(())
            }

            Inst::Jump { dest } => {
                use_label(ctx, *dest, LabelUse::Branch26)?;
                ctx.buf.put4(enc_jump26(0b000101, 0))?;
                Ok(())
            }

            Inst::Call { target } => {
                use_label(ctx, *target, LabelUse::Branch26)?;
                ctx.buf.put4(enc_jump26(0b100101, 0))?;
                Ok(())
            }

            Inst::CondBr { kind, target } => {
                use_label(ctx, *target, LabelUse::Branch19)?;
                let word = match kind {
                    CondBrKind::Zero(rn, size) => {
                        enc_cmpbr(0b0011010_0 | (size.sf_bit() << 7), 0, gpr(*rn)?)
                    }
                    CondBrKind::NotZero(rn, size) => {
                        enc_cmpbr(0b0011010_1 | (size.sf_bit() << 7), 0, gpr(*rn)?)
                    }
                    CondBrKind::Cond(c) => enc_cbr(0b01010100, 0, 0b0, c.bits()),
                };
                ctx.buf.put4(word)?;
                Ok(())
            }

            Inst::CallInd { rn } => {
                ctx.buf.put4(0xD63F_0000 | (gpr(*rn)? << 5))?;
                Ok(())
            }

            Inst::IndirectBr { rn } => {
                ctx.buf.put4(0xD61F_0000 | (gpr(*rn)? << 5))?;
                Ok(())
            }

            Inst::Adr { rd, label } => {
                use_label(ctx, *label, LabelUse::Adr21)?;
                ctx.buf.put4((0b00010000 << 24) | gpr(rd.to_reg())?)?;
                Ok(())
            }

            Inst::Adrp { rd, label } => {
                use_label(ctx, *label, LabelUse::Adrp21)?;
                ctx.buf.put4((0b10010000u32 << 24) | gpr(rd.to_reg())?)?;
                Ok(())
            }

            Inst::LoadLabel { rd, size, label } => {
                use_label(ctx, *label, LabelUse::Ldr19)?;
                let base = match size {
                    OperandSize::Size32 => 0x1800_0000,
                    OperandSize::Size64 => 0x5800_0000,
                };
                ctx.buf.put4(base | gpr(rd.to_reg())?)?;
                Ok(())
            }
        }
    }
}

/// Record a fixup for `label` at the current offset.
///
/// Branch displacements are always resolved at finalize, even for
/// already-bound targets, so range overflow surfaces there rather than at
/// emission.
fn use_label(ctx: &mut EmitCtx, label: Label, kind: LabelUse) -> CodegenResult<()> {
    if !ctx.labels.is_valid(label) {
        return Err(CodegenError::InvalidLabel);
    }
    ctx.fixups.push(Fixup {
        at: ctx.buf.cur_offset(),
        label,
        kind,
    });
    Ok(())
}

pub(crate) use crate::reg::RegRole;

impl Inst {
    /// Visit every register operand with its role.
    pub(crate) fn visit_regs(&mut self, f: &mut dyn FnMut(&mut Reg, RegRole)) {
        use RegRole::*;
        fn mem(m: &mut AMode, f: &mut dyn FnMut(&mut Reg, RegRole)) {
            for r in m.regs_mut() {
                f(r, RegRole::Use);
            }
        }
        fn writable(w: &mut Writable<Reg>, role: RegRole, f: &mut dyn FnMut(&mut Reg, RegRole)) {
            let mut reg = w.to_reg();
            f(&mut reg, role);
            *w = Writable::from_reg(reg);
        }
        match self {
            Inst::Invalid
            | Inst::Nop
            | Inst::Brk { .. }
            | Inst::Ret
            | Inst::Jump { .. }
            | Inst::Call { .. } => {}
            Inst::RetReg { rn } | Inst::CallInd { rn } | Inst::IndirectBr { rn } => f(rn, Use),
            Inst::AluRRR { rd, rn, rm, .. }
            | Inst::AluRRRShift { rd, rn, rm, .. }
            | Inst::Div { rd, rn, rm, .. }
            | Inst::ShiftVar { rd, rn, rm, .. }
            | Inst::CSel { rd, rn, rm, .. } => {
                f(rn, Use);
                f(rm, Use);
                writable(rd, Def, f);
            }
            Inst::AluRRImm12 { rd, rn, .. } => {
                f(rn, Use);
                writable(rd, Def, f);
            }
            Inst::MovWide { op, rd, .. } => {
                let role = if *op == MoveWideOp::MovK { UseDef } else { Def };
                writable(rd, role, f);
            }
            Inst::MovRR { rd, rm, .. } | Inst::Mvn { rd, rm, .. } => {
                f(rm, Use);
                writable(rd, Def, f);
            }
            Inst::LoadConst64 { rd, .. } => writable(rd, Def, f),
            Inst::MAdd { rd, rn, rm, ra, .. } | Inst::MSub { rd, rn, rm, ra, .. } => {
                f(rn, Use);
                f(rm, Use);
                f(ra, Use);
                writable(rd, Def, f);
            }
            Inst::CSet { rd, .. } => writable(rd, Def, f),
            Inst::CCmpImm { rn, .. } => f(rn, Use),
            Inst::ULoad { rd, mem: m, .. } => {
                mem(m, f);
                writable(rd, Def, f);
            }
            Inst::Store { rt, mem: m, .. } => {
                f(rt, Use);
                mem(m, f);
            }
            Inst::LoadP64 { rt, rt2, mem: m } => {
                pair_mem(m, f);
                writable(rt, Def, f);
                writable(rt2, Def, f);
            }
            Inst::StoreP64 { rt, rt2, mem: m } => {
                f(rt, Use);
                f(rt2, Use);
                pair_mem(m, f);
            }
            Inst::FpuLoad { rd, mem: m, .. } => {
                mem(m, f);
                writable(rd, Def, f);
            }
            Inst::FpuStore { rt, mem: m, .. } => {
                f(rt, Use);
                mem(m, f);
            }
            Inst::FpuRRR { rd, rn, rm, .. } => {
                f(rn, Use);
                f(rm, Use);
                writable(rd, Def, f);
            }
            Inst::FpuMov { rd, rn, .. } | Inst::MovToFpu { rd, rn, .. } => {
                f(rn, Use);
                writable(rd, Def, f);
            }
            Inst::CondBr { kind, .. } => match kind {
                CondBrKind::Zero(rn, _) | CondBrKind::NotZero(rn, _) => f(rn, Use),
                CondBrKind::Cond(_) => {}
            },
            Inst::Adr { rd, .. } | Inst::Adrp { rd, .. } => writable(rd, Def, f),
            Inst::LoadLabel { rd, .. } => writable(rd, Def, f),
        }
    }
}

fn pair_mem(m: &mut PairAMode, f: &mut dyn FnMut(&mut Reg, RegRole)) {
    match m {
        PairAMode::SignedOffset { rn, .. }
        | PairAMode::PreIndexed { rn, .. }
        | PairAMode::PostIndexed { rn, .. } => f(rn, RegRole::Use),
    }
}
