//! x86-64 instructions and binary emission.

use crate::buffer::CodeBuffer;
use crate::fixup::{Fixup, LabelUse};
use crate::labels::{Label, LabelManager};
use crate::reg::{Reg, RegClass, Writable};
use crate::result::{CodegenError, CodegenResult};

use super::args::{Amode, InstOpts, OperandSize, RegMem, RegMemImm};
use super::encoding::{encode_modrm, encode_sib, vex_map, vex_pp, Disp, Rex, Vex};
use super::regs::enc;

/// Emission context: the output buffer plus the label state needed for
/// branch-form selection and fixup recording.
pub(crate) struct EmitCtx<'a> {
    pub buf: &'a mut CodeBuffer,
    pub fixups: &'a mut Vec<Fixup>,
    pub labels: &'a LabelManager,
    /// Select 2-byte branch forms for bound, in-range targets.
    pub opt_short_branches: bool,
}

/// Read-modify-write ALU operations sharing the classic opcode grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    And,
    Sub,
    Xor,
}

impl AluOp {
    /// The 8-bit `r/m, r` opcode; the grid derives every other form.
    fn base(self) -> u8 {
        match self {
            AluOp::Add => 0x00,
            AluOp::Or => 0x08,
            AluOp::And => 0x20,
            AluOp::Sub => 0x28,
            AluOp::Xor => 0x30,
        }
    }

    /// The /digit used by the 0x80/0x81/0x83 immediate group.
    fn ext(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::Or => 1,
            AluOp::And => 4,
            AluOp::Sub => 5,
            AluOp::Xor => 6,
        }
    }
}

/// Shift-group operations (/digit of 0xC1/0xD3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
}

impl ShiftOp {
    fn ext(self) -> u8 {
        match self {
            ShiftOp::Shl => 4,
            ShiftOp::Shr => 5,
            ShiftOp::Sar => 7,
        }
    }
}

/// Single-operand read-modify-write operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Inc,
    Dec,
    Not,
    Neg,
}

impl UnaryOp {
    /// (opcode-for-wide-sizes, /digit). 8-bit forms subtract one from the
    /// opcode.
    fn opcode_ext(self) -> (u8, u8) {
        match self {
            UnaryOp::Inc => (0xFF, 0),
            UnaryOp::Dec => (0xFF, 1),
            UnaryOp::Not => (0xF7, 2),
            UnaryOp::Neg => (0xF7, 3),
        }
    }
}

/// Widening multiply/divide group operating on RDX:RAX (/digit of 0xF7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MulDivOp {
    Mul,
    Imul,
    Div,
    Idiv,
}

impl MulDivOp {
    fn ext(self) -> u8 {
        match self {
            MulDivOp::Mul => 4,
            MulDivOp::Imul => 5,
            MulDivOp::Div => 6,
            MulDivOp::Idiv => 7,
        }
    }
}

/// Zero/sign extension shapes for `movzx`/`movsx`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtMode {
    /// 8 -> 32.
    BL,
    /// 8 -> 64.
    BQ,
    /// 16 -> 32.
    WL,
    /// 16 -> 64.
    WQ,
    /// 32 -> 64 (sign-extending form is `movsxd`).
    LQ,
}

impl ExtMode {
    fn src_size(self) -> OperandSize {
        match self {
            ExtMode::BL | ExtMode::BQ => OperandSize::Size8,
            ExtMode::WL | ExtMode::WQ => OperandSize::Size16,
            ExtMode::LQ => OperandSize::Size32,
        }
    }

    fn rex(self) -> Rex {
        match self {
            ExtMode::BQ | ExtMode::WQ | ExtMode::LQ => Rex::w(),
            _ => Rex::clear_w(),
        }
    }
}

/// Condition codes, numbered by their hardware encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[rustfmt::skip]
pub enum CC {
    O = 0, NO = 1, B = 2, NB = 3, Z = 4, NZ = 5, BE = 6, NBE = 7,
    S = 8, NS = 9, P = 10, NP = 11, L = 12, NL = 13, LE = 14, NLE = 15,
}

impl CC {
    pub fn bits(self) -> u8 {
        self as u8
    }
}

/// Non-VEX SSE operations of the `xmm, xmm/m` shape: (mandatory prefix,
/// opcode after 0F).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SseOp {
    Addps,
    Addpd,
    Addss,
    Addsd,
    Subsd,
    Mulss,
    Mulsd,
    Xorps,
    Pxor,
}

impl SseOp {
    fn prefix_opcode(self) -> (Option<u8>, u8) {
        match self {
            SseOp::Addps => (None, 0x58),
            SseOp::Addpd => (Some(0x66), 0x58),
            SseOp::Addss => (Some(0xF3), 0x58),
            SseOp::Addsd => (Some(0xF2), 0x58),
            SseOp::Subsd => (Some(0xF2), 0x5C),
            SseOp::Mulss => (Some(0xF3), 0x59),
            SseOp::Mulsd => (Some(0xF2), 0x59),
            SseOp::Xorps => (None, 0x57),
            SseOp::Pxor => (Some(0x66), 0xEF),
        }
    }
}

/// SSE move families with distinct load and store opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SseMovOp {
    Movups,
    Movaps,
    Movss,
    Movsd,
    Movdqu,
}

impl SseMovOp {
    /// (mandatory prefix, load opcode, store opcode).
    fn encoding(self) -> (Option<u8>, u8, u8) {
        match self {
            SseMovOp::Movups => (None, 0x10, 0x11),
            SseMovOp::Movaps => (None, 0x28, 0x29),
            SseMovOp::Movss => (Some(0xF3), 0x10, 0x11),
            SseMovOp::Movsd => (Some(0xF2), 0x10, 0x11),
            SseMovOp::Movdqu => (Some(0xF3), 0x6F, 0x7F),
        }
    }
}

/// GPR-to-XMM transfers and conversions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GprToXmmOp {
    Cvtsi2ss,
    Cvtsi2sd,
    Movd,
    Movq,
}

/// XMM-to-GPR transfers and conversions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XmmToGprOp {
    Cvttss2si,
    Cvttsd2si,
    Movd,
    Movq,
}

/// VEX-encoded three-operand vector ALU ops: (pp, map, opcode).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AvxOp {
    Vaddps,
    Vaddpd,
    Vaddsd,
    Vmulps,
    Vxorps,
    Vpxor,
}

impl AvxOp {
    fn encoding(self) -> (u8, u8, u8) {
        match self {
            AvxOp::Vaddps => (vex_pp::NONE, vex_map::M0F, 0x58),
            AvxOp::Vaddpd => (vex_pp::P66, vex_map::M0F, 0x58),
            AvxOp::Vaddsd => (vex_pp::PF2, vex_map::M0F, 0x58),
            AvxOp::Vmulps => (vex_pp::NONE, vex_map::M0F, 0x59),
            AvxOp::Vxorps => (vex_pp::NONE, vex_map::M0F, 0x57),
            AvxOp::Vpxor => (vex_pp::P66, vex_map::M0F, 0xEF),
        }
    }

    /// Scalar ops ignore the L bit; reject explicit 256-bit requests.
    fn allows_l256(self) -> bool {
        !matches!(self, AvxOp::Vaddsd)
    }
}

/// VEX-encoded vector moves: (pp, load opcode, store opcode).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VexMovOp {
    Vmovups,
    Vmovdqu,
}

impl VexMovOp {
    fn encoding(self) -> (u8, u8, u8) {
        match self {
            VexMovOp::Vmovups => (vex_pp::NONE, 0x10, 0x11),
            VexMovOp::Vmovdqu => (vex_pp::PF3, 0x6F, 0x7F),
        }
    }
}

/// An x86-64 instruction.
///
/// This is a closed enumeration; every variant maps to exactly one
/// instruction form, and [`Inst::Invalid`] is the zero value. Register
/// operands may be virtual inside a builder; they must all be physical by
/// the time [`Inst`] reaches emission.
#[derive(Clone, Debug)]
pub enum Inst {
    /// Not an instruction; always an emission error.
    Invalid,
    /// A canonical multi-byte NOP of 1..=9 bytes.
    Nop { len: u8 },
    Ud2,

    /// `op dst, src` (register forms).
    AluRR {
        op: AluOp,
        size: OperandSize,
        dst: Writable<Reg>,
        src: Reg,
    },
    /// `op dst, [mem]`.
    AluRM {
        op: AluOp,
        size: OperandSize,
        dst: Writable<Reg>,
        src: Amode,
    },
    /// `op [mem], src`; accepts LOCK.
    AluMR {
        op: AluOp,
        size: OperandSize,
        dst: Amode,
        src: Reg,
        opts: InstOpts,
    },
    /// `op dst, imm`, shortest immediate form.
    AluRI {
        op: AluOp,
        size: OperandSize,
        dst: Writable<Reg>,
        imm: i32,
    },
    /// `op [mem], imm`; accepts LOCK.
    AluMI {
        op: AluOp,
        size: OperandSize,
        dst: Amode,
        imm: i32,
        opts: InstOpts,
    },

    /// `cmp lhs, rhs`.
    Cmp {
        size: OperandSize,
        lhs: Reg,
        rhs: RegMemImm,
    },
    /// `test lhs, rhs`.
    Test {
        size: OperandSize,
        lhs: Reg,
        rhs: RegMemImm,
    },

    MovRR {
        size: OperandSize,
        dst: Writable<Reg>,
        src: Reg,
    },
    MovRI {
        size: OperandSize,
        dst: Writable<Reg>,
        imm: i64,
    },
    /// `movabs dst, label` with a 64-bit absolute relocation resolved at
    /// runtime placement.
    MovRIAbs {
        dst: Writable<Reg>,
        target: Label,
    },
    /// Load: `mov dst, [mem]`.
    MovRM {
        size: OperandSize,
        dst: Writable<Reg>,
        src: Amode,
    },
    /// Store: `mov [mem], src`. Accepts segment overrides but not LOCK
    /// (`mov` is not lockable).
    MovMR {
        size: OperandSize,
        dst: Amode,
        src: Reg,
        opts: InstOpts,
    },
    /// Store immediate: `mov [mem], imm`.
    MovMI {
        size: OperandSize,
        dst: Amode,
        imm: i32,
    },
    Movzx {
        ext: ExtMode,
        dst: Writable<Reg>,
        src: RegMem,
    },
    Movsx {
        ext: ExtMode,
        dst: Writable<Reg>,
        src: RegMem,
    },
    Lea {
        size: OperandSize,
        dst: Writable<Reg>,
        addr: Amode,
    },

    Unary {
        op: UnaryOp,
        size: OperandSize,
        dst: Writable<Reg>,
    },
    /// Memory form of the unary group; accepts LOCK.
    UnaryM {
        op: UnaryOp,
        size: OperandSize,
        addr: Amode,
        opts: InstOpts,
    },
    /// Widening multiply/divide on RDX:RAX.
    MulDiv {
        op: MulDivOp,
        size: OperandSize,
        src: RegMem,
    },
    /// Two-operand `imul dst, src`.
    Imul2 {
        size: OperandSize,
        dst: Writable<Reg>,
        src: RegMem,
    },
    /// `cwd`/`cdq`/`cqo`, selected by size.
    SignExtendAx { size: OperandSize },

    ShiftRI {
        op: ShiftOp,
        size: OperandSize,
        dst: Writable<Reg>,
        amount: u8,
    },
    ShiftRCl {
        op: ShiftOp,
        size: OperandSize,
        dst: Writable<Reg>,
    },

    /// `xchg [mem], src` (implicitly locked by the hardware).
    XchgMR {
        size: OperandSize,
        addr: Amode,
        src: Reg,
        opts: InstOpts,
    },
    /// `cmpxchg [mem], src`; accepts LOCK.
    CmpxchgMR {
        size: OperandSize,
        addr: Amode,
        src: Reg,
        opts: InstOpts,
    },

    Cmov {
        cc: CC,
        size: OperandSize,
        dst: Writable<Reg>,
        src: RegMem,
    },
    Setcc {
        cc: CC,
        dst: Writable<Reg>,
    },

    Push64 { src: Reg },
    Pop64 { dst: Writable<Reg> },
    Ret,
    CallKnown { target: Label },
    CallUnknown { target: RegMem },
    JmpKnown {
        target: Label,
        opts: InstOpts,
    },
    JmpCond {
        cc: CC,
        target: Label,
        opts: InstOpts,
    },
    JmpUnknown { target: RegMem },

    /// SSE `op dst, src`.
    XmmRmR {
        op: SseOp,
        dst: Writable<Reg>,
        src: RegMem,
    },
    XmmLoad {
        op: SseMovOp,
        dst: Writable<Reg>,
        src: Amode,
    },
    XmmStore {
        op: SseMovOp,
        dst: Amode,
        src: Reg,
    },
    XmmMovRR {
        op: SseMovOp,
        dst: Writable<Reg>,
        src: Reg,
    },
    GprToXmm {
        op: GprToXmmOp,
        src_size: OperandSize,
        dst: Writable<Reg>,
        src: RegMem,
    },
    XmmToGpr {
        op: XmmToGprOp,
        dst_size: OperandSize,
        dst: Writable<Reg>,
        src: Reg,
    },

    /// VEX three-operand `op dst, src1, src2`.
    XmmRmRVex {
        op: AvxOp,
        l256: bool,
        dst: Writable<Reg>,
        src1: Reg,
        src2: RegMem,
    },
    VexLoad {
        op: VexMovOp,
        l256: bool,
        dst: Writable<Reg>,
        src: Amode,
    },
    VexStore {
        op: VexMovOp,
        l256: bool,
        dst: Amode,
        src: Reg,
    },
    Vzeroupper,
}

/// A general-purpose register encoding, resolved for an 8-bit context.
#[derive(Clone, Copy)]
struct Gpr8 {
    enc: u8,
    /// AH/CH/DH/BH: encodable only when no REX prefix is present.
    high_byte: bool,
}

fn enc_gpr(reg: Reg) -> CodegenResult<u8> {
    if reg.is_virtual() {
        return Err(CodegenError::IllegalVirtReg);
    }
    if reg.class() != RegClass::Gp {
        return Err(CodegenError::InvalidInstruction);
    }
    let e = reg.hw_enc();
    if e >= enc::HIGH_BYTE_BASE {
        // High-byte registers only exist at 8-bit width.
        return Err(CodegenError::InvalidUseOfGpq);
    }
    Ok(e)
}

fn enc_gpr8(reg: Reg) -> CodegenResult<Gpr8> {
    if reg.is_virtual() {
        return Err(CodegenError::IllegalVirtReg);
    }
    if reg.class() != RegClass::Gp {
        return Err(CodegenError::InvalidInstruction);
    }
    let e = reg.hw_enc();
    if e >= enc::HIGH_BYTE_BASE {
        if e >= enc::HIGH_BYTE_BASE + 4 {
            return Err(CodegenError::InvalidInstruction);
        }
        return Ok(Gpr8 {
            enc: e - enc::HIGH_BYTE_BASE + 4,
            high_byte: true,
        });
    }
    Ok(Gpr8 { enc: e, high_byte: false })
}

fn enc_xmm(reg: Reg) -> CodegenResult<u8> {
    if reg.is_virtual() {
        return Err(CodegenError::IllegalVirtReg);
    }
    if reg.class() != RegClass::Vec {
        return Err(CodegenError::InvalidInstruction);
    }
    Ok(reg.hw_enc())
}

/// Emit the legacy prefixes selected by `opts` plus the operand-size
/// prefix, in canonical order: LOCK, REP/REPNE, segment override, 0x66.
fn emit_prefixes(ctx: &mut EmitCtx, opts: InstOpts, size: OperandSize, lockable: bool) -> CodegenResult<()> {
    if opts.contains(InstOpts::LOCK) {
        if !lockable {
            return Err(CodegenError::InvalidPrefixCombination);
        }
        ctx.buf.put1(0xF0)?;
    }
    if opts.contains(InstOpts::REP) {
        ctx.buf.put1(0xF3)?;
    }
    if opts.contains(InstOpts::REPNE) {
        ctx.buf.put1(0xF2)?;
    }
    if opts.contains(InstOpts::SEG_FS) {
        ctx.buf.put1(0x64)?;
    }
    if opts.contains(InstOpts::SEG_GS) {
        ctx.buf.put1(0x65)?;
    }
    if size == OperandSize::Size16 {
        ctx.buf.put1(0x66)?;
    }
    Ok(())
}

fn rex_for(size: OperandSize) -> Rex {
    if size.is_64() {
        Rex::w()
    } else {
        Rex::clear_w()
    }
}

/// Emit opcode + ModR/M for a register-register form.
fn put_op_rr(
    buf: &mut CodeBuffer,
    rex: Rex,
    opcodes: &[u8],
    enc_g: u8,
    enc_e: u8,
) -> CodegenResult<()> {
    rex.emit_two_op(buf, enc_g, enc_e)?;
    buf.put_bytes(opcodes)?;
    buf.put1(encode_modrm(0b11, enc_g, enc_e))
}

/// Emit REX + opcode + ModR/M (+ SIB, + displacement) for a memory form.
///
/// `bytes_at_end` is the number of immediate bytes that will follow the
/// displacement; a RIP-relative displacement is relative to the end of the
/// instruction, so the pre-patch field compensates for those trailing bytes
/// and the finalize patch adds the label displacement to it.
fn put_op_mem(
    ctx: &mut EmitCtx,
    rex: Rex,
    opcodes: &[u8],
    enc_g: u8,
    mem: &Amode,
    bytes_at_end: u8,
) -> CodegenResult<()> {
    mem.validate()?;
    match *mem {
        Amode::ImmReg { disp, base } => {
            let enc_e = enc_gpr(base)?;
            rex.emit_two_op(ctx.buf, enc_g, enc_e)?;
            ctx.buf.put_bytes(opcodes)?;
            let mut disp = Disp::classify(disp);
            if enc_e & 7 == enc::RSP {
                // An RSP-family base needs a SIB byte with index = none
                // (0b100), base = 0b100.
                ctx.buf.put1(encode_modrm(disp.m0d(), enc_g, 0b100))?;
                ctx.buf.put1(encode_sib(0, 0b100, 0b100))?;
                disp.emit(ctx.buf)?;
            } else {
                // mod=00 with an RBP-family base would read as RIP-relative;
                // force an explicit zero disp8.
                if enc_e & 7 == enc::RBP {
                    disp.force_disp8();
                }
                ctx.buf.put1(encode_modrm(disp.m0d(), enc_g, enc_e))?;
                disp.emit(ctx.buf)?;
            }
        }
        Amode::ImmRegRegShift {
            disp,
            base,
            index,
            scale,
        } => {
            let enc_base = enc_gpr(base)?;
            let enc_index = enc_gpr(index)?;
            debug_assert!(enc_index != enc::RSP);
            rex.emit_three_op(ctx.buf, enc_g, enc_index, enc_base)?;
            ctx.buf.put_bytes(opcodes)?;
            let mut disp = Disp::classify(disp);
            // An RBP-family base in a SIB byte requires an explicit
            // displacement.
            if enc_base & 7 == enc::RBP {
                disp.force_disp8();
            }
            ctx.buf.put1(encode_modrm(disp.m0d(), enc_g, 0b100))?;
            ctx.buf.put1(encode_sib(scale.enc(), enc_index, enc_base))?;
            disp.emit(ctx.buf)?;
        }
        Amode::RipRelative { target } => {
            if !ctx.labels.is_valid(target) {
                return Err(CodegenError::InvalidLabel);
            }
            rex.emit_two_op(ctx.buf, enc_g, 0)?;
            ctx.buf.put_bytes(opcodes)?;
            ctx.buf.put1(encode_modrm(0b00, enc_g, 0b101))?;
            let at = ctx.buf.cur_offset();
            ctx.fixups.push(Fixup {
                at,
                label: target,
                kind: LabelUse::Rel32,
            });
            // Pre-load the addend compensating for trailing immediate bytes.
            ctx.buf.put4(-(i32::from(bytes_at_end)) as u32)?;
        }
    }
    Ok(())
}

/// Emit the immediate for a 0x81/0xC7-family form at `size`.
fn put_imm_for_size(buf: &mut CodeBuffer, size: OperandSize, imm: i32) -> CodegenResult<()> {
    match size {
        OperandSize::Size8 => {
            let v = i8::try_from(imm).map_err(|_| CodegenError::InvalidImmediate)?;
            buf.put1(v as u8)?;
        }
        OperandSize::Size16 => {
            let v = i16::try_from(imm).map_err(|_| CodegenError::InvalidImmediate)?;
            buf.put2(v as u16)?;
        }
        OperandSize::Size32 | OperandSize::Size64 => buf.put4(imm as u32)?,
    }
    Ok(())
}

fn imm_bytes_for_size(size: OperandSize) -> u8 {
    match size {
        OperandSize::Size8 => 1,
        OperandSize::Size16 => 2,
        _ => 4,
    }
}

impl Inst {
    /// Encode this instruction into the context's buffer, recording fixups
    /// for unresolved labels.
    pub(crate) fn encode(&self, ctx: &mut EmitCtx) -> CodegenResult<()> {
        match self {
            Inst::Invalid => Err(CodegenError::InvalidInstruction),

            Inst::Nop { len } => {
                // Canonical multi-byte NOP sequences from the SDM.
                let mut remaining = usize::from(*len);
                while remaining > 0 {
                    let chunk = remaining.min(9);
                    static NOPS: [&[u8]; 9] = [
                        &[0x90],
                        &[0x66, 0x90],
                        &[0x0F, 0x1F, 0x00],
                        &[0x0F, 0x1F, 0x40, 0x00],
                        &[0x0F, 0x1F, 0x44, 0x00, 0x00],
                        &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
                        &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
                        &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
                        &[0x66, 0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
                    ];
                    ctx.buf.put_bytes(NOPS[chunk - 1])?;
                    remaining -= chunk;
                }
                Ok(())
            }

            Inst::Ud2 => {
                ctx.buf.put_bytes(&[0x0F, 0x0B])?;
                Ok(())
            }

            Inst::AluRR { op, size, dst, src } => {
                emit_prefixes(ctx, InstOpts::NONE, *size, false)?;
                if *size == OperandSize::Size8 {
                    let d = enc_gpr8(dst.to_reg())?;
                    let s = enc_gpr8(*src)?;
                    emit_rr8(ctx.buf, &[op.base()], s, d)
                } else {
                    let d = enc_gpr(dst.to_reg())?;
                    let s = enc_gpr(*src)?;
                    put_op_rr(ctx.buf, rex_for(*size), &[op.base() + 1], s, d)?;
                    Ok(())
                }
            }

            Inst::AluRM { op, size, dst, src } => {
                if *size == OperandSize::Size8 {
                    return Err(CodegenError::InvalidOperandSize);
                }
                emit_prefixes(ctx, InstOpts::NONE, *size, false)?;
                let d = enc_gpr(dst.to_reg())?;
                put_op_mem(ctx, rex_for(*size), &[op.base() + 3], d, src, 0)
            }

            Inst::AluMR {
                op,
                size,
                dst,
                src,
                opts,
            } => {
                if *size == OperandSize::Size8 {
                    return Err(CodegenError::InvalidOperandSize);
                }
                emit_prefixes(ctx, *opts, *size, true)?;
                let s = enc_gpr(*src)?;
                put_op_mem(ctx, rex_for(*size), &[op.base() + 1], s, dst, 0)
            }

            Inst::AluRI { op, size, dst, imm } => {
                emit_prefixes(ctx, InstOpts::NONE, *size, false)?;
                if *size == OperandSize::Size8 {
                    let d = enc_gpr8(dst.to_reg())?;
                    let mut rex = Rex::clear_w();
                    if !d.high_byte && (4..=7).contains(&d.enc) {
                        rex = rex.force();
                    }
                    if d.high_byte && rex.is_emitted(0, 0, d.enc) {
                        return Err(CodegenError::InvalidUseOfGpbHi);
                    }
                    rex.emit_one_op(ctx.buf, d.enc)?;
                    ctx.buf.put1(0x80)?;
                    ctx.buf.put1(encode_modrm(0b11, op.ext(), d.enc))?;
                    put_imm_for_size(ctx.buf, *size, *imm)
                } else {
                    let d = enc_gpr(dst.to_reg())?;
                    let rex = rex_for(*size);
                    if let Ok(imm8) = i8::try_from(*imm) {
                        rex.emit_one_op(ctx.buf, d)?;
                        ctx.buf.put1(0x83)?;
                        ctx.buf.put1(encode_modrm(0b11, op.ext(), d))?;
                        ctx.buf.put1(imm8 as u8)?;
                        Ok(())
                    } else {
                        rex.emit_one_op(ctx.buf, d)?;
                        ctx.buf.put1(0x81)?;
                        ctx.buf.put1(encode_modrm(0b11, op.ext(), d))?;
                        put_imm_for_size(ctx.buf, *size, *imm)
                    }
                }
            }

            Inst::AluMI {
                op,
                size,
                dst,
                imm,
                opts,
            } => {
                emit_prefixes(ctx, *opts, *size, true)?;
                let rex = rex_for(*size);
                if *size == OperandSize::Size8 {
                    put_op_mem(ctx, rex, &[0x80], op.ext(), dst, 1)?;
                    put_imm_for_size(ctx.buf, *size, *imm)
                } else if let Ok(imm8) = i8::try_from(*imm) {
                    put_op_mem(ctx, rex, &[0x83], op.ext(), dst, 1)?;
                    ctx.buf.put1(imm8 as u8)?;
                    Ok(())
                } else {
                    put_op_mem(ctx, rex, &[0x81], op.ext(), dst, imm_bytes_for_size(*size))?;
                    put_imm_for_size(ctx.buf, *size, *imm)
                }
            }

            Inst::Cmp { size, lhs, rhs } => emit_cmp_test(ctx, *size, *lhs, rhs, 0x38, 7),
            Inst::Test { size, lhs, rhs } => emit_test(ctx, *size, *lhs, rhs),

            Inst::MovRR { size, dst, src } => {
                emit_prefixes(ctx, InstOpts::NONE, *size, false)?;
                if *size == OperandSize::Size8 {
                    let d = enc_gpr8(dst.to_reg())?;
                    let s = enc_gpr8(*src)?;
                    emit_rr8(ctx.buf, &[0x88], s, d)
                } else {
                    let d = enc_gpr(dst.to_reg())?;
                    let s = enc_gpr(*src)?;
                    put_op_rr(ctx.buf, rex_for(*size), &[0x89], s, d)?;
                    Ok(())
                }
            }

            Inst::MovRI { size, dst, imm } => {
                emit_prefixes(ctx, InstOpts::NONE, *size, false)?;
                match size {
                    OperandSize::Size8 => {
                        if !(-128..=255).contains(imm) {
                            return Err(CodegenError::InvalidImmediate);
                        }
                        let d = enc_gpr8(dst.to_reg())?;
                        let v = (*imm & 0xff) as u8;
                        let mut rex = Rex::clear_w();
                        if !d.high_byte && (4..=7).contains(&d.enc) {
                            rex = rex.force();
                        }
                        if d.high_byte && rex.is_emitted(0, 0, d.enc) {
                            return Err(CodegenError::InvalidUseOfGpbHi);
                        }
                        rex.emit_one_op(ctx.buf, d.enc)?;
                        ctx.buf.put1(0xB0 + (d.enc & 7))?;
                        ctx.buf.put1(v)?;
                        Ok(())
                    }
                    OperandSize::Size16 => {
                        let d = enc_gpr(dst.to_reg())?;
                        if i16::try_from(*imm).is_err() && u16::try_from(*imm).is_err() {
                            return Err(CodegenError::InvalidImmediate);
                        }
                        Rex::clear_w().emit_one_op(ctx.buf, d)?;
                        ctx.buf.put1(0xB8 + (d & 7))?;
                        ctx.buf.put2(*imm as u16)?;
                        Ok(())
                    }
                    OperandSize::Size32 => {
                        let d = enc_gpr(dst.to_reg())?;
                        if i32::try_from(*imm).is_err() && u32::try_from(*imm).is_err() {
                            return Err(CodegenError::InvalidImmediate);
                        }
                        Rex::clear_w().emit_one_op(ctx.buf, d)?;
                        ctx.buf.put1(0xB8 + (d & 7))?;
                        ctx.buf.put4(*imm as u32)?;
                        Ok(())
                    }
                    OperandSize::Size64 => {
                        let d = enc_gpr(dst.to_reg())?;
                        if let Ok(imm32) = i32::try_from(*imm) {
                            // Sign-extended 32-bit form.
                            Rex::w().emit_one_op(ctx.buf, d)?;
                            ctx.buf.put1(0xC7)?;
                            ctx.buf.put1(encode_modrm(0b11, 0, d))?;
                            ctx.buf.put4(imm32 as u32)?;
                        } else {
                            Rex::w().emit_one_op(ctx.buf, d)?;
                            ctx.buf.put1(0xB8 + (d & 7))?;
                            ctx.buf.put8(*imm as u64)?;
                        }
                        Ok(())
                    }
                }
            }

            Inst::MovRIAbs { dst, target } => {
                if !ctx.labels.is_valid(*target) {
                    return Err(CodegenError::InvalidLabel);
                }
                let d = enc_gpr(dst.to_reg())?;
                Rex::w().emit_one_op(ctx.buf, d)?;
                ctx.buf.put1(0xB8 + (d & 7))?;
                let at = ctx.buf.reserve(8)?;
                ctx.fixups.push(Fixup {
                    at,
                    label: *target,
                    kind: LabelUse::Abs64,
                });
                Ok(())
            }

            Inst::MovRM { size, dst, src } => {
                emit_prefixes(ctx, InstOpts::NONE, *size, false)?;
                if *size == OperandSize::Size8 {
                    let d = enc_gpr8(dst.to_reg())?;
                    if d.high_byte {
                        return Err(CodegenError::InvalidUseOfGpbHi);
                    }
                    let mut rex = Rex::clear_w();
                    if (4..=7).contains(&d.enc) {
                        rex = rex.force();
                    }
                    put_op_mem(ctx, rex, &[0x8A], d.enc, src, 0)
                } else {
                    let d = enc_gpr(dst.to_reg())?;
                    put_op_mem(ctx, rex_for(*size), &[0x8B], d, src, 0)
                }
            }

            Inst::MovMR { size, dst, src, opts } => {
                emit_prefixes(ctx, *opts, *size, false)?;
                if *size == OperandSize::Size8 {
                    let s = enc_gpr8(*src)?;
                    if s.high_byte {
                        return Err(CodegenError::InvalidUseOfGpbHi);
                    }
                    let mut rex = Rex::clear_w();
                    if (4..=7).contains(&s.enc) {
                        rex = rex.force();
                    }
                    put_op_mem(ctx, rex, &[0x88], s.enc, dst, 0)
                } else {
                    let s = enc_gpr(*src)?;
                    put_op_mem(ctx, rex_for(*size), &[0x89], s, dst, 0)
                }
            }

            Inst::MovMI { size, dst, imm } => {
                emit_prefixes(ctx, InstOpts::NONE, *size, false)?;
                let opcode = if *size == OperandSize::Size8 { 0xC6 } else { 0xC7 };
                put_op_mem(ctx, rex_for(*size), &[opcode], 0, dst, imm_bytes_for_size(*size))?;
                put_imm_for_size(ctx.buf, *size, *imm)
            }

            Inst::Movzx { ext, dst, src } => emit_ext(ctx, *ext, dst, src, 0xB6),
            Inst::Movsx { ext, dst, src } => emit_ext(ctx, *ext, dst, src, 0xBE),

            Inst::Lea { size, dst, addr } => {
                if !matches!(size, OperandSize::Size32 | OperandSize::Size64) {
                    return Err(CodegenError::InvalidOperandSize);
                }
                let d = enc_gpr(dst.to_reg())?;
                put_op_mem(ctx, rex_for(*size), &[0x8D], d, addr, 0)
            }

            Inst::Unary { op, size, dst } => {
                emit_prefixes(ctx, InstOpts::NONE, *size, false)?;
                let (opcode, ext) = op.opcode_ext();
                let opcode = if *size == OperandSize::Size8 { opcode - 1 } else { opcode };
                let d = enc_gpr(dst.to_reg())?;
                let rex = rex_for(*size);
                rex.emit_one_op(ctx.buf, d)?;
                ctx.buf.put1(opcode)?;
                ctx.buf.put1(encode_modrm(0b11, ext, d))?;
                Ok(())
            }

            Inst::UnaryM { op, size, addr, opts } => {
                emit_prefixes(ctx, *opts, *size, true)?;
                let (opcode, ext) = op.opcode_ext();
                let opcode = if *size == OperandSize::Size8 { opcode - 1 } else { opcode };
                put_op_mem(ctx, rex_for(*size), &[opcode], ext, addr, 0)
            }

            Inst::MulDiv { op, size, src } => {
                emit_prefixes(ctx, InstOpts::NONE, *size, false)?;
                let opcode = if *size == OperandSize::Size8 { 0xF6 } else { 0xF7 };
                match src {
                    RegMem::Reg(r) => {
                        let e = enc_gpr(*r)?;
                        let rex = rex_for(*size);
                        rex.emit_one_op(ctx.buf, e)?;
                        ctx.buf.put1(opcode)?;
                        ctx.buf.put1(encode_modrm(0b11, op.ext(), e))?;
                        Ok(())
                    }
                    RegMem::Mem(m) => put_op_mem(ctx, rex_for(*size), &[opcode], op.ext(), m, 0),
                }
            }

            Inst::Imul2 { size, dst, src } => {
                if *size == OperandSize::Size8 {
                    return Err(CodegenError::InvalidOperandSize);
                }
                emit_prefixes(ctx, InstOpts::NONE, *size, false)?;
                let d = enc_gpr(dst.to_reg())?;
                match src {
                    RegMem::Reg(r) => {
                        let s = enc_gpr(*r)?;
                        put_op_rr(ctx.buf, rex_for(*size), &[0x0F, 0xAF], d, s)?;
                        Ok(())
                    }
                    RegMem::Mem(m) => put_op_mem(ctx, rex_for(*size), &[0x0F, 0xAF], d, m, 0),
                }
            }

            Inst::SignExtendAx { size } => match size {
                OperandSize::Size16 => ctx.buf.put_bytes(&[0x66, 0x99]),
                OperandSize::Size32 => ctx.buf.put1(0x99),
                OperandSize::Size64 => ctx.buf.put_bytes(&[0x48, 0x99]),
                OperandSize::Size8 => Err(CodegenError::InvalidOperandSize),
            },

            Inst::ShiftRI {
                op,
                size,
                dst,
                amount,
            } => {
                if u32::from(*amount) >= size.bytes() * 8 {
                    return Err(CodegenError::InvalidImmediate);
                }
                emit_prefixes(ctx, InstOpts::NONE, *size, false)?;
                let opcode = if *size == OperandSize::Size8 { 0xC0 } else { 0xC1 };
                let d = enc_gpr(dst.to_reg())?;
                let rex = rex_for(*size);
                rex.emit_one_op(ctx.buf, d)?;
                ctx.buf.put1(opcode)?;
                ctx.buf.put1(encode_modrm(0b11, op.ext(), d))?;
                ctx.buf.put1(*amount)?;
                Ok(())
            }

            Inst::ShiftRCl { op, size, dst } => {
                emit_prefixes(ctx, InstOpts::NONE, *size, false)?;
                let opcode = if *size == OperandSize::Size8 { 0xD2 } else { 0xD3 };
                let d = enc_gpr(dst.to_reg())?;
                let rex = rex_for(*size);
                rex.emit_one_op(ctx.buf, d)?;
                ctx.buf.put1(opcode)?;
                ctx.buf.put1(encode_modrm(0b11, op.ext(), d))?;
                Ok(())
            }

            Inst::XchgMR { size, addr, src, opts } => {
                emit_prefixes(ctx, *opts, *size, true)?;
                let opcode = if *size == OperandSize::Size8 { 0x86 } else { 0x87 };
                let s = enc_gpr(*src)?;
                put_op_mem(ctx, rex_for(*size), &[opcode], s, addr, 0)
            }

            Inst::CmpxchgMR { size, addr, src, opts } => {
                emit_prefixes(ctx, *opts, *size, true)?;
                let opcode = if *size == OperandSize::Size8 { 0xB0 } else { 0xB1 };
                let s = enc_gpr(*src)?;
                put_op_mem(ctx, rex_for(*size), &[0x0F, opcode], s, addr, 0)
            }

            Inst::Cmov { cc, size, dst, src } => {
                if *size == OperandSize::Size8 {
                    return Err(CodegenError::InvalidOperandSize);
                }
                emit_prefixes(ctx, InstOpts::NONE, *size, false)?;
                let d = enc_gpr(dst.to_reg())?;
                let opcodes = [0x0F, 0x40 + cc.bits()];
                match src {
                    RegMem::Reg(r) => {
                        let s = enc_gpr(*r)?;
                        put_op_rr(ctx.buf, rex_for(*size), &opcodes, d, s)?;
                        Ok(())
                    }
                    RegMem::Mem(m) => put_op_mem(ctx, rex_for(*size), &opcodes, d, m, 0),
                }
            }

            Inst::Setcc { cc, dst } => {
                let d = enc_gpr8(dst.to_reg())?;
                let mut rex = Rex::clear_w();
                if !d.high_byte && (4..=7).contains(&d.enc) {
                    rex = rex.force();
                }
                if d.high_byte && rex.is_emitted(0, 0, d.enc) {
                    return Err(CodegenError::InvalidUseOfGpbHi);
                }
                rex.emit_one_op(ctx.buf, d.enc)?;
                ctx.buf.put_bytes(&[0x0F, 0x90 + cc.bits()])?;
                ctx.buf.put1(encode_modrm(0b11, 0, d.enc))?;
                Ok(())
            }

            Inst::Push64 { src } => {
                let e = enc_gpr(*src)?;
                Rex::clear_w().emit_one_op(ctx.buf, e)?;
                ctx.buf.put1(0x50 + (e & 7))?;
                Ok(())
            }

            Inst::Pop64 { dst } => {
                let e = enc_gpr(dst.to_reg())?;
                Rex::clear_w().emit_one_op(ctx.buf, e)?;
                ctx.buf.put1(0x58 + (e & 7))?;
                Ok(())
            }

            Inst::Ret => {
                ctx.buf.put1(0xC3)?;
                Ok(())
            }

            Inst::CallKnown { target } => {
                ctx.buf.put1(0xE8)?;
                emit_rel32_target(ctx, *target)
            }

            Inst::CallUnknown { target } => emit_group5(ctx, target, 2),
            Inst::JmpUnknown { target } => emit_group5(ctx, target, 4),

            Inst::JmpKnown { target, opts } => {
                emit_branch(ctx, *target, *opts, None)
            }
            Inst::JmpCond { cc, target, opts } => {
                emit_branch(ctx, *target, *opts, Some(*cc))
            }

            Inst::XmmRmR { op, dst, src } => {
                let (prefix, opcode) = op.prefix_opcode();
                if let Some(p) = prefix {
                    ctx.buf.put1(p)?;
                }
                let d = enc_xmm(dst.to_reg())?;
                match src {
                    RegMem::Reg(r) => {
                        let s = enc_xmm(*r)?;
                        put_op_rr(ctx.buf, Rex::clear_w(), &[0x0F, opcode], d, s)?;
                        Ok(())
                    }
                    RegMem::Mem(m) => put_op_mem(ctx, Rex::clear_w(), &[0x0F, opcode], d, m, 0),
                }
            }

            Inst::XmmLoad { op, dst, src } => {
                let (prefix, load, _) = op.encoding();
                if let Some(p) = prefix {
                    ctx.buf.put1(p)?;
                }
                let d = enc_xmm(dst.to_reg())?;
                put_op_mem(ctx, Rex::clear_w(), &[0x0F, load], d, src, 0)
            }

            Inst::XmmStore { op, dst, src } => {
                let (prefix, _, store) = op.encoding();
                if let Some(p) = prefix {
                    ctx.buf.put1(p)?;
                }
                let s = enc_xmm(*src)?;
                put_op_mem(ctx, Rex::clear_w(), &[0x0F, store], s, dst, 0)
            }

            Inst::XmmMovRR { op, dst, src } => {
                let (prefix, load, _) = op.encoding();
                if let Some(p) = prefix {
                    ctx.buf.put1(p)?;
                }
                let d = enc_xmm(dst.to_reg())?;
                let s = enc_xmm(*src)?;
                put_op_rr(ctx.buf, Rex::clear_w(), &[0x0F, load], d, s)?;
                Ok(())
            }

            Inst::GprToXmm {
                op,
                src_size,
                dst,
                src,
            } => {
                if !matches!(src_size, OperandSize::Size32 | OperandSize::Size64) {
                    return Err(CodegenError::InvalidOperandSize);
                }
                let (prefix, opcode) = match op {
                    GprToXmmOp::Cvtsi2ss => (0xF3, 0x2A),
                    GprToXmmOp::Cvtsi2sd => (0xF2, 0x2A),
                    GprToXmmOp::Movd | GprToXmmOp::Movq => (0x66, 0x6E),
                };
                if matches!(op, GprToXmmOp::Movd) && src_size.is_64() {
                    return Err(CodegenError::OperandSizeMismatch);
                }
                if matches!(op, GprToXmmOp::Movq) && !src_size.is_64() {
                    return Err(CodegenError::OperandSizeMismatch);
                }
                ctx.buf.put1(prefix)?;
                let d = enc_xmm(dst.to_reg())?;
                let rex = rex_for(*src_size);
                match src {
                    RegMem::Reg(r) => {
                        let s = enc_gpr(*r)?;
                        put_op_rr(ctx.buf, rex, &[0x0F, opcode], d, s)?;
                        Ok(())
                    }
                    RegMem::Mem(m) => put_op_mem(ctx, rex, &[0x0F, opcode], d, m, 0),
                }
            }

            Inst::XmmToGpr {
                op,
                dst_size,
                dst,
                src,
            } => {
                if !matches!(dst_size, OperandSize::Size32 | OperandSize::Size64) {
                    return Err(CodegenError::InvalidOperandSize);
                }
                let (prefix, opcode, gpr_is_rm) = match op {
                    XmmToGprOp::Cvttss2si => (0xF3, 0x2C, false),
                    XmmToGprOp::Cvttsd2si => (0xF2, 0x2C, false),
                    XmmToGprOp::Movd | XmmToGprOp::Movq => (0x66, 0x7E, true),
                };
                if matches!(op, XmmToGprOp::Movd) && dst_size.is_64() {
                    return Err(CodegenError::OperandSizeMismatch);
                }
                if matches!(op, XmmToGprOp::Movq) && !dst_size.is_64() {
                    return Err(CodegenError::OperandSizeMismatch);
                }
                ctx.buf.put1(prefix)?;
                let d = enc_gpr(dst.to_reg())?;
                let s = enc_xmm(*src)?;
                let rex = rex_for(*dst_size);
                if gpr_is_rm {
                    // movd/movq r/m, xmm: the GPR is the r/m operand.
                    put_op_rr(ctx.buf, rex, &[0x0F, opcode], s, d)?;
                } else {
                    put_op_rr(ctx.buf, rex, &[0x0F, opcode], d, s)?;
                }
                Ok(())
            }

            Inst::XmmRmRVex {
                op,
                l256,
                dst,
                src1,
                src2,
            } => {
                if *l256 && !op.allows_l256() {
                    return Err(CodegenError::InvalidOperandSize);
                }
                let (pp, mmmmm, opcode) = op.encoding();
                let d = enc_xmm(dst.to_reg())?;
                let v = enc_xmm(*src1)?;
                match src2 {
                    RegMem::Reg(r) => {
                        let s = enc_xmm(*r)?;
                        Vex {
                            reg: d,
                            vvvv: v,
                            index: None,
                            base: Some(s),
                            l256: *l256,
                            pp,
                            mmmmm,
                            w: false,
                        }
                        .emit(ctx.buf)?;
                        ctx.buf.put1(opcode)?;
                        ctx.buf.put1(encode_modrm(0b11, d, s))?;
                        Ok(())
                    }
                    RegMem::Mem(m) => {
                        emit_vex_mem(ctx, d, v, *l256, pp, mmmmm, opcode, m)
                    }
                }
            }

            Inst::VexLoad { op, l256, dst, src } => {
                let (pp, load, _) = op.encoding();
                let d = enc_xmm(dst.to_reg())?;
                emit_vex_mem(ctx, d, 0, *l256, pp, vex_map::M0F, load, src)
            }

            Inst::VexStore { op, l256, dst, src } => {
                let (pp, _, store) = op.encoding();
                let s = enc_xmm(*src)?;
                emit_vex_mem(ctx, s, 0, *l256, pp, vex_map::M0F, store, dst)
            }

            Inst::Vzeroupper => {
                ctx.buf.put_bytes(&[0xC5, 0xF8, 0x77])?;
                Ok(())
            }
        }
    }
}

/// 8-bit reg-reg form with high-byte and SPL/BPL/SIL/DIL handling.
fn emit_rr8(buf: &mut CodeBuffer, opcodes: &[u8], g: Gpr8, e: Gpr8) -> CodegenResult<()> {
    let mut rex = Rex::clear_w();
    if (!g.high_byte && (4..=7).contains(&g.enc)) || (!e.high_byte && (4..=7).contains(&e.enc)) {
        rex = rex.force();
    }
    if (g.high_byte || e.high_byte) && rex.is_emitted(g.enc, 0, e.enc) {
        return Err(CodegenError::InvalidUseOfGpbHi);
    }
    rex.emit_two_op(buf, g.enc, e.enc)?;
    buf.put_bytes(opcodes)?;
    buf.put1(encode_modrm(0b11, g.enc, e.enc))?;
    Ok(())
}

/// `cmp`-style: `base` is the 8-bit `r/m, r` opcode of the family and
/// `imm_ext` the /digit in the 0x80 group.
fn emit_cmp_test(
    ctx: &mut EmitCtx,
    size: OperandSize,
    lhs: Reg,
    rhs: &RegMemImm,
    base: u8,
    imm_ext: u8,
) -> CodegenResult<()> {
    emit_prefixes(ctx, InstOpts::NONE, size, false)?;
    match rhs {
        RegMemImm::Reg(r) => {
            if size == OperandSize::Size8 {
                let l = enc_gpr8(lhs)?;
                let r = enc_gpr8(*r)?;
                emit_rr8(ctx.buf, &[base], r, l)
            } else {
                let l = enc_gpr(lhs)?;
                let r = enc_gpr(*r)?;
                put_op_rr(ctx.buf, rex_for(size), &[base + 1], r, l)?;
                Ok(())
            }
        }
        RegMemImm::Mem(m) => {
            // `cmp lhs, [mem]`: lhs is the reg operand of the +2/+3 form.
            if size == OperandSize::Size8 {
                let l = enc_gpr8(lhs)?;
                if l.high_byte {
                    return Err(CodegenError::InvalidUseOfGpbHi);
                }
                let mut rex = Rex::clear_w();
                if (4..=7).contains(&l.enc) {
                    rex = rex.force();
                }
                put_op_mem(ctx, rex, &[base + 2], l.enc, m, 0)
            } else {
                let l = enc_gpr(lhs)?;
                put_op_mem(ctx, rex_for(size), &[base + 3], l, m, 0)
            }
        }
        RegMemImm::Imm(imm) => {
            if size == OperandSize::Size8 {
                let l = enc_gpr8(lhs)?;
                let mut rex = Rex::clear_w();
                if !l.high_byte && (4..=7).contains(&l.enc) {
                    rex = rex.force();
                }
                if l.high_byte && rex.is_emitted(0, 0, l.enc) {
                    return Err(CodegenError::InvalidUseOfGpbHi);
                }
                rex.emit_one_op(ctx.buf, l.enc)?;
                ctx.buf.put1(0x80)?;
                ctx.buf.put1(encode_modrm(0b11, imm_ext, l.enc))?;
                put_imm_for_size(ctx.buf, size, *imm)
            } else {
                let l = enc_gpr(lhs)?;
                let rex = rex_for(size);
                if let Ok(imm8) = i8::try_from(*imm) {
                    rex.emit_one_op(ctx.buf, l)?;
                    ctx.buf.put1(0x83)?;
                    ctx.buf.put1(encode_modrm(0b11, imm_ext, l))?;
                    ctx.buf.put1(imm8 as u8)?;
                    Ok(())
                } else {
                    rex.emit_one_op(ctx.buf, l)?;
                    ctx.buf.put1(0x81)?;
                    ctx.buf.put1(encode_modrm(0b11, imm_ext, l))?;
                    put_imm_for_size(ctx.buf, size, *imm)
                }
            }
        }
    }
}

fn emit_test(ctx: &mut EmitCtx, size: OperandSize, lhs: Reg, rhs: &RegMemImm) -> CodegenResult<()> {
    emit_prefixes(ctx, InstOpts::NONE, size, false)?;
    match rhs {
        RegMemImm::Reg(r) => {
            if size == OperandSize::Size8 {
                let l = enc_gpr8(lhs)?;
                let r = enc_gpr8(*r)?;
                emit_rr8(ctx.buf, &[0x84], r, l)
            } else {
                let l = enc_gpr(lhs)?;
                let r = enc_gpr(*r)?;
                put_op_rr(ctx.buf, rex_for(size), &[0x85], r, l)?;
                Ok(())
            }
        }
        RegMemImm::Mem(m) => {
            // `test r, [mem]` has no r <- m form; the flags of
            // `test [mem], r` are identical.
            if size == OperandSize::Size8 {
                let l = enc_gpr8(lhs)?;
                if l.high_byte {
                    return Err(CodegenError::InvalidUseOfGpbHi);
                }
                let mut rex = Rex::clear_w();
                if (4..=7).contains(&l.enc) {
                    rex = rex.force();
                }
                put_op_mem(ctx, rex, &[0x84], l.enc, m, 0)
            } else {
                let l = enc_gpr(lhs)?;
                put_op_mem(ctx, rex_for(size), &[0x85], l, m, 0)
            }
        }
        RegMemImm::Imm(imm) => {
            let opcode = if size == OperandSize::Size8 { 0xF6 } else { 0xF7 };
            if size == OperandSize::Size8 {
                let l = enc_gpr8(lhs)?;
                let mut rex = Rex::clear_w();
                if !l.high_byte && (4..=7).contains(&l.enc) {
                    rex = rex.force();
                }
                if l.high_byte && rex.is_emitted(0, 0, l.enc) {
                    return Err(CodegenError::InvalidUseOfGpbHi);
                }
                rex.emit_one_op(ctx.buf, l.enc)?;
                ctx.buf.put1(opcode)?;
                ctx.buf.put1(encode_modrm(0b11, 0, l.enc))?;
                put_imm_for_size(ctx.buf, size, *imm)
            } else {
                let l = enc_gpr(lhs)?;
                let rex = rex_for(size);
                rex.emit_one_op(ctx.buf, l)?;
                ctx.buf.put1(opcode)?;
                ctx.buf.put1(encode_modrm(0b11, 0, l))?;
                put_imm_for_size(ctx.buf, size, *imm)
            }
        }
    }
}

fn emit_ext(
    ctx: &mut EmitCtx,
    ext: ExtMode,
    dst: &Writable<Reg>,
    src: &RegMem,
    base_opcode: u8,
) -> CodegenResult<()> {
    let d = enc_gpr(dst.to_reg())?;
    let rex = ext.rex();
    // movsxd has its own one-byte opcode; movzx 32->64 is plain mov.
    if ext == ExtMode::LQ {
        if base_opcode == 0xB6 {
            return Err(CodegenError::InvalidInstruction);
        }
        return match src {
            RegMem::Reg(r) => {
                let s = enc_gpr(*r)?;
                put_op_rr(ctx.buf, Rex::w(), &[0x63], d, s)?;
                Ok(())
            }
            RegMem::Mem(m) => put_op_mem(ctx, Rex::w(), &[0x63], d, m, 0),
        };
    }
    let opcode = match ext.src_size() {
        OperandSize::Size8 => base_opcode,
        OperandSize::Size16 => base_opcode + 1,
        _ => unreachable!(),
    };
    match src {
        RegMem::Reg(r) => {
            if ext.src_size() == OperandSize::Size8 {
                let s = enc_gpr8(*r)?;
                let mut rex = rex;
                if !s.high_byte && (4..=7).contains(&s.enc) {
                    rex = rex.force();
                }
                if s.high_byte && rex.is_emitted(d, 0, s.enc) {
                    return Err(CodegenError::InvalidUseOfGpbHi);
                }
                put_op_rr(ctx.buf, rex, &[0x0F, opcode], d, s.enc)?;
            } else {
                let s = enc_gpr(*r)?;
                put_op_rr(ctx.buf, rex, &[0x0F, opcode], d, s)?;
            }
            Ok(())
        }
        RegMem::Mem(m) => put_op_mem(ctx, rex, &[0x0F, opcode], d, m, 0),
    }
}

/// FF-group indirect call/jump.
fn emit_group5(ctx: &mut EmitCtx, target: &RegMem, ext: u8) -> CodegenResult<()> {
    match target {
        RegMem::Reg(r) => {
            let e = enc_gpr(*r)?;
            Rex::clear_w().emit_one_op(ctx.buf, e)?;
            ctx.buf.put1(0xFF)?;
            ctx.buf.put1(encode_modrm(0b11, ext, e))?;
            Ok(())
        }
        RegMem::Mem(m) => put_op_mem(ctx, Rex::clear_w(), &[0xFF], ext, m, 0),
    }
}

/// Emit the rel32 field for a call/branch whose opcode bytes are already
/// out: immediately when the target is bound, else as a fixup.
fn emit_rel32_target(ctx: &mut EmitCtx, target: Label) -> CodegenResult<()> {
    match ctx.labels.offset_of(target)? {
        Some(bound) => {
            let at = ctx.buf.cur_offset();
            let disp = LabelUse::Rel32.displacement(at, bound);
            let disp = i32::try_from(disp).map_err(|_| CodegenError::DisplacementOutOfRange { at })?;
            ctx.buf.put4(disp as u32)?;
            Ok(())
        }
        None => {
            let at = ctx.buf.reserve(4)?;
            ctx.fixups.push(Fixup {
                at,
                label: target,
                kind: LabelUse::Rel32,
            });
            Ok(())
        }
    }
}

/// Unconditional or conditional branch to a label, with short/long form
/// selection.
///
/// Bound, in-range targets take the 2-byte form when short branches are
/// enabled; everything else takes the long form, except that
/// [`InstOpts::FORCE_SHORT`] pins the short form and defers the range check
/// to finalize.
fn emit_branch(ctx: &mut EmitCtx, target: Label, opts: InstOpts, cc: Option<CC>) -> CodegenResult<()> {
    if !ctx.labels.is_valid(target) {
        return Err(CodegenError::InvalidLabel);
    }
    if opts.contains(InstOpts::FORCE_SHORT) && opts.contains(InstOpts::FORCE_LONG) {
        return Err(CodegenError::InvalidArgument(
            "cannot force both short and long branch forms",
        ));
    }
    let bound = ctx.labels.offset_of(target)?;
    let short_opcode: &[u8] = match cc {
        None => &[0xEB],
        Some(cc) => {
            // Avoid borrowing a temporary: build both bytes eagerly.
            let b = 0x70 + cc.bits();
            return emit_branch_with(ctx, target, opts, bound, &[b], &long_opcode(cc));
        }
    };
    emit_branch_with(ctx, target, opts, bound, short_opcode, &[0xE9])
}

fn long_opcode(cc: CC) -> [u8; 2] {
    [0x0F, 0x80 + cc.bits()]
}

fn emit_branch_with(
    ctx: &mut EmitCtx,
    target: Label,
    opts: InstOpts,
    bound: Option<u32>,
    short_opcode: &[u8],
    long_opcode: &[u8],
) -> CodegenResult<()> {
    let force_short = opts.contains(InstOpts::FORCE_SHORT);
    let force_long = opts.contains(InstOpts::FORCE_LONG);
    let allow_short = ctx.opt_short_branches && !force_long;

    let emit_short = |ctx: &mut EmitCtx| -> CodegenResult<()> {
        ctx.buf.put_bytes(short_opcode)?;
        match bound {
            Some(off) => {
                let at = ctx.buf.cur_offset();
                let disp = LabelUse::Rel8.displacement(at, off);
                if LabelUse::Rel8.supports_displacement(disp) {
                    ctx.buf.put1(disp as i8 as u8)?;
                } else {
                    // Out of range now; let finalize report it.
                    let at = ctx.buf.reserve(1)?;
                    ctx.fixups.push(Fixup { at, label: target, kind: LabelUse::Rel8 });
                }
            }
            None => {
                let at = ctx.buf.reserve(1)?;
                ctx.fixups.push(Fixup { at, label: target, kind: LabelUse::Rel8 });
            }
        }
        Ok(())
    };

    if force_short {
        return emit_short(ctx);
    }

    if let Some(off) = bound {
        if allow_short {
            // Displacement measured from the end of the 2-byte form.
            let disp = i64::from(off) - (i64::from(ctx.buf.cur_offset()) + short_opcode.len() as i64 + 1);
            if LabelUse::Rel8.supports_displacement(disp) {
                return emit_short(ctx);
            }
        }
        ctx.buf.put_bytes(long_opcode)?;
        let at = ctx.buf.cur_offset();
        let disp = LabelUse::Rel32.displacement(at, off);
        let disp = i32::try_from(disp).map_err(|_| CodegenError::DisplacementOutOfRange { at })?;
        ctx.buf.put4(disp as u32)?;
        Ok(())
    } else {
        ctx.buf.put_bytes(long_opcode)?;
        let at = ctx.buf.reserve(4)?;
        ctx.fixups.push(Fixup { at, label: target, kind: LabelUse::Rel32 });
        Ok(())
    }
}

fn emit_vex_mem(
    ctx: &mut EmitCtx,
    enc_g: u8,
    vvvv: u8,
    l256: bool,
    pp: u8,
    mmmmm: u8,
    opcode: u8,
    mem: &Amode,
) -> CodegenResult<()> {
    mem.validate()?;
    match *mem {
        Amode::ImmReg { disp, base } => {
            let enc_e = enc_gpr(base)?;
            Vex {
                reg: enc_g,
                vvvv,
                index: None,
                base: Some(enc_e),
                l256,
                pp,
                mmmmm,
                w: false,
            }
            .emit(ctx.buf)?;
            ctx.buf.put1(opcode)?;
            let mut disp = Disp::classify(disp);
            if enc_e & 7 == enc::RSP {
                ctx.buf.put1(encode_modrm(disp.m0d(), enc_g, 0b100))?;
                ctx.buf.put1(encode_sib(0, 0b100, 0b100))?;
            } else {
                if enc_e & 7 == enc::RBP {
                    disp.force_disp8();
                }
                ctx.buf.put1(encode_modrm(disp.m0d(), enc_g, enc_e))?;
            }
            disp.emit(ctx.buf)?;
            Ok(())
        }
        Amode::ImmRegRegShift {
            disp,
            base,
            index,
            scale,
        } => {
            let enc_base = enc_gpr(base)?;
            let enc_index = enc_gpr(index)?;
            Vex {
                reg: enc_g,
                vvvv,
                index: Some(enc_index),
                base: Some(enc_base),
                l256,
                pp,
                mmmmm,
                w: false,
            }
            .emit(ctx.buf)?;
            ctx.buf.put1(opcode)?;
            let mut disp = Disp::classify(disp);
            if enc_base & 7 == enc::RBP {
                disp.force_disp8();
            }
            ctx.buf.put1(encode_modrm(disp.m0d(), enc_g, 0b100))?;
            ctx.buf.put1(encode_sib(scale.enc(), enc_index, enc_base))?;
            disp.emit(ctx.buf)?;
            Ok(())
        }
        Amode::RipRelative { target } => {
            if !ctx.labels.is_valid(target) {
                return Err(CodegenError::InvalidLabel);
            }
            Vex {
                reg: enc_g,
                vvvv,
                index: None,
                base: None,
                l256,
                pp,
                mmmmm,
                w: false,
            }
            .emit(ctx.buf)?;
            ctx.buf.put1(opcode)?;
            ctx.buf.put1(encode_modrm(0b00, enc_g, 0b101))?;
            let at = ctx.buf.cur_offset();
            ctx.fixups.push(Fixup {
                at,
                label: target,
                kind: LabelUse::Rel32,
            });
            ctx.buf.put4(0)?;
            Ok(())
        }
    }
}

pub(crate) use crate::reg::RegRole;

impl Inst {
    /// Visit every register operand with its role. Memory-operand base and
    /// index registers are uses.
    pub(crate) fn visit_regs(&mut self, f: &mut dyn FnMut(&mut Reg, RegRole)) {
        use RegRole::*;
        fn mem(m: &mut Amode, f: &mut dyn FnMut(&mut Reg, RegRole)) {
            for r in m.regs_mut() {
                f(r, RegRole::Use);
            }
        }
        fn regmem(rm: &mut RegMem, f: &mut dyn FnMut(&mut Reg, RegRole)) {
            match rm {
                RegMem::Reg(r) => f(r, RegRole::Use),
                RegMem::Mem(m) => mem(m, f),
            }
        }
        fn writable(w: &mut Writable<Reg>, role: RegRole, f: &mut dyn FnMut(&mut Reg, RegRole)) {
            // Writable<Reg> has no interior access; rebuild around the raw reg.
            let mut reg = w.to_reg();
            f(&mut reg, role);
            *w = Writable::from_reg(reg);
        }
        match self {
            Inst::Invalid
            | Inst::Nop { .. }
            | Inst::Ud2
            | Inst::Ret
            | Inst::SignExtendAx { .. }
            | Inst::Vzeroupper
            | Inst::CallKnown { .. }
            | Inst::JmpKnown { .. }
            | Inst::JmpCond { .. }
            | Inst::MovRIAbs { .. } => {
                if let Inst::MovRIAbs { dst, .. } = self {
                    writable(dst, Def, f);
                }
            }
            Inst::AluRR { dst, src, .. } => {
                f(src, Use);
                writable(dst, UseDef, f);
            }
            Inst::AluRM { dst, src, .. } => {
                mem(src, f);
                writable(dst, UseDef, f);
            }
            Inst::AluMR { dst, src, .. } => {
                f(src, Use);
                mem(dst, f);
            }
            Inst::AluRI { dst, .. } => writable(dst, UseDef, f),
            Inst::AluMI { dst, .. } => mem(dst, f),
            Inst::Cmp { lhs, rhs, .. } | Inst::Test { lhs, rhs, .. } => {
                f(lhs, Use);
                match rhs {
                    RegMemImm::Reg(r) => f(r, Use),
                    RegMemImm::Mem(m) => mem(m, f),
                    RegMemImm::Imm(_) => {}
                }
            }
            Inst::MovRR { dst, src, .. } => {
                f(src, Use);
                writable(dst, Def, f);
            }
            Inst::MovRI { dst, .. } => writable(dst, Def, f),
            Inst::MovRM { dst, src, .. } => {
                mem(src, f);
                writable(dst, Def, f);
            }
            Inst::MovMR { dst, src, .. } => {
                f(src, RegRole::Use);
                mem(dst, f);
            }
            Inst::MovMI { dst, .. } => mem(dst, f),
            Inst::Movzx { dst, src, .. } | Inst::Movsx { dst, src, .. } => {
                regmem(src, f);
                writable(dst, Def, f);
            }
            Inst::Lea { dst, addr, .. } => {
                mem(addr, f);
                writable(dst, Def, f);
            }
            Inst::Unary { dst, .. } => writable(dst, UseDef, f),
            Inst::UnaryM { addr, .. } => mem(addr, f),
            Inst::MulDiv { src, .. } => regmem(src, f),
            Inst::Imul2 { dst, src, .. } => {
                regmem(src, f);
                writable(dst, UseDef, f);
            }
            Inst::ShiftRI { dst, .. } => writable(dst, UseDef, f),
            Inst::ShiftRCl { dst, .. } => writable(dst, UseDef, f),
            Inst::XchgMR { addr, src, .. } | Inst::CmpxchgMR { addr, src, .. } => {
                f(src, Use);
                mem(addr, f);
            }
            Inst::Cmov { dst, src, .. } => {
                regmem(src, f);
                writable(dst, UseDef, f);
            }
            Inst::Setcc { dst, .. } => writable(dst, Def, f),
            Inst::Push64 { src } => f(src, Use),
            Inst::Pop64 { dst } => writable(dst, Def, f),
            Inst::CallUnknown { target } | Inst::JmpUnknown { target } => regmem(target, f),
            Inst::XmmRmR { dst, src, .. } => {
                regmem(src, f);
                writable(dst, UseDef, f);
            }
            Inst::XmmLoad { dst, src, .. } => {
                mem(src, f);
                writable(dst, Def, f);
            }
            Inst::XmmStore { dst, src, .. } => {
                f(src, Use);
                mem(dst, f);
            }
            Inst::XmmMovRR { dst, src, .. } => {
                f(src, Use);
                writable(dst, Def, f);
            }
            Inst::GprToXmm { dst, src, .. } => {
                regmem(src, f);
                writable(dst, Def, f);
            }
            Inst::XmmToGpr { dst, src, .. } => {
                f(src, Use);
                writable(dst, Def, f);
            }
            Inst::XmmRmRVex {
                dst, src1, src2, ..
            } => {
                f(src1, Use);
                regmem(src2, f);
                writable(dst, Def, f);
            }
            Inst::VexLoad { dst, src, .. } => {
                mem(src, f);
                writable(dst, Def, f);
            }
            Inst::VexStore { dst, src, .. } => {
                f(src, Use);
                mem(dst, f);
            }
        }
    }
}
