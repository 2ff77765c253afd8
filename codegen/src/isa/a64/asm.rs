//! The AArch64 assembler.

use log::trace;

use crate::buffer::{CodeBuffer, CodeOffset};
use crate::environment::Flags;
use crate::fixup::{FinalizedCode, Fixup};
use crate::labels::{Label, LabelManager};
use crate::reg::{Reg, Writable};
use crate::result::{CodegenError, CodegenResult};

use super::imms::Imm12;
use super::inst::{
    ALUOp, AMode, Cond, CondBrKind, EmitCtx, Inst, LoadStoreType, MoveWideOp, OperandSize,
    PairAMode,
};

/// An AArch64 assembler.
///
/// Branch and literal displacements are resolved at finalize; a target out
/// of the encoding's range is reported there as
/// [`CodegenError::DisplacementOutOfRange`].
pub struct Assembler {
    #[allow(dead_code)]
    flags: Flags,
    buf: CodeBuffer,
    labels: LabelManager,
    fixups: Vec<Fixup>,
}

impl Assembler {
    pub fn new() -> Assembler {
        Assembler::with_flags(Flags::default())
    }

    pub fn with_flags(flags: Flags) -> Assembler {
        Assembler {
            flags,
            buf: CodeBuffer::new(),
            labels: LabelManager::new(),
            fixups: Vec::new(),
        }
    }

    pub(crate) fn with_labels(flags: Flags, labels: LabelManager) -> Assembler {
        Assembler {
            flags,
            buf: CodeBuffer::new(),
            labels,
            fixups: Vec::new(),
        }
    }

    pub fn cur_offset(&self) -> CodeOffset {
        self.buf.cur_offset()
    }

    pub fn bytes(&self) -> &[u8] {
        self.buf.data()
    }

    pub fn reset(&mut self) {
        self.buf.reset();
        self.labels.reset();
        self.fixups.clear();
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.new_label()
    }

    pub fn new_named_label(&mut self, name: &str) -> CodegenResult<Label> {
        self.labels.new_named_label(name)
    }

    pub fn label_by_name(&self, name: &str) -> Option<Label> {
        self.labels.label_by_name(name)
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.labels.is_bound(label)
    }

    pub fn bind(&mut self, label: Label) -> CodegenResult<()> {
        self.labels.bind(label, self.buf.cur_offset())
    }

    /// Emit one instruction.
    pub fn emit(&mut self, inst: &Inst) -> CodegenResult<()> {
        let mut ctx = EmitCtx {
            buf: &mut self.buf,
            fixups: &mut self.fixups,
            labels: &self.labels,
        };
        inst.encode(&mut ctx)
    }

    // Mnemonic helpers.

    pub fn nop(&mut self) -> CodegenResult<()> {
        self.emit(&Inst::Nop)
    }

    pub fn ret(&mut self) -> CodegenResult<()> {
        self.emit(&Inst::Ret)
    }

    pub fn brk(&mut self, imm: u16) -> CodegenResult<()> {
        self.emit(&Inst::Brk { imm })
    }

    pub fn mov_rr(&mut self, size: OperandSize, rd: Writable<Reg>, rm: Reg) -> CodegenResult<()> {
        self.emit(&Inst::MovRR { size, rd, rm })
    }

    pub fn movz(
        &mut self,
        size: OperandSize,
        rd: Writable<Reg>,
        imm: u16,
        shift: u8,
    ) -> CodegenResult<()> {
        self.emit(&Inst::MovWide {
            op: MoveWideOp::MovZ,
            size,
            rd,
            imm,
            shift,
        })
    }

    pub fn movk(
        &mut self,
        size: OperandSize,
        rd: Writable<Reg>,
        imm: u16,
        shift: u8,
    ) -> CodegenResult<()> {
        self.emit(&Inst::MovWide {
            op: MoveWideOp::MovK,
            size,
            rd,
            imm,
            shift,
        })
    }

    /// Load an arbitrary 64-bit constant with `movz` + `movk`, skipping
    /// zero half-words.
    pub fn mov_imm64(&mut self, rd: Writable<Reg>, value: u64) -> CodegenResult<()> {
        self.emit(&Inst::LoadConst64 { rd, value })
    }

    pub fn alu_rrr(
        &mut self,
        op: ALUOp,
        size: OperandSize,
        rd: Writable<Reg>,
        rn: Reg,
        rm: Reg,
    ) -> CodegenResult<()> {
        self.emit(&Inst::AluRRR { op, size, rd, rn, rm })
    }

    pub fn add_rrr(&mut self, size: OperandSize, rd: Writable<Reg>, rn: Reg, rm: Reg) -> CodegenResult<()> {
        self.alu_rrr(ALUOp::Add, size, rd, rn, rm)
    }

    pub fn sub_rrr(&mut self, size: OperandSize, rd: Writable<Reg>, rn: Reg, rm: Reg) -> CodegenResult<()> {
        self.alu_rrr(ALUOp::Sub, size, rd, rn, rm)
    }

    /// `add rd, rn, #imm`; the immediate must fit the 12-bit (optionally
    /// shifted) form.
    pub fn add_imm(
        &mut self,
        size: OperandSize,
        rd: Writable<Reg>,
        rn: Reg,
        imm: u64,
    ) -> CodegenResult<()> {
        let imm12 = Imm12::maybe_from_u64(imm).ok_or(CodegenError::InvalidImmediate)?;
        self.emit(&Inst::AluRRImm12 {
            op: ALUOp::Add,
            size,
            rd,
            rn,
            imm12,
        })
    }

    pub fn sub_imm(
        &mut self,
        size: OperandSize,
        rd: Writable<Reg>,
        rn: Reg,
        imm: u64,
    ) -> CodegenResult<()> {
        let imm12 = Imm12::maybe_from_u64(imm).ok_or(CodegenError::InvalidImmediate)?;
        self.emit(&Inst::AluRRImm12 {
            op: ALUOp::Sub,
            size,
            rd,
            rn,
            imm12,
        })
    }

    /// `cmp rn, rm` (`subs xzr, rn, rm`).
    pub fn cmp_rr(&mut self, size: OperandSize, rn: Reg, rm: Reg) -> CodegenResult<()> {
        self.emit(&Inst::AluRRR {
            op: ALUOp::SubS,
            size,
            rd: Writable::from_reg(super::regs::zero_reg()),
            rn,
            rm,
        })
    }

    /// `cmp rn, #imm` (`subs xzr, rn, #imm`).
    pub fn cmp_imm(&mut self, size: OperandSize, rn: Reg, imm: u64) -> CodegenResult<()> {
        let imm12 = Imm12::maybe_from_u64(imm).ok_or(CodegenError::InvalidImmediate)?;
        self.emit(&Inst::AluRRImm12 {
            op: ALUOp::SubS,
            size,
            rd: Writable::from_reg(super::regs::zero_reg()),
            rn,
            imm12,
        })
    }

    pub fn madd(
        &mut self,
        size: OperandSize,
        rd: Writable<Reg>,
        rn: Reg,
        rm: Reg,
        ra: Reg,
    ) -> CodegenResult<()> {
        self.emit(&Inst::MAdd { size, rd, rn, rm, ra })
    }

    /// `mul rd, rn, rm` (`madd` with xzr addend).
    pub fn mul(&mut self, size: OperandSize, rd: Writable<Reg>, rn: Reg, rm: Reg) -> CodegenResult<()> {
        self.madd(size, rd, rn, rm, super::regs::zero_reg())
    }

    pub fn ldr(&mut self, ty: LoadStoreType, rd: Writable<Reg>, mem: AMode) -> CodegenResult<()> {
        self.emit(&Inst::ULoad { ty, rd, mem })
    }

    pub fn str(&mut self, ty: LoadStoreType, rt: Reg, mem: AMode) -> CodegenResult<()> {
        self.emit(&Inst::Store { ty, rt, mem })
    }

    pub fn ldp(&mut self, rt: Writable<Reg>, rt2: Writable<Reg>, mem: PairAMode) -> CodegenResult<()> {
        self.emit(&Inst::LoadP64 { rt, rt2, mem })
    }

    pub fn stp(&mut self, rt: Reg, rt2: Reg, mem: PairAMode) -> CodegenResult<()> {
        self.emit(&Inst::StoreP64 { rt, rt2, mem })
    }

    pub fn b(&mut self, dest: Label) -> CodegenResult<()> {
        self.emit(&Inst::Jump { dest })
    }

    pub fn b_cond(&mut self, cond: Cond, target: Label) -> CodegenResult<()> {
        self.emit(&Inst::CondBr {
            kind: CondBrKind::Cond(cond),
            target,
        })
    }

    pub fn cbz(&mut self, size: OperandSize, rn: Reg, target: Label) -> CodegenResult<()> {
        self.emit(&Inst::CondBr {
            kind: CondBrKind::Zero(rn, size),
            target,
        })
    }

    pub fn cbnz(&mut self, size: OperandSize, rn: Reg, target: Label) -> CodegenResult<()> {
        self.emit(&Inst::CondBr {
            kind: CondBrKind::NotZero(rn, size),
            target,
        })
    }

    pub fn bl(&mut self, target: Label) -> CodegenResult<()> {
        self.emit(&Inst::Call { target })
    }

    pub fn blr(&mut self, rn: Reg) -> CodegenResult<()> {
        self.emit(&Inst::CallInd { rn })
    }

    pub fn br(&mut self, rn: Reg) -> CodegenResult<()> {
        self.emit(&Inst::IndirectBr { rn })
    }

    pub fn adr(&mut self, rd: Writable<Reg>, label: Label) -> CodegenResult<()> {
        self.emit(&Inst::Adr { rd, label })
    }

    pub fn adrp(&mut self, rd: Writable<Reg>, label: Label) -> CodegenResult<()> {
        self.emit(&Inst::Adrp { rd, label })
    }

    pub fn cset(&mut self, size: OperandSize, rd: Writable<Reg>, cond: Cond) -> CodegenResult<()> {
        self.emit(&Inst::CSet { size, cond, rd })
    }

    /// Pad with `fill` bytes to `alignment`. For instruction alignment use
    /// [`Assembler::align_with_nops`]; arbitrary fill bytes are only
    /// meaningful in data regions.
    pub fn align(&mut self, alignment: u32, fill: u8) -> CodegenResult<()> {
        self.buf.align_to(alignment, fill)
    }

    /// Pad to `alignment` (a multiple of 4) with NOP instructions.
    pub fn align_with_nops(&mut self, alignment: u32) -> CodegenResult<()> {
        if !alignment.is_power_of_two() || alignment < 4 {
            return Err(CodegenError::InvalidArgument(
                "code alignment must be a power of two >= 4",
            ));
        }
        if self.buf.cur_offset() % 4 != 0 {
            return Err(CodegenError::InvalidArgument(
                "instruction stream is not word-aligned",
            ));
        }
        while self.buf.cur_offset() & (alignment - 1) != 0 {
            self.nop()?;
        }
        Ok(())
    }

    pub fn embed(&mut self, bytes: &[u8]) -> CodegenResult<()> {
        self.buf.put_bytes(bytes)
    }

    pub fn embed_u32(&mut self, value: u32) -> CodegenResult<()> {
        self.buf.put4(value)
    }

    pub fn embed_u64(&mut self, value: u64) -> CodegenResult<()> {
        self.buf.put8(value)
    }

    /// Resolve all fixups and return the finished code.
    pub fn finalize(mut self) -> CodegenResult<FinalizedCode> {
        let fixups = core::mem::take(&mut self.fixups);
        trace!("a64 finalize: {} byte(s) emitted", self.buf.len());
        let relocs = crate::fixup::resolve_fixups(&mut self.buf, &self.labels, fixups)?;
        Ok(FinalizedCode::new(self.buf.into_vec(), relocs))
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Assembler::new()
    }
}
