//! The x86-64 assembler: emits instructions into a code buffer, tracks
//! labels, and resolves fixups at finalize.

use log::trace;

use crate::buffer::{CodeBuffer, CodeOffset};
use crate::environment::Flags;
use crate::fixup::{FinalizedCode, Fixup};
use crate::labels::{Label, LabelManager};
use crate::reg::{Reg, Writable};
use crate::result::CodegenResult;

use super::args::{Amode, InstOpts, OperandSize, RegMem, RegMemImm};
use super::inst::{AluOp, EmitCtx, Inst, MulDivOp, ShiftOp, CC};

/// An x86-64 assembler.
///
/// One assembler owns one code buffer; it is not meant to be shared between
/// threads. Emission either succeeds, leaving the buffer one instruction
/// longer, or fails leaving previously emitted bytes intact (the buffer is
/// then suitable for diagnostics but must not be executed).
pub struct Assembler {
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

    /// Construct with a pre-populated label manager; used by the compiler
    /// layer, which allocates labels before serialization.
    pub(crate) fn with_labels(flags: Flags, labels: LabelManager) -> Assembler {
        Assembler {
            flags,
            buf: CodeBuffer::new(),
            labels,
            fixups: Vec::new(),
        }
    }

    /// Current emission offset.
    pub fn cur_offset(&self) -> CodeOffset {
        self.buf.cur_offset()
    }

    /// The bytes emitted so far.
    pub fn bytes(&self) -> &[u8] {
        self.buf.data()
    }

    /// Discard all code, labels, and fixups, keeping the buffer capacity.
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

    /// Bind `label` to the current offset.
    pub fn bind(&mut self, label: Label) -> CodegenResult<()> {
        self.labels.bind(label, self.buf.cur_offset())
    }

    /// Emit one instruction.
    pub fn emit(&mut self, inst: &Inst) -> CodegenResult<()> {
        let mut ctx = EmitCtx {
            buf: &mut self.buf,
            fixups: &mut self.fixups,
            labels: &self.labels,
            opt_short_branches: self.flags.opt_short_branches,
        };
        inst.encode(&mut ctx)
    }

    // Mnemonic helpers for the common forms. Everything here is sugar over
    // `emit`.

    pub fn ret(&mut self) -> CodegenResult<()> {
        self.emit(&Inst::Ret)
    }

    pub fn nop(&mut self) -> CodegenResult<()> {
        self.emit(&Inst::Nop { len: 1 })
    }

    pub fn ud2(&mut self) -> CodegenResult<()> {
        self.emit(&Inst::Ud2)
    }

    pub fn push(&mut self, src: Reg) -> CodegenResult<()> {
        self.emit(&Inst::Push64 { src })
    }

    pub fn pop(&mut self, dst: Writable<Reg>) -> CodegenResult<()> {
        self.emit(&Inst::Pop64 { dst })
    }

    pub fn mov_rr(&mut self, size: OperandSize, dst: Writable<Reg>, src: Reg) -> CodegenResult<()> {
        self.emit(&Inst::MovRR { size, dst, src })
    }

    pub fn mov_ri(&mut self, size: OperandSize, dst: Writable<Reg>, imm: i64) -> CodegenResult<()> {
        self.emit(&Inst::MovRI { size, dst, imm })
    }

    /// Load: `mov dst, [mem]`.
    pub fn load(&mut self, size: OperandSize, dst: Writable<Reg>, src: Amode) -> CodegenResult<()> {
        self.emit(&Inst::MovRM { size, dst, src })
    }

    /// Store: `mov [mem], src`.
    pub fn store(&mut self, size: OperandSize, dst: Amode, src: Reg) -> CodegenResult<()> {
        self.emit(&Inst::MovMR {
            size,
            dst,
            src,
            opts: InstOpts::NONE,
        })
    }

    pub fn alu_rr(
        &mut self,
        op: AluOp,
        size: OperandSize,
        dst: Writable<Reg>,
        src: Reg,
    ) -> CodegenResult<()> {
        self.emit(&Inst::AluRR { op, size, dst, src })
    }

    pub fn alu_ri(
        &mut self,
        op: AluOp,
        size: OperandSize,
        dst: Writable<Reg>,
        imm: i32,
    ) -> CodegenResult<()> {
        self.emit(&Inst::AluRI { op, size, dst, imm })
    }

    pub fn add_rr(&mut self, size: OperandSize, dst: Writable<Reg>, src: Reg) -> CodegenResult<()> {
        self.alu_rr(AluOp::Add, size, dst, src)
    }

    pub fn sub_rr(&mut self, size: OperandSize, dst: Writable<Reg>, src: Reg) -> CodegenResult<()> {
        self.alu_rr(AluOp::Sub, size, dst, src)
    }

    pub fn add_ri(&mut self, size: OperandSize, dst: Writable<Reg>, imm: i32) -> CodegenResult<()> {
        self.alu_ri(AluOp::Add, size, dst, imm)
    }

    pub fn sub_ri(&mut self, size: OperandSize, dst: Writable<Reg>, imm: i32) -> CodegenResult<()> {
        self.alu_ri(AluOp::Sub, size, dst, imm)
    }

    pub fn cmp_rr(&mut self, size: OperandSize, lhs: Reg, rhs: Reg) -> CodegenResult<()> {
        self.emit(&Inst::Cmp {
            size,
            lhs,
            rhs: RegMemImm::Reg(rhs),
        })
    }

    pub fn cmp_ri(&mut self, size: OperandSize, lhs: Reg, imm: i32) -> CodegenResult<()> {
        self.emit(&Inst::Cmp {
            size,
            lhs,
            rhs: RegMemImm::Imm(imm),
        })
    }

    pub fn test_rr(&mut self, size: OperandSize, lhs: Reg, rhs: Reg) -> CodegenResult<()> {
        self.emit(&Inst::Test {
            size,
            lhs,
            rhs: RegMemImm::Reg(rhs),
        })
    }

    pub fn imul_rr(&mut self, size: OperandSize, dst: Writable<Reg>, src: Reg) -> CodegenResult<()> {
        self.emit(&Inst::Imul2 {
            size,
            dst,
            src: RegMem::Reg(src),
        })
    }

    pub fn idiv(&mut self, size: OperandSize, src: Reg) -> CodegenResult<()> {
        self.emit(&Inst::MulDiv {
            op: MulDivOp::Idiv,
            size,
            src: RegMem::Reg(src),
        })
    }

    pub fn shift_ri(
        &mut self,
        op: ShiftOp,
        size: OperandSize,
        dst: Writable<Reg>,
        amount: u8,
    ) -> CodegenResult<()> {
        self.emit(&Inst::ShiftRI {
            op,
            size,
            dst,
            amount,
        })
    }

    pub fn lea(&mut self, size: OperandSize, dst: Writable<Reg>, addr: Amode) -> CodegenResult<()> {
        self.emit(&Inst::Lea { size, dst, addr })
    }

    /// Unconditional jump with automatic short/long selection.
    pub fn jmp(&mut self, target: Label) -> CodegenResult<()> {
        self.emit(&Inst::JmpKnown {
            target,
            opts: InstOpts::NONE,
        })
    }

    /// Unconditional jump pinned to the 2-byte form; finalize fails if the
    /// target lands out of range.
    pub fn jmp_short(&mut self, target: Label) -> CodegenResult<()> {
        self.emit(&Inst::JmpKnown {
            target,
            opts: InstOpts::FORCE_SHORT,
        })
    }

    /// Conditional jump with automatic short/long selection.
    pub fn jcc(&mut self, cc: CC, target: Label) -> CodegenResult<()> {
        self.emit(&Inst::JmpCond {
            cc,
            target,
            opts: InstOpts::NONE,
        })
    }

    pub fn call_label(&mut self, target: Label) -> CodegenResult<()> {
        self.emit(&Inst::CallKnown { target })
    }

    pub fn call_reg(&mut self, target: Reg) -> CodegenResult<()> {
        self.emit(&Inst::CallUnknown {
            target: RegMem::Reg(target),
        })
    }

    /// Pad with the given fill byte until the cursor is `alignment`-aligned.
    pub fn align(&mut self, alignment: u32, fill: u8) -> CodegenResult<()> {
        self.buf.align_to(alignment, fill)
    }

    /// Embed raw bytes at the current offset.
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
    ///
    /// Fails with [`CodegenError::Finalize`] collecting one error per
    /// unresolved or unreachable fixup; in that case the assembler state is
    /// consumed and the partial code is discarded.
    pub fn finalize(mut self) -> CodegenResult<FinalizedCode> {
        let fixups = core::mem::take(&mut self.fixups);
        trace!("x64 finalize: {} byte(s) emitted", self.buf.len());
        let relocs = crate::fixup::resolve_fixups(&mut self.buf, &self.labels, fixups)?;
        Ok(FinalizedCode::new(self.buf.into_vec(), relocs))
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Assembler::new()
    }
}
