//! The AArch64 compiler front end.

use smallvec::SmallVec;

use crate::environment::{Arch, CallConv, Environment, Flags};
use crate::fixup::FinalizedCode;
use crate::isa::a64::asm::Assembler;
use crate::isa::a64::imms::{Imm12, SImm7Scaled, UImm12Scaled};
use crate::isa::a64::inst::{
    ALUOp, AMode, Cond, CondBrKind, FpuSize, Inst, LoadStoreType, OperandSize, PairAMode,
};
use crate::isa::a64::regs;
use crate::labels::Label;
use crate::reg::{Reg, RegClass, RegRole, Writable};
use crate::result::{CodegenError, CodegenResult};

use super::frame::{arg_location, FrameDescriptor, Signature};
use super::node::{AlignMode, Node, NodeId};
use super::regalloc::{linear_scan, AllocResult, Assignment, RegPools, VRegData};
use super::Builder;

/// An AArch64 function compiler.
pub type Compiler = Builder<Inst>;

fn wr(reg: Reg) -> Writable<Reg> {
    Writable::from_reg(reg)
}

/// Allocatable pools for AAPCS64. Reserved: x16/x17 (rewrite scratch), x18
/// (platform register), x29/x30/sp, and v31 (vector scratch).
fn pools() -> RegPools {
    let mut gp: Vec<u8> = (0..16).collect();
    gp.extend(19..29);
    let mut vec: Vec<u8> = (0..8).collect();
    vec.extend(16..31);
    vec.extend(8..16);
    RegPools {
        gp,
        vec,
        callee_gp: (19..29).collect(),
        callee_vec: (8..16).collect(),
    }
}

impl Compiler {
    /// Create a compiler for an AArch64 environment.
    pub fn new(env: &Environment, flags: Flags) -> CodegenResult<Compiler> {
        if env.arch() != Arch::A64 {
            return Err(CodegenError::InvalidArgument(
                "environment is not aarch64",
            ));
        }
        Ok(Builder::new_inner(env, flags))
    }

    // Mnemonic surface.

    pub fn mov_rr(&mut self, size: OperandSize, rd: Reg, rm: Reg) -> &mut Self {
        self.inst(Inst::MovRR { size, rd: wr(rd), rm });
        self
    }

    pub fn mov_imm64(&mut self, rd: Reg, value: u64) -> &mut Self {
        self.inst(Inst::LoadConst64 { rd: wr(rd), value });
        self
    }

    pub fn add_rrr(&mut self, size: OperandSize, rd: Reg, rn: Reg, rm: Reg) -> &mut Self {
        self.inst(Inst::AluRRR {
            op: ALUOp::Add,
            size,
            rd: wr(rd),
            rn,
            rm,
        });
        self
    }

    pub fn sub_rrr(&mut self, size: OperandSize, rd: Reg, rn: Reg, rm: Reg) -> &mut Self {
        self.inst(Inst::AluRRR {
            op: ALUOp::Sub,
            size,
            rd: wr(rd),
            rn,
            rm,
        });
        self
    }

    pub fn add_imm(
        &mut self,
        size: OperandSize,
        rd: Reg,
        rn: Reg,
        imm: u64,
    ) -> CodegenResult<&mut Self> {
        let imm12 = Imm12::maybe_from_u64(imm).ok_or(CodegenError::InvalidImmediate)?;
        self.inst(Inst::AluRRImm12 {
            op: ALUOp::Add,
            size,
            rd: wr(rd),
            rn,
            imm12,
        });
        Ok(self)
    }

    pub fn sub_imm(
        &mut self,
        size: OperandSize,
        rd: Reg,
        rn: Reg,
        imm: u64,
    ) -> CodegenResult<&mut Self> {
        let imm12 = Imm12::maybe_from_u64(imm).ok_or(CodegenError::InvalidImmediate)?;
        self.inst(Inst::AluRRImm12 {
            op: ALUOp::Sub,
            size,
            rd: wr(rd),
            rn,
            imm12,
        });
        Ok(self)
    }

    /// `cmp rn, rm`.
    pub fn cmp_rr(&mut self, size: OperandSize, rn: Reg, rm: Reg) -> &mut Self {
        self.inst(Inst::AluRRR {
            op: ALUOp::SubS,
            size,
            rd: wr(regs::zero_reg()),
            rn,
            rm,
        });
        self
    }

    pub fn cmp_imm(&mut self, size: OperandSize, rn: Reg, imm: u64) -> CodegenResult<&mut Self> {
        let imm12 = Imm12::maybe_from_u64(imm).ok_or(CodegenError::InvalidImmediate)?;
        self.inst(Inst::AluRRImm12 {
            op: ALUOp::SubS,
            size,
            rd: wr(regs::zero_reg()),
            rn,
            imm12,
        });
        Ok(self)
    }

    pub fn mul(&mut self, size: OperandSize, rd: Reg, rn: Reg, rm: Reg) -> &mut Self {
        self.inst(Inst::MAdd {
            size,
            rd: wr(rd),
            rn,
            rm,
            ra: regs::zero_reg(),
        });
        self
    }

    pub fn ldr(&mut self, ty: LoadStoreType, rd: Reg, mem: AMode) -> &mut Self {
        self.inst(Inst::ULoad { ty, rd: wr(rd), mem });
        self
    }

    pub fn str(&mut self, ty: LoadStoreType, rt: Reg, mem: AMode) -> &mut Self {
        self.inst(Inst::Store { ty, rt, mem });
        self
    }

    pub fn b(&mut self, dest: Label) -> &mut Self {
        self.inst(Inst::Jump { dest });
        self
    }

    pub fn b_cond(&mut self, cond: Cond, target: Label) -> &mut Self {
        self.inst(Inst::CondBr {
            kind: CondBrKind::Cond(cond),
            target,
        });
        self
    }

    pub fn cbz(&mut self, size: OperandSize, rn: Reg, target: Label) -> &mut Self {
        self.inst(Inst::CondBr {
            kind: CondBrKind::Zero(rn, size),
            target,
        });
        self
    }

    pub fn cbnz(&mut self, size: OperandSize, rn: Reg, target: Label) -> &mut Self {
        self.inst(Inst::CondBr {
            kind: CondBrKind::NotZero(rn, size),
            target,
        });
        self
    }

    pub fn cset(&mut self, size: OperandSize, rd: Reg, cond: Cond) -> &mut Self {
        self.inst(Inst::CSet { size, cond, rd: wr(rd) });
        self
    }

    pub fn csel(&mut self, size: OperandSize, cond: Cond, rd: Reg, rn: Reg, rm: Reg) -> &mut Self {
        self.inst(Inst::CSel {
            size,
            cond,
            rd: wr(rd),
            rn,
            rm,
        });
        self
    }

    /// Move `value` into x0 and return.
    pub fn ret_value(&mut self, size: OperandSize, value: Reg) -> CodegenResult<()> {
        self.mov_rr(size, regs::xreg(0), value);
        self.ret()
    }

    /// Run register allocation, emit the frame, serialize everything, and
    /// resolve fixups.
    pub fn finalize(mut self) -> CodegenResult<FinalizedCode> {
        self.check_ready_to_finalize()?;
        let sig = self.sig.take().expect("checked above");

        let mut vregs: Vec<VRegData> = self
            .vreg_classes
            .iter()
            .map(|&class| VRegData::new(class))
            .collect();
        let node_ids: Vec<NodeId> = self.nodes.iter_ids().collect();
        for (n, &id) in node_ids.iter().enumerate() {
            let use_pos = 2 * n as u32;
            let def_pos = use_pos + 1;
            match self.nodes.get_mut(id) {
                Node::Inst(inst) => {
                    inst.visit_regs(&mut |reg, role| {
                        if !reg.is_virtual() {
                            return;
                        }
                        let data = &mut vregs[reg.virt_index() as usize];
                        match role {
                            RegRole::Use => data.extend(use_pos),
                            RegRole::Def => data.extend(def_pos),
                            RegRole::UseDef => {
                                data.extend(use_pos);
                                data.extend(def_pos);
                            }
                        }
                    });
                }
                Node::Args { vregs: args } => {
                    for (i, arg) in args.clone().iter().enumerate() {
                        let (_, hint) = arg_location(&sig, i)?;
                        let data = &mut vregs[arg.virt_index() as usize];
                        data.extend(def_pos);
                        data.hint = Some(hint);
                    }
                }
                _ => {}
            }
        }

        let alloc = linear_scan(&vregs, &pools())?;
        let frame = FrameDescriptor::compute(
            CallConv::Aapcs64,
            &alloc.used_callee_gp,
            &alloc.used_callee_vec,
            alloc.spill_bytes,
        );

        for &id in &node_ids {
            let inst = match self.nodes.get_mut(id) {
                Node::Inst(inst) => core::mem::replace(inst, Inst::Invalid),
                _ => continue,
            };
            let (before, main, after) = rewrite_inst(inst, &alloc, &frame)?;
            *self.nodes.get_mut(id) = Node::Inst(main);
            for b in before {
                self.nodes.insert_before(id, Node::Inst(b));
            }
            for a in after.into_iter().rev() {
                self.nodes.insert_after(id, Node::Inst(a));
            }
        }

        let labels = core::mem::take(&mut self.labels);
        let mut asm = Assembler::with_labels(self.flags, labels);
        let all_ids: Vec<NodeId> = self.nodes.iter_ids().collect();
        for id in all_ids {
            match self.nodes.get(id) {
                Node::Sentinel => unreachable!(),
                Node::Comment(_) => {}
                Node::FuncEnd => {}
                Node::Label(label) => asm.bind(*label)?,
                Node::Align { mode, alignment } => match mode {
                    AlignMode::Code => asm.align_with_nops(*alignment)?,
                    AlignMode::Data => asm.align(*alignment, 0)?,
                },
                Node::Data { bytes, .. } => asm.embed(bytes)?,
                Node::FuncBegin { .. } => emit_prologue(&mut asm, &frame)?,
                Node::Args { vregs: args } => {
                    emit_arg_moves(&mut asm, &sig, args, &alloc, &frame)?
                }
                Node::Ret => emit_epilogue(&mut asm, &frame)?,
                Node::Inst(inst) => {
                    let inst = inst.clone();
                    asm.emit(&inst)?;
                }
            }
        }
        asm.finalize()
    }
}

/// The addressing mode of a spill slot.
///
/// Slots are addressed as positive scaled offsets from SP (the bottom of
/// the frame), whose unsigned 12-bit form reaches 32 KiB; the slot's
/// location is still the frame base minus the save areas and the slot
/// offset, SP-relative addressing just expresses the same address with the
/// wider immediate.
fn slot_amode(frame: &FrameDescriptor, slot_off: u32, size: u32) -> CodegenResult<AMode> {
    let sp_off = frame
        .local_bytes
        .checked_sub(slot_off + size)
        .ok_or(CodegenError::InvalidDisplacement)?;
    let uimm12 = UImm12Scaled::maybe_from_i64(i64::from(sp_off), 8)
        .ok_or(CodegenError::InvalidDisplacement)?;
    Ok(AMode::UnsignedOffset {
        rn: regs::sp(),
        uimm12,
    })
}

fn assignment_of(alloc: &AllocResult, reg: Reg) -> CodegenResult<Assignment> {
    alloc
        .assignments
        .get(reg.virt_index() as usize)
        .copied()
        .flatten()
        .ok_or(CodegenError::IllegalVirtReg)
}

type Rewritten = (SmallVec<[Inst; 3]>, Inst, SmallVec<[Inst; 3]>);

/// Replace virtual registers with their assignments; spilled operands are
/// routed through x16/x17 (v31 for vectors) with loads and stores spliced
/// around the instruction.
fn rewrite_inst(
    mut inst: Inst,
    alloc: &AllocResult,
    frame: &FrameDescriptor,
) -> CodegenResult<Rewritten> {
    let mut any_spilled = false;
    let mut subst_err = None;
    inst.visit_regs(&mut |reg, _| {
        if !reg.is_virtual() {
            return;
        }
        match assignment_of(alloc, *reg) {
            Ok(Assignment::Reg(enc)) => *reg = Reg::physical(reg.class(), enc),
            Ok(Assignment::Slot(_)) => any_spilled = true,
            Err(err) => subst_err = Some(err),
        }
    });
    if let Some(err) = subst_err {
        return Err(err);
    }
    if !any_spilled {
        return Ok((SmallVec::new(), inst, SmallVec::new()));
    }

    struct Route {
        idx: u32,
        scratch: Reg,
        mem: AMode,
        loaded: bool,
        stored: bool,
    }
    let mut before: SmallVec<[Inst; 3]> = SmallVec::new();
    let mut after: SmallVec<[Inst; 3]> = SmallVec::new();
    let mut gp_scratch = [regs::spilltmp_reg(), regs::tmp2_reg()].into_iter();
    let mut vec_scratch = Some(regs::vec_spilltmp_reg());
    let mut routed: SmallVec<[Route; 2]> = SmallVec::new();
    let mut err = None;

    inst.visit_regs(&mut |reg, role| {
        if !reg.is_virtual() || err.is_some() {
            return;
        }
        let class = reg.class();
        let idx = reg.virt_index();
        let slot_off = match assignment_of(alloc, *reg) {
            Ok(Assignment::Slot(off)) => off,
            Ok(Assignment::Reg(_)) => unreachable!("substituted above"),
            Err(e) => {
                err = Some(e);
                return;
            }
        };
        let route = match routed.iter_mut().find(|r| r.idx == idx) {
            Some(route) => route,
            None => {
                let scratch = match class {
                    RegClass::Gp => match gp_scratch.next() {
                        Some(s) => s,
                        None => {
                            err = Some(CodegenError::OverlappedRegs);
                            return;
                        }
                    },
                    RegClass::Vec => match vec_scratch.take() {
                        Some(s) => s,
                        None => {
                            err = Some(CodegenError::OverlappedRegs);
                            return;
                        }
                    },
                };
                let size = match class {
                    RegClass::Gp => 8,
                    RegClass::Vec => 16,
                };
                let mem = match slot_amode(frame, slot_off, size) {
                    Ok(mem) => mem,
                    Err(e) => {
                        err = Some(e);
                        return;
                    }
                };
                routed.push(Route {
                    idx,
                    scratch,
                    mem,
                    loaded: false,
                    stored: false,
                });
                routed.last_mut().unwrap()
            }
        };
        if matches!(role, RegRole::Use | RegRole::UseDef) && !route.loaded {
            route.loaded = true;
            before.push(match class {
                RegClass::Gp => Inst::ULoad {
                    ty: LoadStoreType::X,
                    rd: wr(route.scratch),
                    mem: route.mem,
                },
                RegClass::Vec => Inst::FpuLoad {
                    size: FpuSize::F64,
                    rd: wr(route.scratch),
                    mem: route.mem,
                },
            });
        }
        if matches!(role, RegRole::Def | RegRole::UseDef) && !route.stored {
            route.stored = true;
            after.push(match class {
                RegClass::Gp => Inst::Store {
                    ty: LoadStoreType::X,
                    rt: route.scratch,
                    mem: route.mem,
                },
                RegClass::Vec => Inst::FpuStore {
                    size: FpuSize::F64,
                    rt: route.scratch,
                    mem: route.mem,
                },
            });
        }
        *reg = route.scratch;
    });
    if let Some(err) = err {
        return Err(err);
    }
    Ok((before, inst, after))
}

/// Adjust SP by `amount` using one or two `add`/`sub` immediates.
fn emit_sp_adjust(asm: &mut Assembler, amount: u32, down: bool) -> CodegenResult<()> {
    if amount == 0 {
        return Ok(());
    }
    let op = if down { ALUOp::Sub } else { ALUOp::Add };
    for part in [amount & 0xfff000, amount & 0xfff] {
        if part != 0 {
            asm.emit(&Inst::AluRRImm12 {
                op,
                size: OperandSize::Size64,
                rd: wr(regs::sp()),
                rn: regs::sp(),
                imm12: Imm12::maybe_from_u64(u64::from(part))
                    .ok_or(CodegenError::InvalidDisplacement)?,
            })?;
        }
    }
    Ok(())
}

fn pair_neg16() -> PairAMode {
    PairAMode::PreIndexed {
        rn: regs::sp(),
        simm7: SImm7Scaled::maybe_from_i64(-16, 8).expect("-16 fits"),
    }
}

fn pair_pos16() -> PairAMode {
    PairAMode::PostIndexed {
        rn: regs::sp(),
        simm7: SImm7Scaled::maybe_from_i64(16, 8).expect("16 fits"),
    }
}

fn emit_prologue(asm: &mut Assembler, frame: &FrameDescriptor) -> CodegenResult<()> {
    // stp x29, x30, [sp, #-16]!; mov x29, sp.
    asm.stp(regs::fp_reg(), regs::link_reg(), pair_neg16())?;
    asm.emit(&Inst::AluRRImm12 {
        op: ALUOp::Add,
        size: OperandSize::Size64,
        rd: wr(regs::fp_reg()),
        rn: regs::sp(),
        imm12: Imm12::zero(),
    })?;
    for chunk in frame.preserved_gp.chunks(2) {
        let a = regs::xreg(chunk[0]);
        let b = chunk.get(1).map(|&e| regs::xreg(e)).unwrap_or(regs::zero_reg());
        asm.stp(a, b, pair_neg16())?;
    }
    emit_sp_adjust(asm, frame.local_bytes, true)?;
    for (k, &enc) in frame.preserved_vec.iter().enumerate() {
        let mem = vec_save_amode(frame, k as u32)?;
        asm.emit(&Inst::FpuStore {
            size: FpuSize::F64,
            rt: regs::vreg(enc),
            mem,
        })?;
    }
    Ok(())
}

fn emit_epilogue(asm: &mut Assembler, frame: &FrameDescriptor) -> CodegenResult<()> {
    for (k, &enc) in frame.preserved_vec.iter().enumerate() {
        let mem = vec_save_amode(frame, k as u32)?;
        asm.emit(&Inst::FpuLoad {
            size: FpuSize::F64,
            rd: wr(regs::vreg(enc)),
            mem,
        })?;
    }
    emit_sp_adjust(asm, frame.local_bytes, false)?;
    for chunk in frame.preserved_gp.chunks(2).rev() {
        let a = wr(regs::xreg(chunk[0]));
        let b = chunk
            .get(1)
            .map(|&e| wr(regs::xreg(e)))
            .unwrap_or(wr(regs::zero_reg()));
        asm.ldp(a, b, pair_pos16())?;
    }
    asm.ldp(wr(regs::fp_reg()), wr(regs::link_reg()), pair_pos16())?;
    asm.ret()
}

/// SP-relative access to the `index`-th preserved-vector save area, which
/// sits below the spill slots.
fn vec_save_amode(frame: &FrameDescriptor, index: u32) -> CodegenResult<AMode> {
    let sp_off = frame
        .local_bytes
        .checked_sub(frame.spill_bytes + 8 * index + 8)
        .ok_or(CodegenError::InvalidDisplacement)?;
    let uimm12 = UImm12Scaled::maybe_from_i64(i64::from(sp_off), 8)
        .ok_or(CodegenError::InvalidDisplacement)?;
    Ok(AMode::UnsignedOffset {
        rn: regs::sp(),
        uimm12,
    })
}

fn emit_arg_moves(
    asm: &mut Assembler,
    sig: &Signature,
    args: &[Reg],
    alloc: &AllocResult,
    frame: &FrameDescriptor,
) -> CodegenResult<()> {
    let mut gp_moves: Vec<(u8, u8)> = Vec::new();
    let mut vec_moves: Vec<(u8, u8)> = Vec::new();
    for (i, &vreg) in args.iter().enumerate() {
        let (is_float, src_enc) = arg_location(sig, i)?;
        let assignment = match alloc.assignments.get(vreg.virt_index() as usize) {
            Some(Some(a)) => *a,
            _ => continue,
        };
        match assignment {
            Assignment::Reg(dst_enc) => {
                if is_float {
                    vec_moves.push((src_enc, dst_enc));
                } else {
                    gp_moves.push((src_enc, dst_enc));
                }
            }
            Assignment::Slot(off) => {
                let class_size = if is_float { 16 } else { 8 };
                let mem = slot_amode(frame, off, class_size)?;
                store_arg(asm, is_float, src_enc, mem)?;
            }
        }
    }
    // x16 may be needed for far-slot addressing above; x17 breaks cycles.
    resolve_parallel_moves(asm, gp_moves, 17, |asm, src, dst| {
        asm.mov_rr(OperandSize::Size64, wr(regs::xreg(dst)), regs::xreg(src))
    })?;
    resolve_parallel_moves(asm, vec_moves, 31, |asm, src, dst| {
        asm.emit(&Inst::FpuMov {
            size: FpuSize::F64,
            rd: wr(regs::vreg(dst)),
            rn: regs::vreg(src),
        })
    })
}

fn store_arg(asm: &mut Assembler, is_float: bool, src_enc: u8, mem: AMode) -> CodegenResult<()> {
    if is_float {
        asm.emit(&Inst::FpuStore {
            size: FpuSize::F64,
            rt: regs::vreg(src_enc),
            mem,
        })
    } else {
        asm.str(LoadStoreType::X, regs::xreg(src_enc), mem)
    }
}

fn resolve_parallel_moves(
    asm: &mut Assembler,
    mut moves: Vec<(u8, u8)>,
    scratch: u8,
    mut emit: impl FnMut(&mut Assembler, u8, u8) -> CodegenResult<()>,
) -> CodegenResult<()> {
    moves.retain(|(src, dst)| src != dst);
    while !moves.is_empty() {
        if let Some(pos) = moves
            .iter()
            .position(|&(_, dst)| !moves.iter().any(|&(src, _)| src == dst))
        {
            let (src, dst) = moves.remove(pos);
            emit(asm, src, dst)?;
        } else {
            let (src, _) = moves[0];
            emit(asm, src, scratch)?;
            for m in moves.iter_mut().filter(|m| m.0 == src) {
                m.0 = scratch;
            }
        }
    }
    Ok(())
}
