//! The x86-64 compiler front end: mnemonic surface over virtual registers
//! and the finalize pipeline (allocate, rewrite, frame, serialize).

use smallvec::SmallVec;

use crate::environment::{Arch, CallConv, Environment, Flags, VectorSavePolicy};
use crate::fixup::FinalizedCode;
use crate::isa::x64::args::{Amode, InstOpts, OperandSize, RegMem, RegMemImm};
use crate::isa::x64::asm::Assembler;
use crate::isa::x64::inst::{AluOp, Inst, ShiftOp, CC};
use crate::isa::x64::regs::{self, enc};
use crate::labels::Label;
use crate::reg::{Reg, RegClass, RegRole, Writable};
use crate::result::{CodegenError, CodegenResult};

use super::frame::{arg_location, FrameDescriptor, Signature};
use super::node::{AlignMode, Node, NodeId};
use super::regalloc::{linear_scan, AllocResult, Assignment, RegPools, VRegData};
use super::Builder;

/// An x86-64 function compiler.
pub type Compiler = Builder<Inst>;

fn wr(reg: Reg) -> Writable<Reg> {
    Writable::from_reg(reg)
}

/// Allocatable register pools for the given convention, caller-saved
/// first. RSP and RBP are reserved for the frame; r10/r11 and xmm15 are
/// reserved as rewrite scratch.
fn pools(call_conv: CallConv) -> RegPools {
    match call_conv {
        CallConv::SystemV => RegPools {
            gp: vec![
                enc::RAX,
                enc::RCX,
                enc::RDX,
                enc::RSI,
                enc::RDI,
                enc::R8,
                enc::R9,
                enc::RBX,
                enc::R12,
                enc::R13,
                enc::R14,
                enc::R15,
            ],
            vec: (0..15).collect(),
            callee_gp: vec![enc::RBX, enc::R12, enc::R13, enc::R14, enc::R15],
            callee_vec: vec![],
        },
        CallConv::WindowsFastcall => RegPools {
            gp: vec![
                enc::RAX,
                enc::RCX,
                enc::RDX,
                enc::R8,
                enc::R9,
                enc::RBX,
                enc::RSI,
                enc::RDI,
                enc::R12,
                enc::R13,
                enc::R14,
                enc::R15,
            ],
            vec: (0..15).collect(),
            callee_gp: vec![
                enc::RBX,
                enc::RSI,
                enc::RDI,
                enc::R12,
                enc::R13,
                enc::R14,
                enc::R15,
            ],
            callee_vec: (6..15).collect(),
        },
        CallConv::Aapcs64 => unreachable!("aapcs64 is not an x86-64 convention"),
    }
}

impl Compiler {
    /// Create a compiler for an x86-64 environment.
    pub fn new(env: &Environment, flags: Flags) -> CodegenResult<Compiler> {
        if env.arch() != Arch::X64 {
            return Err(CodegenError::InvalidArgument(
                "environment is not x86-64",
            ));
        }
        Ok(Builder::new_inner(env, flags))
    }

    // Mnemonic surface. Registers may be virtual or physical.

    pub fn mov_rr(&mut self, size: OperandSize, dst: Reg, src: Reg) -> &mut Self {
        self.inst(Inst::MovRR { size, dst: wr(dst), src });
        self
    }

    pub fn mov_ri(&mut self, size: OperandSize, dst: Reg, imm: i64) -> &mut Self {
        self.inst(Inst::MovRI { size, dst: wr(dst), imm });
        self
    }

    pub fn load(&mut self, size: OperandSize, dst: Reg, src: Amode) -> &mut Self {
        self.inst(Inst::MovRM { size, dst: wr(dst), src });
        self
    }

    pub fn store(&mut self, size: OperandSize, dst: Amode, src: Reg) -> &mut Self {
        self.inst(Inst::MovMR {
            size,
            dst,
            src,
            opts: InstOpts::NONE,
        });
        self
    }

    pub fn alu_rr(&mut self, op: AluOp, size: OperandSize, dst: Reg, src: Reg) -> &mut Self {
        self.inst(Inst::AluRR { op, size, dst: wr(dst), src });
        self
    }

    pub fn add_rr(&mut self, size: OperandSize, dst: Reg, src: Reg) -> &mut Self {
        self.alu_rr(AluOp::Add, size, dst, src)
    }

    pub fn sub_rr(&mut self, size: OperandSize, dst: Reg, src: Reg) -> &mut Self {
        self.alu_rr(AluOp::Sub, size, dst, src)
    }

    pub fn alu_ri(&mut self, op: AluOp, size: OperandSize, dst: Reg, imm: i32) -> &mut Self {
        self.inst(Inst::AluRI { op, size, dst: wr(dst), imm });
        self
    }

    pub fn add_ri(&mut self, size: OperandSize, dst: Reg, imm: i32) -> &mut Self {
        self.alu_ri(AluOp::Add, size, dst, imm)
    }

    pub fn cmp_rr(&mut self, size: OperandSize, lhs: Reg, rhs: Reg) -> &mut Self {
        self.inst(Inst::Cmp {
            size,
            lhs,
            rhs: RegMemImm::Reg(rhs),
        });
        self
    }

    pub fn cmp_ri(&mut self, size: OperandSize, lhs: Reg, imm: i32) -> &mut Self {
        self.inst(Inst::Cmp {
            size,
            lhs,
            rhs: RegMemImm::Imm(imm),
        });
        self
    }

    pub fn test_rr(&mut self, size: OperandSize, lhs: Reg, rhs: Reg) -> &mut Self {
        self.inst(Inst::Test {
            size,
            lhs,
            rhs: RegMemImm::Reg(rhs),
        });
        self
    }

    pub fn imul_rr(&mut self, size: OperandSize, dst: Reg, src: Reg) -> &mut Self {
        self.inst(Inst::Imul2 {
            size,
            dst: wr(dst),
            src: RegMem::Reg(src),
        });
        self
    }

    pub fn shift_ri(&mut self, op: ShiftOp, size: OperandSize, dst: Reg, amount: u8) -> &mut Self {
        self.inst(Inst::ShiftRI {
            op,
            size,
            dst: wr(dst),
            amount,
        });
        self
    }

    pub fn lea(&mut self, size: OperandSize, dst: Reg, addr: Amode) -> &mut Self {
        self.inst(Inst::Lea { size, dst: wr(dst), addr });
        self
    }

    pub fn jmp(&mut self, target: Label) -> &mut Self {
        self.inst(Inst::JmpKnown {
            target,
            opts: InstOpts::NONE,
        });
        self
    }

    pub fn jcc(&mut self, cc: CC, target: Label) -> &mut Self {
        self.inst(Inst::JmpCond {
            cc,
            target,
            opts: InstOpts::NONE,
        });
        self
    }

    pub fn cmov(&mut self, cc: CC, size: OperandSize, dst: Reg, src: Reg) -> &mut Self {
        self.inst(Inst::Cmov {
            cc,
            size,
            dst: wr(dst),
            src: RegMem::Reg(src),
        });
        self
    }

    pub fn setcc(&mut self, cc: CC, dst: Reg) -> &mut Self {
        self.inst(Inst::Setcc { cc, dst: wr(dst) });
        self
    }

    /// Move `value` into the ABI return register and return.
    pub fn ret_value(&mut self, size: OperandSize, value: Reg) -> CodegenResult<()> {
        self.mov_rr(size, regs::rax(), value);
        self.ret()
    }

    /// Run register allocation, emit the frame, serialize everything, and
    /// resolve fixups.
    pub fn finalize(mut self) -> CodegenResult<FinalizedCode> {
        self.check_ready_to_finalize()?;
        let sig = self.sig.take().expect("checked above");

        // Interval construction.
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

        // Allocation and frame layout.
        let pools = pools(self.call_conv);
        let alloc = linear_scan(&vregs, &pools)?;
        let preserved_vec: Vec<u8> = match self.flags.vector_save_policy {
            VectorSavePolicy::SaveAll if self.call_conv == CallConv::WindowsFastcall => {
                // The whole callee-saved set, including the xmm15 rewrite
                // scratch.
                (6..=15).collect()
            }
            _ => alloc.used_callee_vec.clone(),
        };
        let frame = FrameDescriptor::compute(
            self.call_conv,
            &alloc.used_callee_gp,
            &preserved_vec,
            alloc.spill_bytes,
        );

        // Operand rewrite: physical registers in place, spill code spliced
        // around instructions that touch spilled virtual registers.
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

        // Serialization.
        let labels = core::mem::take(&mut self.labels);
        let mut asm = Assembler::with_labels(self.flags, labels);
        let all_ids: Vec<NodeId> = self.nodes.iter_ids().collect();
        for id in all_ids {
            match self.nodes.get(id) {
                Node::Sentinel => unreachable!(),
                Node::Comment(_) => {}
                Node::FuncEnd => {}
                Node::Label(label) => asm.bind(*label)?,
                Node::Align { mode, alignment } => {
                    let fill = match mode {
                        AlignMode::Code => 0x90,
                        AlignMode::Data => 0x00,
                    };
                    asm.align(*alignment, fill)?;
                }
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

fn slot_amode(frame: &FrameDescriptor, slot_off: u32, size: u32) -> Amode {
    Amode::base_disp(regs::rbp(), -(frame.slot_offset(slot_off, size) as i32))
}

fn assignment_of(alloc: &AllocResult, reg: Reg) -> CodegenResult<Assignment> {
    alloc
        .assignments
        .get(reg.virt_index() as usize)
        .copied()
        .flatten()
        .ok_or(CodegenError::IllegalVirtReg)
}

type Rewritten = (SmallVec<[Inst; 2]>, Inst, SmallVec<[Inst; 1]>);

/// Replace virtual registers with their assignments. Register assignments
/// substitute in place; spill-slot assignments either fold into a memory
/// operand (for the common mov/ALU shapes) or go through the reserved
/// scratch registers with a load before and a store after.
fn rewrite_inst(
    mut inst: Inst,
    alloc: &AllocResult,
    frame: &FrameDescriptor,
) -> CodegenResult<Rewritten> {
    // First substitute everything that got a register.
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

    let gp_slot = |reg: Reg| -> CodegenResult<Amode> {
        match assignment_of(alloc, reg)? {
            Assignment::Slot(off) => Ok(slot_amode(frame, off, 8)),
            Assignment::Reg(_) => Err(CodegenError::IllegalVirtReg),
        }
    };

    // Folds that keep the spill access inside the instruction itself.
    match inst {
        Inst::MovRR { size, dst, src } if dst.to_reg().is_virtual() && src.is_physical() => {
            let main = Inst::MovMR {
                size,
                dst: gp_slot(dst.to_reg())?,
                src,
                opts: InstOpts::NONE,
            };
            return Ok((SmallVec::new(), main, SmallVec::new()));
        }
        Inst::MovRR { size, dst, src } if src.is_virtual() && dst.to_reg().is_physical() => {
            let main = Inst::MovRM {
                size,
                dst,
                src: gp_slot(src)?,
            };
            return Ok((SmallVec::new(), main, SmallVec::new()));
        }
        Inst::MovRI { size, dst, imm } if dst.to_reg().is_virtual() => {
            if let Ok(imm32) = i32::try_from(imm) {
                let main = Inst::MovMI {
                    size,
                    dst: gp_slot(dst.to_reg())?,
                    imm: imm32,
                };
                return Ok((SmallVec::new(), main, SmallVec::new()));
            }
        }
        Inst::AluRR { op, size, dst, src } if src.is_virtual() && dst.to_reg().is_physical() => {
            let main = Inst::AluRM {
                op,
                size,
                dst,
                src: gp_slot(src)?,
            };
            return Ok((SmallVec::new(), main, SmallVec::new()));
        }
        Inst::AluRR { op, size, dst, src } if dst.to_reg().is_virtual() && src.is_physical() => {
            let main = Inst::AluMR {
                op,
                size,
                dst: gp_slot(dst.to_reg())?,
                src,
                opts: InstOpts::NONE,
            };
            return Ok((SmallVec::new(), main, SmallVec::new()));
        }
        Inst::AluRI { op, size, dst, imm } if dst.to_reg().is_virtual() => {
            let main = Inst::AluMI {
                op,
                size,
                dst: gp_slot(dst.to_reg())?,
                imm,
                opts: InstOpts::NONE,
            };
            return Ok((SmallVec::new(), main, SmallVec::new()));
        }
        _ => {}
    }

    // Generic path: route every spilled operand through a scratch register.
    // Loads always sit before the instruction and stores after it, whatever
    // the visit order, because uses semantically precede defs.
    struct Route {
        idx: u32,
        scratch: Reg,
        mem: Amode,
        loaded: bool,
        stored: bool,
    }
    let mut before: SmallVec<[Inst; 2]> = SmallVec::new();
    let mut after: SmallVec<[Inst; 1]> = SmallVec::new();
    let mut gp_scratch = regs::GP_SCRATCH.iter();
    let mut vec_scratch = Some(regs::VEC_SCRATCH);
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
                        Some(&s) => Reg::physical(class, s),
                        None => {
                            err = Some(CodegenError::OverlappedRegs);
                            return;
                        }
                    },
                    RegClass::Vec => match vec_scratch.take() {
                        Some(s) => Reg::physical(class, s),
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
                routed.push(Route {
                    idx,
                    scratch,
                    mem: slot_amode(frame, slot_off, size),
                    loaded: false,
                    stored: false,
                });
                routed.last_mut().unwrap()
            }
        };
        if matches!(role, RegRole::Use | RegRole::UseDef) && !route.loaded {
            route.loaded = true;
            before.push(match class {
                RegClass::Gp => Inst::MovRM {
                    size: OperandSize::Size64,
                    dst: Writable::from_reg(route.scratch),
                    src: route.mem,
                },
                RegClass::Vec => Inst::XmmLoad {
                    op: crate::isa::x64::inst::SseMovOp::Movdqu,
                    dst: Writable::from_reg(route.scratch),
                    src: route.mem,
                },
            });
        }
        if matches!(role, RegRole::Def | RegRole::UseDef) && !route.stored {
            route.stored = true;
            after.push(match class {
                RegClass::Gp => Inst::MovMR {
                    size: OperandSize::Size64,
                    dst: route.mem,
                    src: route.scratch,
                    opts: InstOpts::NONE,
                },
                RegClass::Vec => Inst::XmmStore {
                    op: crate::isa::x64::inst::SseMovOp::Movdqu,
                    dst: route.mem,
                    src: route.scratch,
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

fn emit_prologue(asm: &mut Assembler, frame: &FrameDescriptor) -> CodegenResult<()> {
    asm.push(regs::rbp())?;
    asm.mov_rr(OperandSize::Size64, wr(regs::rbp()), regs::rsp())?;
    for &enc in &frame.preserved_gp {
        asm.push(Reg::physical(RegClass::Gp, enc))?;
    }
    if frame.local_bytes > 0 {
        asm.sub_ri(OperandSize::Size64, wr(regs::rsp()), frame.local_bytes as i32)?;
    }
    for (k, &enc) in frame.preserved_vec.iter().enumerate() {
        let off = frame.vec_save_offset(k as u32);
        asm.emit(&Inst::XmmStore {
            op: crate::isa::x64::inst::SseMovOp::Movdqu,
            dst: Amode::base_disp(regs::rbp(), -(off as i32)),
            src: Reg::physical(RegClass::Vec, enc),
        })?;
    }
    Ok(())
}

fn emit_epilogue(asm: &mut Assembler, frame: &FrameDescriptor) -> CodegenResult<()> {
    for (k, &enc) in frame.preserved_vec.iter().enumerate() {
        let off = frame.vec_save_offset(k as u32);
        asm.emit(&Inst::XmmLoad {
            op: crate::isa::x64::inst::SseMovOp::Movdqu,
            dst: wr(Reg::physical(RegClass::Vec, enc)),
            src: Amode::base_disp(regs::rbp(), -(off as i32)),
        })?;
    }
    if frame.local_bytes > 0 {
        asm.add_ri(OperandSize::Size64, wr(regs::rsp()), frame.local_bytes as i32)?;
    }
    for &enc in frame.preserved_gp.iter().rev() {
        asm.pop(wr(Reg::physical(RegClass::Gp, enc)))?;
    }
    asm.pop(wr(regs::rbp()))?;
    asm.ret()
}

/// Move the incoming arguments from their ABI registers into the locations
/// the allocator chose. Spilled arguments store straight to their slots;
/// register-to-register moves are resolved as a parallel move with the
/// scratch register breaking cycles.
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
            // An argument that is never used needs no landing move.
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
                if is_float {
                    asm.emit(&Inst::XmmStore {
                        op: crate::isa::x64::inst::SseMovOp::Movdqu,
                        dst: slot_amode(frame, off, 16),
                        src: Reg::physical(RegClass::Vec, src_enc),
                    })?;
                } else {
                    asm.store(
                        OperandSize::Size64,
                        slot_amode(frame, off, 8),
                        Reg::physical(RegClass::Gp, src_enc),
                    )?;
                }
            }
        }
    }
    resolve_parallel_moves(asm, gp_moves, regs::GP_SCRATCH[0], |asm, src, dst| {
        asm.mov_rr(
            OperandSize::Size64,
            wr(Reg::physical(RegClass::Gp, dst)),
            Reg::physical(RegClass::Gp, src),
        )
    })?;
    resolve_parallel_moves(asm, vec_moves, regs::VEC_SCRATCH, |asm, src, dst| {
        asm.emit(&Inst::XmmMovRR {
            op: crate::isa::x64::inst::SseMovOp::Movaps,
            dst: wr(Reg::physical(RegClass::Vec, dst)),
            src: Reg::physical(RegClass::Vec, src),
        })
    })
}

/// Order `moves` so no destination is overwritten while still needed as a
/// source, breaking cycles through `scratch`.
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
            // Every destination is also a pending source: a cycle. Park one
            // source in the scratch register.
            let (src, _) = moves[0];
            emit(asm, src, scratch)?;
            for m in moves.iter_mut().filter(|m| m.0 == src) {
                m.0 = scratch;
            }
        }
    }
    Ok(())
}
