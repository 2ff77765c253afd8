//! Golden byte-sequence tests for the x86-64 encoder.
//!
//! Transcribing a case: assemble the intent with any off-the-shelf
//! assembler and compare `objdump -d` output against the hex string here.

use crate::environment::Flags;
use crate::reg::Writable;
use crate::result::CodegenError;

use super::args::{Amode, InstOpts, OperandSize, RegMem, RegMemImm, Scale};
use super::asm::Assembler;
use super::inst::*;
use super::regs::*;

use OperandSize::*;

fn w(reg: crate::reg::Reg) -> Writable<crate::reg::Reg> {
    Writable::from_reg(reg)
}

fn enc(inst: &Inst) -> String {
    let mut asm = Assembler::new();
    asm.emit(inst).expect("emission must succeed");
    asm.bytes()
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<String>()
}

fn enc_err(inst: &Inst) -> CodegenError {
    let mut asm = Assembler::new();
    asm.emit(inst).expect_err("emission must fail")
}

#[test]
fn test_x64_binemit() {
    let mut insns: Vec<(Inst, &str)> = Vec::new();

    // Bare opcodes.
    insns.push((Inst::Ret, "C3")); // ret
    insns.push((Inst::Nop { len: 1 }, "90")); // nop
    insns.push((Inst::Nop { len: 4 }, "0F1F4000")); // nopl 0(%rax)
    insns.push((Inst::Ud2, "0F0B")); // ud2

    // mov imm.
    insns.push((
        Inst::MovRI { size: Size32, dst: w(rax()), imm: 42 },
        "B82A000000", // mov eax, 42
    ));
    insns.push((
        Inst::MovRI { size: Size32, dst: w(r8()), imm: 7 },
        "41B807000000", // mov r8d, 7
    ));
    insns.push((
        Inst::MovRI { size: Size16, dst: w(rcx()), imm: 0x1234 },
        "66B93412", // mov cx, 0x1234
    ));
    insns.push((
        Inst::MovRI { size: Size8, dst: w(rax()), imm: 7 },
        "B007", // mov al, 7
    ));
    insns.push((
        Inst::MovRI { size: Size8, dst: w(ah()), imm: 1 },
        "B401", // mov ah, 1
    ));
    insns.push((
        Inst::MovRI { size: Size64, dst: w(rax()), imm: -1 },
        "48C7C0FFFFFFFF", // mov rax, -1 (sign-extended imm32 form)
    ));
    insns.push((
        Inst::MovRI {
            size: Size64,
            dst: w(rax()),
            imm: 0x1122334455667788,
        },
        "48B88877665544332211", // movabs rax, 0x1122334455667788
    ));

    // mov reg-reg.
    insns.push((
        Inst::MovRR { size: Size64, dst: w(rax()), src: rdi() },
        "4889F8", // mov rax, rdi
    ));
    insns.push((
        Inst::MovRR { size: Size64, dst: w(r12()), src: r13() },
        "4D89EC", // mov r12, r13
    ));
    insns.push((
        Inst::MovRR { size: Size32, dst: w(rdx()), src: rbx() },
        "89DA", // mov edx, ebx
    ));
    insns.push((
        Inst::MovRR { size: Size8, dst: w(rbx()), src: rsi() },
        "4088F3", // mov bl, sil (REX forced for sil)
    ));
    insns.push((
        Inst::MovRR { size: Size8, dst: w(ah()), src: rax() },
        "88C4", // mov ah, al
    ));

    // ALU reg-reg / reg-imm.
    insns.push((
        Inst::AluRR { op: AluOp::Add, size: Size64, dst: w(rax()), src: rsi() },
        "4801F0", // add rax, rsi
    ));
    insns.push((
        Inst::AluRR { op: AluOp::Add, size: Size32, dst: w(rcx()), src: rdx() },
        "01D1", // add ecx, edx
    ));
    insns.push((
        Inst::AluRR { op: AluOp::Add, size: Size64, dst: w(r8()), src: r9() },
        "4D01C8", // add r8, r9
    ));
    insns.push((
        Inst::AluRR { op: AluOp::Xor, size: Size32, dst: w(rax()), src: rax() },
        "31C0", // xor eax, eax
    ));
    insns.push((
        Inst::AluRI { op: AluOp::Sub, size: Size64, dst: w(rsp()), imm: 32 },
        "4883EC20", // sub rsp, 32
    ));
    insns.push((
        Inst::AluRI { op: AluOp::Add, size: Size64, dst: w(rax()), imm: 1000 },
        "4881C0E8030000", // add rax, 1000
    ));
    insns.push((
        Inst::AluRI { op: AluOp::And, size: Size64, dst: w(rax()), imm: 0x0F },
        "4883E00F", // and rax, 15
    ));
    insns.push((
        Inst::AluRI { op: AluOp::Add, size: Size16, dst: w(rax()), imm: 0x1000 },
        "6681C00010", // add ax, 0x1000
    ));

    // cmp / test.
    insns.push((
        Inst::Cmp { size: Size64, lhs: rax(), rhs: RegMemImm::Imm(42) },
        "4883F82A", // cmp rax, 42
    ));
    insns.push((
        Inst::Cmp { size: Size64, lhs: rdi(), rhs: RegMemImm::Reg(rsi()) },
        "4839F7", // cmp rdi, rsi
    ));
    insns.push((
        Inst::Cmp {
            size: Size32,
            lhs: rax(),
            rhs: RegMemImm::Mem(Amode::base(rdi())),
        },
        "3B07", // cmp eax, dword [rdi]
    ));
    insns.push((
        Inst::Test { size: Size64, lhs: rax(), rhs: RegMemImm::Reg(rax()) },
        "4885C0", // test rax, rax
    ));
    insns.push((
        Inst::Test { size: Size8, lhs: rax(), rhs: RegMemImm::Imm(1) },
        "F6C001", // test al, 1
    ));

    // Loads and stores.
    insns.push((
        Inst::MovRM { size: Size64, dst: w(rax()), src: Amode::base(rdi()) },
        "488B07", // mov rax, [rdi]
    ));
    insns.push((
        Inst::MovRM { size: Size64, dst: w(rax()), src: Amode::base(rbp()) },
        "488B4500", // mov rax, [rbp] (forced disp8)
    ));
    insns.push((
        Inst::MovRM { size: Size64, dst: w(rax()), src: Amode::base(rsp()) },
        "488B0424", // mov rax, [rsp] (SIB)
    ));
    insns.push((
        Inst::MovRM { size: Size64, dst: w(rax()), src: Amode::base(r12()) },
        "498B0424", // mov rax, [r12] (SIB)
    ));
    insns.push((
        Inst::MovRM { size: Size64, dst: w(rax()), src: Amode::base(r13()) },
        "498B4500", // mov rax, [r13] (forced disp8)
    ));
    insns.push((
        Inst::MovRM {
            size: Size32,
            dst: w(rax()),
            src: Amode::base_disp(rbx(), 16),
        },
        "8B4310", // mov eax, [rbx+16]
    ));
    insns.push((
        Inst::MovRM {
            size: Size64,
            dst: w(rax()),
            src: Amode::base_index_scale(rbx(), rcx(), Scale::S8, 8).unwrap(),
        },
        "488B44CB08", // mov rax, [rbx+rcx*8+8]
    ));
    insns.push((
        Inst::MovMR {
            size: Size64,
            dst: Amode::base(rdi()),
            src: rax(),
            opts: InstOpts::NONE,
        },
        "488907", // mov [rdi], rax
    ));
    insns.push((
        Inst::MovMR {
            size: Size64,
            dst: Amode::base_disp(rbp(), -8),
            src: rcx(),
            opts: InstOpts::NONE,
        },
        "48894DF8", // mov [rbp-8], rcx
    ));
    insns.push((
        Inst::MovMI { size: Size32, dst: Amode::base(rdi()), imm: 42 },
        "C7072A000000", // mov dword [rdi], 42
    ));

    // lea.
    insns.push((
        Inst::Lea {
            size: Size64,
            dst: w(rax()),
            addr: Amode::base_disp(rbp(), -16),
        },
        "488D45F0", // lea rax, [rbp-16]
    ));

    // Widening moves.
    insns.push((
        Inst::Movzx { ext: ExtMode::BL, dst: w(rax()), src: RegMem::Reg(rcx()) },
        "0FB6C1", // movzx eax, cl
    ));
    insns.push((
        Inst::Movzx {
            ext: ExtMode::BL,
            dst: w(rax()),
            src: RegMem::Mem(Amode::base(rdi())),
        },
        "0FB607", // movzx eax, byte [rdi]
    ));
    insns.push((
        Inst::Movsx { ext: ExtMode::LQ, dst: w(rax()), src: RegMem::Reg(rdi()) },
        "4863C7", // movsxd rax, edi
    ));

    // Unary group, mul/div, sign extension.
    insns.push((
        Inst::Unary { op: UnaryOp::Inc, size: Size64, dst: w(rax()) },
        "48FFC0", // inc rax
    ));
    insns.push((
        Inst::Unary { op: UnaryOp::Neg, size: Size64, dst: w(rax()) },
        "48F7D8", // neg rax
    ));
    insns.push((
        Inst::Unary { op: UnaryOp::Not, size: Size32, dst: w(rcx()) },
        "F7D1", // not ecx
    ));
    insns.push((
        Inst::UnaryM {
            op: UnaryOp::Dec,
            size: Size32,
            addr: Amode::base(rdi()),
            opts: InstOpts::NONE,
        },
        "FF0F", // dec dword [rdi]
    ));
    insns.push((
        Inst::MulDiv { op: MulDivOp::Idiv, size: Size64, src: RegMem::Reg(rsi()) },
        "48F7FE", // idiv rsi
    ));
    insns.push((
        Inst::MulDiv { op: MulDivOp::Mul, size: Size64, src: RegMem::Reg(rcx()) },
        "48F7E1", // mul rcx
    ));
    insns.push((Inst::SignExtendAx { size: Size32 }, "99")); // cdq
    insns.push((Inst::SignExtendAx { size: Size64 }, "4899")); // cqo
    insns.push((
        Inst::Imul2 { size: Size64, dst: w(rax()), src: RegMem::Reg(rsi()) },
        "480FAFC6", // imul rax, rsi
    ));

    // Shifts.
    insns.push((
        Inst::ShiftRI { op: ShiftOp::Shl, size: Size64, dst: w(rax()), amount: 3 },
        "48C1E003", // shl rax, 3
    ));
    insns.push((
        Inst::ShiftRI { op: ShiftOp::Sar, size: Size32, dst: w(rax()), amount: 1 },
        "C1F801", // sar eax, 1
    ));
    insns.push((
        Inst::ShiftRCl { op: ShiftOp::Shr, size: Size64, dst: w(rdx()) },
        "48D3EA", // shr rdx, cl
    ));

    // Locked read-modify-write.
    insns.push((
        Inst::AluMR {
            op: AluOp::Add,
            size: Size32,
            dst: Amode::base(rdi()),
            src: rax(),
            opts: InstOpts::LOCK,
        },
        "F00107", // lock add [rdi], eax
    ));
    insns.push((
        Inst::AluMI {
            op: AluOp::Add,
            size: Size64,
            dst: Amode::base(rsi()),
            imm: 1,
            opts: InstOpts::LOCK,
        },
        "F048830601", // lock add qword [rsi], 1
    ));
    insns.push((
        Inst::XchgMR {
            size: Size64,
            addr: Amode::base(rdi()),
            src: rax(),
            opts: InstOpts::NONE,
        },
        "488707", // xchg [rdi], rax
    ));
    insns.push((
        Inst::CmpxchgMR {
            size: Size64,
            addr: Amode::base(rdi()),
            src: rcx(),
            opts: InstOpts::LOCK,
        },
        "F0480FB10F", // lock cmpxchg [rdi], rcx
    ));

    // Segment override.
    insns.push((
        Inst::MovMR {
            size: Size64,
            dst: Amode::base(rdi()),
            src: rax(),
            opts: InstOpts::SEG_FS,
        },
        "64488907", // mov fs:[rdi], rax
    ));

    // Conditionals.
    insns.push((
        Inst::Setcc { cc: CC::Z, dst: w(rax()) },
        "0F94C0", // setz al
    ));
    insns.push((
        Inst::Setcc { cc: CC::NZ, dst: w(rdi()) },
        "400F95C7", // setnz dil
    ));
    insns.push((
        Inst::Cmov { cc: CC::Z, size: Size64, dst: w(rax()), src: RegMem::Reg(rbx()) },
        "480F44C3", // cmovz rax, rbx
    ));

    // Stack ops.
    insns.push((Inst::Push64 { src: rbp() }, "55")); // push rbp
    insns.push((Inst::Push64 { src: r12() }, "4154")); // push r12
    insns.push((Inst::Pop64 { dst: w(rbp()) }, "5D")); // pop rbp
    insns.push((Inst::Pop64 { dst: w(r15()) }, "415F")); // pop r15

    // Indirect control flow.
    insns.push((
        Inst::JmpUnknown { target: RegMem::Reg(rax()) },
        "FFE0", // jmp rax
    ));
    insns.push((
        Inst::CallUnknown { target: RegMem::Reg(rax()) },
        "FFD0", // call rax
    ));

    // SSE.
    insns.push((
        Inst::XmmRmR { op: SseOp::Addss, dst: w(xmm0()), src: RegMem::Reg(xmm1()) },
        "F30F58C1", // addss xmm0, xmm1
    ));
    insns.push((
        Inst::XmmRmR { op: SseOp::Addsd, dst: w(xmm(2)), src: RegMem::Reg(xmm(3)) },
        "F20F58D3", // addsd xmm2, xmm3
    ));
    insns.push((
        Inst::XmmRmR { op: SseOp::Addsd, dst: w(xmm(8)), src: RegMem::Reg(xmm(9)) },
        "F2450F58C1", // addsd xmm8, xmm9
    ));
    insns.push((
        Inst::XmmRmR { op: SseOp::Pxor, dst: w(xmm0()), src: RegMem::Reg(xmm1()) },
        "660FEFC1", // pxor xmm0, xmm1
    ));
    insns.push((
        Inst::XmmRmR { op: SseOp::Xorps, dst: w(xmm0()), src: RegMem::Reg(xmm0()) },
        "0F57C0", // xorps xmm0, xmm0
    ));
    insns.push((
        Inst::XmmLoad { op: SseMovOp::Movss, dst: w(xmm0()), src: Amode::base(rdi()) },
        "F30F1007", // movss xmm0, [rdi]
    ));
    insns.push((
        Inst::XmmStore {
            op: SseMovOp::Movsd,
            dst: Amode::base_disp(rbp(), -8),
            src: xmm1(),
        },
        "F20F114DF8", // movsd [rbp-8], xmm1
    ));
    insns.push((
        Inst::XmmMovRR { op: SseMovOp::Movaps, dst: w(xmm0()), src: xmm1() },
        "0F28C1", // movaps xmm0, xmm1
    ));
    insns.push((
        Inst::XmmLoad {
            op: SseMovOp::Movdqu,
            dst: w(xmm(6)),
            src: Amode::base_disp(rsp(), 16),
        },
        "F30F6F742410", // movdqu xmm6, [rsp+16]
    ));
    insns.push((
        Inst::GprToXmm {
            op: GprToXmmOp::Cvtsi2sd,
            src_size: Size64,
            dst: w(xmm0()),
            src: RegMem::Reg(rax()),
        },
        "F2480F2AC0", // cvtsi2sd xmm0, rax
    ));
    insns.push((
        Inst::XmmToGpr {
            op: XmmToGprOp::Cvttsd2si,
            dst_size: Size64,
            dst: w(rax()),
            src: xmm0(),
        },
        "F2480F2CC0", // cvttsd2si rax, xmm0
    ));
    insns.push((
        Inst::GprToXmm {
            op: GprToXmmOp::Movq,
            src_size: Size64,
            dst: w(xmm0()),
            src: RegMem::Reg(rax()),
        },
        "66480F6EC0", // movq xmm0, rax
    ));
    insns.push((
        Inst::XmmToGpr {
            op: XmmToGprOp::Movq,
            dst_size: Size64,
            dst: w(rax()),
            src: xmm0(),
        },
        "66480F7EC0", // movq rax, xmm0
    ));

    // AVX.
    insns.push((
        Inst::XmmRmRVex {
            op: AvxOp::Vaddps,
            l256: false,
            dst: w(xmm0()),
            src1: xmm1(),
            src2: RegMem::Reg(xmm(2)),
        },
        "C5F058C2", // vaddps xmm0, xmm1, xmm2
    ));
    insns.push((
        Inst::XmmRmRVex {
            op: AvxOp::Vaddps,
            l256: true,
            dst: w(xmm0()),
            src1: xmm1(),
            src2: RegMem::Reg(xmm(2)),
        },
        "C5F458C2", // vaddps ymm0, ymm1, ymm2
    ));
    insns.push((
        Inst::XmmRmRVex {
            op: AvxOp::Vaddsd,
            l256: false,
            dst: w(xmm0()),
            src1: xmm1(),
            src2: RegMem::Reg(xmm(2)),
        },
        "C5F358C2", // vaddsd xmm0, xmm1, xmm2
    ));
    insns.push((
        Inst::XmmRmRVex {
            op: AvxOp::Vpxor,
            l256: false,
            dst: w(xmm0()),
            src1: xmm1(),
            src2: RegMem::Reg(xmm(2)),
        },
        "C5F1EFC2", // vpxor xmm0, xmm1, xmm2
    ));
    insns.push((
        Inst::XmmRmRVex {
            op: AvxOp::Vpxor,
            l256: false,
            dst: w(xmm(8)),
            src1: xmm(9),
            src2: RegMem::Reg(xmm(10)),
        },
        "C44131EFC2", // vpxor xmm8, xmm9, xmm10 (3-byte VEX)
    ));
    insns.push((
        Inst::VexLoad {
            op: VexMovOp::Vmovups,
            l256: false,
            dst: w(xmm0()),
            src: Amode::base(rax()),
        },
        "C5F81000", // vmovups xmm0, [rax]
    ));
    insns.push((
        Inst::VexStore {
            op: VexMovOp::Vmovups,
            l256: true,
            dst: Amode::base(rdi()),
            src: xmm1(),
        },
        "C5FC110F", // vmovups [rdi], ymm1
    ));
    insns.push((Inst::Vzeroupper, "C5F877")); // vzeroupper

    for (inst, expected) in insns {
        let actual = enc(&inst);
        assert_eq!(actual, *expected, "encoding mismatch for {inst:?}");
    }
}

#[test]
fn encoding_is_deterministic() {
    let inst = Inst::AluRR {
        op: AluOp::Add,
        size: Size64,
        dst: w(rax()),
        src: rsi(),
    };
    let first = enc(&inst);
    for _ in 0..10 {
        assert_eq!(enc(&inst), first);
    }
}

#[test]
fn high_byte_with_rex_is_rejected() {
    // mov ah, sil: sil needs REX, ah forbids it.
    assert_eq!(
        enc_err(&Inst::MovRR { size: Size8, dst: w(ah()), src: rsi() }),
        CodegenError::InvalidUseOfGpbHi
    );
    // High-byte registers do not exist at wider sizes.
    assert_eq!(
        enc_err(&Inst::MovRR { size: Size64, dst: w(rax()), src: ah() }),
        CodegenError::InvalidUseOfGpq
    );
}

#[test]
fn lock_requires_a_lockable_form() {
    // mov is not lockable.
    assert_eq!(
        enc_err(&Inst::MovMR {
            size: Size64,
            dst: Amode::base(rdi()),
            src: rax(),
            opts: InstOpts::LOCK,
        }),
        CodegenError::InvalidPrefixCombination
    );
    // The read-modify-write forms are.
    let mut asm = Assembler::new();
    asm.emit(&Inst::AluMR {
        op: AluOp::Sub,
        size: Size64,
        dst: Amode::base(rdi()),
        src: rax(),
        opts: InstOpts::LOCK,
    })
    .unwrap();
    assert_eq!(asm.bytes(), &[0xF0, 0x48, 0x29, 0x07]);
}

#[test]
fn shift_amount_must_fit_the_width() {
    assert_eq!(
        enc_err(&Inst::ShiftRI { op: ShiftOp::Shl, size: Size32, dst: w(rax()), amount: 32 }),
        CodegenError::InvalidImmediate
    );
}

#[test]
fn invalid_is_the_zero_instruction() {
    assert_eq!(enc_err(&Inst::Invalid), CodegenError::InvalidInstruction);
}

#[test]
fn short_backward_jump() {
    let mut asm = Assembler::new();
    let top = asm.new_label();
    asm.bind(top).unwrap();
    asm.add_ri(Size64, w(rax()), 1).unwrap();
    asm.jmp(top).unwrap();
    let code = asm.finalize().unwrap();
    // add rax, 1 is 4 bytes; jmp back over 4+2: EB FA.
    assert_eq!(code.bytes(), &[0x48, 0x83, 0xC0, 0x01, 0xEB, 0xFA]);
}

#[test]
fn backward_jump_out_of_short_range_uses_long_form() {
    let mut asm = Assembler::new();
    let top = asm.new_label();
    asm.bind(top).unwrap();
    for _ in 0..40 {
        asm.mov_ri(Size32, w(rax()), 0).unwrap(); // 5 bytes each
    }
    asm.jmp(top).unwrap();
    let code = asm.finalize().unwrap();
    // 200 bytes of movs, then E9 with disp = -(200 + 5).
    assert_eq!(code.bytes()[200], 0xE9);
    let disp = i32::from_le_bytes(code.bytes()[201..205].try_into().unwrap());
    assert_eq!(disp, -205);
}

#[test]
fn forward_jump_resolves_at_finalize() {
    let mut asm = Assembler::new();
    let done = asm.new_label();
    asm.jmp(done).unwrap();
    asm.nop().unwrap();
    asm.nop().unwrap();
    asm.bind(done).unwrap();
    asm.ret().unwrap();
    let code = asm.finalize().unwrap();
    // Unbound targets take the long form: E9 02 00 00 00, skipping 2 nops.
    assert_eq!(code.bytes(), &[0xE9, 0x02, 0x00, 0x00, 0x00, 0x90, 0x90, 0xC3]);
}

#[test]
fn label_round_trip_forward_equals_backward_bytes() {
    // jcc to a bound, in-range target must produce the short form with the
    // same displacement a hand computation gives.
    let mut asm = Assembler::new();
    let target = asm.new_label();
    asm.test_rr(Size64, rax(), rax()).unwrap();
    let jz_at = asm.cur_offset();
    asm.jcc(CC::Z, target).unwrap();
    // Forced long? No: unbound forward jcc emits 0F 84 + rel32.
    assert_eq!(asm.bytes()[jz_at as usize], 0x0F);
    asm.nop().unwrap();
    asm.nop().unwrap();
    asm.bind(target).unwrap();
    asm.ret().unwrap();
    let code = asm.finalize().unwrap();
    // rel32 = 2 (two nops).
    assert_eq!(
        &code.bytes()[jz_at as usize..jz_at as usize + 6],
        &[0x0F, 0x84, 0x02, 0x00, 0x00, 0x00]
    );
}

#[test]
fn forced_short_forward_jump_in_range() {
    let mut asm = Assembler::new();
    let target = asm.new_label();
    asm.jmp_short(target).unwrap();
    asm.nop().unwrap();
    asm.bind(target).unwrap();
    asm.ret().unwrap();
    let code = asm.finalize().unwrap();
    assert_eq!(code.bytes(), &[0xEB, 0x01, 0x90, 0xC3]);
}

#[test]
fn forced_short_out_of_range_fails_at_finalize() {
    let mut asm = Assembler::new();
    let target = asm.new_label();
    asm.jmp_short(target).unwrap();
    for _ in 0..200 {
        asm.nop().unwrap();
    }
    asm.bind(target).unwrap();
    match asm.finalize() {
        Err(CodegenError::Finalize(errors)) => {
            assert!(matches!(
                errors[0],
                CodegenError::DisplacementOutOfRange { .. }
            ));
        }
        other => panic!("expected finalize failure, got {other:?}"),
    }
}

#[test]
fn unbound_label_fails_at_finalize() {
    let mut asm = Assembler::new();
    let target = asm.new_label();
    asm.jmp(target).unwrap();
    match asm.finalize() {
        Err(CodegenError::Finalize(errors)) => {
            assert_eq!(errors[0], CodegenError::UnboundLabel(target));
        }
        other => panic!("expected finalize failure, got {other:?}"),
    }
}

#[test]
fn rip_relative_lea_points_at_embedded_data() {
    let mut asm = Assembler::new();
    let data = asm.new_label();
    asm.lea(Size64, w(rax()), Amode::rip(data)).unwrap();
    asm.ret().unwrap();
    asm.align(8, 0x90).unwrap();
    let data_at = asm.cur_offset();
    asm.bind(data).unwrap();
    asm.embed_u64(0xDEAD_BEEF).unwrap();
    let code = asm.finalize().unwrap();
    // lea rax, [rip+disp]: 48 8D 05 <rel32>, rel32 relative to end of inst.
    assert_eq!(&code.bytes()[..3], &[0x48, 0x8D, 0x05]);
    let disp = i32::from_le_bytes(code.bytes()[3..7].try_into().unwrap());
    assert_eq!(disp, data_at as i32 - 7);
}

#[test]
fn abs64_reference_becomes_runtime_relocation() {
    let mut asm = Assembler::new();
    let data = asm.new_label();
    asm.emit(&Inst::MovRIAbs { dst: w(rax()), target: data }).unwrap();
    asm.ret().unwrap();
    asm.bind(data).unwrap();
    asm.embed_u32(7).unwrap();
    let code = asm.finalize().unwrap();
    assert_eq!(code.relocs().len(), 1);
    let reloc = code.relocs()[0];
    assert_eq!(reloc.at, 2); // after 48 B8
    assert_eq!(reloc.target, 11); // movabs(10) + ret(1)
}

#[test]
fn disabled_short_branches_force_long_forms() {
    let flags = Flags::new().opt_short_branches(false);
    let mut asm = Assembler::with_flags(flags);
    let top = asm.new_label();
    asm.bind(top).unwrap();
    asm.jmp(top).unwrap();
    let code = asm.finalize().unwrap();
    assert_eq!(code.bytes(), &[0xE9, 0xFB, 0xFF, 0xFF, 0xFF]);
}
