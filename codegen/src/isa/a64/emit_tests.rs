//! Golden byte-sequence tests for the AArch64 encoder.
//!
//! The architecture is little-endian, so when transcribing 32-bit words
//! from objdump disassembly the bytes below appear swapped: `ret` is the
//! word 0xD65F03C0 but the string "C0035FD6".

use crate::reg::Writable;
use crate::result::CodegenError;

use super::asm::Assembler;
use super::imms::*;
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

#[test]
fn test_a64_binemit() {
    let mut insns: Vec<(Inst, &str)> = Vec::new();

    insns.push((Inst::Ret, "C0035FD6")); // ret
    insns.push((Inst::Nop, "1F2003D5")); // nop
    insns.push((Inst::Brk { imm: 0 }, "000020D4")); // brk #0
    insns.push((Inst::RetReg { rn: xreg(1) }, "20005FD6")); // ret x1

    // Integer ALU, register forms.
    insns.push((
        Inst::AluRRR { op: ALUOp::Add, size: Size32, rd: w(xreg(1)), rn: xreg(2), rm: xreg(3) },
        "4100030B", // add w1, w2, w3
    ));
    insns.push((
        Inst::AluRRR { op: ALUOp::Add, size: Size64, rd: w(xreg(4)), rn: xreg(5), rm: xreg(6) },
        "A400068B", // add x4, x5, x6
    ));
    insns.push((
        Inst::AluRRR { op: ALUOp::Sub, size: Size64, rd: w(xreg(4)), rn: xreg(5), rm: xreg(6) },
        "A40006CB", // sub x4, x5, x6
    ));
    insns.push((
        Inst::AluRRR { op: ALUOp::SubS, size: Size64, rd: w(zero_reg()), rn: xreg(0), rm: xreg(1) },
        "1F0001EB", // cmp x0, x1
    ));
    insns.push((
        Inst::AluRRR { op: ALUOp::And, size: Size64, rd: w(xreg(0)), rn: xreg(1), rm: xreg(2) },
        "2000028A", // and x0, x1, x2
    ));
    insns.push((
        Inst::AluRRR { op: ALUOp::Orr, size: Size64, rd: w(xreg(0)), rn: xreg(1), rm: xreg(2) },
        "200002AA", // orr x0, x1, x2
    ));
    insns.push((
        Inst::AluRRR { op: ALUOp::Eor, size: Size64, rd: w(xreg(0)), rn: xreg(1), rm: xreg(2) },
        "200002CA", // eor x0, x1, x2
    ));
    insns.push((
        Inst::AluRRRShift {
            op: ALUOp::Add,
            size: Size64,
            rd: w(xreg(0)),
            rn: xreg(1),
            rm: xreg(2),
            shiftop: ShiftOp::Lsl,
            amount: 4,
        },
        "2010028B", // add x0, x1, x2, lsl #4
    ));

    // Integer ALU, immediate forms.
    insns.push((
        Inst::AluRRImm12 {
            op: ALUOp::Add,
            size: Size64,
            rd: w(xreg(0)),
            rn: xreg(1),
            imm12: Imm12::maybe_from_u64(16).unwrap(),
        },
        "20400091", // add x0, x1, #16
    ));
    insns.push((
        Inst::AluRRImm12 {
            op: ALUOp::Add,
            size: Size64,
            rd: w(xreg(0)),
            rn: xreg(1),
            imm12: Imm12::maybe_from_u64(0x1000).unwrap(),
        },
        "20044091", // add x0, x1, #0x1000 (shifted imm12)
    ));
    insns.push((
        Inst::AluRRImm12 {
            op: ALUOp::Sub,
            size: Size64,
            rd: w(sp()),
            rn: sp(),
            imm12: Imm12::maybe_from_u64(16).unwrap(),
        },
        "FF4300D1", // sub sp, sp, #16
    ));

    // Move-wide and register moves.
    insns.push((
        Inst::MovWide { op: MoveWideOp::MovZ, size: Size32, rd: w(xreg(0)), imm: 0, shift: 0 },
        "00008052", // movz w0, #0
    ));
    insns.push((
        Inst::MovWide { op: MoveWideOp::MovZ, size: Size64, rd: w(xreg(0)), imm: 42, shift: 0 },
        "400580D2", // movz x0, #42
    ));
    insns.push((
        Inst::MovWide { op: MoveWideOp::MovK, size: Size64, rd: w(xreg(0)), imm: 0x1234, shift: 1 },
        "8046A2F2", // movk x0, #0x1234, lsl #16
    ));
    insns.push((
        Inst::MovWide { op: MoveWideOp::MovN, size: Size32, rd: w(xreg(0)), imm: 1, shift: 0 },
        "20008012", // movn w0, #1
    ));
    insns.push((
        Inst::MovRR { size: Size64, rd: w(xreg(1)), rm: xreg(2) },
        "E10302AA", // mov x1, x2
    ));
    insns.push((
        Inst::Mvn { size: Size64, rd: w(xreg(0)), rm: xreg(1) },
        "E00321AA", // mvn x0, x1
    ));

    // Constant synthesis.
    insns.push((
        Inst::LoadConst64 { rd: w(xreg(0)), value: 0 },
        "000080D2", // movz x0, #0
    ));
    insns.push((
        Inst::LoadConst64 { rd: w(xreg(0)), value: 0x12345678 },
        "00CF8AD28046A2F2", // movz x0, #0x5678; movk x0, #0x1234, lsl #16
    ));
    insns.push((
        // Only the third half-word is non-zero: one movz, no movk.
        Inst::LoadConst64 { rd: w(xreg(0)), value: 0xFFFF_0000_0000 },
        "E0FFDFD2", // movz x0, #0xffff, lsl #32
    ));

    // Multiply, divide, shifts.
    insns.push((
        Inst::MAdd { size: Size64, rd: w(xreg(0)), rn: xreg(1), rm: xreg(2), ra: zero_reg() },
        "207C029B", // mul x0, x1, x2
    ));
    insns.push((
        Inst::MSub { size: Size64, rd: w(xreg(0)), rn: xreg(1), rm: xreg(2), ra: xreg(3) },
        "208C029B", // msub x0, x1, x2, x3
    ));
    insns.push((
        Inst::Div { signed: false, size: Size64, rd: w(xreg(0)), rn: xreg(1), rm: xreg(2) },
        "2008C29A", // udiv x0, x1, x2
    ));
    insns.push((
        Inst::Div { signed: true, size: Size64, rd: w(xreg(0)), rn: xreg(1), rm: xreg(2) },
        "200CC29A", // sdiv x0, x1, x2
    ));
    insns.push((
        Inst::ShiftVar { op: ShiftOp::Lsl, size: Size64, rd: w(xreg(0)), rn: xreg(1), rm: xreg(2) },
        "2020C29A", // lsl x0, x1, x2
    ));

    // Conditional ops.
    insns.push((
        Inst::CSel { size: Size64, cond: Cond::Eq, rd: w(xreg(0)), rn: xreg(1), rm: xreg(2) },
        "2000829A", // csel x0, x1, x2, eq
    ));
    insns.push((
        Inst::CSet { size: Size64, cond: Cond::Eq, rd: w(xreg(0)) },
        "E0179F9A", // cset x0, eq
    ));
    insns.push((
        Inst::CCmpImm {
            size: Size64,
            rn: xreg(0),
            imm: UImm5::maybe_from_u8(2).unwrap(),
            nzcv: NZCV::new(false, false, false, false),
            cond: Cond::Eq,
        },
        "000842FA", // ccmp x0, #2, #0, eq
    ));

    // Loads and stores.
    insns.push((
        Inst::ULoad { ty: LoadStoreType::X, rd: w(xreg(0)), mem: AMode::reg(xreg(1)) },
        "200040F9", // ldr x0, [x1]
    ));
    insns.push((
        Inst::ULoad {
            ty: LoadStoreType::X,
            rd: w(xreg(0)),
            mem: AMode::reg_offset(sp(), 16, 8).unwrap(),
        },
        "E00B40F9", // ldr x0, [sp, #16]
    ));
    insns.push((
        Inst::Store {
            ty: LoadStoreType::W,
            rt: xreg(1),
            mem: AMode::reg_offset(xreg(2), 8, 4).unwrap(),
        },
        "410800B9", // str w1, [x2, #8]
    ));
    insns.push((
        Inst::ULoad { ty: LoadStoreType::B, rd: w(xreg(0)), mem: AMode::reg(xreg(1)) },
        "20004039", // ldrb w0, [x1]
    ));
    insns.push((
        Inst::ULoad {
            ty: LoadStoreType::SW,
            rd: w(xreg(0)),
            mem: AMode::reg_offset(xreg(1), 4, 4).unwrap(),
        },
        "200480B9", // ldrsw x0, [x1, #4]
    ));
    insns.push((
        Inst::ULoad {
            ty: LoadStoreType::X,
            rd: w(xreg(0)),
            mem: AMode::RegReg { rn: xreg(1), rm: xreg(2) },
        },
        "206862F8", // ldr x0, [x1, x2]
    ));
    insns.push((
        Inst::ULoad {
            ty: LoadStoreType::X,
            rd: w(xreg(0)),
            mem: AMode::Unscaled {
                rn: xreg(1),
                simm9: SImm9::maybe_from_i64(-8).unwrap(),
            },
        },
        "20805FF8", // ldur x0, [x1, #-8]
    ));

    // Pairs.
    insns.push((
        Inst::StoreP64 {
            rt: fp_reg(),
            rt2: link_reg(),
            mem: PairAMode::PreIndexed {
                rn: sp(),
                simm7: SImm7Scaled::maybe_from_i64(-16, 8).unwrap(),
            },
        },
        "FD7BBFA9", // stp x29, x30, [sp, #-16]!
    ));
    insns.push((
        Inst::LoadP64 {
            rt: w(fp_reg()),
            rt2: w(link_reg()),
            mem: PairAMode::PostIndexed {
                rn: sp(),
                simm7: SImm7Scaled::maybe_from_i64(16, 8).unwrap(),
            },
        },
        "FD7BC1A8", // ldp x29, x30, [sp], #16
    ));
    insns.push((
        Inst::StoreP64 {
            rt: xreg(19),
            rt2: xreg(20),
            mem: PairAMode::SignedOffset {
                rn: sp(),
                simm7: SImm7Scaled::maybe_from_i64(16, 8).unwrap(),
            },
        },
        "F35301A9", // stp x19, x20, [sp, #16]
    ));

    // Scalar FP.
    insns.push((
        Inst::FpuLoad { size: FpuSize::F64, rd: w(vreg(0)), mem: AMode::reg(xreg(1)) },
        "200040FD", // ldr d0, [x1]
    ));
    insns.push((
        Inst::FpuStore {
            size: FpuSize::F64,
            rt: vreg(1),
            mem: AMode::reg_offset(sp(), 8, 8).unwrap(),
        },
        "E10700FD", // str d1, [sp, #8]
    ));
    insns.push((
        Inst::FpuRRR { op: FPUOp2::AddF64, rd: w(vreg(0)), rn: vreg(1), rm: vreg(2) },
        "2028621E", // fadd d0, d1, d2
    ));
    insns.push((
        Inst::FpuMov { size: FpuSize::F64, rd: w(vreg(0)), rn: vreg(1) },
        "2040601E", // fmov d0, d1
    ));
    insns.push((
        Inst::MovToFpu { size: FpuSize::F64, rd: w(vreg(0)), rn: xreg(0) },
        "0000679E", // fmov d0, x0
    ));

    // Indirect control flow.
    insns.push((Inst::CallInd { rn: xreg(8) }, "00013FD6")); // blr x8
    insns.push((Inst::IndirectBr { rn: xreg(3) }, "60001FD6")); // br x3

    for (inst, expected) in insns {
        let actual = enc(&inst);
        assert_eq!(actual, *expected, "encoding mismatch for {inst:?}");
    }
}

#[test]
fn branches_resolve_at_finalize() {
    // Forward b over one nop.
    let mut asm = Assembler::new();
    let target = asm.new_label();
    asm.b(target).unwrap();
    asm.nop().unwrap();
    asm.bind(target).unwrap();
    asm.ret().unwrap();
    let code = asm.finalize().unwrap();
    assert_eq!(
        code.bytes(),
        &[0x02, 0x00, 0x00, 0x14, 0x1F, 0x20, 0x03, 0xD5, 0xC0, 0x03, 0x5F, 0xD6]
    );
}

#[test]
fn backward_branch() {
    let mut asm = Assembler::new();
    let top = asm.new_label();
    asm.bind(top).unwrap();
    asm.nop().unwrap();
    asm.nop().unwrap();
    asm.b(top).unwrap();
    let code = asm.finalize().unwrap();
    // b .-8 = 0x17FFFFFE.
    assert_eq!(&code.bytes()[8..], &[0xFE, 0xFF, 0xFF, 0x17]);
}

#[test]
fn conditional_branches_share_the_19_bit_form() {
    // b.eq, cbz, and cbnz all target +8 from offset 0.
    let cases: [(&dyn Fn(&mut Assembler, crate::labels::Label), [u8; 4]); 3] = [
        (
            &|asm, l| asm.b_cond(Cond::Eq, l).unwrap(),
            [0x40, 0x00, 0x00, 0x54], // b.eq +8
        ),
        (
            &|asm, l| asm.cbz(Size64, xreg(0), l).unwrap(),
            [0x40, 0x00, 0x00, 0xB4], // cbz x0, +8
        ),
        (
            &|asm, l| asm.cbnz(Size32, xreg(1), l).unwrap(),
            [0x41, 0x00, 0x00, 0x35], // cbnz w1, +8
        ),
    ];
    for (emit, expected) in cases {
        let mut asm = Assembler::new();
        let target = asm.new_label();
        emit(&mut asm, target);
        asm.nop().unwrap();
        asm.bind(target).unwrap();
        asm.ret().unwrap();
        let code = asm.finalize().unwrap();
        assert_eq!(&code.bytes()[..4], &expected);
    }
}

#[test]
fn bl_backward() {
    let mut asm = Assembler::new();
    let top = asm.new_label();
    asm.bind(top).unwrap();
    asm.nop().unwrap();
    asm.bl(top).unwrap();
    let code = asm.finalize().unwrap();
    // bl .-4 = 0x97FFFFFF.
    assert_eq!(&code.bytes()[4..], &[0xFF, 0xFF, 0xFF, 0x97]);
}

#[test]
fn adr_and_literal_load() {
    let mut asm = Assembler::new();
    let data = asm.new_label();
    asm.adr(w(xreg(0)), data).unwrap(); // at 0
    asm.emit(&Inst::LoadLabel { rd: w(xreg(1)), size: Size64, label: data }).unwrap(); // at 4
    asm.ret().unwrap();
    asm.align(8, 0).unwrap();
    asm.bind(data).unwrap();
    asm.embed_u64(0x1122334455667788).unwrap();
    let code = asm.finalize().unwrap();
    // adr x0, #16 = 0x10000080.
    assert_eq!(&code.bytes()[..4], &[0x80, 0x00, 0x00, 0x10]);
    // ldr x1, #12 (3 words ahead of offset 4) = 0x58000061.
    assert_eq!(&code.bytes()[4..8], &[0x61, 0x00, 0x00, 0x58]);
}

#[test]
fn branch19_out_of_range_fails_at_finalize() {
    let mut asm = Assembler::new();
    let far = asm.new_label();
    asm.cbz(Size64, xreg(0), far).unwrap();
    // 2 MiB of padding puts the target beyond the +-1 MiB form.
    asm.embed(&[0u8; 1 << 21]).unwrap();
    asm.bind(far).unwrap();
    asm.ret().unwrap();
    match asm.finalize() {
        Err(CodegenError::Finalize(errors)) => {
            assert_eq!(errors[0], CodegenError::DisplacementOutOfRange { at: 0 });
        }
        other => panic!("expected finalize failure, got {other:?}"),
    }
}

#[test]
fn misaligned_branch_target_is_rejected() {
    let mut asm = Assembler::new();
    let target = asm.new_label();
    asm.b(target).unwrap();
    asm.embed(&[0xAA]).unwrap(); // knock the stream off word alignment
    asm.bind(target).unwrap();
    match asm.finalize() {
        Err(CodegenError::Finalize(errors)) => {
            assert_eq!(errors[0], CodegenError::DisplacementOutOfRange { at: 0 });
        }
        other => panic!("expected finalize failure, got {other:?}"),
    }
}

#[test]
fn movk_shift_range_is_checked() {
    let mut asm = Assembler::new();
    assert_eq!(
        asm.movk(Size32, w(xreg(0)), 1, 2),
        Err(CodegenError::InvalidImmediate)
    );
    assert_eq!(
        asm.movz(Size64, w(xreg(0)), 1, 4).unwrap_err(),
        CodegenError::InvalidImmediate
    );
}
