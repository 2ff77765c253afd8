//! End-to-end scenarios: build code with the assembler or compiler, place
//! it with the runtime, and (on a matching host) call it.
//!
//! Byte-sequence assertions run on every host; execution is gated on the
//! host architecture.

use windlass_codegen::compiler;
use windlass_codegen::compiler::frame::{AbiType, Signature};
use windlass_codegen::isa::{a64, x64};
use windlass_codegen::{Arch, CallConv, Environment, Flags};
use windlass_jit::JitRuntime;

fn x64_env() -> Environment {
    Environment::new(Arch::X64, CallConv::SystemV).unwrap()
}

fn a64_env() -> Environment {
    Environment::new(Arch::A64, CallConv::Aapcs64).unwrap()
}

#[cfg(target_arch = "x86_64")]
unsafe fn call0_i32(entry: *const u8) -> i32 {
    let f: extern "sysv64" fn() -> i32 = core::mem::transmute(entry);
    f()
}

#[cfg(target_arch = "x86_64")]
unsafe fn call1_i64(entry: *const u8, a: i64) -> i64 {
    let f: extern "sysv64" fn(i64) -> i64 = core::mem::transmute(entry);
    f(a)
}

#[cfg(target_arch = "x86_64")]
unsafe fn call2_i64(entry: *const u8, a: i64, b: i64) -> i64 {
    let f: extern "sysv64" fn(i64, i64) -> i64 = core::mem::transmute(entry);
    f(a, b)
}

// Scenario: identity return. `mov eax, 42; ret`.
#[test]
fn identity_return() {
    let mut asm = x64::Assembler::new();
    asm.mov_ri(x64::OperandSize::Size32, x64::regs::writable(x64::regs::rax()), 42)
        .unwrap();
    asm.ret().unwrap();
    let code = asm.finalize().unwrap();
    assert_eq!(code.bytes(), &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]);

    #[cfg(target_arch = "x86_64")]
    {
        let rt = JitRuntime::new(x64_env());
        let func = rt.add(&code).unwrap();
        assert_eq!(unsafe { call0_i32(func.entry()) }, 42);
    }
}

// Scenario: two-argument add. `mov rax, rdi; add rax, rsi; ret`.
#[test]
fn two_argument_add() {
    use x64::regs::{rax, rdi, rsi, writable};
    let mut asm = x64::Assembler::new();
    asm.mov_rr(x64::OperandSize::Size64, writable(rax()), rdi())
        .unwrap();
    asm.add_rr(x64::OperandSize::Size64, writable(rax()), rsi())
        .unwrap();
    asm.ret().unwrap();
    let code = asm.finalize().unwrap();
    assert_eq!(code.bytes(), &[0x48, 0x89, 0xF8, 0x48, 0x01, 0xF0, 0xC3]);

    #[cfg(target_arch = "x86_64")]
    {
        let rt = JitRuntime::new(x64_env());
        let func = rt.add(&code).unwrap();
        assert_eq!(unsafe { call2_i64(func.entry(), 40, 2) }, 42);
        assert_eq!(unsafe { call2_i64(func.entry(), -10, 25) }, 15);
    }
}

// Scenario: sum 1..=n with a short backward jump.
#[test]
fn short_backward_loop() {
    use x64::regs::{rax, rdi, writable};
    use x64::OperandSize::Size64;
    let mut asm = x64::Assembler::new();
    let top = asm.new_label();
    let done = asm.new_label();
    asm.mov_ri(x64::OperandSize::Size32, writable(rax()), 0).unwrap();
    asm.bind(top).unwrap();
    asm.test_rr(Size64, rdi(), rdi()).unwrap();
    asm.jcc(x64::CC::Z, done).unwrap();
    asm.add_rr(Size64, writable(rax()), rdi()).unwrap();
    asm.sub_ri(Size64, writable(rdi()), 1).unwrap();
    let jmp_at = asm.cur_offset() as usize;
    asm.jmp(top).unwrap();
    asm.bind(done).unwrap();
    asm.ret().unwrap();
    let code = asm.finalize().unwrap();

    // The backward jump is exactly two bytes and starts with the short
    // opcode.
    assert_eq!(code.bytes()[jmp_at], 0xEB);
    assert_eq!(code.bytes()[jmp_at + 2], 0xC3);

    #[cfg(target_arch = "x86_64")]
    {
        let rt = JitRuntime::new(x64_env());
        let func = rt.add(&code).unwrap();
        assert_eq!(unsafe { call1_i64(func.entry(), 10) }, 55);
        assert_eq!(unsafe { call1_i64(func.entry(), 100) }, 5050);
        assert_eq!(unsafe { call1_i64(func.entry(), 0) }, 0);
    }
}

// Scenario: AArch64 identity return. `movz w0, #0; ret`.
#[test]
fn a64_identity_return() {
    let mut asm = a64::Assembler::new();
    asm.movz(a64::OperandSize::Size32, a64::regs::writable(a64::regs::xreg(0)), 0, 0)
        .unwrap();
    asm.ret().unwrap();
    let code = asm.finalize().unwrap();
    let words: Vec<u32> = code
        .bytes()
        .chunks(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(words, vec![0x52800000, 0xD65F03C0]);

    #[cfg(target_arch = "aarch64")]
    {
        let rt = JitRuntime::new(a64_env());
        let func = rt.add(&code).unwrap();
        let f: extern "C" fn() -> i32 = unsafe { core::mem::transmute(func.entry()) };
        assert_eq!(f(), 0);
    }
}

// Scenario: forward conditional over padding; the jz takes the short form
// and its displacement equals the padding length.
#[test]
fn forward_conditional_over_padding() {
    use x64::regs::{rax, writable};
    use x64::OperandSize::Size64;
    let mut asm = x64::Assembler::new();
    let target = asm.new_label();
    asm.test_rr(Size64, rax(), rax()).unwrap();
    let jz_at = asm.cur_offset() as usize;
    asm.emit(&x64::Inst::JmpCond {
        cc: x64::CC::Z,
        target,
        opts: x64::InstOpts::FORCE_SHORT,
    })
    .unwrap();
    asm.nop().unwrap();
    asm.nop().unwrap();
    asm.bind(target).unwrap();
    asm.ret().unwrap();
    let code = asm.finalize().unwrap();
    assert_eq!(&code.bytes()[jz_at..jz_at + 2], &[0x74, 0x02]);
    assert_eq!(&code.bytes()[jz_at + 2..], &[0x90, 0x90, 0xC3]);
}

// Scenario: spill stress. 28 live values summed; 12 allocatable GPRs force
// spills, and the result still computes.
#[test]
fn spill_stress() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut c = compiler::x64::Compiler::new(&x64_env(), Flags::default()).unwrap();
    c.func(Signature::new(CallConv::SystemV).returning(AbiType::I64))
        .unwrap();
    let acc = c.new_gp_reg().unwrap();
    let values: Vec<_> = (0..28).map(|_| c.new_gp_reg().unwrap()).collect();
    for (i, &v) in values.iter().enumerate() {
        c.mov_ri(x64::OperandSize::Size64, v, (i + 1) as i64);
    }
    c.mov_ri(x64::OperandSize::Size64, acc, 0);
    for &v in &values {
        c.add_rr(x64::OperandSize::Size64, acc, v);
    }
    c.ret_value(x64::OperandSize::Size64, acc).unwrap();
    c.end_func().unwrap();
    let code = c.finalize().unwrap();

    // Evidence of spilling: a frame-relative store and load.
    let bytes = code.bytes();
    let modrm_rbp = |b: u8| b & 0xC7 == 0x45 || b & 0xC7 == 0x85;
    assert!(bytes
        .windows(2)
        .any(|w| (w[0] == 0xC7 || w[0] == 0x89) && modrm_rbp(w[1])));
    assert!(bytes
        .windows(2)
        .any(|w| (w[0] == 0x8B || w[0] == 0x03 || w[0] == 0x01) && modrm_rbp(w[1])));

    #[cfg(target_arch = "x86_64")]
    {
        let rt = JitRuntime::new(x64_env());
        let func = rt.add(&code).unwrap();
        assert_eq!(unsafe { call0_i32(func.entry()) }, 406);
    }
}

// The compiler pipeline on AArch64: sum the first argument down to zero.
#[test]
fn a64_compiled_loop() {
    use a64::OperandSize::Size64;
    let mut c = compiler::a64::Compiler::new(&a64_env(), Flags::default()).unwrap();
    c.func(
        Signature::new(CallConv::Aapcs64)
            .with_params(&[AbiType::I64])
            .returning(AbiType::I64),
    )
    .unwrap();
    let n = c.arg(0).unwrap();
    let sum = c.new_gp_reg().unwrap();
    c.mov_imm64(sum, 0);
    let top = c.new_label();
    let done = c.new_label();
    c.bind(top).unwrap();
    c.cbz(Size64, n, done);
    c.add_rrr(Size64, sum, sum, n);
    c.sub_imm(Size64, n, n, 1).unwrap();
    c.b(top);
    c.bind(done).unwrap();
    c.ret_value(Size64, sum).unwrap();
    c.end_func().unwrap();
    let code = c.finalize().unwrap();
    assert!(!code.is_empty());

    #[cfg(target_arch = "aarch64")]
    {
        let rt = JitRuntime::new(a64_env());
        let func = rt.add(&code).unwrap();
        let f: extern "C" fn(i64) -> i64 = unsafe { core::mem::transmute(func.entry()) };
        assert_eq!(f(10), 55);
        assert_eq!(f(100), 5050);
    }
}

// Absolute relocations: a movabs of a label resolves to the runtime
// address of embedded data.
#[test]
fn absolute_relocation_roundtrip() {
    use x64::regs::{rax, writable};
    let mut asm = x64::Assembler::new();
    let data = asm.new_label();
    asm.emit(&x64::Inst::MovRIAbs {
        dst: writable(rax()),
        target: data,
    })
    .unwrap();
    asm.load(
        x64::OperandSize::Size64,
        writable(rax()),
        x64::Amode::base(rax()),
    )
    .unwrap();
    asm.ret().unwrap();
    asm.bind(data).unwrap();
    asm.embed_u64(424242).unwrap();
    let code = asm.finalize().unwrap();
    assert_eq!(code.relocs().len(), 1);

    #[cfg(target_arch = "x86_64")]
    {
        let rt = JitRuntime::new(x64_env());
        let func = rt.add(&code).unwrap();
        assert_eq!(unsafe { call1_i64(func.entry(), 0) }, 424242);
    }
}

// RIP-relative addressing of embedded constants.
#[test]
fn rip_relative_constant_load() {
    use x64::regs::{rax, writable};
    let mut asm = x64::Assembler::new();
    let data = asm.new_label();
    asm.load(
        x64::OperandSize::Size64,
        writable(rax()),
        x64::Amode::rip(data),
    )
    .unwrap();
    asm.ret().unwrap();
    asm.align(8, 0x90).unwrap();
    asm.bind(data).unwrap();
    asm.embed_u64(777).unwrap();
    let code = asm.finalize().unwrap();

    #[cfg(target_arch = "x86_64")]
    {
        let rt = JitRuntime::new(x64_env());
        let func = rt.add(&code).unwrap();
        assert_eq!(unsafe { call1_i64(func.entry(), 0) }, 777);
    }
}

// The runtime cache and registry behave as specified regardless of the
// host architecture.
#[test]
fn runtime_cache_and_release() {
    let mut asm = x64::Assembler::new();
    asm.ret().unwrap();
    let code = asm.finalize().unwrap();

    let rt = JitRuntime::new(x64_env());
    let a = rt.add_cached("f", &code).unwrap();
    let b = rt.add_cached("f", &code).unwrap();
    assert_eq!(a.entry(), b.entry());
    assert_eq!(rt.outstanding(), 1);
    rt.release(a);
    assert_eq!(rt.outstanding(), 0);
}

// A failed finalize never reaches the runtime: the error carries every
// pending problem.
#[test]
fn unbound_labels_block_publication() {
    let mut asm = x64::Assembler::new();
    let missing = asm.new_label();
    let also_missing = asm.new_label();
    asm.jmp(missing).unwrap();
    asm.jmp(also_missing).unwrap();
    match asm.finalize() {
        Err(windlass_codegen::CodegenError::Finalize(errors)) => {
            assert_eq!(errors.len(), 2);
        }
        other => panic!("expected aggregate finalize error, got {other:?}"),
    }
}
