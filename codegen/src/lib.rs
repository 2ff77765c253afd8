//! Windlass code generator: runtime machine-code emission for x86-64 and
//! AArch64.
//!
//! The crate is a stack of four layers:
//!
//! - per-ISA **encoders** ([`isa::x64::inst`], [`isa::a64::inst`]) turning
//!   one instruction into its exact byte sequence;
//! - per-ISA **assemblers** ([`isa::x64::Assembler`],
//!   [`isa::a64::Assembler`]) that own a [`buffer::CodeBuffer`], track
//!   [`labels::Label`]s, select short branch forms, and resolve forward
//!   references at finalize;
//! - the **compiler** layer ([`compiler`]) recording an instruction list
//!   over virtual registers, running a linear-scan register allocator, and
//!   serializing the result through an assembler with a full function
//!   frame;
//! - shared plumbing: [`fixup`] (deferred patches and relocations),
//!   [`environment`] (target descriptors), and [`result`] (the error
//!   taxonomy).
//!
//! Executable placement lives in the companion `windlass-jit` crate; this
//! crate only produces bytes and relocation entries.
//!
//! ```
//! use windlass_codegen::isa::x64::{self, OperandSize};
//! use windlass_codegen::isa::x64::regs::{rax, writable};
//!
//! let mut asm = x64::Assembler::new();
//! asm.mov_ri(OperandSize::Size32, writable(rax()), 42)?;
//! asm.ret()?;
//! let code = asm.finalize()?;
//! assert_eq!(code.bytes(), &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]);
//! # Ok::<(), windlass_codegen::CodegenError>(())
//! ```

pub mod buffer;
pub mod compiler;
pub mod environment;
pub mod fixup;
pub mod isa;
pub mod labels;
pub mod reg;
pub mod result;

pub use buffer::{CodeBuffer, CodeOffset};
pub use environment::{Arch, CallConv, Environment, Flags, VectorSavePolicy};
pub use fixup::{AbsReloc, FinalizedCode};
pub use labels::{Label, LabelManager};
pub use reg::{Reg, RegClass, Writable};
pub use result::{CodegenError, CodegenResult};
