//! Windlass JIT runtime: executable placement for `windlass-codegen`
//! output.
//!
//! [`JitRuntime::add`] copies finalized code into a fresh W^X mapping,
//! applies absolute relocations, flips the pages executable (flushing the
//! instruction cache on AArch64), and returns a [`JitFunction`] handle
//! owning the mapping. The runtime keeps a registry of outstanding
//! functions and a keyed cache whose hits never allocate.
//!
//! ```no_run
//! use windlass_codegen::isa::x64::{self, OperandSize};
//! use windlass_codegen::isa::x64::regs::{rax, writable};
//! use windlass_codegen::Environment;
//! use windlass_jit::JitRuntime;
//!
//! let env = Environment::host().expect("supported host");
//! let mut asm = x64::Assembler::new();
//! asm.mov_ri(OperandSize::Size32, writable(rax()), 42)?;
//! asm.ret()?;
//! let code = asm.finalize()?;
//!
//! let runtime = JitRuntime::new(env);
//! let func = runtime.add(&code)?;
//! let entry: extern "sysv64" fn() -> i32 = unsafe { core::mem::transmute(func.entry()) };
//! assert_eq!(entry(), 42);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod memory;
mod runtime;

pub use memory::ExecutableMemory;
pub use runtime::{JitFunction, JitRuntime};

/// An error from the JIT runtime.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    /// The OS refused to map anonymous memory.
    #[error("failed to map executable memory: {0}")]
    FailedToMapExecutableMemory(String),

    /// The OS refused to change the mapping's protection.
    #[error("failed to protect memory: {0}")]
    FailedToProtectMemory(String),

    /// `add` was called with an empty code buffer.
    #[error("cannot publish empty code")]
    EmptyCode,
}
