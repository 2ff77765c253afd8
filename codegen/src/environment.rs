//! Target environment descriptors and codegen flags.

use target_lexicon::{Architecture, OperatingSystem, Triple};

use crate::result::{CodegenError, CodegenResult};

/// A supported instruction-set architecture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    /// x86-64 (AMD64).
    X64,
    /// AArch64 (ARM64).
    A64,
}

/// Calling-convention identifier.
///
/// This affects frame layout, the argument/return register mapping, and
/// which registers the register allocator must treat as callee-saved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallConv {
    /// The System V AMD64 ABI (Linux, macOS, BSDs on x86-64).
    SystemV,
    /// The Windows x64 calling convention.
    WindowsFastcall,
    /// The AArch64 procedure call standard.
    Aapcs64,
}

impl CallConv {
    /// The default calling convention of `arch` on `os`.
    pub fn default_for(arch: Arch, os: OperatingSystem) -> CallConv {
        match arch {
            Arch::X64 => match os {
                OperatingSystem::Windows => CallConv::WindowsFastcall,
                _ => CallConv::SystemV,
            },
            Arch::A64 => CallConv::Aapcs64,
        }
    }

    /// Whether this convention is usable on `arch`.
    pub fn is_valid_for(self, arch: Arch) -> bool {
        match self {
            CallConv::SystemV | CallConv::WindowsFastcall => arch == Arch::X64,
            CallConv::Aapcs64 => arch == Arch::A64,
        }
    }
}

impl core::fmt::Display for CallConv {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.write_str(match self {
            CallConv::SystemV => "systemv",
            CallConv::WindowsFastcall => "windows_fastcall",
            CallConv::Aapcs64 => "aapcs64",
        })
    }
}

/// Byte order of the target. Both supported targets are little-endian; the
/// field exists so embedders can sanity-check a descriptor they received.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endianness {
    Little,
}

/// An immutable description of the compilation target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Environment {
    arch: Arch,
    call_conv: CallConv,
}

impl Environment {
    /// Create an environment from its parts.
    pub fn new(arch: Arch, call_conv: CallConv) -> CodegenResult<Environment> {
        if !call_conv.is_valid_for(arch) {
            return Err(CodegenError::InvalidArgument(
                "calling convention does not match architecture",
            ));
        }
        Ok(Environment { arch, call_conv })
    }

    /// The environment of the machine this library is running on, or `None`
    /// when the host is not a supported architecture.
    pub fn host() -> Option<Environment> {
        let triple = Triple::host();
        let arch = match triple.architecture {
            Architecture::X86_64 => Arch::X64,
            Architecture::Aarch64(_) => Arch::A64,
            _ => return None,
        };
        let call_conv = CallConv::default_for(arch, triple.operating_system);
        Some(Environment { arch, call_conv })
    }

    pub fn arch(self) -> Arch {
        self.arch
    }

    pub fn call_conv(self) -> CallConv {
        self.call_conv
    }

    /// Pointer width in bytes. Both supported targets are 64-bit.
    pub fn pointer_bytes(self) -> u8 {
        8
    }

    pub fn endianness(self) -> Endianness {
        Endianness::Little
    }
}

/// When the frame emitter saves the callee-saved vector registers of
/// conventions that have them (XMM6..XMM15 on Win64).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VectorSavePolicy {
    /// Save only the registers the allocator reports as used, per the ABI
    /// (callee-saved iff clobbered).
    #[default]
    UsedOnly,
    /// Save the full callee-saved vector set unconditionally.
    SaveAll,
}

/// Tunable code-generation behavior, shared by assemblers and builders.
///
/// Built with chained setters and then treated as immutable:
///
/// ```
/// use windlass_codegen::{Flags, environment::VectorSavePolicy};
///
/// let flags = Flags::new()
///     .opt_short_branches(false)
///     .vector_save_policy(VectorSavePolicy::SaveAll);
/// assert!(!flags.opt_short_branches);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct Flags {
    /// Select the 2-byte x86-64 branch forms when a bound target is in
    /// range. Enabled by default; disable to force every branch long.
    pub opt_short_branches: bool,
    /// Maintain a frame pointer in compiled functions. Only `true` is
    /// currently honored; spill slots are addressed frame-relative.
    pub preserve_frame_pointer: bool,
    /// Callee-saved vector register save policy (Win64).
    pub vector_save_policy: VectorSavePolicy,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            opt_short_branches: true,
            preserve_frame_pointer: true,
            vector_save_policy: VectorSavePolicy::default(),
        }
    }
}

impl Flags {
    pub fn new() -> Flags {
        Flags::default()
    }

    /// Enable or disable short-form branch selection.
    pub fn opt_short_branches(mut self, enable: bool) -> Flags {
        self.opt_short_branches = enable;
        self
    }

    /// Enable or disable frame-pointer preservation.
    pub fn preserve_frame_pointer(mut self, enable: bool) -> Flags {
        self.preserve_frame_pointer = enable;
        self
    }

    /// Choose how callee-saved vector registers are preserved.
    pub fn vector_save_policy(mut self, policy: VectorSavePolicy) -> Flags {
        self.vector_save_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_conv_arch_agreement() {
        assert!(Environment::new(Arch::X64, CallConv::SystemV).is_ok());
        assert!(Environment::new(Arch::A64, CallConv::Aapcs64).is_ok());
        assert!(Environment::new(Arch::A64, CallConv::SystemV).is_err());
        assert!(Environment::new(Arch::X64, CallConv::Aapcs64).is_err());
    }

    #[test]
    fn defaults() {
        assert_eq!(
            CallConv::default_for(Arch::X64, OperatingSystem::Windows),
            CallConv::WindowsFastcall
        );
        assert_eq!(
            CallConv::default_for(Arch::X64, OperatingSystem::Linux),
            CallConv::SystemV
        );
        assert_eq!(
            CallConv::default_for(Arch::A64, OperatingSystem::Linux),
            CallConv::Aapcs64
        );
        let flags = Flags::new();
        assert!(flags.opt_short_branches);
        assert_eq!(flags.vector_save_policy, VectorSavePolicy::UsedOnly);
    }

    #[test]
    fn flag_setters_chain() {
        let flags = Flags::new()
            .opt_short_branches(false)
            .preserve_frame_pointer(true)
            .vector_save_policy(VectorSavePolicy::SaveAll);
        assert!(!flags.opt_short_branches);
        assert!(flags.preserve_frame_pointer);
        assert_eq!(flags.vector_save_policy, VectorSavePolicy::SaveAll);
    }
}
