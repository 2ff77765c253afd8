//! Function signatures and frame layout.

use crate::environment::CallConv;
use crate::result::{CodegenError, CodegenResult};

/// A value type at an ABI boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbiType {
    I32,
    I64,
    F32,
    F64,
}

impl AbiType {
    /// Whether this type is passed in vector registers.
    pub fn is_float(self) -> bool {
        matches!(self, AbiType::F32 | AbiType::F64)
    }
}

/// The ABI-visible shape of a compiled function.
#[derive(Clone, Debug)]
pub struct Signature {
    pub params: Vec<AbiType>,
    pub ret: Option<AbiType>,
    pub call_conv: CallConv,
}

impl Signature {
    pub fn new(call_conv: CallConv) -> Signature {
        Signature {
            params: Vec::new(),
            ret: None,
            call_conv,
        }
    }

    pub fn with_params(mut self, params: &[AbiType]) -> Signature {
        self.params = params.to_vec();
        self
    }

    pub fn returning(mut self, ret: AbiType) -> Signature {
        self.ret = Some(ret);
        self
    }
}

/// General-purpose argument registers of `cc`, in positional order.
pub fn gp_arg_regs(cc: CallConv) -> &'static [u8] {
    match cc {
        // rdi, rsi, rdx, rcx, r8, r9.
        CallConv::SystemV => &[7, 6, 2, 1, 8, 9],
        // rcx, rdx, r8, r9.
        CallConv::WindowsFastcall => &[1, 2, 8, 9],
        // x0..x7.
        CallConv::Aapcs64 => &[0, 1, 2, 3, 4, 5, 6, 7],
    }
}

/// Vector argument registers of `cc`.
pub fn vec_arg_regs(cc: CallConv) -> &'static [u8] {
    match cc {
        CallConv::SystemV => &[0, 1, 2, 3, 4, 5, 6, 7],
        CallConv::WindowsFastcall => &[0, 1, 2, 3],
        CallConv::Aapcs64 => &[0, 1, 2, 3, 4, 5, 6, 7],
    }
}

/// The general-purpose return register.
pub fn gp_ret_reg(cc: CallConv) -> u8 {
    match cc {
        CallConv::SystemV | CallConv::WindowsFastcall => 0, // rax
        CallConv::Aapcs64 => 0,                             // x0
    }
}

/// The physical register carrying argument `index` of `sig`, with its
/// class, or an error when the argument would be passed on the stack
/// (unsupported).
pub fn arg_location(sig: &Signature, index: usize) -> CodegenResult<(bool, u8)> {
    let ty = *sig
        .params
        .get(index)
        .ok_or(CodegenError::InvalidArgument("argument index out of range"))?;
    match sig.call_conv {
        // Win64 argument slots are positional across both register files.
        CallConv::WindowsFastcall => {
            let gp = gp_arg_regs(sig.call_conv);
            let vec = vec_arg_regs(sig.call_conv);
            if index >= gp.len() {
                return Err(CodegenError::InvalidArgument(
                    "stack-passed arguments are not supported",
                ));
            }
            if ty.is_float() {
                Ok((true, vec[index]))
            } else {
                Ok((false, gp[index]))
            }
        }
        CallConv::SystemV | CallConv::Aapcs64 => {
            let regs = if ty.is_float() {
                vec_arg_regs(sig.call_conv)
            } else {
                gp_arg_regs(sig.call_conv)
            };
            let position = sig.params[..index]
                .iter()
                .filter(|p| p.is_float() == ty.is_float())
                .count();
            if position >= regs.len() {
                return Err(CodegenError::InvalidArgument(
                    "stack-passed arguments are not supported",
                ));
            }
            Ok((ty.is_float(), regs[position]))
        }
    }
}

/// Derived stack-frame layout for one function.
///
/// Spill slots are addressed frame-base-relative; `local_bytes` is the
/// amount subtracted from the stack pointer after the preserved-register
/// saves, already padded to keep the ABI's 16-byte alignment at call sites.
#[derive(Clone, Debug)]
pub struct FrameDescriptor {
    pub call_conv: CallConv,
    /// Callee-saved GPRs to preserve, in save order (hardware encodings).
    pub preserved_gp: Vec<u8>,
    /// Callee-saved vector registers to preserve.
    pub preserved_vec: Vec<u8>,
    /// Win64 home/shadow space reserved above the outgoing stack.
    pub shadow_bytes: u32,
    /// Raw spill-slot area size.
    pub spill_bytes: u32,
    /// Total stack-pointer adjustment after the saves.
    pub local_bytes: u32,
}

impl FrameDescriptor {
    /// Compute the frame for a function with the given clobbers and spill
    /// area.
    pub fn compute(
        call_conv: CallConv,
        used_callee_gp: &[u8],
        used_callee_vec: &[u8],
        spill_bytes: u32,
    ) -> FrameDescriptor {
        let shadow_bytes = match call_conv {
            CallConv::WindowsFastcall => 32,
            _ => 0,
        };
        let vec_save_bytes = match call_conv {
            // XMM saves take 16 bytes each; AAPCS64 preserves only the low
            // 64 bits of v8..v15.
            CallConv::WindowsFastcall => 16 * used_callee_vec.len() as u32,
            CallConv::Aapcs64 => 8 * used_callee_vec.len() as u32,
            CallConv::SystemV => 0,
        };
        let raw = spill_bytes + vec_save_bytes + shadow_bytes;
        let mut local_bytes = raw.next_multiple_of(16);
        match call_conv {
            CallConv::SystemV | CallConv::WindowsFastcall => {
                // After `push rbp` the stack is 16-aligned; each preserved
                // push misaligns by 8, so pad when the count is odd.
                if used_callee_gp.len() % 2 == 1 {
                    local_bytes += 8;
                }
            }
            CallConv::Aapcs64 => {
                // Pair saves keep SP 16-aligned throughout.
            }
        }
        FrameDescriptor {
            call_conv,
            preserved_gp: used_callee_gp.to_vec(),
            preserved_vec: used_callee_vec.to_vec(),
            shadow_bytes,
            spill_bytes,
            local_bytes,
        }
    }

    /// Bytes occupied below the frame base by the preserved-GPR saves.
    pub fn gp_save_bytes(&self) -> u32 {
        match self.call_conv {
            CallConv::SystemV | CallConv::WindowsFastcall => 8 * self.preserved_gp.len() as u32,
            // stp pairs, padded to a full pair.
            CallConv::Aapcs64 => 16 * ((self.preserved_gp.len() as u32).div_ceil(2)),
        }
    }

    /// Frame-base-relative byte offset (positive, to be negated) of the
    /// spill slot starting at `slot_off` with the given size.
    pub fn slot_offset(&self, slot_off: u32, size: u32) -> u32 {
        self.gp_save_bytes() + slot_off + size
    }

    /// Frame-base-relative byte offset of the `index`-th preserved vector
    /// register's save area.
    pub fn vec_save_offset(&self, index: u32) -> u32 {
        let size = match self.call_conv {
            CallConv::Aapcs64 => 8,
            _ => 16,
        };
        self.gp_save_bytes() + self.spill_bytes + size * index + size
    }
}
