//! Deferred byte patches: label fixups and relocations.
//!
//! A branch to a not-yet-bound label is emitted in its long form with a
//! zeroed displacement field, and a [`Fixup`] records where and how to patch
//! once the label's offset is known. Absolute 64-bit references cannot be
//! resolved until the code has a runtime address; those become [`AbsReloc`]
//! entries in the [`FinalizedCode`] and are patched by the runtime.

use crate::buffer::{CodeBuffer, CodeOffset};
use crate::labels::Label;
use crate::result::{CodegenError, CodegenResult};

/// How a fixup location consumes a label offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelUse {
    /// x86-64: signed 8-bit displacement relative to the end of the field.
    Rel8,
    /// x86-64: signed 32-bit displacement relative to the end of the field.
    Rel32,
    /// A 64-bit absolute address slot, resolved at runtime placement.
    Abs64,
    /// AArch64 B/BL: 26-bit signed word offset relative to the instruction.
    Branch26,
    /// AArch64 B.cond/CBZ/CBNZ: 19-bit signed word offset.
    Branch19,
    /// AArch64 LDR (literal): 19-bit signed word offset.
    Ldr19,
    /// AArch64 ADR: 21-bit signed byte offset.
    Adr21,
    /// AArch64 ADRP: 21-bit signed 4 KiB-page offset. Valid only because
    /// the runtime places code at a page-aligned base, so page deltas
    /// computed from buffer offsets survive placement.
    Adrp21,
}

impl LabelUse {
    /// Size in bytes of the patched field.
    pub fn patch_size(self) -> u32 {
        match self {
            LabelUse::Rel8 => 1,
            LabelUse::Abs64 => 8,
            _ => 4,
        }
    }

    fn page(offset: i64) -> i64 {
        offset & !0xfff
    }

    /// Whether a displacement of `disp` bytes is encodable by this use kind.
    pub fn supports_displacement(self, disp: i64) -> bool {
        match self {
            LabelUse::Rel8 => i8::try_from(disp).is_ok(),
            LabelUse::Rel32 => i32::try_from(disp).is_ok(),
            LabelUse::Abs64 => true,
            LabelUse::Branch26 => disp & 3 == 0 && (-(1 << 27)..(1 << 27)).contains(&disp),
            LabelUse::Branch19 | LabelUse::Ldr19 => {
                disp & 3 == 0 && (-(1 << 20)..(1 << 20)).contains(&disp)
            }
            LabelUse::Adr21 => (-(1 << 20)..(1 << 20)).contains(&disp),
            LabelUse::Adrp21 => {
                let pages = disp >> 12;
                (-(1 << 20)..(1 << 20)).contains(&pages)
            }
        }
    }

    /// The displacement this kind would encode for a field at `at` and a
    /// label bound at `target`.
    ///
    /// x86-64 displacements are relative to the end of the displacement
    /// field (which ends the instruction for every form emitted here);
    /// AArch64 displacements are relative to the instruction word itself.
    pub fn displacement(self, at: CodeOffset, target: CodeOffset) -> i64 {
        match self {
            LabelUse::Rel8 | LabelUse::Rel32 => {
                i64::from(target) - (i64::from(at) + i64::from(self.patch_size()))
            }
            LabelUse::Adrp21 => Self::page(i64::from(target)) - Self::page(i64::from(at)),
            _ => i64::from(target) - i64::from(at),
        }
    }

    /// Patch the field at `at` in `buf` to refer to `target`.
    ///
    /// For the AArch64 kinds the offset bits are or'ed into the existing
    /// instruction word, which was emitted with a zeroed offset field.
    pub fn patch(self, buf: &mut CodeBuffer, at: CodeOffset, target: CodeOffset) -> CodegenResult<()> {
        let disp = self.displacement(at, target);
        if !self.supports_displacement(disp) {
            return Err(CodegenError::DisplacementOutOfRange { at });
        }
        match self {
            LabelUse::Rel8 => buf.patch1(at, disp as i8 as u8),
            LabelUse::Rel32 => {
                // The pre-patch field holds an addend: zero for branches,
                // minus the trailing-immediate length for RIP-relative
                // operands whose displacement is measured from the end of
                // the instruction rather than the end of the field.
                let addend = buf.read4(at)? as i32;
                let value = (disp as i32).wrapping_add(addend);
                buf.patch4(at, value as u32)
            }
            LabelUse::Abs64 => buf.patch8(at, u64::from(target)),
            LabelUse::Branch26 => {
                let insn = buf.read4(at)?;
                let field = ((disp >> 2) as u32) & 0x03ff_ffff;
                buf.patch4(at, insn | field)
            }
            LabelUse::Branch19 | LabelUse::Ldr19 => {
                let insn = buf.read4(at)?;
                let field = (((disp >> 2) as u32) & 0x7ffff) << 5;
                buf.patch4(at, insn | field)
            }
            LabelUse::Adr21 => {
                let insn = buf.read4(at)?;
                let disp = disp as u32;
                let immlo = (disp & 3) << 29;
                let immhi = (((disp >> 2) as u32) & 0x7ffff) << 5;
                buf.patch4(at, insn | immlo | immhi)
            }
            LabelUse::Adrp21 => {
                let insn = buf.read4(at)?;
                let pages = (disp >> 12) as u32;
                let immlo = (pages & 3) << 29;
                let immhi = ((pages >> 2) & 0x7ffff) << 5;
                buf.patch4(at, insn | immlo | immhi)
            }
        }
    }
}

/// Resolve every pending fixup against the bound labels, collecting
/// absolute relocations for the runtime. Shared by both assemblers'
/// `finalize`.
pub(crate) fn resolve_fixups(
    buf: &mut CodeBuffer,
    labels: &crate::labels::LabelManager,
    fixups: Vec<Fixup>,
) -> Result<Vec<AbsReloc>, CodegenError> {
    let mut errors = Vec::new();
    let mut relocs = Vec::new();
    log::trace!("finalize: {} fixup(s) pending", fixups.len());
    for fixup in fixups {
        match labels.offset_of(fixup.label) {
            Ok(Some(target)) => {
                if let LabelUse::Abs64 = fixup.kind {
                    relocs.push(AbsReloc {
                        at: fixup.at,
                        target,
                    });
                }
                if let Err(err) = fixup.kind.patch(buf, fixup.at, target) {
                    log::trace!("finalize: fixup at {:#x} failed: {err}", fixup.at);
                    errors.push(err);
                }
            }
            Ok(None) => errors.push(CodegenError::UnboundLabel(fixup.label)),
            Err(err) => errors.push(err),
        }
    }
    if !errors.is_empty() {
        return Err(CodegenError::Finalize(errors));
    }
    Ok(relocs)
}

/// A pending use of a label, to be resolved at finalize.
#[derive(Clone, Copy, Debug)]
pub struct Fixup {
    /// Offset of the field to patch.
    pub at: CodeOffset,
    /// The referenced label.
    pub label: Label,
    /// How the field consumes the label offset.
    pub kind: LabelUse,
}

/// An absolute relocation surviving into [`FinalizedCode`]: the 8 bytes at
/// `at` must become `base + target` once `base` is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AbsReloc {
    /// Offset of the 64-bit slot.
    pub at: CodeOffset,
    /// Code offset of the referenced position.
    pub target: CodeOffset,
}

/// Immutable output of a successful `finalize`.
#[derive(Clone, Debug)]
pub struct FinalizedCode {
    bytes: Vec<u8>,
    relocs: Vec<AbsReloc>,
}

impl FinalizedCode {
    pub(crate) fn new(bytes: Vec<u8>, relocs: Vec<AbsReloc>) -> Self {
        Self { bytes, relocs }
    }

    /// The machine code bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total code size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Absolute relocations the runtime must apply at placement.
    pub fn relocs(&self) -> &[AbsReloc] {
        &self.relocs
    }
}
