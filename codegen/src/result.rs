//! Result and error types for code generation.

use crate::buffer::CodeOffset;
use crate::labels::Label;

/// An error produced while assembling or compiling code.
///
/// Emission-time errors are returned by the call that caused them and leave
/// the partially-filled buffer in place for diagnostics; finalize-time
/// errors are collected into [`CodegenError::Finalize`] so that every
/// unresolved label or out-of-range displacement is reported in one pass.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodegenError {
    /// An allocation failed while growing a code buffer.
    #[error("out of memory while growing a code buffer")]
    OutOfMemory,

    /// Malformed input to a public API call.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The instruction id is not recognized, or the operand combination is
    /// not valid for it.
    #[error("invalid instruction")]
    InvalidInstruction,

    /// An operand has a size the instruction form does not accept.
    #[error("invalid operand size")]
    InvalidOperandSize,

    /// Two operands that must agree in size do not.
    #[error("operand size mismatch")]
    OperandSizeMismatch,

    /// An immediate does not fit the encoding width.
    #[error("immediate value out of range for the encoding")]
    InvalidImmediate,

    /// A malformed memory operand.
    #[error("invalid address")]
    InvalidAddress,

    /// A memory operand scale other than 1, 2, 4, or 8.
    #[error("invalid address scale")]
    InvalidAddressScale,

    /// A displacement that cannot be represented by the addressing form.
    #[error("invalid displacement")]
    InvalidDisplacement,

    /// A prefix applied to an instruction that does not allow it, e.g. LOCK
    /// on a non-lockable form.
    #[error("invalid prefix combination")]
    InvalidPrefixCombination,

    /// AH/BH/CH/DH combined with an operand that requires a REX prefix.
    #[error("high 8-bit register cannot be encoded together with a REX prefix")]
    InvalidUseOfGpbHi,

    /// A 64-bit general-purpose operand in a form that cannot carry REX.W.
    #[error("64-bit register is not encodable in this instruction form")]
    InvalidUseOfGpq,

    /// A label handle that does not belong to this label manager.
    #[error("invalid label")]
    InvalidLabel,

    /// `bind` called on a label that is already bound.
    #[error("label {} is already bound", .0.index())]
    LabelAlreadyBound(Label),

    /// A named label with this name already exists.
    #[error("label name is already defined")]
    LabelAlreadyDefined,

    /// A label name longer than the supported maximum.
    #[error("label name is too long")]
    LabelNameTooLong,

    /// A label that was referenced but never bound before finalize.
    #[error("label {} was never bound", .0.index())]
    UnboundLabel(Label),

    /// A branch target beyond the chosen encoding's range.
    #[error("displacement out of range at offset {at:#x}")]
    DisplacementOutOfRange {
        /// Offset of the fixup that could not be patched.
        at: CodeOffset,
    },

    /// A patch location past the end of the buffer.
    #[error("patch offset out of range")]
    OffsetOutOfRange,

    /// The register allocator cannot satisfy a virtual register, or a
    /// virtual register escaped into the emission path.
    #[error("illegal virtual register")]
    IllegalVirtReg,

    /// An instruction needs more concurrently-live fixed registers than
    /// the target provides.
    #[error("overlapping register constraints cannot be satisfied")]
    OverlappedRegs,

    /// One or more errors detected while resolving fixups at finalize.
    #[error("finalize failed with {} error(s), first: {}", .0.len(), .0[0])]
    Finalize(Vec<CodegenError>),
}

/// A convenient alias for a `Result` that uses [`CodegenError`].
pub type CodegenResult<T> = Result<T, CodegenError>;
