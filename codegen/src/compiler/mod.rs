//! The compiler layer: an instruction-list builder over virtual registers.
//!
//! A [`Builder`] records nodes (instructions, label binds, alignment, data,
//! function boundaries) in program order. `finalize` runs the linear-scan
//! register allocator over the recorded virtual registers, rewrites every
//! operand to a physical register or a frame-relative spill slot, emits the
//! calling-convention frame, and serializes the whole list through the
//! architecture's assembler.
//!
//! The type parameter is the target's instruction enum; the per-target
//! front ends ([`x64::Compiler`], [`a64::Compiler`]) add mnemonic methods
//! and the `finalize` pipeline.

pub mod a64;
pub mod frame;
pub mod node;
pub mod regalloc;
pub mod x64;


use crate::environment::{CallConv, Environment, Flags};
use crate::labels::{Label, LabelManager};
use crate::reg::{Reg, RegClass};
use crate::result::{CodegenError, CodegenResult};

use frame::Signature;
use node::{AlignMode, Node, NodeList};

/// Upper bound on virtual registers per builder.
const MAX_VREGS: usize = 1 << 20;

/// The architecture-independent part of a compiler front end.
pub struct Builder<I> {
    pub(crate) flags: Flags,
    pub(crate) call_conv: CallConv,
    pub(crate) nodes: NodeList<I>,
    pub(crate) labels: LabelManager,
    pub(crate) vreg_classes: Vec<RegClass>,
    pub(crate) sig: Option<Signature>,
    pub(crate) arg_vregs: Vec<Reg>,
    pub(crate) func_open: bool,
}

impl<I> Builder<I> {
    pub(crate) fn new_inner(env: &Environment, flags: Flags) -> Builder<I> {
        Builder {
            flags,
            call_conv: env.call_conv(),
            nodes: NodeList::new(),
            labels: LabelManager::new(),
            vreg_classes: Vec::new(),
            sig: None,
            arg_vregs: Vec::new(),
            func_open: false,
        }
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.new_label()
    }

    pub fn new_named_label(&mut self, name: &str) -> CodegenResult<Label> {
        self.labels.new_named_label(name)
    }

    pub fn label_by_name(&self, name: &str) -> Option<Label> {
        self.labels.label_by_name(name)
    }

    /// Record a label-bind node; the label receives its offset during
    /// serialization.
    pub fn bind(&mut self, label: Label) -> CodegenResult<()> {
        if !self.labels.is_valid(label) {
            return Err(CodegenError::InvalidLabel);
        }
        self.nodes.push_back(Node::Label(label));
        Ok(())
    }

    /// Record an alignment directive.
    pub fn align(&mut self, mode: AlignMode, alignment: u32) -> CodegenResult<()> {
        if !alignment.is_power_of_two() {
            return Err(CodegenError::InvalidArgument(
                "alignment must be a power of two",
            ));
        }
        self.nodes.push_back(Node::Align { mode, alignment });
        Ok(())
    }

    /// Record verbatim data bytes.
    pub fn embed_data(&mut self, bytes: &[u8], item_size: u8) {
        self.nodes.push_back(Node::Data {
            bytes: bytes.to_vec(),
            item_size,
        });
    }

    /// Record a comment node; ignored at serialization.
    pub fn comment(&mut self, text: &str) {
        self.nodes.push_back(Node::Comment(text.to_owned()));
    }

    /// A fresh general-purpose virtual register.
    pub fn new_gp_reg(&mut self) -> CodegenResult<Reg> {
        self.new_vreg(RegClass::Gp)
    }

    /// A fresh vector virtual register.
    pub fn new_vec_reg(&mut self) -> CodegenResult<Reg> {
        self.new_vreg(RegClass::Vec)
    }

    fn new_vreg(&mut self, class: RegClass) -> CodegenResult<Reg> {
        if self.vreg_classes.len() >= MAX_VREGS {
            return Err(CodegenError::IllegalVirtReg);
        }
        let index = self.vreg_classes.len() as u32;
        self.vreg_classes.push(class);
        Ok(Reg::virtual_reg(class, index))
    }

    /// Open a function: records the frame prologue position and creates one
    /// virtual register per ABI argument.
    pub fn func(&mut self, sig: Signature) -> CodegenResult<()> {
        self.func_inner(sig, None)
    }

    /// [`Builder::func`] with a diagnostic name attached to the node.
    pub fn func_named(&mut self, sig: Signature, name: &str) -> CodegenResult<()> {
        self.func_inner(sig, Some(name.to_owned()))
    }

    fn func_inner(&mut self, sig: Signature, name: Option<String>) -> CodegenResult<()> {
        if self.func_open || self.sig.is_some() {
            return Err(CodegenError::InvalidArgument(
                "a builder compiles exactly one function",
            ));
        }
        if sig.call_conv != self.call_conv {
            return Err(CodegenError::InvalidArgument(
                "signature calling convention does not match the environment",
            ));
        }
        let mut arg_vregs = Vec::with_capacity(sig.params.len());
        for param in &sig.params {
            let class = if param.is_float() {
                RegClass::Vec
            } else {
                RegClass::Gp
            };
            arg_vregs.push(self.new_vreg(class)?);
        }
        self.nodes.push_back(Node::FuncBegin {
            sig: sig.clone(),
            name,
        });
        self.nodes.push_back(Node::Args {
            vregs: arg_vregs.clone(),
        });
        self.arg_vregs = arg_vregs;
        self.sig = Some(sig);
        self.func_open = true;
        Ok(())
    }

    /// The virtual register holding ABI argument `index`.
    pub fn arg(&self, index: usize) -> CodegenResult<Reg> {
        self.arg_vregs
            .get(index)
            .copied()
            .ok_or(CodegenError::InvalidArgument("argument index out of range"))
    }

    /// Record a return: the epilogue plus the return instruction.
    pub fn ret(&mut self) -> CodegenResult<()> {
        if !self.func_open {
            return Err(CodegenError::InvalidArgument("ret outside of a function"));
        }
        self.nodes.push_back(Node::Ret);
        Ok(())
    }

    /// Close the open function.
    pub fn end_func(&mut self) -> CodegenResult<()> {
        if !self.func_open {
            return Err(CodegenError::InvalidArgument("no function is open"));
        }
        self.nodes.push_back(Node::FuncEnd);
        self.func_open = false;
        Ok(())
    }

    /// Append a raw instruction node.
    pub fn inst(&mut self, inst: I) {
        self.nodes.push_back(Node::Inst(inst));
    }

    pub(crate) fn check_ready_to_finalize(&self) -> CodegenResult<()> {
        if self.func_open {
            return Err(CodegenError::InvalidArgument(
                "finalize called with an open function",
            ));
        }
        if self.sig.is_none() {
            return Err(CodegenError::InvalidArgument(
                "finalize called without a function",
            ));
        }
        Ok(())
    }
}
