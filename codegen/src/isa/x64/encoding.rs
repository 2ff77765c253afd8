//! x86-64 encoding primitives: REX and VEX prefixes, ModR/M, SIB, and
//! displacement classification.

use crate::buffer::CodeBuffer;
use crate::result::CodegenResult;

/// Encode the ModR/M byte.
#[inline]
pub fn encode_modrm(m0d: u8, enc_reg: u8, enc_rm: u8) -> u8 {
    debug_assert!(m0d < 4);
    ((m0d & 3) << 6) | ((enc_reg & 7) << 3) | (enc_rm & 7)
}

/// Encode the SIB byte (scale-index-base).
#[inline]
pub fn encode_sib(scale: u8, enc_index: u8, enc_base: u8) -> u8 {
    debug_assert!(scale < 4);
    ((scale & 3) << 6) | ((enc_index & 7) << 3) | (enc_base & 7)
}

/// A REX prefix under construction.
///
/// `w` selects 64-bit operand size; `force` requires the 0x40 byte even
/// when all of W/R/X/B are clear, which is how the low byte halves of
/// RSP/RBP/RSI/RDI are reached.
#[derive(Clone, Copy, Debug)]
pub struct Rex {
    w: bool,
    force: bool,
}

impl Rex {
    /// A REX prefix with the W bit set (64-bit operand size).
    pub fn w() -> Rex {
        Rex { w: true, force: false }
    }

    /// A REX prefix with the W bit clear.
    pub fn clear_w() -> Rex {
        Rex { w: false, force: false }
    }

    /// Require emission of the prefix byte even if it would be 0x40.
    pub fn force(mut self) -> Rex {
        self.force = true;
        self
    }

    /// Whether any prefix byte will be emitted for the given extension bits.
    pub fn is_emitted(self, r: u8, x: u8, b: u8) -> bool {
        self.force || self.w || (r | x | b) & 0x8 != 0
    }

    fn byte(self, r: u8, x: u8, b: u8) -> u8 {
        0x40 | (u8::from(self.w) << 3) | (((r >> 3) & 1) << 2) | (((x >> 3) & 1) << 1) | ((b >> 3) & 1)
    }

    /// Emit for a form with only an `rm` register (opcode-embedded or /digit).
    pub fn emit_one_op(self, buf: &mut CodeBuffer, enc_e: u8) -> CodegenResult<()> {
        let byte = self.byte(0, 0, enc_e);
        if byte != 0x40 || self.force {
            buf.put1(byte)?;
        }
        Ok(())
    }

    /// Emit for a reg + rm form.
    pub fn emit_two_op(self, buf: &mut CodeBuffer, enc_g: u8, enc_e: u8) -> CodegenResult<()> {
        let byte = self.byte(enc_g, 0, enc_e);
        if byte != 0x40 || self.force {
            buf.put1(byte)?;
        }
        Ok(())
    }

    /// Emit for a reg + index + base form.
    pub fn emit_three_op(
        self,
        buf: &mut CodeBuffer,
        enc_g: u8,
        enc_index: u8,
        enc_base: u8,
    ) -> CodegenResult<()> {
        let byte = self.byte(enc_g, enc_index, enc_base);
        if byte != 0x40 || self.force {
            buf.put1(byte)?;
        }
        Ok(())
    }
}

/// Classified memory-operand displacement: none, one byte, or four bytes.
/// Doubles as the source of the ModR/M `mod` field for register-indirect
/// forms.
#[derive(Clone, Copy, Debug)]
pub enum Disp {
    None,
    D8(i8),
    D32(i32),
}

impl Disp {
    /// Pick the shortest encodable form of `value`.
    pub fn classify(value: i32) -> Disp {
        if value == 0 {
            Disp::None
        } else {
            match i8::try_from(value) {
                Ok(v) => Disp::D8(v),
                Err(_) => Disp::D32(value),
            }
        }
    }

    /// Turn a zero displacement into an explicit one-byte zero. Required
    /// when the base register is RBP or R13, whose no-displacement encoding
    /// means RIP-relative instead.
    pub fn force_disp8(&mut self) {
        if let Disp::None = self {
            *self = Disp::D8(0);
        }
    }

    /// The ModR/M `mod` field this displacement selects.
    pub fn m0d(self) -> u8 {
        match self {
            Disp::None => 0b00,
            Disp::D8(_) => 0b01,
            Disp::D32(_) => 0b10,
        }
    }

    /// Append the displacement bytes.
    pub fn emit(self, buf: &mut CodeBuffer) -> CodegenResult<()> {
        match self {
            Disp::None => Ok(()),
            Disp::D8(v) => buf.put1(v as u8),
            Disp::D32(v) => buf.put4(v as u32),
        }
    }
}

/// VEX `pp` field values (implied legacy prefix).
pub mod vex_pp {
    pub const NONE: u8 = 0b00;
    pub const P66: u8 = 0b01;
    pub const PF3: u8 = 0b10;
    pub const PF2: u8 = 0b11;
}

/// VEX `mmmmm` field values (implied opcode map).
pub mod vex_map {
    pub const M0F: u8 = 0b01;
    pub const M0F38: u8 = 0b10;
    pub const M0F3A: u8 = 0b11;
}

/// A VEX prefix. The 2-byte form is chosen whenever X, B, W, and the map
/// allow it; otherwise the 3-byte form is used.
#[derive(Clone, Copy, Debug)]
pub struct Vex {
    /// HW encoding of the ModR/M `reg` operand (for the inverted R bit).
    pub reg: u8,
    /// HW encoding of the non-destructive source stored inverted in `vvvv`.
    pub vvvv: u8,
    /// HW encodings supplying the inverted X and B bits, if any.
    pub index: Option<u8>,
    pub base: Option<u8>,
    /// Vector length: false = 128-bit, true = 256-bit.
    pub l256: bool,
    /// Implied legacy prefix.
    pub pp: u8,
    /// Opcode map select.
    pub mmmmm: u8,
    /// The VEX.W bit.
    pub w: bool,
}

impl Vex {
    fn inverted_top_bit(enc: u8) -> u8 {
        (!(enc >> 3)) & 1
    }

    /// Emit the 2- or 3-byte prefix.
    pub fn emit(self, buf: &mut CodeBuffer) -> CodegenResult<()> {
        let r = Self::inverted_top_bit(self.reg);
        let x = Self::inverted_top_bit(self.index.unwrap_or(0));
        let b = Self::inverted_top_bit(self.base.unwrap_or(0));
        debug_assert!(self.vvvv < 16);
        debug_assert!(self.pp < 4);
        let l = u8::from(self.l256);
        let last = ((!self.vvvv & 0xf) << 3) | (l << 2) | self.pp;
        // X and B are only representable in the 3-byte form (inverted, so a
        // set extension bit reads as 0 here), as are W=1 and the 0F38/0F3A
        // maps.
        if x == 1 && b == 1 && !self.w && self.mmmmm == vex_map::M0F {
            buf.put1(0xC5)?;
            buf.put1((r << 7) | last)
        } else {
            buf.put1(0xC4)?;
            buf.put1((r << 7) | (x << 6) | (b << 5) | self.mmmmm)?;
            buf.put1((u8::from(self.w) << 7) | last)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rex_byte_is_elided_when_empty() {
        let mut buf = CodeBuffer::new();
        Rex::clear_w().emit_two_op(&mut buf, 0, 0).unwrap();
        assert!(buf.is_empty());
        Rex::w().emit_two_op(&mut buf, 0, 0).unwrap();
        assert_eq!(buf.data(), &[0x48]);
    }

    #[test]
    fn rex_extension_bits() {
        let mut buf = CodeBuffer::new();
        // reg = r9 (R), rm = r10 (B).
        Rex::clear_w().emit_two_op(&mut buf, 9, 10).unwrap();
        assert_eq!(buf.data(), &[0x45]);
        buf.reset();
        Rex::w().emit_three_op(&mut buf, 0, 12, 13).unwrap();
        // W + X + B.
        assert_eq!(buf.data(), &[0x4B]);
    }

    #[test]
    fn rex_forced_for_low_byte_halves() {
        let mut buf = CodeBuffer::new();
        Rex::clear_w().force().emit_two_op(&mut buf, 0, 6).unwrap();
        assert_eq!(buf.data(), &[0x40]);
    }

    #[test]
    fn disp_classification() {
        assert!(matches!(Disp::classify(0), Disp::None));
        assert!(matches!(Disp::classify(127), Disp::D8(127)));
        assert!(matches!(Disp::classify(-128), Disp::D8(-128)));
        assert!(matches!(Disp::classify(128), Disp::D32(128)));
        let mut d = Disp::classify(0);
        d.force_disp8();
        assert!(matches!(d, Disp::D8(0)));
    }

    #[test]
    fn vex_two_byte_selection() {
        // vpxor xmm0, xmm1, xmm2: no extension bits, map 0F would be wrong
        // (pxor is 66 0F EF, map 0F) -- 2-byte form applies.
        let mut buf = CodeBuffer::new();
        Vex {
            reg: 0,
            vvvv: 1,
            index: None,
            base: Some(2),
            l256: false,
            pp: vex_pp::P66,
            mmmmm: vex_map::M0F,
            w: false,
        }
        .emit(&mut buf)
        .unwrap();
        assert_eq!(buf.data(), &[0xC5, 0xF1]);
    }

    #[test]
    fn vex_three_byte_when_b_extension_present() {
        let mut buf = CodeBuffer::new();
        Vex {
            reg: 0,
            vvvv: 1,
            index: None,
            base: Some(9),
            l256: false,
            pp: vex_pp::P66,
            mmmmm: vex_map::M0F,
            w: false,
        }
        .emit(&mut buf)
        .unwrap();
        assert_eq!(buf.data(), &[0xC4, 0xC1, 0x71]);
    }
}
