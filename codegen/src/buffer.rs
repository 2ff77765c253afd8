//! A growable, patchable byte sink for machine code.

use crate::result::{CodegenError, CodegenResult};

/// Offset in bytes from the beginning of a code buffer.
///
/// The library can be used as a cross assembler, so this is a fixed-width
/// type rather than `usize`, which follows the *host*.
pub type CodeOffset = u32;

/// Buffer growth doubles capacity until this threshold, then grows by the
/// threshold per step.
const GROW_DOUBLING_LIMIT: usize = 1 << 20;

/// An append-only byte buffer with random-access patching.
///
/// All multi-byte writes are little-endian, matching both supported
/// architectures. The buffer never shrinks implicitly; [`CodeBuffer::reset`]
/// rewinds the cursor while keeping the capacity.
#[derive(Clone, Debug, Default)]
pub struct CodeBuffer {
    data: Vec<u8>,
}

impl CodeBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Create an empty buffer with `capacity` bytes pre-allocated.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// The current append cursor.
    pub fn cur_offset(&self) -> CodeOffset {
        self.data.len() as CodeOffset
    }

    /// Number of bytes emitted so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been emitted yet.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The emitted bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consume the buffer and return the bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Rewind the cursor to 0, keeping the allocation.
    pub fn reset(&mut self) {
        self.data.clear();
    }

    /// Make room for `additional` more bytes, doubling capacity up to a
    /// threshold and growing linearly past it.
    fn grow_for(&mut self, additional: usize) -> CodegenResult<()> {
        let needed = self.data.len() + additional;
        if needed <= self.data.capacity() {
            return Ok(());
        }
        let target = if self.data.capacity() < GROW_DOUBLING_LIMIT {
            core::cmp::max(needed, self.data.capacity() * 2).max(64)
        } else {
            let steps = needed.div_ceil(GROW_DOUBLING_LIMIT);
            steps * GROW_DOUBLING_LIMIT
        };
        self.data
            .try_reserve_exact(target - self.data.len())
            .map_err(|_| CodegenError::OutOfMemory)?;
        Ok(())
    }

    /// Append one byte.
    pub fn put1(&mut self, value: u8) -> CodegenResult<()> {
        self.grow_for(1)?;
        self.data.push(value);
        Ok(())
    }

    /// Append a 16-bit little-endian value.
    pub fn put2(&mut self, value: u16) -> CodegenResult<()> {
        self.grow_for(2)?;
        self.data.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Append a 32-bit little-endian value.
    pub fn put4(&mut self, value: u32) -> CodegenResult<()> {
        self.grow_for(4)?;
        self.data.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Append a 64-bit little-endian value.
    pub fn put8(&mut self, value: u64) -> CodegenResult<()> {
        self.grow_for(8)?;
        self.data.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Append a byte slice verbatim.
    pub fn put_bytes(&mut self, bytes: &[u8]) -> CodegenResult<()> {
        self.grow_for(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    fn patch(&mut self, offset: CodeOffset, bytes: &[u8]) -> CodegenResult<()> {
        let start = offset as usize;
        let end = start
            .checked_add(bytes.len())
            .ok_or(CodegenError::OffsetOutOfRange)?;
        let slot = self
            .data
            .get_mut(start..end)
            .ok_or(CodegenError::OffsetOutOfRange)?;
        slot.copy_from_slice(bytes);
        Ok(())
    }

    /// Overwrite one byte at `offset`.
    pub fn patch1(&mut self, offset: CodeOffset, value: u8) -> CodegenResult<()> {
        self.patch(offset, &[value])
    }

    /// Overwrite a 16-bit little-endian value at `offset`.
    pub fn patch2(&mut self, offset: CodeOffset, value: u16) -> CodegenResult<()> {
        self.patch(offset, &value.to_le_bytes())
    }

    /// Overwrite a 32-bit little-endian value at `offset`.
    pub fn patch4(&mut self, offset: CodeOffset, value: u32) -> CodegenResult<()> {
        self.patch(offset, &value.to_le_bytes())
    }

    /// Overwrite a 64-bit little-endian value at `offset`.
    pub fn patch8(&mut self, offset: CodeOffset, value: u64) -> CodegenResult<()> {
        self.patch(offset, &value.to_le_bytes())
    }

    /// Read back a 32-bit little-endian value at `offset`.
    pub fn read4(&self, offset: CodeOffset) -> CodegenResult<u32> {
        let start = offset as usize;
        let bytes = self
            .data
            .get(start..start + 4)
            .ok_or(CodegenError::OffsetOutOfRange)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Zero-fill `n` bytes and return the offset of the first one. Used for
    /// forward-reference placeholders.
    pub fn reserve(&mut self, n: usize) -> CodegenResult<CodeOffset> {
        let at = self.cur_offset();
        self.grow_for(n)?;
        self.data.resize(self.data.len() + n, 0);
        Ok(at)
    }

    /// Pad with `fill` until the cursor is a multiple of `alignment`, which
    /// must be a power of two.
    pub fn align_to(&mut self, alignment: u32, fill: u8) -> CodegenResult<()> {
        if !alignment.is_power_of_two() {
            return Err(CodegenError::InvalidArgument(
                "alignment must be a power of two",
            ));
        }
        while self.cur_offset() & (alignment - 1) != 0 {
            self.put1(fill)?;
        }
        Ok(())
    }
}
