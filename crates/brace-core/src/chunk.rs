//! Bytecode chunks: code bytes, a run-length-encoded line table, and a
//! capped constant pool. Grounded on the teacher's `vitte-core` chunk
//! format (`ConstPool`/`LineTable`), simplified so the constant pool holds
//! runtime [`Value`]s directly rather than a separate serializable
//! `ConstValue`, since Brace's constants (interned strings, data types,
//! nested functions) are heap objects the GC must be able to trace through
//! a `Chunk` — see `DESIGN.md`.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::value::Value;

/// Constant pool indices are single bytes: 256 entries per chunk.
pub const MAX_CONSTANTS: usize = 256;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChunkError {
    #[error("too many constants in one chunk (max {MAX_CONSTANTS})")]
    TooManyConstants,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
struct LineRun {
    start_pc: u32,
    line: u32,
    len: u32,
}

/// Maps PC -> source line via run-length-encoded segments, so consecutive
/// bytes on the same line cost one entry instead of one-per-byte.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LineTable {
    runs: Vec<LineRun>,
}

impl LineTable {
    pub fn new() -> Self {
        Self { runs: Vec::new() }
    }

    pub fn push_line(&mut self, pc: u32, line: u32) {
        match self.runs.last_mut() {
            Some(last) if last.line == line && last.start_pc + last.len == pc => {
                last.len += 1;
            }
            _ => self.runs.push(LineRun { start_pc: pc, line, len: 1 }),
        }
    }

    pub fn line_for_pc(&self, pc: u32) -> Option<u32> {
        self.runs
            .iter()
            .find(|r| pc >= r.start_pc && pc < r.start_pc + r.len)
            .map(|r| r.line)
    }

    pub fn iter_ranges(&self) -> impl Iterator<Item = (Range<u32>, u32)> + '_ {
        self.runs.iter().map(|r| (r.start_pc..(r.start_pc + r.len), r.line))
    }
}

/// The executable body of a function: bytecode, line numbers, constants.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Chunk {
    pub code: Vec<u8>,
    pub lines: LineTable,
    pub constants: Vec<Value>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_byte(&mut self, byte: u8, line: u32) {
        let pc = self.code.len() as u32;
        self.code.push(byte);
        self.lines.push_line(pc, line);
    }

    /// Appends a constant and returns its pool index. Does *not* dedupe —
    /// the compiler is responsible for reusing indices for identical
    /// compile-time constants (e.g. via string interning upstream).
    pub fn add_constant(&mut self, value: Value) -> Result<u8, ChunkError> {
        if self.constants.len() >= MAX_CONSTANTS {
            return Err(ChunkError::TooManyConstants);
        }
        self.constants.push(value);
        Ok((self.constants.len() - 1) as u8)
    }

    pub fn constant(&self, idx: u8) -> Value {
        self.constants[idx as usize]
    }

    pub fn line_for_pc(&self, pc: u32) -> u32 {
        self.lines.line_for_pc(pc).unwrap_or(0)
    }

    pub fn approx_size(&self) -> usize {
        self.code.len() + self.constants.len() * std::mem::size_of::<Value>()
    }

    /// Patches a forward jump's 16-bit big-endian operand once the jump
    /// target is known. `operand_pc` points at the first of the two
    /// operand bytes.
    pub fn patch_jump(&mut self, operand_pc: usize) {
        let dest = self.code.len();
        let offset = dest - operand_pc - 2;
        debug_assert!(offset <= u16::MAX as usize, "jump offset too large");
        let bytes = (offset as u16).to_be_bytes();
        self.code[operand_pc] = bytes[0];
        self.code[operand_pc + 1] = bytes[1];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_table_runs_coalesce_consecutive_same_line() {
        let mut t = LineTable::new();
        t.push_line(0, 1);
        t.push_line(1, 1);
        t.push_line(2, 2);
        assert_eq!(t.line_for_pc(0), Some(1));
        assert_eq!(t.line_for_pc(1), Some(1));
        assert_eq!(t.line_for_pc(2), Some(2));
        assert_eq!(t.runs.len(), 2);
    }

    #[test]
    fn constant_pool_caps_at_256() {
        let mut c = Chunk::new();
        for _ in 0..MAX_CONSTANTS {
            c.add_constant(Value::Null).unwrap();
        }
        assert!(c.add_constant(Value::Null).is_err());
    }
}
