//! Single-pass Pratt-parser compiler for the Brace language: source text
//! straight to bytecode, no intermediate AST.

pub mod compiler;
pub mod scanner;
pub mod token;

pub use compiler::{compile, CompileError};
