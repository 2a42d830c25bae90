//! Stack-based bytecode VM for the Brace scripting language: call frames,
//! closures, classes, a tracing garbage collector (via `brace-core::Heap`),
//! and the handful of native functions named in the language's spec.

pub mod error;
pub mod natives;
pub mod vm;

pub use error::{InterpretError, RuntimeError, TraceFrame};
pub use vm::{Vm, VmOptions};
