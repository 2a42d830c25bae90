//! Shared value representation, object model, bytecode chunk format, and
//! the tracing garbage collector used by both `brace-compiler` and
//! `brace-vm`.

pub mod chunk;
pub mod fmt_msg;
pub mod hashing;
pub mod heap;
pub mod object;
pub mod value;

pub use chunk::{Chunk, ChunkError, LineTable};
pub use fmt_msg::format_brace_message;
pub use hashing::fnv1a;
pub use heap::{format_number, Heap};
pub use object::{
    ArrayObj, BoundMethodObj, BoundNativeMethodObj, ClassObj, ClosureObj, DataTypeObj, FunctionObj,
    InstanceObj, ModuleObj, NativeFn, NativeObj, NativeSignal, ObjData, ObjHandle, ObjKind,
    StringObj, UpvalueObj, UpvalueRef, UpvalueState,
};
pub use opcode::Op;
pub use value::{Value, ValueKind};

pub mod opcode;
