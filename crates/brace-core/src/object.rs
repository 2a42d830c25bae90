//! Heap object variants.
//!
//! Every allocated object is addressed by an [`ObjHandle`] — a plain index
//! into [`crate::heap::Heap`]'s arena — rather than a pointer. This is the
//! arena-of-typed-handles translation of the original's intrusive
//! `Obj* next` list (see `DESIGN.md`): the arena's occupied slots are the
//! spine the GC sweep walks.

use crate::chunk::Chunk;
use crate::value::{Value, ValueKind};
use ahash::AHashMap;

/// A lightweight handle into the heap arena. `Copy`, comparable, hashable —
/// cheap to stash anywhere a `Value::Obj` or object field needs to point at
/// another object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjHandle(pub(crate) u32);

impl ObjHandle {
    pub fn index(&self) -> u32 {
        self.0
    }
}

/// Discriminator for [`ObjData`], mirroring the original's `ObjType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjKind {
    Str,
    Array,
    Function,
    Closure,
    Upvalue,
    Native,
    Class,
    Instance,
    BoundMethod,
    BoundNativeMethod,
    DataType,
    Module,
}

/// A host-implemented callable. Takes the heap (so natives that allocate —
/// e.g. building a result string — can do so) and the argument slice;
/// returns either a value or a signal that it already reported a runtime
/// error via `runtime_error` and the VM should halt.
///
/// Defined here rather than in `brace-vm` so `NativeObj` can hold a concrete
/// function pointer without `brace-core` depending on the VM crate.
pub type NativeFn = fn(&mut crate::heap::Heap, &[Value]) -> Result<Value, NativeSignal>;

/// Sentinel returned by a native that has already reported a runtime error.
#[derive(Debug, Clone)]
pub struct NativeSignal {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct StringObj {
    pub chars: Box<str>,
    pub hash: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ArrayObj {
    pub values: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct FunctionObj {
    pub arity: u8,
    pub upvalue_count: u8,
    /// Absent for the top-level script function.
    pub name: Option<ObjHandle>,
    pub return_type: ObjHandle,
    pub param_types: Vec<ObjHandle>,
    pub chunk: Chunk,
}

#[derive(Debug, Clone, Copy)]
pub struct UpvalueRef {
    pub is_local: bool,
    pub index: u8,
}

#[derive(Debug, Clone)]
pub struct ClosureObj {
    pub function: ObjHandle,
    pub upvalues: Vec<ObjHandle>,
}

#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    /// Points at a live VM stack slot.
    Open(usize),
    Closed(Value),
}

#[derive(Debug, Clone)]
pub struct UpvalueObj {
    pub state: UpvalueState,
}

#[derive(Clone)]
pub struct NativeObj {
    pub name: Option<ObjHandle>,
    /// `-1` means variadic; the native validates its own argument count.
    pub arity: i32,
    pub func: NativeFn,
}

impl std::fmt::Debug for NativeObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeObj")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClassObj {
    pub name: Option<ObjHandle>,
    pub methods: AHashMap<ObjHandle, ObjHandle>,
    pub fields: AHashMap<ObjHandle, Value>,
    pub field_types: AHashMap<ObjHandle, ObjHandle>,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceObj {
    pub class: Option<ObjHandle>,
    pub fields: AHashMap<ObjHandle, Value>,
    pub field_types: AHashMap<ObjHandle, ObjHandle>,
}

#[derive(Debug, Clone)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: ObjHandle,
}

#[derive(Debug, Clone)]
pub struct BoundNativeMethodObj {
    pub receiver: Value,
    pub native: ObjHandle,
}

#[derive(Debug, Clone)]
pub struct DataTypeObj {
    pub is_any: bool,
    pub value_kind: ValueKind,
    pub obj_kind: Option<ObjKind>,
    /// For an `Instance` annotation: the interned *name* of the expected
    /// class, not a handle to the `Class` object itself. Naming rather than
    /// pointing lets a type annotation resolve against a class declared
    /// later in the same source (or recursively, inside its own body)
    /// without the compiler needing a forward-declaration pass.
    pub class_type: Option<ObjHandle>,
    pub invalid: bool,
}

impl DataTypeObj {
    pub fn any() -> Self {
        DataTypeObj {
            is_any: true,
            value_kind: ValueKind::Obj,
            obj_kind: None,
            class_type: None,
            invalid: false,
        }
    }

    pub fn primitive(kind: ValueKind) -> Self {
        DataTypeObj {
            is_any: false,
            value_kind: kind,
            obj_kind: None,
            class_type: None,
            invalid: false,
        }
    }

    pub fn object(kind: ObjKind) -> Self {
        DataTypeObj {
            is_any: false,
            value_kind: ValueKind::Obj,
            obj_kind: Some(kind),
            class_type: None,
            invalid: false,
        }
    }

    /// `class_name` is the interned name of the expected class (see the
    /// field doc on `class_type`), not the class object's own handle.
    pub fn class(class_name: ObjHandle) -> Self {
        DataTypeObj {
            is_any: false,
            value_kind: ValueKind::Obj,
            obj_kind: Some(ObjKind::Instance),
            class_type: Some(class_name),
            invalid: false,
        }
    }

    pub fn invalid() -> Self {
        DataTypeObj {
            is_any: false,
            value_kind: ValueKind::Obj,
            obj_kind: None,
            class_type: None,
            invalid: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModuleObj {
    pub name: Option<ObjHandle>,
    pub path: Option<ObjHandle>,
    pub fields: AHashMap<ObjHandle, Value>,
    pub field_types: AHashMap<ObjHandle, ObjHandle>,
}

/// The payload union for every heap object kind.
#[derive(Debug, Clone)]
pub enum ObjData {
    Str(StringObj),
    Array(ArrayObj),
    Function(FunctionObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    Native(NativeObj),
    Class(ClassObj),
    Instance(InstanceObj),
    BoundMethod(BoundMethodObj),
    BoundNativeMethod(BoundNativeMethodObj),
    DataType(DataTypeObj),
    Module(ModuleObj),
}

impl ObjData {
    pub fn kind(&self) -> ObjKind {
        match self {
            ObjData::Str(_) => ObjKind::Str,
            ObjData::Array(_) => ObjKind::Array,
            ObjData::Function(_) => ObjKind::Function,
            ObjData::Closure(_) => ObjKind::Closure,
            ObjData::Upvalue(_) => ObjKind::Upvalue,
            ObjData::Native(_) => ObjKind::Native,
            ObjData::Class(_) => ObjKind::Class,
            ObjData::Instance(_) => ObjKind::Instance,
            ObjData::BoundMethod(_) => ObjKind::BoundMethod,
            ObjData::BoundNativeMethod(_) => ObjKind::BoundNativeMethod,
            ObjData::DataType(_) => ObjKind::DataType,
            ObjData::Module(_) => ObjKind::Module,
        }
    }

    /// A rough accounting size in bytes, used only to drive the GC's
    /// allocation budget — not required to be exact (see `DESIGN.md`).
    pub fn approx_size(&self) -> usize {
        let base = std::mem::size_of::<ObjData>();
        base + match self {
            ObjData::Str(s) => s.chars.len(),
            ObjData::Array(a) => a.values.len() * std::mem::size_of::<Value>(),
            ObjData::Function(f) => f.chunk.approx_size() + f.param_types.len() * 4,
            ObjData::Closure(c) => c.upvalues.len() * 4,
            ObjData::Class(c) => (c.methods.len() + c.fields.len()) * 16,
            ObjData::Instance(i) => i.fields.len() * 16,
            ObjData::Module(m) => m.fields.len() * 16,
            _ => 0,
        }
    }
}
