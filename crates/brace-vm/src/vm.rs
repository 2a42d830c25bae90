//! The bytecode dispatch loop: stack, call frames, closures, classes,
//! globals, natives, and the GC root hook the VM hands to [`Heap`]
//! (spec §4.4/§4.5).
//!
//! Grounded on the teacher's `vitte-vm::Vm` (push/pop/peek helpers, a
//! `VmOptions` builder, an `OpAdapter`-free direct `match` here since
//! `brace-core::Op` is already concrete rather than host-supplied).

use ahash::AHashMap;

use brace_core::{
    format_brace_message, BoundMethodObj, BoundNativeMethodObj, ClassObj, ClosureObj,
    DataTypeObj, Heap, InstanceObj, NativeObj, ObjHandle, ObjKind, Op, UpvalueObj, UpvalueState,
    Value,
};

use crate::error::{InterpretError, RuntimeError, TraceFrame};
use crate::natives;

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Debug, Clone, Copy)]
struct CallFrame {
    closure: ObjHandle,
    ip: usize,
    /// Stack index of this frame's slot 0.
    base: usize,
}

#[derive(Default)]
struct NativeVars {
    last: Value,
    script: Option<ObjHandle>,
}

/// Construction-time tunables (spec §2.1's `VmOptions`/`GcOptions` note).
#[derive(Debug, Clone, Copy)]
pub struct VmOptions {
    pub stress_gc: bool,
    pub frames_max: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions { stress_gc: false, frames_max: FRAMES_MAX }
    }
}

impl VmOptions {
    pub fn with_stress_gc(mut self, on: bool) -> Self {
        self.stress_gc = on;
        self
    }

    pub fn with_frames_max(mut self, n: usize) -> Self {
        self.frames_max = n;
        self
    }
}

/// The stack machine. Owns the [`Heap`] so a nested `Import` can swap the
/// active script path and rerun the compiler/VM pair without either crate
/// depending on the other's root set (spec §9).
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: AHashMap<ObjHandle, Value>,
    global_types: AHashMap<ObjHandle, ObjHandle>,
    open_upvalues: Vec<ObjHandle>,
    native_vars: NativeVars,
    length_native: ObjHandle,
    to_num_native: ObjHandle,
    options: VmOptions,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    pub fn with_options(options: VmOptions) -> Self {
        let mut heap = Heap::new().with_stress_gc(options.stress_gc);

        let length_name = heap.intern("Length");
        let length_native =
            heap.alloc_native(NativeObj { name: Some(length_name), arity: 0, func: natives::array_length });
        let to_num_name = heap.intern("ToNum");
        let to_num_native =
            heap.alloc_native(NativeObj { name: Some(to_num_name), arity: 0, func: natives::str_to_num });
        let clock_name = heap.intern("Clock");
        let clock_native =
            heap.alloc_native(NativeObj { name: Some(clock_name), arity: 0, func: natives::clock });
        let sleep_name = heap.intern("Sleep");
        let sleep_native =
            heap.alloc_native(NativeObj { name: Some(sleep_name), arity: 1, func: natives::sleep });
        let fun_ty = heap.alloc_data_type(DataTypeObj::object(ObjKind::Function));

        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(1024),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: AHashMap::new(),
            global_types: AHashMap::new(),
            open_upvalues: Vec::new(),
            native_vars: NativeVars::default(),
            length_native,
            to_num_native,
            options,
        };
        vm.globals.insert(clock_name, Value::Obj(clock_native));
        vm.global_types.insert(clock_name, fun_ty);
        vm.globals.insert(sleep_name, Value::Obj(sleep_native));
        vm.global_types.insert(sleep_name, fun_ty);
        vm
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The REPL's `_LAST`, for printing a trailing expression's value.
    pub fn last_value(&self) -> Value {
        self.native_vars.last
    }

    pub fn display(&self, v: Value) -> String {
        self.heap.display_value(v)
    }

    /// Compiles and runs `source` as a fresh top-level script. Globals and
    /// the string table persist across calls (so a REPL accumulates
    /// bindings); the value stack and call-frame stack do not.
    pub fn interpret(&mut self, source: &str, script_path: Option<&str>) -> Result<Value, InterpretError> {
        let script_handle =
            brace_compiler::compile(source, &mut self.heap).map_err(InterpretError::Compile)?;
        self.native_vars.script = script_path.map(|p| self.heap.intern(p));
        let closure_handle = self.heap.alloc_closure(ClosureObj { function: script_handle, upvalues: Vec::new() });
        self.stack.clear();
        self.frames.clear();
        self.stack.push(Value::Obj(closure_handle));
        self.frames.push(CallFrame { closure: closure_handle, ip: 0, base: 0 });
        match self.run_until(0) {
            Ok(v) => Ok(v),
            Err(e) => {
                self.stack.clear();
                self.frames.clear();
                Err(InterpretError::Runtime(e))
            }
        }
    }

    // -----------------------------------------------------------------
    // Stack primitives
    // -----------------------------------------------------------------

    fn push(&mut self, v: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or_else(|| self.runtime_error("Stack underflow."))
    }

    fn peek(&self, depth: usize) -> Result<Value, RuntimeError> {
        let len = self.stack.len();
        if depth >= len {
            return Err(self.runtime_error("Stack underflow."));
        }
        Ok(self.stack[len - 1 - depth])
    }

    // -----------------------------------------------------------------
    // Errors
    // -----------------------------------------------------------------

    fn build_trace(&self) -> Vec<TraceFrame> {
        self.frames
            .iter()
            .rev()
            .map(|f| {
                let function_handle = self.heap.closure(f.closure).function;
                let function = self.heap.function(function_handle);
                let pc = f.ip.saturating_sub(1) as u32;
                let line = function.chunk.line_for_pc(pc);
                let name = function.name.map(|h| self.heap.string(h).chars.to_string());
                TraceFrame { line, name }
            })
            .collect()
    }

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        RuntimeError::new(message, self.build_trace())
    }

    fn type_error(&self, d: &DataTypeObj, actual: Value) -> RuntimeError {
        let expected = self.heap.display_data_type(d);
        let actual_s = self.heap.type_name_of_value(actual);
        let msg = format_brace_message("Expected value of type %s, got %s.", &[&expected, &actual_s]);
        self.runtime_error(msg)
    }

    fn undefined_property(&self, name: ObjHandle) -> RuntimeError {
        let n = self.heap.string(name).chars.to_string();
        self.runtime_error(format!("Undefined property '{n}'."))
    }

    fn undefined_variable(&self, name: ObjHandle) -> RuntimeError {
        let n = self.heap.string(name).chars.to_string();
        self.runtime_error(format!("Undefined variable '{n}'."))
    }

    // -----------------------------------------------------------------
    // Bytecode stream
    // -----------------------------------------------------------------

    fn top_frame_index(&self) -> usize {
        self.frames.len() - 1
    }

    fn function_of(&self, closure: ObjHandle) -> &brace_core::FunctionObj {
        let function_handle = self.heap.closure(closure).function;
        self.heap.function(function_handle)
    }

    fn read_byte(&mut self) -> u8 {
        let idx = self.top_frame_index();
        let frame = self.frames[idx];
        let byte = self.function_of(frame.closure).chunk.code[frame.ip];
        self.frames[idx].ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        ((hi as u16) << 8) | lo as u16
    }

    fn read_constant(&mut self, idx: u8) -> Value {
        let frame_idx = self.top_frame_index();
        let closure = self.frames[frame_idx].closure;
        self.function_of(closure).chunk.constant(idx)
    }

    fn obj_constant(&mut self, idx: u8) -> Result<ObjHandle, RuntimeError> {
        match self.read_constant(idx) {
            Value::Obj(h) => Ok(h),
            _ => Err(self.runtime_error("Corrupt bytecode: expected an object constant.")),
        }
    }

    // -----------------------------------------------------------------
    // Garbage collection
    // -----------------------------------------------------------------

    fn maybe_collect(&mut self) {
        let stack = &self.stack;
        let frames = &self.frames;
        let open_upvalues = &self.open_upvalues;
        let globals = &self.globals;
        let global_types = &self.global_types;
        let last = self.native_vars.last;
        let script = self.native_vars.script;
        let length_native = self.length_native;
        let to_num_native = self.to_num_native;
        self.heap.maybe_collect(|h| {
            for v in stack {
                h.mark_value(*v);
            }
            for f in frames {
                h.mark_object(f.closure);
            }
            for u in open_upvalues {
                h.mark_object(*u);
            }
            for (&k, &v) in globals {
                h.mark_object(k);
                h.mark_value(v);
            }
            for (&k, &v) in global_types {
                h.mark_object(k);
                h.mark_object(v);
            }
            h.mark_value(last);
            if let Some(s) = script {
                h.mark_object(s);
            }
            h.mark_object(length_native);
            h.mark_object(to_num_native);
        });
    }

    // -----------------------------------------------------------------
    // Upvalues
    // -----------------------------------------------------------------

    fn capture_upvalue(&mut self, slot: usize) -> ObjHandle {
        for &h in &self.open_upvalues {
            if matches!(self.heap.upvalue(h).state, UpvalueState::Open(s) if s == slot) {
                return h;
            }
        }
        let h = self.heap.alloc_upvalue(UpvalueObj { state: UpvalueState::Open(slot) });
        self.open_upvalues.push(h);
        h
    }

    fn close_upvalues_from(&mut self, from: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let h = self.open_upvalues[i];
            let slot = match self.heap.upvalue(h).state {
                UpvalueState::Open(s) => Some(s),
                UpvalueState::Closed(_) => None,
            };
            match slot {
                Some(s) if s >= from => {
                    let value = self.stack[s];
                    self.heap.upvalue_mut(h).state = UpvalueState::Closed(value);
                    self.open_upvalues.remove(i);
                }
                _ => i += 1,
            }
        }
    }

    // -----------------------------------------------------------------
    // Calling
    // -----------------------------------------------------------------

    fn call_closure(&mut self, closure_handle: ObjHandle, arg_count: u8) -> Result<(), RuntimeError> {
        let function_handle = self.heap.closure(closure_handle).function;
        let function = self.heap.function(function_handle);
        if function.arity != arg_count {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                function.arity, arg_count
            )));
        }
        let param_types = function.param_types.clone();
        let base = self.stack.len() - arg_count as usize - 1;
        for (i, ty) in param_types.iter().enumerate() {
            let v = self.stack[base + 1 + i];
            let d = self.heap.data_type(*ty).clone();
            if !self.heap.value_matches_type(v, &d) {
                return Err(self.type_error(&d, v));
            }
        }
        if self.frames.len() >= self.options.frames_max {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame { closure: closure_handle, ip: 0, base });
        Ok(())
    }

    fn call_native(
        &mut self,
        native_handle: ObjHandle,
        call_args: &[Value],
        pop_count: usize,
        bound: bool,
    ) -> Result<(), RuntimeError> {
        let native = self.heap.native(native_handle);
        let arity = native.arity;
        let func = native.func;
        // A bound native method has its receiver prepended to `call_args`, so the
        // argument count the caller actually wrote is one less than `call_args.len()`.
        let effective_arity = if bound { arity + 1 } else { arity };
        if effective_arity >= 0 && effective_arity as usize != call_args.len() {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                arity,
                if bound { call_args.len().saturating_sub(1) } else { call_args.len() }
            )));
        }
        match func(&mut self.heap, call_args) {
            Ok(result) => {
                let new_len = self.stack.len() - pop_count;
                self.stack.truncate(new_len);
                self.push(result)
            }
            Err(sig) => Err(self.runtime_error(sig.message)),
        }
    }

    fn call_value(&mut self, callee: Value, arg_count: u8) -> Result<(), RuntimeError> {
        let Value::Obj(h) = callee else {
            return Err(self.runtime_error("Can only call functions and classes."));
        };
        match self.heap.kind_of(h) {
            ObjKind::Closure => self.call_closure(h, arg_count),
            ObjKind::BoundMethod => {
                let b = self.heap.bound_method(h).clone();
                let idx = self.stack.len() - 1 - arg_count as usize;
                self.stack[idx] = b.receiver;
                self.call_value(Value::Obj(b.method), arg_count)
            }
            ObjKind::BoundNativeMethod => {
                let b = self.heap.bound_native_method(h).clone();
                let base = self.stack.len() - arg_count as usize;
                let mut call_args = Vec::with_capacity(arg_count as usize + 1);
                call_args.push(b.receiver);
                call_args.extend_from_slice(&self.stack[base..]);
                self.call_native(b.native, &call_args, arg_count as usize + 1, true)
            }
            ObjKind::Native => {
                let base = self.stack.len() - arg_count as usize;
                let call_args = self.stack[base..].to_vec();
                self.call_native(h, &call_args, arg_count as usize + 1, false)
            }
            ObjKind::Class => {
                let fields = self.heap.class(h).fields.clone();
                let field_types = self.heap.class(h).field_types.clone();
                let instance = InstanceObj { class: Some(h), fields, field_types };
                let inst_handle = self.heap.alloc_instance(instance);
                let idx = self.stack.len() - 1 - arg_count as usize;
                self.stack[idx] = Value::Obj(inst_handle);
                let init_name = self.heap.intern("Init");
                let init = self.heap.class(h).methods.get(&init_name).copied();
                match init {
                    Some(init_closure) => self.call_value(Value::Obj(init_closure), arg_count),
                    None if arg_count == 0 => Ok(()),
                    None => Err(self
                        .runtime_error(format!("Expected 0 arguments but got {arg_count}."))),
                }
            }
            ObjKind::DataType => Err(self.runtime_error("Type values are not callable.")),
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    // -----------------------------------------------------------------
    // Property / index access
    // -----------------------------------------------------------------

    fn name_is(&self, handle: ObjHandle, text: &str) -> bool {
        self.heap.string(handle).chars.as_ref() == text
    }

    fn resolve_property(&mut self, receiver: Value, name: ObjHandle) -> Result<Value, RuntimeError> {
        let Value::Obj(h) = receiver else {
            return Err(self.runtime_error("Only instances, modules, strings, and arrays have properties."));
        };
        match self.heap.kind_of(h) {
            ObjKind::Instance => {
                if let Some(&v) = self.heap.instance(h).fields.get(&name) {
                    return Ok(v);
                }
                let class_handle = self.heap.instance(h).class;
                let method = class_handle.and_then(|c| self.heap.class(c).methods.get(&name).copied());
                match method {
                    Some(m) => {
                        let bound = self.heap.alloc_bound_method(BoundMethodObj { receiver, method: m });
                        Ok(Value::Obj(bound))
                    }
                    None => Err(self.undefined_property(name)),
                }
            }
            ObjKind::Module => self
                .heap
                .module(h)
                .fields
                .get(&name)
                .copied()
                .ok_or_else(|| self.undefined_property(name)),
            ObjKind::Str if self.name_is(name, "ToNum") => {
                let bound =
                    self.heap.alloc_bound_native_method(BoundNativeMethodObj { receiver, native: self.to_num_native });
                Ok(Value::Obj(bound))
            }
            ObjKind::Array if self.name_is(name, "Length") => {
                let bound = self
                    .heap
                    .alloc_bound_native_method(BoundNativeMethodObj { receiver, native: self.length_native });
                Ok(Value::Obj(bound))
            }
            _ => Err(self.undefined_property(name)),
        }
    }

    fn set_property(&mut self, obj: Value, name: ObjHandle, value: Value) -> Result<(), RuntimeError> {
        let Value::Obj(h) = obj else {
            return Err(self.runtime_error("Only instances and modules have settable properties."));
        };
        match self.heap.kind_of(h) {
            ObjKind::Instance => {
                if !self.heap.instance(h).fields.contains_key(&name) {
                    return Err(self.undefined_property(name));
                }
                if let Some(ty) = self.heap.instance(h).field_types.get(&name).copied() {
                    let d = self.heap.data_type(ty).clone();
                    if !self.heap.value_matches_type(value, &d) {
                        return Err(self.type_error(&d, value));
                    }
                }
                self.heap.instance_mut(h).fields.insert(name, value);
                Ok(())
            }
            ObjKind::Module => {
                if !self.heap.module(h).fields.contains_key(&name) {
                    return Err(self.undefined_property(name));
                }
                if let Some(ty) = self.heap.module(h).field_types.get(&name).copied() {
                    let d = self.heap.data_type(ty).clone();
                    if !self.heap.value_matches_type(value, &d) {
                        return Err(self.type_error(&d, value));
                    }
                }
                self.heap.module_mut(h).fields.insert(name, value);
                Ok(())
            }
            _ => Err(self.runtime_error("Only instances and modules have settable properties.")),
        }
    }

    fn normalize_index(&self, idx: f64, count: usize) -> Option<usize> {
        let i = if idx < 0.0 { idx + count as f64 } else { idx };
        if i < 0.0 || i >= count as f64 {
            None
        } else {
            Some(i as usize)
        }
    }

    // -----------------------------------------------------------------
    // Module import
    // -----------------------------------------------------------------

    fn import_module(&mut self, name: ObjHandle) -> Result<Value, RuntimeError> {
        let module_name = self.heap.string(name).chars.to_string();
        let dir = self
            .native_vars
            .script
            .map(|h| self.heap.string(h).chars.to_string())
            .and_then(|p| std::path::Path::new(&p).parent().map(|d| d.to_path_buf()))
            .unwrap_or_default();
        let candidates = [dir.join(format!("{module_name}.brc")), std::path::PathBuf::from(format!("lib/{module_name}.brc"))];
        let source = candidates
            .iter()
            .find_map(|p| std::fs::read_to_string(p).ok())
            .ok_or_else(|| self.runtime_error(format!("Cannot find module '{module_name}'.")))?;

        let before: std::collections::HashSet<ObjHandle> = self.globals.keys().copied().collect();
        let saved_script = self.native_vars.script;
        self.native_vars.script = Some(name);

        let script_handle = brace_compiler::compile(&source, &mut self.heap)
            .map_err(|errs| self.runtime_error(format!("Module '{module_name}' failed to compile: {} error(s).", errs.len())))?;
        let closure_handle = self.heap.alloc_closure(ClosureObj { function: script_handle, upvalues: Vec::new() });
        let floor = self.frames.len();
        self.push(Value::Obj(closure_handle))?;
        self.frames.push(CallFrame { closure: closure_handle, ip: 0, base: self.stack.len() - 1 });
        self.run_until(floor)?;

        self.native_vars.script = saved_script;

        let mut fields = AHashMap::new();
        let mut field_types = AHashMap::new();
        for (&k, &v) in self.globals.iter() {
            if !before.contains(&k) {
                fields.insert(k, v);
                if let Some(&ty) = self.global_types.get(&k) {
                    field_types.insert(k, ty);
                }
            }
        }
        let module = brace_core::ModuleObj { name: Some(name), path: self.native_vars.script, fields, field_types };
        let handle = self.heap.alloc_module(module);
        Ok(Value::Obj(handle))
    }

    // -----------------------------------------------------------------
    // Dispatch loop
    // -----------------------------------------------------------------

    pub fn run(&mut self) -> Result<Value, RuntimeError> {
        self.run_until(0)
    }

    fn run_until(&mut self, floor: usize) -> Result<Value, RuntimeError> {
        loop {
            self.maybe_collect();

            let byte = self.read_byte();
            let op = Op::from_byte(byte)
                .ok_or_else(|| self.runtime_error("Corrupt bytecode: unknown opcode."))?;

            match op {
                Op::Constant => {
                    let idx = self.read_byte();
                    let v = self.read_constant(idx);
                    self.push(v)?;
                }
                Op::Null => self.push(Value::Null)?,
                Op::True => self.push(Value::Bool(true))?,
                Op::False => self.push(Value::Bool(false))?,
                Op::Pop => {
                    self.pop()?;
                }
                Op::Duplicate => {
                    let n = self.read_byte() as usize;
                    let v = self.peek(n)?;
                    self.push(v)?;
                }

                Op::GetLocal => {
                    let slot = self.read_byte();
                    let idx = self.frames[self.top_frame_index()].base + slot as usize;
                    self.push(self.stack[idx])?;
                }
                Op::SetLocal => {
                    let slot = self.read_byte();
                    let idx = self.frames[self.top_frame_index()].base + slot as usize;
                    let v = self.peek(0)?;
                    self.stack[idx] = v;
                }
                Op::GetUpvalue => {
                    let slot = self.read_byte();
                    let closure = self.frames[self.top_frame_index()].closure;
                    let up = self.heap.closure(closure).upvalues[slot as usize];
                    let v = match self.heap.upvalue(up).state {
                        UpvalueState::Open(i) => self.stack[i],
                        UpvalueState::Closed(v) => v,
                    };
                    self.push(v)?;
                }
                Op::SetUpvalue => {
                    let slot = self.read_byte();
                    let closure = self.frames[self.top_frame_index()].closure;
                    let up = self.heap.closure(closure).upvalues[slot as usize];
                    let v = self.peek(0)?;
                    match self.heap.upvalue(up).state {
                        UpvalueState::Open(i) => self.stack[i] = v,
                        UpvalueState::Closed(_) => self.heap.upvalue_mut(up).state = UpvalueState::Closed(v),
                    }
                }

                Op::GetGlobal => {
                    let idx = self.read_byte();
                    let name = self.obj_constant(idx)?;
                    let v = self.globals.get(&name).copied().ok_or_else(|| self.undefined_variable(name))?;
                    self.push(v)?;
                }
                Op::DefineGlobal => {
                    let name_idx = self.read_byte();
                    let type_idx = self.read_byte();
                    let name = self.obj_constant(name_idx)?;
                    let ty = self.obj_constant(type_idx)?;
                    let v = self.pop()?;
                    self.globals.insert(name, v);
                    self.global_types.insert(name, ty);
                }
                Op::SetGlobal => {
                    let idx = self.read_byte();
                    let name = self.obj_constant(idx)?;
                    let v = self.peek(0)?;
                    if !self.globals.contains_key(&name) {
                        return Err(self.undefined_variable(name));
                    }
                    if let Some(&ty) = self.global_types.get(&name) {
                        let d = self.heap.data_type(ty).clone();
                        if !self.heap.value_matches_type(v, &d) {
                            return Err(self.type_error(&d, v));
                        }
                    }
                    self.globals.insert(name, v);
                }

                Op::GetNVar => {
                    let idx = self.read_byte();
                    let v = match idx {
                        0 => Value::Null,
                        1 => self.native_vars.last,
                        2 => {
                            let closure = self.frames[self.top_frame_index()].closure;
                            match self.function_of(closure).name {
                                Some(h) => Value::Obj(h),
                                None => Value::Obj(self.heap.intern("<script>")),
                            }
                        }
                        3 => match self.native_vars.script {
                            Some(h) => Value::Obj(h),
                            None => Value::Null,
                        },
                        _ => return Err(self.runtime_error("Corrupt bytecode: unknown native variable.")),
                    };
                    self.push(v)?;
                }
                Op::SetNVar => {
                    let idx = self.read_byte();
                    let _v = self.peek(0)?;
                    match idx {
                        0 => {}
                        1 => return Err(self.runtime_error("Cannot assign to '_LAST'.")),
                        2 => return Err(self.runtime_error("Cannot assign to '_FUN'.")),
                        3 => return Err(self.runtime_error("Cannot assign to '_SCRIPT'.")),
                        _ => return Err(self.runtime_error("Corrupt bytecode: unknown native variable.")),
                    }
                }
                Op::UpdateLast => {
                    self.native_vars.last = self.peek(0)?;
                }

                Op::DefineField => {
                    let name_idx = self.read_byte();
                    let type_idx = self.read_byte();
                    let name = self.obj_constant(name_idx)?;
                    let ty = self.obj_constant(type_idx)?;
                    let v = self.pop()?;
                    let cls = self.as_class(self.peek(0)?)?;
                    self.heap.class_mut(cls).fields.insert(name, v);
                    self.heap.class_mut(cls).field_types.insert(name, ty);
                }
                Op::GetProperty => {
                    let idx = self.read_byte();
                    let name = self.obj_constant(idx)?;
                    let obj = self.pop()?;
                    let v = self.resolve_property(obj, name)?;
                    self.push(v)?;
                }
                Op::SetProperty => {
                    let idx = self.read_byte();
                    let name = self.obj_constant(idx)?;
                    let v = self.pop()?;
                    let obj = self.pop()?;
                    self.set_property(obj, name, v)?;
                    self.push(v)?;
                }
                Op::GetSuper => {
                    let idx = self.read_byte();
                    let name = self.obj_constant(idx)?;
                    let superclass = self.as_class(self.pop()?)?;
                    let receiver = self.pop()?;
                    let method = self.heap.class(superclass).methods.get(&name).copied();
                    match method {
                        Some(m) => {
                            let bound = self.heap.alloc_bound_method(BoundMethodObj { receiver, method: m });
                            self.push(Value::Obj(bound))?;
                        }
                        None => return Err(self.undefined_property(name)),
                    }
                }

                Op::GetIndex => {
                    let idx_v = self.pop()?;
                    let arr_v = self.pop()?;
                    let v = self.index_get(arr_v, idx_v)?;
                    self.push(v)?;
                }
                Op::SetIndex => {
                    let v = self.pop()?;
                    let idx_v = self.pop()?;
                    let arr_v = self.pop()?;
                    self.index_set(arr_v, idx_v, v)?;
                    self.push(arr_v)?;
                }
                Op::ArrayLength => {
                    let arr_v = self.pop()?;
                    let h = self.as_obj(arr_v)?;
                    let len = self.heap.array(h).values.len();
                    self.push(Value::Number(len as f64))?;
                }
                Op::Array => {
                    let n = self.read_byte() as usize;
                    let start = self.stack.len() - n;
                    let values = self.stack[start..].to_vec();
                    self.stack.truncate(start);
                    let handle = self.heap.alloc_array(values);
                    self.push(Value::Obj(handle))?;
                }

                Op::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(self.heap.values_equal(a, b)))?;
                }
                Op::Greater => {
                    let (a, b) = self.pop_two_numbers()?;
                    self.push(Value::Bool(a > b))?;
                }
                Op::Less => {
                    let (a, b) = self.pop_two_numbers()?;
                    self.push(Value::Bool(a < b))?;
                }
                Op::Add => self.add()?,
                Op::Sub => {
                    let (a, b) = self.pop_two_numbers()?;
                    self.push(Value::Number(a - b))?;
                }
                Op::Mul => {
                    let (a, b) = self.pop_two_numbers()?;
                    self.push(Value::Number(a * b))?;
                }
                Op::Div => {
                    let (a, b) = self.pop_two_numbers()?;
                    self.push(Value::Number(a / b))?;
                }
                Op::Mod => {
                    let (a, b) = self.pop_two_numbers()?;
                    self.push(Value::Number(a % b))?;
                }

                Op::Increment => {
                    let v = self.pop_number()?;
                    self.push(Value::Number(v + 1.0))?;
                }
                Op::Decrement => {
                    let v = self.pop_number()?;
                    self.push(Value::Number(v - 1.0))?;
                }
                Op::Negate => {
                    let v = self.pop_number()?;
                    self.push(Value::Number(-v))?;
                }
                Op::Not => {
                    let v = self.pop()?;
                    self.push(Value::Bool(self.heap.is_falsy(v)))?;
                }

                Op::AssertType => {
                    let type_idx = self.read_byte();
                    let msg_idx = self.read_byte();
                    let v = self.peek(0)?;
                    let ty = self.obj_constant(type_idx)?;
                    let d = self.heap.data_type(ty).clone();
                    if !self.heap.value_matches_type(v, &d) {
                        let msg_handle = self.obj_constant(msg_idx)?;
                        let template = self.heap.string(msg_handle).chars.to_string();
                        let expected = self.heap.display_data_type(&d);
                        let actual = self.heap.type_name_of_value(v);
                        let msg = format_brace_message(&template, &[&expected, &actual]);
                        return Err(self.runtime_error(msg));
                    }
                }

                Op::Print => {
                    let v = self.pop()?;
                    print!("{}", self.heap.display_value(v));
                    let _ = std::io::Write::flush(&mut std::io::stdout());
                }
                Op::PrintLn => {
                    let v = self.pop()?;
                    println!("{}", self.heap.display_value(v));
                }

                Op::Jump => {
                    let offset = self.read_u16();
                    let idx = self.top_frame_index();
                    self.frames[idx].ip += offset as usize;
                }
                Op::JumpIfFalse => {
                    let offset = self.read_u16();
                    let cond = self.peek(0)?;
                    if self.heap.is_falsy(cond) {
                        let idx = self.top_frame_index();
                        self.frames[idx].ip += offset as usize;
                    }
                }
                Op::JumpBack => {
                    let offset = self.read_u16();
                    let idx = self.top_frame_index();
                    self.frames[idx].ip -= offset as usize;
                }

                Op::Call => {
                    let arg_count = self.read_byte();
                    let callee = self.peek(arg_count as usize)?;
                    self.call_value(callee, arg_count)?;
                }
                Op::Invoke => {
                    let idx = self.read_byte();
                    let name = self.obj_constant(idx)?;
                    let arg_count = self.read_byte();
                    let receiver = self.peek(arg_count as usize)?;
                    let callee = self.resolve_property(receiver, name)?;
                    let slot = self.stack.len() - 1 - arg_count as usize;
                    self.stack[slot] = callee;
                    self.call_value(callee, arg_count)?;
                }
                Op::SuperInvoke => {
                    let idx = self.read_byte();
                    let name = self.obj_constant(idx)?;
                    let arg_count = self.read_byte();
                    let superclass = self.as_class(self.pop()?)?;
                    let method = self.heap.class(superclass).methods.get(&name).copied();
                    match method {
                        Some(m) => self.call_value(Value::Obj(m), arg_count)?,
                        None => return Err(self.undefined_property(name)),
                    }
                }

                Op::Closure => {
                    let const_idx = self.read_byte();
                    let function_handle = self.obj_constant(const_idx)?;
                    let upvalue_count = self.heap.function(function_handle).upvalue_count;
                    let frame_idx = self.top_frame_index();
                    let current_closure = self.frames[frame_idx].closure;
                    let base = self.frames[frame_idx].base;
                    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte();
                        if is_local {
                            upvalues.push(self.capture_upvalue(base + index as usize));
                        } else {
                            upvalues.push(self.heap.closure(current_closure).upvalues[index as usize]);
                        }
                    }
                    let handle = self.heap.alloc_closure(ClosureObj { function: function_handle, upvalues });
                    self.push(Value::Obj(handle))?;
                }
                Op::CloseUpvalue => {
                    let idx = self.stack.len() - 1;
                    self.close_upvalues_from(idx);
                    self.pop()?;
                }

                Op::Class => {
                    let name_idx = self.read_byte();
                    let name = self.obj_constant(name_idx)?;
                    let handle = self.heap.alloc_class(ClassObj { name: Some(name), ..Default::default() });
                    self.push(Value::Obj(handle))?;
                }
                Op::Inherit => {
                    let sub = self.as_class(self.pop()?)?;
                    let sup = self.as_class(self.peek(0)?)?;
                    let methods = self.heap.class(sup).methods.clone();
                    let fields = self.heap.class(sup).fields.clone();
                    let field_types = self.heap.class(sup).field_types.clone();
                    let sub_mut = self.heap.class_mut(sub);
                    sub_mut.methods = methods;
                    sub_mut.fields = fields;
                    sub_mut.field_types = field_types;
                }
                Op::Method => {
                    let name_idx = self.read_byte();
                    let name = self.obj_constant(name_idx)?;
                    let closure = self.as_obj(self.pop()?)?;
                    let cls = self.as_class(self.peek(0)?)?;
                    self.heap.class_mut(cls).methods.insert(name, closure);
                }

                Op::Ternary => {
                    let f = self.pop()?;
                    let t = self.pop()?;
                    let cond = self.pop()?;
                    self.push(if self.heap.is_falsy(cond) { f } else { t })?;
                }
                Op::Import => {
                    let idx = self.read_byte();
                    let name = self.obj_constant(idx)?;
                    let module = self.import_module(name)?;
                    self.push(module)?;
                }

                Op::Return => {
                    let idx = self.top_frame_index();
                    let result = self.pop()?;
                    let function_handle = self.heap.closure(self.frames[idx].closure).function;
                    let return_type = self.heap.function(function_handle).return_type;
                    let d = self.heap.data_type(return_type).clone();
                    if !self.heap.value_matches_type(result, &d) {
                        return Err(self.type_error(&d, result));
                    }
                    let base = self.frames[idx].base;
                    self.close_upvalues_from(base);
                    self.stack.truncate(base);
                    self.frames.truncate(idx);
                    if self.frames.len() == floor {
                        return Ok(result);
                    }
                    self.push(result)?;
                }
                Op::Exit => {
                    let code = self.pop_number()?;
                    std::process::exit(code as i32);
                }
                Op::ScriptEnd => {
                    return Ok(self.native_vars.last);
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // Small arithmetic/type helpers
    // -----------------------------------------------------------------

    fn as_obj(&self, v: Value) -> Result<ObjHandle, RuntimeError> {
        v.as_obj().ok_or_else(|| self.runtime_error("Expected a heap value."))
    }

    fn as_class(&self, v: Value) -> Result<ObjHandle, RuntimeError> {
        let h = self.as_obj(v)?;
        if self.heap.kind_of(h) == ObjKind::Class {
            Ok(h)
        } else {
            Err(self.runtime_error("Superclass must be a class."))
        }
    }

    fn pop_number(&mut self) -> Result<f64, RuntimeError> {
        let v = self.pop()?;
        v.as_number().ok_or_else(|| self.runtime_error("Operand must be a number."))
    }

    fn pop_two_numbers(&mut self) -> Result<(f64, f64), RuntimeError> {
        let b = self.pop_number()?;
        let a = self.pop_number()?;
        Ok((a, b))
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x + y)),
            (Value::Obj(ha), Value::Obj(hb))
                if self.heap.kind_of(ha) == ObjKind::Str && self.heap.kind_of(hb) == ObjKind::Str =>
            {
                let combined = format!("{}{}", self.heap.string(ha).chars, self.heap.string(hb).chars);
                let handle = self.heap.take_string(combined);
                self.push(Value::Obj(handle))
            }
            (Value::Obj(ha), Value::Obj(hb))
                if self.heap.kind_of(ha) == ObjKind::Array && self.heap.kind_of(hb) == ObjKind::Array =>
            {
                let mut combined = self.heap.array(ha).values.clone();
                combined.extend_from_slice(&self.heap.array(hb).values);
                let handle = self.heap.alloc_array(combined);
                self.push(Value::Obj(handle))
            }
            _ => Err(self.runtime_error("Operands must be two numbers, two strings, or two arrays.")),
        }
    }

    fn index_get(&mut self, arr_v: Value, idx_v: Value) -> Result<Value, RuntimeError> {
        let h = self.as_obj(arr_v)?;
        if self.heap.kind_of(h) != ObjKind::Array {
            return Err(self.runtime_error("Only arrays can be indexed."));
        }
        let idx = idx_v.as_number().ok_or_else(|| self.runtime_error("Array index must be a number."))?;
        let count = self.heap.array(h).values.len();
        let i = self
            .normalize_index(idx, count)
            .ok_or_else(|| self.runtime_error(format!("Array index {idx} out of range.")))?;
        Ok(self.heap.array(h).values[i])
    }

    fn index_set(&mut self, arr_v: Value, idx_v: Value, value: Value) -> Result<(), RuntimeError> {
        let h = self.as_obj(arr_v)?;
        if self.heap.kind_of(h) != ObjKind::Array {
            return Err(self.runtime_error("Only arrays can be indexed."));
        }
        let idx = idx_v.as_number().ok_or_else(|| self.runtime_error("Array index must be a number."))?;
        let count = self.heap.array(h).values.len();
        let i = self
            .normalize_index(idx, count)
            .ok_or_else(|| self.runtime_error(format!("Array index {idx} out of range.")))?;
        self.heap.array_mut(h).values[i] = value;
        Ok(())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_source(src: &str) -> Result<Value, InterpretError> {
        let mut vm = Vm::new();
        vm.interpret(src, None)
    }

    #[test]
    fn arithmetic_precedence() {
        let mut vm = Vm::new();
        assert!(vm.interpret("Print 1 + 2 * 3;", None).is_ok());
    }

    #[test]
    fn foreach_over_array_literal() {
        let mut vm = Vm::new();
        assert!(vm.interpret("Var a = [1,2,3]; Foreach (x : a) PrintLn x;", None).is_ok());
    }

    #[test]
    fn fibonacci_recursion() {
        let src = "Fun fib[n]{ If(n<2) Return n; Return fib(n-1)+fib(n-2);} PrintLn fib(10);";
        assert!(run_source(src).is_ok());
    }

    #[test]
    fn closures_share_captured_state() {
        let src = "Fun mk[]{ Var c=0; Fun inc[]{ c = c+1; Return c;} Return inc; } Var f = mk(); PrintLn f(); PrintLn f();";
        assert!(run_source(src).is_ok());
    }

    #[test]
    fn inheritance_and_super_dispatch() {
        let src = "Cls A{ Fun greet[]{ PrintLn \"A\"; } } Cls B < A { Fun greet[]{ super.greet(); PrintLn \"B\"; } } B().greet();";
        assert!(run_source(src).is_ok());
    }

    #[test]
    fn negative_array_index_wraps_from_the_end() {
        let mut vm = Vm::new();
        vm.interpret("Var a = [1,2,3]; PrintLn a[-1];", None).unwrap();
    }

    #[test]
    fn out_of_range_negative_index_is_a_runtime_error() {
        let mut vm = Vm::new();
        assert!(vm.interpret("Var a = [1,2,3]; PrintLn a[-4];", None).is_err());
    }

    #[test]
    fn type_mismatch_annotation_is_a_runtime_error() {
        let mut vm = Vm::new();
        let err = vm.interpret("Var x : Num = \"hi\";", None).unwrap_err();
        match err {
            InterpretError::Runtime(e) => assert!(e.message.contains("Expected value of type Num")),
            InterpretError::Compile(_) => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn stress_gc_does_not_corrupt_a_running_program() {
        let mut vm = Vm::with_options(VmOptions::default().with_stress_gc(true));
        assert!(vm.interpret("Var a = [1,2,3]; Foreach (x : a) PrintLn x;", None).is_ok());
    }
}
