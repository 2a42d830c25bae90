//! Single-pass Pratt parser: tokens in, bytecode straight out — no AST.
//!
//! Grounded on the original's `compiler.c`, adapted to a safe-Rust shape:
//! where the original threads a module-level `Compiler *current` pointer
//! through free functions, this keeps a `Vec<FunctionState>` stack on the
//! `Compiler` value itself and a `&mut Heap` borrow for the allocations a
//! single pass needs to make as it goes (interned names, nested `Function`
//! objects, `DataType` constants for annotations).

use brace_core::{
    Chunk, DataTypeObj, FunctionObj, Heap, ObjHandle, ObjKind, Op, UpvalueRef, Value,
};

use crate::scanner::Scanner;
use crate::token::{Token, TokenKind};

#[derive(Debug, Clone, thiserror::Error)]
#[error("[line {line}] Error{at}: {message}")]
pub struct CompileError {
    pub line: u32,
    pub at: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// `-1` means declared but not yet initialized (invariant 3).
    depth: i32,
    is_captured: bool,
    ty: ObjHandle,
}

struct FunctionState<'src> {
    handle: ObjHandle,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: i32,
}

struct ClassState {
    has_superclass: bool,
}

#[derive(Clone, Copy)]
enum Target {
    Local { slot: u8, ty: ObjHandle },
    Upvalue { slot: u8, ty: ObjHandle },
    Global { name_idx: u8 },
    NVar { idx: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment,
    Ternary,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Ternary,
            Ternary => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

fn infix_precedence(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Or => Precedence::Or,
        And => Precedence::And,
        BangEqual | EqualEqual => Precedence::Equality,
        Less | LessEqual | Greater | GreaterEqual => Precedence::Comparison,
        Plus | Minus => Precedence::Term,
        Star | Slash | Modulo => Precedence::Factor,
        LeftParen | Dot | LeftBracket => Precedence::Call,
        Question => Precedence::Ternary,
        _ => Precedence::None,
    }
}

/// Reserved native-variable names, stored in a VM table distinct from
/// `globals` (see `DESIGN.md` on `nativeVars`).
const NVAR_NAMES: [&str; 4] = ["_", "_LAST", "_FUN", "_SCRIPT"];

fn nvar_index(name: &str) -> Option<u8> {
    NVAR_NAMES.iter().position(|&n| n == name).map(|i| i as u8)
}

pub struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    heap: &'h mut Heap,
    functions: Vec<FunctionState<'src>>,
    classes: Vec<ClassState>,
}

/// Compiles `source` into a top-level script `FunctionObj`, allocated (and
/// returned) on `heap`. On failure, returns every diagnostic collected
/// before panic-mode synchronization gave up — no partially-built function
/// is returned for a source with any error (spec §7).
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjHandle, Vec<CompileError>> {
    let mut c = Compiler {
        scanner: Scanner::new(source),
        previous: Token { kind: TokenKind::Eof, text: "", line: 0 },
        current: Token { kind: TokenKind::Eof, text: "", line: 0 },
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        heap,
        functions: Vec::new(),
        classes: Vec::new(),
    };
    c.begin_function_compiler(FunctionKind::Script, None);
    c.advance();
    while !c.check(TokenKind::Eof) {
        c.declaration();
    }
    c.consume(TokenKind::Eof, "Expected end of expression.");
    c.emit_op(Op::Null);
    c.emit_op(Op::Return);
    let script = c.functions.pop().expect("script compiler frame present");
    if c.had_error {
        Err(c.errors)
    } else {
        Ok(script.handle)
    }
}

impl<'src, 'h> Compiler<'src, 'h> {
    // -----------------------------------------------------------------
    // Token stream plumbing
    // -----------------------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.current.text.to_string();
            self.error_at_current(&msg);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, msg: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(msg);
    }

    fn error_at_current(&mut self, msg: &str) {
        let tok = self.current;
        self.error_at(tok, msg);
    }

    fn error(&mut self, msg: &str) {
        let tok = self.previous;
        self.error_at(tok, msg);
    }

    fn error_at(&mut self, token: Token<'src>, msg: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let at = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.text),
        };
        self.errors.push(CompileError { line: token.line, at, message: msg.to_string() });
        self.had_error = true;
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::Foreach
                | TokenKind::Exit
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::PrintLn
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // -----------------------------------------------------------------
    // Bytecode emission
    // -----------------------------------------------------------------

    fn current_fn_handle(&self) -> ObjHandle {
        self.functions.last().expect("at least one function compiler frame").handle
    }

    fn current_scope_depth(&self) -> i32 {
        self.functions.last().expect("at least one function compiler frame").scope_depth
    }

    fn current_code_len(&self) -> usize {
        self.heap.function(self.current_fn_handle()).chunk.code.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        let handle = self.current_fn_handle();
        self.heap.function_mut(handle).chunk.write_byte(byte, line);
    }

    fn emit_bytes(&mut self, a: u8, b: u8) {
        self.emit_byte(a);
        self.emit_byte(b);
    }

    fn emit_op(&mut self, op: Op) {
        self.emit_byte(op as u8);
    }

    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_code_len() - 2
    }

    fn patch_jump(&mut self, operand_pc: usize) {
        let handle = self.current_fn_handle();
        self.heap.function_mut(handle).chunk.patch_jump(operand_pc);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Op::JumpBack);
        let offset = self.current_code_len() - loop_start + 2;
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let handle = self.current_fn_handle();
        match self.heap.function_mut(handle).chunk.add_constant(value) {
            Ok(idx) => idx,
            Err(_) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.heap.intern(name);
        self.make_constant(Value::Obj(handle))
    }

    fn emit_assert_type(&mut self, type_handle: ObjHandle) {
        let type_idx = self.make_constant(Value::Obj(type_handle));
        let msg_handle = self.heap.intern("Expected value of type %s, got %s.");
        let msg_idx = self.make_constant(Value::Obj(msg_handle));
        self.emit_op(Op::AssertType);
        self.emit_byte(type_idx);
        self.emit_byte(msg_idx);
    }

    fn emit_default_value(&mut self, type_handle: ObjHandle) {
        let d = self.heap.data_type(type_handle).clone();
        if d.is_any {
            self.emit_op(Op::Null);
            return;
        }
        use brace_core::ValueKind;
        match d.value_kind {
            ValueKind::Null => self.emit_op(Op::Null),
            ValueKind::Bool => self.emit_op(Op::False),
            ValueKind::Number => {
                let idx = self.make_constant(Value::Number(0.0));
                self.emit_bytes(Op::Constant as u8, idx);
            }
            ValueKind::Type => self.emit_op(Op::Null),
            ValueKind::Obj => match d.obj_kind {
                Some(ObjKind::Str) => {
                    let h = self.heap.intern("");
                    let idx = self.make_constant(Value::Obj(h));
                    self.emit_bytes(Op::Constant as u8, idx);
                }
                Some(ObjKind::Array) => self.emit_bytes(Op::Array as u8, 0),
                _ => self.emit_op(Op::Null),
            },
        }
    }

    // -----------------------------------------------------------------
    // Scopes, locals, upvalues
    // -----------------------------------------------------------------

    fn begin_scope(&mut self) {
        self.functions.last_mut().expect("frame").scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = {
            let f = self.functions.last_mut().expect("frame");
            f.scope_depth -= 1;
            f.scope_depth
        };
        loop {
            let should_pop = {
                let f = self.functions.last().expect("frame");
                matches!(f.locals.last(), Some(l) if l.depth > depth)
            };
            if !should_pop {
                break;
            }
            let captured = self.functions.last().expect("frame").locals.last().expect("local").is_captured;
            if captured {
                self.emit_op(Op::CloseUpvalue);
            } else {
                self.emit_op(Op::Pop);
            }
            self.functions.last_mut().expect("frame").locals.pop();
        }
    }

    fn add_local(&mut self, name: &'src str, ty: ObjHandle) {
        let f = self.functions.last_mut().expect("frame");
        if f.locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        f.locals.push(Local { name, depth: -1, is_captured: false, ty });
    }

    fn declare_local(&mut self, name_tok: Token<'src>, ty: ObjHandle) {
        let depth = self.current_scope_depth();
        if depth == 0 {
            return;
        }
        let name = name_tok.text;
        let dup = {
            let locals = &self.functions.last().expect("frame").locals;
            let mut found = false;
            for l in locals.iter().rev() {
                if l.depth != -1 && l.depth < depth {
                    break;
                }
                if l.name == name {
                    found = true;
                    break;
                }
            }
            found
        };
        if dup {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name, ty);
    }

    fn mark_initialized(&mut self) {
        let depth = self.current_scope_depth();
        if depth == 0 {
            return;
        }
        let f = self.functions.last_mut().expect("frame");
        if let Some(l) = f.locals.last_mut() {
            l.depth = depth;
        }
    }

    fn resolve_local_in(&mut self, func_idx: usize, name: &str) -> Option<(u8, ObjHandle)> {
        let mut found: Option<(u8, i32, ObjHandle)> = None;
        {
            let locals = &self.functions[func_idx].locals;
            for i in (0..locals.len()).rev() {
                if locals[i].name == name {
                    found = Some((i as u8, locals[i].depth, locals[i].ty));
                    break;
                }
            }
        }
        let (slot, depth, ty) = found?;
        if depth == -1 {
            self.error("Cannot read local variable in its own initializer.");
        }
        Some((slot, ty))
    }

    fn resolve_local(&mut self, name: &str) -> Option<(u8, ObjHandle)> {
        let idx = self.functions.len() - 1;
        self.resolve_local_in(idx, name)
    }

    fn add_upvalue(&mut self, func_idx: usize, index: u8, is_local: bool) -> u8 {
        let existing = self.functions[func_idx]
            .upvalues
            .iter()
            .position(|uv| uv.index == index && uv.is_local == is_local);
        if let Some(i) = existing {
            return i as u8;
        }
        if self.functions[func_idx].upvalues.len() >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.functions[func_idx].upvalues.push(UpvalueRef { is_local, index });
        (self.functions[func_idx].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue(&mut self, func_idx: usize, name: &str) -> Option<(u8, ObjHandle)> {
        if func_idx == 0 {
            return None;
        }
        let enclosing = func_idx - 1;
        if let Some((slot, ty)) = self.resolve_local_in(enclosing, name) {
            self.functions[enclosing].locals[slot as usize].is_captured = true;
            let upvalue_idx = self.add_upvalue(func_idx, slot, true);
            return Some((upvalue_idx, ty));
        }
        if let Some((slot, ty)) = self.resolve_upvalue(enclosing, name) {
            let upvalue_idx = self.add_upvalue(func_idx, slot, false);
            return Some((upvalue_idx, ty));
        }
        None
    }

    // -----------------------------------------------------------------
    // Types
    // -----------------------------------------------------------------

    fn parse_type(&mut self) -> ObjHandle {
        self.consume(TokenKind::Identifier, "Expected type name.");
        let name = self.previous.text;
        use brace_core::ValueKind;
        let data_type = match name {
            "Any" => DataTypeObj::any(),
            "Null" => DataTypeObj::primitive(ValueKind::Null),
            "Bool" => DataTypeObj::primitive(ValueKind::Bool),
            "Num" => DataTypeObj::primitive(ValueKind::Number),
            "Type" => DataTypeObj::primitive(ValueKind::Type),
            "Str" => DataTypeObj::object(ObjKind::Str),
            "Arr" => DataTypeObj::object(ObjKind::Array),
            "Fun" => DataTypeObj::object(ObjKind::Function),
            "Module" => DataTypeObj::object(ObjKind::Module),
            _ => {
                let name_handle = self.heap.intern(name);
                DataTypeObj::class(name_handle)
            }
        };
        self.heap.alloc_data_type(data_type)
    }

    // -----------------------------------------------------------------
    // Declarations & statements
    // -----------------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::PrintLn) {
            self.println_statement();
        } else if self.match_token(TokenKind::Exit) {
            self.exit_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Foreach) {
            self.foreach_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block_body();
            self.end_scope();
        } else if self.match_token(TokenKind::Use) {
            self.use_statement();
        } else {
            self.expression_statement();
        }
    }

    fn block_body(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after block.");
    }

    fn var_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expected variable name.");
        let name_tok = self.previous;
        if nvar_index(name_tok.text).is_some() {
            self.error("Cannot redeclare a native variable.");
        }
        let ty = if self.match_token(TokenKind::Colon) {
            self.parse_type()
        } else {
            self.heap.alloc_data_type(DataTypeObj::any())
        };
        let is_global = self.current_scope_depth() == 0;
        if !is_global {
            self.declare_local(name_tok, ty);
        }
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_default_value(ty);
        }
        self.consume(TokenKind::Semicolon, "Expected ';' after variable declaration.");
        self.emit_assert_type(ty);
        if is_global {
            let name_idx = self.identifier_constant(name_tok.text);
            let type_idx = self.make_constant(Value::Obj(ty));
            self.emit_bytes(Op::DefineGlobal as u8, name_idx);
            self.emit_byte(type_idx);
        } else {
            self.mark_initialized();
        }
    }

    fn use_statement(&mut self) {
        self.consume(TokenKind::Identifier, "Expected module name after 'Use'.");
        let name_tok = self.previous;
        let name_idx = self.identifier_constant(name_tok.text);
        let module_ty = self.heap.alloc_data_type(DataTypeObj::object(ObjKind::Module));
        let is_global = self.current_scope_depth() == 0;
        if !is_global {
            self.declare_local(name_tok, module_ty);
        }
        self.emit_bytes(Op::Import as u8, name_idx);
        if is_global {
            let type_idx = self.make_constant(Value::Obj(module_ty));
            self.emit_bytes(Op::DefineGlobal as u8, name_idx);
            self.emit_byte(type_idx);
        } else {
            self.mark_initialized();
        }
        self.consume(TokenKind::Semicolon, "Expected ';' after module name.");
    }

    fn fun_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expected function name.");
        let name_tok = self.previous;
        let is_global = self.current_scope_depth() == 0;
        if !is_global {
            let ty = self.heap.alloc_data_type(DataTypeObj::object(ObjKind::Function));
            self.declare_local(name_tok, ty);
            self.mark_initialized();
        }
        self.function(FunctionKind::Function, Some(name_tok.text));
        if is_global {
            let name_idx = self.identifier_constant(name_tok.text);
            let ty = self.heap.alloc_data_type(DataTypeObj::object(ObjKind::Function));
            let type_idx = self.make_constant(Value::Obj(ty));
            self.emit_bytes(Op::DefineGlobal as u8, name_idx);
            self.emit_byte(type_idx);
        }
    }

    fn begin_function_compiler(&mut self, kind: FunctionKind, name_handle: Option<ObjHandle>) {
        let return_type = self.heap.alloc_data_type(DataTypeObj::any());
        let handle = self.heap.alloc_function(FunctionObj {
            arity: 0,
            upvalue_count: 0,
            name: name_handle,
            return_type,
            param_types: Vec::new(),
            chunk: Chunk::new(),
        });
        let slot0_name: &'src str =
            if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) { "this" } else { "" };
        let slot0_ty = self.heap.alloc_data_type(DataTypeObj::any());
        let locals = vec![Local { name: slot0_name, depth: 0, is_captured: false, ty: slot0_ty }];
        self.functions.push(FunctionState { handle, kind, locals, upvalues: Vec::new(), scope_depth: 0 });
    }

    fn end_function_compiler(&mut self) {
        let finished = self.functions.pop().expect("function compiler frame");
        let handle = finished.handle;
        self.heap.function_mut(handle).upvalue_count = finished.upvalues.len() as u8;
        let const_idx = self.make_constant(Value::Obj(handle));
        self.emit_bytes(Op::Closure as u8, const_idx);
        for uv in &finished.upvalues {
            self.emit_byte(if uv.is_local { 1 } else { 0 });
            self.emit_byte(uv.index);
        }
    }

    fn function(&mut self, kind: FunctionKind, name: Option<&str>) {
        let name_handle = name.map(|n| self.heap.intern(n));
        self.begin_function_compiler(kind, name_handle);

        if self.match_token(TokenKind::Arrow) {
            let rt = self.parse_type();
            let handle = self.current_fn_handle();
            self.heap.function_mut(handle).return_type = rt;
        }

        self.consume(TokenKind::LeftBracket, "Expected '[' to start parameter list.");
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.consume(TokenKind::Identifier, "Expected parameter name.");
                let param_tok = self.previous;
                let param_ty = if self.match_token(TokenKind::Colon) {
                    self.parse_type()
                } else {
                    self.heap.alloc_data_type(DataTypeObj::any())
                };
                self.declare_local(param_tok, param_ty);
                self.mark_initialized();
                let handle = self.current_fn_handle();
                self.heap.function_mut(handle).param_types.push(param_ty);
                self.heap.function_mut(handle).arity += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expected ']' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expected '{' before function body.");
        self.block_body();

        if matches!(kind, FunctionKind::Initializer) {
            self.emit_bytes(Op::GetLocal as u8, 0);
            self.emit_op(Op::Return);
        } else {
            self.emit_op(Op::Null);
            self.emit_op(Op::Return);
        }

        self.end_function_compiler();
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expected class name.");
        let name_tok = self.previous;
        let class_name = name_tok.text;
        let name_idx = self.identifier_constant(class_name);
        let class_ty = {
            let h = self.heap.intern(class_name);
            self.heap.alloc_data_type(DataTypeObj::class(h))
        };
        let is_global = self.current_scope_depth() == 0;
        if !is_global {
            self.declare_local(name_tok, class_ty);
        }
        self.emit_bytes(Op::Class as u8, name_idx);
        if is_global {
            let type_idx = self.make_constant(Value::Obj(class_ty));
            self.emit_bytes(Op::DefineGlobal as u8, name_idx);
            self.emit_byte(type_idx);
        } else {
            self.mark_initialized();
        }

        self.classes.push(ClassState { has_superclass: false });

        let mut has_superclass = false;
        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expected superclass name.");
            let super_tok = self.previous;
            if super_tok.text == class_name {
                self.error("A class cannot inherit from itself.");
            }
            self.named_variable(super_tok, false);
            self.begin_scope();
            self.add_local("super", class_ty);
            self.mark_initialized();
            self.named_variable(name_tok, false);
            self.emit_op(Op::Inherit);
            has_superclass = true;
        }
        if let Some(cs) = self.classes.last_mut() {
            cs.has_superclass = has_superclass;
        }

        self.named_variable(name_tok, false);
        self.consume(TokenKind::LeftBrace, "Expected '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.class_member();
        }
        self.consume(TokenKind::RightBrace, "Expected '}' after class body.");
        self.emit_op(Op::Pop);

        if has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn class_member(&mut self) {
        if self.match_token(TokenKind::Var) {
            self.field_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.method_declaration();
        } else {
            self.error_at_current("Expected field or method declaration.");
            self.advance();
        }
    }

    fn field_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expected field name.");
        let name_tok = self.previous;
        let name_idx = self.identifier_constant(name_tok.text);
        let ty = if self.match_token(TokenKind::Colon) {
            self.parse_type()
        } else {
            self.heap.alloc_data_type(DataTypeObj::any())
        };
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_default_value(ty);
        }
        self.consume(TokenKind::Semicolon, "Expected ';' after field declaration.");
        let type_idx = self.make_constant(Value::Obj(ty));
        self.emit_bytes(Op::DefineField as u8, name_idx);
        self.emit_byte(type_idx);
    }

    fn method_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expected method name.");
        let name_tok = self.previous;
        let name_idx = self.identifier_constant(name_tok.text);
        let kind = if name_tok.text == "Init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind, Some(name_tok.text));
        self.emit_bytes(Op::Method as u8, name_idx);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' after 'If'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition.");
        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        let else_jump = self.emit_jump(Op::Jump);
        self.patch_jump(then_jump);
        self.emit_op(Op::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_code_len();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'While'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after condition.");
        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(Op::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'For'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer clause
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_code_len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit_op(Op::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Op::Jump);
            let incr_start = self.current_code_len();
            self.expression();
            self.emit_op(Op::Pop);
            self.consume(TokenKind::RightParen, "Expected ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = incr_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);
        if let Some(ej) = exit_jump {
            self.patch_jump(ej);
            self.emit_op(Op::Pop);
        }
        self.end_scope();
    }

    fn foreach_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expected '(' after 'Foreach'.");
        self.consume(TokenKind::Identifier, "Expected loop variable name.");
        let item_tok = self.previous;
        let item_ty = self.heap.alloc_data_type(DataTypeObj::any());
        self.declare_local(item_tok, item_ty);
        self.emit_op(Op::Null);
        self.mark_initialized();
        let item_slot = (self.functions.last().expect("frame").locals.len() - 1) as u8;

        self.consume(TokenKind::Colon, "Expected ':' after loop variable name.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after iterable.");

        self.emit_bytes(Op::Duplicate as u8, 0);
        self.emit_op(Op::ArrayLength);
        let loop_start = self.current_code_len();
        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_bytes(Op::Duplicate as u8, 1);
        self.emit_bytes(Op::Duplicate as u8, 1);
        self.emit_op(Op::Negate);
        self.emit_op(Op::GetIndex);
        self.emit_bytes(Op::SetLocal as u8, item_slot);
        self.statement();
        self.emit_op(Op::Pop);
        self.emit_op(Op::Decrement);
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(Op::Pop);
        self.emit_op(Op::Pop);
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.functions.len() == 1 {
            self.error("Cannot return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            if matches!(self.functions.last().expect("frame").kind, FunctionKind::Initializer) {
                self.emit_bytes(Op::GetLocal as u8, 0);
            } else {
                self.emit_op(Op::Null);
            }
            self.emit_op(Op::Return);
            return;
        }
        if matches!(self.functions.last().expect("frame").kind, FunctionKind::Initializer) {
            self.error("Cannot return a value from an initializer.");
        }
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after return value.");
        let ret_ty = self.heap.function(self.current_fn_handle()).return_type;
        self.emit_assert_type(ret_ty);
        self.emit_op(Op::Return);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after value.");
        self.emit_op(Op::Print);
    }

    fn println_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after value.");
        self.emit_op(Op::PrintLn);
    }

    fn exit_statement(&mut self) {
        if self.match_token(TokenKind::Semicolon) {
            let idx = self.make_constant(Value::Number(0.0));
            self.emit_bytes(Op::Constant as u8, idx);
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expected ';' after exit code.");
        }
        self.emit_op(Op::Exit);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expected ';' after expression.");
        self.emit_op(Op::UpdateLast);
        self.emit_op(Op::Pop);
    }

    // -----------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expected expression.");
            return;
        }
        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }
        if can_assign
            && (self.check(TokenKind::Equal)
                || self.check(TokenKind::PlusEqual)
                || self.check(TokenKind::MinusEqual)
                || self.check(TokenKind::PlusPlus)
                || self.check(TokenKind::MinusMinus))
        {
            self.error_at_current("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string_lit(),
            TokenKind::True | TokenKind::False | TokenKind::Null => self.literal(),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::This => self.this_(),
            TokenKind::Super => self.super_(),
            TokenKind::LeftBracket => self.array_literal(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::Modulo
            | TokenKind::EqualEqual
            | TokenKind::BangEqual
            | TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual => self.binary(),
            TokenKind::And => self.and_(),
            TokenKind::Or => self.or_(),
            TokenKind::Question => self.ternary(),
            TokenKind::LeftParen => self.call(),
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::LeftBracket => self.index_(can_assign),
            _ => {}
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expected ')' after expression.");
    }

    fn unary(&mut self) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(Op::Negate),
            TokenKind::Bang => self.emit_op(Op::Not),
            _ => unreachable!("unary() only dispatched for '-'/'!'"),
        }
    }

    fn binary(&mut self) {
        let op_kind = self.previous.kind;
        let prec = infix_precedence(op_kind);
        self.parse_precedence(prec.next());
        match op_kind {
            TokenKind::Plus => self.emit_op(Op::Add),
            TokenKind::Minus => self.emit_op(Op::Sub),
            TokenKind::Star => self.emit_op(Op::Mul),
            TokenKind::Slash => self.emit_op(Op::Div),
            TokenKind::Modulo => self.emit_op(Op::Mod),
            TokenKind::EqualEqual => self.emit_op(Op::Equal),
            TokenKind::BangEqual => {
                self.emit_op(Op::Equal);
                self.emit_op(Op::Not);
            }
            TokenKind::Less => self.emit_op(Op::Less),
            TokenKind::LessEqual => {
                self.emit_op(Op::Greater);
                self.emit_op(Op::Not);
            }
            TokenKind::Greater => self.emit_op(Op::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(Op::Less);
                self.emit_op(Op::Not);
            }
            _ => unreachable!("binary() only dispatched for binary operators"),
        }
    }

    fn and_(&mut self) {
        let end_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn ternary(&mut self) {
        self.expression();
        self.consume(TokenKind::Colon, "Expected ':' in ternary expression.");
        self.parse_precedence(Precedence::Ternary);
        self.emit_op(Op::Ternary);
    }

    fn number(&mut self) {
        let value: f64 = self.previous.text.parse().unwrap_or(0.0);
        let idx = self.make_constant(Value::Number(value));
        self.emit_bytes(Op::Constant as u8, idx);
    }

    fn string_lit(&mut self) {
        let raw = self.previous.text;
        let inner = &raw[1..raw.len() - 1];
        let mut s = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some('r') => s.push('\r'),
                    Some('"') => s.push('"'),
                    Some('\\') => s.push('\\'),
                    Some(other) => {
                        s.push('\\');
                        s.push(other);
                    }
                    None => {}
                }
            } else {
                s.push(c);
            }
        }
        let handle = self.heap.take_string(s);
        let idx = self.make_constant(Value::Obj(handle));
        self.emit_bytes(Op::Constant as u8, idx);
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::True => self.emit_op(Op::True),
            TokenKind::False => self.emit_op(Op::False),
            TokenKind::Null => self.emit_op(Op::Null),
            _ => unreachable!("literal() only dispatched for true/false/null"),
        }
    }

    fn array_literal(&mut self) {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expected ']' after array elements.");
        if count > 255 {
            self.error("Cannot have more than 255 array literal elements.");
        }
        self.emit_bytes(Op::Array as u8, count as u8);
    }

    fn call(&mut self) {
        let arg_count = self.argument_list(TokenKind::RightParen);
        self.emit_bytes(Op::Call as u8, arg_count);
    }

    fn argument_list(&mut self, closing: TokenKind) -> u8 {
        let mut count: u16 = 0;
        if !self.check(closing) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Cannot have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(closing, "Expected ')' after arguments.");
        count as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expected property name after '.'.");
        let name_idx = self.identifier_constant(self.previous.text);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(Op::SetProperty as u8, name_idx);
        } else if can_assign && (self.check(TokenKind::PlusEqual) || self.check(TokenKind::MinusEqual)) {
            let is_plus = self.check(TokenKind::PlusEqual);
            self.advance();
            self.emit_bytes(Op::Duplicate as u8, 0);
            self.emit_bytes(Op::GetProperty as u8, name_idx);
            self.expression();
            self.emit_op(if is_plus { Op::Add } else { Op::Sub });
            self.emit_bytes(Op::SetProperty as u8, name_idx);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list(TokenKind::RightParen);
            self.emit_bytes(Op::Invoke as u8, name_idx);
            self.emit_byte(arg_count);
        } else {
            self.emit_bytes(Op::GetProperty as u8, name_idx);
        }
    }

    fn index_(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expected ']' after index.");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(Op::SetIndex);
        } else if can_assign && (self.check(TokenKind::PlusEqual) || self.check(TokenKind::MinusEqual)) {
            let is_plus = self.check(TokenKind::PlusEqual);
            self.advance();
            self.emit_bytes(Op::Duplicate as u8, 1);
            self.emit_bytes(Op::Duplicate as u8, 1);
            self.emit_op(Op::GetIndex);
            self.expression();
            self.emit_op(if is_plus { Op::Add } else { Op::Sub });
            self.emit_op(Op::SetIndex);
        } else {
            self.emit_op(Op::GetIndex);
        }
    }

    fn emit_load(&mut self, target: &Target) {
        match *target {
            Target::Local { slot, .. } => self.emit_bytes(Op::GetLocal as u8, slot),
            Target::Upvalue { slot, .. } => self.emit_bytes(Op::GetUpvalue as u8, slot),
            Target::Global { name_idx } => self.emit_bytes(Op::GetGlobal as u8, name_idx),
            Target::NVar { idx } => self.emit_bytes(Op::GetNVar as u8, idx),
        }
    }

    fn emit_store(&mut self, target: &Target) {
        match *target {
            Target::Local { slot, .. } => self.emit_bytes(Op::SetLocal as u8, slot),
            Target::Upvalue { slot, .. } => self.emit_bytes(Op::SetUpvalue as u8, slot),
            Target::Global { name_idx } => self.emit_bytes(Op::SetGlobal as u8, name_idx),
            Target::NVar { idx } => self.emit_bytes(Op::SetNVar as u8, idx),
        }
    }

    fn assert_type_for_target(&mut self, target: &Target) {
        match *target {
            Target::Local { ty, .. } | Target::Upvalue { ty, .. } => self.emit_assert_type(ty),
            Target::Global { .. } | Target::NVar { .. } => {}
        }
    }

    fn compile_assignment(&mut self, target: Target, can_assign: bool) {
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.assert_type_for_target(&target);
            self.emit_store(&target);
        } else if can_assign && self.match_token(TokenKind::PlusEqual) {
            self.emit_load(&target);
            self.expression();
            self.emit_op(Op::Add);
            self.assert_type_for_target(&target);
            self.emit_store(&target);
        } else if can_assign && self.match_token(TokenKind::MinusEqual) {
            self.emit_load(&target);
            self.expression();
            self.emit_op(Op::Sub);
            self.assert_type_for_target(&target);
            self.emit_store(&target);
        } else if can_assign && self.match_token(TokenKind::PlusPlus) {
            self.emit_load(&target);
            let idx = self.make_constant(Value::Number(1.0));
            self.emit_bytes(Op::Constant as u8, idx);
            self.emit_op(Op::Add);
            self.assert_type_for_target(&target);
            self.emit_store(&target);
        } else if can_assign && self.match_token(TokenKind::MinusMinus) {
            self.emit_load(&target);
            let idx = self.make_constant(Value::Number(1.0));
            self.emit_bytes(Op::Constant as u8, idx);
            self.emit_op(Op::Sub);
            self.assert_type_for_target(&target);
            self.emit_store(&target);
        } else {
            self.emit_load(&target);
        }
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let text = name.text;
        if let Some(idx) = nvar_index(text) {
            self.compile_assignment(Target::NVar { idx }, can_assign);
            return;
        }
        if let Some((slot, ty)) = self.resolve_local(text) {
            self.compile_assignment(Target::Local { slot, ty }, can_assign);
            return;
        }
        let depth = self.functions.len() - 1;
        if let Some((slot, ty)) = self.resolve_upvalue(depth, text) {
            self.compile_assignment(Target::Upvalue { slot, ty }, can_assign);
            return;
        }
        let name_idx = self.identifier_constant(text);
        self.compile_assignment(Target::Global { name_idx }, can_assign);
    }

    fn variable(&mut self, can_assign: bool) {
        let tok = self.previous;
        self.named_variable(tok, can_assign);
    }

    fn load_named(&mut self, name: &'static str) {
        if let Some((slot, _ty)) = self.resolve_local(name) {
            self.emit_bytes(Op::GetLocal as u8, slot);
            return;
        }
        let depth = self.functions.len() - 1;
        if let Some((slot, _ty)) = self.resolve_upvalue(depth, name) {
            self.emit_bytes(Op::GetUpvalue as u8, slot);
            return;
        }
        self.error("Cannot resolve binding.");
    }

    fn this_(&mut self) {
        if self.classes.is_empty() {
            self.error("Cannot use 'this' outside of a class.");
            return;
        }
        self.load_named("this");
    }

    fn super_(&mut self) {
        if self.classes.is_empty() {
            self.error("Cannot use 'super' outside of a class.");
        } else if !self.classes.last().expect("checked non-empty above").has_superclass {
            self.error("Cannot use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expected '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expected superclass method name.");
        let name_idx = self.identifier_constant(self.previous.text);
        self.load_named("this");
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list(TokenKind::RightParen);
            self.load_named("super");
            self.emit_bytes(Op::SuperInvoke as u8, name_idx);
            self.emit_byte(arg_count);
        } else {
            self.load_named("super");
            self.emit_bytes(Op::GetSuper as u8, name_idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brace_core::Heap;

    fn try_compile(src: &str) -> Result<ObjHandle, Vec<CompileError>> {
        let mut heap = Heap::new();
        compile(src, &mut heap)
    }

    #[test]
    fn compiles_arithmetic_print() {
        assert!(try_compile("Print 1 + 2 * 3;").is_ok());
    }

    #[test]
    fn compiles_fibonacci() {
        let src = "Fun fib[n]{ If(n<2) Return n; Return fib(n-1)+fib(n-2);} PrintLn fib(10);";
        assert!(try_compile(src).is_ok());
    }

    #[test]
    fn compiles_closures() {
        let src = "Fun mk[]{ Var c=0; Fun inc[]{ c = c+1; Return c;} Return inc; } Var f = mk(); PrintLn f();";
        assert!(try_compile(src).is_ok());
    }

    #[test]
    fn compiles_inheritance_and_super() {
        let src = "Cls A{ Fun greet[]{ PrintLn \"A\"; } } Cls B < A { Fun greet[]{ super.greet(); PrintLn \"B\"; } } B().greet();";
        assert!(try_compile(src).is_ok());
    }

    #[test]
    fn self_inheritance_is_a_compile_error() {
        assert!(try_compile("Cls A < A { }").is_err());
    }

    #[test]
    fn redeclaring_a_native_variable_is_a_compile_error() {
        assert!(try_compile("Var _LAST = 1;").is_err());
    }

    #[test]
    fn returning_a_value_from_an_initializer_is_a_compile_error() {
        let src = "Cls A { Fun Init[]{ Return 1; } }";
        assert!(try_compile(src).is_err());
    }

    #[test]
    fn bare_return_in_initializer_is_allowed() {
        let src = "Cls A { Fun Init[]{ Return; } }";
        assert!(try_compile(src).is_ok());
    }

    #[test]
    fn more_than_256_constants_in_one_chunk_is_a_compile_error() {
        let mut src = String::new();
        for i in 0..257 {
            src.push_str(&format!("{}.5;\n", i));
        }
        assert!(try_compile(&src).is_err());
    }

    #[test]
    fn reading_own_initializer_is_a_compile_error() {
        assert!(try_compile("{ Var a = a; }").is_err());
    }

    #[test]
    fn for_with_all_clauses_omitted_compiles() {
        assert!(try_compile("For (;;) { Exit 0; }").is_ok());
    }

    #[test]
    fn foreach_over_array_literal_compiles() {
        assert!(try_compile("Var a = [1,2,3]; Foreach (x : a) PrintLn x;").is_ok());
    }

    #[test]
    fn type_mismatch_annotation_compiles_ok_and_defers_to_runtime() {
        // The compiler only emits the assertion; mismatch is a *runtime* error.
        assert!(try_compile("Var x : Num = \"hi\";").is_ok());
    }
}
