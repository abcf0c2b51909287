//! The single-pass compiler.
//!
//! A Pratt expression parser fused with a recursive-descent statement
//! parser; bytecode is emitted directly into the current function's chunk
//! with no intermediate AST. Locals map 1:1 onto runtime stack slots
//! relative to the call frame base (slot 0 holds the callee); upvalues are
//! resolved lazily by walking enclosing functions.

mod expr;
mod stmt;

use std::rc::Rc;

use crate::chunk::Chunk;
use crate::heap::{FunctionId, Heap, StringId};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::object::{FunctionObject, TypeHint};
use crate::op_code::OpCode;
use crate::optimizer;
use crate::value::Value;

/// Expression precedence, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Prec {
    None,
    Or,
    And,
    Comparison,
    Range,
    Term,
    Factor,
    Unary,
    Power,
    Call,
}

impl Prec {
    pub(crate) fn next(self) -> Prec {
        use Prec::*;
        match self {
            None => Or,
            Or => And,
            And => Comparison,
            Comparison => Range,
            Range => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Power,
            Power => Call,
            Call => Call,
        }
    }
}

/// A compile-time local slot.
struct Local {
    name: String,
    /// Scope depth, or -1 while declared but not yet initialized.
    depth: isize,
    captured: bool,
}

/// A compile-time upvalue entry.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Upvalue {
    index: u8,
    is_local: bool,
}

/// Loop bookkeeping for break/continue.
struct LoopState {
    /// Backward jump target for `continue`, or `usize::MAX` when the
    /// continue point lies ahead (numeric for loops).
    continue_target: usize,
    /// Forward jumps patched to the end of the loop.
    break_jumps: Vec<usize>,
    /// Forward jumps patched to the loop's increment instruction.
    continue_jumps: Vec<usize>,
    /// Local count at loop-body entry; break/continue pop back to this.
    local_base: usize,
}

/// What kind of function body is being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FuncKind {
    Script,
    Function,
    Method,
}

/// Per-function compilation state.
struct FuncState {
    chunk: Chunk,
    kind: FuncKind,
    name: Option<StringId>,
    doc: Option<StringId>,
    arity: usize,
    is_variadic: bool,
    is_self: bool,
    is_generator: bool,
    defaults: Vec<Value>,
    param_names: Vec<StringId>,
    param_types: Vec<TypeHint>,
    locals: Vec<Local>,
    upvalues: Vec<Upvalue>,
    scope_depth: usize,
    loops: Vec<LoopState>,
}

impl FuncState {
    fn new(kind: FuncKind, name: Option<StringId>) -> Self {
        let slot_zero = Local {
            // Slot 0 holds the callee.
            name: String::new(),
            depth: 0,
            captured: false,
        };
        FuncState {
            chunk: Chunk::new(),
            kind,
            name,
            doc: None,
            arity: 0,
            is_variadic: false,
            is_self: false,
            is_generator: false,
            defaults: Vec::new(),
            param_names: Vec::new(),
            param_types: Vec::new(),
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

/// The compiler. Owns the token stream and a stack of function states.
pub struct Compiler<'h> {
    heap: &'h mut Heap,
    tokens: Vec<Token>,
    pos: usize,
    previous: Token,
    current: Token,
    had_error: bool,
    panic_mode: bool,
    funcs: Vec<FuncState>,
    /// Code offset of a `Range` instruction just emitted, so `for … in`
    /// can skip its iterator prelude.
    pub(crate) range_emitted_at: Option<usize>,
    /// Code offset of a table-literal `NewTable`, for the ipairs prelude.
    pub(crate) table_literal_at: Option<usize>,
    /// True while compiling a for-in iterable, where `..` is allowed.
    pub(crate) allow_range: bool,
}

/// Compiles a source string to a top-level function.
///
/// On failure every diagnostic has already been written to stderr and
/// `None` is returned.
pub fn compile(source: &str, heap: &mut Heap) -> Option<FunctionId> {
    let tokens = Lexer::new(source).scan();
    let mut compiler = Compiler::new(heap, tokens);
    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.skip_statement_separators();
        if compiler.check(TokenKind::Eof) {
            break;
        }
        compiler.declaration();
    }
    let had_error = compiler.had_error;
    let function = compiler.finish_function();
    if had_error {
        None
    } else {
        Some(function)
    }
}

impl<'h> Compiler<'h> {
    fn new(heap: &'h mut Heap, tokens: Vec<Token>) -> Self {
        let placeholder = Token {
            kind: TokenKind::Eof,
            text: String::new(),
            line: 0,
        };
        Compiler {
            heap,
            tokens,
            pos: 0,
            previous: placeholder.clone(),
            current: placeholder,
            had_error: false,
            panic_mode: false,
            funcs: vec![FuncState::new(FuncKind::Script, None)],
            range_emitted_at: None,
            table_literal_at: None,
            allow_range: false,
        }
    }

    // === Token plumbing ===

    pub(crate) fn advance(&mut self) {
        self.previous = std::mem::replace(
            &mut self.current,
            Token {
                kind: TokenKind::Eof,
                text: String::new(),
                line: self.previous.line,
            },
        );
        loop {
            if self.pos < self.tokens.len() {
                self.current = self.tokens[self.pos].clone();
                self.pos += 1;
            }
            if self.current.kind == TokenKind::Error {
                let message = self.current.text.clone();
                self.error_at_current(&message);
            } else {
                break;
            }
        }
    }

    pub(crate) fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    /// Looks one token past `current` without consuming anything.
    pub(crate) fn check_next(&self, kind: TokenKind) -> bool {
        self.tokens.get(self.pos).map(|t| t.kind) == Some(kind)
    }

    pub(crate) fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    pub(crate) fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.check(kind) {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    pub(crate) fn error(&mut self, message: &str) {
        let line = self.previous.line;
        self.report(line, message);
    }

    pub(crate) fn error_at_current(&mut self, message: &str) {
        let line = self.current.line;
        self.report(line, message);
    }

    fn report(&mut self, line: u32, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        eprintln!("[line {line}] Error: {message}");
    }

    pub(crate) fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            use TokenKind::*;
            match self.current.kind {
                Newline | Semicolon => {
                    self.advance();
                    return;
                }
                Fn | Local | If | While | For | Return | Try | Throw | Import | From | Match => {
                    return;
                }
                _ => self.advance(),
            }
        }
    }

    /// Consumes newline/semicolon runs plus stray `end` markers at the top
    /// level of a statement list.
    pub(crate) fn skip_statement_separators(&mut self) {
        loop {
            match self.current.kind {
                TokenKind::Newline | TokenKind::Semicolon => self.advance(),
                TokenKind::End if self.funcs.len() == 1 && self.func().scope_depth == 0 => {
                    self.advance()
                }
                _ => return,
            }
        }
    }

    // === Function state access ===

    pub(crate) fn func(&self) -> &FuncState {
        self.funcs.last().expect("compiler function stack empty")
    }

    fn func_mut(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("compiler function stack empty")
    }

    pub(crate) fn chunk_len(&self) -> usize {
        self.func().chunk.code.len()
    }

    pub(crate) fn local_count(&self) -> usize {
        self.func().locals.len()
    }

    pub(crate) fn mark_generator(&mut self) {
        self.func_mut().is_generator = true;
    }

    pub(crate) fn heap_mut(&mut self) -> &mut Heap {
        self.heap
    }

    // === Emission ===

    pub(crate) fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.func_mut().chunk.write(byte, line);
    }

    pub(crate) fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    pub(crate) fn emit_ops(&mut self, a: OpCode, b: OpCode) {
        self.emit_op(a);
        self.emit_op(b);
    }

    pub(crate) fn emit_with_operand(&mut self, op: OpCode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    /// Emits a forward jump; returns the offset of its operand for patching.
    pub(crate) fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    pub(crate) fn patch_jump(&mut self, operand_offset: usize) {
        let jump = self.chunk_len() - operand_offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = &mut self.func_mut().chunk;
        chunk.code[operand_offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[operand_offset + 1] = (jump & 0xff) as u8;
    }

    /// Patches a two-byte operand at an arbitrary offset to `jump`.
    pub(crate) fn patch_short(&mut self, operand_offset: usize, jump: usize) {
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let chunk = &mut self.func_mut().chunk;
        chunk.code[operand_offset] = ((jump >> 8) & 0xff) as u8;
        chunk.code[operand_offset + 1] = (jump & 0xff) as u8;
    }

    /// Emits a backward jump to `target`.
    pub(crate) fn emit_loop(&mut self, target: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.chunk_len() - target + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    pub(crate) fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_with_operand(OpCode::Constant, index);
    }

    pub(crate) fn make_constant(&mut self, value: Value) -> u8 {
        match self.func_mut().chunk.add_constant(value) {
            Ok(index) => index,
            Err(_) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    /// Adds a string constant, reusing an existing pool entry with the same
    /// content.
    pub(crate) fn string_constant(&mut self, text: &str) -> u8 {
        for (index, constant) in self.func().chunk.constants.iter().enumerate() {
            if let Value::Str(id) = constant {
                if self.heap.string(*id).chars == text {
                    return index as u8;
                }
            }
        }
        let id = self.heap.alloc_str(text);
        self.make_constant(Value::Str(id))
    }

    // === Scopes and variables ===

    pub(crate) fn begin_scope(&mut self) {
        self.func_mut().scope_depth += 1;
    }

    pub(crate) fn end_scope(&mut self) {
        self.func_mut().scope_depth -= 1;
        let depth = self.func().scope_depth as isize;
        while self
            .func()
            .locals
            .last()
            .is_some_and(|local| local.depth > depth)
        {
            let captured = self.func().locals.last().is_some_and(|l| l.captured);
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.func_mut().locals.pop();
        }
    }

    /// Emits pops for locals above `base` without ending their scope, for
    /// break/continue.
    pub(crate) fn emit_pops_to(&mut self, base: usize) {
        for index in (base..self.local_count()).rev() {
            if self.func().locals[index].captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    /// Declares a local in the current scope; errors on duplicates.
    pub(crate) fn declare_local(&mut self, name: &str) {
        if self.func().locals.len() > u8::MAX as usize {
            self.error("Too many local variables in function.");
            return;
        }
        let depth = self.func().scope_depth as isize;
        let duplicate = self
            .func()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth == depth || local.depth == -1)
            .any(|local| local.name == name);
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.func_mut().locals.push(Local {
            name: name.to_string(),
            depth: -1,
            captured: false,
        });
    }

    /// Renames the most recent local, for `except … as name` bindings.
    pub(crate) fn rename_top_local(&mut self, name: &str) {
        if let Some(local) = self.func_mut().locals.last_mut() {
            local.name = name.to_string();
        }
    }

    /// Overwrites one already-emitted code byte.
    pub(crate) fn write_code_byte(&mut self, offset: usize, value: u8) {
        self.func_mut().chunk.code[offset] = value;
    }

    pub(crate) fn mark_initialized(&mut self) {
        let depth = self.func().scope_depth as isize;
        if let Some(local) = self.func_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    /// Marks the latest `count` locals as initialized.
    pub(crate) fn mark_initialized_n(&mut self, count: usize) {
        let depth = self.func().scope_depth as isize;
        let len = self.func().locals.len();
        for local in &mut self.func_mut().locals[len - count..] {
            local.depth = depth;
        }
    }

    fn resolve_local_in(&mut self, func_index: usize, name: &str) -> Option<u8> {
        let found = self.funcs[func_index]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(slot, local)| (slot, local.depth));
        let (slot, depth) = found?;
        if depth == -1 {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(slot as u8)
    }

    fn add_upvalue(&mut self, func_index: usize, index: u8, is_local: bool) -> u8 {
        let entry = Upvalue { index, is_local };
        if let Some(existing) = self.funcs[func_index]
            .upvalues
            .iter()
            .position(|&u| u == entry)
        {
            return existing as u8;
        }
        if self.funcs[func_index].upvalues.len() > u8::MAX as usize {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.funcs[func_index].upvalues.push(entry);
        (self.funcs[func_index].upvalues.len() - 1) as u8
    }

    fn resolve_upvalue_in(&mut self, func_index: usize, name: &str) -> Option<u8> {
        if func_index == 0 {
            return None;
        }
        let enclosing = func_index - 1;
        if let Some(local) = self.resolve_local_in(enclosing, name) {
            self.funcs[enclosing].locals[local as usize].captured = true;
            return Some(self.add_upvalue(func_index, local, true));
        }
        if let Some(upvalue) = self.resolve_upvalue_in(enclosing, name) {
            return Some(self.add_upvalue(func_index, upvalue, false));
        }
        None
    }

    pub(crate) fn resolve_local(&mut self, name: &str) -> Option<u8> {
        let top = self.funcs.len() - 1;
        self.resolve_local_in(top, name)
    }

    pub(crate) fn resolve_upvalue(&mut self, name: &str) -> Option<u8> {
        let top = self.funcs.len() - 1;
        self.resolve_upvalue_in(top, name)
    }

    // === Function compilation ===

    /// Starts compiling a nested function.
    pub(crate) fn begin_function(&mut self, kind_is_method: bool, name: Option<StringId>) {
        let kind = if kind_is_method {
            FuncKind::Method
        } else {
            FuncKind::Function
        };
        let mut state = FuncState::new(kind, name);
        if kind_is_method {
            state.is_self = true;
        }
        self.funcs.push(state);
    }

    /// Parses the parenthesized parameter list of the current function.
    pub(crate) fn parameter_list(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if self.func().kind == FuncKind::Method {
            // Implicit receiver parameter.
            self.declare_local("self");
            self.mark_initialized();
            self.func_mut().arity += 1;
            let name = self.heap.alloc_str("self");
            self.func_mut().param_names.push(name);
            self.func_mut().param_types.push(TypeHint::Any);
        }
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.func().arity == u8::MAX as usize {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                if self.matches(TokenKind::Star) {
                    // Trailing varargs table parameter.
                    self.consume(TokenKind::Identifier, "Expect parameter name after '*'.");
                    let name = self.previous.text.clone();
                    self.declare_local(&name);
                    self.mark_initialized();
                    self.func_mut().arity += 1;
                    self.func_mut().is_variadic = true;
                    let id = self.heap.alloc_string(name);
                    self.func_mut().param_names.push(id);
                    self.func_mut().param_types.push(TypeHint::Any);
                    if !self.check(TokenKind::RightParen) {
                        self.error_at_current("Variadic parameter must be last.");
                    }
                    break;
                }
                self.consume(TokenKind::Identifier, "Expect parameter name.");
                let name = self.previous.text.clone();
                self.declare_local(&name);
                self.mark_initialized();
                self.func_mut().arity += 1;
                let id = self.heap.alloc_string(name);
                self.func_mut().param_names.push(id);
                let hint = if self.matches(TokenKind::Colon) {
                    self.type_hint()
                } else {
                    TypeHint::Any
                };
                self.func_mut().param_types.push(hint);
                if self.matches(TokenKind::Equal) {
                    let value = self.literal_default();
                    self.func_mut().defaults.push(value);
                } else if !self.func().defaults.is_empty() {
                    self.error("Parameters with defaults must be trailing.");
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
    }

    fn type_hint(&mut self) -> TypeHint {
        self.consume(TokenKind::Identifier, "Expect type name after ':'.");
        match self.previous.text.as_str() {
            "any" => TypeHint::Any,
            "int" => TypeHint::Int,
            "float" => TypeHint::Float,
            "bool" => TypeHint::Bool,
            "str" => TypeHint::Str,
            "table" => TypeHint::Table,
            _ => {
                self.error("Unknown type hint.");
                TypeHint::Any
            }
        }
    }

    /// Parses a literal default value; defaults are baked into the function
    /// object at definition time, so only constants are allowed.
    fn literal_default(&mut self) -> Value {
        if self.matches(TokenKind::Number) {
            match self.previous.text.parse::<f64>() {
                Ok(n) => Value::Number(n),
                Err(_) => {
                    self.error("Invalid number literal.");
                    Value::Nil
                }
            }
        } else if self.matches(TokenKind::Minus) {
            self.consume(TokenKind::Number, "Expect number after '-'.");
            match self.previous.text.parse::<f64>() {
                Ok(n) => Value::Number(-n),
                Err(_) => {
                    self.error("Invalid number literal.");
                    Value::Nil
                }
            }
        } else if self.matches(TokenKind::Str) {
            let id = self.heap.alloc_string(self.previous.text.clone());
            Value::Str(id)
        } else if self.matches(TokenKind::True) {
            Value::Bool(true)
        } else if self.matches(TokenKind::False) {
            Value::Bool(false)
        } else if self.matches(TokenKind::Nil) {
            Value::Nil
        } else {
            self.error_at_current("Default values must be literals.");
            Value::Nil
        }
    }

    /// Finalizes the innermost function: implicit return, peephole pass,
    /// heap allocation. Emits the `Closure` instruction into the enclosing
    /// function unless this was the script itself.
    pub(crate) fn end_function(&mut self) -> FunctionId {
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Return);

        let state = self.funcs.pop().expect("compiler function stack empty");
        let mut chunk = state.chunk;
        if !self.had_error {
            optimizer::optimize_chunk(&mut chunk, self.heap);
        } else {
            chunk.rebuild_caches();
        }
        let upvalue_count = state.upvalues.len();
        let function = FunctionObject {
            arity: state.arity,
            upvalue_count,
            chunk: Rc::new(chunk),
            name: state.name,
            doc: state.doc,
            defaults: state.defaults,
            is_variadic: state.is_variadic,
            is_self: state.is_self,
            is_generator: state.is_generator,
            param_names: state.param_names,
            param_types: state.param_types,
        };
        let id = self.heap.alloc_function(function);

        if !self.funcs.is_empty() {
            let constant = self.make_constant(Value::Function(id));
            self.emit_with_operand(OpCode::Closure, constant);
            for upvalue in state.upvalues {
                self.emit_byte(upvalue.is_local as u8);
                self.emit_byte(upvalue.index);
            }
        }
        id
    }

    fn finish_function(&mut self) -> FunctionId {
        self.end_function()
    }

    pub(crate) fn set_doc(&mut self, doc: StringId) {
        if self.func().doc.is_none() {
            self.func_mut().doc = Some(doc);
        }
    }

    // === Loop bookkeeping ===

    pub(crate) fn push_loop(&mut self, continue_target: usize) {
        let local_base = self.local_count();
        self.func_mut().loops.push(LoopState {
            continue_target,
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            local_base,
        });
    }

    /// Patches pending forward `continue` jumps to the current offset.
    pub(crate) fn patch_continues_here(&mut self) {
        let jumps = match self.func_mut().loops.last_mut() {
            Some(state) => std::mem::take(&mut state.continue_jumps),
            None => return,
        };
        for jump in jumps {
            self.patch_jump(jump);
        }
    }

    pub(crate) fn pop_loop(&mut self) {
        let jumps = match self.func_mut().loops.pop() {
            Some(state) => state.break_jumps,
            None => return,
        };
        for jump in jumps {
            self.patch_jump(jump);
        }
    }

    pub(crate) fn loop_break(&mut self) {
        let Some(state) = self.func().loops.last() else {
            self.error("'break' outside of a loop.");
            return;
        };
        let base = state.local_base;
        self.emit_pops_to(base);
        let jump = self.emit_jump(OpCode::Jump);
        if let Some(state) = self.func_mut().loops.last_mut() {
            state.break_jumps.push(jump);
        }
    }

    pub(crate) fn loop_continue(&mut self) {
        let Some(state) = self.func().loops.last() else {
            self.error("'continue' outside of a loop.");
            return;
        };
        let base = state.local_base;
        let target = state.continue_target;
        self.emit_pops_to(base);
        if target == usize::MAX {
            let jump = self.emit_jump(OpCode::Jump);
            if let Some(state) = self.func_mut().loops.last_mut() {
                state.continue_jumps.push(jump);
            }
        } else {
            self.emit_loop(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op_code::OpCode;

    fn compiles(source: &str) -> bool {
        let mut heap = Heap::new();
        compile(source, &mut heap).is_some()
    }

    #[test]
    fn accepts_simple_programs() {
        assert!(compiles("x = 1"));
        assert!(compiles("print(1 + 2)"));
        assert!(compiles("fn f(a, b) return a + b; end"));
        assert!(compiles("if x: y = 1; else: y = 2"));
        assert!(compiles("for i = 1, 10: x = i"));
        assert!(compiles("for k, v in t: x = v"));
        assert!(compiles("try: x = 1; except as e: y = e; finally: z = 1"));
        assert!(compiles("local a, b = f()"));
        assert!(compiles("t = {1, 2, k = 3, [x] = 4}"));
    }

    #[test]
    fn rejects_malformed_programs() {
        assert!(!compiles("fn ("));
        assert!(!compiles("if : y"));
        assert!(!compiles("local = 3"));
        assert!(!compiles("try: x = 1"));
        assert!(!compiles(")("));
    }

    #[test]
    fn range_outside_loops_is_rejected() {
        assert!(!compiles("x = 1..3"));
        assert!(compiles("for i in 1..3: x = i"));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        assert!(!compiles("break"));
        assert!(!compiles("continue"));
    }

    #[test]
    fn yield_marks_the_function_as_a_generator() {
        let mut heap = Heap::new();
        let script = compile("fn g() yield 1; end", &mut heap).unwrap();
        let closure_constant = heap
            .function(script)
            .chunk
            .constants
            .iter()
            .find_map(|value| match value {
                Value::Function(id) => Some(*id),
                _ => None,
            })
            .expect("no inner function");
        assert!(heap.function(closure_constant).is_generator);
        assert!(!heap.function(script).is_generator);
    }

    #[test]
    fn upvalue_pairs_trail_the_closure_instruction() {
        let mut heap = Heap::new();
        let script = compile(
            "fn outer() local x = 1; return fn() return x; end; end",
            &mut heap,
        )
        .unwrap();
        // The inner function of `outer` captures exactly one local.
        let outer = heap
            .function(script)
            .chunk
            .constants
            .iter()
            .find_map(|value| match value {
                Value::Function(id) => Some(*id),
                _ => None,
            })
            .expect("no outer function");
        let inner = heap
            .function(outer)
            .chunk
            .constants
            .iter()
            .find_map(|value| match value {
                Value::Function(id) => Some(*id),
                _ => None,
            })
            .expect("no inner function");
        assert_eq!(heap.function(inner).upvalue_count, 1);
    }

    #[test]
    fn defaults_must_be_literals() {
        assert!(compiles("fn f(a, b=10, c=\"s\", d=true, e=nil) return a; end"));
        assert!(!compiles("fn f(a = g()) return a; end"));
    }

    #[test]
    fn optimizer_fuses_increment_loops() {
        let mut heap = Heap::new();
        let script = compile("local i = 0\nwhile i < 10:\n    i = i + 1\n", &mut heap).unwrap();
        let chunk = &heap.function(script).chunk;
        assert!(
            chunk.code.contains(&(OpCode::IncLocal as u8)),
            "expected a fused IncLocal in {:?}",
            chunk.code
        );
    }
}
