//! Statement compilation: declarations, control flow, blocks.
//!
//! Blocks come in two shapes. After a `:` (or a function header) a NEWLINE
//! plus INDENT opens an indented block closed by DEDENT; otherwise the
//! block is inline — statements separated by `;` running until a closing
//! keyword. Function bodies written inline are closed by `end`.

use super::Compiler;
use crate::lexer::TokenKind;
use crate::op_code::{OpCode, TryFlags};

impl Compiler<'_> {
    pub(crate) fn declaration(&mut self) {
        if self.matches(TokenKind::Fn) {
            self.fn_declaration();
        } else if self.matches(TokenKind::Local) {
            self.local_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        use TokenKind::*;
        if self.matches(If) {
            self.if_statement();
        } else if self.matches(While) {
            self.while_statement();
        } else if self.matches(For) {
            self.for_statement();
        } else if self.matches(Try) {
            self.try_statement();
        } else if self.matches(Match) {
            self.match_statement();
        } else if self.matches(Return) {
            self.return_statement();
        } else if self.matches(Throw) {
            self.expression();
            self.emit_op(OpCode::Throw);
            self.expect_statement_end();
        } else if self.matches(Import) {
            self.import_statement();
        } else if self.matches(From) {
            self.from_statement();
        } else if self.matches(Break) {
            self.loop_break();
            self.expect_statement_end();
        } else if self.matches(Continue) {
            self.loop_continue();
            self.expect_statement_end();
        } else {
            self.expression_statement();
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.emit_op(OpCode::Pop);
        // Truncate any extra multi-return values back to the local frame.
        let depth = self.local_count() as u8;
        self.emit_with_operand(OpCode::AdjustStack, depth);
        self.expect_statement_end();
    }

    fn expect_statement_end(&mut self) {
        use TokenKind::*;
        if !matches!(
            self.current.kind,
            Newline | Semicolon | Eof | Dedent | End | Elif | Else | Except | Finally | Case
        ) {
            self.error_at_current("Expect newline or ';' after statement.");
        }
    }

    // === Blocks ===

    /// A statement block after a consumed `:`.
    pub(crate) fn block(&mut self) {
        if self.check(TokenKind::Newline) {
            self.advance();
            if self.matches(TokenKind::Indent) {
                self.indented_statements();
                return;
            }
            self.error_at_current("Expect an indented block.");
            return;
        }
        self.inline_statements();
    }

    fn indented_statements(&mut self) {
        loop {
            self.skip_block_separators();
            if self.check(TokenKind::Dedent) || self.check(TokenKind::Eof) {
                break;
            }
            self.declaration();
        }
        self.matches(TokenKind::Dedent);
    }

    /// Inline statements run to a closing keyword, newline, or dedent; the
    /// closer is left for the owner to handle.
    fn inline_statements(&mut self) {
        use TokenKind::*;
        loop {
            while self.matches(Semicolon) {}
            if matches!(
                self.current.kind,
                End | Elif | Else | Except | Finally | Case | Newline | Dedent | Eof
            ) {
                break;
            }
            self.declaration();
        }
    }

    fn skip_block_separators(&mut self) {
        while self.matches(TokenKind::Newline) || self.matches(TokenKind::Semicolon) {}
    }

    // === Functions ===

    fn fn_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect function name.");
        let name = self.previous.text.clone();

        if self.check(TokenKind::Dot) {
            // `fn obj.method(...)` — a self-method stored on a table.
            self.named_variable(&name, false);
            self.advance();
            self.consume(TokenKind::Identifier, "Expect method name after '.'.");
            let method = self.previous.text.clone();
            let key = self.string_constant(&method);
            self.emit_with_operand(OpCode::Constant, key);
            let method_name = self.heap_mut().alloc_string(method);
            self.begin_function(true, Some(method_name));
            self.parameter_list();
            self.function_body();
            self.emit_op(OpCode::SetTable);
            self.emit_op(OpCode::Pop);
            return;
        }

        let name_id = self.heap_mut().alloc_string(name.clone());
        let is_local = self.func().scope_depth > 0;
        if is_local {
            // Declared before the body so the function can recurse.
            self.declare_local(&name);
            self.mark_initialized();
        }
        self.begin_function(false, Some(name_id));
        self.parameter_list();
        self.function_body();
        if !is_local {
            let index = self.string_constant(&name);
            self.emit_with_operand(OpCode::DefineGlobal, index);
        }
    }

    /// Body of a function or lambda: optional `:`, then either an indented
    /// block or inline statements closed by `end`. Ends the function.
    pub(crate) fn function_body(&mut self) {
        self.matches(TokenKind::Colon);
        self.begin_scope();
        if self.check(TokenKind::Newline) {
            self.advance();
            if self.matches(TokenKind::Indent) {
                self.capture_docstring();
                self.indented_statements();
            } else {
                self.error_at_current("Expect an indented function body.");
            }
        } else {
            self.capture_docstring();
            use TokenKind::*;
            loop {
                while self.matches(Semicolon) {}
                if matches!(self.current.kind, End | Eof | Dedent) {
                    break;
                }
                self.declaration();
            }
            self.consume(TokenKind::End, "Expect 'end' after function body.");
        }
        self.end_function();
    }

    /// A leading bare string literal becomes the function's doc string.
    fn capture_docstring(&mut self) {
        use TokenKind::*;
        if self.check(Str)
            && matches!(
                self.tokens.get(self.pos).map(|t| t.kind),
                Some(Newline) | Some(Semicolon) | Some(End) | Some(Dedent) | Some(Eof)
            )
        {
            let text = self.current.text.clone();
            let doc = self.heap_mut().alloc_string(text);
            self.set_doc(doc);
            self.advance();
        }
    }

    // === Local declarations ===

    fn local_declaration(&mut self) {
        let mut names = Vec::new();
        loop {
            self.consume(TokenKind::Identifier, "Expect variable name after 'local'.");
            names.push(self.previous.text.clone());
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        let base = self.local_count();
        for name in &names {
            self.declare_local(name);
        }

        if self.matches(TokenKind::Equal) {
            let mut values = 0usize;
            loop {
                self.expression();
                values += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
            if values == 1 && names.len() > 1 {
                // One initializer, many targets: split multi-returns.
                self.emit_op(OpCode::Unpack);
                self.emit_byte(base as u8);
                self.emit_byte(names.len() as u8);
            } else if values < names.len() {
                for _ in values..names.len() {
                    self.emit_op(OpCode::Nil);
                }
            } else if values > names.len() {
                for _ in names.len()..values {
                    self.emit_op(OpCode::Pop);
                }
            }
        } else {
            for _ in &names {
                self.emit_op(OpCode::Nil);
            }
        }
        self.mark_initialized_n(names.len());
        self.expect_statement_end();
    }

    // === Control flow ===

    fn if_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Colon, "Expect ':' after condition.");
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.begin_scope();
        self.block();
        self.end_scope();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.matches(TokenKind::Elif) {
            self.if_statement();
        } else if self.matches(TokenKind::Else) {
            self.consume(TokenKind::Colon, "Expect ':' after 'else'.");
            self.begin_scope();
            self.block();
            self.end_scope();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        self.expression();
        self.consume(TokenKind::Colon, "Expect ':' after condition.");
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.push_loop(loop_start);
        self.begin_scope();
        self.block();
        self.end_scope();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
        self.pop_loop();
    }

    fn for_statement(&mut self) {
        self.consume(TokenKind::Identifier, "Expect loop variable name.");
        let first = self.previous.text.clone();
        if self.check(TokenKind::Equal) {
            self.numeric_for(&first);
        } else {
            self.for_in(&first);
        }
    }

    /// `for i = start, limit:` with two hidden slots driven by
    /// `ForPrep`/`ForLoop`.
    fn numeric_for(&mut self, name: &str) {
        self.begin_scope();
        self.advance(); // '='
        self.declare_local(name);
        self.expression();
        self.mark_initialized();
        let var_slot = (self.local_count() - 1) as u8;

        self.consume(TokenKind::Comma, "Expect ',' after loop start value.");
        self.declare_local("(for limit)");
        self.expression();
        self.mark_initialized();
        let limit_slot = (self.local_count() - 1) as u8;

        self.consume(TokenKind::Colon, "Expect ':' after loop bounds.");

        self.emit_op(OpCode::ForPrep);
        self.emit_byte(var_slot);
        self.emit_byte(limit_slot);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        let prep_operand = self.chunk_len() - 2;

        let loop_start = self.chunk_len();
        self.push_loop(usize::MAX);
        self.begin_scope();
        self.block();
        self.end_scope();
        self.patch_continues_here();

        self.emit_op(OpCode::ForLoop);
        self.emit_byte(var_slot);
        self.emit_byte(limit_slot);
        let back = self.chunk_len() + 2 - loop_start;
        self.emit_byte(((back >> 8) & 0xff) as u8);
        self.emit_byte((back & 0xff) as u8);

        let exit = self.chunk_len();
        self.patch_short(prep_operand, exit - (prep_operand + 2));
        self.pop_loop();
        self.end_scope();
    }

    /// `for v in iterable:` / `for k, v in iterable:` over the generic
    /// `(next, state, control)` protocol.
    fn for_in(&mut self, first: &str) {
        self.begin_scope();
        let mut second = None;
        if self.matches(TokenKind::Comma) {
            self.consume(TokenKind::Identifier, "Expect second loop variable.");
            second = Some(self.previous.text.clone());
        }
        self.consume(TokenKind::In, "Expect 'in' after loop variables.");

        let expr_start = self.chunk_len();
        self.allow_range = true;
        self.range_emitted_at = None;
        self.table_literal_at = None;
        self.expression();
        self.allow_range = false;

        let range_form = self.range_emitted_at == Some(self.chunk_len().wrapping_sub(1));
        if !range_form {
            if self.table_literal_at == Some(expr_start) {
                self.emit_op(OpCode::IterPrepIpairs);
            } else {
                self.emit_op(OpCode::IterPrep);
            }
        }
        self.consume(TokenKind::Colon, "Expect ':' after iterable.");

        // The prelude leaves (next, state, control) on the stack.
        for hidden in ["(for next)", "(for state)", "(for control)"] {
            self.declare_local(hidden);
            self.mark_initialized();
        }
        let next_slot = (self.local_count() - 3) as u8;
        let state_slot = (self.local_count() - 2) as u8;
        let control_slot = (self.local_count() - 1) as u8;

        self.emit_op(OpCode::Nil);
        self.declare_local(first);
        self.mark_initialized();
        let first_slot = (self.local_count() - 1) as u8;
        let second_slot = second.as_ref().map(|name| {
            self.emit_op(OpCode::Nil);
            self.declare_local(name);
            self.mark_initialized();
            (self.local_count() - 1) as u8
        });

        let loop_start = self.chunk_len();
        self.push_loop(loop_start);

        self.emit_with_operand(OpCode::GetLocal, next_slot);
        self.emit_with_operand(OpCode::GetLocal, state_slot);
        self.emit_with_operand(OpCode::GetLocal, control_slot);
        self.emit_op(OpCode::Call2);
        // Normalize the iterator call to exactly (control, value).
        self.emit_with_operand(OpCode::AdjustStack, (self.local_count() + 2) as u8);

        match second_slot {
            Some(value_slot) => {
                self.emit_with_operand(OpCode::SetLocal, value_slot);
                self.emit_op(OpCode::Pop);
                self.emit_with_operand(OpCode::SetLocal, control_slot);
                self.emit_with_operand(OpCode::SetLocal, first_slot);
            }
            None => {
                self.emit_with_operand(OpCode::SetLocal, first_slot);
                self.emit_op(OpCode::Pop);
                self.emit_with_operand(OpCode::SetLocal, control_slot);
            }
        }
        self.emit_op(OpCode::Nil);
        self.emit_op(OpCode::Equal);
        let exit = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);

        self.begin_scope();
        self.block();
        self.end_scope();
        self.emit_loop(loop_start);

        self.patch_jump(exit);
        self.emit_op(OpCode::Pop);
        self.pop_loop();
        self.end_scope();
    }

    // === Exceptions ===

    fn try_statement(&mut self) {
        let depth = self.local_count() as u8;
        self.emit_op(OpCode::Try);
        self.emit_byte(depth);
        let flags_offset = self.chunk_len();
        self.emit_byte(0);
        let ex_offset = self.chunk_len();
        self.emit_byte(0);
        self.emit_byte(0);
        let fin_offset = self.chunk_len();
        self.emit_byte(0);
        self.emit_byte(0);
        let operand_end = self.chunk_len();

        self.consume(TokenKind::Colon, "Expect ':' after 'try'.");
        self.begin_scope();
        self.block();
        self.end_scope();
        self.emit_op(OpCode::EndTry);
        let normal_jump = self.emit_jump(OpCode::Jump);

        let mut flags = TryFlags::empty();
        let mut except_done = None;
        self.skip_block_separators_before_handler();
        if self.matches(TokenKind::Except) {
            flags |= TryFlags::HAS_EXCEPT;
            let target = self.chunk_len() - operand_end;
            self.patch_short(ex_offset, target);

            self.begin_scope();
            // The unwinder pushed the exception; it becomes a local here.
            self.declare_local("(exception)");
            self.mark_initialized();
            let exc_slot = (self.local_count() - 1) as u8;

            let mut rethrow = None;
            if self.matches(TokenKind::As) {
                self.consume(TokenKind::Identifier, "Expect binding name after 'as'.");
                self.rename_top_local(&self.previous.text.clone());
            } else if !self.check(TokenKind::Colon) {
                // `except <pattern> [as name]:` — filtered handler.
                let matcher = self.string_constant("exc_matches");
                self.emit_with_operand(OpCode::GetGlobal, matcher);
                self.emit_with_operand(OpCode::GetLocal, exc_slot);
                self.expression();
                self.emit_op(OpCode::Call2);
                if self.matches(TokenKind::As) {
                    self.consume(TokenKind::Identifier, "Expect binding name after 'as'.");
                    self.rename_top_local(&self.previous.text.clone());
                }
                rethrow = Some(self.emit_jump(OpCode::JumpIfFalse));
                self.emit_op(OpCode::Pop);
            }
            self.consume(TokenKind::Colon, "Expect ':' after except clause.");
            self.block();
            self.end_scope();
            self.emit_op(OpCode::EndTry);
            except_done = Some(self.emit_jump(OpCode::Jump));
            if let Some(jump) = rethrow {
                self.patch_jump(jump);
                self.emit_op(OpCode::Pop);
                self.emit_op(OpCode::Throw);
            }
        }

        self.skip_block_separators_before_handler();
        if self.check(TokenKind::Finally) {
            flags |= TryFlags::HAS_FINALLY;
        }
        // Normal and handled paths converge here, before any finally code.
        self.patch_jump(normal_jump);
        if let Some(jump) = except_done {
            self.patch_jump(jump);
        }
        if self.matches(TokenKind::Finally) {
            let target = self.chunk_len() - operand_end;
            self.patch_short(fin_offset, target);
            self.consume(TokenKind::Colon, "Expect ':' after 'finally'.");
            self.begin_scope();
            self.block();
            self.end_scope();
            self.emit_op(OpCode::EndFinally);
        }

        if flags.is_empty() {
            self.error("Expect 'except' or 'finally' after try block.");
        }
        let chunk_flags = flags.bits();
        self.patch_byte(flags_offset, chunk_flags);
    }

    /// Inside an indented try, the handler keyword sits on a fresh line at
    /// the same indent level; skip the separating layout tokens.
    fn skip_block_separators_before_handler(&mut self) {
        while (self.check(TokenKind::Newline) || self.check(TokenKind::Semicolon))
            && matches!(
                self.tokens.get(self.pos).map(|t| t.kind),
                Some(TokenKind::Except) | Some(TokenKind::Finally)
            )
        {
            self.advance();
        }
    }

    // === Match ===

    fn match_statement(&mut self) {
        self.begin_scope();
        self.expression();
        self.declare_local("(match)");
        self.mark_initialized();
        let match_slot = (self.local_count() - 1) as u8;
        self.consume(TokenKind::Colon, "Expect ':' after match value.");

        let indented = if self.check(TokenKind::Newline) {
            self.advance();
            self.consume(TokenKind::Indent, "Expect an indented block after 'match'.");
            true
        } else {
            false
        };

        let mut end_jumps = Vec::new();
        loop {
            self.skip_block_separators();
            if self.matches(TokenKind::Case) {
                let wildcard =
                    self.check(TokenKind::Identifier) && self.current.text == "_";
                if wildcard {
                    self.advance();
                    self.consume(TokenKind::Colon, "Expect ':' after case pattern.");
                    self.begin_scope();
                    self.block();
                    self.end_scope();
                    end_jumps.push(self.emit_jump(OpCode::Jump));
                } else {
                    self.emit_with_operand(OpCode::GetLocal, match_slot);
                    self.expression();
                    self.emit_op(OpCode::Equal);
                    let next = self.emit_jump(OpCode::JumpIfFalse);
                    self.emit_op(OpCode::Pop);
                    self.consume(TokenKind::Colon, "Expect ':' after case pattern.");
                    self.begin_scope();
                    self.block();
                    self.end_scope();
                    end_jumps.push(self.emit_jump(OpCode::Jump));
                    self.patch_jump(next);
                    self.emit_op(OpCode::Pop);
                }
            } else if self.matches(TokenKind::Else) {
                self.consume(TokenKind::Colon, "Expect ':' after 'else'.");
                self.begin_scope();
                self.block();
                self.end_scope();
            } else {
                break;
            }
        }
        for jump in end_jumps {
            self.patch_jump(jump);
        }
        if indented {
            self.matches(TokenKind::Dedent);
        }
        self.end_scope();
    }

    // === Returns and imports ===

    fn return_statement(&mut self) {
        use TokenKind::*;
        if matches!(
            self.current.kind,
            Newline | Semicolon | Eof | Dedent | End | Elif | Else | Except | Finally
        ) {
            self.emit_op(OpCode::Nil);
            self.emit_op(OpCode::Return);
            return;
        }
        self.expression();
        let mut count = 1usize;
        while self.matches(Comma) {
            self.expression();
            count += 1;
        }
        if count == 1 {
            self.emit_op(OpCode::Return);
        } else {
            if count > u8::MAX as usize {
                self.error("Too many return values.");
            }
            self.emit_with_operand(OpCode::ReturnN, count as u8);
        }
        self.expect_statement_end();
    }

    fn import_statement(&mut self) {
        self.consume(TokenKind::Identifier, "Expect module name after 'import'.");
        let name = self.previous.text.clone();
        let index = self.string_constant(&name);
        self.emit_with_operand(OpCode::Import, index);
        self.emit_with_operand(OpCode::DefineGlobal, index);
        self.expect_statement_end();
    }

    fn from_statement(&mut self) {
        self.consume(TokenKind::Identifier, "Expect module name after 'from'.");
        let module = self.previous.text.clone();
        let module_index = self.string_constant(&module);
        self.consume(TokenKind::Import, "Expect 'import' after module name.");
        self.emit_with_operand(OpCode::Import, module_index);

        if self.matches(TokenKind::Star) {
            self.emit_op(OpCode::ImportStar);
            self.expect_statement_end();
            return;
        }
        loop {
            self.consume(TokenKind::Identifier, "Expect imported name.");
            let name = self.previous.text.clone();
            let index = self.string_constant(&name);
            self.emit_op(OpCode::Dup);
            self.emit_with_operand(OpCode::Constant, index);
            self.emit_op(OpCode::GetTable);
            self.emit_with_operand(OpCode::DefineGlobal, index);
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }
        self.emit_op(OpCode::Pop);
        self.expect_statement_end();
    }

    // === Small patch helpers ===

    fn patch_byte(&mut self, offset: usize, value: u8) {
        self.write_code_byte(offset, value);
    }
}
