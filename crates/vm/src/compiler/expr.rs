//! Expression compilation: the Pratt half of the parser.

use super::{Compiler, Prec};
use crate::lexer::TokenKind;
use crate::op_code::OpCode;
use crate::value::Value;

impl Compiler<'_> {
    pub(crate) fn expression(&mut self) {
        self.parse_precedence(Prec::Or);
    }

    pub(crate) fn parse_precedence(&mut self, prec: Prec) {
        self.advance();
        let can_assign = prec <= Prec::Or;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        while prec <= self.infix_precedence(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }
        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn infix_precedence(&self, kind: TokenKind) -> Prec {
        use TokenKind::*;
        match kind {
            Or => Prec::Or,
            And => Prec::And,
            EqualEqual | BangEqual | Less | LessEqual | Greater | GreaterEqual | In | Has => {
                Prec::Comparison
            }
            DotDot => Prec::Range,
            Plus | Minus => Prec::Term,
            Star | Slash | SlashSlash | Percent => Prec::Factor,
            Caret => Prec::Power,
            Dot | LeftBracket | LeftParen | LeftBrace => Prec::Call,
            _ => Prec::None,
        }
    }

    /// Dispatches a prefix token; false when the token starts no expression.
    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        use TokenKind::*;
        match kind {
            Number => self.number(),
            Str => {
                let index = self.string_constant(&self.previous.text.clone());
                self.emit_with_operand(OpCode::Constant, index);
            }
            StrBegin => self.interpolated_string(),
            True => self.emit_op(OpCode::True),
            False => self.emit_op(OpCode::False),
            Nil => self.emit_op(OpCode::Nil),
            Identifier => self.variable(can_assign),
            LeftParen => {
                self.expression();
                self.consume(RightParen, "Expect ')' after expression.");
            }
            Minus => {
                self.parse_precedence(Prec::Unary);
                self.emit_op(OpCode::Negate);
            }
            Not => {
                self.parse_precedence(Prec::Unary);
                self.emit_op(OpCode::Not);
            }
            Hash => {
                self.parse_precedence(Prec::Unary);
                self.emit_op(OpCode::Length);
            }
            LeftBrace => self.table_literal(),
            Fn => self.lambda(),
            Yield => self.yield_expression(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            And => self.and_expression(),
            Or => self.or_expression(),
            Dot => self.dot(can_assign),
            LeftBracket => self.index(can_assign),
            LeftParen => self.call(),
            LeftBrace => self.instantiate(),
            DotDot => self.range(),
            _ => self.binary(kind),
        }
    }

    fn number(&mut self) {
        match self.previous.text.parse::<f64>() {
            Ok(n) => self.emit_constant(Value::Number(n)),
            Err(_) => self.error("Invalid number literal."),
        }
    }

    fn binary(&mut self, operator: TokenKind) {
        use TokenKind::*;
        let prec = self.infix_precedence(operator);
        // `^` is right-associative; everything else binds left.
        if operator == Caret {
            self.parse_precedence(prec);
        } else {
            self.parse_precedence(prec.next());
        }
        match operator {
            Plus => self.emit_op(OpCode::Add),
            Minus => self.emit_op(OpCode::Subtract),
            Star => self.emit_op(OpCode::Multiply),
            Slash => self.emit_op(OpCode::Divide),
            SlashSlash => self.emit_op(OpCode::IntDiv),
            Percent => self.emit_op(OpCode::Modulo),
            Caret => self.emit_op(OpCode::Power),
            EqualEqual => self.emit_op(OpCode::Equal),
            BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            Less => self.emit_op(OpCode::Less),
            Greater => self.emit_op(OpCode::Greater),
            LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            In => self.emit_op(OpCode::In),
            Has => self.emit_op(OpCode::Has),
            _ => self.error("Unexpected operator."),
        }
    }

    fn and_expression(&mut self) {
        let end = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Prec::And.next());
        self.patch_jump(end);
    }

    fn or_expression(&mut self) {
        let end = self.emit_jump(OpCode::JumpIfTrue);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Prec::Or.next());
        self.patch_jump(end);
    }

    /// `a..b` — only meaningful where the VM expects an iterator triple.
    fn range(&mut self) {
        if !self.allow_range {
            self.error("Range expressions are only valid in for loops and slices.");
        }
        self.parse_precedence(Prec::Range.next());
        self.emit_op(OpCode::Range);
        self.range_emitted_at = Some(self.chunk_len() - 1);
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.text.clone();
        self.named_variable(&name, can_assign);
    }

    pub(crate) fn named_variable(&mut self, name: &str, can_assign: bool) {
        if let Some(slot) = self.resolve_local(name) {
            if can_assign && self.matches(TokenKind::Equal) {
                self.expression();
                self.emit_with_operand(OpCode::SetLocal, slot);
            } else {
                self.emit_with_operand(OpCode::GetLocal, slot);
            }
            return;
        }
        if let Some(slot) = self.resolve_upvalue(name) {
            if can_assign && self.matches(TokenKind::Equal) {
                self.expression();
                self.emit_with_operand(OpCode::SetUpvalue, slot);
            } else {
                self.emit_with_operand(OpCode::GetUpvalue, slot);
            }
            return;
        }
        // `print` compiles to its own instruction when called directly.
        if name == "print" && self.check(TokenKind::LeftParen) {
            self.print_form();
            return;
        }
        let index = self.string_constant(name);
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_with_operand(OpCode::SetGlobal, index);
        } else {
            self.emit_with_operand(OpCode::GetGlobal, index);
        }
    }

    fn print_form(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'print'.");
        let mut count = 0usize;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                count += 1;
                if count > u8::MAX as usize {
                    self.error("Can't print more than 255 values.");
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after print arguments.");
        self.emit_with_operand(OpCode::Print, count as u8);
        // The expression form of print evaluates to nil.
        self.emit_op(OpCode::Nil);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let index = self.string_constant(&self.previous.text.clone());
        if can_assign && self.matches(TokenKind::Equal) {
            self.emit_with_operand(OpCode::Constant, index);
            self.expression();
            self.emit_op(OpCode::SetTable);
        } else {
            self.emit_with_operand(OpCode::Constant, index);
            self.emit_op(OpCode::GetTable);
        }
    }

    /// `a[k]`, `a[i..j]`, `a[i..j:s]` with optional open ends.
    fn index(&mut self, can_assign: bool) {
        if self.check(TokenKind::DotDot) {
            self.emit_op(OpCode::Nil);
        } else {
            self.expression();
        }
        if self.matches(TokenKind::DotDot) {
            if self.check(TokenKind::Colon) || self.check(TokenKind::RightBracket) {
                self.emit_op(OpCode::Nil);
            } else {
                self.expression();
            }
            if self.matches(TokenKind::Colon) {
                self.expression();
            } else {
                self.emit_op(OpCode::Nil);
            }
            self.consume(TokenKind::RightBracket, "Expect ']' after slice.");
            self.emit_op(OpCode::Slice);
            return;
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::SetTable);
        } else {
            self.emit_op(OpCode::GetTable);
        }
    }

    /// Argument list and call emission.
    fn call(&mut self) {
        let mut positional = 0usize;
        let mut named = 0usize;
        let mut expanded = false;

        if !self.check(TokenKind::RightParen) {
            loop {
                if expanded {
                    self.error_at_current("Spread argument must be last.");
                }
                if self.matches(TokenKind::Star) {
                    if named > 0 {
                        self.error("Can't mix named arguments with '*' expansion.");
                    }
                    self.expression();
                    expanded = true;
                } else if self.check(TokenKind::Identifier) && self.check_next(TokenKind::Equal) {
                    if named == 0 {
                        self.emit_op(OpCode::NewTable);
                    }
                    self.advance();
                    let index = self.string_constant(&self.previous.text.clone());
                    self.advance();
                    self.emit_op(OpCode::Dup);
                    self.emit_with_operand(OpCode::Constant, index);
                    self.expression();
                    self.emit_op(OpCode::SetTable);
                    self.emit_op(OpCode::Pop);
                    named += 1;
                } else {
                    if named > 0 {
                        self.error_at_current("Positional argument after named argument.");
                    }
                    self.expression();
                    positional += 1;
                }
                if positional + named > u8::MAX as usize {
                    self.error("Can't have more than 255 arguments.");
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");

        if expanded {
            self.emit_with_operand(OpCode::CallExpand, positional as u8);
        } else if named > 0 {
            self.emit_with_operand(OpCode::CallNamed, (positional + 1) as u8);
        } else {
            match positional {
                0 => self.emit_op(OpCode::Call0),
                1 => self.emit_op(OpCode::Call1),
                2 => self.emit_op(OpCode::Call2),
                n => self.emit_with_operand(OpCode::Call, n as u8),
            }
        }
    }

    /// `Proto { … }` — attach a metatable, running `__new` when present.
    fn instantiate(&mut self) {
        self.table_literal_body();
        self.emit_op(OpCode::SetMetatable);
    }

    fn table_literal(&mut self) {
        let offset = self.chunk_len();
        self.table_literal_body();
        self.table_literal_at = Some(offset);
    }

    /// Table constructor; the opening brace is already consumed.
    fn table_literal_body(&mut self) {
        self.emit_op(OpCode::NewTable);
        if !self.check(TokenKind::RightBrace) {
            loop {
                if self.check(TokenKind::RightBrace) {
                    break;
                }
                if self.check(TokenKind::Identifier) && self.check_next(TokenKind::Equal) {
                    self.advance();
                    let index = self.string_constant(&self.previous.text.clone());
                    self.advance();
                    self.emit_op(OpCode::Dup);
                    self.emit_with_operand(OpCode::Constant, index);
                    self.expression();
                    self.emit_op(OpCode::SetTable);
                    self.emit_op(OpCode::Pop);
                } else if self.matches(TokenKind::LeftBracket) {
                    self.emit_op(OpCode::Dup);
                    self.expression();
                    self.consume(TokenKind::RightBracket, "Expect ']' after table key.");
                    self.consume(TokenKind::Equal, "Expect '=' after table key.");
                    self.expression();
                    self.emit_op(OpCode::SetTable);
                    self.emit_op(OpCode::Pop);
                } else {
                    self.emit_op(OpCode::Dup);
                    self.expression();
                    self.emit_op(OpCode::Append);
                    self.emit_op(OpCode::Pop);
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after table literal.");
    }

    /// `"a{x}b"` lowers into parts plus one `BuildString`.
    fn interpolated_string(&mut self) {
        let mut parts = 0usize;
        let first = self.previous.text.clone();
        if !first.is_empty() {
            let index = self.string_constant(&first);
            self.emit_with_operand(OpCode::Constant, index);
            parts += 1;
        }
        loop {
            self.expression();
            parts += 1;
            if self.matches(TokenKind::StrMid) {
                let text = self.previous.text.clone();
                if !text.is_empty() {
                    let index = self.string_constant(&text);
                    self.emit_with_operand(OpCode::Constant, index);
                    parts += 1;
                }
                continue;
            }
            self.consume(TokenKind::StrEnd, "Unterminated string interpolation.");
            let text = self.previous.text.clone();
            if !text.is_empty() {
                let index = self.string_constant(&text);
                self.emit_with_operand(OpCode::Constant, index);
                parts += 1;
            }
            break;
        }
        if parts > u8::MAX as usize {
            self.error("Too many interpolation parts.");
        }
        self.emit_with_operand(OpCode::BuildString, parts as u8);
    }

    /// `fn (params) body end` as an expression.
    fn lambda(&mut self) {
        self.begin_function(false, None);
        self.parameter_list();
        self.function_body();
    }

    /// `yield expr?` — compiles to a call of the global `yield` and marks
    /// the enclosing function as a generator.
    fn yield_expression(&mut self) {
        self.mark_generator();
        let index = self.string_constant("yield");
        self.emit_with_operand(OpCode::GetGlobal, index);
        if self.starts_expression(self.current.kind) {
            self.expression();
            self.emit_op(OpCode::Call1);
        } else {
            self.emit_op(OpCode::Call0);
        }
    }

    pub(crate) fn starts_expression(&self, kind: TokenKind) -> bool {
        use TokenKind::*;
        matches!(
            kind,
            Number
                | Str
                | StrBegin
                | True
                | False
                | Nil
                | Identifier
                | LeftParen
                | LeftBrace
                | Minus
                | Not
                | Hash
                | Fn
                | Yield
        )
    }
}
