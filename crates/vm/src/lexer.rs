//! The tokenizer.
//!
//! Tael source is indentation-sensitive: a leading run of spaces/tabs (a
//! tab counts as four columns) opens a block when it strictly increases and
//! closes blocks when it decreases. Inside brackets, braces, and parens the
//! layout rules are suspended. Double-quoted strings may embed `{expr}`
//! interpolation fragments; the scanner switches between string mode and
//! code mode so the embedded expression is tokenized in place.

use once_cell::sync::Lazy;

/// Token classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Punctuation.
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    DotDot,
    Ellipsis,
    Colon,
    Semicolon,

    // Operators.
    Plus,
    Minus,
    Star,
    Slash,
    SlashSlash,
    Percent,
    Caret,
    Hash,
    Equal,
    EqualEqual,
    BangEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Arrow,
    FatArrow,
    Pipeline,
    Walrus,
    Question,

    // Literals.
    Identifier,
    Number,
    Str,
    /// Opening fragment of an interpolated string (literal before `{`).
    StrBegin,
    /// Fragment between two interpolation expressions.
    StrMid,
    /// Closing fragment after the last `}`.
    StrEnd,

    // Keywords.
    And,
    Or,
    Not,
    In,
    Has,
    As,
    If,
    Elif,
    Else,
    While,
    For,
    Fn,
    Return,
    Local,
    Try,
    Except,
    Finally,
    Throw,
    Import,
    From,
    Continue,
    Break,
    True,
    False,
    Nil,
    Match,
    Case,
    Yield,
    End,

    // Layout.
    Newline,
    Indent,
    Dedent,
    Eof,

    /// Scan error; `text` carries the message.
    Error,
}

/// One lexed token. `text` holds the identifier/lexeme, the processed
/// string content, or an error message.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
}

impl Token {
    fn new(kind: TokenKind, text: impl Into<String>, line: u32) -> Self {
        Token {
            kind,
            text: text.into(),
            line,
        }
    }
}

static KEYWORDS: Lazy<hashbrown::HashMap<&'static str, TokenKind>> = Lazy::new(|| {
    use TokenKind::*;
    let mut map = hashbrown::HashMap::new();
    for (word, kind) in [
        ("and", And),
        ("or", Or),
        ("not", Not),
        ("in", In),
        ("has", Has),
        ("as", As),
        ("if", If),
        ("elif", Elif),
        ("else", Else),
        ("while", While),
        ("for", For),
        ("fn", Fn),
        ("return", Return),
        ("local", Local),
        ("try", Try),
        ("except", Except),
        ("finally", Finally),
        ("throw", Throw),
        ("import", Import),
        ("from", From),
        ("continue", Continue),
        ("break", Break),
        ("true", True),
        ("false", False),
        ("nil", Nil),
        ("match", Match),
        ("case", Case),
        ("yield", Yield),
        ("end", End),
    ] {
        map.insert(word, kind);
    }
    map
});

/// The scanner. Produces the complete token stream for a source string.
pub struct Lexer<'src> {
    source: &'src [u8],
    start: usize,
    current: usize,
    line: u32,
    /// Open bracket/brace/paren depth; layout is suspended when non-zero.
    bracket_depth: usize,
    /// Bracket depth recorded when entering each interpolation fragment.
    interp_stack: Vec<usize>,
    indent_stack: Vec<usize>,
    at_line_start: bool,
    tokens: Vec<Token>,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Lexer {
            source: source.as_bytes(),
            start: 0,
            current: 0,
            line: 1,
            bracket_depth: 0,
            interp_stack: Vec::new(),
            indent_stack: vec![0],
            at_line_start: true,
            tokens: Vec::new(),
        }
    }

    /// Scans the whole source into a token stream ending in `Eof`.
    pub fn scan(mut self) -> Vec<Token> {
        while !self.is_at_end() {
            if self.at_line_start && self.bracket_depth == 0 {
                self.handle_indentation();
                if self.is_at_end() {
                    break;
                }
            }
            self.skip_spaces_and_comments();
            if self.is_at_end() {
                break;
            }
            self.start = self.current;
            self.scan_token();
        }
        if !self.at_line_start {
            self.push(TokenKind::Newline, "");
        }
        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            self.push(TokenKind::Dedent, "");
        }
        self.push(TokenKind::Eof, "");
        self.tokens
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.source.len()
    }

    fn peek(&self) -> u8 {
        self.source.get(self.current).copied().unwrap_or(0)
    }

    fn peek_next(&self) -> u8 {
        self.source.get(self.current + 1).copied().unwrap_or(0)
    }

    fn peek_at(&self, offset: usize) -> u8 {
        self.source.get(self.current + offset).copied().unwrap_or(0)
    }

    fn advance(&mut self) -> u8 {
        let byte = self.peek();
        self.current += 1;
        byte
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.peek() == expected {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn push(&mut self, kind: TokenKind, text: impl Into<String>) {
        let line = self.line;
        self.tokens.push(Token::new(kind, text, line));
    }

    fn error(&mut self, message: &str) {
        self.push(TokenKind::Error, message);
    }

    /// Measures the indent of the upcoming line and emits Indent/Dedent
    /// tokens. Blank and comment-only lines produce no layout.
    fn handle_indentation(&mut self) {
        loop {
            let mut columns = 0usize;
            let mut index = self.current;
            while let Some(&byte) = self.source.get(index) {
                match byte {
                    b' ' => columns += 1,
                    b'\t' => columns += 4,
                    _ => break,
                }
                index += 1;
            }
            match self.source.get(index) {
                // Blank line: swallow it without layout effects.
                Some(b'\n') => {
                    self.current = index + 1;
                    self.line += 1;
                    continue;
                }
                Some(b'\r') => {
                    self.current = index + 1;
                    continue;
                }
                // Comment-only line.
                Some(b'-') if self.source.get(index + 1) == Some(&b'-') => {
                    self.current = index;
                    while !self.is_at_end() && self.peek() != b'\n' {
                        self.current += 1;
                    }
                    continue;
                }
                None => {
                    self.current = index;
                    return;
                }
                _ => {}
            }

            self.current = index;
            self.at_line_start = false;
            let top = *self.indent_stack.last().unwrap_or(&0);
            if columns > top {
                self.indent_stack.push(columns);
                self.push(TokenKind::Indent, "");
            } else if columns < top {
                while self
                    .indent_stack
                    .last()
                    .is_some_and(|&level| level > columns)
                {
                    self.indent_stack.pop();
                    self.push(TokenKind::Dedent, "");
                }
                if self.indent_stack.last() != Some(&columns) {
                    self.error("Inconsistent indentation.");
                }
            }
            return;
        }
    }

    fn skip_spaces_and_comments(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\t' | b'\r' => {
                    self.current += 1;
                }
                b'-' if self.peek_next() == b'-' => {
                    while !self.is_at_end() && self.peek() != b'\n' {
                        self.current += 1;
                    }
                }
                _ => return,
            }
        }
    }

    fn scan_token(&mut self) {
        use TokenKind::*;
        let byte = self.advance();
        match byte {
            b'\n' => {
                self.line += 1;
                if self.bracket_depth == 0 {
                    self.push(Newline, "");
                    self.at_line_start = true;
                }
            }
            b'(' => {
                self.bracket_depth += 1;
                self.push(LeftParen, "");
            }
            b')' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                self.push(RightParen, "");
            }
            b'[' => {
                if self.peek() == b'[' {
                    self.current += 1;
                    self.raw_string();
                } else {
                    self.bracket_depth += 1;
                    self.push(LeftBracket, "");
                }
            }
            b']' => {
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                self.push(RightBracket, "");
            }
            b'{' => {
                self.bracket_depth += 1;
                self.push(LeftBrace, "");
            }
            b'}' => {
                // Closing an interpolation fragment resumes string mode.
                if let Some(&entry_depth) = self.interp_stack.last() {
                    if self.bracket_depth == entry_depth {
                        self.interp_stack.pop();
                        self.string_fragment(false);
                        return;
                    }
                }
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                self.push(RightBrace, "");
            }
            b',' => self.push(Comma, ""),
            b';' => self.push(Semicolon, ""),
            b'+' => self.push(Plus, ""),
            b'*' => self.push(Star, ""),
            b'%' => self.push(Percent, ""),
            b'^' => self.push(Caret, ""),
            b'#' => self.push(Hash, ""),
            b'?' => self.push(Question, ""),
            b'-' => {
                if self.matches(b'>') {
                    self.push(Arrow, "");
                } else {
                    self.push(Minus, "");
                }
            }
            b'/' => {
                if self.matches(b'/') {
                    self.push(SlashSlash, "");
                } else {
                    self.push(Slash, "");
                }
            }
            b'.' => {
                if self.peek() == b'.' && self.peek_next() == b'.' {
                    self.current += 2;
                    self.push(Ellipsis, "");
                } else if self.matches(b'.') {
                    self.push(DotDot, "");
                } else {
                    self.push(Dot, "");
                }
            }
            b':' => {
                if self.matches(b'=') {
                    self.push(Walrus, "");
                } else {
                    self.push(Colon, "");
                }
            }
            b'=' => {
                if self.matches(b'=') {
                    self.push(EqualEqual, "");
                } else if self.matches(b'>') {
                    self.push(FatArrow, "");
                } else {
                    self.push(Equal, "");
                }
            }
            b'!' => {
                if self.matches(b'=') {
                    self.push(BangEqual, "");
                } else {
                    self.error("Unexpected character '!'.");
                }
            }
            b'<' => {
                if self.matches(b'=') {
                    self.push(LessEqual, "");
                } else {
                    self.push(Less, "");
                }
            }
            b'>' => {
                if self.matches(b'=') {
                    self.push(GreaterEqual, "");
                } else {
                    self.push(Greater, "");
                }
            }
            b'|' => {
                if self.matches(b'>') {
                    self.push(Pipeline, "");
                } else {
                    self.error("Unexpected character '|'.");
                }
            }
            b'"' => self.string_fragment(true),
            b'0'..=b'9' => self.number(),
            byte if byte == b'_' || byte.is_ascii_alphabetic() => self.identifier(),
            _ => self.error("Unexpected character."),
        }
    }

    fn identifier(&mut self) {
        while self.peek() == b'_' || self.peek().is_ascii_alphanumeric() {
            self.current += 1;
        }
        let text = std::str::from_utf8(&self.source[self.start..self.current])
            .unwrap_or("")
            .to_string();
        match KEYWORDS.get(text.as_str()) {
            Some(&kind) => self.push(kind, text),
            None => self.push(TokenKind::Identifier, text),
        }
    }

    fn number(&mut self) {
        while self.peek().is_ascii_digit() {
            self.current += 1;
        }
        // A fractional part, but never eat the first dot of `..`.
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.current += 1;
            while self.peek().is_ascii_digit() {
                self.current += 1;
            }
        }
        if matches!(self.peek(), b'e' | b'E') {
            let mut lookahead = 1;
            if matches!(self.peek_at(1), b'+' | b'-') {
                lookahead = 2;
            }
            if self.peek_at(lookahead).is_ascii_digit() {
                self.current += lookahead;
                while self.peek().is_ascii_digit() {
                    self.current += 1;
                }
            }
        }
        let text = std::str::from_utf8(&self.source[self.start..self.current])
            .unwrap_or("")
            .to_string();
        self.push(TokenKind::Number, text);
    }

    /// Scans a double-quoted string fragment until `"` or an interpolation
    /// `{`. `opening` marks the fragment that begins the whole literal.
    fn string_fragment(&mut self, opening: bool) {
        let mut content = String::new();
        loop {
            if self.is_at_end() {
                self.error("Unterminated string.");
                return;
            }
            match self.advance() {
                b'"' => {
                    let kind = if opening { TokenKind::Str } else { TokenKind::StrEnd };
                    self.push(kind, content);
                    return;
                }
                b'{' => {
                    let kind = if opening {
                        TokenKind::StrBegin
                    } else {
                        TokenKind::StrMid
                    };
                    self.push(kind, content);
                    self.interp_stack.push(self.bracket_depth);
                    return;
                }
                b'\\' => match self.advance() {
                    b'n' => content.push('\n'),
                    b'r' => content.push('\r'),
                    b't' => content.push('\t'),
                    b'"' => content.push('"'),
                    b'\\' => content.push('\\'),
                    b'{' => content.push('{'),
                    b'}' => content.push('}'),
                    _ => {
                        self.error("Invalid escape sequence.");
                        return;
                    }
                },
                b'\n' => {
                    self.error("Unterminated string.");
                    self.line += 1;
                    return;
                }
                byte => content.push(byte as char),
            }
        }
    }

    /// Scans a `[[ … ]]` raw string: no escapes, no interpolation.
    fn raw_string(&mut self) {
        let mut content = String::new();
        loop {
            if self.is_at_end() {
                self.error("Unterminated raw string.");
                return;
            }
            if self.peek() == b']' && self.peek_next() == b']' {
                self.current += 2;
                self.push(TokenKind::Str, content);
                return;
            }
            let byte = self.advance();
            if byte == b'\n' {
                self.line += 1;
            }
            content.push(byte as char);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source).scan().iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scans_operators() {
        use TokenKind::*;
        assert_eq!(
            kinds("+ - * / // % ^ # == != <= >= .. :="),
            vec![
                Plus, Minus, Star, Slash, SlashSlash, Percent, Caret, Hash, EqualEqual, BangEqual,
                LessEqual, GreaterEqual, DotDot, Walrus, Newline, Eof
            ]
        );
    }

    #[test]
    fn number_does_not_eat_range_dots() {
        let tokens = Lexer::new("1..3").scan();
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Number,
                TokenKind::DotDot,
                TokenKind::Number,
                TokenKind::Newline,
                TokenKind::Eof
            ]
        );
        assert_eq!(tokens[0].text, "1");
        assert_eq!(tokens[2].text, "3");
    }

    #[test]
    fn indentation_opens_and_closes_blocks() {
        use TokenKind::*;
        let source = "if x:\n    y = 1\nz = 2\n";
        assert_eq!(
            kinds(source),
            vec![
                If, Identifier, Colon, Newline, Indent, Identifier, Equal, Number, Newline,
                Dedent, Identifier, Equal, Number, Newline, Eof
            ]
        );
    }

    #[test]
    fn tabs_count_as_four_columns() {
        use TokenKind::*;
        let source = "if x:\n\ty = 1\n    z = 2\n";
        // Tab (4) and four spaces are the same indent level.
        assert_eq!(
            kinds(source),
            vec![
                If, Identifier, Colon, Newline, Indent, Identifier, Equal, Number, Newline,
                Identifier, Equal, Number, Newline, Dedent, Eof
            ]
        );
    }

    #[test]
    fn brackets_suppress_layout() {
        use TokenKind::*;
        let source = "f(a,\n   b)\n";
        assert_eq!(
            kinds(source),
            vec![
                Identifier, LeftParen, Identifier, Comma, Identifier, RightParen, Newline, Eof
            ]
        );
    }

    #[test]
    fn blank_and_comment_lines_do_not_dedent() {
        use TokenKind::*;
        let source = "if x:\n    a = 1\n\n    -- note\n    b = 2\n";
        assert_eq!(
            kinds(source),
            vec![
                If, Identifier, Colon, Newline, Indent, Identifier, Equal, Number, Newline,
                Identifier, Equal, Number, Newline, Dedent, Eof
            ]
        );
    }

    #[test]
    fn interpolated_string_segments() {
        use TokenKind::*;
        let tokens = Lexer::new("\"a{x}b{y}c\"").scan();
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                StrBegin, Identifier, StrMid, Identifier, StrEnd, Newline, Eof
            ]
        );
        assert_eq!(tokens[0].text, "a");
        assert_eq!(tokens[2].text, "b");
        assert_eq!(tokens[4].text, "c");
    }

    #[test]
    fn escapes_are_processed() {
        let tokens = Lexer::new(r#""a\n\t\"\\\{b""#).scan();
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].text, "a\n\t\"\\{b");
    }

    #[test]
    fn raw_strings_span_lines() {
        let tokens = Lexer::new("[[line1\nline2]]").scan();
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].text, "line1\nline2");
    }

    #[test]
    fn keywords_resolve() {
        use TokenKind::*;
        assert_eq!(
            kinds("fn if elif else while for in has and or not end yield"),
            vec![
                Fn, If, Elif, Else, While, For, In, Has, And, Or, Not, End, Yield, Newline, Eof
            ]
        );
    }
}
