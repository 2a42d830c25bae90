//! Character stream → token stream. Hand-rolled rather than table-driven
//! (`logos` et al.): grounded on the original's `scanner.c`, which is a
//! plain `peek`/`advance`/`match` lexer with a first-letter keyword switch.

use crate::token::{Token, TokenKind};

pub struct Scanner<'src> {
    source: &'src str,
    bytes: &'src [u8],
    start: usize,
    current: usize,
    line: u32,
}

impl<'src> Scanner<'src> {
    pub fn new(source: &'src str) -> Self {
        Scanner { source, bytes: source.as_bytes(), start: 0, current: 0, line: 1 }
    }

    pub fn scan_token(&mut self) -> Token<'src> {
        self.skip_whitespace_and_comments();
        self.start = self.current;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();

        if is_alpha(c) {
            return self.identifier();
        }
        if c.is_ascii_digit() {
            return self.number();
        }

        match c {
            b'(' => self.make_token(TokenKind::LeftParen),
            b')' => self.make_token(TokenKind::RightParen),
            b'{' => self.make_token(TokenKind::LeftBrace),
            b'}' => self.make_token(TokenKind::RightBrace),
            b'[' => self.make_token(TokenKind::LeftBracket),
            b']' => self.make_token(TokenKind::RightBracket),
            b'?' => self.make_token(TokenKind::Question),
            b':' => self.make_token(TokenKind::Colon),
            b';' => self.make_token(TokenKind::Semicolon),
            b',' => self.make_token(TokenKind::Comma),
            b'.' => self.make_token(TokenKind::Dot),
            b'/' => self.make_token(TokenKind::Slash),
            b'*' => self.make_token(TokenKind::Star),
            b'%' => self.make_token(TokenKind::Modulo),
            b'+' => {
                if self.matches(b'+') {
                    self.make_token(TokenKind::PlusPlus)
                } else if self.matches(b'=') {
                    self.make_token(TokenKind::PlusEqual)
                } else {
                    self.make_token(TokenKind::Plus)
                }
            }
            b'-' => {
                if self.matches(b'-') {
                    self.make_token(TokenKind::MinusMinus)
                } else if self.matches(b'=') {
                    self.make_token(TokenKind::MinusEqual)
                } else if self.matches(b'>') {
                    self.make_token(TokenKind::Arrow)
                } else {
                    self.make_token(TokenKind::Minus)
                }
            }
            b'!' => {
                let kind = if self.matches(b'=') { TokenKind::BangEqual } else { TokenKind::Bang };
                self.make_token(kind)
            }
            b'=' => {
                let kind =
                    if self.matches(b'=') { TokenKind::EqualEqual } else { TokenKind::Equal };
                self.make_token(kind)
            }
            b'<' => {
                let kind =
                    if self.matches(b'=') { TokenKind::LessEqual } else { TokenKind::Less };
                self.make_token(kind)
            }
            b'>' => {
                let kind =
                    if self.matches(b'=') { TokenKind::GreaterEqual } else { TokenKind::Greater };
                self.make_token(kind)
            }
            b'|' => {
                if self.matches(b'|') {
                    self.make_token(TokenKind::Or)
                } else {
                    self.error_token("Expected '|' after '|'.")
                }
            }
            b'&' => {
                if self.matches(b'&') {
                    self.make_token(TokenKind::And)
                } else {
                    self.error_token("Expected '&' after '&'.")
                }
            }
            b'"' => self.string(),
            _ => self.error_token("Unexpected character."),
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.bytes.len()
    }

    fn advance(&mut self) -> u8 {
        let b = self.bytes[self.current];
        self.current += 1;
        b
    }

    fn peek(&self) -> u8 {
        if self.is_at_end() { 0 } else { self.bytes[self.current] }
    }

    fn peek_next(&self) -> u8 {
        if self.current + 1 >= self.bytes.len() { 0 } else { self.bytes[self.current + 1] }
    }

    fn matches(&mut self, expected: u8) -> bool {
        if self.is_at_end() || self.bytes[self.current] != expected {
            return false;
        }
        self.current += 1;
        true
    }

    fn make_token(&self, kind: TokenKind) -> Token<'src> {
        Token { kind, text: &self.source[self.start..self.current], line: self.line }
    }

    fn error_token(&self, message: &'static str) -> Token<'src> {
        Token { kind: TokenKind::Error, text: message, line: self.line }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                b' ' | b'\r' | b'\t' => {
                    self.advance();
                }
                b'\n' => {
                    self.line += 1;
                    self.advance();
                }
                b'#' => {
                    if self.peek_next() == b'*' {
                        self.advance();
                        self.advance();
                        loop {
                            if self.peek() == b'*' && self.peek_next() == b'#' {
                                self.advance();
                                self.advance();
                                break;
                            }
                            if self.is_at_end() {
                                break;
                            }
                            if self.peek() == b'\n' {
                                self.line += 1;
                            }
                            self.advance();
                        }
                    } else {
                        while self.peek() != b'\n' && !self.is_at_end() {
                            self.advance();
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn string(&mut self) -> Token<'src> {
        while self.peek() != b'"' && !self.is_at_end() {
            if self.peek() == b'\n' {
                self.line += 1;
            } else if self.peek() == b'\\' {
                self.advance();
            }
            self.advance();
        }
        if self.is_at_end() {
            return self.error_token("Unterminated string.");
        }
        self.advance();
        self.make_token(TokenKind::String)
    }

    fn number(&mut self) -> Token<'src> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == b'.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        self.make_token(TokenKind::Number)
    }

    fn identifier(&mut self) -> Token<'src> {
        while is_alpha(self.peek()) || self.peek().is_ascii_digit() {
            self.advance();
        }
        self.make_token(self.identifier_kind())
    }

    /// First-letter switch then suffix comparison, mirroring the original's
    /// `identifierType`.
    fn identifier_kind(&self) -> TokenKind {
        let lexeme = &self.source[self.start..self.current];
        match lexeme {
            "Cls" => TokenKind::Class,
            "Use" => TokenKind::Use,
            "Else" => TokenKind::Else,
            "false" => TokenKind::False,
            "For" => TokenKind::For,
            "Foreach" => TokenKind::Foreach,
            "Fun" => TokenKind::Fun,
            "If" => TokenKind::If,
            "null" => TokenKind::Null,
            "Print" => TokenKind::Print,
            "PrintLn" => TokenKind::PrintLn,
            "Exit" => TokenKind::Exit,
            "Return" => TokenKind::Return,
            "super" => TokenKind::Super,
            "this" => TokenKind::This,
            "true" => TokenKind::True,
            "Var" => TokenKind::Var,
            "While" => TokenKind::While,
            _ => TokenKind::Identifier,
        }
    }
}

fn is_alpha(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut s = Scanner::new(src);
        let mut out = Vec::new();
        loop {
            let t = s.scan_token();
            let done = t.kind == TokenKind::Eof;
            out.push(t.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn scans_compound_assignment_and_arrow() {
        assert_eq!(
            kinds("x += 1 -> "),
            vec![
                TokenKind::Identifier,
                TokenKind::PlusEqual,
                TokenKind::Number,
                TokenKind::Arrow,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn single_ampersand_is_an_error_token() {
        assert_eq!(kinds("&"), vec![TokenKind::Error, TokenKind::Eof]);
    }

    #[test]
    fn block_comment_is_skipped() {
        assert_eq!(kinds("#* comment\nspans lines *# 1"), vec![TokenKind::Number, TokenKind::Eof]);
    }

    #[test]
    fn keywords_for_and_foreach_disambiguate_on_suffix() {
        assert_eq!(kinds("For"), vec![TokenKind::For, TokenKind::Eof]);
        assert_eq!(kinds("Foreach"), vec![TokenKind::Foreach, TokenKind::Eof]);
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        assert_eq!(kinds("\"abc"), vec![TokenKind::Error, TokenKind::Eof]);
    }
}
