//! Source text to token stream.
//!
//! The lexer never fails: unknown bytes are consumed and dropped, and
//! anything else malformed surfaces later as a parse error. Every token
//! carries the 1-based line and column of its first character.

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Eof,
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Plus,
    Minus,
    Star,
    Slash,
    Comma,
    Semicolon,
    Colon,
    Equals,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    Arrow,
    KwExtern,
    KwLib,
    KwImport,
    KwExport,
    KwFn,
    KwF64,
    KwF32,
    KwI64,
    KwI32,
    KwU64,
    KwU32,
    KwVoid,
    KwPtr,
    KwAs,
    KwLet,
    KwReturn,
    KwOpaque,
    KwStruct,
    KwIf,
    KwElse,
    KwElif,
    KwFor,
    KwIn,
}

impl TokenKind {
    /// Short name for parser diagnostics.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Eof => "end of input".to_string(),
            TokenKind::Int(v) => format!("integer {}", v),
            TokenKind::Float(v) => format!("float {}", v),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Ident(name) => format!("identifier '{}'", name),
            other => format!("'{}'", other.symbol()),
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Comma => ",",
            TokenKind::Semicolon => ";",
            TokenKind::Colon => ":",
            TokenKind::Equals => "=",
            TokenKind::EqEq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Lt => "<",
            TokenKind::Gt => ">",
            TokenKind::Le => "<=",
            TokenKind::Ge => ">=",
            TokenKind::Arrow => "->",
            TokenKind::KwExtern => "extern",
            TokenKind::KwLib => "lib",
            TokenKind::KwImport => "import",
            TokenKind::KwExport => "export",
            TokenKind::KwFn => "fn",
            TokenKind::KwF64 => "f64",
            TokenKind::KwF32 => "f32",
            TokenKind::KwI64 => "i64",
            TokenKind::KwI32 => "i32",
            TokenKind::KwU64 => "u64",
            TokenKind::KwU32 => "u32",
            TokenKind::KwVoid => "void",
            TokenKind::KwPtr => "ptr",
            TokenKind::KwAs => "as",
            TokenKind::KwLet => "let",
            TokenKind::KwReturn => "return",
            TokenKind::KwOpaque => "opaque",
            TokenKind::KwStruct => "struct",
            TokenKind::KwIf => "if",
            TokenKind::KwElse => "else",
            TokenKind::KwElif => "elif",
            TokenKind::KwFor => "for",
            TokenKind::KwIn => "in",
            _ => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

fn keyword(ident: &str) -> Option<TokenKind> {
    match ident {
        "extern" => Some(TokenKind::KwExtern),
        "lib" => Some(TokenKind::KwLib),
        "import" => Some(TokenKind::KwImport),
        "export" => Some(TokenKind::KwExport),
        "fn" => Some(TokenKind::KwFn),
        "f64" => Some(TokenKind::KwF64),
        "f32" => Some(TokenKind::KwF32),
        "i64" => Some(TokenKind::KwI64),
        "i32" => Some(TokenKind::KwI32),
        "u64" => Some(TokenKind::KwU64),
        "u32" => Some(TokenKind::KwU32),
        "void" => Some(TokenKind::KwVoid),
        "ptr" => Some(TokenKind::KwPtr),
        "as" => Some(TokenKind::KwAs),
        "let" => Some(TokenKind::KwLet),
        "return" => Some(TokenKind::KwReturn),
        "opaque" => Some(TokenKind::KwOpaque),
        "struct" => Some(TokenKind::KwStruct),
        "if" => Some(TokenKind::KwIf),
        "else" => Some(TokenKind::KwElse),
        "elif" => Some(TokenKind::KwElif),
        "for" => Some(TokenKind::KwFor),
        "in" => Some(TokenKind::KwIn),
        _ => None,
    }
}

struct Lexer<'a> {
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Lexer {
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    fn current(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let b = self.current()?;
        if b == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
        Some(b)
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(b) = self.current() {
            match b {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.advance();
                }
                b'#' => {
                    while let Some(c) = self.advance() {
                        if c == b'\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn read_number(&mut self) -> TokenKind {
        let start = self.pos;
        while matches!(self.current(), Some(b) if b.is_ascii_digit()) {
            self.advance();
        }
        // A dot followed by more digits widens the span to a float.
        if self.current() == Some(b'.') && matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.advance();
            while matches!(self.current(), Some(b) if b.is_ascii_digit()) {
                self.advance();
            }
            let span = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("0.0");
            return TokenKind::Float(span.parse().unwrap_or(0.0));
        }
        let mut value: i64 = 0;
        for &b in &self.bytes[start..self.pos] {
            value = value.wrapping_mul(10).wrapping_add((b - b'0') as i64);
        }
        TokenKind::Int(value)
    }

    fn read_ident(&mut self) -> TokenKind {
        let start = self.pos;
        while matches!(self.current(), Some(b) if b.is_ascii_alphanumeric() || b == b'_') {
            self.advance();
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos])
            .unwrap_or("")
            .to_string();
        keyword(&text).unwrap_or(TokenKind::Ident(text))
    }

    fn read_string(&mut self) -> TokenKind {
        self.advance(); // opening quote
        let mut s = String::new();
        loop {
            match self.advance() {
                None | Some(b'"') => break,
                Some(b'\\') => match self.advance() {
                    Some(b'n') => s.push('\n'),
                    Some(b't') => s.push('\t'),
                    Some(b'"') => s.push('"'),
                    Some(b'\\') => s.push('\\'),
                    Some(other) => s.push(other as char),
                    None => break,
                },
                Some(b) => s.push(b as char),
            }
        }
        TokenKind::Str(s)
    }
}

/// Tokenize a whole source string. The result always ends with `Eof`.
pub fn lex(source: &str) -> Vec<Token> {
    let mut lx = Lexer::new(source);
    let mut tokens = Vec::new();

    loop {
        lx.skip_whitespace_and_comments();
        let (line, column) = (lx.line, lx.col);
        let b = match lx.current() {
            Some(b) => b,
            None => break,
        };

        let kind = match b {
            b'0'..=b'9' => lx.read_number(),
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => lx.read_ident(),
            b'"' => lx.read_string(),
            b'(' => {
                lx.advance();
                TokenKind::LParen
            }
            b')' => {
                lx.advance();
                TokenKind::RParen
            }
            b'{' => {
                lx.advance();
                TokenKind::LBrace
            }
            b'}' => {
                lx.advance();
                TokenKind::RBrace
            }
            b'[' => {
                lx.advance();
                TokenKind::LBracket
            }
            b']' => {
                lx.advance();
                TokenKind::RBracket
            }
            b'+' => {
                lx.advance();
                TokenKind::Plus
            }
            b'-' => {
                lx.advance();
                if lx.current() == Some(b'>') {
                    lx.advance();
                    TokenKind::Arrow
                } else {
                    TokenKind::Minus
                }
            }
            b'*' => {
                lx.advance();
                TokenKind::Star
            }
            b'/' => {
                lx.advance();
                TokenKind::Slash
            }
            b',' => {
                lx.advance();
                TokenKind::Comma
            }
            b';' => {
                lx.advance();
                TokenKind::Semicolon
            }
            b':' => {
                lx.advance();
                TokenKind::Colon
            }
            b'=' => {
                lx.advance();
                if lx.current() == Some(b'=') {
                    lx.advance();
                    TokenKind::EqEq
                } else {
                    TokenKind::Equals
                }
            }
            b'!' => {
                lx.advance();
                if lx.current() == Some(b'=') {
                    lx.advance();
                    TokenKind::NotEq
                } else {
                    // Bare '!' is not a token; drop it.
                    continue;
                }
            }
            b'<' => {
                lx.advance();
                if lx.current() == Some(b'=') {
                    lx.advance();
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            b'>' => {
                lx.advance();
                if lx.current() == Some(b'=') {
                    lx.advance();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            _ => {
                // Unknown byte: consume and drop.
                lx.advance();
                continue;
            }
        };

        tokens.push(Token { kind, line, column });
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        line: lx.line,
        column: lx.col,
    });
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_integer_and_float_literals() {
        assert_eq!(
            kinds("42 3.25"),
            vec![TokenKind::Int(42), TokenKind::Float(3.25), TokenKind::Eof]
        );
    }

    #[test]
    fn test_integer_then_dot_without_digits_stays_integer() {
        // "1." is an integer followed by an unknown '.' byte, which drops.
        assert_eq!(kinds("1."), vec![TokenKind::Int(1), TokenKind::Eof]);
    }

    #[test]
    fn test_keywords_and_identifiers() {
        assert_eq!(
            kinds("let foo fn ifx"),
            vec![
                TokenKind::KwLet,
                TokenKind::Ident("foo".to_string()),
                TokenKind::KwFn,
                TokenKind::Ident("ifx".to_string()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_two_char_operators() {
        assert_eq!(
            kinds("-> == != <= >= < > ="),
            vec![
                TokenKind::Arrow,
                TokenKind::EqEq,
                TokenKind::NotEq,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::Lt,
                TokenKind::Gt,
                TokenKind::Equals,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\nb\t\"\\q\z""#),
            vec![TokenKind::Str("a\nb\t\"\\qz".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_comment_runs_to_newline() {
        assert_eq!(
            kinds("1 # everything here is ignored ; fn\n2"),
            vec![TokenKind::Int(1), TokenKind::Int(2), TokenKind::Eof]
        );
    }

    #[test]
    fn test_unknown_bytes_are_dropped() {
        assert_eq!(
            kinds("1 @ $ 2 !"),
            vec![TokenKind::Int(1), TokenKind::Int(2), TokenKind::Eof]
        );
    }

    #[test]
    fn test_positions_are_one_based() {
        let tokens = lex("let x\n  = 1;");
        assert_eq!((tokens[0].line, tokens[0].column), (1, 1)); // let
        assert_eq!((tokens[1].line, tokens[1].column), (1, 5)); // x
        assert_eq!((tokens[2].line, tokens[2].column), (2, 3)); // =
        assert_eq!((tokens[3].line, tokens[3].column), (2, 5)); // 1
    }

    #[test]
    fn test_eof_sentinel_always_present() {
        let tokens = lex("");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Eof);
    }

    #[test]
    fn test_brackets_and_punctuation() {
        assert_eq!(
            kinds("a[0]; {x: i64,}"),
            vec![
                TokenKind::Ident("a".to_string()),
                TokenKind::LBracket,
                TokenKind::Int(0),
                TokenKind::RBracket,
                TokenKind::Semicolon,
                TokenKind::LBrace,
                TokenKind::Ident("x".to_string()),
                TokenKind::Colon,
                TokenKind::KwI64,
                TokenKind::Comma,
                TokenKind::RBrace,
                TokenKind::Eof,
            ]
        );
    }
}
