//! The CEL lexer.
//!
//! Hand-written scanner producing a flat token stream with byte offsets.
//! Numeric literals keep their raw spelling; the parser converts them so a
//! unary minus can fold into the literal and reach `i64::MIN`.

use crate::error::{ParseError, ParseErrors};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Ident(String),
    /// A reserved word that may not be used as an identifier.
    Reserved(String),
    IntLit(String),
    UintLit(String),
    DoubleLit(String),
    StringLit(String),
    BytesLit(Vec<u8>),
    True,
    False,
    Null,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Colon,
    Question,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Not,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub tok: Tok,
    pub offset: u32,
}

const RESERVED: &[&str] = &[
    "as", "break", "const", "continue", "else", "for", "function", "if", "import", "let", "loop",
    "package", "namespace", "return", "var", "void", "while",
];

pub(crate) fn lex(src: &str) -> Result<Vec<Token>, ParseErrors> {
    let mut lexer = Lexer {
        src,
        bytes: src.as_bytes(),
        pos: 0,
        tokens: Vec::new(),
    };
    lexer.run().map_err(|err| ParseErrors::single(err, src))?;
    Ok(lexer.tokens)
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    tokens: Vec<Token>,
}

impl Lexer<'_> {
    fn run(&mut self) -> Result<(), ParseError> {
        while self.pos < self.bytes.len() {
            let start = self.pos;
            let c = self.bytes[self.pos];
            match c {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.pos += 1;
                }
                b'/' if self.peek(1) == Some(b'/') => {
                    while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                        self.pos += 1;
                    }
                }
                b'(' => self.single(Tok::LParen),
                b')' => self.single(Tok::RParen),
                b'[' => self.single(Tok::LBracket),
                b']' => self.single(Tok::RBracket),
                b'{' => self.single(Tok::LBrace),
                b'}' => self.single(Tok::RBrace),
                b',' => self.single(Tok::Comma),
                b':' => self.single(Tok::Colon),
                b'?' => self.single(Tok::Question),
                b'+' => self.single(Tok::Plus),
                b'-' => self.single(Tok::Minus),
                b'*' => self.single(Tok::Star),
                b'/' => self.single(Tok::Slash),
                b'%' => self.single(Tok::Percent),
                b'.' => self.single(Tok::Dot),
                b'<' => {
                    if self.peek(1) == Some(b'=') {
                        self.double(Tok::LessEq);
                    } else {
                        self.single(Tok::Less);
                    }
                }
                b'>' => {
                    if self.peek(1) == Some(b'=') {
                        self.double(Tok::GreaterEq);
                    } else {
                        self.single(Tok::Greater);
                    }
                }
                b'=' => {
                    if self.peek(1) == Some(b'=') {
                        self.double(Tok::EqEq);
                    } else {
                        return Err(self.error(start, "unexpected '='; did you mean '=='?"));
                    }
                }
                b'!' => {
                    if self.peek(1) == Some(b'=') {
                        self.double(Tok::NotEq);
                    } else {
                        self.single(Tok::Not);
                    }
                }
                b'&' => {
                    if self.peek(1) == Some(b'&') {
                        self.double(Tok::AndAnd);
                    } else {
                        return Err(self.error(start, "unexpected '&'; did you mean '&&'?"));
                    }
                }
                b'|' => {
                    if self.peek(1) == Some(b'|') {
                        self.double(Tok::OrOr);
                    } else {
                        return Err(self.error(start, "unexpected '|'; did you mean '||'?"));
                    }
                }
                b'0'..=b'9' => self.number(start)?,
                b'"' | b'\'' => {
                    let (value, _) = self.string_literal(start, false)?;
                    self.push(start, Tok::StringLit(value));
                }
                _ if c == b'_' || c.is_ascii_alphabetic() => self.ident_or_prefixed(start)?,
                _ => {
                    let ch = self.src[start..].chars().next().unwrap_or('?');
                    return Err(self.error(start, format!("unexpected character '{ch}'")));
                }
            }
        }
        Ok(())
    }

    fn peek(&self, ahead: usize) -> Option<u8> {
        self.bytes.get(self.pos + ahead).copied()
    }

    fn single(&mut self, tok: Tok) {
        self.push(self.pos, tok);
        self.pos += 1;
    }

    fn double(&mut self, tok: Tok) {
        self.push(self.pos, tok);
        self.pos += 2;
    }

    fn push(&mut self, offset: usize, tok: Tok) {
        self.tokens.push(Token {
            tok,
            offset: offset as u32,
        });
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> ParseError {
        ParseError {
            message: message.into(),
            offset: offset as u32,
        }
    }

    fn number(&mut self, start: usize) -> Result<(), ParseError> {
        if self.bytes[self.pos] == b'0' && matches!(self.peek(1), Some(b'x' | b'X')) {
            self.pos += 2;
            let digits_start = self.pos;
            while self
                .peek(0)
                .is_some_and(|c| c.is_ascii_hexdigit())
            {
                self.pos += 1;
            }
            if self.pos == digits_start {
                return Err(self.error(start, "malformed hex literal"));
            }
            let raw = format!("0x{}", &self.src[digits_start..self.pos]);
            if matches!(self.peek(0), Some(b'u' | b'U')) {
                self.pos += 1;
                self.push(start, Tok::UintLit(raw));
            } else {
                self.push(start, Tok::IntLit(raw));
            }
            return Ok(());
        }

        while self.peek(0).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let mut is_double = false;
        if self.peek(0) == Some(b'.') && self.peek(1).is_some_and(|c| c.is_ascii_digit()) {
            is_double = true;
            self.pos += 1;
            while self.peek(0).is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(0), Some(b'e' | b'E')) {
            let mut lookahead = 1;
            if matches!(self.peek(1), Some(b'+' | b'-')) {
                lookahead = 2;
            }
            if self.peek(lookahead).is_some_and(|c| c.is_ascii_digit()) {
                is_double = true;
                self.pos += lookahead;
                while self.peek(0).is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
            }
        }
        let raw = self.src[start..self.pos].to_string();
        if is_double {
            self.push(start, Tok::DoubleLit(raw));
        } else if matches!(self.peek(0), Some(b'u' | b'U')) {
            self.pos += 1;
            self.push(start, Tok::UintLit(raw));
        } else {
            self.push(start, Tok::IntLit(raw));
        }
        Ok(())
    }

    fn ident_or_prefixed(&mut self, start: usize) -> Result<(), ParseError> {
        let word_start = self.pos;
        while self
            .peek(0)
            .is_some_and(|c| c == b'_' || c.is_ascii_alphanumeric())
        {
            self.pos += 1;
        }
        let word = &self.src[word_start..self.pos];

        // string prefixes: r"", b"", rb"", br"" in any case
        if matches!(self.peek(0), Some(b'"' | b'\'')) && word.len() <= 2 {
            let lower = word.to_ascii_lowercase();
            let (raw, bytes) = match lower.as_str() {
                "r" => (true, false),
                "b" => (false, true),
                "rb" | "br" => (true, true),
                _ => (false, false),
            };
            if raw || bytes || word.is_empty() {
                if word.is_empty() {
                    // unreachable: quote characters are handled by run()
                    return Err(self.error(start, "malformed string prefix"));
                }
                let (value, raw_bytes) = self.string_literal(start, raw)?;
                if bytes {
                    self.push(start, Tok::BytesLit(raw_bytes));
                } else {
                    self.push(start, Tok::StringLit(value));
                }
                return Ok(());
            }
        }

        let tok = match word {
            "true" => Tok::True,
            "false" => Tok::False,
            "null" => Tok::Null,
            "in" => Tok::In,
            w if RESERVED.contains(&w) => Tok::Reserved(w.to_string()),
            w => Tok::Ident(w.to_string()),
        };
        self.push(start, tok);
        Ok(())
    }

    /// Scans a quoted literal (single, double, or triple quotes), returning
    /// both the decoded string and the decoded byte sequence. Escape
    /// processing is skipped for raw literals.
    fn string_literal(&mut self, start: usize, raw: bool) -> Result<(String, Vec<u8>), ParseError> {
        let quote = self.bytes[self.pos];
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut text = String::new();
        let mut bytes = Vec::new();
        loop {
            let Some(c) = self.peek(0) else {
                return Err(self.error(start, "unterminated string literal"));
            };
            if c == quote {
                if triple {
                    if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                        self.pos += 3;
                        break;
                    }
                } else {
                    self.pos += 1;
                    break;
                }
            }
            if !triple && c == b'\n' {
                return Err(self.error(start, "unterminated string literal"));
            }
            if c == b'\\' && !raw {
                self.escape(start, &mut text, &mut bytes)?;
                continue;
            }
            let ch = self.src[self.pos..].chars().next().expect("in-bounds char");
            text.push(ch);
            let mut buf = [0_u8; 4];
            bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
            self.pos += ch.len_utf8();
        }
        Ok((text, bytes))
    }

    fn escape(&mut self, start: usize, text: &mut String, bytes: &mut Vec<u8>) -> Result<(), ParseError> {
        self.pos += 1; // backslash
        let Some(c) = self.peek(0) else {
            return Err(self.error(start, "unterminated escape sequence"));
        };
        self.pos += 1;
        let simple = match c {
            b'a' => Some('\x07'),
            b'b' => Some('\x08'),
            b'f' => Some('\x0c'),
            b'n' => Some('\n'),
            b'r' => Some('\r'),
            b't' => Some('\t'),
            b'v' => Some('\x0b'),
            b'\\' => Some('\\'),
            b'\'' => Some('\''),
            b'"' => Some('"'),
            b'`' => Some('`'),
            b'?' => Some('?'),
            _ => None,
        };
        if let Some(ch) = simple {
            text.push(ch);
            bytes.push(ch as u8);
            return Ok(());
        }
        match c {
            b'x' | b'X' => {
                let value = self.hex_digits(start, 2)?;
                bytes.push(value as u8);
                text.push(char::from_u32(value).unwrap_or('\u{fffd}'));
                Ok(())
            }
            b'u' => {
                let value = self.hex_digits(start, 4)?;
                let ch = char::from_u32(value)
                    .ok_or_else(|| self.error(start, "invalid unicode escape"))?;
                text.push(ch);
                let mut buf = [0_u8; 4];
                bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                Ok(())
            }
            b'U' => {
                let value = self.hex_digits(start, 8)?;
                let ch = char::from_u32(value)
                    .ok_or_else(|| self.error(start, "invalid unicode escape"))?;
                text.push(ch);
                let mut buf = [0_u8; 4];
                bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                Ok(())
            }
            b'0'..=b'7' => {
                // octal: the consumed digit plus two more
                let mut value = u32::from(c - b'0');
                for _ in 0..2 {
                    let Some(d @ b'0'..=b'7') = self.peek(0) else {
                        return Err(self.error(start, "malformed octal escape"));
                    };
                    value = value * 8 + u32::from(d - b'0');
                    self.pos += 1;
                }
                if value > 0xff {
                    return Err(self.error(start, "octal escape out of range"));
                }
                bytes.push(value as u8);
                text.push(char::from_u32(value).unwrap_or('\u{fffd}'));
                Ok(())
            }
            other => Err(self.error(
                start,
                format!("unknown escape sequence '\\{}'", other as char),
            )),
        }
    }

    fn hex_digits(&mut self, start: usize, count: usize) -> Result<u32, ParseError> {
        let mut value = 0_u32;
        for _ in 0..count {
            let Some(c) = self.peek(0) else {
                return Err(self.error(start, "malformed hex escape"));
            };
            let digit = (c as char)
                .to_digit(16)
                .ok_or_else(|| self.error(start, "malformed hex escape"))?;
            value = value * 16 + digit;
            self.pos += 1;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        lex(src).expect("lexes").into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn numbers() {
        assert_eq!(toks("42"), vec![Tok::IntLit("42".into())]);
        assert_eq!(toks("42u"), vec![Tok::UintLit("42".into())]);
        assert_eq!(toks("0x2Au"), vec![Tok::UintLit("0x2A".into())]);
        assert_eq!(toks("1.5"), vec![Tok::DoubleLit("1.5".into())]);
        assert_eq!(toks("1e3"), vec![Tok::DoubleLit("1e3".into())]);
        assert_eq!(toks("2.5e-2"), vec![Tok::DoubleLit("2.5e-2".into())]);
    }

    #[test]
    fn int_then_member_is_not_a_double() {
        assert_eq!(
            toks("[1].size"),
            vec![
                Tok::LBracket,
                Tok::IntLit("1".into()),
                Tok::RBracket,
                Tok::Dot,
                Tok::Ident("size".into()),
            ]
        );
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(toks(r#""a\nb""#), vec![Tok::StringLit("a\nb".into())]);
        assert_eq!(toks(r#"'quote"'"#), vec![Tok::StringLit("quote\"".into())]);
        assert_eq!(toks(r#"r"a\nb""#), vec![Tok::StringLit("a\\nb".into())]);
        assert_eq!(toks(r#"b"\x00hi""#), vec![Tok::BytesLit(vec![0, b'h', b'i'])]);
        assert_eq!(toks(r#""é""#), vec![Tok::StringLit("é".into())]);
        assert_eq!(toks("'''tri\nple'''"), vec![Tok::StringLit("tri\nple".into())]);
    }

    #[test]
    fn operators_and_keywords() {
        assert_eq!(
            toks("a && b || !c in d"),
            vec![
                Tok::Ident("a".into()),
                Tok::AndAnd,
                Tok::Ident("b".into()),
                Tok::OrOr,
                Tok::Not,
                Tok::Ident("c".into()),
                Tok::In,
                Tok::Ident("d".into()),
            ]
        );
        assert_eq!(toks("<= >= == !="), vec![Tok::LessEq, Tok::GreaterEq, Tok::EqEq, Tok::NotEq]);
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(toks("1 // trailing\n+ 2"), vec![
            Tok::IntLit("1".into()),
            Tok::Plus,
            Tok::IntLit("2".into()),
        ]);
    }

    #[test]
    fn reserved_words_are_flagged() {
        assert_eq!(toks("while"), vec![Tok::Reserved("while".into())]);
    }

    #[test]
    fn bad_input_errors() {
        assert!(lex("\"unterminated").is_err());
        assert!(lex("a = b").is_err());
        assert!(lex("#").is_err());
    }
}
