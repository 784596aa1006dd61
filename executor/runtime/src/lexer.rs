use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Ident(String),
    Num(f64),
    Str(String),

    // Keywords
    Nil,
    True,
    False,
    Fn,
    End,
    If,
    Elseif,
    Else,
    While,
    For,
    In,
    Return,
    Break,
    Continue,
    Try,
    Catch,
    And,
    Or,
    Not,

    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,

    /// Statement separator: newline (outside brackets) or `;`.
    Newline,
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
    pub column: u32,
}

pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
    column: u32,
    /// Newlines inside `(`/`[`/`{` are not statement separators.
    depth: u32,
    out: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Lexer {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
            depth: 0,
            out: Vec::new(),
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn push(&mut self, tok: Tok, line: u32, column: u32) {
        self.out.push(Token { tok, line, column });
    }

    fn push_separator(&mut self, line: u32, column: u32) {
        // collapse runs of separators
        if !matches!(self.out.last().map(|t| &t.tok), Some(Tok::Newline) | None) {
            self.push(Tok::Newline, line, column);
        }
    }

    fn run(mut self) -> Result<Vec<Token>> {
        while let Some(&c) = self.chars.peek() {
            let (line, column) = (self.line, self.column);
            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '\n' => {
                    self.bump();
                    if self.depth == 0 {
                        self.push_separator(line, column);
                    }
                }
                '#' => {
                    while let Some(&c) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                ';' => {
                    self.bump();
                    self.push_separator(line, column);
                }
                '0'..='9' => self.number(line, column)?,
                '"' => self.string(line, column)?,
                c if c.is_alphabetic() || c == '_' => self.ident(line, column),
                _ => self.punct(line, column)?,
            }
        }
        let (line, column) = (self.line, self.column);
        self.push(Tok::Eof, line, column);
        Ok(self.out)
    }

    fn number(&mut self, line: u32, column: u32) -> Result<()> {
        let mut text = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        if self.chars.peek() == Some(&'.') {
            // lookahead: `1.foo` is member access on a number, not a fraction
            let mut ahead = self.chars.clone();
            ahead.next();
            if ahead.peek().map_or(false, |c| c.is_ascii_digit()) {
                text.push('.');
                self.bump();
                while let Some(&c) = self.chars.peek() {
                    if c.is_ascii_digit() {
                        text.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
            }
        }
        let value: f64 = text
            .parse()
            .map_err(|_| Error::parse(format!("invalid number literal '{text}'"), line, column))?;
        self.push(Tok::Num(value), line, column);
        Ok(())
    }

    fn string(&mut self, line: u32, column: u32) -> Result<()> {
        self.bump(); // opening quote
        let mut text = String::new();
        loop {
            let c = self
                .bump()
                .ok_or_else(|| Error::parse("unterminated string literal", line, column))?;
            match c {
                '"' => break,
                '\\' => {
                    let esc = self
                        .bump()
                        .ok_or_else(|| Error::parse("unterminated escape", line, column))?;
                    match esc {
                        'n' => text.push('\n'),
                        't' => text.push('\t'),
                        'r' => text.push('\r'),
                        '\\' => text.push('\\'),
                        '"' => text.push('"'),
                        'u' => {
                            if self.bump() != Some('{') {
                                return Err(Error::parse("expected '{' after \\u", line, column));
                            }
                            let mut hex = String::new();
                            loop {
                                match self.bump() {
                                    Some('}') => break,
                                    Some(c) if c.is_ascii_hexdigit() => hex.push(c),
                                    _ => {
                                        return Err(Error::parse(
                                            "invalid unicode escape",
                                            line,
                                            column,
                                        ))
                                    }
                                }
                            }
                            let code = u32::from_str_radix(&hex, 16).map_err(|_| {
                                Error::parse("invalid unicode escape", line, column)
                            })?;
                            let c = char::from_u32(code).ok_or_else(|| {
                                Error::parse("invalid unicode codepoint", line, column)
                            })?;
                            text.push(c);
                        }
                        other => {
                            return Err(Error::parse(
                                format!("unknown escape '\\{other}'"),
                                line,
                                column,
                            ))
                        }
                    }
                }
                other => text.push(other),
            }
        }
        self.push(Tok::Str(text), line, column);
        Ok(())
    }

    fn ident(&mut self, line: u32, column: u32) {
        let mut text = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let tok = match text.as_str() {
            "nil" => Tok::Nil,
            "true" => Tok::True,
            "false" => Tok::False,
            "fn" => Tok::Fn,
            "end" => Tok::End,
            "if" => Tok::If,
            "elseif" => Tok::Elseif,
            "else" => Tok::Else,
            "while" => Tok::While,
            "for" => Tok::For,
            "in" => Tok::In,
            "return" => Tok::Return,
            "break" => Tok::Break,
            "continue" => Tok::Continue,
            "try" => Tok::Try,
            "catch" => Tok::Catch,
            "and" => Tok::And,
            "or" => Tok::Or,
            "not" => Tok::Not,
            _ => Tok::Ident(text),
        };
        self.push(tok, line, column);
    }

    fn punct(&mut self, line: u32, column: u32) -> Result<()> {
        let c = self.bump().unwrap_or('\0');
        let tok = match c {
            '(' => {
                self.depth += 1;
                Tok::LParen
            }
            ')' => {
                self.depth = self.depth.saturating_sub(1);
                Tok::RParen
            }
            '[' => {
                self.depth += 1;
                Tok::LBracket
            }
            ']' => {
                self.depth = self.depth.saturating_sub(1);
                Tok::RBracket
            }
            '{' => {
                self.depth += 1;
                Tok::LBrace
            }
            '}' => {
                self.depth = self.depth.saturating_sub(1);
                Tok::RBrace
            }
            ',' => Tok::Comma,
            ':' => Tok::Colon,
            '.' => Tok::Dot,
            '+' => Tok::Plus,
            '-' => Tok::Minus,
            '*' => Tok::Star,
            '/' => Tok::Slash,
            '%' => Tok::Percent,
            '=' => {
                if self.chars.peek() == Some(&'=') {
                    self.bump();
                    Tok::Eq
                } else {
                    Tok::Assign
                }
            }
            '!' => {
                if self.chars.peek() == Some(&'=') {
                    self.bump();
                    Tok::Ne
                } else {
                    Tok::Bang
                }
            }
            '<' => {
                if self.chars.peek() == Some(&'=') {
                    self.bump();
                    Tok::Le
                } else {
                    Tok::Lt
                }
            }
            '>' => {
                if self.chars.peek() == Some(&'=') {
                    self.bump();
                    Tok::Ge
                } else {
                    Tok::Gt
                }
            }
            other => {
                return Err(Error::parse(
                    format!("unexpected character '{other}'"),
                    line,
                    column,
                ))
            }
        };
        self.push(tok, line, column);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn keywords_and_idents() {
        assert_eq!(
            toks("fn foo end"),
            vec![Tok::Fn, Tok::Ident("foo".into()), Tok::End, Tok::Eof]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(toks("1 2.5"), vec![Tok::Num(1.0), Tok::Num(2.5), Tok::Eof]);
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            toks(r#""a\nb" "\u{41}""#),
            vec![Tok::Str("a\nb".into()), Tok::Str("A".into()), Tok::Eof]
        );
    }

    #[test]
    fn newlines_separate_only_at_top_level() {
        assert_eq!(
            toks("a\nb"),
            vec![
                Tok::Ident("a".into()),
                Tok::Newline,
                Tok::Ident("b".into()),
                Tok::Eof
            ]
        );
        // inside brackets newlines are insignificant
        assert_eq!(
            toks("[1,\n2]"),
            vec![
                Tok::LBracket,
                Tok::Num(1.0),
                Tok::Comma,
                Tok::Num(2.0),
                Tok::RBracket,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn comments_run_to_end_of_line() {
        assert_eq!(
            toks("a # comment\nb"),
            vec![
                Tok::Ident("a".into()),
                Tok::Newline,
                Tok::Ident("b".into()),
                Tok::Eof
            ]
        );
    }

    #[test]
    fn two_char_operators() {
        assert_eq!(
            toks("== != <= >="),
            vec![Tok::Eq, Tok::Ne, Tok::Le, Tok::Ge, Tok::Eof]
        );
    }

    #[test]
    fn position_tracking() {
        let tokens = tokenize("a\n  b").unwrap();
        assert_eq!((tokens[0].line, tokens[0].column), (1, 1));
        let b = tokens.iter().find(|t| t.tok == Tok::Ident("b".into())).unwrap();
        assert_eq!((b.line, b.column), (2, 3));
    }

    #[test]
    fn unexpected_character_is_a_parse_error() {
        let err = tokenize("a @ b").unwrap_err();
        assert_eq!(err.kind_str(), "parse");
    }
}
