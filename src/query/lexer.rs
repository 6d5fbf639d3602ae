//! Tokenizer for query predicates.

use crate::error::{Result, SpyError};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Regex { pattern: String, flags: String },
    LParen,
    RParen,
    Comma,
    Not,
    And,
    Or,
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
    Question,
    Colon,
    Eof,
}

impl Token {
    /// Tokens after which a `/` divides instead of opening a regex.
    fn ends_operand(&self) -> bool {
        matches!(
            self,
            Token::Ident(_) | Token::Number(_) | Token::Str(_) | Token::Regex { .. } | Token::RParen
        )
    }
}

/// A token and its byte offset in the source.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Spanned {
    pub token: Token,
    pub position: usize,
}

pub(crate) struct Lexer<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    previous: Option<Token>,
}

impl<'a> Lexer<'a> {
    pub(crate) fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            previous: None,
        }
    }

    /// Tokenizes the whole source, ending with [`Token::Eof`].
    pub(crate) fn tokenize(mut self) -> Result<Vec<Spanned>> {
        let mut tokens = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            self.previous = Some(spanned.token.clone());
            tokens.push(spanned);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn error(&self, position: usize, message: impl Into<String>) -> SpyError {
        SpyError::expression(self.source, position, message)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.chars.peek().is_some_and(|&(_, c)| c == expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn next_token(&mut self) -> Result<Spanned> {
        while self.chars.peek().is_some_and(|(_, c)| c.is_whitespace()) {
            self.chars.next();
        }

        let Some((position, c)) = self.chars.next() else {
            return Ok(Spanned {
                token: Token::Eof,
                position: self.source.len(),
            });
        };

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '?' => Token::Question,
            ':' => Token::Colon,
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '%' => Token::Percent,
            '!' => {
                if self.eat('=') {
                    self.eat('=');
                    Token::Ne
                } else {
                    Token::Not
                }
            }
            '=' => {
                if !self.eat('=') {
                    return Err(self.error(position, "assignment is not supported"));
                }
                self.eat('=');
                Token::Eq
            }
            '<' => {
                if self.eat('=') {
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            '>' => {
                if self.eat('=') {
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            '&' => {
                if !self.eat('&') {
                    return Err(self.error(position, "expected `&&`"));
                }
                Token::And
            }
            '|' => {
                if !self.eat('|') {
                    return Err(self.error(position, "expected `||`"));
                }
                Token::Or
            }
            '/' => {
                if self.previous.as_ref().is_some_and(Token::ends_operand) {
                    Token::Slash
                } else {
                    self.regex(position)?
                }
            }
            '\'' | '"' => self.string(position, c)?,
            c if c.is_ascii_digit() || c == '.' => self.number(position)?,
            c if c.is_ascii_alphabetic() => {
                let mut end = position + c.len_utf8();
                while let Some(&(i, c)) = self.chars.peek() {
                    if !c.is_ascii_alphabetic() {
                        break;
                    }
                    end = i + c.len_utf8();
                    self.chars.next();
                }
                Token::Ident(self.source[position..end].to_string())
            }
            other => return Err(self.error(position, format!("unexpected character `{other}`"))),
        };

        Ok(Spanned { token, position })
    }

    fn number(&mut self, start: usize) -> Result<Token> {
        let mut end = start + 1;
        while let Some(&(i, c)) = self.chars.peek() {
            if !(c.is_ascii_digit() || c == '.') {
                break;
            }
            end = i + 1;
            self.chars.next();
        }
        let text = &self.source[start..end];
        text.parse()
            .map(Token::Number)
            .map_err(|_| self.error(start, format!("invalid number `{text}`")))
    }

    fn string(&mut self, start: usize, quote: char) -> Result<Token> {
        let mut value = String::new();
        loop {
            match self.chars.next() {
                None => return Err(self.error(start, "unterminated string")),
                Some((_, c)) if c == quote => return Ok(Token::Str(value)),
                Some((_, '\\')) => match self.chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, c)) => value.push(c),
                    None => return Err(self.error(start, "unterminated string")),
                },
                Some((_, c)) => value.push(c),
            }
        }
    }

    fn regex(&mut self, start: usize) -> Result<Token> {
        let mut pattern = String::new();
        let mut in_class = false;
        loop {
            match self.chars.next() {
                None | Some((_, '\n')) => return Err(self.error(start, "unterminated regex")),
                Some((_, '/')) if !in_class => break,
                Some((_, '\\')) => {
                    pattern.push('\\');
                    match self.chars.next() {
                        Some((_, c)) => pattern.push(c),
                        None => return Err(self.error(start, "unterminated regex")),
                    }
                }
                Some((_, c)) => {
                    match c {
                        '[' => in_class = true,
                        ']' => in_class = false,
                        _ => {}
                    }
                    pattern.push(c);
                }
            }
        }

        let mut flags = String::new();
        while let Some(&(_, c)) = self.chars.peek() {
            if !c.is_ascii_alphabetic() {
                break;
            }
            flags.push(c);
            self.chars.next();
        }
        Ok(Token::Regex { pattern, flags })
    }
}
