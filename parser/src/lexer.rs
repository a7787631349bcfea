//! FILENAME: parser/src/lexer.rs
//! PURPOSE: Scans a substituted formula string and produces a stream of Tokens.
//! CONTEXT: This is the first stage of the formula pipeline. It handles
//! whitespace skipping, number parsing (including exponents), identifiers,
//! the `and`/`or` keywords, and multi-character operators like <= and !=.
//!
//! SUPPORTED OPERATORS:
//! - Single char: + - * / % ^ ( ) , = < >
//! - Multi char: <= >= <> != ==

use crate::token::Token;
use std::iter::Peekable;
use std::str::Chars;

pub struct Lexer<'a> {
    input: Peekable<Chars<'a>>,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer {
            input: input.chars().peekable(),
        }
    }

    /// Advances the lexer and returns the next token.
    pub fn next_token(&mut self) -> Token {
        self.skip_whitespace();

        match self.input.next() {
            Some('+') => Token::Plus,
            Some('-') => Token::Minus,
            Some('*') => Token::Asterisk,
            Some('/') => Token::Slash,
            Some('%') => Token::Percent,
            Some('^') => Token::Caret,
            Some('(') => Token::LParen,
            Some(')') => Token::RParen,
            Some(',') => Token::Comma,

            // = and ==
            Some('=') => {
                if self.input.peek() == Some(&'=') {
                    self.input.next();
                }
                Token::Equals
            }

            // != only; a lone ! is not an operator
            Some('!') => {
                if self.input.peek() == Some(&'=') {
                    self.input.next();
                    Token::NotEqual
                } else {
                    Token::Illegal('!')
                }
            }

            Some('<') => self.read_less_than_operator(),
            Some('>') => self.read_greater_than_operator(),

            Some(ch) if ch.is_ascii_digit() || ch == '.' => self.read_number(ch),

            Some(ch) if is_letter(ch) => self.read_identifier(ch),

            None => Token::EOF,

            Some(ch) => Token::Illegal(ch),
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(&ch) = self.input.peek() {
            if !ch.is_whitespace() {
                break;
            }
            self.input.next();
        }
    }

    /// Handles operators starting with '<': <, <=, <>
    fn read_less_than_operator(&mut self) -> Token {
        match self.input.peek() {
            Some('=') => {
                self.input.next();
                Token::LessEqual
            }
            Some('>') => {
                self.input.next();
                Token::NotEqual
            }
            _ => Token::LessThan,
        }
    }

    /// Handles operators starting with '>': >, >=
    fn read_greater_than_operator(&mut self) -> Token {
        match self.input.peek() {
            Some('=') => {
                self.input.next();
                Token::GreaterEqual
            }
            _ => Token::GreaterThan,
        }
    }

    fn read_number(&mut self, first_char: char) -> Token {
        let mut number_str = String::from(first_char);
        let mut has_dot = first_char == '.';
        let mut has_exponent = false;

        while let Some(&ch) = self.input.peek() {
            if ch.is_ascii_digit() {
                number_str.push(ch);
                self.input.next();
            } else if ch == '.' && !has_dot && !has_exponent {
                has_dot = true;
                number_str.push(ch);
                self.input.next();
            } else if (ch == 'e' || ch == 'E') && !has_exponent {
                // Stored values such as 1e-7 arrive in scientific notation
                has_exponent = true;
                number_str.push(ch);
                self.input.next();
                if let Some(&sign) = self.input.peek() {
                    if sign == '+' || sign == '-' {
                        number_str.push(sign);
                        self.input.next();
                    }
                }
            } else {
                break;
            }
        }

        match number_str.parse::<f64>() {
            Ok(n) => Token::Number(n),
            Err(_) => Token::Illegal(first_char),
        }
    }

    fn read_identifier(&mut self, first_char: char) -> Token {
        let mut ident = String::from(first_char);

        while let Some(&ch) = self.input.peek() {
            if is_letter(ch) || ch.is_ascii_digit() {
                ident.push(ch);
                self.input.next();
            } else {
                break;
            }
        }

        match ident.to_lowercase().as_str() {
            "and" => Token::And,
            "or" => Token::Or,
            lower => Token::Identifier(lower.to_string()),
        }
    }
}

/// Returns true if `ch` can start an identifier.
fn is_letter(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}
