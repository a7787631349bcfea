//! FILENAME: parser/src/lib.rs
//! PURPOSE: Library root for the reference grammar and the formula parser.
//! CONTEXT: Two small grammars live here. The reference grammar finds
//! `$COLUMN.SUBFIELD.FORMATTER$` tokens inside free-form text. The formula
//! grammar parses the arithmetic that remains once those tokens have been
//! replaced by values.
//!
//! PIPELINES:
//!   Text    --> reference::parse --> ReferenceToken stream --> splice
//!   Formula --> Lexer --> Tokens --> Parser --> AST --> engine evaluator
//!
//! SUPPORTED FORMULA FEATURES:
//! - Arithmetic: +, -, *, /, %, ^ (power)
//! - Comparison: ==, !=, <>, <, >, <=, >=
//! - Logical: and, or
//! - Function calls: min(1, 2), roundn(x, 2)
//! - Parentheses for grouping
//! - Unary negation: -5

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod reference;
pub mod token;


pub use ast::{BinaryOperator, Expression, UnaryOperator};
pub use lexer::Lexer;
pub use parser::{parse, ParseError, ParseResult, Parser};
pub use reference::{
    format as format_reference, normalize_legacy, parse as parse_references, parse_bare,
    splice, Reference, ReferenceToken, References, DELIMITER,
};
pub use token::Token;
