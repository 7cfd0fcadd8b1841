// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Routing-condition expression language
//!
//! A small boolean language over whitelisted tag names and derived
//! pseudo-fields:
//!
//! ```text
//! Modality == "CT" and FileCount >= 3
//! SeriesDescription contains "T1" or StudyDescription matches "(?i)brain"
//! not OffPeak
//! ```
//!
//! Operators: `and`/`or`/`not` (also `&&`/`||`/`!`), `==`, `!=`, `<`, `<=`,
//! `>`, `>=`, `contains`, `matches`. Comparisons are numeric when both sides
//! parse as numbers, lexical otherwise. A whitelisted tag that is absent
//! from a snapshot evaluates to the empty string; an identifier outside the
//! whitelist is rejected at parse time.

use radroute_core::tags::KNOWN_TAGS;
use regex::Regex;
use thiserror::Error;

/// Pseudo-fields derived from the task rather than the tag snapshot
pub const PSEUDO_FIELDS: &[&str] = &["FileCount", "ReceivedTime", "OffPeak"];

/// Errors from parsing a condition
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string literal starting at offset {0}")]
    UnterminatedString(usize),
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token {0:?}")]
    UnexpectedToken(String),
    #[error("unknown field '{0}' (not a whitelisted tag or pseudo-field)")]
    UnknownField(String),
    #[error("'matches' needs a string literal pattern on the right")]
    MatchesNeedsLiteral,
    #[error("invalid regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("trailing input after expression: {0:?}")]
    TrailingInput(String),
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A leaf operand
#[derive(Debug, Clone)]
pub enum Operand {
    /// Whitelisted tag or pseudo-field
    Field(String),
    Str(String),
    Num(f64),
    Bool(bool),
}

/// Parsed condition AST
#[derive(Debug, Clone)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp {
        lhs: Operand,
        op: CmpOp,
        rhs: Operand,
    },
    Contains {
        lhs: Operand,
        needle: Operand,
    },
    Matches {
        lhs: Operand,
        pattern: String,
        regex: Regex,
    },
    /// Bare operand, evaluated for truthiness
    Operand(Operand),
}

/// A resolved operand value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::Str(s) => !s.is_empty(),
            Value::Num(n) => *n != 0.0,
            Value::Bool(b) => *b,
        }
    }

    fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Str(s) => s.trim().parse().ok(),
            Value::Bool(_) => None,
        }
    }

    fn render(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Num(n) => {
                if n.fract() == 0.0 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            Value::Bool(b) => b.to_string(),
        }
    }
}

/// Resolves field names during evaluation
pub trait FieldSource {
    /// Missing fields must resolve to `Value::Str("")`, never fail
    fn field(&self, name: &str) -> Value;
}

impl Expr {
    /// Parse a condition string
    pub fn parse(input: &str) -> Result<Expr, ParseError> {
        let tokens = lex(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos < parser.tokens.len() {
            return Err(ParseError::TrailingInput(format!(
                "{:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(expr)
    }

    /// Evaluate against a field source. Total: never fails at runtime.
    pub fn eval(&self, source: &impl FieldSource) -> bool {
        match self {
            Expr::Or(a, b) => a.eval(source) || b.eval(source),
            Expr::And(a, b) => a.eval(source) && b.eval(source),
            Expr::Not(inner) => !inner.eval(source),
            Expr::Cmp { lhs, op, rhs } => {
                let lhs = resolve(lhs, source);
                let rhs = resolve(rhs, source);
                compare(&lhs, *op, &rhs)
            }
            Expr::Contains { lhs, needle } => {
                let haystack = resolve(lhs, source).render();
                let needle = resolve(needle, source).render();
                haystack.contains(&needle)
            }
            Expr::Matches { lhs, regex, .. } => {
                let value = resolve(lhs, source).render();
                regex.is_match(&value)
            }
            Expr::Operand(operand) => resolve(operand, source).truthy(),
        }
    }
}

fn resolve(operand: &Operand, source: &impl FieldSource) -> Value {
    match operand {
        Operand::Field(name) => source.field(name),
        Operand::Str(s) => Value::Str(s.clone()),
        Operand::Num(n) => Value::Num(*n),
        Operand::Bool(b) => Value::Bool(*b),
    }
}

fn compare(lhs: &Value, op: CmpOp, rhs: &Value) -> bool {
    // Numeric when both sides are numbers, lexical otherwise
    if let (Some(a), Some(b)) = (lhs.as_num(), rhs.as_num()) {
        return match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        };
    }
    let a = lhs.render();
    let b = rhs.render();
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt => a < b,
        CmpOp::Le => a <= b,
        CmpOp::Gt => a > b,
        CmpOp::Ge => a >= b,
    }
}

// === Lexer ===

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    And,
    Or,
    Not,
    Cmp(CmpOp),
    Contains,
    Matches,
    True,
    False,
}

fn lex(input: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Cmp(CmpOp::Le));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Cmp(CmpOp::Lt));
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Cmp(CmpOp::Ge));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Cmp(CmpOp::Gt));
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i;
                i += 1;
                let mut value = String::new();
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                        None => return Err(ParseError::UnterminatedString(start)),
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse()
                    .map_err(|_| ParseError::UnexpectedToken(text.clone()))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "contains" => Token::Contains,
                    "matches" => Token::Matches,
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(ParseError::UnexpectedChar(other, i)),
        }
    }

    Ok(tokens)
}

// === Parser ===

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            expr = Expr::Or(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            expr = Expr::And(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let expr = self.parse_or()?;
            match self.next() {
                Some(Token::RParen) => return Ok(expr),
                Some(other) => return Err(ParseError::UnexpectedToken(format!("{:?}", other))),
                None => return Err(ParseError::UnexpectedEnd),
            }
        }

        let lhs = self.parse_operand()?;

        match self.peek().cloned() {
            Some(Token::Cmp(op)) => {
                self.pos += 1;
                let rhs = self.parse_operand()?;
                Ok(Expr::Cmp { lhs, op, rhs })
            }
            Some(Token::Contains) => {
                self.pos += 1;
                let needle = self.parse_operand()?;
                Ok(Expr::Contains { lhs, needle })
            }
            Some(Token::Matches) => {
                self.pos += 1;
                match self.next() {
                    Some(Token::Str(pattern)) => {
                        let regex =
                            Regex::new(&pattern).map_err(|source| ParseError::InvalidRegex {
                                pattern: pattern.clone(),
                                source,
                            })?;
                        Ok(Expr::Matches {
                            lhs,
                            pattern,
                            regex,
                        })
                    }
                    _ => Err(ParseError::MatchesNeedsLiteral),
                }
            }
            _ => Ok(Expr::Operand(lhs)),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, ParseError> {
        match self.next() {
            Some(Token::Ident(name)) => {
                if KNOWN_TAGS.contains(&name.as_str()) || PSEUDO_FIELDS.contains(&name.as_str()) {
                    Ok(Operand::Field(name))
                } else {
                    Err(ParseError::UnknownField(name))
                }
            }
            Some(Token::Str(s)) => Ok(Operand::Str(s)),
            Some(Token::Num(n)) => Ok(Operand::Num(n)),
            Some(Token::True) => Ok(Operand::Bool(true)),
            Some(Token::False) => Ok(Operand::Bool(false)),
            Some(other) => Err(ParseError::UnexpectedToken(format!("{:?}", other))),
            None => Err(ParseError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
#[path = "expr_tests.rs"]
mod tests;
