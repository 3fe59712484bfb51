//! RQL filter expressions.
//!
//! Targets may restrict the signals they receive with a filter expression
//! such as `and(eq(topic:action,"modified"),gt(attributes/level,3))`.
//! The grammar is the function-call style RQL subset:
//!
//! ```text
//! query    = and(query,...) | or(query,...) | not(query) | predicate
//! predicate = eq|ne|gt|ge|lt|le (path, literal)
//!           | in(path, literal, ...)
//!           | like(path, "pattern-with-*")
//!           | exists(path)
//! ```
//!
//! Evaluation is against a field resolver supplied by the caller, so the
//! same expression works pre- and post-enrichment.

use crate::protocol::error::GatewayError;
use serde_json::Value;

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// Literal operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum RqlExpr {
    And(Vec<RqlExpr>),
    Or(Vec<RqlExpr>),
    Not(Box<RqlExpr>),
    Compare {
        op: Comparison,
        path: String,
        literal: Literal,
    },
    In {
        path: String,
        literals: Vec<Literal>,
    },
    Like {
        path: String,
        pattern: String,
    },
    Exists {
        path: String,
    },
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, GatewayError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(pos, ch)) = chars.peek() {
        match ch {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '"' | '\'' => {
                let quote = ch;
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == quote {
                        closed = true;
                        break;
                    }
                    value.push(c);
                }
                if !closed {
                    return Err(invalid(input, "unterminated string literal"));
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' => {
                let start = pos;
                let mut end = pos;
                while let Some(&(p, c)) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c == 'e' || c == 'E'
                    {
                        end = p + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let raw = &input[start..end];
                let num = raw
                    .parse::<f64>()
                    .map_err(|_| invalid(input, &format!("bad number '{raw}'")))?;
                tokens.push(Token::Num(num));
            }
            c if is_ident_char(c) => {
                let start = pos;
                let mut end = pos;
                while let Some(&(p, c)) = chars.peek() {
                    if is_ident_char(c) {
                        end = p + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(input[start..end].to_string()));
            }
            other => {
                return Err(invalid(input, &format!("unexpected character '{other}'")));
            }
        }
    }
    Ok(tokens)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '.' | ':' | '*')
}

fn invalid(input: &str, reason: &str) -> GatewayError {
    GatewayError::configuration_invalid(format!("invalid RQL filter '{input}': {reason}"))
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<Token, GatewayError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| invalid(self.input, "unexpected end of input"))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: &Token) -> Result<(), GatewayError> {
        let token = self.next()?;
        if &token == expected {
            Ok(())
        } else {
            Err(invalid(self.input, &format!("expected {expected:?}, got {token:?}")))
        }
    }

    fn parse_query(&mut self) -> Result<RqlExpr, GatewayError> {
        let name = match self.next()? {
            Token::Ident(name) => name,
            other => return Err(invalid(self.input, &format!("expected operator, got {other:?}"))),
        };
        self.expect(&Token::LParen)?;
        let expr = match name.as_str() {
            "and" | "or" => {
                let mut queries = vec![self.parse_query()?];
                while self.peek() == Some(&Token::Comma) {
                    self.next()?;
                    queries.push(self.parse_query()?);
                }
                if name == "and" {
                    RqlExpr::And(queries)
                } else {
                    RqlExpr::Or(queries)
                }
            }
            "not" => RqlExpr::Not(Box::new(self.parse_query()?)),
            "eq" | "ne" | "gt" | "ge" | "lt" | "le" => {
                let path = self.parse_path()?;
                self.expect(&Token::Comma)?;
                let literal = self.parse_literal()?;
                let op = match name.as_str() {
                    "eq" => Comparison::Eq,
                    "ne" => Comparison::Ne,
                    "gt" => Comparison::Gt,
                    "ge" => Comparison::Ge,
                    "lt" => Comparison::Lt,
                    _ => Comparison::Le,
                };
                RqlExpr::Compare { op, path, literal }
            }
            "in" => {
                let path = self.parse_path()?;
                let mut literals = Vec::new();
                while self.peek() == Some(&Token::Comma) {
                    self.next()?;
                    literals.push(self.parse_literal()?);
                }
                if literals.is_empty() {
                    return Err(invalid(self.input, "in() needs at least one literal"));
                }
                RqlExpr::In { path, literals }
            }
            "like" => {
                let path = self.parse_path()?;
                self.expect(&Token::Comma)?;
                let pattern = match self.next()? {
                    Token::Str(s) => s,
                    Token::Ident(s) => s,
                    other => {
                        return Err(invalid(self.input, &format!("bad like pattern {other:?}")))
                    }
                };
                RqlExpr::Like { path, pattern }
            }
            "exists" => RqlExpr::Exists {
                path: self.parse_path()?,
            },
            other => return Err(invalid(self.input, &format!("unknown operator '{other}'"))),
        };
        self.expect(&Token::RParen)?;
        Ok(expr)
    }

    fn parse_path(&mut self) -> Result<String, GatewayError> {
        match self.next()? {
            Token::Ident(path) => Ok(path),
            other => Err(invalid(self.input, &format!("expected field path, got {other:?}"))),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal, GatewayError> {
        match self.next()? {
            Token::Str(s) => Ok(Literal::Str(s)),
            Token::Num(n) => Ok(Literal::Num(n)),
            Token::Ident(word) => match word.as_str() {
                "true" => Ok(Literal::Bool(true)),
                "false" => Ok(Literal::Bool(false)),
                "null" => Ok(Literal::Null),
                other => Ok(Literal::Str(other.to_string())),
            },
            other => Err(invalid(self.input, &format!("expected literal, got {other:?}"))),
        }
    }
}

/// Parse a filter expression.
pub fn parse(input: &str) -> Result<RqlExpr, GatewayError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        input,
        tokens,
        pos: 0,
    };
    let expr = parser.parse_query()?;
    if parser.pos != parser.tokens.len() {
        return Err(invalid(input, "trailing input after query"));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Field lookup used during evaluation; `None` means the field is absent.
pub type FieldResolver<'a> = dyn Fn(&str) -> Option<Value> + 'a;

impl RqlExpr {
    pub fn eval(&self, fields: &FieldResolver<'_>) -> bool {
        match self {
            Self::And(queries) => queries.iter().all(|q| q.eval(fields)),
            Self::Or(queries) => queries.iter().any(|q| q.eval(fields)),
            Self::Not(query) => !query.eval(fields),
            Self::Compare { op, path, literal } => fields(path)
                .map(|value| compare(*op, &value, literal))
                .unwrap_or(false),
            Self::In { path, literals } => fields(path)
                .map(|value| literals.iter().any(|lit| compare(Comparison::Eq, &value, lit)))
                .unwrap_or(false),
            Self::Like { path, pattern } => fields(path)
                .and_then(|value| value.as_str().map(|s| like_matches(pattern, s)))
                .unwrap_or(false),
            Self::Exists { path } => fields(path).is_some(),
        }
    }
}

fn compare(op: Comparison, value: &Value, literal: &Literal) -> bool {
    use std::cmp::Ordering;
    let ordering = match (value, literal) {
        (Value::Number(n), Literal::Num(lit)) => n
            .as_f64()
            .and_then(|v| v.partial_cmp(lit)),
        (Value::String(s), Literal::Str(lit)) => Some(s.as_str().cmp(lit.as_str())),
        (Value::Bool(b), Literal::Bool(lit)) => Some(b.cmp(lit)),
        (Value::Null, Literal::Null) => Some(Ordering::Equal),
        _ => None,
    };
    match ordering {
        Some(ord) => match op {
            Comparison::Eq => ord == Ordering::Equal,
            Comparison::Ne => ord != Ordering::Equal,
            Comparison::Gt => ord == Ordering::Greater,
            Comparison::Ge => ord != Ordering::Less,
            Comparison::Lt => ord == Ordering::Less,
            Comparison::Le => ord != Ordering::Greater,
        },
        // Type mismatch: only ne() holds.
        None => op == Comparison::Ne,
    }
}

/// Glob-style match where `*` spans any run of characters.
fn like_matches(pattern: &str, value: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == value;
    }
    let mut rest = value;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(at) => rest = &rest[at + segment.len()..],
                None => return false,
            }
        }
    }
    // Pattern ends with '*': any remainder is fine.
    true
}
