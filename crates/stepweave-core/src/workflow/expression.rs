//! Restricted condition language for step guards and CONDITION steps.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! expr       := or
//! or         := and ( "or" and )*
//! and        := not ( "and" not )*
//! not        := "not" not | comparison
//! comparison := operand ( ("=="|"!="|"<"|">"|"<="|">="|"in"|"not in") operand )?
//! operand    := number | string | true | false | null | list | path | "(" expr ")"
//! list       := "[" ( expr ( "," expr )* )? "]"
//! path       := ("variables"|"inputs"|"outputs") ( "." segment | "[" int "]" )*
//! ```
//!
//! Nothing here executes host code: expressions are parsed into a small
//! AST and evaluated against the read-only namespaces of a
//! `WorkflowContext`. A path that does not resolve yields `Missing`, which
//! is falsy and unequal to every value. `ConditionEvaluator::evaluate`
//! never fails: parse and type errors degrade to `false` with a warning.

use std::cmp::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use super::context::{Namespace, PathSegment, WorkflowContext, parse_segments};

/// Nesting limit for parenthesised/negated/list sub-expressions.
const MAX_NESTING: usize = 64;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while parsing or evaluating a condition.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("type error: {0}")]
    Type(String),
}

fn parse_error(offset: usize, message: impl Into<String>) -> ExpressionError {
    ExpressionError::Parse {
        offset,
        message: message.into(),
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Word(String),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Minus,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, ExpressionError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((offset, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((offset, Token::RParen));
                i += 1;
            }
            '[' => {
                tokens.push((offset, Token::LBracket));
                i += 1;
            }
            ']' => {
                tokens.push((offset, Token::RBracket));
                i += 1;
            }
            ',' => {
                tokens.push((offset, Token::Comma));
                i += 1;
            }
            '-' => {
                tokens.push((offset, Token::Minus));
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).map(|(_, n)| *n);
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Eq, 2),
                    ('!', Some('=')) => (Token::Ne, 2),
                    ('<', Some('=')) => (Token::Le, 2),
                    ('>', Some('=')) => (Token::Ge, 2),
                    ('<', _) => (Token::Lt, 1),
                    ('>', _) => (Token::Gt, 1),
                    _ => return Err(parse_error(offset, format!("unexpected character '{c}'"))),
                };
                tokens.push((offset, token));
                i += width;
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    let Some(&(_, ch)) = chars.get(i) else {
                        return Err(parse_error(offset, "unterminated string literal"));
                    };
                    i += 1;
                    match ch {
                        '\\' => {
                            let Some(&(_, escaped)) = chars.get(i) else {
                                return Err(parse_error(offset, "unterminated string literal"));
                            };
                            i += 1;
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                        }
                        ch if ch == quote => break,
                        ch => text.push(ch),
                    }
                }
                tokens.push((offset, Token::Str(text)));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].1.is_ascii_digit() {
                    i += 1;
                }
                if i + 1 < chars.len() && chars[i].1 == '.' && chars[i + 1].1.is_ascii_digit() {
                    i += 1;
                    while i < chars.len() && chars[i].1.is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| parse_error(offset, format!("invalid number '{text}'")))?;
                tokens.push((offset, Token::Number(value)));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() {
                    let ch = chars[i].1;
                    if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                        i += 1;
                    } else if ch == '[' {
                        // Only `[digits]` belongs to a path; anything else starts a list.
                        let mut j = i + 1;
                        while j < chars.len() && chars[j].1.is_ascii_digit() {
                            j += 1;
                        }
                        if j > i + 1 && j < chars.len() && chars[j].1 == ']' {
                            i = j + 1;
                        } else {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
                tokens.push((offset, Token::Word(text)));
            }
            other => {
                return Err(parse_error(offset, format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path {
        namespace: Namespace,
        segments: Vec<PathSegment>,
    },
    List(Vec<Expr>),
    Not(Box<Expr>),
    /// Conjunction of two or more terms, evaluated left to right.
    And(Vec<Expr>),
    /// Disjunction of two or more terms, evaluated left to right.
    Or(Vec<Expr>),
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse a condition string into an expression tree.
pub fn parse(source: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(parse_error(0, "empty expression"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        end: source.len(),
    };
    let expr = parser.parse_or()?;
    if let Some((offset, token)) = parser.tokens.get(parser.pos) {
        return Err(parse_error(*offset, format!("unexpected token {token:?}")));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    depth: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(o, _)| *o).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w == keyword)
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExpressionError> {
        let offset = self.offset();
        match self.next() {
            Some(token) if token == expected => Ok(()),
            _ => Err(parse_error(offset, format!("expected {what}"))),
        }
    }

    fn enter(&mut self) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(parse_error(self.offset(), "expression nested too deeply"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    // Chains are collected flat so their length never adds tree depth.
    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut terms = vec![self.parse_and()?];
        while self.peek_keyword("or") {
            self.pos += 1;
            terms.push(self.parse_and()?);
        }
        Ok(collapse(terms, Expr::Or))
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut terms = vec![self.parse_not()?];
        while self.peek_keyword("and") {
            self.pos += 1;
            terms.push(self.parse_not()?);
        }
        Ok(collapse(terms, Expr::And))
    }

    fn parse_not(&mut self) -> Result<Expr, ExpressionError> {
        if self.peek_keyword("not") {
            self.pos += 1;
            self.enter()?;
            let inner = self.parse_not()?;
            self.leave();
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_operand()?;

        let op = match self.peek() {
            Some(Token::Eq) => Some((CompareOp::Eq, 1)),
            Some(Token::Ne) => Some((CompareOp::Ne, 1)),
            Some(Token::Lt) => Some((CompareOp::Lt, 1)),
            Some(Token::Le) => Some((CompareOp::Le, 1)),
            Some(Token::Gt) => Some((CompareOp::Gt, 1)),
            Some(Token::Ge) => Some((CompareOp::Ge, 1)),
            Some(Token::Word(w)) if w == "in" => Some((CompareOp::In, 1)),
            Some(Token::Word(w))
                if w == "not" && matches!(self.peek_at(1), Some(Token::Word(n)) if n == "in") =>
            {
                Some((CompareOp::NotIn, 2))
            }
            _ => None,
        };

        let Some((op, width)) = op else {
            return Ok(left);
        };
        self.pos += width;
        let right = self.parse_operand()?;
        Ok(Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_operand(&mut self) -> Result<Expr, ExpressionError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Minus) => match self.next() {
                Some(Token::Number(n)) => Ok(Expr::Literal(number(-n))),
                _ => Err(parse_error(offset, "expected number after '-'")),
            },
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                self.enter()?;
                let inner = self.parse_or()?;
                self.leave();
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                self.enter()?;
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.parse_or()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.leave();
                self.expect(Token::RBracket, "']'")?;
                Ok(Expr::List(items))
            }
            Some(Token::Word(word)) => word_operand(&word, offset),
            Some(token) => Err(parse_error(offset, format!("unexpected token {token:?}"))),
            None => Err(parse_error(offset, "unexpected end of expression")),
        }
    }
}

/// The lone term itself, or the terms wrapped by `chain`.
fn collapse(mut terms: Vec<Expr>, chain: fn(Vec<Expr>) -> Expr) -> Expr {
    if terms.len() == 1 {
        terms.remove(0)
    } else {
        chain(terms)
    }
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn word_operand(word: &str, offset: usize) -> Result<Expr, ExpressionError> {
    match word {
        "true" | "True" => return Ok(Expr::Literal(Value::Bool(true))),
        "false" | "False" => return Ok(Expr::Literal(Value::Bool(false))),
        "null" | "None" => return Ok(Expr::Literal(Value::Null)),
        "and" | "or" | "not" | "in" => {
            return Err(parse_error(offset, format!("unexpected keyword '{word}'")));
        }
        _ => {}
    }

    let (head, rest) = match word.find(&['.', '['][..]) {
        Some(pos) => (&word[..pos], &word[pos..]),
        None => (word, ""),
    };
    let namespace = Namespace::from_name(head)
        .ok_or_else(|| parse_error(offset, format!("unknown name '{head}'")))?;
    let rest = rest.strip_prefix('.').unwrap_or(rest);
    let segments = if rest.starts_with('[') {
        // `inputs[0]` has no key segment; only object namespaces exist.
        None
    } else {
        parse_segments(rest)
    };
    match segments {
        Some(segments) if !segments.is_empty() => Ok(Expr::Path {
            namespace,
            segments,
        }),
        _ => Err(parse_error(offset, format!("invalid path '{word}'"))),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Runtime value of a sub-expression.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Value(Value),
    Missing,
}

impl Operand {
    fn truthy(&self) -> bool {
        match self {
            Operand::Missing => false,
            Operand::Value(v) => value_to_bool(v),
        }
    }
}

/// Truthiness: null, false, zero, empty strings and empty collections are false.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn eval(expr: &Expr, ctx: &WorkflowContext) -> Result<Operand, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(Operand::Value(v.clone())),
        Expr::Path {
            namespace,
            segments,
        } => Ok(ctx
            .lookup_path(*namespace, segments)
            .map(|v| Operand::Value(v.clone()))
            .unwrap_or(Operand::Missing)),
        Expr::List(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                match eval(item, ctx)? {
                    Operand::Value(v) => values.push(v),
                    Operand::Missing => values.push(Value::Null),
                }
            }
            Ok(Operand::Value(Value::Array(values)))
        }
        Expr::Not(inner) => Ok(Operand::Value(Value::Bool(!eval(inner, ctx)?.truthy()))),
        Expr::And(terms) => {
            for term in terms {
                if !eval(term, ctx)?.truthy() {
                    return Ok(Operand::Value(Value::Bool(false)));
                }
            }
            Ok(Operand::Value(Value::Bool(true)))
        }
        Expr::Or(terms) => {
            for term in terms {
                if eval(term, ctx)?.truthy() {
                    return Ok(Operand::Value(Value::Bool(true)));
                }
            }
            Ok(Operand::Value(Value::Bool(false)))
        }
        Expr::Compare { op, left, right } => {
            let left = eval(left, ctx)?;
            let right = eval(right, ctx)?;
            compare(*op, &left, &right).map(|b| Operand::Value(Value::Bool(b)))
        }
    }
}

fn compare(op: CompareOp, left: &Operand, right: &Operand) -> Result<bool, ExpressionError> {
    let (Operand::Value(l), Operand::Value(r)) = (left, right) else {
        // Missing is unequal to everything and never ordered or contained.
        return Ok(op == CompareOp::Ne);
    };

    match op {
        CompareOp::Eq => Ok(values_equal(l, r)),
        CompareOp::Ne => Ok(!values_equal(l, r)),
        CompareOp::Lt => Ok(order(l, r)? == Ordering::Less),
        CompareOp::Le => Ok(order(l, r)? != Ordering::Greater),
        CompareOp::Gt => Ok(order(l, r)? == Ordering::Greater),
        CompareOp::Ge => Ok(order(l, r)? != Ordering::Less),
        CompareOp::In => contains(r, l),
        CompareOp::NotIn => contains(r, l).map(|b| !b),
    }
}

/// Equality with numeric normalisation (`1 == 1.0`).
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Result<Ordering, ExpressionError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
                .ok_or_else(|| ExpressionError::Type("cannot order NaN".to_string()))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
        _ => Err(ExpressionError::Type(format!(
            "cannot order {} and {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, ExpressionError> {
    match (haystack, needle) {
        (Value::Array(items), _) => Ok(items.iter().any(|item| values_equal(item, needle))),
        (Value::String(s), Value::String(sub)) => Ok(s.contains(sub.as_str())),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        _ => Err(ExpressionError::Type(format!(
            "'in' not supported for {} in {}",
            type_name(needle),
            type_name(haystack)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// ConditionEvaluator
// ---------------------------------------------------------------------------

/// Result of a degraded-safe evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionOutcome {
    pub result: bool,
    /// Set when a parse or type error forced the result to `false`.
    pub warning: Option<String>,
}

/// Condition evaluator with a parse cache keyed by source text.
///
/// Shared by every run of an engine; parse results (including parse
/// errors) are cached so hot conditions are tokenised once.
#[derive(Debug, Default)]
pub struct ConditionEvaluator {
    cache: DashMap<String, Result<Arc<Expr>, ExpressionError>>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn compile(&self, source: &str) -> Result<Arc<Expr>, ExpressionError> {
        if let Some(cached) = self.cache.get(source) {
            return cached.value().clone();
        }
        let parsed = parse(source).map(Arc::new);
        self.cache.insert(source.to_string(), parsed.clone());
        parsed
    }

    /// Evaluate to a boolean, surfacing parse and type errors.
    pub fn try_evaluate(&self, source: &str, ctx: &WorkflowContext) -> Result<bool, ExpressionError> {
        let expr = self.compile(source)?;
        Ok(eval(&expr, ctx)?.truthy())
    }

    /// Evaluate to a boolean; any error yields `false` plus a warning.
    pub fn evaluate(&self, source: &str, ctx: &WorkflowContext) -> ConditionOutcome {
        match self.try_evaluate(source, ctx) {
            Ok(result) => ConditionOutcome {
                result,
                warning: None,
            },
            Err(e) => {
                tracing::warn!(condition = source, error = %e, "condition evaluation failed, treating as false");
                ConditionOutcome {
                    result: false,
                    warning: Some(format!("condition '{source}' evaluated to false: {e}")),
                }
            }
        }
    }

    /// Evaluate every condition; stops at the first false one.
    ///
    /// Returns the overall result and the warnings collected on the way.
    pub fn evaluate_all(&self, conditions: &[String], ctx: &WorkflowContext) -> (bool, Vec<String>) {
        let mut warnings = Vec::new();
        for condition in conditions {
            let outcome = self.evaluate(condition, ctx);
            warnings.extend(outcome.warning);
            if !outcome.result {
                return (false, warnings);
            }
        }
        (true, warnings)
    }

    /// Number of cached parse results.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
