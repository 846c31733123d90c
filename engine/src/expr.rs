//! Boolean predicate evaluation
//!
//! The filter processor's condition strings are parsed once at route build
//! time into a small AST and evaluated per message. The grammar is fixed -
//! this is deliberately not a general expression language:
//!
//! ```text
//! expr    := and ("or" and)*
//! and     := unary ("and" unary)*
//! unary   := "not" unary | cmp
//! cmp     := primary (("==" | "!=" | "<" | "<=" | ">" | ">=" | "in") primary)?
//! primary := number | string | bool | {{var}} | "(" expr ")"
//! ```
//!
//! Operands written as `{{name}}` (or bare identifiers) resolve against the
//! message at evaluation time. Unknown identifiers, boolean operators on
//! non-booleans, and comparisons across incompatible types are evaluation
//! errors - the route reports them as processing errors and drops the
//! message.

use serde_json::Value;
use thiserror::Error;

use crate::template::Lookup;

/// Error raised while parsing or evaluating a predicate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ExprError(pub String);

/// A parsed filter condition
///
/// # Example
///
/// ```
/// use virta_core::Message;
/// use virta_engine::expr::Predicate;
///
/// let pred = Predicate::parse("{{v}} > 10 and {{kind}} == 'motion'").unwrap();
/// let msg = Message::new("test://")
///     .with_field("v", 15)
///     .with_field("kind", "motion");
/// assert!(pred.eval(&msg).unwrap());
/// ```
#[derive(Debug, Clone)]
pub struct Predicate {
    source: String,
    ast: Expr,
}

impl Predicate {
    /// Parse a condition string into a predicate
    pub fn parse(input: &str) -> Result<Self, ExprError> {
        let toks = lex(input)?;
        let mut parser = Parser { toks, pos: 0 };
        let ast = parser.parse_or()?;
        if parser.pos != parser.toks.len() {
            return Err(ExprError(format!(
                "unexpected trailing input in '{input}'"
            )));
        }
        Ok(Self {
            source: input.to_string(),
            ast,
        })
    }

    /// Evaluate against a scope; the expression must produce a boolean
    pub fn eval(&self, scope: &dyn Lookup) -> Result<bool, ExprError> {
        match eval_expr(&self.ast, scope)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError(format!(
                "predicate '{}' did not evaluate to a boolean (got {})",
                self.source,
                kind_of(&other)
            ))),
        }
    }

    /// The original condition string
    pub fn source(&self) -> &str {
        &self.source
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Lexer
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Bool(bool),
    Var(String),
    LParen,
    RParen,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    In,
}

fn lex(input: &str) -> Result<Vec<Tok>, ExprError> {
    let chars: Vec<char> = input.chars().collect();
    let mut toks = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Eq);
                    i += 2;
                } else {
                    return Err(ExprError("single '=' is not an operator, use '=='".to_string()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Ne);
                    i += 2;
                } else {
                    return Err(ExprError("expected '!=' after '!'".to_string()));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Le);
                    i += 2;
                } else {
                    toks.push(Tok::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Ge);
                    i += 2;
                } else {
                    toks.push(Tok::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err(ExprError("unterminated string literal".to_string())),
                    }
                }
                toks.push(Tok::Str(s));
            }
            '{' => {
                if chars.get(i + 1) != Some(&'{') {
                    return Err(ExprError("expected '{{' to open a variable".to_string()));
                }
                let mut name = String::new();
                i += 2;
                loop {
                    match (chars.get(i), chars.get(i + 1)) {
                        (Some(&'}'), Some(&'}')) => {
                            i += 2;
                            break;
                        }
                        (Some(&ch), _) => {
                            name.push(ch);
                            i += 1;
                        }
                        (None, _) => {
                            return Err(ExprError("unterminated '{{' variable".to_string()))
                        }
                    }
                }
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err(ExprError("empty variable name".to_string()));
                }
                toks.push(Tok::Var(name));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse::<f64>()
                    .map_err(|_| ExprError(format!("invalid number '{text}'")))?;
                toks.push(Tok::Num(num));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                toks.push(match word.as_str() {
                    "and" => Tok::And,
                    "or" => Tok::Or,
                    "not" => Tok::Not,
                    "in" => Tok::In,
                    "true" => Tok::Bool(true),
                    "false" => Tok::Bool(false),
                    _ => Tok::Var(word),
                });
            }
            other => {
                return Err(ExprError(format!("unexpected character '{other}'")));
            }
        }
    }

    Ok(toks)
}

// ─────────────────────────────────────────────────────────────────────────
// Parser
// ─────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Expr {
    Lit(Value),
    Var(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Tok::Or) {
            self.bump();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Tok::And) {
            self.bump();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Tok::Not) {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(Tok::Eq) => CmpOp::Eq,
            Some(Tok::Ne) => CmpOp::Ne,
            Some(Tok::Lt) => CmpOp::Lt,
            Some(Tok::Le) => CmpOp::Le,
            Some(Tok::Gt) => CmpOp::Gt,
            Some(Tok::Ge) => CmpOp::Ge,
            Some(Tok::In) => CmpOp::In,
            _ => return Ok(left),
        };
        self.bump();
        let right = self.parse_primary()?;
        Ok(Expr::Cmp(op, Box::new(left), Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.bump() {
            Some(Tok::Num(n)) => Ok(Expr::Lit(number(n))),
            Some(Tok::Str(s)) => Ok(Expr::Lit(Value::String(s))),
            Some(Tok::Bool(b)) => Ok(Expr::Lit(Value::Bool(b))),
            Some(Tok::Var(name)) => Ok(Expr::Var(name)),
            Some(Tok::LParen) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Tok::RParen) => Ok(inner),
                    _ => Err(ExprError("expected ')'".to_string())),
                }
            }
            other => Err(ExprError(format!(
                "expected a value, got {other:?}"
            ))),
        }
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

// ─────────────────────────────────────────────────────────────────────────
// Evaluation
// ─────────────────────────────────────────────────────────────────────────

fn eval_expr(expr: &Expr, scope: &dyn Lookup) -> Result<Value, ExprError> {
    match expr {
        Expr::Lit(v) => Ok(v.clone()),
        Expr::Var(name) => scope
            .lookup(name)
            .ok_or_else(|| ExprError(format!("unknown identifier '{name}'"))),
        Expr::Not(inner) => {
            let b = eval_bool(inner, scope)?;
            Ok(Value::Bool(!b))
        }
        Expr::And(a, b) => {
            // Short-circuit
            if !eval_bool(a, scope)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval_bool(b, scope)?))
        }
        Expr::Or(a, b) => {
            if eval_bool(a, scope)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval_bool(b, scope)?))
        }
        Expr::Cmp(op, a, b) => {
            let left = eval_expr(a, scope)?;
            let right = eval_expr(b, scope)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
    }
}

fn eval_bool(expr: &Expr, scope: &dyn Lookup) -> Result<bool, ExprError> {
    match eval_expr(expr, scope)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError(format!(
            "expected a boolean operand, got {}",
            kind_of(&other)
        ))),
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, ExprError> {
    match op {
        CmpOp::Eq => loose_eq(left, right),
        CmpOp::Ne => loose_eq(left, right).map(|eq| !eq),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(_), Value::Number(_)) => {
                    let (l, r) = (as_f64(left), as_f64(right));
                    l.partial_cmp(&r)
                        .ok_or_else(|| ExprError("numbers are not comparable".to_string()))?
                }
                (Value::String(l), Value::String(r)) => l.cmp(r),
                _ => return Err(mismatch(left, right)),
            };
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                _ => false,
            })
        }
        CmpOp::In => match right {
            Value::Array(items) => Ok(items
                .iter()
                .any(|item| loose_eq(left, item).unwrap_or(false))),
            Value::String(haystack) => match left {
                Value::String(needle) => Ok(haystack.contains(needle.as_str())),
                _ => Err(ExprError(format!(
                    "'in' over a string needs a string operand, got {}",
                    kind_of(left)
                ))),
            },
            _ => Err(ExprError(format!(
                "'in' needs an array or string on the right, got {}",
                kind_of(right)
            ))),
        },
    }
}

fn loose_eq(left: &Value, right: &Value) -> Result<bool, ExprError> {
    match (left, right) {
        (Value::Number(_), Value::Number(_)) => Ok(as_f64(left) == as_f64(right)),
        (Value::String(l), Value::String(r)) => Ok(l == r),
        (Value::Bool(l), Value::Bool(r)) => Ok(l == r),
        (Value::Null, Value::Null) => Ok(true),
        _ => Err(mismatch(left, right)),
    }
}

fn as_f64(value: &Value) -> f64 {
    value.as_f64().unwrap_or(f64::NAN)
}

fn mismatch(left: &Value, right: &Value) -> ExprError {
    ExprError(format!(
        "cannot compare {} with {}",
        kind_of(left),
        kind_of(right)
    ))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
