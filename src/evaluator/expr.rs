//! Built-in expression evaluator.
//!
//! Conditions are boolean expressions over `Event.*` and `Payload.*`
//! paths with the usual comparison, logical and arithmetic operators, plus a
//! few helpers (`len`, `contains`, `starts_with`). Actions are `;`-separated
//! assignments; `Event.should_handle = <bool>` decides the outcome, any other
//! assignment is reported as an emitted field. `Retract("..")` is accepted
//! and ignored.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Number, Value};

use super::{
    CompiledRule, EVENT_NAME, EvaluationContext, EvaluatorError, KnowledgeScope, Outcome,
    PAYLOAD_NAME, RuleDefinition, RuleEvaluator,
};

/// Evaluator for the built-in rule language. Stateless; every compile
/// produces an independent rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExprEvaluator;

#[async_trait]
impl RuleEvaluator for ExprEvaluator {
    async fn compile(
        &self,
        scope: &KnowledgeScope,
        definition: &RuleDefinition,
    ) -> Result<Box<dyn CompiledRule>, EvaluatorError> {
        let rule = parse_rule(&definition.source)?;
        tracing::trace!(scope = %scope.name, rule = %rule.name, "rule compiled");
        Ok(Box::new(rule))
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(Number),
    Str(String),
    LParen,
    RParen,
    Comma,
    Semi,
    Dot,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
}

fn compile_err(msg: impl Into<String>) -> EvaluatorError {
    EvaluatorError::Compile(msg.into())
}

fn exec_err(msg: impl Into<String>) -> EvaluatorError {
    EvaluatorError::Execution(msg.into())
}

fn lex(src: &str) -> Result<Vec<Token>, EvaluatorError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semi);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '=' => {
                tokens.push(Token::Assign);
                i += 1;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(compile_err("unterminated string literal")),
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .ok_or_else(|| compile_err("unterminated string literal"))?;
                            s.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => *other,
                            });
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let mut is_float = false;
                if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let number = if is_float {
                    text.parse::<f64>().ok().and_then(Number::from_f64)
                } else {
                    text.parse::<i64>().ok().map(Number::from)
                };
                tokens.push(Token::Number(
                    number.ok_or_else(|| compile_err(format!("invalid number '{text}'")))?,
                ));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(compile_err(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST + parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func {
    Len,
    Contains,
    StartsWith,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    /// Root name followed by field segments.
    Path(Vec<String>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Stmt {
    Assign(Vec<String>, Expr),
    Retract,
}

#[derive(Debug, Clone)]
struct ExprRule {
    name: String,
    condition: Expr,
    actions: Vec<Stmt>,
}

/// Split `rule <name> { when <cond> then <actions> }` and parse both halves.
fn parse_rule(source: &str) -> Result<ExprRule, EvaluatorError> {
    let open = source
        .find('{')
        .ok_or_else(|| compile_err("rule body must be enclosed in braces"))?;
    let close = source
        .rfind('}')
        .filter(|c| *c > open)
        .ok_or_else(|| compile_err("rule body is not closed"))?;
    if !source[close + 1..].trim().is_empty() {
        return Err(compile_err("unexpected text after rule body"));
    }

    let header = source[..open].trim();
    let name = header
        .strip_prefix("rule")
        .filter(|rest| rest.starts_with(char::is_whitespace))
        .map(str::trim)
        .filter(|n| !n.is_empty() && !n.contains(char::is_whitespace))
        .ok_or_else(|| compile_err(format!("invalid rule header '{header}'")))?;

    let tokens = lex(&source[open + 1..close])?;
    let mut p = Parser { tokens, pos: 0 };
    p.keyword("when")?;
    let condition = p.expr()?;
    p.keyword("then")?;
    let actions = p.statements()?;

    Ok(ExprRule {
        name: name.to_string(),
        condition,
        actions,
    })
}

const BINARY_LEVELS: usize = 6;

fn binary_op(level: usize, token: &Token) -> Option<BinOp> {
    let op = match (level, token) {
        (0, Token::Or) => BinOp::Or,
        (1, Token::And) => BinOp::And,
        (2, Token::Eq) => BinOp::Eq,
        (2, Token::Ne) => BinOp::Ne,
        (3, Token::Lt) => BinOp::Lt,
        (3, Token::Le) => BinOp::Le,
        (3, Token::Gt) => BinOp::Gt,
        (3, Token::Ge) => BinOp::Ge,
        (4, Token::Plus) => BinOp::Add,
        (4, Token::Minus) => BinOp::Sub,
        (5, Token::Star) => BinOp::Mul,
        (5, Token::Slash) => BinOp::Div,
        _ => return None,
    };
    Some(op)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), EvaluatorError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(compile_err(format!("expected {token:?}, found {:?}", self.peek())))
        }
    }

    fn keyword(&mut self, kw: &str) -> Result<(), EvaluatorError> {
        match self.advance() {
            Some(Token::Ident(ref id)) if id == kw => Ok(()),
            other => Err(compile_err(format!("expected '{kw}', found {other:?}"))),
        }
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(id)) if id == kw)
    }

    fn statements(&mut self) -> Result<Vec<Stmt>, EvaluatorError> {
        let mut out = Vec::new();
        loop {
            while self.eat(&Token::Semi) {}
            if self.peek().is_none() {
                return Ok(out);
            }
            out.push(self.statement()?);
            if self.peek().is_some() {
                self.expect(&Token::Semi)?;
            }
        }
    }

    fn statement(&mut self) -> Result<Stmt, EvaluatorError> {
        if self.at_keyword("Retract") {
            self.pos += 1;
            self.expect(&Token::LParen)?;
            if !self.eat(&Token::RParen) {
                self.expr()?;
                self.expect(&Token::RParen)?;
            }
            return Ok(Stmt::Retract);
        }
        let target = match self.primary()? {
            Expr::Path(path) if path.len() > 1 => path,
            other => return Err(compile_err(format!("cannot assign to {other:?}"))),
        };
        self.expect(&Token::Assign)?;
        let value = self.expr()?;
        Ok(Stmt::Assign(target, value))
    }

    fn expr(&mut self) -> Result<Expr, EvaluatorError> {
        self.binary_level(0)
    }

    /// Precedence climbing, loosest level first.
    fn binary_level(&mut self, level: usize) -> Result<Expr, EvaluatorError> {
        if level == BINARY_LEVELS {
            return self.unary();
        }
        let mut lhs = self.binary_level(level + 1)?;
        while let Some(op) = self.peek().and_then(|t| binary_op(level, t)) {
            self.pos += 1;
            let rhs = self.binary_level(level + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, EvaluatorError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, EvaluatorError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(id)) => match id.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" | "nil" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => self.call(&id),
                EVENT_NAME | PAYLOAD_NAME => {
                    let mut path = vec![id];
                    while self.eat(&Token::Dot) {
                        match self.advance() {
                            Some(Token::Ident(seg)) => path.push(seg),
                            other => {
                                return Err(compile_err(format!(
                                    "expected field name after '.', found {other:?}"
                                )));
                            }
                        }
                    }
                    Ok(Expr::Path(path))
                }
                other => Err(compile_err(format!("unknown name '{other}'"))),
            },
            other => Err(compile_err(format!("unexpected token {other:?}"))),
        }
    }

    fn call(&mut self, name: &str) -> Result<Expr, EvaluatorError> {
        let (func, arity) = match name {
            "len" => (Func::Len, 1),
            "contains" => (Func::Contains, 2),
            "starts_with" => (Func::StartsWith, 2),
            other => return Err(compile_err(format!("unknown function '{other}'"))),
        };
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.expr()?);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(&Token::Comma)?;
            }
        }
        if args.len() != arity {
            return Err(compile_err(format!(
                "{name} expects {arity} argument(s), got {}",
                args.len()
            )));
        }
        Ok(Expr::Call(func, args))
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

#[async_trait]
impl CompiledRule for ExprRule {
    async fn execute(&self, ctx: &EvaluationContext) -> Result<Outcome, EvaluatorError> {
        let mut outcome = Outcome::default();
        match eval(&self.condition, ctx)? {
            Value::Bool(true) => {}
            Value::Bool(false) => return Ok(outcome),
            other => {
                return Err(exec_err(format!(
                    "condition of rule {} evaluated to {other}, not a boolean",
                    self.name
                )));
            }
        }

        let mut emitted = BTreeMap::new();
        for stmt in &self.actions {
            let Stmt::Assign(target, expr) = stmt else {
                continue;
            };
            let value = eval(expr, ctx)?;
            if is_handle_flag(target) {
                outcome.handled = value.as_bool().ok_or_else(|| {
                    exec_err(format!("should_handle must be boolean, got {value}"))
                })?;
            } else {
                emitted.insert(target.join("."), value);
            }
        }
        outcome.emitted_fields = emitted;
        Ok(outcome)
    }
}

fn is_handle_flag(path: &[String]) -> bool {
    path.len() == 2
        && path[0] == EVENT_NAME
        && matches!(path[1].as_str(), "should_handle" | "ShouldHandle")
}

fn lookup(path: &[String], ctx: &EvaluationContext) -> Value {
    let Some((root, fields)) = path.split_first() else {
        return Value::Null;
    };
    let mut cur = match ctx.get(root) {
        Some(v) => v,
        None => return Value::Null,
    };
    for field in fields {
        match cur.get(field.as_str()) {
            Some(v) => cur = v,
            None => return Value::Null,
        }
    }
    cur.clone()
}

fn eval(expr: &Expr, ctx: &EvaluationContext) -> Result<Value, EvaluatorError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(path) => Ok(lookup(path, ctx)),
        Expr::Not(inner) => match eval(inner, ctx)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(exec_err(format!("cannot negate {other}"))),
        },
        Expr::Neg(inner) => match eval(inner, ctx)? {
            Value::Number(n) => match n.as_i64() {
                Some(i) => i
                    .checked_neg()
                    .map(|v| Value::Number(v.into()))
                    .ok_or_else(|| exec_err("integer overflow")),
                None => float_value(-as_f64(&n)),
            },
            other => Err(exec_err(format!("cannot negate {other}"))),
        },
        Expr::Binary(BinOp::And, lhs, rhs) => {
            if expect_bool(eval(lhs, ctx)?, "&&")? {
                Ok(Value::Bool(expect_bool(eval(rhs, ctx)?, "&&")?))
            } else {
                Ok(Value::Bool(false))
            }
        }
        Expr::Binary(BinOp::Or, lhs, rhs) => {
            if expect_bool(eval(lhs, ctx)?, "||")? {
                Ok(Value::Bool(true))
            } else {
                Ok(Value::Bool(expect_bool(eval(rhs, ctx)?, "||")?))
            }
        }
        Expr::Binary(op, lhs, rhs) => binary(*op, eval(lhs, ctx)?, eval(rhs, ctx)?),
        Expr::Call(func, args) => {
            let args = args
                .iter()
                .map(|a| eval(a, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            call(*func, &args)
        }
    }
}

fn expect_bool(v: Value, op: &str) -> Result<bool, EvaluatorError> {
    v.as_bool()
        .ok_or_else(|| exec_err(format!("operand of {op} must be boolean, got {v}")))
}

fn as_f64(n: &Number) -> f64 {
    n.as_f64().unwrap_or(f64::NAN)
}

fn float_value(f: f64) -> Result<Value, EvaluatorError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| exec_err("arithmetic produced a non-finite number"))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => as_f64(x) == as_f64(y),
        _ => a == b,
    }
}

fn binary(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, EvaluatorError> {
    use std::cmp::Ordering;

    match op {
        BinOp::Eq => return Ok(Value::Bool(values_equal(&lhs, &rhs))),
        BinOp::Ne => return Ok(Value::Bool(!values_equal(&lhs, &rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = match (&lhs, &rhs) {
                (Value::Number(a), Value::Number(b)) => as_f64(a).partial_cmp(&as_f64(b)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(|| exec_err(format!("cannot compare {lhs} with {rhs}")))?;
            let result = match op {
                BinOp::Lt => ord == Ordering::Less,
                BinOp::Le => ord != Ordering::Greater,
                BinOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    if let (BinOp::Add, Value::String(a), Value::String(b)) = (op, &lhs, &rhs) {
        return Ok(Value::String(format!("{a}{b}")));
    }

    let (Value::Number(a), Value::Number(b)) = (&lhs, &rhs) else {
        return Err(exec_err(format!("arithmetic on non-numbers: {lhs}, {rhs}")));
    };

    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        let int = match op {
            BinOp::Add => Some(x.checked_add(y)),
            BinOp::Sub => Some(x.checked_sub(y)),
            BinOp::Mul => Some(x.checked_mul(y)),
            _ => None,
        };
        if let Some(result) = int {
            return result
                .map(|v| Value::Number(v.into()))
                .ok_or_else(|| exec_err("integer overflow"));
        }
    }

    let (x, y) = (as_f64(a), as_f64(b));
    match op {
        BinOp::Add => float_value(x + y),
        BinOp::Sub => float_value(x - y),
        BinOp::Mul => float_value(x * y),
        BinOp::Div if y == 0.0 => Err(exec_err("division by zero")),
        BinOp::Div => float_value(x / y),
        _ => Err(exec_err(format!("unsupported operator {op:?}"))),
    }
}

fn call(func: Func, args: &[Value]) -> Result<Value, EvaluatorError> {
    match (func, args) {
        (Func::Len, [Value::String(s)]) => Ok(Value::from(s.chars().count())),
        (Func::Len, [Value::Array(a)]) => Ok(Value::from(a.len())),
        (Func::Len, [Value::Object(o)]) => Ok(Value::from(o.len())),
        (Func::Contains, [Value::String(h), Value::String(n)]) => {
            Ok(Value::Bool(h.contains(n.as_str())))
        }
        (Func::Contains, [Value::Array(items), needle]) => Ok(Value::Bool(
            items.iter().any(|item| values_equal(item, needle)),
        )),
        (Func::StartsWith, [Value::String(s), Value::String(p)]) => {
            Ok(Value::Bool(s.starts_with(p.as_str())))
        }
        (func, args) => Err(exec_err(format!("invalid arguments to {func:?}: {args:?}"))),
    }
}
