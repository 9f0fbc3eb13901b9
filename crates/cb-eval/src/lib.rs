//! The agent runner's predicate language: a small expression grammar over
//! event/tick fields (spec §4.6).
//!
//! ```text
//! expr       := or
//! or         := and (("||" | "or") and)*
//! and        := unary (("&&" | "and") unary)*
//! unary      := ("!" | "not") unary | comparison
//! comparison := primary ( cmp_op primary )?
//! cmp_op     := "==" | "!=" | "<" | "<=" | ">" | ">=" | "in" | "matches"
//! primary    := STRING | NUMBER | "true" | "false" | IDENT | call | list | "(" expr ")"
//! call       := IDENT "(" (expr ("," expr)*)? ")"
//! list       := "[" (expr ("," expr)*)? "]"
//! ```
//!
//! Compilation (`compile`) fails loudly (bad syntax, unknown field); runtime
//! evaluation never fails outward — a type mismatch or unknown function call
//! is logged and treated as `false` (spec: "predicate evaluation error ->
//! runner continues").

use std::fmt;

use cb_protocol::Event;
use chrono::{DateTime, Datelike, Timelike, Utc};
use regex::Regex;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Evaluation context
// ---------------------------------------------------------------------------

/// The field set a compiled predicate evaluates against. Built fresh from
/// either an inbound message `Event` or a synthetic tick.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub notify: bool,
    pub direct: bool,
    pub mentions: bool,
    pub channel: String,
    pub thread: String,
    pub bot: String,
    pub service: String,
    pub user: String,
    pub text: String,
    pub tick: bool,
    pub hour: u32,
    pub minute: u32,
    pub weekday: String,
}

impl EvalContext {
    /// Build a context from a persisted/classified event.
    pub fn from_event(e: &Event) -> Self {
        let is_tick = e.kind == "tick";
        let (hour, minute, weekday) = local_clock(e.timestamp);
        EvalContext {
            notify: e.notify,
            direct: e.direct,
            mentions: e.mentions,
            channel: e.channel.clone(),
            thread: e.thread.clone(),
            bot: e.bot.clone(),
            service: e.service.clone(),
            user: e.user.clone(),
            text: e.text.clone(),
            tick: is_tick,
            hour,
            minute,
            weekday,
        }
    }
}

fn local_clock(ts: DateTime<Utc>) -> (u32, u32, String) {
    let local = ts.with_timezone(&chrono::Local);
    let weekday = match local.weekday() {
        chrono::Weekday::Mon => "mon",
        chrono::Weekday::Tue => "tue",
        chrono::Weekday::Wed => "wed",
        chrono::Weekday::Thu => "thu",
        chrono::Weekday::Fri => "fri",
        chrono::Weekday::Sat => "sat",
        chrono::Weekday::Sun => "sun",
    };
    (local.hour(), local.minute(), weekday.to_string())
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected token {0:?}")]
    UnexpectedToken(String),
    #[error("unknown field `{0}`")]
    UnknownField(String),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("invalid regex in `matches`: {0}")]
    BadRegex(#[from] regex::Error),
    #[error("trailing input after expression: {0:?}")]
    TrailingInput(String),
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("bad `every` argument: {0}")]
    BadEveryArg(String),
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Matches,
    True,
    False,
}

fn lex(src: &str) -> Result<Vec<Tok>, CompileError> {
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    let mut toks = Vec::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            '[' => {
                toks.push(Tok::LBracket);
                i += 1;
            }
            ']' => {
                toks.push(Tok::RBracket);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                toks.push(Tok::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                toks.push(Tok::Or);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                toks.push(Tok::Ne);
                i += 2;
            }
            '!' => {
                toks.push(Tok::Not);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                toks.push(Tok::Eq);
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                toks.push(Tok::Le);
                i += 2;
            }
            '<' => {
                toks.push(Tok::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                toks.push(Tok::Ge);
                i += 2;
            }
            '>' => {
                toks.push(Tok::Gt);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(CompileError::UnexpectedEnd),
                        Some(&q) if q == quote => {
                            i += 1;
                            break;
                        }
                        Some(&'\\') if chars.get(i + 1).is_some() => {
                            s.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                toks.push(Tok::Str(s));
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == ':') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                // "H:MM" style literals used as bare at()-style args are not
                // numbers; only parse as Num when it has no ':'.
                if text.contains(':') {
                    toks.push(Tok::Str(text));
                } else {
                    let n: f64 = text.parse().map_err(|_| CompileError::UnexpectedToken(text.clone()))?;
                    toks.push(Tok::Num(n));
                }
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                toks.push(match word.as_str() {
                    "and" => Tok::And,
                    "or" => Tok::Or,
                    "not" => Tok::Not,
                    "in" => Tok::In,
                    "matches" => Tok::Matches,
                    "true" => Tok::True,
                    "false" => Tok::False,
                    _ => Tok::Ident(word),
                });
            }
            other => return Err(CompileError::UnexpectedToken(other.to_string())),
        }
    }
    Ok(toks)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Lit {
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone)]
enum Expr {
    Lit(Lit),
    List(Vec<Expr>),
    Field(String),
    Call(String, Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Matches,
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
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, t: &Tok) -> Result<(), CompileError> {
        match self.bump() {
            Some(tok) if &tok == t => Ok(()),
            Some(tok) => Err(CompileError::UnexpectedToken(format!("{tok:?}"))),
            None => Err(CompileError::UnexpectedEnd),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, CompileError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Tok::Or)) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.parse_unary()?;
        while matches!(self.peek(), Some(Tok::And)) {
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, CompileError> {
        if matches!(self.peek(), Some(Tok::Not)) {
            self.bump();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let lhs = self.parse_primary()?;
        let op = match self.peek() {
            Some(Tok::Eq) => Some(CmpOp::Eq),
            Some(Tok::Ne) => Some(CmpOp::Ne),
            Some(Tok::Lt) => Some(CmpOp::Lt),
            Some(Tok::Le) => Some(CmpOp::Le),
            Some(Tok::Gt) => Some(CmpOp::Gt),
            Some(Tok::Ge) => Some(CmpOp::Ge),
            Some(Tok::In) => Some(CmpOp::In),
            Some(Tok::Matches) => Some(CmpOp::Matches),
            _ => None,
        };
        match op {
            Some(op) => {
                self.bump();
                let rhs = self.parse_primary()?;
                Ok(Expr::Cmp(op, Box::new(lhs), Box::new(rhs)))
            }
            None => Ok(lhs),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        match self.bump() {
            Some(Tok::LParen) => {
                let e = self.parse_expr()?;
                self.expect(&Tok::RParen)?;
                Ok(e)
            }
            Some(Tok::LBracket) => {
                let mut items = Vec::new();
                if !matches!(self.peek(), Some(Tok::RBracket)) {
                    items.push(self.parse_expr()?);
                    while matches!(self.peek(), Some(Tok::Comma)) {
                        self.bump();
                        items.push(self.parse_expr()?);
                    }
                }
                self.expect(&Tok::RBracket)?;
                Ok(Expr::List(items))
            }
            Some(Tok::Str(s)) => Ok(Expr::Lit(Lit::Str(s))),
            Some(Tok::Num(n)) => Ok(Expr::Lit(Lit::Num(n))),
            Some(Tok::True) => Ok(Expr::Lit(Lit::Bool(true))),
            Some(Tok::False) => Ok(Expr::Lit(Lit::Bool(false))),
            Some(Tok::Ident(name)) => {
                if matches!(self.peek(), Some(Tok::LParen)) {
                    self.bump();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Tok::RParen)) {
                        args.push(self.parse_expr()?);
                        while matches!(self.peek(), Some(Tok::Comma)) {
                            self.bump();
                            args.push(self.parse_expr()?);
                        }
                    }
                    self.expect(&Tok::RParen)?;
                    Ok(Expr::Call(name, args))
                } else {
                    validate_field(&name)?;
                    Ok(Expr::Field(name))
                }
            }
            Some(other) => Err(CompileError::UnexpectedToken(format!("{other:?}"))),
            None => Err(CompileError::UnexpectedEnd),
        }
    }
}

const KNOWN_FIELDS: &[&str] = &[
    "notify", "direct", "mentions", "channel", "thread", "bot", "service", "user", "text",
    "tick", "hour", "minute", "weekday",
];

fn validate_field(name: &str) -> Result<(), CompileError> {
    if KNOWN_FIELDS.contains(&name) {
        Ok(())
    } else {
        Err(CompileError::UnknownField(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Runtime values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Value {
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Num(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::List(items) => write!(f, "{items:?}"),
        }
    }
}

impl Value {
    fn as_bool(&self) -> Result<bool, EvalError> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(EvalError::TypeMismatch(format!("expected bool, got {other}"))),
        }
    }

    fn as_str(&self) -> Result<&str, EvalError> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(EvalError::TypeMismatch(format!("expected string, got {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Compiled predicate
// ---------------------------------------------------------------------------

/// A compiled agent `when` expression.
pub struct Predicate {
    source: String,
    ast: Expr,
}

impl Predicate {
    /// The raw source text, as configured.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Heuristic used by the tick source to decide whether any runner needs
    /// the 60s ticker at all (spec §4.6): true if the raw text references
    /// any time-domain construct.
    pub fn needs_tick(&self) -> bool {
        for needle in ["at(", "every(", "tick", "hour", "minute", "weekday"] {
            if self.source.contains(needle) {
                return true;
            }
        }
        false
    }

    /// Evaluate against `ctx`. Runtime errors are swallowed to `false` and
    /// logged — per spec, a predicate error never aborts the runner.
    pub fn matches(&self, ctx: &EvalContext) -> bool {
        match eval(&self.ast, ctx) {
            Ok(v) => match v.as_bool() {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(error = %e, expr = %self.source, "predicate did not evaluate to bool");
                    false
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, expr = %self.source, "predicate evaluation error");
                false
            }
        }
    }
}

/// Compile a `when` expression. An empty/whitespace-only string compiles as
/// `notify` (the documented default).
pub fn compile(source: &str) -> Result<Predicate, CompileError> {
    let source = if source.trim().is_empty() { "notify" } else { source };
    let toks = lex(source)?;
    let mut parser = Parser { toks, pos: 0 };
    let ast = parser.parse_expr()?;
    if parser.pos != parser.toks.len() {
        let rest: String = format!("{:?}", &parser.toks[parser.pos..]);
        return Err(CompileError::TrailingInput(rest));
    }
    Ok(Predicate { source: source.to_string(), ast })
}

fn eval(expr: &Expr, ctx: &EvalContext) -> Result<Value, EvalError> {
    Ok(match expr {
        Expr::Lit(Lit::Str(s)) => Value::Str(s.clone()),
        Expr::Lit(Lit::Num(n)) => Value::Num(*n),
        Expr::Lit(Lit::Bool(b)) => Value::Bool(*b),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval(item, ctx)?);
            }
            Value::List(out)
        }
        Expr::Field(name) => field_value(name, ctx),
        Expr::Call(name, args) => eval_call(name, args, ctx)?,
        Expr::Not(inner) => Value::Bool(!eval(inner, ctx)?.as_bool()?),
        Expr::And(a, b) => Value::Bool(eval(a, ctx)?.as_bool()? && eval(b, ctx)?.as_bool()?),
        Expr::Or(a, b) => Value::Bool(eval(a, ctx)?.as_bool()? || eval(b, ctx)?.as_bool()?),
        Expr::Cmp(op, a, b) => Value::Bool(eval_cmp(*op, &eval(a, ctx)?, &eval(b, ctx)?)?),
    })
}

fn field_value(name: &str, ctx: &EvalContext) -> Value {
    match name {
        "notify" => Value::Bool(ctx.notify),
        "direct" => Value::Bool(ctx.direct),
        "mentions" => Value::Bool(ctx.mentions),
        "channel" => Value::Str(ctx.channel.clone()),
        "thread" => Value::Str(ctx.thread.clone()),
        "bot" => Value::Str(ctx.bot.clone()),
        "service" => Value::Str(ctx.service.clone()),
        "user" => Value::Str(ctx.user.clone()),
        "text" => Value::Str(ctx.text.clone()),
        "tick" => Value::Bool(ctx.tick),
        "hour" => Value::Num(ctx.hour as f64),
        "minute" => Value::Num(ctx.minute as f64),
        "weekday" => Value::Str(ctx.weekday.clone()),
        _ => Value::Bool(false),
    }
}

fn eval_cmp(op: CmpOp, a: &Value, b: &Value) -> Result<bool, EvalError> {
    Ok(match op {
        CmpOp::Eq => values_eq(a, b),
        CmpOp::Ne => !values_eq(a, b),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let (x, y) = (numeric(a)?, numeric(b)?);
            match op {
                CmpOp::Lt => x < y,
                CmpOp::Le => x <= y,
                CmpOp::Gt => x > y,
                CmpOp::Ge => x >= y,
                _ => unreachable!(),
            }
        }
        CmpOp::In => match b {
            Value::List(items) => items.iter().any(|item| values_eq(a, item)),
            Value::Str(s) => matches!(a, Value::Str(needle) if s.contains(needle.as_str())),
            other => return Err(EvalError::TypeMismatch(format!("`in` right side must be a list, got {other}"))),
        },
        CmpOp::Matches => {
            let text = a.as_str()?;
            let pattern = b.as_str()?;
            let re = Regex::new(pattern).map_err(|e| EvalError::TypeMismatch(format!("bad regex: {e}")))?;
            re.is_match(text)
        }
    })
}

fn values_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Num(x), Value::Num(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x.eq_ignore_ascii_case(y),
        _ => false,
    }
}

fn numeric(v: &Value) -> Result<f64, EvalError> {
    match v {
        Value::Num(n) => Ok(*n),
        other => Err(EvalError::TypeMismatch(format!("expected number, got {other}"))),
    }
}

fn eval_call(name: &str, args: &[Expr], ctx: &EvalContext) -> Result<Value, EvalError> {
    match name {
        "at" => {
            if !ctx.tick {
                return Ok(Value::Bool(false));
            }
            let here = format!("{}:{:02}", ctx.hour, ctx.minute);
            for arg in args {
                let want = eval(arg, ctx)?;
                if let Value::Str(s) = want {
                    if s.trim() == here {
                        return Ok(Value::Bool(true));
                    }
                }
            }
            Ok(Value::Bool(false))
        }
        "every" => {
            if !ctx.tick {
                return Ok(Value::Bool(false));
            }
            if args.len() != 1 {
                return Err(EvalError::BadEveryArg("every() takes exactly one argument".to_string()));
            }
            let arg = eval(&args[0], ctx)?;
            let spec = match arg {
                Value::Str(s) => s,
                other => return Err(EvalError::BadEveryArg(format!("{other}"))),
            };
            let spec = spec.trim();
            let (digits, unit) = spec.split_at(spec.len().saturating_sub(1));
            let n: u32 = digits
                .parse()
                .map_err(|_| EvalError::BadEveryArg(format!("not an `Nm`/`Nh` spec: {spec}")))?;
            if n == 0 {
                return Err(EvalError::BadEveryArg("N must be positive".to_string()));
            }
            match unit {
                "m" => {
                    let minute_of_day = ctx.hour * 60 + ctx.minute;
                    Ok(Value::Bool(minute_of_day % n == 0))
                }
                "h" => Ok(Value::Bool(ctx.minute == 0 && ctx.hour % n == 0)),
                other => Err(EvalError::BadEveryArg(format!("unknown unit `{other}`, expected m or h"))),
            }
        }
        other => {
            tracing::warn!(function = other, "unknown function in predicate");
            Ok(Value::Bool(false))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_message(direct: bool, mentions: bool, notify: bool) -> EvalContext {
        EvalContext {
            notify,
            direct,
            mentions,
            channel: "C1".into(),
            thread: String::new(),
            bot: "ops-bot".into(),
            service: "slack".into(),
            user: "U1".into(),
            text: "deploy please".into(),
            tick: false,
            hour: 0,
            minute: 0,
            weekday: "mon".into(),
        }
    }

    fn ctx_tick(hour: u32, minute: u32, weekday: &str) -> EvalContext {
        EvalContext {
            notify: false,
            direct: false,
            mentions: false,
            channel: String::new(),
            thread: String::new(),
            bot: "ops-bot".into(),
            service: String::new(),
            user: String::new(),
            text: String::new(),
            tick: true,
            hour,
            minute,
            weekday: weekday.into(),
        }
    }

    #[test]
    fn default_predicate_is_notify() {
        let p = compile("").unwrap();
        assert!(p.matches(&ctx_message(false, false, true)));
        assert!(!p.matches(&ctx_message(false, false, false)));
    }

    #[test]
    fn direct_field_matches() {
        let p = compile("direct").unwrap();
        assert!(p.matches(&ctx_message(true, false, false)));
        assert!(!p.matches(&ctx_message(false, false, false)));
    }

    #[test]
    fn boolean_combinators() {
        let p = compile("direct || mentions").unwrap();
        assert!(p.matches(&ctx_message(false, true, false)));
        let p2 = compile("direct and not mentions").unwrap();
        assert!(p2.matches(&ctx_message(true, false, false)));
        assert!(!p2.matches(&ctx_message(true, true, false)));
    }

    #[test]
    fn matches_operator_regexes_text() {
        let p = compile(r#"text matches "deploy.*""#).unwrap();
        assert!(p.matches(&ctx_message(false, false, false)));
    }

    #[test]
    fn in_operator_over_list() {
        let p = compile(r#"channel in ["C1", "C2"]"#).unwrap();
        assert!(p.matches(&ctx_message(false, false, false)));
    }

    #[test]
    fn at_matches_tick_time_unpadded_hour_padded_minute() {
        let p = compile(r#"at("9:00")"#).unwrap();
        assert!(p.matches(&ctx_tick(9, 0, "mon")));
        assert!(!p.matches(&ctx_tick(9, 1, "mon")));
        assert!(!p.matches(&ctx_tick(10, 0, "mon")));
    }

    #[test]
    fn every_minute_form() {
        let p = compile(r#"every("15m")"#).unwrap();
        assert!(p.matches(&ctx_tick(1, 30, "mon")));
        assert!(!p.matches(&ctx_tick(1, 31, "mon")));
    }

    #[test]
    fn every_hour_form_requires_minute_zero() {
        let p = compile(r#"every("2h")"#).unwrap();
        assert!(p.matches(&ctx_tick(4, 0, "mon")));
        assert!(!p.matches(&ctx_tick(4, 30, "mon")));
        assert!(!p.matches(&ctx_tick(3, 0, "mon")));
    }

    #[test]
    fn non_tick_event_never_matches_time_functions() {
        let p = compile(r#"at("9:00")"#).unwrap();
        assert!(!p.matches(&ctx_message(false, false, false)));
    }

    #[test]
    fn unknown_field_is_compile_error() {
        assert!(compile("bogus_field").is_err());
    }

    #[test]
    fn needs_tick_heuristic() {
        assert!(compile(r#"at("9:00")"#).unwrap().needs_tick());
        assert!(compile("weekday == \"mon\"").unwrap().needs_tick());
        assert!(!compile("direct").unwrap().needs_tick());
    }
}
