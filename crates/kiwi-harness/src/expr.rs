// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hook expression language.
//!
//! A small safe subset evaluated against a read-only JSON context:
//! literals (`"..."`, numbers, `true`, `false`, `null`), dotted paths,
//! comparison and arithmetic operators, short-circuiting `and`/`or`/`not`,
//! membership `in`/`not in`, and parentheses.  Precedence, tight to loose:
//! unary `not`, `* /`, `+ -`, comparisons and `in`, `and`, `or`.
//!
//! Malformed expressions are rejected at registration time with
//! [`ExpressionError`]; runtime evaluation faults yield [`EvalError`] and
//! never crash the harness; the faulty hook is simply suppressed.

use serde_json::Value;
use std::fmt;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Registration-time syntax error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid expression: {0}")]
pub struct ExpressionError(pub String);

/// Runtime evaluation fault (type confusion, unsupported operand).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("evaluation error: {0}")]
pub struct EvalError(pub String);

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Dot,
    LParen,
    RParen,
    Op(&'static str),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{s}"),
            Token::Number(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "\"{s}\""),
            Token::Dot => write!(f, "."),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Op(op) => write!(f, "{op}"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    let Some(&ch) = chars.get(i) else {
                        return Err(ExpressionError("unterminated string literal".into()));
                    };
                    i += 1;
                    if ch == quote {
                        break;
                    }
                    s.push(ch);
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // A digit followed by `.` followed by a non-digit is a
                    // path access on a number, which the grammar rejects.
                    if chars[i] == '.' && !chars.get(i + 1).is_some_and(char::is_ascii_digit) {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ExpressionError(format!("bad number '{text}'")))?;
                tokens.push(Token::Number(n));
            }
            '=' | '!' | '<' | '>' => {
                let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
                match two.as_str() {
                    "==" => {
                        tokens.push(Token::Op("=="));
                        i += 2;
                    }
                    "!=" => {
                        tokens.push(Token::Op("!="));
                        i += 2;
                    }
                    "<=" => {
                        tokens.push(Token::Op("<="));
                        i += 2;
                    }
                    ">=" => {
                        tokens.push(Token::Op(">="));
                        i += 2;
                    }
                    _ if c == '<' => {
                        tokens.push(Token::Op("<"));
                        i += 1;
                    }
                    _ if c == '>' => {
                        tokens.push(Token::Op(">"));
                        i += 1;
                    }
                    _ => return Err(ExpressionError(format!("unexpected character '{c}'"))),
                }
            }
            '+' => {
                tokens.push(Token::Op("+"));
                i += 1;
            }
            '-' => {
                tokens.push(Token::Op("-"));
                i += 1;
            }
            '*' => {
                tokens.push(Token::Op("*"));
                i += 1;
            }
            '/' => {
                tokens.push(Token::Op("/"));
                i += 1;
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "and" => tokens.push(Token::Op("and")),
                    "or" => tokens.push(Token::Op("or")),
                    "not" => tokens.push(Token::Op("not")),
                    "in" => tokens.push(Token::Op("in")),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => {
                return Err(ExpressionError(format!("unexpected character '{other}'")));
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST and parser
// ---------------------------------------------------------------------------

/// Typed expression AST.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value.
    Literal(Value),
    /// Dotted context path (`a.b.c`).
    Path(Vec<String>),
    /// `not` / unary minus.
    Unary {
        /// Operator name.
        op: &'static str,
        /// Operand.
        expr: Box<Expr>,
    },
    /// Binary operator application.
    Binary {
        /// Operator name (`==`, `and`, `in`, `not_in`, …).
        op: &'static str,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Some(Token::Op(o)) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse(mut self) -> Result<Expr, ExpressionError> {
        let expr = self.parse_or()?;
        if let Some(t) = self.peek() {
            return Err(ExpressionError(format!("unexpected trailing token '{t}'")));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.eat_op("or") {
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: "or",
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_comparison()?;
        while self.eat_op("and") {
            let right = self.parse_comparison()?;
            left = Expr::Binary {
                op: "and",
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op @ ("==" | "!=" | "<" | "<=" | ">" | ">=" | "in"))) => *op,
                // `not in` appears infix at comparison level.
                Some(Token::Op("not")) if matches!(self.peek_at(1), Some(Token::Op("in"))) => {
                    self.pos += 2;
                    let right = self.parse_additive()?;
                    left = Expr::Binary {
                        op: "not_in",
                        left: Box::new(left),
                        right: Box::new(right),
                    };
                    continue;
                }
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_additive()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op @ ("+" | "-"))) => *op,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op @ ("*" | "/"))) => *op,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.eat_op("not") {
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: "not",
                expr: Box::new(expr),
            });
        }
        if matches!(self.peek(), Some(Token::Op("-"))) {
            self.pos += 1;
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: "neg",
                expr: Box::new(expr),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(first)) => match first.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ => {
                    let mut segments = vec![first];
                    while matches!(self.peek(), Some(Token::Dot)) {
                        self.pos += 1;
                        match self.next() {
                            Some(Token::Ident(seg)) => segments.push(seg),
                            other => {
                                return Err(ExpressionError(format!(
                                    "expected path segment after '.', got {other:?}"
                                )))
                            }
                        }
                    }
                    Ok(Expr::Path(segments))
                }
            },
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                if !matches!(self.next(), Some(Token::RParen)) {
                    return Err(ExpressionError("missing closing parenthesis".into()));
                }
                Ok(expr)
            }
            other => Err(ExpressionError(format!("unexpected token {other:?}"))),
        }
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

/// Parse an expression into a typed AST.
///
/// # Errors
///
/// Returns [`ExpressionError`] for any token or structure outside the
/// grammar.  Call this at hook registration time.
pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
    if input.trim().is_empty() {
        return Err(ExpressionError("empty expression".into()));
    }
    let tokens = tokenize(input)?;
    Parser::new(tokens).parse()
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Walk a dotted path through the context; a missing segment yields
/// `Null`, never an error.
#[must_use]
pub fn resolve_path<S: AsRef<str>>(segments: &[S], context: &Value) -> Value {
    let mut current = context;
    for segment in segments {
        match current.get(segment.as_ref()) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

/// Standard truthiness: null and empty containers are false, zero is
/// false, everything else is true.
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Evaluate a parsed expression against a read-only context.
///
/// # Errors
///
/// Returns [`EvalError`] for unsupported operand types; callers treat
/// this as "hook does not match" rather than a crash.
pub fn evaluate(expr: &Expr, context: &Value) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(segments) => Ok(resolve_path(segments, context)),
        Expr::Unary { op: "not", expr } => {
            let v = evaluate(expr, context)?;
            Ok(Value::Bool(!truthy(&v)))
        }
        Expr::Unary { op: "neg", expr } => {
            let v = evaluate(expr, context)?;
            Ok(number_value(-as_number(&v)?))
        }
        Expr::Unary { op, .. } => Err(EvalError(format!("unknown unary operator '{op}'"))),
        Expr::Binary { op, left, right } => {
            // Short-circuit logic keeps Python-style operand values.
            match *op {
                "and" => {
                    let l = evaluate(left, context)?;
                    if !truthy(&l) {
                        return Ok(l);
                    }
                    return evaluate(right, context);
                }
                "or" => {
                    let l = evaluate(left, context)?;
                    if truthy(&l) {
                        return Ok(l);
                    }
                    return evaluate(right, context);
                }
                _ => {}
            }

            let l = evaluate(left, context)?;
            let r = evaluate(right, context)?;
            match *op {
                "==" => Ok(Value::Bool(loose_eq(&l, &r))),
                "!=" => Ok(Value::Bool(!loose_eq(&l, &r))),
                "<" | "<=" | ">" | ">=" => Ok(Value::Bool(compare(op, &l, &r))),
                "+" | "-" | "*" | "/" => arithmetic(op, &l, &r),
                "in" => Ok(Value::Bool(contains(&r, &l))),
                "not_in" => Ok(Value::Bool(!contains(&r, &l))),
                other => Err(EvalError(format!("unknown operator '{other}'"))),
            }
        }
    }
}

/// Parse and evaluate in one step, coercing the result to truthiness.
///
/// Runtime faults (not syntax errors) are reported as a non-match.
///
/// # Errors
///
/// Returns [`ExpressionError`] only for malformed syntax.
pub fn evaluate_expression(input: &str, context: &Value) -> Result<bool, ExpressionError> {
    let expr = parse(input)?;
    Ok(evaluate(&expr, context).map(|v| truthy(&v)).unwrap_or(false))
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => l == r,
    }
}

/// Ordered comparison; any non-numeric operand (including null) is false.
fn compare(op: &str, l: &Value, r: &Value) -> bool {
    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return false;
    };
    match op {
        "<" => a < b,
        "<=" => a <= b,
        ">" => a > b,
        ">=" => a >= b,
        _ => false,
    }
}

fn arithmetic(op: &str, l: &Value, r: &Value) -> Result<Value, EvalError> {
    let a = as_number(l)?;
    let b = as_number(r)?;
    let result = match op {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        // Division by zero yields 0 rather than a fault.
        "/" => {
            if b == 0.0 {
                0.0
            } else {
                a / b
            }
        }
        _ => return Err(EvalError(format!("unknown arithmetic operator '{op}'"))),
    };
    Ok(number_value(result))
}

/// Numeric coercion for arithmetic: null is 0, booleans are 0/1.
fn as_number(value: &Value) -> Result<f64, EvalError> {
    match value {
        Value::Null => Ok(0.0),
        Value::Bool(b) => Ok(f64::from(u8::from(*b))),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| EvalError("non-finite number".into())),
        other => Err(EvalError(format!("not a number: {other}"))),
    }
}

fn contains(container: &Value, needle: &Value) -> bool {
    match container {
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Object(map) => needle.as_str().is_some_and(|n| map.contains_key(n)),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Template substitution
// ---------------------------------------------------------------------------

/// Walk strings, maps, and lists substituting `${dotted.path}` templates
/// against the context.  Unresolved templates are left literal so that
/// misconfiguration is visible.
#[must_use]
pub fn substitute_templates(value: &Value, context: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_string(s, context)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_templates(item, context))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_templates(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_string(s: &str, context: &Value) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        let path_text = &rest[start + 2..start + 2 + len];
        let segments: Vec<&str> = path_text.split('.').collect();
        out.push_str(&rest[..start]);
        match resolve_path(&segments, context) {
            Value::Null => {
                // Leave the template literal.
                out.push_str(&rest[start..start + 2 + len + 1]);
            }
            Value::String(v) => out.push_str(&v),
            other => out.push_str(&other.to_string()),
        }
        rest = &rest[start + 2 + len + 1..];
    }
    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval_bool(input: &str, context: &Value) -> bool {
        evaluate_expression(input, context).unwrap()
    }

    // ---- parsing ----------------------------------------------------------

    #[test]
    fn parses_comparison_to_ast() {
        let expr = parse("a == 1").unwrap();
        assert_eq!(
            expr,
            Expr::Binary {
                op: "==",
                left: Box::new(Expr::Path(vec!["a".into()])),
                right: Box::new(Expr::Literal(json!(1))),
            }
        );
    }

    #[test]
    fn parses_dotted_path() {
        assert_eq!(
            parse("event.detail.missing").unwrap(),
            Expr::Path(vec!["event".into(), "detail".into(), "missing".into()])
        );
    }

    #[test]
    fn parses_parenthesized_or_inside_and() {
        let expr = parse("(a or b) and c").unwrap();
        assert!(matches!(expr, Expr::Binary { op: "and", .. }));
    }

    #[test]
    fn empty_expression_rejected() {
        assert!(parse("").is_err());
        assert!(parse("   ").is_err());
    }

    #[test]
    fn trailing_tokens_rejected() {
        assert!(parse("a == 1 extra").is_err());
    }

    #[test]
    fn function_calls_rejected() {
        // `(` after a path is a trailing token, not a call.
        assert!(parse("len(x)").is_err());
    }

    #[test]
    fn unterminated_string_rejected() {
        assert!(parse("a == \"oops").is_err());
    }

    // ---- evaluation -------------------------------------------------------

    #[test]
    fn string_equality() {
        let ctx = json!({"event": {"code": "permission_denied"}});
        assert!(eval_bool("event.code == \"permission_denied\"", &ctx));
        assert!(!eval_bool("event.code == \"other\"", &ctx));
    }

    #[test]
    fn numeric_comparison() {
        let ctx = json!({"cost": {"turns": 5}, "limits": {"turns": 10}});
        assert!(!eval_bool("cost.turns > limits.turns", &ctx));
        assert!(eval_bool("cost.turns < limits.turns", &ctx));
        assert!(eval_bool("cost.turns <= 5", &ctx));
    }

    #[test]
    fn arithmetic_threshold() {
        let mut ctx = json!({"cost": {"turns": 9}, "limits": {"turns": 10}});
        assert!(!eval_bool("cost.turns > limits.turns * 0.9", &ctx));
        ctx["cost"]["turns"] = json!(10);
        assert!(eval_bool("cost.turns > limits.turns * 0.9", &ctx));
    }

    #[test]
    fn logical_operators_short_circuit() {
        let ctx = json!({"event": {"name": "error", "code": "timeout"}});
        assert!(eval_bool(
            "event.name == \"error\" and event.code == \"timeout\"",
            &ctx
        ));
        assert!(!eval_bool(
            "event.name == \"error\" and event.code == \"other\"",
            &ctx
        ));
        assert!(eval_bool(
            "event.code == \"timeout\" or event.code == \"rate_limit\"",
            &ctx
        ));
        assert!(!eval_bool(
            "event.code == \"network\" or event.code == \"rate_limit\"",
            &ctx
        ));
    }

    #[test]
    fn not_operator() {
        let mut ctx = json!({"active": false});
        assert!(eval_bool("not active", &ctx));
        ctx["active"] = json!(true);
        assert!(!eval_bool("not active", &ctx));
    }

    #[test]
    fn membership() {
        let ctx = json!({"permissions": {"required": ["fs.read", "fs.write"]}});
        assert!(eval_bool("\"fs.write\" in permissions.required", &ctx));
        assert!(!eval_bool("\"fs.delete\" in permissions.required", &ctx));
        assert!(eval_bool("\"fs.delete\" not in permissions.required", &ctx));
        assert!(!eval_bool("\"fs.read\" not in permissions.required", &ctx));
    }

    #[test]
    fn complex_expression() {
        let ctx = json!({
            "event": {"name": "error", "code": "permission_denied"},
            "cost": {"turns": 5},
            "limits": {"turns": 10},
        });
        assert!(eval_bool(
            "event.name == \"error\" and (event.code == \"permission_denied\" or event.code == \"quota_exceeded\")",
            &ctx
        ));
    }

    #[test]
    fn boolean_and_null_literals() {
        let ctx = json!({"value": null});
        assert!(eval_bool("true", &ctx));
        assert!(!eval_bool("false", &ctx));
        assert!(eval_bool("value == null", &ctx));
    }

    #[test]
    fn missing_path_is_null() {
        let ctx = json!({});
        assert!(eval_bool("missing == null", &ctx));
        assert_eq!(resolve_path(&["a", "b"], &ctx), Value::Null);
    }

    #[test]
    fn division_by_zero_is_zero() {
        let ctx = json!({"a": 10, "b": 0});
        let expr = parse("a / b").unwrap();
        assert_eq!(evaluate(&expr, &ctx).unwrap(), json!(0));
    }

    #[test]
    fn comparison_with_null_is_false() {
        let ctx = json!({"value": null});
        assert!(!eval_bool("value < 10", &ctx));
        assert!(!eval_bool("value > 10", &ctx));
    }

    #[test]
    fn arithmetic_with_null_coerces_to_zero() {
        let ctx = json!({"a": null, "b": 5});
        let expr = parse("a + b").unwrap();
        assert_eq!(evaluate(&expr, &ctx).unwrap(), json!(5));
        assert!(eval_bool("a + b", &ctx));
    }

    #[test]
    fn arithmetic_on_strings_is_a_runtime_fault_not_a_crash() {
        let ctx = json!({"s": "text"});
        let expr = parse("s + 1").unwrap();
        assert!(evaluate(&expr, &ctx).is_err());
        // The convenience wrapper folds the fault into "no match".
        assert!(!evaluate_expression("s + 1", &ctx).unwrap());
    }

    #[test]
    fn single_quoted_strings() {
        let ctx = json!({"code": "x"});
        assert!(eval_bool("code == 'x'", &ctx));
    }

    #[test]
    fn negative_number_literal() {
        let ctx = json!({"delta": -3});
        assert!(eval_bool("delta == -3", &ctx));
        assert!(eval_bool("delta < -2", &ctx));
    }

    // ---- templates --------------------------------------------------------

    #[test]
    fn substitutes_simple_template() {
        let ctx = json!({"directive": {"name": "deploy_staging"}});
        assert_eq!(
            substitute_templates(&json!("${directive.name}"), &ctx),
            json!("deploy_staging")
        );
    }

    #[test]
    fn substitutes_in_nested_structures() {
        let ctx = json!({"directive": {"name": "deploy"}, "event": {"detail": {"missing": "fs.write"}}});
        let obj = json!({
            "original_directive": "${directive.name}",
            "missing_cap": "${event.detail.missing}",
            "list": ["${directive.name}", "static"],
        });
        let out = substitute_templates(&obj, &ctx);
        assert_eq!(out["original_directive"], "deploy");
        assert_eq!(out["missing_cap"], "fs.write");
        assert_eq!(out["list"], json!(["deploy", "static"]));
    }

    #[test]
    fn unresolved_template_left_literal() {
        let out = substitute_templates(&json!("${missing.path}"), &json!({}));
        assert_eq!(out, json!("${missing.path}"));
    }

    #[test]
    fn non_string_values_pass_through() {
        let ctx = json!({});
        assert_eq!(substitute_templates(&json!(123), &ctx), json!(123));
        assert_eq!(substitute_templates(&json!(true), &ctx), json!(true));
        assert_eq!(substitute_templates(&Value::Null, &ctx), Value::Null);
    }

    #[test]
    fn non_string_resolution_renders_as_json() {
        let ctx = json!({"cost": {"turns": 7}});
        assert_eq!(
            substitute_templates(&json!("turns=${cost.turns}"), &ctx),
            json!("turns=7")
        );
    }
}
