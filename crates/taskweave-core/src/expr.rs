// Expression evaluation for `<% ... %>` blocks in workflow definitions.
//
// The engine treats the evaluator as a pluggable capability: anything that
// can turn a template string plus a context into a value. The built-in
// dialect covers context paths (`$.a.b[0]`), the `env()` and `list()`
// functions, and scalar literals.

use serde_json::{Number, Value};

use crate::context::{Context, ENV_KEY};
use crate::error::{EngineError, Result};

/// Pluggable expression evaluator.
///
/// `evaluate` receives the full template string. A string that consists of a
/// single `<% %>` block evaluates to the block's typed value; any other
/// string renders each block into the surrounding text. Strings without
/// blocks pass through unchanged.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, text: &str, ctx: &Context) -> Result<Value>;
}

/// Whether a string contains an expression block
pub fn is_template(text: &str) -> bool {
    text.contains("<%")
}

/// Walk a JSON value and evaluate every template string in it.
pub fn evaluate_recursively(
    evaluator: &dyn Evaluator,
    value: &Value,
    ctx: &Context,
) -> Result<Value> {
    match value {
        Value::String(s) if is_template(s) => evaluator.evaluate(s, ctx),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(evaluate_recursively(evaluator, item, ctx)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), evaluate_recursively(evaluator, v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Evaluate every value of a mapping (used for `publish`, task input, output).
pub fn evaluate_object(evaluator: &dyn Evaluator, map: &Context, ctx: &Context) -> Result<Context> {
    let mut out = serde_json::Map::with_capacity(map.len());
    for (k, v) in map {
        out.insert(k.clone(), evaluate_recursively(evaluator, v, ctx)?);
    }
    Ok(out)
}

/// Evaluate a transition guard, coercing the result to a boolean.
/// `null` and `false` fail the guard; everything else passes.
pub fn evaluate_guard(evaluator: &dyn Evaluator, expr: &str, ctx: &Context) -> Result<bool> {
    let value = evaluator.evaluate(expr, ctx)?;

    Ok(match value {
        Value::Null => false,
        Value::Bool(b) => b,
        _ => true,
    })
}

/// Built-in evaluator dialect.
#[derive(Debug, Default, Clone)]
pub struct PathEvaluator;

impl Evaluator for PathEvaluator {
    fn evaluate(&self, text: &str, ctx: &Context) -> Result<Value> {
        let blocks = split_blocks(text)?;

        // A lone block returns the typed value.
        if let [Segment::Block(expr)] = blocks.as_slice() {
            return eval_expr(expr, ctx);
        }

        if blocks.len() == 1 {
            if let Segment::Text(t) = &blocks[0] {
                return Ok(Value::String(t.clone()));
            }
        }

        let mut rendered = String::new();

        for segment in &blocks {
            match segment {
                Segment::Text(t) => rendered.push_str(t),
                Segment::Block(expr) => rendered.push_str(&render(&eval_expr(expr, ctx)?)?),
            }
        }

        Ok(Value::String(rendered))
    }
}

enum Segment {
    Text(String),
    Block(String),
}

fn split_blocks(text: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("<%") {
        if start > 0 {
            segments.push(Segment::Text(rest[..start].to_string()));
        }

        let after = &rest[start + 2..];
        let end = after.find("%>").ok_or_else(|| {
            EngineError::expression(format!("Unterminated expression block in: {}", text))
        })?;

        segments.push(Segment::Block(after[..end].trim().to_string()));
        rest = &after[end + 2..];
    }

    if !rest.is_empty() || segments.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }

    Ok(segments)
}

fn render(value: &Value) -> Result<String> {
    Ok(match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other)
            .map_err(|e| EngineError::expression(format!("Unrenderable value: {}", e)))?,
    })
}

// Expression grammar:
//
//   expr     := primary selector*
//   primary  := '$' | ident '(' args? ')' | literal
//   selector := '.' ident | '[' integer ']'
//
// Missing context keys resolve to null rather than erroring, so guards and
// templates over optional data stay cheap to write.
fn eval_expr(expr: &str, ctx: &Context) -> Result<Value> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        source: expr,
    };

    let value = parser.parse_expr(ctx)?;
    parser.expect_end()?;

    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Dollar,
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Ident(String),
    Number(Number),
    Str(String),
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '$' => {
                chars.next();
                tokens.push(Token::Dollar);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
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
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => s.push(escaped),
                            None => {
                                return Err(EngineError::expression(format!(
                                    "Unterminated string in expression: {}",
                                    expr
                                )))
                            }
                        },
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => {
                            return Err(EngineError::expression(format!(
                                "Unterminated string in expression: {}",
                                expr
                            )))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '0'..='9' | '-' => {
                let mut num = String::new();
                num.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        num.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = if num.contains('.') {
                    num.parse::<f64>().ok().and_then(Number::from_f64)
                } else {
                    num.parse::<i64>().ok().map(Number::from)
                };
                match number {
                    Some(n) => tokens.push(Token::Number(n)),
                    None => {
                        return Err(EngineError::expression(format!(
                            "Invalid number '{}' in expression: {}",
                            num, expr
                        )))
                    }
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(EngineError::expression(format!(
                    "Unexpected character '{}' in expression: {}",
                    other, expr
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
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

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(ref t) if *t == expected => Ok(()),
            other => Err(EngineError::expression(format!(
                "Expected {:?}, found {:?} in expression: {}",
                expected, other, self.source
            ))),
        }
    }

    fn expect_end(&mut self) -> Result<()> {
        match self.peek() {
            None => Ok(()),
            Some(t) => Err(EngineError::expression(format!(
                "Unexpected trailing {:?} in expression: {}",
                t, self.source
            ))),
        }
    }

    fn parse_expr(&mut self, ctx: &Context) -> Result<Value> {
        let mut value = self.parse_primary(ctx)?;

        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    let key = match self.next() {
                        Some(Token::Ident(name)) => name,
                        other => {
                            return Err(EngineError::expression(format!(
                                "Expected identifier after '.', found {:?} in expression: {}",
                                other, self.source
                            )))
                        }
                    };
                    value = lookup_key(&value, &key);
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = match self.next() {
                        Some(Token::Number(n)) => n.as_i64().ok_or_else(|| {
                            EngineError::expression(format!(
                                "Non-integer index in expression: {}",
                                self.source
                            ))
                        })?,
                        other => {
                            return Err(EngineError::expression(format!(
                                "Expected integer index, found {:?} in expression: {}",
                                other, self.source
                            )))
                        }
                    };
                    self.expect(Token::RBracket)?;
                    value = lookup_index(&value, index);
                }
                _ => break,
            }
        }

        Ok(value)
    }

    fn parse_primary(&mut self, ctx: &Context) -> Result<Value> {
        match self.next() {
            Some(Token::Dollar) => Ok(Value::Object(ctx.clone())),
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return match name.as_str() {
                        "true" => Ok(Value::Bool(true)),
                        "false" => Ok(Value::Bool(false)),
                        "null" => Ok(Value::Null),
                        other => Err(EngineError::expression(format!(
                            "Unexpected identifier '{}' in expression: {}",
                            other, self.source
                        ))),
                    };
                }
                self.expect(Token::LParen)?;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.parse_expr(ctx)?);
                        match self.peek() {
                            Some(Token::Comma) => {
                                self.next();
                            }
                            _ => break,
                        }
                    }
                }
                self.expect(Token::RParen)?;
                self.call_function(&name, args, ctx)
            }
            Some(Token::Number(n)) => Ok(Value::Number(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            other => Err(EngineError::expression(format!(
                "Unexpected {:?} in expression: {}",
                other, self.source
            ))),
        }
    }

    fn call_function(&self, name: &str, args: Vec<Value>, ctx: &Context) -> Result<Value> {
        match name {
            "env" => {
                if !args.is_empty() {
                    return Err(EngineError::expression(format!(
                        "env() takes no arguments in expression: {}",
                        self.source
                    )));
                }
                Ok(ctx.get(ENV_KEY).cloned().unwrap_or(Value::Null))
            }
            "list" => Ok(Value::Array(args)),
            other => Err(EngineError::expression(format!(
                "Unknown function '{}' in expression: {}",
                other, self.source
            ))),
        }
    }
}

fn lookup_key(value: &Value, key: &str) -> Value {
    match value {
        Value::Object(map) => map.get(key).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn lookup_index(value: &Value, index: i64) -> Value {
    match value {
        Value::Array(items) => {
            let idx = if index < 0 {
                items.len() as i64 + index
            } else {
                index
            };
            if idx >= 0 && (idx as usize) < items.len() {
                items[idx as usize].clone()
            } else {
                Value::Null
            }
        }
        _ => Value::Null,
    }
}
