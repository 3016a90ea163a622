// Ad-hoc action specs and inline action-call parsing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::spec::workflow::InputParam;

/// An action declared under the top-level `actions:` key: a named wrapper
/// around a base action with pre-bound input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AdhocActionSpec {
    pub base: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub base_input: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<InputParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A parsed inline action call: name plus inline parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCall {
    pub name: String,
    pub params: serde_json::Map<String, Value>,
}

/// Parse an action call string like `std.echo output="Hi" count=3`.
///
/// Parameter values are YAML scalars; quoted strings and `<% %>` blocks may
/// contain spaces. Expression blocks stay strings for later evaluation.
pub fn parse_action_call(call: &str) -> Result<ActionCall> {
    let call = call.trim();

    if call.is_empty() {
        return Err(EngineError::dsl("Empty action call".to_string()));
    }

    let tokens = split_call_tokens(call)?;
    let mut iter = tokens.into_iter();

    let name = iter.next().unwrap();

    if name.contains('=') {
        return Err(EngineError::dsl(format!(
            "Action call must start with an action name: {}",
            call
        )));
    }

    let mut params = serde_json::Map::new();

    for token in iter {
        let (key, raw) = token.split_once('=').ok_or_else(|| {
            EngineError::dsl(format!(
                "Action parameter must look like key=value: '{}' in call: {}",
                token, call
            ))
        })?;

        params.insert(key.to_string(), parse_param_value(raw)?);
    }

    Ok(ActionCall {
        name: name.to_string(),
        params,
    })
}

// Whitespace-separated tokens, treating quoted strings and `<% %>` blocks as
// atomic.
fn split_call_tokens(call: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = call.chars().peekable();
    let mut quote: Option<char> = None;
    let mut in_expr = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' if !in_expr => {
                match quote {
                    None => quote = Some(c),
                    Some(q) if q == c => quote = None,
                    Some(_) => {}
                }
                current.push(c);
            }
            '<' if quote.is_none() && chars.peek() == Some(&'%') => {
                in_expr = true;
                current.push(c);
            }
            '>' if in_expr && current.ends_with('%') => {
                in_expr = false;
                current.push(c);
            }
            c if c.is_whitespace() && quote.is_none() && !in_expr => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }

    if quote.is_some() || in_expr {
        return Err(EngineError::dsl(format!(
            "Unterminated quote or expression in action call: {}",
            call
        )));
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    Ok(tokens)
}

fn parse_param_value(raw: &str) -> Result<Value> {
    let raw = raw.trim();

    // Expression blocks are evaluated later, against the task context.
    if raw.starts_with("<%") {
        return Ok(Value::String(raw.to_string()));
    }

    if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
        || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
    {
        return Ok(Value::String(raw[1..raw.len() - 1].to_string()));
    }

    serde_yaml::from_str(raw)
        .map_err(|e| EngineError::dsl(format!("Invalid parameter value '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_action_name() {
        let call = parse_action_call("std.noop").unwrap();
        assert_eq!(call.name, "std.noop");
        assert!(call.params.is_empty());
    }

    #[test]
    fn test_quoted_string_parameter() {
        let call = parse_action_call(r#"std.echo output="Hi there""#).unwrap();
        assert_eq!(call.name, "std.echo");
        assert_eq!(call.params["output"], json!("Hi there"));
    }

    #[test]
    fn test_expression_parameter_kept_raw() {
        let call = parse_action_call("std.echo output=<% $.progress %>").unwrap();
        assert_eq!(call.params["output"], json!("<% $.progress %>"));
    }

    #[test]
    fn test_scalar_parameters() {
        let call = parse_action_call("std.http url='http://x' timeout=30 verify=false").unwrap();
        assert_eq!(call.params["url"], json!("http://x"));
        assert_eq!(call.params["timeout"], json!(30));
        assert_eq!(call.params["verify"], json!(false));
    }

    #[test]
    fn test_malformed_calls() {
        assert!(parse_action_call("").is_err());
        assert!(parse_action_call("key=value").is_err());
        assert!(parse_action_call("std.echo broken").is_err());
        assert!(parse_action_call(r#"std.echo output="unterminated"#).is_err());
    }
}
