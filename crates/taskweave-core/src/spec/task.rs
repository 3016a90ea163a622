// Task-level spec types: transitions, joins, with-items, policies.

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};

/// Transition targets understood by the engine itself rather than the graph.
pub const RESERVED_TARGETS: &[&str] = &["noop", "pause", "fail", "succeed"];

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Action call string, e.g. `std.echo output="Hi"`. Absent together with
    /// `workflow` means `std.noop`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Sub-workflow name (mutually exclusive with `action`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub input: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub publish: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<TransitionSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_error: Vec<TransitionSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_complete: Vec<TransitionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_items: Option<WithItemsSpec>,
    /// In-flight cap for with-items iterations; may be an expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_after: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub pause_before: bool,
    /// Execution target hint (routing to a named executor pool)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Reverse workflow dependencies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// When false the task result is dropped from the context after
    /// publishing (published variables are kept)
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub keep_result: bool,
}

impl TaskSpec {
    /// Transitions matching a terminal state: SUCCESS sees on-success +
    /// on-complete, ERROR sees on-error + on-complete.
    pub fn transitions_for_success(&self) -> impl Iterator<Item = &TransitionSpec> {
        self.on_success.iter().chain(self.on_complete.iter())
    }

    pub fn transitions_for_error(&self) -> impl Iterator<Item = &TransitionSpec> {
        self.on_error.iter().chain(self.on_complete.iter())
    }
}

/// Defaults inherited by every task of a workflow unless the task overrides
/// the field itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskDefaults {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_success: Vec<TransitionSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_error: Vec<TransitionSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_complete: Vec<TransitionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_after: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub pause_before: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
}

impl TaskDefaults {
    pub fn apply_to(&self, task: &mut TaskSpec) {
        if task.on_success.is_empty() {
            task.on_success = self.on_success.clone();
        }
        if task.on_error.is_empty() {
            task.on_error = self.on_error.clone();
        }
        if task.on_complete.is_empty() {
            task.on_complete = self.on_complete.clone();
        }
        if task.retry.is_none() {
            task.retry = self.retry.clone();
        }
        if task.wait_before.is_none() {
            task.wait_before = self.wait_before.clone();
        }
        if task.wait_after.is_none() {
            task.wait_after = self.wait_after.clone();
        }
        if task.timeout.is_none() {
            task.timeout = self.timeout.clone();
        }
        if task.concurrency.is_none() {
            task.concurrency = self.concurrency.clone();
        }
        if !task.pause_before {
            task.pause_before = self.pause_before;
        }
        if task.requires.is_empty() {
            task.requires = self.requires.clone();
        }
    }
}

/// A transition: a bare target name, or `{name: guard-expression}`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionSpec {
    pub target: String,
    pub guard: Option<String>,
}

impl TransitionSpec {
    pub fn to(target: impl Into<String>) -> Self {
        TransitionSpec {
            target: target.into(),
            guard: None,
        }
    }
}

impl Serialize for TransitionSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match &self.guard {
            None => serializer.serialize_str(&self.target),
            Some(guard) => {
                use serde::ser::SerializeMap;
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(&self.target, guard)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for TransitionSpec {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct TransitionVisitor;

        impl<'de> Visitor<'de> for TransitionVisitor {
            type Value = TransitionSpec;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a task name or a single-entry {name: guard} mapping")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                Ok(TransitionSpec::to(v))
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let (target, guard): (String, String) = map
                    .next_entry()?
                    .ok_or_else(|| de::Error::custom("empty transition mapping"))?;

                if map.next_entry::<String, Value>()?.is_some() {
                    return Err(de::Error::custom(
                        "transition mapping must have exactly one entry",
                    ));
                }

                Ok(TransitionSpec {
                    target,
                    guard: Some(guard),
                })
            }
        }

        deserializer.deserialize_any(TransitionVisitor)
    }
}

/// Join condition: wait for all inbound transitions, exactly one, or N.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSpec {
    All,
    One,
    Count(u32),
}

impl JoinSpec {
    /// Number of fired inbound transitions required, given the static fan-in.
    pub fn required(&self, inbound: usize) -> usize {
        match self {
            JoinSpec::All => inbound,
            JoinSpec::One => 1,
            JoinSpec::Count(n) => (*n as usize).min(inbound),
        }
    }
}

impl Serialize for JoinSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            JoinSpec::All => serializer.serialize_str("all"),
            JoinSpec::One => serializer.serialize_str("one"),
            JoinSpec::Count(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for JoinSpec {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct JoinVisitor;

        impl<'de> Visitor<'de> for JoinVisitor {
            type Value = JoinSpec;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("'all', 'one', or a positive integer")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                match v {
                    "all" => Ok(JoinSpec::All),
                    "one" => Ok(JoinSpec::One),
                    other => Err(de::Error::custom(format!("invalid join value: {}", other))),
                }
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
                if v == 0 {
                    return Err(de::Error::custom("join count must be positive"));
                }
                Ok(JoinSpec::Count(v as u32))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
                if v <= 0 {
                    return Err(de::Error::custom("join count must be positive"));
                }
                Ok(JoinSpec::Count(v as u32))
            }
        }

        deserializer.deserialize_any(JoinVisitor)
    }
}

/// `with-items` bindings: one or more `var in <% expr %>` clauses.
#[derive(Debug, Clone, PartialEq)]
pub struct WithItemsSpec(pub Vec<String>);

impl WithItemsSpec {
    /// Parse every clause into `(variable, collection expression)`.
    pub fn bindings(&self) -> Result<Vec<(String, String)>> {
        self.0
            .iter()
            .map(|clause| {
                let (var, expr) = clause.split_once(" in ").ok_or_else(|| {
                    EngineError::dsl(format!(
                        "with-items clause must look like 'var in <% expr %>': {}",
                        clause
                    ))
                })?;

                let var = var.trim();
                if var.is_empty()
                    || !var
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(EngineError::dsl(format!(
                        "Invalid with-items variable name: {}",
                        var
                    )));
                }

                Ok((var.to_string(), expr.trim().to_string()))
            })
            .collect()
    }
}

impl Serialize for WithItemsSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.0.len() == 1 {
            serializer.serialize_str(&self.0[0])
        } else {
            use serde::ser::SerializeSeq;
            let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
            for clause in &self.0 {
                seq.serialize_element(clause)?;
            }
            seq.end()
        }
    }
}

impl<'de> Deserialize<'de> for WithItemsSpec {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct WithItemsVisitor;

        impl<'de> Visitor<'de> for WithItemsVisitor {
            type Value = WithItemsSpec;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a with-items clause or a list of clauses")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                Ok(WithItemsSpec(vec![v.to_string()]))
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut clauses = Vec::new();
                while let Some(clause) = seq.next_element::<String>()? {
                    clauses.push(clause);
                }
                Ok(WithItemsSpec(clauses))
            }
        }

        deserializer.deserialize_any(WithItemsVisitor)
    }
}

/// Retry policy: re-run a failed action up to `count` times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetrySpec {
    /// Max attempts after the initial one; may be an expression
    pub count: Value,
    /// Seconds between attempts; may be an expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<Value>,
    /// Stop retrying when this evaluates true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_on: Option<String>,
    /// Keep retrying while this evaluates true, even on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_on: Option<String>,
}

fn default_true() -> bool {
    true
}

fn is_true(v: &bool) -> bool {
    *v
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_items_bindings() {
        let spec = WithItemsSpec(vec!["i in <% $.items %>".to_string()]);
        assert_eq!(
            spec.bindings().unwrap(),
            vec![("i".to_string(), "<% $.items %>".to_string())]
        );

        let bad = WithItemsSpec(vec!["nonsense".to_string()]);
        assert!(bad.bindings().is_err());
    }

    #[test]
    fn test_join_required() {
        assert_eq!(JoinSpec::All.required(3), 3);
        assert_eq!(JoinSpec::One.required(3), 1);
        assert_eq!(JoinSpec::Count(2).required(3), 2);
        assert_eq!(JoinSpec::Count(5).required(3), 3);
    }

    #[test]
    fn test_task_defaults_fill_unset_fields_only() {
        let defaults = TaskDefaults {
            on_error: vec![TransitionSpec::to("cleanup")],
            timeout: Some(serde_json::json!(60)),
            ..Default::default()
        };

        let mut task = TaskSpec {
            timeout: Some(serde_json::json!(5)),
            ..Default::default()
        };

        defaults.apply_to(&mut task);

        assert_eq!(task.on_error, vec![TransitionSpec::to("cleanup")]);
        assert_eq!(task.timeout, Some(serde_json::json!(5)));
    }
}
