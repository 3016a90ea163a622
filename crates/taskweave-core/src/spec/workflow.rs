// Workflow-level spec types.

use std::collections::BTreeMap;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::spec::action::AdhocActionSpec;
use crate::spec::task::{TaskSpec, RESERVED_TARGETS};

/// A parsed DSL document: version, workflows, optional ad-hoc actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowListSpec {
    #[serde(deserialize_with = "deserialize_version")]
    pub version: String,
    #[serde(default)]
    pub workflows: BTreeMap<String, WorkflowSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<String, AdhocActionSpec>,
}

/// Workflow flavour: direct transitions forward, or reverse dependency solving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowType {
    #[default]
    Direct,
    Reverse,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkflowSpec {
    #[serde(rename = "type", default)]
    pub wf_type: WorkflowType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<InputParam>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub output: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub vars: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_defaults: Option<crate::spec::task::TaskDefaults>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskSpec>,
}

impl WorkflowSpec {
    /// Task spec with `task-defaults` filled into unset fields.
    pub fn effective_task_spec(&self, name: &str) -> Result<TaskSpec> {
        let task = self.tasks.get(name).ok_or_else(|| {
            EngineError::not_found(format!("Task is not declared in the workflow: {}", name))
        })?;

        let mut task = task.clone();

        if let Some(defaults) = &self.task_defaults {
            defaults.apply_to(&mut task);
        }

        Ok(task)
    }

    /// Task names with no inbound transitions: the initial command set of a
    /// direct workflow.
    pub fn start_task_names(&self) -> Vec<String> {
        let mut targeted: Vec<&str> = Vec::new();

        for task in self.tasks.values() {
            for t in task
                .on_success
                .iter()
                .chain(task.on_error.iter())
                .chain(task.on_complete.iter())
            {
                targeted.push(&t.target);
            }
        }

        self.tasks
            .keys()
            .filter(|name| !targeted.contains(&name.as_str()))
            .cloned()
            .collect()
    }

    /// Task names that declare a transition into `target` (join fan-in).
    pub fn inbound_task_names(&self, target: &str) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|(_, task)| {
                task.on_success
                    .iter()
                    .chain(task.on_error.iter())
                    .chain(task.on_complete.iter())
                    .any(|t| t.target == target)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn validate(&self, wf_name: &str) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(EngineError::dsl(format!(
                "Workflow '{}' has no tasks",
                wf_name
            )));
        }

        for (task_name, task) in &self.tasks {
            if task.action.is_some() && task.workflow.is_some() {
                return Err(EngineError::dsl(format!(
                    "Task '{}' in workflow '{}' declares both an action and a workflow",
                    task_name, wf_name
                )));
            }

            if let Some(with_items) = &task.with_items {
                with_items.bindings()?;
            }

            for t in task
                .on_success
                .iter()
                .chain(task.on_error.iter())
                .chain(task.on_complete.iter())
            {
                if !self.tasks.contains_key(&t.target)
                    && !RESERVED_TARGETS.contains(&t.target.as_str())
                {
                    return Err(EngineError::dsl(format!(
                        "Task '{}' in workflow '{}' has a transition to unknown task '{}'",
                        task_name, wf_name, t.target
                    )));
                }
            }

            for required in &task.requires {
                if !self.tasks.contains_key(required) {
                    return Err(EngineError::dsl(format!(
                        "Task '{}' in workflow '{}' requires unknown task '{}'",
                        task_name, wf_name, required
                    )));
                }
            }
        }

        Ok(())
    }
}

/// A declared workflow input: either a required name or `{name: default}`.
#[derive(Debug, Clone, PartialEq)]
pub enum InputParam {
    Required(String),
    WithDefault { name: String, default: Value },
}

impl InputParam {
    pub fn name(&self) -> &str {
        match self {
            InputParam::Required(name) => name,
            InputParam::WithDefault { name, .. } => name,
        }
    }

    pub fn default(&self) -> Option<&Value> {
        match self {
            InputParam::Required(_) => None,
            InputParam::WithDefault { default, .. } => Some(default),
        }
    }
}

impl Serialize for InputParam {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            InputParam::Required(name) => serializer.serialize_str(name),
            InputParam::WithDefault { name, default } => {
                use serde::ser::SerializeMap;
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(name, default)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for InputParam {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        struct ParamVisitor;

        impl<'de> Visitor<'de> for ParamVisitor {
            type Value = InputParam;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an input name or a single-entry {name: default} mapping")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                Ok(InputParam::Required(v.to_string()))
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let (name, default): (String, Value) = map
                    .next_entry()?
                    .ok_or_else(|| de::Error::custom("empty input parameter mapping"))?;

                if map.next_entry::<String, Value>()?.is_some() {
                    return Err(de::Error::custom(
                        "input parameter mapping must have exactly one entry",
                    ));
                }

                Ok(InputParam::WithDefault { name, default })
            }
        }

        deserializer.deserialize_any(ParamVisitor)
    }
}

fn deserialize_version<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<String, D::Error> {
    struct VersionVisitor;

    impl<'de> Visitor<'de> for VersionVisitor {
        type Value = String;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a version string or number")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
            Ok(v.to_string())
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Self::Value, E> {
            Ok(format!("{:.1}", v))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
            Ok(format!("{}.0", v))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
            Ok(format!("{}.0", v))
        }
    }

    deserializer.deserialize_any(VersionVisitor)
}
