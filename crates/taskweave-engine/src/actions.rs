// Action invocation: the Action trait, the builtin std.* registry, and the
// executor that runs actions and posts results back to the engine.
//
// The invoker is stateless: it hands an action to a spawned task and the
// result comes back through Engine::on_action_complete. Crash recovery
// relies on the delayed-call sweeper re-dispatching unacknowledged work.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use taskweave_core::Context;
use tokio::sync::RwLock;
use tracing::{error, info};
use uuid::Uuid;

use crate::engine::Engine;

/// Result of an action or sub-workflow, routed back to the owning task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl ActionResult {
    pub fn ok(data: Value) -> Self {
        ActionResult {
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        ActionResult {
            data: None,
            error: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// A unit of externally observable work.
#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self, input: &Context) -> Result<Value, String>;
}

/// Named action registry. Ships the std.* builtins; tests and embedders can
/// register their own.
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, Arc<dyn Action>>>,
}

impl ActionRegistry {
    pub fn empty() -> Self {
        ActionRegistry {
            actions: RwLock::new(HashMap::new()),
        }
    }

    /// Registry pre-populated with the std.* system actions.
    pub fn with_std() -> Self {
        let mut actions: HashMap<String, Arc<dyn Action>> = HashMap::new();
        actions.insert("std.echo".to_string(), Arc::new(EchoAction));
        actions.insert("std.noop".to_string(), Arc::new(NoopAction));
        actions.insert("std.fail".to_string(), Arc::new(FailAction));
        actions.insert("std.http".to_string(), Arc::new(HttpAction::default()));

        ActionRegistry {
            actions: RwLock::new(actions),
        }
    }

    pub async fn register(&self, name: impl Into<String>, action: Arc<dyn Action>) {
        self.actions.write().await.insert(name.into(), action);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.read().await.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.actions.read().await.contains_key(name)
    }
}

/// Routes action invocations to an execution backend.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Hand off the action; completion arrives via on_action_complete.
    async fn run_action(
        &self,
        engine: Arc<Engine>,
        action_ex_id: Uuid,
        action_name: String,
        input: Context,
    );

    /// Whether the backend knows the action.
    async fn has_action(&self, action_name: &str) -> bool;
}

/// Executes actions on the local runtime in spawned tasks.
pub struct LocalExecutor {
    registry: Arc<ActionRegistry>,
}

impl LocalExecutor {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        LocalExecutor { registry }
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }
}

#[async_trait]
impl ActionExecutor for LocalExecutor {
    async fn run_action(
        &self,
        engine: Arc<Engine>,
        action_ex_id: Uuid,
        action_name: String,
        input: Context,
    ) {
        let registry = self.registry.clone();

        tokio::spawn(async move {
            info!(action_ex_id = %action_ex_id, action = %action_name, "Running action");

            let result = match registry.get(&action_name).await {
                Some(action) => match action.run(&input).await {
                    Ok(data) => ActionResult::ok(data),
                    Err(message) => ActionResult::err(message),
                },
                None => ActionResult::err(format!("Action is not registered: {}", action_name)),
            };

            if let Err(e) = engine.on_action_complete(action_ex_id, result).await {
                error!(
                    action_ex_id = %action_ex_id,
                    error = %e,
                    "Failed to deliver action result"
                );
            }
        });
    }

    async fn has_action(&self, action_name: &str) -> bool {
        self.registry.contains(action_name).await
    }
}

// ============================================
// std.* system actions
// ============================================

/// std.echo: returns its `output` parameter unchanged
struct EchoAction;

#[async_trait]
impl Action for EchoAction {
    async fn run(&self, input: &Context) -> Result<Value, String> {
        Ok(input.get("output").cloned().unwrap_or(Value::Null))
    }
}

/// std.noop: does nothing
struct NoopAction;

#[async_trait]
impl Action for NoopAction {
    async fn run(&self, _input: &Context) -> Result<Value, String> {
        Ok(Value::Null)
    }
}

/// std.fail: always fails (used to test error transitions)
struct FailAction;

#[async_trait]
impl Action for FailAction {
    async fn run(&self, _input: &Context) -> Result<Value, String> {
        Err("Fail action expected behavior".to_string())
    }
}

/// std.http: performs an HTTP request
#[derive(Default)]
struct HttpAction {
    client: reqwest::Client,
}

#[async_trait]
impl Action for HttpAction {
    async fn run(&self, input: &Context) -> Result<Value, String> {
        let url = input
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "std.http requires a 'url' parameter".to_string())?;

        let method = input
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| format!("Invalid HTTP method: {}", method))?;

        let mut request = self.client.request(method, url);

        if let Some(headers) = input.get("headers").and_then(|v| v.as_object()) {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name, value);
                }
            }
        }

        if let Some(body) = input.get("body") {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;

        let status = response.status().as_u16();
        let text = response.text().await.map_err(|e| e.to_string())?;
        let content: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(json!({
            "status": status,
            "content": content,
        }))
    }
}
