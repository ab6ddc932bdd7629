//! Sampling: servers asking the client for an LLM completion
//!
//! One callback per server. Calls are capped across all servers, validated on
//! the way in and on the way out, and raced against a deadline.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use crate::error::{McpError, Result};

pub const DEFAULT_MAX_CONCURRENT: usize = 5;
pub const DEFAULT_SAMPLING_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingMessage {
    pub role: String,
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPreferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hints: Option<Vec<ModelHint>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_priority: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_priority: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intelligence_priority: Option<f64>,
}

/// `sampling/createMessage` params after validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageParams {
    pub messages: Vec<SamplingMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_preferences: Option<ModelPreferences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    pub max_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageResult {
    pub role: String,
    pub content: Value,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// Performs the completion on behalf of a server
///
/// Returns the raw result object; it is validated before reaching the server.
#[async_trait]
pub trait SamplingCallback: Send + Sync {
    async fn create_message(&self, server_name: &str, params: CreateMessageParams)
        -> Result<Value>;
}

#[async_trait]
impl<F, Fut> SamplingCallback for F
where
    F: Fn(String, CreateMessageParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn create_message(
        &self,
        server_name: &str,
        params: CreateMessageParams,
    ) -> Result<Value> {
        (self)(server_name.to_string(), params).await
    }
}

#[derive(Debug, Clone)]
pub enum SamplingEvent {
    CallbackRegistered {
        server: String,
    },
    CallbackUnregistered {
        server: String,
    },
    RequestStart {
        id: String,
        server: String,
    },
    RequestComplete {
        id: String,
        server: String,
        model: String,
        elapsed: Duration,
    },
    RequestError {
        id: String,
        server: String,
        error: String,
    },
}

impl SamplingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SamplingEvent::CallbackRegistered { .. } => "callback:registered",
            SamplingEvent::CallbackUnregistered { .. } => "callback:unregistered",
            SamplingEvent::RequestStart { .. } => "request:start",
            SamplingEvent::RequestComplete { .. } => "request:complete",
            SamplingEvent::RequestError { .. } => "request:error",
        }
    }
}

/// Snapshot of an in-flight call
#[derive(Debug, Clone)]
pub struct SamplingRequestInfo {
    pub id: String,
    pub server_name: String,
    pub started: Instant,
}

struct ActiveSampling {
    server_name: String,
    started: Instant,
    // Dropping the sender aborts the call
    _abort: oneshot::Sender<()>,
}

struct Inner {
    callbacks: Mutex<HashMap<String, Arc<dyn SamplingCallback>>>,
    active: Mutex<HashMap<String, ActiveSampling>>,
    max_concurrent: usize,
    default_timeout: Duration,
    events: broadcast::Sender<SamplingEvent>,
}

#[derive(Clone)]
pub struct SamplingManager {
    inner: Arc<Inner>,
}

/// Releases the concurrency slot however the call ends
struct SlotGuard<'a> {
    inner: &'a Inner,
    id: String,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.active).remove(&self.id);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SamplingManager {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_CONCURRENT, DEFAULT_SAMPLING_TIMEOUT)
    }

    pub fn with_limits(max_concurrent: usize, default_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                callbacks: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                max_concurrent,
                default_timeout,
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SamplingEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: SamplingEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn register_callback(&self, server_name: &str, callback: Arc<dyn SamplingCallback>) {
        let replaced = lock(&self.inner.callbacks)
            .insert(server_name.to_string(), callback)
            .is_some();
        tracing::debug!(server = %server_name, replaced, "Sampling callback registered");
        self.emit(SamplingEvent::CallbackRegistered {
            server: server_name.to_string(),
        });
    }

    pub fn unregister_callback(&self, server_name: &str) -> bool {
        let removed = lock(&self.inner.callbacks).remove(server_name).is_some();
        if removed {
            self.emit(SamplingEvent::CallbackUnregistered {
                server: server_name.to_string(),
            });
        }
        removed
    }

    pub fn has_callback(&self, server_name: &str) -> bool {
        lock(&self.inner.callbacks).contains_key(server_name)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.inner.active).len()
    }

    pub fn active_requests(&self) -> Vec<SamplingRequestInfo> {
        let mut out: Vec<SamplingRequestInfo> = lock(&self.inner.active)
            .iter()
            .map(|(id, a)| SamplingRequestInfo {
                id: id.clone(),
                server_name: a.server_name.clone(),
                started: a.started,
            })
            .collect();
        out.sort_by_key(|r| r.started);
        out
    }

    /// Run the server's callback for one `sampling/createMessage` request
    pub async fn handle_sampling_request(
        &self,
        server_name: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<CreateMessageResult> {
        let callback = lock(&self.inner.callbacks)
            .get(server_name)
            .cloned()
            .ok_or_else(|| {
                McpError::Sampling(format!(
                    "No sampling callback registered for server '{}'",
                    server_name
                ))
            })?;

        let id = uuid::Uuid::new_v4().to_string();
        let (abort_tx, mut abort_rx) = oneshot::channel::<()>();
        {
            let mut active = lock(&self.inner.active);
            if active.len() >= self.inner.max_concurrent {
                return Err(McpError::Sampling(format!(
                    "Concurrent sampling limit reached ({})",
                    self.inner.max_concurrent
                )));
            }
            active.insert(
                id.clone(),
                ActiveSampling {
                    server_name: server_name.to_string(),
                    started: Instant::now(),
                    _abort: abort_tx,
                },
            );
        }
        let _slot = SlotGuard {
            inner: &self.inner,
            id: id.clone(),
        };

        let params = validate_params(&params)?;
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        let started = Instant::now();

        tracing::debug!(id = %id, server = %server_name, "Sampling request started");
        self.emit(SamplingEvent::RequestStart {
            id: id.clone(),
            server: server_name.to_string(),
        });

        let outcome = tokio::select! {
            result = callback.create_message(server_name, params) => {
                result.and_then(|value| validate_result(&value))
            }
            _ = tokio::time::sleep(timeout) => Err(McpError::Timeout(format!(
                "Sampling request {} for '{}' timed out after {}ms",
                id,
                server_name,
                timeout.as_millis()
            ))),
            _ = &mut abort_rx => Err(McpError::Cancelled {
                reason: "sampling request cancelled".to_string(),
            }),
        };

        match &outcome {
            Ok(result) => {
                tracing::debug!(id = %id, server = %server_name, model = %result.model, "Sampling request complete");
                self.emit(SamplingEvent::RequestComplete {
                    id,
                    server: server_name.to_string(),
                    model: result.model.clone(),
                    elapsed: started.elapsed(),
                });
            }
            Err(e) => {
                tracing::warn!(id = %id, server = %server_name, error = %e, "Sampling request failed");
                self.emit(SamplingEvent::RequestError {
                    id,
                    server: server_name.to_string(),
                    error: e.to_string(),
                });
            }
        }
        outcome
    }

    /// Abort one call without invoking anything further
    pub fn cancel_request(&self, id: &str) -> bool {
        lock(&self.inner.active).remove(id).is_some()
    }

    pub fn cancel_server_requests(&self, server_name: &str) -> usize {
        let mut active = lock(&self.inner.active);
        let before = active.len();
        active.retain(|_, a| a.server_name != server_name);
        before - active.len()
    }

    pub fn cancel_all(&self) -> usize {
        let mut active = lock(&self.inner.active);
        let n = active.len();
        active.clear();
        n
    }
}

impl Default for SamplingManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Check raw `sampling/createMessage` params, reporting every violation
pub fn validate_params(params: &Value) -> Result<CreateMessageParams> {
    let Some(obj) = params.as_object() else {
        return Err(McpError::Validation(
            "sampling params must be an object".to_string(),
        ));
    };
    let mut violations = Vec::new();

    match obj.get("messages").and_then(Value::as_array) {
        None => violations.push("messages must be an array".to_string()),
        Some(messages) if messages.is_empty() => {
            violations.push("messages must not be empty".to_string())
        }
        Some(messages) => {
            for (i, message) in messages.iter().enumerate() {
                match message.get("role").and_then(Value::as_str) {
                    Some("user") | Some("assistant") => {}
                    _ => violations.push(format!("messages[{i}].role must be user or assistant")),
                }
                if !message.get("content").is_some_and(Value::is_object) {
                    violations.push(format!("messages[{i}].content must be an object"));
                }
            }
        }
    }

    if !obj
        .get("maxTokens")
        .and_then(Value::as_u64)
        .is_some_and(|n| n > 0)
    {
        violations.push("maxTokens must be a positive integer".to_string());
    }

    if let Some(prefs) = obj.get("modelPreferences") {
        match prefs.as_object() {
            None => violations.push("modelPreferences must be an object".to_string()),
            Some(prefs) => {
                for key in ["costPriority", "speedPriority", "intelligencePriority"] {
                    if let Some(v) = prefs.get(key) {
                        if !v.as_f64().is_some_and(|p| (0.0..=1.0).contains(&p)) {
                            violations.push(format!("modelPreferences.{key} must be in [0, 1]"));
                        }
                    }
                }
            }
        }
    }

    if !violations.is_empty() {
        return Err(McpError::Validation(violations.join("; ")));
    }
    serde_json::from_value(params.clone()).map_err(|e| McpError::Validation(e.to_string()))
}

/// Check a callback's result before it is returned to the server
pub fn validate_result(result: &Value) -> Result<CreateMessageResult> {
    let Some(obj) = result.as_object() else {
        return Err(McpError::Validation(
            "sampling result must be an object".to_string(),
        ));
    };
    let mut violations = Vec::new();
    if obj.get("role").and_then(Value::as_str) != Some("assistant") {
        violations.push("role must be assistant");
    }
    if !obj.get("content").is_some_and(Value::is_object) {
        violations.push("content must be an object");
    }
    if !obj.get("model").is_some_and(Value::is_string) {
        violations.push("model must be a string");
    }
    if !violations.is_empty() {
        return Err(McpError::Validation(format!(
            "Invalid sampling result: {}",
            violations.join("; ")
        )));
    }
    serde_json::from_value(result.clone()).map_err(|e| McpError::Validation(e.to_string()))
}
