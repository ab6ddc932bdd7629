//! JSON-RPC protocol engine
//!
//! Builds outbound messages, validates inbound ones, and correlates responses
//! with the requests that are still waiting for them. Each pending request is
//! terminated by exactly one of: its response, a send failure, its timeout,
//! `cleanup()`, or the caller dropping the future.

use crate::error::{McpError, Result};
use crate::protocol::types::*;
use crate::transport::McpTransport;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = HashMap<RequestId, PendingRequest>;

// Shared by every engine so ids stay unique across clients in one process
static NEXT_REQUEST: AtomicU64 = AtomicU64::new(1);

struct PendingRequest {
    method: String,
    started: Instant,
    responder: oneshot::Sender<Result<Value>>,
}

/// Removes a pending entry when the waiting future goes away early
struct PendingGuard {
    pending: Arc<Mutex<PendingMap>>,
    id: RequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.id);
    }
}

fn lock(map: &Mutex<PendingMap>) -> MutexGuard<'_, PendingMap> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Parse and validate one raw JSON-RPC message
///
/// Fails with `Parse` on invalid JSON and with `InvalidMessage` listing every
/// envelope violation otherwise.
pub fn parse_message(raw: &str) -> Result<JsonRpcMessage> {
    let value: Value = serde_json::from_str(raw).map_err(|e| McpError::Parse(e.to_string()))?;
    message_from_value(value)
}

/// Validate an already-decoded JSON value and build the typed message
pub fn message_from_value(value: Value) -> Result<JsonRpcMessage> {
    let violations = validate_message(&value);
    if !violations.is_empty() {
        return Err(McpError::InvalidMessage { violations });
    }

    let Value::Object(mut obj) = value else {
        return Err(McpError::InvalidMessage {
            violations: vec!["message must be a JSON object".to_string()],
        });
    };
    let params = obj.remove("params");
    let id = obj.remove("id").map(serde_json::from_value::<RequestId>).transpose()?;

    let message = match (obj.remove("method"), id) {
        (Some(Value::String(method)), Some(id)) => {
            JsonRpcMessage::Request(JsonRpcRequest::new(id, &method, params))
        }
        (Some(Value::String(method)), None) => {
            JsonRpcMessage::Notification(JsonRpcNotification::new(&method, params))
        }
        (_, Some(id)) => {
            let error = obj
                .remove("error")
                .map(serde_json::from_value::<JsonRpcError>)
                .transpose()?;
            JsonRpcMessage::Response(JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                result: if error.is_some() { None } else { obj.remove("result") },
                error,
            })
        }
        (_, None) => {
            return Err(McpError::InvalidMessage {
                violations: vec!["message must contain a method or an id".to_string()],
            })
        }
    };
    Ok(message)
}

/// Collect every JSON-RPC 2.0 envelope violation in `value`
pub fn validate_message(value: &Value) -> Vec<String> {
    let mut violations = Vec::new();
    let Some(obj) = value.as_object() else {
        violations.push("message must be a JSON object".to_string());
        return violations;
    };

    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(other) => violations.push(format!("jsonrpc must be \"2.0\" (got {})", other)),
        None => violations.push("jsonrpc must be \"2.0\" (missing)".to_string()),
    }

    let method = obj.get("method");
    let id = obj.get("id");

    if method.is_none() && id.is_none() {
        violations.push("message must contain a method or an id".to_string());
    }
    if let Some(m) = method {
        if !m.is_string() {
            violations.push("method must be a string".to_string());
        }
    }
    if let Some(i) = id {
        if !(i.is_string() || i.is_i64() || i.is_u64()) {
            violations.push("id must be a string or an integer".to_string());
        }
    }

    if method.is_none() && id.is_some() {
        match (obj.contains_key("result"), obj.get("error")) {
            (true, Some(_)) => {
                violations.push("response must not contain both result and error".to_string())
            }
            (false, None) => {
                violations.push("response must contain either result or error".to_string())
            }
            (false, Some(error)) => {
                let code_ok = error.get("code").is_some_and(|c| c.is_i64());
                let message_ok = error.get("message").is_some_and(|m| m.is_string());
                if !code_ok || !message_ok {
                    violations
                        .push("error must contain an integer code and a string message".to_string());
                }
            }
            (true, None) => {}
        }
    }

    violations
}

/// JSON-RPC request/response correlation over any [`McpTransport`]
pub struct ProtocolEngine {
    pending: Arc<Mutex<PendingMap>>,
    request_timeout: Duration,
}

impl ProtocolEngine {
    pub fn new() -> Self {
        Self::with_request_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_request_timeout(request_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            request_timeout,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Generate a request id never reused within this process
    pub fn generate_id(&self) -> RequestId {
        let n = NEXT_REQUEST.fetch_add(1, Ordering::SeqCst);
        let ts = chrono::Utc::now().timestamp_millis();
        RequestId::String(format!("req-{}-{}", ts, n))
    }

    /// See [`parse_message`]
    pub fn parse_message(&self, raw: &str) -> Result<JsonRpcMessage> {
        parse_message(raw)
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn has_pending(&self, id: &RequestId) -> bool {
        lock(&self.pending).contains_key(id)
    }

    /// Send a request with a fresh id and the default timeout
    pub async fn send_request(
        &self,
        transport: &dyn McpTransport,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value> {
        let id = self.generate_id();
        self.send_request_with_id(transport, id, method, params, None)
            .await
    }

    /// Send a request under a caller-chosen id
    ///
    /// `timeout` overrides the engine default for this call only.
    pub async fn send_request_with_id(
        &self,
        transport: &dyn McpTransport,
        id: RequestId,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let (tx, mut rx) = oneshot::channel();
        let started = Instant::now();
        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(&id) {
                return Err(McpError::Validation(format!(
                    "request id {} is already pending",
                    id
                )));
            }
            pending.insert(
                id.clone(),
                PendingRequest {
                    method: method.to_string(),
                    started,
                    responder: tx,
                },
            );
        }
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id: id.clone(),
        };

        tracing::debug!(id = %id, method = %method, "Sending MCP request");
        let request: JsonRpcMessage = JsonRpcRequest::new(id.clone(), method, params).into();
        if let Err(e) = transport.send(&request).await {
            lock(&self.pending).remove(&id);
            tracing::debug!(id = %id, method = %method, error = %e, "MCP request send failed");
            return Err(e);
        }

        let timeout = timeout.unwrap_or(self.request_timeout);
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::ConnectionClosed(format!(
                "request {} ({}) abandoned",
                id, method
            ))),
            Err(_) => {
                if lock(&self.pending).remove(&id).is_some() {
                    tracing::warn!(id = %id, method = %method, "MCP request timed out");
                    Err(McpError::RequestTimeout {
                        id,
                        method: method.to_string(),
                        elapsed_ms: started.elapsed().as_millis(),
                    })
                } else {
                    // The response won the race against the deadline.
                    rx.try_recv().unwrap_or_else(|_| {
                        Err(McpError::ConnectionClosed(format!(
                            "request {} ({}) abandoned",
                            id, method
                        )))
                    })
                }
            }
        }
    }

    /// Resolve the pending request that `response` answers
    ///
    /// Returns `false` (and only logs) when no request is waiting under that id:
    /// a duplicate, a late answer after timeout, or a peer that restarted.
    pub fn handle_response(&self, response: JsonRpcResponse) -> bool {
        let Some(entry) = lock(&self.pending).remove(&response.id) else {
            tracing::warn!(id = %response.id, "Response for unknown or expired request");
            return false;
        };

        tracing::debug!(
            id = %response.id,
            method = %entry.method,
            elapsed_ms = entry.started.elapsed().as_millis() as u64,
            "MCP response received"
        );
        let outcome = match response.error {
            Some(error) => Err(McpError::Rpc {
                code: error.code,
                message: error.message,
                data: error.data,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = entry.responder.send(outcome);
        true
    }

    /// Fire-and-forget notification
    pub async fn send_notification(
        &self,
        transport: &dyn McpTransport,
        method: &str,
        params: Option<Value>,
    ) -> Result<()> {
        tracing::debug!(method = %method, "Sending MCP notification");
        transport
            .send(&JsonRpcNotification::new(method, params).into())
            .await
    }

    /// Answer a server-initiated request
    pub async fn send_response(
        &self,
        transport: &dyn McpTransport,
        id: RequestId,
        result: Value,
    ) -> Result<()> {
        transport
            .send(&JsonRpcResponse::success(id, result).into())
            .await
    }

    pub async fn send_error_response(
        &self,
        transport: &dyn McpTransport,
        id: RequestId,
        error: JsonRpcError,
    ) -> Result<()> {
        transport
            .send(&JsonRpcResponse::failure(id, error).into())
            .await
    }

    /// Reject every pending request; returns how many were rejected
    pub fn cleanup(&self) -> usize {
        let drained: Vec<(RequestId, PendingRequest)> = lock(&self.pending).drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            let _ = entry.responder.send(Err(McpError::ConnectionClosed(format!(
                "request {} ({}) rejected during cleanup",
                id, entry.method
            ))));
        }
        if count > 0 {
            tracing::debug!(count, "Rejected pending MCP requests during cleanup");
        }
        count
    }

    // ------------------------------------------------------------------------
    // Typed MCP methods
    // ------------------------------------------------------------------------

    /// `initialize`; fails without sending anything on an unsupported version
    pub async fn initialize(
        &self,
        transport: &dyn McpTransport,
        params: InitializeParams,
    ) -> Result<InitializeResult> {
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&params.protocol_version.as_str()) {
            return Err(McpError::UnsupportedProtocolVersion {
                requested: params.protocol_version,
                supported: SUPPORTED_PROTOCOL_VERSIONS
                    .iter()
                    .map(|v| v.to_string())
                    .collect(),
            });
        }

        let value = self
            .send_request(
                transport,
                methods::INITIALIZE,
                Some(serde_json::to_value(&params)?),
            )
            .await?;
        let result: InitializeResult = decode(value)?;
        if result.protocol_version != params.protocol_version {
            tracing::warn!(
                requested = %params.protocol_version,
                negotiated = %result.protocol_version,
                "Server negotiated a different protocol version"
            );
        }
        Ok(result)
    }

    pub async fn send_initialized(&self, transport: &dyn McpTransport) -> Result<()> {
        self.send_notification(transport, methods::INITIALIZED, None)
            .await
    }

    pub async fn ping(&self, transport: &dyn McpTransport) -> Result<()> {
        self.send_request(transport, methods::PING, None).await?;
        Ok(())
    }

    /// `tools/list`, following pagination cursors to the end
    pub async fn list_tools(&self, transport: &dyn McpTransport) -> Result<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let page: ListToolsResult =
                decode(self.send_request(transport, methods::TOOLS_LIST, params).await?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    pub async fn call_tool(
        &self,
        transport: &dyn McpTransport,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        decode(
            self.send_request(
                transport,
                methods::TOOLS_CALL,
                Some(serde_json::to_value(&params)?),
            )
            .await?,
        )
    }

    pub async fn list_resources(&self, transport: &dyn McpTransport) -> Result<Vec<McpResource>> {
        let mut resources = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let page: ListResourcesResult =
                decode(self.send_request(transport, methods::RESOURCES_LIST, params).await?)?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => break,
            }
        }
        Ok(resources)
    }

    pub async fn read_resource(
        &self,
        transport: &dyn McpTransport,
        uri: &str,
    ) -> Result<ReadResourceResult> {
        decode(
            self.send_request(transport, methods::RESOURCES_READ, Some(uri_params(uri)?))
                .await?,
        )
    }

    pub async fn subscribe_resource(&self, transport: &dyn McpTransport, uri: &str) -> Result<()> {
        self.send_request(transport, methods::RESOURCES_SUBSCRIBE, Some(uri_params(uri)?))
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(
        &self,
        transport: &dyn McpTransport,
        uri: &str,
    ) -> Result<()> {
        self.send_request(
            transport,
            methods::RESOURCES_UNSUBSCRIBE,
            Some(uri_params(uri)?),
        )
        .await?;
        Ok(())
    }

    pub async fn list_prompts(&self, transport: &dyn McpTransport) -> Result<Vec<McpPrompt>> {
        let page: ListPromptsResult =
            decode(self.send_request(transport, methods::PROMPTS_LIST, None).await?)?;
        Ok(page.prompts)
    }

    pub async fn get_prompt(
        &self,
        transport: &dyn McpTransport,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<GetPromptResult> {
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        decode(
            self.send_request(
                transport,
                methods::PROMPTS_GET,
                Some(serde_json::to_value(&params)?),
            )
            .await?,
        )
    }

    pub async fn list_roots(&self, transport: &dyn McpTransport) -> Result<Vec<Root>> {
        let result: ListRootsResult =
            decode(self.send_request(transport, methods::ROOTS_LIST, None).await?)?;
        Ok(result.roots)
    }

    pub async fn set_logging_level(
        &self,
        transport: &dyn McpTransport,
        level: LoggingLevel,
    ) -> Result<()> {
        self.send_request(
            transport,
            methods::LOGGING_SET_LEVEL,
            Some(serde_json::to_value(SetLevelParams { level })?),
        )
        .await?;
        Ok(())
    }

    pub async fn send_progress(
        &self,
        transport: &dyn McpTransport,
        params: ProgressParams,
    ) -> Result<()> {
        self.send_notification(
            transport,
            methods::NOTIFY_PROGRESS,
            Some(serde_json::to_value(params)?),
        )
        .await
    }

    /// Tell the peer a request was abandoned; its answer, if any, will be dropped
    pub async fn send_cancelled(
        &self,
        transport: &dyn McpTransport,
        params: CancelledParams,
    ) -> Result<()> {
        self.send_notification(
            transport,
            methods::NOTIFY_CANCELLED,
            Some(serde_json::to_value(params)?),
        )
        .await
    }

    pub async fn shutdown(&self, transport: &dyn McpTransport) -> Result<()> {
        self.send_request(transport, methods::SHUTDOWN, None).await?;
        Ok(())
    }
}

impl Default for ProtocolEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

fn uri_params(uri: &str) -> Result<Value> {
    Ok(serde_json::to_value(ResourceUriParams {
        uri: uri.to_string(),
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Weak;

    type Responder = Box<dyn Fn(&JsonRpcRequest) -> Option<JsonRpcResponse> + Send + Sync>;

    /// Answers requests synchronously from inside `send`
    struct ScriptedTransport {
        engine: Weak<ProtocolEngine>,
        responder: Responder,
        sent: Mutex<Vec<JsonRpcMessage>>,
        fail_send: bool,
    }

    impl ScriptedTransport {
        fn new(engine: &Arc<ProtocolEngine>, responder: Responder) -> Self {
            Self {
                engine: Arc::downgrade(engine),
                responder,
                sent: Mutex::new(Vec::new()),
                fail_send: false,
            }
        }

        fn silent(engine: &Arc<ProtocolEngine>) -> Self {
            Self::new(engine, Box::new(|_| None))
        }

        fn sent(&self) -> Vec<JsonRpcMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl McpTransport for ScriptedTransport {
        async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
            if self.fail_send {
                return Err(McpError::Transport("pipe closed".into()));
            }
            self.sent.lock().unwrap().push(message.clone());
            if let JsonRpcMessage::Request(req) = message {
                if let (Some(resp), Some(engine)) = ((self.responder)(req), self.engine.upgrade()) {
                    engine.handle_response(resp);
                }
            }
            Ok(())
        }

        async fn receive(&self) -> Result<Option<JsonRpcMessage>> {
            Ok(None)
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn echo_result(result: Value) -> Responder {
        Box::new(move |req| Some(JsonRpcResponse::success(req.id.clone(), result.clone())))
    }

    #[test]
    fn test_generate_id_unique() {
        let engine = ProtocolEngine::new();
        let ids: HashSet<RequestId> = (0..10_000).map(|_| engine.generate_id()).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        let err = parse_message("{not json").unwrap_err();
        assert!(matches!(err, McpError::Parse(_)));
    }

    #[test]
    fn test_parse_lists_jsonrpc_version_violation() {
        let err = parse_message(r#"{"jsonrpc":"1.0"}"#).unwrap_err();
        let McpError::InvalidMessage { violations } = &err else {
            panic!("expected InvalidMessage, got {err:?}");
        };
        assert_eq!(violations.len(), 2);
        assert!(err.to_string().contains("jsonrpc must be \"2.0\""));
        assert!(err.to_string().contains("method or an id"));
    }

    #[test]
    fn test_parse_response_with_both_result_and_error() {
        let err = parse_message(
            r#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":1,"message":"x"}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("both result and error"));
    }

    #[test]
    fn test_parse_response_with_neither() {
        let err = parse_message(r#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert!(err.to_string().contains("either result or error"));
    }

    #[test]
    fn test_parse_bad_method_and_id_types() {
        let err = parse_message(r#"{"jsonrpc":"2.0","id":{"a":1},"method":5}"#).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("method must be a string"));
        assert!(text.contains("id must be a string or an integer"));
    }

    #[test]
    fn test_parse_classifies_messages() {
        let req = parse_message(r#"{"jsonrpc":"2.0","id":"s1","method":"ping"}"#).unwrap();
        assert!(matches!(req, JsonRpcMessage::Request(_)));

        let notif =
            parse_message(r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{}}"#)
                .unwrap();
        assert!(matches!(notif, JsonRpcMessage::Notification(_)));

        let resp = parse_message(r#"{"jsonrpc":"2.0","id":3,"result":null}"#).unwrap();
        let JsonRpcMessage::Response(resp) = resp else {
            panic!("expected response");
        };
        assert_eq!(resp.id, RequestId::Number(3));
        assert_eq!(resp.result, Some(Value::Null));

        let err =
            parse_message(r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"no"}}"#)
                .unwrap();
        let JsonRpcMessage::Response(err) = err else {
            panic!("expected response");
        };
        assert_eq!(err.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_send_request_happy_path_tools_list() {
        let engine = Arc::new(ProtocolEngine::new());
        let transport = ScriptedTransport::new(
            &engine,
            echo_result(serde_json::json!({
                "tools": [{"name": "x", "inputSchema": {"type": "object"}}]
            })),
        );

        let tools = engine.list_tools(&transport).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "x");
        assert_eq!(tools[0].input_schema["type"], "object");
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_request_times_out_and_clears_entry() {
        let engine = Arc::new(ProtocolEngine::with_request_timeout(Duration::from_millis(50)));
        let transport = ScriptedTransport::silent(&engine);

        let started = Instant::now();
        let err = engine
            .send_request(&transport, "tools/list", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_late_response_after_timeout_is_noop() {
        let engine = Arc::new(ProtocolEngine::with_request_timeout(Duration::from_millis(20)));
        let transport = ScriptedTransport::silent(&engine);

        let err = engine
            .send_request(&transport, "ping", None)
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let sent_id = transport.sent()[0].id().cloned().unwrap();
        let matched =
            engine.handle_response(JsonRpcResponse::success(sent_id, serde_json::json!({})));
        assert!(!matched);
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_response_resolves_once() {
        let engine = Arc::new(ProtocolEngine::new());
        let transport = ScriptedTransport::new(
            &engine,
            Box::new(|req| Some(JsonRpcResponse::success(req.id.clone(), serde_json::json!(1)))),
        );
        let value = engine.send_request(&transport, "ping", None).await.unwrap();
        assert_eq!(value, serde_json::json!(1));

        let id = transport.sent()[0].id().cloned().unwrap();
        assert!(!engine.handle_response(JsonRpcResponse::success(id, serde_json::json!(2))));
    }

    #[tokio::test]
    async fn test_send_failure_propagates_without_pending_entry() {
        let engine = Arc::new(ProtocolEngine::with_request_timeout(Duration::from_secs(60)));
        let mut transport = ScriptedTransport::silent(&engine);
        transport.fail_send = true;

        let err = engine
            .send_request(&transport, "ping", None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_response_becomes_rpc_error() {
        let engine = Arc::new(ProtocolEngine::new());
        let transport = ScriptedTransport::new(
            &engine,
            Box::new(|req| {
                Some(JsonRpcResponse::failure(
                    req.id.clone(),
                    JsonRpcError::new(error_codes::METHOD_NOT_FOUND, "unknown method"),
                ))
            }),
        );
        let err = engine
            .send_request(&transport, "bogus", None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Rpc { code: -32601, .. }));
    }

    #[tokio::test]
    async fn test_cleanup_rejects_pending() {
        let engine = Arc::new(ProtocolEngine::with_request_timeout(Duration::from_secs(60)));
        let transport = Arc::new(ScriptedTransport::silent(&engine));

        let e = engine.clone();
        let t = transport.clone();
        let handle = tokio::spawn(async move { e.send_request(t.as_ref(), "ping", None).await });

        while engine.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.cleanup(), 1);
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("cleanup"));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_caller_removes_pending_entry() {
        let engine = Arc::new(ProtocolEngine::with_request_timeout(Duration::from_secs(60)));
        let transport = ScriptedTransport::silent(&engine);

        let result = tokio::time::timeout(
            Duration::from_millis(10),
            engine.send_request(&transport, "ping", None),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_initialize_rejects_unsupported_version_without_sending() {
        let engine = Arc::new(ProtocolEngine::new());
        let transport = ScriptedTransport::silent(&engine);
        let mut params = InitializeParams::new("test", "0.0.1");
        params.protocol_version = "1999-01-01".into();

        let err = engine.initialize(&transport, params).await.unwrap_err();
        assert!(matches!(err, McpError::UnsupportedProtocolVersion { .. }));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_initialize_decodes_result() {
        let engine = Arc::new(ProtocolEngine::new());
        let transport = ScriptedTransport::new(
            &engine,
            echo_result(serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": true}},
                "serverInfo": {"name": "fs", "version": "1.0.0"}
            })),
        );
        let result = engine
            .initialize(&transport, InitializeParams::new("test", "0.0.1"))
            .await
            .unwrap();
        assert_eq!(result.server_info.name, "fs");
        assert!(result.capabilities.tools.unwrap().list_changed);
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let engine = Arc::new(ProtocolEngine::new());
        let transport = ScriptedTransport::new(
            &engine,
            Box::new(|req| {
                let page = match req.params.as_ref().and_then(|p| p.get("cursor")) {
                    None => serde_json::json!({
                        "tools": [{"name": "a", "inputSchema": {}}],
                        "nextCursor": "p2"
                    }),
                    Some(_) => serde_json::json!({
                        "tools": [{"name": "b", "inputSchema": {}}]
                    }),
                };
                Some(JsonRpcResponse::success(req.id.clone(), page))
            }),
        );
        let names: Vec<String> = engine
            .list_tools(&transport)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_notifications_have_no_id_and_no_pending_entry() {
        let engine = Arc::new(ProtocolEngine::new());
        let transport = ScriptedTransport::silent(&engine);
        engine
            .send_cancelled(
                &transport,
                CancelledParams {
                    request_id: "req-1".into(),
                    reason: Some("timeout".into()),
                },
            )
            .await
            .unwrap();
        let sent = transport.sent();
        assert!(sent[0].id().is_none());
        assert_eq!(sent[0].method(), Some(methods::NOTIFY_CANCELLED));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_responses_match_by_id() {
        let engine = Arc::new(ProtocolEngine::with_request_timeout(Duration::from_secs(5)));
        let transport = Arc::new(ScriptedTransport::silent(&engine));

        let (e1, t1) = (engine.clone(), transport.clone());
        let first = tokio::spawn(async move {
            e1.send_request_with_id(t1.as_ref(), "a".into(), "ping", None, None)
                .await
        });
        let (e2, t2) = (engine.clone(), transport.clone());
        let second = tokio::spawn(async move {
            e2.send_request_with_id(t2.as_ref(), "b".into(), "ping", None, None)
                .await
        });
        while engine.pending_count() < 2 {
            tokio::task::yield_now().await;
        }

        engine.handle_response(JsonRpcResponse::success("b".into(), serde_json::json!("B")));
        engine.handle_response(JsonRpcResponse::success("a".into(), serde_json::json!("A")));
        assert_eq!(first.await.unwrap().unwrap(), serde_json::json!("A"));
        assert_eq!(second.await.unwrap().unwrap(), serde_json::json!("B"));
    }
}
