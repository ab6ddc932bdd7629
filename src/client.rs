//! MCP Client
//!
//! One connection to one server. A background loop reads the transport and
//! routes what arrives: responses to the protocol engine, notifications to the
//! router, server-initiated requests to the built-in handlers.

use crate::cancellation::{CancellationManager, CancellationReason, RegisterOptions};
use crate::error::{McpError, Result};
use crate::notifications::NotificationRouter;
use crate::protocol::engine::ProtocolEngine;
use crate::protocol::types::*;
use crate::sampling::SamplingManager;
use crate::transport::McpTransport;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

/// Components shared by every client of one runtime
#[derive(Clone)]
pub struct ClientContext {
    pub router: Arc<NotificationRouter>,
    pub sampling: SamplingManager,
    pub cancellation: CancellationManager,
    pub roots: Arc<RwLock<Vec<Root>>>,
    pub client_name: String,
    pub client_version: String,
    pub request_timeout: Duration,
    pub sampling_timeout: Option<Duration>,
}

impl Default for ClientContext {
    fn default() -> Self {
        Self {
            router: Arc::new(NotificationRouter::new()),
            sampling: SamplingManager::new(),
            cancellation: CancellationManager::new(),
            roots: Arc::new(RwLock::new(Vec::new())),
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: crate::protocol::DEFAULT_REQUEST_TIMEOUT,
            sampling_timeout: None,
        }
    }
}

/// MCP client for communicating with one MCP server
pub struct McpClient {
    /// Server name
    pub name: String,
    transport: Arc<dyn McpTransport>,
    engine: ProtocolEngine,
    ctx: ClientContext,
    server_info: RwLock<Option<InitializeResult>>,
    tools: RwLock<Vec<McpTool>>,
    /// Server-initiated requests still being answered, by the server's id
    inbound: Mutex<HashMap<RequestId, AbortHandle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T: Clone>(l: &RwLock<T>) -> T {
    l.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn write<T>(l: &RwLock<T>, value: T) {
    *l.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = value;
}

impl McpClient {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn McpTransport>,
        ctx: ClientContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            transport,
            engine: ProtocolEngine::with_request_timeout(ctx.request_timeout),
            ctx,
            server_info: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            inbound: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    pub fn transport(&self) -> &dyn McpTransport {
        self.transport.as_ref()
    }

    /// Spawn the receive loop; later calls are no-ops
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        // Notifications are handled off the receive loop, in arrival order,
        // so a slow handler never delays response correlation.
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<JsonRpcNotification>();
        let router = self.ctx.router.clone();
        let name = self.name.clone();
        let notifier = tokio::spawn(async move {
            while let Some(n) = notify_rx.recv().await {
                router.handle_notification(&name, &n.method, n.params).await;
            }
        });

        let weak = Arc::downgrade(self);
        let transport = self.transport.clone();
        let name = self.name.clone();
        let receiver = tokio::spawn(async move {
            loop {
                let message = match transport.receive().await {
                    Ok(Some(message)) => message,
                    Ok(None) => {
                        tracing::debug!(server = %name, "MCP transport closed");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(server = %name, error = %e, "MCP receive failed");
                        break;
                    }
                };
                let Some(client) = weak.upgrade() else { break };
                client.dispatch(message, &notify_tx);
            }
            if let Some(client) = weak.upgrade() {
                let rejected = client.engine.cleanup();
                if rejected > 0 {
                    tracing::warn!(server = %name, rejected, "Connection lost with requests in flight");
                }
            }
        });

        lock(&self.tasks).extend([notifier, receiver]);
    }

    fn dispatch(
        self: &Arc<Self>,
        message: JsonRpcMessage,
        notify_tx: &mpsc::UnboundedSender<JsonRpcNotification>,
    ) {
        match message {
            JsonRpcMessage::Response(response) => {
                self.engine.handle_response(response);
            }
            JsonRpcMessage::Notification(notification) => {
                if notification.method == methods::NOTIFY_CANCELLED {
                    self.on_peer_cancelled(notification.params.as_ref());
                }
                let _ = notify_tx.send(notification);
            }
            JsonRpcMessage::Request(request) => self.spawn_inbound(request),
        }
    }

    /// The server abandoned a request; stop any work either side still does for it
    fn on_peer_cancelled(&self, params: Option<&Value>) {
        let Some(params) = params
            .cloned()
            .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok())
        else {
            return;
        };
        if let Some(task) = lock(&self.inbound).remove(&params.request_id) {
            tracing::debug!(server = %self.name, id = %params.request_id, "Server cancelled its request");
            task.abort();
        }
        let ours = self
            .ctx
            .cancellation
            .active_requests(Some(&self.name))
            .iter()
            .any(|r| r.id == params.request_id);
        if ours {
            self.ctx
                .cancellation
                .cancel_request(&params.request_id, CancellationReason::ServerCancelled);
        }
    }

    fn spawn_inbound(self: &Arc<Self>, request: JsonRpcRequest) {
        let client = self.clone();
        let id = request.id.clone();
        let mut inbound = lock(&self.inbound);
        let task = tokio::spawn(async move {
            let id = request.id.clone();
            let method = request.method.clone();
            let outcome = client.handle_request(request).await;
            if lock(&client.inbound).remove(&id).is_none() {
                // Cancelled by the server while we were working on it
                return;
            }
            let sent = match outcome {
                Ok(result) => {
                    client
                        .engine
                        .send_response(client.transport(), id.clone(), result)
                        .await
                }
                Err(e) => {
                    tracing::debug!(server = %client.name, id = %id, method = %method, error = %e, "Inbound request failed");
                    let error = JsonRpcError {
                        data: Some(serde_json::json!({ "category": e.category() })),
                        ..JsonRpcError::new(e.code(), e.to_string())
                    };
                    client
                        .engine
                        .send_error_response(client.transport(), id.clone(), error)
                        .await
                }
            };
            if let Err(e) = sent {
                tracing::warn!(server = %client.name, id = %id, error = %e, "Failed to answer server request");
            }
        });
        inbound.insert(id, task.abort_handle());
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> Result<Value> {
        tracing::debug!(server = %self.name, id = %request.id, method = %request.method, "Server request");
        match request.method.as_str() {
            methods::PING => Ok(serde_json::json!({})),
            methods::ROOTS_LIST => Ok(serde_json::to_value(ListRootsResult {
                roots: read(self.ctx.roots.as_ref()),
            })?),
            methods::SAMPLING_CREATE_MESSAGE => {
                let params = request.params.unwrap_or(Value::Null);
                let result = self
                    .ctx
                    .sampling
                    .handle_sampling_request(&self.name, params, self.ctx.sampling_timeout)
                    .await?;
                Ok(serde_json::to_value(result)?)
            }
            other => Err(McpError::Rpc {
                code: error_codes::METHOD_NOT_FOUND,
                message: format!("Method not found: {}", other),
                data: None,
            }),
        }
    }

    /// Start the loop, run the `initialize` handshake and send `initialized`
    pub async fn connect(self: &Arc<Self>) -> Result<InitializeResult> {
        self.start();
        let params = InitializeParams::new(&self.ctx.client_name, &self.ctx.client_version);
        let result = self.engine.initialize(self.transport(), params).await?;
        self.engine.send_initialized(self.transport()).await?;

        tracing::info!(
            server = %self.name,
            peer = %result.server_info.name,
            version = %result.server_info.version,
            "MCP client initialized"
        );
        write(&self.server_info, Some(result.clone()));
        Ok(result)
    }

    pub fn server_info(&self) -> Option<InitializeResult> {
        read(&self.server_info)
    }

    pub fn is_initialized(&self) -> bool {
        self.server_info().is_some()
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.transport.is_connected()
    }

    /// Send a request that can be cancelled through the shared cancellation manager
    ///
    /// `timeout`, when set, auto-cancels with reason `timeout`. When the token
    /// fires first the server is told with `notifications/cancelled`.
    pub async fn request_cancellable(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = self.engine.generate_id();
        let mut options = RegisterOptions::default();
        if let Some(timeout) = timeout {
            options = options.timeout(timeout);
        }
        let token = self
            .ctx
            .cancellation
            .register_request(id.clone(), &self.name, method, options)
            .ok_or_else(|| McpError::Validation(format!("request id {} already registered", id)))?;

        let call = self
            .engine
            .send_request_with_id(self.transport(), id.clone(), method, params, None);

        tokio::select! {
            outcome = call => {
                self.ctx.cancellation.complete_request(&id);
                outcome
            }
            reason = token.cancelled() => {
                let notification = self
                    .ctx
                    .cancellation
                    .create_cancellation_notification(&id, &reason);
                if let Err(e) = self.transport.send(&notification.into()).await {
                    tracing::debug!(server = %self.name, id = %id, error = %e, "Could not notify server of cancellation");
                }
                Err(McpError::Cancelled { reason: reason.to_string() })
            }
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.engine.ping(self.transport()).await
    }

    /// List tools and refresh the cache
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let tools = self.engine.list_tools(self.transport()).await?;
        write(&self.tools, tools.clone());
        Ok(tools)
    }

    pub fn cached_tools(&self) -> Vec<McpTool> {
        read(&self.tools)
    }

    /// `tools/call`, cancellable like any [`request_cancellable`](Self::request_cancellable) call
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let value = self
            .request_cancellable(
                methods::TOOLS_CALL,
                Some(serde_json::to_value(&params)?),
                timeout,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn list_resources(&self) -> Result<Vec<McpResource>> {
        self.engine.list_resources(self.transport()).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        self.engine.read_resource(self.transport(), uri).await
    }

    pub async fn subscribe_resource(&self, uri: &str) -> Result<()> {
        self.engine.subscribe_resource(self.transport(), uri).await
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<()> {
        self.engine.unsubscribe_resource(self.transport(), uri).await
    }

    pub async fn list_prompts(&self) -> Result<Vec<McpPrompt>> {
        self.engine.list_prompts(self.transport()).await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<GetPromptResult> {
        self.engine.get_prompt(self.transport(), name, arguments).await
    }

    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<()> {
        self.engine.set_logging_level(self.transport(), level).await
    }

    /// Tell the server the client's roots changed
    pub async fn notify_roots_changed(&self) -> Result<()> {
        self.engine
            .send_notification(self.transport(), methods::NOTIFY_ROOTS_LIST_CHANGED, None)
            .await
    }

    /// Cancel this server's calls, reject pending requests and close the transport
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let cancelled = self
            .ctx
            .cancellation
            .cancel_server_requests(&self.name, CancellationReason::ServerShutdown);
        let sampling = self.ctx.sampling.cancel_server_requests(&self.name);
        for (_, task) in lock(&self.inbound).drain() {
            task.abort();
        }
        let rejected = self.engine.cleanup();
        self.ctx.router.clear_server(&self.name);

        let closed = self.transport.close().await;
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        tracing::info!(
            server = %self.name,
            cancelled = cancelled.len(),
            sampling,
            rejected,
            "MCP client closed"
        );
        closed
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::CreateMessageParams;
    use crate::transport::MemoryTransport;
    use serde_json::json;

    struct Peer {
        end: MemoryTransport,
    }

    impl Peer {
        async fn recv(&self) -> JsonRpcMessage {
            tokio::time::timeout(Duration::from_secs(2), self.end.receive())
                .await
                .expect("peer receive timed out")
                .unwrap()
                .expect("peer stream ended")
        }

        async fn recv_request(&self) -> JsonRpcRequest {
            match self.recv().await {
                JsonRpcMessage::Request(r) => r,
                other => panic!("expected request, got {:?}", other),
            }
        }

        async fn recv_response(&self) -> JsonRpcResponse {
            match self.recv().await {
                JsonRpcMessage::Response(r) => r,
                other => panic!("expected response, got {:?}", other),
            }
        }

        async fn reply(&self, id: RequestId, result: Value) {
            self.end
                .send(&JsonRpcResponse::success(id, result).into())
                .await
                .unwrap();
        }

        async fn request(&self, id: i64, method: &str, params: Option<Value>) {
            self.end
                .send(&JsonRpcRequest::new(RequestId::Number(id), method, params).into())
                .await
                .unwrap();
        }
    }

    fn setup(ctx: ClientContext) -> (Arc<McpClient>, Peer) {
        let (ours, theirs) = MemoryTransport::pair();
        let client = McpClient::new("fs", Arc::new(ours), ctx);
        client.start();
        (client, Peer { end: theirs })
    }

    fn init_result() -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {"listChanged": true}},
            "serverInfo": {"name": "mock", "version": "1.0.0"}
        })
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let (client, peer) = setup(ClientContext::default());
        let c = client.clone();
        let connect = tokio::spawn(async move { c.connect().await });

        let init = peer.recv_request().await;
        assert_eq!(init.method, "initialize");
        assert_eq!(init.params.as_ref().unwrap()["protocolVersion"], PROTOCOL_VERSION);
        peer.reply(init.id, init_result()).await;

        match peer.recv().await {
            JsonRpcMessage::Notification(n) => assert_eq!(n.method, methods::INITIALIZED),
            other => panic!("expected initialized, got {:?}", other),
        }
        let result = connect.await.unwrap().unwrap();
        assert_eq!(result.server_info.name, "mock");
        assert!(client.is_initialized());
    }

    #[tokio::test]
    async fn test_answers_ping_and_roots() {
        let ctx = ClientContext::default();
        ctx.roots.write().unwrap().push(Root {
            uri: "file:///work".into(),
            name: Some("work".into()),
        });
        let (_client, peer) = setup(ctx);

        peer.request(1, methods::PING, None).await;
        let resp = peer.recv_response().await;
        assert_eq!(resp.id, RequestId::Number(1));
        assert_eq!(resp.result, Some(json!({})));

        peer.request(2, methods::ROOTS_LIST, None).await;
        let resp = peer.recv_response().await;
        assert_eq!(resp.result.unwrap()["roots"][0]["uri"], "file:///work");
    }

    #[tokio::test]
    async fn test_unknown_method_is_method_not_found() {
        let (_client, peer) = setup(ClientContext::default());
        peer.request(9, "bogus/method", None).await;
        let resp = peer.recv_response().await;
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_sampling_request_routed_to_callback() {
        let ctx = ClientContext::default();
        ctx.sampling.register_callback(
            "fs",
            Arc::new(|server: String, _p: CreateMessageParams| async move {
                Ok::<_, McpError>(json!({
                    "role": "assistant",
                    "content": {"type": "text", "text": format!("hello {server}")},
                    "model": "m"
                }))
            }),
        );
        let (_client, peer) = setup(ctx);

        peer.request(
            3,
            methods::SAMPLING_CREATE_MESSAGE,
            Some(json!({
                "messages": [{"role": "user", "content": {"type": "text", "text": "hi"}}],
                "maxTokens": 10
            })),
        )
        .await;
        let resp = peer.recv_response().await;
        assert_eq!(resp.result.unwrap()["content"]["text"], "hello fs");

        peer.request(4, methods::SAMPLING_CREATE_MESSAGE, Some(json!({"messages": []})))
            .await;
        let resp = peer.recv_response().await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_notifications_reach_router() {
        let ctx = ClientContext::default();
        let router = ctx.router.clone();
        let mut events = router.subscribe();
        let (_client, peer) = setup(ctx);

        peer.end
            .send(&JsonRpcNotification::new(methods::NOTIFY_TOOLS_LIST_CHANGED, None).into())
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.name(), "notification");
        assert_eq!(router.history_len(), 1);
    }

    #[tokio::test]
    async fn test_cancellable_request_notifies_peer() {
        let ctx = ClientContext::default();
        let cancellation = ctx.cancellation.clone();
        let (client, peer) = setup(ctx);

        let c = client.clone();
        let call = tokio::spawn(async move {
            c.request_cancellable("tools/call", Some(json!({"name": "slow"})), None)
                .await
        });
        let req = peer.recv_request().await;
        assert!(cancellation.is_registered(&req.id));

        cancellation.cancel_request(&req.id, CancellationReason::UserCancelled);
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::Cancelled { ref reason } if reason == "user_cancelled"));

        match peer.recv().await {
            JsonRpcMessage::Notification(n) => {
                assert_eq!(n.method, methods::NOTIFY_CANCELLED);
                assert_eq!(n.params.unwrap()["requestId"], json!(req.id.to_string()));
            }
            other => panic!("expected cancelled notification, got {:?}", other),
        }

        // A late answer is dropped
        peer.reply(req.id.clone(), json!({})).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.engine().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellable_request_completes_normally() {
        let ctx = ClientContext::default();
        let cancellation = ctx.cancellation.clone();
        let (client, peer) = setup(ctx);

        let c = client.clone();
        let call = tokio::spawn(async move {
            c.call_tool("echo", Some(json!({"text": "hi"})), Some(Duration::from_secs(5)))
                .await
        });
        let req = peer.recv_request().await;
        peer.reply(
            req.id,
            json!({"content": [{"type": "text", "text": "hi"}]}),
        )
        .await;
        let result = call.await.unwrap().unwrap();
        assert_eq!(result.to_text(), "hi");
        assert_eq!(cancellation.active_count(), 0);
    }

    #[tokio::test]
    async fn test_peer_cancel_marks_server_cancelled() {
        let ctx = ClientContext::default();
        let mut events = ctx.cancellation.subscribe();
        let (client, peer) = setup(ctx);

        let c = client.clone();
        let call = tokio::spawn(async move { c.request_cancellable("tools/call", None, None).await });
        let req = peer.recv_request().await;
        peer.end
            .send(
                &JsonRpcNotification::new(
                    methods::NOTIFY_CANCELLED,
                    Some(json!({"requestId": req.id, "reason": "busy"})),
                )
                .into(),
            )
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, McpError::Cancelled { ref reason } if reason == "server_cancelled"));
        let mut saw = false;
        while let Ok(e) = events.try_recv() {
            saw |= e.name() == "request:cancelled";
        }
        assert!(saw);
    }

    #[tokio::test]
    async fn test_close_rejects_pending_and_cancels() {
        let ctx = ClientContext::default();
        let cancellation = ctx.cancellation.clone();
        let (client, peer) = setup(ctx);

        let c = client.clone();
        let plain = tokio::spawn(async move { c.ping().await });
        let c = client.clone();
        let cancellable =
            tokio::spawn(async move { c.request_cancellable("tools/call", None, None).await });
        let _ = peer.recv_request().await;
        let _ = peer.recv_request().await;

        client.close().await.unwrap();
        assert!(plain.await.unwrap().is_err());
        assert!(cancellable.await.unwrap().is_err());
        assert_eq!(cancellation.active_count(), 0);
        assert!(!client.is_connected());
        // Idempotent
        client.close().await.unwrap();
    }
}
