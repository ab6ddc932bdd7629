//! MCP Transport Layer
//!
//! A transport moves whole JSON-RPC messages between the client and one server.
//! Framing is newline-delimited JSON; validation of what arrives is delegated to
//! [`parse_message`].
//!
//! - **StdioTransport**: child process stdin/stdout
//! - **MemoryTransport**: in-process pair for tests and embedded servers

use crate::error::{McpError, Result};
use crate::protocol::engine::parse_message;
use crate::protocol::types::JsonRpcMessage;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch, Mutex};

/// Capacity of the line relay between a reader task and `receive()`
const LINE_BUFFER: usize = 256;

/// MCP transport trait
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send one message
    async fn send(&self, message: &JsonRpcMessage) -> Result<()>;

    /// Receive the next valid message, `None` once the stream has ended
    async fn receive(&self) -> Result<Option<JsonRpcMessage>>;

    /// Close the transport
    async fn close(&self) -> Result<()>;

    /// Check if transport is connected
    fn is_connected(&self) -> bool;
}

/// Newline-delimited JSON over a byte writer and a relay of inbound lines
pub struct StdioTransport {
    name: String,
    writer: Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    lines: Mutex<mpsc::Receiver<String>>,
    connected: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl StdioTransport {
    /// Build from a writer and an already-running line relay
    ///
    /// The lifecycle supervisor uses this: it owns the stdout reader so it can
    /// also surface every line as a `server:stdout` event.
    pub fn new(
        name: impl Into<String>,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        lines: mpsc::Receiver<String>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            writer: Mutex::new(Some(Box::new(writer))),
            lines: Mutex::new(lines),
            connected: AtomicBool::new(true),
            closed_tx,
        }
    }

    /// Build from a writer and a raw reader, spawning the line reader task
    pub fn from_streams(
        name: impl Into<String>,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let task_name = name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(server = %task_name, "transport reader reached EOF");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(server = %task_name, error = %e, "transport read failed");
                        break;
                    }
                }
            }
        });
        Self::new(name, writer, rx)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(McpError::Transport(format!(
                "transport '{}' not connected",
                self.name
            )));
        }

        let line = serde_json::to_string(message)? + "\n";
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| {
            McpError::Transport(format!("transport '{}' writer closed", self.name))
        })?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::Transport(format!("write to '{}' failed: {}", self.name, e)))?;
        writer
            .flush()
            .await
            .map_err(|e| McpError::Transport(format!("flush to '{}' failed: {}", self.name, e)))?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<JsonRpcMessage>> {
        let mut closed = self.closed_tx.subscribe();
        if *closed.borrow() {
            return Ok(None);
        }
        let mut lines = self.lines.lock().await;
        loop {
            let line = tokio::select! {
                line = lines.recv() => line,
                _ = closed.wait_for(|c| *c) => None,
            };
            let Some(line) = line else {
                self.connected.store(false, Ordering::SeqCst);
                return Ok(None);
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match parse_message(trimmed) {
                Ok(message) => return Ok(Some(message)),
                Err(e) => {
                    tracing::warn!(server = %self.name, error = %e, "Dropping malformed MCP message");
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) && *self.closed_tx.borrow() {
            return Ok(());
        }
        self.closed_tx.send_replace(true);
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// One end of an in-process transport pair
pub struct MemoryTransport {
    outbound: mpsc::UnboundedSender<JsonRpcMessage>,
    inbound: Mutex<mpsc::UnboundedReceiver<JsonRpcMessage>>,
    connected: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl MemoryTransport {
    /// Create two connected ends; what one sends the other receives
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::end(a_tx, b_rx), Self::end(b_tx, a_rx))
    }

    fn end(
        outbound: mpsc::UnboundedSender<JsonRpcMessage>,
        inbound: mpsc::UnboundedReceiver<JsonRpcMessage>,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            outbound,
            inbound: Mutex::new(inbound),
            connected: AtomicBool::new(true),
            closed_tx,
        }
    }
}

#[async_trait]
impl McpTransport for MemoryTransport {
    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(McpError::Transport("memory transport not connected".into()));
        }
        self.outbound
            .send(message.clone())
            .map_err(|_| McpError::Transport("memory transport peer dropped".into()))
    }

    async fn receive(&self) -> Result<Option<JsonRpcMessage>> {
        let mut closed = self.closed_tx.subscribe();
        if *closed.borrow() {
            return Ok(None);
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            message = inbound.recv() => Ok(message),
            _ = closed.wait_for(|c| *c) => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.closed_tx.send_replace(true);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{JsonRpcNotification, JsonRpcRequest, RequestId};

    #[tokio::test]
    async fn test_stdio_transport_writes_one_line_per_message() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_io);
        let (client_read, client_write) = tokio::io::split(client_io);
        drop(server_write);

        let transport = StdioTransport::from_streams("echo", client_write, client_read);
        let msg: JsonRpcMessage = JsonRpcRequest::new(RequestId::Number(1), "ping", None).into();
        transport.send(&msg).await.unwrap();

        let mut reader = BufReader::new(server_read).lines();
        let line = reader.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
    }

    #[tokio::test]
    async fn test_stdio_transport_skips_malformed_lines() {
        let (tx, rx) = mpsc::channel(8);
        let transport = StdioTransport::new("srv", tokio::io::sink(), rx);
        tx.send("not json".to_string()).await.unwrap();
        tx.send(r#"{"jsonrpc":"1.0","method":"x"}"#.to_string()).await.unwrap();
        tx.send(String::new()).await.unwrap();
        tx.send(r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#.to_string())
            .await
            .unwrap();

        let msg = transport.receive().await.unwrap().unwrap();
        assert_eq!(msg.method(), Some("notifications/progress"));
    }

    #[tokio::test]
    async fn test_stdio_transport_receive_none_on_eof() {
        let (tx, rx) = mpsc::channel(8);
        let transport = StdioTransport::new("srv", tokio::io::sink(), rx);
        drop(tx);
        assert!(transport.receive().await.unwrap().is_none());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_stdio_transport_send_after_close() {
        let (_tx, rx) = mpsc::channel(8);
        let transport = StdioTransport::new("srv", tokio::io::sink(), rx);
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        let msg: JsonRpcMessage = JsonRpcNotification::new("x", None).into();
        let err = transport.send(&msg).await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
        assert!(transport.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_receive() {
        let (_tx, rx) = mpsc::channel(8);
        let transport = std::sync::Arc::new(StdioTransport::new("srv", tokio::io::sink(), rx));
        let t = transport.clone();
        let handle = tokio::spawn(async move { t.receive().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        transport.close().await.unwrap();
        let received = handle.await.unwrap().unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_memory_pair_roundtrip() {
        let (client, server) = MemoryTransport::pair();
        let msg: JsonRpcMessage = JsonRpcRequest::new("a".into(), "ping", None).into();
        client.send(&msg).await.unwrap();
        assert_eq!(server.receive().await.unwrap(), Some(msg));

        client.close().await.unwrap();
        assert!(!client.is_connected());
        assert!(client.receive().await.unwrap().is_none());
    }
}
