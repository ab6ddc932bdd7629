//! Cooperative cancellation for in-flight MCP requests
//!
//! Every cancellable operation gets a [`CancellationToken`]. The manager keeps
//! one entry per request id and removes it on completion or cancellation,
//! whichever happens first. Cancelling never stops the peer from answering;
//! a late answer simply finds no pending request.

use crate::protocol::types::{methods, CancelledParams, JsonRpcNotification, RequestId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Why an operation was cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancellationReason {
    Timeout,
    UserCancelled,
    ServerShutdown,
    SystemShutdown,
    ServerCancelled,
    Custom(String),
}

impl CancellationReason {
    pub fn as_str(&self) -> &str {
        match self {
            CancellationReason::Timeout => "timeout",
            CancellationReason::UserCancelled => "user_cancelled",
            CancellationReason::ServerShutdown => "server_shutdown",
            CancellationReason::SystemShutdown => "system_shutdown",
            CancellationReason::ServerCancelled => "server_cancelled",
            CancellationReason::Custom(s) => s,
        }
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for CancellationReason {
    fn from(s: &str) -> Self {
        match s {
            "timeout" => CancellationReason::Timeout,
            "user_cancelled" => CancellationReason::UserCancelled,
            "server_shutdown" => CancellationReason::ServerShutdown,
            "system_shutdown" => CancellationReason::SystemShutdown,
            "server_cancelled" => CancellationReason::ServerCancelled,
            other => CancellationReason::Custom(other.to_string()),
        }
    }
}

type TokenCallback = Box<dyn FnOnce(&CancellationReason) + Send>;

#[derive(Default)]
struct TokenState {
    cancelled: Option<(CancellationReason, DateTime<Utc>)>,
    callbacks: Vec<TokenCallback>,
}

struct TokenInner {
    state: Mutex<TokenState>,
    fired: watch::Sender<bool>,
}

/// Terminal once cancelled; the first reason wins
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (fired, _) = watch::channel(false);
        Self {
            inner: Arc::new(TokenInner {
                state: Mutex::new(TokenState::default()),
                fired,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TokenState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().cancelled.is_some()
    }

    pub fn reason(&self) -> Option<CancellationReason> {
        self.state().cancelled.as_ref().map(|(r, _)| r.clone())
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.state().cancelled.as_ref().map(|(_, t)| *t)
    }

    /// Cancel the token; returns `false` if it was already cancelled
    pub fn cancel(&self, reason: CancellationReason) -> bool {
        let callbacks = {
            let mut state = self.state();
            if state.cancelled.is_some() {
                return false;
            }
            state.cancelled = Some((reason.clone(), Utc::now()));
            std::mem::take(&mut state.callbacks)
        };
        self.inner.fired.send_replace(true);
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&reason))).is_err() {
                tracing::error!(reason = %reason, "Cancellation observer panicked");
            }
        }
        true
    }

    /// Run `f` once on cancellation, immediately if already cancelled
    pub fn on_cancelled(&self, f: impl FnOnce(&CancellationReason) + Send + 'static) {
        let reason = {
            let mut state = self.state();
            match &state.cancelled {
                Some((reason, _)) => reason.clone(),
                None => {
                    state.callbacks.push(Box::new(f));
                    return;
                }
            }
        };
        f(&reason);
    }

    /// Resolve once the token is cancelled
    pub async fn cancelled(&self) -> CancellationReason {
        let mut rx = self.inner.fired.subscribe();
        let _ = rx.wait_for(|fired| *fired).await;
        self.reason().unwrap_or(CancellationReason::UserCancelled)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Callback run when a registered request is cancelled
pub type OnCancel = Box<dyn FnOnce(&CancellationReason) + Send>;

/// Options for [`CancellationManager::register_request`]
#[derive(Default)]
pub struct RegisterOptions {
    /// Auto-cancel with [`CancellationReason::Timeout`] after this long
    pub timeout: Option<Duration>,
    pub on_cancel: Option<OnCancel>,
}

impl RegisterOptions {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_cancel(mut self, f: impl FnOnce(&CancellationReason) + Send + 'static) -> Self {
        self.on_cancel = Some(Box::new(f));
        self
    }
}

struct CancellableRequest {
    server_name: String,
    method: String,
    started: Instant,
    timeout: Option<Duration>,
    token: CancellationToken,
    on_cancel: Option<OnCancel>,
    timer: Option<JoinHandle<()>>,
}

/// Snapshot of one registered request
#[derive(Debug, Clone)]
pub struct CancellableInfo {
    pub id: RequestId,
    pub server_name: String,
    pub method: String,
    pub elapsed: Duration,
    pub timeout: Option<Duration>,
}

/// Outcome of cancelling one request
#[derive(Debug, Clone)]
pub struct CancellationResult {
    pub request_id: RequestId,
    pub server_name: String,
    pub method: String,
    pub reason: CancellationReason,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub enum CancellationEvent {
    Registered {
        id: RequestId,
        server: String,
        method: String,
    },
    Cancelled(CancellationResult),
    CallbackError {
        id: RequestId,
        error: String,
    },
}

impl CancellationEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CancellationEvent::Registered { .. } => "request:registered",
            CancellationEvent::Cancelled(_) => "request:cancelled",
            CancellationEvent::CallbackError { .. } => "callback:error",
        }
    }
}

struct Inner {
    requests: Mutex<HashMap<RequestId, CancellableRequest>>,
    events: broadcast::Sender<CancellationEvent>,
}

impl Inner {
    fn requests(&self) -> MutexGuard<'_, HashMap<RequestId, CancellableRequest>> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registry of cancellable in-flight operations
#[derive(Clone)]
pub struct CancellationManager {
    inner: Arc<Inner>,
}

impl CancellationManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                requests: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CancellationEvent> {
        self.inner.events.subscribe()
    }

    /// Register a cancellable request
    ///
    /// Returns `None` when `id` is already registered; the existing entry is
    /// left untouched.
    pub fn register_request(
        &self,
        id: RequestId,
        server_name: &str,
        method: &str,
        options: RegisterOptions,
    ) -> Option<CancellationToken> {
        let token = CancellationToken::new();
        {
            let mut requests = self.inner.requests();
            if requests.contains_key(&id) {
                tracing::warn!(id = %id, server = %server_name, "Request already registered for cancellation");
                return None;
            }

            let timer = options.timeout.map(|timeout| {
                let weak: Weak<Inner> = Arc::downgrade(&self.inner);
                let id = id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(inner) = weak.upgrade() {
                        CancellationManager { inner }.cancel_request(&id, CancellationReason::Timeout);
                    }
                })
            });

            requests.insert(
                id.clone(),
                CancellableRequest {
                    server_name: server_name.to_string(),
                    method: method.to_string(),
                    started: Instant::now(),
                    timeout: options.timeout,
                    token: token.clone(),
                    on_cancel: options.on_cancel,
                    timer,
                },
            );
        }

        tracing::debug!(id = %id, server = %server_name, method = %method, "Registered cancellable request");
        self.emit(CancellationEvent::Registered {
            id,
            server: server_name.to_string(),
            method: method.to_string(),
        });
        Some(token)
    }

    /// Remove a request that finished normally; its token is left uncancelled
    pub fn complete_request(&self, id: &RequestId) -> bool {
        match self.inner.requests().remove(id) {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Cancel one request; `None` (and no side effects) for unknown ids
    pub fn cancel_request(
        &self,
        id: &RequestId,
        reason: CancellationReason,
    ) -> Option<CancellationResult> {
        let entry = self.inner.requests().remove(id)?;
        if let Some(timer) = entry.timer {
            timer.abort();
        }

        entry.token.cancel(reason.clone());
        if let Some(on_cancel) = entry.on_cancel {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| on_cancel(&reason))) {
                let error = panic_message(panic.as_ref());
                tracing::error!(id = %id, error = %error, "on_cancel callback panicked");
                self.emit(CancellationEvent::CallbackError {
                    id: id.clone(),
                    error,
                });
            }
        }

        let result = CancellationResult {
            request_id: id.clone(),
            server_name: entry.server_name,
            method: entry.method,
            reason,
            elapsed: entry.started.elapsed(),
        };
        tracing::info!(
            id = %id,
            server = %result.server_name,
            method = %result.method,
            reason = %result.reason,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Request cancelled"
        );
        self.emit(CancellationEvent::Cancelled(result.clone()));
        Some(result)
    }

    pub fn cancel_server_requests(
        &self,
        server_name: &str,
        reason: CancellationReason,
    ) -> Vec<CancellationResult> {
        let ids: Vec<RequestId> = self
            .inner
            .requests()
            .iter()
            .filter(|(_, r)| r.server_name == server_name)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.cancel_request(id, reason.clone()))
            .collect()
    }

    pub fn cancel_all(&self, reason: CancellationReason) -> Vec<CancellationResult> {
        let ids: Vec<RequestId> = self.inner.requests().keys().cloned().collect();
        ids.iter()
            .filter_map(|id| self.cancel_request(id, reason.clone()))
            .collect()
    }

    /// Payload for the wire-level `notifications/cancelled` message
    pub fn create_cancellation_notification(
        &self,
        request_id: &RequestId,
        reason: &CancellationReason,
    ) -> JsonRpcNotification {
        let params = CancelledParams {
            request_id: request_id.clone(),
            reason: Some(reason.to_string()),
        };
        JsonRpcNotification::new(
            methods::NOTIFY_CANCELLED,
            serde_json::to_value(params).ok(),
        )
    }

    pub fn token(&self, id: &RequestId) -> Option<CancellationToken> {
        self.inner.requests().get(id).map(|r| r.token.clone())
    }

    pub fn is_registered(&self, id: &RequestId) -> bool {
        self.inner.requests().contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.requests().len()
    }

    /// Registered requests, optionally limited to one server
    pub fn active_requests(&self, server_name: Option<&str>) -> Vec<CancellableInfo> {
        self.inner
            .requests()
            .iter()
            .filter(|(_, r)| server_name.map_or(true, |s| r.server_name == s))
            .map(|(id, r)| CancellableInfo {
                id: id.clone(),
                server_name: r.server_name.clone(),
                method: r.method.clone(),
                elapsed: r.started.elapsed(),
                timeout: r.timeout,
            })
            .collect()
    }

    fn emit(&self, event: CancellationEvent) {
        let _ = self.inner.events.send(event);
    }
}

impl Default for CancellationManager {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_token_first_reason_wins() {
        let token = CancellationToken::new();
        assert!(token.cancel(CancellationReason::UserCancelled));
        let first_ts = token.timestamp().unwrap();

        assert!(!token.cancel(CancellationReason::Timeout));
        assert_eq!(token.reason(), Some(CancellationReason::UserCancelled));
        assert_eq!(token.timestamp(), Some(first_ts));
    }

    #[test]
    fn test_token_observer_runs_once() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        token.on_cancelled(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        token.cancel(CancellationReason::ServerShutdown);
        token.cancel(CancellationReason::ServerShutdown);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let late = Arc::new(AtomicUsize::new(0));
        let l = late.clone();
        token.on_cancelled(move |reason| {
            assert_eq!(reason, &CancellationReason::ServerShutdown);
            l.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(CancellationReason::Timeout.to_string(), "timeout");
        assert_eq!(CancellationReason::from("user_cancelled"), CancellationReason::UserCancelled);
        assert_eq!(
            CancellationReason::from("operator"),
            CancellationReason::Custom("operator".into())
        );
    }

    #[tokio::test]
    async fn test_timeout_auto_cancels_once() {
        let manager = CancellationManager::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let token = manager
            .register_request(
                "r1".into(),
                "fs",
                "tools/call",
                RegisterOptions::default()
                    .timeout(Duration::from_millis(10))
                    .on_cancel(move |_| {
                        c.fetch_add(1, Ordering::SeqCst);
                    }),
            )
            .unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
        assert_eq!(reason, CancellationReason::Timeout);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_is_noop() {
        let manager = CancellationManager::new();
        assert!(manager
            .cancel_request(&"missing".into(), CancellationReason::UserCancelled)
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let manager = CancellationManager::new();
        assert!(manager
            .register_request(RequestId::Number(1), "fs", "ping", RegisterOptions::default())
            .is_some());
        assert!(manager
            .register_request(RequestId::Number(1), "fs", "ping", RegisterOptions::default())
            .is_none());
        assert_eq!(manager.active_count(), 1);
    }

    #[tokio::test]
    async fn test_panicking_on_cancel_reported_as_event() {
        let manager = CancellationManager::new();
        let mut events = manager.subscribe();
        manager.register_request(
            "r".into(),
            "fs",
            "tools/call",
            RegisterOptions::default().on_cancel(|_| panic!("boom")),
        );

        let result = manager
            .cancel_request(&"r".into(), CancellationReason::UserCancelled)
            .unwrap();
        assert_eq!(result.reason, CancellationReason::UserCancelled);

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let CancellationEvent::CallbackError { error, .. } = event {
                assert!(error.contains("boom"));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_cancel_server_requests_scoped() {
        let manager = CancellationManager::new();
        manager.register_request("a".into(), "fs", "x", RegisterOptions::default());
        manager.register_request("b".into(), "fs", "y", RegisterOptions::default());
        manager.register_request("c".into(), "git", "z", RegisterOptions::default());

        let results = manager.cancel_server_requests("fs", CancellationReason::ServerShutdown);
        assert_eq!(results.len(), 2);
        assert_eq!(manager.active_count(), 1);
        assert!(manager.is_registered(&"c".into()));

        let rest = manager.cancel_all(CancellationReason::SystemShutdown);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].server_name, "git");
    }

    #[tokio::test]
    async fn test_complete_request_leaves_token_untouched() {
        let manager = CancellationManager::new();
        let token = manager
            .register_request(
                "r".into(),
                "fs",
                "x",
                RegisterOptions::default().timeout(Duration::from_millis(5)),
            )
            .unwrap();
        assert!(manager.complete_request(&"r".into()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancellation_notification_payload() {
        let manager = CancellationManager::new();
        let n = manager.create_cancellation_notification(&"req-9".into(), &CancellationReason::Timeout);
        assert_eq!(n.method, "notifications/cancelled");
        let params = n.params.unwrap();
        assert_eq!(params["requestId"], "req-9");
        assert_eq!(params["reason"], "timeout");
    }
}
