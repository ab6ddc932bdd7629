//! Inbound notification routing
//!
//! Classifies one-way messages from servers, tracks progress per
//! `(server, token)`, keeps a bounded history and fans out to handlers.
//!
//! Progress completion is inferred: a stream is complete when
//! `progress >= total` or `progress == 100`. A server that never sends a
//! terminal value leaves its entry in place until [`NotificationRouter::cancel_progress`]
//! or [`NotificationRouter::clear_server`].

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::cancellation::panic_message;
use crate::error::Result;
use crate::protocol::types::{
    methods, CancelledParams, ProgressParams, ProgressToken, RequestId, ResourceUpdatedParams,
};

/// Default number of records kept in history
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Closed set of notification kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    Progress,
    Cancelled,
    ResourcesListChanged,
    ToolsListChanged,
    PromptsListChanged,
    RootsListChanged,
    ResourceUpdated,
    Custom,
}

impl NotificationType {
    pub fn from_method(method: &str) -> Self {
        match method {
            methods::NOTIFY_PROGRESS => NotificationType::Progress,
            methods::NOTIFY_CANCELLED => NotificationType::Cancelled,
            methods::NOTIFY_RESOURCES_LIST_CHANGED => NotificationType::ResourcesListChanged,
            methods::NOTIFY_TOOLS_LIST_CHANGED => NotificationType::ToolsListChanged,
            methods::NOTIFY_PROMPTS_LIST_CHANGED => NotificationType::PromptsListChanged,
            methods::NOTIFY_ROOTS_LIST_CHANGED => NotificationType::RootsListChanged,
            methods::NOTIFY_RESOURCES_UPDATED => NotificationType::ResourceUpdated,
            _ => NotificationType::Custom,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Progress => "progress",
            NotificationType::Cancelled => "cancelled",
            NotificationType::ResourcesListChanged => "resources_list_changed",
            NotificationType::ToolsListChanged => "tools_list_changed",
            NotificationType::PromptsListChanged => "prompts_list_changed",
            NotificationType::RootsListChanged => "roots_list_changed",
            NotificationType::ResourceUpdated => "resource_updated",
            NotificationType::Custom => "custom",
        }
    }

    pub fn is_list_changed(&self) -> bool {
        matches!(
            self,
            NotificationType::ResourcesListChanged
                | NotificationType::ToolsListChanged
                | NotificationType::PromptsListChanged
                | NotificationType::RootsListChanged
        )
    }
}

/// Immutable history entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    #[serde(rename = "type")]
    pub notification_type: NotificationType,
    pub server_name: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Tracking state for one progress token
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub server_name: String,
    pub token: ProgressToken,
    pub progress: f64,
    pub total: Option<f64>,
    pub message: Option<String>,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl ProgressState {
    pub fn is_complete(&self) -> bool {
        self.total.is_some_and(|total| self.progress >= total)
            || (self.progress - 100.0).abs() < f64::EPSILON
    }
}

#[derive(Debug, Clone)]
pub enum RouterEvent {
    Notification(NotificationRecord),
    Progress(ProgressState),
    ProgressComplete(ProgressState),
    ListChanged {
        server: String,
        list: NotificationType,
    },
    ResourceUpdated {
        server: String,
        uri: String,
    },
    Cancelled {
        server: String,
        request_id: RequestId,
        reason: Option<String>,
    },
    HandlerError {
        notification_type: NotificationType,
        handler: HandlerId,
        error: String,
    },
}

impl RouterEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RouterEvent::Notification(_) => "notification",
            RouterEvent::Progress(_) => "progress",
            RouterEvent::ProgressComplete(_) => "progress:complete",
            RouterEvent::ListChanged { .. } => "list:changed",
            RouterEvent::ResourceUpdated { .. } => "resource:updated",
            RouterEvent::Cancelled { .. } => "cancelled",
            RouterEvent::HandlerError { .. } => "handler:error",
        }
    }
}

/// Query for [`NotificationRouter::history`]
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub server_name: Option<String>,
    pub notification_type: Option<NotificationType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Keep only the newest `limit` matches
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn server(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn kind(mut self, notification_type: NotificationType) -> Self {
        self.notification_type = Some(notification_type);
        self
    }

    pub fn since(mut self, t: DateTime<Utc>) -> Self {
        self.since = Some(t);
        self
    }

    pub fn until(mut self, t: DateTime<Utc>) -> Self {
        self.until = Some(t);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    fn matches(&self, record: &NotificationRecord) -> bool {
        self.server_name
            .as_deref()
            .map_or(true, |s| record.server_name == s)
            && self
                .notification_type
                .map_or(true, |t| record.notification_type == t)
            && self.since.map_or(true, |t| record.timestamp >= t)
            && self.until.map_or(true, |t| record.timestamp <= t)
    }
}

/// Identifies a registered handler for [`NotificationRouter::off`]
pub type HandlerId = u64;

type Handler = Arc<dyn Fn(NotificationRecord) -> BoxFuture<'static, Result<()>> + Send + Sync>;
type ProgressCallback = Arc<dyn Fn(&ProgressState) + Send + Sync>;

struct RouterState {
    history: VecDeque<NotificationRecord>,
    progress: HashMap<(String, ProgressToken), ProgressState>,
    handlers: HashMap<NotificationType, Vec<(HandlerId, Handler)>>,
    progress_callbacks: HashMap<String, ProgressCallback>,
}

pub struct NotificationRouter {
    state: Mutex<RouterState>,
    capacity: usize,
    next_handler: AtomicU64,
    events: broadcast::Sender<RouterEvent>,
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Mutex::new(RouterState {
                history: VecDeque::with_capacity(capacity.min(1024)),
                progress: HashMap::new(),
                handlers: HashMap::new(),
                progress_callbacks: HashMap::new(),
            }),
            capacity: capacity.max(1),
            next_handler: AtomicU64::new(1),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RouterEvent) {
        let _ = self.events.send(event);
    }

    fn state(&self) -> MutexGuard<'_, RouterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an async handler for one notification type
    pub fn on<F, Fut>(&self, notification_type: NotificationType, handler: F) -> HandlerId
    where
        F: Fn(NotificationRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = self.next_handler.fetch_add(1, Ordering::SeqCst);
        let handler: Handler = Arc::new(move |record| handler(record).boxed());
        self.state()
            .handlers
            .entry(notification_type)
            .or_default()
            .push((id, handler));
        id
    }

    pub fn off(&self, id: HandlerId) -> bool {
        let mut state = self.state();
        let mut removed = false;
        for handlers in state.handlers.values_mut() {
            let before = handlers.len();
            handlers.retain(|(h, _)| *h != id);
            removed |= handlers.len() != before;
        }
        removed
    }

    /// One progress callback per server; a later registration replaces it
    pub fn on_progress(
        &self,
        server_name: &str,
        callback: impl Fn(&ProgressState) + Send + Sync + 'static,
    ) {
        self.state()
            .progress_callbacks
            .insert(server_name.to_string(), Arc::new(callback));
    }

    /// Classify, record, run built-in handling, then fan out to handlers
    pub async fn handle_notification(
        &self,
        server_name: &str,
        method: &str,
        params: Option<Value>,
    ) -> NotificationType {
        let notification_type = NotificationType::from_method(method);
        let record = NotificationRecord {
            notification_type,
            server_name: server_name.to_string(),
            timestamp: Utc::now(),
            method: method.to_string(),
            params,
        };

        let handlers: Vec<(HandlerId, Handler)> = {
            let mut state = self.state();
            state.history.push_back(record.clone());
            while state.history.len() > self.capacity {
                state.history.pop_front();
            }
            state
                .handlers
                .get(&notification_type)
                .cloned()
                .unwrap_or_default()
        };

        tracing::debug!(
            server = %server_name,
            method = %method,
            kind = notification_type.as_str(),
            "MCP notification"
        );
        self.emit(RouterEvent::Notification(record.clone()));

        match notification_type {
            NotificationType::Progress => self.track_progress(&record),
            NotificationType::Cancelled => {
                match parse_params::<CancelledParams>(&record) {
                    Some(p) => self.emit(RouterEvent::Cancelled {
                        server: server_name.to_string(),
                        request_id: p.request_id,
                        reason: p.reason,
                    }),
                    None => tracing::warn!(server = %server_name, "Malformed cancelled notification"),
                }
            }
            NotificationType::ResourceUpdated => match parse_params::<ResourceUpdatedParams>(&record) {
                Some(p) => self.emit(RouterEvent::ResourceUpdated {
                    server: server_name.to_string(),
                    uri: p.uri,
                }),
                None => tracing::warn!(server = %server_name, "Malformed resources/updated notification"),
            },
            t if t.is_list_changed() => self.emit(RouterEvent::ListChanged {
                server: server_name.to_string(),
                list: t,
            }),
            _ => {}
        }

        self.dispatch(notification_type, record, handlers).await;
        notification_type
    }

    async fn dispatch(
        &self,
        notification_type: NotificationType,
        record: NotificationRecord,
        handlers: Vec<(HandlerId, Handler)>,
    ) {
        if handlers.is_empty() {
            return;
        }
        let runs = handlers.into_iter().map(|(id, handler)| {
            let record = record.clone();
            async move {
                let outcome = match catch_unwind(AssertUnwindSafe(|| handler(record))) {
                    Ok(fut) => AssertUnwindSafe(fut)
                        .catch_unwind()
                        .await
                        .map_err(|p| panic_message(p.as_ref())),
                    Err(p) => Err(panic_message(p.as_ref())),
                };
                let error = match outcome {
                    Ok(Ok(())) => return None,
                    Ok(Err(e)) => e.to_string(),
                    Err(panic) => format!("handler panicked: {panic}"),
                };
                Some((id, error))
            }
        });

        for (handler, error) in join_all(runs).await.into_iter().flatten() {
            tracing::error!(
                kind = notification_type.as_str(),
                handler,
                error = %error,
                "Notification handler failed"
            );
            self.emit(RouterEvent::HandlerError {
                notification_type,
                handler,
                error,
            });
        }
    }

    fn track_progress(&self, record: &NotificationRecord) {
        let Some(params) = parse_params::<ProgressParams>(record) else {
            tracing::warn!(server = %record.server_name, "Malformed progress notification");
            return;
        };
        let key = (record.server_name.clone(), params.progress_token.clone());

        let (snapshot, callback) = {
            let mut state = self.state();
            let entry = state
                .progress
                .entry(key.clone())
                .or_insert_with(|| ProgressState {
                    server_name: record.server_name.clone(),
                    token: params.progress_token.clone(),
                    progress: 0.0,
                    total: None,
                    message: None,
                    start_time: record.timestamp,
                    last_update: record.timestamp,
                });
            entry.progress = params.progress;
            if params.total.is_some() {
                entry.total = params.total;
            }
            if params.message.is_some() {
                entry.message = params.message;
            }
            entry.last_update = record.timestamp;
            let snapshot = entry.clone();
            if snapshot.is_complete() {
                state.progress.remove(&key);
            }
            (
                snapshot,
                state.progress_callbacks.get(&record.server_name).cloned(),
            )
        };

        self.emit(RouterEvent::Progress(snapshot.clone()));
        if let Some(callback) = callback {
            if let Err(p) = catch_unwind(AssertUnwindSafe(|| callback(&snapshot))) {
                let error = panic_message(p.as_ref());
                tracing::error!(server = %snapshot.server_name, error = %error, "Progress callback panicked");
                self.emit(RouterEvent::HandlerError {
                    notification_type: NotificationType::Progress,
                    handler: 0,
                    error,
                });
            }
        }
        if snapshot.is_complete() {
            tracing::debug!(server = %snapshot.server_name, token = %snapshot.token, "Progress complete");
            self.emit(RouterEvent::ProgressComplete(snapshot));
        }
    }

    /// Drop tracking for one token; `false` if it was not tracked
    pub fn cancel_progress(&self, server_name: &str, token: &ProgressToken) -> bool {
        self.state()
            .progress
            .remove(&(server_name.to_string(), token.clone()))
            .is_some()
    }

    pub fn progress_state(&self, server_name: &str, token: &ProgressToken) -> Option<ProgressState> {
        self.state()
            .progress
            .get(&(server_name.to_string(), token.clone()))
            .cloned()
    }

    pub fn progress_states(&self, server_name: Option<&str>) -> Vec<ProgressState> {
        let mut states: Vec<ProgressState> = self
            .state()
            .progress
            .values()
            .filter(|p| server_name.map_or(true, |s| p.server_name == s))
            .cloned()
            .collect();
        states.sort_by_key(|p| p.start_time);
        states
    }

    /// Matching records, oldest first
    pub fn history(&self, filter: &HistoryFilter) -> Vec<NotificationRecord> {
        let state = self.state();
        let matched: Vec<&NotificationRecord> =
            state.history.iter().filter(|r| filter.matches(r)).collect();
        let skip = filter
            .limit
            .map_or(0, |n| matched.len().saturating_sub(n));
        matched.into_iter().skip(skip).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.state().history.len()
    }

    pub fn clear_history(&self) {
        self.state().history.clear();
    }

    /// Forget progress tracking and the progress callback for a server
    pub fn clear_server(&self, server_name: &str) {
        let mut state = self.state();
        state.progress.retain(|(s, _), _| s != server_name);
        state.progress_callbacks.remove(server_name);
    }
}

impl Default for NotificationRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(record: &NotificationRecord) -> Option<T> {
    record
        .params
        .clone()
        .and_then(|p| serde_json::from_value(p).ok())
}
