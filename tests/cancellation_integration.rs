//! Cancellation integration tests
//!
//! Timeout-driven cancellation, shutdown cascades and the event stream seen
//! by subscribers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use a3s_mcp::protocol::RequestId;
use a3s_mcp::{CancellationEvent, CancellationManager, CancellationReason, RegisterOptions};

fn id(s: &str) -> RequestId {
    RequestId::String(s.to_string())
}

// ─── Timeouts ────────────────────────────────────────────────────

#[tokio::test]
async fn test_timeout_cancels_once_and_fires_callback_once() {
    let manager = CancellationManager::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let token = manager
        .register_request(
            id("t-1"),
            "fs",
            "tools/call",
            RegisterOptions::default()
                .timeout(Duration::from_millis(10))
                .on_cancel(move |reason| {
                    assert_eq!(*reason, CancellationReason::Timeout);
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap();

    let reason = tokio::time::timeout(Duration::from_secs(2), token.cancelled())
        .await
        .unwrap();
    assert_eq!(reason, CancellationReason::Timeout);
    assert!(!manager.is_registered(&id("t-1")));

    // Cancelling again is a no-op
    assert!(manager
        .cancel_request(&id("t-1"), CancellationReason::UserCancelled)
        .is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(token.reason(), Some(CancellationReason::Timeout));
}

#[tokio::test]
async fn test_completed_request_never_times_out() {
    let manager = CancellationManager::new();
    let token = manager
        .register_request(
            id("done"),
            "fs",
            "ping",
            RegisterOptions::default().timeout(Duration::from_millis(10)),
        )
        .unwrap();

    assert!(manager.complete_request(&id("done")));
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(!token.is_cancelled());
    assert_eq!(manager.active_count(), 0);
}

// ─── Cascades ────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_shutdown_only_touches_that_server() {
    let manager = CancellationManager::new();
    let a1 = manager
        .register_request(id("a1"), "alpha", "tools/call", RegisterOptions::default())
        .unwrap();
    let a2 = manager
        .register_request(id("a2"), "alpha", "resources/read", RegisterOptions::default())
        .unwrap();
    let b1 = manager
        .register_request(id("b1"), "beta", "tools/call", RegisterOptions::default())
        .unwrap();

    let results = manager.cancel_server_requests("alpha", CancellationReason::ServerShutdown);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.server_name == "alpha"));
    assert!(a1.is_cancelled() && a2.is_cancelled());
    assert!(!b1.is_cancelled());
    assert_eq!(manager.active_requests(Some("beta")).len(), 1);

    let rest = manager.cancel_all(CancellationReason::SystemShutdown);
    assert_eq!(rest.len(), 1);
    assert_eq!(b1.reason(), Some(CancellationReason::SystemShutdown));
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test]
async fn test_subscribers_see_register_then_cancel() {
    let manager = CancellationManager::new();
    let mut events = manager.subscribe();

    manager
        .register_request(id("e1"), "fs", "tools/call", RegisterOptions::default())
        .unwrap();
    manager.cancel_request(&id("e1"), CancellationReason::UserCancelled);

    let first = events.recv().await.unwrap();
    assert!(matches!(first, CancellationEvent::Registered { .. }));
    match events.recv().await.unwrap() {
        CancellationEvent::Cancelled(result) => {
            assert_eq!(result.request_id, id("e1"));
            assert_eq!(result.reason, CancellationReason::UserCancelled);
        }
        other => panic!("unexpected event: {}", other.name()),
    }
}

#[tokio::test]
async fn test_panicking_callback_does_not_block_cancellation() {
    let manager = CancellationManager::new();
    let mut events = manager.subscribe();
    let token = manager
        .register_request(
            id("p1"),
            "fs",
            "tools/call",
            RegisterOptions::default().on_cancel(|_| panic!("callback exploded")),
        )
        .unwrap();

    let result = manager
        .cancel_request(&id("p1"), CancellationReason::UserCancelled)
        .unwrap();
    assert_eq!(result.method, "tools/call");
    assert!(token.is_cancelled());

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if let CancellationEvent::CallbackError { error, .. } = event {
            assert!(error.contains("callback exploded"));
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[test]
fn test_wire_notification_carries_id_and_reason() {
    let manager = CancellationManager::new();
    let n = manager.create_cancellation_notification(&id("w1"), &CancellationReason::Timeout);
    assert_eq!(n.method, "notifications/cancelled");
    let params = n.params.unwrap();
    assert_eq!(params["requestId"], "w1");
    assert_eq!(params["reason"], "timeout");
}
