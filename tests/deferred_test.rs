//! Tests for the single-shot deferred future.

use std::time::Duration;

use fetchq::deferred::{Deferred, DeferredState};
use fetchq::error::Error;

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resolve_delivers_value_to_waiter() {
    let deferred: Deferred<String> = Deferred::new();
    let waiter = deferred.clone();

    let handle = tokio::spawn(async move { waiter.wait().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(deferred.resolve("done".to_string()));

    let value = handle.await.unwrap().unwrap();
    assert_eq!(value, "done");
    assert_eq!(deferred.state(), DeferredState::Resolved);
}

#[tokio::test]
async fn all_waiters_observe_same_outcome() {
    let deferred: Deferred<u32> = Deferred::new();
    let a = deferred.clone();
    let b = deferred.clone();

    let first = tokio::spawn(async move { a.wait().await });
    let second = tokio::spawn(async move { b.wait().await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    deferred.resolve(42);

    assert_eq!(first.await.unwrap().unwrap(), 42);
    assert_eq!(second.await.unwrap().unwrap(), 42);
}

#[tokio::test]
async fn reject_delivers_error() {
    let deferred: Deferred<u32> = Deferred::new();
    deferred.reject(Error::Aborted);

    let result = deferred.wait().await;
    assert!(matches!(result, Err(Error::Aborted)));
    assert!(deferred.is_rejected());
}

#[tokio::test]
async fn settlement_is_exactly_once() {
    let deferred: Deferred<u32> = Deferred::new();

    assert!(deferred.resolve(1));
    assert!(!deferred.resolve(2));
    assert!(!deferred.reject(Error::Aborted));

    // First settlement wins.
    assert_eq!(deferred.wait().await.unwrap(), 1);
    assert_eq!(deferred.state(), DeferredState::Resolved);
}

#[tokio::test]
async fn wait_after_settlement_returns_immediately() {
    let deferred: Deferred<u32> = Deferred::new();
    deferred.resolve(7);
    assert_eq!(deferred.wait().await.unwrap(), 7);
}

// ---------------------------------------------------------------------------
// Timeout race
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeout_rejects_if_still_pending() {
    let deferred: Deferred<u32> = Deferred::new();
    deferred.start_timeout(Duration::from_millis(50));

    let result = deferred.wait().await;
    assert!(matches!(result, Err(Error::Timeout(50))));
}

#[tokio::test]
async fn timeout_is_noop_after_resolution() {
    let deferred: Deferred<u32> = Deferred::new();
    deferred.start_timeout(Duration::from_millis(50));
    deferred.resolve(5);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(deferred.is_resolved());
    assert_eq!(deferred.wait().await.unwrap(), 5);
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn state_accessors_track_lifecycle() {
    let deferred: Deferred<u32> = Deferred::new();
    assert!(deferred.is_pending());
    assert!(!deferred.is_settled());
    assert!(deferred.settled_for().is_none());

    deferred.resolve(1);
    assert!(deferred.is_settled());
    assert!(deferred.settled_for().is_some());
}

#[tokio::test]
async fn clones_share_one_settlement() {
    let deferred: Deferred<u32> = Deferred::new();
    let other = deferred.clone();
    assert!(deferred.ptr_eq(&other));

    other.resolve(9);
    assert!(deferred.is_resolved());
}
