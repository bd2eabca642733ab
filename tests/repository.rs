//! Ref-counted handler repository behavior: deduplication, load-once,
//! teardown on last release.

mod common;

use common::CountingHandler;
use modelmux::handler::InferenceHandler;
use modelmux::repository::{Fingerprint, HandlerRepository};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn fingerprint(tag: &str) -> Fingerprint {
    Fingerprint::of(&json!({ "model": tag })).unwrap()
}

#[tokio::test]
async fn concurrent_starts_load_once_and_share_the_handler() {
    let repository = Arc::new(HandlerRepository::new());
    let loads = Arc::new(AtomicUsize::new(0));
    let fp = fingerprint("shared");

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let repository = Arc::clone(&repository);
        let loads = Arc::clone(&loads);
        tasks.push(tokio::spawn(async move {
            repository
                .get_or_create(fp, move || {
                    Ok(Arc::new(CountingHandler {
                        loads,
                        load_delay: Some(Duration::from_millis(20)),
                        ..CountingHandler::default()
                    }))
                })
                .await
                .unwrap()
        }));
    }

    let mut handlers: Vec<Arc<dyn InferenceHandler>> = Vec::new();
    for task in tasks {
        handlers.push(task.await.unwrap());
    }

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(repository.len().await, 1);
    assert_eq!(repository.usage(fp).await, 16);
    let first = Arc::as_ptr(&handlers[0]);
    assert!(handlers.iter().all(|h| std::ptr::eq(Arc::as_ptr(h), first)));
}

#[tokio::test]
async fn close_runs_exactly_once_on_last_release() {
    let repository = HandlerRepository::new();
    let closes = Arc::new(AtomicUsize::new(0));
    let fp = fingerprint("refcounted");

    for _ in 0..3 {
        let closes = Arc::clone(&closes);
        repository
            .get_or_create(fp, move || {
                Ok(Arc::new(CountingHandler {
                    closes,
                    ..CountingHandler::default()
                }))
            })
            .await
            .unwrap();
    }
    assert_eq!(repository.usage(fp).await, 3);

    repository.release(fp).await;
    repository.release(fp).await;
    assert_eq!(closes.load(Ordering::SeqCst), 0);
    assert_eq!(repository.usage(fp).await, 1);

    repository.release(fp).await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(repository.is_empty().await);
}

#[tokio::test]
async fn release_of_unknown_fingerprint_is_a_noop() {
    let repository = HandlerRepository::new();
    repository.release(fingerprint("never-started")).await;
    assert!(repository.is_empty().await);
}

#[tokio::test]
async fn distinct_fingerprints_get_distinct_handlers() {
    let repository = HandlerRepository::new();
    let loads = Arc::new(AtomicUsize::new(0));

    for tag in ["a", "b"] {
        let loads = Arc::clone(&loads);
        repository
            .get_or_create(fingerprint(tag), move || {
                Ok(Arc::new(CountingHandler {
                    loads,
                    ..CountingHandler::default()
                }))
            })
            .await
            .unwrap();
    }

    assert_eq!(loads.load(Ordering::SeqCst), 2);
    assert_eq!(repository.len().await, 2);
}

#[tokio::test]
async fn failed_load_rolls_back_and_allows_retry() {
    let repository = HandlerRepository::new();
    let fp = fingerprint("flaky");

    let err = repository
        .get_or_create(fp, || {
            Ok(Arc::new(CountingHandler {
                fail_load: true,
                ..CountingHandler::default()
            }))
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), 400);
    assert!(repository.is_empty().await);

    // The failed attempt left no entry behind; a retry loads fresh.
    let loads = Arc::new(AtomicUsize::new(0));
    let retry_loads = Arc::clone(&loads);
    repository
        .get_or_create(fp, move || {
            Ok(Arc::new(CountingHandler {
                loads: retry_loads,
                ..CountingHandler::default()
            }))
        })
        .await
        .unwrap();
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(repository.usage(fp).await, 1);
}

#[tokio::test]
async fn drain_tears_down_everything() {
    let repository = HandlerRepository::new();
    let closes = Arc::new(AtomicUsize::new(0));

    for tag in ["x", "y"] {
        let closes = Arc::clone(&closes);
        repository
            .get_or_create(fingerprint(tag), move || {
                Ok(Arc::new(CountingHandler {
                    closes,
                    ..CountingHandler::default()
                }))
            })
            .await
            .unwrap();
    }

    repository.drain().await;
    assert_eq!(closes.load(Ordering::SeqCst), 2);
    assert!(repository.is_empty().await);
}
