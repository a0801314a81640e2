//! Exactly-once cancellation
//!
//! Every cancelled operation delivers one `OperationCancelled` terminal,
//! whether it was cancelled before its work started or while sources were
//! still replying. Sources that were reached get their cancel hook called.

mod helpers;

use std::time::Duration;

use helpers::{init_test_logging, source_ref, MockSource};
use metafed_common::events::{EngineEvent, OperationOutcome};
use metafed_engine::{
    core, BrowseItem, Engine, EngineError, Media, OperationStream, Options, ResolutionFlags,
    SupportedOps,
};

/// Read a stream to its end, including anything after the terminal item
async fn drain(mut stream: OperationStream) -> Vec<BrowseItem> {
    let mut items = Vec::new();
    while let Some(item) = stream.next().await {
        items.push(item);
    }
    items
}

fn terminals(items: &[BrowseItem]) -> usize {
    items.iter().filter(|item| item.is_last()).count()
}

// ============================================================================
// Cancel before start
// ============================================================================

#[tokio::test]
async fn test_cancel_resolve_before_start() {
    init_test_logging();
    let engine = Engine::default();
    let local = MockSource::new("local", SupportedOps::RESOLVE)
        .provides(core::TITLE, "x")
        .build();
    engine.register_source(source_ref(&local), 0).unwrap();

    let handle = engine.resolve(None, Media::from_source("local", "1"), &[core::TITLE], Options::new());
    assert!(engine.cancel(handle.id()));
    assert!(!engine.cancel(handle.id()), "second cancel has no effect");

    assert_eq!(handle.wait().await, Err(EngineError::OperationCancelled));
    assert_eq!(local.resolve_count(), 0);
    assert!(engine.operations().is_empty());
}

#[tokio::test]
async fn test_cancel_browse_before_start() {
    let engine = Engine::default();
    let store = MockSource::new("store", SupportedOps::BROWSE).items(5).build();
    engine.register_source(source_ref(&store), 0).unwrap();
    let mut events = engine.events().subscribe();

    let stream = engine.browse(&source_ref(&store), None, &[], Options::new());
    let id = stream.id();
    assert!(engine.cancel(id));

    let items = drain(stream).await;
    assert_eq!(items, vec![BrowseItem::cancelled()]);
    assert!(store.calls().windows.is_empty());

    let mut started = None;
    let mut finished = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            EngineEvent::OperationCancelled { operation_id, started: s, .. } if operation_id == id => {
                started = Some(s)
            }
            EngineEvent::OperationFinished { operation_id, outcome, .. } if operation_id == id => {
                finished.push(outcome)
            }
            _ => {}
        }
    }
    assert_eq!(started, Some(false));
    assert_eq!(finished, vec![OperationOutcome::Cancelled]);
}

#[tokio::test]
async fn test_cancel_multiple_search_before_start() {
    let engine = Engine::default();
    let a = MockSource::new("a", SupportedOps::SEARCH).items(5).build();
    let b = MockSource::new("b", SupportedOps::SEARCH).items(5).build();
    engine.register_source(source_ref(&a), 1).unwrap();
    engine.register_source(source_ref(&b), 0).unwrap();

    let stream = engine.multiple_search(None, Some("x"), &[], Options::new().with_count(6));
    assert!(engine.cancel(stream.id()));

    let items = drain(stream).await;
    assert_eq!(items, vec![BrowseItem::cancelled()]);
    assert!(a.calls().windows.is_empty());
    assert!(b.calls().windows.is_empty());
}

// ============================================================================
// Cancel in flight
// ============================================================================

#[tokio::test]
async fn test_cancel_resolve_in_flight() {
    init_test_logging();
    let engine = Engine::default();
    let slow = MockSource::new("slow", SupportedOps::RESOLVE)
        .provides(core::TITLE, "x")
        .resolve_delay(Duration::from_millis(100))
        .with_cancel_hook()
        .build();
    engine.register_source(source_ref(&slow), 0).unwrap();
    let mut events = engine.events().subscribe();

    let handle = engine.resolve(None, Media::from_source("slow", "1"), &[core::TITLE], Options::new());
    let id = handle.id();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(engine.cancel(id));

    assert_eq!(handle.wait().await, Err(EngineError::OperationCancelled));
    assert_eq!(slow.resolve_count(), 1);
    assert_eq!(slow.cancel_count(), 1);

    let outcomes: Vec<OperationOutcome> = std::iter::from_fn(|| events.try_recv().ok())
        .filter_map(|event| match event {
            EngineEvent::OperationFinished { operation_id, outcome, .. } if operation_id == id => {
                Some(outcome)
            }
            _ => None,
        })
        .collect();
    assert_eq!(outcomes, vec![OperationOutcome::Cancelled]);
}

#[tokio::test]
async fn test_cancel_browse_in_flight() {
    let engine = Engine::default();
    let store = MockSource::new("store", SupportedOps::BROWSE)
        .items(10)
        .item_delay(Duration::from_millis(10))
        .with_cancel_hook()
        .build();
    engine.register_source(source_ref(&store), 0).unwrap();

    let mut stream = engine.browse(&source_ref(&store), None, &[], Options::new());
    let first = stream.next().await.unwrap();
    assert_eq!(first.remaining, 9);
    assert!(engine.cancel(stream.id()));

    let rest = drain(stream).await;
    assert_eq!(terminals(&rest), 1);
    assert_eq!(rest, vec![BrowseItem::cancelled()]);
    assert_eq!(store.cancel_count(), 1);
    assert!(engine.operations().is_empty());
}

#[tokio::test]
async fn test_buffered_items_dropped_after_cancel() {
    let engine = Engine::default();
    let store = MockSource::new("store", SupportedOps::BROWSE)
        .items(10)
        .item_delay(Duration::from_millis(5))
        .with_cancel_hook()
        .build();
    engine.register_source(source_ref(&store), 0).unwrap();

    let mut stream = engine.browse(&source_ref(&store), None, &[], Options::new());
    assert!(stream.next().await.unwrap().media.is_some());
    // Let a few more items queue up unread
    tokio::time::sleep(Duration::from_millis(12)).await;
    assert!(engine.cancel(stream.id()));

    let rest = drain(stream).await;
    let media_after_cancel = rest.iter().filter(|item| item.media.is_some()).count();
    assert_eq!(media_after_cancel, 0);
    assert_eq!(rest, vec![BrowseItem::cancelled()]);
}

#[tokio::test]
async fn test_buffered_multiple_search_items_dropped_after_cancel() {
    let engine = Engine::default();
    let a = MockSource::new("a", SupportedOps::SEARCH)
        .items(20)
        .item_delay(Duration::from_millis(5))
        .build();
    let b = MockSource::new("b", SupportedOps::SEARCH)
        .items(20)
        .item_delay(Duration::from_millis(5))
        .build();
    engine.register_source(source_ref(&a), 1).unwrap();
    engine.register_source(source_ref(&b), 0).unwrap();

    let mut stream = engine.multiple_search(None, Some("x"), &[], Options::new().with_count(30));
    assert!(stream.next().await.unwrap().media.is_some());
    tokio::time::sleep(Duration::from_millis(12)).await;
    assert!(engine.cancel(stream.id()));

    let rest = drain(stream).await;
    assert_eq!(rest, vec![BrowseItem::cancelled()]);
    assert!(engine.operations().is_empty());
}

#[tokio::test]
async fn test_cancel_multiple_search_in_flight() {
    let engine = Engine::default();
    let a = MockSource::new("a", SupportedOps::SEARCH)
        .items(20)
        .item_delay(Duration::from_millis(5))
        .with_cancel_hook()
        .build();
    let b = MockSource::new("b", SupportedOps::SEARCH)
        .items(20)
        .item_delay(Duration::from_millis(5))
        .with_cancel_hook()
        .build();
    engine.register_source(source_ref(&a), 1).unwrap();
    engine.register_source(source_ref(&b), 0).unwrap();

    let mut stream = engine.multiple_search(None, Some("x"), &[], Options::new().with_count(30));
    let first = stream.next().await.unwrap();
    assert!(first.media.is_some());
    assert!(engine.cancel(stream.id()));

    let rest = drain(stream).await;
    assert_eq!(terminals(&rest), 1);
    assert_eq!(rest, vec![BrowseItem::cancelled()]);
    assert_eq!(a.cancel_count(), 1);
    assert_eq!(b.cancel_count(), 1);
    assert!(engine.operations().is_empty());
}

#[tokio::test]
async fn test_cancel_reaches_decoration_sub_resolves() {
    let engine = Engine::default();
    let store = MockSource::new("store", SupportedOps::BROWSE).items(3).build();
    let enricher = MockSource::new("enricher", SupportedOps::RESOLVE)
        .provides(core::ARTIST, "x")
        .resolve_delay(Duration::from_millis(200))
        .with_cancel_hook()
        .build();
    engine.register_source(source_ref(&store), 1).unwrap();
    engine.register_source(source_ref(&enricher), 0).unwrap();

    let options = Options::new().with_flags(ResolutionFlags::FULL);
    let stream = engine.browse(&source_ref(&store), None, &[core::ARTIST], options);
    let id = stream.id();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.cancel(id));

    let items = drain(stream).await;
    assert_eq!(items, vec![BrowseItem::cancelled()]);
    assert!(enricher.cancel_count() >= 1);
    assert!(engine.operations().is_empty());
}

#[tokio::test]
async fn test_cancel_after_completion_is_rejected() {
    let engine = Engine::default();
    let local = MockSource::new("local", SupportedOps::RESOLVE)
        .provides(core::TITLE, "x")
        .build();
    engine.register_source(source_ref(&local), 0).unwrap();

    let handle = engine.resolve(None, Media::from_source("local", "1"), &[core::TITLE], Options::new());
    let id = handle.id();
    assert!(handle.wait().await.is_ok());
    assert!(!engine.cancel(id));
}
