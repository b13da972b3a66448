use std::sync::Arc;

use slotloader_service::{RequestOutcome, SlotContent, TaskState};

use crate::{cached, next_completion, placeholder, resource, resource_for, setup_coordinator, shown};

#[tokio::test]
async fn test_new_key_cancels_previous_load() {
    let (mut coordinator, loader) = setup_coordinator(|builder| builder);
    let _gate = loader.open_on_drop();
    let slot = coordinator.create_slot();

    coordinator.request_load("k1".into(), slot).unwrap();
    loader.wait_for_calls(1);

    let outcome = coordinator.request_load("k2".into(), slot).unwrap();
    assert_eq!(outcome, RequestOutcome::LoadStarted);
    assert_eq!(shown(&coordinator, slot), placeholder());

    loader.release("k2", "R2");
    assert!(next_completion(&mut coordinator).await);
    assert_eq!(shown(&coordinator, slot), resource("R2"));

    // the slow load for k1 finishes last, and must neither show up nor be cached
    loader.release("k1", "R1");
    assert!(next_completion(&mut coordinator).await);
    assert_eq!(shown(&coordinator, slot), resource("R2"));
    assert_eq!(cached(&coordinator, "k1"), None);
    assert_eq!(cached(&coordinator, "k2"), Some(Some("R2".to_owned())));
    assert_eq!(coordinator.pending(), 0);
}

#[tokio::test]
async fn test_explicit_cancel() {
    let (mut coordinator, loader) = setup_coordinator(|builder| builder);
    let _gate = loader.open_on_drop();
    let slot = coordinator.create_slot();

    coordinator.request_load("k".into(), slot).unwrap();
    loader.wait_for_calls(1);

    assert!(coordinator.cancel(slot));
    assert!(!coordinator.cancel(slot));
    assert_eq!(coordinator.slot_task_state(slot), None);
    assert_eq!(shown(&coordinator, slot), placeholder());

    loader.release("k", "K");
    assert!(next_completion(&mut coordinator).await);
    assert_eq!(shown(&coordinator, slot), placeholder());
    assert_eq!(cached(&coordinator, "k"), None);

    // nothing is loading anymore, so the same key starts over
    let outcome = coordinator.request_load("k".into(), slot).unwrap();
    assert_eq!(outcome, RequestOutcome::LoadStarted);
    loader.release("k", "K");
    assert!(next_completion(&mut coordinator).await);
    assert_eq!(shown(&coordinator, slot), resource("K"));
    assert_eq!(loader.call_count("k"), 2);
}

#[tokio::test]
async fn test_cache_hit_supersedes_running_load() {
    let (mut coordinator, loader) = setup_coordinator(|builder| builder);
    let _gate = loader.open_on_drop();
    let slot = coordinator.create_slot();

    coordinator
        .cache()
        .put_if_absent("b".to_owned(), Some(Arc::new("B".to_owned())));

    coordinator.request_load("a".into(), slot).unwrap();
    loader.wait_for_calls(1);

    let outcome = coordinator.request_load("b".into(), slot).unwrap();
    assert_eq!(outcome, RequestOutcome::CacheHit);
    assert_eq!(shown(&coordinator, slot), resource("B"));
    assert_eq!(coordinator.slot_task_state(slot), None);

    // the load is not cancelled, its result still ends up in the cache
    loader.release("a", "A");
    assert!(next_completion(&mut coordinator).await);
    assert_eq!(shown(&coordinator, slot), resource("B"));
    assert_eq!(cached(&coordinator, "a"), Some(Some("A".to_owned())));
}

#[tokio::test]
async fn test_destroyed_slot_ignores_completion() {
    let (mut coordinator, loader) = setup_coordinator(|builder| builder);
    let _gate = loader.open_on_drop();
    let slot = coordinator.create_slot();

    coordinator.request_load("k".into(), slot).unwrap();
    loader.wait_for_calls(1);
    assert!(coordinator.destroy_slot(slot));

    // reuses the storage of the destroyed slot
    let reused = coordinator.create_slot();
    assert_ne!(reused, slot);

    loader.release("k", "K");
    assert!(next_completion(&mut coordinator).await);

    assert_eq!(coordinator.slot_content(slot), None);
    assert_eq!(shown(&coordinator, reused), SlotContent::Empty);
    assert_eq!(cached(&coordinator, "k"), Some(Some("K".to_owned())));

    let outcome = coordinator.request_load("k".into(), reused).unwrap();
    assert_eq!(outcome, RequestOutcome::CacheHit);
    assert_eq!(shown(&coordinator, reused), resource("K"));
}

#[tokio::test]
async fn test_replaced_task_is_cancelled() {
    let (mut coordinator, loader) = setup_coordinator(|builder| builder);
    let _gate = loader.open_on_drop();
    let slot = coordinator.create_slot();

    coordinator.request_load("k1".into(), slot).unwrap();
    loader.wait_for_calls(1);
    coordinator.request_load("k2".into(), slot).unwrap();
    loader.wait_for_calls(2);

    assert_eq!(coordinator.slot_task_state(slot), Some(TaskState::Running));
    assert_eq!(coordinator.pending(), 2);

    loader.open();
    assert!(next_completion(&mut coordinator).await);
    assert!(next_completion(&mut coordinator).await);
    assert!(!coordinator.next_completion().await);
    assert_eq!(loader.calls(), vec!["k1", "k2"]);
}

#[test]
fn test_task_cancelled_before_start_never_loads() {
    // a single blocking thread, so queued loads wait behind the first one
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .max_blocking_threads(1)
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let (mut coordinator, loader) = setup_coordinator(|builder| builder);
        let _gate = loader.open_on_drop();
        let busy = coordinator.create_slot();
        let slot = coordinator.create_slot();

        coordinator.request_load("a".into(), busy).unwrap();
        loader.wait_for_calls(1);

        // both queued behind "a", and "k1" is cancelled by the replacing request
        coordinator.request_load("k1".into(), slot).unwrap();
        coordinator.request_load("k2".into(), slot).unwrap();
        assert_eq!(coordinator.pending(), 3);

        loader.open();
        for _ in 0..3 {
            assert!(next_completion(&mut coordinator).await);
        }

        assert_eq!(loader.call_count("k1"), 0);
        assert_eq!(loader.calls(), vec!["a", "k2"]);
        assert_eq!(cached(&coordinator, "k1"), None);
        assert_eq!(shown(&coordinator, slot), resource(&resource_for("k2")));
    });
}
