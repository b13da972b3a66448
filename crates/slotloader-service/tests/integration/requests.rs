use slotloader_service::{RequestOutcome, SlotContent, TaskState};

use crate::{cached, next_completion, placeholder, resource, resource_for, setup_coordinator, shown};

#[tokio::test]
async fn test_load_then_cache_hit() {
    let (mut coordinator, loader) =
        setup_coordinator(|builder| builder.max_weight(20).weigher(|_k, _v| 10));
    let _gate = loader.open_on_drop();

    let first = coordinator.create_slot();
    let second = coordinator.create_slot();
    assert_eq!(shown(&coordinator, first), SlotContent::Empty);

    let outcome = coordinator.request_load("x".into(), first).unwrap();
    assert_eq!(outcome, RequestOutcome::LoadStarted);
    assert_eq!(shown(&coordinator, first), placeholder());
    assert!(matches!(
        coordinator.slot_task_state(first),
        Some(TaskState::Pending | TaskState::Running)
    ));
    assert_eq!(coordinator.pending(), 1);

    loader.release("x", "R");
    assert!(next_completion(&mut coordinator).await);

    assert_eq!(shown(&coordinator, first), resource("R"));
    assert_eq!(coordinator.slot_task_state(first), None);
    assert_eq!(cached(&coordinator, "x"), Some(Some("R".to_owned())));
    assert_eq!(coordinator.cache().weight(), 10);
    assert_eq!(coordinator.pending(), 0);

    // served synchronously, without another load
    let outcome = coordinator.request_load("x".into(), second).unwrap();
    assert_eq!(outcome, RequestOutcome::CacheHit);
    assert_eq!(shown(&coordinator, second), resource("R"));
    assert_eq!(coordinator.pending(), 0);
    assert_eq!(loader.call_count("x"), 1);
}

#[tokio::test]
async fn test_coalesces_requests_for_same_key() {
    let (mut coordinator, loader) = setup_coordinator(|builder| builder);
    let _gate = loader.open_on_drop();
    let slot = coordinator.create_slot();

    let outcome = coordinator.request_load("k".into(), slot).unwrap();
    assert_eq!(outcome, RequestOutcome::LoadStarted);
    let outcome = coordinator.request_load("k".into(), slot).unwrap();
    assert_eq!(outcome, RequestOutcome::AlreadyLoading);
    assert_eq!(coordinator.pending(), 1);

    loader.release("k", "K");
    assert!(next_completion(&mut coordinator).await);
    assert!(!coordinator.next_completion().await);

    assert_eq!(shown(&coordinator, slot), resource("K"));
    assert_eq!(loader.calls(), vec!["k"]);
}

#[tokio::test]
async fn test_slots_do_not_share_loads() {
    let (mut coordinator, loader) = setup_coordinator(|builder| builder);
    let _gate = loader.open_on_drop();
    let first = coordinator.create_slot();
    let second = coordinator.create_slot();

    let outcome = coordinator.request_load("k".into(), first).unwrap();
    assert_eq!(outcome, RequestOutcome::LoadStarted);
    let outcome = coordinator.request_load("k".into(), second).unwrap();
    assert_eq!(outcome, RequestOutcome::LoadStarted);

    loader.open();
    assert!(next_completion(&mut coordinator).await);
    assert!(next_completion(&mut coordinator).await);

    let expected = resource(&resource_for("k"));
    assert_eq!(shown(&coordinator, first), expected);
    assert_eq!(shown(&coordinator, second), expected);
    assert_eq!(loader.call_count("k"), 2);
    assert_eq!(coordinator.cache().len(), 1);
}

#[tokio::test]
async fn test_evicted_resources_are_loaded_again() {
    let (mut coordinator, loader) =
        setup_coordinator(|builder| builder.max_weight(20).weigher(|_k, _v| 10));
    let _gate = loader.open_on_drop();
    loader.open();
    let slot = coordinator.create_slot();

    for key in ["a", "b", "c"] {
        let outcome = coordinator.request_load(key.into(), slot).unwrap();
        assert_eq!(outcome, RequestOutcome::LoadStarted);
        assert!(next_completion(&mut coordinator).await);
        assert_eq!(shown(&coordinator, slot), resource(&resource_for(key)));
    }

    assert_eq!(cached(&coordinator, "a"), None);
    assert_eq!(coordinator.cache().keys(), vec!["b", "c"]);

    let outcome = coordinator.request_load("b".into(), slot).unwrap();
    assert_eq!(outcome, RequestOutcome::CacheHit);
    let outcome = coordinator.request_load("a".into(), slot).unwrap();
    assert_eq!(outcome, RequestOutcome::LoadStarted);
    assert!(next_completion(&mut coordinator).await);

    // "c" was used least recently
    assert_eq!(coordinator.cache().keys(), vec!["b", "a"]);
    assert_eq!(loader.call_count("a"), 2);
}

#[tokio::test]
async fn test_process_completions_does_not_wait() {
    let (mut coordinator, loader) = setup_coordinator(|builder| builder);
    let _gate = loader.open_on_drop();
    let slot = coordinator.create_slot();

    coordinator.request_load("k".into(), slot).unwrap();
    loader.wait_for_calls(1);
    assert_eq!(coordinator.process_completions(), 0);
    assert_eq!(shown(&coordinator, slot), placeholder());

    loader.release("k", "K");
    assert!(next_completion(&mut coordinator).await);
    assert_eq!(coordinator.process_completions(), 0);
    assert_eq!(shown(&coordinator, slot), resource("K"));
}
