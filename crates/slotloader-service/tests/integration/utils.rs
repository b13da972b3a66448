use std::sync::Arc;
use std::time::Duration;

use slotloader_service::{Coordinator, CoordinatorBuilder, SlotContent, SlotId};
use slotloader_test as test;

pub use test::{GatedLoader, resource_for};

pub type TestCoordinator = Coordinator<String, String>;
pub type TestBuilder = CoordinatorBuilder<String, String>;

pub const PLACEHOLDER: &str = "placeholder";

/// Setup tests and create a coordinator backed by a [`GatedLoader`].
///
/// The `update` closure can configure the builder before the coordinator is created. Every load
/// blocks until the test releases it through the returned loader.
pub fn setup_coordinator(
    update: impl FnOnce(TestBuilder) -> TestBuilder,
) -> (TestCoordinator, Arc<GatedLoader>) {
    test::setup();

    let loader = GatedLoader::new();
    let gate = Arc::clone(&loader);
    let builder = Coordinator::builder(
        move |key: &String| gate.load(key),
        PLACEHOLDER.to_owned(),
    );
    let coordinator = update(builder).build(tokio::runtime::Handle::current());

    (coordinator, loader)
}

/// Waits for the next completion and processes it.
pub async fn next_completion(coordinator: &mut TestCoordinator) -> bool {
    tokio::time::timeout(Duration::from_secs(5), coordinator.next_completion())
        .await
        .expect("timed out waiting for a completion")
}

/// What `slot` currently shows.
#[track_caller]
pub fn shown(coordinator: &TestCoordinator, slot: SlotId) -> SlotContent<String> {
    coordinator.slot_content(slot).unwrap().clone()
}

pub fn resource(resource: &str) -> SlotContent<String> {
    SlotContent::Resource(Arc::new(resource.to_owned()))
}

pub fn placeholder() -> SlotContent<String> {
    SlotContent::Placeholder(Arc::new(PLACEHOLDER.to_owned()))
}

/// The cached value for `key`: [`None`] if not cached, `Some(None)` if cached as absent.
pub fn cached(coordinator: &TestCoordinator, key: &str) -> Option<Option<String>> {
    coordinator
        .cache()
        .get(&key.to_owned())
        .map(|cached| cached.map(|resource| resource.to_string()))
}
