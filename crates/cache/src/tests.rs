use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use canopy_framework::{ConnectionStateManager, RetryNTimes};
use canopy_primitives::{ChildEvent, ChildEventKind, ConnectionState};
use canopy_service::mock::MockService;
use canopy_service::{CoordinationService, CreateMode};
use tokio::sync::mpsc;

use crate::{DescendantHandlingMode, TreeCache, TreeCacheConfig};

const ROOT: &str = "/cachetest";
const DEADLINE: Duration = Duration::from_secs(5);

/// Mock service pumped into a state manager, already connected.
async fn connected_harness() -> (Arc<MockService>, ConnectionStateManager) {
    let service = Arc::new(MockService::new());
    let manager = ConnectionStateManager::start();
    let mut signals = service.connection_signals();
    let pump = manager.clone();
    drop(tokio::spawn(async move {
        while let Some(signal) = signals.recv().await {
            pump.signal(signal);
        }
    }));
    let mut states = manager.subscribe().await;
    service.restart();
    assert_eq!(states.recv().await, Some(ConnectionState::Connected));
    (service, manager)
}

async fn start_cache(
    service: &Arc<MockService>,
    manager: &ConnectionStateManager,
    mode: DescendantHandlingMode,
) -> (TreeCache, mpsc::UnboundedReceiver<ChildEvent>) {
    let _created = service
        .create(ROOT, b"root".to_vec(), CreateMode::Persistent)
        .await
        .expect("create cache root");
    TreeCache::start(
        Arc::clone(service) as Arc<dyn CoordinationService>,
        manager,
        TreeCacheConfig::new(ROOT, mode),
    )
    .await
    .expect("start cache")
}

async fn next(events: &mut mpsc::UnboundedReceiver<ChildEvent>) -> ChildEvent {
    tokio::time::timeout(DEADLINE, events.recv())
        .await
        .expect("no event within deadline")
        .expect("event stream ended")
}

async fn expect_kind(events: &mut mpsc::UnboundedReceiver<ChildEvent>, kind: ChildEventKind) {
    let event = next(events).await;
    assert_eq!(event.kind, kind, "unexpected event {event:?}");
}

#[tokio::test]
async fn initial_population_announces_once() {
    let (service, manager) = connected_harness().await;
    let (cache, mut events) = start_cache(&service, &manager, DescendantHandlingMode::AllDescendants).await;

    expect_kind(&mut events, ChildEventKind::Initialized).await;
    assert!(!cache.is_faulted());
    assert!(cache.snapshot().is_empty());

    let root = cache.current_data(ROOT).expect("root tracked");
    assert_eq!(root.data.as_deref(), Some(b"root".as_slice()));

    cache.close().await;
}

#[tokio::test]
async fn all_descendants_mirrors_nested_creates() {
    let (service, manager) = connected_harness().await;
    let (cache, mut events) = start_cache(&service, &manager, DescendantHandlingMode::AllDescendants).await;
    expect_kind(&mut events, ChildEventKind::Initialized).await;

    for path in ["/cachetest/a", "/cachetest/a/b", "/cachetest/a/b/c"] {
        let _created = service
            .create(path, path.as_bytes().to_vec(), CreateMode::Persistent)
            .await
            .expect("create");
    }

    // Parents are always announced before their descendants.
    let mut added = Vec::new();
    for _ in 0..3 {
        let event = next(&mut events).await;
        assert_eq!(event.kind, ChildEventKind::ChildAdded, "got {event:?}");
        added.push(event.path().expect("structural event has a path").to_owned());
    }
    assert_eq!(added, ["/cachetest/a", "/cachetest/a/b", "/cachetest/a/b/c"]);

    let mirrored: BTreeMap<String, Vec<u8>> = cache
        .snapshot()
        .into_iter()
        .map(|(path, child)| (path, child.data.unwrap_or_default()))
        .collect();
    assert_eq!(mirrored, service.subtree(ROOT));

    cache.close().await;
}

#[tokio::test]
async fn data_change_surfaces_as_child_updated() {
    let (service, manager) = connected_harness().await;
    let (cache, mut events) = start_cache(&service, &manager, DescendantHandlingMode::AllDescendants).await;
    expect_kind(&mut events, ChildEventKind::Initialized).await;

    let _created = service
        .create("/cachetest/a", b"v1".to_vec(), CreateMode::Persistent)
        .await
        .expect("create");
    expect_kind(&mut events, ChildEventKind::ChildAdded).await;

    let _stat = service
        .set_data("/cachetest/a", b"v2".to_vec(), None)
        .await
        .expect("set_data");

    let event = next(&mut events).await;
    assert_eq!(event.kind, ChildEventKind::ChildUpdated);
    let child = event.data.expect("updated event carries a snapshot");
    assert_eq!(child.path, "/cachetest/a");
    assert_eq!(child.data.as_deref(), Some(b"v2".as_slice()));

    // The published mirror is at least as new as any delivered event.
    let mirrored = cache.current_data("/cachetest/a").expect("tracked");
    assert_eq!(mirrored.data.as_deref(), Some(b"v2".as_slice()));

    cache.close().await;
}

#[tokio::test]
async fn direct_descendants_only_ignores_deeper_levels() {
    let (service, manager) = connected_harness().await;
    let (cache, mut events) =
        start_cache(&service, &manager, DescendantHandlingMode::DirectDescendantsOnly).await;
    expect_kind(&mut events, ChildEventKind::Initialized).await;

    let _created = service
        .create("/cachetest/a", b"a".to_vec(), CreateMode::Persistent)
        .await
        .expect("create");
    expect_kind(&mut events, ChildEventKind::ChildAdded).await;

    // Grandchildren are neither tracked nor watched.
    for path in ["/cachetest/a/b", "/cachetest/a/b/c"] {
        let _created = service
            .create(path, b"deep".to_vec(), CreateMode::Persistent)
            .await
            .expect("create");
    }

    // A direct-child update is the next thing the stream delivers, proving
    // the deeper creates produced nothing.
    let _stat = service
        .set_data("/cachetest/a", b"v2".to_vec(), None)
        .await
        .expect("set_data");
    let event = next(&mut events).await;
    assert_eq!(event.kind, ChildEventKind::ChildUpdated);
    assert_eq!(event.path(), Some("/cachetest/a"));

    let tracked: Vec<String> = cache.snapshot().into_keys().collect();
    assert_eq!(tracked, ["/cachetest/a"]);
    assert!(cache.current_data("/cachetest/a/b").is_none());

    cache.close().await;
}

#[tokio::test]
async fn removals_fan_out_children_before_parents() {
    let (service, manager) = connected_harness().await;
    let (cache, mut events) = start_cache(&service, &manager, DescendantHandlingMode::AllDescendants).await;
    expect_kind(&mut events, ChildEventKind::Initialized).await;

    for path in ["/cachetest/a", "/cachetest/a/b", "/cachetest/a/b/c"] {
        let _created = service
            .create(path, Vec::new(), CreateMode::Persistent)
            .await
            .expect("create");
    }
    for _ in 0..3 {
        expect_kind(&mut events, ChildEventKind::ChildAdded).await;
    }

    service.remove_subtree("/cachetest/a").expect("remove subtree");

    let mut removed = Vec::new();
    for _ in 0..3 {
        let event = next(&mut events).await;
        assert_eq!(event.kind, ChildEventKind::ChildRemoved, "got {event:?}");
        removed.push(event.path().expect("structural event has a path").to_owned());
    }
    assert_eq!(removed, ["/cachetest/a/b/c", "/cachetest/a/b", "/cachetest/a"]);

    // Sentinel: nothing stray was queued between the removals and this add.
    let _created = service
        .create("/cachetest/z", Vec::new(), CreateMode::Persistent)
        .await
        .expect("create");
    let event = next(&mut events).await;
    assert_eq!(event.kind, ChildEventKind::ChildAdded);
    assert_eq!(event.path(), Some("/cachetest/z"));

    let tracked: Vec<String> = cache.snapshot().into_keys().collect();
    assert_eq!(tracked, ["/cachetest/z"]);

    cache.close().await;
}

#[tokio::test]
async fn connection_cycle_is_reported_and_mirror_survives() {
    let (service, manager) = connected_harness().await;
    let (cache, mut events) = start_cache(&service, &manager, DescendantHandlingMode::AllDescendants).await;
    expect_kind(&mut events, ChildEventKind::Initialized).await;

    let _created = service
        .create("/cachetest/a", b"a".to_vec(), CreateMode::Persistent)
        .await
        .expect("create");
    expect_kind(&mut events, ChildEventKind::ChildAdded).await;

    service.stop();
    expect_kind(&mut events, ChildEventKind::ConnectionSuspended).await;
    expect_kind(&mut events, ChildEventKind::ConnectionLost).await;

    // Last-known state stays readable while disconnected.
    assert!(cache.current_data("/cachetest/a").is_some());

    service.restart();
    expect_kind(&mut events, ChildEventKind::ConnectionReconnected).await;

    // The reconnect refresh found nothing changed; the next structural
    // event is for fresh activity only.
    let _created = service
        .create("/cachetest/z", Vec::new(), CreateMode::Persistent)
        .await
        .expect("create");
    let event = next(&mut events).await;
    assert_eq!(event.kind, ChildEventKind::ChildAdded);
    assert_eq!(event.path(), Some("/cachetest/z"));

    cache.close().await;
}

#[tokio::test]
async fn missing_root_faults_until_its_creation_is_observed() {
    let (service, manager) = connected_harness().await;
    let config = TreeCacheConfig::new(ROOT, DescendantHandlingMode::AllDescendants)
        .with_root_retry(Arc::new(RetryNTimes::new(1, Duration::ZERO)));
    let (cache, mut events) = TreeCache::start(
        Arc::clone(&service) as Arc<dyn CoordinationService>,
        &manager,
        config,
    )
    .await
    .expect("start cache");

    expect_kind(&mut events, ChildEventKind::RootFailure).await;
    assert!(cache.is_faulted());

    // The failed attempts left an existence watch on the root, so its
    // late creation alone recovers the cache: no reconnect involved.
    let _created = service
        .create(ROOT, b"root".to_vec(), CreateMode::Persistent)
        .await
        .expect("create root late");
    expect_kind(&mut events, ChildEventKind::Initialized).await;
    assert!(!cache.is_faulted());
    let root = cache.current_data(ROOT).expect("root tracked");
    assert_eq!(root.data.as_deref(), Some(b"root".as_slice()));

    cache.close().await;
}

#[tokio::test]
async fn root_recreation_is_observed_without_a_reconnect() {
    let (service, manager) = connected_harness().await;
    let (cache, mut events) = start_cache(&service, &manager, DescendantHandlingMode::AllDescendants).await;
    expect_kind(&mut events, ChildEventKind::Initialized).await;

    let _created = service
        .create("/cachetest/a", b"a".to_vec(), CreateMode::Persistent)
        .await
        .expect("create");
    expect_kind(&mut events, ChildEventKind::ChildAdded).await;

    // Deleting the whole root fans out removals for the children only; the
    // root itself was never announced as a child.
    service.remove_subtree(ROOT).expect("remove root subtree");
    let event = next(&mut events).await;
    assert_eq!(event.kind, ChildEventKind::ChildRemoved);
    assert_eq!(event.path(), Some("/cachetest/a"));

    let _created = service
        .create(ROOT, b"again".to_vec(), CreateMode::Persistent)
        .await
        .expect("recreate root");

    // The new incarnation is repopulated off the root's existence watch;
    // poll the mirror for it before growing the tree again.
    let deadline = tokio::time::Instant::now() + DEADLINE;
    while !cache
        .current_data(ROOT)
        .is_some_and(|root| root.data.as_deref() == Some(b"again".as_slice()))
    {
        assert!(
            tokio::time::Instant::now() < deadline,
            "recreated root never mirrored"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let _created = service
        .create("/cachetest/b", Vec::new(), CreateMode::Persistent)
        .await
        .expect("create under new incarnation");
    let event = next(&mut events).await;
    assert_eq!(event.kind, ChildEventKind::ChildAdded, "got {event:?}");
    assert_eq!(event.path(), Some("/cachetest/b"));
    assert!(cache.current_data("/cachetest/b").is_some());

    cache.close().await;
}

#[tokio::test]
async fn close_stays_prompt_during_root_backoff() {
    let (service, manager) = connected_harness().await;
    let config = TreeCacheConfig::new(ROOT, DescendantHandlingMode::AllDescendants)
        .with_root_retry(Arc::new(RetryNTimes::new(3, Duration::from_secs(60))));
    let (cache, _events) = TreeCache::start(
        Arc::clone(&service) as Arc<dyn CoordinationService>,
        &manager,
        config,
    )
    .await
    .expect("start cache");

    // Let the first attempt against the absent root fail and park its
    // minute-long backoff timer.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The backoff runs off-task, so the synchronizer still answers.
    tokio::time::timeout(Duration::from_secs(1), cache.close())
        .await
        .expect("close stalled behind the root backoff");
}

#[tokio::test]
async fn close_is_idempotent_and_silences_listeners() {
    let (service, manager) = connected_harness().await;
    let (cache, mut events) = start_cache(&service, &manager, DescendantHandlingMode::AllDescendants).await;
    expect_kind(&mut events, ChildEventKind::Initialized).await;

    cache.close().await;
    cache.close().await;

    assert!(cache.snapshot().is_empty());
    assert!(cache.current_data(ROOT).is_none());

    // Pre-close events may still be buffered, but the stream must end.
    while tokio::time::timeout(DEADLINE, events.recv())
        .await
        .expect("stream should end, not stall")
        .is_some()
    {}

    let mut late = cache.subscribe().await;
    assert!(late.recv().await.is_none());
}

#[tokio::test]
async fn rejects_a_malformed_root_path() {
    let (service, manager) = connected_harness().await;
    let result = TreeCache::start(
        Arc::clone(&service) as Arc<dyn CoordinationService>,
        &manager,
        TreeCacheConfig::new("no-leading-slash", DescendantHandlingMode::AllDescendants),
    )
    .await;
    assert!(result.is_err());
}
