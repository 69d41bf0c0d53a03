//! End-to-end scenario tests (S1-S6) plus the store-level invariants that
//! don't already have dedicated unit coverage in their owning module.
//!
//! These drive the real `Store`/`DeviceRegistry`/`BatchManager`/
//! `EventProcessor`/`SessionCache` stack against an in-memory SQLite
//! database. The cloud client's reachability is driven with
//! `CloudClient::force_online` rather than a live HTTP round trip, and the
//! reconnect-drain half of S5 calls the same public methods the sync
//! service calls internally (`BatchManager::end_batch`,
//! `EventProcessor::mark_event_synced`, `BatchManager::mark_batch_synced`) —
//! this exercises the same state transitions without standing up a mock
//! cloud server.

use std::sync::Arc;
use std::time::Duration;

use edge_gateway::batch_manager::BatchManager;
use edge_gateway::bus::Bus;
use edge_gateway::cloud::CloudClient;
use edge_gateway::config::GatewayConfig;
use edge_gateway::device_registry::DeviceRegistry;
use edge_gateway::event_processor::EventProcessor;
use edge_gateway::session_cache::{CloudSessionPush, SessionCache};
use edge_gateway::store::{BatchStatus, DeviceStatus, NewEvent, SessionStatus, Store, StoreError};
use edge_protocol::parse_weighing_line;

fn test_config() -> GatewayConfig {
    GatewayConfig {
        edge_name: "edge-test".into(),
        site_id: "site-1".into(),
        site_name: "Test Site".into(),
        registration_token: "test-token".into(),
        tcp_host: "127.0.0.1".into(),
        tcp_port: 0,
        db_path: "unused.sqlite3".into(),
        cloud_api_url: "http://127.0.0.1:1".into(),
        session_poll_interval: Duration::from_secs(5),
        event_send_timeout: Duration::from_millis(200),
        rest_max_retries: 0,
        rest_retry_delay: Duration::from_millis(1),
        rest_backoff_multiplier: 2,
        rest_max_retry_delay: Duration::from_millis(10),
        cloud_batch_size: 50,
        batch_interval: Duration::from_secs(5),
        heartbeat_timeout: Duration::from_secs(60),
        activity_idle: Duration::from_secs(300),
        activity_stale: Duration::from_secs(1800),
        session_cache_expiry: Duration::from_secs(14_400),
        offline_trigger_delay: Duration::from_secs(5),
        offline_max_events_per_batch: 1000,
        offline_batch_retention_days: 30,
        work_hours_start: None,
        work_hours_end: None,
        timezone: None,
    }
}

struct Harness {
    store: Arc<std::sync::Mutex<Store>>,
    registry: Arc<DeviceRegistry>,
    batches: Arc<BatchManager>,
    sessions: Arc<tokio::sync::Mutex<SessionCache>>,
    cloud: Arc<CloudClient>,
    processor: Arc<EventProcessor>,
}

fn build_harness_with_dedup(dedup_window: Duration) -> Harness {
    let store = Arc::new(std::sync::Mutex::new(Store::open_in_memory().unwrap()));
    let bus = Bus::new();
    let registry = Arc::new(DeviceRegistry::new(
        Arc::clone(&store),
        bus.clone(),
        "site-1".to_owned(),
        Duration::from_secs(300),
        Duration::from_secs(60),
    ));
    let batches = Arc::new(BatchManager::new(Arc::clone(&store), bus.clone()));
    let sessions = Arc::new(tokio::sync::Mutex::new(SessionCache::new(
        Arc::clone(&store),
        Duration::from_secs(14_400),
    )));
    let cloud = Arc::new(CloudClient::new(&test_config(), Arc::clone(&store)).unwrap());
    let processor = Arc::new(EventProcessor::new(
        Arc::clone(&store),
        bus,
        Arc::clone(&batches),
        Arc::clone(&sessions),
        Arc::clone(&cloud),
        dedup_window,
    ));
    Harness {
        store,
        registry,
        batches,
        sessions,
        cloud,
        processor,
    }
}

fn build_harness() -> Harness {
    build_harness_with_dedup(Duration::from_secs(5))
}

const LARGE_VALUE_LINE: &str = "00001,10:30:00,30.01.2026,KIYMA           ,2000001025004,000,MEHMET        ,0000002500,0000000000,0000037500,0,0,0,1,N,TEST COMPANY";
const SMALL_UNIT_LINE: &str = "00001,06:25:17,30.01.2026,BONFILE         ,000000000004,0000,KAAN                                            ,0000000027,0000000013,0000000014,1,0,1,1,N,K";

#[tokio::test]
async fn s1_single_weighing_large_value() {
    let h = build_harness();
    let snapshot = h
        .registry
        .register_device("sock-1", "SCALE-01", "127.0.0.1")
        .unwrap();
    h.registry.on_heartbeat("sock-1").unwrap();

    let record = parse_weighing_line(LARGE_VALUE_LINE).unwrap();
    let row = h
        .processor
        .process(&snapshot.id, Some("127.0.0.1"), false, record)
        .await
        .unwrap()
        .expect("first occurrence must persist");

    assert_eq!(row.plu_code, "2000001025004");
    assert_eq!(row.net_weight_grams, 37500);
    assert_eq!(row.tare_weight_grams, 0);
    // cloud starts unreachable until a request succeeds, so this is tagged offline.
    assert!(row.offline_mode);
    assert!(row.offline_batch_id.is_some());

    let device = h
        .store
        .lock()
        .unwrap()
        .get_device(&snapshot.id)
        .unwrap()
        .unwrap();
    assert_eq!(device.status, DeviceStatus::Online);
}

#[tokio::test]
async fn s2_small_unit_decoding() {
    let h = build_harness();
    let snapshot = h
        .registry
        .register_device("sock-2", "SCALE-02", "127.0.0.1")
        .unwrap();

    let record = parse_weighing_line(SMALL_UNIT_LINE).unwrap();
    let row = h
        .processor
        .process(&snapshot.id, None, false, record)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(row.net_weight_grams, 1400);
    assert_eq!(row.tare_weight_grams, 1300);
}

#[tokio::test]
async fn s3_duplicate_within_window_then_distinct_after_expiry() {
    // A short dedup window keeps the test's real-time sleeps small.
    let h = build_harness_with_dedup(Duration::from_millis(50));
    let snapshot = h
        .registry
        .register_device("sock-3", "SCALE-03", "127.0.0.1")
        .unwrap();

    let first = h
        .processor
        .process(&snapshot.id, None, false, parse_weighing_line(LARGE_VALUE_LINE).unwrap())
        .await
        .unwrap();
    assert!(first.is_some());

    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = h
        .processor
        .process(&snapshot.id, None, false, parse_weighing_line(LARGE_VALUE_LINE).unwrap())
        .await
        .unwrap();
    assert!(second.is_none(), "identical signature inside the window is a duplicate");

    tokio::time::sleep(Duration::from_millis(80)).await;
    let third = h
        .processor
        .process(&snapshot.id, None, false, parse_weighing_line(LARGE_VALUE_LINE).unwrap())
        .await
        .unwrap();
    assert!(third.is_some(), "the same signature after the window elapses persists again");

    let pending = h.store.lock().unwrap().fetch_pending_events(10).unwrap();
    assert_eq!(pending.len(), 2);
}

#[test]
fn s4_reconnection_preserves_device_identity() {
    let h = build_harness();
    let first = h
        .registry
        .register_device("sock-a", "SCALE-04", "127.0.0.1")
        .unwrap();
    h.registry.disconnect_device("sock-a", "test teardown").unwrap();
    let second = h
        .registry
        .register_device("sock-b", "SCALE-04", "127.0.0.1")
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.global_id, second.global_id);
    assert_eq!(second.heartbeat_count, 2);
    assert_eq!(second.status, DeviceStatus::Online);
    assert_eq!(h.registry.snapshot_id_for_socket("sock-b"), Some(second.id));
    assert_eq!(h.registry.snapshot_id_for_socket("sock-a"), None);
}

#[tokio::test]
async fn s5_offline_then_drain() {
    let h = build_harness();
    let snapshot = h
        .registry
        .register_device("sock-5", "SCALE-05", "127.0.0.1")
        .unwrap();

    let lines = [
        "00001,10:30:00,30.01.2026,KIYMA           ,2000001025004,000,MEHMET        ,0000002500,0000000000,0000037500,0,0,0,1,N,TEST COMPANY",
        "00002,10:31:00,30.01.2026,KIYMA           ,2000001025005,000,MEHMET        ,0000002500,0000000000,0000020000,0,0,0,1,N,TEST COMPANY",
        "00003,10:32:00,30.01.2026,KIYMA           ,2000001025006,000,MEHMET        ,0000002500,0000000000,0000015000,0,0,0,1,N,TEST COMPANY",
    ];

    let mut event_ids = Vec::new();
    let mut batch_id: Option<String> = None;
    for line in lines {
        let record = parse_weighing_line(line).unwrap();
        let row = h
            .processor
            .process(&snapshot.id, None, false, record)
            .await
            .unwrap()
            .unwrap();
        assert!(row.offline_mode);
        assert!(row.cloud_session_id.is_none());
        let bid = row.offline_batch_id.clone().expect("offline event must carry a batch id");
        match &batch_id {
            Some(existing) => assert_eq!(existing, &bid, "all three events share one open batch"),
            None => batch_id = Some(bid),
        }
        event_ids.push(row.id.clone());
    }
    let batch_id = batch_id.unwrap();

    {
        let store = h.store.lock().unwrap();
        let batch = store.get_batch(&batch_id).unwrap().unwrap();
        assert_eq!(batch.event_count, 3);
        assert!(batch.ended_at.is_none());
        assert_eq!(store.fetch_pending_events(10).unwrap().len(), 3);
    }

    // Cloud comes back online: close the batch and sync every event, the
    // same calls the sync service's reconnect drain makes.
    h.cloud.force_online(true);
    h.batches.end_batch(&batch_id).unwrap();
    for id in &event_ids {
        h.processor.mark_event_synced(id, &format!("cloud-{id}")).unwrap();
    }
    h.batches.mark_batch_synced(&batch_id, None).unwrap();

    let store = h.store.lock().unwrap();
    let batch = store.get_batch(&batch_id).unwrap().unwrap();
    assert!(batch.ended_at.is_some());
    assert_eq!(batch.reconciliation_status, BatchStatus::Reconciled);
    assert_eq!(store.count_unsynced_for_batch(&batch_id).unwrap(), 0);
    assert_eq!(store.fetch_pending_events(10).unwrap().len(), 0);
}

#[tokio::test]
async fn s6_session_tagging_when_online() {
    let h = build_harness();
    let snapshot = h
        .registry
        .register_device("sock-6", "SCALE-06", "127.0.0.1")
        .unwrap();

    let push = CloudSessionPush {
        cloud_session_id: "cloud-session-1".to_owned(),
        device_id: snapshot.id.clone(),
        animal_id: Some("animal-1".to_owned()),
        animal_tag: Some("A-42".to_owned()),
        animal_species: Some("bovine".to_owned()),
        operator_id: Some("op-1".to_owned()),
        status: SessionStatus::Active,
    };
    h.sessions.lock().await.handle_session_start(&push).unwrap();
    h.cloud.force_online(true);

    let record = parse_weighing_line(LARGE_VALUE_LINE).unwrap();
    let row = h
        .processor
        .process(&snapshot.id, None, false, record)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(row.cloud_session_id.as_deref(), Some("cloud-session-1"));
    assert!(!row.offline_mode);
    assert!(row.offline_batch_id.is_none());
}

#[test]
fn invariant_unique_index_backstops_dedup() {
    let h = build_harness();
    let snapshot = h
        .registry
        .register_device("sock-9", "SCALE-09", "127.0.0.1")
        .unwrap();

    let new_event = |id: &str| NewEvent {
        id: id.to_owned(),
        device_id: snapshot.id.clone(),
        cloud_session_id: None,
        offline_mode: true,
        offline_batch_id: None,
        plu_code: "2000001025004".to_owned(),
        product_name: None,
        net_weight_grams: 37500,
        tare_weight_grams: 0,
        barcode: "2000001025004".to_owned(),
        scale_timestamp: "2026-01-30T10:30:00".to_owned(),
        received_at: edge_gateway::store::now_utc(),
        source_ip: None,
        raw_line: "raw".to_owned(),
    };

    let store = h.store.lock().unwrap();
    store.insert_event(&new_event("evt-1")).unwrap();
    let err = store.insert_event(&new_event("evt-2")).unwrap_err();
    assert!(matches!(err, StoreError::DuplicateEvent));
}

#[test]
fn invariant_at_most_one_open_batch_per_device() {
    let h = build_harness();
    let snapshot = h
        .registry
        .register_device("sock-7", "SCALE-07", "127.0.0.1")
        .unwrap();

    let first = h.batches.get_or_start_current(&snapshot.id).unwrap();
    let second = h.batches.get_or_start_current(&snapshot.id).unwrap();
    assert_eq!(first.id, second.id);

    let count = h
        .store
        .lock()
        .unwrap()
        .count_open_batches_for_device(&snapshot.id)
        .unwrap();
    assert_eq!(count, 1);
}
