use conduit_core::{topics, EventBus};
use conduit_devkit::fixtures::{connection, seeded_store};
use conduit_devkit::{wait_until, Hold, Op, TestHarness};
use conduit_supervisor::health::{spawn_status_publisher, status_of};
use conduit_supervisor::{
    healthcheck, spawn_listeners, HealthAction, Reconciler, RemoveOutcome, RestartPolicy,
    ServiceRegistry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::macros::datetime;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(10);

fn reconciler(h: &TestHarness) -> Arc<Reconciler> {
    Arc::new(Reconciler::new(
        Arc::new(h.store.clone()),
        Arc::new(h.manager.clone()),
        ServiceRegistry::in_memory(),
    ))
}

#[tokio::test(start_paused = true)]
async fn test_bus_events_drive_the_fleet() {
    let h = TestHarness::with_store(seeded_store(&["mtc-01"])).unwrap();
    let r = reconciler(&h);
    let listeners = spawn_listeners(Arc::new(h.bus.clone()), r.clone())
        .await
        .unwrap();
    r.reconcile_startup().await;
    assert_eq!(h.manager.active_ids(), vec!["mtc-01"]);

    // written to the store first, then announced
    h.store.upsert_connection(connection("mtc-02", "mtc", "10.0.0.2"));
    assert_eq!(h.bus.inject_conn_id(topics::CONNECTION_ADDED, "mtc-02"), 1);
    assert!(wait_until(WAIT, || h.manager.active_ids().len() == 2).await);

    // plain-text payload, delivered twice
    h.bus.inject(topics::CONNECTION_REMOVED, "mtc-01");
    h.bus.inject(topics::CONNECTION_REMOVED, "mtc-01");
    assert!(wait_until(WAIT, || h.manager.unit_ids() == vec!["mtc-02"]).await);
    assert!(wait_until(WAIT, || r.registry().len() == 1).await);
    assert_eq!(h.manager.count(Op::Remove), 1);

    // payload without an id is ignored
    h.bus.inject(topics::CONNECTION_ADDED, "{}");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.manager.count(Op::Create), 2);

    for listener in listeners {
        listener.abort();
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_adds_and_removes_settle() {
    let ids: Vec<String> = (1..=6).map(|i| format!("mtc-{i:02}")).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let h = TestHarness::with_store(seeded_store(&refs)).unwrap();
    let r = reconciler(&h);
    let _listeners = spawn_listeners(Arc::new(h.bus.clone()), r.clone())
        .await
        .unwrap();

    for id in &ids {
        h.bus.inject_conn_id(topics::CONNECTION_ADDED, id);
    }
    for id in &ids[..3] {
        h.bus.inject_conn_id(topics::CONNECTION_REMOVED, id);
    }
    assert!(wait_until(WAIT, || h.manager.count(Op::Start) >= 3).await);
    tokio::time::sleep(Duration::from_secs(1)).await;

    // every unit still around is backed by a record, and vice versa
    let records: Vec<String> = r.registry().snapshot().into_iter().map(|s| s.conn_id).collect();
    assert_eq!(h.manager.unit_ids(), records);
    for id in &ids[3..] {
        assert!(records.contains(id));
    }
}

#[tokio::test]
async fn test_healthcheck_restarts_then_gives_up() {
    let h = TestHarness::with_store(seeded_store(&["mtc-01", "mtc-02"])).unwrap();
    let r = reconciler(&h);
    r.reconcile_startup().await;
    let policy = RestartPolicy {
        max_restarts: 2,
        window: Duration::from_secs(300),
    };
    let t0 = datetime!(2024-05-01 12:00 UTC);

    assert!(healthcheck(r.registry(), &h.manager, policy, t0).await.is_empty());

    h.manager.kill("mtc-01");
    let actions = healthcheck(r.registry(), &h.manager, policy, t0).await;
    assert_eq!(actions, vec![("mtc-01".to_string(), HealthAction::Restarted { attempt: 1 })]);
    assert_eq!(h.manager.active_ids().len(), 2);

    h.manager.kill("mtc-01");
    let t1 = datetime!(2024-05-01 12:01 UTC);
    let actions = healthcheck(r.registry(), &h.manager, policy, t1).await;
    assert_eq!(actions[0].1, HealthAction::Restarted { attempt: 2 });

    h.manager.kill("mtc-01");
    let t2 = datetime!(2024-05-01 12:02 UTC);
    let actions = healthcheck(r.registry(), &h.manager, policy, t2).await;
    assert_eq!(actions[0].1, HealthAction::GaveUp);
    assert!(!r.registry().get("mtc-01").unwrap().active);

    // inactive records are no longer watched
    let later = datetime!(2024-05-01 13:00 UTC);
    assert!(healthcheck(r.registry(), &h.manager, policy, later).await.is_empty());
    assert_eq!(h.manager.calls_for("mtc-02"), vec![Op::Create, Op::Start]);
}

#[tokio::test]
async fn test_healthcheck_window_resets_counter() {
    let h = TestHarness::with_store(seeded_store(&["mtc-01"])).unwrap();
    let r = reconciler(&h);
    r.reconcile_startup().await;
    let policy = RestartPolicy {
        max_restarts: 1,
        window: Duration::from_secs(300),
    };

    h.manager.kill("mtc-01");
    let first = healthcheck(r.registry(), &h.manager, policy, datetime!(2024-05-01 12:00 UTC)).await;
    assert_eq!(first[0].1, HealthAction::Restarted { attempt: 1 });

    h.manager.kill("mtc-01");
    let second = healthcheck(r.registry(), &h.manager, policy, datetime!(2024-05-01 12:10 UTC)).await;
    assert_eq!(second[0].1, HealthAction::Restarted { attempt: 1 });
}

#[tokio::test]
async fn test_healthcheck_start_failure_marks_inactive() {
    let h = TestHarness::with_store(seeded_store(&["mtc-01"])).unwrap();
    let r = reconciler(&h);
    r.reconcile_startup().await;

    h.manager.kill("mtc-01");
    h.manager.fail_on(Op::Start, "mtc-01");
    let actions = healthcheck(
        r.registry(),
        &h.manager,
        RestartPolicy::default(),
        datetime!(2024-05-01 12:00 UTC),
    )
    .await;
    assert_eq!(actions[0].1, HealthAction::RestartFailed);
    assert!(!r.registry().get("mtc-01").unwrap().active);
}

fn spawn_healthcheck(h: &TestHarness, r: &Reconciler) -> JoinHandle<Vec<(String, HealthAction)>> {
    let registry = r.registry().clone();
    let manager = h.manager.clone();
    tokio::spawn(async move {
        let now = datetime!(2024-05-01 12:00 UTC);
        healthcheck(&registry, &manager, RestartPolicy::default(), now).await
    })
}

#[tokio::test(start_paused = true)]
async fn test_healthcheck_leaves_removed_connection_down() {
    let h = TestHarness::with_store(seeded_store(&["mtc-01"])).unwrap();
    let r = reconciler(&h);
    r.reconcile_startup().await;
    h.manager.kill("mtc-01");
    h.manager.clear_calls();

    let status = h.manager.gate(Hold::IsActive, "mtc-01");
    let removal = h.manager.gate(Hold::Remove, "mtc-01");
    let check = spawn_healthcheck(&h, &r);
    assert!(wait_until(WAIT, || h.manager.gate_reached(Hold::IsActive, "mtc-01")).await);

    // removal gets as far as deleting the unit while the healthcheck is still asking
    let remover = r.clone();
    let remove = tokio::spawn(async move { remover.handle_removed("mtc-01").await });
    assert!(wait_until(WAIT, || h.manager.gate_reached(Hold::Remove, "mtc-01")).await);

    status.notify_one();
    assert!(check.await.unwrap().is_empty());
    removal.notify_one();
    assert_eq!(remove.await.unwrap(), RemoveOutcome::Removed);

    assert_eq!(h.manager.calls_for("mtc-01"), vec![Op::Stop, Op::Remove]);
    assert!(h.manager.unit_ids().is_empty());
    assert!(r.registry().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unit_restarted_for_removed_connection_is_torn_down() {
    let h = TestHarness::with_store(seeded_store(&["mtc-01"])).unwrap();
    let r = reconciler(&h);
    r.reconcile_startup().await;
    h.manager.kill("mtc-01");
    h.manager.clear_calls();

    let start = h.manager.gate(Hold::Start, "mtc-01");
    let removal = h.manager.gate(Hold::Remove, "mtc-01");
    let check = spawn_healthcheck(&h, &r);
    assert!(wait_until(WAIT, || h.manager.gate_reached(Hold::Start, "mtc-01")).await);

    let remover = r.clone();
    let remove = tokio::spawn(async move { remover.handle_removed("mtc-01").await });
    assert!(wait_until(WAIT, || h.manager.gate_reached(Hold::Remove, "mtc-01")).await);

    start.notify_one();
    let actions = check.await.unwrap();
    assert_eq!(actions, vec![("mtc-01".to_string(), HealthAction::Superseded)]);
    removal.notify_one();
    assert_eq!(remove.await.unwrap(), RemoveOutcome::Removed);

    assert!(h.manager.active_ids().is_empty());
    assert!(h.manager.unit_ids().is_empty());
    assert_eq!(
        h.manager.calls_for("mtc-01"),
        vec![Op::Stop, Op::Start, Op::Stop, Op::Remove, Op::Remove]
    );
}

#[tokio::test(start_paused = true)]
async fn test_status_published_periodically_and_on_request() {
    let h = TestHarness::with_store(seeded_store(&["mtc-01", "mtc-02"])).unwrap();
    h.manager.fail_on(Op::Start, "mtc-02");
    let r = reconciler(&h);
    r.reconcile_startup().await;

    let status = status_of(r.registry(), Instant::now());
    assert_eq!((status.total, status.active), (2, 1));

    let requests = h.bus.subscribe(topics::SUPERVISOR_LIST).await.unwrap();
    let _publisher = spawn_status_publisher(
        Arc::new(h.bus.clone()),
        r.registry().clone(),
        requests,
        Duration::from_secs(30),
    );
    // first tick is immediate
    assert!(wait_until(WAIT, || h.bus.find_by_topic(topics::SUPERVISOR_STATUS).len() == 1).await);

    h.bus.inject(topics::SUPERVISOR_LIST, "");
    assert!(wait_until(WAIT, || h.bus.find_by_topic(topics::SUPERVISOR_STATUS).len() == 2).await);

    let json: serde_json::Value = h.bus.last_json(topics::SUPERVISOR_STATUS).unwrap().unwrap();
    assert_eq!(json["total"], 2);
    assert_eq!(json["active"], 1);
    assert_eq!(json["services"]["mtc-01"]["module"], "conduit-modbus-tcp");
    assert_eq!(json["services"]["mtc-02"]["active"], false);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(h.bus.find_by_topic(topics::SUPERVISOR_STATUS).len() >= 3);
}
