//! End-to-end scenarios against the in-memory controller

use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use verity_bulkops::{BulkError, FlushSummary, HandleState, Payload, ReadOutcome, TransportError};
use verity_bulkops_test::{
    common_fixtures, manual_config, routing_fixtures, CallMethod, MockTransport, TestEnv,
};

#[tokio::test(start_paused = true)]
async fn test_merge_then_flush() {
    let env = TestEnv::with_config(manual_config()).unwrap();
    let manager = &env.manager;

    let create = manager
        .create("badge", "A", Payload::new().with("enable", true))
        .unwrap();
    let update = manager
        .update("badge", "A", Payload::new().with("color", "red"))
        .unwrap();

    assert_eq!(manager.pending_count("badge"), 1);
    assert_eq!(
        manager.dump_pending(),
        vec![r#"badge#0 create A {"color":"red","enable":true}"#]
    );

    manager.flush(None).await.unwrap();
    assert_eq!(env.transport.write_log(), vec!["PUT badge [A]"]);
    env.verifier()
        .assert_payload(
            CallMethod::Put,
            "badge",
            "A",
            &json!({"enable": true, "color": "red"}),
        )
        .unwrap();
    assert_eq!(create.state(), HandleState::Succeeded);
    assert_eq!(update.state(), HandleState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_dependency_ordering() {
    let env = TestEnv::with_transport(
        manual_config(),
        MockTransport::new().with_latency(Duration::from_millis(200)),
    )
    .unwrap();
    let manager = &env.manager;

    let p = manager
        .submit(routing_fixtures::prefix_list("P", "10.0.0.0/8"))
        .unwrap();
    let r = manager
        .submit(routing_fixtures::route_map_clause("R", "P"))
        .unwrap();

    manager.flush(None).await.unwrap();
    p.wait().await.unwrap();
    r.wait().await.unwrap();

    env.verifier()
        .assert_completed_before(
            (CallMethod::Put, "ipv4_prefix_list"),
            (CallMethod::Put, "route_map_clause"),
        )
        .unwrap();
    assert_eq!(
        env.transport.write_log(),
        vec!["PUT ipv4_prefix_list [P]", "PUT route_map_clause [R]"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_partial_batch_failure() {
    let env = TestEnv::with_config(manual_config()).unwrap();
    env.transport.reject("badge", "B2", "duplicate");
    let manager = &env.manager;

    let b1 = manager.submit(common_fixtures::badge("B1", 1)).unwrap();
    let b2 = manager.submit(common_fixtures::badge("B2", 2)).unwrap();

    let summary = manager.flush(None).await.unwrap();
    assert_eq!(
        summary,
        FlushSummary {
            batches: 1,
            succeeded: 1,
            failed: 1
        }
    );
    assert_eq!(env.transport.write_log(), vec!["PUT badge [B1,B2]"]);

    assert_eq!(b1.wait().await, Ok(()));
    assert_eq!(
        b2.wait().await,
        Err(BulkError::validation_rejected("badge", "B2", "duplicate"))
    );
    assert_eq!(
        manager.get_cached_object("badge", "B1"),
        Some(json!({"name": "B1", "enable": true, "color": 1}))
    );
    assert_eq!(manager.get_cached_object("badge", "B2"), None);
}

#[tokio::test(start_paused = true)]
async fn test_read_after_write_trust() {
    let env = TestEnv::with_config(manual_config()).unwrap();
    let manager = &env.manager;

    let site = manager
        .create("site", "S", Payload::new().with("region_name", "emea"))
        .unwrap();
    manager.flush(None).await.unwrap();
    site.wait().await.unwrap();
    assert_eq!(env.transport.write_log(), vec!["PATCH site [S]"]);

    assert!(manager.has_pending_or_recent("site"));
    let cached = manager.get_cached_object("site", "S");
    assert_eq!(cached, Some(json!({"name": "S", "region_name": "emea"})));

    env.transport.clear_calls();
    let read = manager.read("site", "S").await.unwrap();
    assert_eq!(read, ReadOutcome::TrustWrite(cached));
    assert!(env.transport.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_retry() {
    let env = TestEnv::with_config(manual_config()).unwrap();
    env.transport.script(
        CallMethod::Put,
        "badge",
        Err(TransportError::http(503, "service unavailable")),
    );
    let manager = &env.manager;

    let handle = manager.submit(common_fixtures::badge("B", 4)).unwrap();
    let started = tokio::time::Instant::now();
    let summary = manager.flush(None).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(handle.wait().await, Ok(()));
    assert_eq!(handle.state(), HandleState::Succeeded);
    env.verifier()
        .assert_call_count(CallMethod::Put, "badge", 2)
        .unwrap();
    assert!(env.transport.object("badge", "B").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_auth_expiry_recovers_once() {
    let env = TestEnv::with_config(manual_config()).unwrap();
    env.transport.script(
        CallMethod::Put,
        "badge",
        Err(TransportError::http(401, "token expired")),
    );

    let handle = env.manager.submit(common_fixtures::badge("B", 1)).unwrap();
    env.manager.flush(None).await.unwrap();

    assert_eq!(handle.wait().await, Ok(()));
    assert_eq!(env.transport.count(CallMethod::Auth), 1);
    assert_eq!(env.transport.count(CallMethod::Put), 2);
}

#[tokio::test(start_paused = true)]
async fn test_auth_expiry_does_not_loop() {
    let env = TestEnv::with_config(manual_config()).unwrap();
    for _ in 0..2 {
        env.transport.script(
            CallMethod::Put,
            "badge",
            Err(TransportError::http(401, "token expired")),
        );
    }

    let handle = env.manager.submit(common_fixtures::badge("B", 1)).unwrap();
    let summary = env.manager.flush(None).await.unwrap();

    assert_eq!(summary.failed, 1);
    assert!(matches!(
        handle.wait().await,
        Err(BulkError::TransportTransient { .. })
    ));
    assert_eq!(env.transport.count(CallMethod::Auth), 1);
    assert_eq!(env.transport.count(CallMethod::Put), 2);
    assert_eq!(env.transport.object("badge", "B"), None);
}
