#[path = "common/mod.rs"]
mod common;

use common::{assert_no_hits, build_engine, service_from_yaml, wait_for_hits};
use httpmock::Method::{GET, POST};
use httpmock::MockServer;

#[tokio::test]
async fn healthy_service_resets_counters_and_sends_user_agent() {
    let server = MockServer::start_async().await;
    let health = server
        .mock_async(|when, then| {
            when.method(GET).path("/health").header("user-agent", "epazote");
            then.status(200).body("ok");
        })
        .await;

    let engine = build_engine();
    let service = engine.registry.upsert(service_from_yaml(
        "s1",
        &format!("url: {}", server.url("/health")),
    ));

    engine.supervise(std::sync::Arc::clone(&service)).await;

    health.assert_async().await;
    let state = service.state.lock().unwrap();
    assert_eq!(state.failures, 0);
    assert_eq!(state.healthy_streak, 1);
    assert!(state.recovery_action.is_none());
}

#[tokio::test]
async fn user_headers_override_the_default_user_agent() {
    let server = MockServer::start_async().await;
    let health = server
        .mock_async(|when, then| {
            when.method(GET).path("/ua").header("user-agent", "custom-agent");
            then.status(200);
        })
        .await;

    let engine = build_engine();
    let service = engine.registry.upsert(service_from_yaml(
        "custom-ua",
        &format!(
            "url: {}\nheader:\n  User-Agent: custom-agent",
            server.url("/ua")
        ),
    ));

    engine.supervise(std::sync::Arc::clone(&service)).await;
    health.assert_async().await;
}

#[tokio::test]
async fn body_regex_match_keeps_the_service_healthy() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/body");
            then.status(200)
                .body("Hello, epazote 0BC20225-2E72-4646-9202-8467972199E1 world");
        })
        .await;
    let log = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/log")
                .header("content-type", "application/json")
                .header("user-agent", "epazote")
                .body_contains(
                    "\"because\": \"Body regex match: 0BC20225-2E72-4646-9202-8467972199E1\"",
                );
            then.status(200);
        })
        .await;

    let engine = build_engine();
    let service = engine.registry.upsert(service_from_yaml(
        "s2",
        &format!(
            "url: {}\nlog: {}\nexpect:\n  body: \"(?i)[a-z0-9]{{8}}-[a-z0-9]{{4}}-[1-5][a-z0-9]{{3}}-[a-z0-9]{{4}}-[a-z0-9]{{12}}\"",
            server.url("/body"),
            server.url("/log")
        ),
    ));

    engine.supervise(std::sync::Arc::clone(&service)).await;

    wait_for_hits(&log, 1).await;
    assert_eq!(service.state.lock().unwrap().failures, 0);
}

#[tokio::test]
async fn if_status_action_runs_and_reports_empty_output() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/gw");
            then.status(502);
        })
        .await;
    let log = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/log")
                .body_contains("\"because\": \"Status: 502\"")
                .body_contains("\"exit\": 1")
                .body_contains("\"status\": 502");
            then.status(200);
        })
        .await;

    let engine = build_engine();
    let service = engine.registry.upsert(service_from_yaml(
        "s3",
        &format!(
            "url: {}\nlog: {}\nif_status:\n  502:\n    cmd: \"true\"",
            server.url("/gw"),
            server.url("/log")
        ),
    ));

    engine.supervise(std::sync::Arc::clone(&service)).await;

    wait_for_hits(&log, 1).await;
    // `true` exits 0 with no output, so the document carries no `output`.
    assert_eq!(service.state.lock().unwrap().failures, 1);
}

#[tokio::test]
async fn failing_shell_test_reports_exit_status_and_no_defined_cmd() {
    let server = MockServer::start_async().await;
    let log = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/log")
                .body_contains("\"because\": \"Test cmd: exit status 1\"")
                .body_contains("\"output\": \"No defined cmd\"")
                .body_contains("\"status\": 0")
                .body_contains("\"test\": \"test 3 -gt 5\"");
            then.status(200);
        })
        .await;

    let engine = build_engine();
    let service = engine.registry.upsert(service_from_yaml(
        "s4",
        &format!("test: \"test 3 -gt 5\"\nlog: {}", server.url("/log")),
    ));

    engine.supervise(std::sync::Arc::clone(&service)).await;

    wait_for_hits(&log, 1).await;
    assert_eq!(service.state.lock().unwrap().failures, 1);
}

#[tokio::test]
async fn transport_failure_consumes_the_retry_budget() {
    let server = MockServer::start_async().await;
    let log = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/log")
                .body_contains("\"because\": \"GET: ")
                .body_contains("\"retries\": 2")
                .body_contains("\"status\": 0");
            then.status(200);
        })
        .await;

    let engine = build_engine();
    // Port 9 (discard) is reliably closed on test machines.
    let service = engine.registry.upsert(service_from_yaml(
        "s5",
        &format!(
            "url: http://127.0.0.1:9/\nretry_interval: 10\nretry_limit: 3\nlog: {}",
            server.url("/log")
        ),
    ));

    engine.supervise(std::sync::Arc::clone(&service)).await;

    wait_for_hits(&log, 1).await;
    let state = service.state.lock().unwrap();
    assert_eq!(state.failures, 1);
    assert_eq!(state.retries, 2);
}

#[tokio::test]
async fn anti_flap_skips_the_cmd_after_stop_failures() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/down");
            then.status(500);
        })
        .await;
    let ran = server
        .mock_async(|when, then| {
            when.method(POST).path("/log").body_contains("\"output\": \"ran\\n\"");
            then.status(200);
        })
        .await;
    let skipped = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/log")
                .body_contains("\"output\": \"Skipping cmd\"");
            then.status(200);
        })
        .await;

    let engine = build_engine();
    let service = engine.registry.upsert(service_from_yaml(
        "s6",
        &format!(
            "url: {}\nlog: {}\nstop: 2\nexpect:\n  if_not:\n    cmd: \"echo ran\"",
            server.url("/down"),
            server.url("/log")
        ),
    ));

    for _ in 0..3 {
        engine.supervise(std::sync::Arc::clone(&service)).await;
    }

    wait_for_hits(&ran, 2).await;
    wait_for_hits(&skipped, 1).await;
    assert_eq!(service.state.lock().unwrap().failures, 3);
}

#[tokio::test]
async fn unhealthy_threshold_two_delays_the_webhook() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/down");
            then.status(500);
        })
        .await;
    let hook = server
        .mock_async(|when, then| {
            when.method(GET).path("/hook").header("user-agent", "epazote");
            then.status(200);
        })
        .await;

    let engine = build_engine();
    let service = engine.registry.upsert(service_from_yaml(
        "s7",
        &format!(
            "url: {}\nthreshold:\n  unhealthy: 2\nexpect:\n  if_not:\n    http:\n      - url: {}",
            server.url("/down"),
            server.url("/hook")
        ),
    ));

    engine.supervise(std::sync::Arc::clone(&service)).await;
    assert_no_hits(&hook).await;

    engine.supervise(std::sync::Arc::clone(&service)).await;
    wait_for_hits(&hook, 1).await;

    // A third failure stays quiet: the threshold already fired.
    engine.supervise(std::sync::Arc::clone(&service)).await;
    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    assert_eq!(hook.hits_async().await, 1);
}

#[tokio::test]
async fn recovery_notifies_the_pending_audience() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/down");
            then.status(500);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/up");
            then.status(200);
        })
        .await;
    let down_hook = server
        .mock_async(|when, then| {
            when.method(GET).path("/hook-down");
            then.status(200);
        })
        .await;
    let up_hook = server
        .mock_async(|when, then| {
            when.method(GET).path("/hook-up");
            then.status(200);
        })
        .await;

    let action = format!(
        "expect:\n  if_not:\n    http:\n      - url: {}\n      - url: {}",
        server.url("/hook-up"),
        server.url("/hook-down")
    );

    let engine = build_engine();
    let service = engine.registry.upsert(service_from_yaml(
        "web",
        &format!("url: {}\n{action}", server.url("/down")),
    ));

    engine.supervise(std::sync::Arc::clone(&service)).await;
    wait_for_hits(&down_hook, 1).await;
    assert!(service.state.lock().unwrap().recovery_action.is_some());

    // Redefine the service against the healthy endpoint; the registry
    // carries the failure count and the pending recovery action over.
    let service = engine.registry.upsert(service_from_yaml(
        "web",
        &format!("url: {}\n{action}", server.url("/up")),
    ));
    assert_eq!(service.state.lock().unwrap().failures, 1);

    engine.supervise(std::sync::Arc::clone(&service)).await;
    wait_for_hits(&up_hook, 1).await;

    let state = service.state.lock().unwrap();
    assert_eq!(state.failures, 0);
    assert!(state.recovery_action.is_none(), "cleared after the notice");
}

#[tokio::test]
async fn overlapping_ticks_are_dropped() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/slow");
            then.status(200).delay(std::time::Duration::from_millis(500));
        })
        .await;

    let engine = build_engine();
    let service = engine.registry.upsert(service_from_yaml(
        "slow",
        &format!("url: {}", server.url("/slow")),
    ));

    let first = {
        let engine = std::sync::Arc::clone(&engine);
        let service = std::sync::Arc::clone(&service);
        tokio::spawn(async move { engine.supervise(service).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // Second tick while the first is still waiting on the response.
    engine.supervise(std::sync::Arc::clone(&service)).await;
    assert_eq!(
        service.state.lock().unwrap().healthy_streak,
        0,
        "the overlapping tick must not have reported"
    );

    first.await.unwrap();
    assert_eq!(service.state.lock().unwrap().healthy_streak, 1);
}
