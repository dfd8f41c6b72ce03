use epazote::config::{resolve_service, RawService, SmtpConfig};
use epazote::dispatch::ActionDispatcher;
use epazote::scheduler::Scheduler;
use epazote::service::Service;
use epazote::supervise::Engine;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// Build a resolved service from its YAML definition body.
#[allow(dead_code)]
pub fn service_from_yaml(name: &str, yaml: &str) -> Service {
    let raw: RawService = serde_yaml::from_str(yaml).expect("service yaml");
    resolve_service(name, raw).expect("service resolves")
}

/// An engine with SMTP disabled and its own scheduler.
#[allow(dead_code)]
pub fn build_engine() -> Arc<Engine> {
    let scheduler = Arc::new(Scheduler::new());
    let dispatcher = ActionDispatcher::new(SmtpConfig::default()).expect("dispatcher");
    Arc::new(Engine::new(scheduler, dispatcher, false))
}

/// Poll until the mock has seen at least `hits` requests; async dispatch
/// paths (webhooks, log sinks) land a moment after the tick returns.
#[allow(dead_code)]
pub async fn wait_for_hits(mock: &httpmock::Mock<'_>, hits: usize) {
    for _ in 0..300 {
        if mock.hits_async().await >= hits {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "timed out waiting for {hits} hits, saw {}",
        mock.hits_async().await
    );
}

/// Give fire-and-forget dispatch a moment, then assert nothing arrived.
#[allow(dead_code)]
pub async fn assert_no_hits(mock: &httpmock::Mock<'_>) {
    sleep(Duration::from_millis(150)).await;
    assert_eq!(mock.hits_async().await, 0);
}
