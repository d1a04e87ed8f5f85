//! End-to-end dispatch scenarios: webhook fan-out, template rendering,
//! queue re-injection, retry exhaustion and failure accounting.
use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use herald_messaging::config::Config;
use herald_messaging::message::{batch_size, Message};
use herald_messaging::monitor::{Monitor, MonitorType};
use herald_messaging::service::{Service, StorageHandles};
use herald_messaging::storage::memory::MemoryDriver;
use herald_messaging::storage::{Metadata, QueueController, StorageError};

#[ctor::ctor]
fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn service_over(driver: Arc<MemoryDriver>, config: Config) -> Service {
    Service::new(
        StorageHandles {
            message: driver.clone(),
            queue: driver.clone(),
            claim: driver.clone(),
            topic_store: driver.clone(),
            monitor_store: driver.clone(),
            subscription_store: driver,
        },
        config,
    )
}

fn options(pairs: &[(&str, serde_json::Value)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Polls the topic monitor until `predicate` holds. Deliveries settle in
/// the background, so every assertion on accounting goes through here.
async fn wait_for_monitor(
    service: &Service,
    name: &str,
    m_type: MonitorType,
    project: &str,
    predicate: impl Fn(&Monitor) -> bool,
) -> Monitor {
    // Generous enough for a paused clock to step through every backoff
    // sleep 25ms at a time.
    for _ in 0..4000 {
        if let Ok(monitor) = service.monitors().get(name, m_type, project).await {
            if predicate(&monitor) {
                return monitor;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("monitor {}/{}/{} never reached the expected state", project, m_type, name);
}

#[tokio::test(flavor = "multi_thread")]
async fn webhook_fan_out_accounts_each_delivery() -> Result<(), anyhow::Error> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook-a"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook-b"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut service = Service::in_memory(Config::default());
    service.topics().create("alerts", "p1", Metadata::new()).await?;
    for hook in ["hook-a", "hook-b"] {
        service
            .subscriptions()
            .create("p1", "alerts", &format!("{}/{}", server.uri(), hook), 3600, Metadata::new())
            .await?;
    }

    let message = Message::new(json!({"severity": "page"}));
    let body_kb = message.body_size() as f64 / 1024.0;
    let receipt = service
        .publish("p1", "alerts", vec![message], None)
        .await?;
    assert_eq!(receipt.subscriptions, 2);
    assert_eq!(receipt.message_counter, 1);

    // One success update per subscription, no failure deltas.
    let monitor = wait_for_monitor(&service, "alerts", MonitorType::Topics, "p1", |m| {
        m.count("sub_msg_counts") == 2
    })
    .await;
    assert!((monitor.kilobytes("sub_msg_bytes") - 2.0 * body_kb).abs() < 1e-9);
    assert_eq!(monitor.count("total_sub_msg_counts"), 0);
    assert_eq!(monitor.count("msg_counts"), 1);

    service.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn webhook_renders_template_headers_and_queue_name() -> Result<(), anyhow::Error> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/render"))
        .and(header("X-Api-Key", "sekrit"))
        .and(header("Content-Type", "application/json"))
        .and(body_string_contains(r#""wrapped":"#))
        .and(body_string_contains(r#""queue_name":"alerts""#))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut service = Service::in_memory(Config::default());
    service.topics().create("alerts", "p1", Metadata::new()).await?;
    service
        .subscriptions()
        .create(
            "p1",
            "alerts",
            &format!("{}/render", server.uri()),
            3600,
            options(&[
                ("post_data", json!(r#"{"wrapped": "$zaqar_message$"}"#)),
                ("post_headers", json!({"X-Api-Key": "sekrit"})),
            ]),
        )
        .await?;

    service
        .publish("p1", "alerts", vec![Message::new(json!({"n": 1}))], None)
        .await?;
    wait_for_monitor(&service, "alerts", MonitorType::Topics, "p1", |m| {
        m.count("sub_msg_counts") == 1
    })
    .await;

    service.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_reinjection_stamps_ttls_and_accounts_both_sides() -> Result<(), anyhow::Error> {
    let driver = Arc::new(MemoryDriver::new());
    let mut service = service_over(driver.clone(), Config::default());

    service.topics().create("alerts", "p1", Metadata::new()).await?;
    // Destination exists with empty metadata, so the defaults apply.
    QueueController::create(driver.as_ref(), "jobs", "p1").await?;
    service
        .subscriptions()
        .create("p1", "alerts", "queue://p1/jobs", 3600, Metadata::new())
        .await?;

    service
        .publish("p1", "alerts", vec![Message::new(json!({"job": "reindex"}))], None)
        .await?;

    wait_for_monitor(&service, "alerts", MonitorType::Topics, "p1", |m| {
        m.count("sub_msg_counts") == 1
    })
    .await;
    let queue_monitor = wait_for_monitor(&service, "jobs", MonitorType::Queues, "p1", |m| {
        m.count("msg_counts") == 1
    })
    .await;
    assert_eq!(queue_monitor.signed("active_msgs"), 1);

    // The re-injected message carries the defaulted envelope.
    let consumed = service.consume("jobs", "p1", Some(5), false).await?;
    assert_eq!(consumed.messages.len(), 1);
    assert_eq!(consumed.messages[0].ttl, 3600);
    assert_eq!(consumed.messages[0].body, json!({"job": "reindex"}));

    service.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_webhook_without_policy_fails_once_into_total_counters(
) -> Result<(), anyhow::Error> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let mut service = Service::in_memory(Config::default());
    service.topics().create("alerts", "p1", Metadata::new()).await?;
    service
        .subscriptions()
        .create("p1", "alerts", &server.uri(), 3600, Metadata::new())
        .await?;

    let messages: Vec<Message> = (0..3).map(|i| Message::new(json!({"seq": i}))).collect();
    let total_kb = batch_size(&messages) as f64 / 1024.0;
    service.publish("p1", "alerts", messages, None).await?;

    let monitor = wait_for_monitor(&service, "alerts", MonitorType::Topics, "p1", |m| {
        m.count("total_sub_msg_counts") == 3
    })
    .await;
    assert!((monitor.kilobytes("total_sub_msg_bytes") - total_kb).abs() < 1e-9);
    assert_eq!(monitor.count("sub_msg_counts"), 0);

    service.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_scheme_is_a_permanent_failure() -> Result<(), anyhow::Error> {
    let mut service = Service::in_memory(Config::default());
    service.topics().create("alerts", "p1", Metadata::new()).await?;
    service
        .subscriptions()
        .create("p1", "alerts", "mailto://oncall@example.com", 3600, Metadata::new())
        .await?;

    service
        .publish("p1", "alerts", vec![Message::new(json!(1))], None)
        .await?;
    let monitor = wait_for_monitor(&service, "alerts", MonitorType::Topics, "p1", |m| {
        m.count("total_sub_msg_counts") == 1
    })
    .await;
    assert_eq!(monitor.count("sub_msg_counts"), 0);

    service.shutdown().await;
    Ok(())
}

/// Queue controller stub whose metadata lookup always fails, to drive the
/// retry engine deterministically.
struct DownQueueController {
    lookups: AtomicU32,
}

#[async_trait]
impl QueueController for DownQueueController {
    async fn get_metadata(&self, _name: &str, _project: &str) -> Result<Metadata, StorageError> {
        self.lookups.fetch_add(1, SeqCst);
        Err(StorageError::Unavailable("metadata store is down".to_string()))
    }

    async fn create(&self, _name: &str, _project: &str) -> Result<bool, StorageError> {
        Err(StorageError::Unavailable("metadata store is down".to_string()))
    }
}

#[tokio::test(start_paused = true)]
async fn backoff_retry_exhausts_after_four_attempts_then_accounts_failure(
) -> Result<(), anyhow::Error> {
    let driver = Arc::new(MemoryDriver::new());
    let down = Arc::new(DownQueueController {
        lookups: AtomicU32::new(0),
    });
    let mut service = Service::new(
        StorageHandles {
            message: driver.clone(),
            queue: down.clone(),
            claim: driver.clone(),
            topic_store: driver.clone(),
            monitor_store: driver.clone(),
            subscription_store: driver,
        },
        Config::default(),
    );

    service.topics().create("alerts", "p1", Metadata::new()).await?;
    service
        .subscriptions()
        .create(
            "p1",
            "alerts",
            "queue://p1/jobs",
            3600,
            options(&[("push_policy", json!("BACKOFF_RETRY"))]),
        )
        .await?;

    let messages: Vec<Message> = (0..3).map(|i| Message::new(json!({"seq": i}))).collect();
    let total_kb = batch_size(&messages) as f64 / 1024.0;
    service.publish("p1", "alerts", messages, None).await?;

    // The paused clock races through the 10-20s backoff sleeps.
    let monitor = wait_for_monitor(&service, "alerts", MonitorType::Topics, "p1", |m| {
        m.count("total_sub_msg_counts") == 3
    })
    .await;
    assert_eq!(down.lookups.load(SeqCst), 4);
    assert!((monitor.kilobytes("total_sub_msg_bytes") - total_kb).abs() < 1e-9);

    service.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn exponential_decay_honors_the_configured_retry_budget() -> Result<(), anyhow::Error> {
    let driver = Arc::new(MemoryDriver::new());
    let down = Arc::new(DownQueueController {
        lookups: AtomicU32::new(0),
    });
    let mut config = Config::default();
    config.notification.max_notifier_retries = 2;
    let mut service = Service::new(
        StorageHandles {
            message: driver.clone(),
            queue: down.clone(),
            claim: driver.clone(),
            topic_store: driver.clone(),
            monitor_store: driver.clone(),
            subscription_store: driver,
        },
        config,
    );

    service.topics().create("alerts", "p1", Metadata::new()).await?;
    service
        .subscriptions()
        .create(
            "p1",
            "alerts",
            "queue://p1/jobs",
            3600,
            options(&[("push_policy", json!("EXPONENTIAL_DECAY_RETRY"))]),
        )
        .await?;

    service
        .publish("p1", "alerts", vec![Message::new(json!(1))], None)
        .await?;
    wait_for_monitor(&service, "alerts", MonitorType::Topics, "p1", |m| {
        m.count("total_sub_msg_counts") == 1
    })
    .await;
    assert_eq!(down.lookups.load(SeqCst), 3);

    service.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn one_subscription_failing_does_not_block_another() -> Result<(), anyhow::Error> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/good"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut service = Service::in_memory(Config::default());
    service.topics().create("alerts", "p1", Metadata::new()).await?;
    for hook in ["good", "bad"] {
        service
            .subscriptions()
            .create("p1", "alerts", &format!("{}/{}", server.uri(), hook), 3600, Metadata::new())
            .await?;
    }

    service
        .publish("p1", "alerts", vec![Message::new(json!(1))], None)
        .await?;
    let monitor = wait_for_monitor(&service, "alerts", MonitorType::Topics, "p1", |m| {
        m.count("sub_msg_counts") == 1 && m.count("total_sub_msg_counts") == 1
    })
    .await;
    assert_eq!(monitor.count("sub_msg_counts"), 1);

    service.shutdown().await;
    Ok(())
}
