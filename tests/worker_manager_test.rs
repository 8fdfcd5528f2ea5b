//! End-to-end broker behavior: pooling, queueing, idle retirement,
//! registration rules and error propagation.

mod common;

use futures::future::join_all;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;
use tokio_test::{assert_err, assert_ok};

use common::{test_factory, FailingInit, Script, ScriptedFactory};
use task_broker::prelude::*;

fn manager() -> WorkerManager {
    WorkerManager::new(BrokerConfig::default())
}

#[tokio::test]
async fn test_busy_instances_never_exceed_max() {
    let manager = manager();
    let (factory, concurrency) = test_factory();
    manager
        .register("sleep", factory, RegisterOptions::default().with_max_instances(2))
        .await
        .unwrap();

    let handles: Vec<_> = (0..6)
        .map(|tag| manager.dispatch("sleep", json!({"ms": 100, "tag": tag}), Vec::new()))
        .collect();

    let stats = manager.stats("sleep").await.unwrap().unwrap();
    assert_eq!(stats.busy, 2);
    assert_eq!(stats.queued, 4);

    let results = join_all(handles).await;
    assert!(results.iter().all(|result| result.is_ok()));
    assert!(concurrency.peak() <= 2);

    let stats = manager.stats("sleep").await.unwrap().unwrap();
    assert_eq!(stats.spawned_total, 2);
    assert_eq!(stats.completed_total, 6);
    assert_eq!(stats.busy, 0);
}

#[tokio::test]
async fn test_queued_work_runs_before_idle_expiry() {
    let manager = manager();
    let (factory, _) = test_factory();
    manager
        .register(
            "sleep",
            factory,
            RegisterOptions::default().with_idle_termination(Duration::from_millis(30)),
        )
        .await
        .unwrap();

    let first = manager.dispatch("sleep", json!({"ms": 100, "tag": 1}), Vec::new());
    let second = manager.dispatch("sleep", json!({"ms": 10, "tag": 2}), Vec::new());

    let first = first.await.unwrap();
    let second = second.await.unwrap();
    assert_eq!(first.payload["thread"], second.payload["thread"]);

    let stats = manager.stats("sleep").await.unwrap().unwrap();
    assert_eq!(stats.spawned_total, 1);
}

#[tokio::test]
async fn test_success_resolves_with_handler_payload() {
    let manager = manager();
    let (factory, _) = test_factory();
    manager
        .register("echo", factory, RegisterOptions::default())
        .await
        .unwrap();

    let payload = json!({"study": "1.2.3", "frames": [1, 2, 3], "nested": {"ok": true}});
    let output = manager.dispatch("echo", payload.clone(), Vec::new()).await.unwrap();
    assert_eq!(output.payload, payload);
}

#[tokio::test]
async fn test_failure_rejects_with_description() {
    let manager = manager();
    let (factory, _) = test_factory();
    manager
        .register("fail", factory, RegisterOptions::default())
        .await
        .unwrap();

    let result = manager
        .dispatch("fail", json!({"message": "corrupt header"}), Vec::new())
        .await;
    assert_eq!(
        result.unwrap_err(),
        BrokerError::Handler {
            message: "corrupt header".to_string()
        }
    );

    let stats = manager.stats("fail").await.unwrap().unwrap();
    assert_eq!(stats.failed_total, 1);
    assert_eq!(stats.instances, 1);
}

#[tokio::test]
async fn test_panicking_handler_rejects_and_instance_survives() {
    let manager = manager();
    let (factory, _) = test_factory();
    manager
        .register("panic", factory, RegisterOptions::default())
        .await
        .unwrap();

    match manager.dispatch("panic", json!(null), Vec::new()).await {
        Err(BrokerError::Handler { message }) => assert!(message.contains("module exploded")),
        other => panic!("expected handler error, got {other:?}"),
    }
    assert_err!(manager.dispatch("panic", json!(null), Vec::new()).await);

    let stats = manager.stats("panic").await.unwrap().unwrap();
    assert_eq!(stats.spawned_total, 1);
}

#[tokio::test]
async fn test_idle_instance_is_destroyed() {
    let manager = manager();
    let (factory, _) = test_factory();
    manager
        .register(
            "echo",
            factory,
            RegisterOptions::default().with_idle_termination(Duration::from_millis(150)),
        )
        .await
        .unwrap();

    manager.dispatch("echo", json!(1), Vec::new()).await.unwrap();
    assert_eq!(manager.stats("echo").await.unwrap().unwrap().instances, 1);

    sleep(Duration::from_millis(400)).await;
    let stats = manager.stats("echo").await.unwrap().unwrap();
    assert_eq!(stats.instances, 0);
    assert_eq!(stats.spawned_total, 1);
}

#[tokio::test]
async fn test_dispatch_before_expiry_cancels_timer() {
    let manager = manager();
    let (factory, _) = test_factory();
    manager
        .register(
            "echo",
            factory,
            RegisterOptions::default().with_idle_termination(Duration::from_millis(300)),
        )
        .await
        .unwrap();

    manager.dispatch("echo", json!(1), Vec::new()).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    manager.dispatch("echo", json!(2), Vec::new()).await.unwrap();

    // Past the first timer's deadline, inside the re-armed one
    sleep(Duration::from_millis(200)).await;
    let stats = manager.stats("echo").await.unwrap().unwrap();
    assert_eq!(stats.instances, 1);
    assert_eq!(stats.spawned_total, 1);

    sleep(Duration::from_millis(400)).await;
    assert_eq!(manager.stats("echo").await.unwrap().unwrap().instances, 0);
}

#[tokio::test]
async fn test_reregister_without_overwrite_fails() {
    let manager = manager();
    let (factory, _) = test_factory();
    let (again, _) = test_factory();
    manager
        .register("echo", factory, RegisterOptions::default())
        .await
        .unwrap();

    let result = manager.register("echo", again, RegisterOptions::default()).await;
    assert_eq!(
        result.unwrap_err(),
        BrokerError::AlreadyRegistered {
            task_type: "echo".to_string()
        }
    );

    // Original registration untouched
    assert_ok!(manager.dispatch("echo", json!(1), Vec::new()).await);
}

#[tokio::test]
async fn test_overwrite_terminates_old_pool() {
    let manager = manager();
    let (factory, _) = test_factory();
    manager
        .register("sleep", factory, RegisterOptions::default())
        .await
        .unwrap();

    let in_flight = manager.dispatch("sleep", json!({"ms": 300, "tag": "old"}), Vec::new());
    let queued = manager.dispatch("sleep", json!({"ms": 300, "tag": "old"}), Vec::new());
    let in_flight_id = in_flight.correlation_id();

    let (replacement, _) = test_factory();
    manager
        .register(
            "sleep",
            replacement,
            RegisterOptions::default().with_overwrite(true).with_max_instances(3),
        )
        .await
        .unwrap();

    assert_eq!(
        in_flight.await.unwrap_err(),
        BrokerError::Terminated {
            correlation_id: in_flight_id
        }
    );
    assert!(matches!(queued.await, Err(BrokerError::Terminated { .. })));

    let stats = manager.stats("sleep").await.unwrap().unwrap();
    assert_eq!(stats.max_instances, 3);
    assert_eq!(stats.spawned_total, 0);

    let output = manager
        .dispatch("sleep", json!({"ms": 1, "tag": "new"}), Vec::new())
        .await
        .unwrap();
    assert_eq!(output.payload["tag"], json!("new"));
}

#[tokio::test]
async fn test_transferred_buffer_round_trips() {
    let manager = manager();
    let (factory, _) = test_factory();
    manager
        .register("echo", factory, RegisterOptions::default())
        .await
        .unwrap();

    let original: Vec<u8> = (0..1_048_576u32).map(|i| (i * 31 % 251) as u8).collect();
    let buffers = vec![
        TransferBuffer::new(original.clone()),
        TransferBuffer::new(vec![0xde, 0xad]),
    ];

    let output = manager.dispatch("echo", json!(null), buffers).await.unwrap();
    assert_eq!(output.transfer.len(), 2);
    assert_eq!(output.transfer[0].as_slice(), original.as_slice());
    assert_eq!(output.transfer[1].as_slice(), &[0xde, 0xad]);
}

#[tokio::test]
async fn test_unknown_task_type_creates_nothing() {
    let manager = manager();

    let result = manager.dispatch("nope", json!({}), Vec::new()).await;
    assert_eq!(
        result.unwrap_err(),
        BrokerError::UnknownTaskType {
            task_type: "nope".to_string()
        }
    );
    assert_eq!(manager.stats("nope").await.unwrap(), None);
    assert!(manager.registered_task_types().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_terminate_rejects_pending_and_keeps_registration() {
    let manager = manager();
    let (factory, _) = test_factory();
    manager
        .register("sleep", factory, RegisterOptions::default())
        .await
        .unwrap();

    let pending = manager.dispatch("sleep", json!({"ms": 300, "tag": 1}), Vec::new());
    manager.terminate("sleep").await.unwrap();
    assert!(matches!(pending.await, Err(BrokerError::Terminated { .. })));

    let stats = manager.stats("sleep").await.unwrap().unwrap();
    assert_eq!(stats.instances, 0);

    let output = manager
        .dispatch("sleep", json!({"ms": 1, "tag": 2}), Vec::new())
        .await
        .unwrap();
    assert_eq!(output.payload["tag"], json!(2));
    assert_eq!(manager.stats("sleep").await.unwrap().unwrap().spawned_total, 2);

    assert_eq!(
        manager.terminate("missing").await.unwrap_err(),
        BrokerError::UnknownTaskType {
            task_type: "missing".to_string()
        }
    );
}

#[tokio::test]
async fn test_terminate_all_covers_every_task_type() {
    let manager = manager();
    let (sleep_factory, _) = test_factory();
    let (echo_factory, _) = test_factory();
    manager
        .register("sleep", sleep_factory, RegisterOptions::default())
        .await
        .unwrap();
    manager
        .register("echo", echo_factory, RegisterOptions::default())
        .await
        .unwrap();

    manager.dispatch("echo", json!(1), Vec::new()).await.unwrap();
    let pending = manager.dispatch("sleep", json!({"ms": 300, "tag": 1}), Vec::new());

    manager.terminate_all().await.unwrap();
    assert!(matches!(pending.await, Err(BrokerError::Terminated { .. })));
    assert_eq!(manager.stats("echo").await.unwrap().unwrap().instances, 0);
    assert_eq!(
        manager.registered_task_types().await.unwrap(),
        vec!["echo".to_string(), "sleep".to_string()]
    );
}

#[tokio::test]
async fn test_unregister_removes_task_type() {
    let manager = manager();
    let (factory, _) = test_factory();
    manager
        .register("echo", factory, RegisterOptions::default())
        .await
        .unwrap();

    assert_ok!(manager.unregister("echo").await);
    assert!(matches!(
        manager.dispatch("echo", json!(1), Vec::new()).await,
        Err(BrokerError::UnknownTaskType { .. })
    ));
    assert!(matches!(
        manager.unregister("echo").await,
        Err(BrokerError::UnknownTaskType { .. })
    ));
}

#[tokio::test]
async fn test_timeout_drains_late_response() {
    let manager = manager();
    let (factory, _) = test_factory();
    manager
        .register("sleep", factory, RegisterOptions::default())
        .await
        .unwrap();

    let handle = manager.dispatch("sleep", json!({"ms": 200, "tag": 1}), Vec::new());
    let id = handle.correlation_id();
    let result = handle.with_timeout(Duration::from_millis(20)).await;
    assert_eq!(
        result.unwrap_err(),
        BrokerError::Timeout {
            correlation_id: id,
            timeout: Duration::from_millis(20)
        }
    );

    sleep(Duration::from_millis(350)).await;
    let stats = manager.stats("sleep").await.unwrap().unwrap();
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.completed_total, 1);

    // Same instance picks up new work once the late response is drained
    manager
        .dispatch("sleep", json!({"ms": 1, "tag": 2}), Vec::new())
        .with_timeout(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(manager.stats("sleep").await.unwrap().unwrap().spawned_total, 1);
}

#[tokio::test]
async fn test_initialization_failure_retires_instance() {
    let manager = manager();
    manager
        .register(
            "broken",
            ThreadFactory::new(|| HandlerRegistry::new().with("broken", FailingInit)),
            RegisterOptions::default(),
        )
        .await
        .unwrap();

    match manager.dispatch("broken", json!(null), Vec::new()).await {
        Err(BrokerError::Initialization { task_type, message }) => {
            assert_eq!(task_type, "broken");
            assert!(message.contains("codec library missing"));
        }
        other => panic!("expected initialization error, got {other:?}"),
    }

    let stats = manager.stats("broken").await.unwrap().unwrap();
    assert_eq!(stats.instances, 0);
    assert_eq!(stats.failed_total, 1);

    assert!(matches!(
        manager.dispatch("broken", json!(null), Vec::new()).await,
        Err(BrokerError::Initialization { .. })
    ));
    assert_eq!(manager.stats("broken").await.unwrap().unwrap().spawned_total, 2);
}

#[tokio::test]
async fn test_malformed_response_rejects_only_that_request() {
    let manager = manager();
    manager
        .register("bogus", ScriptedFactory(Script::BogusStatus), RegisterOptions::default())
        .await
        .unwrap();
    let (factory, _) = test_factory();
    manager
        .register("echo", factory, RegisterOptions::default())
        .await
        .unwrap();

    let handle = manager.dispatch("bogus", json!(1), Vec::new());
    let id = handle.correlation_id();
    match handle.await {
        Err(BrokerError::MalformedResponse {
            correlation_id,
            reason,
        }) => {
            assert_eq!(correlation_id, id);
            assert!(reason.contains("exploded"));
        }
        other => panic!("expected malformed response, got {other:?}"),
    }

    // Broker keeps serving
    assert!(manager.dispatch("echo", json!(2), Vec::new()).await.is_ok());
    assert_err!(manager.dispatch("bogus", json!(3), Vec::new()).await);
}

#[tokio::test]
async fn test_unmatched_response_is_ignored() {
    let manager = manager();
    manager
        .register("stray", ScriptedFactory(Script::StrayThenEcho), RegisterOptions::default())
        .await
        .unwrap();

    let output = manager.dispatch("stray", json!({"n": 7}), Vec::new()).await.unwrap();
    assert_eq!(output.payload, json!({"n": 7}));
    assert!(manager.dispatch("stray", json!(8), Vec::new()).await.is_ok());
}

#[tokio::test]
async fn test_shutdown_terminates_and_stops() {
    let manager = manager();
    let (factory, _) = test_factory();
    manager
        .register("sleep", factory, RegisterOptions::default())
        .await
        .unwrap();

    let pending = manager.dispatch("sleep", json!({"ms": 300, "tag": 1}), Vec::new());
    manager.shutdown().await.unwrap();

    assert!(matches!(pending.await, Err(BrokerError::Terminated { .. })));
    assert_eq!(
        manager.dispatch("sleep", json!(null), Vec::new()).await.unwrap_err(),
        BrokerError::BrokerShutdown
    );
}

#[tokio::test]
async fn test_invalid_options_rejected_before_registration() {
    let manager = manager();
    let (factory, _) = test_factory();

    let result = manager
        .register("echo", factory, RegisterOptions::default().with_max_instances(0))
        .await;
    assert!(matches!(result, Err(BrokerError::InvalidOptions { .. })));
    assert!(manager.registered_task_types().await.unwrap().is_empty());
}
