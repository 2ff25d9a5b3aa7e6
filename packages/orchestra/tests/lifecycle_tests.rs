//! End-to-end lifecycle: enqueue → lease → execute → terminal state,
//! including retries, chaining, and the full worker loop.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::World;
use orchestra::{Clock, CommandStore, HandlerError, HandlerRegistry, NewCommand, OrchestraConfig};

#[tokio::test]
async fn test_happy_path_completes_with_output() {
    let world = World::new();
    let mut registry = HandlerRegistry::new();
    registry.register("send_email", |input: String, _cancel| async move {
        assert_eq!(input, "e1");
        Ok(Some("ok".to_string()))
    });
    let registry = Arc::new(registry);
    let executor = world.executor(registry.clone());
    let host = world.host(registry);

    let id = host
        .queue()
        .enqueue(
            NewCommand::named("send_email")
                .input(&"e1")
                .unwrap()
                .timeout(Duration::from_secs(5))
                .retries(3),
        )
        .await
        .unwrap();

    let attempts = world.run_until_terminal(&executor, "default", id, 5).await;

    let row = world.store.get(id).unwrap();
    assert_eq!(attempts, 1);
    // Enqueue and completion observe the same row identity
    assert_eq!(row.id, id);
    assert!(row.is_completed);
    assert_eq!(row.output.as_deref(), Some("ok"));
    assert_eq!(row.retries_left, 3);
    assert!(!row.is_running && row.run_expires_at.is_none());
}

#[tokio::test]
async fn test_retry_then_fail_exhausts_budget() {
    let world = World::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register("api_call", {
        let calls = calls.clone();
        move |_input: (), _cancel| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::Other(anyhow::anyhow!("upstream 500")))
            }
        }
    });
    let registry = Arc::new(registry);
    let executor = world.executor(registry.clone());
    let host = world.host(registry);

    let id = host
        .queue()
        .enqueue(NewCommand::named("api_call").retries(2))
        .await
        .unwrap();

    let attempts = world.run_until_terminal(&executor, "default", id, 10).await;

    let row = world.store.get(id).unwrap();
    assert_eq!(attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(row.is_failed);
    assert_eq!(row.retries_left, -1);
    assert!(!row.is_completed && !row.is_canceled);
}

#[tokio::test]
async fn test_retry_then_succeed_keeps_remaining_budget() {
    let world = World::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register("api_call", {
        let calls = calls.clone();
        move |_input: (), _cancel| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(HandlerError::Other(anyhow::anyhow!("flaky")))
                } else {
                    Ok(Some("done".to_string()))
                }
            }
        }
    });
    let registry = Arc::new(registry);
    let executor = world.executor(registry.clone());
    let host = world.host(registry);

    let id = host
        .queue()
        .enqueue(NewCommand::named("api_call").retries(2))
        .await
        .unwrap();

    let attempts = world.run_until_terminal(&executor, "default", id, 10).await;

    let row = world.store.get(id).unwrap();
    assert_eq!(attempts, 3);
    assert!(row.is_completed);
    assert_eq!(row.retries_left, 0);
    assert_eq!(row.output.as_deref(), Some("done"));
}

#[tokio::test]
async fn test_zero_retries_fails_after_single_attempt() {
    let world = World::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register("one_shot", {
        let calls = calls.clone();
        move |_input: (), _cancel| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::Other(anyhow::anyhow!("no")))
            }
        }
    });
    let registry = Arc::new(registry);
    let executor = world.executor(registry.clone());
    let host = world.host(registry);

    let id = host
        .queue()
        .enqueue(NewCommand::named("one_shot").retries(0))
        .await
        .unwrap();

    world.run_until_terminal(&executor, "default", id, 5).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(world.store.get(id).unwrap().is_failed);
}

#[tokio::test]
async fn test_unregistered_name_fails_through_retry_path() {
    let world = World::new();
    let registry = Arc::new(HandlerRegistry::new());
    let executor = world.executor(registry.clone());
    let host = world.host(registry);

    let id = host
        .queue()
        .enqueue(NewCommand::named("nobody_home").retries(1))
        .await
        .unwrap();

    let attempts = world.run_until_terminal(&executor, "default", id, 10).await;

    let row = world.store.get(id).unwrap();
    // NotFound rides the fail path: budget spent attempt by attempt
    assert_eq!(attempts, 2);
    assert!(row.is_failed);
    assert_eq!(row.retries_left, -1);
}

#[tokio::test]
async fn test_panicking_handler_is_contained_and_fails() {
    let world = World::new();
    let mut registry = HandlerRegistry::new();
    registry.register("kaboom", |_input: (), _cancel| async move {
        panic!("handler bug");
    });
    let registry = Arc::new(registry);
    let executor = world.executor(registry.clone());
    let host = world.host(registry);

    let id = host
        .queue()
        .enqueue(NewCommand::named("kaboom").retries(0))
        .await
        .unwrap();

    world.run_until_terminal(&executor, "default", id, 5).await;
    assert!(world.store.get(id).unwrap().is_failed);
}

#[tokio::test]
async fn test_success_chains_successor_then_successor_runs() {
    let world = World::new();
    let mut registry = HandlerRegistry::new();
    registry
        .register("process_order", |_input: (), _cancel| async move {
            Ok(Some("order-1".to_string()))
        })
        .on_success(NewCommand::named("send_email"));
    registry.register("send_email", |_input: (), _cancel| async move {
        Ok(Some("sent".to_string()))
    });
    let registry = Arc::new(registry);
    let executor = world.executor(registry.clone());
    let host = world.host(registry);

    let parent = host
        .queue()
        .enqueue(NewCommand::named("process_order"))
        .await
        .unwrap();

    world.run_until_terminal(&executor, "default", parent, 5).await;

    // Parent decided and successor present in the same snapshot
    let rows = world.store.snapshot();
    assert_eq!(rows.len(), 2);
    let successor = rows.iter().find(|r| r.name == "send_email").unwrap();
    assert!(!successor.is_terminal());
    assert_eq!(successor.scheduled_at, world.clock.now());

    // The successor then executes to completion like any other command
    let successor_id = successor.id;
    world
        .run_until_terminal(&executor, "default", successor_id, 5)
        .await;
    let successor = world.store.get(successor_id).unwrap();
    assert!(successor.is_completed);
    assert_eq!(successor.output.as_deref(), Some("sent"));
}

#[tokio::test]
async fn test_failure_chain_fires_only_on_terminal_failure() {
    let world = World::new();
    let mut registry = HandlerRegistry::new();
    registry
        .register("flaky", |_input: (), _cancel| async move {
            Err::<Option<String>, _>(HandlerError::Other(anyhow::anyhow!("boom")))
        })
        .on_failure(NewCommand::named("alert_ops"));
    let registry = Arc::new(registry);
    let executor = world.executor(registry.clone());
    let host = world.host(registry);

    let id = host
        .queue()
        .enqueue(NewCommand::named("flaky").retries(1))
        .await
        .unwrap();

    // First attempt: retry remains, no successor yet
    let command = world
        .store
        .acquire("default", world.config.lock_timeout_buffer)
        .await
        .unwrap()
        .unwrap();
    executor
        .execute(command, tokio_util::sync::CancellationToken::new())
        .await;
    assert_eq!(world.store.snapshot().len(), 1);

    // Second attempt exhausts the budget and enqueues the alert
    world.run_until_terminal(&executor, "default", id, 5).await;
    let rows = world.store.snapshot();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|r| r.name == "alert_ops" && !r.is_terminal()));
}

#[tokio::test]
async fn test_worker_loop_executes_enqueued_commands() {
    let world = World::with_config(OrchestraConfig {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    });
    let mut registry = HandlerRegistry::new();
    registry.register("tick", |_input: (), _cancel| async move {
        Ok(Some("tock".to_string()))
    });
    let host = world.host(Arc::new(registry));
    host.start();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(host.queue().enqueue(NewCommand::named("tick")).await.unwrap());
    }

    let all_done = world
        .wait_for(Duration::from_secs(5), |store| {
            ids.iter()
                .all(|id| store.get(*id).map(|r| r.is_completed).unwrap_or(false))
        })
        .await;
    host.stop().await;

    assert!(all_done, "worker should complete all enqueued commands");
    for id in ids {
        assert_eq!(world.store.get(id).unwrap().output.as_deref(), Some("tock"));
    }
}

#[tokio::test]
async fn test_shutdown_cancels_running_command() {
    let world = World::with_config(OrchestraConfig {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    });
    let started = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry.register("long_haul", {
        let started = started.clone();
        move |_input: (), cancel: tokio_util::sync::CancellationToken| {
            let started = started.clone();
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                cancel.cancelled().await;
                Err(HandlerError::Cancelled)
            }
        }
    });
    let host = world.host(Arc::new(registry));
    host.start();

    let id = host
        .queue()
        .enqueue(NewCommand::named("long_haul"))
        .await
        .unwrap();

    let running = world
        .wait_for(Duration::from_secs(5), |_| {
            started.load(Ordering::SeqCst) == 1
        })
        .await;
    assert!(running, "handler should have started");

    // Stop while the handler is parked on its cancellation token: the
    // terminal write still happens before stop returns
    host.stop().await;

    let row = world.store.get(id).unwrap();
    assert!(row.is_canceled);
    assert!(!row.is_running && row.run_expires_at.is_none());
    // The cancel path never spends retries
    assert_eq!(row.retries_left, world.config.default_retries);
}

#[tokio::test]
async fn test_cancellation_chain_runs_on_shutdown() {
    let world = World::with_config(OrchestraConfig {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    });
    let started = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    registry
        .register("long_haul", {
            let started = started.clone();
            move |_input: (), cancel: tokio_util::sync::CancellationToken| {
                let started = started.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    cancel.cancelled().await;
                    Err(HandlerError::Cancelled)
                }
            }
        })
        .on_cancellation(NewCommand::named("release_hold"));
    let host = world.host(Arc::new(registry));
    host.start();

    host.queue()
        .enqueue(NewCommand::named("long_haul"))
        .await
        .unwrap();
    world
        .wait_for(Duration::from_secs(5), |_| {
            started.load(Ordering::SeqCst) == 1
        })
        .await;
    host.stop().await;

    let rows = world.store.snapshot();
    assert!(rows.iter().any(|r| r.name == "release_hold" && !r.is_terminal()));
}
