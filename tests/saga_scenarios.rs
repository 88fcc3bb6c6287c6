//! End-to-end transaction scenarios: success, rollback, retry, timeout,
//! cancellation, and selector reactivity.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sagaflow::{
    EventKind, SagaConfig, SagaError, SagaManager, Step, StepContext, StepError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Bank {
    balance: i64,
    last_id: Option<String>,
}

impl Bank {
    fn opening() -> Self {
        Self {
            balance: 1000,
            last_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct Xfer {
    amt: i64,
    id: String,
}

fn record_events(manager: &SagaManager<Bank>) -> Arc<Mutex<Vec<String>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    manager
        .on_any_event(move |event| {
            sink.lock().unwrap().push(event.kind().to_string());
        })
        .unwrap();
    events
}

#[tokio::test]
async fn successful_transaction_commits_all_steps() {
    let manager = SagaManager::new(Bank::opening());
    let events = record_events(&manager);

    manager
        .create_transaction::<Xfer>("xfer")
        .add_simple_step("deduct", |ctx: StepContext<Bank, Xfer>| async move {
            let amt = ctx.payload().amt;
            ctx.update(|s| s.balance -= amt);
            Ok::<(), StepError>(())
        })
        .add_simple_step("record", |ctx: StepContext<Bank, Xfer>| async move {
            let id = ctx.payload().id.clone();
            ctx.update(|s| s.last_id = Some(id));
            Ok::<(), StepError>(())
        })
        .run(Xfer {
            amt: 100,
            id: "tx1".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(
        manager.get_state().unwrap(),
        Bank {
            balance: 900,
            last_id: Some("tx1".to_string()),
        }
    );
    assert_eq!(manager.committed_version().unwrap(), 1);
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            "transaction:start",
            "step:start",
            "step:success",
            "step:start",
            "step:success",
            "transaction:success",
            "transaction:complete",
        ]
    );
}

#[tokio::test]
async fn failed_step_rolls_back_in_reverse_order() {
    let manager = SagaManager::new(Bank::opening());
    let events = record_events(&manager);
    let rollback_order = Arc::new(Mutex::new(Vec::new()));

    let order = rollback_order.clone();
    let result = manager
        .create_transaction::<Xfer>("xfer")
        .add_step(
            Step::new("deduct", |ctx: StepContext<Bank, Xfer>| async move {
                let amt = ctx.payload().amt;
                ctx.update(|s| s.balance -= amt);
                Ok::<(), StepError>(())
            })
            .with_compensation(move |ctx: StepContext<Bank, Xfer>| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push("undo-deduct");
                    let amt = ctx.payload().amt;
                    ctx.update(|s| s.balance += amt);
                    Ok::<(), StepError>(())
                }
            }),
        )
        .add_simple_step("record", |_ctx: StepContext<Bank, Xfer>| async move {
            Err::<(), StepError>("ledger unavailable".into())
        })
        .run(Xfer {
            amt: 100,
            id: "tx1".to_string(),
        })
        .await;

    assert!(matches!(result, Err(SagaError::StepFailed { .. })));
    // Full rollback: pre-transaction state restored
    assert_eq!(manager.get_state().unwrap(), Bank::opening());
    assert_eq!(manager.committed_version().unwrap(), 0);
    assert_eq!(*rollback_order.lock().unwrap(), vec!["undo-deduct"]);

    let seen = events.lock().unwrap();
    assert!(seen.contains(&"transaction:rollback".to_string()));
    assert!(seen.contains(&"step:rollback".to_string()));
    assert!(seen.contains(&"transaction:fail".to_string()));
    assert_eq!(seen.last().unwrap(), "transaction:complete");
    assert!(!seen.contains(&"transaction:success".to_string()));
}

#[tokio::test]
async fn compensations_run_in_reverse_and_survive_failures() {
    let manager = SagaManager::new(Bank::opening());
    let rollback_order = Arc::new(Mutex::new(Vec::new()));
    let rollback_errors = Arc::new(Mutex::new(Vec::new()));

    let errors = rollback_errors.clone();
    manager
        .on_event(EventKind::StepRollback, move |event| {
            if let sagaflow::EventBody::StepRollback {
                step_name,
                compensation_error,
                ..
            } = &event.body
            {
                errors
                    .lock()
                    .unwrap()
                    .push((step_name.clone(), compensation_error.is_some()));
            }
        })
        .unwrap();

    let first = rollback_order.clone();
    let second = rollback_order.clone();
    let result = manager
        .create_transaction::<()>("multi")
        .add_step(
            Step::new("one", |ctx: StepContext<Bank, ()>| async move {
                ctx.update(|s| s.balance -= 1);
                Ok::<(), StepError>(())
            })
            .with_compensation(move |_ctx| {
                let order = first.clone();
                async move {
                    order.lock().unwrap().push("undo-one");
                    Ok::<(), StepError>(())
                }
            }),
        )
        .add_step(
            Step::new("two", |ctx: StepContext<Bank, ()>| async move {
                ctx.update(|s| s.balance -= 2);
                Ok::<(), StepError>(())
            })
            .with_compensation(move |_ctx| {
                let order = second.clone();
                async move {
                    order.lock().unwrap().push("undo-two");
                    Err::<(), StepError>("compensation broke".into())
                }
            }),
        )
        .add_simple_step("three", |_ctx: StepContext<Bank, ()>| async move {
            Err::<(), StepError>("boom".into())
        })
        .run(())
        .await;

    assert!(result.is_err());
    // Reverse order, and the failing compensation did not stop the unwind
    assert_eq!(*rollback_order.lock().unwrap(), vec!["undo-two", "undo-one"]);
    assert_eq!(
        *rollback_errors.lock().unwrap(),
        vec![("two".to_string(), true), ("one".to_string(), false)]
    );
    assert_eq!(manager.get_state().unwrap(), Bank::opening());
}

#[tokio::test]
async fn flaky_step_retries_against_clean_state() {
    let manager = SagaManager::new(Bank::opening());
    let events = record_events(&manager);
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = attempts.clone();
    manager
        .create_transaction::<()>("flaky")
        .add_step(
            Step::new("flaky", move |ctx: StepContext<Bank, ()>| {
                let counter = counter.clone();
                async move {
                    // Every attempt must observe the pre-step snapshot
                    assert_eq!(ctx.state().balance, 1000);
                    ctx.update(|s| s.balance -= 500);
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err::<(), StepError>(format!("attempt {n} failed").into())
                    } else {
                        Ok(())
                    }
                }
            })
            .with_retries(2),
        )
        .run(())
        .await
        .unwrap();

    // Exactly three executions, one successful application
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(manager.get_state().unwrap().balance, 500);
    assert_eq!(
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|kind| kind.as_str() == "step:retry")
            .count(),
        2
    );
}

#[tokio::test]
async fn retries_exhausted_fails_the_transaction() {
    let manager = SagaManager::new(Bank::opening());

    let result = manager
        .create_transaction::<()>("stubborn")
        .add_step(
            Step::new("always-fails", |_ctx: StepContext<Bank, ()>| async move {
                Err::<(), StepError>("nope".into())
            })
            .with_retries(1),
        )
        .run(())
        .await;

    assert!(matches!(result, Err(SagaError::StepFailed { .. })));
    assert_eq!(manager.get_state().unwrap(), Bank::opening());
}

#[tokio::test(start_paused = true)]
async fn slow_step_times_out_and_rolls_back() {
    let manager = SagaManager::new(Bank::opening());

    let result = manager
        .create_transaction::<()>("slow")
        .add_step(
            Step::new("sleepy", |ctx: StepContext<Bank, ()>| async move {
                ctx.update(|s| s.balance = 0);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<(), StepError>(())
            })
            .with_timeout(Duration::from_millis(50)),
        )
        .run(())
        .await;

    match result {
        Err(SagaError::Timeout { step, timeout_ms }) => {
            assert_eq!(step, "sleepy");
            assert_eq!(timeout_ms, 50);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(manager.get_state().unwrap(), Bank::opening());
}

#[tokio::test(start_paused = true)]
async fn timed_out_step_can_retry_and_succeed() {
    let manager = SagaManager::new(Bank::opening());
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = attempts.clone();
    manager
        .create_transaction::<()>("warmup")
        .add_step(
            Step::new("warms-up", move |ctx: StepContext<Bank, ()>| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    ctx.update(|s| s.balance -= 1);
                    Ok::<(), StepError>(())
                }
            })
            .with_timeout(Duration::from_millis(50))
            .with_retries(1),
        )
        .run(())
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(manager.get_state().unwrap().balance, 999);
}

#[tokio::test]
async fn cancellation_between_steps_rolls_back() {
    let manager = SagaManager::new(Bank::opening());
    let events = record_events(&manager);
    let compensated = Arc::new(AtomicU32::new(0));

    let builder = manager.create_transaction::<()>("two-phase");
    let token = builder.cancel_token();

    let compensated_clone = compensated.clone();
    let result = builder
        .add_step(
            Step::new("first", move |ctx: StepContext<Bank, ()>| {
                let token = token.clone();
                async move {
                    ctx.update(|s| s.balance -= 100);
                    // Caller cancels after the first step succeeds
                    token.cancel();
                    Ok::<(), StepError>(())
                }
            })
            .with_compensation(move |ctx: StepContext<Bank, ()>| {
                let compensated = compensated_clone.clone();
                async move {
                    compensated.fetch_add(1, Ordering::SeqCst);
                    ctx.update(|s| s.balance += 100);
                    Ok::<(), StepError>(())
                }
            }),
        )
        .add_simple_step("second", |_ctx: StepContext<Bank, ()>| async move {
            panic!("second step must never start");
            #[allow(unreachable_code)]
            Ok::<(), StepError>(())
        })
        .run(())
        .await;

    assert!(matches!(result, Err(SagaError::Cancelled { .. })));
    assert_eq!(compensated.load(Ordering::SeqCst), 1);
    assert_eq!(manager.get_state().unwrap(), Bank::opening());

    let seen = events.lock().unwrap();
    assert!(seen.contains(&"transaction:fail".to_string()));
    assert!(!seen.contains(&"transaction:success".to_string()));
}

#[tokio::test]
async fn selector_fires_only_on_projected_change() {
    let manager = SagaManager::new(Bank::opening());
    let balances = manager.select(|s: &Bank| s.balance).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    balances.subscribe(move |next, prev| {
        sink.lock().unwrap().push((*next, prev.copied()));
    });

    // Commit that does not touch the projection
    manager
        .create_transaction::<()>("rename")
        .add_void_step("tag", |s| s.last_id = Some("noop".to_string()))
        .run(())
        .await
        .unwrap();
    assert!(seen.lock().unwrap().is_empty());

    // Commit that changes the projection
    manager
        .create_transaction::<()>("spend")
        .add_void_step("spend", |s| s.balance = 700)
        .run(())
        .await
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![(700, Some(1000))]);
}

#[tokio::test]
async fn selector_notifications_precede_transaction_success() {
    let manager = SagaManager::new(Bank::opening());
    let order = Arc::new(Mutex::new(Vec::new()));

    let balances = manager.select(|s: &Bank| s.balance).unwrap();
    let selector_order = order.clone();
    balances.subscribe(move |_, _| {
        selector_order.lock().unwrap().push("selector");
    });
    let event_order = order.clone();
    manager
        .on_event(EventKind::TransactionSuccess, move |_| {
            event_order.lock().unwrap().push("success-event");
        })
        .unwrap();

    manager
        .create_transaction::<()>("spend")
        .add_void_step("spend", |s| s.balance -= 1)
        .run(())
        .await
        .unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["selector", "success-event"]);
}

#[tokio::test]
async fn undo_redo_walk_commit_history() {
    let manager = SagaManager::new(Bank::opening());

    for amount in [100, 200] {
        manager
            .create_transaction::<i64>("spend")
            .add_simple_step("spend", |ctx: StepContext<Bank, i64>| async move {
                let amt = *ctx.payload();
                ctx.update(|s| s.balance -= amt);
                Ok::<(), StepError>(())
            })
            .run(amount)
            .await
            .unwrap();
    }
    assert_eq!(manager.get_state().unwrap().balance, 700);

    assert!(manager.undo().unwrap());
    assert_eq!(manager.get_state().unwrap().balance, 900);
    assert!(manager.redo().unwrap());
    assert_eq!(manager.get_state().unwrap().balance, 700);
    // undo();redo() round-trips with no commit in between
    assert!(!manager.redo().unwrap());

    // A new commit after undo truncates the redo tail
    manager.undo().unwrap();
    manager
        .create_transaction::<()>("replace")
        .add_void_step("set", |s| s.balance = 1)
        .run(())
        .await
        .unwrap();
    assert!(!manager.redo().unwrap());
    assert_eq!(manager.get_state().unwrap().balance, 1);
}

#[tokio::test]
async fn panicking_event_listener_does_not_break_the_run() {
    let manager = SagaManager::new(Bank::opening());
    let delivered = Arc::new(AtomicU32::new(0));

    manager
        .on_event(EventKind::TransactionStart, |_| {
            panic!("listener bug");
        })
        .unwrap();
    let delivered_clone = delivered.clone();
    manager
        .on_event(EventKind::TransactionStart, move |_| {
            delivered_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    manager
        .create_transaction::<()>("spend")
        .add_void_step("spend", |s| s.balance -= 1)
        .run(())
        .await
        .unwrap();

    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(manager.get_state().unwrap().balance, 999);
}

#[tokio::test]
async fn queued_transactions_run_in_fifo_order() {
    let manager = SagaManager::new(Bank::opening());
    let started = Arc::new(tokio::sync::Notify::new());
    let gate = Arc::new(tokio::sync::Notify::new());

    let first = {
        let manager = manager.clone();
        let started = started.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            manager
                .create_transaction::<()>("first")
                .add_simple_step("hold", move |ctx: StepContext<Bank, ()>| {
                    let started = started.clone();
                    let gate = gate.clone();
                    async move {
                        started.notify_one();
                        gate.notified().await;
                        ctx.update(|s| s.last_id = Some("first".to_string()));
                        Ok::<(), StepError>(())
                    }
                })
                .run(())
                .await
        })
    };

    started.notified().await;
    let second = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .create_transaction::<()>("second")
                .add_void_step("mark", |s| s.last_id = Some("second".to_string()))
                .run(())
                .await
        })
    };

    // Let the second run queue behind the first, then release the gate
    tokio::task::yield_now().await;
    gate.notify_one();

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(
        manager.get_state().unwrap().last_id,
        Some("second".to_string())
    );
    assert_eq!(manager.committed_version().unwrap(), 2);
}

#[tokio::test]
async fn busy_mode_rejects_concurrent_runs() {
    let config = SagaConfig {
        queue_transactions: false,
        ..SagaConfig::default()
    };
    let manager = SagaManager::with_config(Bank::opening(), config);
    let started = Arc::new(tokio::sync::Notify::new());
    let gate = Arc::new(tokio::sync::Notify::new());

    let first = {
        let manager = manager.clone();
        let started = started.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            manager
                .create_transaction::<()>("first")
                .add_simple_step("hold", move |_ctx: StepContext<Bank, ()>| {
                    let started = started.clone();
                    let gate = gate.clone();
                    async move {
                        started.notify_one();
                        gate.notified().await;
                        Ok::<(), StepError>(())
                    }
                })
                .run(())
                .await
        })
    };

    started.notified().await;
    let result = manager
        .create_transaction::<()>("second")
        .add_void_step("mark", |s| s.balance = 0)
        .run(())
        .await;
    assert!(matches!(result, Err(SagaError::Busy)));

    gate.notify_one();
    first.await.unwrap().unwrap();
}

#[tokio::test]
async fn empty_transaction_commits() {
    let manager = SagaManager::new(Bank::opening());
    manager
        .create_transaction::<()>("noop")
        .run(())
        .await
        .unwrap();
    assert_eq!(manager.committed_version().unwrap(), 1);
    assert_eq!(manager.get_state().unwrap(), Bank::opening());
}
