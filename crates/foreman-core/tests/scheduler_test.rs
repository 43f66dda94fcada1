//! Integration tests for the scheduler: retry flow, event ordering,
//! and failure cascades through the engine facade.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};

use tokio_util::sync::CancellationToken;

use foreman_core::{
    Engine, EngineConfig, EngineOutcome, EventKind, FnExecutor, SchedulerConfig, TaskSpec,
    TaskStatus,
};

// ===========================================================================
// Test helpers
// ===========================================================================

fn engine_with(scheduler: SchedulerConfig) -> Engine {
    Engine::new(EngineConfig {
        scheduler,
        ..EngineConfig::default()
    })
}

/// Collect every event for later inspection.
fn record_events(engine: &Engine) -> Arc<Mutex<Vec<(uuid::Uuid, EventKind)>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    engine.subscribe(move |event| {
        sink.lock().unwrap().push((event.task_id, event.kind.clone()));
    });
    log
}

// ===========================================================================
// Retry-then-succeed
// ===========================================================================

#[tokio::test]
async fn retry_then_succeed_emits_causal_event_sequence() {
    let engine = engine_with(SchedulerConfig {
        retry_delay_ms: 1_000,
        ..SchedulerConfig::default()
    });
    let events = record_events(&engine);

    // Fails on the first attempt, succeeds on the second.
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    engine.register_executor(FnExecutor::new("worker", move |_t, _g| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                anyhow::bail!("transient failure")
            }
            Ok(serde_json::json!("second time lucky"))
        }
    }));

    let id = engine.submit(TaskSpec::new("flaky").max_retries(3)).unwrap();
    let outcome = engine.run(CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, EngineOutcome::Completed);

    let task = engine.task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.retries, 1);
    assert!(task.retries <= task.max_retries);

    let kinds: Vec<EventKind> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|(task_id, _)| *task_id == id)
        .map(|(_, kind)| kind.clone())
        .collect();

    match kinds.as_slice() {
        [
            EventKind::Started,
            EventKind::Failed {
                retry: true,
                attempt: 1,
                delay_ms: Some(delay),
            },
            EventKind::RetryScheduled,
            EventKind::Started,
            EventKind::Completed,
        ] => {
            // delay = retry_delay * (1 + jitter), jitter in [0, 0.2].
            assert!(
                (1_000..=1_200).contains(delay),
                "first-attempt delay should be near the base retry delay, got {delay}"
            );
        }
        other => panic!("unexpected event sequence: {other:?}"),
    }
}

// ===========================================================================
// Exhausted retries + cascade
// ===========================================================================

#[tokio::test]
async fn exhausted_retries_fail_and_block_dependents() {
    let engine = engine_with(SchedulerConfig::default());
    let events = record_events(&engine);

    engine.register_executor(FnExecutor::new("worker", |_t, _g| async {
        anyhow::bail!("always fails")
    }));

    let a = engine.submit(TaskSpec::new("a").max_retries(0)).unwrap();
    let b = engine.submit(TaskSpec::new("b").depends_on([a])).unwrap();

    let outcome = engine.run(CancellationToken::new()).await.unwrap();
    assert_eq!(
        outcome,
        EngineOutcome::Failed {
            failed: vec!["a".into()],
            blocked: vec!["b".into()],
        }
    );

    let a_task = engine.task(a).unwrap();
    assert_eq!(a_task.status, TaskStatus::Failed);
    assert_eq!(a_task.retries, 0, "max_retries = 0 means one attempt");
    assert_eq!(engine.task(b).unwrap().status, TaskStatus::Blocked);

    // b never started; it only got a Blocked event.
    let b_kinds: Vec<EventKind> = events
        .lock()
        .unwrap()
        .iter()
        .filter(|(id, _)| *id == b)
        .map(|(_, k)| k.clone())
        .collect();
    assert_eq!(b_kinds, vec![EventKind::Blocked]);
}

// ===========================================================================
// Started precedes terminal events, always
// ===========================================================================

#[tokio::test]
async fn started_precedes_terminal_event_per_task() {
    let engine = engine_with(SchedulerConfig::default());
    let events = record_events(&engine);

    engine.register_executor(FnExecutor::new("worker", |task, _g| async move {
        if task.name.starts_with("bad") {
            anyhow::bail!("nope")
        }
        Ok(serde_json::Value::Null)
    }));

    for i in 0..4 {
        engine.submit(TaskSpec::new(format!("good-{i}"))).unwrap();
        engine.submit(TaskSpec::new(format!("bad-{i}"))).unwrap();
    }

    engine.run(CancellationToken::new()).await.unwrap();

    let log = events.lock().unwrap();
    for (id, kind) in log.iter() {
        let is_terminal = matches!(
            kind,
            EventKind::Completed | EventKind::Failed { retry: false, .. }
        );
        if is_terminal {
            let started_first = log
                .iter()
                .take_while(|(other, k)| !(other == id && k == kind))
                .any(|(other, k)| other == id && *k == EventKind::Started);
            assert!(started_first, "terminal event without a prior Started for {id}");
        }
    }
}

// ===========================================================================
// Executor registration semantics
// ===========================================================================

#[tokio::test]
async fn re_registration_replaces_executor() {
    let engine = engine_with(SchedulerConfig::default());

    engine.register_executor(FnExecutor::new("worker", |_t, _g| async {
        Ok(serde_json::json!("old"))
    }));
    engine.register_executor(FnExecutor::new("worker", |_t, _g| async {
        Ok(serde_json::json!("new"))
    }));

    let id = engine.submit(TaskSpec::new("t")).unwrap();
    engine.run(CancellationToken::new()).await.unwrap();

    let task = engine.task(id).unwrap();
    assert_eq!(task.result.unwrap().output, serde_json::json!("new"));
}

#[tokio::test]
async fn pinned_executor_is_used() {
    let engine = engine_with(SchedulerConfig::default());

    engine.register_executor(FnExecutor::new("general", |_t, _g| async {
        Ok(serde_json::json!("general"))
    }));
    engine.register_executor(FnExecutor::new("special", |_t, _g| async {
        Ok(serde_json::json!("special"))
    }));

    let id = engine
        .submit(TaskSpec::new("pinned").executor("special"))
        .unwrap();
    engine.run(CancellationToken::new()).await.unwrap();

    let task = engine.task(id).unwrap();
    assert_eq!(task.assigned_executor.as_deref(), Some("special"));
    assert_eq!(task.result.unwrap().output, serde_json::json!("special"));
}
