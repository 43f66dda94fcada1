//! Checkpoint service integration: a long-running executor resumes
//! from its last durable step after a restart.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use foreman_core::{
    CheckpointConfig, CheckpointService, Engine, EngineConfig, EngineOutcome, FnExecutor, TaskSpec,
};
use foreman_store::{BlobStore, FsStore};

const STEPS: [&str; 4] = ["fetch", "parse", "transform", "publish"];

#[tokio::test]
async fn executor_resumes_from_last_checkpoint_after_restart() {
    let tmp = tempfile::TempDir::new().unwrap();
    // One stable task identity across both "processes".
    let job_key = uuid::Uuid::new_v4();

    // --- First process: dies after two steps. --------------------------
    {
        let store: Arc<dyn BlobStore> = Arc::new(FsStore::open(tmp.path()).await.unwrap());
        let checkpoints = CheckpointService::new(store, CheckpointConfig::default());

        for (index, step) in STEPS.iter().take(2).enumerate() {
            checkpoints
                .create(
                    job_key,
                    index as u32,
                    step,
                    serde_json::json!({"rows": (index + 1) * 100}),
                )
                .await;
        }
        // Crash before "transform".
    }

    // --- Second process: resume from the durable history. --------------
    let store: Arc<dyn BlobStore> = Arc::new(FsStore::open(tmp.path()).await.unwrap());
    let checkpoints = CheckpointService::new(store, CheckpointConfig::default());

    let engine = Engine::new(EngineConfig::default());
    let svc = checkpoints.clone();
    let executed = Arc::new(std::sync::Mutex::new(Vec::new()));
    let executed_log = Arc::clone(&executed);
    engine.register_executor(FnExecutor::new("resumable", move |_task, _g| {
        let svc = svc.clone();
        let executed = Arc::clone(&executed_log);
        async move {
            let resume_from = match svc.restore(job_key, None).await {
                Some(checkpoint) => checkpoint.step_index as usize + 1,
                None => 0,
            };
            for (index, step) in STEPS.iter().enumerate().skip(resume_from) {
                executed.lock().unwrap().push(*step);
                svc.create(
                    job_key,
                    index as u32,
                    step,
                    serde_json::json!({"rows": (index + 1) * 100}),
                )
                .await;
            }
            Ok(serde_json::json!({"resumed_at": resume_from}))
        }
    }));

    let id = engine.submit(TaskSpec::new("pipeline")).unwrap();
    let outcome = engine.run(CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, EngineOutcome::Completed);

    // Only the un-checkpointed tail ran.
    assert_eq!(*executed.lock().unwrap(), vec!["transform", "publish"]);
    assert_eq!(
        engine.task(id).unwrap().result.unwrap().output,
        serde_json::json!({"resumed_at": 2})
    );

    let meta = checkpoints.metadata(job_key).await;
    assert_eq!(meta.total_steps, STEPS.len());
    assert_eq!(meta.current_step, Some(3));
}

#[tokio::test]
async fn checkpoint_identity_survives_restart() {
    let tmp = tempfile::TempDir::new().unwrap();
    let task = uuid::Uuid::new_v4();

    let first_id = {
        let store: Arc<dyn BlobStore> = Arc::new(FsStore::open(tmp.path()).await.unwrap());
        let svc = CheckpointService::new(store, CheckpointConfig::default());
        svc.create(task, 0, "scan", serde_json::json!({"cursor": 5})).await
    };

    let store: Arc<dyn BlobStore> = Arc::new(FsStore::open(tmp.path()).await.unwrap());
    let svc = CheckpointService::new(store, CheckpointConfig::default());

    // Recreating the identical key+state after restart returns the
    // persisted checkpoint id rather than minting a new one.
    let second_id = svc.create(task, 0, "scan", serde_json::json!({"cursor": 5})).await;
    assert_eq!(first_id, second_id);
}
