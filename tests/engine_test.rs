//! Tests for the continuation engine against a recording batch client.

mod common;

use common::{resource, Call, PageState, RecordingClient, ResourceMapper};
use mapflow::engine::{ITEM_LABEL, STEP_LABEL};
use mapflow::{
    BatchError, BatchId, EngineError, HookFrequency, HookRole, InitialState, MapperJob,
    StepOutcome, UnitKind, WorkUnit,
};
use std::sync::Arc;

fn job(mapper: ResourceMapper, client: &Arc<RecordingClient>) -> MapperJob<ResourceMapper> {
    MapperJob::new(mapper, client.clone())
}

fn page_of_three() -> ResourceMapper {
    ResourceMapper::new().page(
        1,
        vec![
            resource(1, "John"),
            resource(2, "Jane"),
            resource(3, "Max"),
        ],
    )
}

#[tokio::test]
async fn test_query_is_called_with_initial_state() {
    let client = Arc::new(RecordingClient::new());
    let mapper = ResourceMapper::new();
    let events = mapper.events.clone();

    job(mapper, &client)
        .enqueue(PageState { page: 7 })
        .await
        .unwrap();

    assert_eq!(*events.lock().await, vec!["query:7".to_string()]);
}

#[tokio::test]
async fn test_page_becomes_one_batch_of_item_units() {
    let client = Arc::new(RecordingClient::new());

    let outcome = job(page_of_three(), &client)
        .enqueue(PageState { page: 1 })
        .await
        .unwrap();

    let calls = client.calls().await;
    assert_eq!(calls.len(), 3);

    let Call::Create {
        id,
        units,
        state,
        parent,
    } = &calls[0]
    else {
        panic!("expected a batch creation first, got {:?}", calls[0]);
    };
    assert_eq!(*state, InitialState::Awaiting);
    assert_eq!(*parent, None);

    let expected: Vec<WorkUnit> = [
        resource(1, "John"),
        resource(2, "Jane"),
        resource(3, "Max"),
    ]
    .iter()
    .map(|r| WorkUnit::item("resources", ITEM_LABEL, serde_json::to_value(r).unwrap()))
    .collect();
    assert_eq!(units, &expected);

    match outcome {
        StepOutcome::Continued {
            batch_id, items, ..
        } => {
            assert_eq!(batch_id, *id);
            assert_eq!(items, 3);
        }
        other => panic!("expected a continued step, got {:?}", other),
    }
}

#[tokio::test]
async fn test_page_batch_starts_after_continuation_is_registered() {
    let client = Arc::new(RecordingClient::new());

    job(page_of_three(), &client)
        .enqueue(PageState { page: 1 })
        .await
        .unwrap();

    let calls = client.calls().await;
    let Call::Create { id: batch_id, .. } = &calls[0] else {
        panic!("expected a batch creation first");
    };
    assert!(matches!(&calls[1], Call::Continue { source, .. } if source == batch_id));
    assert!(matches!(&calls[2], Call::Start { id } if id == batch_id));
}

#[tokio::test]
async fn test_continuation_runs_next_step_with_advanced_cursor() {
    let client = Arc::new(RecordingClient::new());

    let outcome = job(page_of_three(), &client)
        .enqueue(PageState { page: 1 })
        .await
        .unwrap();

    let calls = client.calls().await;
    let Call::Create { id: batch_id, .. } = &calls[0] else {
        panic!("expected a batch creation first");
    };
    let Call::Continue { id, source, units } = &calls[1] else {
        panic!("expected a continuation second");
    };

    assert_eq!(source, batch_id);
    assert_eq!(
        units,
        &vec![WorkUnit::step(
            "resources",
            STEP_LABEL,
            serde_json::json!({"page": 2}),
            1
        )]
    );

    assert_eq!(
        outcome,
        StepOutcome::Continued {
            batch_id: *batch_id,
            continuation_id: *id,
            items: 3,
            next: PageState { page: 2 },
        }
    );
}

#[tokio::test]
async fn test_on_start_hooks_lead_the_batch_in_declaration_order() {
    let client = Arc::new(RecordingClient::new());
    let mapper = ResourceMapper::new()
        .page(1, vec![resource(1, "John")])
        .on_start("mark_job_as_started")
        .on_complete("mark_job_as_completed")
        .on_start("send_job_started_email_notification");

    job(mapper, &client)
        .enqueue(PageState { page: 1 })
        .await
        .unwrap();

    let calls = client.calls().await;
    let Call::Create { units, .. } = &calls[0] else {
        panic!("expected a batch creation first");
    };
    assert_eq!(units.len(), 3);

    let hooks: Vec<(&str, HookRole, &serde_json::Value)> = units[..2]
        .iter()
        .map(|u| match &u.kind {
            UnitKind::Hook {
                name, role, cursor, ..
            } => (name.as_str(), *role, cursor),
            other => panic!("expected a hook unit, got {:?}", other),
        })
        .collect();

    let pre_advance = serde_json::json!({"page": 1});
    assert_eq!(
        hooks,
        vec![
            ("mark_job_as_started", HookRole::OnStart, &pre_advance),
            (
                "send_job_started_email_notification",
                HookRole::OnStart,
                &pre_advance
            ),
        ]
    );
    assert_eq!(units[0].label, "Run mark_job_as_started.");
    assert!(matches!(units[2].kind, UnitKind::Item { .. }));
}

#[tokio::test]
async fn test_on_start_hooks_fire_once_per_run_by_default() {
    let client = Arc::new(RecordingClient::new());
    let mapper = ResourceMapper::new()
        .page(2, vec![resource(4, "Ada")])
        .on_start("mark_job_as_started");

    job(mapper, &client)
        .step(PageState { page: 2 }, 1)
        .await
        .unwrap();

    let calls = client.calls().await;
    let Call::Create { units, .. } = &calls[0] else {
        panic!("expected a batch creation first");
    };
    assert_eq!(units.len(), 1);
    assert!(matches!(units[0].kind, UnitKind::Item { .. }));
}

#[tokio::test]
async fn test_on_start_hooks_every_page_when_configured() {
    let client = Arc::new(RecordingClient::new());
    let mapper = ResourceMapper::new()
        .page(2, vec![resource(4, "Ada")])
        .on_start("mark_job_as_started");

    job(mapper, &client)
        .with_hook_frequency(HookFrequency::EveryPage)
        .step(PageState { page: 2 }, 1)
        .await
        .unwrap();

    let calls = client.calls().await;
    let Call::Create { units, .. } = &calls[0] else {
        panic!("expected a batch creation first");
    };
    assert_eq!(units.len(), 2);
    assert!(matches!(
        &units[0].kind,
        UnitKind::Hook { cursor, .. } if *cursor == serde_json::json!({"page": 2})
    ));
}

#[tokio::test]
async fn test_no_jobs_are_enqueued_if_query_returns_empty_set() {
    let client = Arc::new(RecordingClient::new());

    let outcome = job(ResourceMapper::new(), &client)
        .enqueue(PageState { page: 1 })
        .await
        .unwrap();

    assert!(client.calls().await.is_empty());
    assert_eq!(
        outcome,
        StepOutcome::Terminated {
            completion_batch: None
        }
    );
}

#[tokio::test]
async fn test_no_jobs_are_enqueued_if_query_returns_null() {
    let client = Arc::new(RecordingClient::new());
    let mapper = ResourceMapper::new().null_page(1).on_start("mark_job_as_started");

    let outcome = job(mapper, &client)
        .enqueue(PageState { page: 1 })
        .await
        .unwrap();

    assert!(client.calls().await.is_empty());
    assert!(outcome.is_terminated());
}

#[tokio::test]
async fn test_on_complete_hooks_run_once_on_terminal_step() {
    let client = Arc::new(RecordingClient::new());
    let mapper = ResourceMapper::new()
        .on_start("mark_job_as_started")
        .on_complete("mark_job_as_completed")
        .on_complete("send_job_completed_email_notification");

    let outcome = job(mapper, &client)
        .step(PageState { page: 5 }, 4)
        .await
        .unwrap();

    let calls = client.calls().await;
    assert_eq!(calls.len(), 1, "no continuation after the last page");

    let Call::Create { id, units, .. } = &calls[0] else {
        panic!("expected a batch creation");
    };
    let names: Vec<&str> = units
        .iter()
        .map(|u| match &u.kind {
            UnitKind::Hook {
                name, role, cursor, ..
            } => {
                assert_eq!(*role, HookRole::OnComplete);
                assert_eq!(*cursor, serde_json::json!({"page": 5}));
                name.as_str()
            }
            other => panic!("expected a hook unit, got {:?}", other),
        })
        .collect();
    assert_eq!(
        names,
        vec!["mark_job_as_completed", "send_job_completed_email_notification"]
    );

    assert_eq!(
        outcome,
        StepOutcome::Terminated {
            completion_batch: Some(*id)
        }
    );
}

#[tokio::test]
async fn test_page_source_failure_submits_nothing() {
    let client = Arc::new(RecordingClient::new());
    let mapper = page_of_three().failing_page(1);

    let err = job(mapper, &client)
        .enqueue(PageState { page: 1 })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::PageSource {
            mapper: "resources",
            ..
        }
    ));
    assert!(client.calls().await.is_empty());
}

#[tokio::test]
async fn test_rejected_batch_registers_no_continuation() {
    let client = Arc::new(RecordingClient::failing_create());

    let err = job(page_of_three(), &client)
        .enqueue(PageState { page: 1 })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::BatchSubmission(BatchError::StorageError(_))
    ));
    assert!(client.calls().await.is_empty());
}

#[tokio::test]
async fn test_rejected_continuation_fails_the_step() {
    let client = Arc::new(RecordingClient::failing_continue());

    let err = job(page_of_three(), &client)
        .enqueue(PageState { page: 1 })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::BatchSubmission(BatchError::UnknownBatch(BatchId(1)))
    ));

    // The page batch was created awaiting and is never started.
    let calls = client.calls().await;
    assert_eq!(calls.len(), 1);
    assert!(matches!(
        &calls[0],
        Call::Create {
            state: InitialState::Awaiting,
            ..
        }
    ));
}

#[tokio::test]
async fn test_enqueue_twice_starts_independent_chains() {
    let client = Arc::new(RecordingClient::new());
    let job = job(page_of_three(), &client);

    job.enqueue(PageState { page: 1 }).await.unwrap();
    job.enqueue(PageState { page: 1 }).await.unwrap();

    let calls = client.calls().await;
    assert_eq!(calls.len(), 6);

    let sources: Vec<BatchId> = calls
        .iter()
        .filter_map(|c| match c {
            Call::Continue { source, .. } => Some(*source),
            _ => None,
        })
        .collect();
    assert_eq!(sources.len(), 2);
    assert_ne!(sources[0], sources[1]);
}
