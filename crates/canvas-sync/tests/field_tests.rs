//! Field edit session behaviour against the in-memory gateway
//!
//! All tests run on a paused clock; time only moves via `advance` or when
//! the runtime is idle on a gateway latency sleep.

use canvas_model::{Document, FieldPath, FieldValue, ItemField, SectionField};
use canvas_sync::{FieldState, Outcome, SaveStatus, SyncConfig, SyncEngine, SyncError};
use canvas_test_utils::{document_with, engine_for, init_tracing, Call, CallKind, InMemoryGateway};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const DEBOUNCE: Duration = Duration::from_millis(2000);

async fn loaded(doc: &Document) -> (Arc<InMemoryGateway>, SyncEngine<InMemoryGateway>) {
    init_tracing();
    let (gateway, engine) = engine_for(doc, SyncConfig::default());
    engine.load(doc.id).await.unwrap();
    (gateway, engine)
}

async fn loaded_with_latency(
    doc: &Document,
    latency: Duration,
) -> (Arc<InMemoryGateway>, SyncEngine<InMemoryGateway>) {
    init_tracing();
    let gateway = Arc::new(InMemoryGateway::new().with_document(doc.clone()).with_latency(latency));
    let engine = SyncEngine::new(Arc::clone(&gateway), SyncConfig::default()).unwrap();
    engine.load(doc.id).await.unwrap();
    (gateway, engine)
}

fn item_description(doc: &Document) -> FieldPath {
    FieldPath::item(doc.sections[0].items[0].id, ItemField::Description)
}

fn updated_descriptions(gateway: &InMemoryGateway) -> Vec<FieldValue> {
    gateway
        .calls_of(CallKind::UpdateItem)
        .into_iter()
        .filter_map(|call| match call {
            Call::UpdateItem { patch, .. } => patch.get(ItemField::Description).cloned(),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_rapid_edits_coalesce_into_one_save() {
    let doc = document_with(1, 1);
    let (gateway, engine) = loaded(&doc).await;
    let path = item_description(&doc);

    assert!(engine.mutate_field(path, FieldValue::text("A")).is_queued());
    tokio::time::advance(Duration::from_millis(100)).await;
    assert!(engine.mutate_field(path, FieldValue::text("AB")).is_queued());

    assert!(engine.run_due().await.is_empty());
    tokio::time::advance(DEBOUNCE - Duration::from_millis(1)).await;
    assert!(engine.run_due().await.is_empty());
    assert_eq!(gateway.call_count(CallKind::UpdateItem), 0);

    tokio::time::advance(Duration::from_millis(1)).await;
    let report = engine.run_due().await;
    assert_eq!(report.saved, vec![path]);
    assert_eq!(updated_descriptions(&gateway), vec![FieldValue::text("AB")]);

    tokio::time::advance(DEBOUNCE * 3).await;
    engine.run_due().await;
    assert_eq!(gateway.call_count(CallKind::UpdateItem), 1);
}

#[tokio::test(start_paused = true)]
async fn test_many_keystrokes_send_the_last_value() {
    let doc = document_with(1, 1);
    let (gateway, engine) = loaded(&doc).await;
    let path = FieldPath::section(doc.sections[0].id, SectionField::Text);

    let mut typed = String::new();
    for c in "falsifiable".chars() {
        typed.push(c);
        assert!(engine.mutate_field(path, FieldValue::text(typed.clone())).is_queued());
        tokio::time::advance(Duration::from_millis(150)).await;
        engine.run_due().await;
    }
    assert_eq!(gateway.call_count(CallKind::UpdateSection), 0);

    tokio::time::advance(DEBOUNCE).await;
    engine.run_due().await;

    let calls = gateway.calls_of(CallKind::UpdateSection);
    assert_eq!(calls.len(), 1);
    let Call::UpdateSection { patch, .. } = &calls[0] else {
        panic!("expected a section update");
    };
    assert_eq!(patch.get(SectionField::Text), Some(&FieldValue::text("falsifiable")));
    assert_eq!(gateway.document(doc.id).unwrap().sections[0].text, "falsifiable");
}

#[tokio::test(start_paused = true)]
async fn test_cancel_reverts_without_calls() {
    let doc = document_with(1, 1);
    let (gateway, engine) = loaded(&doc).await;
    let path = item_description(&doc);
    let original = doc.sections[0].items[0].description.clone();

    assert!(engine.begin_edit(path).is_applied());
    assert!(engine.input(path, FieldValue::text("typo")).is_queued());
    assert_eq!(
        engine.snapshot().unwrap().sections[0].items[0].description,
        "typo"
    );

    assert!(engine.cancel_edit(path).is_applied());
    assert_eq!(
        engine.snapshot().unwrap().sections[0].items[0].description,
        original
    );
    assert_eq!(engine.session_state(&path), None);

    tokio::time::advance(DEBOUNCE * 2).await;
    engine.run_due().await;
    assert_eq!(gateway.call_count(CallKind::UpdateItem), 0);
}

#[tokio::test(start_paused = true)]
async fn test_blur_saves_immediately() {
    let doc = document_with(1, 1);
    let (gateway, engine) = loaded(&doc).await;
    let path = item_description(&doc);

    engine.begin_edit(path).into_result().unwrap();
    engine.input(path, FieldValue::text("blurred")).into_result().unwrap();

    assert_eq!(engine.blur(path).await, Outcome::Applied(()));
    assert_eq!(updated_descriptions(&gateway), vec![FieldValue::text("blurred")]);
    assert_eq!(engine.field_status(&path), SaveStatus::Saved);
    assert!(engine.status().last_persisted_at.is_some());

    // The superseded debounce must not send again
    tokio::time::advance(DEBOUNCE).await;
    let report = engine.run_due().await;
    assert_eq!(report.calls(), 0);
    assert_eq!(report.expired, 1);
    assert_eq!(engine.field_status(&path), SaveStatus::Idle);
    assert_eq!(engine.session_state(&path), None);
}

#[tokio::test(start_paused = true)]
async fn test_commit_saves_immediately() {
    let doc = document_with(1, 1);
    let (gateway, engine) = loaded(&doc).await;
    let path = FieldPath::section(doc.sections[0].id, SectionField::Text);

    engine.mutate_field(path, FieldValue::text("entered")).into_result().unwrap();
    assert!(engine.commit(path).await.is_applied());
    assert_eq!(gateway.call_count(CallKind::UpdateSection), 1);
    assert_eq!(gateway.document(doc.id).unwrap().sections[0].text, "entered");
}

#[tokio::test(start_paused = true)]
async fn test_blur_without_change_makes_no_call() {
    let doc = document_with(1, 1);
    let (gateway, engine) = loaded(&doc).await;
    let path = item_description(&doc);

    engine.begin_edit(path).into_result().unwrap();
    assert!(engine.blur(path).await.is_applied());
    assert_eq!(gateway.call_count(CallKind::UpdateItem), 0);
    assert_eq!(engine.session_state(&path), None);
}

#[tokio::test(start_paused = true)]
async fn test_saved_display_window_returns_to_idle() {
    let doc = document_with(1, 1);
    let (_gateway, engine) = loaded(&doc).await;
    let path = item_description(&doc);

    engine.mutate_field(path, FieldValue::text("x")).into_result().unwrap();
    tokio::time::advance(DEBOUNCE).await;
    engine.run_due().await;
    assert_eq!(engine.field_status(&path), SaveStatus::Saved);

    tokio::time::advance(Duration::from_millis(1999)).await;
    engine.run_due().await;
    assert_eq!(engine.field_status(&path), SaveStatus::Saved);

    tokio::time::advance(Duration::from_millis(1)).await;
    engine.run_due().await;
    assert_eq!(engine.field_status(&path), SaveStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_failed_save_keeps_value_and_retry_persists_it() {
    let doc = document_with(1, 1);
    let (gateway, engine) = loaded(&doc).await;
    let path = FieldPath::section(doc.sections[0].id, SectionField::Text);
    gateway.fail_next(CallKind::UpdateSection);

    engine.mutate_field(path, FieldValue::text("kept")).into_result().unwrap();
    tokio::time::advance(DEBOUNCE).await;
    let report = engine.run_due().await;

    assert_eq!(report.failed, vec![path]);
    assert_eq!(engine.field_status(&path), SaveStatus::Error);
    assert!(engine.status().has_field_errors());
    assert_eq!(engine.snapshot().unwrap().sections[0].text, "kept");
    assert_eq!(gateway.document(doc.id).unwrap().sections[0].text, "thesis 1");
    // Field failures never reload
    assert_eq!(gateway.call_count(CallKind::Fetch), 1);

    assert_eq!(engine.retry(path).await, Outcome::Applied(()));
    assert_eq!(engine.field_status(&path), SaveStatus::Saved);
    assert_eq!(gateway.document(doc.id).unwrap().sections[0].text, "kept");
}

#[tokio::test(start_paused = true)]
async fn test_retry_requires_error_state() {
    let doc = document_with(1, 1);
    let (_gateway, engine) = loaded(&doc).await;
    let path = item_description(&doc);

    engine.mutate_field(path, FieldValue::text("x")).into_result().unwrap();
    let outcome = engine.retry(path).await;
    assert!(matches!(outcome, Outcome::Failed(SyncError::Session(_))));
}

#[tokio::test(start_paused = true)]
async fn test_edit_during_save_is_sent_afterwards() {
    let doc = document_with(1, 1);
    let (gateway, engine) = loaded_with_latency(&doc, Duration::from_millis(500)).await;
    let path = item_description(&doc);

    engine.begin_edit(path).into_result().unwrap();
    engine.input(path, FieldValue::text("first")).into_result().unwrap();

    let (outcome, ()) = tokio::join!(engine.blur(path), async {
        tokio::task::yield_now().await;
        engine.input(path, FieldValue::text("second")).into_result().unwrap();
    });
    assert!(outcome.is_queued());
    assert_eq!(engine.session_state(&path), Some(FieldState::Editing));
    assert_eq!(
        engine.snapshot().unwrap().sections[0].items[0].description,
        "second"
    );

    tokio::time::advance(DEBOUNCE).await;
    engine.run_due().await;
    assert_eq!(
        updated_descriptions(&gateway),
        vec![FieldValue::text("first"), FieldValue::text("second")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_dispose_abandons_pending_edit() {
    let doc = document_with(1, 1);
    let (gateway, engine) = loaded(&doc).await;
    let path = item_description(&doc);

    engine.mutate_field(path, FieldValue::text("draft")).into_result().unwrap();
    assert!(engine.dispose(path).is_applied());
    assert_eq!(
        engine.snapshot().unwrap().sections[0].items[0].description,
        doc.sections[0].items[0].description
    );

    tokio::time::advance(DEBOUNCE).await;
    engine.run_due().await;
    assert_eq!(gateway.call_count(CallKind::UpdateItem), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disposed_save_failure_restores_persisted_value() {
    let doc = document_with(1, 1);
    let (gateway, engine) = loaded_with_latency(&doc, Duration::from_millis(500)).await;
    let path = item_description(&doc);
    gateway.fail_next(CallKind::UpdateItem);

    engine.begin_edit(path).into_result().unwrap();
    engine.input(path, FieldValue::text("doomed")).into_result().unwrap();

    let (outcome, ()) = tokio::join!(engine.blur(path), async {
        tokio::task::yield_now().await;
        engine.dispose(path).into_result().unwrap();
    });
    assert!(outcome.is_failed());
    assert_eq!(
        engine.snapshot().unwrap().sections[0].items[0].description,
        doc.sections[0].items[0].description
    );
}

#[tokio::test(start_paused = true)]
async fn test_reopened_field_keeps_disposed_save_apart() {
    let doc = document_with(1, 1);
    let (gateway, engine) = loaded_with_latency(&doc, Duration::from_millis(500)).await;
    let path = item_description(&doc);

    engine.begin_edit(path).into_result().unwrap();
    engine.input(path, FieldValue::text("first")).into_result().unwrap();

    let (first, second) = tokio::join!(engine.blur(path), async {
        tokio::task::yield_now().await;
        engine.dispose(path).into_result().unwrap();
        gateway.fail_next(CallKind::UpdateItem);
        engine.begin_edit(path).into_result().unwrap();
        engine.input(path, FieldValue::text("second")).into_result().unwrap();
        engine.blur(path).await
    });
    assert!(second.is_queued());
    assert!(matches!(first, Outcome::Failed(SyncError::FieldSave { .. })));
    assert_eq!(
        updated_descriptions(&gateway),
        vec![FieldValue::text("first"), FieldValue::text("second")]
    );

    assert_eq!(engine.field_status(&path), SaveStatus::Error);
    assert_eq!(gateway.document(doc.id).unwrap().sections[0].items[0].description, "first");
    assert_eq!(engine.snapshot().unwrap().sections[0].items[0].description, "second");

    assert!(engine.retry(path).await.is_applied());
    assert_eq!(gateway.document(doc.id).unwrap().sections[0].items[0].description, "second");
    assert_eq!(engine.field_status(&path), SaveStatus::Saved);
}

#[tokio::test(start_paused = true)]
async fn test_next_save_waits_for_the_one_in_flight() {
    let doc = document_with(1, 1);
    let (gateway, engine) = loaded_with_latency(&doc, Duration::from_millis(3000)).await;
    let path = item_description(&doc);

    engine.begin_edit(path).into_result().unwrap();
    engine.input(path, FieldValue::text("a")).into_result().unwrap();

    let (outcome, report) = tokio::join!(engine.blur(path), async {
        tokio::task::yield_now().await;
        engine.begin_edit(path).into_result().unwrap();
        engine.input(path, FieldValue::text("ab")).into_result().unwrap();
        tokio::time::sleep(DEBOUNCE).await;
        let report = engine.run_due().await;
        assert_eq!(gateway.call_count(CallKind::UpdateItem), 1);
        report
    });
    assert!(report.saved.is_empty());
    assert!(outcome.is_applied());
    assert_eq!(
        updated_descriptions(&gateway),
        vec![FieldValue::text("a"), FieldValue::text("ab")]
    );
    assert_eq!(gateway.document(doc.id).unwrap().sections[0].items[0].description, "ab");
    assert_eq!(engine.field_status(&path), SaveStatus::Saved);
}

#[tokio::test(start_paused = true)]
async fn test_input_without_session_is_rejected() {
    let doc = document_with(1, 1);
    let (_gateway, engine) = loaded(&doc).await;
    let path = item_description(&doc);

    let outcome = engine.input(path, FieldValue::text("x"));
    assert!(matches!(outcome, Outcome::Failed(SyncError::Session(_))));
    assert_eq!(*engine.snapshot().unwrap(), doc);
}

#[tokio::test(start_paused = true)]
async fn test_independent_fields_save_concurrently() {
    let doc = document_with(2, 1);
    let (gateway, engine) = loaded_with_latency(&doc, Duration::from_millis(300)).await;
    let a = FieldPath::section(doc.sections[0].id, SectionField::Text);
    let b = FieldPath::section(doc.sections[1].id, SectionField::Text);

    engine.mutate_field(a, FieldValue::text("alpha")).into_result().unwrap();
    engine.mutate_field(b, FieldValue::text("beta")).into_result().unwrap();
    tokio::time::advance(DEBOUNCE).await;

    let started = tokio::time::Instant::now();
    let report = engine.run_due().await;
    assert_eq!(report.saved.len(), 2);
    assert_eq!(started.elapsed(), Duration::from_millis(300));
    assert_eq!(gateway.call_count(CallKind::UpdateSection), 2);
}

#[tokio::test(start_paused = true)]
async fn test_load_discards_sessions() {
    let doc = document_with(1, 1);
    let (gateway, engine) = loaded(&doc).await;
    let path = item_description(&doc);

    engine.mutate_field(path, FieldValue::text("unsent")).into_result().unwrap();
    engine.load(doc.id).await.unwrap();
    assert_eq!(engine.session_state(&path), None);
    assert_eq!(*engine.snapshot().unwrap(), doc);

    tokio::time::advance(DEBOUNCE).await;
    engine.run_due().await;
    assert_eq!(gateway.call_count(CallKind::UpdateItem), 0);
}
