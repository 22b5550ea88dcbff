//! Integration tests for rerun / retry prompt / reset, progress reporting
//! and writing the output directory.

mod common;

use common::*;
use edgequake_slide2assets::output::MANIFEST_FILE;
use edgequake_slide2assets::stream::terminal_events;
use edgequake_slide2assets::{
    BoundingBox, DecomposeError, ElementError, ElementId, ElementStatus, ElementType,
    ExtractionProgressCallback, ServiceReply, Session, Verdict,
};
use futures::StreamExt;
use std::sync::{Arc, Mutex};

fn el(i: usize) -> ElementId {
    ElementId::from_index(i)
}

/// Session whose only ICON element fails all four attempts with improved
/// prompts `better 1` … `better 4`.
async fn failed_session() -> (Session, Arc<ScriptedService>) {
    let service = Arc::new(ScriptedService::new().with_critiques(
        (1..=4)
            .map(|i| parsed(critique(50, Verdict::Retry, Some(&format!("better {i}")))))
            .collect(),
    ));
    let config = fast_config(service.clone()).build().unwrap();
    let session = Session::new(slide(), layout(&[ElementType::Icon]), service.clone(), config);
    session.run_all().await;
    assert_eq!(
        session.store().snapshot(&el(0)).unwrap().status(),
        ElementStatus::Failed
    );
    (session, service)
}

// ── Rerun ────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn rerun_with_override_starts_a_fresh_budget() {
    let (session, service) = failed_session().await;

    let status = session
        .rerun(&el(0), Some("keep only the gear".into()))
        .await
        .unwrap();

    assert_eq!(status, ElementStatus::Completed);
    let element = session.store().snapshot(&el(0)).unwrap();
    assert_eq!(element.attempts, 1);
    assert!(element.failure.is_none());
    let history = element.history();
    assert_eq!(history.len(), 5, "history is kept across reruns");
    assert_eq!(history[4].prompt, "keep only the gear");
    assert_eq!(history[4].attempt, 1);
    assert_eq!(service.plan_calls(), 1, "Analyst must not run again");
    assert!(session
        .store()
        .log()
        .iter()
        .any(|l| l.contains("Manual rerun with prompt override")));
}

#[tokio::test(start_paused = true)]
async fn rerun_without_override_reuses_last_improved_prompt() {
    let (session, service) = failed_session().await;

    session.rerun(&el(0), None).await.unwrap();

    let last = service.instructions().pop().unwrap();
    assert!(last.contains("better 4"), "{last}");
    assert_eq!(service.plan_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn rerun_can_fail_again() {
    let (session, service) = failed_session().await;
    service.push_critiques(
        (0..4)
            .map(|_| parsed(critique(30, Verdict::Retry, None)))
            .collect(),
    );

    let status = session.rerun(&el(0), None).await.unwrap();

    assert_eq!(status, ElementStatus::Failed);
    let element = session.store().snapshot(&el(0)).unwrap();
    assert_eq!(element.attempts, 4);
    assert_eq!(element.history().len(), 8);
    assert!(matches!(
        element.failure,
        Some(ElementError::MaxAttemptsReached { attempts: 4, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn rerun_rejects_unknown_and_non_terminal_elements() {
    let service = Arc::new(ScriptedService::new());
    let config = fast_config(service.clone()).build().unwrap();
    let session = Session::new(
        slide(),
        layout(&[ElementType::Text, ElementType::Icon]),
        service.clone(),
        config,
    );

    let err = session.rerun(&el(1), None).await.unwrap_err();
    assert!(matches!(err, DecomposeError::InvalidElementState { .. }), "{err}");

    let err = session.rerun(&ElementId::from("el-99"), None).await.unwrap_err();
    assert!(matches!(err, DecomposeError::ElementNotFound { .. }), "{err}");
    assert!(service.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rerun_of_text_transcribes_again() {
    let service = Arc::new(ScriptedService::new().with_texts(vec![
        Ok(ServiceReply::Parsed(text("Q3 revenu"))),
        Ok(ServiceReply::Parsed(text("Q3 revenue"))),
    ]));
    let config = fast_config(service.clone()).build().unwrap();
    let session = Session::new(slide(), layout(&[ElementType::Text]), service.clone(), config);
    session.run_all().await;

    let status = session
        .rerun(&el(0), Some("ignored for text".into()))
        .await
        .unwrap();

    assert_eq!(status, ElementStatus::Completed);
    let element = session.store().snapshot(&el(0)).unwrap();
    assert_eq!(element.text.map(|t| t.text).as_deref(), Some("Q3 revenue"));
    assert_eq!(service.text_calls(), 2);
    assert_eq!(service.plan_calls() + service.generate_calls(), 0);
    assert!(session
        .store()
        .log()
        .iter()
        .any(|line| line.contains("prompt override ignored for TEXT")));
}

#[tokio::test(start_paused = true)]
async fn stored_retry_prompt_is_used_by_the_next_rerun() {
    let (session, service) = failed_session().await;

    session
        .set_retry_prompt(&el(0), "erase the caption under the icon")
        .unwrap();
    session.rerun(&el(0), None).await.unwrap();

    let last = service.instructions().pop().unwrap();
    assert!(last.contains("erase the caption under the icon"), "{last}");
}

// ── Reset ────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn reset_clears_state_and_next_run_replans() {
    let service = Arc::new(ScriptedService::new());
    let config = fast_config(service.clone()).build().unwrap();
    let session = Session::new(slide(), layout(&[ElementType::Icon]), service.clone(), config);
    session.run_all().await;

    let moved = BoundingBox::new(300.0, 300.0, 500.0, 500.0);
    session.reset(&el(0), Some(moved)).unwrap();

    let element = session.store().snapshot(&el(0)).unwrap();
    assert_eq!(element.status(), ElementStatus::Pending);
    assert_eq!(element.bbox, moved);
    assert_eq!(element.attempts, 0);
    assert!(element.history().is_empty());
    assert!(element.active_prompt.is_none());
    assert!(element.cleaned_image.is_none());
    assert!(element.last_qa_score.is_none());

    let stats = session.run_all().await;
    assert_eq!(stats.completed, 1);
    assert_eq!(service.plan_calls(), 2);
    assert_eq!(session.store().snapshot(&el(0)).unwrap().history().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reset_unknown_element_is_an_error() {
    let service = Arc::new(ScriptedService::new());
    let config = fast_config(service.clone()).build().unwrap();
    let session = Session::new(slide(), layout(&[ElementType::Icon]), service, config);

    let err = session.reset(&ElementId::from("nope"), None).unwrap_err();
    assert!(matches!(err, DecomposeError::ElementNotFound { .. }));
}

// ── Observation ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingCallback {
    events: Mutex<Vec<String>>,
}

impl ExtractionProgressCallback for RecordingCallback {
    fn on_run_start(&self, total: usize) {
        self.events.lock().unwrap().push(format!("start {total}"));
    }

    fn on_element_complete(&self, id: &ElementId, attempts: u32, score: u8) {
        self.events
            .lock()
            .unwrap()
            .push(format!("done {id} {attempts} {score}"));
    }

    fn on_text_complete(&self, id: &ElementId) {
        self.events.lock().unwrap().push(format!("text {id}"));
    }

    fn on_element_failed(&self, id: &ElementId, _reason: String) {
        self.events.lock().unwrap().push(format!("failed {id}"));
    }

    fn on_run_complete(&self, total: usize, completed: usize) {
        self.events
            .lock()
            .unwrap()
            .push(format!("end {total} {completed}"));
    }
}

#[tokio::test(start_paused = true)]
async fn progress_callback_sees_every_outcome() {
    let service = Arc::new(ScriptedService::new());
    let cb = Arc::new(RecordingCallback::default());
    let config = fast_config(service.clone())
        .concurrency(1)
        .progress_callback(cb.clone())
        .build()
        .unwrap();
    let session = Session::new(
        slide(),
        layout(&[ElementType::Shape, ElementType::Icon, ElementType::Text]),
        service,
        config,
    );

    session.run_all().await;

    let events = cb.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec!["start 3", "failed el-0", "done el-1 1 95", "text el-2", "end 3 2"]
    );
}

#[tokio::test(start_paused = true)]
async fn terminal_events_are_streamed() {
    let service = Arc::new(ScriptedService::new());
    let config = fast_config(service.clone()).build().unwrap();
    let session = Session::new(slide(), layout(&[ElementType::Icon; 2]), service, config);
    let events = terminal_events(session.store());

    session.run_all().await;

    let mut seen: Vec<_> = events.take(2).collect().await;
    seen.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(seen[0].id, el(0));
    assert_eq!(seen[1].id, el(1));
    assert!(seen.iter().all(|e| e.status == ElementStatus::Completed));
    assert!(seen.iter().all(|e| e.last_qa_score == Some(95)));
}

// ── Output ───────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn output_dir_holds_completed_assets_and_manifest() {
    let service = Arc::new(ScriptedService::new());
    let config = fast_config(service.clone()).build().unwrap();
    let session = Session::new(
        slide(),
        layout(&[ElementType::Icon, ElementType::Shape]),
        service,
        config,
    )
    .with_source("deck/slide-1.png");
    session.run_all().await;

    let dir = tempfile::tempdir().unwrap();
    let output = session.output();
    output.write_to_dir(dir.path()).await.unwrap();

    let asset = image::open(dir.path().join("el-0.png")).unwrap().to_rgba8();
    assert_eq!(asset.get_pixel(0, 0)[3], 0);
    assert!(!dir.path().join("el-1.png").exists(), "failed elements get no asset");

    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dir.path().join(MANIFEST_FILE)).unwrap()).unwrap();
    assert_eq!(manifest["source"], "deck/slide-1.png");
    assert_eq!(manifest["elements"][0]["asset"], "el-0.png");
    assert_eq!(manifest["elements"][0]["status"], "COMPLETED");
    assert_eq!(manifest["elements"][1]["status"], "FAILED");
    assert!(manifest["elements"][1]["asset"].is_null());
    assert_eq!(manifest["stats"]["completed"], 1);
    assert_eq!(manifest["stats"]["failed"], 1);
}
