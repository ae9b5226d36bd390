//! End-to-end call lifecycle tests
//!
//! Drive the HTTP router the way the carrier and the voice-agent provider
//! would, against in-memory storage, a scriptable context store and a mock
//! completion provider.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use callctx_api::constants::SIGNATURE_HEADER;
use callctx_api::jobs::{run_sweep_cycle, OrphanSweeperConfig, OrphanSweeperMetrics};
use callctx_api::webhook_signature::sign_payload;
use callctx_api::{
    create_api_router, AppState, CallCoordinator, InboundCall, TranscriptEvent, WebhookVerifier,
};
use callctx_core::{
    snippet_name, AgentRouting, CallSession, CallState, ContextRelease, CoordinatorConfig,
    KnowledgeSnippet, PatientProfile,
};
use callctx_llm::{CompletionProvider, MockCompletionProvider};
use callctx_storage::{CallSessionStore, InMemoryStore, PatientRecordStore};
use callctx_test_utils::{assertions, fixtures, ContextOp, FlakyContextStore};
use chrono::Utc;
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &str = "whsec_lifecycle";

// ============================================================================
// HARNESS
// ============================================================================

struct TestApp {
    router: Router,
    store: InMemoryStore,
    context: Arc<FlakyContextStore>,
    coordinator: Arc<CallCoordinator>,
    patient: PatientProfile,
}

async fn test_app() -> TestApp {
    let (store, patient) = fixtures::seeded_store().await;
    let context = Arc::new(FlakyContextStore::new());
    let provider: Arc<dyn CompletionProvider> =
        Arc::new(MockCompletionProvider::replying(fixtures::A1C_DELTA_JSON));

    let mut config = CoordinatorConfig::new(AgentRouting::single("agent-en"));
    config.context_op_timeout = Duration::from_millis(200);

    let coordinator = Arc::new(
        CallCoordinator::new(Arc::new(store.clone()), context.clone(), Some(provider), config)
            .unwrap(),
    );
    let verifier = WebhookVerifier::new(Some(SECRET.to_string()), Duration::from_secs(300));
    let router = create_api_router(AppState::new(Arc::clone(&coordinator), verifier));

    TestApp {
        router,
        store,
        context,
        coordinator,
        patient,
    }
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn signed_transcript(body: serde_json::Value) -> Request<Body> {
    let body = body.to_string();
    let header = sign_payload(SECRET, Utc::now().timestamp(), body.as_bytes()).unwrap();
    Request::builder()
        .method("POST")
        .uri("/api/v1/webhooks/transcript")
        .header("content-type", "application/json")
        .header(SIGNATURE_HEADER, header)
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn wait_for_state(store: &InMemoryStore, call_id: Uuid, state: CallState) -> CallSession {
    for _ in 0..200 {
        if let Some(session) = store.get_session(call_id).await.unwrap() {
            if session.state == state && session.release != ContextRelease::Claimed {
                return session;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("call {} never reached {}", call_id, state);
}

async fn inbound(app: &TestApp, number: &str, call_sid: &str) -> serde_json::Value {
    let response = app
        .router
        .clone()
        .oneshot(post_json(
            "/api/v1/telephony/inbound",
            serde_json::json!({"from": number, "call_sid": call_sid}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    json_body(response).await
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_full_call_lifecycle_updates_record_and_destroys_snippet() {
    let app = test_app().await;

    let started = inbound(&app, fixtures::CALLER_NUMBER, "CA-100").await;
    assert_eq!(started["state"], "context_attached");
    assert_eq!(started["patient_id"], app.patient.patient_id.to_string());
    let call_id: Uuid = started["call_id"].as_str().unwrap().parse().unwrap();

    let session = app.store.get_session(call_id).await.unwrap().unwrap();
    let handle = session.context_handle.clone().unwrap();
    let snippet_text = app.context.inner().text_of(&handle).await.unwrap();
    assert!(snippet_text.contains("Dana Reyes"));
    assert!(snippet_text.contains("Metformin"));

    let answered = app
        .router
        .clone()
        .oneshot(post_json(
            "/api/v1/telephony/status",
            serde_json::json!({"call_sid": "CA-100", "call_status": "answered"}),
        ))
        .await
        .unwrap();
    assert_eq!(answered.status(), StatusCode::OK);
    assert_eq!(json_body(answered).await["state"], "in_progress");

    let response = app
        .router
        .clone()
        .oneshot(signed_transcript(serde_json::json!({
            "type": "post_call_transcription",
            "data": {
                "conversation_id": "conv_lifecycle",
                "agent_id": "agent-en",
                "transcript": fixtures::A1C_TRANSCRIPT,
                "metadata": {"call_id": call_id.to_string()}
            }
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let done = wait_for_state(&app.store, call_id, CallState::Completed).await;
    assert_eq!(done.release, ContextRelease::Released);
    assert!(!app.context.inner().contains(&handle).await);
    assert_eq!(app.context.inner().destroy_count(&handle).await, 1);

    let record = app
        .store
        .get_record(app.patient.patient_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.clinical_notes.len(), 2);
    assert!(record.notes_text().contains("9.7"));
    assertions::assert_unique_focus(&record);
    assert_eq!(
        record
            .focus_areas
            .iter()
            .filter(|f| f.eq_ignore_ascii_case("weight loss"))
            .count(),
        1
    );
    assert!(record.focus_areas.iter().any(|f| f == "carb counting"));
}

#[tokio::test]
async fn test_tampered_transcript_is_rejected_and_not_stored() {
    let app = test_app().await;
    let body = serde_json::json!({"conversation_id": "conv_x", "transcript": "hello"}).to_string();
    let header = sign_payload(SECRET, Utc::now().timestamp(), b"something else").unwrap();

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/webhooks/transcript")
                .header("content-type", "application/json")
                .header(SIGNATURE_HEADER, header)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(app.store.transcript_count().await, 0);
}

#[tokio::test]
async fn test_uncorrelated_transcript_is_kept() {
    let app = test_app().await;
    let response = app
        .router
        .clone()
        .oneshot(signed_transcript(serde_json::json!({
            "conversation_id": "conv_orphan",
            "transcript": "Patient: hello?"
        })))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = json_body(response).await;
    assert_eq!(accepted["correlated"], false);
    assert_eq!(app.store.unattributed_transcripts().await.len(), 1);
}

#[tokio::test]
async fn test_degraded_attach_still_completes_call() {
    let app = test_app().await;
    app.context.fail_always(ContextOp::Create);

    let started = inbound(&app, fixtures::CALLER_NUMBER, "CA-200").await;
    assert_eq!(started["degraded"], true);
    assert_eq!(started["has_context"], false);
    let call_id: Uuid = started["call_id"].as_str().unwrap().parse().unwrap();

    let receipt = app
        .coordinator
        .on_transcript_delivered(
            TranscriptEvent::new("conv_degraded", fixtures::A1C_TRANSCRIPT).with_call_id_hint(call_id),
        )
        .await
        .unwrap();
    receipt.wait().await;

    let done = app.store.get_session(call_id).await.unwrap().unwrap();
    assert_eq!(done.state, CallState::Completed);
    assert_eq!(done.release, ContextRelease::None);
    assert_eq!(app.context.inner().live_count().await, 0);
    let record = app
        .store
        .get_record(app.patient.patient_id)
        .await
        .unwrap()
        .unwrap();
    assert!(record.notes_text().contains("9.7"));
}

#[tokio::test]
async fn test_carrier_failure_tears_down_snippet() {
    let app = test_app().await;
    let started = inbound(&app, fixtures::CALLER_NUMBER, "CA-300").await;
    let call_id: Uuid = started["call_id"].as_str().unwrap().parse().unwrap();
    let handle = app
        .store
        .get_session(call_id)
        .await
        .unwrap()
        .unwrap()
        .context_handle
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(post_json(
            "/api/v1/telephony/status",
            serde_json::json!({"carrier_call_id": "CA-300", "status": "no-answer"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["state"], "failed");
    assert_eq!(body["failure_reason"], "no-answer");
    assert_eq!(body["context_release"], "released");
    assert!(!app.context.inner().contains(&handle).await);
}

// ============================================================================
// CONCURRENCY
// ============================================================================

#[tokio::test]
async fn test_duplicate_deliveries_race_to_single_teardown() {
    let app = test_app().await;
    let session = app
        .coordinator
        .start_call(InboundCall::new(fixtures::CALLER_NUMBER))
        .await
        .unwrap();
    let handle = session.context_handle.clone().unwrap();

    let event =
        TranscriptEvent::new("conv_dup", fixtures::A1C_TRANSCRIPT).with_call_id_hint(session.call_id);
    let (first, second) = tokio::join!(
        app.coordinator.on_transcript_delivered(event.clone()),
        app.coordinator.on_transcript_delivered(event),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(first.correlated() && second.correlated());
    let started = [first.completion.is_some(), second.completion.is_some()];
    assert_eq!(started.iter().filter(|s| **s).count(), 1);
    first.wait().await;
    second.wait().await;

    assert_eq!(app.context.inner().destroy_count(&handle).await, 1);
    let record = app
        .store
        .get_record(app.patient.patient_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.clinical_notes.len(), 2);
}

#[tokio::test]
async fn test_overlapping_calls_stay_separate() {
    let app = test_app().await;
    let mut other = fixtures::patient_profile();
    other.patient_id = Uuid::now_v7();
    other.display_name = "Sam Okafor".to_string();
    other.phone = "(555) 010-3000".to_string();
    app.store.add_patient(other.clone()).await;

    let first = app
        .coordinator
        .start_call(InboundCall::new(fixtures::CALLER_NUMBER))
        .await
        .unwrap();
    let second = app
        .coordinator
        .start_call(InboundCall::new("+15550103000"))
        .await
        .unwrap();
    assert_eq!(second.patient_id, Some(other.patient_id));
    let first_handle = first.context_handle.clone().unwrap();
    let second_handle = second.context_handle.clone().unwrap();
    assert_ne!(first_handle, second_handle);

    let (a, b) = tokio::join!(
        app.coordinator.on_transcript_delivered(
            TranscriptEvent::new("conv_a", fixtures::A1C_TRANSCRIPT).with_call_id_hint(first.call_id)
        ),
        app.coordinator.on_transcript_delivered(
            TranscriptEvent::new("conv_b", "Patient: all good.").with_call_id_hint(second.call_id)
        ),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.call_id, Some(first.call_id));
    assert_eq!(b.call_id, Some(second.call_id));
    a.wait().await;
    b.wait().await;

    assert_eq!(app.context.inner().destroy_count(&first_handle).await, 1);
    assert_eq!(app.context.inner().destroy_count(&second_handle).await, 1);
    let first_done = app.store.get_session(first.call_id).await.unwrap().unwrap();
    let second_done = app.store.get_session(second.call_id).await.unwrap().unwrap();
    assert_eq!(first_done.external_conversation_id.as_deref(), Some("conv_a"));
    assert_eq!(second_done.external_conversation_id.as_deref(), Some("conv_b"));
}

// ============================================================================
// ORPHAN SWEEPER
// ============================================================================

#[tokio::test]
async fn test_sweeper_reclaims_what_the_call_path_missed() {
    let app = test_app().await;

    // A snippet whose owner never made it into storage
    let ghost = KnowledgeSnippet::new(
        "kb_ghost",
        snippet_name(Uuid::now_v7()),
        Utc::now() - chrono::Duration::hours(3),
    );
    app.context.inner().seed(ghost, "stale context").await;

    // A failed teardown left for retry
    let session = app
        .coordinator
        .start_call(InboundCall::new(fixtures::CALLER_NUMBER))
        .await
        .unwrap();
    let handle = session.context_handle.clone().unwrap();
    app.context.fail_always(ContextOp::Detach);
    assert!(app.coordinator.fail_call(session.call_id, "busy").await.unwrap());
    assert_eq!(
        app.store.get_session(session.call_id).await.unwrap().unwrap().release,
        ContextRelease::ReleaseFailed
    );
    app.context.heal(ContextOp::Detach);

    // A live call the sweeper must leave alone
    let live = app
        .coordinator
        .start_call(InboundCall::new(fixtures::CALLER_NUMBER))
        .await
        .unwrap();
    let live_handle = live.context_handle.clone().unwrap();

    let config = OrphanSweeperConfig {
        ttl: Duration::from_secs(3600),
        ..OrphanSweeperConfig::development()
    };
    let metrics = OrphanSweeperMetrics::new();
    let delta = run_sweep_cycle(&app.coordinator, &config, &metrics, Utc::now()).await;

    assert_eq!(delta.releases_retried, 1);
    assert!(delta.snippets_destroyed >= 1);
    assert!(!app.context.inner().contains("kb_ghost").await);
    assert!(!app.context.inner().contains(&handle).await);
    assert!(app.context.inner().contains(&live_handle).await);
    let retried = app.store.get_session(session.call_id).await.unwrap().unwrap();
    assertions::assert_released(&retried);
}
