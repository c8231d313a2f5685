//! End-to-end scenarios for the turn pipeline and interaction controller.
//!
//! Every test runs against its own temporary data directory, a scripted
//! response source and millisecond ticks.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;

use parley_chat::{
    Augmentor, DisabledWebSearch, InteractionController, ResponseSource, RuntimeContext,
    ScriptedSource, SubmitOutcome, TurnOutcome, TurnPipeline,
};
use parley_core::config::{ParleyConfig, RetrievalConfig};
use parley_core::events::PipelineEvent;
use parley_core::types::{PipelinePhase, Role, Session};
use parley_retrieval::{RetrievalContext, TermHashEmbedding};
use parley_storage::{AttachmentSlots, SessionStore};

// =============================================================================
// Helpers
// =============================================================================

struct Fixture {
    dir: tempfile::TempDir,
    controller: InteractionController,
}

fn test_config(tick_millis: u64) -> ParleyConfig {
    let mut config = ParleyConfig::default();
    config.pipeline.tick_millis = tick_millis;
    config.pipeline.thinking_millis = 5;
    config
}

fn retrieval() -> Arc<RetrievalContext> {
    Arc::new(RetrievalContext::new(
        Arc::new(TermHashEmbedding::new()),
        RetrievalConfig::default(),
    ))
}

fn fixture_with(config: ParleyConfig, max_history: usize, max_attach: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::open(dir.path().join("history"), max_history).unwrap());
    let slots = AttachmentSlots::new(dir.path().join("temp"), max_attach).unwrap();
    let controller =
        InteractionController::new(config, store, retrieval(), slots, Arc::new(DisabledWebSearch));
    controller.set_disable_think(true);
    Fixture { dir, controller }
}

fn fixture(tick_millis: u64) -> Fixture {
    fixture_with(test_config(tick_millis), 12, 6)
}

fn lines(count: usize) -> String {
    (1..=count)
        .map(|i| format!("line {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

async fn start(controller: &InteractionController, input: &str) -> tokio::task::JoinHandle<TurnOutcome> {
    match controller.submit(input).await {
        SubmitOutcome::Started(handle) => handle,
        other => panic!("expected the turn to start, got {other:?}"),
    }
}

/// Receive events until `pred` matches, failing after five seconds.
async fn wait_for(
    rx: &mut broadcast::Receiver<PipelineEvent>,
    pred: impl Fn(&PipelineEvent) -> bool,
) -> PipelineEvent {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for event")
}

fn last_assistant(session: &Session) -> String {
    session
        .last_assistant_turn()
        .map(|t| t.content.clone())
        .unwrap_or_default()
}

// =============================================================================
// Input validation
// =============================================================================

#[tokio::test]
async fn submit_without_model_is_rejected() {
    let f = fixture(5);
    match f.controller.submit("Hello").await {
        SubmitOutcome::Rejected(message) => assert_eq!(message, "Please load a model first."),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(f.controller.phase(), PipelinePhase::WaitingForInput);
    assert!(f.controller.session().is_none());
}

#[tokio::test]
async fn whitespace_input_adds_no_turn() {
    let f = fixture(5);
    f.controller
        .load_model(ScriptedSource::new("test-model", &["x"]).into_shared())
        .unwrap();

    for input in ["", " ", "\n\n", "\t \r\n  "] {
        match f.controller.submit(input).await {
            SubmitOutcome::Rejected(message) => assert_eq!(message, "No input provided."),
            other => panic!("unexpected outcome for {input:?}: {other:?}"),
        }
        assert_eq!(f.controller.phase(), PipelinePhase::WaitingForInput);
        assert!(f.controller.session().is_none());
    }
    assert_eq!(f.controller.store().persist_count(), 0);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn cancel_flag_set_before_first_tick() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(5);
    config.pipeline.short_countdown_secs = 0;

    let ctx = Arc::new(RuntimeContext::new());
    ctx.update_settings(|s| s.disable_think = true);
    let source = Arc::new(ScriptedSource::new("test-model", &["never"]));
    ctx.set_source(Some(source.clone() as Arc<dyn ResponseSource>));
    let store = Arc::new(SessionStore::open(dir.path().join("history"), 12).unwrap());
    let (events, _) = broadcast::channel(64);
    let pipeline = TurnPipeline::new(
        ctx.clone(),
        store.clone(),
        Arc::new(Augmentor::new(retrieval(), Arc::new(DisabledWebSearch))),
        events,
        Arc::new(RwLock::new(config)),
    );

    let turn = pipeline.begin("Hi").unwrap();
    assert_eq!(turn.countdown_ticks, 0);
    ctx.cancel_flag().set();
    let outcome = pipeline.drive(turn).await;

    assert_eq!(
        outcome,
        TurnOutcome::Cancelled {
            notice: "Input cancelled.".to_string()
        }
    );
    let session = ctx.session().unwrap();
    assert_eq!(session.log.len(), 2);
    assert_eq!(session.log[0].role, Role::User);
    assert_eq!(last_assistant(&session), "Input cancelled.");
    assert_eq!(store.persist_count(), 0);
    assert_eq!(source.request_count(), 0);
    assert_eq!(ctx.phase().current(), PipelinePhase::WaitingForInput);
}

#[tokio::test]
async fn cancel_at_every_countdown_tick() {
    let f = fixture(30);
    f.controller
        .load_model(ScriptedSource::new("test-model", &["never"]).into_shared())
        .unwrap();
    let config = f.controller.config();

    for line_count in [1, 5, 12] {
        let ticks = config.pipeline.countdown_ticks(line_count, true);
        for tick in 1..=ticks {
            f.controller.start_session().unwrap();
            let mut rx = f.controller.subscribe();
            let handle = start(&f.controller, &lines(line_count)).await;

            let expected = format!("Afterthought countdown... {tick}s");
            wait_for(&mut rx, |e| {
                matches!(e, PipelineEvent::AssistantContent { content, .. } if *content == expected)
            })
            .await;
            let decision = f.controller.cancel();
            assert!(decision.set_flag);

            let outcome = handle.await.unwrap();
            assert!(
                matches!(&outcome, TurnOutcome::Cancelled { notice } if notice == "Input cancelled."),
                "lines={line_count} tick={tick} outcome={outcome:?}"
            );
            let session = f.controller.session().unwrap();
            assert_eq!(session.log.len(), 2);
            assert_eq!(last_assistant(&session), "Input cancelled.");
            assert_eq!(f.controller.phase(), PipelinePhase::WaitingForInput);
        }
    }
    assert_eq!(f.controller.store().persist_count(), 0);
    assert!(f.controller.list_sessions().unwrap().is_empty());
}

#[tokio::test]
async fn cancel_during_streaming() {
    let f = fixture(5);
    let tokens: Vec<String> = (0..50).map(|i| format!("t{i}")).collect();
    let token_refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
    let source = ScriptedSource::new("test-model", &token_refs)
        .with_token_delay(Duration::from_millis(20));
    f.controller.load_model(source.into_shared()).unwrap();

    let mut rx = f.controller.subscribe();
    let handle = start(&f.controller, "Hi").await;
    wait_for(&mut rx, |e| {
        matches!(e, PipelineEvent::AssistantContent { content, .. } if content.starts_with("t0"))
    })
    .await;
    assert_eq!(f.controller.action_label(), "Cancel Response");

    let SubmitOutcome::CancelRequested(decision) = f.controller.submit("ignored").await else {
        panic!("pressing the action button mid-stream should cancel");
    };
    assert_eq!(decision.status, "Response generation cancelled.");

    let outcome = handle.await.unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Cancelled {
            notice: "Generation cancelled.".to_string()
        }
    );
    let session = f.controller.session().unwrap();
    assert_eq!(last_assistant(&session), "Generation cancelled.");
    assert_eq!(f.controller.store().persist_count(), 0);
}

// =============================================================================
// Completion and persistence
// =============================================================================

#[tokio::test]
async fn long_input_streams_and_persists_once() {
    let f = fixture(5);
    f.controller
        .load_model(ScriptedSource::new("test-model", &["Hel", "lo", "!"]).into_shared())
        .unwrap();

    let mut rx = f.controller.subscribe();
    let handle = start(&f.controller, &lines(12)).await;
    let started = wait_for(&mut rx, |e| matches!(e, PipelineEvent::TurnStarted { .. })).await;
    assert!(matches!(started, PipelineEvent::TurnStarted { countdown_ticks: 6, .. }));

    let outcome = handle.await.unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Completed {
            content: "Hel lo !".to_string(),
            persisted: true
        }
    );
    assert_eq!(f.controller.store().persist_count(), 1);

    let summaries = f.controller.list_sessions().unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].turn_count, 2);
    let stored = f.controller.store().load(&summaries[0].id).unwrap();
    assert_eq!(stored.log.len(), 2);
    assert_eq!(last_assistant(&stored), "Hel lo !");
    assert_eq!(stored.label, "line 1 line 2 line 3");
}

#[tokio::test]
async fn generation_error_is_not_persisted() {
    let f = fixture(5);
    let source = ScriptedSource::new("test-model", &["a", "b"]).failing_after(1, "backend crashed");
    f.controller.load_model(source.into_shared()).unwrap();

    let outcome = start(&f.controller, "Hi").await.await.unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Failed {
            error: "Error generating response: backend crashed".to_string()
        }
    );
    assert_eq!(f.controller.phase(), PipelinePhase::WaitingForInput);
    assert_eq!(f.controller.store().persist_count(), 0);

    // The controller is still usable afterwards.
    f.controller
        .load_model(ScriptedSource::new("test-model", &["ok"]).into_shared())
        .unwrap();
    let outcome = start(&f.controller, "Again").await.await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));
}

#[tokio::test]
async fn persist_failure_keeps_response_in_memory() {
    let f = fixture(5);
    f.controller
        .load_model(ScriptedSource::new("test-model", &["kept"]).into_shared())
        .unwrap();
    // Replace the history directory with a file so writes fail.
    let history = f.controller.store().history_dir().to_path_buf();
    std::fs::remove_dir_all(&history).unwrap();
    std::fs::write(&history, b"not a directory").unwrap();

    let mut rx = f.controller.subscribe();
    let outcome = start(&f.controller, "Hi").await.await.unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Completed {
            content: "kept".to_string(),
            persisted: false
        }
    );
    wait_for(&mut rx, |e| matches!(e, PipelineEvent::PersistFailed { .. })).await;
    assert_eq!(last_assistant(&f.controller.session().unwrap()), "kept");
}

#[tokio::test]
async fn retention_keeps_most_recent_sessions() {
    let f = fixture_with(test_config(2), 3, 6);
    f.controller
        .load_model(ScriptedSource::new("test-model", &["ok"]).into_shared())
        .unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        f.controller.start_session().unwrap();
        let outcome = start(&f.controller, &format!("session {i}")).await.await.unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { persisted: true, .. }));
        ids.push(f.controller.session().unwrap().id);
    }

    let listed: Vec<_> = f
        .controller
        .list_sessions()
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect();
    let expected: Vec<_> = ids.iter().rev().take(3).cloned().collect();
    assert_eq!(listed, expected);
    assert_eq!(std::fs::read_dir(f.controller.store().history_dir()).unwrap().count(), 3);
}

#[tokio::test]
async fn follow_up_turns_reuse_the_session() {
    let f = fixture(2);
    f.controller
        .load_model(ScriptedSource::new("test-model", &["ok"]).into_shared())
        .unwrap();
    start(&f.controller, "first").await.await.unwrap();
    let id = f.controller.session().unwrap().id;
    start(&f.controller, "second").await.await.unwrap();

    let session = f.controller.session().unwrap();
    assert_eq!(session.id, id);
    assert_eq!(session.log.len(), 4);
    assert_eq!(f.controller.list_sessions().unwrap().len(), 1);
    assert_eq!(f.controller.store().persist_count(), 2);
}

#[tokio::test]
async fn load_session_restores_log_and_attachments() {
    let f = fixture(2);
    f.controller
        .load_model(ScriptedSource::new("test-model", &["ok"]).into_shared())
        .unwrap();
    let doc = f.dir.path().join("notes.txt");
    std::fs::write(&doc, "meeting notes about the harbour").unwrap();
    f.controller.attach_files(&[doc]).await.unwrap();
    start(&f.controller, "remember this").await.await.unwrap();
    let id = f.controller.session().unwrap().id;

    f.controller.start_session().unwrap();
    assert!(f.controller.session().is_none());

    let message = f.controller.load_session(0).await.unwrap();
    assert_eq!(message, "Loaded session: remember this");
    let session = f.controller.session().unwrap();
    assert_eq!(session.id, id);
    assert_eq!(session.log.len(), 2);
    assert_eq!(session.attachments.len(), 1);
    assert_eq!(f.controller.attachments().await, session.attachments);
    assert_eq!(session.vector_files, session.attachments);
}

#[tokio::test]
async fn delete_all_history_clears_store_and_session() {
    let f = fixture(2);
    f.controller
        .load_model(ScriptedSource::new("test-model", &["ok"]).into_shared())
        .unwrap();
    start(&f.controller, "one").await.await.unwrap();
    assert_eq!(f.controller.delete_all_history().unwrap(), 1);
    assert!(f.controller.session().is_none());
    assert!(f.controller.list_sessions().unwrap().is_empty());
}

// =============================================================================
// Attachments and retrieval
// =============================================================================

fn write_doc(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, body).unwrap();
    path
}

#[tokio::test]
async fn attachments_never_exceed_capacity() {
    let f = fixture_with(test_config(2), 12, 2);
    f.controller
        .load_model(ScriptedSource::new("test-model", &["ok"]).into_shared())
        .unwrap();
    let docs: Vec<PathBuf> = (0..4)
        .map(|i| write_doc(&f.dir, &format!("doc{i}.txt"), "text"))
        .collect();

    let first = f.controller.attach_files(&docs[..1]).await.unwrap();
    assert_eq!(first.status(), "Processed 1 new files.");
    let second = f.controller.attach_files(&docs).await.unwrap();
    assert_eq!(second.added.len(), 1);
    assert_eq!(second.duplicates, 1);
    assert_eq!(second.rejected, 2);
    assert_eq!(f.controller.attachments().await.len(), 2);

    let third = f.controller.attach_files(&docs[2..]).await.unwrap();
    assert_eq!(third.status(), "Max files (2) reached.");
    assert_eq!(f.controller.attachments().await.len(), 2);
}

#[tokio::test]
async fn ejecting_rebuilds_before_next_generation() {
    let f = fixture(2);
    let source = Arc::new(ScriptedSource::new("test-model", &["ok"]));
    f.controller
        .load_model(source.clone() as Arc<dyn ResponseSource>)
        .unwrap();
    let a = write_doc(&f.dir, "apples.txt", "apples grow in the orchard");
    let b = write_doc(&f.dir, "boats.txt", "boats sail in the harbour");
    f.controller.attach_files(&[a, b]).await.unwrap();
    let rebuilds = f.controller.retrieval().rebuild_count();

    let mut rx = f.controller.subscribe();
    assert_eq!(f.controller.eject_file(0).await, "Ejected apples.txt");
    assert_eq!(f.controller.retrieval().rebuild_count(), rebuilds + 1);
    let rebuilt = wait_for(&mut rx, |e| matches!(e, PipelineEvent::RetrievalRebuilt { .. })).await;
    assert!(matches!(rebuilt, PipelineEvent::RetrievalRebuilt { file_count: 1, .. }));

    start(&f.controller, "where do apples and boats go").await.await.unwrap();
    assert_eq!(f.controller.retrieval().rebuild_count(), rebuilds + 1);

    let request = source.requests().pop().unwrap();
    let context: String = request
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    assert!(context.contains("[boats.txt]"));
    assert!(!context.contains("[apples.txt]"));

    let session = f.controller.session().unwrap();
    assert_eq!(session.attachments.len(), 1);
    assert_eq!(session.vector_files, session.attachments);
}

#[tokio::test]
async fn restoring_a_session_recovers_ejected_attachments() {
    let f = fixture(2);
    f.controller
        .load_model(ScriptedSource::new("test-model", &["ok"]).into_shared())
        .unwrap();
    let doc = write_doc(&f.dir, "notes.txt", "meeting notes about the harbour");
    f.controller.attach_files(&[doc]).await.unwrap();
    start(&f.controller, "remember this").await.await.unwrap();

    f.controller.eject_file(0).await;
    f.controller.start_session().unwrap();
    assert!(f.controller.attachments().await.is_empty());

    for _ in 0..2 {
        f.controller.load_session(0).await.unwrap();
        let restored = f.controller.attachments().await;
        assert_eq!(restored.len(), 1);
        assert!(restored[0].is_file());
        let copies = std::fs::read_dir(f.dir.path().join("temp")).unwrap().count();
        assert_eq!(copies, 1);
    }
    assert_eq!(
        f.controller.session().unwrap().vector_files,
        f.controller.attachments().await
    );
}

// =============================================================================
// Settings
// =============================================================================

#[tokio::test]
async fn unoffered_setting_is_rejected_and_kept() {
    let f = fixture(2);
    let err = f
        .controller
        .apply_setting("max_history_slots", "3")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("max_history_slots"));
    assert_eq!(f.controller.config().model.max_history_slots, 12);
    assert_eq!(f.controller.store().max_slots(), 12);
}

// =============================================================================
// llama-cli process source
// =============================================================================

#[cfg(unix)]
fn fake_llama_cli(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(unix)]
#[tokio::test]
async fn llama_cli_output_keeps_words_whole() {
    let f = fixture(2);
    // Both scripts are written before anything is spawned.
    let long_word = fake_llama_cli(
        f.dir.path(),
        "long-word.sh",
        "head -c 300 /dev/zero | tr '\\000' a",
    );
    let split_reads = fake_llama_cli(
        f.dir.path(),
        "split-reads.sh",
        "printf 'Hel'; sleep 0.2; printf 'lo world'",
    );
    std::fs::write(f.dir.path().join("tiny.gguf"), b"gguf").unwrap();

    for (script, expected) in [
        (long_word, "a".repeat(300)),
        (split_reads, "Hello world".to_string()),
    ] {
        let mut config = f.controller.config();
        config.model.model_dir = f.dir.path().display().to_string();
        config.model.model_name = "tiny.gguf".to_string();
        config.backend.llama_bin_path = script.display().to_string();
        f.controller.apply_config(config).await.unwrap();
        f.controller.load_configured_model().unwrap();
        f.controller.start_session().unwrap();

        match start(&f.controller, "hi").await.await.unwrap() {
            TurnOutcome::Completed { content, persisted } => {
                assert_eq!(content, expected);
                assert!(persisted);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
