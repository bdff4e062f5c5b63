use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::broadcast::Receiver;

use draft_harness::associations::StoreEvent;
use draft_harness::config::{Config, GenerationConfig};
use draft_harness::engine::{EngineEvent, FeedbackEngine, RetractReason};
use draft_harness::error::HarnessError;
use draft_harness::generation::{DisabledClient, GenerationClient, GenerationOutcome};
use draft_harness::models::ContentKind;
use draft_harness::persist::MemoryStore;
use draft_harness::rules::{Rule, TriggerTiming};
use draft_harness::scheduler::BatchRequest;

/// Echoes prompts back after a fixed latency. Prompts starting with
/// `FAIL` produce an error.
struct MockClient {
    latency: Duration,
    calls: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockClient {
    fn new(latency_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            latency: Duration::from_millis(latency_ms),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationClient for MockClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn call(&self, prompt: &str, _config: &GenerationConfig) -> Result<GenerationOutcome> {
        self.calls.lock().unwrap().push(prompt.to_string());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if prompt.starts_with("FAIL") {
            bail!("service unavailable");
        }
        Ok(GenerationOutcome::text(format!("re: {}", prompt)))
    }
}

fn rule(id: &str, trigger: TriggerTiming, prompt: &str) -> Rule {
    Rule {
        id: id.to_string(),
        name: id.to_uppercase(),
        prompt: prompt.to_string(),
        trigger,
        delay: None,
        enabled: true,
        model: None,
    }
}

fn config(rules: Vec<Rule>) -> Config {
    Config {
        rules,
        ..Config::default()
    }
}

async fn wait_for<F>(rx: &mut Receiver<EngineEvent>, pred: F) -> EngineEvent
where
    F: Fn(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for engine event")
}

fn drain(rx: &mut Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

fn is_feedback(e: &EngineEvent) -> bool {
    matches!(e, EngineEvent::FeedbackReady { .. })
}

fn is_settled(e: &EngineEvent) -> bool {
    matches!(e, EngineEvent::BatchSettled(_))
}

// ============ Batch mode ============

#[tokio::test(start_paused = true)]
async fn test_batch_request_during_flight_coalesces() {
    let client = MockClient::new(300);
    let engine = FeedbackEngine::new(
        config(vec![rule("summary", TriggerTiming::Manual, "Summarize: {{content}}")]),
        client.clone(),
    );
    let mut rx = engine.subscribe();

    engine.load_text("First draft.");
    assert_eq!(engine.request_batch(), BatchRequest::Started);
    tokio::time::sleep(Duration::from_millis(10)).await;

    engine.load_text("Second draft.");
    assert_eq!(engine.request_batch(), BatchRequest::Coalesced);

    tokio::time::sleep(Duration::from_secs(3)).await;

    let calls = client.calls();
    assert_eq!(calls.len(), 2, "calls: {:?}", calls);
    assert!(calls[0].contains("First draft."));
    assert!(calls[1].contains("Second draft."));
    assert_eq!(client.max_active.load(Ordering::SeqCst), 1);

    let settled = drain(&mut rx).into_iter().filter(is_settled).count();
    assert_eq!(settled, 2);
    assert!(!engine.scheduler().is_generating());
}

#[tokio::test(start_paused = true)]
async fn test_batch_settles_once_with_one_failure() {
    let client = MockClient::new(100);
    let engine = FeedbackEngine::new(
        config(vec![
            rule("a", TriggerTiming::Manual, "Check {{content}}"),
            rule("b", TriggerTiming::Manual, "FAIL {{content}}"),
            rule("c", TriggerTiming::Sentence, "Review {{content}}"),
        ]),
        client.clone(),
    );
    let mut rx = engine.subscribe();
    engine.load_text("The text under review.");
    engine.request_batch();

    let EngineEvent::BatchSettled(summary) = wait_for(&mut rx, is_settled).await else {
        unreachable!()
    };
    assert_eq!(summary.successes(), 2);
    assert_eq!(summary.errors(), 1);
    assert_eq!(
        summary.failed[0],
        HarnessError::Service {
            rule_id: "b".to_string(),
            message: "service unavailable".to_string(),
        }
    );

    // Rules run concurrently inside one batch.
    assert_eq!(client.max_active.load(Ordering::SeqCst), 3);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!drain(&mut rx).iter().any(is_settled));
    assert_eq!(engine.current_feedback().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_rules_skip_batch() {
    let client = MockClient::new(10);
    let mut off = rule("off", TriggerTiming::Manual, "x");
    off.enabled = false;
    let engine = FeedbackEngine::new(
        config(vec![rule("on", TriggerTiming::Manual, "y {{content}}"), off]),
        client.clone(),
    );
    let mut rx = engine.subscribe();
    engine.load_text("Body.");
    engine.request_batch();
    wait_for(&mut rx, is_settled).await;
    assert_eq!(client.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reset_discards_in_flight_batch() {
    let client = MockClient::new(500);
    let engine = FeedbackEngine::new(
        config(vec![rule("a", TriggerTiming::Manual, "Check {{content}}")]),
        client.clone(),
    );
    let mut rx = engine.subscribe();
    engine.load_text("Something.");
    engine.request_batch();
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.reset();

    let EngineEvent::BatchSettled(summary) = wait_for(&mut rx, is_settled).await else {
        unreachable!()
    };
    assert_eq!(summary.discarded, vec!["a".to_string()]);
    assert_eq!(summary.successes(), 0);
    assert!(engine.current_feedback().is_empty());
}

// ============ Individual mode ============

#[tokio::test(start_paused = true)]
async fn test_sentence_rule_feeds_association_store() {
    let client = MockClient::new(50);
    let engine = FeedbackEngine::new(
        config(vec![rule("grammar", TriggerTiming::Sentence, "Check: {{unit}}")]),
        client.clone(),
    );
    let mut rx = engine.subscribe();

    let snapshot = engine.on_text_changed("Cats run.");
    assert_eq!(snapshot.sentences.len(), 1);

    let EngineEvent::FeedbackReady {
        rule_id,
        content_id,
        feedback_id,
        payload,
        ..
    } = wait_for(&mut rx, is_feedback).await
    else {
        unreachable!()
    };
    assert_eq!(rule_id, "grammar");
    assert_eq!(payload, "re: Check: Cats run\n\nCats run.");

    let entries = engine.feedback_for_content(&content_id);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].feedback_id, feedback_id);
    assert_eq!(entries[0].rule_name, "GRAMMAR");

    let export = engine.export_associations();
    assert_eq!(export.content_associations[&content_id].kind, ContentKind::Sentence);

    // Rewriting the sentence away retracts its feedback.
    engine.on_text_changed("Birds fly.");
    let EngineEvent::FeedbackRetracted {
        feedback_ids,
        reason,
    } = wait_for(&mut rx, |e| matches!(e, EngineEvent::FeedbackRetracted { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(feedback_ids, vec![feedback_id]);
    assert_eq!(reason, RetractReason::ContentChanged);
    assert!(engine.current_feedback().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_word_rule_uses_completed_word() {
    let client = MockClient::new(10);
    let engine = FeedbackEngine::new(
        config(vec![rule("spell", TriggerTiming::Word, "Spell-check {{unit}}")]),
        client.clone(),
    );
    let mut rx = engine.subscribe();

    engine.on_text_changed("Helo");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(client.calls().is_empty());

    engine.on_text_changed("Helo ");
    wait_for(&mut rx, is_feedback).await;
    assert_eq!(client.calls(), vec!["Spell-check Helo\n\nHelo ".to_string()]);

    let export = engine.export_associations();
    let association = export.content_associations.values().next().unwrap();
    assert_eq!(association.kind, ContentKind::Word);
    assert_eq!(association.content, "Helo");
}

#[tokio::test(start_paused = true)]
async fn test_rapid_sentences_coalesce_into_one_call() {
    let client = MockClient::new(10);
    let engine = FeedbackEngine::new(
        config(vec![rule("grammar", TriggerTiming::Sentence, "{{content}}")]),
        client.clone(),
    );
    let mut rx = engine.subscribe();

    engine.on_text_changed("One.");
    tokio::time::sleep(Duration::from_millis(30)).await;
    engine.on_text_changed("One. Two.");
    tokio::time::sleep(Duration::from_millis(30)).await;
    engine.on_text_changed("One. Two. Three.");

    wait_for(&mut rx, is_feedback).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.calls(), vec!["One. Two. Three.".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_reset_discards_in_flight_rule_result() {
    let client = MockClient::new(500);
    let engine = FeedbackEngine::new(
        config(vec![rule("grammar", TriggerTiming::Sentence, "{{unit}}")]),
        client.clone(),
    );
    let mut rx = engine.subscribe();

    engine.on_text_changed("Cats run.");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(client.calls().len(), 1);

    engine.reset();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(engine.current_feedback().is_empty());
    assert!(!drain(&mut rx).iter().any(is_feedback));
    assert_eq!(engine.structure_snapshot().text_version, 0);
}

#[tokio::test(start_paused = true)]
async fn test_manual_rerun_supersedes_previous_feedback() {
    let client = MockClient::new(10);
    let engine = FeedbackEngine::new(
        config(vec![rule("tone", TriggerTiming::Manual, "Tone of {{content}}")]),
        client.clone(),
    );
    let mut rx = engine.subscribe();
    let mut audit = engine.subscribe();
    engine.load_text("Alpha beta.");

    assert!(engine.run_rule_now("tone"));
    let EngineEvent::FeedbackReady {
        feedback_id: first,
        content_id,
        ..
    } = wait_for(&mut rx, is_feedback).await
    else {
        unreachable!()
    };

    assert!(engine.run_rule_now("tone"));
    let EngineEvent::FeedbackReady {
        feedback_id: second,
        content_id: same,
        ..
    } = wait_for(&mut rx, is_feedback).await
    else {
        unreachable!()
    };
    assert_eq!(content_id, same);
    assert_ne!(first, second);

    let visible = engine.feedback_for_content(&content_id);
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].feedback_id, second);

    let retracted = drain(&mut audit).into_iter().find_map(|e| match e {
        EngineEvent::FeedbackRetracted {
            feedback_ids,
            reason: RetractReason::Superseded,
        } => Some(feedback_ids),
        _ => None,
    });
    assert_eq!(retracted, Some(vec![first]));
}

#[tokio::test(start_paused = true)]
async fn test_custom_rule_countdown_after_visible_result() {
    let client = MockClient::new(50);
    let mut tone = rule("tone", TriggerTiming::Custom, "Tone of {{content}}");
    tone.delay = Some("5s".to_string());
    let engine = FeedbackEngine::new(config(vec![tone]), client.clone());
    let mut rx = engine.subscribe();

    engine.on_text_changed("One.");
    assert_eq!(engine.scheduler().countdown_remaining("tone"), None);
    wait_for(&mut rx, is_feedback).await;

    engine.on_text_changed("One. Two.");
    let remaining = engine
        .scheduler()
        .countdown_remaining("tone")
        .expect("countdown should be running");
    assert!(remaining > Duration::from_millis(1000));
    assert!(remaining <= Duration::from_secs(5));

    // Paragraph feedback survives an edit that keeps most of its words.
    assert_eq!(engine.current_feedback().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_service_error_becomes_rule_artifact() {
    let engine = FeedbackEngine::new(
        config(vec![rule("spell", TriggerTiming::Word, "{{unit}}")]),
        Arc::new(DisabledClient),
    );
    let mut rx = engine.subscribe();
    engine.on_text_changed("Hello ");

    let EngineEvent::RuleFailed { error } =
        wait_for(&mut rx, |e| matches!(e, EngineEvent::RuleFailed { .. })).await
    else {
        unreachable!()
    };
    let HarnessError::Service { rule_id, message } = error else {
        panic!("expected service error");
    };
    assert_eq!(rule_id, "spell");
    assert!(message.contains("disabled"));
    assert!(engine.current_feedback().is_empty());
}

// ============ Lookups and persistence ============

#[tokio::test(start_paused = true)]
async fn test_unknown_ids_are_no_ops() {
    let engine = FeedbackEngine::new(Config::default(), MockClient::new(1));
    assert!(!engine.run_rule_now("missing"));
    assert!(!engine.remove_feedback("feedback_99"));
    assert!(!engine.cancel_rule("missing"));
    assert!(engine.feedback_for_content("content_1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_associations_persist_through_store() {
    let client = MockClient::new(10);
    let cfg = config(vec![rule("grammar", TriggerTiming::Sentence, "{{unit}}")]);
    let engine = FeedbackEngine::new(cfg.clone(), client.clone());
    let mut rx = engine.subscribe();
    engine.on_text_changed("Cats run.");
    wait_for(&mut rx, is_feedback).await;

    let store = MemoryStore::new();
    engine.save_associations(&store).unwrap();

    let restored = FeedbackEngine::new(cfg, client);
    let mut restored_rx = restored.subscribe();
    assert_eq!(restored.load_associations(&store).unwrap(), Some(1));
    assert_eq!(
        drain(&mut restored_rx),
        vec![EngineEvent::AssociationsReplaced { associations: 1 }]
    );
    assert_eq!(restored.current_feedback().len(), 1);

    let (_, entry) = restored.current_feedback().remove(0);
    assert!(restored.remove_feedback(&entry.feedback_id));
    assert!(restored.current_feedback().is_empty());
    assert_eq!(restored.export_associations().content_associations.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_import_resets_table() {
    let client = MockClient::new(10);
    let engine = FeedbackEngine::new(
        config(vec![rule("grammar", TriggerTiming::Sentence, "{{unit}}")]),
        client,
    );
    let mut rx = engine.subscribe();
    engine.on_text_changed("Cats run.");
    wait_for(&mut rx, is_feedback).await;
    assert_eq!(engine.current_feedback().len(), 1);

    let err = engine.import_associations("{ not json").unwrap_err();
    assert!(matches!(err, HarnessError::Validation(_)));
    assert!(engine.current_feedback().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_association_changes_reach_host() {
    let client = MockClient::new(10);
    let engine = FeedbackEngine::new(
        config(vec![rule("grammar", TriggerTiming::Sentence, "{{unit}}")]),
        client,
    );
    let mut rx = engine.subscribe();
    engine.on_text_changed("Cats run.");
    let EngineEvent::FeedbackReady {
        content_id,
        feedback_id,
        ..
    } = wait_for(&mut rx, is_feedback).await
    else {
        unreachable!()
    };
    let blob = serde_json::to_string(&engine.export_associations()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine.subscribe_associations(move |e| {
        sink.lock().unwrap().push(e.clone());
        Ok(())
    });

    engine.on_text_changed("Birds fly away");
    {
        let events = seen.lock().unwrap();
        let [StoreEvent::Cleanup {
            content_ids,
            removed,
        }] = events.as_slice()
        else {
            panic!("expected one cleanup, got {:?}", events);
        };
        assert_eq!(content_ids, &vec![content_id.clone()]);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].feedback_id, feedback_id);
    }
    drain(&mut rx);

    assert_eq!(engine.import_associations(&blob).unwrap(), 1);
    assert_eq!(
        drain(&mut rx),
        vec![EngineEvent::AssociationsReplaced { associations: 1 }]
    );
    assert_eq!(engine.feedback_for_content(&content_id).len(), 1);

    engine.clear_associations();
    assert_eq!(
        drain(&mut rx),
        vec![EngineEvent::AssociationsReplaced { associations: 0 }]
    );

    let events = seen.lock().unwrap();
    assert!(
        matches!(
            events.as_slice(),
            [
                StoreEvent::Cleanup { .. },
                StoreEvent::Imported { associations: 1 },
                StoreEvent::Reset
            ]
        ),
        "{:?}",
        events
    );
}

#[tokio::test(start_paused = true)]
async fn test_mark_range_as_generated() {
    let engine = FeedbackEngine::new(Config::default(), MockClient::new(1));
    engine.load_text("Written by me. Written by a model.");
    assert_eq!(engine.mark_range_as_generated(15, 34), 1);
    let snapshot = engine.structure_snapshot();
    assert_eq!(snapshot.stats.ai_generated_sentences, 1);
    assert!(snapshot.sentences[1].is_ai_generated);
    assert!(!snapshot.sentences[0].is_ai_generated);
}
