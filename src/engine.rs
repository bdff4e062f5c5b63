//! The feedback engine: one context object owning every collaborator.
//!
//! [`FeedbackEngine`] is what a host application talks to. It holds the
//! structure model, the completion detector, the association store, the
//! scheduler, the configured rules and the generation client, and wires
//! them together:
//!
//! ```text
//! on_text_changed(text)
//!   ├─ structure.analyze(text)
//!   ├─ detector.analyze(text)          → word / sentence completions
//!   ├─ store.validate_and_cleanup(text) → FeedbackRetracted
//!   └─ scheduler.schedule_prompt_feedback(rule, ...)
//!                     │  (timer fires)
//!                     ▼
//!          client.call(prompt)  ── the only await point
//!                     │
//!          token still current? ── no → discard
//!                     │ yes
//!          store.associate_content / associate_feedback → FeedbackReady
//! ```
//!
//! Engine state sits behind a `std::sync::Mutex` that is never held across
//! an `.await`. Every result coming back from the client is checked against
//! the scheduler's token (individual runs) or epoch (batch runs) before it
//! touches the store.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::Result;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::associations::{
    AssociationExport, FeedbackAssociationStore, FeedbackEntry, StoreEvent, SubscriptionId,
    ValidationThresholds,
};
use crate::completion::{CompletionDetector, CompletionEvent, CompletionKind};
use crate::config::Config;
use crate::error::HarnessError;
use crate::generation::{GenerationClient, Usage};
use crate::models::{ContentKind, Span, StructureSnapshot};
use crate::persist::PersistentStore;
use crate::rules::{Rule, TriggerTiming};
use crate::scheduler::{
    AnalysisScheduler, BatchFuture, BatchRequest, BatchRun, BatchRunner, BatchSummary,
    RuleCallback, RuleFire, RuleFuture, ScheduleOutcome,
};
use crate::structure::DocumentStructureModel;

/// Why feedback was withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetractReason {
    /// The content it was attached to no longer survives in the text.
    ContentChanged,
    /// The same rule produced newer feedback for the same content.
    Superseded,
    /// Dismissed through [`FeedbackEngine::remove_feedback`].
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Completion(CompletionEvent),
    RuleScheduled {
        rule_id: String,
        outcome: ScheduleOutcome,
    },
    FeedbackReady {
        rule_id: String,
        rule_name: String,
        content_id: String,
        feedback_id: String,
        payload: String,
        usage: Option<Usage>,
    },
    RuleFailed {
        error: HarnessError,
    },
    FeedbackRetracted {
        feedback_ids: Vec<String>,
        reason: RetractReason,
    },
    BatchSettled(BatchSummary),
    /// The association table was imported, loaded or cleared wholesale.
    /// Feedback shown before this event may no longer exist.
    AssociationsReplaced {
        associations: usize,
    },
}

/// Result of one rule run.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Feedback {
        rule_id: String,
        content_id: String,
        feedback_id: String,
    },
    Failed(HarnessError),
    /// The run was superseded or reset while the client call was out.
    Discarded { rule_id: String },
}

/// Content a rule's feedback gets attached to.
#[derive(Debug, Clone, PartialEq)]
struct Target {
    kind: ContentKind,
    content: String,
    position: Option<Span>,
    /// Completed word or sentence, substituted for `{{unit}}`.
    unit: Option<String>,
}

/// How a finished call proves it is still wanted.
#[derive(Debug, Clone, Copy)]
enum Authority {
    Rule(u64),
    Batch(u64),
}

struct EngineState {
    text: String,
    structure: DocumentStructureModel,
    detector: CompletionDetector,
    store: FeedbackAssociationStore,
}

pub struct FeedbackEngine {
    config: Config,
    client: Arc<dyn GenerationClient>,
    scheduler: AnalysisScheduler,
    state: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
    me: Weak<FeedbackEngine>,
}

impl FeedbackEngine {
    pub fn new(config: Config, client: Arc<dyn GenerationClient>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let thresholds = ValidationThresholds {
            sentence: config.validation.sentence_threshold,
            paragraph: config.validation.paragraph_threshold,
        };
        let state = EngineState {
            text: String::new(),
            structure: DocumentStructureModel::with_word_tolerance(
                config.structure.word_position_tolerance,
            ),
            detector: CompletionDetector::new(),
            store: FeedbackAssociationStore::new(thresholds),
        };
        let scheduler = AnalysisScheduler::new(config.scheduler.clone());

        Arc::new_cyclic(|me| Self {
            config,
            client,
            scheduler,
            state: Mutex::new(state),
            events,
            me: me.clone(),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Register a listener for every association store change.
    ///
    /// Listeners run while engine state is locked and must not call back
    /// into the engine.
    pub fn subscribe_associations<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StoreEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.lock().store.subscribe(listener)
    }

    pub fn unsubscribe_associations(&self, id: SubscriptionId) -> bool {
        self.lock().store.unsubscribe(id)
    }

    pub fn scheduler(&self) -> &AnalysisScheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rules(&self) -> &[Rule] {
        &self.config.rules
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ============ Text input ============

    /// Feed a new revision of the text.
    ///
    /// Analyzes structure, detects completions, drops feedback whose
    /// content no longer survives, and schedules the rules whose trigger
    /// matched. Must be called from within a tokio runtime.
    pub fn on_text_changed(&self, text: &str) -> StructureSnapshot {
        let (snapshot, completions, retracted, paragraph) = {
            let mut st = self.lock();
            if st.text == text && st.structure.version() > 0 {
                return st.structure.snapshot().clone();
            }
            let snapshot = st.structure.analyze(text).clone();
            let completions = st.detector.analyze(text);
            let retracted = st.store.validate_and_cleanup(text);
            st.text = text.to_string();
            let paragraph = last_paragraph(&snapshot);
            (snapshot, completions, retracted, paragraph)
        };

        if !retracted.is_empty() {
            self.retract(
                retracted.into_iter().map(|e| e.feedback_id).collect(),
                RetractReason::ContentChanged,
            );
        }

        let word = completions
            .iter()
            .find(|e| e.kind == CompletionKind::Word)
            .map(|e| e.completed_unit.clone());
        let sentence = completions
            .iter()
            .find(|e| e.kind == CompletionKind::Sentence)
            .map(|e| e.completed_unit.clone());
        for event in completions {
            self.emit(EngineEvent::Completion(event));
        }

        for rule in self.config.enabled_rules() {
            let target = match rule.trigger {
                TriggerTiming::Word => word.as_ref().map(|w| unit_target(ContentKind::Word, w)),
                TriggerTiming::Sentence => sentence
                    .as_ref()
                    .map(|s| unit_target(ContentKind::Sentence, s)),
                TriggerTiming::Custom => paragraph.clone(),
                TriggerTiming::Manual => None,
            };
            let Some(target) = target else { continue };

            let outcome = self.scheduler.schedule_prompt_feedback(
                &rule.id,
                self.rule_callback(rule.clone(), target),
                rule.trigger,
                text,
                rule.delay.as_deref(),
            );
            if outcome != ScheduleOutcome::Unchanged {
                self.emit(EngineEvent::RuleScheduled {
                    rule_id: rule.id.clone(),
                    outcome,
                });
            }
        }

        snapshot
    }

    /// Replace the current text without scheduling anything.
    ///
    /// Structure, completion baseline and association cleanup all update;
    /// no rule is triggered. Used to restore a document on startup.
    pub fn load_text(&self, text: &str) -> StructureSnapshot {
        let (snapshot, retracted) = {
            let mut st = self.lock();
            let snapshot = st.structure.analyze(text).clone();
            st.detector.analyze(text);
            let retracted = st.store.validate_and_cleanup(text);
            st.text = text.to_string();
            (snapshot, retracted)
        };
        if !retracted.is_empty() {
            self.retract(
                retracted.into_iter().map(|e| e.feedback_id).collect(),
                RetractReason::ContentChanged,
            );
        }
        snapshot
    }

    pub fn text(&self) -> String {
        self.lock().text.clone()
    }

    // ============ Rule execution ============

    /// Fire `rule_id` immediately against the current text. Returns false
    /// (with a warning) if no such rule is configured.
    pub fn run_rule_now(&self, rule_id: &str) -> bool {
        let Some(rule) = self.config.rule(rule_id) else {
            warn!("{}", HarnessError::lookup("rule", rule_id));
            return false;
        };
        let (text, target) = {
            let st = self.lock();
            (st.text.clone(), document_target(st.structure.snapshot(), &st.text))
        };
        let outcome = self
            .scheduler
            .fire_now(&rule.id, self.rule_callback(rule.clone(), target), &text);
        self.emit(EngineEvent::RuleScheduled {
            rule_id: rule.id.clone(),
            outcome,
        });
        true
    }

    /// Cancel a rule's pending timer.
    pub fn cancel_rule(&self, rule_id: &str) -> bool {
        self.scheduler.clear_rule_timer(rule_id)
    }

    /// Run every enabled rule against the current text in one batch.
    pub fn request_batch(&self) -> BatchRequest {
        let text = self.text();
        let engine = self.me.clone();
        let runner: BatchRunner = Arc::new(move |run: BatchRun| -> BatchFuture {
            let engine = engine.clone();
            Box::pin(async move {
                match engine.upgrade() {
                    Some(engine) => engine.run_batch(run).await,
                    None => BatchSummary::default(),
                }
            })
        });
        self.scheduler.request_batch(&text, runner)
    }

    async fn run_batch(self: Arc<Self>, run: BatchRun) -> BatchSummary {
        let target = {
            let st = self.lock();
            document_target(st.structure.snapshot(), &run.content)
        };

        let mut set = JoinSet::new();
        for rule in self.config.enabled_rules() {
            let engine = self.clone();
            let rule = rule.clone();
            let target = target.clone();
            let content = run.content.clone();
            let epoch = run.epoch;
            set.spawn(async move {
                let id = rule.id.clone();
                let outcome = engine
                    .execute_rule(&rule, &target, &content, Authority::Batch(epoch))
                    .await;
                (id, outcome)
            });
        }

        let mut summary = BatchSummary::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, RuleOutcome::Feedback { rule_id, .. })) => summary.succeeded.push(rule_id),
                Ok((_, RuleOutcome::Failed(error))) => summary.failed.push(error),
                Ok((_, RuleOutcome::Discarded { rule_id })) => summary.discarded.push(rule_id),
                Err(e) => summary.failed.push(HarnessError::Service {
                    rule_id: "<batch>".to_string(),
                    message: format!("rule task aborted: {}", e),
                }),
            }
        }

        self.emit(EngineEvent::BatchSettled(summary.clone()));
        summary
    }

    fn rule_callback(&self, rule: Rule, target: Target) -> RuleCallback {
        let engine = self.me.clone();
        Arc::new(move |fire: RuleFire| -> RuleFuture {
            let engine = engine.clone();
            let rule = rule.clone();
            let target = target.clone();
            Box::pin(async move {
                if let Some(engine) = engine.upgrade() {
                    engine
                        .execute_rule(&rule, &target, &fire.content, Authority::Rule(fire.token))
                        .await;
                }
            })
        })
    }

    fn is_authoritative(&self, rule_id: &str, authority: Authority) -> bool {
        match authority {
            Authority::Rule(token) => self.scheduler.is_current(rule_id, token),
            Authority::Batch(epoch) => self.scheduler.batch_is_current(epoch),
        }
    }

    /// Render, call the client, and apply the result if still wanted.
    async fn execute_rule(
        &self,
        rule: &Rule,
        target: &Target,
        content: &str,
        authority: Authority,
    ) -> RuleOutcome {
        let prompt = rule.render_prompt(content, target.unit.as_deref());
        let config = self.config.generation.with_model(rule.model.as_deref());
        debug!(rule = %rule.id, client = self.client.name(), "calling generation client");

        let result = self.client.call(&prompt, &config).await;

        if !self.is_authoritative(&rule.id, authority) {
            debug!(rule = %rule.id, "discarding stale result");
            return RuleOutcome::Discarded {
                rule_id: rule.id.clone(),
            };
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                let error = HarnessError::service(&rule.id, &e);
                warn!("{}", error);
                self.emit(EngineEvent::RuleFailed {
                    error: error.clone(),
                });
                return RuleOutcome::Failed(error);
            }
        };

        let applied = {
            let mut st = self.lock();
            let text = st.text.clone();
            let content_id =
                st.store
                    .associate_content(&target.content, target.kind, target.position, &text);
            st.store
                .associate_feedback(&content_id, &outcome.content, &rule.id, &rule.name)
                .map(|feedback_id| {
                    let superseded =
                        st.store
                            .supersede_rule_feedback(&content_id, &rule.id, &feedback_id);
                    (content_id, feedback_id, superseded)
                })
        };
        let Some((content_id, feedback_id, superseded)) = applied else {
            return RuleOutcome::Discarded {
                rule_id: rule.id.clone(),
            };
        };

        self.scheduler.set_visible_result(&rule.id, true);
        if !superseded.is_empty() {
            self.retract(superseded, RetractReason::Superseded);
        }
        info!(rule = %rule.id, content = %content_id, feedback = %feedback_id, "feedback ready");
        self.emit(EngineEvent::FeedbackReady {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            content_id: content_id.clone(),
            feedback_id: feedback_id.clone(),
            payload: outcome.content,
            usage: outcome.usage,
        });

        RuleOutcome::Feedback {
            rule_id: rule.id.clone(),
            content_id,
            feedback_id,
        }
    }

    fn retract(&self, feedback_ids: Vec<String>, reason: RetractReason) {
        self.sync_visible_results();
        self.emit(EngineEvent::FeedbackRetracted {
            feedback_ids,
            reason,
        });
    }

    /// Tell the scheduler which rules still have feedback on screen.
    fn sync_visible_results(&self) {
        let visible: HashSet<String> = self
            .lock()
            .store
            .current_feedback()
            .into_iter()
            .map(|(_, e)| e.rule_id)
            .collect();
        for rule in &self.config.rules {
            self.scheduler
                .set_visible_result(&rule.id, visible.contains(&rule.id));
        }
    }

    // ============ Associations ============

    /// Hide one feedback entry. Unknown ids are a logged no-op.
    pub fn remove_feedback(&self, feedback_id: &str) -> bool {
        let removed = self.lock().store.remove_feedback(feedback_id);
        if removed {
            self.retract(vec![feedback_id.to_string()], RetractReason::Removed);
        }
        removed
    }

    pub fn feedback_for_content(&self, content_id: &str) -> Vec<FeedbackEntry> {
        self.lock().store.get_feedback_for_content(content_id)
    }

    pub fn current_feedback(&self) -> Vec<(String, FeedbackEntry)> {
        self.lock().store.current_feedback()
    }

    pub fn export_associations(&self) -> AssociationExport {
        self.lock().store.export()
    }

    /// Replace the association table with a JSON export. A malformed blob
    /// leaves the table empty.
    pub fn import_associations(&self, blob: &str) -> Result<usize, HarnessError> {
        let result = self.lock().store.import_json(blob);
        self.replaced();
        result
    }

    pub fn clear_associations(&self) {
        self.lock().store.reset();
        self.replaced();
    }

    pub fn save_associations(&self, store: &dyn PersistentStore) -> Result<()> {
        self.lock().store.save_to(store, &self.config.store.key)
    }

    pub fn load_associations(&self, store: &dyn PersistentStore) -> Result<Option<usize>> {
        let loaded = self.lock().store.load_from(store, &self.config.store.key);
        if !matches!(loaded, Ok(None)) {
            self.replaced();
        }
        loaded
    }

    fn replaced(&self) {
        self.sync_visible_results();
        let associations = self.lock().store.len();
        self.emit(EngineEvent::AssociationsReplaced { associations });
    }

    // ============ Structure ============

    pub fn structure_snapshot(&self) -> StructureSnapshot {
        self.lock().structure.snapshot().clone()
    }

    pub fn mark_range_as_generated(&self, start: usize, end: usize) -> usize {
        self.lock().structure.mark_range_as_generated(start, end)
    }

    /// Cancel every timer, clear batch flags, and forget the text.
    /// Results still in flight are discarded when they return. The
    /// association table is kept.
    pub fn reset(&self) {
        self.scheduler.reset_all_timers();
        let mut st = self.lock();
        st.structure.reset();
        st.detector.reset();
        st.text.clear();
        drop(st);
        self.sync_visible_results();
    }
}

fn unit_target(kind: ContentKind, unit: &str) -> Target {
    Target {
        kind,
        content: unit.to_string(),
        position: None,
        unit: Some(unit.to_string()),
    }
}

fn last_paragraph(snapshot: &StructureSnapshot) -> Option<Target> {
    snapshot.paragraphs.last().map(|p| Target {
        kind: ContentKind::Paragraph,
        content: p.content.clone(),
        position: Some(p.position),
        unit: None,
    })
}

/// Last paragraph if there is one, else the whole text as a paragraph.
fn document_target(snapshot: &StructureSnapshot, text: &str) -> Target {
    last_paragraph(snapshot).unwrap_or_else(|| Target {
        kind: ContentKind::Paragraph,
        content: text.to_string(),
        position: None,
        unit: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_target_falls_back_to_text() {
        let target = document_target(&StructureSnapshot::default(), "");
        assert_eq!(target.kind, ContentKind::Paragraph);
        assert_eq!(target.content, "");

        let mut model = DocumentStructureModel::new();
        let snapshot = model.analyze("First one.\n\nSecond one.").clone();
        let target = document_target(&snapshot, "ignored");
        assert_eq!(target.content, "Second one.");
        assert!(target.position.is_some());
    }

    #[test]
    fn test_unit_target_carries_unit() {
        let target = unit_target(ContentKind::Word, "Hello");
        assert_eq!(target.unit.as_deref(), Some("Hello"));
        assert_eq!(target.position, None);
    }
}
