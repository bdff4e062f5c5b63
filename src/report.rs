//! Engine event reporting for `draft watch` and `draft run`.
//!
//! Reports are written to **stderr** so stdout stays parseable for
//! scripts. Three modes:
//!
//! - `human`: one readable line per event
//! - `json`: one JSON object per line
//! - `off`: nothing

use std::io::Write;

use clap::ValueEnum;
use serde_json::json;

use crate::completion::CompletionKind;
use crate::engine::{EngineEvent, RetractReason};
use crate::error::HarnessError;

/// Receives engine events. Implementations write to stderr.
pub trait EventReporter: Send + Sync {
    fn report(&self, event: &EngineEvent);
}

/// Human-friendly lines: `feedback grammar  content_3  "Consider ..."`.
pub struct HumanReporter;

impl EventReporter for HumanReporter {
    fn report(&self, event: &EngineEvent) {
        let line = match event {
            EngineEvent::Completion(c) => {
                let kind = match c.kind {
                    CompletionKind::Word => "word",
                    CompletionKind::Sentence => "sentence",
                };
                format!("completed {}  {:?}  (total {})", kind, c.completed_unit, c.total_count)
            }
            EngineEvent::RuleScheduled { rule_id, outcome } => {
                format!("scheduled {}  {:?}", rule_id, outcome)
            }
            EngineEvent::FeedbackReady {
                rule_id,
                content_id,
                payload,
                ..
            } => format!("feedback {}  {}  {}", rule_id, content_id, first_line(payload)),
            EngineEvent::RuleFailed { error } => format!("error {}", error),
            EngineEvent::FeedbackRetracted {
                feedback_ids,
                reason,
            } => format!(
                "retracted {} ({})",
                feedback_ids.join(", "),
                reason_str(*reason)
            ),
            EngineEvent::BatchSettled(summary) => format!(
                "batch settled  {} ok  {} failed  {} discarded",
                summary.successes(),
                summary.errors(),
                summary.discarded.len()
            ),
            EngineEvent::AssociationsReplaced { associations } => {
                format!("associations replaced  {} loaded", associations)
            }
        };
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", line);
        let _ = err.flush();
    }
}

/// Machine-readable: one JSON object per line on stderr.
pub struct JsonReporter;

impl EventReporter for JsonReporter {
    fn report(&self, event: &EngineEvent) {
        let obj = event_json(event);
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when reporting is disabled.
pub struct NoReporter;

impl EventReporter for NoReporter {
    fn report(&self, _event: &EngineEvent) {}
}

pub fn event_json(event: &EngineEvent) -> serde_json::Value {
    match event {
        EngineEvent::Completion(c) => json!({
            "event": "completion",
            "kind": c.kind,
            "unit": c.completed_unit,
            "total": c.total_count,
        }),
        EngineEvent::RuleScheduled { rule_id, outcome } => json!({
            "event": "scheduled",
            "rule": rule_id,
            "outcome": format!("{:?}", outcome),
        }),
        EngineEvent::FeedbackReady {
            rule_id,
            rule_name,
            content_id,
            feedback_id,
            payload,
            usage,
        } => json!({
            "event": "feedback",
            "rule": rule_id,
            "rule_name": rule_name,
            "content_id": content_id,
            "feedback_id": feedback_id,
            "payload": payload,
            "usage": usage,
        }),
        EngineEvent::RuleFailed { error } => {
            let rule = match error {
                HarnessError::Service { rule_id, .. } => Some(rule_id.as_str()),
                _ => None,
            };
            json!({
                "event": "error",
                "rule": rule,
                "message": error.to_string(),
            })
        }
        EngineEvent::FeedbackRetracted {
            feedback_ids,
            reason,
        } => json!({
            "event": "retracted",
            "feedback_ids": feedback_ids,
            "reason": reason,
        }),
        EngineEvent::BatchSettled(summary) => json!({
            "event": "batch_settled",
            "succeeded": summary.succeeded,
            "failed": summary.failed.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
            "discarded": summary.discarded,
        }),
        EngineEvent::AssociationsReplaced { associations } => json!({
            "event": "associations_replaced",
            "associations": associations,
        }),
    }
}

fn reason_str(reason: RetractReason) -> &'static str {
    match reason {
        RetractReason::ContentChanged => "content changed",
        RetractReason::Superseded => "superseded",
        RetractReason::Removed => "removed",
    }
}

fn first_line(payload: &str) -> String {
    let line = payload.lines().next().unwrap_or("").trim();
    if line.chars().count() > 80 {
        let cut: String = line.chars().take(77).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}

/// Report mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ReportMode {
    Off,
    Human,
    Json,
}

impl ReportMode {
    pub fn reporter(&self) -> Box<dyn EventReporter> {
        match self {
            ReportMode::Off => Box::new(NoReporter),
            ReportMode::Human => Box::new(HumanReporter),
            ReportMode::Json => Box::new(JsonReporter),
        }
    }
}
