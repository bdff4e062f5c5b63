//! Implementations behind the `draft` subcommands.
//!
//! Results go to stdout; engine progress goes to stderr through the
//! [`report`](crate::report) reporters.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::associations::FeedbackAssociationStore;
use crate::config::Config;
use crate::engine::{EngineEvent, FeedbackEngine};
use crate::generation::create_client;
use crate::persist::{FileStore, PersistentStore};
use crate::report::ReportMode;
use crate::rules::TriggerTiming;
use crate::scheduler::parse_delay;
use crate::structure::DocumentStructureModel;

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

// ============ analyze ============

pub fn run_analyze(config: &Config, file: &Path, json: bool) -> Result<()> {
    let text = read_text(file)?;
    let mut model = DocumentStructureModel::with_word_tolerance(config.structure.word_position_tolerance);
    let snapshot = model.analyze(&text);

    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    let stats = &snapshot.stats;
    println!("characters: {}", stats.characters);
    println!("words:      {}", stats.words);
    println!("sentences:  {}", stats.sentences);
    println!("paragraphs: {}", stats.paragraphs);
    println!(
        "avg words/sentence: {:.1}  avg sentences/paragraph: {:.1}",
        stats.avg_words_per_sentence, stats.avg_sentences_per_paragraph
    );
    for (i, paragraph) in snapshot.paragraphs.iter().enumerate() {
        println!();
        println!(
            "¶{}  [{}..{})  {} words",
            i + 1,
            paragraph.position.start,
            paragraph.position.end,
            paragraph.word_count
        );
        for id in &paragraph.sentence_ids {
            if let Some(sentence) = snapshot.sentence(id) {
                println!("  {}  {}", sentence.content_hash, sentence.content);
            }
        }
    }
    Ok(())
}

// ============ rules ============

pub fn list_rules(config: &Config) -> Result<()> {
    if config.rules.is_empty() {
        println!("No rules configured.");
        return Ok(());
    }

    println!(
        "{:<16} {:<10} {:<10} {:<8} NAME",
        "RULE", "TRIGGER", "DELAY", "ENABLED"
    );
    for rule in &config.rules {
        let delay = match rule.trigger {
            TriggerTiming::Word | TriggerTiming::Sentence => {
                format!("{}ms", config.scheduler.trigger_batch_ms)
            }
            TriggerTiming::Custom => {
                let d = rule
                    .delay
                    .as_deref()
                    .and_then(parse_delay)
                    .unwrap_or_else(|| config.scheduler.default_custom());
                format!("{}ms", d.as_millis())
            }
            TriggerTiming::Manual => "-".to_string(),
        };
        println!(
            "{:<16} {:<10} {:<10} {:<8} {}",
            rule.id, rule.trigger, delay, rule.enabled, rule.name
        );
    }
    Ok(())
}

// ============ run ============

/// One batch over every enabled rule, or a single rule with `--rule`.
/// Rule failures are printed, not returned: they are per-rule artifacts.
pub async fn run_rules(config: &Config, file: &Path, rule: Option<&str>) -> Result<()> {
    let text = read_text(file)?;
    if let Some(id) = rule {
        if config.rule(id).is_none() {
            bail!("Unknown rule: '{}'", id);
        }
    } else if config.enabled_rules().next().is_none() {
        println!("No enabled rules.");
        return Ok(());
    }

    let client = create_client(&config.generation)?;
    let engine = FeedbackEngine::new(config.clone(), client);
    let store = FileStore::new(&config.store.dir);
    if let Err(e) = engine.load_associations(&store) {
        warn!("could not load saved associations: {:#}", e);
    }
    engine.load_text(&text);

    let mut rx = engine.subscribe();
    match rule {
        Some(id) => {
            engine.run_rule_now(id);
        }
        None => {
            engine.request_batch();
        }
    }

    let (mut ok, mut failed) = (0usize, 0usize);
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        };
        match event {
            EngineEvent::FeedbackReady {
                rule_id,
                content_id,
                payload,
                ..
            } => {
                ok += 1;
                println!("✓ {}  ({})", rule_id, content_id);
                for line in payload.lines() {
                    println!("    {}", line);
                }
                if rule.is_some() {
                    break;
                }
            }
            EngineEvent::RuleFailed { error } => {
                failed += 1;
                println!("✗ {}", error);
                if rule.is_some() {
                    break;
                }
            }
            EngineEvent::BatchSettled(_) if rule.is_none() => break,
            _ => {}
        }
    }

    println!();
    println!("{} succeeded, {} failed", ok, failed);
    engine.save_associations(&store)?;
    Ok(())
}

// ============ watch ============

/// Poll `file` and feed every change into the engine until Ctrl-C.
pub async fn run_watch(config: &Config, file: &Path, poll_ms: u64, mode: ReportMode) -> Result<()> {
    let client = create_client(&config.generation)?;
    let engine = FeedbackEngine::new(config.clone(), client);
    let store = FileStore::new(&config.store.dir);
    if let Some(n) = engine.load_associations(&store).unwrap_or_else(|e| {
        warn!("could not load saved associations: {:#}", e);
        None
    }) {
        eprintln!("Loaded {} saved associations.", n);
    }

    let reporter = mode.reporter();
    let mut rx = engine.subscribe();
    let mut last = read_text(file)?;
    engine.load_text(&last);
    eprintln!("Watching {} (Ctrl-C to stop)", file.display());

    let mut interval = tokio::time::interval(Duration::from_millis(poll_ms.max(10)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = interval.tick() => {
                match std::fs::read_to_string(file) {
                    Ok(text) if text != last => {
                        engine.on_text_changed(&text);
                        last = text;
                    }
                    Ok(_) => {}
                    Err(e) => warn!("failed to read {}: {}", file.display(), e),
                }
            }
            event = rx.recv() => match event {
                Ok(event) => reporter.report(&event),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "reporter lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.save_associations(&store)?;
    eprintln!(
        "Saved {} associations to {}",
        engine.export_associations().content_associations.len(),
        store.dir().display()
    );
    Ok(())
}

// ============ associations ============

pub fn show_associations(config: &Config) -> Result<()> {
    let store = FileStore::new(&config.store.dir);
    let mut table = FeedbackAssociationStore::default();
    if table.load_from(&store, &config.store.key)?.is_none() {
        println!("No saved associations.");
        return Ok(());
    }
    if table.is_empty() {
        println!("No associations.");
        return Ok(());
    }

    for association in table.associations() {
        println!(
            "{}  {}  [{}..{})  {:?}",
            association.content_id,
            association.kind,
            association.position.start,
            association.position.end,
            association.content
        );
        for entry in association.visible_entries() {
            println!(
                "    {}  {}  {}",
                entry.feedback_id,
                entry.rule_name,
                entry.payload.lines().next().unwrap_or("")
            );
        }
    }
    Ok(())
}

pub fn clear_associations(config: &Config) -> Result<()> {
    let store = FileStore::new(&config.store.dir);
    if store.get(&config.store.key)?.is_none() {
        println!("No saved associations.");
        return Ok(());
    }
    FeedbackAssociationStore::default().save_to(&store, &config.store.key)?;
    println!("Associations cleared.");
    Ok(())
}
