//! Binding generated feedback to the content that produced it.
//!
//! A [`ContentAssociation`] pins a word, sentence or paragraph (by content
//! and approximate position) and accumulates [`FeedbackEntry`]s over time.
//! Entries are never physically deleted: removal only hides them, and an
//! association disappears as soon as it has no visible entries left.
//!
//! # Survival rules
//!
//! [`validate_and_cleanup`](FeedbackAssociationStore::validate_and_cleanup)
//! re-tests every association against the current text:
//!
//! | Kind | Survives when |
//! |------|---------------|
//! | Word | the exact word still occurs as a whole word (case-sensitive) |
//! | Sentence | at least `sentence_threshold` (0.7) of its words still occur |
//! | Paragraph | at least `paragraph_threshold` (0.6) of its words still occur |
//!
//! Token presence for sentences and paragraphs is case-insensitive.
//!
//! # Events
//!
//! Listeners registered with [`subscribe`](FeedbackAssociationStore::subscribe)
//! receive every [`StoreEvent`]. A listener that errors or panics is logged
//! and skipped; the remaining listeners still run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::HarnessError;
use crate::models::{ContentKind, Span};
use crate::persist::PersistentStore;
use crate::structure::split_words;

/// Associations within this many characters of each other hash alike.
const POSITION_BUCKET: usize = 50;

pub const DEFAULT_SENTENCE_THRESHOLD: f64 = 0.7;
pub const DEFAULT_PARAGRAPH_THRESHOLD: f64 = 0.6;

/// One piece of generated feedback attached to an association.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEntry {
    pub feedback_id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
    pub visible: bool,
}

/// A content span and the feedback it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentAssociation {
    pub content_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: ContentKind,
    pub position: Span,
    pub content_hash: String,
    pub feedback_entries: Vec<FeedbackEntry>,
    pub timestamp: DateTime<Utc>,
}

impl ContentAssociation {
    pub fn visible_entries(&self) -> impl Iterator<Item = &FeedbackEntry> {
        self.feedback_entries.iter().filter(|e| e.visible)
    }

    fn has_visible(&self) -> bool {
        self.feedback_entries.iter().any(|e| e.visible)
    }
}

/// Serialized form of the whole table, as produced by
/// [`export`](FeedbackAssociationStore::export).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociationExport {
    pub content_associations: BTreeMap<String, ContentAssociation>,
    pub feedback_to_content: BTreeMap<String, String>,
    pub next_content_id: u64,
    pub next_feedback_id: u64,
    pub timestamp: DateTime<Utc>,
}

/// Change notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    FeedbackAdded {
        content_id: String,
        entry: FeedbackEntry,
    },
    FeedbackRemoved {
        content_id: String,
        feedback_id: String,
    },
    ContentRemoved {
        content_id: String,
        removed: Vec<FeedbackEntry>,
    },
    Cleanup {
        content_ids: Vec<String>,
        removed: Vec<FeedbackEntry>,
    },
    Reset,
    Imported {
        associations: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type StoreListener = Box<dyn Fn(&StoreEvent) -> Result<()> + Send + Sync>;

/// Survival thresholds used by `validate_and_cleanup`.
#[derive(Debug, Clone, Copy)]
pub struct ValidationThresholds {
    pub sentence: f64,
    pub paragraph: f64,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            sentence: DEFAULT_SENTENCE_THRESHOLD,
            paragraph: DEFAULT_PARAGRAPH_THRESHOLD,
        }
    }
}

pub struct FeedbackAssociationStore {
    associations: BTreeMap<String, ContentAssociation>,
    hash_index: HashMap<String, String>,
    feedback_to_content: BTreeMap<String, String>,
    next_content_id: u64,
    next_feedback_id: u64,
    thresholds: ValidationThresholds,
    listeners: Vec<(SubscriptionId, StoreListener)>,
    next_listener: u64,
}

impl Default for FeedbackAssociationStore {
    fn default() -> Self {
        Self::new(ValidationThresholds::default())
    }
}

impl FeedbackAssociationStore {
    pub fn new(thresholds: ValidationThresholds) -> Self {
        Self {
            associations: BTreeMap::new(),
            hash_index: HashMap::new(),
            feedback_to_content: BTreeMap::new(),
            next_content_id: 1,
            next_feedback_id: 1,
            thresholds,
            listeners: Vec::new(),
            next_listener: 0,
        }
    }

    // ───────────────────────── subscriptions ─────────────────────────

    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: Fn(&StoreEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.next_listener += 1;
        let id = SubscriptionId(self.next_listener);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        before != self.listeners.len()
    }

    fn emit(&self, event: StoreEvent) {
        for (id, listener) in &self.listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(subscriber = id.0, "association listener failed: {:#}", e),
                Err(_) => warn!(subscriber = id.0, "association listener panicked"),
            }
        }
    }

    // ───────────────────────── mutation ─────────────────────────

    /// Bind `content` to an association, reusing an existing one with the
    /// same kind, content and approximate position.
    ///
    /// When `position` is `None` the last occurrence of `content` in
    /// `full_text` is used.
    pub fn associate_content(
        &mut self,
        content: &str,
        kind: ContentKind,
        position: Option<Span>,
        full_text: &str,
    ) -> String {
        let position = position.unwrap_or_else(|| locate(content, full_text));
        let hash = association_hash(kind, content, position);
        let now = Utc::now();

        if let Some(existing) = self
            .hash_index
            .get(&hash)
            .and_then(|id| self.associations.get_mut(id))
        {
            existing.timestamp = now;
            existing.position = position;
            return existing.content_id.clone();
        }

        let content_id = format!("content_{}", self.next_content_id);
        self.next_content_id += 1;
        self.hash_index.insert(hash.clone(), content_id.clone());
        self.associations.insert(
            content_id.clone(),
            ContentAssociation {
                content_id: content_id.clone(),
                content: content.to_string(),
                kind,
                position,
                content_hash: hash,
                feedback_entries: Vec::new(),
                timestamp: now,
            },
        );
        content_id
    }

    /// Append a visible feedback entry. Returns `None` for an unknown
    /// `content_id`.
    pub fn associate_feedback(
        &mut self,
        content_id: &str,
        payload: &str,
        rule_id: &str,
        rule_name: &str,
    ) -> Option<String> {
        let Some(association) = self.associations.get_mut(content_id) else {
            warn!("{}", HarnessError::lookup("content", content_id));
            return None;
        };

        let feedback_id = format!("feedback_{}", self.next_feedback_id);
        self.next_feedback_id += 1;
        let entry = FeedbackEntry {
            feedback_id: feedback_id.clone(),
            rule_id: rule_id.to_string(),
            rule_name: rule_name.to_string(),
            payload: payload.to_string(),
            timestamp: Utc::now(),
            visible: true,
        };
        association.feedback_entries.push(entry.clone());
        association.timestamp = entry.timestamp;
        self.feedback_to_content
            .insert(feedback_id.clone(), content_id.to_string());

        self.emit(StoreEvent::FeedbackAdded {
            content_id: content_id.to_string(),
            entry,
        });
        Some(feedback_id)
    }

    /// Hide a feedback entry. Removes its association if that leaves it
    /// with no visible entries. Returns false for unknown or already
    /// hidden entries.
    pub fn remove_feedback(&mut self, feedback_id: &str) -> bool {
        let Some(content_id) = self.feedback_to_content.get(feedback_id).cloned() else {
            warn!("{}", HarnessError::lookup("feedback", feedback_id));
            return false;
        };
        let Some(association) = self.associations.get_mut(&content_id) else {
            warn!("{}", HarnessError::lookup("content", &content_id));
            return false;
        };
        let Some(entry) = association
            .feedback_entries
            .iter_mut()
            .find(|e| e.feedback_id == feedback_id && e.visible)
        else {
            return false;
        };
        entry.visible = false;
        let emptied = !association.has_visible();

        self.emit(StoreEvent::FeedbackRemoved {
            content_id: content_id.clone(),
            feedback_id: feedback_id.to_string(),
        });
        if emptied {
            let removed = self.detach(&content_id);
            self.emit(StoreEvent::ContentRemoved {
                content_id,
                removed,
            });
        }
        true
    }

    /// Hide every visible entry from `rule_id` on `content_id` except
    /// `keep`. Used when a rule re-analyzes the same content.
    pub fn supersede_rule_feedback(
        &mut self,
        content_id: &str,
        rule_id: &str,
        keep: &str,
    ) -> Vec<String> {
        let stale: Vec<String> = self
            .associations
            .get(content_id)
            .map(|a| {
                a.visible_entries()
                    .filter(|e| e.rule_id == rule_id && e.feedback_id != keep)
                    .map(|e| e.feedback_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        for id in &stale {
            self.remove_feedback(id);
        }
        stale
    }

    /// Remove an association and all of its entries.
    pub fn remove_content(&mut self, content_id: &str) -> bool {
        if !self.associations.contains_key(content_id) {
            warn!("{}", HarnessError::lookup("content", content_id));
            return false;
        }
        let removed = self.detach(content_id);
        self.emit(StoreEvent::ContentRemoved {
            content_id: content_id.to_string(),
            removed,
        });
        true
    }

    /// Drop `content_id` from every index, returning its visible entries.
    fn detach(&mut self, content_id: &str) -> Vec<FeedbackEntry> {
        let Some(association) = self.associations.remove(content_id) else {
            return Vec::new();
        };
        self.hash_index.remove(&association.content_hash);
        for entry in &association.feedback_entries {
            self.feedback_to_content.remove(&entry.feedback_id);
        }
        association
            .feedback_entries
            .into_iter()
            .filter(|e| e.visible)
            .collect()
    }

    /// Remove every association whose content no longer survives in
    /// `current_text`, returning the visible entries that went with them.
    pub fn validate_and_cleanup(&mut self, current_text: &str) -> Vec<FeedbackEntry> {
        let text_tokens: HashSet<String> = split_words(current_text)
            .into_iter()
            .map(|(_, w)| w.to_lowercase())
            .collect();

        let failing: Vec<String> = self
            .associations
            .values()
            .filter(|a| !self.survives(a, current_text, &text_tokens))
            .map(|a| a.content_id.clone())
            .collect();

        if failing.is_empty() {
            return Vec::new();
        }

        let mut removed = Vec::new();
        for content_id in &failing {
            removed.extend(self.detach(content_id));
        }
        debug!(
            associations = failing.len(),
            entries = removed.len(),
            "association cleanup"
        );
        self.emit(StoreEvent::Cleanup {
            content_ids: failing,
            removed: removed.clone(),
        });
        removed
    }

    fn survives(
        &self,
        association: &ContentAssociation,
        text: &str,
        text_tokens: &HashSet<String>,
    ) -> bool {
        let threshold = match association.kind {
            ContentKind::Word => return contains_whole_word(text, &association.content),
            ContentKind::Sentence => self.thresholds.sentence,
            ContentKind::Paragraph => self.thresholds.paragraph,
        };
        let tokens = split_words(&association.content);
        if tokens.is_empty() {
            return text.contains(association.content.as_str());
        }
        let present = tokens
            .iter()
            .filter(|(_, t)| text_tokens.contains(&t.to_lowercase()))
            .count();
        present as f64 / tokens.len() as f64 >= threshold
    }

    /// Clear the table and id counters. Listeners stay subscribed.
    pub fn reset(&mut self) {
        self.associations.clear();
        self.hash_index.clear();
        self.feedback_to_content.clear();
        self.next_content_id = 1;
        self.next_feedback_id = 1;
        self.emit(StoreEvent::Reset);
    }

    // ───────────────────────── queries ─────────────────────────

    /// Visible entries for `content_id`; empty (with a warning) if unknown.
    pub fn get_feedback_for_content(&self, content_id: &str) -> Vec<FeedbackEntry> {
        match self.associations.get(content_id) {
            Some(a) => a.visible_entries().cloned().collect(),
            None => {
                warn!("{}", HarnessError::lookup("content", content_id));
                Vec::new()
            }
        }
    }

    pub fn association(&self, content_id: &str) -> Option<&ContentAssociation> {
        self.associations.get(content_id)
    }

    pub fn associations(&self) -> impl Iterator<Item = &ContentAssociation> {
        self.associations.values()
    }

    /// Every visible entry, paired with its content id.
    pub fn current_feedback(&self) -> Vec<(String, FeedbackEntry)> {
        self.associations
            .values()
            .flat_map(|a| {
                a.visible_entries()
                    .map(move |e| (a.content_id.clone(), e.clone()))
            })
            .collect()
    }

    pub fn content_for_feedback(&self, feedback_id: &str) -> Option<&str> {
        self.feedback_to_content.get(feedback_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.associations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.associations.is_empty()
    }

    // ───────────────────────── export / import ─────────────────────────

    /// Snapshot of the table. Associations that never received feedback
    /// are left out, since an import only accepts ones with visible entries.
    pub fn export(&self) -> AssociationExport {
        let content_associations: BTreeMap<String, ContentAssociation> = self
            .associations
            .iter()
            .filter(|(_, a)| a.has_visible())
            .map(|(id, a)| (id.clone(), a.clone()))
            .collect();
        let feedback_to_content = self
            .feedback_to_content
            .iter()
            .filter(|(_, content_id)| content_associations.contains_key(*content_id))
            .map(|(f, c)| (f.clone(), c.clone()))
            .collect();
        AssociationExport {
            content_associations,
            feedback_to_content,
            next_content_id: self.next_content_id,
            next_feedback_id: self.next_feedback_id,
            timestamp: Utc::now(),
        }
    }

    /// Replace the table with `data`. On any inconsistency the store is
    /// reset to empty and a validation error is returned.
    pub fn import(&mut self, data: AssociationExport) -> Result<usize, HarnessError> {
        if let Err(e) = validate_export(&data) {
            warn!("association import rejected: {}", e);
            self.reset();
            return Err(e);
        }

        self.hash_index = data
            .content_associations
            .values()
            .map(|a| (a.content_hash.clone(), a.content_id.clone()))
            .collect();
        self.associations = data.content_associations;
        self.feedback_to_content = data.feedback_to_content;
        self.next_content_id = data.next_content_id;
        self.next_feedback_id = data.next_feedback_id;

        let count = self.associations.len();
        self.emit(StoreEvent::Imported {
            associations: count,
        });
        Ok(count)
    }

    /// Parse and import a JSON blob produced by [`export`](Self::export).
    pub fn import_json(&mut self, blob: &str) -> Result<usize, HarnessError> {
        match serde_json::from_str::<AssociationExport>(blob) {
            Ok(data) => self.import(data),
            Err(e) => {
                warn!("association import rejected: {}", e);
                self.reset();
                Err(HarnessError::Validation(e.to_string()))
            }
        }
    }

    pub fn save_to(&self, store: &dyn PersistentStore, key: &str) -> Result<()> {
        let blob = serde_json::to_string_pretty(&self.export())?;
        store.set(key, &blob)
    }

    /// Load a previously saved table. `Ok(None)` if nothing was stored.
    pub fn load_from(&mut self, store: &dyn PersistentStore, key: &str) -> Result<Option<usize>> {
        match store.get(key)? {
            Some(blob) => Ok(Some(self.import_json(&blob)?)),
            None => Ok(None),
        }
    }
}

fn association_hash(kind: ContentKind, content: &str, position: Span) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    hasher.update([0u8]);
    hasher.update((position.start / POSITION_BUCKET).to_le_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

/// Char span of the last occurrence of `content` in `text`, or `[0, len)`.
fn locate(content: &str, text: &str) -> Span {
    let len = content.chars().count();
    match text.rfind(content) {
        Some(byte) => {
            let start = text[..byte].chars().count();
            Span::new(start, start + len)
        }
        None => Span::new(0, len),
    }
}

fn contains_whole_word(text: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    match Regex::new(&format!(r"\b{}\b", regex::escape(word))) {
        Ok(re) => re.is_match(text),
        Err(_) => text.contains(word),
    }
}

fn id_suffix(id: &str, prefix: &str) -> Option<u64> {
    id.strip_prefix(prefix)?.parse().ok()
}

fn validate_export(data: &AssociationExport) -> Result<(), HarnessError> {
    let invalid = |msg: String| Err(HarnessError::Validation(msg));
    let mut hashes = HashSet::new();
    let mut feedback_ids = HashSet::new();

    for (key, association) in &data.content_associations {
        if key != &association.content_id {
            return invalid(format!(
                "association key '{}' does not match content id '{}'",
                key, association.content_id
            ));
        }
        match id_suffix(key, "content_") {
            Some(n) if n < data.next_content_id => {}
            _ => return invalid(format!("content id '{}' is out of range", key)),
        }
        if !hashes.insert(association.content_hash.as_str()) {
            return invalid(format!(
                "content hash '{}' appears on more than one association",
                association.content_hash
            ));
        }
        if !association.has_visible() {
            return invalid(format!("association '{}' has no visible feedback", key));
        }
        for entry in &association.feedback_entries {
            match id_suffix(&entry.feedback_id, "feedback_") {
                Some(n) if n < data.next_feedback_id => {}
                _ => {
                    return invalid(format!(
                        "feedback id '{}' is out of range",
                        entry.feedback_id
                    ))
                }
            }
            if !feedback_ids.insert(entry.feedback_id.as_str()) {
                return invalid(format!("duplicate feedback id '{}'", entry.feedback_id));
            }
            if data.feedback_to_content.get(&entry.feedback_id) != Some(key) {
                return invalid(format!(
                    "feedback '{}' is not mapped to its content '{}'",
                    entry.feedback_id, key
                ));
            }
        }
    }

    // Every entry maps to its own association, so any extra mapping is dangling.
    if data.feedback_to_content.len() != feedback_ids.len() {
        if let Some((feedback_id, content_id)) = data
            .feedback_to_content
            .iter()
            .find(|(f, _)| !feedback_ids.contains(f.as_str()))
        {
            return invalid(format!(
                "feedback '{}' points at missing content '{}'",
                feedback_id, content_id
            ));
        }
    }
    Ok(())
}
