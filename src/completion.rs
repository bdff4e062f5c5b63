//! Word and sentence completion detection.
//!
//! [`CompletionDetector`] compares each full-text snapshot with the one
//! before it and reports when the writer has just finished a word or a
//! sentence. It is a punctuation heuristic, not a grammar-aware parser:
//! abbreviations (`"e.g. "`) and similar constructs can register as
//! sentence ends, and that behaviour is intentional.
//!
//! Each call to [`analyze`](CompletionDetector::analyze) emits at most one
//! word event and at most one sentence event, both returned to the caller
//! and delivered to any subscribed listeners.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::structure::{is_terminator, split_words};

/// Which unit a [`CompletionEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionKind {
    Word,
    Sentence,
}

/// A "the writer just finished X" notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionEvent {
    pub kind: CompletionKind,
    /// The word or sentence that was completed.
    pub completed_unit: String,
    /// Total words (for word events) or completed sentences (for sentence events).
    pub total_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Handle returned by the `on_*` subscription methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn Fn(&CompletionEvent) + Send + Sync>;

/// Stateful detector over successive full-text snapshots.
#[derive(Default)]
pub struct CompletionDetector {
    last_text: String,
    last_sentence_count: usize,
    last_reported_word: Option<String>,
    word_listeners: Vec<(ListenerId, Listener)>,
    sentence_listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
}

impl CompletionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_word_completion<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&CompletionEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.word_listeners.push((id, Box::new(listener)));
        id
    }

    pub fn on_sentence_completion<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&CompletionEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.sentence_listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener from either list. Returns false if it was unknown.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.word_listeners.len() + self.sentence_listeners.len();
        self.word_listeners.retain(|(lid, _)| *lid != id);
        self.sentence_listeners.retain(|(lid, _)| *lid != id);
        before != self.word_listeners.len() + self.sentence_listeners.len()
    }

    fn next_id(&mut self) -> ListenerId {
        self.next_listener += 1;
        ListenerId(self.next_listener)
    }

    /// Compare `text` against the previous call and report completions.
    pub fn analyze(&mut self, text: &str) -> Vec<CompletionEvent> {
        let now = Utc::now();
        let mut events = Vec::new();

        if let Some(event) = self.detect_word(text, now) {
            for (_, listener) in &self.word_listeners {
                listener(&event);
            }
            events.push(event);
        }

        let sentence_count = count_completed_sentences(text);
        if sentence_count > self.last_sentence_count && ends_with_terminator(text) {
            if let Some(sentence) = last_sentence_segment(text) {
                let event = CompletionEvent {
                    kind: CompletionKind::Sentence,
                    completed_unit: sentence,
                    total_count: sentence_count,
                    timestamp: now,
                };
                for (_, listener) in &self.sentence_listeners {
                    listener(&event);
                }
                events.push(event);
            }
        }

        self.last_sentence_count = sentence_count;
        self.last_text = text.to_string();
        events
    }

    fn detect_word(&mut self, text: &str, now: DateTime<Utc>) -> Option<CompletionEvent> {
        let ends_at_boundary = text.chars().last().is_some_and(is_boundary);
        if !ends_at_boundary {
            return None;
        }

        let prev_ended_in_word = self.last_text.chars().last().is_some_and(char::is_alphanumeric);
        let grew_by_more_than_one = text.chars().count() > self.last_text.chars().count() + 1;
        if !prev_ended_in_word && !grew_by_more_than_one {
            return None;
        }

        let words = split_words(text);
        let (_, last_word) = words.last()?;
        if self.last_reported_word.as_deref() == Some(*last_word) {
            return None;
        }
        self.last_reported_word = Some(last_word.to_string());

        Some(CompletionEvent {
            kind: CompletionKind::Word,
            completed_unit: last_word.to_string(),
            total_count: words.len(),
            timestamp: now,
        })
    }

    /// Forget the previous text; listeners stay subscribed.
    pub fn reset(&mut self) {
        self.last_text.clear();
        self.last_sentence_count = 0;
        self.last_reported_word = None;
    }
}

fn is_boundary(ch: char) -> bool {
    ch.is_whitespace() || ch.is_ascii_punctuation()
}

/// Terminator runs that are followed by whitespace or the end of text.
fn count_completed_sentences(text: &str) -> usize {
    let chars: Vec<char> = text.chars().collect();
    let mut count = 0;
    let mut i = 0;
    while i < chars.len() {
        if is_terminator(chars[i]) {
            let mut j = i;
            while j < chars.len() && is_terminator(chars[j]) {
                j += 1;
            }
            if j == chars.len() || chars[j].is_whitespace() {
                count += 1;
            }
            i = j;
        } else {
            i += 1;
        }
    }
    count
}

fn ends_with_terminator(text: &str) -> bool {
    text.trim_end().chars().last().is_some_and(is_terminator)
}

/// The last non-empty segment of `text` split on terminator runs.
fn last_sentence_segment(text: &str) -> Option<String> {
    text.split(is_terminator)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_string)
}
