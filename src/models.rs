//! Core data models used throughout Draft Harness.
//!
//! These types describe the structure of a text buffer (paragraphs,
//! sentences, words) as produced by the
//! [`DocumentStructureModel`](crate::structure::DocumentStructureModel),
//! plus the closed [`ContentKind`] used to tag feedback associations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Half-open character range `[start, end)` into the analyzed text.
///
/// Offsets count Unicode scalar values, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `self` lies entirely inside `[start, end]`.
    pub fn within(&self, start: usize, end: usize) -> bool {
        self.start >= start && self.end <= end
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// The granularity of a piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Word,
    Sentence,
    Paragraph,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Word => "word",
            ContentKind::Sentence => "sentence",
            ContentKind::Paragraph => "paragraph",
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// A maximal alphanumeric run inside a sentence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Word {
    pub id: String,
    pub content: String,
    pub content_hash: String,
    pub position: Span,
    pub sentence_id: String,
    pub is_new: bool,
    pub is_ai_generated: bool,
    pub last_modified: DateTime<Utc>,
}

/// A sentence candidate, terminated by punctuation or by the end of its paragraph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sentence {
    pub id: String,
    pub content: String,
    pub content_hash: String,
    pub position: Span,
    pub word_count: usize,
    pub word_ids: Vec<String>,
    pub paragraph_id: String,
    pub is_new: bool,
    pub is_ai_generated: bool,
    pub last_modified: DateTime<Utc>,
}

/// A run of text separated from its neighbours by blank lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Paragraph {
    pub id: String,
    pub content: String,
    pub content_hash: String,
    pub position: Span,
    pub word_count: usize,
    pub sentence_ids: Vec<String>,
    pub is_new: bool,
    pub is_ai_generated: bool,
    pub last_modified: DateTime<Utc>,
}

/// Aggregate counts over one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StructureStats {
    pub characters: usize,
    pub words: usize,
    pub sentences: usize,
    pub paragraphs: usize,
    pub new_sentences: usize,
    pub ai_generated_sentences: usize,
    pub avg_words_per_sentence: f64,
    pub avg_sentences_per_paragraph: f64,
}

/// The full structure of one text revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StructureSnapshot {
    pub paragraphs: Vec<Paragraph>,
    pub sentences: Vec<Sentence>,
    pub words: Vec<Word>,
    pub text_version: u64,
    pub stats: StructureStats,
}

impl StructureSnapshot {
    pub fn sentence(&self, id: &str) -> Option<&Sentence> {
        self.sentences.iter().find(|s| s.id == id)
    }

    pub fn paragraph(&self, id: &str) -> Option<&Paragraph> {
        self.paragraphs.iter().find(|p| p.id == id)
    }

    pub fn word(&self, id: &str) -> Option<&Word> {
        self.words.iter().find(|w| w.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_within_and_overlap() {
        let s = Span::new(5, 10);
        assert!(s.within(0, 10));
        assert!(s.within(5, 10));
        assert!(!s.within(6, 20));
        assert!(s.overlaps(&Span::new(9, 12)));
        assert!(!s.overlaps(&Span::new(10, 12)));
        assert_eq!(s.len(), 5);
    }

    #[test]
    fn test_content_kind_serializes_lowercase() {
        let json = serde_json::to_string(&ContentKind::Sentence).unwrap();
        assert_eq!(json, "\"sentence\"");
        let kind: ContentKind = serde_json::from_str("\"paragraph\"").unwrap();
        assert_eq!(kind, ContentKind::Paragraph);
    }
}
